use std::{ffi::OsStr, fmt, io, num::NonZeroI32, process};

use log::debug;

/// Thin wrapper around [`std::process::Command`] that keeps the command
/// line around for error reporting and logs every invocation at debug
/// level.
pub struct Command(process::Command);

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self(process::Command::new(program))
    }

    pub fn args<'a, I>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = &'a OsStr>,
    {
        self.0.args(args);
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.0.arg(arg);
        self
    }

    /// Sets an environment variable for the child only, leaving the
    /// current process environment untouched.
    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.0.env(key, value);
        self
    }

    /// Runs the command with inherited stdio, so the child's output
    /// streams straight to the user. Fails on spawn errors or a non-zero
    /// exit status.
    pub fn status(mut self) -> Result<(), Error> {
        debug!("running `{command:?}`", command = &self.0);

        match self.0.status() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error {
                command: format!("{:?}", self.0),
                kind: ErrorKind::NonZeroExitStatus(status.code().and_then(NonZeroI32::new)),
            }),
            Err(error) => Err(Error {
                command: format!("{:?}", self.0),
                kind: ErrorKind::from_io(error),
            }),
        }
    }

    /// Runs the command capturing stdout and stderr. Fails on spawn errors
    /// or a non-zero exit status; stderr is included in the error message.
    pub fn output(mut self) -> Result<process::Output, Error> {
        debug!("capturing `{command:?}`", command = &self.0);

        let output = match self.0.output() {
            Ok(output) => output,
            Err(error) => {
                return Err(Error {
                    command: format!("{:?}", self.0),
                    kind: ErrorKind::from_io(error),
                })
            }
        };

        if output.status.success() {
            Ok(output)
        } else {
            Err(Error {
                command: format!("{:?}", self.0),
                kind: ErrorKind::NonZeroExitStatusWithStderr(
                    output.status.code().and_then(NonZeroI32::new),
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ),
            })
        }
    }

    /// Like [`Command::output`] but succeeds regardless of the exit
    /// status, for callers that need to inspect failure output.
    pub fn try_output(mut self) -> Result<process::Output, Error> {
        debug!("capturing `{command:?}`", command = &self.0);

        self.0.output().map_err(|error| Error {
            command: format!("{:?}", self.0),
            kind: ErrorKind::from_io(error),
        })
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Io(io::Error),
    NonZeroExitStatus(Option<NonZeroI32>),
    NonZeroExitStatusWithStderr(Option<NonZeroI32>, String),
}

impl ErrorKind {
    fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Io(error),
        }
    }
}

#[derive(Debug)]
pub struct Error {
    pub command: String,
    pub kind: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to run `{command}`: ", command = &self.command)?;
        match &self.kind {
            ErrorKind::NotFound => {
                write!(f, "the command is not available on your system, please install it")
            }
            ErrorKind::PermissionDenied => {
                write!(f, "the command is available but is not executable")
            }
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::NonZeroExitStatus(code) => match code {
                Some(code) => write!(f, "exited with non-zero exit code `{code}`"),
                None => write!(f, "did not run successfully"),
            },
            ErrorKind::NonZeroExitStatusWithStderr(code, stderr) => {
                match code {
                    Some(code) => write!(f, "exited with non-zero exit code `{code}`")?,
                    None => write!(f, "did not run successfully")?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

/// Creates a new [`Command`] and supplies the provided arguments, if any,
/// while calling [`std::convert::AsRef::as_ref`] on each.
macro_rules! command {
    ($program:expr $(,)?) => {
        $crate::process::Command::new($program)
    };
    ($program:expr, $($arg:expr),+ $(,)?) => {
        $crate::process::args!($crate::process::Command::new($program), $($arg),+)
    };
}

/// Calls [`Command::args`] on the provided [`Command`] while calling
/// [`std::convert::AsRef::as_ref`] on each argument.
macro_rules! args {
    ($command:expr, $($arg:expr),+ $(,)?) => {
        $command.args([
            $(($arg).as_ref(),)+
        ])
    }
}

pub(crate) use args;
pub(crate) use command;

use log::debug;

use crate::process;

/// Asks the GitOps reconciler to refresh the HelmRelease backing a
/// deployment. Best-effort: reconciliation failures only shorten the wait
/// for the next poll, so errors are logged and swallowed.
pub fn reconcile_helmrelease(component: &str, namespace: &str) {
    let result = process::command!(
        "flux",
        "reconcile",
        "helmrelease",
        component,
        "-n",
        namespace,
    )
    .try_output();

    if let Err(error) = result {
        debug!("flux reconcile {component} failed: {error}");
    }
}

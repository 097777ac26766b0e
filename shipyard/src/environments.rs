//! Resolution of environment names (`dev`, `pp`, `prod`) to the image
//! repositories configured for them.

use std::env;

fn repository_variable(environment: &str) -> Option<&'static str> {
    match environment {
        "dev" => Some("SHIPYARD_IMAGE_REPOSITORY"),
        "pp" => Some("SHIPYARD_IMAGE_PP_REPOSITORY"),
        "prod" => Some("SHIPYARD_IMAGE_PROD_REPOSITORY"),
        _ => None,
    }
}

fn non_empty(value: Result<String, env::VarError>) -> Option<String> {
    value.ok().filter(|value| !value.is_empty())
}

fn repository_for(environment: &str) -> Option<String> {
    repository_variable(environment).and_then(|key| non_empty(env::var(key)))
}

/// Source and destination repositories for `promote-image`. Falls back to
/// `PROMOTE_SOURCE_REPOSITORY` / `PROMOTE_DESTINATION_REPOSITORY` when the
/// per-environment variables are unset.
pub fn promote_repositories(
    source_environment: &str,
    destination_environment: &str,
) -> (Option<String>, Option<String>) {
    let source = repository_for(source_environment)
        .or_else(|| non_empty(env::var("PROMOTE_SOURCE_REPOSITORY")));
    let destination = repository_for(destination_environment)
        .or_else(|| non_empty(env::var("PROMOTE_DESTINATION_REPOSITORY")));
    (source, destination)
}

/// Destination repository for `watch-deployment`, with the
/// `WATCH_DESTINATION_REPOSITORY` fallback.
pub fn watch_destination_repository(environment: &str) -> Option<String> {
    repository_for(environment).or_else(|| non_empty(env::var("WATCH_DESTINATION_REPOSITORY")))
}

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Env files tried in order: `$ENV_FILE`, `.envfile`, `.env`.
fn env_file_candidates() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = env_string("ENV_FILE")
        .map(PathBuf::from)
        .into_iter()
        .collect();
    candidates.push(PathBuf::from(".envfile"));
    candidates.push(PathBuf::from(".env"));
    candidates
}

/// Load the first candidate that exists and parses. Variables already set in
/// the process are not overwritten.
pub fn load_first_env_file(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|path| path.is_file() && dotenvy::from_path(path).is_ok())
        .cloned()
}

/// Load the env file, then install the `RUST_LOG`-driven subscriber.
pub fn init_tracing() {
    // RUST_LOG may come from the env file, so load it first
    let loaded = load_first_env_file(&env_file_candidates());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keyrelay::dispatch=info"));
    let _ = fmt().with_env_filter(filter).try_init();

    match loaded {
        Some(path) => tracing::info!(path = %path.display(), "environment file loaded"),
        None => tracing::debug!("no environment file found"),
    }
}

/// `1|true|yes|on` (case-insensitive) is true; unset falls back to `default`.
pub fn env_truthy(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        }
        Err(_) => default,
    }
}

/// Parsed env var, or `default` when unset or unparsable.
pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Non-empty env var.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Get the bind address for the HTTP server from env or default to 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    env_string("KEYRELAY_BIND_ADDR")
        .or_else(|| env_string("BIND_ADDR"))
        .unwrap_or_else(|| "0.0.0.0:8088".into())
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(status).json(body)
}

/// Same as [`error_response`] with a machine-readable `type`.
pub fn typed_error_response(status: StatusCode, error_type: &str, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg, "type": error_type } });
    HttpResponse::build(status).json(body)
}

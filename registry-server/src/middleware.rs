//! Middleware: API-key authentication and request logging

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RegistryConfig;
use crate::error::ApiError;

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    pub config: Arc<RegistryConfig>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &"Arc<RegistryConfig>")
            .finish()
    }
}

/// API-key authentication. Public paths pass through; everything else must
/// present the key in the configured header or query parameter.
pub async fn api_key_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let security = &auth.config.security;
    if !security.enabled {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    if is_public_path(&path, &security.public_paths) {
        return Ok(next.run(request).await);
    }

    let presented = header_key(&request, &security.header_name)
        .or_else(|| query_key(&request, &security.query_param_name));

    match presented {
        Some(key) if key == security.api_key => Ok(next.run(request).await),
        _ => {
            let remote = client_address(&request);
            warn!(path = %path, remote_address = %remote, "request rejected: missing or invalid API key");
            let hint = format!(
                "provide the API key in the `{}` header or the `{}` query parameter",
                security.header_name, security.query_param_name
            );
            Err(ApiError::unauthorized(&path, &hint, &remote).into_response())
        }
    }
}

/// Request logging with method, status, and latency
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let remote = client_address(&request);

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();
    info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = duration.as_millis(),
        remote_address = %remote,
        "request processed"
    );

    #[cfg(feature = "monitoring")]
    crate::metrics::record_request(method.as_str(), uri.path(), status.as_u16(), duration);

    response
}

/// A path is public when it equals or extends a configured public prefix
fn is_public_path(path: &str, public_paths: &[String]) -> bool {
    public_paths.iter().any(|public| {
        path == public
            || (path.starts_with(public) && path.as_bytes().get(public.len()) == Some(&b'/'))
    })
}

fn header_key(request: &Request, header_name: &str) -> Option<String> {
    request
        .headers()
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn query_key(request: &Request, param_name: &str) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == param_name).then(|| value.to_string())
    })
}

/// Best-effort peer address: forwarded headers first, then the unknown
/// fallback (the listener does not expose the socket address here)
pub fn client_address(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("X-Forwarded-For") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    if let Some(real_ip) = request.headers().get("X-Real-IP") {
        if let Ok(value) = real_ip.to_str() {
            return value.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_path_matching_is_prefix_aware() {
        let public = vec!["/actuator/health".to_string(), "/management/info".to_string()];
        assert!(is_public_path("/actuator/health", &public));
        assert!(is_public_path("/actuator/health/liveness", &public));
        assert!(!is_public_path("/actuator/healthz", &public));
        assert!(!is_public_path("/api/v1/registry/services", &public));
    }
}

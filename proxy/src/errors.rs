use control::claims::AuthError;
use control::rate_limit::Tier;
use control::store::StoreError;
use http::HeaderValue;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde_json::{Value, json};
use shared::http::full_body;
use thiserror::Error;

/// Everything that can stop a request between the listener and the
/// upstream. Each variant maps to exactly one status code and one stable
/// machine-readable error body.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("rate limit exceeded on {} tier", .tier.as_str())]
    RateLimited { tier: Tier },

    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },

    #[error("no healthy instance for service {service}")]
    NoHealthyInstance { service: String },

    #[error("upstream call timed out for service {service}")]
    UpstreamTimeout { service: String },

    #[error("upstream call failed for service {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("no route matched the request path")]
    NoRouteMatched,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } | GatewayError::NoHealthyInstance { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::NoRouteMatched => StatusCode::NOT_FOUND,
            GatewayError::Store(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON body returned to the client. Upstream failure details stay in
    /// the logs; clients only see the category.
    pub fn body(&self) -> Value {
        match self {
            GatewayError::Auth(err) => json!({
                "error": "unauthorized",
                "reason": err.reason(),
            }),
            GatewayError::RateLimited { tier } => json!({
                "error": "rate_limited",
                "tier": tier.as_str(),
            }),
            GatewayError::CircuitOpen { service } => json!({
                "error": "circuit_open",
                "service": service,
            }),
            GatewayError::NoHealthyInstance { service } => json!({
                "error": "no_healthy_instance",
                "service": service,
            }),
            GatewayError::UpstreamTimeout { service } => json!({
                "error": "upstream_timeout",
                "service": service,
            }),
            GatewayError::Upstream { service, .. } => json!({
                "error": "bad_gateway",
                "service": service,
            }),
            GatewayError::NoRouteMatched => json!({ "error": "no_route" }),
            GatewayError::Store(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                json!({ "error": "internal" })
            }
        }
    }
}

/// Render the error as the client-facing JSON response.
pub fn error_response<E>(err: &GatewayError) -> Response<BoxBody<Bytes, E>> {
    let body = serde_json::to_vec(&err.body()).unwrap_or_default();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Auth(AuthError::Expired).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::RateLimited { tier: Tier::User }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CircuitOpen {
                service: "api".to_string()
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                service: "api".to_string()
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::NoRouteMatched.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upstream_details_not_leaked() {
        let err = GatewayError::Upstream {
            service: "api".to_string(),
            message: "connection refused (10.0.0.1:8080)".to_string(),
        };
        let body = serde_json::to_string(&err.body()).unwrap();
        assert!(body.contains("bad_gateway"));
        assert!(!body.contains("10.0.0.1"));
    }

    #[test]
    fn test_error_response_shape() {
        let response =
            error_response::<std::convert::Infallible>(&GatewayError::Auth(AuthError::Expired));
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}

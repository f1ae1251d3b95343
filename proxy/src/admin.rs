use crate::config::validate_limits;
use crate::errors::GatewayError;
use crate::metrics_defs::SETTINGS_RELOADS;
use crate::settings::{LimitSettings, SharedSettings};
use control::circuit::CircuitBreaker;
use control::rate_limit::RateLimiter;
use http::HeaderValue;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use registry::ServiceRegistry;
use serde_json::{Value, json};
use shared::counter;
use shared::http::{full_body, make_boxed_error_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub struct AdminState {
    pub registry: ServiceRegistry,
    pub settings: SharedSettings,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Option<PrometheusHandle>,
}

/// Admin listener: liveness, readiness, operational stats, settings
/// reload and the Prometheus scrape endpoint. Never exposed on the
/// proxied listener.
#[derive(Clone)]
pub struct AdminService {
    state: Arc<AdminState>,
}

impl AdminService {
    pub fn new(state: AdminState) -> Self {
        AdminService {
            state: Arc::new(state),
        }
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
    ) -> Response<BoxBody<Bytes, GatewayError>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/health") => text_response(StatusCode::OK, "ok\n"),
            (&Method::GET, "/ready") => {
                if self.state.registry.is_ready() {
                    text_response(StatusCode::OK, "ok\n")
                } else {
                    make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE)
                }
            }
            (&Method::GET, "/stats") => self.stats().await,
            (&Method::POST, "/reload") => self.reload(req).await,
            (&Method::GET, "/metrics") => match &self.state.metrics {
                Some(handle) => text_response(StatusCode::OK, handle.render()),
                None => make_boxed_error_response(StatusCode::NOT_FOUND),
            },
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }

    async fn stats(&self) -> Response<BoxBody<Bytes, GatewayError>> {
        let generation = self.state.settings.current();

        let mut services = serde_json::Map::new();
        for (name, snapshot) in self.state.registry.snapshot() {
            let circuit = self
                .state
                .breaker
                .state(&name, &generation.limits.circuit)
                .await;
            services.insert(
                name,
                json!({
                    "circuit_state": circuit.as_str(),
                    "strategy": snapshot.strategy,
                    "instances": snapshot.instances,
                }),
            );
        }

        json_response(
            StatusCode::OK,
            &json!({
                "settings_version": generation.version,
                "rate_limit": self.state.limiter.stats(),
                "services": services,
            }),
        )
    }

    /// Parse and validate a new `limits` section; only a fully valid
    /// payload replaces the active generation.
    async fn reload<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, GatewayError>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return reload_rejected(&format!("failed to read body: {err}"));
            }
        };

        let limits: LimitSettings = match serde_yaml::from_slice(&body) {
            Ok(limits) => limits,
            Err(err) => return reload_rejected(&err.to_string()),
        };
        if let Err(err) = validate_limits(&limits) {
            return reload_rejected(&err.to_string());
        }

        let version = self.state.settings.swap(limits);
        tracing::info!(version, "limit settings reloaded");
        counter!(SETTINGS_RELOADS, "outcome" => "applied").increment(1);
        json_response(StatusCode::OK, &json!({ "version": version }))
    }
}

fn reload_rejected(message: &str) -> Response<BoxBody<Bytes, GatewayError>> {
    tracing::warn!(message, "settings reload rejected");
    counter!(SETTINGS_RELOADS, "outcome" => "rejected").increment(1);
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({
            "error": "invalid_settings",
            "message": message,
        }),
    )
}

fn text_response(
    status: StatusCode,
    body: impl Into<String>,
) -> Response<BoxBody<Bytes, GatewayError>> {
    let mut response = Response::new(full_body(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, value: &Value) -> Response<BoxBody<Bytes, GatewayError>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, GatewayError>>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

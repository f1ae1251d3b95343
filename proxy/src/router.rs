use crate::config::Route;
use crate::errors::{GatewayError, error_response};
use crate::forward::{UpstreamClient, send_to_upstream};
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::settings::{SharedSettings, VersionedSettings};
use control::circuit::CircuitBreaker;
use control::claims::{AuthError, Claims, ClaimsValidator};
use control::rate_limit::{Decision, RateLimiter};
use http::{HeaderMap, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use registry::{Selection, ServiceRegistry};
use shared::http::{PeerAddr, full_body};
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Everything the request pipeline needs, built once at startup.
pub struct RouterState {
    pub validator: ClaimsValidator,
    pub limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub registry: ServiceRegistry,
    pub settings: SharedSettings,
    pub client: UpstreamClient,
    pub routes: Vec<Route>,
    pub upstream_timeout: Duration,
}

/// The proxy listener's service: authenticate, rate-limit, circuit-check,
/// select an instance, forward, record the outcome.
#[derive(Clone)]
pub struct RouterService {
    state: Arc<RouterState>,
}

impl RouterService {
    pub fn new(mut state: RouterState) -> Self {
        // Longest prefix first, so a linear scan finds the best match.
        state
            .routes
            .sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        RouterService {
            state: Arc::new(state),
        }
    }

    fn resolve_route(&self, path: &str) -> Option<&str> {
        self.state
            .routes
            .iter()
            .find(|route| path.starts_with(&route.path_prefix))
            .map(|route| route.service.as_str())
    }

    pub async fn handle<B>(
        &self,
        req: Request<B>,
    ) -> Result<Response<BoxBody<Bytes, GatewayError>>, GatewayError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let state = &self.state;
        let peer = req.extensions().get::<PeerAddr>().copied();

        let service = self
            .resolve_route(req.uri().path())
            .ok_or(GatewayError::NoRouteMatched)?
            .to_string();

        // A request that fails authentication touches no counters and no
        // upstream state.
        let auth_header = match req.headers().get(http::header::AUTHORIZATION) {
            Some(value) => Some(value.to_str().map_err(|_| AuthError::MalformedHeader)?),
            None => None,
        };
        let claims = state.validator.validate_header(auth_header)?;

        // One settings generation per request, held for its whole lifetime.
        let generation = state.settings.current();

        let decision = state
            .limiter
            .check_request(
                &claims,
                req.method().as_str(),
                req.uri().path(),
                &generation.limits.rate,
            )
            .await;
        if let Decision::Denied { tier } = decision {
            return Err(GatewayError::RateLimited { tier });
        }

        state
            .breaker
            .allow(&service, &generation.limits.circuit)
            .await
            .map_err(|err| GatewayError::CircuitOpen {
                service: err.service,
            })?;

        let request_id = Uuid::new_v4().to_string();
        let prepared = self
            .prepare_upstream(req, &claims, peer, &service, &request_id)
            .await;
        let (upstream_request, selection) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                // Admitted but never sent: give back any half-open probe
                // slot instead of letting it lapse with the key TTL.
                state.breaker.release_probe(&service).await;
                return Err(err);
            }
        };
        let authority = selection.instance().authority();

        let guard = OutcomeGuard::new(state.breaker.clone(), service.clone(), generation);
        let result = send_to_upstream(
            &state.client,
            &service,
            &authority,
            upstream_request,
            state.upstream_timeout,
        )
        .await;
        drop(selection);

        match result {
            Ok(response) => {
                // 5xx from the upstream counts against the breaker; anything
                // it answered deliberately does not.
                let success = !response.status().is_server_error();
                guard.complete(success).await;
                tracing::debug!(
                    service,
                    request_id,
                    status = response.status().as_u16(),
                    "request forwarded"
                );
                Ok(response.map(full_body))
            }
            Err(err) => {
                guard.complete(false).await;
                Err(err)
            }
        }
    }

    /// Buffer the body, stamp identity and tracing headers, and pick an
    /// instance. Runs after the breaker admitted the call; any failure here
    /// means no upstream call is attempted.
    async fn prepare_upstream<B>(
        &self,
        req: Request<B>,
        claims: &Claims,
        peer: Option<PeerAddr>,
        service: &str,
        request_id: &str,
    ) -> Result<(Request<Full<Bytes>>, Selection), GatewayError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (mut parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|err| GatewayError::Internal(format!("failed to read request body: {err}")))?;

        insert_header(&mut parts.headers, "x-request-id", request_id)?;
        insert_header(&mut parts.headers, "x-org-id", &claims.org_id)?;
        insert_header(&mut parts.headers, "x-user-id", &claims.subject_id)?;
        if let Some(PeerAddr(addr)) = peer {
            if let Ok(value) = HeaderValue::from_str(&addr.ip().to_string()) {
                parts.headers.append("x-forwarded-for", value);
            }
        }

        let selection = self
            .state
            .registry
            .select(service, Some(&claims.subject_id))
            .map_err(|err| GatewayError::NoHealthyInstance {
                service: err.service,
            })?;

        Ok((Request::from_parts(parts, Full::new(body_bytes)), selection))
    }

    /// Metric label for the service the request resolves to.
    fn route_label(&self, path: &str) -> String {
        self.resolve_route(path).unwrap_or("unmatched").to_string()
    }
}

fn insert_header(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), GatewayError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| GatewayError::Internal(format!("invalid value for {name} header")))?;
    headers.insert(name, value);
    Ok(())
}

impl Service<Request<Incoming>> for RouterService {
    type Response = Response<BoxBody<Bytes, GatewayError>>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            gauge!(REQUESTS_INFLIGHT).increment(1.0);
            let started = Instant::now();
            let route = service.route_label(req.uri().path());

            let response = match service.handle(req).await {
                Ok(response) => response,
                Err(err) => {
                    let status = err.status();
                    if status.is_server_error() {
                        tracing::warn!(error = %err, status = status.as_u16(), "request failed");
                    } else {
                        tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
                    }
                    error_response(&err)
                }
            };

            histogram!(
                REQUEST_DURATION,
                "service" => route,
                "status" => response.status().as_u16().to_string()
            )
            .record(started.elapsed().as_secs_f64());
            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            Ok(response)
        })
    }
}

/// Ensures every admitted upstream call is recorded exactly once.
///
/// The happy paths call [`complete`](OutcomeGuard::complete); if the
/// request future is dropped mid-flight (client went away), the Drop impl
/// records the abandoned call as a failure.
struct OutcomeGuard {
    breaker: Arc<CircuitBreaker>,
    service: String,
    generation: Arc<VersionedSettings>,
    started: Instant,
    done: bool,
}

impl OutcomeGuard {
    fn new(
        breaker: Arc<CircuitBreaker>,
        service: String,
        generation: Arc<VersionedSettings>,
    ) -> Self {
        OutcomeGuard {
            breaker,
            service,
            generation,
            started: Instant::now(),
            done: false,
        }
    }

    async fn complete(mut self, success: bool) {
        self.done = true;
        self.breaker
            .record(
                &self.service,
                success,
                self.started.elapsed(),
                &self.generation.limits.circuit,
            )
            .await;
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let breaker = self.breaker.clone();
        let service = std::mem::take(&mut self.service);
        let generation = self.generation.clone();
        let latency = self.started.elapsed();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                breaker
                    .record(&service, false, latency, &generation.limits.circuit)
                    .await;
            });
        }
    }
}

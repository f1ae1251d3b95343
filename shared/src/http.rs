use http::{HeaderMap, HeaderValue, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Peer address of the client connection, stamped into request extensions
/// by [`run_http_service`] so services can build `X-Forwarded-For`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Wraps a shared service, inserting the connection's [`PeerAddr`] into
/// every request passing through it.
struct WithPeerAddr<S> {
    inner: Arc<S>,
    peer: SocketAddr,
}

impl<S, R> Service<Request<Incoming>> for WithPeerAddr<S>
where
    S: Service<Request<Incoming>, Response = R>,
{
    type Response = R;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        req.extensions_mut().insert(PeerAddr(self.peer));
        self.inner.call(req)
    }
}

pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = WithPeerAddr {
            inner: service_arc.clone(),
            peer: peer_addr,
        };

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await;
        });
    }
}

// Headers that are connection-scoped and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Strip hop-by-hop headers before forwarding, in either direction.
///
/// Headers nominated by the `Connection` header are removed first, then the
/// standard hop-by-hop set.
pub fn filter_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    for name in nominated {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Append a `Via` entry recording that the request passed through this
/// gateway.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let protocol = match version {
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "1.1",
    };
    let entry = format!("{protocol} membrane");
    if let Ok(value) = HeaderValue::from_str(&entry) {
        headers.append(http::header::VIA, value);
    }
}

/// Box a complete in-memory body, fixing the error type.
pub fn full_body<E>(data: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn make_boxed_error_response<E>(status: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let body = full_body(format!(
        "{}\n",
        status.canonical_reason().unwrap_or("error")
    ));
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

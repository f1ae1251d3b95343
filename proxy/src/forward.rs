use crate::errors::GatewayError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;

/// Pooled client shared by every request; request bodies are buffered
/// before forwarding, so the body type is fixed.
pub type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

pub fn build_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

/// Send a request to the selected upstream instance.
///
/// Handles the complete request/response cycle: rewriting the URI to the
/// instance's authority, filtering hop-by-hop headers in both directions,
/// adding Via entries, and collecting the response body. The deadline
/// covers the whole cycle including body collection, so this path is not
/// suitable for streaming responses.
pub async fn send_to_upstream(
    client: &UpstreamClient,
    service: &str,
    authority: &str,
    request: Request<Full<Bytes>>,
    deadline: Duration,
) -> Result<Response<Bytes>, GatewayError> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{authority}{path_and_query}")
        .parse()
        .map_err(|err| GatewayError::Internal(format!("bad upstream uri: {err}")))?;

    let (mut parts, body) = request.into_parts();
    filter_hop_by_hop(&mut parts.headers);
    add_via_header(&mut parts.headers, parts.version);
    parts.uri = uri;
    let upstream_request = Request::from_parts(parts, body);

    let exchange = async {
        let response =
            client
                .request(upstream_request)
                .await
                .map_err(|err| GatewayError::Upstream {
                    service: service.to_string(),
                    message: err.to_string(),
                })?;

        let (mut parts, body) = response.into_parts();
        filter_hop_by_hop(&mut parts.headers);
        add_via_header(&mut parts.headers, parts.version);

        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|err| GatewayError::Upstream {
                service: service.to_string(),
                message: format!("response body error: {err}"),
            })?;

        Ok(Response::from_parts(parts, body_bytes))
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| GatewayError::UpstreamTimeout {
            service: service.to_string(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::service_fn;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    // Echo server: returns the request body with the request headers copied
    // onto the response.
    async fn echo_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_else(|_| Bytes::new());

        let mut response = Response::new(Full::new(body_bytes));
        *response.headers_mut() = parts.headers;
        Ok(response)
    }

    async fn start_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(echo_handler))
                        .await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_forward_success() {
        let port = start_echo_server().await;
        let client = build_client();

        let request = Request::builder()
            .method("POST")
            .uri("/submit?kind=batch")
            .header("connection", "keep-alive")
            .header("x-custom", "kept")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();

        let response = send_to_upstream(
            &client,
            "api",
            &format!("127.0.0.1:{port}"),
            request,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"payload");
        // The echoed headers show what the upstream received.
        assert_eq!(response.headers().get("x-custom").unwrap(), "kept");
        assert!(response.headers().contains_key("via"));
        assert!(!response.headers().contains_key("connection"));
    }

    #[tokio::test]
    async fn test_forward_connection_refused() {
        // Bind then drop so the port is known-closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = build_client();
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let result = send_to_upstream(
            &client,
            "api",
            &format!("127.0.0.1:{port}"),
            request,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_forward_timeout() {
        // Listener that accepts connections but never responds, so the
        // deadline fires deterministically regardless of network topology.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _hold = stream;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                });
            }
        });

        let client = build_client();
        let request = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let result = send_to_upstream(
            &client,
            "api",
            &format!("127.0.0.1:{port}"),
            request,
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(GatewayError::UpstreamTimeout { .. })));
    }
}

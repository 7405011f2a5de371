use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use conn_limiter::RateLimiter;
use http::header::{
    HeaderValue, CONNECTION, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use upstream::{Connector, ConnectorConfig, UpstreamConnection};

use crate::admission::{AdmissionController, ConnectionAttempt};
use crate::origin::OriginAllowlist;
use crate::relay::{RelayConfig, RelaySession};

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the listening socket to.
    pub listen_addr: SocketAddr,
    /// Origins allowed to connect. Empty disables the check.
    pub origin_allowlist: Vec<String>,
    /// Tor proxy and dial deadline for upstream connections.
    pub connector: ConnectorConfig,
    /// Per-session relay tuning.
    pub relay: RelayConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            origin_allowlist: Vec::new(),
            connector: ConnectorConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// State shared by every connection handler.
struct Shared {
    admission: AdmissionController,
    connector: Connector,
    relay: RelayConfig,
}

/// The WebSocket-to-TCP gateway server.
///
/// Each upgrade request names its peer node in the path (`/host[:port]`).
/// The request is admitted, the peer is dialed, and only then is the
/// request upgraded; a relay session then runs until either side closes.
/// Rejections are answered with a plain HTTP status before any WebSocket
/// exists.
pub struct Gateway {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Gateway {
    /// Bind the listening socket. `limiter` is consulted once per upgrade
    /// request, keyed by client IP.
    pub async fn bind(config: GatewayConfig, limiter: Arc<dyn RateLimiter>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;

        let shared = Shared {
            admission: AdmissionController::new(
                OriginAllowlist::new(config.origin_allowlist),
                limiter,
            ),
            connector: Connector::new(config.connector),
            relay: config.relay,
        };

        Ok(Self {
            listener,
            shared: Arc::new(shared),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Each connection is handled in its own
    /// Tokio task; failures there never reach this loop.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!(
            %addr,
            origin_check = self.shared.admission.allowlist().is_enforced(),
            tor_proxy = %self.shared.connector.config().tor_proxy,
            "ws-gateway listening"
        );

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, remote_addr, shared).await {
                    tracing::debug!(%remote_addr, %err, "connection handler error");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), hyper::Error> {
    let service = service_fn(move |req| handle_request(req, remote_addr, Arc::clone(&shared)));

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
}

/// Admit, dial, then upgrade a single request.
async fn handle_request(
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let connection_id = uuid::Uuid::new_v4();

    let Some(key) = websocket_key(&req) else {
        tracing::debug!(%connection_id, %remote_addr, uri = %req.uri(), "not a websocket upgrade");
        return Ok(reject(StatusCode::BAD_REQUEST, None));
    };

    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let attempt = ConnectionAttempt::new(remote_addr.ip(), origin, path_target(req.uri().path()));

    // ------------------------------------------------------------------
    // 1. Admission: origin, destination, rate limit.
    // ------------------------------------------------------------------
    let admitted = match shared.admission.admit(&attempt).await {
        Ok(admitted) => admitted,
        Err(err) => {
            tracing::warn!(
                %connection_id,
                %remote_addr,
                origin = attempt.origin().unwrap_or("<none>"),
                target = attempt.target(),
                tor = attempt.is_tor_destination(),
                reason = err.reason(),
                %err,
                "upgrade rejected"
            );
            return Ok(reject(err.status_code(), None));
        }
    };

    // ------------------------------------------------------------------
    // 2. Dial the peer. One attempt, one route.
    // ------------------------------------------------------------------
    let upstream = match shared.connector.connect(&admitted.destination).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!(
                %connection_id,
                %remote_addr,
                destination = %admitted.destination,
                path = %err.path(),
                %err,
                "upstream dial failed"
            );
            return Ok(reject(StatusCode::NOT_FOUND, Some(err.to_string())));
        }
    };

    tracing::info!(
        %connection_id,
        %remote_addr,
        destination = %upstream.destination(),
        path = %upstream.path(),
        "upstream connected"
    );

    // ------------------------------------------------------------------
    // 3. Upgrade and hand both transports to a relay session.
    // ------------------------------------------------------------------
    let protocol = selected_protocol(&req);
    let on_upgrade = hyper::upgrade::on(&mut req);
    let relay = shared.relay.clone();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                run_session(connection_id, remote_addr, TokioIo::new(upgraded), upstream, relay)
                    .await;
            }
            Err(err) => {
                tracing::warn!(%connection_id, %remote_addr, %err, "upgrade failed; dropping upstream");
            }
        }
    });

    Ok(switching_protocols(&key, protocol))
}

async fn run_session<C>(
    connection_id: uuid::Uuid,
    remote_addr: SocketAddr,
    client_io: C,
    upstream: UpstreamConnection,
    relay: RelayConfig,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let client =
        WebSocketStream::from_raw_socket(client_io, Role::Server, Some(relay.websocket_config()))
            .await;
    let destination = upstream.destination().clone();

    tracing::info!(%connection_id, %remote_addr, %destination, "session open");

    let summary = RelaySession::new(connection_id, client, upstream.into_stream())
        .with_read_buffer_size(relay.read_buffer_size)
        .run()
        .await;

    tracing::info!(
        %connection_id,
        %remote_addr,
        %destination,
        closed_by = ?summary.closed_by,
        reason = %summary.reason,
        bytes_to_client = summary.bytes_to_client,
        bytes_to_upstream = summary.bytes_to_upstream,
        messages_to_client = summary.messages_to_client,
        "session closed"
    );
}

/// The `Sec-WebSocket-Key` of a well-formed upgrade request.
fn websocket_key(req: &Request<Incoming>) -> Option<String> {
    if req.method() != Method::GET {
        return None;
    }

    let headers = req.headers();
    let upgrade = headers.get(UPGRADE)?.to_str().ok()?;
    if !upgrade
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    {
        return None;
    }
    if headers.get(SEC_WEBSOCKET_VERSION)?.as_bytes() != b"13" {
        return None;
    }

    headers
        .get(SEC_WEBSOCKET_KEY)?
        .to_str()
        .ok()
        .map(str::to_string)
}

/// First subprotocol the client offered, echoed back on upgrade.
fn selected_protocol(req: &Request<Incoming>) -> Option<HeaderValue> {
    let offered = req.headers().get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let first = offered.split(',').map(str::trim).find(|p| !p.is_empty())?;
    HeaderValue::from_str(first).ok()
}

/// The destination segment of the request path: `/host:port` -> `host:port`.
fn path_target(path: &str) -> &str {
    path.trim_start_matches('/').split('/').next().unwrap_or("")
}

fn reject(status: StatusCode, body: Option<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.map(Bytes::from).unwrap_or_default()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn switching_protocols(key: &str, protocol: Option<HeaderValue>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    builder.body(Full::default()).unwrap_or_else(|err| {
        tracing::error!(%err, "failed to build upgrade response");
        reject(StatusCode::INTERNAL_SERVER_ERROR, None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_target_takes_first_segment() {
        assert_eq!(path_target("/203.0.113.5:9735"), "203.0.113.5:9735");
        assert_eq!(path_target("/abc123xyz.onion"), "abc123xyz.onion");
        assert_eq!(path_target("/node:9735/"), "node:9735");
        assert_eq!(path_target("/"), "");
        assert_eq!(path_target(""), "");
    }

    #[test]
    fn reject_sets_status_and_closes() {
        let response = reject(StatusCode::TOO_MANY_REQUESTS, None);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[CONNECTION], "close");
    }

    #[test]
    fn upgrade_response_carries_accept_key() {
        // Sample handshake from RFC 6455, section 1.3.
        let response = switching_protocols(
            "dGhlIHNhbXBsZSBub25jZQ==",
            Some(HeaderValue::from_static("chat")),
        );
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "chat");
    }

    #[test]
    fn default_config_has_no_origin_check() {
        let config = GatewayConfig::default();
        assert!(config.origin_allowlist.is_empty());
        assert_eq!(config.connector.tor_proxy.port, 9050);
    }
}

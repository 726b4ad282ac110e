// ============================================================================
// SECTION 16: CONTROL CHANNEL
// ============================================================================
// WebSocket server the operator console connects to:
// - bearer-token check during the HTTP upgrade
// - console identity from X-User-Id / X-Company-Id
// - one task per connection: frames in, completions back, one writer out
// - on disconnect every resource the connection owns is reclaimed
// ============================================================================

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::dispatcher::{ActionRegistry, Dispatcher};
use crate::error::{ChannelError, HostdResult};
use crate::lifecycle::ConnectionContext;
use crate::protocol::Outbound;

/// Header carrying the console user
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the console tenant
pub const COMPANY_HEADER: &str = "x-company-id";

/// How long a closing connection waits for its queued frames to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// 16.1 Handshake
// ----------------------------------------------------------------------------

/// Who is on the other end, as claimed by the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub company_id: Option<String>,
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Check the upgrade request. Returns the identity on success and the HTTP
/// rejection otherwise.
pub fn authorize(config: &ChannelConfig, request: &Request) -> Result<Identity, ErrorResponse> {
    if config.require_auth {
        let expected = config.auth_token.as_deref().unwrap_or_default();
        let presented = header(request, "authorization");
        let token = presented.as_deref().and_then(|v| v.strip_prefix("Bearer ")).map(str::trim);
        match token {
            Some(token) if !expected.is_empty() && token == expected => {}
            Some(_) => return Err(reject(StatusCode::UNAUTHORIZED, "invalid token")),
            None => return Err(reject(StatusCode::UNAUTHORIZED, "missing bearer token")),
        }
    }
    Ok(Identity {
        user_id: header(request, USER_HEADER),
        company_id: header(request, COMPANY_HEADER),
    })
}

// ----------------------------------------------------------------------------
// 16.2 Server
// ----------------------------------------------------------------------------

/// The control channel server.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    config: Arc<ChannelConfig>,
    registry: Arc<ActionRegistry>,
    /// Open connections
    connections: Arc<AtomicUsize>,
    /// Live resources across all connections
    active_resources: Arc<AtomicUsize>,
}

impl ControlChannel {
    pub fn new(
        config: ChannelConfig,
        registry: Arc<ActionRegistry>,
        connections: Arc<AtomicUsize>,
        active_resources: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            connections,
            active_resources,
        }
    }

    pub async fn bind(&self) -> HostdResult<TcpListener> {
        let addr = &self.config.listen_addr;
        TcpListener::bind(addr).await.map_err(|e| {
            ChannelError::Bind {
                addr: addr.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Accept connections until `shutdown` fires, then wait for the open
    /// ones to wind down.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> HostdResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(target: "hostd::channel", addr = %addr, "Control channel listening");
        }

        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let channel = self.clone();
                        let shutdown = shutdown.child_token();
                        sessions.spawn(async move {
                            if let Err(e) = channel.handle_connection(stream, shutdown).await {
                                debug!(target: "hostd::channel", peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(target: "hostd::channel", error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = shutdown.cancelled() => break,
            }
        }

        let open = sessions.len();
        if open > 0 {
            info!(target: "hostd::channel", open = open, "Closing control connections");
        }
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: CancellationToken) -> HostdResult<()> {
        let peer = stream.peer_addr().ok();
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        ws_config.max_frame_size = Some(self.config.max_message_size);

        let mut identity = Identity::default();
        let config = self.config.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            identity = authorize(&config, request)?;
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
            .await
            .map_err(|e| ChannelError::Handshake { message: e.to_string() })?;

        let (mut sink, mut frames) = ws.split();
        let (outbound, mut queue) = mpsc::channel::<Outbound>(self.config.outbound_queue);
        let mut writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if sink.send(Message::Text(message.to_json())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut connection =
            ConnectionContext::new(identity.user_id, identity.company_id).with_gauge(self.active_resources.clone());
        let open = self.connections.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        info!(
            target: "hostd::channel",
            connection = %connection.connection_id,
            peer = ?peer,
            user = ?connection.user_id,
            company = ?connection.company_id,
            open = open,
            "Console connected"
        );

        let (dispatcher, mut completions) = Dispatcher::new(self.registry.clone(), outbound.clone());
        let mut transport_error = None;
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatcher.handle_text(&text, &connection).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if !dispatcher.handle_text(&text, &connection).await {
                                break;
                            }
                        }
                        Err(_) => {
                            if outbound.send(Outbound::error(None, "binary frames must carry UTF-8 JSON")).await.is_err() {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        transport_error = Some(e.to_string());
                        break;
                    }
                },
                Some(completion) = completions.recv() => {
                    if !dispatcher.complete(completion, &mut connection).await {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        let released = connection.close_all();
        let open = self.connections.fetch_sub(1, AtomicOrdering::Relaxed).saturating_sub(1);
        info!(
            target: "hostd::channel",
            connection = %connection.connection_id,
            released = released,
            open = open,
            "Console disconnected"
        );

        // Completions still in flight belong to nobody now.
        completions.close();
        while let Ok(completion) = completions.try_recv() {
            completion.discard();
        }
        drop(dispatcher);
        drop(outbound);
        drop(connection);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }

        match transport_error {
            Some(message) => Err(ChannelError::Transport { message }.into()),
            None => Ok(()),
        }
    }
}

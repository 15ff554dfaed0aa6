//! # Downstream WebSocket Server
//!
//! Accepts WebSocket clients on `/` and `/ws`, admits each one through the relay's registry, and
//! pumps its outbound frames onto the socket until either side closes.

use crate::notes_logic::config::Config;
use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{CloseCause, CloseReason, Outbound, Relay, outbound_channel};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long a removed subscriber's socket may take to flush its close frame before it is dropped.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /// Live socket sessions, so shutdown can wait for close frames to go out.
    pub sessions: TaskTracker,
    pub close_grace: Duration,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            sessions: TaskTracker::new(),
            close_grace: CLOSE_GRACE,
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds the configured port and serves until `shutdown` is cancelled.
pub async fn run(config: Config, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Note relay listening on ws://{}", addr);

    serve(listener, state, shutdown).await
}

pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        log::info!("Downstream server shutting down.");
    })
    .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let sessions = state.sessions.clone();
    ws.on_upgrade(move |socket| sessions.track_future(handle_socket(socket, state, addr)))
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Payload(payload) => Message::Text(payload.to_string().into()),
        Outbound::Ping => Message::Ping(Bytes::new()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: Utf8Bytes::from_static(reason.reason()),
        })),
    }
}

fn cause_of(reason: CloseReason) -> CloseCause {
    match reason {
        CloseReason::LifetimeExpired => CloseCause::LifetimeExpired,
        CloseReason::ServerShutdown => CloseCause::ServerShutdown,
        // Never reaches an admitted subscriber.
        CloseReason::AdmissionRejected => CloseCause::PeerClosed,
    }
}

/// # WebSocket Session
///
/// 1. Admit the client by remote IP. A rejected client gets its 4001 close frame and nothing
///    else.
/// 2. A writer task drains the subscriber's outbound channel onto the socket and stops after a
///    close frame or a failed write.
/// 3. A reader task watches for the peer closing or the transport failing. Inbound data frames
///    carry no meaning and are ignored.
/// 4. Whichever finishes first decides the close cause; the subscriber is then removed, which
///    releases its origin slot and cancels its timers.
/// 5. If the registry removes the subscriber first (lifetime expiry, shutdown), the writer gets
///    `close_grace` to flush what is queued, including the close frame. After that the socket is
///    dropped whether or not the peer is reading.
async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let origin = addr.ip().to_string();
    let (tx, mut rx) = outbound_channel();
    let (mut sink, mut stream) = socket.split();

    let handle = match state.relay.registry().admit(&origin, tx) {
        Ok(handle) => handle,
        Err(_) => {
            let flush = async {
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(to_message(frame)).await.is_err() {
                        break;
                    }
                }
            };
            if timeout(state.close_grace, flush).await.is_err() {
                log::debug!("Dropping rejected client {} without a close handshake", origin);
            }
            return;
        }
    };
    let id = handle.id();
    let teardown = handle.teardown_signal();
    drop(handle);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let close = match frame {
                Outbound::Close(reason) => Some(reason),
                _ => None,
            };
            if let Err(e) = sink.send(to_message(frame)).await {
                log::debug!("Write to {} failed: {}", id, e);
                return CloseCause::TransportError;
            }
            if let Some(reason) = close {
                return cause_of(reason);
            }
        }
        CloseCause::TransportError
    });

    let mut reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Close(_)) => return CloseCause::PeerClosed,
                Ok(Message::Pong(_)) => {}
                Ok(other) => log::trace!("Ignoring inbound frame from {}: {:?}", id, other),
                Err(e) => {
                    log::debug!("Read from {} failed: {}", id, e);
                    return CloseCause::TransportError;
                }
            }
        }
        CloseCause::PeerClosed
    });

    let cause = tokio::select! {
        res = &mut reader => {
            writer.abort();
            res.unwrap_or(CloseCause::TransportError)
        }
        res = &mut writer => {
            reader.abort();
            res.unwrap_or(CloseCause::TransportError)
        }
        _ = teardown.cancelled() => {
            reader.abort();
            match timeout(state.close_grace, &mut writer).await {
                Ok(res) => res.unwrap_or(CloseCause::TransportError),
                Err(_) => {
                    log::warn!("{} ({}) did not drain its close frame in time, dropping socket", id, origin);
                    writer.abort();
                    CloseCause::TransportError
                }
            }
        }
    };

    state.relay.registry().remove(id, cause);
}

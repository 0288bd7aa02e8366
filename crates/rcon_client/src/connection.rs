//! Connection supervision and session state for one RCON server.
//!
//! The session tracks authentication and the table of outstanding request
//! ids; the supervisor dials, frames the socket with [`RconCodec`], and
//! reconnects with the configured delays when the session ends.

use crate::config::ClientConfig;
use crate::packet::{Packet, RconCodec, RconError, AUTH_FAILED_ID, TYPE_COMMAND};
use futures::{SinkExt, StreamExt};
use relay_events::{kinds, EndpointId, Event, EventBus, EventInbox, Protocol, SendCommand};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    AwaitingAuth { login_id: i32 },
    Ready,
}

/// Protocol state for one connection attempt. Performs no I/O; the caller
/// feeds it packets and events and writes out what it queues.
struct RconSession {
    config: Arc<ClientConfig>,
    out: VecDeque<Packet>,
    /// Outstanding request id → completion channel
    pending: HashMap<i32, oneshot::Sender<String>>,
    next_id: i32,
    state: AuthState,
    pending_disconnect: Option<String>,
}

impl RconSession {
    fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            out: VecDeque::new(),
            pending: HashMap::new(),
            next_id: 0,
            state: AuthState::AwaitingAuth { login_id: 0 },
            pending_disconnect: None,
        }
    }

    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_outbound(&mut self) -> Vec<Packet> {
        self.out.drain(..).collect()
    }

    fn take_disconnect(&mut self) -> Option<String> {
        self.pending_disconnect.take()
    }

    fn on_connected(&mut self) {
        debug!("Connected to RCON, sending login");
        let id = self.allocate_id();
        let password = self.config.rcon.password.clone();
        self.out.push_back(Packet::auth(id, &password));
        self.state = AuthState::AwaitingAuth { login_id: id };
    }

    fn on_packet(&mut self, pkt: Packet) {
        trace!("Parsed RCON packet: {:?}", pkt);
        if pkt.id == AUTH_FAILED_ID {
            warn!("RCON login failed, password incorrect?");
            self.pending_disconnect = Some("Authentication failed".to_string());
            return;
        }
        match self.state {
            AuthState::AwaitingAuth { login_id }
                if pkt.ptype == TYPE_COMMAND && pkt.id == login_id =>
            {
                info!("RCON login successful");
                self.state = AuthState::Ready;
            }
            AuthState::AwaitingAuth { .. } => {
                trace!("Dropping packet received before authentication");
            }
            AuthState::Ready => match self.pending.remove(&pkt.id) {
                // The requester may have gone away; that is fine.
                Some(tx) => {
                    let _ = tx.send(pkt.payload);
                }
                None => trace!("Dropping response with unknown id {}", pkt.id),
            },
        }
    }

    /// Queue a command, returning its request id.
    fn send_command(&mut self, command: &str, completion: Option<oneshot::Sender<String>>) -> i32 {
        let id = self.allocate_id();
        if let Some(tx) = completion {
            self.pending.insert(id, tx);
        }
        self.out.push_back(Packet::command(id, command));
        id
    }

    fn handle_event(&mut self, event: &Event) {
        if event.kind != kinds::RCON_SENDCMD {
            return;
        }
        if self.state != AuthState::Ready {
            warn!("Dropping RCON command, not authenticated yet");
            return;
        }
        match event.payload_as::<SendCommand>() {
            Ok(cmd) => {
                self.send_command(&cmd.command, event.take_completion());
            }
            Err(e) => warn!("Event {} missing command to execute: {}", event.kind, e),
        }
    }
}

/// Run one server until shutdown, reconnecting on failure.
pub(crate) async fn supervise(
    config: Arc<ClientConfig>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    let endpoint = EndpointId::new(crate::MODULE_NAME, &config.name);
    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let inbox = match bus.register(endpoint.clone(), Protocol::Rcon) {
            Ok(inbox) => inbox,
            Err(e) => {
                warn!("Unable to register {} on the event bus: {}", endpoint, e);
                if wait(&shutdown, config.connect_retry_delay).await {
                    return;
                }
                continue;
            }
        };

        info!(
            "Connecting RCON client {} to [{}]:{}",
            config.name, config.rcon.host, config.rcon.port
        );
        let end = match TcpStream::connect((config.rcon.host.as_str(), config.rcon.port)).await {
            Ok(stream) => run_session(config.clone(), inbox, stream, shutdown.clone()).await,
            Err(e) => {
                warn!("Connection to RCON client {} failed: {}", config.name, e);
                bus.unregister(&endpoint);
                if wait(&shutdown, config.connect_retry_delay).await {
                    return;
                }
                continue;
            }
        };

        bus.unregister(&endpoint);
        match end {
            SessionEnd::Shutdown => return,
            SessionEnd::Lost => {
                info!(
                    "Lost RCON connection for {}, reconnecting in {:?}",
                    config.name, config.reconnect_delay
                );
                if wait(&shutdown, config.reconnect_delay).await {
                    return;
                }
            }
        }
    }
}

/// Sleep that aborts on shutdown. Returns true when shutting down.
async fn wait(shutdown: &CancellationToken, delay: std::time::Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn run_session<S>(
    config: Arc<ClientConfig>,
    mut inbox: EventInbox,
    stream: S,
    shutdown: CancellationToken,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, RconCodec);
    let mut session = RconSession::new(config.clone());

    session.on_connected();
    if flush(&mut session, &mut framed).await.is_err() {
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return SessionEnd::Shutdown;
            }
            pkt = framed.next() => match pkt {
                Some(Ok(pkt)) => session.on_packet(pkt),
                Some(Err(RconError::MalformedPacket(reason))) => {
                    warn!("Dropping malformed RCON packet: {}", reason);
                    continue;
                }
                Some(Err(RconError::Io(e))) => {
                    warn!("Read error for {}: {}", config.name, e);
                    return SessionEnd::Lost;
                }
                None => {
                    info!("Server closed connection");
                    return SessionEnd::Lost;
                }
            },
            event = inbox.recv() => match event {
                Some(event) => session.handle_event(&event),
                None => return SessionEnd::Lost,
            },
        }

        if flush(&mut session, &mut framed).await.is_err() {
            return SessionEnd::Lost;
        }
        if let Some(reason) = session.take_disconnect() {
            info!("Disconnecting from {}: {}", config.name, reason);
            return SessionEnd::Lost;
        }
    }
}

async fn flush<S>(session: &mut RconSession, framed: &mut Framed<S, RconCodec>) -> Result<(), RconError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for pkt in session.take_outbound() {
        trace!("Sending RCON packet: {:?}", pkt);
        framed.feed(pkt).await?;
    }
    framed.flush().await
}

//! Connection supervision for one configured IRC network.
//!
//! Each network gets a supervisor task that dials the server, registers the
//! connection on the event bus, and drives a [`Session`] from a select loop
//! over socket lines, bus deliveries and timer expiries. When the transport
//! drops, the supervisor unregisters, waits out the appropriate delay, and
//! starts over with a fresh session.

use crate::config::ClientConfig;
use crate::session::Session;
use futures::StreamExt;
use relay_events::{EndpointId, EventBus, EventInbox, Protocol};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lines beyond this are discarded rather than buffered without bound.
const MAX_LINE_LENGTH: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Transport closed or failed; reconnect after a delay.
    Lost,
    /// Operator shutdown; do not reconnect.
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Run one network until shutdown. Dial failures retry after the connect
/// retry delay; an established session that drops reconnects after the
/// longer session-loss delay.
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

        let inbox = match bus.register(endpoint.clone(), Protocol::Irc) {
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
            "Connecting to {}:{} for {}",
            config.server.host, config.server.port, config.name
        );
        let end = match dial(&config).await {
            Ok(ServerStream::Plain(stream)) => {
                run_session(config.clone(), bus.clone(), inbox, stream, shutdown.clone()).await
            }
            Ok(ServerStream::Tls(stream)) => {
                run_session(config.clone(), bus.clone(), inbox, *stream, shutdown.clone()).await
            }
            Err(e) => {
                warn!(
                    "Connection to {}:{} failed: {}",
                    config.server.host, config.server.port, e
                );
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
                    "Lost connection for {}, reconnecting in {:?}",
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

async fn dial(config: &ClientConfig) -> Result<ServerStream, DialError> {
    let stream = TcpStream::connect((config.server.host.as_str(), config.server.port)).await?;
    if !config.server.tls {
        return Ok(ServerStream::Plain(stream));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = ServerName::try_from(config.server.host.clone())
        .map_err(|_| DialError::InvalidServerName(config.server.host.clone()))?;
    let connector = TlsConnector::from(Arc::new(tls_config));
    Ok(ServerStream::Tls(Box::new(
        connector.connect(name, stream).await?,
    )))
}

async fn run_session<S>(
    config: Arc<ClientConfig>,
    bus: Arc<EventBus>,
    mut inbox: EventInbox,
    stream: S,
    shutdown: CancellationToken,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (mut session, mut timer_rx) = Session::new(config.clone(), bus);

    session.on_connected();
    if flush(&mut session, &mut writer).await.is_err() {
        return SessionEnd::Lost;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Best effort, the server may already be gone.
                let _ = writer.write_all(b"QUIT :Shutting down\r\n").await;
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                return SessionEnd::Shutdown;
            }
            line = lines.next() => match line {
                Some(Ok(line)) => session.on_line(&line),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("Dropping oversized line from {}", config.server.host);
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!("Read error for {}: {}", config.name, e);
                    return SessionEnd::Lost;
                }
                None => {
                    match &session.error_msg {
                        Some(msg) => warn!("Server closed connection: {}", msg),
                        None => info!("Server closed connection"),
                    }
                    return SessionEnd::Lost;
                }
            },
            event = inbox.recv() => match event {
                Some(event) => session.handle_event(&event),
                None => return SessionEnd::Lost,
            },
            timer = timer_rx.recv() => {
                if let Some(timer) = timer {
                    session.on_timer(timer);
                }
            }
        }

        if flush(&mut session, &mut writer).await.is_err() {
            return SessionEnd::Lost;
        }
        if let Some(reason) = session.take_disconnect() {
            info!("Disconnecting from {}: {}", config.name, reason);
            return SessionEnd::Lost;
        }
    }
}

async fn flush<W>(session: &mut Session, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for line in session.take_outbound() {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, UserConfig};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            name: "net1".to_string(),
            server: ServerConfig {
                host: "irc.example.net".to_string(),
                port: 6667,
                tls: false,
                password: None,
            },
            user: UserConfig {
                nick: "relay".to_string(),
                username: "relay".to_string(),
                gecos: "Relay Bot".to_string(),
            },
            channels: HashMap::new(),
            reconnect_delay: Duration::from_secs(30),
            connect_retry_delay: Duration::from_secs(10),
        })
    }

    #[tokio::test]
    async fn session_registers_then_quits_on_shutdown() {
        let (client, server) = tokio::io::duplex(4096);
        let bus = Arc::new(EventBus::new());
        let inbox = bus
            .register(EndpointId::new("irc", "net1"), Protocol::Irc)
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_session(
            config(),
            bus,
            inbox,
            client,
            shutdown.clone(),
        ));

        let mut server = BufReader::new(server);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "CAP LS");

        shutdown.cancel();
        loop {
            line.clear();
            server.read_line(&mut line).await.unwrap();
            if line.trim_end() == "QUIT :Shutting down" {
                break;
            }
        }
        assert_eq!(handle.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn server_close_ends_the_session_as_lost() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bus = Arc::new(EventBus::new());
        let inbox = bus
            .register(EndpointId::new("irc", "net1"), Protocol::Irc)
            .unwrap();
        let handle = tokio::spawn(run_session(
            config(),
            bus,
            inbox,
            client,
            CancellationToken::new(),
        ));

        server.write_all(b"PING :hi\r\n").await.unwrap();
        drop(server);
        assert_eq!(handle.await.unwrap(), SessionEnd::Lost);
    }
}

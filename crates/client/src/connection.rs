//! QUIC transport driver: connects, reconnects with backoff and routes replies

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

use tether_common::{
    decode_message, frame_len, frame_message, ClientMessage, EventKind, FrameError, ServerMessage,
    PROTOCOL_VERSION,
};

use crate::config::ConnectionSettings;

pub const ALPN_PROTOCOL: &[u8] = b"tether";

/// Link-level events, in the order the driver observes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    ConnectError(String),
    Disconnect(String),
    ReconnectAttempt(u32),
    Reconnect,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
    #[error("Timed out waiting for {0} reply")]
    Timeout(EventKind),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Decoding error: {0}")]
    Decoding(#[from] rmp_serde::decode::Error),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Receiving ends handed to the owner of a transport.
pub struct TransportChannels {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// Server messages nobody was waiting for, including the handshake ack.
    pub incoming: mpsc::UnboundedReceiver<ServerMessage>,
}

pub struct Transport {
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    waiters: Mutex<HashMap<EventKind, Vec<oneshot::Sender<ServerMessage>>>>,
    request_timeout: Duration,
    closed: AtomicBool,
    close: Notify,
}

impl Transport {
    pub(crate) fn new(request_timeout: Duration) -> Self {
        Self {
            outgoing: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            request_timeout,
            closed: AtomicBool::new(false),
            close: Notify::new(),
        }
    }

    /// Starts the connection driver. The first frame on every link is the handshake.
    pub fn spawn(
        settings: ConnectionSettings,
        client_id: String,
    ) -> Result<(Arc<Self>, TransportChannels), TransportError> {
        let client_config = configure_quic_client(&settings)?;
        let bind: SocketAddr = ([0, 0, 0, 0], 0).into();
        let mut endpoint = Endpoint::client(bind)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let transport = Arc::new(Self::new(Duration::from_secs(settings.timeout)));
        let (events_tx, events) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(transport.clone().drive(endpoint, settings, client_id, events_tx, incoming_tx));

        Ok((transport, TransportChannels { events, incoming }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the driver for good: the current link is dropped and no reconnect follows.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing transport");
        }
        self.close.notify_waiters();
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.close.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(msg).map_err(|_| TransportError::NotConnected)
    }

    /// Sends `msg` and waits for the next server message carrying the same event.
    pub async fn request(&self, msg: ClientMessage) -> Result<ServerMessage, TransportError> {
        let event = msg.event();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(event).or_default().push(tx);

        if let Err(e) = self.send(msg) {
            drop(rx);
            self.prune(event);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.prune(event);
                Err(TransportError::Timeout(event))
            }
        }
    }

    fn prune(&self, event: EventKind) {
        let mut waiters = self.waiters.lock();
        if let Some(queue) = waiters.get_mut(&event) {
            queue.retain(|tx| !tx.is_closed());
        }
    }

    fn dispatch(&self, msg: ServerMessage, incoming_tx: &mpsc::UnboundedSender<ServerMessage>) {
        let event = msg.event();
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters
                .get_mut(&event)
                .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)))
        };

        let unclaimed = match waiter {
            Some(tx) => tx.send(msg).err(),
            None => Some(msg),
        };

        if let Some(msg) = unclaimed {
            if incoming_tx.send(msg).is_err() {
                debug!("Dropping {} message, nobody is listening", event);
            }
        }
    }

    async fn drive(
        self: Arc<Self>,
        endpoint: Endpoint,
        settings: ConnectionSettings,
        client_id: String,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        incoming_tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let emit = |event: TransportEvent| {
            let _ = events_tx.send(event);
        };

        let mut attempts: u32 = 0;
        let mut delay = settings.reconnection_delay();

        loop {
            if self.is_closed() {
                break;
            }

            match connect(&endpoint, &settings).await {
                Ok(connection) => {
                    info!("Connected to {}", connection.remote_address());
                    if attempts > 0 {
                        emit(TransportEvent::Reconnect);
                    }
                    emit(TransportEvent::Connect);
                    attempts = 0;
                    delay = settings.reconnection_delay();

                    let handshake = ClientMessage::Handshake {
                        version: PROTOCOL_VERSION,
                        client_id: client_id.clone(),
                        key: settings.key.clone(),
                    };
                    let reason = self.run_session(connection, handshake, &incoming_tx).await;
                    emit(TransportEvent::Disconnect(reason));
                }
                Err(e) => {
                    debug!("Connect failed: {}", e);
                    emit(TransportEvent::ConnectError(e.to_string()));
                }
            }

            if self.is_closed() {
                break;
            }
            if attempts >= settings.reconnection_attempts {
                warn!("Giving up after {} reconnection attempts", attempts);
                break;
            }

            attempts += 1;
            emit(TransportEvent::ReconnectAttempt(attempts));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wait_closed() => break,
            }
            delay = std::cmp::min(delay * 2, settings.reconnection_delay_max());
        }

        endpoint.close(0u32.into(), b"client shutdown");
        debug!("Transport driver stopped");
    }

    async fn run_session(
        self: &Arc<Self>,
        connection: Connection,
        handshake: ClientMessage,
        incoming_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> String {
        let (mut send, recv) = match connection.open_bi().await {
            Ok(streams) => streams,
            Err(e) => return e.to_string(),
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let _ = out_tx.send(handshake);
        *self.outgoing.lock() = Some(out_tx);

        let mut reader = tokio::spawn(read_loop(self.clone(), recv, incoming_tx.clone()));

        let reason = loop {
            tokio::select! {
                Some(msg) = out_rx.recv() => {
                    match frame_message(&msg) {
                        Ok(bytes) => {
                            if let Err(e) = send.write_all(&bytes).await {
                                break e.to_string();
                            }
                        }
                        Err(e) => error!("Dropping outgoing {}: {}", msg.event(), e),
                    }
                }
                result = &mut reader => {
                    break match result {
                        Ok(reason) => reason,
                        Err(e) => e.to_string(),
                    };
                }
                _ = self.wait_closed() => {
                    let goodbye = ClientMessage::Disconnect { reason: "client closing".to_string() };
                    if let Ok(bytes) = frame_message(&goodbye) {
                        let _ = send.write_all(&bytes).await;
                    }
                    let _ = send.finish();
                    break "client closing".to_string();
                }
            }
        };

        *self.outgoing.lock() = None;
        // Pending requesters observe `Closed`.
        self.waiters.lock().clear();
        reader.abort();
        connection.close(0u32.into(), b"bye");

        reason
    }
}

async fn read_loop(
    transport: Arc<Transport>,
    mut recv: quinn::RecvStream,
    incoming_tx: mpsc::UnboundedSender<ServerMessage>,
) -> String {
    loop {
        match read_frame(&mut recv).await {
            Ok(msg) => transport.dispatch(msg, &incoming_tx),
            Err(e) => return e.to_string(),
        }
    }
}

async fn read_frame(recv: &mut quinn::RecvStream) -> Result<ServerMessage, TransportError> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    let len = frame_len(len_buf)?;

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Stream(e.to_string()))?;

    Ok(decode_message(&buf)?)
}

async fn connect(endpoint: &Endpoint, settings: &ConnectionSettings) -> Result<Connection, TransportError> {
    let addr = resolve(&settings.server_address).await?;
    let connecting = endpoint
        .connect(addr, &settings.server_name)
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    tokio::time::timeout(Duration::from_secs(settings.timeout), connecting)
        .await
        .map_err(|_| TransportError::Connect(format!("timed out connecting to {}", addr)))?
        .map_err(|e| TransportError::Connect(e.to_string()))
}

async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address)
        .await
        .map_err(|e| TransportError::Connect(format!("Could not resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| TransportError::Connect(format!("Could not resolve {}", address)))
}

fn configure_quic_client(settings: &ConnectionSettings) -> Result<QuinnClientConfig, TransportError> {
    let ca_pem = std::fs::read(&settings.ca_path).map_err(|e| {
        TransportError::Tls(format!("Failed to read CA certificate {:?}: {}", settings.ca_path, e))
    })?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert = cert.map_err(|e| TransportError::Tls(e.to_string()))?;
        roots.add(cert).map_err(|e| TransportError::Tls(e.to_string()))?;
    }

    let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| TransportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut client_config = QuinnClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    let idle = Duration::from_secs(settings.timeout)
        .try_into()
        .map_err(|_| TransportError::Tls("idle timeout out of range".to_string()))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(Duration::from_secs(5)));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

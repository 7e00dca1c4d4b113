//! Tether Server
//!
//! Serves an authoritative project tree to tether clients over QUIC and keeps
//! track of their liveness through a heartbeat counter.

mod config;
mod auth;
mod sync;
mod protocol;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use quinn::Endpoint;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tether_common::{
    crypto, ClientMessage, ConnectionAck, ProjectStatus, ServerMessage, STATUS_BAD_REQUEST,
    STATUS_OK,
};

use auth::SessionRegistry;
use config::ServerConfig;
use protocol::{StreamReader, StreamWriter};
use sync::ProjectSource;
use tls::CertificateBundle;

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Tether Server - authoritative project source for tether clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start serving the configured project
    Start,

    /// Show configuration, project and certificate details
    Info,

    GenerateConfig {
        #[arg(short, long, default_value = "server.toml")]
        output: PathBuf,
    },

    GenerateCerts {
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        #[arg(long, default_value = "tether")]
        cn: String,
    },
}

struct ServerState {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    project: ProjectSource,
}

impl ServerState {
    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.server.heartbeat_interval_ms)
    }
}

/// Whether a connection stays open after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    let config_path = cli.config.unwrap_or_else(ServerConfig::default_path);
    let config = if config_path.exists() {
        ServerConfig::load(&config_path)?
    } else {
        info!("No config file found, using defaults");
        ServerConfig::default()
    };

    match cli.command {
        Commands::Start => start_server(config).await,
        Commands::Info => show_server_info(&config),
        Commands::GenerateConfig { output } => generate_config(&output),
        Commands::GenerateCerts { output, cn } => generate_certs(&output, &cn),
    }
}

async fn start_server(config: ServerConfig) -> Result<()> {
    config.validate()?;

    info!("Starting Tether Server v{}", env!("CARGO_PKG_VERSION"));

    let project = ProjectSource::open(&config.project)
        .with_context(|| format!("Failed to open project at {:?}", config.project.path))?;
    let manifest = project.manifest();
    info!("Serving project {} v{}", manifest.name, manifest.version);

    let state = Arc::new(ServerState {
        config: config.clone(),
        registry: Arc::new(SessionRegistry::new()),
        project,
    });

    let server_config = tls::quic_server_config(
        &config.auth,
        Duration::from_secs(config.server.idle_timeout),
    )?;

    let addr: SocketAddr = config.server.bind_address.parse()
        .context("Invalid bind address")?;

    let endpoint = Endpoint::server(server_config, addr)?;

    state.registry.start_sweeper(state.heartbeat_interval());
    print_connection_info(&config, &addr, &manifest.name, &manifest.version);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(incoming, state).await {
                        error!("Connection error: {}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Stopping server...");
                break;
            }
        }
    }

    state.registry.stop_sweeper();
    endpoint.close(0u32.into(), b"server shutdown");
    endpoint.wait_idle().await;
    info!("Server stopped");

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    state: Arc<ServerState>,
) -> Result<()> {
    let connection = incoming.await?;
    let remote_addr = connection.remote_address();

    let session = state.registry.register(Utc::now());
    info!("New connection from {} (session {})", remote_addr, session.id);

    let result = serve_session(&connection, &state, session.id, &session.kick).await;

    state.registry.remove(session.id);
    connection.close(0u32.into(), b"bye");
    info!("Connection closed: {} (session {})", remote_addr, session.id);

    result
}

async fn serve_session(
    connection: &quinn::Connection,
    state: &Arc<ServerState>,
    session_id: Uuid,
    kick: &tokio::sync::Notify,
) -> Result<()> {
    let (mut send, mut recv) = connection.accept_bi().await?;

    let mut reader = StreamReader::new();
    let mut writer = StreamWriter::new();

    // Unbounded: replies are queued synchronously while this task is the only reader.
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            result = recv.read(&mut buf) => {
                match result {
                    Ok(Some(n)) => {
                        reader.push(&buf[..n]);

                        let mut flow = Flow::Continue;
                        while let Some(msg) = reader.try_read()? {
                            flow = handle_message(msg, state, session_id, &response_tx);
                            if flow == Flow::Close {
                                break;
                            }
                        }

                        while let Ok(response) = response_rx.try_recv() {
                            writer.queue(&response)?;
                        }
                        if writer.has_pending() {
                            send.write_all(&writer.take()).await?;
                        }

                        if flow == Flow::Close {
                            send.finish().ok();
                            // Give the peer a moment to read the final frame.
                            let _ = tokio::time::timeout(Duration::from_secs(1), send.stopped()).await;
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Stream closed by client");
                        break;
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break;
                    }
                }
            }
            Some(response) = response_rx.recv() => {
                writer.queue(&response)?;
                send.write_all(&writer.take()).await?;
            }
            _ = kick.notified() => {
                warn!("Session {} dropped by heartbeat sweep", session_id);
                break;
            }
        }
    }

    Ok(())
}

fn handle_message(
    msg: ClientMessage,
    state: &Arc<ServerState>,
    session_id: Uuid,
    response_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Flow {
    let event = msg.event();

    let msg = match msg {
        ClientMessage::Handshake { version, client_id, key } => {
            return handle_handshake(state, session_id, version, &client_id, key.as_deref(), response_tx);
        }
        other => other,
    };

    // Swept or disconnected: drop the link so the client reconnects.
    if !state.registry.contains(session_id) {
        debug!("{} for removed session {}, closing", event, session_id);
        return Flow::Close;
    }

    if !state.registry.is_authenticated(session_id) {
        warn!("Rejected {} from unauthenticated session {}", event, session_id);
        let _ = response_tx.send(ServerMessage::unauthorized(event));
        return Flow::Close;
    }

    match msg {
        ClientMessage::GetProject { status } => {
            let Some(status) = ProjectStatus::from_u8(status) else {
                let _ = response_tx.send(ServerMessage::Project {
                    status: STATUS_BAD_REQUEST,
                    project: None,
                });
                return Flow::Continue;
            };

            debug!("getProject from {} with status {}", session_id, status);
            let state = state.clone();
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let worker = state.clone();
                let payload = tokio::task::spawn_blocking(move || worker.project.payload(status)).await;

                // The session may have gone away while the tree was being read.
                if !state.registry.contains(session_id) {
                    debug!("Session {} gone before project reply", session_id);
                    return;
                }

                let reply = match payload {
                    Ok(Ok(project)) => ServerMessage::Project {
                        status: STATUS_OK,
                        project: Some(project),
                    },
                    Ok(Err(e)) => {
                        error!("Failed to build project payload: {}", e);
                        ServerMessage::Project { status: STATUS_BAD_REQUEST, project: None }
                    }
                    Err(e) => {
                        error!("Project scan task failed: {}", e);
                        ServerMessage::Project { status: STATUS_BAD_REQUEST, project: None }
                    }
                };
                let _ = response_tx.send(reply);
            });
        }

        ClientMessage::CheckVersion => {
            let _ = response_tx.send(ServerMessage::Version {
                status: STATUS_OK,
                message: Some(state.project.version()),
            });
        }

        ClientMessage::Heartbeat { state: reported } => {
            match state.registry.record_heartbeat(session_id, reported, Utc::now()) {
                Ok(counter) => {
                    debug!("Heartbeat {} -> {} for {}", reported, counter, session_id);
                    let _ = response_tx.send(ServerMessage::Heartbeat { state: counter });
                }
                Err(e) => {
                    debug!("Heartbeat ignored: {}", e);
                    return Flow::Close;
                }
            }
        }

        ClientMessage::Disconnect { reason } => {
            info!("Session {} disconnecting: {}", session_id, reason);
            state.registry.remove(session_id);
            return Flow::Close;
        }

        ClientMessage::Handshake { .. } => {}
    }

    Flow::Continue
}

fn handle_handshake(
    state: &Arc<ServerState>,
    session_id: Uuid,
    version: u8,
    client_id: &str,
    key: Option<&str>,
    response_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Flow {
    if let Err(e) = auth::authenticate(state.config.auth.key.as_deref(), version, key) {
        warn!("Handshake from {} rejected: {}", client_id, e);
        state.registry.remove(session_id);
        let _ = response_tx.send(ServerMessage::Connection(ConnectionAck::rejected(
            e.status(),
            &e.to_string(),
        )));
        return Flow::Close;
    }

    if state.registry.authenticate(session_id, client_id).is_err() {
        debug!("Handshake for removed session {}", session_id);
        return Flow::Close;
    }

    info!("Client {} authenticated (session {})", client_id, session_id);
    let _ = response_tx.send(ServerMessage::Connection(ConnectionAck {
        status: STATUS_OK,
        message: None,
        heartbeat_interval: state.config.server.heartbeat_interval_ms,
        session_id: Some(session_id.to_string()),
        project: Some(state.project.info()),
    }));

    Flow::Continue
}

fn generate_config(output: &PathBuf) -> Result<()> {
    let config_content = config::generate_example_config()?;
    std::fs::write(output, config_content)?;
    println!("Generated example config: {:?}", output);
    Ok(())
}

fn generate_certs(output: &PathBuf, cn: &str) -> Result<()> {
    CertificateBundle::generate(cn)?.write_to(output)?;

    println!("Generated certificates in {:?}", output);
    println!("  ca.crt     - CA certificate, set connection.ca_path to it on every client");
    println!("  ca.key     - CA private key, keep it off the clients");
    println!("  server.crt - server certificate for {}, localhost and 127.0.0.1", cn);
    println!("  server.key - server private key");

    Ok(())
}

fn print_connection_info(config: &ServerConfig, addr: &SocketAddr, name: &str, version: &str) {
    println!();
    println!("  Tether Server v{}", env!("CARGO_PKG_VERSION"));
    println!("  ------------------------------------------------");
    println!("  Listening:  {}", addr);
    println!("  Project:    {} v{}", name, version);
    println!("  Directory:  {}", config.project.path.display());
    println!("  Heartbeat:  every {} ms", config.server.heartbeat_interval_ms);
    println!("  Key:        {}", if config.auth.key.is_some() { "required" } else { "not required" });
    println!();
    println!("  Connect with:");
    println!("    tether --server {}", addr);
    println!();
    info!("Server listening on {}", addr);
}

fn show_server_info(config: &ServerConfig) -> Result<()> {
    println!();
    println!("  Tether Server Information");
    println!("  ------------------------------------------------");
    println!("  Bind Address:   {}", config.server.bind_address);
    println!("  Idle Timeout:   {} s", config.server.idle_timeout);
    println!("  Heartbeat:      {} ms", config.server.heartbeat_interval_ms);
    println!("  Project Path:   {}", config.project.path.display());
    println!("  Ignored:        {}", config.project.ignore.join(", "));
    println!("  Commands:       {}", config.project.commands.len());
    println!("  Packages:       {}", config.project.packages.len());

    match ProjectSource::open(&config.project) {
        Ok(project) => {
            let manifest = project.manifest();
            println!("  Project:        {} v{}", manifest.name, manifest.version);
        }
        Err(e) => println!("  Project:        unavailable ({})", e),
    }

    println!("  Certificate:    {}", config.auth.cert_path.display());
    if let Ok(pem) = std::fs::read(&config.auth.cert_path) {
        if let Some(Ok(cert)) = rustls_pemfile::certs(&mut pem.as_slice()).next() {
            println!("  Fingerprint:    {}", crypto::cert_fingerprint(cert.as_ref()));
        }
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tether_common::{PROTOCOL_VERSION, STATUS_UNAUTHORIZED};

    fn test_state(dir: &TempDir, key: Option<&str>) -> Arc<ServerState> {
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("index.js"), "run()").unwrap();

        let mut config = ServerConfig::default();
        config.auth.key = key.map(str::to_string);
        config.project.path = dir.path().to_path_buf();
        let project = ProjectSource::open(&config.project).unwrap();

        Arc::new(ServerState {
            config,
            registry: Arc::new(SessionRegistry::new()),
            project,
        })
    }

    fn handshake(key: Option<&str>) -> ClientMessage {
        ClientMessage::Handshake {
            version: PROTOCOL_VERSION,
            client_id: "client-1".to_string(),
            key: key.map(str::to_string),
        }
    }

    /// Registers a session and completes the handshake for it.
    fn authenticated(
        state: &Arc<ServerState>,
        key: Option<&str>,
    ) -> (Uuid, mpsc::UnboundedSender<ServerMessage>, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = state.registry.register(Utc::now()).id;
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(handle_message(handshake(key), state, id, &tx), Flow::Continue);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Connection(ack)) if ack.status == STATUS_OK));
        (id, tx, rx)
    }

    #[tokio::test]
    async fn test_handshake_announces_session_and_project() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, Some("abc"));
        let id = state.registry.register(Utc::now()).id;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let flow = handle_message(handshake(Some("abc")), &state, id, &tx);
        assert_eq!(flow, Flow::Continue);
        assert!(state.registry.is_authenticated(id));

        let Ok(ServerMessage::Connection(ack)) = rx.try_recv() else {
            panic!("expected a connection ack");
        };
        assert_eq!(ack.status, STATUS_OK);
        assert_eq!(ack.heartbeat_interval, 10_000);
        assert_eq!(ack.session_id, Some(id.to_string()));
        assert_eq!(ack.project.map(|p| p.version), Some("1.0.0".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_or_missing_key_rejects_and_disconnects() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, Some("abc"));

        for key in [None, Some("nope")] {
            let id = state.registry.register(Utc::now()).id;
            let (tx, mut rx) = mpsc::unbounded_channel();

            let flow = handle_message(handshake(key), &state, id, &tx);
            assert_eq!(flow, Flow::Close);
            assert!(
                matches!(rx.try_recv(), Ok(ServerMessage::Connection(ack)) if ack.status == STATUS_UNAUTHORIZED)
            );
            assert!(!state.registry.contains(id));
        }
    }

    #[tokio::test]
    async fn test_get_project_before_handshake_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let id = state.registry.register(Utc::now()).id;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let flow = handle_message(ClientMessage::GetProject { status: 1 }, &state, id, &tx);
        assert_eq!(flow, Flow::Close);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Project { status: STATUS_UNAUTHORIZED, project: None })
        ));
    }

    #[tokio::test]
    async fn test_invalid_status_byte_keeps_session() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, mut rx) = authenticated(&state, None);

        let flow = handle_message(ClientMessage::GetProject { status: 9 }, &state, id, &tx);
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Project { status: STATUS_BAD_REQUEST, project: None })
        ));
        assert!(state.registry.contains(id));
    }

    #[tokio::test]
    async fn test_get_project_serves_tree() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, mut rx) = authenticated(&state, None);

        let flow = handle_message(ClientMessage::GetProject { status: 0 }, &state, id, &tx);
        assert_eq!(flow, Flow::Continue);

        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ServerMessage::Project { status: STATUS_OK, project: Some(project) } = reply else {
            panic!("expected a project payload");
        };
        assert_eq!(project.version, "1.0.0");
        assert!(project.files.iter().any(|f| f.path == "index.js"));
    }

    #[tokio::test]
    async fn test_check_version_reports_manifest_version() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, mut rx) = authenticated(&state, None);

        handle_message(ClientMessage::CheckVersion, &state, id, &tx);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Version { status: STATUS_OK, message: Some(v) }) if v == "1.0.0"
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_reconciles_counter() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, mut rx) = authenticated(&state, None);

        for expected in [5, 6] {
            let flow = handle_message(ClientMessage::Heartbeat { state: 5 }, &state, id, &tx);
            assert_eq!(flow, Flow::Continue);
            assert!(matches!(rx.try_recv(), Ok(ServerMessage::Heartbeat { state }) if state == expected));
        }
    }

    #[tokio::test]
    async fn test_swept_session_is_closed_without_reply() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, mut rx) = authenticated(&state, None);

        let later = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(state.registry.sweep(later, Duration::from_secs(1)), vec![id]);

        let flow = handle_message(ClientMessage::Heartbeat { state: 3 }, &state, id, &tx);
        assert_eq!(flow, Flow::Close);
        assert!(rx.try_recv().is_err());

        let flow = handle_message(ClientMessage::GetProject { status: 1 }, &state, id, &tx);
        assert_eq!(flow, Flow::Close);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_removes_session() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, None);
        let (id, tx, _rx) = authenticated(&state, None);

        let msg = ClientMessage::Disconnect { reason: "bye".to_string() };
        assert_eq!(handle_message(msg, &state, id, &tx), Flow::Close);
        assert!(!state.registry.contains(id));
    }
}

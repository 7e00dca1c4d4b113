//! Event loop tying the transport, the readiness machine and the workers together

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_common::{ClientMessage, ServerMessage, STATUS_BAD_REQUEST};

use crate::actions::ActionRunner;
use crate::connection::{Transport, TransportChannels, TransportEvent};
use crate::state::{ClientRuntimeState, ClientSignal, Directive};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::sync::{UpdateReport, Updater};

/// Results of work spawned off the event loop.
#[derive(Debug)]
enum TaskResult {
    Version { status: u16, message: Option<String> },
    UpdateFinished(Result<UpdateReport, String>),
    ProjectExited(String),
}

enum Input {
    Transport(TransportEvent),
    Server(ServerMessage),
    Task(TaskResult),
}

pub struct ClientRuntime {
    state: ClientRuntimeState,
    transport: Arc<Transport>,
    channels: TransportChannels,
    updater: Arc<Updater>,
    actions: Arc<ActionRunner>,
    supervisor: Arc<Supervisor>,
    signals: mpsc::UnboundedSender<ClientSignal>,
    results_tx: mpsc::UnboundedSender<TaskResult>,
    results_rx: mpsc::UnboundedReceiver<TaskResult>,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_state: Arc<AtomicU64>,
}

impl ClientRuntime {
    pub fn new(
        state: ClientRuntimeState,
        transport: Arc<Transport>,
        channels: TransportChannels,
        updater: Updater,
        actions: ActionRunner,
        supervisor: Arc<Supervisor>,
        signals: mpsc::UnboundedSender<ClientSignal>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            state,
            transport,
            channels,
            updater: Arc::new(updater),
            actions: Arc::new(actions),
            supervisor,
            signals,
            results_tx,
            results_rx,
            heartbeat: None,
            heartbeat_state: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs until `shutdown` resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            let input = tokio::select! {
                Some(event) = self.channels.events.recv() => Input::Transport(event),
                Some(msg) = self.channels.incoming.recv() => Input::Server(msg),
                Some(result) = self.results_rx.recv() => Input::Task(result),
                _ = &mut shutdown => break,
            };

            let directives = match input {
                Input::Transport(event) => {
                    debug!("Transport event: {:?}", event);
                    self.state.on_transport(event)
                }
                Input::Server(msg) => self.on_server_message(msg),
                Input::Task(result) => self.on_task_result(result),
            };

            for directive in directives {
                self.execute(directive);
            }
        }

        self.shutdown().await;
    }

    fn on_server_message(&mut self, msg: ServerMessage) -> Vec<Directive> {
        match msg {
            ServerMessage::Connection(ack) => {
                if let Some(session) = &ack.session_id {
                    debug!("Session {}", session);
                }
                self.state.on_connection(ack)
            }
            ServerMessage::Heartbeat { state } => {
                self.heartbeat_state.store(state, Ordering::SeqCst);
                Vec::new()
            }
            other => {
                debug!("Ignoring unsolicited {} message", other.event());
                Vec::new()
            }
        }
    }

    fn on_task_result(&mut self, result: TaskResult) -> Vec<Directive> {
        match result {
            TaskResult::Version { status, message } => {
                let local = self.updater.local_version().unwrap_or_else(|e| {
                    warn!("Could not read local manifest: {}", e);
                    None
                });
                self.state.on_version(status, message, local.as_deref())
            }
            TaskResult::UpdateFinished(result) => self.state.on_update_finished(result),
            TaskResult::ProjectExited(outcome) => {
                vec![Directive::Signal(ClientSignal::ProjectExited(outcome))]
            }
        }
    }

    fn execute(&mut self, directive: Directive) {
        match directive {
            Directive::StartHeartbeat(interval) => self.start_heartbeat(interval),
            Directive::StopHeartbeat => self.stop_heartbeat(),
            Directive::CloseTransport => self.transport.close(),
            Directive::Signal(signal) => {
                let _ = self.signals.send(signal);
            }
            Directive::CheckVersion => {
                let transport = self.transport.clone();
                let results = self.results_tx.clone();
                tokio::spawn(async move {
                    let result = match transport.request(ClientMessage::CheckVersion).await {
                        Ok(ServerMessage::Version { status, message }) => {
                            TaskResult::Version { status, message }
                        }
                        Ok(other) => {
                            warn!("Unexpected {} reply to checkVersion", other.event());
                            TaskResult::Version { status: STATUS_BAD_REQUEST, message: None }
                        }
                        Err(e) => {
                            warn!("Version check failed: {}", e);
                            TaskResult::Version { status: STATUS_BAD_REQUEST, message: None }
                        }
                    };
                    let _ = results.send(result);
                });
            }
            Directive::Update { status } => {
                let transport = self.transport.clone();
                let updater = self.updater.clone();
                let actions = self.actions.clone();
                let results = self.results_tx.clone();
                let remote = self.state.remote_project().cloned();
                tokio::spawn(async move {
                    let result = match updater.run(&transport, status, remote.as_ref()).await {
                        Ok(outcome) => {
                            let report = actions.run_all(&outcome.packages, &outcome.commands).await;
                            if !report.is_success() {
                                warn!("Post-update actions did not all succeed: {:?}", report);
                            }
                            Ok(outcome.report)
                        }
                        Err(e) => Err(e.to_string()),
                    };
                    let _ = results.send(TaskResult::UpdateFinished(result));
                });
            }
            Directive::StartProject { force } => {
                let supervisor = self.supervisor.clone();
                let results = self.results_tx.clone();
                let status = self.state.project_status();
                tokio::spawn(async move {
                    let outcome = match supervisor.start(status, force).await {
                        Ok(()) => "exited".to_string(),
                        Err(SupervisorError::AlreadyRunning) => {
                            debug!("Project already running");
                            return;
                        }
                        Err(e) => e.to_string(),
                    };
                    let _ = results.send(TaskResult::ProjectExited(outcome));
                });
            }
        }
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        self.stop_heartbeat();
        if interval.is_zero() {
            warn!("Server announced a zero heartbeat interval, heartbeats disabled");
            return;
        }

        let transport = self.transport.clone();
        let counter = self.heartbeat_state.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let state = counter.load(Ordering::SeqCst);
                match transport.request(ClientMessage::Heartbeat { state }).await {
                    Ok(ServerMessage::Heartbeat { state }) => {
                        counter.store(state, Ordering::SeqCst);
                        debug!("Heartbeat acknowledged ({})", state);
                    }
                    Ok(other) => warn!("Unexpected {} reply to heartbeat", other.event()),
                    Err(e) => debug!("Heartbeat failed: {}", e),
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down client");
        self.stop_heartbeat();
        self.transport.close();
        self.supervisor.stop();
        if tokio::time::timeout(Duration::from_secs(5), self.supervisor.wait_idle())
            .await
            .is_err()
        {
            warn!("Project did not stop in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tether_common::{ConnectionAck, ProjectInfo, STATUS_OK};
    use tokio::sync::oneshot;

    use crate::state::Behavior;
    use crate::supervisor::SupervisorSettings;
    use crate::sync::UpdateExecutor;

    struct Harness {
        transport: Arc<Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        incoming: mpsc::UnboundedSender<ServerMessage>,
        signals: mpsc::UnboundedReceiver<ClientSignal>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    }

    fn spawn_runtime(dir: &Path, behavior: Behavior) -> Harness {
        let has_manifest = dir.join("package.json").exists();
        let state = ClientRuntimeState::new(behavior, has_manifest);

        // Never connected: every request fails straight away.
        let transport = Arc::new(Transport::new(Duration::from_millis(100)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let channels = TransportChannels {
            events: events_rx,
            incoming: incoming_rx,
        };

        let updater = Updater::new(
            dir,
            dir.join("package.json"),
            vec![],
            UpdateExecutor::new(dir, Duration::ZERO),
        );
        let actions = ActionRunner::new(dir, "sh".to_string());
        let supervisor = Arc::new(Supervisor::new(SupervisorSettings {
            project_dir: dir.to_path_buf(),
            manifest_path: dir.join("package.json"),
            package_manager: "sh".to_string(),
            start_script: "start".to_string(),
            auto_restart: false,
            restart_delay: Duration::from_millis(10),
        }));

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let runtime = ClientRuntime::new(
            state,
            transport.clone(),
            channels,
            updater,
            actions,
            supervisor,
            signals_tx,
        );

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(runtime.run(async {
            stop_rx.await.ok();
        }));

        Harness {
            transport,
            events: events_tx,
            incoming: incoming_tx,
            signals: signals_rx,
            stop: stop_tx,
            task,
        }
    }

    async fn next_signal(signals: &mut mpsc::UnboundedReceiver<ClientSignal>) -> ClientSignal {
        tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_error_goes_offline_and_closes_transport() {
        let dir = TempDir::new().unwrap();
        let mut harness = spawn_runtime(
            dir.path(),
            Behavior {
                auto_update: true,
                auto_start: true,
                reconnection_attempts: 3,
            },
        );

        harness
            .events
            .send(TransportEvent::ConnectError("refused".to_string()))
            .unwrap();
        assert_eq!(next_signal(&mut harness.signals).await, ClientSignal::Unready);
        assert!(harness.transport.is_closed());

        harness.stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), harness.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_version_check_releases_project() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"demo","version":"1.0.0"}"#,
        )
        .unwrap();
        let mut harness = spawn_runtime(
            dir.path(),
            Behavior {
                auto_update: true,
                auto_start: false,
                reconnection_attempts: 3,
            },
        );

        harness.events.send(TransportEvent::Connect).unwrap();
        harness
            .incoming
            .send(ServerMessage::Connection(ConnectionAck {
                status: STATUS_OK,
                message: None,
                heartbeat_interval: 60_000,
                session_id: Some("s-1".to_string()),
                project: Some(ProjectInfo {
                    name: "demo".to_string(),
                    description: None,
                    version: "1.1.0".to_string(),
                }),
            }))
            .unwrap();

        assert_eq!(next_signal(&mut harness.signals).await, ClientSignal::Ready);
        // The version request cannot be sent, which counts as a failed check.
        assert_eq!(next_signal(&mut harness.signals).await, ClientSignal::Start);
        assert!(!harness.transport.is_closed());

        harness.stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), harness.task)
            .await
            .unwrap()
            .unwrap();
        assert!(harness.transport.is_closed());
    }
}

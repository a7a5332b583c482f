//! OpenVPN process tunnel
//!
//! Runs the `openvpn` binary against the negotiated session config and
//! follows it through the management interface. Two background tasks live
//! as long as the process:
//!
//! - the supervisor waits for the process to exit (or for a stop request),
//!   publishes the exit outcome and emits `Exiting`
//! - the management task accepts the process's management connection,
//!   enables state and byte-count notifications and relays them
//!
//! Dropping a started tunnel requests the same stop as [`Tunnel::stop`].

use super::management::{Notification, parse_line, startup_commands};
use super::{Tunnel, TunnelError, TunnelEventSink, TunnelFactory, TunnelState};
use crate::identity::Identity;
use crate::session::SessionDescriptor;
use crate::stats::{
    CompositeStatsHandler, SessionStatsHandler, SessionStatsKeeper, StatsReporter, StatsSaver,
    StatsSender,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

const CONFIG_FILE: &str = "client.ovpn";

#[derive(Debug, Clone)]
pub struct OpenVpnSettings {
    /// Path or name of the openvpn binary
    pub binary: String,
    /// Directory for the generated client config
    pub runtime_dir: PathBuf,
    /// Byte-count notification period; 0 disables them
    pub bytecount_interval_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct ProcessExit {
    code: Option<i32>,
    success: bool,
    requested: bool,
}

/// Tunnel factory producing [`OpenVpnTunnel`]s.
///
/// Byte counts of each session are saved on `stats_keeper` and, when a
/// reporter is given, sent to it under the session id.
pub fn openvpn_tunnel_factory(
    settings: OpenVpnSettings,
    stats_keeper: Arc<dyn SessionStatsKeeper>,
    stats_reporter: Option<Arc<dyn StatsReporter>>,
) -> TunnelFactory {
    Arc::new(
        move |session: &SessionDescriptor,
              identity: &Identity,
              events: TunnelEventSink|
              -> Result<Box<dyn Tunnel>, TunnelError> {
            let saver: Arc<dyn SessionStatsHandler> =
                Arc::new(StatsSaver::new(stats_keeper.clone()));
            let mut handlers = vec![saver];
            if let Some(reporter) = &stats_reporter {
                handlers.push(Arc::new(StatsSender::new(reporter.clone(), session.id.as_str())));
            }
            let tunnel = OpenVpnTunnel::new(
                settings.clone(),
                session,
                identity,
                events,
                Arc::new(CompositeStatsHandler::new(handlers)),
            )?;
            Ok(Box::new(tunnel))
        },
    )
}

pub struct OpenVpnTunnel {
    settings: OpenVpnSettings,
    session_id: String,
    config: String,
    identity: Identity,
    events: TunnelEventSink,
    stats_handler: Arc<dyn SessionStatsHandler>,
    started: AtomicBool,
    stop_requested: Arc<Notify>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
}

impl OpenVpnTunnel {
    pub fn new(
        settings: OpenVpnSettings,
        session: &SessionDescriptor,
        identity: &Identity,
        events: TunnelEventSink,
        stats_handler: Arc<dyn SessionStatsHandler>,
    ) -> Result<Self, TunnelError> {
        if session.config.trim().is_empty() {
            return Err(TunnelError::InvalidConfig(format!(
                "session {} has an empty config",
                session.id
            )));
        }

        let (exit, _) = watch::channel(None);
        Ok(Self {
            settings,
            session_id: session.id.clone(),
            config: session.config.clone(),
            identity: identity.clone(),
            events,
            stats_handler,
            started: AtomicBool::new(false),
            stop_requested: Arc::new(Notify::new()),
            exit: Arc::new(exit),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.settings.runtime_dir.join(CONFIG_FILE)
    }

    async fn launch(&self) -> Result<(), TunnelError> {
        tokio::fs::create_dir_all(&self.settings.runtime_dir).await?;
        let config_path = self.config_path();
        tokio::fs::write(&config_path, &self.config).await?;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!("Management interface listening on port {}", port);

        let child = Command::new(&self.settings.binary)
            .arg("--config")
            .arg(&config_path)
            .args(["--management", "127.0.0.1"])
            .arg(port.to_string())
            .args(["--management-client", "--management-hold"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Launch {
                binary: self.settings.binary.clone(),
                source,
            })?;

        info!(
            "Started {} (pid {:?}) for session {} as {}",
            self.settings.binary,
            child.id(),
            self.session_id,
            self.identity
        );

        tokio::spawn(supervise(
            child,
            self.stop_requested.clone(),
            self.exit.clone(),
            self.events.clone(),
        ));
        tokio::spawn(run_management(
            listener,
            self.exit.subscribe(),
            self.events.clone(),
            self.stats_handler.clone(),
            self.settings.bytecount_interval_secs,
        ));

        Ok(())
    }
}

#[async_trait]
impl Tunnel for OpenVpnTunnel {
    async fn start(&self) -> Result<(), TunnelError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyStarted);
        }

        let result = self.launch().await;
        if let Err(e) = &result {
            error!("Failed to start tunnel for session {}: {}", self.session_id, e);
            self.started.store(false, Ordering::Release);
        }
        result
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(TunnelError::NotStarted);
        }
        debug!("Stop requested for session {}", self.session_id);
        self.stop_requested.notify_one();
        Ok(())
    }

    async fn wait(&self) -> Result<(), TunnelError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(TunnelError::NotStarted);
        }

        let mut exit = self.exit.subscribe();
        let outcome = wait_for_exit(&mut exit).await;
        match outcome {
            Some(exit) if exit.success || exit.requested => Ok(()),
            Some(exit) => Err(TunnelError::Exited(exit.code)),
            None => Err(TunnelError::Exited(None)),
        }
    }
}

impl Drop for OpenVpnTunnel {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && self.exit.borrow().is_none() {
            debug!("Tunnel for session {} dropped while running", self.session_id);
            self.stop_requested.notify_one();
        }
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    match exit.wait_for(|e| e.is_some()).await {
        Ok(outcome) => *outcome,
        Err(_) => None,
    }
}

async fn supervise(
    mut child: Child,
    stop_requested: Arc<Notify>,
    exit: Arc<watch::Sender<Option<ProcessExit>>>,
    events: TunnelEventSink,
) {
    let mut requested = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_requested.notified() => {
            requested = true;
            info!("Stopping tunnel process");
            if let Err(e) = terminate(&mut child) {
                warn!("Graceful stop failed: {} (killing)", e);
                let _ = child.start_kill();
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => {
            info!("Tunnel process exited: {}", status);
            ProcessExit {
                code: status.code(),
                success: status.success(),
                requested,
            }
        }
        Err(e) => {
            error!("Failed to wait for tunnel process: {}", e);
            ProcessExit {
                code: None,
                success: false,
                requested,
            }
        }
    };

    exit.send_replace(Some(outcome));
    events.emit(TunnelState::Exiting).await;
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<(), TunnelError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = child.id().ok_or(TunnelError::NotStarted)?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| TunnelError::Signal(e.to_string()))
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<(), TunnelError> {
    child.start_kill().map_err(TunnelError::from)
}

async fn run_management(
    listener: TcpListener,
    mut exit: watch::Receiver<Option<ProcessExit>>,
    events: TunnelEventSink,
    stats_handler: Arc<dyn SessionStatsHandler>,
    bytecount_interval_secs: u64,
) {
    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                debug!("Management connection from {}", peer);
                stream
            }
            Err(e) => {
                error!("Management accept failed: {}", e);
                return;
            }
        },
        _ = wait_for_exit(&mut exit) => {
            debug!("Tunnel process exited before connecting to management");
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();
    for command in startup_commands(bytecount_interval_secs) {
        if let Err(e) = writer.write_all(format!("{}\n", command).as_bytes()).await {
            warn!("Failed to send management command '{}': {}", command, e);
            return;
        }
    }

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&line, &events, stats_handler.as_ref()).await,
            Ok(None) => {
                debug!("Management connection closed");
                break;
            }
            Err(e) => {
                warn!("Management read error: {}", e);
                break;
            }
        }
    }
}

async fn handle_line(line: &str, events: &TunnelEventSink, stats_handler: &dyn SessionStatsHandler) {
    match parse_line(line) {
        Ok(Some(Notification::State(state))) => {
            debug!("Tunnel process state: {:?}", state);
            if let Some(event) = state.tunnel_state() {
                events.emit(event).await;
            }
        }
        Ok(Some(Notification::ByteCount(stats))) => {
            if let Err(e) = stats_handler.handle(stats).await {
                warn!("{}", e);
            }
        }
        Ok(None) => debug!("Management: {}", line),
        Err(e) => warn!("Ignoring management line: {}", e),
    }
}

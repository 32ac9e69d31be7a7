use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::clock::MonotonicClock;
use crate::config::{self, AppConfig};
use crate::discovery::{DiscoveryError, DiscoveryListener, DiscoveryOutcome, DiscoverySettings};
use crate::dispatch::Dispatcher;
use crate::logging::{LogLevel, Logger};
use crate::server::{ServerError, TcpControlServer};

const LOG_CONTEXT: &str = "agent::lifecycle";

/// How often the serving loop checks for a close or shutdown request.
pub const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Flags shared by discovery, the dispatcher and the signal hooks.
///
/// `close_requested` is set by CLOSE actions and is sticky across discovery.
/// `shutdown_requested` is set by SIGINT/SIGTERM and also ends discovery.
#[derive(Debug)]
pub struct AgentState {
    close_requested: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    update_in_progress: AtomicBool,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            close_requested: Arc::new(AtomicBool::new(false)),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            update_in_progress: AtomicBool::new(false),
        }
    }

    pub fn close_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.close_requested)
    }

    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_requested)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Marks an update as running until the returned guard drops. `None`
    /// while another update holds the mark.
    pub fn try_begin_update(&self) -> Option<UpdateGuard<'_>> {
        self.update_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| UpdateGuard { state: self })
    }

    #[cfg(test)]
    pub fn is_update_in_progress(&self) -> bool {
        self.update_in_progress.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct UpdateGuard<'a> {
    state: &'a AgentState,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.state.update_in_progress.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSettings {
    pub discovery_timeout: Duration,
    pub broadcast_port: u16,
    pub discovery: DiscoverySettings,
    pub control_host: String,
    pub control_port: u16,
    pub max_connections: u32,
}

impl AgentSettings {
    pub fn from_config(value: &AppConfig) -> Self {
        Self {
            discovery_timeout: Duration::from_millis(
                u64::try_from(value.discovery.timeout_ms)
                    .unwrap_or(config::DEFAULT_BROADCAST_TIMEOUT_MS as u64),
            ),
            broadcast_port: u16::try_from(value.discovery.broadcast_port)
                .unwrap_or(config::DEFAULT_BROADCAST_PORT as u16),
            discovery: DiscoverySettings::from_config(&value.discovery),
            control_host: value.server.host.clone(),
            control_port: u16::try_from(value.server.port)
                .unwrap_or(config::DEFAULT_CONTROL_PORT as u16),
            max_connections: u32::try_from(value.server.max_connections)
                .unwrap_or(config::DEFAULT_MAX_CONNECTIONS as u32),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Woken by `wake_peer`; the control server ran until a close request.
    Served { wake_peer: SocketAddr },
    /// No wake signal before the deadline.
    Standalone,
    /// A shutdown signal ended discovery; no server was started.
    Interrupted,
}

#[derive(Debug)]
pub enum AgentError {
    Discovery(DiscoveryError),
    Server(ServerError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery(error) => write!(f, "discovery failed: {error}"),
            Self::Server(error) => write!(f, "control server failed: {error}"),
        }
    }
}

impl std::error::Error for AgentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Discovery(error) => Some(error),
            Self::Server(error) => Some(error),
        }
    }
}

impl From<DiscoveryError> for AgentError {
    fn from(value: DiscoveryError) -> Self {
        Self::Discovery(value)
    }
}

impl From<ServerError> for AgentError {
    fn from(value: ServerError) -> Self {
        Self::Server(value)
    }
}

pub struct Agent {
    settings: AgentSettings,
    state: Arc<AgentState>,
    clock: Arc<dyn MonotonicClock>,
    dispatcher: Arc<dyn Dispatcher>,
    logger: Arc<Logger>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        state: Arc<AgentState>,
        clock: Arc<dyn MonotonicClock>,
        dispatcher: Arc<dyn Dispatcher>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            settings,
            state,
            clock,
            dispatcher,
            logger,
        }
    }

    /// Waits for a wake signal, then serves control sessions until a close
    /// request arrives over either channel or from a signal.
    pub fn run(&self) -> Result<AgentOutcome, AgentError> {
        let wake_peer = match self.discover()? {
            DiscoveryOutcome::Found(peer) => peer,
            DiscoveryOutcome::Interrupted => return Ok(AgentOutcome::Interrupted),
            DiscoveryOutcome::Error(error) => return Err(error.into()),
            DiscoveryOutcome::TimedOut => {
                self.logger.info(
                    Some(LOG_CONTEXT),
                    "No wake signal received, continuing standalone",
                );
                return Ok(AgentOutcome::Standalone);
            }
        };

        let mut server =
            TcpControlServer::new(Arc::clone(&self.dispatcher), Arc::clone(&self.logger));
        server.configure(
            &self.settings.control_host,
            i64::from(self.settings.control_port),
            i64::from(self.settings.max_connections),
        )?;
        server.start()?;

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Serving control sessions",
            Some(json!({
                "wake_peer": wake_peer.to_string(),
                "control_addr": server.local_addr().map(|addr| addr.to_string()),
            })),
        );

        while !self.state.is_close_requested() && !self.state.is_shutdown_requested() {
            thread::sleep(CLOSE_POLL_INTERVAL);
        }

        let reason = if self.state.is_shutdown_requested() {
            "Shutdown"
        } else {
            "Close"
        };
        self.logger.info(
            Some(LOG_CONTEXT),
            &format!(
                "{reason} requested, stopping control server with {} open session(s)",
                server.connection_count()
            ),
        );
        server.stop()?;
        Ok(AgentOutcome::Served { wake_peer })
    }

    fn discover(&self) -> Result<DiscoveryOutcome, AgentError> {
        let mut listener = DiscoveryListener::new(
            self.settings.discovery.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.logger),
            self.state.close_flag(),
        )
        .with_shutdown_flag(self.state.shutdown_flag());
        listener.start(self.settings.broadcast_port)?;

        let outcome = listener.listen_for_wake_signal(self.settings.discovery_timeout);
        listener.stop();
        Ok(outcome)
    }
}

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::clock::MonotonicClock;
use crate::config;
use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{self, ActionCode, ACTION_MESSAGE_SIZE_BYTES};

pub const RECEIVE_BUFFER_BYTES: usize = 200;

const LOG_CONTEXT: &str = "discovery::listener";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub bind_host: String,
    pub poll_interval: Duration,
    /// Destination port for the wake acknowledgement; `0` answers the
    /// sender's observed port.
    pub ack_port: u16,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_owned(),
            poll_interval: Duration::from_millis(config::DEFAULT_POLL_INTERVAL_MS as u64),
            ack_port: 0,
        }
    }
}

impl DiscoverySettings {
    /// Expects a sanitised configuration; out-of-range values fall back to
    /// the defaults instead of failing.
    pub fn from_config(value: &config::DiscoveryConfig) -> Self {
        let defaults = Self::default();
        Self {
            bind_host: value.bind_host.clone(),
            poll_interval: u64::try_from(value.poll_interval_ms)
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            ack_port: u16::try_from(value.ack_port).unwrap_or(defaults.ack_port),
        }
    }
}

#[derive(Debug)]
pub enum DiscoveryError {
    PortNotSet,
    InvalidBindHost { host: String },
    AlreadyStarted,
    NotStarted,
    Bind { address: SocketAddr, source: io::Error },
    SocketSetup { source: io::Error },
    Receive { source: io::Error },
    AckSend { address: SocketAddr, source: io::Error },
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortNotSet => write!(f, "broadcast port is not set"),
            Self::InvalidBindHost { host } => {
                write!(f, "discovery bind host '{host}' is not an IP address")
            }
            Self::AlreadyStarted => write!(f, "discovery listener is already started"),
            Self::NotStarted => write!(f, "discovery listener is not started"),
            Self::Bind { address, source } => {
                write!(f, "failed to bind discovery socket on {address}: {source}")
            }
            Self::SocketSetup { source } => {
                write!(f, "failed to configure discovery socket: {source}")
            }
            Self::Receive { source } => write!(f, "discovery receive failed: {source}"),
            Self::AckSend { address, source } => {
                write!(f, "failed to send wake acknowledgement to {address}: {source}")
            }
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. }
            | Self::SocketSetup { source }
            | Self::Receive { source }
            | Self::AckSend { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum DiscoveryOutcome {
    /// A wake signal arrived from this address and was acknowledged.
    Found(SocketAddr),
    TimedOut,
    /// A shutdown signal arrived before the deadline.
    Interrupted,
    Error(DiscoveryError),
}

pub struct DiscoveryListener {
    settings: DiscoverySettings,
    clock: Arc<dyn MonotonicClock>,
    logger: Arc<Logger>,
    close_requested: Arc<AtomicBool>,
    shutdown_requested: Arc<AtomicBool>,
    socket: Option<UdpSocket>,
}

impl DiscoveryListener {
    pub fn new(
        settings: DiscoverySettings,
        clock: Arc<dyn MonotonicClock>,
        logger: Arc<Logger>,
        close_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            clock,
            logger,
            close_requested,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            socket: None,
        }
    }

    /// Ends `listen_for_wake_signal` within one poll interval once `flag`
    /// is set.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_requested = flag;
        self
    }

    pub fn start(&mut self, broadcast_port: u16) -> Result<(), DiscoveryError> {
        if self.socket.is_some() {
            return Err(DiscoveryError::AlreadyStarted);
        }
        if broadcast_port == 0 {
            return Err(DiscoveryError::PortNotSet);
        }

        let host: IpAddr = self.settings.bind_host.parse().map_err(|_| {
            DiscoveryError::InvalidBindHost {
                host: self.settings.bind_host.clone(),
            }
        })?;
        let address = SocketAddr::new(host, broadcast_port);

        let socket =
            UdpSocket::bind(address).map_err(|source| DiscoveryError::Bind { address, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| DiscoveryError::SocketSetup { source })?;
        socket
            .set_read_timeout(Some(self.settings.poll_interval))
            .map_err(|source| DiscoveryError::SocketSetup { source })?;

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Listening for wake signal",
            Some(json!({
                "address": address.to_string(),
                "poll_interval_ms": self.settings.poll_interval.as_millis() as u64,
            })),
        );
        self.socket = Some(socket);
        Ok(())
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn listen_for_wake_signal(&mut self, deadline: Duration) -> DiscoveryOutcome {
        let Some(socket) = self.socket.as_ref() else {
            return DiscoveryOutcome::Error(DiscoveryError::NotStarted);
        };

        let deadline_ms = deadline.as_millis() as u64;
        let started_ms = self.clock.now_ms();
        let mut buffer = [0_u8; RECEIVE_BUFFER_BYTES];

        while self.clock.now_ms().saturating_sub(started_ms) <= deadline_ms {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                self.logger.info(
                    Some(LOG_CONTEXT),
                    "Shutdown requested, abandoning wake signal wait",
                );
                return DiscoveryOutcome::Interrupted;
            }

            let (size, peer) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(source) => {
                    self.logger.error(
                        Some(LOG_CONTEXT),
                        &format!("Receive failed while waiting for wake signal: {source}"),
                    );
                    return DiscoveryOutcome::Error(DiscoveryError::Receive { source });
                }
            };

            if size == 0 {
                continue;
            }
            if size < ACTION_MESSAGE_SIZE_BYTES {
                self.logger.verbose(
                    Some(LOG_CONTEXT),
                    &format!("Discarded {size}-byte datagram from {peer}"),
                );
                continue;
            }

            match codec::decode_action(&buffer[..size]) {
                Ok(ActionCode::BootInterrupt) => {
                    return match Self::acknowledge(socket, peer, self.settings.ack_port) {
                        Ok(ack_address) => {
                            self.logger.info(
                                Some(LOG_CONTEXT),
                                &format!("Wake signal from {peer}, acknowledged to {ack_address}"),
                            );
                            DiscoveryOutcome::Found(peer)
                        }
                        Err(error) => {
                            self.logger.error(Some(LOG_CONTEXT), &error.to_string());
                            DiscoveryOutcome::Error(error)
                        }
                    };
                }
                Ok(ActionCode::Close) => {
                    self.close_requested.store(true, Ordering::SeqCst);
                    self.logger
                        .info(Some(LOG_CONTEXT), &format!("Close requested by {peer}"));
                }
                Ok(other) => {
                    self.logger.debug(
                        Some(LOG_CONTEXT),
                        &format!("Ignored {other} broadcast from {peer}"),
                    );
                }
                Err(error) => {
                    self.logger.verbose(
                        Some(LOG_CONTEXT),
                        &format!("Discarded invalid datagram from {peer}: {error}"),
                    );
                }
            }
        }

        self.logger.info(
            Some(LOG_CONTEXT),
            &format!("No wake signal within {deadline_ms}ms"),
        );
        DiscoveryOutcome::TimedOut
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            self.logger
                .debug(Some(LOG_CONTEXT), "Discovery socket released");
        }
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.socket.is_some()
    }

    fn acknowledge(
        socket: &UdpSocket,
        peer: SocketAddr,
        ack_port: u16,
    ) -> Result<SocketAddr, DiscoveryError> {
        let port = if ack_port == 0 { peer.port() } else { ack_port };
        let address = SocketAddr::new(peer.ip(), port);

        socket
            .set_broadcast(false)
            .map_err(|source| DiscoveryError::SocketSetup { source })?;
        socket
            .send_to(&codec::encode_ack(ActionCode::BootInterrupt), address)
            .map_err(|source| DiscoveryError::AckSend { address, source })?;
        Ok(address)
    }
}

use std::fmt;
use std::io::{self, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::dispatch::Dispatcher;
use crate::logging::{LogLevel, Logger};
use crate::registry::{Connection, ConnectionRegistry};
use crate::wire::codec::{self, ActionCode, DecodedMessage};
use crate::wire::framer::FrameAccumulator;

pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);
pub const READ_BUFFER_BYTES: usize = 1_024;
/// Control sessions only carry Action messages, so a much smaller bound than
/// the largest encodable frame is enough.
pub const MAX_INBOUND_BUFFER_BYTES: usize = 64 * 1_024;

const LOG_CONTEXT: &str = "server::control";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Unconfigured,
    Configured,
    Serving,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct ServerSettings {
    bind_address: Option<IpAddr>,
    port: Option<u16>,
    max_connections: usize,
}

#[derive(Debug)]
pub enum ServerError {
    InvalidAddress { address: String },
    InvalidPort { port: i64 },
    InvalidMaxConnections { value: i64 },
    NotConfigured,
    AddressNotSet,
    PortNotSet,
    AlreadyStarted,
    Bind { address: SocketAddr, source: io::Error },
    Listen { source: io::Error },
    Spawn { source: io::Error },
    JoinFailed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { address } => {
                write!(f, "'{address}' is not a valid IPv4 or IPv6 address")
            }
            Self::InvalidPort { port } => {
                write!(f, "control port {port} is outside 1-65535")
            }
            Self::InvalidMaxConnections { value } => {
                write!(f, "max connections must be at least 1, got {value}")
            }
            Self::NotConfigured => write!(f, "control server is not configured"),
            Self::AddressNotSet => write!(f, "control server bind address is not set"),
            Self::PortNotSet => write!(f, "control server port is not set"),
            Self::AlreadyStarted => write!(f, "control server is already started"),
            Self::Bind { address, source } => {
                write!(f, "failed to bind control server on {address}: {source}")
            }
            Self::Listen { source } => {
                write!(f, "failed to put control listener into polling mode: {source}")
            }
            Self::Spawn { source } => write!(f, "failed to spawn acceptor thread: {source}"),
            Self::JoinFailed => write!(f, "control server thread join failed"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } | Self::Listen { source } | Self::Spawn { source } => {
                Some(source)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SendError {
    UnknownConnection { connection_id: u64 },
    Closed { connection_id: u64 },
    Io { connection_id: u64, source: io::Error },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConnection { connection_id } => {
                write!(f, "connection {connection_id} is not registered")
            }
            Self::Closed { connection_id } => write!(f, "connection {connection_id} is closed"),
            Self::Io {
                connection_id,
                source,
            } => write!(f, "failed to write to connection {connection_id}: {source}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// State shared between the server handle, the acceptor and every worker.
struct Shared {
    registry: ConnectionRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    logger: Arc<Logger>,
    stop_requested: AtomicBool,
    max_connections: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn send_buffer_to_client(&self, connection_id: u64, bytes: &[u8]) -> Result<usize, SendError> {
        let connection = self
            .registry
            .get(connection_id)
            .map_err(|_| SendError::UnknownConnection { connection_id })?;

        connection.send(bytes).map_err(|source| {
            if connection.is_closed() {
                SendError::Closed { connection_id }
            } else {
                SendError::Io {
                    connection_id,
                    source,
                }
            }
        })
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(error) = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_nodelay(true))
        {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!("Dropping connection from {peer_addr}: socket setup failed: {error}"),
            );
            return;
        }

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("Dropping connection from {peer_addr}: stream clone failed: {error}"),
                );
                return;
            }
        };

        let connection = match self
            .registry
            .register(stream, peer_addr, self.max_connections)
        {
            Ok(connection) => connection,
            Err(error) => {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("Refused connection from {peer_addr}: {error}"),
                );
                let _ = reader.shutdown(Shutdown::Both);
                return;
            }
        };

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Control session opened",
            Some(json!({
                "connection_id": connection.id(),
                "peer_addr": peer_addr.to_string(),
                "active_connections": self.registry.count(),
            })),
        );

        let shared = Arc::clone(self);
        let worker_connection = Arc::clone(&connection);
        let spawned = thread::Builder::new()
            .name(format!("control-worker-{}", connection.id()))
            .spawn(move || shared.serve(worker_connection, reader));

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock().expect("worker handles lock poisoned");
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
            }
            Err(error) => {
                self.logger.error(
                    Some(LOG_CONTEXT),
                    &format!(
                        "Failed to spawn worker for connection {}: {error}",
                        connection.id()
                    ),
                );
                self.registry.remove(connection.id());
                connection.close();
            }
        }
    }

    fn serve(&self, connection: Arc<Connection>, mut reader: TcpStream) {
        let connection_id = connection.id();
        let mut framer = FrameAccumulator::with_limit(MAX_INBOUND_BUFFER_BYTES);
        let mut buffer = [0_u8; READ_BUFFER_BYTES];

        loop {
            let size = match reader.read(&mut buffer) {
                Ok(0) => {
                    if !connection.is_closed() {
                        self.logger.info(
                            Some(LOG_CONTEXT),
                            &format!("Connection {connection_id} closed by peer"),
                        );
                    }
                    break;
                }
                Ok(size) => size,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    if !connection.is_closed() && !self.stop_requested.load(Ordering::SeqCst) {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!("Read from connection {connection_id} failed: {error}"),
                        );
                    }
                    break;
                }
            };

            connection.record_received(size);
            if let Err(error) = framer.push(&buffer[..size]) {
                self.logger.warn(
                    Some(LOG_CONTEXT),
                    &format!("Connection {connection_id} buffer reset: {error}"),
                );
                continue;
            }

            while let Some(frame) = framer.next_frame() {
                let decoded = frame.and_then(|bytes| {
                    let message = codec::decode(&bytes)?;
                    Ok((message, bytes))
                });
                match decoded {
                    Ok((DecodedMessage::Action(action), bytes)) => {
                        self.handle_action(connection_id, action, &bytes);
                    }
                    Ok((other, _)) => {
                        self.logger.debug(
                            Some(LOG_CONTEXT),
                            &format!(
                                "Ignored non-action message on connection \
                                 {connection_id}: {other:?}"
                            ),
                        );
                    }
                    Err(error) => {
                        self.logger.verbose(
                            Some(LOG_CONTEXT),
                            &format!("Discarded bytes on connection {connection_id}: {error}"),
                        );
                    }
                }
            }
        }

        self.registry.remove(connection_id);
        connection.close();
        let snapshot = connection.snapshot();
        self.logger.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "Control session ended",
            Some(json!({
                "connection_id": snapshot.connection_id,
                "peer_addr": snapshot.peer_addr.to_string(),
                "connected_at": snapshot.connected_at.to_rfc3339(),
                "bytes_received": snapshot.bytes_received,
                "bytes_written": snapshot.bytes_written,
            })),
        );
    }

    fn handle_action(&self, connection_id: u64, action: ActionCode, payload: &[u8]) {
        let Some(response) = self.dispatcher.dispatch(connection_id, action, payload) else {
            return;
        };

        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                self.logger.error(
                    Some(LOG_CONTEXT),
                    &format!(
                        "Could not encode {action} response for connection {connection_id}: {error}"
                    ),
                );
                return;
            }
        };

        if let Err(error) = self.send_buffer_to_client(connection_id, &bytes) {
            self.logger
                .warn(Some(LOG_CONTEXT), &format!("{action} response dropped: {error}"));
        }
    }
}

pub struct TcpControlServer {
    state: ServerState,
    settings: Option<ServerSettings>,
    dispatcher: Arc<dyn Dispatcher>,
    logger: Arc<Logger>,
    shared: Option<Arc<Shared>>,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpControlServer {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, logger: Arc<Logger>) -> Self {
        Self {
            state: ServerState::Unconfigured,
            settings: None,
            dispatcher,
            logger,
            shared: None,
            acceptor: None,
            local_addr: None,
        }
    }

    /// Validates and stores the listening parameters. An empty address or a
    /// zero port is accepted here and reported by [`TcpControlServer::start`].
    pub fn configure(
        &mut self,
        bind_address: &str,
        port: i64,
        max_connections: i64,
    ) -> Result<(), ServerError> {
        if matches!(self.state, ServerState::Serving | ServerState::Stopping) {
            return Err(ServerError::AlreadyStarted);
        }

        let trimmed = bind_address.trim();
        let bind_address = if trimmed.is_empty() {
            None
        } else {
            Some(
                trimmed
                    .parse::<IpAddr>()
                    .map_err(|_| ServerError::InvalidAddress {
                        address: trimmed.to_owned(),
                    })?,
            )
        };

        let port = match port {
            0 => None,
            1..=65_535 => Some(port as u16),
            _ => return Err(ServerError::InvalidPort { port }),
        };

        if max_connections < 1 {
            return Err(ServerError::InvalidMaxConnections {
                value: max_connections,
            });
        }

        self.settings = Some(ServerSettings {
            bind_address,
            port,
            max_connections: usize::try_from(max_connections).unwrap_or(usize::MAX),
        });
        self.state = ServerState::Configured;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), ServerError> {
        let settings = match self.state {
            ServerState::Unconfigured => return Err(ServerError::NotConfigured),
            ServerState::Serving | ServerState::Stopping => {
                return Err(ServerError::AlreadyStarted)
            }
            ServerState::Configured | ServerState::Stopped => {
                self.settings.clone().ok_or(ServerError::NotConfigured)?
            }
        };
        let host = settings.bind_address.ok_or(ServerError::AddressNotSet)?;
        let port = settings.port.ok_or(ServerError::PortNotSet)?;
        let address = SocketAddr::new(host, port);

        let listener =
            TcpListener::bind(address).map_err(|source| ServerError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Listen { source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Listen { source })?;

        let shared = Arc::new(Shared {
            registry: ConnectionRegistry::new(),
            dispatcher: Arc::clone(&self.dispatcher),
            logger: Arc::clone(&self.logger),
            stop_requested: AtomicBool::new(false),
            max_connections: settings.max_connections,
            workers: Mutex::new(Vec::new()),
        });

        let acceptor_shared = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name("control-acceptor".to_owned())
            .spawn(move || accept_loop(listener, acceptor_shared))
            .map_err(|source| ServerError::Spawn { source })?;

        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Control server listening",
            Some(json!({
                "address": local_addr.to_string(),
                "max_connections": settings.max_connections,
            })),
        );

        self.shared = Some(shared);
        self.acceptor = Some(acceptor);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Serving;
        Ok(())
    }

    /// Stops accepting, sends every live session a CLOSE notice, shuts the
    /// sockets down and waits for all workers. Safe to call more than once.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Serving {
            return Ok(());
        }
        self.state = ServerState::Stopping;

        let Some(shared) = self.shared.take() else {
            self.state = ServerState::Stopped;
            return Ok(());
        };
        shared.stop_requested.store(true, Ordering::SeqCst);

        let mut join_failed = false;
        if let Some(acceptor) = self.acceptor.take() {
            join_failed |= acceptor.join().is_err();
        }

        let notice = codec::encode_action(ActionCode::Close);
        let connections = shared.registry.drain();
        let notified = connections
            .iter()
            .filter(|connection| connection.close_with_notice(Some(notice.as_slice())))
            .count();

        let workers: Vec<JoinHandle<()>> = shared
            .workers
            .lock()
            .expect("worker handles lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            join_failed |= worker.join().is_err();
        }

        self.local_addr = None;
        self.state = ServerState::Stopped;
        self.logger.info(
            Some(LOG_CONTEXT),
            &format!("Control server stopped, {notified} session(s) notified"),
        );

        if join_failed {
            Err(ServerError::JoinFailed)
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub fn send_buffer_to_client(
        &self,
        connection_id: u64,
        bytes: &[u8],
    ) -> Result<usize, SendError> {
        match &self.shared {
            Some(shared) => shared.send_buffer_to_client(connection_id, bytes),
            None => Err(SendError::UnknownConnection { connection_id }),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.registry.count())
    }

    #[cfg(test)]
    pub fn connection_ids(&self) -> Vec<u64> {
        self.shared.as_ref().map_or_else(Vec::new, |shared| {
            shared
                .registry
                .snapshots()
                .into_iter()
                .map(|snapshot| snapshot.connection_id)
                .collect()
        })
    }
}

impl Drop for TcpControlServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stop_requested.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => shared.admit(stream, peer_addr),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                shared
                    .logger
                    .warn(Some(LOG_CONTEXT), &format!("Accept failed: {error}"));
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::testing::{free_tcp_port, read_message};
    use super::{SendError, ServerError, ServerState, TcpControlServer};
    use crate::dispatch::Dispatcher;
    use crate::logging::testing::{memory_logger, MemorySink};
    use crate::wire::codec::{self, ActionCode, ActionStatus, DecodedMessage, Response};

    /// Answers every action except CLOSE with the connection id as data.
    struct EchoDispatcher;

    impl Dispatcher for EchoDispatcher {
        fn dispatch(
            &self,
            connection_id: u64,
            action: ActionCode,
            _payload: &[u8],
        ) -> Option<Response> {
            (action != ActionCode::Close)
                .then(|| Response::success(action, connection_id.to_le_bytes().to_vec()))
        }
    }

    fn serving(max_connections: i64) -> (TcpControlServer, Arc<MemorySink>) {
        let (logger, sink) = memory_logger();
        let mut server = TcpControlServer::new(Arc::new(EchoDispatcher), logger);
        server
            .configure("127.0.0.1", i64::from(free_tcp_port()), max_connections)
            .expect("server should configure");
        server.start().expect("server should start");
        (server, sink)
    }

    fn connect(server: &TcpControlServer) -> TcpStream {
        let stream = TcpStream::connect(server.local_addr().expect("server should be bound"))
            .expect("client should connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("client timeout should apply");
        stream
    }

    fn wait_for_connections(server: &TcpControlServer, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.connection_count() != expected {
            assert!(Instant::now() < deadline, "expected {expected} connections");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn configure_validates_address_port_and_limit() {
        let (logger, _sink) = memory_logger();
        let mut server = TcpControlServer::new(Arc::new(EchoDispatcher), logger);

        assert!(matches!(
            server.configure("300.1.1.1", 5801, 3),
            Err(ServerError::InvalidAddress { .. })
        ));
        assert!(matches!(
            server.configure("127.0.0.1", 99_999, 3),
            Err(ServerError::InvalidPort { port: 99_999 })
        ));
        assert!(matches!(
            server.configure("::1", 5801, 0),
            Err(ServerError::InvalidMaxConnections { value: 0 })
        ));
        assert_eq!(server.state(), ServerState::Unconfigured);

        server
            .configure("::1", 5801, 1)
            .expect("IPv6 address should be accepted");
        assert_eq!(server.state(), ServerState::Configured);
    }

    #[test]
    fn start_reports_each_missing_setting() {
        let (logger, _sink) = memory_logger();
        let mut server = TcpControlServer::new(Arc::new(EchoDispatcher), logger);
        assert!(matches!(server.start(), Err(ServerError::NotConfigured)));

        server
            .configure("", 5801, 1)
            .expect("empty address should be stored");
        assert!(matches!(server.start(), Err(ServerError::AddressNotSet)));

        server
            .configure("127.0.0.1", 0, 1)
            .expect("zero port should be stored");
        assert!(matches!(server.start(), Err(ServerError::PortNotSet)));
    }

    #[test]
    fn start_twice_and_bind_conflicts_fail() {
        let (mut server, _sink) = serving(1);
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
        assert!(matches!(
            server.configure("127.0.0.1", 5801, 1),
            Err(ServerError::AlreadyStarted)
        ));

        let port = server.local_addr().expect("server should be bound").port();
        let (logger, _sink) = memory_logger();
        let mut rival = TcpControlServer::new(Arc::new(EchoDispatcher), logger);
        rival
            .configure("127.0.0.1", i64::from(port), 1)
            .expect("rival should configure");
        assert!(matches!(rival.start(), Err(ServerError::Bind { .. })));
    }

    #[test]
    fn concurrent_clients_each_receive_their_own_response() {
        let (mut server, _sink) = serving(3);
        let first = connect(&server);
        let second = connect(&server);
        wait_for_connections(&server, 2);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [ActionCode::GetAsBuilt, ActionCode::UpdateConfig]
            .into_iter()
            .zip([first.try_clone(), second.try_clone()])
            .map(|(action, stream)| {
                let mut stream = stream.expect("client stream should clone");
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    stream
                        .write_all(&codec::encode_action(action))
                        .expect("request should send");
                    (action, read_message(&mut stream))
                })
            })
            .collect();

        let mut connection_ids = Vec::new();
        for handle in handles {
            let (action, message) = handle.join().expect("client thread should finish");
            match message {
                DecodedMessage::Response(response) => {
                    assert_eq!(response.action, action);
                    assert_eq!(response.status, ActionStatus::Success);
                    connection_ids.push(response.data);
                }
                other => panic!("expected response, got {other:?}"),
            }
        }
        assert_ne!(connection_ids[0], connection_ids[1]);

        server.stop().expect("server should stop");
    }

    #[test]
    fn requests_split_across_writes_and_garbage_are_handled_in_order() {
        let (mut server, sink) = serving(1);
        let mut client = connect(&server);

        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend_from_slice(&codec::encode_action(ActionCode::GetAsBuilt));
        bytes.extend_from_slice(&codec::encode_action(ActionCode::BootInterrupt));
        let (head, tail) = bytes.split_at(9);
        client.write_all(head).expect("first chunk should send");
        thread::sleep(Duration::from_millis(20));
        client.write_all(tail).expect("second chunk should send");

        for expected in [ActionCode::GetAsBuilt, ActionCode::BootInterrupt] {
            match read_message(&mut client) {
                DecodedMessage::Response(response) => assert_eq!(response.action, expected),
                other => panic!("expected response, got {other:?}"),
            }
        }
        assert!(sink.contains("Discarded bytes on connection"));

        server.stop().expect("server should stop");
    }

    #[test]
    fn oversized_size_field_does_not_stall_following_requests() {
        let (mut server, sink) = serving(1);
        let mut client = connect(&server);

        let mut bytes = codec::SYNC_BYTES.to_vec();
        bytes.extend_from_slice(&100_000_u32.to_le_bytes());
        for _ in 0..5 {
            bytes.extend_from_slice(&codec::encode_action(ActionCode::GetAsBuilt));
        }
        client.write_all(&bytes).expect("requests should send");

        for _ in 0..5 {
            match read_message(&mut client) {
                DecodedMessage::Response(response) => {
                    assert_eq!(response.action, ActionCode::GetAsBuilt);
                    assert_eq!(response.status, ActionStatus::Success);
                }
                other => panic!("expected response, got {other:?}"),
            }
        }
        assert!(sink.contains("exceeds stream buffer limit"));

        server.stop().expect("server should stop");
    }

    #[test]
    fn session_end_log_carries_peer_and_counters() {
        let (mut server, sink) = serving(1);
        let mut client = connect(&server);
        let peer = client.local_addr().expect("client should have address");

        client
            .write_all(&codec::encode_action(ActionCode::BootInterrupt))
            .expect("request should send");
        assert!(matches!(
            read_message(&mut client),
            DecodedMessage::Response(_)
        ));
        drop(client);
        wait_for_connections(&server, 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        let ended = loop {
            let line = sink
                .lines()
                .into_iter()
                .find(|line| line.contains("Control session ended"));
            if let Some(line) = line {
                break line;
            }
            assert!(Instant::now() < deadline, "session end should be logged");
            thread::sleep(Duration::from_millis(5));
        };
        assert!(ended.contains(&peer.to_string()));
        assert!(ended.contains("\"bytes_received\":14"));
        assert!(ended.contains("connected_at"));

        server.stop().expect("server should stop");
    }

    #[test]
    fn connections_beyond_limit_are_refused() {
        let (mut server, sink) = serving(1);
        let mut admitted = connect(&server);
        wait_for_connections(&server, 1);

        let mut refused = connect(&server);
        let mut buffer = [0_u8; 8];
        let read = refused.read(&mut buffer);
        assert!(matches!(read, Ok(0)) || read.is_err());
        assert_eq!(server.connection_count(), 1);
        assert!(sink.contains("Refused connection"));

        admitted
            .write_all(&codec::encode_action(ActionCode::BootInterrupt))
            .expect("admitted client should still be served");
        assert!(matches!(
            read_message(&mut admitted),
            DecodedMessage::Response(_)
        ));

        server.stop().expect("server should stop");
    }

    #[test]
    fn send_buffer_to_client_targets_registered_connection() {
        let (mut server, _sink) = serving(2);
        let mut client = connect(&server);
        wait_for_connections(&server, 1);

        let connection_id = server.connection_ids()[0];
        let notice = codec::encode_action(ActionCode::BootInterrupt);
        assert_eq!(
            server
                .send_buffer_to_client(connection_id, &notice)
                .expect("send should work"),
            notice.len()
        );
        assert_eq!(
            read_message(&mut client),
            DecodedMessage::Action(ActionCode::BootInterrupt)
        );
        assert!(matches!(
            server.send_buffer_to_client(connection_id + 100, &notice),
            Err(SendError::UnknownConnection { .. })
        ));

        server.stop().expect("server should stop");
        assert!(matches!(
            server.send_buffer_to_client(connection_id, &notice),
            Err(SendError::UnknownConnection { .. })
        ));
    }

    #[test]
    fn peer_disconnect_removes_record() {
        let (mut server, sink) = serving(2);
        let client = connect(&server);
        wait_for_connections(&server, 1);

        drop(client);
        wait_for_connections(&server, 0);
        assert!(sink.contains("closed by peer"));

        server.stop().expect("server should stop");
    }

    #[test]
    fn stop_notifies_every_client_and_joins_workers() {
        let (mut server, sink) = serving(3);
        let mut clients: Vec<TcpStream> = (0..3).map(|_| connect(&server)).collect();
        wait_for_connections(&server, 3);

        server.stop().expect("server should stop");
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().is_none());
        assert!(sink.contains("3 session(s) notified"));
        assert_eq!(
            sink.lines()
                .iter()
                .filter(|line| line.contains("Control session ended"))
                .count(),
            3
        );

        for client in &mut clients {
            assert_eq!(
                read_message(client),
                DecodedMessage::Action(ActionCode::Close)
            );
            let mut rest = Vec::new();
            client
                .read_to_end(&mut rest)
                .expect("client should observe EOF");
            assert!(rest.is_empty());
        }

        server.stop().expect("second stop should be a no-op");
    }

    #[test]
    fn server_restarts_after_stop() {
        let (mut server, _sink) = serving(1);
        server.stop().expect("server should stop");

        server.start().expect("server should start again");
        assert_eq!(server.state(), ServerState::Serving);
        let mut client = connect(&server);
        client
            .write_all(&codec::encode_action(ActionCode::BootInterrupt))
            .expect("request should send");
        assert!(matches!(
            read_message(&mut client),
            DecodedMessage::Response(_)
        ));
        server.stop().expect("server should stop");
    }
}

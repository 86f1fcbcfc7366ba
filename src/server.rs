//! TCP server for the co-location echo service.
//!
//! Accepts connections, registers them, and runs one handler task per
//! connection. `stop` flips the run-state, shuts down every registered
//! connection, waits for the listener to close, and empties the registry.

use crate::config::ServerOptions;
use crate::echo::handle_connection;
use crate::registry::{Connection, ConnectionRegistry};
use socket2::SockRef;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after the process runs out of descriptors or buffers.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Shared "accepting" flag.
///
/// The atomic is the source of truth; the token wakes loops parked on
/// accept or read when the flag drops.
#[derive(Debug)]
pub struct RunState {
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has begun.
    pub fn stopped(&self) -> impl Future<Output = ()> + '_ {
        self.shutdown.cancelled()
    }

    /// Flip to not-accepting. Only the first caller gets `true`.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let first = self.accepting.swap(false, Ordering::SeqCst);
        if first {
            self.shutdown.cancel();
        }
        first
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters updated by the accept loop and handlers.
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    messages_handled: AtomicU64,
    active_handlers: AtomicUsize,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub messages_handled: u64,
    pub active_handlers: usize,
}

impl ServerStats {
    pub fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_started(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_handlers.fetch_add(1, Ordering::SeqCst);
    }

    fn handler_exited(&self) {
        self.active_handlers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            active_handlers: self.active_handlers.load(Ordering::SeqCst),
        }
    }
}

struct Shared {
    local_addr: SocketAddr,
    run_state: RunState,
    registry: Mutex<ConnectionRegistry>,
    stats: ServerStats,
    accept_task: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
}

impl Shared {
    fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            run_state: RunState::new(),
            registry: Mutex::new(ConnectionRegistry::new()),
            stats: ServerStats::default(),
            accept_task: Mutex::new(None),
        }
    }
}

/// Handle to a running server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns once the socket is listening, so clients may connect as soon
    /// as this resolves.
    pub async fn start(options: &ServerOptions) -> Result<Self, ServerError> {
        let bind_error = |source| ServerError::Bind {
            addr: options.listen,
            source,
        };
        let listener = bind_listener(options.listen, options.backlog).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(address = %local_addr, max_connections = options.max_connections, "Server listening");

        let shared = Arc::new(Shared::new(local_addr));

        let connection_limit = Arc::new(Semaphore::new(options.max_connections));
        let task = tokio::spawn(accept_loop(Arc::clone(&shared), listener, connection_limit));
        *lock(&shared.accept_task) = Some(task);

        Ok(Server { shared })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.run_state.is_accepting()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    /// Stop accepting, close every registered connection and the listener.
    ///
    /// Calls after the first are no-ops.
    pub async fn stop(&self) {
        if !self.shared.run_state.begin_shutdown() {
            debug!("Server already stopped");
            return;
        }

        let closed = {
            let mut registry = lock(&self.shared.registry);
            debug!(peers = ?registry.peers(), "Closing connections");
            registry.close_all()
        };

        // The accept loop owns the listener and drops it on exit.
        let task = lock(&self.shared.accept_task).take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Accept loop had already failed"),
                Err(e) => error!(error = %e, "Accept loop task failed"),
            }
        }

        lock(&self.shared.registry).clear();
        info!(address = %self.shared.local_addr, closed, "Server stopped");
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
) -> Result<(), ServerError> {
    while shared.run_state.is_accepting() {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = shared.run_state.stopped() => break,
            permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = shared.run_state.stopped() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => dispatch(&shared, stream, peer, permit),
            Err(e) => recover_from_accept_error(e).await?,
        }
    }

    debug!(address = %shared.local_addr, "Accept loop finished, closing listener");
    Ok(())
}

/// Log a failed accept. Fatal errors end the loop; resource exhaustion
/// backs off before the next attempt.
async fn recover_from_accept_error(e: io::Error) -> Result<(), ServerError> {
    if is_fatal_accept_error(&e) {
        error!(error = %e, "Fatal accept error, no longer accepting");
        return Err(ServerError::Accept(e));
    }

    warn!(error = %e, "Failed to accept connection");
    if is_resource_exhaustion(&e) {
        tokio::time::sleep(ACCEPT_BACKOFF).await;
    }
    Ok(())
}

/// Register an accepted stream and spawn its handler.
fn dispatch(shared: &Arc<Shared>, mut stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
    let socket = match SockRef::from(&stream).try_clone() {
        Ok(socket) => socket,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }
    };

    let id = {
        let mut registry = lock(&shared.registry);
        // stop() flips the flag before taking this lock, so anything
        // inserted here is guaranteed to be seen by its close_all().
        if !shared.run_state.is_accepting() {
            debug!(peer = %peer, "Dropping connection accepted during shutdown");
            return;
        }
        registry.insert(Connection::new(peer, socket))
    };

    shared.stats.handler_started();
    info!(peer = %peer, "New connection");

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        match handle_connection(&mut stream, &shared.run_state, &shared.stats).await {
            Ok(messages) => debug!(peer = %peer, messages, "Connection finished"),
            Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
        }

        if let Some(mut conn) = lock(&shared.registry).remove(id) {
            conn.close();
        }
        shared.stats.handler_exited();
        drop(permit);
    });
}

/// Create the listening socket.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Errors that mean the listener itself is unusable.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP | libc::EFAULT)
    )
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn options() -> ServerOptions {
        ServerOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_connections: 64,
            backlog: 128,
        }
    }

    async fn round_trip(stream: &mut TcpStream, message: &str) -> String {
        stream.write_all(message.as_bytes()).await.unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = Server::start(&options()).await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

        let response = round_trip(&mut stream, "Client 1 message 0").await;
        assert_eq!(response, "Processed data: Client 1 message 0");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_in_use_fails() {
        let server = Server::start(&options()).await.unwrap();
        let taken = ServerOptions {
            listen: server.local_addr(),
            ..options()
        };

        let result = Server::start(&taken).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_connections_all_handled() {
        const CONNECTIONS: usize = 8;
        const MESSAGES: usize = 6;

        let server = Server::start(&options()).await.unwrap();
        let addr = server.local_addr();

        let mut tasks = Vec::new();
        for conn in 0..CONNECTIONS {
            tasks.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for msg in 0..MESSAGES {
                    let request = format!("Client {conn} message {msg}");
                    let response = round_trip(&mut stream, &request).await;
                    assert_eq!(response, format!("Processed data: {request}"));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Handlers exit once they observe the client close.
        wait_for(|| server.connection_count() == 0).await;
        let stats = server.stats();
        assert_eq!(stats.connections_accepted, CONNECTIONS as u64);
        assert_eq!(stats.messages_handled, (CONNECTIONS * MESSAGES) as u64);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connections_and_listener() {
        let server = Server::start(&options()).await.unwrap();
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        round_trip(&mut first, "hello").await;
        round_trip(&mut second, "hello").await;
        assert_eq!(server.connection_count(), 2);

        server.stop().await;

        assert!(!server.is_accepting());
        assert_eq!(server.connection_count(), 0);

        // Open connections see EOF or a reset instead of hanging.
        for stream in [&mut first, &mut second] {
            let mut buf = [0u8; 64];
            let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("read hung after stop");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        assert!(TcpStream::connect(addr).await.is_err());

        wait_for(|| server.stats().active_handlers == 0).await;
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let server = Server::start(&options()).await.unwrap();
        let _stream = TcpStream::connect(server.local_addr()).await.unwrap();

        server.stop().await;
        server.stop().await;

        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_run_state_transitions_once() {
        let run_state = RunState::new();
        assert!(run_state.is_accepting());
        assert!(run_state.begin_shutdown());
        assert!(!run_state.is_accepting());
        assert!(!run_state.begin_shutdown());
    }

    #[tokio::test]
    async fn test_connection_limit_defers_accept() {
        let limited = ServerOptions {
            max_connections: 1,
            ..options()
        };
        let server = Server::start(&limited).await.unwrap();
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(round_trip(&mut first, "a").await, "Processed data: a");

        // The kernel completes the handshake, but the server holds off on
        // accepting while the only slot is taken.
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"b").await.unwrap();
        let mut buf = [0u8; 64];
        let waited = timeout(Duration::from_millis(200), second.read(&mut buf)).await;
        assert!(waited.is_err());
        assert_eq!(server.connection_count(), 1);

        drop(first);

        let n = timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .expect("second connection never served")
            .unwrap();
        assert_eq!(&buf[..n], b"Processed data: b");
        assert_eq!(server.stats().connections_accepted, 2);

        server.stop().await;
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_accepting());
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let shared = Arc::new(Shared::new(addr));
        shared.run_state.begin_shutdown();

        let limit = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&limit).acquire_owned().await.unwrap();
        dispatch(&shared, stream, peer, permit);

        assert!(lock(&shared.registry).is_empty());
        assert_eq!(shared.stats.snapshot().connections_accepted, 0);
        assert_eq!(limit.available_permits(), 1);

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("dropped connection left the peer hanging");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_continue_or_stop() {
        let aborted = io::Error::from_raw_os_error(libc::ECONNABORTED);
        assert!(recover_from_accept_error(aborted).await.is_ok());

        let before = tokio::time::Instant::now();
        let exhausted = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(recover_from_accept_error(exhausted).await.is_ok());
        assert!(before.elapsed() >= ACCEPT_BACKOFF);

        let bad_fd = io::Error::from_raw_os_error(libc::EBADF);
        assert!(matches!(
            recover_from_accept_error(bad_fd).await,
            Err(ServerError::Accept(_))
        ));
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(is_fatal_accept_error(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_fatal_accept_error(&io::Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_resource_exhaustion(&io::Error::new(io::ErrorKind::Other, "x")));
    }
}

//! The socket service.
//!
//! A [`SocketService`] binds a listening socket, accepts connections on a
//! dedicated thread, and runs the configured [`ConnectionHandler`] for each
//! accepted connection on a worker. Workers come from a bounded pool (a
//! tokio blocking pool capped at the configured size) or, by default, are
//! plain threads spawned per connection.
//!
//! The connection is closed when the handler returns, whether it succeeded,
//! failed, or panicked. A misbehaving handler only ever takes down its own
//! connection.
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};

use crate::connection::{Connection, SocketConnection};
use crate::errors::{KitError, KitResult};
use crate::http::HttpConnection;
use crate::lifecycle::{ComponentState, Lifecycle, DEFAULT_DESTROY_WAIT};

/// Receives every accepted connection.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, conn: &mut dyn Connection) -> KitResult<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(&mut dyn Connection) -> KitResult<()> + Send + Sync,
{
    fn handle(&self, conn: &mut dyn Connection) -> KitResult<()> {
        self(conn)
    }
}

/// Wraps the raw connection before it is handed to the handler.
pub type ConnectionWrapper = Arc<dyn Fn(Box<dyn Connection>) -> Box<dyn Connection> + Send + Sync>;

/// Configuration of the socket service.
#[derive(Clone)]
pub struct ServiceBuilder {
    /// Address to bind to.
    addr: IpAddr,
    /// Port to bind to; 0 asks the system for an ephemeral port.
    port: u16,
    /// Worker pool size. `None` spawns a thread per connection.
    pool_size: Option<usize>,
    /// How often the accept loop checks for a stop request.
    poll_interval: Duration,
    /// How long `destroy` waits for the accept loop to wind down.
    destroy_wait: Duration,
    /// Wrappers applied, in order, to each accepted connection.
    wrappers: Vec<ConnectionWrapper>,
    handler: Arc<dyn ConnectionHandler>,
}

impl ServiceBuilder {
    pub fn new(handler: impl ConnectionHandler + 'static) -> ServiceBuilder {
        ServiceBuilder::with_handler(Arc::new(handler))
    }

    pub fn with_handler(handler: Arc<dyn ConnectionHandler>) -> ServiceBuilder {
        ServiceBuilder {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            pool_size: None,
            poll_interval: Duration::from_millis(20),
            destroy_wait: DEFAULT_DESTROY_WAIT,
            wrappers: Vec::new(),
            handler,
        }
    }

    pub fn addr(self, addr: IpAddr) -> Self {
        let mut this = self;
        this.addr = addr;
        this
    }

    pub fn port(self, port: u16) -> Self {
        let mut this = self;
        this.port = port;
        this
    }

    /// Run handlers on a pool of at most `size` threads.
    pub fn pool_size(self, size: usize) -> Self {
        let mut this = self;
        this.pool_size = Some(size.max(1));
        this
    }

    pub fn poll_interval(self, interval: Duration) -> Self {
        let mut this = self;
        this.poll_interval = interval;
        this
    }

    pub fn destroy_wait(self, wait: Duration) -> Self {
        let mut this = self;
        this.destroy_wait = wait;
        this
    }

    /// Add a connection wrapper. Wrappers run in the order they were added,
    /// so the last one added is the outermost.
    pub fn wrap(
        self,
        wrapper: impl Fn(Box<dyn Connection>) -> Box<dyn Connection> + Send + Sync + 'static,
    ) -> Self {
        let mut this = self;
        this.wrappers.push(Arc::new(wrapper));
        this
    }

    /// Present every connection through an [`HttpConnection`].
    pub fn http(self) -> Self {
        self.wrap(|conn| Box::new(HttpConnection::new(conn)))
    }

    pub fn build(self) -> SocketService {
        SocketService::new(self)
    }
}

// State shared between the service, its accept thread and the workers.
struct Shared {
    lifecycle: Lifecycle,
    handler: Arc<dyn ConnectionHandler>,
    wrappers: Vec<ConnectionWrapper>,
    poll_interval: Duration,
    active: AtomicUsize,
}

pub struct SocketService {
    shared: Arc<Shared>,
    addr: SocketAddr,
    pool_size: Option<usize>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    runtime: Mutex<Option<Runtime>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketService {
    pub fn builder(handler: impl ConnectionHandler + 'static) -> ServiceBuilder {
        ServiceBuilder::new(handler)
    }

    fn new(cfg: ServiceBuilder) -> SocketService {
        SocketService {
            shared: Arc::new(Shared {
                lifecycle: Lifecycle::new().with_destroy_wait(cfg.destroy_wait),
                handler: cfg.handler,
                wrappers: cfg.wrappers,
                poll_interval: cfg.poll_interval,
                active: AtomicUsize::new(0),
            }),
            addr: SocketAddr::new(cfg.addr, cfg.port),
            pool_size: cfg.pool_size,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            runtime: Mutex::new(None),
            accept_thread: Mutex::new(None),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.shared.lifecycle
    }

    pub fn state(&self) -> ComponentState {
        self.shared.lifecycle.state()
    }

    /// Address the service is bound to, available after `create`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|a| a.port())
    }

    /// Number of handlers currently running.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Bind the listening socket and set up the worker pool.
    pub fn create(&self) -> KitResult<()> {
        let state = self.state();
        if state != ComponentState::NotInitialized && state != ComponentState::Destroyed {
            return Err(KitError::Lifecycle {
                state,
                operation: "create",
            });
        }
        let listener = TcpListener::bind(self.addr).map_err(|e| {
            error!("cannot bind {}: {}", self.addr, e);
            KitError::Bind(e)
        })?;
        listener.set_nonblocking(true).map_err(KitError::Bind)?;
        let local = listener.local_addr().map_err(KitError::Bind)?;

        if let Some(size) = self.pool_size {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(size)
                .thread_name("dav-kit-worker")
                .build()?;
            *self.runtime.lock() = Some(rt);
        }

        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(local);
        self.shared.lifecycle.create()?;
        debug!("service bound to {}", local);
        Ok(())
    }

    /// Start accepting connections.
    pub fn start(&self) -> KitResult<()> {
        let listener = match *self.listener.lock() {
            Some(ref l) => l.try_clone()?,
            None => {
                return Err(KitError::Lifecycle {
                    state: self.state(),
                    operation: "start",
                })
            }
        };
        let pool = self.runtime.lock().as_ref().map(|rt| rt.handle().clone());
        self.shared.lifecycle.start()?;

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("dav-kit-accept".to_string())
            .spawn(move || accept_loop(listener, shared, pool));
        match spawned {
            Ok(handle) => {
                *self.accept_thread.lock() = Some(handle);
                info!("accepting connections on {:?}", self.local_addr());
                Ok(())
            }
            Err(e) => {
                self.shared.lifecycle.change_state(ComponentState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Ask the accept loop to stop. Running handlers are not interrupted.
    pub fn stop(&self) {
        info!("stopping service on {:?}", self.local_addr());
        self.shared.lifecycle.stop();
    }

    /// Release the listening socket. Fails unless the service is stopped,
    /// or stops within the configured wait.
    pub fn destroy(&self) -> KitResult<()> {
        self.shared.lifecycle.destroy()?;
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                error!("accept thread panicked");
            }
        }
        self.listener.lock().take();
        let active = self.active_connections();
        if active > 0 {
            warn!("service destroyed with {} handler(s) still running", active);
        }
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
        Ok(())
    }
}

impl Drop for SocketService {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            ComponentState::Started | ComponentState::Running
        ) {
            self.stop();
        }
        // dropping the runtime would block on running handlers.
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, pool: Option<Handle>) {
    let lifecycle = &shared.lifecycle;
    lifecycle.change_state_if(ComponentState::Started, ComponentState::Running);
    while !lifecycle.is_stop_requested() {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!("accepted connection from {}", peer);
                shared.active.fetch_add(1, Ordering::AcqRel);
                dispatch(stream, &shared, pool.as_ref());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(shared.poll_interval),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(shared.poll_interval);
            }
        }
    }
    drop(listener);
    lifecycle.change_state(ComponentState::Stopped);
    info!("accept loop stopped");
}

fn dispatch(stream: TcpStream, shared: &Arc<Shared>, pool: Option<&Handle>) {
    let worker_shared = shared.clone();
    let job = move || serve(stream, &worker_shared);
    match pool {
        Some(handle) => {
            handle.spawn_blocking(job);
        }
        None => {
            let spawned = thread::Builder::new()
                .name("dav-kit-conn".to_string())
                .spawn(job);
            if let Err(e) = spawned {
                // the job, and with it the stream, is dropped here.
                error!("cannot spawn connection thread: {}", e);
                shared.active.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

fn serve(stream: TcpStream, shared: &Shared) {
    if let Err(e) = prepare(&stream) {
        debug!("cannot configure accepted socket: {}", e);
    }
    let mut conn: Box<dyn Connection> = Box::new(SocketConnection::new(stream));
    for wrap in &shared.wrappers {
        conn = wrap(conn);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| shared.handler.handle(&mut *conn)));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("handler failed: {}", e),
        Err(_) => error!("handler panicked, closing its connection"),
    }
    if let Err(e) = conn.close() {
        debug!("error closing connection: {}", e);
    }
    shared.active.fetch_sub(1, Ordering::AcqRel);
}

fn prepare(stream: &TcpStream) -> io::Result<()> {
    // accepted sockets inherit non-blocking mode from the listener on some platforms.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut dyn Connection) -> KitResult<()> {
        Ok(())
    }

    #[test]
    fn ephemeral_port_known_after_create() {
        let svc = ServiceBuilder::new(noop)
            .addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .build();
        assert_eq!(svc.port(), None);
        svc.create().unwrap();
        assert_ne!(svc.port(), Some(0));
        assert!(svc.port().is_some());
        assert_eq!(svc.state(), ComponentState::Initialized);
        assert!(svc.destroy().is_err());
    }

    #[test]
    fn start_before_create_fails() {
        let svc = ServiceBuilder::new(noop).build();
        assert!(svc.start().is_err());
        assert_eq!(svc.state(), ComponentState::NotInitialized);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = ServiceBuilder::new(noop)
            .addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .build();
        first.create().unwrap();
        let second = ServiceBuilder::new(noop)
            .addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(first.port().unwrap())
            .build();
        assert!(matches!(second.create(), Err(KitError::Bind(_))));
    }
}

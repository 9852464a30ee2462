//! Owns the listening socket, the reactor, the worker pool, and every
//! live connection. Mirrors the original `FTPServer`'s role almost
//! exactly: submit a recursive `accept`, build a `Connection` for each
//! success, and track them so `stop` can tear everything down.

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::pool::Pool;
use crate::reactor::Reactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

struct Registry {
    connections: Mutex<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn allocate_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, id: ConnId, conn: Arc<Connection>) {
        self.connections.lock().unwrap().insert(id, conn);
    }

    fn remove(&self, id: ConnId) {
        self.connections.lock().unwrap().remove(&id);
    }

    fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().drain().map(|(_, c)| c).collect()
    }
}

/// The top-level FTP server. Constructed around an already bound and
/// listening socket; the caller (`main`/`cli`) owns address selection.
pub struct Server {
    listener: TcpListener,
    root: PathBuf,
    reactor: Arc<Reactor>,
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    alive: Arc<AtomicBool>,
}

impl Server {
    pub fn new(listener: TcpListener, root: PathBuf, thread_count: usize) -> io::Result<Server> {
        listener.set_nonblocking(true)?;
        Ok(Server {
            listener,
            root,
            reactor: Reactor::new(),
            pool: Arc::new(Pool::new(thread_count)),
            registry: Arc::new(Registry::new()),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the accept loop and the reactor's driver task. Returns
    /// immediately; the server runs on the worker pool until `stop` is
    /// called.
    pub fn start(self: &Arc<Self>) {
        self.submit_accept();

        let reactor = Arc::clone(&self.reactor);
        let pool = Arc::clone(&self.pool);
        let alive = Arc::clone(&self.alive);
        self.pool.submit(Box::new(move || {
            while alive.load(Ordering::Acquire) {
                let task = reactor.wait_for_event();
                pool.submit(task);
            }
        }));
        log::info!(
            "server listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string())
        );
    }

    fn submit_accept(self: &Arc<Self>) {
        let fd = self.listener.as_raw_fd();
        let this = Arc::clone(self);
        self.reactor.accept(
            fd,
            Box::new(move |res| {
                if !this.alive.load(Ordering::Acquire) {
                    return;
                }
                match res {
                    Ok(newfd) => {
                        let stream = unsafe { TcpStream::from_raw_fd(newfd) };
                        this.accept_connection(stream);
                    }
                    Err(e) => {
                        log::error!("accept failed: {e}");
                    }
                }
                this.submit_accept();
            }),
        );
    }

    fn accept_connection(self: &Arc<Self>, stream: TcpStream) {
        let id = self.registry.allocate_id();
        let registry = Arc::clone(&self.registry);
        log::info!("connection {id:?} accepted");
        let conn = Connection::spawn(
            id,
            Arc::clone(&self.reactor),
            self.root.clone(),
            stream,
            move |closed_id| registry.remove(closed_id),
        );
        self.registry.insert(id, conn);
    }

    /// Stops accepting new connections, tears down every live connection,
    /// interrupts the reactor, and joins the worker pool. Blocks until
    /// shutdown is complete.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::Release);
        for conn in self.registry.drain() {
            conn.close();
        }
        // The recursive `accept` submitted in `submit_accept` is almost
        // always parked in the reactor's pending-wait set (no client is
        // constantly connecting), and `interrupt()` alone does not revisit
        // pending waits -- only cancel does. Without this, the listening
        // socket stays open, captured inside that wait, until the process
        // exits.
        self.reactor.cancel(self.listener.as_raw_fd());
        self.reactor.interrupt();
        self.pool.shutdown_and_join();
        log::info!("server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ids() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }
}

//! Registry of live server-side connections.
//!
//! Each entry holds a duplicate handle to the accepted socket so the server
//! can shut the connection down while its handler task still owns the
//! stream. The registry itself is not synchronized; the server wraps it in a
//! mutex.

use slab::Slab;
use socket2::Socket;
use std::io;
use std::net::{Shutdown, SocketAddr};
use tracing::trace;

/// A registered connection.
#[derive(Debug)]
pub struct Connection {
    /// Remote address of the peer.
    pub peer: SocketAddr,
    /// Duplicate of the handler's socket, used only for shutdown.
    socket: Socket,
    closed: bool,
}

impl Connection {
    /// Wrap a socket handle for the given peer.
    pub fn new(peer: SocketAddr, socket: Socket) -> Self {
        Self {
            peer,
            socket,
            closed: false,
        }
    }

    /// Shut down both directions of the connection.
    ///
    /// Returns `true` the first time it is called and `false` afterwards.
    /// A peer that already went away is not an error.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        match self.socket.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => trace!(peer = %self.peer, error = %e, "Shutdown failed"),
        }
        true
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert and remove.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning its id.
    pub fn insert(&mut self, conn: Connection) -> usize {
        self.connections.insert(conn)
    }

    /// Remove a connection. Unknown ids (already cleared) yield `None`.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Close every registered connection, returning how many were closed
    /// by this call.
    pub fn close_all(&mut self) -> usize {
        self.connections
            .iter_mut()
            .map(|(_, conn)| conn.close())
            .filter(|closed| *closed)
            .count()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.connections.clear();
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Peers of all registered connections.
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections.iter().map(|(_, conn)| conn.peer).collect()
    }
}

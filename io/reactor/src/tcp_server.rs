//! TCP server: acceptor on the base loop, connections fanned out to a
//! worker-loop pool round-robin.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, ConnectionCallbacks, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_pool::EventLoopPool;
use crate::sockets;

#[derive(Default)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_watermark: Option<(HighWaterMarkCallback, usize)>,
}

pub struct TcpServer {
    name: String,
    hostport: String,
    base: Arc<LoopHandle>,
    pool: EventLoopPool,
    acceptor: Arc<Acceptor>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    /// Only ever incremented on the base loop.
    next_conn_id: AtomicU64,
    started: AtomicBool,
    callbacks: Mutex<UserCallbacks>,
    self_weak: Weak<TcpServer>,
}

impl TcpServer {
    /// Bind the listening socket (without listening yet) and wire the
    /// acceptor. `base` must be the handle of the loop that will run
    /// `listen`.
    pub fn new(
        base: Arc<LoopHandle>,
        addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(addr, reuse_port)?;
        let hostport = acceptor.local_addr().to_string();
        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer>| TcpServer {
            name: name.to_string(),
            hostport,
            base: base.clone(),
            pool: EventLoopPool::new(base, name),
            acceptor,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(UserCallbacks::default()),
            self_weak: self_weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |lp, socket, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(lp, socket, peer);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address; with port 0 this is the kernel-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_watermark_callback(&self, cb: HighWaterMarkCallback, watermark: usize) {
        self.callbacks.lock().high_watermark = Some((cb, watermark));
    }

    /// Start `worker_count` loops and begin listening. Idempotent.
    pub fn start(&self, worker_count: usize) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.pool.start(worker_count, None);
        let acceptor = self.acceptor.clone();
        let name = self.name.clone();
        self.base.run_in_loop(move |lp| {
            if let Err(e) = acceptor.listen(lp) {
                tracing::error!(server = %name, "listen failed: {e}");
            }
        });
    }

    /// Force-close every live connection, then stop the worker pool.
    pub fn stop(&self) {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.force_close();
        }
        self.pool.stop();
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(&self, lp: &EventLoop, socket: Socket, peer: SocketAddr) {
        lp.assert_in_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}#{}", self.hostport, id);
        let worker = self.pool.next_loop();

        let local = match sockets::local_addr(&socket) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("could not read back local address: {e}");
                self.acceptor.local_addr()
            }
        };

        let (connection_cb, message_cb, write_complete, high_watermark) = {
            let cbs = self.callbacks.lock();
            (
                cbs.connection.clone(),
                cbs.message.clone(),
                cbs.write_complete.clone(),
                cbs.high_watermark.clone(),
            )
        };
        let connection_cb: ConnectionCallback =
            connection_cb.unwrap_or_else(|| Arc::new(|_conn| {}));
        let message_cb: MessageCallback = message_cb.unwrap_or_else(|| {
            Arc::new(|_conn, buf, _ts| {
                // No consumer configured; discard so the buffer cannot grow.
                buf.retrieve_all();
            })
        });
        let close_cb = {
            let weak = self.self_weak.clone();
            Arc::new(move |conn: &Arc<TcpConnection>| {
                if let Some(server) = weak.upgrade() {
                    server.remove_connection(conn);
                }
            })
        };

        let (hwm_cb, hwm_level) = match high_watermark {
            Some((cb, level)) => (Some(cb), Some(level)),
            None => (None, None),
        };

        let conn = TcpConnection::new(
            worker.clone(),
            conn_name.clone(),
            socket,
            local,
            peer,
            ConnectionCallbacks {
                connection: connection_cb,
                message: message_cb,
                write_complete,
                high_watermark: hwm_cb,
                close: close_cb,
            },
        );
        if let Some(level) = hwm_level {
            conn.set_high_watermark(level);
        }

        tracing::debug!(conn = %conn_name, %peer, "connection accepted");
        self.connections.lock().insert(conn_name, conn.clone());
        worker.run_in_loop(move |lp| conn.connect_established(lp));
    }

    /// Close callback: runs on the connection's worker. Hop to the base
    /// loop, erase from the table there, then finish teardown back on the
    /// worker.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let name = conn.name().to_string();
        let conn = conn.clone();
        let weak = self.self_weak.clone();
        self.base.run_in_loop(move |_lp| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&name, &conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, name: &str, conn: &Arc<TcpConnection>) {
        if self.connections.lock().remove(name).is_none() {
            tracing::debug!(conn = %name, "connection already removed");
        }
        let owner = conn.owner().clone();
        let conn = conn.clone();
        owner.run_in_loop(move |lp| conn.connect_destroyed(lp));
    }
}

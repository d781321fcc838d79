//! Wires transfer sessions onto the TCP server.
//!
//! One `FileSession` per live connection, keyed by the connection name.
//! Sessions run entirely on their connection's worker loop; the session
//! table and the file manager are the only cross-loop shared state.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use reactor::{LoopHandle, TcpServer};

use crate::file_manager::FileManager;
use crate::metrics;
use crate::session::FileSession;

type SessionTable = Arc<Mutex<HashMap<String, Arc<Mutex<FileSession>>>>>;

pub struct FileServer {
    tcp: Arc<TcpServer>,
    files: Arc<FileManager>,
    sessions: SessionTable,
}

impl FileServer {
    /// Bind the listener and wire the callbacks. `base` is the handle of
    /// the loop that will drive the acceptor.
    pub fn bind(
        base: Arc<LoopHandle>,
        addr: SocketAddr,
        reuse_port: bool,
        files: Arc<FileManager>,
    ) -> io::Result<FileServer> {
        let tcp = TcpServer::new(base, addr, "ingot", reuse_port)?;
        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));

        {
            let sessions = sessions.clone();
            tcp.set_connection_callback(Arc::new(move |conn| {
                if conn.connected() {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    metrics::CONNECTIONS_ACTIVE.increment();
                    tracing::info!(peer = %conn.peer_addr(), "client connected");
                    sessions
                        .lock()
                        .insert(conn.name().to_string(), Arc::new(Mutex::new(FileSession::new())));
                } else if sessions.lock().remove(conn.name()).is_some() {
                    metrics::CONNECTIONS_ACTIVE.decrement();
                    tracing::info!(peer = %conn.peer_addr(), "client disconnected");
                }
            }));
        }

        {
            let sessions = sessions.clone();
            let files = files.clone();
            tcp.set_message_callback(Arc::new(move |conn, buf, _receive_time| {
                let session = sessions.lock().get(conn.name()).cloned();
                let Some(session) = session else {
                    // Data raced a disconnect; nothing to do with it.
                    buf.retrieve_all();
                    return;
                };

                let mut out = BytesMut::new();
                let result = session.lock().process_buffer(buf, &files, &mut out);
                if !out.is_empty() {
                    conn.send(&out);
                }
                if let Err(e) = result {
                    metrics::PROTOCOL_ERRORS.increment();
                    tracing::error!(
                        peer = %conn.peer_addr(),
                        "session failed, closing connection: {e}"
                    );
                    conn.force_close();
                }
            }));
        }

        Ok(FileServer {
            tcp,
            files,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn start(&self, workers: usize) {
        self.tcp.start(workers);
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

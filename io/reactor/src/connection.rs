//! Per-connection state machine over a non-blocking socket.
//!
//! A connection is pinned to one worker loop for its whole life. The server
//! and any cross-thread task hold strong references; the channel holds a
//! weak one, so the descriptor closes exactly when the last strong
//! reference drops. `send`, `shutdown`, and `force_close` are safe from any
//! thread; everything else runs on the owner loop.
//!
//! ```text
//! Connecting    -> Connected      connect_established
//! Connected     -> Disconnecting  shutdown on a healthy connection
//! Connected     -> Disconnected   peer FIN, fatal error, force_close
//! Disconnecting -> Disconnected   write drain completed or force_close
//! ```

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::Socket;

use crate::buffer::Buffer;
use crate::channel::{EventTarget, Interest};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sockets;

/// Default output high-watermark: 64 MiB.
const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

pub struct ConnectionCallbacks {
    pub connection: ConnectionCallback,
    pub message: MessageCallback,
    pub write_complete: Option<WriteCompleteCallback>,
    pub high_watermark: Option<HighWaterMarkCallback>,
    pub close: CloseCallback,
}

pub struct TcpConnection {
    name: String,
    owner: Arc<LoopHandle>,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    inner: Mutex<ConnInner>,
    callbacks: ConnectionCallbacks,
    self_weak: Weak<TcpConnection>,
}

struct ConnInner {
    token: Option<usize>,
    input: Buffer,
    output: Buffer,
    reading: bool,
    writing: bool,
    high_watermark: usize,
}

impl TcpConnection {
    pub fn new(
        owner: Arc<LoopHandle>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        callbacks: ConnectionCallbacks,
    ) -> Arc<TcpConnection> {
        Arc::new_cyclic(|self_weak| TcpConnection {
            name,
            owner,
            socket,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            inner: Mutex::new(ConnInner {
                token: None,
                input: Buffer::new(),
                output: Buffer::new(),
                reading: false,
                writing: false,
                high_watermark: DEFAULT_HIGH_WATERMARK,
            }),
            callbacks,
            self_weak: self_weak.clone(),
        })
    }

    fn strong(&self) -> Arc<TcpConnection> {
        // Always succeeds: a method is only reachable through a live Arc.
        self.self_weak.upgrade().expect("connection self reference")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner(&self) -> &Arc<LoopHandle> {
        &self.owner
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = sockets::set_nodelay(&self.socket, on) {
            tracing::warn!(conn = %self.name, "TCP_NODELAY failed: {e}");
        }
    }

    /// Output-buffer threshold whose upward crossing fires the
    /// high-watermark callback.
    pub fn set_high_watermark(&self, bytes: usize) {
        self.inner.lock().high_watermark = bytes;
    }

    pub fn output_buffer_len(&self) -> usize {
        self.inner.lock().output.readable_bytes()
    }

    /// Send bytes. Inline on the owner loop thread; otherwise the payload
    /// is copied and the write hops onto the owner loop.
    pub fn send(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        if self.owner.is_in_loop_thread() && EventLoop::is_current_set() {
            EventLoop::with_current(|lp| self.send_in_loop(lp, data));
            return;
        }
        let conn = self.strong();
        let owned = data.to_vec();
        self.owner.queue_in_loop(move |lp| conn.send_in_loop(lp, &owned));
    }

    /// Send a buffer's readable bytes, taking ownership of them. This is the
    /// only way to move buffered data across threads without aliasing it.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        let data = buf.retrieve_as_vec(buf.readable_bytes());
        if self.state() == ConnState::Disconnected {
            return;
        }
        if self.owner.is_in_loop_thread() && EventLoop::is_current_set() {
            EventLoop::with_current(|lp| self.send_in_loop(lp, &data));
            return;
        }
        let conn = self.strong();
        self.owner.queue_in_loop(move |lp| conn.send_in_loop(lp, &data));
    }

    fn send_in_loop(&self, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            tracing::warn!(conn = %self.name, "send after disconnect, dropped");
            return;
        }

        let mut inner = self.inner.lock();
        let mut written = 0usize;
        let mut fault = false;

        // Try the descriptor directly while nothing is queued in front.
        if !inner.writing && inner.output.readable_bytes() == 0 && !data.is_empty() {
            match write_fd(self.fd(), data) {
                Ok(n) => written = n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::error!(conn = %self.name, "write failed: {e}");
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if remaining > 0 && !fault {
            let old_len = inner.output.readable_bytes();
            let high_watermark = inner.high_watermark;
            if old_len < high_watermark && old_len + remaining >= high_watermark {
                if let Some(cb) = &self.callbacks.high_watermark {
                    let cb = cb.clone();
                    let conn = self.strong();
                    let level = old_len + remaining;
                    self.owner.queue_in_loop(move |_lp| cb(&conn, level));
                }
            }
            inner.output.append(&data[written..]);
            if !inner.writing {
                inner.writing = true;
                self.apply_interest(lp, &inner);
            }
        }
        let drained = remaining == 0;
        drop(inner);

        if drained {
            if let Some(cb) = &self.callbacks.write_complete {
                let cb = cb.clone();
                let conn = self.strong();
                self.owner.queue_in_loop(move |_lp| cb(&conn));
            }
        }
    }

    /// Half-close after the output buffer drains.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.strong();
            self.owner.run_in_loop(move |lp| conn.shutdown_in_loop(lp));
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let inner = self.inner.lock();
        if !inner.writing {
            if let Err(e) = sockets::shutdown_write(&self.socket) {
                tracing::warn!(conn = %self.name, "shutdown(WR) failed: {e}");
            }
        }
        // Otherwise handle_write performs the shutdown on final drain.
    }

    /// Simulate a peer close: tear the connection down regardless of
    /// pending output.
    pub fn force_close(&self) {
        match self.state() {
            ConnState::Connecting | ConnState::Connected | ConnState::Disconnecting => {
                let conn = self.strong();
                self.owner.queue_in_loop(move |lp| conn.handle_close(lp));
            }
            _ => {}
        }
    }

    /// Called once on the owner loop after the server registers the
    /// connection.
    pub fn connect_established(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.state
            .store(ConnState::Connected as u8, Ordering::Release);
        {
            let mut inner = self.inner.lock();
            let target: Weak<dyn EventTarget> = self.self_weak.clone();
            match lp.register_channel(self.fd(), Interest::IN, target) {
                Ok(token) => {
                    inner.token = Some(token);
                    inner.reading = true;
                }
                Err(e) => {
                    tracing::error!(conn = %self.name, "channel registration failed: {e}");
                }
            }
        }
        (self.callbacks.connection)(&self.strong());
    }

    /// Final teardown on the owner loop, scheduled by the server after the
    /// connection left its table. Guards on state so a close that already
    /// ran does not notify twice.
    pub fn connect_destroyed(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let prev = self.state.swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if prev == ConnState::Connected as u8 {
            (self.callbacks.connection)(&self.strong());
        }
        let token = {
            let mut inner = self.inner.lock();
            inner.reading = false;
            inner.writing = false;
            inner.token.take()
        };
        if let Some(token) = token {
            lp.remove_channel(token);
        }
    }

    fn apply_interest(&self, lp: &EventLoop, inner: &ConnInner) {
        if let Some(token) = inner.token {
            let mut interest = Interest::NONE;
            if inner.reading {
                interest.insert(Interest::IN);
            }
            if inner.writing {
                interest.insert(Interest::OUT);
            }
            if let Err(e) = lp.set_interest(token, interest) {
                tracing::error!(conn = %self.name, "interest update failed: {e}");
            }
        }
    }

    fn handle_read(&self, lp: &EventLoop, receive_time: Instant) {
        lp.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        match inner.input.read_from_fd(self.fd()) {
            Ok(0) => {
                drop(inner);
                self.handle_close(lp);
            }
            Ok(_) => {
                // Hand the input buffer to the message callback without the
                // lock held; only this thread touches the input side.
                let mut input = std::mem::take(&mut inner.input);
                drop(inner);
                let conn = self.strong();
                (self.callbacks.message)(&conn, &mut input, receive_time);
                self.inner.lock().input = input;
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                drop(inner);
                tracing::error!(conn = %self.name, "read failed: {e}");
                self.handle_error(lp);
                self.handle_close(lp);
            }
        }
    }

    fn handle_write(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let mut inner = self.inner.lock();
        if !inner.writing {
            tracing::trace!(conn = %self.name, "write event with no write interest");
            return;
        }
        match write_fd(self.fd(), inner.output.peek()) {
            Ok(n) => {
                inner.output.retrieve(n);
                if inner.output.readable_bytes() == 0 {
                    inner.writing = false;
                    self.apply_interest(lp, &inner);
                    if self.state() == ConnState::Disconnecting {
                        if let Err(e) = sockets::shutdown_write(&self.socket) {
                            tracing::warn!(conn = %self.name, "shutdown(WR) failed: {e}");
                        }
                    }
                    drop(inner);
                    if let Some(cb) = &self.callbacks.write_complete {
                        let cb = cb.clone();
                        let conn = self.strong();
                        self.owner.queue_in_loop(move |_lp| cb(&conn));
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(conn = %self.name, "flush failed: {e}");
                drop(inner);
                self.handle_close(lp);
            }
        }
    }

    fn handle_error(&self, _lp: &EventLoop) {
        let err = sockets::take_socket_error(self.fd());
        if err != 0 {
            tracing::error!(
                conn = %self.name,
                "socket error: {}",
                io::Error::from_raw_os_error(err)
            );
        }
    }

    /// Idempotent teardown. Fires the connection callback with the state
    /// already `Disconnected`, then the close callback — always last, since
    /// it may drop the final strong reference.
    fn handle_close(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let prev = self.state.swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if prev == ConnState::Disconnected as u8 {
            return;
        }
        let token = {
            let mut inner = self.inner.lock();
            inner.reading = false;
            inner.writing = false;
            inner.token.take()
        };
        if let Some(token) = token {
            lp.remove_channel(token);
        }
        let conn = self.strong();
        (self.callbacks.connection)(&conn);
        (self.callbacks.close)(&conn);
    }
}

impl EventTarget for TcpConnection {
    fn on_read(&self, lp: &EventLoop, receive_time: Instant) {
        self.handle_read(lp, receive_time);
    }

    fn on_write(&self, lp: &EventLoop) {
        self.handle_write(lp);
    }

    fn on_close(&self, lp: &EventLoop) {
        self.handle_close(lp);
    }

    fn on_error(&self, lp: &EventLoop) {
        self.handle_error(lp);
    }
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

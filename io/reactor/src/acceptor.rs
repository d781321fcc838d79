//! Listening-socket owner. Runs on the base loop and publishes accepted
//! sockets with their peer address.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::Socket;

use crate::channel::{EventTarget, Interest};
use crate::event_loop::EventLoop;
use crate::sockets;

pub type NewConnectionCallback = Box<dyn Fn(&EventLoop, Socket, SocketAddr) + Send + Sync>;

const LISTEN_BACKLOG: i32 = 1024;

pub struct Acceptor {
    listener: Socket,
    local_addr: SocketAddr,
    on_connection: Mutex<Option<NewConnectionCallback>>,
    state: Mutex<AcceptorState>,
    self_weak: Weak<Acceptor>,
}

struct AcceptorState {
    token: Option<usize>,
    /// Reserved descriptor released to shed one connection on EMFILE.
    idle_fd: RawFd,
    listening: bool,
}

impl Acceptor {
    pub fn new(addr: SocketAddr, reuse_port: bool) -> io::Result<Arc<Acceptor>> {
        let listener = sockets::new_listener(addr, reuse_port)?;
        let local_addr = sockets::local_addr(&listener)?;
        Ok(Arc::new_cyclic(|self_weak| Acceptor {
            listener,
            local_addr,
            on_connection: Mutex::new(None),
            state: Mutex::new(AcceptorState {
                token: None,
                idle_fd: open_idle_fd(),
                listening: false,
            }),
            self_weak: self_weak.clone(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock() = Some(callback);
    }

    /// Start listening and register the read channel on `lp` (the base
    /// loop).
    pub fn listen(&self, lp: &EventLoop) -> io::Result<()> {
        lp.assert_in_loop_thread();
        self.listener.listen(LISTEN_BACKLOG)?;
        let weak: Weak<dyn EventTarget> = self.self_weak.clone();
        let token = lp.register_channel(self.listener.as_raw_fd(), Interest::IN, weak)?;
        let mut state = self.state.lock();
        state.token = Some(token);
        state.listening = true;
        Ok(())
    }

    pub fn stop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let mut state = self.state.lock();
        if let Some(token) = state.token.take() {
            lp.remove_channel(token);
        }
        state.listening = false;
    }

    /// Out of descriptors: close the spare, accept-and-drop the pending
    /// connection so the peer sees a clean close, then re-reserve.
    fn shed_pending_connection(&self) {
        let mut state = self.state.lock();
        if state.idle_fd < 0 {
            tracing::error!("accept: EMFILE and no spare descriptor to shed with");
            return;
        }
        unsafe { libc::close(state.idle_fd) };
        let fd = unsafe {
            libc::accept(
                self.listener.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        state.idle_fd = open_idle_fd();
        tracing::warn!("accept: out of file descriptors, shed one pending connection");
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let state = self.state.lock();
        if state.idle_fd >= 0 {
            unsafe { libc::close(state.idle_fd) };
        }
    }
}

fn open_idle_fd() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

impl EventTarget for Acceptor {
    fn on_read(&self, lp: &EventLoop, _receive_time: Instant) {
        let callback = self.on_connection.lock();
        loop {
            match sockets::accept(&self.listener) {
                Ok((socket, peer)) => match callback.as_ref() {
                    Some(cb) => cb(lp, socket, peer),
                    None => tracing::warn!(%peer, "accepted connection with no callback, dropped"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    drop(callback);
                    self.shed_pending_connection();
                    break;
                }
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn on_error(&self, _lp: &EventLoop) {
        tracing::error!(
            "listening socket error: {}",
            io::Error::from_raw_os_error(sockets::take_socket_error(self.listener.as_raw_fd()))
        );
    }
}

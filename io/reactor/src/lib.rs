//! Reactor-based networking substrate.
//!
//! One event loop per thread: a poller (epoll, poll, or select — chosen at
//! build time), a timer queue, and a cross-thread task queue with eventfd
//! wakeup. An acceptor on the base loop hands sockets to a pool of worker
//! loops; each connection is pinned to exactly one worker for its lifetime.
//!
//! # Example
//!
//! ```no_run
//! use reactor::{EventLoop, TcpServer};
//! use std::sync::Arc;
//!
//! let base = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:9000".parse().unwrap();
//! let server = TcpServer::new(base.handle(), addr, "echo", false).unwrap();
//! server.set_message_callback(Arc::new(|conn, buf, _ts| {
//!     let data = buf.retrieve_as_vec(buf.readable_bytes());
//!     conn.send(&data);
//! }));
//! server.start(4);
//! base.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod loop_pool;
mod poller;
pub mod sockets;
pub mod tcp_server;
pub mod timer;

pub use buffer::Buffer;
pub use channel::{EventTarget, Interest};
pub use connection::{ConnState, ConnectionCallbacks, TcpConnection};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use loop_pool::EventLoopPool;
pub use tcp_server::TcpServer;
pub use timer::TimerId;

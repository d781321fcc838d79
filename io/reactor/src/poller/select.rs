//! select(2) backend, for platforms with neither epoll nor a usable poll.
//!
//! The fd sets are rebuilt from the channel registry on every call; there is
//! no per-update kernel state to keep in sync.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use slab::Slab;

use crate::channel::{Channel, Interest, SLOT_ADDED, SLOT_NEW};

use super::Poller;

pub(crate) struct SelectPoller {
    /// fd -> token, for membership queries only.
    fds: HashMap<RawFd, usize>,
}

impl SelectPoller {
    pub(crate) fn new() -> SelectPoller {
        SelectPoller { fds: HashMap::new() }
    }
}

impl Poller for SelectPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<usize>,
    ) -> io::Result<Instant> {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut except_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);
        }

        let mut max_fd: RawFd = -1;
        for (_token, ch) in channels.iter() {
            if ch.interest.is_empty() {
                continue;
            }
            if ch.fd as usize >= libc::FD_SETSIZE as usize {
                tracing::warn!(fd = ch.fd, "descriptor exceeds FD_SETSIZE, not polled");
                continue;
            }
            unsafe {
                if ch.interest.contains(Interest::IN) {
                    libc::FD_SET(ch.fd, &mut read_set);
                }
                if ch.interest.contains(Interest::OUT) {
                    libc::FD_SET(ch.fd, &mut write_set);
                }
                if ch.interest.contains(Interest::PRI) {
                    libc::FD_SET(ch.fd, &mut except_set);
                }
            }
            max_fd = max_fd.max(ch.fd);
        }

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };
        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut tv,
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(now);
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(now);
        }

        for (token, ch) in channels.iter_mut() {
            if ch.interest.is_empty() || ch.fd as usize >= libc::FD_SETSIZE as usize {
                continue;
            }
            let mut revents = Interest::NONE;
            unsafe {
                if libc::FD_ISSET(ch.fd, &read_set) {
                    revents.insert(Interest::IN);
                }
                if libc::FD_ISSET(ch.fd, &write_set) {
                    revents.insert(Interest::OUT);
                }
                if libc::FD_ISSET(ch.fd, &except_set) {
                    revents.insert(Interest::PRI);
                }
            }
            if !revents.is_empty() {
                ch.revents = revents;
                active.push(token);
            }
        }
        Ok(now)
    }

    fn update_channel(&mut self, token: usize, ch: &mut Channel) -> io::Result<()> {
        if ch.slot == SLOT_NEW {
            self.fds.insert(ch.fd, token);
            ch.slot = SLOT_ADDED;
        }
        Ok(())
    }

    fn remove_channel(&mut self, _token: usize, ch: &mut Channel, _channels: &mut Slab<Channel>) {
        self.fds.remove(&ch.fd);
        ch.slot = SLOT_NEW;
    }

    fn has_channel(&self, token: usize, ch: &Channel) -> bool {
        self.fds.get(&ch.fd) == Some(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Arc;
    use std::time::Instant;

    struct Nop;
    impl crate::channel::EventTarget for Nop {
        fn on_read(&self, _lp: &crate::EventLoop, _ts: Instant) {}
    }

    #[test]
    fn reports_readable_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let target: Arc<dyn crate::channel::EventTarget> = Arc::new(Nop);
        let mut channels = Slab::new();
        let token = channels.insert(Channel::new(
            rd.as_raw_fd(),
            Interest::IN,
            Arc::downgrade(&target),
        ));

        let mut poller = SelectPoller::new();
        poller.update_channel(token, &mut channels[token]).unwrap();
        assert!(poller.has_channel(token, &channels[token]));

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        let mut active = Vec::new();
        poller.poll(100, &mut channels, &mut active).unwrap();
        assert_eq!(active, vec![token]);
        assert!(channels[token].revents.contains(Interest::IN));
    }
}

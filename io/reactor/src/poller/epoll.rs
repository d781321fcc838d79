//! epoll backend (Linux fast path).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use slab::Slab;

use crate::channel::{Channel, Interest, SLOT_ADDED, SLOT_DELETED, SLOT_NEW};

use super::Poller;

const INITIAL_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    /// fd -> token, for membership queries.
    fds: HashMap<RawFd, usize>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epfd,
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_LIST_SIZE],
            fds: HashMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, token: usize) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: to_epoll(interest),
            u64: token as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn to_epoll(interest: Interest) -> u32 {
    let mut ev = 0u32;
    if interest.contains(Interest::IN) {
        ev |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::PRI) {
        ev |= libc::EPOLLPRI as u32;
    }
    if interest.contains(Interest::OUT) {
        ev |= libc::EPOLLOUT as u32;
    }
    ev
}

fn from_epoll(events: u32) -> Interest {
    let mut r = Interest::NONE;
    if events & libc::EPOLLIN as u32 != 0 {
        r.insert(Interest::IN);
    }
    if events & libc::EPOLLPRI as u32 != 0 {
        r.insert(Interest::PRI);
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        r.insert(Interest::OUT);
    }
    if events & libc::EPOLLERR as u32 != 0 {
        r.insert(Interest::ERR);
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        r.insert(Interest::HUP);
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        r.insert(Interest::RDHUP);
    }
    r
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<usize>,
    ) -> io::Result<Instant> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
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
        let n = n as usize;
        for i in 0..n {
            let events = self.events[i].events;
            let token = self.events[i].u64 as usize;
            if let Some(ch) = channels.get_mut(token) {
                ch.revents = from_epoll(events);
                active.push(token);
            }
        }
        // A fully saturated event list hints at more pending events.
        if n == self.events.len() {
            self.events.resize(n * 2, unsafe { std::mem::zeroed() });
        }
        Ok(now)
    }

    fn update_channel(&mut self, token: usize, ch: &mut Channel) -> io::Result<()> {
        match ch.slot {
            SLOT_NEW | SLOT_DELETED => {
                if ch.slot == SLOT_NEW {
                    self.fds.insert(ch.fd, token);
                }
                ch.slot = SLOT_ADDED;
                self.ctl(libc::EPOLL_CTL_ADD, ch.fd, ch.interest, token)
            }
            _ => {
                if ch.interest.is_empty() {
                    // Stays in the fd map until remove_channel.
                    let r = self.ctl(libc::EPOLL_CTL_DEL, ch.fd, ch.interest, token);
                    ch.slot = SLOT_DELETED;
                    r
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, ch.fd, ch.interest, token)
                }
            }
        }
    }

    fn remove_channel(&mut self, token: usize, ch: &mut Channel, _channels: &mut Slab<Channel>) {
        self.fds.remove(&ch.fd);
        if ch.slot == SLOT_ADDED {
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, ch.fd, Interest::NONE, token) {
                tracing::debug!(fd = ch.fd, "epoll_ctl DEL failed: {e}");
            }
        }
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

        let mut poller = EpollPoller::new().unwrap();
        poller
            .update_channel(token, &mut channels[token])
            .unwrap();
        assert!(poller.has_channel(token, &channels[token]));

        let mut active = Vec::new();
        poller.poll(0, &mut channels, &mut active).unwrap();
        assert!(active.is_empty());

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        poller.poll(100, &mut channels, &mut active).unwrap();
        assert_eq!(active, vec![token]);
        assert!(channels[token].revents.contains(Interest::IN));

        let mut ch = channels.remove(token);
        poller.remove_channel(token, &mut ch, &mut channels);
        assert!(!poller.has_channel(token, &ch));
    }

    #[test]
    fn empty_interest_transitions_to_deleted_and_back() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, _wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let target: Arc<dyn crate::channel::EventTarget> = Arc::new(Nop);
        let mut channels = Slab::new();
        let token = channels.insert(Channel::new(
            rd.as_raw_fd(),
            Interest::IN,
            Arc::downgrade(&target),
        ));

        let mut poller = EpollPoller::new().unwrap();
        poller.update_channel(token, &mut channels[token]).unwrap();
        assert_eq!(channels[token].slot, SLOT_ADDED);

        channels[token].interest = Interest::NONE;
        poller.update_channel(token, &mut channels[token]).unwrap();
        assert_eq!(channels[token].slot, SLOT_DELETED);
        // Deleted channels remain tracked until removed.
        assert!(poller.has_channel(token, &channels[token]));

        channels[token].interest = Interest::IN;
        poller.update_channel(token, &mut channels[token]).unwrap();
        assert_eq!(channels[token].slot, SLOT_ADDED);
    }
}

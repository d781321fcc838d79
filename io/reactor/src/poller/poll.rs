//! poll(2) backend.
//!
//! Maintains a `pollfd` array parallel to a token array. Removal swaps the
//! last entry into the hole and patches the moved channel's slot. Channels
//! with an empty interest set keep their array entry but store the negated
//! descriptor so the kernel ignores them.

use std::io;
use std::time::Instant;

use slab::Slab;

use crate::channel::{Channel, Interest, SLOT_NEW};

use super::Poller;

pub(crate) struct PollPoller {
    fds: Vec<libc::pollfd>,
    tokens: Vec<usize>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            fds: Vec::new(),
            tokens: Vec::new(),
        }
    }
}

fn to_poll(interest: Interest) -> libc::c_short {
    let mut ev: libc::c_short = 0;
    if interest.contains(Interest::IN) {
        ev |= libc::POLLIN;
    }
    if interest.contains(Interest::PRI) {
        ev |= libc::POLLPRI;
    }
    if interest.contains(Interest::OUT) {
        ev |= libc::POLLOUT;
    }
    ev
}

fn from_poll(revents: libc::c_short) -> Interest {
    let mut r = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        r.insert(Interest::IN);
    }
    if revents & libc::POLLPRI != 0 {
        r.insert(Interest::PRI);
    }
    if revents & libc::POLLOUT != 0 {
        r.insert(Interest::OUT);
    }
    if revents & libc::POLLERR != 0 {
        r.insert(Interest::ERR);
    }
    if revents & libc::POLLHUP != 0 {
        r.insert(Interest::HUP);
    }
    if revents & libc::POLLNVAL != 0 {
        r.insert(Interest::NVAL);
    }
    #[cfg(target_os = "linux")]
    if revents & libc::POLLRDHUP != 0 {
        r.insert(Interest::RDHUP);
    }
    r
}

fn entry_fd(ch: &Channel) -> libc::c_int {
    if ch.interest.is_empty() { -ch.fd - 1 } else { ch.fd }
}

impl Poller for PollPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<usize>,
    ) -> io::Result<Instant> {
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
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
        let mut remaining = n as usize;
        for (i, pfd) in self.fds.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if pfd.revents != 0 {
                remaining -= 1;
                let token = self.tokens[i];
                if let Some(ch) = channels.get_mut(token) {
                    ch.revents = from_poll(pfd.revents);
                    active.push(token);
                }
            }
        }
        Ok(now)
    }

    fn update_channel(&mut self, token: usize, ch: &mut Channel) -> io::Result<()> {
        if ch.slot < 0 {
            self.fds.push(libc::pollfd {
                fd: entry_fd(ch),
                events: to_poll(ch.interest),
                revents: 0,
            });
            self.tokens.push(token);
            ch.slot = (self.fds.len() - 1) as i32;
        } else {
            let pfd = &mut self.fds[ch.slot as usize];
            pfd.fd = entry_fd(ch);
            pfd.events = to_poll(ch.interest);
            pfd.revents = 0;
        }
        Ok(())
    }

    fn remove_channel(&mut self, _token: usize, ch: &mut Channel, channels: &mut Slab<Channel>) {
        if ch.slot < 0 {
            return;
        }
        let idx = ch.slot as usize;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);
        if idx < self.fds.len() {
            // The former tail landed in the hole; patch its slot.
            let moved_token = self.tokens[idx];
            if let Some(moved) = channels.get_mut(moved_token) {
                moved.slot = idx as i32;
            }
        }
        ch.slot = SLOT_NEW;
    }

    fn has_channel(&self, token: usize, ch: &Channel) -> bool {
        ch.slot >= 0
            && (ch.slot as usize) < self.tokens.len()
            && self.tokens[ch.slot as usize] == token
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

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn swap_remove_patches_moved_slot() {
        let (rd_a, _wr_a) = pipe_pair();
        let (rd_b, wr_b) = pipe_pair();

        let target: Arc<dyn crate::channel::EventTarget> = Arc::new(Nop);
        let mut channels = Slab::new();
        let a = channels.insert(Channel::new(
            rd_a.as_raw_fd(),
            Interest::IN,
            Arc::downgrade(&target),
        ));
        let b = channels.insert(Channel::new(
            rd_b.as_raw_fd(),
            Interest::IN,
            Arc::downgrade(&target),
        ));

        let mut poller = PollPoller::new();
        poller.update_channel(a, &mut channels[a]).unwrap();
        poller.update_channel(b, &mut channels[b]).unwrap();
        assert_eq!(channels[b].slot, 1);

        let mut removed = channels.remove(a);
        poller.remove_channel(a, &mut removed, &mut channels);
        assert_eq!(channels[b].slot, 0);
        assert!(poller.has_channel(b, &channels[b]));

        unsafe { libc::write(wr_b.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        let mut active = Vec::new();
        poller.poll(100, &mut channels, &mut active).unwrap();
        assert_eq!(active, vec![b]);
        assert!(channels[b].revents.contains(Interest::IN));
    }

    #[test]
    fn empty_interest_is_ignored_by_the_kernel() {
        let (rd, wr) = pipe_pair();
        let target: Arc<dyn crate::channel::EventTarget> = Arc::new(Nop);
        let mut channels = Slab::new();
        let token = channels.insert(Channel::new(
            rd.as_raw_fd(),
            Interest::NONE,
            Arc::downgrade(&target),
        ));

        let mut poller = PollPoller::new();
        poller.update_channel(token, &mut channels[token]).unwrap();

        unsafe { libc::write(wr.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        let mut active = Vec::new();
        poller.poll(10, &mut channels, &mut active).unwrap();
        assert!(active.is_empty());
    }
}

//! I/O multiplexer backends behind one interest-set interface.
//!
//! The backend is chosen at build time via cargo features. All backends
//! produce the same sequence of active-channel dispatches for the same
//! observable event stream; only their cost profiles differ.

use std::io;
use std::time::Instant;

use slab::Slab;

use crate::channel::Channel;

#[cfg(all(feature = "poller-epoll", target_os = "linux"))]
mod epoll;
#[cfg(feature = "poller-poll")]
mod poll;
#[cfg(feature = "poller-select")]
mod select;

#[cfg(not(any(
    all(feature = "poller-epoll", target_os = "linux"),
    feature = "poller-poll",
    feature = "poller-select"
)))]
compile_error!(
    "no poller backend available: enable poller-epoll (Linux), poller-poll, or poller-select"
);

pub(crate) trait Poller {
    /// Block for up to `timeout_ms` waiting for events. Stores fresh
    /// `revents` on each ready channel, pushes its token onto `active`, and
    /// returns the poll return time. EINTR reports zero events.
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<usize>,
    ) -> io::Result<Instant>;

    /// Register a new channel or push an interest change for a known one.
    fn update_channel(&mut self, token: usize, ch: &mut Channel) -> io::Result<()>;

    /// Forget a channel. `ch` has already been taken out of `channels`;
    /// the slab is passed so backends with positional storage can fix up
    /// any channel they relocate.
    fn remove_channel(&mut self, token: usize, ch: &mut Channel, channels: &mut Slab<Channel>);

    fn has_channel(&self, token: usize, ch: &Channel) -> bool;
}

pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    #[cfg(all(feature = "poller-epoll", target_os = "linux"))]
    return Ok(Box::new(epoll::EpollPoller::new()?));

    #[cfg(all(
        feature = "poller-poll",
        not(all(feature = "poller-epoll", target_os = "linux"))
    ))]
    return Ok(Box::new(poll::PollPoller::new()));

    #[cfg(all(
        feature = "poller-select",
        not(feature = "poller-poll"),
        not(all(feature = "poller-epoll", target_os = "linux"))
    ))]
    return Ok(Box::new(select::SelectPoller::new()));
}

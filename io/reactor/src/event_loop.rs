//! The reactor: one poller, one timer queue, and one cross-thread task
//! queue per loop, driven by exactly one thread.
//!
//! `EventLoop` itself is neither `Send` nor `Sync`; it lives and dies on the
//! thread that created it. Everything another thread may touch goes through
//! the `Arc<LoopHandle>` — tasks are queued under a mutex and the loop is
//! woken through an eventfd (a pipe on non-Linux). Mutation of poller,
//! channel, timer, or connection state therefore only ever happens on the
//! owner thread.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slab::Slab;

use crate::channel::{self, Channel, EventTarget, Interest};
use crate::poller::{self, Poller};
use crate::timer::{REPEAT_FOREVER, TimerId, TimerQueue};

/// Fixed poll timeout. Even if a wakeup write were ever lost, a queued task
/// waits at most this long.
const POLL_TIMEOUT_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

thread_local! {
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(std::ptr::null()) };
}

/// The shareable half of a loop: cross-thread task submission, wakeup, and
/// shutdown. Cloned freely; the `EventLoop` it belongs to stays pinned to
/// its thread.
pub struct LoopHandle {
    thread_id: ThreadId,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    quitting: AtomicBool,
    in_task_phase: AtomicBool,
    iteration: AtomicU64,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Run `task` inline when called on the loop thread while the loop is
    /// live; otherwise queue it for the next iteration.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() && EventLoop::is_current_set() {
            EventLoop::with_current(|lp| task(lp));
            return;
        }
        self.queue_in_loop(task);
    }

    /// Queue `task` for the loop's task phase. Tasks queued during the task
    /// phase itself run on the next iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.in_task_phase.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Ask the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            tracing::warn!("loop wakeup write returned {n}");
        }
    }
}

/// Read side of the wakeup descriptor. Drains 8 bytes per event.
struct WakeupTarget {
    fd: RawFd,
}

impl EventTarget for WakeupTarget {
    fn on_read(&self, _lp: &EventLoop, _receive_time: Instant) {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
        if n != 8 {
            tracing::trace!("wakeup drain read returned {n}");
        }
    }
}

pub struct EventLoop {
    handle: Arc<LoopHandle>,
    poller: RefCell<Box<dyn Poller>>,
    channels: RefCell<Slab<Channel>>,
    timers: RefCell<TimerQueue>,
    active: RefCell<Vec<usize>>,
    // The loop owns the wakeup descriptors; the handle carries only the raw
    // write fd, which stays valid for as long as any task can still be
    // queued (the loop outlives its run()).
    _wakeup_read: OwnedFd,
    _wakeup_write: Option<OwnedFd>,
    wakeup_target: Arc<WakeupTarget>,
    event_handling: Cell<bool>,
    looping: Cell<bool>,
    frame_fn: RefCell<Option<Box<dyn FnMut(&EventLoop)>>>,
}

#[cfg(target_os = "linux")]
fn new_wakeup_fds() -> io::Result<(OwnedFd, Option<OwnedFd>)> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, None))
}

#[cfg(not(target_os = "linux"))]
fn new_wakeup_fds() -> io::Result<(OwnedFd, Option<OwnedFd>)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, Some(unsafe {
        OwnedFd::from_raw_fd(fds[1])
    })))
}

impl EventLoop {
    /// Create a loop owned by the calling thread.
    pub fn new() -> io::Result<EventLoop> {
        let (wakeup_read, wakeup_write) = new_wakeup_fds()?;
        let wakeup_write_raw = wakeup_write
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or_else(|| wakeup_read.as_raw_fd());

        let handle = Arc::new(LoopHandle {
            thread_id: thread::current().id(),
            pending: Mutex::new(Vec::new()),
            wakeup_fd: wakeup_write_raw,
            quitting: AtomicBool::new(false),
            in_task_phase: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
        });

        let wakeup_target = Arc::new(WakeupTarget {
            fd: wakeup_read.as_raw_fd(),
        });

        let lp = EventLoop {
            handle,
            poller: RefCell::new(poller::new_default_poller()?),
            channels: RefCell::new(Slab::new()),
            timers: RefCell::new(TimerQueue::new()),
            active: RefCell::new(Vec::new()),
            _wakeup_read: wakeup_read,
            _wakeup_write: wakeup_write,
            wakeup_target,
            event_handling: Cell::new(false),
            looping: Cell::new(false),
            frame_fn: RefCell::new(None),
        };

        let target: Arc<dyn EventTarget> = lp.wakeup_target.clone();
        lp.register_channel(lp.wakeup_target.fd, Interest::IN, Arc::downgrade(&target))?;
        Ok(lp)
    }

    pub fn handle(&self) -> Arc<LoopHandle> {
        self.handle.clone()
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Abort with a distinguished message when a thread-restricted
    /// operation is attempted off-thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.handle.is_in_loop_thread() {
            panic!(
                "event loop owned by thread {:?} was used from thread {:?}",
                self.handle.thread_id,
                thread::current().id()
            );
        }
    }

    pub(crate) fn is_current_set() -> bool {
        CURRENT_LOOP.with(|c| !c.get().is_null())
    }

    /// Access the loop currently running on this thread, if any.
    pub fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        CURRENT_LOOP.with(|c| {
            let ptr = c.get();
            if ptr.is_null() {
                None
            } else {
                // SAFETY: the pointer is published only by `run()` on this
                // thread, which borrows the loop for its whole duration; the
                // loop can neither move nor drop while the pointer is set.
                Some(f(unsafe { &*ptr }))
            }
        })
    }

    /// Per-iteration hook, run after tasks and timers.
    pub fn set_frame_callback(&self, f: impl FnMut(&EventLoop) + 'static) {
        self.assert_in_loop_thread();
        *self.frame_fn.borrow_mut() = Some(Box::new(f));
    }

    // --- channel registry ---

    pub fn register_channel(
        &self,
        fd: RawFd,
        interest: Interest,
        target: Weak<dyn EventTarget>,
    ) -> io::Result<usize> {
        self.assert_in_loop_thread();
        let mut channels = self.channels.borrow_mut();
        let token = channels.insert(Channel::new(fd, interest, target));
        let result = self.poller.borrow_mut().update_channel(token, &mut channels[token]);
        if let Err(e) = result {
            channels.remove(token);
            return Err(e);
        }
        Ok(token)
    }

    pub fn set_interest(&self, token: usize, interest: Interest) -> io::Result<()> {
        self.assert_in_loop_thread();
        let mut channels = self.channels.borrow_mut();
        let Some(ch) = channels.get_mut(token) else {
            return Ok(());
        };
        if ch.interest == interest {
            return Ok(());
        }
        ch.interest = interest;
        self.poller.borrow_mut().update_channel(token, ch)
    }

    pub fn remove_channel(&self, token: usize) {
        self.assert_in_loop_thread();
        let mut channels = self.channels.borrow_mut();
        if !channels.contains(token) {
            return;
        }
        let mut ch = channels.remove(token);
        self.poller
            .borrow_mut()
            .remove_channel(token, &mut ch, &mut channels);
    }

    pub fn has_channel(&self, token: usize) -> bool {
        self.assert_in_loop_thread();
        let channels = self.channels.borrow();
        match channels.get(token) {
            Some(ch) => self.poller.borrow().has_channel(token, ch),
            None => false,
        }
    }

    // --- timers ---

    /// One-shot timer at an absolute deadline.
    pub fn run_at(
        &self,
        when: Instant,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers
            .borrow_mut()
            .add(when, Duration::ZERO, 1, Box::new(callback))
    }

    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Periodic timer, first firing one interval from now.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().add(
            Instant::now() + interval,
            interval,
            REPEAT_FOREVER,
            Box::new(callback),
        )
    }

    /// Periodic timer that fires exactly `times` times.
    pub fn run_limited(
        &self,
        interval: Duration,
        times: i32,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().add(
            Instant::now() + interval,
            interval,
            times,
            Box::new(callback),
        )
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().cancel(id);
    }

    pub fn remove_timer(&self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timers.borrow_mut().remove(id);
    }

    // --- the loop ---

    /// Run until `quit()`. Must be called on the owning thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run called reentrantly");
        self.looping.set(true);
        let _current = CurrentLoopGuard::publish(self);
        tracing::debug!(thread = ?self.handle.thread_id, "event loop started");

        while !self.handle.quitting.load(Ordering::Acquire) {
            let mut active = self.active.take();
            active.clear();

            // Sleep no longer than the earliest timer deadline; 10s is the
            // hard upper bound either way.
            let timeout_ms = match self.timers.borrow().next_expiration() {
                Some(when) => {
                    let until = when.saturating_duration_since(Instant::now());
                    let ms = until.as_millis().min(POLL_TIMEOUT_MS as u128) as i32;
                    ms.saturating_add(1).min(POLL_TIMEOUT_MS)
                }
                None => POLL_TIMEOUT_MS,
            };

            let poll_return_time = {
                let mut channels = self.channels.borrow_mut();
                let mut poller = self.poller.borrow_mut();
                match poller.poll(timeout_ms, &mut channels, &mut active) {
                    Ok(ts) => ts,
                    Err(e) => {
                        tracing::error!("poll failed: {e}");
                        Instant::now()
                    }
                }
            };
            self.handle.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.set(true);
            for &token in &active {
                let entry = {
                    let channels = self.channels.borrow();
                    channels.get(token).map(|ch| (ch.revents, ch.target.clone()))
                };
                let Some((revents, target)) = entry else {
                    continue;
                };
                match target.upgrade() {
                    // The strong reference is held across the whole dispatch,
                    // so a callback may tear down the owning object.
                    Some(target) => channel::dispatch(&target, revents, self, poll_return_time),
                    None => tracing::trace!("channel target dropped before dispatch"),
                }
            }
            self.event_handling.set(false);
            self.active.replace(active);

            self.run_pending_tasks();
            self.tick_timers();
            self.run_frame_callback();
        }

        self.looping.set(false);
        tracing::debug!(thread = ?self.handle.thread_id, "event loop stopped");
    }

    /// Swap the queue out under the lock, then run without it. Tasks queued
    /// while these run land in the fresh vector and wait for the next
    /// iteration; a single iteration can therefore never grow unboundedly.
    fn run_pending_tasks(&self) {
        self.handle.in_task_phase.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.handle.pending.lock());
        for task in tasks {
            task(self);
        }
        self.handle.in_task_phase.store(false, Ordering::Release);
    }

    fn tick_timers(&self) {
        let now = Instant::now();
        let expired = self.timers.borrow_mut().take_expired(now);
        if expired.is_empty() {
            return;
        }
        for (seq, when, mut entry) in expired {
            if !entry.cancelled {
                (entry.callback)(self);
            }
            if entry.interval.is_zero() {
                continue;
            }
            if entry.repeat != REPEAT_FOREVER {
                entry.repeat -= 1;
                if entry.repeat <= 0 {
                    continue;
                }
            }
            let next = when + entry.interval;
            self.timers.borrow_mut().reschedule(seq, next, entry);
        }
        self.timers.borrow_mut().finish_tick();
    }

    fn run_frame_callback(&self) {
        let taken = self.frame_fn.borrow_mut().take();
        if let Some(mut f) = taken {
            f(self);
            let mut slot = self.frame_fn.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }
}

struct CurrentLoopGuard;

impl CurrentLoopGuard {
    fn publish(lp: &EventLoop) -> CurrentLoopGuard {
        CURRENT_LOOP.with(|c| c.set(lp as *const EventLoop));
        CurrentLoopGuard
    }
}

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|c| c.set(std::ptr::null()));
    }
}

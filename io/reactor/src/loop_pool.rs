//! Pool of worker event loops, one per OS thread.
//!
//! The base loop (typically running the acceptor) is never part of the
//! pool. Each worker thread constructs its own `EventLoop` and publishes
//! the handle through a condvar before the spawner moves on, so `start`
//! returns only once every worker is dispatchable.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::event_loop::{EventLoop, LoopHandle};

pub type LoopInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct EventLoopPool {
    base: Arc<LoopHandle>,
    name: String,
    next: AtomicUsize,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    workers: Vec<Arc<LoopHandle>>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl EventLoopPool {
    pub fn new(base: Arc<LoopHandle>, name: &str) -> EventLoopPool {
        EventLoopPool {
            base,
            name: name.to_string(),
            next: AtomicUsize::new(0),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Spawn `count` worker loops. Idempotent; with `count == 0` every
    /// dispatch falls back to the base loop.
    pub fn start(&self, count: usize, init: Option<LoopInitCallback>) {
        let mut inner = self.inner.lock();
        if inner.started {
            return;
        }
        inner.started = true;

        for i in 0..count {
            let slot = Arc::new((Mutex::new(None::<Arc<LoopHandle>>), Condvar::new()));
            let worker_slot = slot.clone();
            let init = init.clone();
            let thread = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || {
                    let lp = EventLoop::new()
                        .unwrap_or_else(|e| panic!("failed to create worker event loop: {e}"));
                    {
                        let (lock, condvar) = &*worker_slot;
                        *lock.lock() = Some(lp.handle());
                        condvar.notify_one();
                    }
                    if let Some(init) = init {
                        init(&lp);
                    }
                    lp.run();
                })
                .expect("failed to spawn worker thread");

            let handle = {
                let (lock, condvar) = &*slot;
                let mut published = lock.lock();
                loop {
                    if let Some(handle) = published.take() {
                        break handle;
                    }
                    condvar.wait(&mut published);
                }
            };
            inner.workers.push(handle);
            inner.threads.push(thread);
        }
    }

    /// Round-robin dispatch; the base loop when the pool is empty.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        let inner = self.inner.lock();
        if inner.workers.is_empty() {
            return self.base.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % inner.workers.len();
        inner.workers[idx].clone()
    }

    /// The same hash always maps to the same worker.
    pub fn loop_for_hash(&self, hash: usize) -> Arc<LoopHandle> {
        let inner = self.inner.lock();
        if inner.workers.is_empty() {
            return self.base.clone();
        }
        inner.workers[hash % inner.workers.len()].clone()
    }

    pub fn base(&self) -> &Arc<LoopHandle> {
        &self.base
    }

    pub fn worker_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Quit every worker and join its thread.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        for worker in &inner.workers {
            worker.quit();
        }
        for thread in inner.threads.drain(..) {
            let _ = thread.join();
        }
        inner.workers.clear();
        inner.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_handle() -> (Arc<LoopHandle>, std::thread::JoinHandle<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let joiner = std::thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            tx.send(lp.handle()).unwrap();
            lp.run();
        });
        (rx.recv().unwrap(), joiner)
    }

    #[test]
    fn round_robin_cycles_workers() {
        let (base, base_join) = base_handle();
        let pool = EventLoopPool::new(base.clone(), "worker");
        pool.start(3, None);
        assert_eq!(pool.worker_count(), 3);

        let a = pool.next_loop();
        let b = pool.next_loop();
        let c = pool.next_loop();
        let a2 = pool.next_loop();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&b, &c));
        assert!(Arc::ptr_eq(&a, &a2));
        // The base loop is never handed out while workers exist.
        assert!(!Arc::ptr_eq(&a, &base));
        assert!(!Arc::ptr_eq(&b, &base));
        assert!(!Arc::ptr_eq(&c, &base));

        pool.stop();
        base.quit();
        base_join.join().unwrap();
    }

    #[test]
    fn hash_dispatch_is_stable() {
        let (base, base_join) = base_handle();
        let pool = EventLoopPool::new(base.clone(), "worker");
        pool.start(4, None);

        for hash in [0usize, 7, 1234, usize::MAX] {
            let first = pool.loop_for_hash(hash);
            for _ in 0..8 {
                assert!(Arc::ptr_eq(&first, &pool.loop_for_hash(hash)));
            }
        }

        pool.stop();
        base.quit();
        base_join.join().unwrap();
    }

    #[test]
    fn empty_pool_dispatches_to_base() {
        let (base, base_join) = base_handle();
        let pool = EventLoopPool::new(base.clone(), "worker");
        pool.start(0, None);
        assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        assert!(Arc::ptr_eq(&pool.loop_for_hash(42), &base));
        pool.stop();
        base.quit();
        base_join.join().unwrap();
    }

    #[test]
    fn init_callback_runs_on_each_worker() {
        let (base, base_join) = base_handle();
        let pool = EventLoopPool::new(base.clone(), "worker");
        let inits = Arc::new(AtomicUsize::new(0));
        let inits2 = inits.clone();
        pool.start(
            2,
            Some(Arc::new(move |_lp: &EventLoop| {
                inits2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        // start() blocks on handle publication, which happens before init;
        // give the init calls a moment to land.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        pool.stop();
        base.quit();
        base_join.join().unwrap();
    }
}

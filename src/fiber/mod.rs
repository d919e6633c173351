//! Cooperative fiber runtime.
//!
//! A fixed pool of OS worker threads multiplexes an unbounded number of
//! fibers. A fiber is a future polled by whichever worker dequeues it;
//! suspension points are exactly the async operations it awaits (disk I/O,
//! completion triggers, explicit yields, another fiber's result). Which OS
//! thread resumes a fiber after a suspension is unspecified.
//!
//! # Entering the runtime
//!
//! Callers outside the pool enter through [`FiberPool::launch`], which blocks
//! the calling thread on a channel until the fiber has run to completion and
//! re-raises any panic the fiber raised. Background work (the catalog runner,
//! work scheduled by higher layers) uses [`FiberPool::spawn`].
//!
//! All pools are owned by the runtime object; there is no lazily-initialized
//! global state.

pub mod frame;
pub mod trigger;

pub use frame::{FrameHandle, FramePool};
pub use trigger::CompletionTrigger;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use futures::FutureExt;

use crate::config::FiberConfig;
use crate::error::{Error, Result};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One schedulable fiber: its future plus re-queue plumbing.
struct Fiber {
    future: Mutex<Option<BoxFuture>>,
    queued: AtomicBool,
    run_queue: Sender<Arc<Fiber>>,
    frame: FrameHandle,
    frames: Arc<FramePool>,
}

impl Wake for Fiber {
    fn wake(self: Arc<Self>) {
        // Coalesce wakes: a fiber sits in the run queue at most once.
        if !self.queued.swap(true, Ordering::AcqRel) {
            let _ = self.run_queue.send(self.clone());
        }
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().wake();
    }
}

/// Fixed pool of worker threads executing fibers.
pub struct FiberPool {
    run_queue: Mutex<Option<Sender<Arc<Fiber>>>>,
    frames: Arc<FramePool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl FiberPool {
    pub fn new(config: FiberConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Arc<Fiber>>();
        let frames = Arc::new(FramePool::new(config.max_frames));

        let mut workers = Vec::with_capacity(config.worker_threads);
        for id in 0..config.worker_threads {
            let rx = rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("fiber-worker-{}", id))
                    .spawn(move || worker_loop(rx))
                    .expect("failed to spawn fiber worker thread"),
            );
        }

        tracing::info!(
            workers = config.worker_threads,
            max_frames = config.max_frames,
            "Fiber pool started"
        );

        Self {
            run_queue: Mutex::new(Some(tx)),
            frames,
            workers: Mutex::new(workers),
            worker_count: config.worker_threads,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Frame pool statistics, exposed so callers can verify no frame leaks.
    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Run `fut` to completion on a fiber, blocking the calling thread until
    /// it finishes. A panic raised inside the fiber is re-raised here; frame
    /// allocation failure is reported before any fiber code runs.
    pub fn launch<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let frame = self.frames.allocate()?;
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let wrapped = async move {
            let result = AssertUnwindSafe(fut).catch_unwind().await;
            let _ = done_tx.send(result);
        };

        if let Err(err) = self.schedule(frame, Box::pin(wrapped)) {
            let _ = self.frames.release(frame);
            return Err(err);
        }

        match done_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            // The pool shut down before the fiber could report back.
            Err(_) => Err(Error::RuntimeShutdown),
        }
    }

    /// Schedule a detached fiber. Errors inside it are the fiber's own
    /// responsibility; a panic tears down its worker's current poll only.
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let frame = self.frames.allocate()?;
        let wrapped = async move {
            if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(panic = %msg, "Detached fiber panicked");
            }
        };
        if let Err(err) = self.schedule(frame, Box::pin(wrapped)) {
            let _ = self.frames.release(frame);
            return Err(err);
        }
        Ok(())
    }

    fn schedule(&self, frame: FrameHandle, fut: BoxFuture) -> Result<()> {
        let queue = self.run_queue.lock().unwrap();
        let tx = queue.as_ref().ok_or(Error::RuntimeShutdown)?;
        let fiber = Arc::new(Fiber {
            future: Mutex::new(Some(fut)),
            queued: AtomicBool::new(true),
            run_queue: tx.clone(),
            frame,
            frames: self.frames.clone(),
        });
        tx.send(fiber).map_err(|_| Error::RuntimeShutdown)?;
        Ok(())
    }

    /// Stop accepting fibers and join the workers once the queue drains.
    pub fn shutdown(&self) {
        let tx = self.run_queue.lock().unwrap().take();
        drop(tx);
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        tracing::info!("Fiber pool shut down");
    }
}

impl Drop for FiberPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Arc<Fiber>>) {
    // recv() fails only when the queue is disconnected and drained, which is
    // the shutdown signal.
    while let Ok(fiber) = rx.recv() {
        // Clear the queued flag before polling so a wake that races with this
        // poll re-queues the fiber instead of getting lost.
        fiber.queued.store(false, Ordering::Release);

        let waker = Waker::from(fiber.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = fiber.future.lock().unwrap();
        let Some(mut fut) = slot.take() else {
            continue;
        };
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                drop(slot);
                if let Err(err) = fiber.frames.release(fiber.frame) {
                    tracing::error!(error = %err, "Failed to release fiber frame");
                }
            }
            Poll::Pending => {
                *slot = Some(fut);
            }
        }
    }
}

/// Yield the current fiber back to the scheduler once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_pool() -> FiberPool {
        FiberPool::new(FiberConfig::default().worker_threads(2).max_frames(64))
    }

    #[test]
    fn test_launch_returns_value() {
        let pool = test_pool();
        let result = pool.launch(async { 2 + 2 }).unwrap();
        assert_eq!(result, 4);
    }

    #[test]
    fn test_launch_across_yields() {
        let pool = test_pool();
        let result = pool
            .launch(async {
                let mut total = 0u64;
                for i in 0..100 {
                    total += i;
                    yield_now().await;
                }
                total
            })
            .unwrap();
        assert_eq!(result, 4950);
    }

    #[test]
    #[should_panic(expected = "fiber went boom")]
    fn test_launch_propagates_panic() {
        let pool = test_pool();
        let _ = pool.launch::<_, ()>(async { panic!("fiber went boom") });
    }

    #[test]
    fn test_frame_released_after_completion() {
        let pool = test_pool();
        let baseline = pool.frames().live_frames();
        pool.launch(async {}).unwrap();
        assert_eq!(pool.frames().live_frames(), baseline);
    }

    #[test]
    fn test_frame_exhaustion_reported_to_launcher() {
        let pool = FiberPool::new(FiberConfig::default().worker_threads(1).max_frames(0));
        assert!(matches!(
            pool.launch(async { 1 }),
            Err(Error::FramePoolExhausted)
        ));
    }

    #[test]
    fn test_spawned_fibers_all_run() {
        // Every spawned fiber may hold its frame at once, so the pool must
        // have at least as many frames as fibers.
        let pool = FiberPool::new(FiberConfig::default().worker_threads(2).max_frames(128));
        let trigger = CompletionTrigger::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            trigger.wait_for_one_more();
            let trigger = trigger.clone();
            let counter = counter.clone();
            pool.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                yield_now().await;
                trigger.complete(Ok(()));
            })
            .unwrap();
        }

        trigger.wait_sync().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.frames().live_frames(), 0);
    }

    #[test]
    fn test_fibers_wait_on_each_other() {
        let pool = test_pool();
        let first = CompletionTrigger::new();
        first.wait_for_one_more();

        let downstream = first.clone();
        let result = pool
            .launch(async move {
                // A second fiber completes the trigger this one waits on.
                downstream.complete(Ok(()));
                42
            })
            .unwrap();
        first.wait_sync().unwrap();
        assert_eq!(result, 42);
    }
}

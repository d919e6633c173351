//! Asynchronous disk controller.
//!
//! Submissions are queued to a small pool of I/O threads; completion attaches
//! the result to the disk event, pushes the event onto the ready list and
//! decrements the caller's completion trigger, which resumes the waiting
//! fiber. I/O errors travel as results, never as panics across the async
//! boundary. The controller performs no retries and supports no cancellation;
//! both are the caller's decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::config::DiskConfig;
use crate::error::{Error, Result};
use crate::fiber::CompletionTrigger;

use super::volume::Volume;

/// Contiguous extent of physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub count: u64,
}

impl BlockRange {
    pub fn new(start: u64, count: u64) -> Self {
        Self { start, count }
    }

    /// First block past the extent.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

struct EventInner {
    mode: IoMode,
    range: BlockRange,
    buffer: Mutex<Option<Vec<u8>>>,
    result: Mutex<Option<std::result::Result<(), String>>>,
}

/// One outstanding (or completed) disk operation.
#[derive(Clone)]
pub struct DiskEvent {
    inner: Arc<EventInner>,
}

impl DiskEvent {
    fn new(mode: IoMode, range: BlockRange, buffer: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                mode,
                range,
                buffer: Mutex::new(Some(buffer)),
                result: Mutex::new(None),
            }),
        }
    }

    pub fn mode(&self) -> IoMode {
        self.inner.mode
    }

    pub fn range(&self) -> BlockRange {
        self.inner.range
    }

    /// Take the event's buffer. For reads this is the filled destination.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        self.inner.buffer.lock().unwrap().take()
    }

    /// Result of the operation; `Ok` until completion is observed.
    pub fn result(&self) -> Result<()> {
        match &*self.inner.result.lock().unwrap() {
            Some(Err(msg)) => Err(Error::InvalidState(msg.clone())),
            _ => Ok(()),
        }
    }

    fn set_result(&self, result: &Result<()>) {
        let stored = match result {
            Ok(()) => Ok(()),
            Err(err) => Err(err.to_string()),
        };
        *self.inner.result.lock().unwrap() = Some(stored);
    }
}

struct IoRequest {
    volume: Arc<Volume>,
    event: DiskEvent,
    trigger: CompletionTrigger,
}

struct Shared {
    ready: Mutex<Vec<DiskEvent>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

pub struct DiskController {
    tx: Mutex<Option<Sender<IoRequest>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl DiskController {
    pub fn new(config: &DiskConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<IoRequest>();
        let shared = Arc::new(Shared {
            ready: Mutex::new(Vec::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        });

        let mut threads = Vec::with_capacity(config.io_threads);
        for id in 0..config.io_threads {
            let rx = rx.clone();
            let shared = shared.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("disk-io-{}", id))
                    .spawn(move || io_loop(rx, shared))
                    .expect("failed to spawn disk I/O thread"),
            );
        }

        Self {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
            shared,
        }
    }

    /// Submit one asynchronous block operation. The trigger is armed here and
    /// fired by the I/O thread on completion. For reads, `buffer` is the
    /// pre-sized destination; for writes it is the data to persist.
    pub fn submit(
        &self,
        volume: &Arc<Volume>,
        range: BlockRange,
        buffer: Vec<u8>,
        mode: IoMode,
        trigger: &CompletionTrigger,
    ) -> Result<DiskEvent> {
        let event = DiskEvent::new(mode, range, buffer);
        trigger.wait_for_one_more();

        let request = IoRequest {
            volume: volume.clone(),
            event: event.clone(),
            trigger: trigger.clone(),
        };
        let guard = self.tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(Error::RuntimeShutdown)?;
        if tx.send(request).is_err() {
            trigger.complete(Err(Error::RuntimeShutdown));
            return Err(Error::RuntimeShutdown);
        }
        Ok(event)
    }

    /// Deliver every completed event to `cb`, draining the ready list.
    pub fn for_each_ready(&self, mut cb: impl FnMut(DiskEvent)) {
        let ready: Vec<DiskEvent> = self.shared.ready.lock().unwrap().drain(..).collect();
        for event in ready {
            cb(event);
        }
    }

    /// Number of read submissions serviced.
    pub fn read_count(&self) -> u64 {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Number of write submissions serviced. One coalesced flush counts once.
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Stop accepting submissions and join the I/O threads.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_loop(rx: Receiver<IoRequest>, shared: Arc<Shared>) {
    while let Ok(request) = rx.recv() {
        let result = perform(&request);
        if let Err(err) = &result {
            tracing::error!(
                start = request.event.range().start,
                count = request.event.range().count,
                error = %err,
                "Disk operation failed"
            );
        }
        request.event.set_result(&result);
        shared.ready.lock().unwrap().push(request.event.clone());
        match request.event.mode() {
            IoMode::Read => shared.reads.fetch_add(1, Ordering::SeqCst),
            IoMode::Write => shared.writes.fetch_add(1, Ordering::SeqCst),
        };
        request.trigger.complete(result);
    }
}

fn perform(request: &IoRequest) -> Result<()> {
    let range = request.event.range();
    match request.event.mode() {
        IoMode::Read => {
            let mut guard = request.event.inner.buffer.lock().unwrap();
            let buf = guard
                .as_mut()
                .ok_or_else(|| Error::InvalidState("read event has no buffer".to_string()))?;
            request.volume.read_blocks(range, buf)
        }
        IoMode::Write => {
            let guard = request.event.inner.buffer.lock().unwrap();
            let buf = guard
                .as_ref()
                .ok_or_else(|| Error::InvalidState("write event has no buffer".to_string()))?;
            request.volume.write_blocks(range, buf)?;
            request.volume.sync()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn setup(dir: &TempDir) -> (Arc<Volume>, DiskController) {
        let config = DiskConfig::default().block_size(512).io_threads(2);
        let volume = Arc::new(Volume::open(dir.path().join("vol"), &config).unwrap());
        (volume, DiskController::new(&config))
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let (volume, controller) = setup(&dir);
        let range = volume.allocate_blocks(1);

        let trigger = CompletionTrigger::new();
        controller
            .submit(&volume, range, vec![0x5a; 512], IoMode::Write, &trigger)
            .unwrap();
        trigger.wait_sync().unwrap();

        let trigger = CompletionTrigger::new();
        let event = controller
            .submit(&volume, range, vec![0u8; 512], IoMode::Read, &trigger)
            .unwrap();
        trigger.wait_sync().unwrap();

        assert_eq!(event.take_buffer().unwrap(), vec![0x5a; 512]);
        assert_eq!(controller.write_count(), 1);
        assert_eq!(controller.read_count(), 1);
    }

    #[test]
    fn test_error_attached_to_event_not_thrown() {
        let dir = TempDir::new().unwrap();
        let (volume, controller) = setup(&dir);

        // Reading far past the end of the file fails at the OS level.
        let bogus = BlockRange::new(1 << 30, 1);
        let trigger = CompletionTrigger::new();
        let event = controller
            .submit(&volume, bogus, vec![0u8; 512], IoMode::Read, &trigger)
            .unwrap();

        assert!(trigger.wait_sync().is_err());
        assert!(event.result().is_err());
    }

    #[test]
    fn test_for_each_ready_drains_completions() {
        let dir = TempDir::new().unwrap();
        let (volume, controller) = setup(&dir);
        let range = volume.allocate_blocks(1);

        let trigger = CompletionTrigger::new();
        controller
            .submit(&volume, range, vec![1u8; 512], IoMode::Write, &trigger)
            .unwrap();
        trigger.wait_sync().unwrap();

        let mut seen = 0;
        controller.for_each_ready(|event| {
            assert_eq!(event.mode(), IoMode::Write);
            seen += 1;
        });
        assert_eq!(seen, 1);

        controller.for_each_ready(|_| seen += 10);
        assert_eq!(seen, 1, "ready list drains on delivery");
    }

    #[test]
    fn test_one_trigger_fans_in_multiple_events() {
        let dir = TempDir::new().unwrap();
        let (volume, controller) = setup(&dir);

        let trigger = CompletionTrigger::new();
        for _ in 0..8 {
            let range = volume.allocate_blocks(1);
            controller
                .submit(&volume, range, vec![9u8; 512], IoMode::Write, &trigger)
                .unwrap();
        }
        trigger.wait_sync().unwrap();
        assert_eq!(controller.write_count(), 8);
    }
}

//! Frame pool backing fiber execution.
//!
//! Every live fiber owns exactly one frame for its lifetime. Frames live in a
//! fixed-capacity arena and are addressed through generation-checked handles,
//! so releasing through a stale handle is a detectable error instead of
//! corrupting another fiber's slot.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Handle to one allocated frame slot.
///
/// The generation field is bumped every time a slot is recycled, which makes
/// handles from a previous occupant invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    live: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

/// Fixed-capacity arena of fiber frames.
pub struct FramePool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                live: false,
            })
            .collect();
        let free = (0..capacity).rev().collect();
        Self {
            state: Mutex::new(PoolState {
                slots,
                free,
                live: 0,
            }),
            capacity,
        }
    }

    /// Allocate a frame slot. Fails with [`Error::FramePoolExhausted`] when
    /// every slot is live; the caller must not have mutated shared state yet.
    pub fn allocate(&self) -> Result<FrameHandle> {
        let mut state = self.state.lock().unwrap();
        let index = state.free.pop().ok_or(Error::FramePoolExhausted)?;
        let slot = &mut state.slots[index];
        slot.live = true;
        let generation = slot.generation;
        state.live += 1;
        Ok(FrameHandle { index, generation })
    }

    /// Return a frame slot to the pool. The slot's generation advances so the
    /// handle cannot be released twice.
    pub fn release(&self, handle: FrameHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .slots
            .get_mut(handle.index)
            .ok_or(Error::StaleFrameHandle)?;
        if !slot.live || slot.generation != handle.generation {
            return Err(Error::StaleFrameHandle);
        }
        slot.live = false;
        slot.generation += 1;
        state.live -= 1;
        state.free.push(handle.index);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently backing a running or suspended fiber.
    pub fn live_frames(&self) -> usize {
        self.state.lock().unwrap().live
    }

    pub fn free_frames(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }
}

//! Bounded ring of packet slots shared by every pipeline stage.
//!
//! Each stage (input, then each processor in declared order, then output)
//! owns one monotonically increasing sequence counter: the count of slots
//! it has completed so far. A stage may advance past slot index `seq` only
//! once the stage immediately upstream has published that same `seq` (or,
//! for the input stage, only once the output stage has freed enough room
//! that the ring won't be lapped). This is the "cursor per stage,
//! wait/advance protocol" model: progress of one stage only ever wakes the
//! immediate neighbor waiting on its boundary, and slot content itself is
//! never locked across stages — ownership passes by cursor advancement.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ts_packet::TsPacket;

/// Lifecycle tag of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not yet written by the input stage this lap.
    Empty,
    /// Holds a packet produced by the input stage (or passed through).
    Filled,
    /// Replaced with a PID-0x1FFF packet by a processor.
    Nulled,
    /// Removed from the stream by a processor; the output never sees it.
    Dropped,
    /// Carries a flush hint: downstream should emit any buffered state.
    Flushed,
    /// End-of-stream marker; no further slots follow.
    Terminal,
}

/// One ring slot: the packet plus its pipeline-internal envelope.
#[derive(Clone)]
pub struct Slot {
    pub packet: TsPacket,
    pub state: SlotState,
    pub flush_hint: bool,
    pub bitrate_changed: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            packet: TsPacket::default(),
            state: SlotState::Empty,
            flush_hint: false,
            bitrate_changed: false,
        }
    }
}

/// How long a boundary wait blocks before re-checking the abort signal.
/// Keeping this short bounds shutdown latency without busy-waiting.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One stage's published progress: how many slots it has completed, total
/// since pipeline start (not wrapped to the ring's capacity).
struct Boundary {
    completed: Mutex<u64>,
    advanced: Condvar,
}

impl Boundary {
    fn new() -> Self {
        Boundary {
            completed: Mutex::new(0),
            advanced: Condvar::new(),
        }
    }

    fn get(&self) -> u64 {
        *self.completed.lock()
    }

    fn advance_to(&self, value: u64) {
        *self.completed.lock() = value;
        self.advanced.notify_one();
    }

    /// Block until this boundary has completed at least `target` slots,
    /// or the abort signal fires. Returns `false` on abort.
    fn wait_until_at_least(&self, target: u64, abort: &dyn Fn() -> bool) -> bool {
        let mut guard = self.completed.lock();
        while *guard < target {
            if abort() {
                return false;
            }
            self.advanced.wait_for(&mut guard, WAIT_POLL_INTERVAL);
        }
        true
    }
}

/// The shared ring. `capacity` slots, one [`Boundary`] per stage (input,
/// each processor, output, in declared order).
pub struct Ring {
    slots: Vec<Mutex<Slot>>,
    capacity: u64,
    boundaries: Vec<Boundary>,
}

impl Ring {
    /// `capacity` is the number of slots (`N` in the spec); `stage_count`
    /// is 2 + number of processors (input and output each count as one
    /// stage).
    pub fn new(capacity: usize, stage_count: usize) -> Arc<Ring> {
        assert!(capacity > 0, "ring capacity must be nonzero");
        assert!(stage_count >= 2, "a pipeline needs at least input and output");
        Arc::new(Ring {
            slots: (0..capacity).map(|_| Mutex::new(Slot::default())).collect(),
            capacity: capacity as u64,
            boundaries: (0..stage_count).map(|_| Boundary::new()).collect(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn stage_count(&self) -> usize {
        self.boundaries.len()
    }

    /// A cursor handle for the stage at `stage_index` (0 = input,
    /// `stage_count() - 1` = output).
    pub fn cursor(self: &Arc<Self>, stage_index: usize) -> StageCursor {
        assert!(stage_index < self.boundaries.len(), "stage index out of range");
        StageCursor {
            ring: Arc::clone(self),
            stage_index,
            position: 0,
        }
    }

    /// Slot state as last published by the stage at `stage_index`, purely
    /// for diagnostics (`list`/`suspend` reporting); not used on the hot
    /// path.
    pub fn completed(&self, stage_index: usize) -> u64 {
        self.boundaries[stage_index].get()
    }
}

/// A stage's handle onto the ring: tracks its own progress and knows how
/// to wait for the next slot to become available (or, for the input
/// stage, how to wait for room to produce into).
pub struct StageCursor {
    ring: Arc<Ring>,
    stage_index: usize,
    position: u64,
}

impl StageCursor {
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Block until the next slot this stage should handle is ready, then
    /// return its index into the ring's slot array. Returns `None` if
    /// `abort` reports true while waiting.
    pub fn wait_for_slot(&self, abort: &dyn Fn() -> bool) -> Option<usize> {
        let ready = if self.stage_index == 0 {
            let output = self.ring.boundaries.len() - 1;
            let floor = self.position.saturating_sub(self.ring.capacity - 1);
            self.ring.boundaries[output].wait_until_at_least(floor, abort)
        } else {
            self.ring.boundaries[self.stage_index - 1]
                .wait_until_at_least(self.position + 1, abort)
        };
        if !ready {
            return None;
        }
        Some((self.position % self.ring.capacity) as usize)
    }

    /// Borrow the slot this cursor currently points at. Caller must have
    /// called [`Self::wait_for_slot`] first to know it's ready.
    pub fn slot(&self, index: usize) -> parking_lot::MutexGuard<'_, Slot> {
        self.ring.slots[index].lock()
    }

    /// Publish completion of the current slot and advance the cursor.
    /// Wakes the immediate downstream neighbor (or, for the output stage,
    /// the input stage waiting on ring room).
    pub fn publish(&mut self) {
        self.position += 1;
        self.ring.boundaries[self.stage_index].advance_to(self.position);
    }

    /// Pin this cursor's progress to track another stage's, one slot
    /// behind — used when a processor is suspended and slots must bypass
    /// it untouched (spec §4.6, "suspend/resume of a processor").
    pub fn skip_to(&mut self, upstream_position: u64) {
        if upstream_position > self.position {
            self.position = upstream_position;
            self.ring.boundaries[self.stage_index].advance_to(self.position);
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

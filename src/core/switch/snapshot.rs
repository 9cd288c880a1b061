//! State preservation and queue snapshots
//!
//! Checksummed serialization of plugin state plus ready/blocked-queue
//! snapshots taken before a scheduler switch, consumed only by rollback.

use core::ptr::NonNull;

use crate::config::{CFG_STATE_BUF_SIZE, CFG_TASK_MAX};
use crate::error::{KernelError, KernelResult};
use crate::plugin::SchedulerDescriptor;
use crate::task::Tcb;
use crate::types::{Prio, TaskState, TimeUs};

/// Seed of the rotate-xor checksum fold
pub const CHECKSUM_SEED: u32 = 0x5749;

/// Rotate-xor fold over a word stream. Tamper detection only, not
/// cryptographic.
pub fn fold_checksum<I>(words: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let mut acc = CHECKSUM_SEED;
    for w in words {
        acc = acc.rotate_left(7) ^ w;
    }
    acc
}

/// Checksum over a byte image, folded as little-endian words
pub fn fold_checksum_bytes(bytes: &[u8]) -> u32 {
    fold_checksum(bytes.chunks(4).map(|chunk| {
        let mut w = [0u8; 4];
        w[..chunk.len()].copy_from_slice(chunk);
        u32::from_le_bytes(w)
    }))
}

#[inline]
fn ptr_words(tcb: Option<NonNull<Tcb>>) -> [u32; 2] {
    let raw = tcb.map_or(0u64, |p| p.as_ptr() as usize as u64);
    [raw as u32, (raw >> 32) as u32]
}

// ============ Plugin state preservation ============

/// Buffer holding one plugin's serialized state plus its checksum
pub struct StateBuffer {
    pub data: [u8; CFG_STATE_BUF_SIZE],
    pub used: usize,
    pub checksum: u32,
    pub saved: bool,
}

impl StateBuffer {
    pub const fn new() -> Self {
        StateBuffer {
            data: [0; CFG_STATE_BUF_SIZE],
            used: 0,
            checksum: 0,
            saved: false,
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.checksum = 0;
        self.saved = false;
    }

    /// Serialize a plugin's state into the buffer.
    ///
    /// Calls the plugin's own save hook when present, otherwise copies the
    /// descriptor image verbatim. The checksum is stored alongside.
    pub fn save_scheduler_state(&mut self, desc: &'static SchedulerDescriptor) -> KernelResult<()> {
        let used = match desc.ops.save_state {
            Some(save) => save(&mut self.data)?,
            None => {
                let image = desc.as_bytes();
                if image.len() > self.data.len() {
                    return Err(KernelError::BufferTooSmall);
                }
                self.data[..image.len()].copy_from_slice(image);
                image.len()
            }
        };

        if used > self.data.len() {
            return Err(KernelError::BufferTooSmall);
        }

        self.used = used;
        self.checksum = fold_checksum_bytes(&self.data[..used]);
        self.saved = true;
        Ok(())
    }

    /// Hand the saved state back to the plugin after verifying integrity.
    pub fn restore_scheduler_state(&self, desc: &'static SchedulerDescriptor) -> KernelResult<()> {
        if !self.saved {
            return Err(KernelError::InvalidParameter);
        }
        if fold_checksum_bytes(&self.data[..self.used]) != self.checksum {
            return Err(KernelError::ChecksumError);
        }

        match desc.ops.restore_state {
            Some(restore) => restore(&self.data[..self.used]),
            None => Ok(()),
        }
    }
}

impl Default for StateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Queue snapshots ============

/// Ordered image of a task queue: references plus each task's priority and
/// lifecycle state at snapshot time. The checksum covers the reference
/// array only.
pub struct QueueSnapshot {
    pub tasks: [Option<NonNull<Tcb>>; CFG_TASK_MAX],
    pub prios: [Prio; CFG_TASK_MAX],
    pub states: [TaskState; CFG_TASK_MAX],
    pub len: usize,
    pub timestamp_us: TimeUs,
    pub checksum: u32,
}

impl QueueSnapshot {
    pub const fn new() -> Self {
        QueueSnapshot {
            tasks: [None; CFG_TASK_MAX],
            prios: [0; CFG_TASK_MAX],
            states: [TaskState::Invalid; CFG_TASK_MAX],
            len: 0,
            timestamp_us: 0,
            checksum: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record the traversal order of a queue walk.
    pub fn capture<I>(&mut self, walk: I, now: TimeUs) -> KernelResult<()>
    where
        I: IntoIterator<Item = NonNull<Tcb>>,
    {
        self.reset();

        for tcb in walk {
            if self.len >= CFG_TASK_MAX {
                return Err(KernelError::NoMoreTasks);
            }
            let tcb_ref = unsafe { tcb.as_ref() };
            self.tasks[self.len] = Some(tcb);
            self.prios[self.len] = tcb_ref.prio;
            self.states[self.len] = tcb_ref.state;
            self.len += 1;
        }

        self.timestamp_us = now;
        self.checksum = self.compute_checksum();
        Ok(())
    }

    /// Fold over the reference array
    pub fn compute_checksum(&self) -> u32 {
        fold_checksum(
            self.tasks[..self.len]
                .iter()
                .flat_map(|t| ptr_words(*t)),
        )
    }

    /// Reject tampered snapshots before any restore
    pub fn verify(&self) -> KernelResult<()> {
        if self.compute_checksum() != self.checksum {
            return Err(KernelError::ChecksumError);
        }
        Ok(())
    }

    /// Write the recorded priority and state back into every task
    pub fn apply_attributes(&self) {
        for i in 0..self.len {
            if let Some(tcb) = self.tasks[i] {
                let tcb_ref = unsafe { &mut *tcb.as_ptr() };
                tcb_ref.prio = self.prios[i];
                tcb_ref.state = self.states[i];
            }
        }
    }

    /// Re-admit the snapshot into a plugin: clear its queues, then add the
    /// tasks in snapshot order with their recorded priority and state.
    pub fn restore_to_scheduler(&self, desc: &'static SchedulerDescriptor) -> KernelResult<()> {
        self.verify()?;

        desc.clear_queues();
        self.apply_attributes();

        for tcb in self.tasks[..self.len].iter().flatten() {
            unsafe { desc.add_task(*tcb)? };
        }
        Ok(())
    }
}

impl Default for QueueSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

//! Time management module
//!
//! Tick handling, task sleep via the blocked chain, and the monotonic
//! microsecond time base used for deadlines and switch timing.

use core::ptr::NonNull;

use crate::config::CFG_TICK_RATE_HZ;
use crate::core::cs_cell::CsCell;
use crate::critical::{critical_section, is_isr_context};
use crate::error::{KernelError, KernelResult};
use crate::kernel;
use crate::sched;
use crate::task::Tcb;
use crate::types::{TaskState, Tick, TimeUs};

/// Microseconds per system tick
pub const US_PER_TICK: TimeUs = 1_000_000 / CFG_TICK_RATE_HZ as TimeUs;

// ============ Blocked chain ============

/// Doubly linked chain of sleeping/blocked tasks, linked through the TCB's
/// blocked links. This is the queue the switch controller snapshots.
struct BlockedList {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
}

impl BlockedList {
    const fn new() -> Self {
        BlockedList {
            head: None,
            tail: None,
        }
    }

    unsafe fn insert_tail(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        tcb_ref.blocked_next = None;
        tcb_ref.blocked_prev = self.tail;

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).blocked_next = Some(tcb) },
            None => self.head = Some(tcb),
        }
        self.tail = Some(tcb);
    }

    unsafe fn remove(&mut self, tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        match tcb_ref.blocked_prev {
            Some(prev) => unsafe { (*prev.as_ptr()).blocked_next = tcb_ref.blocked_next },
            None => self.head = tcb_ref.blocked_next,
        }
        match tcb_ref.blocked_next {
            Some(next) => unsafe { (*next.as_ptr()).blocked_prev = tcb_ref.blocked_prev },
            None => self.tail = tcb_ref.blocked_prev,
        }

        tcb_ref.blocked_next = None;
        tcb_ref.blocked_prev = None;
    }

    fn contains(&self, tcb: NonNull<Tcb>) -> bool {
        let tcb_ref = unsafe { tcb.as_ref() };
        tcb_ref.blocked_next.is_some() || tcb_ref.blocked_prev.is_some() || self.head == Some(tcb)
    }
}

static BLOCKED: CsCell<BlockedList> = CsCell::new(BlockedList::new());

/// Head of the blocked chain; walk it through `blocked_next`
pub(crate) fn blocked_head() -> Option<NonNull<Tcb>> {
    critical_section(|cs| BLOCKED.get(cs).head)
}

/// Unlink a task from the blocked chain if present
pub(crate) fn unblock_remove(tcb: NonNull<Tcb>) {
    critical_section(|cs| {
        let blocked = BLOCKED.get(cs);
        if blocked.contains(tcb) {
            unsafe { blocked.remove(tcb) };
        }
    });
}

/// Rebuild the blocked chain from a snapshot's task order
pub(crate) fn restore_blocked(tasks: &[Option<NonNull<Tcb>>]) {
    critical_section(|cs| {
        let blocked = BLOCKED.get(cs);

        while let Some(head) = blocked.head {
            unsafe { blocked.remove(head) };
        }
        for tcb in tasks.iter().flatten() {
            unsafe { blocked.insert_tail(*tcb) };
        }
    });
}

/// Reset the blocked chain (kernel re-initialization only)
pub(crate) fn reset_blocked() {
    critical_section(|cs| {
        *BLOCKED.get(cs) = BlockedList::new();
    });
}

// ============ Time base ============

/// Monotonic microsecond counter derived from the tick counter
#[inline]
pub fn time_now_us() -> TimeUs {
    kernel::KERNEL.tick_get() as TimeUs * US_PER_TICK
}

/// Current tick count
#[inline]
pub fn tick_now() -> Tick {
    kernel::KERNEL.tick_get()
}

// ============ Tick handler ============

/// System tick hook, invoked by the external tick driver (SysTick).
///
/// Advances the time base, wakes expired sleepers, and runs time-slice
/// accounting for the active plugin.
pub fn tick() {
    kernel::KERNEL.tick_increment();

    if !kernel::KERNEL.is_running() && !kernel::KERNEL.is_initialized() {
        return;
    }

    let mut woke = false;
    critical_section(|cs| {
        let blocked = BLOCKED.get(cs);

        let mut cursor = blocked.head;
        while let Some(tcb) = cursor {
            cursor = unsafe { tcb.as_ref().blocked_next };

            let tcb_ref = unsafe { &mut *tcb.as_ptr() };
            if tcb_ref.tick_remain > 0 {
                tcb_ref.tick_remain -= 1;
            }

            if tcb_ref.tick_remain == 0 {
                unsafe { blocked.remove(tcb) };
                tcb_ref.state = TaskState::Ready;

                if let Ok(desc) = sched::active_scheduler() {
                    let _ = unsafe { desc.add_task(tcb) };
                }
                woke = true;
            }
        }
    });

    sched::tick_slice();

    if woke {
        sched::schedule();
    }
}

// ============ Sleep ============

/// Sleep the calling task for the given number of ticks
pub fn task_sleep(ticks: Tick) -> KernelResult<()> {
    if !kernel::KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }
    if ticks == 0 {
        return Ok(());
    }

    critical_section(|cs| {
        let cur = unsafe { kernel::tcb_cur_ptr() }.ok_or(KernelError::TaskInvalid)?;
        let tcb_ref = unsafe { &mut *cur.as_ptr() };

        tcb_ref.tick_remain = ticks;
        tcb_ref.state = TaskState::Blocked;

        if let Ok(desc) = sched::active_scheduler() {
            match unsafe { desc.remove_task(cur) } {
                Ok(()) | Err(KernelError::TaskNotQueued) => {}
                Err(e) => return Err(e),
            }
        }

        unsafe { BLOCKED.get(cs).insert_tail(cur) };
        Ok(())
    })?;

    sched::schedule();
    Ok(())
}

/// Sleep in milliseconds, rounded to ticks
pub fn task_sleep_ms(ms: u32) -> KernelResult<()> {
    let ticks = (ms as u64 * CFG_TICK_RATE_HZ as u64 / 1000) as Tick;
    task_sleep(ticks.max(1))
}

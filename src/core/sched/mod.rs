//! Scheduler module
//!
//! The kernel core never implements a scheduling policy itself: it drives
//! whichever plugin is currently active through the capability vector and
//! pends PendSV when the selected task differs from the running one.

pub mod edf;
pub mod plugin;
pub mod prio_tbl;
pub mod priority;
pub mod rdy_list;
pub mod rr;

pub use prio_tbl::PrioTable;
pub use rdy_list::TaskQueue;

use core::sync::atomic::{AtomicU8, Ordering};

use crate::critical::critical_section;
use crate::error::KernelResult;
use crate::kernel;
use crate::plugin::SchedulerDescriptor;
use crate::types::SchedulerId;

/// Identifier of the currently active plugin
static ACTIVE: AtomicU8 = AtomicU8::new(plugin::SCHED_ID_PRIORITY);

/// Identifier of the active scheduler plugin
#[inline]
pub fn active_scheduler_id() -> SchedulerId {
    ACTIVE.load(Ordering::Acquire)
}

/// Descriptor of the active scheduler plugin
pub fn active_scheduler() -> KernelResult<&'static SchedulerDescriptor> {
    plugin::lookup_scheduler(active_scheduler_id())
}

/// Install a plugin as the active one. Only the switch controller and
/// kernel initialization may do this.
pub(crate) fn set_active(id: SchedulerId) {
    ACTIVE.store(id, Ordering::Release);
}

/// Main scheduling point
///
/// Asks the active plugin for the next task and pends a context switch if
/// it differs from the running one. Called after any operation that may
/// change task readiness, from thread or handler context.
pub fn schedule() {
    if !kernel::KERNEL.is_running() {
        return;
    }

    if kernel::KERNEL.sched_lock_nesting() > 0 {
        return;
    }

    critical_section(|_cs| {
        let Ok(desc) = active_scheduler() else {
            return;
        };

        // Empty plugin queues fall back to the kernel-owned idle task
        let next = desc.select_next().or_else(kernel::idle_tcb_ptr);

        if let Some(next) = next {
            unsafe {
                if Some(next) != kernel::tcb_cur_ptr() {
                    kernel::set_tcb_next_ptr(Some(next));
                    crate::port::ctx_sw();
                }
            }
        }
    });
}

/// Rotate the current task to the back of its plugin queue and reschedule.
///
/// Implements both voluntary yield and quantum expiry; rotation goes
/// through the capability vector so the queue discipline stays opaque.
pub(crate) fn rotate_current() {
    critical_section(|_cs| {
        let Ok(desc) = active_scheduler() else {
            return;
        };

        unsafe {
            if let Some(cur) = kernel::tcb_cur_ptr() {
                if desc.remove_task(cur).is_ok() {
                    let _ = desc.add_task(cur);
                }
            }
        }
    });

    schedule();
}

/// Time-slice accounting, called once per tick from the tick handler.
pub(crate) fn tick_slice() {
    let expired = critical_section(|_cs| unsafe {
        let Some(cur) = kernel::tcb_cur_ptr() else {
            return false;
        };
        let cur = &mut *cur.as_ptr();

        cur.total_runtime = cur.total_runtime.wrapping_add(1);

        if cur.time_quanta == 0 {
            return false;
        }

        if cur.time_quanta_ctr > 0 {
            cur.time_quanta_ctr -= 1;
        }

        if cur.time_quanta_ctr == 0 {
            cur.time_quanta_ctr = cur.time_quanta;
            return true;
        }
        false
    });

    if expired {
        rotate_current();
    }
}

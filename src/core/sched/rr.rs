//! Round-robin scheduler plugin
//!
//! One FIFO queue for every task, serviced head-first. Rotation happens at
//! the core scheduling points: quantum expiry and voluntary yield re-queue
//! the departing task at the tail.

use core::ptr::NonNull;

use crate::config::CFG_TIME_QUANTA_DEFAULT;
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::sched::plugin::{SchedulerDescriptor, SchedulerOps, SCHED_ID_RR};
use crate::sched::rdy_list::TaskQueue;
use crate::task::Tcb;
use crate::types::Tick;

struct RrState {
    queue: TaskQueue,
    default_quanta: Tick,
}

impl RrState {
    const fn new() -> Self {
        RrState {
            queue: TaskQueue::new(),
            default_quanta: CFG_TIME_QUANTA_DEFAULT,
        }
    }
}

static STATE: CsCell<RrState> = CsCell::new(RrState::new());

/// Plugin descriptor for the round-robin scheduler
pub static RR_SCHEDULER: SchedulerDescriptor = SchedulerDescriptor {
    id: SCHED_ID_RR,
    name: "round-robin",
    ops: SchedulerOps {
        init: Some(init),
        add_task: Some(add_task),
        remove_task: Some(remove_task),
        select_next: Some(select_next),
        can_accept: None,
        save_state: Some(save_state),
        restore_state: Some(restore_state),
        clear_queues: Some(clear_queues),
        adjust_priority: None,
    },
};

fn init() -> KernelResult<()> {
    // Queues survive activation: migration populates them before init runs
    Ok(())
}

unsafe fn add_task(tcb: NonNull<Tcb>) -> KernelResult<()> {
    critical_section(|cs| {
        let state = STATE.get(cs);
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        if tcb_ref.time_quanta == 0 {
            tcb_ref.time_quanta = state.default_quanta;
        }
        tcb_ref.time_quanta_ctr = tcb_ref.time_quanta;

        unsafe { state.queue.insert_tail(tcb) };
        Ok(())
    })
}

unsafe fn remove_task(tcb: NonNull<Tcb>) -> KernelResult<()> {
    critical_section(|cs| {
        let state = STATE.get(cs);

        if !state.queue.contains(tcb) {
            return Err(KernelError::TaskNotQueued);
        }

        unsafe { state.queue.remove(tcb) };
        Ok(())
    })
}

fn select_next() -> Option<NonNull<Tcb>> {
    critical_section(|cs| STATE.get(cs).queue.head())
}

fn save_state(buf: &mut [u8]) -> KernelResult<usize> {
    critical_section(|cs| {
        let state = STATE.get(cs);
        let image = state.default_quanta.to_le_bytes();

        if buf.len() < image.len() {
            return Err(KernelError::BufferTooSmall);
        }
        buf[..image.len()].copy_from_slice(&image);
        Ok(image.len())
    })
}

fn restore_state(buf: &[u8]) -> KernelResult<()> {
    if buf.len() < 4 {
        return Err(KernelError::InvalidParameter);
    }
    let mut image = [0u8; 4];
    image.copy_from_slice(&buf[..4]);

    critical_section(|cs| {
        STATE.get(cs).default_quanta = Tick::from_le_bytes(image);
        Ok(())
    })
}

fn clear_queues() {
    critical_section(|cs| {
        let state = STATE.get(cs);
        while let Some(head) = state.queue.head() {
            unsafe { state.queue.remove(head) };
        }
    });
}

//! Earliest-deadline-first scheduler plugin
//!
//! Single queue kept sorted by absolute deadline; the head is always the
//! most urgent task. Admission requires deadline information.

use core::ptr::NonNull;

use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::sched::plugin::{SchedulerDescriptor, SchedulerOps, SCHED_ID_EDF};
use crate::sched::rdy_list::TaskQueue;
use crate::task::Tcb;
use crate::time;

struct EdfState {
    queue: TaskQueue,
    /// Admissions whose absolute deadline already lay in the past
    overruns: u32,
}

impl EdfState {
    const fn new() -> Self {
        EdfState {
            queue: TaskQueue::new(),
            overruns: 0,
        }
    }
}

static STATE: CsCell<EdfState> = CsCell::new(EdfState::new());

/// Plugin descriptor for the EDF scheduler
pub static EDF_SCHEDULER: SchedulerDescriptor = SchedulerDescriptor {
    id: SCHED_ID_EDF,
    name: "edf",
    ops: SchedulerOps {
        init: Some(init),
        add_task: Some(add_task),
        remove_task: Some(remove_task),
        select_next: Some(select_next),
        can_accept: Some(can_accept),
        save_state: Some(save_state),
        restore_state: Some(restore_state),
        clear_queues: Some(clear_queues),
        adjust_priority: None,
    },
};

fn init() -> KernelResult<()> {
    // Queues survive activation: migration populates them before init runs
    critical_section(|cs| {
        STATE.get(cs).overruns = 0;
    });
    Ok(())
}

unsafe fn add_task(tcb: NonNull<Tcb>) -> KernelResult<()> {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    if !tcb_ref.has_deadline() {
        return Err(KernelError::TaskNotMigratable);
    }

    let now = time::time_now_us();
    if tcb_ref.abs_deadline_us == 0 {
        tcb_ref.abs_deadline_us = now + tcb_ref.deadline_us;
    }

    critical_section(|cs| {
        let state = STATE.get(cs);

        if tcb_ref.abs_deadline_us <= now {
            state.overruns = state.overruns.wrapping_add(1);
        }

        let pos = state
            .queue
            .iter()
            .find(|t| unsafe { t.as_ref().abs_deadline_us } > tcb_ref.abs_deadline_us);

        match pos {
            Some(pos) => unsafe { state.queue.insert_before(pos, tcb) },
            None => unsafe { state.queue.insert_tail(tcb) },
        }
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

unsafe fn can_accept(tcb: NonNull<Tcb>) -> bool {
    unsafe { tcb.as_ref().has_deadline() }
}

fn save_state(buf: &mut [u8]) -> KernelResult<usize> {
    critical_section(|cs| {
        let image = STATE.get(cs).overruns.to_le_bytes();

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
        STATE.get(cs).overruns = u32::from_le_bytes(image);
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

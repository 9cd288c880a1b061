//! Priority-preemptive scheduler plugin
//!
//! Classic bitmap-plus-FIFO design: one queue per priority level and a
//! priority table for O(1) highest-ready lookup.

use core::ptr::NonNull;

use crate::config::CFG_PRIO_MAX;
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::sched::plugin::{SchedulerDescriptor, SchedulerOps, SCHED_ID_PRIORITY};
use crate::sched::prio_tbl::PrioTable;
use crate::sched::rdy_list::TaskQueue;
use crate::task::Tcb;
use crate::types::Prio;

struct PriorityState {
    tbl: PrioTable,
    queues: [TaskQueue; CFG_PRIO_MAX],
}

impl PriorityState {
    const fn new() -> Self {
        PriorityState {
            tbl: PrioTable::new(),
            queues: [TaskQueue::new(); CFG_PRIO_MAX],
        }
    }
}

static STATE: CsCell<PriorityState> = CsCell::new(PriorityState::new());

/// Plugin descriptor for the priority-preemptive scheduler.
///
/// `save_state` is absent: the plugin carries no tunable state, so the
/// preservation layer falls back to the descriptor-image default.
pub static PRIORITY_SCHEDULER: SchedulerDescriptor = SchedulerDescriptor {
    id: SCHED_ID_PRIORITY,
    name: "priority",
    ops: SchedulerOps {
        init: Some(init),
        add_task: Some(add_task),
        remove_task: Some(remove_task),
        select_next: Some(select_next),
        can_accept: Some(can_accept),
        save_state: None,
        restore_state: None,
        clear_queues: Some(clear_queues),
        adjust_priority: Some(adjust_priority),
    },
};

fn init() -> KernelResult<()> {
    // Queues survive activation: migration populates them before init runs
    Ok(())
}

unsafe fn add_task(tcb: NonNull<Tcb>) -> KernelResult<()> {
    let prio = unsafe { tcb.as_ref().prio };
    if (prio as usize) >= CFG_PRIO_MAX {
        return Err(KernelError::PrioInvalid);
    }

    critical_section(|cs| {
        let state = STATE.get(cs);
        unsafe { state.queues[prio as usize].insert_tail(tcb) };
        state.tbl.insert(prio);
        Ok(())
    })
}

unsafe fn remove_task(tcb: NonNull<Tcb>) -> KernelResult<()> {
    let prio = unsafe { tcb.as_ref().prio };

    critical_section(|cs| {
        let state = STATE.get(cs);
        let queue = &mut state.queues[prio as usize];

        if !queue.contains(tcb) {
            return Err(KernelError::TaskNotQueued);
        }

        unsafe { queue.remove(tcb) };
        if queue.is_empty() {
            state.tbl.remove(prio);
        }
        Ok(())
    })
}

fn select_next() -> Option<NonNull<Tcb>> {
    critical_section(|cs| {
        let state = STATE.get(cs);
        let prio = state.tbl.get_highest();
        state.queues[prio as usize].head()
    })
}

unsafe fn can_accept(tcb: NonNull<Tcb>) -> bool {
    (unsafe { tcb.as_ref().prio } as usize) < CFG_PRIO_MAX
}

fn clear_queues() {
    critical_section(|cs| {
        let state = STATE.get(cs);
        for queue in state.queues.iter_mut() {
            while let Some(head) = queue.head() {
                unsafe { queue.remove(head) };
            }
        }
        state.tbl.init();
    });
}

unsafe fn adjust_priority(tcb: NonNull<Tcb>, new_prio: Prio) -> KernelResult<()> {
    if (new_prio as usize) >= CFG_PRIO_MAX {
        return Err(KernelError::PrioInvalid);
    }

    critical_section(|cs| {
        let state = STATE.get(cs);
        let old_prio = unsafe { tcb.as_ref().prio };

        let queued = state.queues[old_prio as usize].contains(tcb);
        if queued {
            let old_queue = &mut state.queues[old_prio as usize];
            unsafe { old_queue.remove(tcb) };
            if old_queue.is_empty() {
                state.tbl.remove(old_prio);
            }
        }

        unsafe { (*tcb.as_ptr()).prio = new_prio };

        if queued {
            unsafe { state.queues[new_prio as usize].insert_tail(tcb) };
            state.tbl.insert(new_prio);
        }
        Ok(())
    })
}

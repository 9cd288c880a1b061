//! Task management module
//!
//! Provides task creation, deletion, and control functions, plus the
//! live-task registry the switch controller enumerates during migration.

mod stack;
mod tcb;

pub use stack::{validate_stack, verify_integrity, STACK_CANARY, STACK_GUARD};
pub use tcb::{MpuRegion, Tcb, TCB_MAGIC};

use core::ptr::NonNull;

use crate::config::{CFG_PRIO_MAX, CFG_STK_SIZE_MAX, CFG_STK_SIZE_MIN, CFG_TIME_QUANTA_DEFAULT};
use crate::core::cs_cell::CsCell;
use crate::critical::{critical_section, is_isr_context};
use crate::error::{KernelError, KernelResult};
use crate::kernel;
use crate::types::{Prio, StkElement, TaskId, TaskState, Tick, TimeUs};

/// Task entry point function type
pub type TaskFn = fn(*mut ()) -> !;

/// Extended creation attributes
pub struct TaskParams {
    pub name: &'static str,
    pub prio: Prio,
    pub time_quanta: Tick,
    /// Relative deadline in microseconds, 0 for none
    pub deadline_us: TimeUs,
    pub uses_fpu: bool,
    pub arg: *mut (),
}

impl TaskParams {
    pub const fn new(name: &'static str, prio: Prio) -> Self {
        TaskParams {
            name,
            prio,
            time_quanta: CFG_TIME_QUANTA_DEFAULT,
            deadline_us: 0,
            uses_fpu: false,
            arg: core::ptr::null_mut(),
        }
    }
}

// ============ Live-task registry ============

struct TaskRegistry {
    head: Option<NonNull<Tcb>>,
    tail: Option<NonNull<Tcb>>,
    count: usize,
    next_id: TaskId,
    next_order: u32,
}

impl TaskRegistry {
    const fn new() -> Self {
        TaskRegistry {
            head: None,
            tail: None,
            count: 0,
            next_id: 1,
            next_order: 0,
        }
    }

    unsafe fn insert(&mut self, mut tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { tcb.as_mut() };

        tcb_ref.reg_next = None;
        tcb_ref.reg_prev = self.tail;

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).reg_next = Some(tcb) },
            None => self.head = Some(tcb),
        }
        self.tail = Some(tcb);
        self.count += 1;
    }

    unsafe fn remove(&mut self, mut tcb: NonNull<Tcb>) {
        let tcb_ref = unsafe { tcb.as_mut() };

        match tcb_ref.reg_prev {
            Some(prev) => unsafe { (*prev.as_ptr()).reg_next = tcb_ref.reg_next },
            None => self.head = tcb_ref.reg_next,
        }
        match tcb_ref.reg_next {
            Some(next) => unsafe { (*next.as_ptr()).reg_prev = tcb_ref.reg_prev },
            None => self.tail = tcb_ref.reg_prev,
        }

        tcb_ref.reg_next = None;
        tcb_ref.reg_prev = None;
        self.count = self.count.saturating_sub(1);
    }
}

static REGISTRY: CsCell<TaskRegistry> = CsCell::new(TaskRegistry::new());

/// Head of the live-task chain; walk it through `reg_next`
pub fn task_list() -> Option<NonNull<Tcb>> {
    critical_section(|cs| REGISTRY.get(cs).head)
}

/// Number of tasks in the registry
pub fn task_count() -> usize {
    critical_section(|cs| REGISTRY.get(cs).count)
}

/// Currently running task
pub fn current_task() -> Option<NonNull<Tcb>> {
    unsafe { kernel::tcb_cur_ptr() }
}

/// Reset the registry (kernel re-initialization only)
pub(crate) fn reset_registry() {
    critical_section(|cs| {
        *REGISTRY.get(cs) = TaskRegistry::new();
    });
}

// ============ Creation ============

/// Create a new task using static references
///
/// # Example
/// ```ignore
/// static mut TASK_TCB: Tcb = Tcb::new();
/// static mut TASK_STK: [StkElement; 256] = [0; 256];
///
/// fn my_task(_: *mut ()) -> ! {
///     loop { /* ... */ }
/// }
///
/// // In main:
/// task_create(
///     unsafe { &mut *core::ptr::addr_of_mut!(TASK_TCB) },
///     unsafe { &mut *core::ptr::addr_of_mut!(TASK_STK) },
///     "MyTask",
///     my_task,
///     5,
/// ).expect("Task creation failed");
/// ```
pub fn task_create(
    tcb: &'static mut Tcb,
    stack: &'static mut [StkElement],
    name: &'static str,
    task_fn: TaskFn,
    prio: Prio,
) -> KernelResult<TaskId> {
    unsafe {
        task_create_internal(
            tcb as *mut Tcb,
            stack.as_mut_ptr(),
            stack.len(),
            task_fn,
            TaskParams::new(name, prio),
        )
    }
}

/// Create a new task with extended attributes (deadline, quanta, FPU use)
pub fn task_create_ext(
    tcb: &'static mut Tcb,
    stack: &'static mut [StkElement],
    task_fn: TaskFn,
    params: TaskParams,
) -> KernelResult<TaskId> {
    unsafe { task_create_internal(tcb as *mut Tcb, stack.as_mut_ptr(), stack.len(), task_fn, params) }
}

/// Internal task creation for kernel and test use
///
/// # Safety
/// `tcb` must outlive the task; `stk_base` must point to `stk_size`
/// writable words that outlive the task.
#[doc(hidden)]
pub unsafe fn task_create_internal(
    tcb: *mut Tcb,
    stk_base: *mut StkElement,
    stk_size: usize,
    task_fn: TaskFn,
    params: TaskParams,
) -> KernelResult<TaskId> {
    if tcb.is_null() {
        return Err(KernelError::TaskInvalid);
    }
    if stk_base.is_null() {
        return Err(KernelError::StackInvalid);
    }
    if stk_size < CFG_STK_SIZE_MIN || stk_size > CFG_STK_SIZE_MAX {
        return Err(KernelError::StackSizeInvalid);
    }
    if (params.prio as usize) >= CFG_PRIO_MAX {
        return Err(KernelError::PrioInvalid);
    }
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    critical_section(|cs| {
        let tcb_ref = unsafe { &mut *tcb };
        tcb_ref.init();

        tcb_ref.magic = TCB_MAGIC;
        tcb_ref.name = params.name;
        tcb_ref.prio = params.prio;
        tcb_ref.base_prio = params.prio;
        tcb_ref.time_quanta = params.time_quanta;
        tcb_ref.time_quanta_ctr = params.time_quanta;
        tcb_ref.deadline_us = params.deadline_us;
        tcb_ref.uses_fpu = params.uses_fpu;
        tcb_ref.state = TaskState::Ready;

        // Build the initial exception-return frame and plant the guards
        let stk_ptr = unsafe {
            stack::build_initial_frame(
                stk_base,
                stk_size,
                task_fn as usize,
                params.arg,
                (task_exit_trampoline as usize) | 1,
            )
        };
        tcb_ref.stk_ptr = stk_ptr;
        tcb_ref.stk_base = stk_base;
        tcb_ref.stk_size = stk_size;
        tcb_ref.canary = STACK_CANARY;

        tcb_ref.entry_addr = task_fn as usize;
        tcb_ref.entry_arg = params.arg;

        let registry = REGISTRY.get(cs);
        tcb_ref.id = registry.next_id;
        tcb_ref.creation_order = registry.next_order;
        registry.next_id = registry.next_id.wrapping_add(1).max(1);
        registry.next_order = registry.next_order.wrapping_add(1);

        let tcb_nonnull = unsafe { NonNull::new_unchecked(tcb) };
        unsafe { registry.insert(tcb_nonnull) };

        let desc = crate::sched::active_scheduler()?;
        unsafe { desc.add_task(tcb_nonnull)? };

        crate::trace!("task {} created, prio {}", tcb_ref.id, tcb_ref.prio);
        Ok(tcb_ref.id)
    })
    .inspect(|_| {
        if kernel::KERNEL.is_running() {
            crate::sched::schedule();
        }
    })
}

/// Frame synthesis for kernel-owned tasks (the idle task)
///
/// # Safety
/// Same contract as task creation: the stack must be writable and outlive
/// the task.
pub(crate) unsafe fn stack_init_for_kernel(
    stk_base: *mut StkElement,
    stk_size: usize,
    task_fn: TaskFn,
    arg: *mut (),
) -> *mut StkElement {
    unsafe {
        stack::build_initial_frame(
            stk_base,
            stk_size,
            task_fn as usize,
            arg,
            (task_exit_trampoline as usize) | 1,
        )
    }
}

// ============ Termination ============

/// Exit trampoline preloaded into the LR of every initial frame.
///
/// Runs if a task entry function ever returns: tears the task down and
/// parks until the next scheduling point takes the CPU away.
pub fn task_exit_trampoline() -> ! {
    let _ = task_delete(None);
    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::wfi();
        #[cfg(not(target_arch = "arm"))]
        core::hint::spin_loop();
    }
}

/// Delete a task, `None` for the calling task
///
/// The stack canary and guard are re-verified first; a mismatch reports
/// corruption instead of silently freeing the slot.
pub fn task_delete(tcb: Option<NonNull<Tcb>>) -> KernelResult<()> {
    let tcb_ptr = match tcb {
        Some(ptr) => ptr,
        None => current_task().ok_or(KernelError::TaskInvalid)?,
    };

    if Some(tcb_ptr) == kernel::idle_tcb_ptr() {
        return Err(KernelError::TaskIsIdle);
    }

    let deleting_self = Some(tcb_ptr) == current_task();

    critical_section(|cs| {
        let tcb_ref = unsafe { &mut *tcb_ptr.as_ptr() };
        tcb_ref.validate_magic()?;

        if let Err(e) = verify_integrity(tcb_ref) {
            crate::error!("task {} stack corrupt at delete", tcb_ref.id);
            return Err(e);
        }

        if let Ok(desc) = crate::sched::active_scheduler() {
            match unsafe { desc.remove_task(tcb_ptr) } {
                Ok(()) | Err(KernelError::TaskNotQueued) => {}
                Err(e) => return Err(e),
            }
        }
        crate::time::unblock_remove(tcb_ptr);

        unsafe { REGISTRY.get(cs).remove(tcb_ptr) };
        tcb_ref.state = TaskState::Terminated;
        Ok(())
    })?;

    if deleting_self {
        crate::sched::schedule();
    }
    Ok(())
}

// ============ Suspend / resume ============

/// Suspend a task, excluding it from scheduling and migration
pub fn task_suspend(tcb: NonNull<Tcb>) -> KernelResult<()> {
    if Some(tcb) == kernel::idle_tcb_ptr() {
        return Err(KernelError::TaskIsIdle);
    }

    let suspending_self = Some(tcb) == current_task();

    critical_section(|_cs| {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };
        tcb_ref.validate_magic()?;

        if tcb_ref.state == TaskState::Suspended {
            return Err(KernelError::TaskSuspended);
        }

        if let Ok(desc) = crate::sched::active_scheduler() {
            match unsafe { desc.remove_task(tcb) } {
                Ok(()) | Err(KernelError::TaskNotQueued) => {}
                Err(e) => return Err(e),
            }
        }
        tcb_ref.state = TaskState::Suspended;
        Ok(())
    })?;

    if suspending_self {
        crate::sched::schedule();
    }
    Ok(())
}

/// Resume a suspended task
pub fn task_resume(tcb: NonNull<Tcb>) -> KernelResult<()> {
    critical_section(|_cs| {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };
        tcb_ref.validate_magic()?;

        if tcb_ref.state != TaskState::Suspended {
            return Err(KernelError::TaskNotSuspended);
        }

        tcb_ref.state = TaskState::Ready;
        let desc = crate::sched::active_scheduler()?;
        unsafe { desc.add_task(tcb)? };
        Ok(())
    })?;

    crate::sched::schedule();
    Ok(())
}

// ============ Yield ============

/// Voluntarily give up the CPU to the next task of the active plugin
pub fn task_yield() -> KernelResult<()> {
    if is_isr_context() {
        return Err(KernelError::IsrContext);
    }
    if !kernel::KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }

    critical_section(|_cs| unsafe {
        if let Some(cur) = kernel::tcb_cur_ptr() {
            let cur = &mut *cur.as_ptr();
            cur.voluntary_yields = cur.voluntary_yields.wrapping_add(1);
        }
    });

    crate::port::yield_now();
    Ok(())
}

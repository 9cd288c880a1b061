//! Scheduler plugin capability interface
//!
//! A plugin is an opaque handle exposing a vector of operations. The core
//! never inspects plugin-private queues; it only calls operations. Every
//! entry may be absent; absence means the default policy applies.

use core::ptr::NonNull;

use crate::config::CFG_SCHED_MAX;
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::task::Tcb;
use crate::types::{Prio, SchedulerId};

/// Stable identifier of the priority-preemptive plugin
pub const SCHED_ID_PRIORITY: SchedulerId = 0;
/// Stable identifier of the round-robin plugin
pub const SCHED_ID_RR: SchedulerId = 1;
/// Stable identifier of the earliest-deadline-first plugin
pub const SCHED_ID_EDF: SchedulerId = 2;

/// Capability vector a scheduler plugin exposes to the kernel
///
/// Used in lieu of subtype polymorphism: a descriptor plus a
/// function-pointer vector, each slot optional.
pub struct SchedulerOps {
    /// Reset plugin state; called when the plugin becomes active
    pub init: Option<fn() -> KernelResult<()>>,
    /// Admit a task into the plugin's queues
    pub add_task: Option<unsafe fn(NonNull<Tcb>) -> KernelResult<()>>,
    /// Remove a task; removing an absent task returns `TaskNotQueued`
    pub remove_task: Option<unsafe fn(NonNull<Tcb>) -> KernelResult<()>>,
    /// Pick the task to run next
    pub select_next: Option<fn() -> Option<NonNull<Tcb>>>,
    /// Would admitting this task satisfy plugin-specific constraints?
    pub can_accept: Option<unsafe fn(NonNull<Tcb>) -> bool>,
    /// Serialize plugin state into `buf`, returning bytes written
    pub save_state: Option<fn(&mut [u8]) -> KernelResult<usize>>,
    /// Restore state produced by `save_state` for the same plugin id
    pub restore_state: Option<fn(&[u8]) -> KernelResult<()>>,
    /// Drop every queued task reference
    pub clear_queues: Option<fn()>,
    /// Re-queue a task under a new priority
    pub adjust_priority: Option<unsafe fn(NonNull<Tcb>, Prio) -> KernelResult<()>>,
}

impl SchedulerOps {
    /// A vector with every capability absent
    pub const fn empty() -> Self {
        SchedulerOps {
            init: None,
            add_task: None,
            remove_task: None,
            select_next: None,
            can_accept: None,
            save_state: None,
            restore_state: None,
            clear_queues: None,
            adjust_priority: None,
        }
    }
}

/// Scheduler plugin descriptor: identity plus capability vector
pub struct SchedulerDescriptor {
    /// Stable identifier, key of the priority map and switch requests
    pub id: SchedulerId,
    /// Human-readable name for logs
    pub name: &'static str,
    /// Capability vector
    pub ops: SchedulerOps,
}

impl SchedulerDescriptor {
    /// Call the plugin's `init`, default Ok
    pub fn init(&'static self) -> KernelResult<()> {
        match self.ops.init {
            Some(f) => f(),
            None => Ok(()),
        }
    }

    /// Call the plugin's `add_task`, default Ok
    ///
    /// # Safety
    /// `tcb` must point to a valid TCB not currently owned by any plugin.
    pub unsafe fn add_task(&'static self, tcb: NonNull<Tcb>) -> KernelResult<()> {
        match self.ops.add_task {
            Some(f) => unsafe { f(tcb) },
            None => Ok(()),
        }
    }

    /// Call the plugin's `remove_task`, default Ok
    ///
    /// # Safety
    /// `tcb` must point to a valid TCB.
    pub unsafe fn remove_task(&'static self, tcb: NonNull<Tcb>) -> KernelResult<()> {
        match self.ops.remove_task {
            Some(f) => unsafe { f(tcb) },
            None => Ok(()),
        }
    }

    /// Call the plugin's `select_next`, default None
    pub fn select_next(&'static self) -> Option<NonNull<Tcb>> {
        self.ops.select_next.and_then(|f| f())
    }

    /// Call the plugin's `can_accept`, default accept
    ///
    /// # Safety
    /// `tcb` must point to a valid TCB.
    pub unsafe fn can_accept(&'static self, tcb: NonNull<Tcb>) -> bool {
        match self.ops.can_accept {
            Some(f) => unsafe { f(tcb) },
            None => true,
        }
    }

    /// Call the plugin's `clear_queues`, default no-op
    pub fn clear_queues(&'static self) {
        if let Some(f) = self.ops.clear_queues {
            f();
        }
    }

    /// Call the plugin's `adjust_priority`; the default just stores the
    /// new priority in the TCB.
    ///
    /// # Safety
    /// `tcb` must point to a valid TCB.
    pub unsafe fn adjust_priority(&'static self, tcb: NonNull<Tcb>, prio: Prio) -> KernelResult<()> {
        match self.ops.adjust_priority {
            Some(f) => unsafe { f(tcb, prio) },
            None => {
                unsafe { (*tcb.as_ptr()).prio = prio };
                Ok(())
            }
        }
    }

    /// View of the descriptor as raw bytes, the default `save_state` image
    pub fn as_bytes(&'static self) -> &'static [u8] {
        unsafe {
            core::slice::from_raw_parts(
                self as *const SchedulerDescriptor as *const u8,
                core::mem::size_of::<SchedulerDescriptor>(),
            )
        }
    }
}

unsafe impl Sync for SchedulerDescriptor {}

// ============ Plugin registry ============

struct SchedulerRegistry {
    slots: [Option<&'static SchedulerDescriptor>; CFG_SCHED_MAX],
}

impl SchedulerRegistry {
    const fn new() -> Self {
        SchedulerRegistry {
            slots: [None; CFG_SCHED_MAX],
        }
    }
}

static SCHEDULERS: CsCell<SchedulerRegistry> = CsCell::new(SchedulerRegistry::new());

/// Install a scheduler plugin. Descriptors are read-only after installation.
pub fn register_scheduler(desc: &'static SchedulerDescriptor) -> KernelResult<()> {
    critical_section(|cs| {
        let reg = SCHEDULERS.get(cs);

        if reg
            .slots
            .iter()
            .flatten()
            .any(|d| d.id == desc.id)
        {
            return Err(KernelError::SchedulerExists);
        }

        for slot in reg.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(desc);
                crate::trace!("scheduler {} registered", desc.id);
                return Ok(());
            }
        }

        Err(KernelError::SchedulerRegistryFull)
    })
}

/// Look up a plugin by identifier
pub fn lookup_scheduler(id: SchedulerId) -> KernelResult<&'static SchedulerDescriptor> {
    critical_section(|cs| {
        SCHEDULERS
            .get(cs)
            .slots
            .iter()
            .flatten()
            .find(|d| d.id == id)
            .copied()
            .ok_or(KernelError::InvalidScheduler)
    })
}

/// Drop all registered plugins (kernel re-initialization only)
pub(crate) fn reset_registry() {
    critical_section(|cs| {
        SCHEDULERS.get(cs).slots = [None; CFG_SCHED_MAX];
    });
}

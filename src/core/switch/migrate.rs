//! Task migration engine
//!
//! Strategy-driven movement of tasks between scheduler plugins: ordering,
//! priority-space remapping, batching with bounded critical sections, and
//! best-effort re-admission to the source on failure.

use core::ptr::NonNull;

use crate::config::{
    CFG_MIGRATION_BATCH_MAX, CFG_MIGRATION_TASK_TIMEOUT_US, CFG_STK_SIZE_MAX,
};
use crate::core::cs_cell::CsCell;
use crate::critical;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::plugin::{SchedulerDescriptor, SCHED_ID_EDF, SCHED_ID_PRIORITY, SCHED_ID_RR};
use crate::task::Tcb;
use crate::time;
use crate::types::{MigrationStrategy, Prio, SchedulerId, TaskState, Tick};

/// Caller-supplied migration routine for [`MigrationStrategy::Custom`]
pub type CustomMigrateFn = fn(&mut MigrationContext<'_>) -> KernelResult<usize>;

/// Progress callback invoked between batches with `(completed, total)`
pub type ProgressFn = fn(usize, usize);

/// Polled between batches; returning true aborts the migration
pub type AbortCheckFn = fn() -> bool;

/// Per-task migration outcome
#[derive(Debug, Clone, Copy)]
pub struct MigrationRecord {
    pub task: Option<NonNull<Tcb>>,
    pub old_prio: Prio,
    pub done: bool,
    pub error_code: u16,
}

impl MigrationRecord {
    pub const fn new() -> Self {
        MigrationRecord {
            task: None,
            old_prio: 0,
            done: false,
            error_code: 0,
        }
    }
}

impl Default for MigrationRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one migration run needs, owned by the switch controller
pub struct MigrationContext<'a> {
    /// Task vector; the first `count` entries are Some
    pub tasks: &'a mut [Option<NonNull<Tcb>>],
    pub count: usize,
    pub source: &'static SchedulerDescriptor,
    pub target: &'static SchedulerDescriptor,
    pub strategy: MigrationStrategy,
    pub batch_size: usize,
    pub custom_fn: Option<CustomMigrateFn>,
    pub progress: Option<ProgressFn>,
    pub abort_check: Option<AbortCheckFn>,
    pub records: &'a mut [MigrationRecord],
    pub migrated: usize,
    pub failed: usize,
}

// ============ Feasibility ============

/// A task is migratable iff it is live, not suspended, not running, and
/// its stack is within the platform cap. The controller preempts a running
/// task beforehand so it arrives here as ready.
pub fn is_migratable(tcb: NonNull<Tcb>) -> KernelResult<()> {
    let tcb_ref = unsafe { tcb.as_ref() };
    tcb_ref.validate_magic()?;

    match tcb_ref.state {
        TaskState::Invalid | TaskState::Terminated => return Err(KernelError::TaskNotMigratable),
        TaskState::Suspended => return Err(KernelError::TaskNotMigratable),
        TaskState::Running => return Err(KernelError::TaskNotMigratable),
        TaskState::Ready | TaskState::Blocked => {}
    }

    if tcb_ref.stk_size > CFG_STK_SIZE_MAX {
        return Err(KernelError::StackSizeInvalid);
    }
    Ok(())
}

// ============ Priority remapping ============

#[derive(Debug, Clone, Copy)]
struct MapEntry {
    from: SchedulerId,
    to: SchedulerId,
    src: Prio,
    dst: Prio,
}

const PRIO_MAP_ENTRIES: usize = 32;

struct PriorityMap {
    entries: [Option<MapEntry>; PRIO_MAP_ENTRIES],
}

static PRIO_MAP: CsCell<PriorityMap> = CsCell::new(PriorityMap {
    entries: [None; PRIO_MAP_ENTRIES],
});

/// Install a custom priority mapping consulted before the default rules
pub fn install_priority_mapping(
    from: SchedulerId,
    to: SchedulerId,
    src: Prio,
    dst: Prio,
) -> KernelResult<()> {
    critical_section(|cs| {
        let map = PRIO_MAP.get(cs);

        // Replace an existing entry for the same key
        for entry in map.entries.iter_mut().flatten() {
            if entry.from == from && entry.to == to && entry.src == src {
                entry.dst = dst;
                return Ok(());
            }
        }

        for slot in map.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(MapEntry { from, to, src, dst });
                return Ok(());
            }
        }
        Err(KernelError::NoMoreTasks)
    })
}

/// Drop all custom mappings (kernel re-initialization only)
pub(crate) fn reset_priority_map() {
    critical_section(|cs| {
        PRIO_MAP.get(cs).entries = [None; PRIO_MAP_ENTRIES];
    });
}

/// Map a priority from the source plugin's space into the target's.
///
/// Custom entries win; otherwise the default rules apply:
/// round-robin to priority collapses into the normal band, priority to
/// round-robin discards priority, EDF to priority clamps at 64, and
/// everything else is identity.
pub fn map_priority(from: SchedulerId, to: SchedulerId, prio: Prio) -> Prio {
    let custom = critical_section(|cs| {
        PRIO_MAP
            .get(cs)
            .entries
            .iter()
            .flatten()
            .find(|e| e.from == from && e.to == to && e.src == prio)
            .map(|e| e.dst)
    });
    if let Some(dst) = custom {
        return dst;
    }

    match (from, to) {
        (SCHED_ID_RR, SCHED_ID_PRIORITY) => 128,
        (SCHED_ID_PRIORITY, SCHED_ID_RR) => 0,
        (SCHED_ID_EDF, SCHED_ID_PRIORITY) => {
            if prio < 64 {
                prio
            } else {
                64
            }
        }
        _ => prio,
    }
}

/// Band-based priority for deadline migration, by remaining ticks.
/// Zero is the band of tasks whose deadline has passed or is imminent.
pub fn deadline_band(remaining_ticks: Tick) -> Prio {
    if remaining_ticks < 10 {
        0
    } else if remaining_ticks < 100 {
        32
    } else if remaining_ticks < 1000 {
        128
    } else {
        192
    }
}

// ============ Ordering ============

/// Absolute deadline a task would be scheduled under, falling back to the
/// relative deadline for tasks that were never deadline-queued. Tasks
/// without deadline information sort last.
fn effective_deadline(tcb: &Tcb, now: crate::types::TimeUs) -> u64 {
    if tcb.abs_deadline_us != 0 {
        tcb.abs_deadline_us
    } else if tcb.deadline_us != 0 {
        now + tcb.deadline_us
    } else {
        u64::MAX
    }
}

fn deadline_key(tcb: &Tcb) -> u64 {
    effective_deadline(tcb, time::time_now_us())
}

fn sort_tasks_by(tasks: &mut [Option<NonNull<Tcb>>], count: usize, key: fn(&Tcb) -> u64) {
    let key_of = |slot: Option<NonNull<Tcb>>| -> u64 {
        slot.map_or(u64::MAX, |t| key(unsafe { t.as_ref() }))
    };

    // Stable insertion sort; task counts are small and bounded
    for i in 1..count {
        let held = tasks[i];
        let held_key = key_of(held);
        let mut j = i;
        while j > 0 && key_of(tasks[j - 1]) > held_key {
            tasks[j] = tasks[j - 1];
            j -= 1;
        }
        tasks[j] = held;
    }
}

fn order_tasks(ctx: &mut MigrationContext<'_>) {
    match ctx.strategy {
        MigrationStrategy::PreserveOrder => {
            sort_tasks_by(ctx.tasks, ctx.count, |t| t.creation_order as u64);
        }
        MigrationStrategy::PriorityBased => {
            sort_tasks_by(ctx.tasks, ctx.count, |t| t.prio as u64);
        }
        MigrationStrategy::DeadlineBased => {
            sort_tasks_by(ctx.tasks, ctx.count, deadline_key);
        }
        MigrationStrategy::Custom => {
            // Custom runs its own ordering; fallback is preserve-order
            sort_tasks_by(ctx.tasks, ctx.count, |t| t.creation_order as u64);
        }
    }
}

/// Priority demanded by the strategy, None to keep the current one
fn strategy_priority(ctx: &MigrationContext<'_>, tcb: &Tcb) -> Option<Prio> {
    match ctx.strategy {
        MigrationStrategy::PriorityBased => {
            Some(map_priority(ctx.source.id, ctx.target.id, tcb.prio))
        }
        MigrationStrategy::DeadlineBased => {
            let now = time::time_now_us();
            let remaining_us = effective_deadline(tcb, now).saturating_sub(now);
            let remaining_ticks = (remaining_us / time::US_PER_TICK) as Tick;
            Some(deadline_band(remaining_ticks))
        }
        MigrationStrategy::PreserveOrder | MigrationStrategy::Custom => None,
    }
}

// ============ Per-task protocol ============

/// Best-effort return of a task to the source under its old priority.
/// Blocked tasks stay on the blocked chain and are not re-queued.
fn revert_to_source(ctx: &MigrationContext<'_>, tcb: NonNull<Tcb>, old_prio: Prio) {
    unsafe {
        let _ = ctx.source.adjust_priority(tcb, old_prio);
        if tcb.as_ref().state != TaskState::Blocked {
            let _ = ctx.source.add_task(tcb);
        }
    }
}

fn migrate_one(ctx: &MigrationContext<'_>, tcb: NonNull<Tcb>) -> KernelResult<()> {
    let t_start = time::time_now_us();

    is_migratable(tcb)?;

    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    let old_prio = tcb_ref.prio;

    // Prepare: clear plugin-private scratch, reset timing, clear events
    tcb_ref.sched_scratch = 0;
    tcb_ref.event_flags = 0;
    tcb_ref.time_quanta_ctr = tcb_ref.time_quanta;

    match unsafe { ctx.source.remove_task(tcb) } {
        Ok(()) | Err(KernelError::TaskNotQueued) => {}
        Err(e) => return Err(e),
    }

    // Remap into the target's priority space through its capability slot
    if let Some(new_prio) = strategy_priority(ctx, tcb_ref) {
        if let Err(e) = unsafe { ctx.target.adjust_priority(tcb, new_prio) } {
            revert_to_source(ctx, tcb, old_prio);
            return Err(e);
        }
    }

    let admit = if !unsafe { ctx.target.can_accept(tcb) } {
        Err(KernelError::TaskNotMigratable)
    } else if tcb_ref.state == TaskState::Blocked {
        // Blocked tasks change owner without entering a ready queue;
        // the wakeup path admits them to whichever plugin is active
        Ok(())
    } else {
        unsafe { ctx.target.add_task(tcb) }
    };

    if let Err(e) = admit {
        revert_to_source(ctx, tcb, old_prio);
        return Err(e);
    }

    // Finalize: scheduler-specific counters restart under the new owner
    tcb_ref.time_quanta_ctr = tcb_ref.time_quanta;

    if time::time_now_us().saturating_sub(t_start) > CFG_MIGRATION_TASK_TIMEOUT_US {
        // Undo the admission; the controller rolls the rest back
        let _ = unsafe { ctx.target.remove_task(tcb) };
        revert_to_source(ctx, tcb, old_prio);
        return Err(KernelError::Timeout);
    }

    Ok(())
}

// ============ Batched driver ============

/// Move every task in the context from source to target.
///
/// Stops at the first failure and propagates it; completed work is visible
/// in `ctx.migrated` and the per-task records for the controller's
/// rollback decision. Interrupts are masked per batch, never across the
/// whole run.
pub fn migrate_tasks(ctx: &mut MigrationContext<'_>) -> KernelResult<usize> {
    let total = ctx.count;
    if total == 0 {
        return Ok(0);
    }

    if ctx.strategy == MigrationStrategy::Custom {
        if let Some(custom) = ctx.custom_fn {
            let done = custom(ctx)?;
            ctx.migrated = done;
            return Ok(done);
        }
    }

    order_tasks(ctx);

    let batch = ctx.batch_size.clamp(1, CFG_MIGRATION_BATCH_MAX);
    let mut idx = 0;

    while idx < total {
        if let Some(abort) = ctx.abort_check {
            if abort() {
                return Err(KernelError::Aborted);
            }
        }

        let end = (idx + batch).min(total);
        let saved = critical::enter();

        for i in idx..end {
            let Some(tcb) = ctx.tasks[i] else { continue };

            ctx.records[i].task = Some(tcb);
            ctx.records[i].old_prio = unsafe { tcb.as_ref().prio };

            match migrate_one(ctx, tcb) {
                Ok(()) => {
                    ctx.records[i].done = true;
                    ctx.migrated += 1;
                }
                Err(e) => {
                    ctx.records[i].error_code = e.code();
                    ctx.failed += 1;
                    critical::exit(saved);
                    crate::warn!("migration of task {} failed", unsafe { tcb.as_ref().id });
                    return Err(e);
                }
            }
        }

        critical::exit(saved);

        if let Some(progress) = ctx.progress {
            progress(ctx.migrated, total);
        }

        idx = end;
    }

    Ok(ctx.migrated)
}

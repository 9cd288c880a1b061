//! Dynamic scheduler-switch controller
//!
//! Staged state machine that migrates every live task from a source
//! scheduler plugin to a target plugin: policy gating, state snapshotting,
//! batched migration, activation, verification, and rollback on failure.

pub mod migrate;
pub mod snapshot;
pub mod stats;

pub use migrate::{
    deadline_band, install_priority_mapping, is_migratable, map_priority, CustomMigrateFn,
    MigrationContext, MigrationRecord, ProgressFn,
};
pub use snapshot::{fold_checksum, QueueSnapshot, StateBuffer, CHECKSUM_SEED};
pub use stats::{
    reset_switch_cycle_stats, switch_cycle_stats, CycleStats, SwitchHistory, SwitchHistoryRecord,
    SwitchStats,
};

use core::ptr::NonNull;

use crate::config::{
    CFG_CRITICAL_MAX_US, CFG_MIGRATION_BATCH_DEFAULT, CFG_MIGRATION_BATCH_MAX,
    CFG_SWITCH_BASE_COST_US, CFG_SWITCH_MIN_INTERVAL_MS, CFG_SWITCH_PER_TASK_US, CFG_TASK_MAX,
};
use crate::core::cs_cell::CsCell;
use crate::critical;
use crate::critical::critical_section;
use crate::error::{KernelError, KernelResult};
use crate::kernel;
use crate::plugin::{self, SchedulerDescriptor};
use crate::task::{self, Tcb};
use crate::time;
use crate::types::{MigrationStrategy, SwitchPhase, SwitchReason, TaskState, TimeUs};

// ============ Request and outcome ============

/// A scheduler-switch request
#[derive(Clone, Copy)]
pub struct SwitchRequest {
    pub source: crate::types::SchedulerId,
    pub target: crate::types::SchedulerId,
    pub reason: SwitchReason,
    pub strategy: MigrationStrategy,
    /// Caller timestamp; 0 lets the controller stamp it
    pub timestamp_us: TimeUs,
    /// Total switch deadline in microseconds, 0 for none
    pub deadline_us: TimeUs,
    /// Migrate everything inside a single critical window
    pub atomic: bool,
    /// Keep partial progress instead of rolling back on failure
    pub forced: bool,
    pub custom_fn: Option<CustomMigrateFn>,
    pub progress: Option<ProgressFn>,
}

impl SwitchRequest {
    pub const fn new(
        source: crate::types::SchedulerId,
        target: crate::types::SchedulerId,
        reason: SwitchReason,
        strategy: MigrationStrategy,
    ) -> Self {
        SwitchRequest {
            source,
            target,
            reason,
            strategy,
            timestamp_us: 0,
            deadline_us: 0,
            atomic: false,
            forced: false,
            custom_fn: None,
            progress: None,
        }
    }
}

/// What a completed switch reports back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub tasks_migrated: u16,
    pub duration_us: TimeUs,
}

// ============ Policy ============

/// Tunable gate the controller applies before any state is touched
#[derive(Debug, Clone, Copy)]
pub struct SwitchPolicy {
    pub runtime_switching_enabled: bool,
    pub min_interval_ms: u32,
    /// Only switch while the idle task is running
    pub require_idle: bool,
    pub max_critical_us: TimeUs,
    pub batch_size: usize,
}

impl SwitchPolicy {
    pub const fn new() -> Self {
        SwitchPolicy {
            runtime_switching_enabled: true,
            min_interval_ms: CFG_SWITCH_MIN_INTERVAL_MS,
            require_idle: false,
            max_critical_us: CFG_CRITICAL_MAX_US,
            batch_size: CFG_MIGRATION_BATCH_DEFAULT,
        }
    }
}

impl Default for SwitchPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Controller state ============

struct ControllerState {
    in_progress: bool,
    phase: SwitchPhase,
    abort_requested: bool,
    policy: SwitchPolicy,
    stats: SwitchStats,
    history: SwitchHistory,
    /// Stamped when a request passes the policy gate; basis of the
    /// min-interval rule, so gate-rejected attempts do not reset it
    last_switch_us: TimeUs,
    has_switched: bool,
    validate_hook: Option<fn(&SwitchRequest) -> bool>,
    task_validate_hook: Option<fn(&Tcb) -> bool>,
    verify_hook: Option<fn() -> bool>,
    last_error: Option<(SwitchPhase, u16)>,
}

impl ControllerState {
    const fn new() -> Self {
        ControllerState {
            in_progress: false,
            phase: SwitchPhase::Idle,
            abort_requested: false,
            policy: SwitchPolicy::new(),
            stats: SwitchStats::new(),
            history: SwitchHistory::new(),
            last_switch_us: 0,
            has_switched: false,
            validate_hook: None,
            task_validate_hook: None,
            verify_hook: None,
            last_error: None,
        }
    }
}

static CONTROLLER: CsCell<ControllerState> = CsCell::new(ControllerState::new());

/// Per-switch working state; lives only while a switch is in progress
struct SwitchContext {
    tasks: [Option<NonNull<Tcb>>; CFG_TASK_MAX],
    count: usize,
    records: [MigrationRecord; CFG_TASK_MAX],
    state_buf: StateBuffer,
    ready_snap: QueueSnapshot,
    blocked_snap: QueueSnapshot,
    rollback_possible: bool,
    passed_gate: bool,
    migrated: usize,
    crit_enter_us: TimeUs,
    crit_accum_us: TimeUs,
}

impl SwitchContext {
    const fn new() -> Self {
        SwitchContext {
            tasks: [None; CFG_TASK_MAX],
            count: 0,
            records: [MigrationRecord::new(); CFG_TASK_MAX],
            state_buf: StateBuffer::new(),
            ready_snap: QueueSnapshot::new(),
            blocked_snap: QueueSnapshot::new(),
            rollback_possible: false,
            passed_gate: false,
            migrated: 0,
            crit_enter_us: 0,
            crit_accum_us: 0,
        }
    }

    fn reset(&mut self) {
        self.tasks = [None; CFG_TASK_MAX];
        self.count = 0;
        self.records = [MigrationRecord::new(); CFG_TASK_MAX];
        self.state_buf.reset();
        self.ready_snap.reset();
        self.blocked_snap.reset();
        self.rollback_possible = false;
        self.passed_gate = false;
        self.migrated = 0;
        self.crit_enter_us = 0;
        self.crit_accum_us = 0;
    }
}

static SWITCH_CTX: CsCell<SwitchContext> = CsCell::new(SwitchContext::new());

// ============ Public queries and knobs ============

/// Is a switch currently being executed?
pub fn switch_in_progress() -> bool {
    critical_section(|cs| CONTROLLER.get(cs).in_progress)
}

/// Current phase of the switch state machine
pub fn current_phase() -> SwitchPhase {
    critical_section(|cs| CONTROLLER.get(cs).phase)
}

/// Copy of the aggregate switch counters
pub fn switch_stats() -> SwitchStats {
    critical_section(|cs| CONTROLLER.get(cs).stats)
}

/// Copy of the bounded switch-history ring
pub fn switch_history() -> SwitchHistory {
    critical_section(|cs| CONTROLLER.get(cs).history)
}

/// Phase and error code of the most recent failure, if any
pub fn last_switch_error() -> Option<(SwitchPhase, u16)> {
    critical_section(|cs| CONTROLLER.get(cs).last_error)
}

/// Replace the controller policy
pub fn set_policy(policy: SwitchPolicy) {
    critical_section(|cs| CONTROLLER.get(cs).policy = policy);
}

/// Copy of the controller policy
pub fn policy() -> SwitchPolicy {
    critical_section(|cs| CONTROLLER.get(cs).policy)
}

/// Hook consulted once per request before migration starts
pub fn set_validation_hook(hook: Option<fn(&SwitchRequest) -> bool>) {
    critical_section(|cs| CONTROLLER.get(cs).validate_hook = hook);
}

/// Hook consulted per task during validation
pub fn set_task_validation_hook(hook: Option<fn(&Tcb) -> bool>) {
    critical_section(|cs| CONTROLLER.get(cs).task_validate_hook = hook);
}

/// Hook consulted after activation; failure triggers rollback
pub fn set_verification_hook(hook: Option<fn() -> bool>) {
    critical_section(|cs| CONTROLLER.get(cs).verify_hook = hook);
}

/// Reset controller, context, and priority map (kernel re-initialization)
pub(crate) fn reset_controller() {
    critical_section(|cs| {
        *CONTROLLER.get(cs) = ControllerState::new();
        SWITCH_CTX.get(cs).reset();
    });
    migrate::reset_priority_map();
}

// ============ Abort ============

/// Request cancellation of the in-progress switch.
///
/// Honored during preparation, validation, and between migration batches;
/// never inside a critical window.
pub fn abort_switch() -> KernelResult<()> {
    critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        if !ctrl.in_progress {
            return Err(KernelError::NotAllowed);
        }
        ctrl.abort_requested = true;
        Ok(())
    })
}

fn abort_pending() -> bool {
    critical_section(|cs| CONTROLLER.get(cs).abort_requested)
}

fn check_abort() -> KernelResult<()> {
    if abort_pending() {
        return Err(KernelError::Aborted);
    }
    Ok(())
}

fn set_phase(phase: SwitchPhase) {
    critical_section(|cs| CONTROLLER.get(cs).phase = phase);
}

// ============ Policy gate ============

fn policy_gate(req: &SwitchRequest) -> KernelResult<()> {
    let (policy, last_switch_us, has_switched) = critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        (ctrl.policy, ctrl.last_switch_us, ctrl.has_switched)
    });

    if req.source == req.target {
        return Err(KernelError::NotAllowed);
    }
    if !policy.runtime_switching_enabled {
        return Err(KernelError::NotAllowed);
    }

    let now = time::time_now_us();
    if has_switched {
        let min_us = policy.min_interval_ms as TimeUs * 1000;
        if now.saturating_sub(last_switch_us) < min_us {
            return Err(KernelError::NotAllowed);
        }
    }

    if critical::get_nesting() > 0 {
        return Err(KernelError::NotAllowed);
    }

    if policy.require_idle {
        let cur = task::current_task();
        if cur.is_some() && cur != kernel::idle_tcb_ptr() {
            return Err(KernelError::NotAllowed);
        }
    }

    if req.deadline_us != 0 {
        let estimate =
            CFG_SWITCH_BASE_COST_US + CFG_SWITCH_PER_TASK_US * task::task_count() as TimeUs;
        if estimate > req.deadline_us {
            return Err(KernelError::NotAllowed);
        }
    }

    Ok(())
}

// ============ Main entry ============

/// Execute a scheduler switch end to end.
///
/// Drives the phase machine of the controller; on failure past the policy
/// gate the pre-switch snapshots are rolled back unless the request is
/// forced. Every post-gate outcome lands in the history ring.
pub fn switch_scheduler(req: &SwitchRequest) -> KernelResult<SwitchOutcome> {
    if !kernel::KERNEL.is_initialized() {
        return Err(KernelError::NotInitialized);
    }

    // Claim the controller
    critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        if ctrl.in_progress {
            return Err(KernelError::Busy);
        }
        ctrl.in_progress = true;
        ctrl.abort_requested = false;
        ctrl.phase = SwitchPhase::Preparing;
        ctrl.last_error = None;
        SWITCH_CTX.get(cs).reset();
        Ok(())
    })?;

    let started_us = if req.timestamp_us != 0 {
        req.timestamp_us
    } else {
        time::time_now_us()
    };

    let result = execute_switch(req);
    let finished_us = time::time_now_us();
    let duration_us = finished_us.saturating_sub(started_us);

    // Bookkeeping and release
    let outcome = critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        let ctx = SWITCH_CTX.get(cs);

        let outcome = match result {
            Ok(migrated) => {
                ctrl.stats.total_switches += 1;
                ctrl.stats.successful_switches += 1;
                ctrl.stats.tasks_migrated += migrated as u32;
                if duration_us > ctrl.stats.max_duration_us {
                    ctrl.stats.max_duration_us = duration_us;
                }
                ctrl.history.push(SwitchHistoryRecord {
                    timestamp_us: finished_us,
                    from: req.source,
                    to: req.target,
                    reason: req.reason,
                    duration_us,
                    tasks_migrated: migrated as u16,
                    success: true,
                    error_code: 0,
                });
                ctrl.last_error = None;
                crate::info!(
                    "scheduler switch {} -> {} complete, {} tasks",
                    req.source,
                    req.target,
                    migrated
                );
                Ok(SwitchOutcome {
                    tasks_migrated: migrated as u16,
                    duration_us,
                })
            }
            Err(e) => {
                if ctx.passed_gate {
                    ctrl.stats.total_switches += 1;
                    ctrl.stats.failed_switches += 1;
                    ctrl.history.push(SwitchHistoryRecord {
                        timestamp_us: finished_us,
                        from: req.source,
                        to: req.target,
                        reason: req.reason,
                        duration_us,
                        tasks_migrated: ctx.migrated as u16,
                        success: false,
                        error_code: e.code(),
                    });
                    if ctrl.last_error.is_none() {
                        ctrl.last_error = Some((ctrl.phase, e.code()));
                    }
                    crate::warn!(
                        "scheduler switch {} -> {} failed, code {}",
                        req.source,
                        req.target,
                        e.code()
                    );
                }
                Err(e)
            }
        };

        if ctx.crit_accum_us > ctrl.stats.max_critical_us {
            ctrl.stats.max_critical_us = ctx.crit_accum_us;
        }

        ctrl.phase = SwitchPhase::Idle;
        ctrl.in_progress = false;
        ctrl.abort_requested = false;
        ctx.reset();
        outcome
    });

    if outcome.is_ok() {
        // Activation scheduling point: the new plugin picks the next task
        crate::sched::schedule();
    }
    outcome
}

// ============ Execution ============

fn enter_timed_critical() -> critical::SavedMask {
    let mask = critical::enter();
    critical_section(|cs| SWITCH_CTX.get(cs).crit_enter_us = time::time_now_us());
    mask
}

fn exit_timed_critical(mask: critical::SavedMask) {
    critical_section(|cs| {
        let ctx = SWITCH_CTX.get(cs);
        let span = time::time_now_us().saturating_sub(ctx.crit_enter_us);
        ctx.crit_accum_us += span;
    });
    critical::exit(mask);
}

fn execute_switch(req: &SwitchRequest) -> KernelResult<usize> {
    // ---- PREPARING ----
    set_phase(SwitchPhase::Preparing);

    let source = plugin::lookup_scheduler(req.source)?;
    let target = plugin::lookup_scheduler(req.target)?;

    policy_gate(req)?;
    critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        ctrl.last_switch_us = time::time_now_us();
        ctrl.has_switched = true;
        SWITCH_CTX.get(cs).passed_gate = true;
    });

    prepare_tasks()?;
    check_abort()?;

    // ---- VALIDATING ----
    set_phase(SwitchPhase::Validating);
    validate_tasks(req, target)?;
    check_abort()?;

    // ---- ENTERING_CRITICAL ----
    set_phase(SwitchPhase::EnteringCritical);
    let mask = enter_timed_critical();

    // ---- SAVING_STATE ----
    set_phase(SwitchPhase::SavingState);
    if let Err(e) = save_pre_switch_state(source) {
        exit_timed_critical(mask);
        return Err(e);
    }
    critical_section(|cs| SWITCH_CTX.get(cs).rollback_possible = true);

    // The migration engine bounds its own critical windows per batch
    exit_timed_critical(mask);

    // ---- MIGRATING_TASKS ----
    set_phase(SwitchPhase::MigratingTasks);
    let migrated = match run_migration(req, source, target) {
        Ok(n) => n,
        Err(e) => return fail_switch(req, source, target, e),
    };

    // ---- ACTIVATING_NEW ----
    set_phase(SwitchPhase::ActivatingNew);
    let mask = enter_timed_critical();
    crate::sched::set_active(target.id);
    if let Err(e) = target.init() {
        exit_timed_critical(mask);
        return fail_switch(req, source, target, e);
    }

    // ---- EXITING_CRITICAL ----
    set_phase(SwitchPhase::ExitingCritical);
    exit_timed_critical(mask);

    let (crit_us, max_crit) = critical_section(|cs| {
        (
            SWITCH_CTX.get(cs).crit_accum_us,
            CONTROLLER.get(cs).policy.max_critical_us,
        )
    });
    if crit_us > max_crit {
        crate::warn!("switch critical section ran {}us", crit_us as u32);
    }

    // ---- VERIFYING ----
    set_phase(SwitchPhase::Verifying);
    let verify = critical_section(|cs| CONTROLLER.get(cs).verify_hook);
    if let Some(verify) = verify {
        if !verify() {
            return fail_switch(req, source, target, KernelError::VerificationFailed);
        }
    }

    // ---- COMPLETE ----
    set_phase(SwitchPhase::Complete);
    critical_section(|cs| SWITCH_CTX.get(cs).rollback_possible = false);
    Ok(migrated)
}

/// Enumerate live tasks, preempting the running one so it is migratable
fn prepare_tasks() -> KernelResult<()> {
    critical_section(|cs| {
        let ctx = SWITCH_CTX.get(cs);

        let mut cursor = task::task_list();
        while let Some(tcb) = cursor {
            cursor = unsafe { tcb.as_ref().reg_next };

            let tcb_ref = unsafe { &mut *tcb.as_ptr() };
            if !tcb_ref.is_live() || tcb_ref.state == TaskState::Suspended {
                continue;
            }

            // A running task is preempted into readiness; the actual
            // switch lands at the activation scheduling point
            if tcb_ref.state == TaskState::Running {
                tcb_ref.state = TaskState::Ready;
            }

            if ctx.count >= CFG_TASK_MAX {
                return Err(KernelError::NoMoreTasks);
            }
            ctx.tasks[ctx.count] = Some(tcb);
            ctx.count += 1;
        }
        Ok(())
    })
}

fn validate_tasks(req: &SwitchRequest, target: &'static SchedulerDescriptor) -> KernelResult<()> {
    let (validate, task_validate) = critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        (ctrl.validate_hook, ctrl.task_validate_hook)
    });

    if let Some(validate) = validate {
        if !validate(req) {
            return Err(KernelError::ValidationFailed);
        }
    }

    let count = critical_section(|cs| SWITCH_CTX.get(cs).count);
    for i in 0..count {
        let Some(tcb) = critical_section(|cs| SWITCH_CTX.get(cs).tasks[i]) else {
            continue;
        };

        is_migratable(tcb)?;

        if !unsafe { target.can_accept(tcb) } {
            return Err(KernelError::ValidationFailed);
        }
        if let Some(hook) = task_validate {
            if !hook(unsafe { tcb.as_ref() }) {
                return Err(KernelError::ValidationFailed);
            }
        }
    }
    Ok(())
}

/// Save source plugin state and snapshot the ready and blocked queues
fn save_pre_switch_state(source: &'static SchedulerDescriptor) -> KernelResult<()> {
    let now = time::time_now_us();

    critical_section(|cs| {
        let ctx = SWITCH_CTX.get(cs);

        ctx.state_buf.save_scheduler_state(source)?;

        let ready = RegistryReadyIter {
            cursor: task::task_list(),
        };
        ctx.ready_snap.capture(ready, now)?;

        let blocked = BlockedIter {
            cursor: time::blocked_head(),
        };
        ctx.blocked_snap.capture(blocked, now)?;
        Ok(())
    })
}

struct RegistryReadyIter {
    cursor: Option<NonNull<Tcb>>,
}

impl Iterator for RegistryReadyIter {
    type Item = NonNull<Tcb>;

    fn next(&mut self) -> Option<NonNull<Tcb>> {
        while let Some(tcb) = self.cursor {
            self.cursor = unsafe { tcb.as_ref().reg_next };
            let state = unsafe { tcb.as_ref().state };
            if matches!(state, TaskState::Ready | TaskState::Running) {
                return Some(tcb);
            }
        }
        None
    }
}

struct BlockedIter {
    cursor: Option<NonNull<Tcb>>,
}

impl Iterator for BlockedIter {
    type Item = NonNull<Tcb>;

    fn next(&mut self) -> Option<NonNull<Tcb>> {
        let tcb = self.cursor?;
        self.cursor = unsafe { tcb.as_ref().blocked_next };
        Some(tcb)
    }
}

fn run_migration(
    req: &SwitchRequest,
    source: &'static SchedulerDescriptor,
    target: &'static SchedulerDescriptor,
) -> KernelResult<usize> {
    let batch_size = critical_section(|cs| {
        let ctrl = CONTROLLER.get(cs);
        let ctx = SWITCH_CTX.get(cs);
        if req.atomic {
            ctx.count.clamp(1, CFG_MIGRATION_BATCH_MAX)
        } else {
            ctrl.policy.batch_size
        }
    });

    // The context arrays live in the static switch context; the engine
    // borrows them for the duration of the run. The controller is
    // single-entrant, so no one else touches them meanwhile.
    let (tasks, records, count) = unsafe {
        let ctx = SWITCH_CTX.get_unchecked();
        (
            &mut ctx.tasks[..],
            &mut ctx.records[..],
            ctx.count,
        )
    };

    let mut mctx = MigrationContext {
        tasks,
        count,
        source,
        target,
        strategy: req.strategy,
        batch_size,
        custom_fn: req.custom_fn,
        progress: req.progress,
        abort_check: Some(abort_pending),
        records,
        migrated: 0,
        failed: 0,
    };

    let result = migrate::migrate_tasks(&mut mctx);
    let migrated = mctx.migrated;
    critical_section(|cs| SWITCH_CTX.get(cs).migrated = migrated);

    match result {
        Ok(n) => Ok(n),
        // An external abort keeps its identity; anything else that left
        // work half done surfaces as partial success
        Err(KernelError::Aborted) => Err(KernelError::Aborted),
        Err(e) => {
            if migrated > 0 {
                Err(KernelError::PartialSuccess {
                    completed: migrated as u16,
                    total: count as u16,
                })
            } else {
                Err(e)
            }
        }
    }
}

/// Failure path: mark FAILED, roll back when possible and permitted
fn fail_switch(
    req: &SwitchRequest,
    source: &'static SchedulerDescriptor,
    target: &'static SchedulerDescriptor,
    error: KernelError,
) -> KernelResult<usize> {
    let failed_phase = critical_section(|cs| CONTROLLER.get(cs).phase);
    set_phase(SwitchPhase::Failed);
    critical_section(|cs| CONTROLLER.get(cs).last_error = Some((failed_phase, error.code())));

    let rollback_possible = critical_section(|cs| SWITCH_CTX.get(cs).rollback_possible);

    if error.is_fatal() {
        // Corruption skips rollback; restoring from possibly corrupted
        // state would make things worse
        return Err(error);
    }

    if rollback_possible && !req.forced {
        match rollback(source, target) {
            Ok(()) => {}
            Err(rb_err) => {
                crate::error!("rollback failed, code {}", rb_err.code());
                return Err(rb_err);
            }
        }
    }

    Err(error)
}

/// Undo a partially executed switch from the pre-switch snapshots
fn rollback(
    source: &'static SchedulerDescriptor,
    target: &'static SchedulerDescriptor,
) -> KernelResult<()> {
    set_phase(SwitchPhase::RollingBack);

    let mask = enter_timed_critical();

    let result = critical_section(|cs| {
        let ctx = SWITCH_CTX.get(cs);

        crate::sched::set_active(source.id);

        // Tasks that made it across before the failure are re-owned by
        // the source below; drop the target's references to them first
        target.clear_queues();

        ctx.state_buf.restore_scheduler_state(source)?;
        ctx.ready_snap.restore_to_scheduler(source)?;

        ctx.blocked_snap.verify()?;
        ctx.blocked_snap.apply_attributes();
        time::restore_blocked(&ctx.blocked_snap.tasks[..ctx.blocked_snap.len]);

        ctx.rollback_possible = false;
        Ok(())
    });

    exit_timed_critical(mask);

    critical_section(|cs| {
        CONTROLLER.get(cs).stats.rollback_count += 1;
        CONTROLLER.get(cs).phase = SwitchPhase::Idle;
    });

    result
}

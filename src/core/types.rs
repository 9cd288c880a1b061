//! Core type definitions for DSRTOS
//!
//! These types provide strong typing for kernel primitives.

/// Task priority (0 = highest priority)
pub type Prio = u8;

/// Tick counter type
pub type Tick = u32;

/// Task identifier assigned at creation
pub type TaskId = u16;

/// Stable scheduler plugin identifier
pub type SchedulerId = u8;

/// Nesting counter
pub type NestingCtr = u8;

/// Stack element type
pub type StkElement = u32;

/// Event flags type
pub type EventFlags = u32;

/// Monotonic microsecond timestamp
pub type TimeUs = u64;

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// TCB slot is unused or torn down
    Invalid = 0,
    /// Task is ready to run
    Ready = 1,
    /// Task is the one currently executing
    Running = 2,
    /// Task is blocked (sleeping or waiting)
    Blocked = 3,
    /// Task is suspended and excluded from scheduling
    Suspended = 4,
    /// Task has exited and awaits reclamation
    Terminated = 5,
}

/// Why a scheduler switch was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchReason {
    /// Explicit application request
    Manual = 0,
    /// Adaptation layer reacting to throughput data
    Performance = 1,
    /// Power-state driven
    Power = 2,
    /// Deadline-miss driven
    Deadline = 3,
    /// Overload shedding
    Overload = 4,
    /// Emergency fallback policy
    Emergency = 5,
    /// Test harness request
    Test = 6,
}

/// How tasks are ordered and re-prioritized during migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStrategy {
    /// Stable order by task creation sequence
    PreserveOrder = 0,
    /// Current priority ascending, remapped through the priority map
    PriorityBased = 1,
    /// Earliest absolute deadline first, band-based priorities
    DeadlineBased = 2,
    /// Caller-supplied migration function
    Custom = 3,
}

/// Phase of the scheduler-switch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwitchPhase {
    Idle = 0,
    Preparing = 1,
    Validating = 2,
    EnteringCritical = 3,
    SavingState = 4,
    MigratingTasks = 5,
    ActivatingNew = 6,
    ExitingCritical = 7,
    Verifying = 8,
    Complete = 9,
    RollingBack = 10,
    Failed = 11,
}

impl SwitchPhase {
    /// Terminal phases never transition further within one request
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, SwitchPhase::Complete | SwitchPhase::Failed)
    }
}

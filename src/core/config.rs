//! Compile-time configuration for DSRTOS
//!
//! These constants control the behavior and resource limits of the kernel.

/// Maximum number of priority levels (0 = highest priority)
pub const CFG_PRIO_MAX: usize = 256;

/// Maximum number of tasks the registry can hold
pub const CFG_TASK_MAX: usize = 32;

/// Maximum number of registered scheduler plugins
pub const CFG_SCHED_MAX: usize = 8;

/// System tick rate in Hz
pub const CFG_TICK_RATE_HZ: u32 = 1000;

/// CPU core clock in Hz (STM32F407 class part at full speed)
pub const CFG_CPU_CLOCK_HZ: u32 = 168_000_000;

/// Default time quanta for round-robin scheduling, in ticks
pub const CFG_TIME_QUANTA_DEFAULT: u32 = 10;

/// Minimum task stack size in words
pub const CFG_STK_SIZE_MIN: usize = 64;

/// Maximum task stack size in words (migration feasibility cap)
pub const CFG_STK_SIZE_MAX: usize = 16384;

/// Context switch cycle budget, common path
pub const CFG_SWITCH_CYCLES_TARGET: u32 = 200;

/// Context switch cycle budget, worst case (FPU + MPU)
pub const CFG_SWITCH_CYCLES_MAX: u32 = 250;

/// FPU present and managed by the switch path
pub const CFG_FPU_EN: bool = true;

/// Maximum MPU regions programmed per task
pub const CFG_MPU_REGIONS_MAX: usize = 8;

/// Depth of the scheduler-switch history ring
pub const CFG_SWITCH_HISTORY_DEPTH: usize = 16;

/// Size of the scheduler state preservation buffer in bytes
pub const CFG_STATE_BUF_SIZE: usize = 4096;

/// Default migration batch size
pub const CFG_MIGRATION_BATCH_DEFAULT: usize = 16;

/// Hard cap on migration batch size
pub const CFG_MIGRATION_BATCH_MAX: usize = 32;

/// Per-task migration timeout in microseconds
pub const CFG_MIGRATION_TASK_TIMEOUT_US: u64 = 50;

/// Minimum interval between scheduler switches in milliseconds
pub const CFG_SWITCH_MIN_INTERVAL_MS: u32 = 100;

/// Critical-section duration bound for the switch controller, microseconds
pub const CFG_CRITICAL_MAX_US: u64 = 100;

/// Fixed cost assumed per switch when estimating duration, microseconds
pub const CFG_SWITCH_BASE_COST_US: u64 = 20;

/// Additional cost assumed per migrated task, microseconds
pub const CFG_SWITCH_PER_TASK_US: u64 = 10;

/// Idle task priority (lowest)
pub const CFG_PRIO_IDLE: u8 = (CFG_PRIO_MAX - 1) as u8;

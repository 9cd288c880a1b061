//! Task Control Block (TCB) definition
//!
//! The TCB contains all the information needed to manage a task, including
//! the machine state consumed by the PendSV switch path.

use core::ptr::NonNull;

use crate::config::CFG_MPU_REGIONS_MAX;
use crate::error::{KernelError, KernelResult};
use crate::types::{EventFlags, Prio, StkElement, TaskId, TaskState, Tick, TimeUs};

/// Sentinel detecting TCB corruption before any dereference
pub const TCB_MAGIC: u32 = 0x5443_4221;

/// Raw MPU region image, programmed verbatim into RBAR/RASR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MpuRegion {
    /// Region base address register value (valid bit + region number set later)
    pub rbar: u32,
    /// Region attribute and size register value
    pub rasr: u32,
}

impl MpuRegion {
    pub const fn empty() -> Self {
        MpuRegion { rbar: 0, rasr: 0 }
    }
}

/// Task Control Block
#[repr(C)]
pub struct Tcb {
    /// Corruption sentinel, must equal [`TCB_MAGIC`]
    pub magic: u32,

    // ============ Stack pointer ============
    /// Current saved stack pointer (valid while not running)
    pub stk_ptr: *mut StkElement,

    // ============ Stack information ============
    /// Base of stack (lowest address)
    pub stk_base: *mut StkElement,
    /// Stack size in words
    pub stk_size: usize,
    /// Canary value mirrored from the planted stack word
    pub canary: u32,

    // ============ Task identification ============
    /// Task name
    pub name: &'static str,
    /// Registry-assigned identifier
    pub id: TaskId,
    /// Monotonic creation sequence, basis of preserve-order migration
    pub creation_order: u32,

    // ============ Scheduling attributes ============
    /// Current (effective) priority
    pub prio: Prio,
    /// Static priority assigned at creation
    pub base_prio: Prio,
    /// Time quanta for round-robin slicing
    pub time_quanta: Tick,
    /// Remaining quanta in the current slice
    pub time_quanta_ctr: Tick,
    /// Relative deadline in microseconds, 0 when the task carries none
    pub deadline_us: TimeUs,
    /// Absolute deadline used for EDF ordering
    pub abs_deadline_us: TimeUs,

    // ============ Lifecycle ============
    /// Current lifecycle state
    pub state: TaskState,

    // ============ Statistics ============
    /// Accumulated runtime in ticks
    pub total_runtime: Tick,
    /// Voluntary yield count
    pub voluntary_yields: u32,
    /// Context switches into this task
    pub ctx_switches: u32,

    // ============ Queue links (owned by the holding plugin) ============
    /// Next TCB in the owning plugin's queue
    pub next_ptr: Option<NonNull<Tcb>>,
    /// Previous TCB in the owning plugin's queue
    pub prev_ptr: Option<NonNull<Tcb>>,

    // ============ Registry chain links ============
    /// Next TCB in the live-task chain
    pub reg_next: Option<NonNull<Tcb>>,
    /// Previous TCB in the live-task chain
    pub reg_prev: Option<NonNull<Tcb>>,

    // ============ Blocked list links ============
    /// Next TCB in the blocked chain
    pub blocked_next: Option<NonNull<Tcb>>,
    /// Previous TCB in the blocked chain
    pub blocked_prev: Option<NonNull<Tcb>>,
    /// Remaining ticks until wakeup
    pub tick_remain: Tick,

    // ============ Machine state options ============
    /// Task executes floating-point instructions
    pub uses_fpu: bool,
    /// MPU regions are programmed on switch-in
    pub mpu_enabled: bool,
    /// Number of valid entries in `mpu_regions`
    pub mpu_region_count: u8,
    /// Per-task MPU region images
    pub mpu_regions: [MpuRegion; CFG_MPU_REGIONS_MAX],

    // ============ Plugin scratch ============
    /// Plugin-private word, cleared when the task changes owner
    pub sched_scratch: u32,
    /// Event flags, cleared when the task changes owner
    pub event_flags: EventFlags,

    // ============ Entry point ============
    /// Task function address
    pub entry_addr: usize,
    /// Task argument
    pub entry_arg: *mut (),
}

impl Tcb {
    /// Create a new, uninitialized TCB
    pub const fn new() -> Self {
        Tcb {
            magic: 0,

            stk_ptr: core::ptr::null_mut(),
            stk_base: core::ptr::null_mut(),
            stk_size: 0,
            canary: 0,

            name: "",
            id: 0,
            creation_order: 0,

            prio: 0,
            base_prio: 0,
            time_quanta: 0,
            time_quanta_ctr: 0,
            deadline_us: 0,
            abs_deadline_us: 0,

            state: TaskState::Invalid,

            total_runtime: 0,
            voluntary_yields: 0,
            ctx_switches: 0,

            next_ptr: None,
            prev_ptr: None,

            reg_next: None,
            reg_prev: None,

            blocked_next: None,
            blocked_prev: None,
            tick_remain: 0,

            uses_fpu: false,
            mpu_enabled: false,
            mpu_region_count: 0,
            mpu_regions: [MpuRegion::empty(); CFG_MPU_REGIONS_MAX],

            sched_scratch: 0,
            event_flags: 0,

            entry_addr: 0,
            entry_arg: core::ptr::null_mut(),
        }
    }

    /// Initialize TCB to default values
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Verify the corruption sentinel before any control transfer
    #[inline]
    pub fn validate_magic(&self) -> KernelResult<()> {
        if self.magic != TCB_MAGIC {
            return Err(KernelError::Corrupted);
        }
        Ok(())
    }

    /// Check if task is ready to run
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    /// Check if task is the one currently executing
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// Check if the task participates in scheduling at all
    #[inline]
    pub fn is_live(&self) -> bool {
        !matches!(self.state, TaskState::Invalid | TaskState::Terminated)
    }

    /// Check if task carries deadline information (EDF requirement)
    #[inline]
    pub fn has_deadline(&self) -> bool {
        self.deadline_us != 0
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

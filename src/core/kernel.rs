//! Global kernel state and initialization
//!
//! Manages the global OS state including initialization, starting the
//! first task, interrupt nesting, and the CPU switch slots consumed by
//! the PendSV path.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::config::{CFG_PRIO_IDLE, CFG_TICK_RATE_HZ};
use crate::critical::{critical_section, CriticalSection};
use crate::error::{KernelError, KernelResult};
use crate::task::{Tcb, STACK_CANARY, TCB_MAGIC};
use crate::types::{NestingCtr, StkElement, TaskState, Tick};

// ============ Kernel State Structures ============

/// Atomic kernel flags
pub struct KernelFlags {
    initialized: AtomicBool,
    running: AtomicBool,
    int_nesting: AtomicU8,
    sched_lock_nesting: AtomicU8,
    tick_counter: AtomicU32,
}

impl KernelFlags {
    const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            int_nesting: AtomicU8::new(0),
            sched_lock_nesting: AtomicU8::new(0),
            tick_counter: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.int_nesting.store(0, Ordering::SeqCst);
        self.sched_lock_nesting.store(0, Ordering::SeqCst);
        self.tick_counter.store(0, Ordering::SeqCst);
    }

    /// Check if the kernel is running
    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check if the kernel is initialized
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Get current tick count
    #[inline(always)]
    pub fn tick_get(&self) -> Tick {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Get interrupt nesting level
    #[inline(always)]
    pub fn int_nesting(&self) -> NestingCtr {
        self.int_nesting.load(Ordering::Relaxed)
    }

    /// Get scheduler lock nesting level
    #[inline(always)]
    pub fn sched_lock_nesting(&self) -> NestingCtr {
        self.sched_lock_nesting.load(Ordering::SeqCst)
    }

    /// Increment and return tick count
    #[inline(always)]
    pub(crate) fn tick_increment(&self) -> Tick {
        self.tick_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline(always)]
    pub(crate) fn set_initialized(&self, val: bool) {
        self.initialized.store(val, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
    }

    /// Lock the scheduler against preemption
    pub(crate) fn try_sched_lock(&self) -> KernelResult<()> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == u8::MAX {
            return Err(KernelError::LockNestingOverflow);
        }
        self.sched_lock_nesting.store(nesting + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Unlock the scheduler
    pub(crate) fn try_sched_unlock(&self) -> KernelResult<NestingCtr> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == 0 {
            return Err(KernelError::NotAllowed);
        }
        self.sched_lock_nesting.store(nesting - 1, Ordering::SeqCst);
        Ok(nesting - 1)
    }
}

/// Global kernel state instance
pub static KERNEL: KernelFlags = KernelFlags::new();

// ============ CPU/Context Switch State ============

/// CPU context switch slots read by the PendSV path.
///
/// `tcb_cur` must stay the first field: the handler checks it for the
/// first-switch case before saving any context.
#[repr(C)]
pub struct CpuState {
    /// Current running task's TCB pointer
    pub tcb_cur: *mut Tcb,
    /// Task selected to run next, consumed and cleared by PendSV
    pub tcb_next: *mut Tcb,
}

impl CpuState {
    pub const fn new() -> Self {
        Self {
            tcb_cur: core::ptr::null_mut(),
            tcb_next: core::ptr::null_mut(),
        }
    }

    pub fn reset(&mut self) {
        self.tcb_cur = core::ptr::null_mut();
        self.tcb_next = core::ptr::null_mut();
    }
}

/// Global CPU state instance
#[no_mangle]
#[used]
pub static mut CPU_STATE: CpuState = CpuState::new();

// ============ CPU state accessors ============

/// Get current TCB pointer as Option<NonNull>
#[inline]
#[allow(static_mut_refs)]
pub(crate) unsafe fn tcb_cur_ptr() -> Option<NonNull<Tcb>> {
    NonNull::new(unsafe { CPU_STATE.tcb_cur })
}

/// Set current TCB pointer
#[inline]
#[allow(dead_code, static_mut_refs)]
pub(crate) unsafe fn set_tcb_cur_ptr(tcb: Option<NonNull<Tcb>>) {
    unsafe { CPU_STATE.tcb_cur = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr()) };
}

/// Get next TCB pointer as Option<NonNull>
#[inline]
#[allow(dead_code, static_mut_refs)]
pub(crate) unsafe fn tcb_next_ptr() -> Option<NonNull<Tcb>> {
    NonNull::new(unsafe { CPU_STATE.tcb_next })
}

/// Set next TCB pointer
#[inline]
#[allow(static_mut_refs)]
pub(crate) unsafe fn set_tcb_next_ptr(tcb: Option<NonNull<Tcb>>) {
    unsafe { CPU_STATE.tcb_next = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr()) };
}

// ============ Idle task ============

/// IDLE task TCB, owned by the kernel rather than any plugin
static mut IDLE_TCB: Tcb = Tcb::new();

/// IDLE task stack
static mut IDLE_STK: [StkElement; 128] = [0; 128];

/// Internal IDLE task function
fn idle_task(_: *mut ()) -> ! {
    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::wfi();
        #[cfg(not(target_arch = "arm"))]
        core::hint::spin_loop();
    }
}

/// Pointer to the idle task's TCB
#[inline]
pub fn idle_tcb_ptr() -> Option<NonNull<Tcb>> {
    NonNull::new(core::ptr::addr_of_mut!(IDLE_TCB))
}

// ============ Panic collaborator ============

/// Why the kernel gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PanicReason {
    StackOverflow = 1,
    StackCorruption = 2,
    TcbCorruption = 3,
    HardFault = 4,
    MemManageFault = 5,
    BusFault = 6,
    UsageFault = 7,
}

/// Terminal error sink. Corruption and faults land here; there is no
/// recovery path back out.
pub fn kernel_panic(reason: PanicReason, info: u32) -> ! {
    crate::error!("kernel panic: {} info {:x}", reason as u8, info);

    #[cfg(target_arch = "arm")]
    {
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::udf();
        }
    }

    #[cfg(not(target_arch = "arm"))]
    panic!("kernel panic: {:?} info {:#x}", reason, info);
}

// ============ Initialization ============

/// Reset every global kernel structure
fn reset_globals() {
    KERNEL.reset();
    crate::critical::reset();
    crate::task::reset_registry();
    crate::sched::plugin::reset_registry();
    crate::switch::reset_controller();
    crate::switch::reset_switch_cycle_stats();
    crate::time::reset_blocked();

    unsafe {
        (*core::ptr::addr_of_mut!(CPU_STATE)).reset();
    }
}

// ============ Public API ============

/// Initialize the kernel
///
/// Must be called before any other kernel function. Registers the
/// built-in scheduler plugins, activates the priority-preemptive one, and
/// creates the idle task.
///
/// # Returns
/// * `Ok(())` - Initialization successful
/// * `Err(KernelError::AlreadyRunning)` - kernel is already running
pub fn kernel_init() -> KernelResult<()> {
    reset_globals();

    if KERNEL.is_running() {
        return Err(KernelError::AlreadyRunning);
    }

    crate::sched::plugin::register_scheduler(&crate::sched::priority::PRIORITY_SCHEDULER)?;
    crate::sched::plugin::register_scheduler(&crate::sched::rr::RR_SCHEDULER)?;
    crate::sched::plugin::register_scheduler(&crate::sched::edf::EDF_SCHEDULER)?;
    crate::sched::set_active(crate::sched::plugin::SCHED_ID_PRIORITY);

    critical_section(|_cs| {
        // The idle task is kernel-owned: never queued in a plugin and
        // never migrated, the scheduler falls back to it on empty queues
        unsafe {
            let idle = &mut *core::ptr::addr_of_mut!(IDLE_TCB);
            idle.init();
            idle.magic = TCB_MAGIC;
            idle.name = "Idle";
            idle.prio = CFG_PRIO_IDLE;
            idle.base_prio = CFG_PRIO_IDLE;
            idle.state = TaskState::Ready;

            let stk_base = core::ptr::addr_of_mut!(IDLE_STK) as *mut StkElement;
            let stk_size = 128;
            idle.stk_ptr = crate::core::task::stack_init_for_kernel(
                stk_base,
                stk_size,
                idle_task,
                core::ptr::null_mut(),
            );
            idle.stk_base = stk_base;
            idle.stk_size = stk_size;
            idle.canary = STACK_CANARY;
        }
    });

    KERNEL.set_initialized(true);
    crate::info!("kernel initialized");
    Ok(())
}

/// Start multitasking
///
/// Hands the CPU to the task selected by the active scheduler plugin.
/// On hardware this function does not return.
///
/// # Returns
/// * `Err(KernelError::NotInitialized)` - kernel not initialized
/// * `Err(KernelError::AlreadyRunning)` - kernel is already running
pub fn kernel_start() -> KernelResult<()> {
    if !KERNEL.is_initialized() {
        return Err(KernelError::NotInitialized);
    }
    if KERNEL.is_running() {
        return Err(KernelError::AlreadyRunning);
    }

    critical_section(|_cs| {
        let first = crate::sched::active_scheduler()
            .ok()
            .and_then(|desc| desc.select_next())
            .or_else(idle_tcb_ptr);

        unsafe { set_tcb_next_ptr(first) };
    });

    crate::port::init();
    crate::port::systick_init(crate::config::CFG_CPU_CLOCK_HZ / CFG_TICK_RATE_HZ);

    KERNEL.set_running(true);
    crate::info!("kernel starting");

    crate::port::start_first_task();
    Ok(())
}

// ============ Context transfer ============

/// Request a switch to a specific task from thread context.
///
/// Validates the target TCB before anything else; the actual register
/// switch happens in PendSV. The very first call instead bootstraps the
/// first task.
pub fn switch_to(next: NonNull<Tcb>) -> KernelResult<()> {
    unsafe { next.as_ref() }.validate_magic()?;

    if !KERNEL.is_running() {
        critical_section(|_cs| unsafe { set_tcb_next_ptr(Some(next)) });
        KERNEL.set_running(true);
        crate::port::start_first_task();
        return Ok(());
    }

    critical_section(|_cs| unsafe { set_tcb_next_ptr(Some(next)) });
    crate::port::ctx_sw();
    Ok(())
}

/// Request a switch from handler mode; the switch runs on interrupt exit
/// via the PendSV tail-chain.
pub fn switch_from_isr(next: NonNull<Tcb>) -> KernelResult<()> {
    if !crate::critical::is_isr_context() {
        return Err(KernelError::NotAllowed);
    }
    unsafe { next.as_ref() }.validate_magic()?;

    unsafe { set_tcb_next_ptr(Some(next)) };
    crate::port::int_ctx_sw();
    Ok(())
}

// ============ ISR bracket ============

/// Enter ISR bookkeeping
pub fn int_enter() {
    if KERNEL.is_running() {
        let nesting = KERNEL.int_nesting.load(Ordering::Relaxed);
        if nesting < u8::MAX {
            KERNEL.int_nesting.store(nesting + 1, Ordering::Relaxed);
        }
    }
}

/// Exit ISR; at nesting zero this is a scheduling point
pub fn int_exit() {
    if !KERNEL.is_running() {
        return;
    }

    let _cs = CriticalSection::enter();

    let nesting = KERNEL.int_nesting.load(Ordering::Relaxed);
    if nesting == 0 {
        return;
    }
    KERNEL.int_nesting.store(nesting - 1, Ordering::Relaxed);

    if nesting - 1 == 0 && KERNEL.sched_lock_nesting() == 0 {
        crate::sched::schedule();
    }
}

// ============ Scheduler lock ============

/// Lock the scheduler
pub fn sched_lock() -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }
    if crate::critical::is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    critical_section(|_cs| KERNEL.try_sched_lock())
}

/// Unlock the scheduler; unlocking the last level is a scheduling point
pub fn sched_unlock() -> KernelResult<()> {
    if !KERNEL.is_running() {
        return Err(KernelError::NotRunning);
    }
    if crate::critical::is_isr_context() {
        return Err(KernelError::IsrContext);
    }

    let remaining = critical_section(|_cs| KERNEL.try_sched_unlock())?;
    if remaining == 0 {
        crate::sched::schedule();
    }
    Ok(())
}

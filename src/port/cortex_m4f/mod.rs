//! Cortex-M4F port implementation
//!
//! Context switching via the PendSV tail-chain, first-task bootstrap and
//! yield via SVC, lazy FPU stacking, per-task MPU reprogramming, and
//! cycle-accurate switch timing against the configured budget.

#![allow(named_asm_labels)]

pub mod cycles;
pub mod fault;
pub mod fpu;
pub mod mpu;

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;

use crate::config::CFG_SWITCH_CYCLES_MAX;
use crate::error::KernelError;
use crate::kernel::{kernel_panic, PanicReason, CPU_STATE};
use crate::task::validate_stack;
use crate::types::TaskState;

/// SHCSR bits enabling the separable fault handlers
const SHCSR_MEMFAULTENA: u32 = 1 << 16;
const SHCSR_BUSFAULTENA: u32 = 1 << 17;
const SHCSR_USGFAULTENA: u32 = 1 << 18;

/// One-time port bring-up.
///
/// PendSV drops to the numerically lowest exception priority so a switch
/// only ever runs once every other handler has drained; SVC sits at the
/// highest. The cycle counter and the FPU's automatic + lazy state
/// preservation come up here too.
pub fn init() {
    unsafe {
        let mut p = cortex_m::Peripherals::steal();

        p.SCB.set_priority(SystemHandler::PendSV, 0xF0);
        p.SCB.set_priority(SystemHandler::SysTick, 0xF0);
        p.SCB.set_priority(SystemHandler::SVCall, 0x00);

        // Promote the configurable faults out of HardFault escalation
        (*cortex_m::peripheral::SCB::PTR)
            .shcsr
            .modify(|v| v | SHCSR_MEMFAULTENA | SHCSR_BUSFAULTENA | SHCSR_USGFAULTENA);

        fpu::enable();
        cycles::enable();

        // A pathological pend before the first SVC finds a null PSP
        asm!("msr psp, {0}", in(reg) 0u32);
    }

    crate::switch::reset_switch_cycle_stats();
}

/// Initialize SysTick timer for system tick generation
///
/// # Arguments
/// * `reload` - Reload value, e.g. `CFG_CPU_CLOCK_HZ / CFG_TICK_RATE_HZ`
pub fn systick_init(reload: u32) {
    let mut p = unsafe { cortex_m::Peripherals::steal() };

    p.SYST.set_reload(reload - 1);
    p.SYST.clear_current();
    p.SYST.set_clock_source(SystClkSource::Core);
    p.SYST.enable_interrupt();
    p.SYST.enable_counter();
}

/// Trigger context switch from task level
#[inline(always)]
pub fn ctx_sw() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Trigger context switch from interrupt level
#[inline(always)]
pub fn int_ctx_sw() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Voluntary yield, routed through SVC #1
#[inline(always)]
pub fn yield_now() {
    unsafe {
        asm!("svc 1", options(nomem, nostack));
    }
}

/// Bootstrap the first task via SVC #0. Control never comes back to the
/// caller's context: the handler exception-returns into the task.
pub fn start_first_task() {
    unsafe {
        cortex_m::interrupt::enable();
        asm!("svc 0", options(noreturn));
    }
}

/// Helper called from PendSV to perform TCB switching.
///
/// Runs with interrupts masked. Validates both stacks, reprograms the
/// MPU for the incoming task, and folds the measured cycle count into
/// the switch statistics. Returns the incoming task's stack pointer, or
/// the outgoing one when there is nothing to switch to.
#[inline(never)]
#[no_mangle]
unsafe extern "C" fn pendsv_switch_context(cur_sp: *mut u32) -> *mut u32 {
    unsafe {
        let t_entry = cycles::now();
        let cpu = &mut *core::ptr::addr_of_mut!(CPU_STATE);

        if !cpu.tcb_cur.is_null() {
            let cur = &mut *cpu.tcb_cur;

            if cur.validate_magic().is_err() {
                kernel_panic(PanicReason::TcbCorruption, cpu.tcb_cur as u32);
            }
            match validate_stack(cur, cur_sp) {
                Ok(()) => {}
                Err(KernelError::StackOverflow) => {
                    kernel_panic(PanicReason::StackOverflow, cur_sp as u32)
                }
                Err(_) => kernel_panic(PanicReason::StackCorruption, cur_sp as u32),
            }

            cur.stk_ptr = cur_sp;
            cur.ctx_switches = cur.ctx_switches.wrapping_add(1);
            if cur.state == TaskState::Running {
                cur.state = TaskState::Ready;
            }
        }

        let next = cpu.tcb_next;
        if next.is_null() {
            // Spurious pend: restore exactly what was saved
            return cur_sp;
        }
        cpu.tcb_next = core::ptr::null_mut();

        let next_ref = &mut *next;
        if next_ref.validate_magic().is_err() {
            kernel_panic(PanicReason::TcbCorruption, next as u32);
        }
        match validate_stack(next_ref, next_ref.stk_ptr) {
            Ok(()) => {}
            Err(KernelError::StackOverflow) => {
                kernel_panic(PanicReason::StackOverflow, next_ref.stk_ptr as u32)
            }
            Err(_) => kernel_panic(PanicReason::StackCorruption, next_ref.stk_ptr as u32),
        }

        if next_ref.mpu_enabled {
            mpu::program_task_regions(next_ref);
        }

        next_ref.state = TaskState::Running;
        cpu.tcb_cur = next;

        let elapsed = cycles::now().wrapping_sub(t_entry);
        crate::switch::stats::SWITCH_CYCLES
            .get_unchecked()
            .record(elapsed, CFG_SWITCH_CYCLES_MAX);

        next_ref.stk_ptr
    }
}

/// PendSV exception handler - performs the full context switch
///
/// 1. Push S16-S31 if the outgoing frame is extended (lazy FPU pending)
/// 2. Push R4-R11 and EXC_RETURN, plus the alignment pad
/// 3. Call the switch helper to swap TCB pointers
/// 4. Restore in reverse from the new task's stack
/// 5. Exception return
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    use crate::core::kernel::CPU_STATE;

    naked_asm!(
        "cpsid i",

        "mrs r0, psp",

        "ldr r1, ={cpu_state}",
        "ldr r1, [r1]",
        "cbz r1, 1f",

        "tst lr, #0x10",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",

        "stmdb r0!, {{r4-r11, lr}}",

        "sub r0, r0, #4",

        "1:",
        "bl pendsv_switch_context",

        "cbz r0, 2f",
        "add r0, r0, #4",
        "ldmia r0!, {{r4-r11, lr}}",

        "tst lr, #0x10",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",

        "msr psp, r0",

        "2:",
        "dsb",
        "isb",
        "cpsie i",

        "bx lr",

        cpu_state = sym CPU_STATE,
    );
}

/// Helper called from SVC #0: install the first task as current and hand
/// its saved stack pointer back to the bootstrap sequence.
#[no_mangle]
unsafe extern "C" fn svc_first_task_sp() -> *mut u32 {
    unsafe {
        let cpu = &mut *core::ptr::addr_of_mut!(CPU_STATE);

        let first = cpu.tcb_next;
        if first.is_null() {
            kernel_panic(PanicReason::TcbCorruption, 0);
        }
        cpu.tcb_next = core::ptr::null_mut();
        cpu.tcb_cur = first;

        // No outgoing task at bootstrap, so no switch counter moves
        let first_ref = &mut *first;
        first_ref.state = TaskState::Running;
        first_ref.stk_ptr as *mut u32
    }
}

/// Non-bootstrap SVC requests. #1 is yield; everything else is ignored.
#[no_mangle]
unsafe extern "C" fn svc_dispatch(num: u32) {
    if num == 1 {
        crate::sched::rotate_current();
    }
}

/// SVC exception handler
///
/// Reads the immediate out of the svc instruction that trapped. #0 is the
/// first-task bootstrap: pop the software frame of the selected task, set
/// PSP, and exception-return straight into its entry. Other numbers fall
/// through to the dispatcher and return normally.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "tst lr, #4",
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",

        "ldr r1, [r0, #24]",
        "ldrb r1, [r1, #-2]",
        "cbnz r1, 1f",

        "bl svc_first_task_sp",
        "add r0, r0, #4",
        "ldmia r0!, {{r4-r11, lr}}",
        "msr psp, r0",
        "isb",
        "bx lr",

        "1:",
        "mov r0, r1",
        "b svc_dispatch",
    );
}

/// SysTick exception handler - drives the kernel tick
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::kernel::int_enter();
    crate::time::tick();
    crate::kernel::int_exit();
}

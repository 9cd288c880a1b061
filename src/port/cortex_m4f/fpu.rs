//! FPU access and lazy state preservation
//!
//! The switch path relies on the hardware contract: with ASPEN and LSPEN
//! set, exception entry reserves space for S0-S15 + FPSCR but defers the
//! actual store until the first FP instruction. PendSV only touches
//! S16-S31, and only for tasks whose frame is extended.

/// Coprocessor access control register
const CPACR: *mut u32 = 0xE000_ED88 as *mut u32;

/// Floating-point context control register
const FPCCR: *mut u32 = 0xE000_EF34 as *mut u32;

/// CP10/CP11 full access
const CPACR_CP10_CP11_FULL: u32 = 0xF << 20;

/// Automatic state preservation enable
const FPCCR_ASPEN: u32 = 1 << 31;
/// Lazy state preservation enable
const FPCCR_LSPEN: u32 = 1 << 30;

/// Grant full CP10/CP11 access and turn on automatic + lazy stacking.
///
/// # Safety
/// Must run once during port bring-up, before any task executes FP code.
pub unsafe fn enable() {
    unsafe {
        let cpacr = core::ptr::read_volatile(CPACR);
        core::ptr::write_volatile(CPACR, cpacr | CPACR_CP10_CP11_FULL);

        let fpccr = core::ptr::read_volatile(FPCCR);
        core::ptr::write_volatile(FPCCR, fpccr | FPCCR_ASPEN | FPCCR_LSPEN);
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

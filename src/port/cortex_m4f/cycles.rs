//! DWT cycle counter access
//!
//! The switch path reads CYCCNT through a raw volatile load rather than a
//! peripheral handle: a function-call prologue would distort the sub-µs
//! measurements the timing contract is about.

/// DWT cycle counter register
const DWT_CYCCNT: *const u32 = 0xE000_1004 as *const u32;

/// DWT software lock access register
const DWT_LAR: *mut u32 = 0xE000_1FB0 as *mut u32;

/// Unlock magic for LAR
const DWT_LAR_UNLOCK: u32 = 0xC5AC_CE55;

/// Enable the cycle counter: TRCENA in DEMCR, LAR unlock on parts that
/// implement the software lock, then CYCCNTENA.
///
/// # Safety
/// Must run once during port bring-up.
pub unsafe fn enable() {
    unsafe {
        let mut p = cortex_m::Peripherals::steal();

        p.DCB.enable_trace();
        core::ptr::write_volatile(DWT_LAR, DWT_LAR_UNLOCK);

        p.DWT.cyccnt.write(0);
        p.DWT.enable_cycle_counter();
    }
}

/// Current cycle count
#[inline(always)]
pub fn now() -> u32 {
    unsafe { core::ptr::read_volatile(DWT_CYCCNT) }
}

//! Critical section handling for DSRTOS
//!
//! Critical sections nest: the entry primitive saves the prior interrupt
//! mask and returns it, the exit primitive restores it. The switch
//! controller additionally bounds the time spent with interrupts masked.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::types::NestingCtr;

/// Current critical-section nesting depth
static NESTING: AtomicU8 = AtomicU8::new(0);

/// Saved interrupt-mask state returned by [`enter`]
pub type SavedMask = bool;

/// Enter a critical section, returning the prior interrupt-mask state.
///
/// Pair every call with [`exit`], passing the returned mask back.
#[inline(always)]
pub fn enter() -> SavedMask {
    let was_active;
    #[cfg(target_arch = "arm")]
    {
        was_active = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
    }
    #[cfg(not(target_arch = "arm"))]
    {
        was_active = NESTING.load(Ordering::Relaxed) == 0;
    }

    NESTING.fetch_add(1, Ordering::Relaxed);
    was_active
}

/// Leave a critical section, restoring the interrupt mask saved on entry.
#[inline(always)]
pub fn exit(saved: SavedMask) {
    let nesting = NESTING.load(Ordering::Relaxed);
    if nesting > 0 {
        NESTING.store(nesting - 1, Ordering::Relaxed);
    }

    #[cfg(target_arch = "arm")]
    if saved {
        unsafe { cortex_m::interrupt::enable() };
    }
    #[cfg(not(target_arch = "arm"))]
    let _ = saved;
}

/// Current critical-section nesting depth
#[inline(always)]
pub fn get_nesting() -> NestingCtr {
    NESTING.load(Ordering::Relaxed)
}

/// Reset nesting bookkeeping (kernel re-initialization only)
pub(crate) fn reset() {
    NESTING.store(0, Ordering::Relaxed);
}

/// RAII guard for critical sections
///
/// When this guard is created, interrupts are disabled.
/// When it is dropped, the prior interrupt-mask state is restored.
pub struct CriticalSection {
    saved: SavedMask,
}

impl CriticalSection {
    /// Enter a critical section by disabling interrupts.
    #[inline(always)]
    pub fn enter() -> Self {
        CriticalSection { saved: enter() }
    }

    /// Check whether any critical section is active
    #[inline(always)]
    pub fn is_active() -> bool {
        get_nesting() > 0
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        exit(self.saved);
    }
}

/// Execute a closure with interrupts disabled
///
/// The closure receives a reference to the critical section guard,
/// which can be used to access [`crate::core::cs_cell::CsCell`] data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// Check if currently executing in an ISR context
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(target_arch = "arm")]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0
    }

    #[cfg(not(target_arch = "arm"))]
    {
        false
    }
}

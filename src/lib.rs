//! DSRTOS — a dynamic-scheduler RTOS kernel for ARM Cortex-M4F
//!
//! A real-time operating system kernel providing:
//! - Runtime-switchable scheduler plugins (priority-preemptive, round-robin, EDF)
//! - Batched task migration between schedulers with rollback
//! - Deterministic context switching via PendSV with lazy FPU stacking
//! - Per-task MPU region reprogramming on the switch path
//! - Cycle-accurate switch timing against a hard budget

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod core;
pub mod port;

// ============ Re-exports ============

pub use core::config;
pub use core::config::*;
pub use core::critical;
pub use core::error;
pub use core::error::KernelError;
pub use core::kernel;
pub use core::kernel::{kernel_init, kernel_start};
pub use core::sched;
pub use core::sched::plugin;
pub use core::switch;
pub use core::task;
pub use core::task::task_create;
pub use core::time;
pub use core::types;
pub use core::types::*;

#[cfg(feature = "pac")]
pub use stm32_metapac as pac;

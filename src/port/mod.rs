//! Port layer - CPU-specific implementations
//!
//! Hardware abstraction for context switching, the cycle counter, MPU and
//! FPU programming, and fault handling.

#[cfg(target_arch = "arm")]
pub mod cortex_m4f;

#[cfg(target_arch = "arm")]
pub use cortex_m4f::*;

// Stub implementations for non-ARM targets (for testing).
//
// The context-switch stubs complete synchronously so host tests can
// observe the scheduling decisions without exception hardware.
#[cfg(not(target_arch = "arm"))]
pub mod stub {
    use crate::kernel::CPU_STATE;
    use crate::types::TaskState;

    pub fn init() {}

    pub fn systick_init(_reload: u32) {}

    fn complete_switch() {
        unsafe {
            let cpu = &mut *core::ptr::addr_of_mut!(CPU_STATE);
            if cpu.tcb_next.is_null() {
                return;
            }

            if !cpu.tcb_cur.is_null() {
                // The switch counter belongs to the task being switched out
                let cur = &mut *cpu.tcb_cur;
                cur.ctx_switches = cur.ctx_switches.wrapping_add(1);
                if cur.state == TaskState::Running {
                    cur.state = TaskState::Ready;
                }
            }

            let next = &mut *cpu.tcb_next;
            next.state = TaskState::Running;

            cpu.tcb_cur = cpu.tcb_next;
            cpu.tcb_next = core::ptr::null_mut();
        }
    }

    pub fn ctx_sw() {
        complete_switch();
    }

    pub fn int_ctx_sw() {
        complete_switch();
    }

    pub fn yield_now() {
        crate::sched::rotate_current();
    }

    pub fn start_first_task() {
        complete_switch();
    }
}

#[cfg(not(target_arch = "arm"))]
pub use stub::*;

//! Switch Demo - runtime scheduler switching on STM32F407

#![cfg_attr(target_arch = "arm", no_std)]
#![cfg_attr(target_arch = "arm", no_main)]

#[cfg(target_arch = "arm")]
mod demo {
    use cortex_m_rt::entry;
    use dsrtos::plugin::{SCHED_ID_PRIORITY, SCHED_ID_RR};
    use dsrtos::switch::{switch_scheduler, SwitchRequest};
    use dsrtos::task::Tcb;
    use dsrtos::task_create;
    use dsrtos::time::task_sleep;
    use dsrtos::types::{MigrationStrategy, StkElement, SwitchReason};

    // ============ Task Storage ============

    static mut WORKER_A_STK: [StkElement; 512] = [0; 512];
    static mut WORKER_A_TCB: Tcb = Tcb::new();

    static mut WORKER_B_STK: [StkElement; 512] = [0; 512];
    static mut WORKER_B_TCB: Tcb = Tcb::new();

    static mut CONTROL_STK: [StkElement; 512] = [0; 512];
    static mut CONTROL_TCB: Tcb = Tcb::new();

    // ============ Tasks ============

    fn worker_a(_: *mut ()) -> ! {
        dsrtos::info!("worker A started");
        loop {
            dsrtos::info!("worker A running");
            let _ = task_sleep(250);
        }
    }

    fn worker_b(_: *mut ()) -> ! {
        dsrtos::info!("worker B started");
        loop {
            dsrtos::info!("worker B running");
            let _ = task_sleep(250);
        }
    }

    /// Flips the active scheduler between priority-preemptive and
    /// round-robin once a second, migrating the workers back and forth.
    fn control_task(_: *mut ()) -> ! {
        let mut to_rr = true;
        loop {
            let _ = task_sleep(1000);

            let (source, target) = if to_rr {
                (SCHED_ID_PRIORITY, SCHED_ID_RR)
            } else {
                (SCHED_ID_RR, SCHED_ID_PRIORITY)
            };

            let req = SwitchRequest::new(
                source,
                target,
                SwitchReason::Manual,
                MigrationStrategy::PreserveOrder,
            );
            match switch_scheduler(&req) {
                Ok(outcome) => {
                    dsrtos::info!(
                        "switched {} -> {}: {} tasks in {}us",
                        source,
                        target,
                        outcome.tasks_migrated,
                        outcome.duration_us as u32
                    );
                    to_rr = !to_rr;
                }
                Err(_) => dsrtos::warn!("switch {} -> {} rejected", source, target),
            }
        }
    }

    // ============ Main ============

    #[entry]
    fn main() -> ! {
        dsrtos::kernel_init().expect("kernel init failed");

        task_create(
            unsafe { &mut *core::ptr::addr_of_mut!(WORKER_A_TCB) },
            unsafe { &mut *core::ptr::addr_of_mut!(WORKER_A_STK) },
            "WorkerA",
            worker_a,
            10,
        )
        .expect("worker A failed");

        task_create(
            unsafe { &mut *core::ptr::addr_of_mut!(WORKER_B_TCB) },
            unsafe { &mut *core::ptr::addr_of_mut!(WORKER_B_STK) },
            "WorkerB",
            worker_b,
            10,
        )
        .expect("worker B failed");

        task_create(
            unsafe { &mut *core::ptr::addr_of_mut!(CONTROL_TCB) },
            unsafe { &mut *core::ptr::addr_of_mut!(CONTROL_STK) },
            "Control",
            control_task,
            5,
        )
        .expect("control task failed");

        dsrtos::info!("starting kernel");
        dsrtos::kernel_start().expect("kernel start failed");

        loop {
            cortex_m::asm::nop();
        }
    }
}

// The demo only makes sense on target hardware
#[cfg(not(target_arch = "arm"))]
fn main() {}

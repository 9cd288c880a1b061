//! Unit tests for core kernel modules
//!
//! These tests run on the host (not embedded target) to verify the core
//! algorithms work correctly: scheduler plugins, migration strategies,
//! the switch controller's phase machine and rollback, snapshots, and the
//! statistics plumbing. The port layer's host stubs complete context
//! switches synchronously so scheduling decisions are observable.

use core::ptr::NonNull;
use std::sync::Mutex;

use dsrtos::error::KernelError;
use dsrtos::kernel;
use dsrtos::plugin::{self, SCHED_ID_EDF, SCHED_ID_PRIORITY, SCHED_ID_RR};
use dsrtos::sched;
use dsrtos::switch::{self, SwitchPolicy, SwitchRequest};
use dsrtos::task::{self, Tcb};
use dsrtos::time;
use dsrtos::types::*;
use dsrtos::{kernel_init, kernel_start};

/// Kernel globals are process-wide; scenario tests take this lock
static KERNEL_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn never_runs(_: *mut ()) -> ! {
    unreachable!("task entry executed on host");
}

fn spawn(name: &'static str, prio: Prio) -> NonNull<Tcb> {
    let tcb: &'static mut Tcb = Box::leak(Box::default());
    let raw: *mut Tcb = tcb;
    let stack: &'static mut [StkElement] = Box::leak(vec![0u32; 256].into_boxed_slice());
    task::task_create(tcb, stack, name, never_runs, prio).expect("task creation failed");
    NonNull::new(raw).expect("tcb pointer")
}

fn spawn_ext(params: task::TaskParams) -> NonNull<Tcb> {
    let tcb: &'static mut Tcb = Box::leak(Box::default());
    let raw: *mut Tcb = tcb;
    let stack: &'static mut [StkElement] = Box::leak(vec![0u32; 256].into_boxed_slice());
    task::task_create_ext(tcb, stack, never_runs, params).expect("task creation failed");
    NonNull::new(raw).expect("tcb pointer")
}

/// Drain a plugin's queue through the capability vector, returning the
/// traversal order as task ids
fn drain_queue(id: SchedulerId) -> Vec<TaskId> {
    let desc = plugin::lookup_scheduler(id).expect("scheduler");
    let mut order = Vec::new();
    while let Some(tcb) = desc.select_next() {
        order.push(unsafe { tcb.as_ref().id });
        unsafe { desc.remove_task(tcb).expect("remove") };
    }
    order
}

fn advance_ms(ms: u32) {
    for _ in 0..ms {
        time::tick();
    }
}

// ============ Plugin registry ============

mod registry_tests {
    use super::*;

    #[test]
    fn builtin_plugins_are_registered() {
        let _g = lock();
        kernel_init().expect("init");

        assert!(plugin::lookup_scheduler(SCHED_ID_PRIORITY).is_ok());
        assert!(plugin::lookup_scheduler(SCHED_ID_RR).is_ok());
        assert!(plugin::lookup_scheduler(SCHED_ID_EDF).is_ok());
        assert_eq!(
            plugin::lookup_scheduler(99).err(),
            Some(KernelError::InvalidScheduler)
        );
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");

        static DUP: plugin::SchedulerDescriptor = plugin::SchedulerDescriptor {
            id: SCHED_ID_PRIORITY,
            name: "dup",
            ops: plugin::SchedulerOps::empty(),
        };
        assert_eq!(
            plugin::register_scheduler(&DUP),
            Err(KernelError::SchedulerExists)
        );
    }
}

// ============ Task lifecycle ============

mod task_tests {
    use super::*;

    #[test]
    fn creation_assigns_ids_and_order() {
        let _g = lock();
        kernel_init().expect("init");

        let a = spawn("A", 10);
        let b = spawn("B", 20);

        let (a, b) = unsafe { (a.as_ref(), b.as_ref()) };
        assert!(b.creation_order > a.creation_order);
        assert_ne!(a.id, b.id);
        assert_eq!(task::task_count(), 2);
        assert_eq!(a.state, TaskState::Ready);
        assert_eq!(a.magic, task::TCB_MAGIC);
    }

    #[test]
    fn creation_validates_parameters() {
        let _g = lock();
        kernel_init().expect("init");

        let tcb: &'static mut Tcb = Box::leak(Box::default());
        let tiny: &'static mut [StkElement] = Box::leak(vec![0u32; 8].into_boxed_slice());
        assert_eq!(
            task::task_create(tcb, tiny, "tiny", never_runs, 5),
            Err(KernelError::StackSizeInvalid)
        );
    }

    #[test]
    fn initial_frame_carries_entry_and_param() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn_ext(task::TaskParams {
            arg: 0xCAFE_BABEusize as *mut (),
            ..task::TaskParams::new("boot", 5)
        });
        let tcb = unsafe { t.as_ref() };

        assert_eq!(tcb.stk_ptr as usize % 8, 0);

        // software frame: pad, r4-r11, exc_return; hardware frame follows
        let frame = unsafe { core::slice::from_raw_parts(tcb.stk_ptr, 18) };
        assert_eq!(frame[9], 0xFFFF_FFFD); // exc_return, thread mode PSP
        assert_eq!(frame[10], 0xCAFE_BABE); // r0 = param
        assert_eq!(frame[16], (never_runs as usize as u32) | 1); // pc
        assert_eq!(frame[17], 0x0100_0000); // xpsr, thumb only

        // canary and floor guard are planted
        unsafe {
            assert_eq!(tcb.stk_base.read(), task::STACK_GUARD);
            assert_eq!(tcb.stk_base.add(1).read(), task::STACK_CANARY);
        }
        task::verify_integrity(tcb).expect("intact stack");
    }

    #[test]
    fn corrupted_stack_is_reported_not_freed() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn("victim", 5);
        unsafe {
            // clobber the canary word
            (*t.as_ptr()).stk_base.add(1).write(0);
        }
        assert_eq!(task::task_delete(Some(t)), Err(KernelError::Corrupted));
        // the task was not torn down
        assert_eq!(task::task_count(), 1);
    }

    #[test]
    fn suspend_excludes_resume_readmits() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn("S", 5);
        task::task_suspend(t).expect("suspend");
        assert_eq!(unsafe { t.as_ref().state }, TaskState::Suspended);
        assert_eq!(
            task::task_suspend(t),
            Err(KernelError::TaskSuspended)
        );

        task::task_resume(t).expect("resume");
        assert_eq!(unsafe { t.as_ref().state }, TaskState::Ready);
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), vec![unsafe { t.as_ref().id }]);
    }
}

// ============ Scheduler plugins ============

mod plugin_tests {
    use super::*;

    #[test]
    fn priority_plugin_orders_by_priority() {
        let _g = lock();
        kernel_init().expect("init");

        let lo = spawn("lo", 30);
        let hi = spawn("hi", 5);
        let mid = spawn("mid", 10);

        let expected = unsafe { vec![hi.as_ref().id, mid.as_ref().id, lo.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), expected);
    }

    #[test]
    fn remove_absent_task_is_distinguished() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn("T", 5);
        let desc = plugin::lookup_scheduler(SCHED_ID_PRIORITY).expect("scheduler");

        unsafe {
            desc.remove_task(t).expect("first remove");
            assert_eq!(desc.remove_task(t), Err(KernelError::TaskNotQueued));
        }
    }

    #[test]
    fn edf_plugin_orders_by_deadline() {
        let _g = lock();
        kernel_init().expect("init");

        let late = spawn_ext(task::TaskParams {
            deadline_us: 2_000_000,
            ..task::TaskParams::new("late", 5)
        });
        let soon = spawn_ext(task::TaskParams {
            deadline_us: 15_000,
            ..task::TaskParams::new("soon", 5)
        });
        let mid = spawn_ext(task::TaskParams {
            deadline_us: 300_000,
            ..task::TaskParams::new("mid", 5)
        });

        let edf = plugin::lookup_scheduler(SCHED_ID_EDF).expect("edf");
        unsafe {
            // EDF refuses deadline-less tasks
            let bare = spawn("bare", 9);
            assert!(!edf.can_accept(bare));

            for t in [late, soon, mid] {
                let src = plugin::lookup_scheduler(SCHED_ID_PRIORITY).expect("prio");
                src.remove_task(t).expect("remove");
                edf.add_task(t).expect("admit");
            }
        }

        let expected = unsafe { vec![soon.as_ref().id, mid.as_ref().id, late.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_EDF), expected);
    }
}

// ============ Priority remapping ============

mod priority_map_tests {
    use super::*;

    #[test]
    fn default_rules_apply() {
        let _g = lock();
        kernel_init().expect("init");

        assert_eq!(switch::map_priority(SCHED_ID_RR, SCHED_ID_PRIORITY, 77), 128);
        assert_eq!(switch::map_priority(SCHED_ID_PRIORITY, SCHED_ID_RR, 77), 0);
        assert_eq!(switch::map_priority(SCHED_ID_EDF, SCHED_ID_PRIORITY, 10), 10);
        assert_eq!(switch::map_priority(SCHED_ID_EDF, SCHED_ID_PRIORITY, 200), 64);
        assert_eq!(switch::map_priority(SCHED_ID_EDF, SCHED_ID_RR, 42), 42);
    }

    #[test]
    fn custom_entries_win() {
        let _g = lock();
        kernel_init().expect("init");

        switch::install_priority_mapping(SCHED_ID_RR, SCHED_ID_PRIORITY, 5, 200).expect("install");
        assert_eq!(switch::map_priority(SCHED_ID_RR, SCHED_ID_PRIORITY, 5), 200);
        // only the installed source priority is overridden
        assert_eq!(switch::map_priority(SCHED_ID_RR, SCHED_ID_PRIORITY, 6), 128);

        // reinstalling the same key replaces the entry
        switch::install_priority_mapping(SCHED_ID_RR, SCHED_ID_PRIORITY, 5, 17).expect("replace");
        assert_eq!(switch::map_priority(SCHED_ID_RR, SCHED_ID_PRIORITY, 5), 17);
    }

    #[test]
    fn deadline_bands() {
        assert_eq!(switch::deadline_band(0), 0);
        assert_eq!(switch::deadline_band(9), 0);
        assert_eq!(switch::deadline_band(10), 32);
        assert_eq!(switch::deadline_band(99), 32);
        assert_eq!(switch::deadline_band(100), 128);
        assert_eq!(switch::deadline_band(999), 128);
        assert_eq!(switch::deadline_band(1000), 192);
    }
}

// ============ Snapshots ============

mod snapshot_tests {
    use super::*;
    use dsrtos::switch::{QueueSnapshot, StateBuffer, CHECKSUM_SEED};

    #[test]
    fn checksum_fold_is_seeded() {
        assert_eq!(switch::fold_checksum([]), CHECKSUM_SEED);
        assert_ne!(switch::fold_checksum([1, 2]), switch::fold_checksum([2, 1]));
    }

    #[test]
    fn queue_snapshot_round_trips_order() {
        let _g = lock();
        kernel_init().expect("init");

        let a = spawn("a", 10);
        let b = spawn("b", 20);
        let c = spawn("c", 30);

        let mut snap = QueueSnapshot::new();
        snap.capture([a, b, c], 123).expect("capture");
        snap.verify().expect("intact");

        let desc = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
        // pull the tasks out of the priority plugin so re-admission is clean
        drain_queue(SCHED_ID_PRIORITY);
        snap.restore_to_scheduler(desc).expect("restore");

        let expected = unsafe { vec![a.as_ref().id, b.as_ref().id, c.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_RR), expected);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");

        let a = spawn("a", 10);
        let mut snap = QueueSnapshot::new();
        snap.capture([a], 0).expect("capture");

        snap.checksum ^= 1;
        assert_eq!(snap.verify(), Err(KernelError::ChecksumError));

        let desc = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
        assert_eq!(
            snap.restore_to_scheduler(desc),
            Err(KernelError::ChecksumError)
        );
    }

    #[test]
    fn scheduler_state_save_restore_is_noop() {
        let _g = lock();
        kernel_init().expect("init");

        let rr = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
        let mut buf = StateBuffer::new();
        buf.save_scheduler_state(rr).expect("save");
        buf.restore_scheduler_state(rr).expect("restore");

        // descriptor-image default path for a plugin without save hooks
        let prio = plugin::lookup_scheduler(SCHED_ID_PRIORITY).expect("prio");
        let mut buf = StateBuffer::new();
        buf.save_scheduler_state(prio).expect("save default");
        buf.restore_scheduler_state(prio).expect("restore default");
    }

    #[test]
    fn corrupted_state_buffer_is_refused() {
        let _g = lock();
        kernel_init().expect("init");

        let rr = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
        let mut buf = StateBuffer::new();
        buf.save_scheduler_state(rr).expect("save");

        buf.data[0] ^= 0x01;
        assert_eq!(
            buf.restore_scheduler_state(rr),
            Err(KernelError::ChecksumError)
        );
    }
}

// ============ Switch controller scenarios ============

mod controller_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn no_interval_policy() -> SwitchPolicy {
        SwitchPolicy {
            min_interval_ms: 0,
            ..SwitchPolicy::new()
        }
    }

    #[test]
    fn empty_task_list_switches_with_zero_migrations() {
        let _g = lock();
        kernel_init().expect("init");

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        let outcome = switch::switch_scheduler(&req).expect("switch");

        assert_eq!(outcome.tasks_migrated, 0);
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_RR);
        assert_eq!(switch::switch_history().success_count(), 1);
    }

    #[test]
    fn preserve_order_switch_keeps_traversal_order() {
        let _g = lock();
        kernel_init().expect("init");

        let tasks: Vec<_> = ["T1", "T2", "T3", "T4"]
            .iter()
            .enumerate()
            .map(|(i, name)| spawn(name, 10 + i as Prio))
            .collect();

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        let outcome = switch::switch_scheduler(&req).expect("switch");
        assert_eq!(outcome.tasks_migrated, 4);

        let expected: Vec<_> = tasks.iter().map(|t| unsafe { t.as_ref().id }).collect();
        assert_eq!(drain_queue(SCHED_ID_RR), expected);

        let history = switch::switch_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history.success_count(), 1);

        // priorities are untouched by preserve-order
        for (i, t) in tasks.iter().enumerate() {
            assert_eq!(unsafe { t.as_ref().prio }, 10 + i as Prio);
        }
    }

    #[test]
    fn priority_strategy_applies_the_map() {
        let _g = lock();
        kernel_init().expect("init");

        spawn("a", 40);
        spawn("b", 10);

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PriorityBased,
        );
        switch::switch_scheduler(&req).expect("switch");

        // priority -> round-robin collapses every priority to zero
        let rr = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
        while let Some(t) = rr.select_next() {
            assert_eq!(unsafe { t.as_ref().prio }, 0);
            unsafe { rr.remove_task(t).expect("remove") };
        }
    }

    #[test]
    fn priority_map_feeds_the_target_plugin() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(no_interval_policy());

        let a = spawn("ma", 40);
        let b = spawn("mb", 10);

        // stage both tasks under round-robin first
        let stage = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        switch::switch_scheduler(&stage).expect("stage");

        // round-robin to priority collapses into the normal band, applied
        // through the priority plugin's own adjust capability
        let req = SwitchRequest::new(
            SCHED_ID_RR,
            SCHED_ID_PRIORITY,
            SwitchReason::Test,
            MigrationStrategy::PriorityBased,
        );
        switch::switch_scheduler(&req).expect("switch");

        assert_eq!(unsafe { a.as_ref().prio }, 128);
        assert_eq!(unsafe { b.as_ref().prio }, 128);

        // priority-ascending migration order: b (10) went in before a (40)
        let expected = unsafe { vec![b.as_ref().id, a.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), expected);
    }

    #[test]
    fn deadline_strategy_orders_and_bands() {
        let _g = lock();
        kernel_init().expect("init");

        let late = spawn_ext(task::TaskParams {
            deadline_us: 2_000_000,
            ..task::TaskParams::new("late", 3)
        });
        let soon = spawn_ext(task::TaskParams {
            deadline_us: 15_000,
            ..task::TaskParams::new("soon", 3)
        });

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_EDF,
            SwitchReason::Deadline,
            MigrationStrategy::DeadlineBased,
        );
        switch::switch_scheduler(&req).expect("switch");

        let expected = unsafe { vec![soon.as_ref().id, late.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_EDF), expected);

        // 15 ticks remaining lands in the 32 band, 2000 in the 192 band
        assert_eq!(unsafe { soon.as_ref().prio }, 32);
        assert_eq!(unsafe { late.as_ref().prio }, 192);
    }

    #[test]
    fn custom_strategy_without_function_preserves_order() {
        let _g = lock();
        kernel_init().expect("init");

        let t1 = spawn("c1", 30);
        let t2 = spawn("c2", 10);

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::Custom,
        );
        switch::switch_scheduler(&req).expect("switch");

        // creation order, not priority order
        let expected = unsafe { vec![t1.as_ref().id, t2.as_ref().id] };
        assert_eq!(drain_queue(SCHED_ID_RR), expected);
    }

    #[test]
    fn batch_size_does_not_change_the_result() {
        let _g = lock();

        let mut orders = Vec::new();
        for batch_size in [1usize, 32] {
            kernel_init().expect("init");
            switch::set_policy(SwitchPolicy {
                batch_size,
                ..no_interval_policy()
            });

            for (i, name) in ["B1", "B2", "B3", "B4"].iter().enumerate() {
                spawn(name, 10 + i as Prio);
            }

            let req = SwitchRequest::new(
                SCHED_ID_PRIORITY,
                SCHED_ID_RR,
                SwitchReason::Test,
                MigrationStrategy::PreserveOrder,
            );
            switch::switch_scheduler(&req).expect("switch");

            // compare by name: ids restart with each init
            let rr = plugin::lookup_scheduler(SCHED_ID_RR).expect("rr");
            let mut names = Vec::new();
            while let Some(t) = rr.select_next() {
                names.push(unsafe { t.as_ref().name });
                unsafe { rr.remove_task(t).expect("remove") };
            }
            orders.push(names);
        }
        assert_eq!(orders[0], orders[1]);
    }

    #[test]
    fn progress_callback_sees_batches() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            batch_size: 2,
            ..no_interval_policy()
        });

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static LAST_COMPLETED: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        fn progress(completed: usize, total: usize) {
            CALLS.fetch_add(1, Ordering::SeqCst);
            LAST_COMPLETED.store(completed, Ordering::SeqCst);
            assert_eq!(total, 4);
        }

        for (i, name) in ["P1", "P2", "P3", "P4"].iter().enumerate() {
            spawn(name, 10 + i as Prio);
        }

        let mut req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        req.progress = Some(progress);
        switch::switch_scheduler(&req).expect("switch");

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(LAST_COMPLETED.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn round_trip_restores_priority_and_state() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(no_interval_policy());

        let tasks: Vec<_> = (0..4).map(|i| spawn("rt", 10 + i * 5)).collect();
        let before: Vec<_> = tasks
            .iter()
            .map(|t| unsafe { (t.as_ref().prio, t.as_ref().state) })
            .collect();

        let fwd = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        switch::switch_scheduler(&fwd).expect("forward");

        let back = SwitchRequest::new(
            SCHED_ID_RR,
            SCHED_ID_PRIORITY,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        switch::switch_scheduler(&back).expect("back");

        let after: Vec<_> = tasks
            .iter()
            .map(|t| unsafe { (t.as_ref().prio, t.as_ref().state) })
            .collect();
        assert_eq!(before, after);

        // conservation: every task is still tracked, in creation order
        let ids: Vec<_> = tasks.iter().map(|t| unsafe { t.as_ref().id }).collect();
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), ids);
    }

    #[test]
    fn suspended_tasks_stay_behind() {
        let _g = lock();
        kernel_init().expect("init");

        let keep = spawn("keep", 10);
        let parked = spawn("parked", 20);
        task::task_suspend(parked).expect("suspend");

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        let outcome = switch::switch_scheduler(&req).expect("switch");

        assert_eq!(outcome.tasks_migrated, 1);
        assert_eq!(drain_queue(SCHED_ID_RR), vec![unsafe { keep.as_ref().id }]);
        assert_eq!(unsafe { parked.as_ref().state }, TaskState::Suspended);
    }
}

// ============ Policy gate ============

mod gate_tests {
    use super::*;

    #[test]
    fn same_source_and_target_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");
        spawn("t", 5);

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_PRIORITY,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(switch::switch_scheduler(&req), Err(KernelError::NotAllowed));
        assert!(switch::switch_history().is_empty());
    }

    #[test]
    fn disabled_runtime_switching_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            runtime_switching_enabled: false,
            ..SwitchPolicy::new()
        });

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(switch::switch_scheduler(&req), Err(KernelError::NotAllowed));
    }

    #[test]
    fn unknown_scheduler_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            42,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(
            switch::switch_scheduler(&req),
            Err(KernelError::InvalidScheduler)
        );
    }

    #[test]
    fn min_interval_gates_back_to_back_switches() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            min_interval_ms: 100,
            ..SwitchPolicy::new()
        });
        spawn("g", 5);

        let fwd = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        switch::switch_scheduler(&fwd).expect("first switch");
        let stats_after_first = switch::switch_stats();

        // 50 ms later: inside the minimum interval
        advance_ms(50);
        let back = SwitchRequest::new(
            SCHED_ID_RR,
            SCHED_ID_PRIORITY,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(switch::switch_scheduler(&back), Err(KernelError::NotAllowed));

        // no state change, no history entry
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_RR);
        assert_eq!(switch::switch_history().len(), 1);
        let stats = switch::switch_stats();
        assert_eq!(stats.total_switches, stats_after_first.total_switches);

        // once the interval has elapsed the gate opens again
        advance_ms(60);
        switch::switch_scheduler(&back).expect("second switch");
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
    }

    #[test]
    fn estimated_duration_must_fit_the_deadline() {
        let _g = lock();
        kernel_init().expect("init");
        for i in 0..4 {
            spawn("d", 10 + i);
        }

        let mut req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Deadline,
            MigrationStrategy::PreserveOrder,
        );
        // base 20us + 4 tasks x 10us = 60us estimated
        req.deadline_us = 30;
        assert_eq!(switch::switch_scheduler(&req), Err(KernelError::NotAllowed));

        req.deadline_us = 500;
        switch::switch_scheduler(&req).expect("fits");
    }

    #[test]
    fn abort_without_a_switch_is_rejected() {
        let _g = lock();
        kernel_init().expect("init");
        assert_eq!(switch::abort_switch(), Err(KernelError::NotAllowed));
    }

    #[test]
    fn abort_between_batches_rolls_back() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            batch_size: 1,
            ..SwitchPolicy::new()
        });

        fn abort_after_first(_completed: usize, _total: usize) {
            let _ = switch::abort_switch();
        }

        let tasks: Vec<_> = (0..3).map(|i| spawn("ab", 10 + i * 10)).collect();

        let mut req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        req.progress = Some(abort_after_first);

        assert_eq!(switch::switch_scheduler(&req), Err(KernelError::Aborted));

        // rolled back: source active again and holding every task
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
        assert_eq!(switch::switch_stats().rollback_count, 1);
        let ids: Vec<_> = tasks.iter().map(|t| unsafe { t.as_ref().id }).collect();
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), ids);
    }
}

// ============ Rollback ============

mod rollback_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static ADD_CALLS: AtomicU32 = AtomicU32::new(0);

    unsafe fn failing_add(_tcb: NonNull<Tcb>) -> Result<(), KernelError> {
        let n = ADD_CALLS.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            return Err(KernelError::InvalidParameter);
        }
        Ok(())
    }

    unsafe fn accept_remove(_tcb: NonNull<Tcb>) -> Result<(), KernelError> {
        Ok(())
    }

    static FAILING_TARGET: plugin::SchedulerDescriptor = plugin::SchedulerDescriptor {
        id: 7,
        name: "failing",
        ops: plugin::SchedulerOps {
            init: None,
            add_task: Some(failing_add),
            remove_task: Some(accept_remove),
            select_next: None,
            can_accept: None,
            save_state: None,
            restore_state: None,
            clear_queues: None,
            adjust_priority: None,
        },
    };

    #[test]
    fn failed_migration_rolls_back_to_source() {
        let _g = lock();
        kernel_init().expect("init");
        plugin::register_scheduler(&FAILING_TARGET).expect("register");
        ADD_CALLS.store(0, Ordering::SeqCst);

        let tasks: Vec<_> = (0..4).map(|i| spawn("rb", 10 + i * 10)).collect();
        let before: Vec<_> = tasks
            .iter()
            .map(|t| unsafe { (t.as_ref().id, t.as_ref().prio) })
            .collect();

        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            7,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        let result = switch::switch_scheduler(&req);

        // two tasks crossed before the third admission failed
        assert_eq!(
            result,
            Err(KernelError::PartialSuccess {
                completed: 2,
                total: 4
            })
        );

        // controller is idle again, rolled back, source is active
        assert_eq!(switch::current_phase(), SwitchPhase::Idle);
        assert!(!switch::switch_in_progress());
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
        assert_eq!(switch::switch_stats().rollback_count, 1);

        // every task is back with its original priority
        let after: Vec<_> = tasks
            .iter()
            .map(|t| unsafe { (t.as_ref().id, t.as_ref().prio) })
            .collect();
        assert_eq!(before, after);
        assert_eq!(
            drain_queue(SCHED_ID_PRIORITY),
            before.iter().map(|(id, _)| *id).collect::<Vec<_>>()
        );

        // the failure is in the history with its error code
        let history = switch::switch_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history.failure_count(), 1);
        let record = history.get(0).expect("record");
        assert!(!record.success);
        assert_eq!(
            record.error_code,
            KernelError::PartialSuccess {
                completed: 2,
                total: 4
            }
            .code()
        );

        // the recorded failure phase is where the error struck
        let (phase, code) = switch::last_switch_error().expect("error");
        assert_eq!(phase, SwitchPhase::MigratingTasks);
        assert_eq!(code, record.error_code);
    }

    #[test]
    fn forced_switch_keeps_partial_progress() {
        let _g = lock();
        kernel_init().expect("init");
        plugin::register_scheduler(&FAILING_TARGET).expect("register");
        ADD_CALLS.store(0, Ordering::SeqCst);

        for i in 0..4 {
            spawn("fp", 10 + i * 10);
        }

        let mut req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            7,
            SwitchReason::Emergency,
            MigrationStrategy::PreserveOrder,
        );
        req.forced = true;
        let result = switch::switch_scheduler(&req);

        assert!(matches!(
            result,
            Err(KernelError::PartialSuccess { completed: 2, .. })
        ));
        // no rollback happened
        assert_eq!(switch::switch_stats().rollback_count, 0);
    }

    #[test]
    fn task_validation_hook_rejects_before_any_movement() {
        let _g = lock();
        kernel_init().expect("init");

        fn reject_all(_tcb: &Tcb) -> bool {
            false
        }
        switch::set_task_validation_hook(Some(reject_all));

        let t = spawn("v", 5);
        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(
            switch::switch_scheduler(&req),
            Err(KernelError::ValidationFailed)
        );

        // nothing moved and no rollback was needed
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
        assert_eq!(switch::switch_stats().rollback_count, 0);
        assert_eq!(switch::switch_stats().failed_switches, 1);
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), vec![unsafe { t.as_ref().id }]);
    }

    #[test]
    fn verification_hook_failure_triggers_rollback() {
        let _g = lock();
        kernel_init().expect("init");

        fn verify_fails() -> bool {
            false
        }
        switch::set_verification_hook(Some(verify_fails));

        let t = spawn("vf", 5);
        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        assert_eq!(
            switch::switch_scheduler(&req),
            Err(KernelError::VerificationFailed)
        );

        assert_eq!(switch::switch_stats().rollback_count, 1);
        assert_eq!(sched::active_scheduler_id(), SCHED_ID_PRIORITY);
        assert_eq!(drain_queue(SCHED_ID_PRIORITY), vec![unsafe { t.as_ref().id }]);
    }
}

// ============ History and statistics invariants ============

mod stats_tests {
    use super::*;

    #[test]
    fn history_counts_match_stats() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            min_interval_ms: 0,
            ..SwitchPolicy::new()
        });
        spawn("h", 5);

        let fwd = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        let back = SwitchRequest::new(
            SCHED_ID_RR,
            SCHED_ID_PRIORITY,
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );
        let bad = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_EDF, // the deadline-less task cannot be accepted
            SwitchReason::Test,
            MigrationStrategy::PreserveOrder,
        );

        switch::switch_scheduler(&fwd).expect("fwd");
        switch::switch_scheduler(&back).expect("back");
        assert!(switch::switch_scheduler(&bad).is_err());

        let stats = switch::switch_stats();
        let history = switch::switch_history();

        assert_eq!(stats.successful_switches, 2);
        assert_eq!(stats.failed_switches, 1);
        assert_eq!(stats.total_switches, 3);
        assert_eq!(history.success_count(), 2);
        assert_eq!(history.failure_count(), 1);
        assert_eq!(
            history.success_count() + history.failure_count(),
            stats.total_switches as usize
        );
    }
}

// ============ Yield and bootstrap scenarios ============

mod scenario_tests {
    use super::*;

    #[test]
    fn first_task_bootstrap_installs_current() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn_ext(task::TaskParams {
            arg: 0xCAFE_BABEusize as *mut (),
            ..task::TaskParams::new("first", 4)
        });

        kernel::switch_to(t).expect("bootstrap");
        assert_eq!(task::current_task(), Some(t));
        assert_eq!(unsafe { t.as_ref().state }, TaskState::Running);

        // R0 of the pending frame still carries the entry argument
        let frame = unsafe { core::slice::from_raw_parts(t.as_ref().stk_ptr, 18) };
        assert_eq!(frame[10], 0xCAFE_BABE);
    }

    #[test]
    fn yield_round_robin_alternates_tasks() {
        let _g = lock();
        kernel_init().expect("init");
        switch::set_policy(SwitchPolicy {
            min_interval_ms: 0,
            ..SwitchPolicy::new()
        });

        let a = spawn("A", 8);
        let b = spawn("B", 8);

        // move both tasks under the round-robin plugin, then start
        let req = SwitchRequest::new(
            SCHED_ID_PRIORITY,
            SCHED_ID_RR,
            SwitchReason::Manual,
            MigrationStrategy::PreserveOrder,
        );
        switch::switch_scheduler(&req).expect("switch");
        kernel_start().expect("start");

        assert_eq!(task::current_task(), Some(a));
        let switches_before =
            unsafe { a.as_ref().ctx_switches + b.as_ref().ctx_switches };

        task::task_yield().expect("yield A");
        assert_eq!(task::current_task(), Some(b));
        assert_eq!(unsafe { a.as_ref().state }, TaskState::Ready);

        task::task_yield().expect("yield B");
        assert_eq!(task::current_task(), Some(a));

        let switches_after =
            unsafe { a.as_ref().ctx_switches + b.as_ref().ctx_switches };
        assert_eq!(switches_after - switches_before, 2);
        assert_eq!(unsafe { a.as_ref().voluntary_yields }, 1);
        assert_eq!(unsafe { b.as_ref().voluntary_yields }, 1);
    }

    #[test]
    fn higher_priority_ready_task_preempts_on_isr_exit() {
        let _g = lock();
        kernel_init().expect("init");

        let low = spawn("L", 50);
        kernel_start().expect("start");
        assert_eq!(task::current_task(), Some(low));

        // a "late-arriving" high-priority task becomes ready
        let high = spawn("H", 5);

        assert_eq!(task::current_task(), Some(high));
        assert_eq!(unsafe { high.as_ref().state }, TaskState::Running);
        assert_eq!(unsafe { low.as_ref().state }, TaskState::Ready);
    }

    #[test]
    fn switch_from_isr_requires_handler_mode() {
        let _g = lock();
        kernel_init().expect("init");

        let t = spawn("isr", 5);
        kernel_start().expect("start");
        assert_eq!(kernel::switch_from_isr(t), Err(KernelError::NotAllowed));
    }

    #[test]
    fn scheduler_lock_defers_preemption() {
        let _g = lock();
        kernel_init().expect("init");

        let low = spawn("lo", 50);
        kernel_start().expect("start");
        assert_eq!(task::current_task(), Some(low));

        kernel::sched_lock().expect("lock");
        let high = spawn("hi", 5);
        // the ready high-priority task does not preempt while locked
        assert_eq!(task::current_task(), Some(low));

        kernel::sched_unlock().expect("unlock");
        assert_eq!(task::current_task(), Some(high));
    }

    #[test]
    fn sleeping_task_moves_to_blocked_and_wakes() {
        let _g = lock();
        kernel_init().expect("init");

        let a = spawn("sleepy", 5);
        let b = spawn("other", 9);
        kernel_start().expect("start");
        assert_eq!(task::current_task(), Some(a));

        time::task_sleep(3).expect("sleep");
        assert_eq!(unsafe { a.as_ref().state }, TaskState::Blocked);
        assert_eq!(task::current_task(), Some(b));

        advance_ms(3);
        assert_eq!(unsafe { a.as_ref().state }, TaskState::Running);
        assert_eq!(task::current_task(), Some(a));
    }
}

// ============ Cycle statistics ============

mod cycle_tests {
    use dsrtos::switch::CycleStats;

    #[test]
    fn budget_overruns_are_counted() {
        let mut stats = CycleStats::new();
        stats.record(140, 250);
        stats.record(190, 250);
        stats.record(260, 250);

        assert_eq!(stats.count(), 3);
        assert_eq!(stats.min(), 140);
        assert_eq!(stats.max(), 260);
        assert_eq!(stats.over_budget(), 1);
        assert!(stats.percentile(50) >= 140);
    }
}

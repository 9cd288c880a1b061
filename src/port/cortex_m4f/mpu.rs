//! ARM Cortex-M4 Memory Protection Unit
//!
//! Per-task regions are stored pre-encoded in the TCB and programmed on
//! switch-in. The common case of at most two regions takes an unrolled
//! sequence; larger sets iterate, and a DSB+ISB pair closes the
//! reprogramming either way.

use cortex_m::peripheral::MPU;

use crate::config::CFG_MPU_REGIONS_MAX;
use crate::task::{MpuRegion, Tcb};

/* Control Register */
pub const MPU_ENABLE: u32 = 1;
pub const MPU_PRIVILEGED_DEFAULT_ENABLE: u32 = 1 << 2;

/* Region Base Address Register */
pub const MPU_REGION_VALID: u32 = 1 << 4;

/* Region Attribute and Status Register */
pub const MPU_REGION_ENABLE: u32 = 1;

/// Access permission field (RASR.AP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Permission {
    NoAccess = 0b000,
    PrivilegedRw = 0b001,
    ReadWrite = 0b011,
    PrivilegedRo = 0b101,
    ReadOnly = 0b110,
}

/// Encode a region image for normal, write-through cacheable memory.
///
/// `size_log2` is the region size exponent: a 1 KiB region passes 10.
/// Regions smaller than 32 bytes are not representable.
pub fn region(base: u32, size_log2: u8, permission: Permission, executable: bool) -> MpuRegion {
    debug_assert!(size_log2 >= 5);

    let mut rasr = MPU_REGION_ENABLE
        | (((size_log2 - 1) as u32) << 1)
        | ((permission as u32) << 24)
        | (1 << 17); // C: write-through cacheable

    if !executable {
        rasr |= 1 << 28; // XN
    }

    MpuRegion {
        rbar: base & !0x1F,
        rasr,
    }
}

#[inline(always)]
unsafe fn write_region(slot: u32, region: &MpuRegion) {
    unsafe {
        let mpu = &*MPU::PTR;
        mpu.rnr.write(slot);
        mpu.rbar.write(region.rbar | MPU_REGION_VALID | slot);
        mpu.rasr.write(region.rasr);
    }
}

#[inline(always)]
unsafe fn disable_region(slot: u32) {
    unsafe {
        let mpu = &*MPU::PTR;
        mpu.rnr.write(slot);
        mpu.rasr.write(0);
        mpu.rbar.write(MPU_REGION_VALID | slot);
    }
}

/// Program a task's regions during switch-in.
///
/// # Safety
/// Must run with interrupts masked; the region table in the TCB must be
/// consistent with `mpu_region_count`.
pub unsafe fn program_task_regions(tcb: &Tcb) {
    let count = (tcb.mpu_region_count as usize).min(CFG_MPU_REGIONS_MAX);

    unsafe {
        if count <= 2 {
            // Fast path: unrolled two-slot programming
            if count >= 1 {
                write_region(0, &tcb.mpu_regions[0]);
            } else {
                disable_region(0);
            }
            if count == 2 {
                write_region(1, &tcb.mpu_regions[1]);
            } else {
                disable_region(1);
            }
            for slot in 2..CFG_MPU_REGIONS_MAX as u32 {
                disable_region(slot);
            }
        } else {
            for slot in 0..CFG_MPU_REGIONS_MAX {
                if slot < count {
                    write_region(slot as u32, &tcb.mpu_regions[slot]);
                } else {
                    disable_region(slot as u32);
                }
            }
        }
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Turn the MPU on, keeping the privileged default memory map as
/// background so the kernel itself stays unrestricted.
///
/// # Safety
/// Region slots must be populated (or disabled) before enabling.
pub unsafe fn enable() {
    unsafe {
        (*MPU::PTR)
            .ctrl
            .write(MPU_ENABLE | MPU_PRIVILEGED_DEFAULT_ENABLE);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Turn the MPU off.
///
/// # Safety
/// Callers must ensure no task depends on region enforcement.
pub unsafe fn disable() {
    unsafe {
        (*MPU::PTR).ctrl.write(0);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

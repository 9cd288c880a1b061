//! System fault handlers
//!
//! HardFault, MemManage, BusFault and UsageFault read the fault status
//! registers, capture what the hardware stacked, and forward to the
//! kernel panic sink with a code that distinguishes the handler, the
//! stack in use, and the offending address when one is valid.

use cortex_m::peripheral::SCB;
use cortex_m_rt::{exception, ExceptionFrame};

use crate::kernel::{kernel_panic, PanicReason};

/// MemManage fault address register
const MMFAR: *const u32 = 0xE000_ED34 as *const u32;
/// BusFault address register
const BFAR: *const u32 = 0xE000_ED38 as *const u32;

/// CFSR.MMARVALID
const CFSR_MMARVALID: u32 = 1 << 7;
/// CFSR.BFARVALID
const CFSR_BFARVALID: u32 = 1 << 15;

#[inline]
fn cfsr() -> u32 {
    unsafe { (*SCB::PTR).cfsr.read() }
}

#[inline]
fn psp_in_use() -> bool {
    cortex_m::register::control::read().spsel().is_psp()
}

/// Pack handler identity, stack selection, and address validity into the
/// info word handed to the panic sink.
fn fault_info(cfsr: u32, addr: Option<u32>) -> u32 {
    let mut info = cfsr & 0x00FF_FFFF;
    if psp_in_use() {
        info |= 1 << 31;
    }
    if let Some(addr) = addr {
        info |= 1 << 30;
        crate::error!("fault address {:x}", addr);
    }
    info
}

#[exception]
unsafe fn HardFault(frame: &ExceptionFrame) -> ! {
    let cfsr = cfsr();
    crate::error!(
        "hard fault: cfsr {:x} pc {:x} lr {:x}",
        cfsr,
        frame.pc(),
        frame.lr()
    );
    kernel_panic(PanicReason::HardFault, fault_info(cfsr, None));
}

#[exception]
unsafe fn MemoryManagement() -> ! {
    let cfsr = cfsr();
    let addr = if cfsr & CFSR_MMARVALID != 0 {
        Some(unsafe { core::ptr::read_volatile(MMFAR) })
    } else {
        None
    };
    kernel_panic(PanicReason::MemManageFault, fault_info(cfsr, addr));
}

#[exception]
unsafe fn BusFault() -> ! {
    let cfsr = cfsr();
    let addr = if cfsr & CFSR_BFARVALID != 0 {
        Some(unsafe { core::ptr::read_volatile(BFAR) })
    } else {
        None
    };
    kernel_panic(PanicReason::BusFault, fault_info(cfsr, addr));
}

#[exception]
unsafe fn UsageFault() -> ! {
    let cfsr = cfsr();
    kernel_panic(PanicReason::UsageFault, fault_info(cfsr, None));
}

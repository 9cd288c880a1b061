//! Task stack layout, canary and guard handling
//!
//! A task stack is laid out from the top (high address) downward: the
//! hardware exception frame, then the software-saved frame with its
//! alignment pad. The floor of the stack carries a guard word and a canary
//! word, and the unused span is filled with the guard pattern.
//!
//! Frame construction is plain memory writes, so it is shared between the
//! Cortex-M port and the host test build.

use crate::error::{KernelError, KernelResult};
use crate::task::Tcb;
use crate::types::StkElement;

/// Canary sentinel planted one word above the stack floor
pub const STACK_CANARY: u32 = 0x5A5A_A5A5;

/// Guard pattern at the stack floor and in the unused span
pub const STACK_GUARD: u32 = 0xDEAD_BEEF;

/// Marker value preloaded into R12 of the initial frame
pub const R12_MARKER: u32 = 0x1212_1212;

/// EXC_RETURN selecting thread mode on PSP with a basic frame
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set
pub const XPSR_THUMB: u32 = 0x0100_0000;

/// Initial context image as laid out in memory, lowest address first.
///
/// The pad word keeps the saved stack pointer 8-byte aligned; the PendSV
/// save path reserves it with a post-push `sub sp, #4` and the restore path
/// steps over it.
#[repr(C, align(4))]
struct InitStk {
    pad: u32,
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

const INIT_FRAME_WORDS: usize = core::mem::size_of::<InitStk>() / 4;

/// Synthesize the initial exception-return frame for a new task.
///
/// Fills the unused stack span with the guard pattern, plants the floor
/// guard and canary, and returns the stack pointer to store in the TCB.
///
/// # Safety
/// `stk_base` must point to a writable array of at least `stk_size` words.
pub unsafe fn build_initial_frame(
    stk_base: *mut StkElement,
    stk_size: usize,
    entry: usize,
    param: *mut (),
    exit: usize,
) -> *mut StkElement {
    unsafe {
        let stk_top = stk_base.add(stk_size);
        let stk_aligned = ((stk_top as usize) & !7) as *mut u32;

        let frame_ptr = stk_aligned.sub(INIT_FRAME_WORDS) as *mut InitStk;

        (*frame_ptr) = InitStk {
            pad: STACK_GUARD,
            r4: 0x0404_0404,
            r5: 0x0505_0505,
            r6: 0x0606_0606,
            r7: 0x0707_0707,
            r8: 0x0808_0808,
            r9: 0x0909_0909,
            r10: 0x1010_1010,
            r11: 0x1111_1111,
            exc_return: EXC_RETURN_THREAD_PSP,
            r0: param as u32,
            r1: 0,
            r2: 0,
            r3: 0,
            r12: R12_MARKER,
            lr: exit as u32,
            pc: (entry as u32) | 1,
            xpsr: XPSR_THUMB,
        };

        // Guard fill from the floor up to the frame
        let mut p = stk_base;
        let frame_floor = frame_ptr as *mut StkElement;
        while p < frame_floor {
            p.write(STACK_GUARD);
            p = p.add(1);
        }

        // Floor guard word plus the canary above it
        stk_base.write(STACK_GUARD);
        stk_base.add(1).write(STACK_CANARY);

        frame_ptr as *mut StkElement
    }
}

/// Validate a saved stack pointer against the owning TCB.
///
/// Checks bounds, 8-byte alignment, the canary word and the floor guard.
/// Runs before every outgoing save and incoming restore.
pub fn validate_stack(tcb: &Tcb, sp: *const StkElement) -> KernelResult<()> {
    let base = tcb.stk_base as usize;
    let limit = base + tcb.stk_size * core::mem::size_of::<StkElement>();
    let sp = sp as usize;

    if sp < base || sp >= limit {
        return Err(KernelError::StackOverflow);
    }
    if sp % 8 != 0 {
        return Err(KernelError::StackInvalid);
    }

    verify_integrity(tcb)
}

/// Re-verify the canary and floor guard, e.g. before task deletion.
pub fn verify_integrity(tcb: &Tcb) -> KernelResult<()> {
    if tcb.stk_base.is_null() {
        return Err(KernelError::StackInvalid);
    }

    let floor = unsafe { tcb.stk_base.read() };
    let canary = unsafe { tcb.stk_base.add(1).read() };

    if floor != STACK_GUARD || canary != STACK_CANARY || tcb.canary != STACK_CANARY {
        return Err(KernelError::Corrupted);
    }
    Ok(())
}

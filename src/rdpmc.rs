//! Ring-3 counter readers.
//!
//! The measurement side of the crate: once the engine has programmed a
//! machine with user-mode reads permitted, these read the fixed counters
//! directly with `RDPMC`. No syscall, no fence, a handful of cycles per
//! read.
//!
//! Reading a counter that is not enabled for the calling ring raises a
//! general protection fault, which the OS delivers as a fatal signal; gate
//! measurement code on [`perfmon_version`] and on the engine being up.

use core::arch::asm;
use core::arch::x86_64::__cpuid;

use crate::fixed::FixedCounter;

/// RDPMC selector bit that switches from the general-purpose to the
/// fixed-function counter file.
pub const FIXED_SELECT: u32 = 1 << 30;

/// Read a performance counter by raw RDPMC selector.
///
/// Left `pub` for general-purpose counters; fixed counters read nicer
/// through [`read_fixed`] and friends.
#[inline]
pub fn rdpmc(select: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        asm!(
            "rdpmc",
            in("ecx") select,
            out("edx") hi,
            out("eax") lo,
            options(nostack, preserves_flags),
        );
    }
    (hi as u64) << 32 | lo as u64
}

/// Current value of one fixed counter on the calling processor.
#[inline]
pub fn read_fixed(c: FixedCounter) -> u64 {
    rdpmc(FIXED_SELECT | c.index() as u32)
}

/// Retired instructions on the calling processor.
#[inline]
pub fn insn_retired() -> u64 {
    read_fixed(FixedCounter::InstrRetired)
}

/// Unhalted core cycles on the calling processor.
#[inline]
pub fn unhalted_core() -> u64 {
    read_fixed(FixedCounter::CoreCycles)
}

/// Unhalted reference cycles on the calling processor.
#[inline]
pub fn unhalted_ref() -> u64 {
    read_fixed(FixedCounter::RefCycles)
}

/// Architectural performance monitoring version of the calling processor,
/// 0 when there is none.
pub fn perfmon_version() -> u32 {
    if unsafe { __cpuid(0) }.eax < 0xa {
        return 0;
    }
    unsafe { __cpuid(0xa) }.eax & 0xff
}

/// Serialize the instruction stream, so reads on either side of a measured
/// region do not leak into it. CPUID is the classic serializing instruction
/// available to ring 3.
#[inline]
pub fn sync_core() {
    // rbx is reserved by the compiler, so CPUID's clobber of it has to be
    // fenced by hand.
    unsafe {
        asm!(
            "mov {tmp}, rbx",
            "xor eax, eax",
            "cpuid",
            "mov rbx, {tmp}",
            tmp = out(reg) _,
            out("eax") _,
            out("ecx") _,
            out("edx") _,
            options(nostack),
        );
    }
}

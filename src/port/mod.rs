//! Hardware access boundary.
//!
//! Everything the engine does to a machine goes through [`HardwarePort`]:
//! the capability query, exclusive counter claims, and running register
//! callbacks on one or all online processors. The registers themselves are
//! reached through [`CpuRegs`], which is only ever handed to a callback in
//! the context of the processor it describes.

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod msr;
pub mod sim;

use std::io;
use std::sync::Arc;

/// Logical processor id.
pub type CpuId = usize;

/// Model-specific register address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Msr(pub u32);

/// IA32_FIXED_CTR0, first fixed counter value register.
pub const MSR_FIXED_CTR0: Msr = Msr(0x309);
/// IA32_FIXED_CTR_CTRL, per-slot enable fields.
pub const MSR_FIXED_CTR_CTRL: Msr = Msr(0x38d);
/// IA32_PERF_GLOBAL_CTRL, global enable bits.
pub const MSR_GLOBAL_CTRL: Msr = Msr(0x38f);

/// Raw output of the architectural performance monitoring capability query
/// (CPUID leaf 0xA), plus the processor family and model needed to work
/// around models that misreport it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawCapability {
    pub eax: u32,
    pub ebx: u32,
    pub edx: u32,
    pub family: u8,
    pub model: u8,
}

impl RawCapability {
    /// Capability bits for a family-6 processor reporting perfmon version
    /// `version`, `fixed` fixed counters, and the architectural events in
    /// `unavailable` (CPUID 0xA ebx bit positions) as not working.
    pub fn reporting(version: u8, fixed: u8, unavailable: u32) -> Self {
        RawCapability {
            // Bits 24..31 carry the number of valid bits in ebx.
            eax: version as u32 | 7 << 24,
            ebx: unavailable & 0x7f,
            edx: fixed as u32 & 0xf,
            family: 6,
            model: 42,
        }
    }

    pub fn with_model(self, family: u8, model: u8) -> Self {
        RawCapability { family, model, ..self }
    }

    /// Reported counter bit width, in edx bits 5..12.
    pub fn with_width(self, width: u8) -> Self {
        RawCapability {
            edx: (self.edx & 0x1f) | (width as u32) << 5,
            ..self
        }
    }
}

/// Register access on the processor a port callback is running on.
pub trait CpuRegs {
    /// The processor these registers belong to.
    fn id(&self) -> CpuId;

    fn rdmsr(&mut self, msr: Msr) -> io::Result<u64>;

    fn wrmsr(&mut self, msr: Msr, val: u64) -> io::Result<()>;

    /// Toggle the bit that permits counter reads from user mode on this
    /// processor (CR4.PCE on x86).
    fn allow_user_rdpmc(&mut self, allow: bool) -> io::Result<()>;
}

/// Primitive machine operations the counter engine is built on.
///
/// Implementations must tolerate concurrent calls; the engine serializes
/// its own reconfigurations but hotplug callbacks may overlap them.
pub trait HardwarePort: Send + Sync {
    /// One-shot capability query. Reads hardware state, no side effects.
    fn query_capability(&self) -> RawCapability;

    /// Claim exclusive use of one counter register against every other
    /// consumer on the machine. Returns false if it is already held.
    fn claim_counter(&self, msr: Msr) -> bool;

    /// Release a claim. Releasing an unclaimed counter is a no-op.
    fn release_counter(&self, msr: Msr);

    /// Run `f` once on every currently online processor.
    fn each_online_cpu(&self, f: &mut dyn FnMut(&mut dyn CpuRegs));

    /// Run `f` on one processor. Fails if it is offline or unknown.
    fn on_cpu(&self, cpu: CpuId, f: &mut dyn FnMut(&mut dyn CpuRegs)) -> io::Result<()>;
}

impl<P: HardwarePort + ?Sized> HardwarePort for Arc<P> {
    fn query_capability(&self) -> RawCapability {
        (**self).query_capability()
    }

    fn claim_counter(&self, msr: Msr) -> bool {
        (**self).claim_counter(msr)
    }

    fn release_counter(&self, msr: Msr) {
        (**self).release_counter(msr)
    }

    fn each_online_cpu(&self, f: &mut dyn FnMut(&mut dyn CpuRegs)) {
        (**self).each_online_cpu(f)
    }

    fn on_cpu(&self, cpu: CpuId, f: &mut dyn FnMut(&mut dyn CpuRegs)) -> io::Result<()> {
        (**self).on_cpu(cpu, f)
    }
}

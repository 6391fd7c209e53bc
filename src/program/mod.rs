//! Per-processor programming of the fixed counter control registers.
//!
//! `IA32_FIXED_CTR_CTRL` carries one 4-bit enable field per slot and
//! `IA32_PERF_GLOBAL_CTRL` one enable bit per slot at bit `32 + slot`.
//! [`FixedCtrl`] and [`GlobalCtrl`] wrap the raw values so the slot
//! arithmetic lives in one place; both round-trip unrelated bits untouched
//! since other fields of these registers do not belong to us.


use crate::fixed::{CounterMask, FixedCounter, Ring};
use crate::port::{CpuRegs, MSR_FIXED_CTR_CTRL, MSR_GLOBAL_CTRL};
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FixedCtrl(u64);

impl FixedCtrl {
    pub(crate) fn from_bits(bits: u64) -> Self {
        FixedCtrl(bits)
    }

    pub(crate) fn bits(self) -> u64 {
        self.0
    }

    /// Zero the slot's whole 4-bit field (enable, any-thread, PMI).
    pub(crate) fn clear_slot(&mut self, c: FixedCounter) {
        self.0 &= !(0xf << (4 * c.index()));
    }

    /// Enable the slot at `ring`. The field must be clear beforehand.
    pub(crate) fn enable_slot(&mut self, c: FixedCounter, ring: Ring) {
        self.0 |= ring.bits() << (4 * c.index());
    }

    pub(crate) fn slot(self, c: FixedCounter) -> u64 {
        self.0 >> (4 * c.index()) & 0xf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GlobalCtrl(u64);

impl GlobalCtrl {
    pub(crate) fn from_bits(bits: u64) -> Self {
        GlobalCtrl(bits)
    }

    pub(crate) fn bits(self) -> u64 {
        self.0
    }

    pub(crate) fn set_fixed(&mut self, c: FixedCounter) {
        self.0 |= 1 << (32 + c.index());
    }

    pub(crate) fn clear_fixed(&mut self, c: FixedCounter) {
        self.0 &= !(1 << (32 + c.index()));
    }

    pub(crate) fn fixed(self, c: FixedCounter) -> bool {
        self.0 & 1 << (32 + c.index()) != 0
    }
}

/// Program the owned slots on the processor `regs` runs on, then set its
/// user-mode read permission to match `enable`.
///
/// A register failure stops the programming pass for this processor and
/// forces the permission off, so a half-programmed processor never ends up
/// readable from user mode.
pub(crate) fn apply(
    regs: &mut dyn CpuRegs,
    enable: bool,
    owned: CounterMask,
    ring: Ring,
) -> Result<(), Error> {
    log::debug!(
        "cpu {}: fixed counters {} (mask {:?}, ring {})",
        regs.id(),
        if enable { "on" } else { "off" },
        owned,
        ring
    );

    match program(regs, enable, owned, ring) {
        Ok(()) => regs.allow_user_rdpmc(enable).map_err(|source| Error::Msr {
            cpu: regs.id(),
            source,
        }),
        Err(source) => {
            let _ = regs.allow_user_rdpmc(false);
            Err(Error::Msr {
                cpu: regs.id(),
                source,
            })
        }
    }
}

fn program(
    regs: &mut dyn CpuRegs,
    enable: bool,
    owned: CounterMask,
    ring: Ring,
) -> std::io::Result<()> {
    let mut fc = FixedCtrl::from_bits(regs.rdmsr(MSR_FIXED_CTR_CTRL)?);
    let mut gc = GlobalCtrl::from_bits(regs.rdmsr(MSR_GLOBAL_CTRL)?);

    for c in owned.iter() {
        fc.clear_slot(c);
        if enable {
            fc.enable_slot(c, ring);
            gc.set_fixed(c);
        } else {
            gc.clear_fixed(c);
        }
        // Zero the count so a re-enable never starts from a stale value.
        regs.wrmsr(c.msr(), 0)?;
    }

    regs.wrmsr(MSR_FIXED_CTR_CTRL, fc.bits())?;
    regs.wrmsr(MSR_GLOBAL_CTRL, gc.bits())?;
    Ok(())
}

//! Deterministic in-memory machine.
//!
//! Models just enough of a multi-processor machine to exercise the engine:
//! per-processor register files, a machine-wide claim table, processors
//! going on and off line, injectable register faults, and counters that
//! only advance while their programmed enable bits say so.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use super::{
    CpuId, CpuRegs, HardwarePort, Msr, RawCapability, MSR_FIXED_CTR_CTRL, MSR_GLOBAL_CTRL,
};
use crate::fixed::FixedCounter;

/// Counters wrap at the width real parts report most often.
const COUNTER_MASK: u64 = (1 << 48) - 1;

#[derive(Debug)]
pub struct SimMachine {
    capability: RawCapability,
    inner: Mutex<SimState>,
}

#[derive(Debug)]
struct SimState {
    cpus: BTreeMap<CpuId, SimCpu>,
    claimed: HashSet<Msr>,
}

#[derive(Debug, Default)]
struct SimCpu {
    online: bool,
    msrs: HashMap<Msr, u64>,
    user_rdpmc: bool,
    broken: HashSet<Msr>,
}

struct SimCpuRegs<'a> {
    id: CpuId,
    cpu: &'a mut SimCpu,
}

impl CpuRegs for SimCpuRegs<'_> {
    fn id(&self) -> CpuId {
        self.id
    }

    fn rdmsr(&mut self, msr: Msr) -> io::Result<u64> {
        if self.cpu.broken.contains(&msr) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(self.cpu.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn wrmsr(&mut self, msr: Msr, val: u64) -> io::Result<()> {
        if self.cpu.broken.contains(&msr) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        self.cpu.msrs.insert(msr, val);
        Ok(())
    }

    fn allow_user_rdpmc(&mut self, allow: bool) -> io::Result<()> {
        self.cpu.user_rdpmc = allow;
        Ok(())
    }
}

impl SimMachine {
    /// A machine with `cpus` processors, all online, reporting `capability`.
    pub fn new(cpus: usize, capability: RawCapability) -> Self {
        let cpus = (0..cpus)
            .map(|id| {
                (
                    id,
                    SimCpu {
                        online: true,
                        ..SimCpu::default()
                    },
                )
            })
            .collect();
        SimMachine {
            capability,
            inner: Mutex::new(SimState {
                cpus,
                claimed: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap()
    }

    /// Mark a processor on or off line. An off-line processor keeps its
    /// register file so tests can observe the last state programmed into it.
    pub fn set_online(&self, cpu: CpuId, online: bool) {
        self.lock().cpus.entry(cpu).or_default().online = online;
    }

    /// Make every access to `msr` on `cpu` fail from now on.
    pub fn break_msr(&self, cpu: CpuId, msr: Msr) {
        self.lock().cpus.entry(cpu).or_default().broken.insert(msr);
    }

    /// Current value of `msr` on `cpu` (0 if never written).
    pub fn msr(&self, cpu: CpuId, msr: Msr) -> u64 {
        self.lock()
            .cpus
            .get(&cpu)
            .and_then(|c| c.msrs.get(&msr))
            .copied()
            .unwrap_or(0)
    }

    /// Whether user-mode counter reads are currently permitted on `cpu`.
    pub fn user_rdpmc(&self, cpu: CpuId) -> bool {
        self.lock().cpus.get(&cpu).map(|c| c.user_rdpmc).unwrap_or(false)
    }

    /// Number of counter claims currently held machine-wide.
    pub fn claims(&self) -> usize {
        self.lock().claimed.len()
    }

    /// Advance every fixed counter on `cpu` whose enable bits are set.
    pub fn tick(&self, cpu: CpuId, delta: u64) {
        let mut st = self.lock();
        let Some(c) = st.cpus.get_mut(&cpu) else {
            return;
        };
        let fc = c.msrs.get(&MSR_FIXED_CTR_CTRL).copied().unwrap_or(0);
        let gc = c.msrs.get(&MSR_GLOBAL_CTRL).copied().unwrap_or(0);
        for slot in FixedCounter::ALL {
            let i = slot.index();
            let counting = gc & 1 << (32 + i) != 0 && fc >> (4 * i) & 0x3 != 0;
            if counting {
                let v = c.msrs.entry(slot.msr()).or_insert(0);
                *v = (*v + delta) & COUNTER_MASK;
            }
        }
    }
}

impl HardwarePort for SimMachine {
    fn query_capability(&self) -> RawCapability {
        self.capability
    }

    fn claim_counter(&self, msr: Msr) -> bool {
        self.lock().claimed.insert(msr)
    }

    fn release_counter(&self, msr: Msr) {
        self.lock().claimed.remove(&msr);
    }

    fn each_online_cpu(&self, f: &mut dyn FnMut(&mut dyn CpuRegs)) {
        let mut st = self.lock();
        let ids: Vec<CpuId> = st
            .cpus
            .iter()
            .filter(|(_, c)| c.online)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(cpu) = st.cpus.get_mut(&id) {
                f(&mut SimCpuRegs { id, cpu });
            }
        }
    }

    fn on_cpu(&self, cpu: CpuId, f: &mut dyn FnMut(&mut dyn CpuRegs)) -> io::Result<()> {
        let mut st = self.lock();
        match st.cpus.get_mut(&cpu) {
            Some(c) if c.online => {
                f(&mut SimCpuRegs { id: cpu, cpu: c });
                Ok(())
            }
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }
}

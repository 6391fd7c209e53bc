//! Cross-processor state synchronization.
//!
//! [`FixedPmu`] owns everything mutable: the operator settings, the owned
//! slot mask, and the enable flag persisted between reconfigurations. One
//! mutex serializes full reconfigurations; hotplug and power callbacks
//! funnel through the same state so no processor is ever programmed from a
//! torn mix of old and new reservation bits.

mod hotplug;
mod power;
mod settings;
#[cfg(test)]
mod test;

use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;

pub use hotplug::CpuEvent;
pub use settings::Setting;
use settings::Settings;

use crate::fixed::{CounterMask, Ring};
use crate::port::HardwarePort;
use crate::{probe, program, reserve, Error};

bitflags! {
    /// What a reconfiguration pass is allowed to touch.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct Restart: u32 {
        /// Tear the previous programmed state down first if needed.
        const RESET = 1 << 0;
        /// Release and re-acquire counter reservations.
        const RESERVE = 1 << 1;
    }
}

#[derive(Debug, Default)]
struct State {
    settings: Settings,
    /// Slots this engine holds exclusively. Mutated only under the lock.
    owned: CounterMask,
    /// Available slots lost to other consumers at the last reservation.
    conflicts: usize,
    /// Enable flag as of the end of the previous reconfiguration.
    prev_enabled: bool,
    /// Enable flag saved across a suspend.
    resume_enabled: bool,
}

/// The fixed counter engine for one machine.
///
/// Created with [`FixedPmu::new`]; hosts then feed it operator writes
/// ([`FixedPmu::write`]), hotplug events ([`FixedPmu::cpu_event`]) and
/// power transitions ([`FixedPmu::suspend`]/[`FixedPmu::resume`]).
#[derive(Debug)]
pub struct FixedPmu<P: HardwarePort> {
    port: P,
    state: Mutex<State>,
}

impl<P: HardwarePort> FixedPmu<P> {
    /// Probe the machine, reserve its fixed counters and enable them at
    /// ring 3 on every online processor.
    ///
    /// Fails with [`Error::Unsupported`] without touching any register if
    /// the machine reports no usable fixed counters; callers should then
    /// stay inert and register no event handlers.
    pub fn new(port: P) -> Result<Self, Error> {
        if probe::probe(&port).slots == 0 {
            return Err(Error::Unsupported);
        }

        let pmu = FixedPmu {
            port,
            state: Mutex::new(State::default()),
        };
        pmu.restart(Restart::RESERVE);
        Ok(pmu)
    }

    /// Disable the counters everywhere, clear the user-read permission and
    /// release every reservation. Idempotent.
    ///
    /// There is no `Drop` fallback: dropping the engine without calling
    /// this leaves the machine programmed, exactly like unloading a driver
    /// without its teardown hook.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.settings.enabled = false;
        self.restart_locked(&mut st, Restart::RESET | Restart::RESERVE);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn restart(&self, flags: Restart) {
        let mut st = self.lock();
        self.restart_locked(&mut st, flags);
    }

    /// One serialized reconfiguration pass.
    ///
    /// The reset condition is deliberately asymmetric: enabling while
    /// already enabled tears down first (a second enable pass on top of a
    /// live one must not stack), enabling from the disabled state does not.
    fn restart_locked(&self, st: &mut State, flags: Restart) {
        let enable = st.settings.enabled;

        if flags.contains(Restart::RESET) && ((st.prev_enabled && enable) || !enable) {
            self.broadcast(false, st.owned, st.settings.ring);
            if flags.contains(Restart::RESERVE) {
                // Drop the bits before the claims go back.
                let owned = std::mem::take(&mut st.owned);
                reserve::release(&self.port, owned);
            }
        }

        if enable {
            if flags.contains(Restart::RESERVE) {
                let cap = probe::probe(&self.port);
                let got = reserve::reserve(&self.port, &cap);
                st.owned = got.owned;
                st.conflicts = got.conflicts;
            }
            self.broadcast(true, st.owned, st.settings.ring);
        }

        st.prev_enabled = enable;
    }

    /// Program every online processor. A failing processor is logged and
    /// skipped; the rest still converge.
    fn broadcast(&self, enable: bool, owned: CounterMask, ring: Ring) {
        self.port.each_online_cpu(&mut |regs| {
            if let Err(e) = program::apply(regs, enable, owned, ring) {
                log::error!("{e}");
            }
        });
    }

    /// Slots currently held exclusively.
    pub fn owned(&self) -> CounterMask {
        self.lock().owned
    }

    /// Available slots lost to other consumers at the last reservation.
    pub fn conflicts(&self) -> usize {
        self.lock().conflicts
    }
}

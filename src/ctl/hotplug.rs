//! Processor hotplug.

use super::FixedPmu;
use crate::port::{CpuId, HardwarePort};
use crate::program;

/// A hotplug transition for one processor, as delivered by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CpuEvent {
    /// The processor came online.
    Online,
    /// The processor is about to go offline.
    OfflinePrepare,
    /// An offline attempt failed; the processor stays online and must be
    /// programmed again.
    OfflineFailed,
}

impl<P: HardwarePort> FixedPmu<P> {
    /// Converge one processor after a hotplug transition.
    ///
    /// A processor coming online (or surviving a failed offline) is
    /// programmed to the currently persisted state; one leaving is
    /// disabled. Only that processor is touched and reservations are left
    /// alone, so this never contends with a full reconfiguration for more
    /// than the state snapshot.
    pub fn cpu_event(&self, cpu: CpuId, event: CpuEvent) {
        let stay = match event {
            CpuEvent::Online | CpuEvent::OfflineFailed => true,
            CpuEvent::OfflinePrepare => false,
        };

        // Snapshot under the lock; program without it.
        let (enabled, owned, ring) = {
            let st = self.lock();
            (st.settings.enabled, st.owned, st.settings.ring)
        };
        let enable = stay && enabled;

        let result = self.port.on_cpu(cpu, &mut |regs| {
            if let Err(e) = program::apply(regs, enable, owned, ring) {
                log::error!("{e}");
            }
        });
        if let Err(e) = result {
            log::warn!("cpu {cpu}: hotplug programming skipped: {e}");
        }
    }
}

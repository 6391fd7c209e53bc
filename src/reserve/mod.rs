//! Exclusive counter reservation.
//!
//! The counters are a machine-wide resource; every slot is claimed through
//! the port before it may be programmed, and a slot some other consumer
//! already holds is simply left to them.


use crate::fixed::CounterMask;
use crate::port::HardwarePort;
use crate::probe::Capability;

/// Outcome of a reservation pass.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Reserved {
    /// Slots now held exclusively.
    pub owned: CounterMask,
    /// Available slots lost to other consumers.
    pub conflicts: usize,
}

/// Claim every available slot. Conflicting slots are dropped from the
/// result, never stolen.
pub(crate) fn reserve(port: &impl HardwarePort, cap: &Capability) -> Reserved {
    let mut owned = CounterMask::EMPTY;
    let mut conflicts = 0;
    for c in cap.avail.iter() {
        if port.claim_counter(c.msr()) {
            owned.set(c);
        } else {
            conflicts += 1;
        }
    }

    log::info!(
        "{} of {} fixed counters reserved ({} in use elsewhere)",
        owned.len(),
        cap.slots,
        conflicts
    );

    Reserved { owned, conflicts }
}

/// Release every slot in `owned`. Safe on an empty mask and safe to repeat.
pub(crate) fn release(port: &impl HardwarePort, owned: CounterMask) {
    for c in owned.iter() {
        port.release_counter(c.msr());
    }
}

//! Capability discovery.
//!
//! Decodes the raw architectural performance monitoring capability bits
//! into which of the known fixed counter slots this machine actually has.


use crate::fixed::{CounterMask, FixedCounter, SLOTS};
use crate::port::{HardwarePort, RawCapability};

/// Fixed counters were introduced with perfmon version 2.
const MIN_VERSION: u32 = 2;

/// Family-6 model-15 parts (early Core 2) report version 1 but implement
/// the version 2 fixed counters.
const QUIRK_FAMILY: u8 = 6;
const QUIRK_MODEL: u8 = 15;

/// What the machine exposes, clamped to the slots this crate knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capability {
    /// Usable fixed counter slots.
    pub slots: usize,
    /// Slots whose architectural event the machine reports as working.
    pub avail: CounterMask,
    /// Counter bit width.
    pub width: u8,
}

impl Capability {
    /// An unsupported machine: nothing to program.
    pub fn none() -> Self {
        Capability {
            slots: 0,
            avail: CounterMask::EMPTY,
            width: 0,
        }
    }
}

/// Query and decode the machine's fixed counter capability.
pub fn probe(port: &impl HardwarePort) -> Capability {
    decode(port.query_capability())
}

fn decode(raw: RawCapability) -> Capability {
    let version = raw.eax & 0xff;
    if version < MIN_VERSION && !(raw.family == QUIRK_FAMILY && raw.model == QUIRK_MODEL) {
        log::info!("perfmon version {version} too old, no fixed counters");
        return Capability::none();
    }

    let slots = SLOTS.min((raw.edx & 0xf) as usize);

    // ebx reports *unavailable* events; only its low `bitlen` bits are valid.
    let bitlen = raw.eax >> 24 & 0xff;
    let valid = match bitlen {
        0..=31 => (1u32 << bitlen) - 1,
        _ => u32::MAX,
    };
    let working = !raw.ebx & valid;

    let avail = FixedCounter::ALL
        .into_iter()
        .take(slots)
        .filter(|c| working & 1 << c.event_bit() != 0)
        .collect();

    Capability {
        slots,
        avail,
        width: (raw.edx >> 5 & 0xff) as u8,
    }
}

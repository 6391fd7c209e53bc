//! The fixed-function counter slots and their static descriptors.


use std::fmt;

use crate::port::{Msr, MSR_FIXED_CTR0};

/// Number of fixed counter slots this crate knows about.
pub const SLOTS: usize = 3;

/// A fixed-function counter slot.
///
/// The discriminant is the slot index: it selects the counter MSR, the
/// 4-bit enable field in `IA32_FIXED_CTR_CTRL` and the global-enable bit
/// in `IA32_PERF_GLOBAL_CTRL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FixedCounter {
    /// INST_RETIRED.ANY
    InstrRetired = 0,
    /// CPU_CLK_UNHALTED.CORE
    CoreCycles = 1,
    /// CPU_CLK_UNHALTED.REF
    RefCycles = 2,
}

impl FixedCounter {
    /// All slots, in slot order.
    pub const ALL: [FixedCounter; SLOTS] = [
        FixedCounter::InstrRetired,
        FixedCounter::CoreCycles,
        FixedCounter::RefCycles,
    ];

    /// Slot index within the control registers.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit position of the matching architectural event in the CPUID 0xA
    /// event-availability mask. Note that the event order differs from the
    /// slot order.
    pub fn event_bit(self) -> u32 {
        match self {
            FixedCounter::InstrRetired => 1,
            FixedCounter::CoreCycles => 0,
            FixedCounter::RefCycles => 2,
        }
    }

    /// The counter value MSR (`IA32_FIXED_CTR0` + slot).
    pub fn msr(self) -> Msr {
        Msr(MSR_FIXED_CTR0.0 + self as u32)
    }
}

/// Set of fixed counter slots, one bit per slot index.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterMask(u8);

impl CounterMask {
    pub const EMPTY: CounterMask = CounterMask(0);

    pub fn set(&mut self, c: FixedCounter) {
        self.0 |= 1 << c.index();
    }

    pub fn clear(&mut self, c: FixedCounter) {
        self.0 &= !(1 << c.index());
    }

    pub fn contains(self, c: FixedCounter) -> bool {
        self.0 & (1 << c.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of slots in the set.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_subset(self, of: CounterMask) -> bool {
        self.0 & !of.0 == 0
    }

    /// Slots in the set, in slot order.
    pub fn iter(self) -> impl Iterator<Item = FixedCounter> {
        FixedCounter::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<FixedCounter> for CounterMask {
    fn from_iter<I: IntoIterator<Item = FixedCounter>>(iter: I) -> Self {
        let mut mask = CounterMask::EMPTY;
        for c in iter {
            mask.set(c);
        }
        mask
    }
}

impl fmt::Debug for CounterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterMask({:#05b})", self.0)
    }
}

/// Privilege ring at which user-mode counter reads are permitted.
///
/// The numeric value is written bit-exactly into the counter's 4-bit enable
/// field of `IA32_FIXED_CTR_CTRL` (bit 0 counts ring 0, bit 1 counts rings
/// above 0), so `Ring3` counts everywhere and `Ring0` counts nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Ring {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    #[default]
    Ring3 = 3,
}

impl Ring {
    /// The enable-field value for this ring.
    pub fn bits(self) -> u64 {
        self as u64
    }
}

impl TryFrom<i64> for Ring {
    type Error = i64;

    fn try_from(v: i64) -> Result<Self, i64> {
        match v {
            0 => Ok(Ring::Ring0),
            1 => Ok(Ring::Ring1),
            2 => Ok(Ring::Ring2),
            3 => Ok(Ring::Ring3),
            _ => Err(v),
        }
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

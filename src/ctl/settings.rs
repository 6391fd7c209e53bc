//! Operator tunables.
//!
//! A closed set of two integer settings, matching what a sysfs-style
//! control surface exposes. Reads return the stored value, never live
//! hardware state; any successful write reconfigures the whole machine
//! synchronously, including a full release/re-reserve cycle.

use super::{FixedPmu, Restart};
use crate::fixed::Ring;
use crate::port::HardwarePort;
use crate::Error;

/// The engine comes up enabled at ring 3, so loading it is all a machine
/// needs for unrestricted user-mode counter reads.
#[derive(Debug)]
pub(crate) struct Settings {
    pub enabled: bool,
    pub ring: Ring,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enabled: true,
            ring: Ring::Ring3,
        }
    }
}

/// One of the operator tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Setting {
    /// Master enable; any nonzero write enables.
    Enabled,
    /// Ring at which user-mode reads are permitted, 0..=3.
    Ring,
}

impl Setting {
    fn name(self) -> &'static str {
        match self {
            Setting::Enabled => "enabled",
            Setting::Ring => "permission_ring",
        }
    }
}

impl<P: HardwarePort> FixedPmu<P> {
    /// Parse and apply an operator write.
    ///
    /// Rejects non-numeric text and out-of-range rings with
    /// [`Error::InvalidSetting`] before any state changes; on success the
    /// value is stored and a full reconfiguration runs before returning.
    pub fn write(&self, setting: Setting, text: &str) -> Result<(), Error> {
        let value: i64 = text.trim().parse().map_err(|_| Error::InvalidSetting {
            name: setting.name(),
            value: text.into(),
        })?;

        match setting {
            Setting::Enabled => self.set_enabled(value != 0),
            Setting::Ring => {
                let ring = Ring::try_from(value).map_err(|_| Error::InvalidSetting {
                    name: setting.name(),
                    value: text.into(),
                })?;
                self.set_ring(ring);
            }
        }
        Ok(())
    }

    /// The stored value of `setting`, formatted the way a read of the
    /// control surface returns it.
    pub fn show(&self, setting: Setting) -> String {
        let st = self.lock();
        match setting {
            Setting::Enabled => (st.settings.enabled as u8).to_string(),
            Setting::Ring => st.settings.ring.to_string(),
        }
    }

    /// Enable or disable the counters machine-wide.
    pub fn set_enabled(&self, enabled: bool) {
        let mut st = self.lock();
        st.settings.enabled = enabled;
        self.restart_locked(&mut st, Restart::RESET | Restart::RESERVE);
    }

    /// Change the permitted ring. Takes effect immediately on every online
    /// processor when enabled.
    pub fn set_ring(&self, ring: Ring) {
        let mut st = self.lock();
        st.settings.ring = ring;
        self.restart_locked(&mut st, Restart::RESET | Restart::RESERVE);
    }

    pub fn enabled(&self) -> bool {
        self.lock().settings.enabled
    }

    pub fn ring(&self) -> Ring {
        self.lock().settings.ring
    }
}

//! Suspend and resume.

use super::{FixedPmu, Restart};
use crate::port::HardwarePort;

impl<P: HardwarePort> FixedPmu<P> {
    /// Force the counters off for a suspend, remembering the requested
    /// state. Reservations are kept: the claim is in-process bookkeeping
    /// and survives the machine sleeping.
    pub fn suspend(&self) {
        log::debug!("suspending, counters off");
        let mut st = self.lock();
        st.resume_enabled = st.settings.enabled;
        st.settings.enabled = false;
        self.restart_locked(&mut st, Restart::RESET);
    }

    /// Restore the pre-suspend state. Counters that come back enabled are
    /// re-zeroed by the enable pass, so they read near zero right after.
    pub fn resume(&self) {
        log::debug!("resuming");
        let mut st = self.lock();
        st.settings.enabled = st.resume_enabled;
        self.restart_locked(&mut st, Restart::empty());
    }
}

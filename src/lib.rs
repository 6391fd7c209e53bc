//! Ring-3 readable fixed-function performance counters.
//!
//! Processors with architectural performance monitoring version 2 carry up
//! to three fixed-function counters (retired instructions, unhalted core
//! cycles, unhalted reference cycles). This crate discovers which of them a
//! machine exposes, reserves them against other consumers, and programs
//! every online processor so the counters can be read from user mode with
//! `RDPMC` at no measurement overhead. The programmed state is kept
//! consistent through operator reconfiguration, processor hotplug and
//! suspend/resume.
//!
//! The engine drives hardware through the [`port::HardwarePort`] trait.
//! [`port::sim::SimMachine`] is a deterministic in-memory machine for tests
//! and experiments; on Linux, `port::msr::MsrDevPort` backs the trait with
//! the real machine through the `msr` device files.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use fixed_pmu::port::sim::SimMachine;
//! use fixed_pmu::port::RawCapability;
//! use fixed_pmu::{FixedPmu, Ring, Setting};
//!
//! // A 4-processor machine reporting all three fixed counters.
//! let machine = Arc::new(SimMachine::new(4, RawCapability::reporting(2, 3, 0)));
//!
//! // Reserves the counters and enables user-mode reads everywhere.
//! let pmu = FixedPmu::new(Arc::clone(&machine)).unwrap();
//! assert_eq!(pmu.owned().len(), 3);
//! assert!(machine.user_rdpmc(0));
//!
//! // Operator writes go through the same validation as a sysfs store.
//! pmu.write(Setting::Ring, "1").unwrap();
//! assert_eq!(pmu.ring(), Ring::Ring1);
//! assert!(pmu.write(Setting::Ring, "9").is_err());
//!
//! // Disable, release the counters, leave user-mode reads off.
//! pmu.shutdown();
//! assert!(!machine.user_rdpmc(0));
//! ```

pub mod ctl;
pub mod fixed;
pub mod port;
pub mod probe;
mod program;
#[cfg(target_arch = "x86_64")]
pub mod rdpmc;
mod reserve;

use std::io;

use thiserror::Error;

pub use crate::ctl::{CpuEvent, FixedPmu, Setting};
pub use crate::fixed::{CounterMask, FixedCounter, Ring};
pub use crate::port::CpuId;
pub use crate::probe::Capability;

/// Failures surfaced by the counter engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The processor lacks version 2 architectural performance monitoring
    /// or reports no usable fixed counters.
    #[error("fixed-function counter architecture not available")]
    Unsupported,

    /// A control register access failed on one processor.
    ///
    /// Programming of that processor stops at the failing register and its
    /// user-mode read permission is forced off; other processors are
    /// unaffected.
    #[error("cpu {cpu}: register access failed")]
    Msr {
        cpu: CpuId,
        #[source]
        source: io::Error,
    },

    /// An operator-supplied setting was rejected. No state changed.
    #[error("invalid value {value:?} for setting `{name}`")]
    InvalidSetting { name: &'static str, value: String },
}

//! Linux port over the `msr` device files.
//!
//! Needs the `msr` kernel module loaded (`/dev/cpu/N/msr`) and enough
//! privilege to open it for writing, which in practice means root plus
//! `CAP_SYS_RAWIO`. Register callbacks are targeted at a processor by
//! pinning the calling thread to it; exclusive counter claims are advisory
//! `flock` lock files shared by every process using this port.
//!
//! One divergence from raw hardware: Linux owns CR4.PCE, so the user-read
//! permission is driven through the perf `rdpmc` sysfs knob, which is
//! machine-wide rather than per-processor.

use std::collections::HashMap;
use std::fs::{read_to_string, File, OpenOptions};
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use super::{CpuId, CpuRegs, HardwarePort, Msr, RawCapability};

const ONLINE_PATH: &str = "/sys/devices/system/cpu/online";
const RDPMC_PATH: &str = "/sys/bus/event_source/devices/cpu/rdpmc";

fn sched_getaffinity() -> Result<libc::cpu_set_t> {
    let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed();
    let size = size_of::<libc::cpu_set_t>();
    let result = unsafe { libc::sched_getaffinity(0, size, set.as_mut_ptr()) };
    if result != -1 {
        Ok(unsafe { set.assume_init() })
    } else {
        Err(Error::last_os_error())
    }
}

fn sched_setaffinity(set: &libc::cpu_set_t) -> Result<()> {
    let size = size_of::<libc::cpu_set_t>();
    let result = unsafe { libc::sched_setaffinity(0, size, set) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn flock_exclusive(file: &File) -> Result<bool> {
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != -1 {
        Ok(true)
    } else {
        let err = Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

/// Online processor ids from sysfs, e.g. `0-3,5`.
fn online_cpus() -> Result<Vec<CpuId>> {
    let text = read_to_string(ONLINE_PATH)?;
    let mut cpus = Vec::new();
    for part in text.trim().split(',') {
        let mut ends = part.splitn(2, '-');
        let lo: CpuId = ends
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(Error::other)?;
        let hi: CpuId = match ends.next() {
            Some(hi) => hi.parse().map_err(Error::other)?,
            None => lo,
        };
        cpus.extend(lo..=hi);
    }
    Ok(cpus)
}

#[cfg(target_arch = "x86_64")]
fn cpuid(leaf: u32) -> core::arch::x86_64::CpuidResult {
    // Leaf range is checked against leaf 0 in `query_capability` before
    // any other leaf is read.
    unsafe { core::arch::x86_64::__cpuid(leaf) }
}

struct MsrDevRegs {
    cpu: CpuId,
    dev: File,
}

impl CpuRegs for MsrDevRegs {
    fn id(&self) -> CpuId {
        self.cpu
    }

    fn rdmsr(&mut self, msr: Msr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.dev.read_exact_at(&mut buf, msr.0 as u64)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn wrmsr(&mut self, msr: Msr, val: u64) -> Result<()> {
        self.dev.write_all_at(&val.to_ne_bytes(), msr.0 as u64)?;
        Ok(())
    }

    fn allow_user_rdpmc(&mut self, allow: bool) -> Result<()> {
        // 2 permits RDPMC everywhere, 1 is the kernel default (perf events
        // with an active mmap only).
        std::fs::write(RDPMC_PATH, if allow { "2" } else { "1" })
    }
}

/// [`HardwarePort`] over `/dev/cpu/N/msr`.
pub struct MsrDevPort {
    lock_dir: PathBuf,
    claims: Mutex<HashMap<Msr, File>>,
}

impl MsrDevPort {
    /// Port with claim lock files under `/run/lock`.
    pub fn new() -> Self {
        Self::with_lock_dir("/run/lock")
    }

    /// Port with claim lock files under `dir`. Consumers that should
    /// conflict with each other must agree on the directory.
    pub fn with_lock_dir(dir: impl Into<PathBuf>) -> Self {
        MsrDevPort {
            lock_dir: dir.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn with_cpu(&self, cpu: CpuId, f: &mut dyn FnMut(&mut dyn CpuRegs)) -> Result<()> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/dev/cpu/{cpu}/msr"))?;

        let prev = sched_getaffinity()?;
        let mut pinned = unsafe { std::mem::zeroed::<libc::cpu_set_t>() };
        unsafe { libc::CPU_SET(cpu, &mut pinned) };
        sched_setaffinity(&pinned)?;

        f(&mut MsrDevRegs { cpu, dev });

        sched_setaffinity(&prev)
    }
}

impl Default for MsrDevPort {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwarePort for MsrDevPort {
    fn query_capability(&self) -> RawCapability {
        if cpuid(0).eax < 0xa {
            return RawCapability::default();
        }

        let version_info = cpuid(1).eax;
        let family = (version_info >> 8 & 0xf) as u8;
        let mut model = (version_info >> 4 & 0xf) as u8;
        if family == 6 || family == 15 {
            model += ((version_info >> 16 & 0xf) << 4) as u8;
        }

        let leaf = cpuid(0xa);
        RawCapability {
            eax: leaf.eax,
            ebx: leaf.ebx,
            edx: leaf.edx,
            family,
            model,
        }
    }

    fn claim_counter(&self, msr: Msr) -> bool {
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(&msr) {
            return false;
        }
        let path = self.lock_dir.join(format!("fixed-pmu-{:#x}.lock", msr.0));
        let file = match OpenOptions::new().create(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("claim lock {}: {e}", path.display());
                return false;
            }
        };
        match flock_exclusive(&file) {
            // Holding the fd holds the lock.
            Ok(true) => {
                claims.insert(msr, file);
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::warn!("claim lock {}: {e}", path.display());
                false
            }
        }
    }

    fn release_counter(&self, msr: Msr) {
        // Dropping the fd releases the flock.
        self.claims.lock().unwrap().remove(&msr);
    }

    fn each_online_cpu(&self, f: &mut dyn FnMut(&mut dyn CpuRegs)) {
        let cpus = match online_cpus() {
            Ok(cpus) => cpus,
            Err(e) => {
                log::error!("online cpu list: {e}");
                return;
            }
        };
        for cpu in cpus {
            if let Err(e) = self.with_cpu(cpu, f) {
                log::error!("cpu {cpu}: {e}");
            }
        }
    }

    fn on_cpu(&self, cpu: CpuId, f: &mut dyn FnMut(&mut dyn CpuRegs)) -> Result<()> {
        self.with_cpu(cpu, f)
    }
}

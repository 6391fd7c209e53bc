use std::sync::Arc;

use super::CpuEvent;
use crate::fixed::{CounterMask, FixedCounter, Ring};
use crate::port::sim::SimMachine;
use crate::port::{CpuId, RawCapability, MSR_FIXED_CTR_CTRL, MSR_GLOBAL_CTRL};
use crate::{Error, FixedPmu, Setting};

const CPUS: usize = 4;

fn machine() -> Arc<SimMachine> {
    Arc::new(SimMachine::new(CPUS, RawCapability::reporting(2, 3, 0)))
}

/// Reference cycles reported unavailable: two usable slots out of three.
fn two_of_three() -> Arc<SimMachine> {
    Arc::new(SimMachine::new(CPUS, RawCapability::reporting(2, 3, 1 << 2)))
}

fn engine(m: &Arc<SimMachine>) -> FixedPmu<Arc<SimMachine>> {
    FixedPmu::new(Arc::clone(m)).unwrap()
}

fn assert_enabled_at(m: &SimMachine, cpu: CpuId, owned: CounterMask, ring: Ring) {
    let fc = m.msr(cpu, MSR_FIXED_CTR_CTRL);
    let gc = m.msr(cpu, MSR_GLOBAL_CTRL);
    for c in owned.iter() {
        assert_eq!(fc >> (4 * c.index()) & 0xf, ring.bits(), "cpu {cpu} {c:?}");
        assert_ne!(gc & 1 << (32 + c.index()), 0, "cpu {cpu} {c:?}");
    }
    assert!(m.user_rdpmc(cpu), "cpu {cpu}");
}

fn assert_disabled(m: &SimMachine, cpu: CpuId) {
    let fc = m.msr(cpu, MSR_FIXED_CTR_CTRL);
    let gc = m.msr(cpu, MSR_GLOBAL_CTRL);
    for c in FixedCounter::ALL {
        assert_eq!(fc >> (4 * c.index()) & 0xf, 0, "cpu {cpu} {c:?}");
        assert_eq!(gc & 1 << (32 + c.index()), 0, "cpu {cpu} {c:?}");
    }
    assert!(!m.user_rdpmc(cpu), "cpu {cpu}");
}

#[test]
fn init_enables_ring3_everywhere() {
    let m = machine();
    let pmu = engine(&m);

    assert_eq!(pmu.owned().len(), 3);
    assert_eq!(pmu.conflicts(), 0);
    assert_eq!(m.claims(), 3);
    for cpu in 0..CPUS {
        assert_enabled_at(&m, cpu, pmu.owned(), Ring::Ring3);
    }
}

#[test]
fn unsupported_machine_stays_untouched() {
    let m = Arc::new(SimMachine::new(CPUS, RawCapability::reporting(1, 3, 0)));
    let err = FixedPmu::new(Arc::clone(&m)).unwrap_err();
    assert!(matches!(err, Error::Unsupported));

    assert_eq!(m.claims(), 0);
    for cpu in 0..CPUS {
        assert_eq!(m.msr(cpu, MSR_FIXED_CTR_CTRL), 0);
        assert!(!m.user_rdpmc(cpu));
    }
}

#[test]
fn second_engine_loses_every_conflict() {
    let m = two_of_three();
    let first = engine(&m);

    let expect: CounterMask = [FixedCounter::InstrRetired, FixedCounter::CoreCycles]
        .into_iter()
        .collect();
    assert_eq!(first.owned(), expect);

    // An identical consumer on the same machine gets nothing.
    let second = engine(&m);
    assert!(second.owned().is_empty());
    assert_eq!(second.conflicts(), 2);

    // And the first engine still holds its claims.
    assert_eq!(m.claims(), 2);
}

#[test]
fn disable_releases_for_other_consumers() {
    let m = two_of_three();
    let first = engine(&m);
    let held = first.owned();

    first.write(Setting::Enabled, "0").unwrap();
    assert_eq!(first.show(Setting::Enabled), "0");
    assert!(first.owned().is_empty());
    assert_eq!(m.claims(), 0);
    for cpu in 0..CPUS {
        assert_disabled(&m, cpu);
    }

    // The released counters are now up for grabs.
    let second = engine(&m);
    assert_eq!(second.owned(), held);
    assert_eq!(second.conflicts(), 0);
}

#[test]
fn ring_rewrite_reprograms_every_cpu() {
    let m = two_of_three();
    let pmu = engine(&m);

    pmu.write(Setting::Ring, "1").unwrap();
    assert_eq!(pmu.ring(), Ring::Ring1);
    assert_eq!(pmu.show(Setting::Ring), "1");
    assert_eq!(pmu.owned().len(), 2);
    assert_eq!(m.claims(), 2);
    for cpu in 0..CPUS {
        assert_enabled_at(&m, cpu, pmu.owned(), Ring::Ring1);
    }
}

#[test]
fn invalid_writes_change_nothing() {
    let m = machine();
    let pmu = engine(&m);

    for bad in ["abc", "", "4", "-1", "0x2"] {
        assert!(
            matches!(
                pmu.write(Setting::Ring, bad),
                Err(Error::InvalidSetting { name: "permission_ring", .. })
            ),
            "{bad:?}"
        );
    }
    assert!(pmu.write(Setting::Enabled, "on").is_err());

    assert_eq!(pmu.ring(), Ring::Ring3);
    assert!(pmu.enabled());
    for cpu in 0..CPUS {
        assert_enabled_at(&m, cpu, pmu.owned(), Ring::Ring3);
    }
}

#[test]
fn any_nonzero_write_enables() {
    let m = machine();
    let pmu = engine(&m);

    pmu.write(Setting::Enabled, "0").unwrap();
    pmu.write(Setting::Enabled, "-5").unwrap();
    assert!(pmu.enabled());
    assert_eq!(pmu.show(Setting::Enabled), "1");
    assert_enabled_at(&m, 0, pmu.owned(), Ring::Ring3);
}

#[test]
fn reenable_while_enabled_resets_counts() {
    let m = machine();
    let pmu = engine(&m);

    m.tick(0, 500);
    assert_eq!(m.msr(0, FixedCounter::CoreCycles.msr()), 500);

    // Same value written again: full teardown, then a fresh enable pass.
    pmu.write(Setting::Enabled, "1").unwrap();
    assert_eq!(m.msr(0, FixedCounter::CoreCycles.msr()), 0);
    assert_eq!(m.claims(), 3);
    assert_enabled_at(&m, 0, pmu.owned(), Ring::Ring3);
}

#[test]
fn hotplug_online_converges_one_cpu() {
    let m = machine();
    let pmu = engine(&m);
    let owned = pmu.owned();

    // A processor that was not there at init.
    m.set_online(CPUS, true);
    assert!(!m.user_rdpmc(CPUS));

    pmu.cpu_event(CPUS, CpuEvent::Online);
    assert_enabled_at(&m, CPUS, owned, Ring::Ring3);
    // Nothing else moved.
    assert_eq!(pmu.owned(), owned);
    assert_eq!(m.claims(), 3);
    assert_enabled_at(&m, 0, owned, Ring::Ring3);
}

#[test]
fn hotplug_online_respects_disabled_state() {
    let m = machine();
    let pmu = engine(&m);
    pmu.set_enabled(false);

    m.set_online(CPUS, true);
    pmu.cpu_event(CPUS, CpuEvent::Online);
    assert_disabled(&m, CPUS);
}

#[test]
fn hotplug_offline_and_failed_offline() {
    let m = machine();
    let pmu = engine(&m);
    let owned = pmu.owned();

    pmu.cpu_event(2, CpuEvent::OfflinePrepare);
    assert_disabled(&m, 2);
    assert_enabled_at(&m, 1, owned, Ring::Ring3);
    assert_eq!(pmu.owned(), owned);

    // The offline attempt failed: the processor must be programmed back.
    pmu.cpu_event(2, CpuEvent::OfflineFailed);
    assert_enabled_at(&m, 2, owned, Ring::Ring3);
}

#[test]
fn hotplug_event_for_missing_cpu_is_harmless() {
    let m = machine();
    let pmu = engine(&m);
    pmu.cpu_event(99, CpuEvent::Online);
    assert_eq!(pmu.owned().len(), 3);
}

#[test]
fn suspend_resume_restores_state() {
    let m = two_of_three();
    let pmu = engine(&m);
    pmu.set_ring(Ring::Ring1);
    let owned = pmu.owned();

    m.tick(1, 12_000);
    pmu.suspend();
    for cpu in 0..CPUS {
        assert_disabled(&m, cpu);
    }
    // Claims survive a suspend; nothing was released.
    assert_eq!(m.claims(), 2);

    pmu.resume();
    assert!(pmu.enabled());
    assert_eq!(pmu.ring(), Ring::Ring1);
    assert_eq!(pmu.owned(), owned);
    for cpu in 0..CPUS {
        assert_enabled_at(&m, cpu, owned, Ring::Ring1);
    }
    // Counts were zeroed by the enable pass.
    for c in owned.iter() {
        assert_eq!(m.msr(1, c.msr()), 0);
    }
}

#[test]
fn suspend_while_disabled_resumes_disabled() {
    let m = machine();
    let pmu = engine(&m);
    pmu.set_enabled(false);

    pmu.suspend();
    pmu.resume();
    assert!(!pmu.enabled());
    for cpu in 0..CPUS {
        assert_disabled(&m, cpu);
    }
}

#[test]
fn disabled_counters_do_not_count() {
    let m = machine();
    let pmu = engine(&m);
    pmu.set_enabled(false);

    m.tick(0, 1000);
    for c in FixedCounter::ALL {
        assert_eq!(m.msr(0, c.msr()), 0);
    }
}

#[test]
fn one_broken_cpu_does_not_stop_the_rest() {
    let m = machine();
    m.break_msr(1, MSR_GLOBAL_CTRL);

    let pmu = engine(&m);
    assert!(!m.user_rdpmc(1));
    for cpu in [0, 2, 3] {
        assert_enabled_at(&m, cpu, pmu.owned(), Ring::Ring3);
    }
}

#[test]
fn shutdown_is_idempotent() {
    let m = machine();
    let pmu = engine(&m);

    pmu.shutdown();
    assert_eq!(m.claims(), 0);
    for cpu in 0..CPUS {
        assert_disabled(&m, cpu);
    }

    pmu.shutdown();
    assert_eq!(m.claims(), 0);
}

#[test]
fn concurrent_writes_serialize() {
    let m = machine();
    let pmu = engine(&m);

    std::thread::scope(|s| {
        for i in 0..8 {
            let pmu = &pmu;
            s.spawn(move || {
                for _ in 0..16 {
                    pmu.write(Setting::Enabled, if i % 2 == 0 { "1" } else { "0" })
                        .unwrap();
                    pmu.write(Setting::Ring, "2").unwrap();
                }
            });
        }
    });

    // Whatever interleaving happened, the final write wins cleanly.
    pmu.write(Setting::Enabled, "1").unwrap();
    assert_eq!(pmu.owned().len(), 3);
    assert_eq!(m.claims(), 3);
    for cpu in 0..CPUS {
        assert_enabled_at(&m, cpu, pmu.owned(), Ring::Ring2);
    }
}

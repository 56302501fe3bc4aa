//! Bringing the secondary cores online from the bootstrap core.
//!
//! [`Smp`] owns the protocol. The free functions at the bottom wrap the one
//! instance the kernel creates at boot, and [`smp_secondary_entry`] is where
//! the boot trampoline lands on each secondary core.

use core::fmt;
use core::time::Duration;

use spin::Once;
use x86_64::VirtAddr;

use crate::acpi::{Madt, Topology};
use crate::cpu::{CoreRegistry, CoreState, CpuSet, DispatchError, EntryFn};
use crate::device::local_apic::{Ipi, LocalApic};
use crate::platform::{BareMetal, Platform};
use crate::{
    INIT_SETTLE_MS, MAX_CPUS, REGISTER_WINDOW_MS, STARTUP_DELAY_US, STARTUP_PULSES,
    TRAMPOLINE_ADDR,
};

const _: () = assert!(TRAMPOLINE_ADDR % 4096 == 0 && TRAMPOLINE_ADDR < 0x10_0000);

/// Page number the STARTUP IPI sends secondary cores to.
const STARTUP_VECTOR: u8 = (TRAMPOLINE_ADDR >> 12) as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    /// The local APIC cannot run in x2APIC mode.
    X2ApicUnsupported,
    /// Not every awaited core went idle before the deadline.
    Timeout,
}

impl fmt::Display for SmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmpError::X2ApicUnsupported => f.write_str("x2APIC mode is not supported"),
            SmpError::Timeout => f.write_str("timed out waiting for cores"),
        }
    }
}

/// What one secondary core should run and on which stack.
#[derive(Clone, Copy)]
pub struct Launch {
    pub id: u32,
    pub stack: VirtAddr,
    pub entry: EntryFn,
}

pub struct Smp<'a, P: Platform> {
    hw: P,
    cpus: &'a CoreRegistry,
    madt: Madt<'a>,
    topology: Topology,
    bsp_id: u32,
    core_count: Once<usize>,
}

impl<'a, P: Platform> Smp<'a, P> {
    /// Prepares the bootstrap core: records it as running, puts its local
    /// APIC in x2APIC mode and reads the core topology.
    pub fn init(hw: P, cpus: &'a CoreRegistry, madt: Madt<'a>) -> Result<Self, SmpError> {
        let bsp_id = {
            let apic = LocalApic::new(&hw);
            let bsp_id = apic.id();
            log::info!("Bootstrapping processor has the ID {}", bsp_id);
            cpus.set_state(bsp_id, CoreState::Running);

            if let Err(err) = apic.enable_x2apic() {
                log::error!("x2APIC could not be enabled!");
                return Err(err);
            }
            apic.ensure_spurious_enabled();
            bsp_id
        };

        let topology = Topology::from_madt(&madt);

        Ok(Smp {
            hw,
            cpus,
            madt,
            topology,
            bsp_id,
            core_count: Once::new(),
        })
    }

    pub fn platform(&self) -> &P {
        &self.hw
    }

    pub fn registry(&self) -> &'a CoreRegistry {
        self.cpus
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn bootstrap_id(&self) -> u32 {
        self.bsp_id
    }

    /// Usable cores in the MADT, counted once.
    pub fn count_cores(&self) -> usize {
        *self.core_count.call_once(|| self.madt.count_cores())
    }

    pub fn current_core_id(&self) -> u32 {
        LocalApic::new(&self.hw).id()
    }

    pub fn current_core_is_bootstrap(&self) -> bool {
        self.current_core_id() == self.bsp_id
    }

    fn apic_id_of(&self, id: u32) -> Option<u32> {
        if id == self.bsp_id {
            return None;
        }
        let apic_id = self.topology.apic_id(id);
        if apic_id.is_none() {
            log::warn!("Core {} has no usable APIC id, not starting it", id);
        }
        apic_id
    }

    /// Sends INIT, INIT deassert and two STARTUPs to every launched core and
    /// reports which of them checked in.
    ///
    /// The bootstrap core and cores missing from the topology are skipped.
    /// A core that has not registered by the end of the window is left out of
    /// the result even if it comes up later.
    pub fn start(&self, launches: &[Launch]) -> CpuSet {
        self.count_cores();
        self.cpus.reset_started();

        let copied = unsafe { self.hw.install_trampoline(TRAMPOLINE_ADDR) };
        log::debug!("Copied AP boot code to {:#x} ({} bytes)", TRAMPOLINE_ADDR, copied);

        // all cores share one address space
        self.cpus.set_page_table(self.hw.page_table_root());

        let apic = LocalApic::new(&self.hw);
        let mut expected = CpuSet::new();

        for launch in launches {
            let Some(apic_id) = self.apic_id_of(launch.id) else {
                continue;
            };
            self.cpus.prepare(launch.id, launch.entry, launch.stack);
            expected.insert(launch.id);

            apic.send_ipi(Ipi::init(apic_id));
            apic.send_ipi(Ipi::init_deassert(apic_id));
        }

        self.hw.mdelay(INIT_SETTLE_MS);

        for launch in launches.iter().filter(|launch| expected.contains(launch.id)) {
            let Some(apic_id) = self.topology.apic_id(launch.id) else {
                continue;
            };
            for _ in 0..STARTUP_PULSES {
                apic.send_ipi(Ipi::startup(apic_id, STARTUP_VECTOR));
                self.hw.udelay(STARTUP_DELAY_US);
            }
        }

        self.hw.mdelay(INIT_SETTLE_MS);

        self.cpus.release_secondaries();

        let deadline = self.hw.monotonic_nanos() + REGISTER_WINDOW_MS * 1_000_000;
        loop {
            let started = self.cpus.started();
            if started.is_superset(&expected) || self.hw.monotonic_nanos() >= deadline {
                log::info!("Started {} of {} secondary cores", started.len(), expected.len());
                return started;
            }
            core::hint::spin_loop();
        }
    }

    /// Spins until every core in `ids` (all counted cores for `None`) is
    /// idle. The calling core is never waited on, nor are ids past
    /// [`MAX_CPUS`]. A timeout of `None` or zero waits forever.
    pub fn wait(&self, ids: Option<&[u32]>, timeout: Option<Duration>) -> Result<(), SmpError> {
        let deadline = timeout.filter(|timeout| !timeout.is_zero()).map(|timeout| {
            let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
            self.hw.monotonic_nanos().saturating_add(nanos)
        });
        let me = self.current_core_id();

        match ids {
            Some(ids) => ids
                .iter()
                .try_for_each(|&id| self.wait_idle(id, me, deadline)),
            None => (0..self.count_cores().min(MAX_CPUS) as u32)
                .try_for_each(|id| self.wait_idle(id, me, deadline)),
        }
    }

    fn wait_idle(&self, id: u32, me: u32, deadline: Option<u64>) -> Result<(), SmpError> {
        if id == me {
            return Ok(());
        }
        if id as usize >= MAX_CPUS {
            log::warn!("Not waiting on core {}, it has no registry slot", id);
            return Ok(());
        }
        while self.cpus.state(id) != CoreState::Idle {
            if let Some(end) = deadline {
                if self.hw.monotonic_nanos() > end {
                    return Err(SmpError::Timeout);
                }
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Gives idle core `id` another entry point to run.
    pub fn run(&self, id: u32, entry: EntryFn) -> Result<(), DispatchError> {
        self.cpus.dispatch(id, entry)
    }
}

/// Registry the boot trampoline reads the page table and stacks from.
#[no_mangle]
pub static CPUS: CoreRegistry = CoreRegistry::new();

static SMP: Once<Smp<'static, BareMetal>> = Once::new();

/// Sets up SMP on the bootstrap core. Later calls return the first instance.
pub fn init(hw: BareMetal, madt: Madt<'static>) -> Result<&'static Smp<'static, BareMetal>, SmpError> {
    if let Some(smp) = SMP.get() {
        return Ok(smp);
    }
    let smp = Smp::init(hw, &CPUS, madt)?;
    Ok(SMP.call_once(|| smp))
}

fn smp() -> &'static Smp<'static, BareMetal> {
    SMP.get().expect("SMP used before ap_init::init")
}

pub fn count_cores() -> usize {
    smp().count_cores()
}

pub fn start(launches: &[Launch]) -> CpuSet {
    smp().start(launches)
}

pub fn current_core_id() -> u32 {
    smp().current_core_id()
}

pub fn current_core_is_bootstrap() -> bool {
    smp().current_core_is_bootstrap()
}

pub fn wait(ids: Option<&[u32]>, timeout: Option<Duration>) -> Result<(), SmpError> {
    smp().wait(ids, timeout)
}

/// Called by the trampoline on secondary core `id` once it is in long mode
/// on its own stack.
#[no_mangle]
pub extern "C" fn smp_secondary_entry(id: u32) -> ! {
    CPUS.secondary_boot(id);
    CPUS.idle_loop(id)
}

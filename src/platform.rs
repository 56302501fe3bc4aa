//! Processor primitives the bring-up code is written against.
//!
//! Everything that touches real hardware goes through [`Platform`] so the
//! startup protocol can be driven against a recorded machine in tests.

use core::fmt;

use x86::cpuid::CpuId;
use x86::msr::{rdmsr, wrmsr};
use x86_64::registers::control::Cr3;

/// Raw register, identification, memory and timing access for the bootstrap path.
pub trait Platform: Sync {
    /// Reads a model specific register.
    ///
    /// # Safety
    /// `msr` must exist on the running processor.
    unsafe fn read_msr(&self, msr: u32) -> u64;

    /// Writes a model specific register.
    ///
    /// # Safety
    /// `msr` must exist and accept `value`; writing it may change processor state.
    unsafe fn write_msr(&self, msr: u32, value: u64);

    /// CPUID.01H:ECX[21].
    fn has_x2apic(&self) -> bool;

    /// CPUID.01H:EBX[31:24] of the calling core.
    fn initial_apic_id(&self) -> u32;

    /// Physical address of the active top-level page table.
    fn page_table_root(&self) -> u64;

    /// Copies the secondary-core boot code to physical address `phys` and
    /// returns the number of bytes written.
    ///
    /// # Safety
    /// The page at `phys` must be mapped, unused, and not observed by any core yet.
    unsafe fn install_trampoline(&self, phys: u64) -> usize;

    /// Nanoseconds since an arbitrary fixed point, never going backwards.
    fn monotonic_nanos(&self) -> u64;

    /// Busy waits for at least `us` microseconds.
    fn udelay(&self, us: u64);

    /// Busy waits for at least `ms` milliseconds.
    fn mdelay(&self, ms: u64) {
        self.udelay(ms.saturating_mul(1000));
    }
}

/// Description of the running kernel image.
#[derive(Clone, Copy)]
pub struct BareMetalConfig {
    /// Virtual address at which all of physical memory is mapped.
    pub phys_offset: u64,
    /// Real-mode boot code the secondary cores start in.
    pub trampoline: &'static [u8],
    /// TSC frequency in Hz, discovered through CPUID when `None`.
    pub tsc_hz: Option<u64>,
}

/// The TSC frequency could not be determined from CPUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFreqInfo;

impl fmt::Display for NoFreqInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("processor does not report its TSC frequency")
    }
}

/// [`Platform`] backed by the processor the code is running on.
pub struct BareMetal {
    phys_offset: u64,
    trampoline: &'static [u8],
    tsc_hz: u64,
}

impl BareMetal {
    pub fn new(config: BareMetalConfig) -> Result<Self, NoFreqInfo> {
        let tsc_hz = match config.tsc_hz {
            Some(hz) if hz != 0 => hz,
            _ => tsc_frequency().ok_or(NoFreqInfo)?,
        };
        log::debug!("TSC runs at {} Hz", tsc_hz);

        Ok(BareMetal {
            phys_offset: config.phys_offset,
            trampoline: config.trampoline,
            tsc_hz,
        })
    }

    fn ticks(&self) -> u64 {
        unsafe { x86::time::rdtsc() }
    }
}

fn tsc_frequency() -> Option<u64> {
    let cpuid = CpuId::new();
    if let Some(hz) = cpuid.get_tsc_info().and_then(|info| info.tsc_frequency()) {
        return Some(hz);
    }
    // Leaf 0x16 only has the base frequency in MHz, close enough for delays.
    cpuid
        .get_processor_frequency_info()
        .map(|info| u64::from(info.processor_base_frequency()) * 1_000_000)
        .filter(|hz| *hz != 0)
}

impl Platform for BareMetal {
    unsafe fn read_msr(&self, msr: u32) -> u64 {
        rdmsr(msr)
    }

    unsafe fn write_msr(&self, msr: u32, value: u64) {
        wrmsr(msr, value);
    }

    fn has_x2apic(&self) -> bool {
        CpuId::new()
            .get_feature_info()
            .map_or(false, |info| info.has_x2apic())
    }

    fn initial_apic_id(&self) -> u32 {
        CpuId::new()
            .get_feature_info()
            .map_or(0, |info| u32::from(info.initial_local_apic_id()))
    }

    fn page_table_root(&self) -> u64 {
        let (level_4_table_frame, _) = Cr3::read();
        level_4_table_frame.start_address().as_u64()
    }

    unsafe fn install_trampoline(&self, phys: u64) -> usize {
        let len = self.trampoline.len();
        assert!(len <= 4096, "AP boot code does not fit in one page");

        let dst = (self.phys_offset + phys) as *mut u8;
        core::ptr::copy_nonoverlapping(self.trampoline.as_ptr(), dst, len);
        len
    }

    fn monotonic_nanos(&self) -> u64 {
        (u128::from(self.ticks()) * 1_000_000_000 / u128::from(self.tsc_hz)) as u64
    }

    fn udelay(&self, us: u64) {
        let wait = (u128::from(us) * u128::from(self.tsc_hz) / 1_000_000) as u64;
        let end = self.ticks().saturating_add(wait);
        while self.ticks() < end {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use x86::msr::{IA32_APIC_BASE, IA32_X2APIC_ESR, IA32_X2APIC_ICR, IA32_X2APIC_SIVR};

    use super::Platform;
    use crate::cpu::CoreRegistry;
    use crate::device::local_apic::{DeliveryMode, Ipi};

    thread_local! {
        static APIC_ID: Cell<u32> = Cell::new(0);
    }

    /// Something the code under test did to the machine.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Msr(u32, u64),
        Ipi(Ipi),
        Delay(Duration),
        Trampoline(u64),
    }

    type StartupHook = Box<dyn Fn(u32) + Send + Sync>;

    /// Records register writes and delays; time is the host's.
    pub(crate) struct FakePlatform {
        x2apic: bool,
        msrs: Mutex<HashMap<u32, u64>>,
        latched_errors: AtomicU64,
        events: Mutex<Vec<Event>>,
        epoch: Instant,
        on_startup: Option<StartupHook>,
    }

    impl FakePlatform {
        pub(crate) fn new() -> Self {
            let mut msrs = HashMap::new();
            msrs.insert(IA32_APIC_BASE, 0xfee0_0900);
            msrs.insert(IA32_X2APIC_SIVR, 0xff);
            FakePlatform {
                x2apic: true,
                msrs: Mutex::new(msrs),
                latched_errors: AtomicU64::new(0),
                events: Mutex::new(Vec::new()),
                epoch: Instant::now(),
                on_startup: None,
            }
        }

        pub(crate) fn without_x2apic(mut self) -> Self {
            self.x2apic = false;
            self
        }

        /// Plays a secondary core on its own thread for every APIC id that
        /// receives a STARTUP IPI. APIC ids double as logical ids.
        pub(crate) fn with_secondaries(mut self, cpus: &'static CoreRegistry) -> Self {
            let booted = Mutex::new(HashSet::new());
            self.on_startup = Some(Box::new(move |apic_id| {
                if booted.lock().unwrap().insert(apic_id) {
                    std::thread::spawn(move || {
                        FakePlatform::set_current_apic_id(apic_id);
                        cpus.secondary_boot(apic_id);
                    });
                }
            }));
            self
        }

        pub(crate) fn with_msr(self, msr: u32, value: u64) -> Self {
            self.msrs.lock().unwrap().insert(msr, value);
            self
        }

        /// Raises error bits the next ESR write makes visible.
        pub(crate) fn latch_errors(&self, bits: u64) {
            self.latched_errors.fetch_or(bits, Ordering::SeqCst);
        }

        pub(crate) fn set_current_apic_id(id: u32) {
            APIC_ID.with(|cell| cell.set(id));
        }

        pub(crate) fn take_events(&self) -> Vec<Event> {
            core::mem::take(&mut *self.events.lock().unwrap())
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Platform for FakePlatform {
        unsafe fn read_msr(&self, msr: u32) -> u64 {
            self.msrs.lock().unwrap().get(&msr).copied().unwrap_or(0)
        }

        unsafe fn write_msr(&self, msr: u32, value: u64) {
            let stored = if msr == IA32_X2APIC_ESR {
                self.latched_errors.swap(0, Ordering::SeqCst)
            } else {
                value
            };
            self.msrs.lock().unwrap().insert(msr, stored);

            if msr != IA32_X2APIC_ICR {
                self.record(Event::Msr(msr, value));
                return;
            }
            let ipi = Ipi::from_icr(value).expect("reserved delivery mode");
            self.record(Event::Ipi(ipi));
            if ipi.mode == DeliveryMode::Startup {
                if let Some(hook) = &self.on_startup {
                    hook(ipi.dest);
                }
            }
        }

        fn has_x2apic(&self) -> bool {
            self.x2apic
        }

        fn initial_apic_id(&self) -> u32 {
            APIC_ID.with(|cell| cell.get())
        }

        fn page_table_root(&self) -> u64 {
            0x1000
        }

        unsafe fn install_trampoline(&self, phys: u64) -> usize {
            self.record(Event::Trampoline(phys));
            0
        }

        fn monotonic_nanos(&self) -> u64 {
            self.epoch.elapsed().as_nanos() as u64
        }

        fn udelay(&self, us: u64) {
            let wait = Duration::from_micros(us);
            self.record(Event::Delay(wait));
            std::thread::sleep(wait);
        }
    }
}

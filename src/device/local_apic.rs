use x86::msr::{IA32_APIC_BASE, IA32_X2APIC_ESR, IA32_X2APIC_ICR, IA32_X2APIC_SIVR, IA32_X2APIC_VERSION};

use crate::ap_init::SmpError;
use crate::platform::Platform;

/// IA32_APIC_BASE: x2APIC mode enable.
const APIC_BASE_EXTD: u64 = 1 << 10;
/// IA32_APIC_BASE: global APIC enable.
const APIC_BASE_EN: u64 = 1 << 11;
/// Spurious interrupt vector register: APIC software enable.
const APIC_SPUR_EN: u64 = 1 << 8;

/// Local APIC of the calling core, driven in x2APIC mode through MSRs.
pub struct LocalApic<'a, P: Platform> {
    hw: &'a P,
}

impl<'a, P: Platform> LocalApic<'a, P> {
    pub fn new(hw: &'a P) -> Self {
        LocalApic { hw }
    }

    /// Switches the controller to x2APIC mode.
    // TODO: fall back to xAPIC MMIO when the processor lacks x2APIC.
    pub fn enable_x2apic(&self) -> Result<(), SmpError> {
        if !self.hw.has_x2apic() {
            log::info!("x2APIC is not supported");
            return Err(SmpError::X2ApicUnsupported);
        }
        log::info!("x2APIC is supported; enabling");

        unsafe {
            let base = self.hw.read_msr(IA32_APIC_BASE);
            log::debug!(
                "IA32_APIC_BASE has the value {:#x}; EN bit: {}, EXTD bit: {}",
                base,
                base & APIC_BASE_EN != 0,
                base & APIC_BASE_EXTD != 0
            );
            self.hw.write_msr(IA32_APIC_BASE, base | APIC_BASE_EXTD);
        }
        log::debug!("x2APIC is enabled");

        Ok(())
    }

    /// Sets the software enable bit of the spurious interrupt register if it is clear.
    pub fn ensure_spurious_enabled(&self) {
        unsafe {
            let sivr = self.hw.read_msr(IA32_X2APIC_SIVR);
            log::debug!(
                "Spurious Interrupt Register has the value {:#x}; EN bit: {}",
                sivr,
                sivr & APIC_SPUR_EN != 0
            );
            if sivr & APIC_SPUR_EN == 0 {
                self.hw.write_msr(IA32_X2APIC_SIVR, sivr | APIC_SPUR_EN);
                log::debug!("Spurious interrupt enabled");
            }
        }
    }

    /// Reads the Error Status Register.
    pub fn error_status(&self) -> u32 {
        unsafe {
            // update the ESR to the current state of the local apic.
            self.hw.write_msr(IA32_X2APIC_ESR, 0);
            self.hw.read_msr(IA32_X2APIC_ESR) as u32
        }
    }

    pub fn clear_errors(&self) {
        unsafe { self.hw.write_msr(IA32_X2APIC_ESR, 0) };
    }

    pub fn send_ipi(&self, ipi: Ipi) {
        self.clear_errors();
        unsafe { self.hw.write_msr(IA32_X2APIC_ICR, ipi.icr()) };
    }

    /// APIC id of the calling core, taken from CPUID so it works before the
    /// controller is set up.
    pub fn id(&self) -> u32 {
        self.hw.initial_apic_id()
    }

    pub fn version(&self) -> u32 {
        unsafe { self.hw.read_msr(IA32_X2APIC_VERSION) as u32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeliveryMode {
    Fixed = 0b000 << 8,
    Smi = 0b010 << 8,
    Nmi = 0b100 << 8,
    Init = 0b101 << 8,
    Startup = 0b110 << 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DestinationMode {
    Physical = 0,
    Logical = 1 << 11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Level {
    Deassert = 0,
    Assert = 1 << 14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1 << 15,
}

/// One write to the interrupt command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipi {
    pub dest: u32,
    pub mode: DeliveryMode,
    pub dest_mode: DestinationMode,
    pub level: Level,
    pub trigger: TriggerMode,
    pub vector: u8,
}

impl Ipi {
    /// INIT, level triggered and asserted.
    pub fn init(dest: u32) -> Self {
        Ipi {
            dest,
            mode: DeliveryMode::Init,
            dest_mode: DestinationMode::Physical,
            level: Level::Assert,
            trigger: TriggerMode::Level,
            vector: 0,
        }
    }

    pub fn init_deassert(dest: u32) -> Self {
        Ipi {
            level: Level::Deassert,
            ..Ipi::init(dest)
        }
    }

    /// STARTUP, the core begins executing at physical `page << 12`.
    pub fn startup(dest: u32, page: u8) -> Self {
        Ipi {
            mode: DeliveryMode::Startup,
            vector: page,
            ..Ipi::init(dest)
        }
    }

    pub fn fixed(dest: u32, vector: u8) -> Self {
        Ipi {
            dest,
            mode: DeliveryMode::Fixed,
            dest_mode: DestinationMode::Physical,
            level: Level::Assert,
            trigger: TriggerMode::Edge,
            vector,
        }
    }

    /// x2APIC ICR value, destination in the upper half.
    pub fn icr(&self) -> u64 {
        let low = self.mode as u32
            | self.dest_mode as u32
            | self.level as u32
            | self.trigger as u32
            | u32::from(self.vector);
        u64::from(self.dest) << 32 | u64::from(low)
    }

    /// Decodes an x2APIC ICR value, `None` for reserved delivery modes.
    pub fn from_icr(icr: u64) -> Option<Self> {
        let low = icr as u32;
        let mode = match (low >> 8) & 0b111 {
            0b000 => DeliveryMode::Fixed,
            0b010 => DeliveryMode::Smi,
            0b100 => DeliveryMode::Nmi,
            0b101 => DeliveryMode::Init,
            0b110 => DeliveryMode::Startup,
            _ => return None,
        };

        Some(Ipi {
            dest: (icr >> 32) as u32,
            mode,
            dest_mode: if low & DestinationMode::Logical as u32 != 0 {
                DestinationMode::Logical
            } else {
                DestinationMode::Physical
            },
            level: if low & Level::Assert as u32 != 0 {
                Level::Assert
            } else {
                Level::Deassert
            },
            trigger: if low & TriggerMode::Level as u32 != 0 {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            vector: low as u8,
        })
    }
}

#![cfg_attr(not(test), no_std)]

//! Multiprocessor bring-up for a single-address-space kernel.
//!
//! The bootstrap core reads the core topology out of the MADT, switches its
//! local APIC to x2APIC mode and walks every secondary core through the
//! INIT / STARTUP sequence. Once cores are up they talk through [`mbox::Mailbox`],
//! a fixed-capacity channel that is safe to use from interrupt handlers.

pub mod acpi;
pub mod ap_init;
pub mod cpu;
pub mod device;
pub mod irq;
pub mod mbox;
pub mod platform;
#[cfg(feature = "serial-log")]
pub mod serial;
pub mod sync;

pub use ap_init::{Launch, Smp, SmpError};
pub use cpu::{CoreRegistry, CoreState, CpuSet, EntryFn};
pub use mbox::{Mailbox, PostError, RecvError};
pub use platform::{BareMetal, BareMetalConfig, Platform};

/// Upper bound on logical cores, sizes the core registry and the topology table.
pub const MAX_CPUS: usize = 256;

/// Physical address the secondary-core boot code is copied to.
///
/// Must be page aligned and below 1 MiB, the STARTUP vector carries its page number.
pub const TRAMPOLINE_ADDR: u64 = 0x8000;

/// Settle time after the INIT / INIT-deassert pair and after the STARTUP pulses.
pub const INIT_SETTLE_MS: u64 = 10;

/// Pause after each STARTUP IPI.
pub const STARTUP_DELAY_US: u64 = 200;

/// STARTUP IPIs sent per core. Some controllers drop the first one.
pub const STARTUP_PULSES: usize = 2;

/// How long `start` waits for secondary cores to register themselves.
pub const REGISTER_WINDOW_MS: u64 = 10;

/// Parks the calling core for good.
pub fn hlt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

pub mod local_apic;

pub use local_apic::{Ipi, LocalApic};

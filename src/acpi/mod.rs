//! ACPI tables consumed during SMP bring-up.
//!
//! Locating and checksumming the tables is the firmware-facing ACPI layer's job;
//! this module only interprets a MADT it has been handed.

pub mod madt;

pub use madt::{Madt, MadtEntry, Topology};

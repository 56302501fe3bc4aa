use crate::MAX_CPUS;

/// Length of the MADT up to its first interrupt controller structure.
pub const MADT_HEADER_LEN: usize = 44;

/// Processor is usable right away.
pub const FLAG_ENABLED: u32 = 1 << 0;
/// Processor can be brought online later.
pub const FLAG_ONLINE_CAPABLE: u32 = 1 << 1;

const TYPE_LOCAL_APIC: u8 = 0;
const TYPE_LOCAL_X2APIC: u8 = 9;

/// Multiple APIC Description Table, borrowed from wherever ACPI left it.
#[derive(Clone, Copy)]
pub struct Madt<'a> {
    table: &'a [u8],
}

impl<'a> Madt<'a> {
    /// Wraps a complete table, header included. The slice is cut to the
    /// length the header declares.
    pub fn new(table: &'a [u8]) -> Self {
        assert!(table.len() >= MADT_HEADER_LEN, "MADT shorter than its header");
        assert_eq!(&table[..4], b"APIC", "not a MADT");

        let length = read_u32(table, 4) as usize;
        assert!(
            (MADT_HEADER_LEN..=table.len()).contains(&length),
            "MADT length {} out of bounds",
            length
        );

        Madt {
            table: &table[..length],
        }
    }

    /// Wraps the table at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to a mapped, checksummed MADT that lives for the rest
    /// of the kernel's lifetime.
    pub unsafe fn from_ptr(ptr: *const u8) -> Madt<'static> {
        assert!(!ptr.is_null(), "SMP bring-up needs the MADT");
        let length = core::ptr::read_unaligned(ptr.add(4) as *const u32) as usize;
        Madt::new(core::slice::from_raw_parts(ptr, length))
    }

    pub fn length(&self) -> usize {
        self.table.len()
    }

    /// Physical address of the xAPIC register window.
    pub fn local_apic_address(&self) -> u32 {
        read_u32(self.table, 36)
    }

    pub fn entries(&self) -> Entries<'a> {
        Entries {
            buf: &self.table[MADT_HEADER_LEN..],
        }
    }

    /// Number of processors marked enabled or online capable.
    pub fn count_cores(&self) -> usize {
        self.entries().filter(|entry| entry.usable()).count()
    }
}

/// One interrupt controller structure of the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0, processor with an 8-bit APIC id.
    LocalApic {
        processor_id: u8,
        apic_id: u8,
        flags: u32,
    },
    /// Type 9, processor with a 32-bit x2APIC id.
    LocalX2Apic {
        processor_uid: u32,
        x2apic_id: u32,
        flags: u32,
    },
    Other {
        kind: u8,
        length: u8,
    },
}

impl MadtEntry {
    fn parse(raw: &[u8]) -> Self {
        let kind = raw[0];
        let length = raw[1];
        match kind {
            TYPE_LOCAL_APIC if raw.len() >= 8 => MadtEntry::LocalApic {
                processor_id: raw[2],
                apic_id: raw[3],
                flags: read_u32(raw, 4),
            },
            TYPE_LOCAL_X2APIC if raw.len() >= 16 => MadtEntry::LocalX2Apic {
                x2apic_id: read_u32(raw, 4),
                flags: read_u32(raw, 8),
                processor_uid: read_u32(raw, 12),
            },
            _ => MadtEntry::Other { kind, length },
        }
    }

    /// The processor this entry describes can be started.
    pub fn usable(&self) -> bool {
        match *self {
            MadtEntry::LocalApic { flags, .. } | MadtEntry::LocalX2Apic { flags, .. } => {
                flags & (FLAG_ENABLED | FLAG_ONLINE_CAPABLE) != 0
            }
            MadtEntry::Other { .. } => false,
        }
    }
}

/// Walks the entries by their own length fields, the only way past types we
/// don't know.
pub struct Entries<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Entries<'a> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 2 {
            return None;
        }

        let length = self.buf[1] as usize;
        if length < 2 || length > self.buf.len() {
            log::warn!("Malformed MADT entry of type {} with length {}", self.buf[0], length);
            self.buf = &[];
            return None;
        }

        let raw = &self.buf[..length];
        self.buf = &self.buf[length..];

        Some(MadtEntry::parse(raw))
    }
}

/// Logical core id to APIC id. Zero marks a core that is absent or unusable.
pub struct Topology {
    apic_ids: [u32; MAX_CPUS],
}

impl Topology {
    pub const fn empty() -> Self {
        Topology {
            apic_ids: [0; MAX_CPUS],
        }
    }

    pub fn from_madt(madt: &Madt) -> Self {
        let mut topology = Topology::empty();

        for entry in madt.entries() {
            let (cpu, apic_id) = match entry {
                MadtEntry::LocalApic {
                    processor_id,
                    apic_id,
                    ..
                } => (u32::from(processor_id), u32::from(apic_id)),
                MadtEntry::LocalX2Apic {
                    processor_uid,
                    x2apic_id,
                    ..
                } => {
                    log::debug!("Found type 9 MADT entry");
                    (processor_uid, x2apic_id)
                }
                MadtEntry::Other { .. } => continue,
            };

            if !entry.usable() {
                log::info!("Core {} is not available", cpu);
                continue;
            }

            match usize::try_from(cpu).ok().filter(|&i| i < MAX_CPUS) {
                Some(i) => topology.apic_ids[i] = apic_id,
                None => log::warn!("Core {} is beyond the supported {} cores", cpu, MAX_CPUS),
            }
        }

        topology
    }

    /// APIC id of logical core `cpu`, if it can be started.
    pub fn apic_id(&self, cpu: u32) -> Option<u32> {
        self.apic_ids
            .get(cpu as usize)
            .copied()
            .filter(|&id| id != 0)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

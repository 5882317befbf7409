//! Typed views of the firmware tables
//!
//! Parsers take byte slices (already pulled through the PMAP window), so
//! table handling is independent of physical-memory access and the wire
//! layouts are checked against synthetic images in the tests.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Length of the common table header.
pub const HEADER_LEN: usize = 36;

/// The common ACPI table header.
#[derive(Debug, Clone, Copy)]
pub struct TableHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub oem_id: [u8; 6],
}

impl TableHeader {
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(KernelError::Invalid);
        }
        Ok(Self {
            signature: bytes[0..4].try_into().unwrap(),
            length: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            revision: bytes[8],
            oem_id: bytes[10..16].try_into().unwrap(),
        })
    }
}

/// Generic Address Structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gas {
    /// 0 = system memory, 1 = system I/O.
    pub address_space: u8,
    pub bit_width: u8,
    pub bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

impl Gas {
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < 12 {
            return Err(KernelError::Invalid);
        }
        Ok(Self {
            address_space: bytes[0],
            bit_width: bytes[1],
            bit_offset: bytes[2],
            access_size: bytes[3],
            address: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
        })
    }
}

/// Fixed ACPI Description Table, reduced to the fields the kernel
/// consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fadt {
    pub facs: u64,
    pub dsdt: u64,
    pub sci_interrupt: u16,
    pub smi_command: u32,
    pub acpi_enable: u8,
    pub pm1a_cnt_blk: u32,
    pub pm1b_cnt_blk: u32,
    pub century: u8,
    /// ARM boot-architecture flags: bit 0 = PSCI present, bit 1 = HVC.
    pub arm_boot_arch: u16,
    pub reset_reg: Gas,
    pub reset_value: u8,
}

impl Fadt {
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < 116 {
            return Err(KernelError::Invalid);
        }
        let mut fadt = Self {
            facs: u32::from_le_bytes(bytes[36..40].try_into().unwrap()) as u64,
            dsdt: u32::from_le_bytes(bytes[40..44].try_into().unwrap()) as u64,
            sci_interrupt: u16::from_le_bytes(bytes[46..48].try_into().unwrap()),
            smi_command: u32::from_le_bytes(bytes[48..52].try_into().unwrap()),
            acpi_enable: bytes[52],
            pm1a_cnt_blk: u32::from_le_bytes(bytes[64..68].try_into().unwrap()),
            pm1b_cnt_blk: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            century: bytes[108],
            arm_boot_arch: 0,
            reset_reg: Gas::default(),
            reset_value: 0,
        };
        if bytes.len() >= 129 {
            fadt.reset_reg = Gas::parse(&bytes[116..128])?;
            fadt.reset_value = bytes[128];
        }
        if bytes.len() >= 131 {
            fadt.arm_boot_arch = u16::from_le_bytes(bytes[129..131].try_into().unwrap());
        }
        // 64-bit X_DSDT overrides the 32-bit pointer when present.
        if bytes.len() >= 148 {
            let x_dsdt = u64::from_le_bytes(bytes[140..148].try_into().unwrap());
            if x_dsdt != 0 {
                fadt.dsdt = x_dsdt;
            }
        }
        Ok(fadt)
    }
}

/// One MADT interrupt-controller record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    LocalApic {
        processor_id: u8,
        apic_id: u8,
        flags: u32,
    },
    IoApic {
        id: u8,
        address: u32,
        gsi_base: u32,
    },
    InterruptOverride {
        source: u8,
        gsi: u32,
        flags: u16,
    },
    /// Types the kernel does not consume.
    Other {
        entry_type: u8,
    },
}

/// Iterate the MADT's variable-length entry list.
pub fn madt_entries(table: &[u8]) -> Vec<MadtEntry> {
    let mut out = Vec::new();
    // Fixed part: header + local APIC address + flags.
    let mut pos = HEADER_LEN + 8;
    while pos + 2 <= table.len() {
        let entry_type = table[pos];
        let len = table[pos + 1] as usize;
        if len < 2 || pos + len > table.len() {
            break;
        }
        let body = &table[pos..pos + len];
        out.push(match entry_type {
            0 if len >= 8 => MadtEntry::LocalApic {
                processor_id: body[2],
                apic_id: body[3],
                flags: u32::from_le_bytes(body[4..8].try_into().unwrap()),
            },
            1 if len >= 12 => MadtEntry::IoApic {
                id: body[2],
                address: u32::from_le_bytes(body[4..8].try_into().unwrap()),
                gsi_base: u32::from_le_bytes(body[8..12].try_into().unwrap()),
            },
            2 if len >= 10 => MadtEntry::InterruptOverride {
                source: body[3],
                gsi: u32::from_le_bytes(body[4..8].try_into().unwrap()),
                flags: u16::from_le_bytes(body[8..10].try_into().unwrap()),
            },
            t => MadtEntry::Other { entry_type: t },
        });
        pos += len;
    }
    out
}

/// Byte offset of the FACS global-lock word.
pub const FACS_GLOBAL_LOCK_OFFSET: usize = 16;
/// Byte offset of the FACS firmware waking vector.
pub const FACS_WAKING_VECTOR_OFFSET: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parse() {
        let mut t = [0u8; HEADER_LEN];
        t[0..4].copy_from_slice(b"FACP");
        t[4..8].copy_from_slice(&244u32.to_le_bytes());
        t[8] = 6;
        t[10..16].copy_from_slice(b"VERMIL");
        let h = TableHeader::parse(&t).unwrap();
        assert_eq!(&h.signature, b"FACP");
        assert_eq!(h.length, 244);
        assert_eq!(h.revision, 6);
        assert_eq!(&h.oem_id, b"VERMIL");
    }

    #[test]
    fn fadt_extracts_power_fields() {
        let mut t = alloc::vec![0u8; 160];
        t[0..4].copy_from_slice(b"FACP");
        t[36..40].copy_from_slice(&0xACC5u32.to_le_bytes()); // FACS
        t[40..44].copy_from_slice(&0xD5D7u32.to_le_bytes()); // DSDT
        t[64..68].copy_from_slice(&0x604u32.to_le_bytes()); // PM1a
        t[108] = 0x32; // century register
        t[116] = 1; // reset reg: I/O space
        t[120..128].copy_from_slice(&0xCF9u64.to_le_bytes());
        t[128] = 6; // reset value
        t[129..131].copy_from_slice(&0b11u16.to_le_bytes()); // PSCI | HVC
        let fadt = Fadt::parse(&t).unwrap();
        assert_eq!(fadt.facs, 0xACC5);
        assert_eq!(fadt.dsdt, 0xD5D7);
        assert_eq!(fadt.pm1a_cnt_blk, 0x604);
        assert_eq!(fadt.century, 0x32);
        assert_eq!(fadt.reset_reg.address, 0xCF9);
        assert_eq!(fadt.reset_reg.address_space, 1);
        assert_eq!(fadt.reset_value, 6);
        assert_eq!(fadt.arm_boot_arch, 0b11);
    }

    #[test]
    fn fadt_x_dsdt_override() {
        let mut t = alloc::vec![0u8; 148];
        t[40..44].copy_from_slice(&0x1000u32.to_le_bytes());
        t[140..148].copy_from_slice(&0xFFFF_0000u64.to_le_bytes());
        assert_eq!(Fadt::parse(&t).unwrap().dsdt, 0xFFFF_0000);
    }

    #[test]
    fn madt_entry_walk() {
        let mut t = alloc::vec![0u8; HEADER_LEN + 8];
        t[0..4].copy_from_slice(b"APIC");
        // Local APIC: cpu 0, apic 0, enabled.
        t.extend_from_slice(&[0, 8, 0, 0, 1, 0, 0, 0]);
        // I/O APIC at 0xFEC00000, GSI base 0.
        let mut ioapic = alloc::vec![1u8, 12, 0, 0];
        ioapic.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        ioapic.extend_from_slice(&0u32.to_le_bytes());
        t.extend_from_slice(&ioapic);
        // Override: ISA 0 -> GSI 2.
        let mut ovr = alloc::vec![2u8, 10, 0, 0];
        ovr.extend_from_slice(&2u32.to_le_bytes());
        ovr.extend_from_slice(&0u16.to_le_bytes());
        t.extend_from_slice(&ovr);

        let entries = madt_entries(&t);
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[0],
            MadtEntry::LocalApic {
                processor_id: 0,
                apic_id: 0,
                flags: 1
            }
        );
        assert_eq!(
            entries[1],
            MadtEntry::IoApic {
                id: 0,
                address: 0xFEC0_0000,
                gsi_base: 0
            }
        );
        assert_eq!(
            entries[2],
            MadtEntry::InterruptOverride {
                source: 0,
                gsi: 2,
                flags: 0
            }
        );
    }
}

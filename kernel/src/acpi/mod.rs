//! ACPI table discovery
//!
//! Finds the RSDP (preferring the bootloader's tag, falling back to the
//! BIOS-area scan), validates checksums, walks the RSDT or XSDT, and
//! keeps every recognized table in a registry. Each table is also
//! published as a read-only file under `/sys/acpi` for user-space
//! inspection. The DSDT and SSDTs feed the [`aml`] interpreter.

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod aml;
pub mod power;
pub mod resource;
pub mod tables;

use alloc::{collections::BTreeMap, string::String, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub use tables::{Fadt, Gas, MadtEntry, TableHeader};

/// Signature of the RSDP anchor.
const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// BIOS-area scan range for the RSDP fallback.
pub const RSDP_SCAN_BEGIN: u64 = 0xE_0000;
pub const RSDP_SCAN_END: u64 = 0xF_FFFF;

/// Sum of all bytes must be zero for a valid table.
pub fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b)) == 0
}

/// Registry of discovered tables: signature -> raw contents. SSDTs get
/// numbered keys since several may exist.
static TABLES: Mutex<BTreeMap<String, Vec<u8>>> = Mutex::new(BTreeMap::new());

/// Record a table and publish it under `/sys/acpi`.
fn register_table(key: &str, contents: Vec<u8>) {
    let mut path = String::from("/sys/acpi/");
    path.push_str(key);
    let _ = crate::fs::RamFs::publish(&path, contents.clone());
    TABLES.lock().insert(String::from(key), contents);
}

/// Raw contents of a discovered table.
pub fn table(key: &str) -> Option<Vec<u8>> {
    TABLES.lock().get(key).cloned()
}

/// Number of enabled CPUs announced by the MADT (0 when no MADT).
pub fn cpu_count() -> usize {
    table("APIC")
        .map(|madt| {
            tables::madt_entries(&madt)
                .iter()
                .filter(|e| matches!(e, MadtEntry::LocalApic { flags, .. } if flags & 1 != 0))
                .count()
        })
        .unwrap_or(0)
}

/// Recognized table signatures worth registering.
const KNOWN: &[&[u8; 4]] = &[
    b"FACP", b"APIC", b"HPET", b"MCFG", b"DSDT", b"SSDT", b"TPM2", b"FACS",
];

/// Parse an RSDP candidate; returns the RSDT/XSDT physical address and
/// whether it is an XSDT.
pub fn parse_rsdp(bytes: &[u8]) -> KernelResult<(u64, bool)> {
    if bytes.len() < 20 || &bytes[..8] != RSDP_SIGNATURE {
        return Err(KernelError::NoEntry);
    }
    if !checksum_ok(&bytes[..20]) {
        return Err(KernelError::Invalid);
    }
    let revision = bytes[15];
    if revision >= 2 && bytes.len() >= 36 {
        if !checksum_ok(&bytes[..36]) {
            return Err(KernelError::Invalid);
        }
        let xsdt = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        if xsdt != 0 {
            return Ok((xsdt, true));
        }
    }
    let rsdt = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    if rsdt == 0 {
        return Err(KernelError::Invalid);
    }
    Ok((rsdt as u64, false))
}

/// Entry addresses of an RSDT (u32 entries) or XSDT (u64 entries) blob.
pub fn sdt_entries(bytes: &[u8], xsdt: bool) -> KernelResult<Vec<u64>> {
    let header = TableHeader::parse(bytes)?;
    let expected = if xsdt { *b"XSDT" } else { *b"RSDT" };
    if header.signature != expected {
        return Err(KernelError::Invalid);
    }
    if !checksum_ok(&bytes[..header.length as usize]) {
        return Err(KernelError::Invalid);
    }
    let body = &bytes[tables::HEADER_LEN..header.length as usize];
    let width = if xsdt { 8 } else { 4 };
    Ok(body
        .chunks_exact(width)
        .map(|c| {
            if xsdt {
                u64::from_le_bytes(c.try_into().unwrap())
            } else {
                u32::from_le_bytes(c.try_into().unwrap()) as u64
            }
        })
        .collect())
}

/// Read a physical range through the PMAP window.
#[cfg(target_os = "none")]
fn phys_bytes(addr: u64, len: usize) -> Vec<u8> {
    let ptr = crate::mm::phys_to_virt(crate::mm::PhysAddr::new(addr)).as_u64() as *const u8;
    // SAFETY: firmware tables live in RAM or reserved regions covered by
    // the PMAP; reads are side-effect free.
    let slice = unsafe { core::slice::from_raw_parts(ptr, len) };
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(slice);
    out
}

/// Scan the BIOS area for the RSDP anchor (16-byte aligned).
#[cfg(target_os = "none")]
fn scan_for_rsdp() -> Option<u64> {
    let mut addr = RSDP_SCAN_BEGIN;
    while addr < RSDP_SCAN_END {
        let probe = phys_bytes(addr, 8);
        if probe.as_slice() == RSDP_SIGNATURE {
            return Some(addr);
        }
        addr += 16;
    }
    None
}

/// Discover and register every firmware table.
///
/// `rsdp_hint` is the address delivered in the bootloader's tag block,
/// when present. Called once during bring-up.
#[cfg(target_os = "none")]
pub fn init(rsdp_hint: Option<u64>) -> KernelResult<()> {
    let rsdp_addr = match rsdp_hint.or_else(scan_for_rsdp) {
        Some(addr) => addr,
        None => {
            log::warn!("acpi: no RSDP found");
            return Err(KernelError::NoEntry);
        }
    };
    let _ = crate::fs::RamFs::mkdir("/sys");
    let _ = crate::fs::RamFs::mkdir("/sys/acpi");

    let (sdt_addr, is_xsdt) = parse_rsdp(&phys_bytes(rsdp_addr, 36))?;
    let sdt_head = phys_bytes(sdt_addr, tables::HEADER_LEN);
    let sdt_len = TableHeader::parse(&sdt_head)?.length as usize;
    let entries = sdt_entries(&phys_bytes(sdt_addr, sdt_len), is_xsdt)?;

    let mut ssdt_count = 0u32;
    for entry in entries {
        let head = phys_bytes(entry, tables::HEADER_LEN);
        let Ok(header) = TableHeader::parse(&head) else {
            continue;
        };
        if !KNOWN.contains(&&header.signature) {
            continue;
        }
        let body = phys_bytes(entry, header.length as usize);
        if !checksum_ok(&body) {
            log::warn!(
                "acpi: bad checksum for {}",
                core::str::from_utf8(&header.signature).unwrap_or("????")
            );
            continue;
        }
        match &header.signature {
            b"SSDT" => {
                let mut key = String::from("SSDT");
                key.push((b'0' + (ssdt_count % 10) as u8) as char);
                ssdt_count += 1;
                register_table(&key, body);
            }
            b"FACP" => {
                // The FADT points at the DSDT and FACS; pull both in.
                if let Ok(fadt) = Fadt::parse(&body) {
                    if fadt.dsdt != 0 {
                        let dhead = phys_bytes(fadt.dsdt, tables::HEADER_LEN);
                        if let Ok(dheader) = TableHeader::parse(&dhead) {
                            register_table("DSDT", phys_bytes(fadt.dsdt, dheader.length as usize));
                        }
                    }
                    if fadt.facs != 0 {
                        register_table("FACS", phys_bytes(fadt.facs, 64));
                    }
                    power::install_fadt(fadt);
                }
                register_table("FACP", body);
            }
            sig => {
                register_table(core::str::from_utf8(sig).unwrap_or("????"), body);
            }
        }
    }

    // Feed the MADT into the interrupt layer and the DSDT/SSDTs into the
    // AML interpreter.
    #[cfg(target_arch = "x86_64")]
    if let Some(madt) = table("APIC") {
        for entry in tables::madt_entries(&madt) {
            if let MadtEntry::IoApic { address, .. } = entry {
                crate::arch::apic::set_ioapic_base(address as u64);
            }
        }
    }
    if let Some(dsdt) = table("DSDT") {
        let mut state = aml::AmlState::new();
        match state.load(&dsdt[tables::HEADER_LEN..]) {
            Ok(()) => {
                // SSDTs extend the namespace the DSDT established.
                let ssdts: Vec<Vec<u8>> = TABLES
                    .lock()
                    .iter()
                    .filter(|(key, _)| key.starts_with("SSDT"))
                    .map(|(_, body)| body.clone())
                    .collect();
                for body in ssdts {
                    if body.len() > tables::HEADER_LEN {
                        if let Err(e) = state.load(&body[tables::HEADER_LEN..]) {
                            log::warn!("acpi: ssdt parse failed: {}", e);
                        }
                    }
                }
                power::install_aml(state);
            }
            Err(e) => log::warn!("acpi: aml parse failed: {}", e),
        }
    }
    log::info!("acpi: {} table(s) registered", TABLES.lock().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix_checksum(bytes: &mut [u8], at: usize) {
        bytes[at] = 0;
        let sum = bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        bytes[at] = 0u8.wrapping_sub(sum);
    }

    fn build_rsdp_v1(rsdt: u32) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[..8].copy_from_slice(RSDP_SIGNATURE);
        out[15] = 0; // revision 1
        out[16..20].copy_from_slice(&rsdt.to_le_bytes());
        fix_checksum(&mut out, 8);
        out
    }

    #[test]
    fn rsdp_v1_parses_to_rsdt() {
        let rsdp = build_rsdp_v1(0x1234_5678);
        assert_eq!(parse_rsdp(&rsdp).unwrap(), (0x1234_5678, false));
    }

    #[test]
    fn rsdp_rejects_bad_checksum() {
        let mut rsdp = build_rsdp_v1(0x1000);
        rsdp[8] ^= 0xFF;
        assert_eq!(parse_rsdp(&rsdp).err(), Some(KernelError::Invalid));
    }

    #[test]
    fn rsdp_v2_prefers_xsdt() {
        let mut out = [0u8; 36];
        out[..8].copy_from_slice(RSDP_SIGNATURE);
        out[15] = 2;
        out[16..20].copy_from_slice(&0x1000u32.to_le_bytes());
        out[20..24].copy_from_slice(&36u32.to_le_bytes());
        out[24..32].copy_from_slice(&0xFEDC_0000u64.to_le_bytes());
        fix_checksum(&mut out[..20], 8);
        // Extended checksum covers the whole structure.
        let sum: u8 = out.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        out[32] = 0u8.wrapping_sub(sum);
        assert_eq!(parse_rsdp(&out).unwrap(), (0xFEDC_0000, true));
    }

    #[test]
    fn sdt_entry_walk() {
        // RSDT with two u32 entries.
        let mut t = alloc::vec![0u8; tables::HEADER_LEN + 8];
        t[0..4].copy_from_slice(b"RSDT");
        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        t[tables::HEADER_LEN..tables::HEADER_LEN + 4].copy_from_slice(&0x100u32.to_le_bytes());
        t[tables::HEADER_LEN + 4..].copy_from_slice(&0x200u32.to_le_bytes());
        fix_checksum(&mut t, 9);
        assert_eq!(sdt_entries(&t, false).unwrap(), alloc::vec![0x100, 0x200]);
    }

    #[test]
    fn checksum_helper() {
        assert!(checksum_ok(&[0, 0, 0]));
        assert!(checksum_ok(&[1, 0xFF]));
        assert!(!checksum_ok(&[1, 2, 3]));
    }
}

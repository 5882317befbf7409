//! `_CRS` resource descriptors
//!
//! Buffers contain small descriptors (type byte with embedded length)
//! and large ones (type byte plus a 16-bit length). Bus-enumeration
//! consumers need two getters: FixedMemoryRange32 (tag 0x86, body length
//! 9) and ExtendedInterrupt (tag 0x89, variable).

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

use super::aml::AcpiData;

/// Large-descriptor tag for FixedMemoryRange32.
const TAG_FIXED_MEM32: u8 = 0x86;
/// Large-descriptor tag for ExtendedInterrupt.
const TAG_EXT_IRQ: u8 = 0x89;
/// Small-descriptor end tag.
const TAG_END_SMALL: u8 = 0x78;

/// A 32-bit fixed memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMemoryRange32 {
    pub writable: bool,
    pub base: u32,
    pub length: u32,
}

/// An extended-interrupt descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedInterrupt {
    pub flags: u8,
    pub interrupts: Vec<u32>,
}

/// Find the body of the first descriptor with `tag` in a `_CRS` buffer.
fn find_entry(buffer: &[u8], tag: u8) -> KernelResult<&[u8]> {
    let mut pos = 0usize;
    while pos < buffer.len() {
        let lead = buffer[pos];
        if lead & 0x80 != 0 {
            // Large descriptor: type byte + 16-bit length.
            if pos + 3 > buffer.len() {
                return Err(KernelError::Invalid);
            }
            let len = u16::from_le_bytes([buffer[pos + 1], buffer[pos + 2]]) as usize;
            if pos + 3 + len > buffer.len() {
                return Err(KernelError::Invalid);
            }
            if lead == tag {
                return Ok(&buffer[pos + 3..pos + 3 + len]);
            }
            pos += 3 + len;
        } else {
            // Small descriptor: length in the low 3 bits.
            let len = (lead & 0x07) as usize;
            if lead & 0x78 == TAG_END_SMALL {
                break;
            }
            if pos + 1 + len > buffer.len() {
                return Err(KernelError::Invalid);
            }
            pos += 1 + len;
        }
    }
    Err(KernelError::NoEntry)
}

/// The `_CRS` value must be a buffer.
fn crs_buffer(data: &AcpiData) -> KernelResult<&[u8]> {
    match data {
        AcpiData::Buffer(b) => Ok(b),
        _ => Err(KernelError::Invalid),
    }
}

/// Extract the first FixedMemoryRange32 descriptor.
pub fn fixed_memory_range_32(data: &AcpiData) -> KernelResult<FixedMemoryRange32> {
    let body = find_entry(crs_buffer(data)?, TAG_FIXED_MEM32)?;
    if body.len() < 9 {
        return Err(KernelError::Invalid);
    }
    Ok(FixedMemoryRange32 {
        writable: body[0] & 1 != 0,
        base: u32::from_le_bytes(body[1..5].try_into().unwrap()),
        length: u32::from_le_bytes(body[5..9].try_into().unwrap()),
    })
}

/// Extract the first ExtendedInterrupt descriptor.
pub fn extended_interrupt(data: &AcpiData) -> KernelResult<ExtendedInterrupt> {
    let body = find_entry(crs_buffer(data)?, TAG_EXT_IRQ)?;
    if body.len() < 2 {
        return Err(KernelError::Invalid);
    }
    let flags = body[0];
    let count = body[1] as usize;
    if body.len() < 2 + count * 4 {
        return Err(KernelError::Invalid);
    }
    let interrupts = body[2..2 + count * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(ExtendedInterrupt { flags, interrupts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crs(descriptors: &[u8]) -> AcpiData {
        let mut buf = Vec::new();
        buf.extend_from_slice(descriptors);
        buf.push(0x79); // end tag
        buf.push(0x00); // checksum byte
        AcpiData::Buffer(buf)
    }

    #[test]
    fn fixed_memory_range_parses() {
        // Tag 0x86, length 9: writable, base 0xFED0_0000, len 0x400.
        let mut d = alloc::vec![TAG_FIXED_MEM32, 9, 0, 1];
        d.extend_from_slice(&0xFED0_0000u32.to_le_bytes());
        d.extend_from_slice(&0x400u32.to_le_bytes());
        let parsed = fixed_memory_range_32(&crs(&d)).unwrap();
        assert_eq!(
            parsed,
            FixedMemoryRange32 {
                writable: true,
                base: 0xFED0_0000,
                length: 0x400
            }
        );
    }

    #[test]
    fn extended_interrupt_parses() {
        // Tag 0x89: flags 1, two interrupts 34 and 35.
        let mut d = alloc::vec![TAG_EXT_IRQ, 10, 0, 1, 2];
        d.extend_from_slice(&34u32.to_le_bytes());
        d.extend_from_slice(&35u32.to_le_bytes());
        let parsed = extended_interrupt(&crs(&d)).unwrap();
        assert_eq!(parsed.flags, 1);
        assert_eq!(parsed.interrupts, alloc::vec![34, 35]);
    }

    #[test]
    fn missing_descriptor_is_noent() {
        // Only an IRQ descriptor: no fixed memory range.
        let mut d = alloc::vec![TAG_EXT_IRQ, 6, 0, 0, 1];
        d.extend_from_slice(&9u32.to_le_bytes());
        assert_eq!(
            fixed_memory_range_32(&crs(&d)).err(),
            Some(KernelError::NoEntry)
        );
    }

    #[test]
    fn descriptors_skip_by_length() {
        // A fixed range after an extended interrupt.
        let mut d = alloc::vec![TAG_EXT_IRQ, 6, 0, 0, 1];
        d.extend_from_slice(&9u32.to_le_bytes());
        d.extend_from_slice(&[TAG_FIXED_MEM32, 9, 0, 0]);
        d.extend_from_slice(&0x1000u32.to_le_bytes());
        d.extend_from_slice(&0x10u32.to_le_bytes());
        let parsed = fixed_memory_range_32(&crs(&d)).unwrap();
        assert_eq!(parsed.base, 0x1000);
        assert!(!parsed.writable);
    }

    #[test]
    fn non_buffer_crs_is_invalid() {
        assert_eq!(
            fixed_memory_range_32(&AcpiData::Zero).err(),
            Some(KernelError::Invalid)
        );
    }
}

//! Page Attribute Table programming
//!
//! The protection encoding hands (PAT, PCD, PWT) straight from the zone
//! cache mode, so the PAT MSR is pre-programmed to make those bit
//! patterns mean:
//!
//! | Index | PWT | PCD | Type |
//! |-------|-----|-----|------|
//! | 0     | 0   | 0   | WT (the default cache mode) |
//! | 1     | 1   | 0   | WB |
//! | 2     | 0   | 1   | UC |
//! | 3     | 1   | 1   | WC |
//!
//! Indices 4-7 mirror 0-3 for leaf entries with the PAT bit set.

/// IA32_PAT MSR address.
const IA32_PAT: u32 = 0x277;

/// PAT memory-type encodings (Intel SDM).
const PAT_UC: u64 = 0x00;
const PAT_WC: u64 = 0x01;
const PAT_WT: u64 = 0x04;
const PAT_WB: u64 = 0x06;

/// The programmed layout: [WT, WB, UC, WC] mirrored into the high half.
const PAT_LAYOUT: u64 = PAT_WT
    | (PAT_WB << 8)
    | (PAT_UC << 16)
    | (PAT_WC << 24)
    | (PAT_WT << 32)
    | (PAT_WB << 40)
    | (PAT_UC << 48)
    | (PAT_WC << 56);

/// Program the PAT on the executing CPU. Must run on every CPU before any
/// user mapping with a non-default cache mode is installed.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        let mut msr = x86_64::registers::model_specific::Msr::new(IA32_PAT);
        // SAFETY: IA32_PAT is architecturally defined; the layout uses
        // only valid memory-type encodings.
        unsafe {
            msr.write(PAT_LAYOUT);
        }
        super::tlb_flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_encodes_default_write_through() {
        // Index 0 (no cache bits set in the PTE) must be write-through.
        assert_eq!(PAT_LAYOUT & 0xFF, PAT_WT);
        // Index 2 (PCD) is strong-uncacheable, index 3 (PCD|PWT) is WC.
        assert_eq!((PAT_LAYOUT >> 16) & 0xFF, PAT_UC);
        assert_eq!((PAT_LAYOUT >> 24) & 0xFF, PAT_WC);
    }
}

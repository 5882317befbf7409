//! Page-fault handling
//!
//! Architecture trap handlers decode their fault registers into a
//! [`PageFaultInfo`] and delegate to [`handle_page_fault`], which resolves
//! the fault against the current address space. An unresolved user fault
//! becomes SIGSEGV in the trap dispatcher; an unresolved kernel fault is a
//! panic there.

use super::space::{Access, AddressSpace};
use crate::error::KernelResult;

/// Why a page fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultReason {
    /// No present translation for the address.
    NotPresent,
    /// Access rights mismatch (write to read-only, user to kernel page,
    /// instruction fetch from no-execute).
    ProtectionViolation,
}

/// Fault description collected by the architecture trap handler.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// The virtual address that faulted.
    pub address: u64,
    pub reason: PageFaultReason,
    /// What the instruction was trying to do.
    pub access: Access,
    /// Whether the fault came from user mode.
    pub from_user: bool,
    /// Instruction pointer at the fault.
    pub instruction_pointer: u64,
}

/// Resolve a fault against `space`.
///
/// Not-present faults populate the page by the owning zone's policy
/// (anonymous zero-fill, file read, or copy-on-write duplication); write
/// faults on CoW shares duplicate. Anything else is a genuine violation
/// and propagates as EFAULT.
pub fn handle_page_fault(space: &AddressSpace, info: &PageFaultInfo) -> KernelResult<()> {
    space.populate_page(info.address, info.access).map(|_| ())
}

/// Decode an x86_64 page-fault error code plus CR2.
///
/// Error code bits (Intel SDM): bit 0 = present (protection violation),
/// bit 1 = write, bit 2 = user, bit 4 = instruction fetch.
#[cfg(target_arch = "x86_64")]
pub fn from_x86_64(error_code: u64, cr2: u64, rip: u64) -> PageFaultInfo {
    let access = if error_code & 16 != 0 {
        Access::Exec
    } else if error_code & 2 != 0 {
        Access::Write
    } else {
        Access::Read
    };
    PageFaultInfo {
        address: cr2,
        reason: if error_code & 1 == 0 {
            PageFaultReason::NotPresent
        } else {
            PageFaultReason::ProtectionViolation
        },
        access,
        from_user: error_code & 4 != 0,
        instruction_pointer: rip,
    }
}

/// Decode an AArch64 data/instruction abort from ESR_EL1 + FAR_EL1.
///
/// ISS encoding: bit 6 (WnR) distinguishes write; DFSC 0x4..=0x7 are
/// translation faults, 0xC..=0xF permission faults; EC 0b100000/0b100100
/// mark aborts from the lower EL (user mode).
#[cfg(target_arch = "aarch64")]
pub fn from_aarch64(esr_el1: u64, far_el1: u64, elr_el1: u64) -> PageFaultInfo {
    let ec = ((esr_el1 >> 26) & 0x3F) as u8;
    let dfsc = (esr_el1 & 0x3F) as u8;
    let is_fetch = ec == 0b100000 || ec == 0b100001;
    let access = if is_fetch {
        Access::Exec
    } else if esr_el1 & (1 << 6) != 0 {
        Access::Write
    } else {
        Access::Read
    };
    PageFaultInfo {
        address: far_el1,
        reason: match dfsc & 0x0F {
            0x04..=0x07 => PageFaultReason::NotPresent,
            _ => PageFaultReason::ProtectionViolation,
        },
        access,
        from_user: ec == 0b100000 || ec == 0b100100,
        instruction_pointer: elr_el1,
    }
}

/// Decode a RISC-V page-fault trap (causes 12/13/15).
#[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))]
pub fn from_riscv(cause: u64, stval: u64, sepc: u64, from_user: bool) -> PageFaultInfo {
    let access = match cause {
        12 => Access::Exec,
        15 => Access::Write,
        _ => Access::Read,
    };
    PageFaultInfo {
        address: stval,
        // The cause alone does not distinguish present from permission;
        // the space decides based on its own bookkeeping.
        reason: PageFaultReason::NotPresent,
        access,
        from_user,
        instruction_pointer: sepc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x86_error_code_decoding() {
        // Not-present user write.
        let info = from_x86_64(0b110, 0xdead_b000, 0x40_1000);
        assert_eq!(info.reason, PageFaultReason::NotPresent);
        assert_eq!(info.access, Access::Write);
        assert!(info.from_user);
        // Present kernel instruction fetch.
        let info = from_x86_64(0b1_0001, 0xffff_8000_0000_0000, 0);
        assert_eq!(info.reason, PageFaultReason::ProtectionViolation);
        assert_eq!(info.access, Access::Exec);
        assert!(!info.from_user);
    }

    #[test]
    fn unresolved_fault_is_efault() {
        let _g = crate::mm::space::test_support::lock();
        let space = AddressSpace::new().unwrap();
        let info = PageFaultInfo {
            address: 0x4000_0000,
            reason: PageFaultReason::NotPresent,
            access: Access::Read,
            from_user: true,
            instruction_pointer: 0,
        };
        assert!(handle_page_fault(&space, &info).is_err());
    }

    #[test]
    fn demand_fault_resolves_in_mapped_zone() {
        let _g = crate::mm::space::test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                crate::mm::PAGE_SIZE,
                crate::mm::Prot::READ | crate::mm::Prot::WRITE,
                crate::mm::MapFlags::PRIVATE | crate::mm::MapFlags::ANONYMOUS,
                None,
            )
            .unwrap();
        let info = PageFaultInfo {
            address: base + 42,
            reason: PageFaultReason::NotPresent,
            access: Access::Write,
            from_user: true,
            instruction_pointer: 0,
        };
        assert!(handle_page_fault(&space, &info).is_ok());
        assert!(space.lookup_page(base).is_some());
    }
}

//! Credentials
//!
//! Real, effective, and saved-set user/group IDs plus the supplementary
//! group list. Root (euid 0) may set any id; everyone else may only
//! shuffle among the three they already hold.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Upper bound on the supplementary group list.
pub const NGROUPS_MAX: usize = 65535;

/// Value meaning "leave this id unchanged" in the set-pair calls.
pub const ID_UNCHANGED: u32 = u32::MAX;

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.euid == 0
    }

    /// `setuid`: root sets all three; others need `uid` to match the real
    /// or saved id and change only the effective id.
    pub fn setuid(&mut self, uid: u32) -> KernelResult<()> {
        if self.is_root() {
            self.uid = uid;
            self.euid = uid;
            self.suid = uid;
            return Ok(());
        }
        if uid != self.uid && uid != self.suid {
            return Err(KernelError::NotPermitted);
        }
        self.euid = uid;
        Ok(())
    }

    /// `setgid`, same shape as [`setuid`](Self::setuid).
    pub fn setgid(&mut self, gid: u32) -> KernelResult<()> {
        if self.is_root() {
            self.gid = gid;
            self.egid = gid;
            self.sgid = gid;
            return Ok(());
        }
        if gid != self.gid && gid != self.sgid {
            return Err(KernelError::NotPermitted);
        }
        self.egid = gid;
        Ok(())
    }

    /// `setreuid`: each non-unchanged id must be one of the three current
    /// ids unless root. Setting the real id, or an effective id different
    /// from the real id, updates the saved id.
    pub fn setreuid(&mut self, ruid: u32, euid: u32) -> KernelResult<()> {
        let root = self.is_root();
        if !root {
            if ruid != ID_UNCHANGED && ruid != self.uid && ruid != self.euid && ruid != self.suid {
                return Err(KernelError::NotPermitted);
            }
            if euid != ID_UNCHANGED && euid != self.uid && euid != self.euid && euid != self.suid {
                return Err(KernelError::NotPermitted);
            }
        }
        let new_ruid = if ruid == ID_UNCHANGED { self.uid } else { ruid };
        let new_euid = if euid == ID_UNCHANGED { self.euid } else { euid };
        let update_saved = ruid != ID_UNCHANGED || new_euid != new_ruid;
        self.uid = new_ruid;
        self.euid = new_euid;
        if update_saved {
            self.suid = new_euid;
        }
        Ok(())
    }

    /// `setregid`, same rules as [`setreuid`](Self::setreuid).
    pub fn setregid(&mut self, rgid: u32, egid: u32) -> KernelResult<()> {
        let root = self.is_root();
        if !root {
            if rgid != ID_UNCHANGED && rgid != self.gid && rgid != self.egid && rgid != self.sgid {
                return Err(KernelError::NotPermitted);
            }
            if egid != ID_UNCHANGED && egid != self.gid && egid != self.egid && egid != self.sgid {
                return Err(KernelError::NotPermitted);
            }
        }
        let new_rgid = if rgid == ID_UNCHANGED { self.gid } else { rgid };
        let new_egid = if egid == ID_UNCHANGED { self.egid } else { egid };
        let update_saved = rgid != ID_UNCHANGED || new_egid != new_rgid;
        self.gid = new_rgid;
        self.egid = new_egid;
        if update_saved {
            self.sgid = new_egid;
        }
        Ok(())
    }

    /// Replace the supplementary group list atomically. Root only.
    pub fn setgroups(&mut self, groups: &[u32]) -> KernelResult<()> {
        if !self.is_root() {
            return Err(KernelError::NotPermitted);
        }
        if groups.len() > NGROUPS_MAX {
            return Err(KernelError::Invalid);
        }
        let mut replacement = Vec::new();
        replacement.extend_from_slice(groups);
        self.groups = replacement;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unprivileged() -> Credentials {
        Credentials {
            uid: 1000,
            euid: 1000,
            suid: 1000,
            gid: 100,
            egid: 100,
            sgid: 100,
            groups: Vec::new(),
        }
    }

    #[test]
    fn root_setuid_sets_all_three() {
        let mut c = Credentials::root();
        c.setuid(1000).unwrap();
        assert_eq!((c.uid, c.euid, c.suid), (1000, 1000, 1000));
        // And the privilege is gone.
        assert!(c.setuid(0).is_err());
    }

    #[test]
    fn unprivileged_setuid_limited_to_real_and_saved() {
        let mut c = unprivileged();
        c.suid = 2000;
        c.setuid(2000).unwrap();
        assert_eq!(c.euid, 2000);
        assert_eq!(c.uid, 1000);
        assert!(c.setuid(3000).is_err());
    }

    #[test]
    fn setreuid_swap_real_and_effective() {
        let mut c = unprivileged();
        c.euid = 2000;
        c.setreuid(2000, 1000).unwrap();
        assert_eq!((c.uid, c.euid), (2000, 1000));
        // Saved id followed the effective id.
        assert_eq!(c.suid, 1000);
    }

    #[test]
    fn setreuid_unchanged_markers() {
        let mut c = unprivileged();
        c.setreuid(ID_UNCHANGED, ID_UNCHANGED).unwrap();
        assert_eq!((c.uid, c.euid, c.suid), (1000, 1000, 1000));
    }

    #[test]
    fn setgroups_requires_root_and_replaces() {
        let mut c = Credentials::root();
        c.setgroups(&[1, 2, 3]).unwrap();
        assert_eq!(c.groups, alloc::vec![1, 2, 3]);
        c.setgroups(&[9]).unwrap();
        assert_eq!(c.groups, alloc::vec![9]);
        let mut c = unprivileged();
        assert!(c.setgroups(&[1]).is_err());
    }
}

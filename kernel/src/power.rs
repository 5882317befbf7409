//! Power control
//!
//! The `reboot(cmd)` surface multiplexes over whichever backend
//! initialized: ACPI sleep states and the FADT reset register, PSCI on
//! AArch64, or the syscon block on riscv64.

use crate::error::{KernelError, KernelResult};

/// Commands accepted by the reboot call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootCmd {
    Shutdown,
    Reboot,
    Suspend,
    Hibernate,
}

impl RebootCmd {
    pub fn from_raw(raw: usize) -> KernelResult<Self> {
        match raw {
            0 => Ok(Self::Shutdown),
            1 => Ok(Self::Reboot),
            2 => Ok(Self::Suspend),
            3 => Ok(Self::Hibernate),
            _ => Err(KernelError::Invalid),
        }
    }

    /// ACPI sleep state implementing this command.
    pub fn sleep_state(self) -> Option<u8> {
        match self {
            Self::Shutdown => Some(5),
            Self::Suspend => Some(3),
            Self::Hibernate => Some(4),
            Self::Reboot => None,
        }
    }
}

/// Execute a power command. Successful shutdown/reboot does not return;
/// an `Ok` return only happens for suspend resumption.
pub fn reboot(cmd: RebootCmd) -> KernelResult<()> {
    #[cfg(target_os = "none")]
    if crate::acpi::power::is_available() {
        log::info!("power: {:?} via acpi", cmd);
        return match cmd.sleep_state() {
            Some(state) => {
                crate::acpi::power::enter_sleep_state(state)?;
                if cmd == RebootCmd::Suspend {
                    Ok(())
                } else {
                    halt()
                }
            }
            None => {
                crate::acpi::power::reset()?;
                halt()
            }
        };
    }
    #[cfg(target_arch = "aarch64")]
    if crate::arch::psci::is_available() {
        log::info!("power: {:?} via psci", cmd);
        return match cmd {
            RebootCmd::Shutdown | RebootCmd::Hibernate => crate::arch::psci::system_off(),
            RebootCmd::Reboot => crate::arch::psci::system_reset(),
            RebootCmd::Suspend => Err(KernelError::NotSupported),
        };
    }
    #[cfg(target_arch = "riscv64")]
    if crate::arch::syscon::is_available() {
        log::info!("power: {:?} via syscon", cmd);
        return match cmd {
            RebootCmd::Shutdown | RebootCmd::Hibernate => crate::arch::syscon::poweroff(),
            RebootCmd::Reboot => crate::arch::syscon::reboot(),
            RebootCmd::Suspend => Err(KernelError::NotSupported),
        };
    }
    let _ = cmd;
    Err(KernelError::NotSupported)
}

/// Stop this CPU after a power command that should not have returned.
#[cfg(target_os = "none")]
fn halt() -> KernelResult<()> {
    loop {
        crate::arch::disable_interrupts();
        crate::arch::wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_decoding() {
        assert_eq!(RebootCmd::from_raw(0), Ok(RebootCmd::Shutdown));
        assert_eq!(RebootCmd::from_raw(1), Ok(RebootCmd::Reboot));
        assert_eq!(RebootCmd::from_raw(2), Ok(RebootCmd::Suspend));
        assert_eq!(RebootCmd::from_raw(3), Ok(RebootCmd::Hibernate));
        assert!(RebootCmd::from_raw(9).is_err());
    }

    #[test]
    fn sleep_state_mapping() {
        assert_eq!(RebootCmd::Shutdown.sleep_state(), Some(5));
        assert_eq!(RebootCmd::Suspend.sleep_state(), Some(3));
        assert_eq!(RebootCmd::Hibernate.sleep_state(), Some(4));
        assert_eq!(RebootCmd::Reboot.sleep_state(), None);
    }

    #[test]
    fn no_backend_reports_unsupported() {
        // Host builds have no power backend at all.
        assert_eq!(reboot(RebootCmd::Shutdown).err(), Some(KernelError::NotSupported));
    }
}

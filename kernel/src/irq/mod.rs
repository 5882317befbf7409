//! Interrupt routing
//!
//! Architecture-independent layer over the platform interrupt controllers
//! (APIC on x86_64, GICv2 on AArch64, PLIC on riscv64). Keeps one handler
//! list per (CPU, vector); registration appends, dispatch acknowledges the
//! controller and then runs every handler in registration order with
//! interrupts disabled. Handlers never block.
//!
//! PCI devices register through [`register_pci_irq`], which tries MSI-X,
//! then MSI, then falls back to the routed line for the device's pin.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sync::once_lock::GlobalState,
};

// ---------------------------------------------------------------------------
// Reserved vectors
// ---------------------------------------------------------------------------

/// Legacy int-gate syscall vector.
#[cfg(target_arch = "x86_64")]
pub const SYSCALL_VECTOR: u32 = 0x80;
/// Reschedule-hint IPI.
#[cfg(target_arch = "x86_64")]
pub const IPI_VECTOR: u8 = 0xFD;
/// Spurious vector the local APIC raises on races.
#[cfg(target_arch = "x86_64")]
pub const SPURIOUS_VECTOR: u32 = 0xFF;
/// First vector usable by devices (the remapped PIC/IOAPIC base).
#[cfg(target_arch = "x86_64")]
pub const DEVICE_VECTOR_BASE: u32 = 0x20;
/// One past the last device vector.
#[cfg(target_arch = "x86_64")]
pub const DEVICE_VECTOR_END: u32 = 0xFD;

/// SGI used for reschedule IPIs.
#[cfg(target_arch = "aarch64")]
pub const IPI_VECTOR: u8 = 14;
/// GIC "no interrupt" ID.
#[cfg(target_arch = "aarch64")]
pub const SPURIOUS_VECTOR: u32 = 1023;
#[cfg(target_arch = "aarch64")]
pub const DEVICE_VECTOR_BASE: u32 = 32;
#[cfg(target_arch = "aarch64")]
pub const DEVICE_VECTOR_END: u32 = 1020;

/// CLINT software interrupt stands in for the IPI.
#[cfg(target_arch = "riscv64")]
pub const IPI_VECTOR: u8 = 1;
/// PLIC claim result meaning "nothing pending".
#[cfg(target_arch = "riscv64")]
pub const SPURIOUS_VECTOR: u32 = 0;
#[cfg(target_arch = "riscv64")]
pub const DEVICE_VECTOR_BASE: u32 = 1;
#[cfg(target_arch = "riscv64")]
pub const DEVICE_VECTOR_END: u32 = 128;

/// Vectors drivers may never register.
fn is_reserved(vector: u32) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        vector == SYSCALL_VECTOR || vector == IPI_VECTOR as u32 || vector == SPURIOUS_VECTOR
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        vector == IPI_VECTOR as u32 || vector == SPURIOUS_VECTOR
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a registration reaches the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqKind {
    /// Controller-routed wire line.
    Native { line: u32 },
    /// Message-signaled interrupt.
    Msi,
    /// MSI-X table entry.
    MsiX,
}

/// Handler invoked on dispatch: `(vector, userdata)`. Runs with
/// interrupts disabled; must not block.
pub type IrqCallback = fn(u32, usize);

/// A live registration. Returned by the register calls; passed back to
/// [`disable_native`] to tear the registration down.
#[derive(Debug, Clone, Copy)]
pub struct IrqHandle {
    id: u64,
    pub kind: IrqKind,
    /// CPU whose handler list holds this registration.
    pub cpu: usize,
    pub vector: u32,
}

struct Registration {
    id: u64,
    kind: IrqKind,
    callback: IrqCallback,
    userdata: usize,
}

/// The capability surface the router needs from a PCI device. MSI-X is
/// preferred, then MSI, then the routed pin.
pub trait MsiCapable {
    /// Program and enable an MSI-X table entry; false if unsupported.
    fn enable_msix(&self, address: u64, data: u32) -> bool;
    /// Program and enable the MSI capability; false if unsupported.
    fn enable_msi(&self, address: u64, data: u32) -> bool;
    /// Controller line the device's pin is routed to.
    fn routed_line(&self) -> u32;
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct IrqRouter {
    /// Handler lists keyed by (CPU, vector).
    lists: BTreeMap<(usize, u32), Vec<Registration>>,
    next_id: u64,
    cpu_count: usize,
    dispatch_count: u64,
}

impl IrqRouter {
    fn new(cpu_count: usize) -> Self {
        Self {
            lists: BTreeMap::new(),
            next_id: 1,
            cpu_count: cpu_count.max(1),
            dispatch_count: 0,
        }
    }

    fn register(
        &mut self,
        cpu: usize,
        vector: u32,
        kind: IrqKind,
        callback: IrqCallback,
        userdata: usize,
    ) -> KernelResult<IrqHandle> {
        if is_reserved(vector) || vector >= DEVICE_VECTOR_END {
            return Err(KernelError::Invalid);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.lists.entry((cpu, vector)).or_default().push(Registration {
            id,
            kind,
            callback,
            userdata,
        });
        Ok(IrqHandle {
            id,
            kind,
            cpu,
            vector,
        })
    }

    /// Remove a registration; returns whether the list is now empty.
    fn unregister(&mut self, handle: &IrqHandle) -> KernelResult<bool> {
        let key = (handle.cpu, handle.vector);
        let list = self.lists.get_mut(&key).ok_or(KernelError::NoEntry)?;
        let before = list.len();
        list.retain(|r| r.id != handle.id);
        if list.len() == before {
            return Err(KernelError::NoEntry);
        }
        let empty = list.is_empty();
        if empty {
            self.lists.remove(&key);
        }
        Ok(empty)
    }

    /// Find a vector whose handler list is empty on some CPU.
    fn find_free_vector(&self) -> Option<(usize, u32)> {
        for cpu in 0..self.cpu_count {
            for vector in DEVICE_VECTOR_BASE..DEVICE_VECTOR_END {
                if is_reserved(vector) {
                    continue;
                }
                if !self.lists.contains_key(&(cpu, vector)) {
                    return Some((cpu, vector));
                }
            }
        }
        None
    }
}

static ROUTER: GlobalState<Mutex<IrqRouter>> = GlobalState::new();

// ---------------------------------------------------------------------------
// Controller delegation
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
fn controller_enable_line(line: u32, vector: u32, cpu: usize) {
    if line < 16 {
        crate::arch::pic::unmask_line(line as u8);
    }
    crate::arch::apic::route_gsi(line, vector as u8, cpu as u8);
}

#[cfg(target_arch = "x86_64")]
fn controller_disable_line(line: u32) {
    if line < 16 {
        crate::arch::pic::mask_line(line as u8);
    }
    crate::arch::apic::mask_gsi(line);
}

#[cfg(target_arch = "x86_64")]
fn controller_eoi(_vector: u32) {
    crate::arch::apic::send_eoi();
}

#[cfg(target_arch = "aarch64")]
fn controller_enable_line(line: u32, _vector: u32, _cpu: usize) {
    crate::arch::gic::enable_irq(line);
}

#[cfg(target_arch = "aarch64")]
fn controller_disable_line(line: u32) {
    crate::arch::gic::disable_irq(line);
}

#[cfg(target_arch = "aarch64")]
fn controller_eoi(vector: u32) {
    crate::arch::gic::eoi(vector);
}

#[cfg(target_arch = "riscv64")]
fn controller_enable_line(line: u32, _vector: u32, cpu: usize) {
    crate::arch::plic::enable(cpu, line);
}

#[cfg(target_arch = "riscv64")]
fn controller_disable_line(line: u32) {
    crate::arch::plic::disable(0, line);
}

#[cfg(target_arch = "riscv64")]
fn controller_eoi(vector: u32) {
    crate::arch::plic::complete(crate::arch::cpu_id(), vector);
}

/// MSI doorbell address for the given CPU.
fn msi_address(cpu: usize) -> Option<u64> {
    #[cfg(target_arch = "x86_64")]
    {
        Some(0xFEE0_0000 | ((cpu as u64) << 12))
    }
    #[cfg(target_arch = "aarch64")]
    {
        let _ = cpu;
        crate::arch::gic::msi_doorbell()
    }
    #[cfg(target_arch = "riscv64")]
    {
        let _ = cpu;
        None
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Initialize the router. Called once after the platform controller is up.
pub fn init(cpu_count: usize) -> KernelResult<()> {
    ROUTER
        .init(Mutex::new(IrqRouter::new(cpu_count)))
        .map_err(|_| KernelError::AlreadyExists)?;
    log::info!("irq: router ready, {} cpu(s)", cpu_count.max(1));
    Ok(())
}

fn with_router<R>(f: impl FnOnce(&mut IrqRouter) -> KernelResult<R>) -> KernelResult<R> {
    ROUTER
        .with(|mtx| f(&mut mtx.lock()))
        .unwrap_or(Err(KernelError::Busy))
}

/// Bind a platform wire line and enable it in the controller.
pub fn register_native_irq(
    line: u32,
    callback: IrqCallback,
    userdata: usize,
) -> KernelResult<IrqHandle> {
    let vector = DEVICE_VECTOR_BASE + line;
    let handle = with_router(|r| {
        r.register(0, vector, IrqKind::Native { line }, callback, userdata)
    })?;
    controller_enable_line(line, vector, 0);
    Ok(handle)
}

/// Register a PCI device's interrupt: MSI-X first, then MSI, then the
/// routed line for the device's pin.
pub fn register_pci_irq(
    device: &dyn MsiCapable,
    callback: IrqCallback,
    userdata: usize,
) -> KernelResult<IrqHandle> {
    // A message-signaled vector needs an empty handler list somewhere.
    let slot = with_router(|r| Ok(r.find_free_vector()))?;
    if let (Some((cpu, vector)), Some(address)) = (slot, slot.and_then(|(c, _)| msi_address(c))) {
        let data = vector;
        if device.enable_msix(address, data) {
            log::debug!("irq: msi-x vector {} on cpu {}", vector, cpu);
            return with_router(|r| r.register(cpu, vector, IrqKind::MsiX, callback, userdata));
        }
        if device.enable_msi(address, data) {
            log::debug!("irq: msi vector {} on cpu {}", vector, cpu);
            return with_router(|r| r.register(cpu, vector, IrqKind::Msi, callback, userdata));
        }
    }
    register_native_irq(device.routed_line(), callback, userdata)
}

/// Tear down a registration; disables the native line once no handler
/// remains on it.
pub fn disable_native(handle: &IrqHandle) -> KernelResult<()> {
    let now_empty = with_router(|r| r.unregister(handle))?;
    if now_empty {
        if let IrqKind::Native { line } = handle.kind {
            controller_disable_line(line);
        }
    }
    Ok(())
}

/// Dispatch a device vector on the given CPU.
///
/// Issues the controller's EOI sequence first, then runs every handler in
/// registration order. Called from the trap dispatcher with interrupts
/// disabled.
pub fn dispatch(cpu: usize, vector: u32) {
    #[cfg(target_os = "none")]
    controller_eoi(vector);
    let handlers: Vec<(IrqCallback, usize)> = ROUTER
        .with(|mtx| {
            let mut r = mtx.lock();
            r.dispatch_count += 1;
            r.lists
                .get(&(cpu, vector))
                .map(|list| list.iter().map(|reg| (reg.callback, reg.userdata)).collect())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    for (callback, userdata) in handlers {
        callback(vector, userdata);
    }
}

/// Interrupts dispatched since init.
pub fn dispatch_count() -> u64 {
    ROUTER.with(|mtx| mtx.lock().dispatch_count).unwrap_or(0)
}

/// Send reschedule IPIs to every CPU in `mask` except the caller.
pub fn tlb_shootdown(mask: u64) {
    let me = crate::arch::cpu_id();
    for cpu in 0..crate::arch::MAX_CPUS {
        if cpu != me && mask & (1 << cpu) != 0 {
            crate::arch::cpu_ipi(cpu);
        }
    }
}

/// Ask `cpu` to reschedule at its next opportunity.
pub fn send_reschedule(cpu: usize) {
    crate::arch::cpu_ipi(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static LAST_DATA: AtomicUsize = AtomicUsize::new(0);

    fn count_hits(_vector: u32, userdata: usize) {
        HITS.fetch_add(1, Ordering::SeqCst);
        LAST_DATA.store(userdata, Ordering::SeqCst);
    }

    fn ensure_router() {
        let _ = init(2);
    }

    #[test]
    fn native_register_dispatch_unregister() {
        ensure_router();
        let handle = register_native_irq(9, count_hits, 0xBEEF).unwrap();
        assert_eq!(handle.kind, IrqKind::Native { line: 9 });
        let before = HITS.load(Ordering::SeqCst);
        dispatch(handle.cpu, handle.vector);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 1);
        assert_eq!(LAST_DATA.load(Ordering::SeqCst), 0xBEEF);
        disable_native(&handle).unwrap();
        // Handler gone: dispatch is a silent no-op.
        dispatch(handle.cpu, handle.vector);
        assert_eq!(HITS.load(Ordering::SeqCst), before + 1);
        // Double unregister reports the missing entry.
        assert_eq!(disable_native(&handle), Err(KernelError::NoEntry));
    }

    #[test]
    fn reserved_vectors_are_rejected() {
        ensure_router();
        #[cfg(target_arch = "x86_64")]
        {
            // Line whose vector would collide with the syscall gate.
            let line = SYSCALL_VECTOR - DEVICE_VECTOR_BASE;
            assert!(register_native_irq(line, count_hits, 0).is_err());
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        ensure_router();
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        fn first(_v: u32, _d: usize) {
            // First handler observes the counter at zero.
            ORDER.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
        }
        fn second(_v: u32, _d: usize) {
            ORDER.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).ok();
        }
        let h1 = register_native_irq(11, first, 0).unwrap();
        let h2 = with_router(|r| {
            r.register(h1.cpu, h1.vector, IrqKind::Native { line: 11 }, second, 0)
        })
        .unwrap();
        dispatch(h1.cpu, h1.vector);
        assert_eq!(ORDER.load(Ordering::SeqCst), 2);
        disable_native(&h2).unwrap();
        disable_native(&h1).unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn msi_address_encodes_cpu() {
        assert_eq!(msi_address(0), Some(0xFEE0_0000));
        assert_eq!(msi_address(3), Some(0xFEE0_3000));
    }

    #[test]
    fn pci_registration_prefers_msix() {
        ensure_router();
        struct FakeDev {
            msix_ok: bool,
            msi_ok: bool,
        }
        impl MsiCapable for FakeDev {
            fn enable_msix(&self, _address: u64, _data: u32) -> bool {
                self.msix_ok
            }
            fn enable_msi(&self, _address: u64, _data: u32) -> bool {
                self.msi_ok
            }
            fn routed_line(&self) -> u32 {
                5
            }
        }

        let dev = FakeDev {
            msix_ok: true,
            msi_ok: false,
        };
        let h = register_pci_irq(&dev, count_hits, 0).unwrap();
        assert_eq!(h.kind, IrqKind::MsiX);
        disable_native(&h).unwrap();

        let dev = FakeDev {
            msix_ok: false,
            msi_ok: true,
        };
        let h = register_pci_irq(&dev, count_hits, 0).unwrap();
        assert_eq!(h.kind, IrqKind::Msi);
        disable_native(&h).unwrap();

        // Neither capability: fall back to the routed pin.
        let dev = FakeDev {
            msix_ok: false,
            msi_ok: false,
        };
        let h = register_pci_irq(&dev, count_hits, 0).unwrap();
        assert_eq!(h.kind, IrqKind::Native { line: 5 });
        disable_native(&h).unwrap();
    }
}

//! Legacy 8259 PIC
//!
//! Kept for machines (and early boot) without a usable I/O APIC. The two
//! chained controllers are remapped above the CPU exception range; lines
//! are masked individually once the APIC takes over.

use spin::Mutex;

/// Vector base the PICs are remapped to.
pub const PIC_OFFSET: u8 = 0x20;

#[cfg(target_os = "none")]
static PICS: Mutex<pic8259::ChainedPics> =
    // SAFETY: the offsets do not collide with CPU exception vectors.
    Mutex::new(unsafe { pic8259::ChainedPics::new(PIC_OFFSET, PIC_OFFSET + 8) });

#[cfg(not(target_os = "none"))]
static PICS: Mutex<()> = Mutex::new(());

/// Remap and initialize both controllers, all lines masked.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        let mut pics = PICS.lock();
        // SAFETY: standard 8259 initialization sequence on the ISA ports.
        unsafe {
            pics.initialize();
            pics.write_masks(0xFF, 0xFF);
        }
    }
}

/// Unmask one ISA line.
pub fn unmask_line(line: u8) {
    #[cfg(target_os = "none")]
    {
        let mut pics = PICS.lock();
        // SAFETY: read-modify-write of the PIC mask registers.
        unsafe {
            let masks = pics.read_masks();
            let mut m = u16::from_le_bytes(masks);
            m &= !(1 << line);
            let [a, b] = m.to_le_bytes();
            pics.write_masks(a, b);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// Mask one ISA line.
pub fn mask_line(line: u8) {
    #[cfg(target_os = "none")]
    {
        let mut pics = PICS.lock();
        // SAFETY: read-modify-write of the PIC mask registers.
        unsafe {
            let masks = pics.read_masks();
            let mut m = u16::from_le_bytes(masks);
            m |= 1 << line;
            let [a, b] = m.to_le_bytes();
            pics.write_masks(a, b);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = line;
}

/// PIC end-of-interrupt for the given remapped vector.
pub fn send_eoi(vector: u8) {
    #[cfg(target_os = "none")]
    // SAFETY: the vector is within the remapped PIC range.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
    #[cfg(not(target_os = "none"))]
    let _ = vector;
}

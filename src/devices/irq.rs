//! Interrupt lines driven by devices

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

/// A level-triggered interrupt line
pub trait IrqLine {
    /// Drive the line high (`true`) or low (`false`)
    fn set_level(&self, asserted: bool);
}

#[repr(C)]
struct KvmIrqLevel {
    irq: u32,
    level: u32,
}

const KVM_IRQ_LINE: libc::c_ulong = 0x4008_AE61;

/// GSI on the in-kernel irqchip, driven with `KVM_IRQ_LINE`
#[derive(Debug, Clone, Copy)]
pub struct KvmIrqLine {
    vm_fd: RawFd,
    irq: u32,
}

impl KvmIrqLine {
    /// Line `irq` on the VM behind `vm_fd`. The descriptor must outlive the line.
    pub fn new(vm_fd: RawFd, irq: u32) -> Self {
        Self { vm_fd, irq }
    }

    /// GSI number
    pub fn irq(&self) -> u32 {
        self.irq
    }

    fn try_set_level(&self, asserted: bool) -> io::Result<()> {
        let level = KvmIrqLevel {
            irq: self.irq,
            level: asserted as u32,
        };
        let ret = unsafe { libc::ioctl(self.vm_fd, KVM_IRQ_LINE, &level) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl IrqLine for KvmIrqLine {
    fn set_level(&self, asserted: bool) {
        trace!("irq {} level {}", self.irq, asserted as u32);
        if let Err(e) = self.try_set_level(asserted) {
            warn!("KVM_IRQ_LINE irq={} failed: {}", self.irq, e);
        }
    }
}

/// In-process interrupt level for boards that poll their devices
#[derive(Debug, Clone, Default)]
pub struct IrqLatch(Arc<AtomicBool>);

impl IrqLatch {
    /// Create a deasserted latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level
    pub fn is_asserted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl IrqLine for IrqLatch {
    fn set_level(&self, asserted: bool) {
        self.0.store(asserted, Ordering::SeqCst);
    }
}

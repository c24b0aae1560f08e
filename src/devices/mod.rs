//! Device emulation for the bridge layer
//!
//! - Stream bridge: MMIO character device bridging guest buffers to a host stream
//! - Host character backends the stream bridge writes to
//! - Interrupt lines (KVM irqchip or an in-process latch)

pub mod char_backend;
pub mod irq;
pub mod stream_bridge;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::BridgeConfig;

/// Board-wide buffer address mode.
///
/// Boards start in legacy mode, where devices only see the low 32 bits of a
/// buffer pointer. The first write to a high-pointer register on any device
/// switches every device sharing this value to full 64-bit pointers.
#[derive(Debug, Clone, Default)]
pub struct GuestAddressing {
    wide: Arc<AtomicBool>,
    sign_extend: bool,
}

impl GuestAddressing {
    /// Legacy mode; `sign_extend` widens 32-bit pointers as signed values
    pub fn new(sign_extend: bool) -> Self {
        Self {
            wide: Arc::new(AtomicBool::new(false)),
            sign_extend,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.sign_extend_legacy_addresses)
    }

    /// True once any device saw a high-pointer write
    pub fn is_64bit(&self) -> bool {
        self.wide.load(Ordering::SeqCst)
    }

    pub fn enable_64bit(&self) {
        self.wide.store(true, Ordering::SeqCst);
    }

    /// Guest physical address for a device's buffer pointer register
    pub fn translate(&self, ptr: u64) -> u64 {
        if self.is_64bit() {
            return ptr;
        }
        let low = ptr as u32;
        if self.sign_extend {
            low as i32 as i64 as u64
        } else {
            low as u64
        }
    }
}

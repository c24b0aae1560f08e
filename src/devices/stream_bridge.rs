//! Stream bridge device
//!
//! A small MMIO character device. The guest writes single bytes through
//! `PUT_CHAR`, or points the device at a buffer (`DATA_PTR`/`DATA_LEN`) and
//! issues `WRITE_BUFFER`/`READ_BUFFER` commands. Host input is queued in a
//! bounded receive buffer; the interrupt line is high exactly while
//! interrupts are enabled and the buffer is non-empty.
//!
//! Register map (offsets within a 0x1000 window, 32-bit little-endian):
//!
//! | offset | name            | access |
//! |--------|-----------------|--------|
//! | 0x00   | `PUT_CHAR`      | W      |
//! | 0x04   | `BYTES_READY`   | R      |
//! | 0x08   | `CMD`           | W      |
//! | 0x10   | `DATA_PTR`      | W      |
//! | 0x14   | `DATA_LEN`      | W      |
//! | 0x18   | `DATA_PTR_HIGH` | W      |

use std::collections::VecDeque;
use std::io::{self, Read};

use tracing::{debug, trace, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemory};

use crate::config::BridgeConfig;
use crate::error::ProtocolViolation;
use crate::snapshot::{
    SectionRecord, StreamBridgeState, STREAM_BRIDGE_CAPACITY, STREAM_BRIDGE_SECTION,
    STREAM_BRIDGE_VERSION,
};
use crate::{Error, Result};

use super::char_backend::CharBackend;
use super::irq::IrqLine;
use super::GuestAddressing;

/// Receive queue capacity in bytes
pub const RX_CAPACITY: usize = STREAM_BRIDGE_CAPACITY;

/// Largest guest-memory copy per step of a `WRITE_BUFFER` command
pub const WRITE_CHUNK: usize = 64;

/// Size of the register window
pub const MMIO_SIZE: u64 = 0x1000;

/// Register offsets
pub mod regs {
    pub const PUT_CHAR: u64 = 0x00;
    pub const BYTES_READY: u64 = 0x04;
    pub const CMD: u64 = 0x08;
    pub const DATA_PTR: u64 = 0x10;
    pub const DATA_LEN: u64 = 0x14;
    pub const DATA_PTR_HIGH: u64 = 0x18;
}

/// Values accepted by the `CMD` register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    DisableInterrupts = 0,
    EnableInterrupts = 1,
    WriteBuffer = 2,
    ReadBuffer = 3,
}

impl TryFrom<u64> for Command {
    type Error = ProtocolViolation;

    fn try_from(value: u64) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::DisableInterrupts),
            1 => Ok(Command::EnableInterrupts),
            2 => Ok(Command::WriteBuffer),
            3 => Ok(Command::ReadBuffer),
            other => Err(ProtocolViolation::BadCommand(other)),
        }
    }
}

/// Hands out instance ids up to the board's device limit
#[derive(Debug, Clone)]
pub struct InstanceIds {
    next: u32,
    max: u32,
}

impl InstanceIds {
    /// Allocator for ids `0..max`
    pub fn new(max: u32) -> Self {
        Self { next: 0, max }
    }

    /// Allocator bounded by `max_stream_bridges`
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.max_stream_bridges)
    }

    /// Next free id
    pub fn allocate(&mut self) -> std::result::Result<u32, ProtocolViolation> {
        if self.next >= self.max {
            return Err(ProtocolViolation::TooManyInstances { max: self.max });
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }
}

/// Stream bridge device state
pub struct StreamBridgeDevice {
    instance_id: u32,
    backend: Option<Box<dyn CharBackend>>,
    irq: Box<dyn IrqLine>,
    /// Last level driven onto `irq`
    irq_level: bool,
    interrupts_enabled: bool,
    rx: VecDeque<u8>,
    ptr: u64,
    len: u32,
    addressing: GuestAddressing,
    mmio_base: u64,
}

impl StreamBridgeDevice {
    /// Create a device with interrupts disabled and an empty receive queue.
    /// The interrupt line is driven low.
    ///
    /// Takes the next id from `ids`; fails with `TooManyInstances` once the
    /// board's device limit is reached.
    pub fn new(
        ids: &mut InstanceIds,
        irq: Box<dyn IrqLine>,
        addressing: GuestAddressing,
    ) -> Result<Self> {
        let instance_id = ids.allocate()?;
        irq.set_level(false);
        debug!("stream bridge {} created", instance_id);
        Ok(Self {
            instance_id,
            backend: None,
            irq,
            irq_level: false,
            interrupts_enabled: false,
            rx: VecDeque::with_capacity(RX_CAPACITY),
            ptr: 0,
            len: 0,
            addressing,
            mmio_base: 0,
        })
    }

    /// Attach the host character stream guest output goes to
    pub fn with_backend(mut self, backend: Box<dyn CharBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the host character stream
    pub fn set_backend(&mut self, backend: Option<Box<dyn CharBackend>>) {
        self.backend = backend;
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Set the MMIO base address
    pub fn set_mmio_base(&mut self, base: u64) {
        self.mmio_base = base;
        debug!(
            "stream bridge {} MMIO base set to {:#x}",
            self.instance_id, base
        );
    }

    /// Get the MMIO base address
    pub fn mmio_base(&self) -> u64 {
        self.mmio_base
    }

    /// Get the MMIO region size
    pub fn mmio_size(&self) -> u64 {
        MMIO_SIZE
    }

    /// Check if an address is within this device's MMIO region
    pub fn handles_mmio(&self, addr: u64) -> bool {
        addr.checked_sub(self.mmio_base).is_some_and(|offset| offset < MMIO_SIZE)
    }

    /// Handle MMIO read
    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let value = self.read_register(offset)?;
        let bytes = value.to_le_bytes();
        let len = data.len().min(4);
        data[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    /// Handle MMIO write. Buffer commands access `guest_memory`.
    pub fn mmio_write<M: GuestMemory + ?Sized>(
        &mut self,
        offset: u64,
        data: &[u8],
        guest_memory: &M,
    ) -> Result<()> {
        let mut bytes = [0u8; 4];
        let len = data.len().min(4);
        bytes[..len].copy_from_slice(&data[..len]);
        self.write_register(offset, u32::from_le_bytes(bytes), guest_memory)
    }

    /// Read a register
    pub fn read_register(&self, offset: u64) -> Result<u32> {
        match offset {
            regs::BYTES_READY => Ok(self.rx.len() as u32),
            other => Err(ProtocolViolation::BadReadOffset(other).into()),
        }
    }

    /// Write a register
    pub fn write_register<M: GuestMemory + ?Sized>(
        &mut self,
        offset: u64,
        value: u32,
        guest_memory: &M,
    ) -> Result<()> {
        match offset {
            regs::PUT_CHAR => {
                let ch = value as u8;
                trace!("stream bridge {} TX {:02x}", self.instance_id, ch);
                if let Some(backend) = self.backend.as_mut() {
                    backend.write(&[ch]);
                }
            }
            regs::CMD => match Command::try_from(value as u64)? {
                Command::DisableInterrupts => {
                    self.interrupts_enabled = false;
                    self.update_irq();
                }
                Command::EnableInterrupts => {
                    self.interrupts_enabled = true;
                    self.update_irq();
                }
                Command::WriteBuffer => self.write_buffer(guest_memory)?,
                Command::ReadBuffer => self.read_buffer(guest_memory)?,
            },
            regs::DATA_PTR => {
                self.ptr = (self.ptr & 0xFFFF_FFFF_0000_0000) | value as u64;
            }
            regs::DATA_PTR_HIGH => {
                if !self.addressing.is_64bit() {
                    debug!(
                        "stream bridge {}: switching board to 64-bit buffer addresses",
                        self.instance_id
                    );
                }
                self.addressing.enable_64bit();
                self.ptr = (self.ptr & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
            }
            regs::DATA_LEN => {
                self.len = value;
            }
            other => return Err(ProtocolViolation::BadWriteOffset(other).into()),
        }
        Ok(())
    }

    /// Copy `len` bytes at `ptr` out of guest memory to the host stream
    fn write_buffer<M: GuestMemory + ?Sized>(&mut self, guest_memory: &M) -> Result<()> {
        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };

        let mut addr = self.addressing.translate(self.ptr);
        let mut remaining = self.len as usize;
        let mut chunk = [0u8; WRITE_CHUNK];

        while remaining > 0 {
            let n = remaining.min(WRITE_CHUNK);
            guest_memory
                .read_slice(&mut chunk[..n], GuestAddress(addr))
                .map_err(|e| {
                    Error::Memory(format!(
                        "stream bridge read of {} bytes at {:#x} failed: {}",
                        n, addr, e
                    ))
                })?;
            backend.write(&chunk[..n]);
            addr = addr.wrapping_add(n as u64);
            remaining -= n;
        }
        Ok(())
    }

    /// Move `len` bytes from the front of the receive queue into guest memory
    fn read_buffer<M: GuestMemory + ?Sized>(&mut self, guest_memory: &M) -> Result<()> {
        let requested = self.len as usize;
        if requested > self.rx.len() {
            return Err(ProtocolViolation::DrainOverrun {
                requested: self.len,
                available: self.rx.len() as u32,
            }
            .into());
        }

        let addr = self.addressing.translate(self.ptr);
        let out: Vec<u8> = self.rx.iter().take(requested).copied().collect();
        guest_memory
            .write_slice(&out, GuestAddress(addr))
            .map_err(|e| {
                Error::Memory(format!(
                    "stream bridge write of {} bytes at {:#x} failed: {}",
                    requested, addr, e
                ))
            })?;

        self.rx.drain(..requested);
        trace!(
            "stream bridge {} RX drained {} bytes, {} left",
            self.instance_id,
            requested,
            self.rx.len()
        );
        self.update_irq();
        Ok(())
    }

    /// Free space in the receive queue, the most the host may deliver now
    pub fn can_receive(&self) -> usize {
        RX_CAPACITY - self.rx.len()
    }

    /// Queue host input for the guest. Bytes beyond the advertised capacity
    /// are dropped.
    pub fn receive(&mut self, data: &[u8]) {
        let room = self.can_receive();
        if data.len() > room {
            warn!(
                "stream bridge {}: dropping {} bytes beyond receive capacity",
                self.instance_id,
                data.len() - room
            );
        }
        self.rx.extend(data.iter().take(room).copied());
        self.update_irq();
    }

    /// Read at most `can_receive()` bytes from a non-blocking host reader.
    ///
    /// Returns the number of bytes queued, 0 when the queue is full or the
    /// reader has nothing right now, and `None` once the reader reports end
    /// of stream.
    pub fn pump_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<usize>> {
        let room = self.can_receive();
        if room == 0 {
            return Ok(Some(0));
        }

        let mut buf = [0u8; RX_CAPACITY];
        match reader.read(&mut buf[..room]) {
            Ok(0) => {
                debug!("stream bridge {}: host stream closed", self.instance_id);
                Ok(None)
            }
            Ok(n) => {
                self.receive(&buf[..n]);
                Ok(Some(n))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(Some(0))
            }
            Err(e) => Err(e),
        }
    }

    /// Buffered byte count
    pub fn bytes_ready(&self) -> usize {
        self.rx.len()
    }

    /// Whether the interrupt line is currently driven high
    pub fn irq_asserted(&self) -> bool {
        self.irq_level
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    /// Snapshot registers and the receive queue
    pub fn save(&self) -> Result<SectionRecord> {
        let state = StreamBridgeState {
            ptr: self.ptr,
            len: self.len,
            ready: self.interrupts_enabled,
            data: self.rx.iter().copied().collect(),
        };
        Ok(SectionRecord {
            name: STREAM_BRIDGE_SECTION.to_string(),
            instance_id: self.instance_id,
            version: STREAM_BRIDGE_VERSION,
            payload: state.encode()?,
        })
    }

    /// Restore from a record produced by `save` (current or legacy format).
    /// On failure the device is left unchanged.
    pub fn load(&mut self, record: &SectionRecord) -> Result<()> {
        if record.name != STREAM_BRIDGE_SECTION || record.instance_id != self.instance_id {
            return Err(Error::Snapshot(format!(
                "section {}/{} does not belong to stream bridge {}",
                record.name, record.instance_id, self.instance_id
            )));
        }
        let state = StreamBridgeState::decode(record.version, &record.payload)?;

        self.ptr = state.ptr;
        self.len = state.len;
        self.interrupts_enabled = state.ready;
        self.rx.clear();
        self.rx.extend(state.data);

        // Drive the line unconditionally; its previous level is unknown.
        self.irq_level = self.interrupts_enabled && !self.rx.is_empty();
        self.irq.set_level(self.irq_level);
        debug!(
            "stream bridge {} restored (v{}, {} bytes buffered)",
            self.instance_id,
            record.version,
            self.rx.len()
        );
        Ok(())
    }

    fn update_irq(&mut self) {
        let level = self.interrupts_enabled && !self.rx.is_empty();
        if level != self.irq_level {
            trace!("stream bridge {} irq -> {}", self.instance_id, level);
            self.irq_level = level;
            self.irq.set_level(level);
        }
    }
}

//! Save-state records
//!
//! A `SaveState` is an ordered list of `SectionRecord`s, one per device
//! instance, serialized with postcard. Each record carries its own version so
//! device payload formats can evolve independently of the container.
//!
//! Stream bridge payload (big-endian):
//!
//! | field  | v1     | v2     |
//! |--------|--------|--------|
//! | ptr    | u32    | u64    |
//! | len    | u32    | u32    |
//! | ready  | u8     | u8     |
//! | count  | u8     | u8     |
//! | data   | count  | count  |

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Section name used by stream bridge devices
pub const STREAM_BRIDGE_SECTION: &str = "stream_bridge";

/// Current stream bridge payload version
pub const STREAM_BRIDGE_VERSION: u32 = 2;

/// Stream bridge payload version with a 32-bit buffer pointer
pub const STREAM_BRIDGE_VERSION_LEGACY: u32 = 1;

/// Receive queue capacity; larger occupancies are rejected on decode
pub const STREAM_BRIDGE_CAPACITY: usize = 128;

/// Persisted registers and receive queue of one stream bridge device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBridgeState {
    pub ptr: u64,
    pub len: u32,
    /// Interrupt enable flag
    pub ready: bool,
    /// Buffered bytes, oldest first
    pub data: Vec<u8>,
}

impl StreamBridgeState {
    /// Encode in the current format
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > STREAM_BRIDGE_CAPACITY {
            return Err(Error::Snapshot(format!(
                "receive queue holds {} bytes, capacity is {}",
                self.data.len(),
                STREAM_BRIDGE_CAPACITY
            )));
        }

        let mut out = Vec::with_capacity(14 + self.data.len());
        out.write_u64::<BigEndian>(self.ptr)?;
        out.write_u32::<BigEndian>(self.len)?;
        out.write_u8(self.ready as u8)?;
        out.write_u8(self.data.len() as u8)?;
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decode a payload written with `version`
    pub fn decode(version: u32, payload: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(payload);

        let ptr = match version {
            STREAM_BRIDGE_VERSION_LEGACY => cur.read_u32::<BigEndian>().map(u64::from),
            STREAM_BRIDGE_VERSION => cur.read_u64::<BigEndian>(),
            other => {
                return Err(Error::Snapshot(format!(
                    "unsupported stream bridge state version {}",
                    other
                )))
            }
        }
        .map_err(truncated)?;
        let len = cur.read_u32::<BigEndian>().map_err(truncated)?;
        let ready = cur.read_u8().map_err(truncated)? != 0;
        let count = cur.read_u8().map_err(truncated)? as usize;

        if count > STREAM_BRIDGE_CAPACITY {
            return Err(Error::Snapshot(format!(
                "stream bridge state holds {} bytes, capacity is {}",
                count, STREAM_BRIDGE_CAPACITY
            )));
        }

        let mut data = vec![0u8; count];
        cur.read_exact(&mut data).map_err(truncated)?;

        if (cur.position() as usize) != payload.len() {
            return Err(Error::Snapshot(format!(
                "{} trailing bytes after stream bridge state",
                payload.len() - cur.position() as usize
            )));
        }

        Ok(Self {
            ptr,
            len,
            ready,
            data,
        })
    }
}

fn truncated(e: std::io::Error) -> Error {
    Error::Snapshot(format!("truncated stream bridge state: {}", e))
}

/// One device's saved payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub name: String,
    pub instance_id: u32,
    pub version: u32,
    pub payload: Vec<u8>,
}

/// All saved sections of a board
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    pub sections: Vec<SectionRecord>,
}

impl SaveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a section, replacing any earlier one with the same name and instance
    pub fn push(&mut self, record: SectionRecord) {
        self.sections
            .retain(|s| !(s.name == record.name && s.instance_id == record.instance_id));
        self.sections.push(record);
    }

    /// Find the section for `name`/`instance_id`
    pub fn find(&self, name: &str, instance_id: u32) -> Option<&SectionRecord> {
        self.sections
            .iter()
            .find(|s| s.name == name && s.instance_id == instance_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

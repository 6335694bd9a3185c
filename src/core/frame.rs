//! CAN frame data model.
//!
//! A [`Frame`] is one classic CAN message: a 32-bit identifier word carrying the
//! extended/remote/error flags in its high bits, a payload length in `0..=8`,
//! and a fixed 8-byte payload buffer. Frames are plain `Copy` values.
//!
//! The on-wire representation is the Linux `struct can_frame` record (16 bytes),
//! see [`Frame::to_record`] and [`Frame::from_record`].

use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{CanbusError, Result};

/// Extended frame format flag (29-bit identifier).
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag.
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag.
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Standard frame format identifier mask (11 bits).
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format identifier mask (29 bits).
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

/// Maximum payload length of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Size in bytes of one frame record on the wire.
pub const FRAME_SIZE: usize = 16;

/// Worst-case rendered length: 8 id digits, ": ", "[8]", 8 x " xx".
pub const MAX_RENDERED_LEN: usize = 8 + 2 + 3 + CAN_MAX_DLEN * 3;

/// Text emitted in place of the payload for remote request frames.
const REMOTE_REQUEST: &str = "remote request";

/// One CAN bus message.
///
/// Equality compares the identifier word and exactly `len()` payload bytes.
/// Bytes past the payload length never take part in comparison, hashing, or
/// rendering, and remote frames carry no payload at all.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "FrameFields")]
pub struct Frame {
    id: u32,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

/// Unchecked serde form of [`Frame`].
#[derive(Deserialize)]
struct FrameFields {
    id: u32,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl TryFrom<FrameFields> for Frame {
    type Error = CanbusError;

    fn try_from(fields: FrameFields) -> Result<Self> {
        if fields.len as usize > CAN_MAX_DLEN {
            return Err(CanbusError::invalid_frame(format!(
                "length {} exceeds {}",
                fields.len, CAN_MAX_DLEN
            )));
        }
        Ok(Self {
            id: fields.id,
            len: fields.len,
            data: fields.data,
        })
    }
}

impl Frame {
    /// Create a data frame. The identifier word is used as given, flags included.
    pub fn new(id: u32, payload: &[u8]) -> Result<Self> {
        if payload.len() > CAN_MAX_DLEN {
            return Err(CanbusError::invalid_frame(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                CAN_MAX_DLEN
            )));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    /// Create a data frame with a 29-bit identifier.
    pub fn with_extended_id(id: u32, payload: &[u8]) -> Result<Self> {
        if id > CAN_EFF_MASK {
            return Err(CanbusError::invalid_frame(format!(
                "extended identifier 0x{:X} exceeds 29 bits",
                id
            )));
        }
        Self::new(id | CAN_EFF_FLAG, payload)
    }

    /// Create a remote request frame asking for `dlc` bytes.
    pub fn remote(id: u32, dlc: u8) -> Result<Self> {
        if dlc as usize > CAN_MAX_DLEN {
            return Err(CanbusError::invalid_frame(format!(
                "remote length {} exceeds {}",
                dlc, CAN_MAX_DLEN
            )));
        }

        Ok(Self {
            id: id | CAN_RTR_FLAG,
            len: dlc,
            data: [0u8; CAN_MAX_DLEN],
        })
    }

    /// Full identifier word, flag bits included.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Identifier with flag bits stripped.
    #[inline]
    pub fn raw_id(&self) -> u32 {
        if self.is_extended() {
            self.id & CAN_EFF_MASK
        } else {
            self.id & CAN_SFF_MASK
        }
    }

    /// Check the extended format flag.
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.id & CAN_EFF_FLAG != 0
    }

    /// Check the remote request flag.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.id & CAN_RTR_FLAG != 0
    }

    /// Check the error frame flag.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.id & CAN_ERR_FLAG != 0
    }

    /// Payload length (for remote frames, the requested length).
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True when the frame carries no payload bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Valid payload bytes. Always empty for remote frames.
    pub fn data(&self) -> &[u8] {
        if self.is_remote() {
            &[]
        } else {
            &self.data[..self.len().min(CAN_MAX_DLEN)]
        }
    }

    /// Render as `"<id>: [<len>] xx xx .."` or `"<id>: remote request"`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out);
        out
    }

    /// Append the rendered frame to a caller buffer.
    ///
    /// The buffer is grown up front to fit the worst case, so appending never
    /// reallocates halfway through a frame.
    pub fn serialize_into(&self, buf: &mut String) {
        buf.reserve(MAX_RENDERED_LEN);
        // Writing to a String cannot fail.
        let _ = write!(buf, "{}", self);
    }

    /// Compare identifier and exactly `len()` payload bytes.
    ///
    /// Zero bytes inside the payload are ordinary data: frames that differ
    /// only after an embedded `0x00` are not equal.
    pub fn equals(&self, other: &Frame) -> bool {
        self.id == other.id && self.data() == other.data()
    }

    /// Encode into a `struct can_frame` record.
    pub fn to_record(&self) -> [u8; FRAME_SIZE] {
        let mut record = [0u8; FRAME_SIZE];
        record[..4].copy_from_slice(&self.id.to_ne_bytes());
        record[4] = self.len;
        record[8..].copy_from_slice(&self.data);
        record
    }

    /// Decode a `struct can_frame` record.
    pub fn from_record(record: &[u8; FRAME_SIZE]) -> Result<Self> {
        let id = u32::from_ne_bytes([record[0], record[1], record[2], record[3]]);
        let len = record[4];
        if len as usize > CAN_MAX_DLEN {
            return Err(CanbusError::invalid_frame(format!(
                "length byte {} exceeds {}",
                len, CAN_MAX_DLEN
            )));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data.copy_from_slice(&record[8..]);

        Ok(Self { id, len, data })
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Eq for Frame {}

impl Hash for Frame {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.data().hash(state);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}: ", self.id)?;
        if self.is_remote() {
            return f.write_str(REMOTE_REQUEST);
        }

        write!(f, "[{}]", self.len)?;
        for byte in self.data() {
            write!(f, " {:02x}", byte)?;
        }
        Ok(())
    }
}

/// Parse the `cansend` notation: `123#DEADBEEF`, `1F334455#11.22`, `123#R`, `123#R4`.
///
/// Identifiers of up to 3 hex digits are standard, longer ones are extended.
impl FromStr for Frame {
    type Err = CanbusError;

    fn from_str(s: &str) -> Result<Self> {
        let (id_str, data_str) = s
            .split_once('#')
            .ok_or_else(|| CanbusError::invalid_frame(format!("missing '#' in {:?}", s)))?;

        let raw = u32::from_str_radix(id_str, 16)
            .map_err(|_| CanbusError::invalid_frame(format!("bad identifier {:?}", id_str)))?;

        let id = if id_str.len() <= 3 {
            if raw > CAN_SFF_MASK {
                return Err(CanbusError::invalid_frame(format!(
                    "standard identifier 0x{:X} exceeds 11 bits",
                    raw
                )));
            }
            raw
        } else {
            if raw > CAN_EFF_MASK {
                return Err(CanbusError::invalid_frame(format!(
                    "extended identifier 0x{:X} exceeds 29 bits",
                    raw
                )));
            }
            raw | CAN_EFF_FLAG
        };

        if let Some(rest) = data_str
            .strip_prefix('R')
            .or_else(|| data_str.strip_prefix('r'))
        {
            let dlc = if rest.is_empty() {
                0
            } else {
                rest.parse::<u8>().map_err(|_| {
                    CanbusError::invalid_frame(format!("bad remote length {:?}", rest))
                })?
            };
            return Self::remote(id, dlc);
        }

        let hex: String = data_str.chars().filter(|c| *c != '.').collect();
        if !hex.is_ascii() || hex.len() % 2 != 0 {
            return Err(CanbusError::invalid_frame(format!(
                "payload {:?} is not an even count of hex digits",
                data_str
            )));
        }

        let payload = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| CanbusError::invalid_frame(format!("bad payload {:?}", data_str)))?;

        Self::new(id, &payload)
    }
}

/// A frame stamped with its receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFrame {
    /// Time the frame was read from the bus.
    pub timestamp: DateTime<Utc>,
    /// The frame itself.
    pub frame: Frame,
}

impl CapturedFrame {
    /// Stamp a frame with the current time.
    pub fn now(frame: Frame) -> Self {
        Self {
            timestamp: Utc::now(),
            frame,
        }
    }
}

impl fmt::Display for CapturedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.timestamp.format("%H:%M:%S%.6f"), self.frame)
    }
}

#[cfg(all(feature = "can", target_os = "linux"))]
mod socketcan_conv {
    use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Frame as _, Id, StandardId};

    use super::*;

    impl From<&CanFrame> for Frame {
        fn from(frame: &CanFrame) -> Self {
            let mut id = frame.raw_id();
            if frame.is_extended() {
                id |= CAN_EFF_FLAG;
            }
            if frame.is_remote_frame() {
                id |= CAN_RTR_FLAG;
            }
            if frame.is_error_frame() {
                id |= CAN_ERR_FLAG;
            }

            let payload = frame.data();
            let mut data = [0u8; CAN_MAX_DLEN];
            let len = payload.len().min(CAN_MAX_DLEN);
            data[..len].copy_from_slice(&payload[..len]);

            Self {
                id,
                len: frame.dlc().min(CAN_MAX_DLEN) as u8,
                data,
            }
        }
    }

    impl TryFrom<&Frame> for CanFrame {
        type Error = CanbusError;

        fn try_from(frame: &Frame) -> Result<Self> {
            let id: Id = if frame.is_extended() {
                ExtendedId::new(frame.raw_id())
                    .map(Id::Extended)
                    .ok_or_else(|| CanbusError::invalid_frame("extended identifier out of range"))?
            } else {
                StandardId::new(frame.raw_id() as u16)
                    .map(Id::Standard)
                    .ok_or_else(|| CanbusError::invalid_frame("standard identifier out of range"))?
            };

            let built = if frame.is_remote() {
                CanFrame::new_remote(id, frame.len())
            } else {
                CanFrame::new(id, frame.data())
            };
            built.ok_or_else(|| CanbusError::invalid_frame("frame rejected by socketcan"))
        }
    }
}

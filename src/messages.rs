//! Control message registry: maps the 2-byte type tag of a decrypted message to its
//! typed payload, in both directions.
//!
//! Fixed layouts (little-endian):
//!
//! | kind | body |
//! |---|---|
//! | `TERMINATION` | `code:4` (optional) |
//! | `LOSS_STATS` | `loss_count:4, interval_ms:4, last_good_frame:8` |
//! | `FRAME_STATS` | `last_frame:4, frames_dropped:4` |
//! | `INVALIDATE_REF_FRAMES` | `first_frame:8, last_frame:8` |
//! | `HDR_MODE` | `enabled:1` |
//! | `RUMBLE_DATA` | `unused:4, controller:2, low_freq:2, high_freq:2` |
//! | `RUMBLE_TRIGGERS` | `controller:2, left:2, right:2` |
//! | `MOTION_EVENT` | `controller:2, rate:2, sensor_kind:1` |
//! | `RGB_LED` | `controller:2, r:1, g:1, b:1` |
//!
//! `PERIODIC_PING`, `INPUT_DATA`, `IDR_FRAME`, `START_A` and `START_B` carry
//! free-form bodies. Extra trailing bytes are ignored for forward compatibility.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::DecryptedMessage;
use crate::events::{
    Event, FrameStatsReported, HdrModeChanged, IdrRequested, InputReceived, LossStatsReported,
    MotionEventEnabled, RgbLedRequested, RumbleRequested, RumbleTriggersRequested, SessionId,
};

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Termination = 0x0100,
    PeriodicPing = 0x0200,
    LossStats = 0x0201,
    FrameStats = 0x0204,
    InputData = 0x0206,
    InvalidateRefFrames = 0x0301,
    IdrFrame = 0x0302,
    StartA = 0x0305,
    StartB = 0x0307,
    HdrMode = 0x010e,
    RumbleData = 0x010b,
    RumbleTriggers = 0x5500,
    MotionEvent = 0x5501,
    RgbLed = 0x5502,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        let kind = match value {
            0x0100 => MessageKind::Termination,
            0x0200 => MessageKind::PeriodicPing,
            0x0201 => MessageKind::LossStats,
            0x0204 => MessageKind::FrameStats,
            0x0206 => MessageKind::InputData,
            0x0301 => MessageKind::InvalidateRefFrames,
            0x0302 => MessageKind::IdrFrame,
            0x0305 => MessageKind::StartA,
            0x0307 => MessageKind::StartB,
            0x010e => MessageKind::HdrMode,
            0x010b => MessageKind::RumbleData,
            0x5500 => MessageKind::RumbleTriggers,
            0x5501 => MessageKind::MotionEvent,
            0x5502 => MessageKind::RgbLed,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        MessageKind::from_u16(value).ok_or(DecodeError::UnknownType(value))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Tag outside the known set; dropped for forward compatibility.
    #[error("unknown control message type {0:#06x}")]
    UnknownType(u16),
    #[error("{kind:?} body truncated: need {needed} bytes, got {actual}")]
    Truncated {
        kind: MessageKind,
        needed: usize,
        actual: usize,
    },
    #[error("{kind:?} has invalid {field}")]
    InvalidField {
        kind: MessageKind,
        field: &'static str,
    },
    /// Handshake ordering violation; the state machine did not move.
    #[error("{kind:?} not accepted while {state}")]
    UnexpectedInSequence {
        kind: MessageKind,
        state: &'static str,
    },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    Acceleration = 1,
    Gyroscope = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossStats {
    pub loss_count: u32,
    pub interval_ms: u32,
    pub last_good_frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub last_frame: u32,
    pub frames_dropped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rumble {
    pub controller: u16,
    pub low_freq: u16,
    pub high_freq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleTriggers {
    pub controller: u16,
    pub left: u16,
    pub right: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent {
    pub controller: u16,
    pub rate: u16,
    pub sensor_kind: SensorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbLed {
    pub controller: u16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Termination { code: u32 },
    PeriodicPing { payload: Vec<u8> },
    LossStats(LossStats),
    FrameStats(FrameStats),
    InputData(Vec<u8>),
    InvalidateRefFrames { first_frame: u64, last_frame: u64 },
    IdrFrame,
    StartA,
    StartB,
    HdrMode { enabled: bool },
    Rumble(Rumble),
    RumbleTriggers(RumbleTriggers),
    Motion(MotionEvent),
    RgbLed(RgbLed),
}

impl ControlMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlMessage::Termination { .. } => MessageKind::Termination,
            ControlMessage::PeriodicPing { .. } => MessageKind::PeriodicPing,
            ControlMessage::LossStats(_) => MessageKind::LossStats,
            ControlMessage::FrameStats(_) => MessageKind::FrameStats,
            ControlMessage::InputData(_) => MessageKind::InputData,
            ControlMessage::InvalidateRefFrames { .. } => MessageKind::InvalidateRefFrames,
            ControlMessage::IdrFrame => MessageKind::IdrFrame,
            ControlMessage::StartA => MessageKind::StartA,
            ControlMessage::StartB => MessageKind::StartB,
            ControlMessage::HdrMode { .. } => MessageKind::HdrMode,
            ControlMessage::Rumble(_) => MessageKind::RumbleData,
            ControlMessage::RumbleTriggers(_) => MessageKind::RumbleTriggers,
            ControlMessage::Motion(_) => MessageKind::MotionEvent,
            ControlMessage::RgbLed(_) => MessageKind::RgbLed,
        }
    }

    /// Converts an event-bearing message into its single bus event.
    ///
    /// Returns `None` for the kinds that only drive the session state machine
    /// (`TERMINATION`, `PERIODIC_PING`, `START_A`, `START_B`).
    pub fn into_event(self, session_id: SessionId) -> Option<Event> {
        let event = match self {
            ControlMessage::Termination { .. }
            | ControlMessage::PeriodicPing { .. }
            | ControlMessage::StartA
            | ControlMessage::StartB => return None,
            ControlMessage::IdrFrame | ControlMessage::InvalidateRefFrames { .. } => {
                IdrRequested { session_id }.into()
            }
            ControlMessage::LossStats(stats) => LossStatsReported {
                session_id,
                loss_count: stats.loss_count,
                interval_ms: stats.interval_ms,
                last_good_frame: stats.last_good_frame,
            }
            .into(),
            ControlMessage::FrameStats(stats) => FrameStatsReported {
                session_id,
                last_frame: stats.last_frame,
                frames_dropped: stats.frames_dropped,
            }
            .into(),
            ControlMessage::InputData(data) => InputReceived { session_id, data }.into(),
            ControlMessage::HdrMode { enabled } => HdrModeChanged {
                session_id,
                enabled,
            }
            .into(),
            ControlMessage::Rumble(r) => RumbleRequested {
                session_id,
                controller: r.controller,
                low_freq: r.low_freq,
                high_freq: r.high_freq,
            }
            .into(),
            ControlMessage::RumbleTriggers(t) => RumbleTriggersRequested {
                session_id,
                controller: t.controller,
                left: t.left,
                right: t.right,
            }
            .into(),
            ControlMessage::Motion(m) => MotionEventEnabled {
                session_id,
                controller: m.controller,
                rate: m.rate,
                sensor_kind: m.sensor_kind,
            }
            .into(),
            ControlMessage::RgbLed(led) => RgbLedRequested {
                session_id,
                controller: led.controller,
                r: led.r,
                g: led.g,
                b: led.b,
            }
            .into(),
        };
        Some(event)
    }

    /// Serializes the message body using the fixed layouts above.
    pub fn encode(&self) -> DecryptedMessage {
        let mut body = Vec::new();
        match self {
            ControlMessage::Termination { code } => body.extend_from_slice(&code.to_le_bytes()),
            ControlMessage::PeriodicPing { payload } => body.extend_from_slice(payload),
            ControlMessage::LossStats(stats) => {
                body.extend_from_slice(&stats.loss_count.to_le_bytes());
                body.extend_from_slice(&stats.interval_ms.to_le_bytes());
                body.extend_from_slice(&stats.last_good_frame.to_le_bytes());
            }
            ControlMessage::FrameStats(stats) => {
                body.extend_from_slice(&stats.last_frame.to_le_bytes());
                body.extend_from_slice(&stats.frames_dropped.to_le_bytes());
            }
            ControlMessage::InputData(data) => body.extend_from_slice(data),
            ControlMessage::InvalidateRefFrames {
                first_frame,
                last_frame,
            } => {
                body.extend_from_slice(&first_frame.to_le_bytes());
                body.extend_from_slice(&last_frame.to_le_bytes());
            }
            ControlMessage::IdrFrame | ControlMessage::StartA | ControlMessage::StartB => {}
            ControlMessage::HdrMode { enabled } => body.push(u8::from(*enabled)),
            ControlMessage::Rumble(r) => {
                body.extend_from_slice(&[0u8; 4]);
                body.extend_from_slice(&r.controller.to_le_bytes());
                body.extend_from_slice(&r.low_freq.to_le_bytes());
                body.extend_from_slice(&r.high_freq.to_le_bytes());
            }
            ControlMessage::RumbleTriggers(t) => {
                body.extend_from_slice(&t.controller.to_le_bytes());
                body.extend_from_slice(&t.left.to_le_bytes());
                body.extend_from_slice(&t.right.to_le_bytes());
            }
            ControlMessage::Motion(m) => {
                body.extend_from_slice(&m.controller.to_le_bytes());
                body.extend_from_slice(&m.rate.to_le_bytes());
                body.push(m.sensor_kind as u8);
            }
            ControlMessage::RgbLed(led) => {
                body.extend_from_slice(&led.controller.to_le_bytes());
                body.extend_from_slice(&[led.r, led.g, led.b]);
            }
        }
        DecryptedMessage::new(self.kind().as_u16(), body)
    }
}

/// Bounds-checked little-endian reader over a message body.
struct FieldReader<'a> {
    kind: MessageKind,
    body: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Fails up front when `body` is shorter than `needed`.
    fn new(kind: MessageKind, body: &'a [u8], needed: usize) -> Result<Self, DecodeError> {
        if body.len() < needed {
            return Err(DecodeError::Truncated {
                kind,
                needed,
                actual: body.len(),
            });
        }
        Ok(Self { kind, body, pos: 0 })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self.body.get(self.pos..end).ok_or(DecodeError::Truncated {
            kind: self.kind,
            needed: end,
            actual: self.body.len(),
        })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take()?))
    }
}

/// Decodes the body of a message tagged `msg_type`.
pub fn decode(msg_type: u16, body: &[u8]) -> Result<ControlMessage, DecodeError> {
    let kind = MessageKind::try_from(msg_type)?;
    let message = match kind {
        MessageKind::Termination => {
            let code = if body.len() >= 4 {
                FieldReader::new(kind, body, 4)?.u32()?
            } else {
                0
            };
            ControlMessage::Termination { code }
        }
        MessageKind::PeriodicPing => ControlMessage::PeriodicPing {
            payload: body.to_vec(),
        },
        MessageKind::LossStats => {
            let mut r = FieldReader::new(kind, body, 16)?;
            ControlMessage::LossStats(LossStats {
                loss_count: r.u32()?,
                interval_ms: r.u32()?,
                last_good_frame: r.u64()?,
            })
        }
        MessageKind::FrameStats => {
            let mut r = FieldReader::new(kind, body, 8)?;
            ControlMessage::FrameStats(FrameStats {
                last_frame: r.u32()?,
                frames_dropped: r.u32()?,
            })
        }
        MessageKind::InputData => ControlMessage::InputData(body.to_vec()),
        MessageKind::InvalidateRefFrames => {
            let mut r = FieldReader::new(kind, body, 16)?;
            ControlMessage::InvalidateRefFrames {
                first_frame: r.u64()?,
                last_frame: r.u64()?,
            }
        }
        MessageKind::IdrFrame => ControlMessage::IdrFrame,
        MessageKind::StartA => ControlMessage::StartA,
        MessageKind::StartB => ControlMessage::StartB,
        MessageKind::HdrMode => {
            let mut r = FieldReader::new(kind, body, 1)?;
            ControlMessage::HdrMode {
                enabled: r.u8()? != 0,
            }
        }
        MessageKind::RumbleData => {
            let mut r = FieldReader::new(kind, body, 10)?;
            r.skip(4);
            ControlMessage::Rumble(Rumble {
                controller: r.u16()?,
                low_freq: r.u16()?,
                high_freq: r.u16()?,
            })
        }
        MessageKind::RumbleTriggers => {
            let mut r = FieldReader::new(kind, body, 6)?;
            ControlMessage::RumbleTriggers(RumbleTriggers {
                controller: r.u16()?,
                left: r.u16()?,
                right: r.u16()?,
            })
        }
        MessageKind::MotionEvent => {
            let mut r = FieldReader::new(kind, body, 5)?;
            let controller = r.u16()?;
            let rate = r.u16()?;
            let sensor_kind = match r.u8()? {
                1 => SensorKind::Acceleration,
                2 => SensorKind::Gyroscope,
                _ => {
                    return Err(DecodeError::InvalidField {
                        kind,
                        field: "sensor_kind",
                    })
                }
            };
            ControlMessage::Motion(MotionEvent {
                controller,
                rate,
                sensor_kind,
            })
        }
        MessageKind::RgbLed => {
            let mut r = FieldReader::new(kind, body, 5)?;
            ControlMessage::RgbLed(RgbLed {
                controller: r.u16()?,
                r: r.u8()?,
                g: r.u8()?,
                b: r.u8()?,
            })
        }
    };
    Ok(message)
}

/// Decodes a full decrypted message.
pub fn decode_message(message: &DecryptedMessage) -> Result<ControlMessage, DecodeError> {
    decode(message.msg_type, &message.body)
}

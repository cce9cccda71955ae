//! Domain events fanned out over the [`EventBus`](crate::bus::EventBus).
//!
//! The set is closed: every event is one variant of [`Event`], each variant wraps a
//! payload struct of the same name, and every payload carries the `session_id` it
//! belongs to so subscribers can ignore sessions they do not own.

use serde::{Deserialize, Serialize};

use crate::messages::SensorKind;

/// Identifier of one streaming session, assigned by the launch phase.
pub type SessionId = u64;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// No keepalive traffic within the configured window.
    Timeout,
    /// The client sent a TERMINATION message.
    ClientRequested { code: u32 },
    /// Another component asked the session to end.
    External,
    /// The underlying transport failed or closed.
    TransportClosed,
}

/// Implemented by every event payload so subscribers can register for one kind
/// and receive that payload by value.
pub trait BusEvent: Clone + Send + Sync + 'static {
    const KIND: EventKind;

    fn extract(event: &Event) -> Option<&Self>;
}

macro_rules! bus_events {
    ($($variant:ident),+ $(,)?) => {
        /// Discriminant of [`Event`], used as the bus routing key.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum EventKind {
            $($variant),+
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "event")]
        pub enum Event {
            $($variant($variant)),+
        }

        impl Event {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(Event::$variant(_) => EventKind::$variant),+
                }
            }

            pub fn session_id(&self) -> SessionId {
                match self {
                    $(Event::$variant(inner) => inner.session_id),+
                }
            }
        }

        $(
            impl BusEvent for $variant {
                const KIND: EventKind = EventKind::$variant;

                fn extract(event: &Event) -> Option<&Self> {
                    match event {
                        Event::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$variant> for Event {
                fn from(inner: $variant) -> Self {
                    Event::$variant(inner)
                }
            }
        )+
    };
}

bus_events!(
    IdrRequested,
    Terminated,
    RumbleRequested,
    RumbleTriggersRequested,
    MotionEventEnabled,
    RgbLedRequested,
    LossStatsReported,
    FrameStatsReported,
    InputReceived,
    HdrModeChanged,
);

/// The client (or loss recovery) needs a fresh keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdrRequested {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminated {
    pub session_id: SessionId,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RumbleRequested {
    pub session_id: SessionId,
    pub controller: u16,
    pub low_freq: u16,
    pub high_freq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RumbleTriggersRequested {
    pub session_id: SessionId,
    pub controller: u16,
    pub left: u16,
    pub right: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionEventEnabled {
    pub session_id: SessionId,
    pub controller: u16,
    /// Report rate in Hz; zero disables the sensor.
    pub rate: u16,
    pub sensor_kind: SensorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbLedRequested {
    pub session_id: SessionId,
    pub controller: u16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossStatsReported {
    pub session_id: SessionId,
    /// Frames lost since the previous report.
    pub loss_count: u32,
    pub interval_ms: u32,
    pub last_good_frame: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStatsReported {
    pub session_id: SessionId,
    pub last_frame: u32,
    pub frames_dropped: u32,
}

/// Opaque input packet for the device-emulation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputReceived {
    pub session_id: SessionId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdrModeChanged {
    pub session_id: SessionId,
    pub enabled: bool,
}

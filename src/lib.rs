//! Control plane for a game-streaming host.
//!
//! Each connected client gets one control session carried over a reliable-UDP
//! stream. Envelopes are sealed with AES-128-GCM under a per-packet IV, decoded
//! into typed control messages, run through a small handshake/termination state
//! machine, and fanned out to the rest of the host as typed events on an
//! in-process bus. Video, audio and input subsystems subscribe to the bus; they
//! never touch session state directly.

pub mod bus;
pub mod codec;
pub mod config;
pub mod control;
pub mod crypto;
pub mod events;
pub mod media;
pub mod messages;
pub mod session;
pub mod stats;
pub mod transport;

pub use bus::{EventBus, SubscriptionHandle};
pub use codec::{CodecError, DecryptedMessage, EncryptedPacket};
pub use config::{ConfigError, ControlConfig};
pub use control::{ControlError, ControlServer, Feedback, SessionHandle, SessionSummary};
pub use crypto::{Direction, KeyMaterialError, PacketCipher, SessionKeys};
pub use events::{BusEvent, Event, EventKind, SessionId, TerminationReason};
pub use media::MediaLink;
pub use messages::{ControlMessage, DecodeError, MessageKind};
pub use session::{ControlRole, ControlSession, SessionError, SessionState, SessionStats};
pub use stats::{StatsSink, StatsSnapshot};
pub use transport::{
    ControlTransport, PipeTransport, TimeoutTransport, TransportError, UdpControlTransport,
};

//! Per-client control session: sequence counters, keepalive deadline and the
//! handshake/termination state machine.
//!
//! A [`ControlSession`] is owned by exactly one dispatch task and is never shared.
//! Other components influence it only through the event bus, which the dispatch
//! loop turns into calls on this type from its own context.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::codec::{self, CodecError, DecryptedMessage, EncryptedPacket};
use crate::crypto::{Direction, PacketCipher, SessionKeys};
use crate::events::{Event, IdrRequested, SessionId, Terminated, TerminationReason};
use crate::messages::{ControlMessage, DecodeError};

pub mod state;
pub use state::{SessionState, SessionStateError};

pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Which end of the control stream this session object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRole {
    Host,
    Client,
}

impl ControlRole {
    fn outbound(self) -> Direction {
        match self {
            ControlRole::Host => Direction::HostToClient,
            ControlRole::Client => Direction::ClientToHost,
        }
    }

    fn inbound(self) -> Direction {
        match self {
            ControlRole::Host => Direction::ClientToHost,
            ControlRole::Client => Direction::HostToClient,
        }
    }
}

/// Session-level failures. Each one ends the session with a `Terminated` event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no keepalive traffic for {idle:?}")]
    Timeout { idle: Duration },
    #[error("session terminated: {0:?}")]
    ExplicitTermination(TerminationReason),
    #[error("transport failed: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn reason(&self) -> TerminationReason {
        match self {
            SessionError::Timeout { .. } => TerminationReason::Timeout,
            SessionError::ExplicitTermination(reason) => *reason,
            SessionError::Transport(_) => TerminationReason::TransportClosed,
        }
    }
}

/// Counters for everything the session accepted or dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub accepted: u64,
    pub sent: u64,
    pub auth_failures: u64,
    pub malformed: u64,
    pub replayed: u64,
    pub unknown_type: u64,
    pub truncated: u64,
    pub invalid_field: u64,
    pub out_of_sequence: u64,
}

impl SessionStats {
    /// Total inbound packets dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.auth_failures
            + self.malformed
            + self.replayed
            + self.unknown_type
            + self.truncated
            + self.invalid_field
            + self.out_of_sequence
    }
}

/// Result of feeding one decoded message into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Handled internally (handshake progress, ping); nothing to publish.
    Consumed,
    Publish(Event),
    Terminate(SessionError),
}

#[derive(Debug)]
pub struct ControlSession {
    session_id: SessionId,
    role: ControlRole,
    cipher: PacketCipher,
    /// Next outbound sequence number. Kept wider than the wire field so
    /// exhaustion is detectable instead of wrapping.
    send_seq: u64,
    recv_seq_high_water: Option<u32>,
    last_activity: Instant,
    keepalive_timeout: Duration,
    state: SessionState,
    start_a_received: bool,
    termination: Option<TerminationReason>,
    outbound: VecDeque<ControlMessage>,
    stats: SessionStats,
}

impl ControlSession {
    pub fn new(
        session_id: SessionId,
        keys: SessionKeys,
        role: ControlRole,
        keepalive_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            role,
            cipher: PacketCipher::new(keys),
            send_seq: 0,
            recv_seq_high_water: None,
            last_activity: Instant::now(),
            keepalive_timeout,
            state: SessionState::Handshaking,
            start_a_received: false,
            termination: None,
            outbound: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    /// Host-side session with the default keepalive window.
    pub fn host(session_id: SessionId, keys: SessionKeys) -> Self {
        Self::new(session_id, keys, ControlRole::Host, DEFAULT_KEEPALIVE_TIMEOUT)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> ControlRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Next sequence number [`encrypt`](Self::encrypt) will use.
    pub fn send_seq(&self) -> u64 {
        self.send_seq
    }

    pub fn recv_seq_high_water(&self) -> Option<u32> {
        self.recv_seq_high_water
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Encrypts a message under a fresh sequence number.
    ///
    /// Every call consumes one number whether or not the caller ends up sending
    /// the packet; a retransmission must call this again rather than resend bytes.
    pub fn encrypt(&mut self, message: &DecryptedMessage) -> Result<EncryptedPacket, CodecError> {
        if self.is_closed() {
            return Err(CodecError::SessionClosed);
        }
        let seq = u32::try_from(self.send_seq).map_err(|_| CodecError::SequenceExhausted)?;
        self.send_seq += 1;
        let packet = codec::seal(&self.cipher, self.role.outbound(), seq, message)?;
        self.stats.sent += 1;
        Ok(packet)
    }

    /// Authenticates and decrypts an inbound packet.
    ///
    /// Sequence tracking and the keepalive clock only move after the tag verified
    /// and the sequence number is above the high-water mark.
    pub fn decrypt(
        &mut self,
        packet: &EncryptedPacket,
        now: Instant,
    ) -> Result<DecryptedMessage, CodecError> {
        if self.is_closed() {
            return Err(CodecError::SessionClosed);
        }
        let message = codec::open(&self.cipher, self.role.inbound(), packet)?;
        if let Some(high_water) = self.recv_seq_high_water {
            if packet.seq <= high_water {
                return Err(CodecError::Replayed {
                    seq: packet.seq,
                    high_water,
                });
            }
        }
        self.recv_seq_high_water = Some(packet.seq);
        self.last_activity = now;
        self.stats.accepted += 1;
        Ok(message)
    }

    /// Advances the state machine with one decoded message.
    pub fn handle(&mut self, message: ControlMessage) -> Result<Dispatch, DecodeError> {
        let kind = message.kind();
        match self.state {
            SessionState::Terminating | SessionState::Closed => {
                Err(DecodeError::UnexpectedInSequence {
                    kind,
                    state: self.state.name(),
                })
            }
            SessionState::Handshaking => match message {
                ControlMessage::PeriodicPing { payload } => {
                    self.outbound
                        .push_back(ControlMessage::PeriodicPing { payload });
                    Ok(Dispatch::Consumed)
                }
                ControlMessage::StartA => {
                    self.start_a_received = true;
                    Ok(Dispatch::Consumed)
                }
                ControlMessage::StartB if self.start_a_received => {
                    self.state = self.state.transition(SessionState::Established).map_err(|_| {
                        DecodeError::UnexpectedInSequence {
                            kind,
                            state: self.state.name(),
                        }
                    })?;
                    info!(session_id = self.session_id, "control session established");
                    Ok(Dispatch::Consumed)
                }
                ControlMessage::Termination { code } => Ok(Dispatch::Terminate(
                    SessionError::ExplicitTermination(TerminationReason::ClientRequested { code }),
                )),
                _ => Err(DecodeError::UnexpectedInSequence {
                    kind,
                    state: self.state.name(),
                }),
            },
            SessionState::Established => match message {
                ControlMessage::PeriodicPing { payload } => {
                    self.outbound
                        .push_back(ControlMessage::PeriodicPing { payload });
                    Ok(Dispatch::Consumed)
                }
                ControlMessage::StartA | ControlMessage::StartB => {
                    debug!(session_id = self.session_id, ?kind, "repeated handshake message");
                    Ok(Dispatch::Consumed)
                }
                ControlMessage::Termination { code } => Ok(Dispatch::Terminate(
                    SessionError::ExplicitTermination(TerminationReason::ClientRequested { code }),
                )),
                ControlMessage::IdrFrame => {
                    self.outbound.push_back(ControlMessage::IdrFrame);
                    Ok(Dispatch::Publish(
                        IdrRequested {
                            session_id: self.session_id,
                        }
                        .into(),
                    ))
                }
                other => Ok(other
                    .into_event(self.session_id)
                    .map(Dispatch::Publish)
                    .unwrap_or(Dispatch::Consumed)),
            },
        }
    }

    /// Reports a keepalive expiry, if any, without changing state.
    pub fn check_keepalive(&self, now: Instant) -> Option<SessionError> {
        if !self.state.is_live() {
            return None;
        }
        let idle = now.saturating_duration_since(self.last_activity);
        (idle >= self.keepalive_timeout).then_some(SessionError::Timeout { idle })
    }

    /// Moves a live session to `Terminating` and returns the event announcing it.
    /// Returns `None` if termination already started.
    pub fn begin_termination(&mut self, cause: &SessionError) -> Option<Terminated> {
        let next = self.state.transition(SessionState::Terminating).ok()?;
        self.state = next;
        let reason = cause.reason();
        self.termination = Some(reason);
        Some(Terminated {
            session_id: self.session_id,
            reason,
        })
    }

    /// Final transition. Any remaining outbound messages are discarded.
    pub fn close(&mut self) {
        if self.state.is_live() {
            self.state = SessionState::Terminating;
        }
        if let Ok(next) = self.state.transition(SessionState::Closed) {
            self.state = next;
        }
        self.outbound.clear();
    }

    /// Queues a host-originated message (device feedback) for the client.
    /// Only accepted while established.
    pub fn queue_outbound(&mut self, message: ControlMessage) -> bool {
        if self.state != SessionState::Established {
            return false;
        }
        self.outbound.push_back(message);
        true
    }

    /// Takes every pending outbound message, oldest first.
    pub fn drain_outbound(&mut self) -> VecDeque<ControlMessage> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub(crate) fn note_codec_error(&mut self, err: &CodecError) {
        match err {
            CodecError::AuthenticationFailed => self.stats.auth_failures += 1,
            CodecError::Replayed { .. } => self.stats.replayed += 1,
            CodecError::Malformed(_) | CodecError::TooLarge(_) => self.stats.malformed += 1,
            CodecError::SequenceExhausted | CodecError::SessionClosed => {}
        }
    }

    pub(crate) fn note_decode_error(&mut self, err: &DecodeError) {
        match err {
            DecodeError::UnknownType(_) => self.stats.unknown_type += 1,
            DecodeError::Truncated { .. } => self.stats.truncated += 1,
            DecodeError::InvalidField { .. } => self.stats.invalid_field += 1,
            DecodeError::UnexpectedInSequence { .. } => self.stats.out_of_sequence += 1,
        }
    }
}

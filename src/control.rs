//! Per-session dispatch loop and the server that spawns it.
//!
//! Each session runs on its own tokio task which exclusively owns the
//! [`ControlSession`]. The task waits on four sources at once:
//!
//! * the transport, for inbound envelopes;
//! * a keepalive ticker, checked from inside the task so session state is never
//!   touched from another thread;
//! * the device-feedback queue fed by [`SessionHandle::send_feedback`];
//! * a cancellation token tripped by any `Terminated` event for this session.
//!
//! Per-packet failures are logged, counted and dropped. Only session errors end the
//! loop, and they always surface as exactly one `Terminated` event published by the
//! task itself (unless the termination came from the bus in the first place).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SubscriptionHandle};
use crate::codec::{CodecError, EncryptedPacket};
use crate::config::{ConfigError, ControlConfig};
use crate::crypto::{KeyMaterialError, SessionKeys};
use crate::events::{SessionId, Terminated, TerminationReason};
use crate::messages::{
    self, ControlMessage, DecodeError, MotionEvent, RgbLed, Rumble, RumbleTriggers,
};
use crate::session::{ControlRole, ControlSession, Dispatch, SessionError, SessionStats};
use crate::transport::{ControlTransport, TimeoutTransport, TransportError, UdpControlTransport};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session {0} is no longer running")]
    SessionGone(SessionId),
    #[error("session {0} feedback queue is full")]
    QueueFull(SessionId),
    #[error("session task failed: {0}")]
    Join(String),
}

/// Host-originated controller feedback forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Rumble(Rumble),
    RumbleTriggers(RumbleTriggers),
    Motion(MotionEvent),
    RgbLed(RgbLed),
    HdrMode { enabled: bool },
}

impl Feedback {
    fn into_message(self) -> ControlMessage {
        match self {
            Feedback::Rumble(r) => ControlMessage::Rumble(r),
            Feedback::RumbleTriggers(t) => ControlMessage::RumbleTriggers(t),
            Feedback::Motion(m) => ControlMessage::Motion(m),
            Feedback::RgbLed(led) => ControlMessage::RgbLed(led),
            Feedback::HdrMode { enabled } => ControlMessage::HdrMode { enabled },
        }
    }
}

/// What a finished session task reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub reason: TerminationReason,
    pub stats: SessionStats,
}

/// Spawns control sessions that share one bus and one configuration.
#[derive(Debug, Clone)]
pub struct ControlServer {
    bus: Arc<EventBus>,
    config: ControlConfig,
}

impl ControlServer {
    pub fn new(bus: Arc<EventBus>, config: ControlConfig) -> Result<Self, ControlError> {
        config.validate()?;
        Ok(Self { bus, config })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Starts the dispatch task for a session whose keys came from the launch phase.
    pub fn spawn_session<T>(
        &self,
        session_id: SessionId,
        keys: SessionKeys,
        transport: T,
    ) -> SessionHandle
    where
        T: ControlTransport + 'static,
    {
        let session = ControlSession::new(
            session_id,
            keys,
            ControlRole::Host,
            self.config.keepalive_timeout(),
        );
        let (feedback_tx, feedback_rx) = mpsc::channel(self.config.outbound_queue_depth);
        // Must exist before the task does: a terminate() issued right after
        // spawning has to be observed.
        let watch = TerminationWatch::register(&self.bus, session_id);
        let task = tokio::spawn(run_session(
            session,
            transport,
            Arc::clone(&self.bus),
            self.config.clone(),
            feedback_rx,
            watch,
        ));
        SessionHandle {
            session_id,
            bus: Arc::clone(&self.bus),
            feedback: feedback_tx,
            task,
        }
    }

    /// Binds a UDP socket for one client and starts its session.
    pub async fn spawn_udp_session(
        &self,
        session_id: SessionId,
        keys: SessionKeys,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<SessionHandle, ControlError> {
        let transport =
            UdpControlTransport::bind(local, peer, self.config.max_datagram_size).await?;
        let handle = match self.config.recv_timeout() {
            Some(deadline) => {
                self.spawn_session(session_id, keys, TimeoutTransport::new(transport, deadline))
            }
            None => self.spawn_session(session_id, keys, transport),
        };
        Ok(handle)
    }
}

/// Owner-side view of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    bus: Arc<EventBus>,
    feedback: mpsc::Sender<Feedback>,
    task: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Queues feedback for the client, waiting for queue space.
    pub async fn send_feedback(&self, feedback: Feedback) -> Result<(), ControlError> {
        self.feedback
            .send(feedback)
            .await
            .map_err(|_| ControlError::SessionGone(self.session_id))
    }

    pub fn try_send_feedback(&self, feedback: Feedback) -> Result<(), ControlError> {
        self.feedback.try_send(feedback).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ControlError::QueueFull(self.session_id),
            mpsc::error::TrySendError::Closed(_) => ControlError::SessionGone(self.session_id),
        })
    }

    /// Asks the session to end by publishing `Terminated { External }`.
    pub fn terminate(&self) {
        self.bus.publish(Terminated {
            session_id: self.session_id,
            reason: TerminationReason::External,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<SessionSummary, ControlError> {
        self.task
            .await
            .map_err(|e| ControlError::Join(e.to_string()))
    }
}

/// Bus subscription that turns a `Terminated` event for one session into a
/// cancellation of its dispatch loop.
#[derive(Debug)]
pub struct TerminationWatch {
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<TerminationReason>>>,
    subscription: SubscriptionHandle,
}

impl TerminationWatch {
    pub fn register(bus: &Arc<EventBus>, session_id: SessionId) -> Self {
        let cancel = CancellationToken::new();
        let reason: Arc<Mutex<Option<TerminationReason>>> = Arc::default();
        let subscription = {
            let cancel = cancel.clone();
            let reason = Arc::clone(&reason);
            bus.subscribe(move |event: Terminated| {
                if event.session_id == session_id {
                    reason.lock().get_or_insert(event.reason);
                    cancel.cancel();
                }
            })
        };
        Self {
            cancel,
            reason,
            subscription,
        }
    }

    /// Reason carried by the first `Terminated` seen for the session, if any.
    pub fn reason(&self) -> Option<TerminationReason> {
        *self.reason.lock()
    }

    /// Stops listening; once this returns the reason can no longer change.
    pub fn release(&self) {
        self.subscription.release();
    }
}

/// Drives one session until it closes and returns its summary.
///
/// `watch` must be registered for the session before the task is spawned.
pub async fn run_session<T>(
    mut session: ControlSession,
    mut transport: T,
    bus: Arc<EventBus>,
    config: ControlConfig,
    mut feedback: mpsc::Receiver<Feedback>,
    watch: TerminationWatch,
) -> SessionSummary
where
    T: ControlTransport,
{
    let session_id = session.session_id();
    let cancel = watch.cancel.clone();

    let mut keepalive = time::interval(config.keepalive_check());
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut feedback_open = true;

    let (cause, announce) = loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let reason = watch.reason().unwrap_or(TerminationReason::External);
                Some((SessionError::ExplicitTermination(reason), false))
            }
            _ = keepalive.tick() => {
                session.check_keepalive(Instant::now()).map(|err| (err, true))
            }
            item = feedback.recv(), if feedback_open => {
                match item {
                    Some(fb) => {
                        if !session.queue_outbound(fb.into_message()) {
                            debug!(session_id, ?fb, "feedback dropped before handshake completed");
                        }
                    }
                    None => feedback_open = false,
                }
                None
            }
            received = transport.recv() => match received {
                Ok(datagram) => process_datagram(&mut session, &datagram, &bus)
                    .map(|err| (err, true)),
                Err(TransportError::Timeout) => None,
                Err(err) => Some((SessionError::Transport(err.to_string()), true)),
            },
        };

        if let Some(done) = step {
            break done;
        }
        if let Err(err) = flush_outbound(&mut session, &mut transport).await {
            break (SessionError::Transport(err.to_string()), true);
        }
    };

    let terminated = session.begin_termination(&cause);
    if let Err(err) = flush_outbound(&mut session, &mut transport).await {
        debug!(session_id, error = %err, "could not flush outbound messages while terminating");
    }
    watch.release();
    // A Terminated published by someone else while we were winding down already
    // announced the end of this session.
    let announce = announce && watch.reason().is_none();
    if let Some(event) = terminated {
        if announce {
            bus.publish(event);
        }
    }
    session.close();

    let reason = cause.reason();
    let stats = session.stats();
    info!(
        session_id,
        ?reason,
        accepted = stats.accepted,
        dropped = stats.dropped(),
        sent = stats.sent,
        "control session closed"
    );
    SessionSummary {
        session_id,
        reason,
        stats,
    }
}

/// Runs one inbound datagram through codec, registry and state machine.
/// Returns a session error only when the session must end.
fn process_datagram(
    session: &mut ControlSession,
    datagram: &[u8],
    bus: &EventBus,
) -> Option<SessionError> {
    let session_id = session.session_id();
    let message = match EncryptedPacket::parse(datagram)
        .and_then(|packet| session.decrypt(&packet, Instant::now()))
    {
        Ok(message) => message,
        Err(err) => {
            log_codec_error(session_id, &err);
            session.note_codec_error(&err);
            return None;
        }
    };

    let dispatch = messages::decode_message(&message).and_then(|decoded| session.handle(decoded));
    match dispatch {
        Ok(Dispatch::Consumed) => None,
        Ok(Dispatch::Publish(event)) => {
            bus.publish(event);
            None
        }
        Ok(Dispatch::Terminate(err)) => Some(err),
        Err(err) => {
            log_decode_error(session_id, &err);
            session.note_decode_error(&err);
            None
        }
    }
}

async fn flush_outbound<T>(
    session: &mut ControlSession,
    transport: &mut T,
) -> Result<(), TransportError>
where
    T: ControlTransport,
{
    if !session.has_outbound() {
        return Ok(());
    }
    let session_id = session.session_id();
    for message in session.drain_outbound() {
        let sealed = session
            .encrypt(&message.encode())
            .and_then(|packet| Ok((packet.seq, packet.to_bytes()?)));
        let (seq, bytes) = match sealed {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(
                    session_id,
                    kind = ?message.kind(),
                    error = %err,
                    "cannot encrypt outbound message"
                );
                continue;
            }
        };
        debug!(session_id, seq, kind = ?message.kind(), "sending control message");
        transport.send(&bytes).await?;
    }
    Ok(())
}

fn log_codec_error(session_id: SessionId, err: &CodecError) {
    match err {
        CodecError::AuthenticationFailed => {
            warn!(session_id, "dropping packet that failed authentication")
        }
        CodecError::Replayed { seq, high_water } => {
            warn!(session_id, seq, high_water, "dropping replayed packet")
        }
        other => warn!(session_id, error = %other, "dropping malformed packet"),
    }
}

fn log_decode_error(session_id: SessionId, err: &DecodeError) {
    match err {
        DecodeError::UnknownType(tag) => {
            debug!(session_id, msg_type = *tag, "ignoring unknown control message")
        }
        other => warn!(session_id, error = %other, "dropping control message"),
    }
}

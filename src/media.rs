//! Bus subscriber for the video pipeline of one session.
//!
//! The encoder polls [`MediaLink::take_keyframe_request`] once per frame, so several
//! IDR requests arriving between two frames collapse into a single keyframe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{EventBus, SubscriptionHandle};
use crate::events::{Event, EventKind, SessionId, TerminationReason};

#[derive(Debug, Default)]
struct LinkState {
    keyframe_pending: AtomicBool,
    termination: Mutex<Option<TerminationReason>>,
}

#[derive(Debug)]
pub struct MediaLink {
    session_id: SessionId,
    state: Arc<LinkState>,
    stopped: CancellationToken,
    subscription: SubscriptionHandle,
}

impl MediaLink {
    pub fn attach(bus: &Arc<EventBus>, session_id: SessionId) -> Self {
        let state = Arc::new(LinkState::default());
        let stopped = CancellationToken::new();
        let subscription = {
            let state = Arc::clone(&state);
            let stopped = stopped.clone();
            bus.subscribe_many(
                &[EventKind::IdrRequested, EventKind::Terminated],
                move |event| {
                    if event.session_id() != session_id {
                        return;
                    }
                    match event {
                        Event::IdrRequested(_) => {
                            state.keyframe_pending.store(true, Ordering::Release);
                        }
                        Event::Terminated(t) => {
                            state.termination.lock().get_or_insert(t.reason);
                            stopped.cancel();
                        }
                        _ => {}
                    }
                },
            )
        };
        debug!(session_id, "media link attached");
        Self {
            session_id,
            state,
            stopped,
            subscription,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Returns true once per pending keyframe request and clears it.
    pub fn take_keyframe_request(&self) -> bool {
        self.state.keyframe_pending.swap(false, Ordering::AcqRel)
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        *self.state.termination.lock()
    }

    /// Resolves once the session has terminated.
    pub async fn terminated(&self) -> TerminationReason {
        self.stopped.cancelled().await;
        self.termination().unwrap_or(TerminationReason::External)
    }

    /// Stops listening. Dropping the link has the same effect.
    pub fn detach(self) {
        self.subscription.release();
        debug!(session_id = self.session_id, "media link detached");
    }
}

//! Aggregates the client's loss and frame reports per session.
//!
//! The control plane only forwards what the client reports; this sink keeps a
//! running view that the bitrate logic and diagnostics endpoints can read. A
//! session's totals are dropped when its `Terminated` event is published.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::{EventBus, SubscriptionHandle};
use crate::events::{Event, EventKind, SessionId};

/// Running totals for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub loss_reports: u64,
    pub total_lost: u64,
    /// Largest single loss report seen.
    pub max_loss_burst: u32,
    pub last_good_frame: u64,
    pub frame_reports: u64,
    pub last_frame: u32,
    pub frames_dropped: u64,
}

impl StatsSnapshot {
    /// Lost frames per report, or `None` before the first loss report.
    pub fn mean_loss(&self) -> Option<f64> {
        if self.loss_reports == 0 {
            return None;
        }
        Some(self.total_lost as f64 / self.loss_reports as f64)
    }
}

type StatsTable = Arc<Mutex<HashMap<SessionId, StatsSnapshot>>>;

#[derive(Debug)]
pub struct StatsSink {
    table: StatsTable,
    _subscription: SubscriptionHandle,
}

impl StatsSink {
    pub fn attach(bus: &Arc<EventBus>) -> Self {
        let table: StatsTable = Arc::default();
        let subscription = {
            let table = Arc::clone(&table);
            bus.subscribe_many(
                &[
                    EventKind::LossStatsReported,
                    EventKind::FrameStatsReported,
                    EventKind::Terminated,
                ],
                move |event| record(&table, event),
            )
        };
        Self {
            table,
            _subscription: subscription,
        }
    }

    pub fn snapshot(&self, session_id: SessionId) -> Option<StatsSnapshot> {
        self.table.lock().get(&session_id).copied()
    }

    /// Drops a session's totals ahead of its termination.
    pub fn forget(&self, session_id: SessionId) -> Option<StatsSnapshot> {
        self.table.lock().remove(&session_id)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.table.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn record(table: &Mutex<HashMap<SessionId, StatsSnapshot>>, event: Event) {
    match event {
        Event::LossStatsReported(report) => {
            let mut table = table.lock();
            let entry = table.entry(report.session_id).or_default();
            entry.loss_reports = entry.loss_reports.saturating_add(1);
            entry.total_lost = entry.total_lost.saturating_add(report.loss_count as u64);
            entry.max_loss_burst = entry.max_loss_burst.max(report.loss_count);
            entry.last_good_frame = entry.last_good_frame.max(report.last_good_frame);
        }
        Event::FrameStatsReported(report) => {
            let mut table = table.lock();
            let entry = table.entry(report.session_id).or_default();
            entry.frame_reports = entry.frame_reports.saturating_add(1);
            entry.last_frame = entry.last_frame.max(report.last_frame);
            entry.frames_dropped = entry
                .frames_dropped
                .saturating_add(report.frames_dropped as u64);
        }
        Event::Terminated(ended) => {
            table.lock().remove(&ended.session_id);
        }
        _ => {}
    }
}

//! Completion barrier over a room's recordings
//!
//! Created when a debate starts with one slot per seated peer. Every peer
//! arrives exactly once, whether its recorder finished, failed or was torn
//! down. The arrival that brings the count to zero hands the report to the
//! sink; no other arrival can.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::recording::{RecordingDone, RecordingOutcome};
use crate::report::{RecordReport, ReportSink};

struct BarrierState {
    report: RecordReport,
    arrived: Vec<bool>,
}

pub struct RecordingBarrier {
    state: Mutex<BarrierState>,
    pending: AtomicUsize,
    sink: Arc<dyn ReportSink>,
    tasks: TaskTracker,
}

impl RecordingBarrier {
    /// One slot per report member; `None` when there is nobody to wait for
    /// The report is delivered on `tasks`.
    #[must_use]
    pub fn new(report: RecordReport, sink: Arc<dyn ReportSink>, tasks: TaskTracker) -> Option<Arc<Self>> {
        let expected = report.members.len();
        if expected == 0 {
            return None;
        }
        Some(Arc::new(Self {
            state: Mutex::new(BarrierState {
                arrived: vec![false; expected],
                report,
            }),
            pending: AtomicUsize::new(expected),
            sink,
            tasks,
        }))
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }

    /// Count one peer's recording as finished. Returns true for the arrival
    /// that completed the barrier.
    pub fn arrive(&self, done: RecordingDone) -> bool {
        {
            let mut state = self.state.lock();
            let BarrierState { report, arrived } = &mut *state;
            let Some(index) = report.members.iter().position(|m| m.id == done.peer_id) else {
                warn!(room_id = %done.room_id, peer_id = %done.peer_id, "Recording finished for unknown member");
                return false;
            };
            if arrived[index] {
                debug!(peer_id = %done.peer_id, "Duplicate recording arrival ignored");
                return false;
            }
            arrived[index] = true;

            let member = &mut report.members[index];
            member.recorded = done.outcome.is_recorded();
            if let RecordingOutcome::Completed { file_path } = &done.outcome {
                member.file_path.clone_from(file_path);
            }
        }

        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        debug!(
            room_id = %done.room_id,
            peer_id = %done.peer_id,
            pending = previous.saturating_sub(1),
            outcome = ?done.outcome,
            "Recording arrived"
        );
        if previous != 1 {
            return false;
        }

        let mut report = self.state.lock().report.clone();
        report.finished_at = Some(chrono::Utc::now());
        info!(
            room_id = %report.room_id,
            global_id = %report.global_id,
            members = report.members.len(),
            "All recordings finished"
        );
        self.deliver(report);
        true
    }

    fn deliver(&self, report: RecordReport) {
        let sink = Arc::clone(&self.sink);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.tasks.spawn_on(
                    async move {
                        if let Err(e) = sink.publish(&report).await {
                            error!(room_id = %report.room_id, error = %e, "Failed to deliver debate report");
                        }
                    },
                    &handle,
                );
            }
            Err(_) => error!(room_id = %report.room_id, "No runtime to deliver debate report"),
        }
    }
}

impl std::fmt::Debug for RecordingBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBarrier")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

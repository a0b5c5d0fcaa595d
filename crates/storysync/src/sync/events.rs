//! Run events.
//!
//! The orchestrator publishes a [`SyncEvent`] at every phase boundary and
//! for notable per-item outcomes. Every event is mirrored as a `tracing`
//! event; subscribers additionally receive it through a callback or an
//! unbounded channel.

use super::result::FailedOperation;
use crate::conflict::Conflict;
use crate::domain::{IssueKey, StoryId};
use crate::state::{PhaseProgress, SyncPhase};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something that happened during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The run started.
    Started {
        /// Session id.
        session_id: String,
        /// Target epic.
        epic_key: IssueKey,
        /// Whether the run is a dry run.
        dry_run: bool,
    },
    /// A phase began.
    PhaseStarted(SyncPhase),
    /// A phase ended.
    PhaseCompleted {
        /// The phase.
        phase: SyncPhase,
        /// Its counters.
        progress: PhaseProgress,
    },
    /// A story was matched to an existing remote issue.
    StoryMatched {
        /// Document story.
        story_id: StoryId,
        /// Remote issue.
        issue_key: IssueKey,
    },
    /// A remote story was created for a document story.
    StoryCreated {
        /// Document story.
        story_id: StoryId,
        /// New remote issue.
        issue_key: IssueKey,
    },
    /// A unit of work failed.
    OperationFailed(FailedOperation),
    /// A three-way conflict was found.
    ConflictDetected(Conflict),
    /// The run finished.
    Completed {
        /// Whether no failure was recorded.
        success: bool,
        /// Number of failed units.
        failures: usize,
    },
}

type Callback = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of [`SyncEvent`]s.
#[derive(Default)]
pub struct EventBus {
    callbacks: Vec<Callback>,
    channels: Vec<mpsc::UnboundedSender<SyncEvent>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("callbacks", &self.callbacks.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl EventBus {
    /// Bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for every event.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Receive every event on a channel.
    pub fn subscribe_channel(&mut self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.push(tx);
        rx
    }

    /// Log an event and deliver it to every subscriber.
    pub fn publish(&mut self, event: SyncEvent) {
        log_event(&event);
        for callback in &self.callbacks {
            callback(&event);
        }
        self.channels.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Started {
            session_id,
            epic_key,
            dry_run,
        } => info!(%session_id, %epic_key, dry_run, "sync started"),
        SyncEvent::PhaseStarted(phase) => debug!(%phase, "phase started"),
        SyncEvent::PhaseCompleted { phase, progress } => info!(
            %phase,
            succeeded = progress.succeeded,
            failed = progress.failed,
            skipped = progress.skipped,
            "phase completed"
        ),
        SyncEvent::StoryMatched {
            story_id,
            issue_key,
        } => debug!(%story_id, %issue_key, "story matched"),
        SyncEvent::StoryCreated {
            story_id,
            issue_key,
        } => info!(%story_id, %issue_key, "story created"),
        SyncEvent::OperationFailed(failure) => warn!(
            operation = %failure.operation,
            target = ?failure.target_key,
            story_id = ?failure.story_id,
            recoverable = failure.recoverable,
            message = %failure.message,
            "operation failed"
        ),
        SyncEvent::ConflictDetected(conflict) => warn!(
            story_id = %conflict.story_id,
            field = %conflict.field,
            "conflict detected"
        ),
        SyncEvent::Completed { success, failures } => {
            info!(success, failures, "sync completed");
        }
    }
}

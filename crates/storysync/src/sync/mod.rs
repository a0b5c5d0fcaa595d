//! The sync orchestrator.
//!
//! [`SyncOrchestrator::sync`] drives one run through a fixed sequence of
//! phases:
//!
//! ```text
//! Backup -> Matching -> UpdateEpic -> CreateStories -> DetectChanges
//!   -> Descriptions -> Subtasks -> Comments -> Statuses -> PersistBaselines
//!   -> Completed
//! ```
//!
//! Setup (parsing, validation, connectivity, fetching the epic's children)
//! and the backup are fatal: a failure there returns `Err` and marks the
//! session `Failed`. Inside the apply phases every unit of work is attempted
//! on its own; a tracker error becomes a [`FailedOperation`] and the run
//! moves on. Baselines (fingerprints and the conflict snapshot) are only
//! written after a run with no failure that was not a dry run, so anything
//! that failed is evaluated again next time.
//!
//! Every apply operation converges on a target value (match-or-create,
//! update-to-value, dedupe-before-comment), so re-running the whole pipeline
//! after an interruption is safe.

pub mod batch;
pub mod events;
pub mod matcher;
pub mod options;
mod plan;
pub mod result;

pub use batch::{BatchExecutor, BatchItem, BatchResult, RateLimiter};
pub use events::{EventBus, SyncEvent};
pub use matcher::{MatchOutcome, match_stories};
pub use options::{
    BatchOptions, DEFAULT_STORY_ISSUE_TYPES, PhaseToggles, SyncOptions, SyncStores,
};
pub use result::{FailedOperation, PullChange, SyncResult};

use crate::conflict::{
    ConflictDetector, ConflictField, ConflictPrompt, ConflictResolver, FieldValue, SyncSnapshot,
};
use crate::domain::{
    Epic, IssueFieldUpdate, IssueKey, NewStory, NewSubtask, RemoteIssue, RemoteSubtask, Status,
    StoryId, Subtask, SubtaskUpdate, UserStory, normalize_title, normalize_whitespace,
    points_equal,
};
use crate::error::{Error, Result, TrackerError};
use crate::fingerprint::ChangeTracker;
use crate::ports::{COMMITS_MARKER, DocumentFormatter, DocumentParser, IssueTracker, TrackerResult};
use crate::state::{StateManager, SyncPhase, SyncState};
use plan::FieldPlanner;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reconciles an epic document with the tracker.
pub struct SyncOrchestrator<P, T, F> {
    parser: P,
    tracker: T,
    formatter: F,
    options: SyncOptions,
    stores: SyncStores,
    events: EventBus,
    prompt: Option<Box<dyn ConflictPrompt>>,
}

impl<P, T, F> std::fmt::Debug for SyncOrchestrator<P, T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("options", &self.options)
            .field("stores", &self.stores)
            .field("events", &self.events)
            .field("prompt", &self.prompt.is_some())
            .finish_non_exhaustive()
    }
}

impl<P, T, F> SyncOrchestrator<P, T, F>
where
    P: DocumentParser,
    T: IssueTracker,
    F: DocumentFormatter,
{
    /// Orchestrator over the three ports and the given stores.
    pub fn new(parser: P, tracker: T, formatter: F, options: SyncOptions, stores: SyncStores) -> Self {
        Self {
            parser,
            tracker,
            formatter,
            options,
            stores,
            events: EventBus::new(),
            prompt: None,
        }
    }

    /// Attach the operator prompt used by the `Ask` and `SmartMerge`
    /// strategies.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl ConflictPrompt + 'static) -> Self {
        self.prompt = Some(Box::new(prompt));
        self
    }

    /// Event subscriptions.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// The tracker port.
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    /// Options of every run.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run the pipeline for one document against one epic.
    ///
    /// Per-item failures are reported in the returned [`SyncResult`]; a run
    /// stopped by a conflict under the abort strategy returns a result with
    /// `aborted` set.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or validate, the
    /// tracker cannot be reached, the backup cannot be taken, or a local
    /// store cannot be read or written.
    pub async fn sync(
        &mut self,
        source: &str,
        document_path: &str,
        epic_key: &IssueKey,
    ) -> Result<SyncResult> {
        let sessions = StateManager::new(Arc::clone(&self.stores.sessions));
        let mut state = sessions
            .begin(document_path, epic_key.as_str(), self.options.dry_run)
            .await?;

        let (epic, stories, remote) = match self.setup(source, epic_key).await {
            Ok(setup) => setup,
            Err(err) => {
                error!(session_id = %state.session_id, error = %err, "sync setup failed");
                sessions.fail(&mut state, err.to_string()).await?;
                return Err(err);
            }
        };

        let mut events = std::mem::take(&mut self.events);
        let mut run = Run {
            sessions,
            result: SyncResult {
                session_id: state.session_id.clone(),
                dry_run: self.options.dry_run,
                ..SyncResult::default()
            },
            state,
            events: &mut events,
            phase: SyncPhase::Backup,
            epic_key: epic_key.clone(),
            document_path: document_path.to_string(),
            epic,
            stories,
            remote,
            skipped: HashSet::new(),
            planner: FieldPlanner::default(),
        };
        run.events.publish(SyncEvent::Started {
            session_id: run.state.session_id.clone(),
            epic_key: epic_key.clone(),
            dry_run: self.options.dry_run,
        });

        let outcome = self.pipeline(&mut run).await;
        let finished = run.finish(outcome).await;
        self.events = events;
        finished
    }

    async fn setup(
        &self,
        source: &str,
        epic_key: &IssueKey,
    ) -> Result<(Option<Epic>, Vec<UserStory>, Vec<RemoteIssue>)> {
        let problems = self.parser.validate(source);
        if !problems.is_empty() {
            return Err(Error::Validation(problems));
        }
        let epic = self.parser.parse_epic(source)?;
        let stories = self.parser.parse_stories(source)?;

        self.tracker.test_connection().await?;
        let remote = self.tracker.get_epic_children(epic_key).await?;
        info!(
            tracker = self.tracker.name(),
            %epic_key,
            stories = stories.len(),
            remote = remote.len(),
            "sync setup complete"
        );
        Ok((epic, stories, remote))
    }

    async fn pipeline(&self, run: &mut Run<'_>) -> Result<()> {
        let phases = self.options.phases;
        if phases.backup {
            self.backup(run).await?;
        }
        self.matching(run).await?;
        if phases.update_epic {
            self.update_epic(run).await?;
        }
        if phases.create_stories {
            self.create_stories(run).await?;
        }
        self.detect_changes(run).await?;
        if phases.descriptions {
            self.sync_descriptions(run).await?;
        }
        if phases.subtasks {
            self.sync_subtasks(run).await?;
        }
        if phases.comments {
            self.sync_comments(run).await?;
        }
        if phases.statuses {
            self.sync_statuses(run).await?;
        }

        if self.options.dry_run {
            debug!("dry run; baselines left untouched");
        } else if run.result.success() {
            self.persist_baselines(run).await?;
        } else {
            info!(
                failures = run.result.failures(),
                "run had failures; baselines left untouched"
            );
        }
        Ok(())
    }

    /// Await a mutating call, or skip it in a dry run.
    async fn apply(&self, call: impl Future<Output = TrackerResult<()>>) -> TrackerResult<()> {
        if self.options.dry_run {
            return Ok(());
        }
        call.await
    }

    async fn backup(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Backup).await?;
        match &self.stores.backups {
            Some(_) if self.options.dry_run => {
                debug!("dry run; no backup taken");
                run.skipped();
            }
            Some(backups) => {
                let backup = backups
                    .create_backup(&self.tracker, &run.epic_key, &run.document_path)
                    .await?;
                run.result.backup_id = Some(backup.backup_id);
                run.succeeded();
            }
            None => {
                debug!("no backup store configured");
                run.skipped();
            }
        }
        run.leave().await
    }

    async fn matching(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Matching).await?;
        let outcome = match_stories(&run.stories, &run.remote);
        for (story_id, issue_key) in &outcome.matched {
            run.events.publish(SyncEvent::StoryMatched {
                story_id: story_id.clone(),
                issue_key: issue_key.clone(),
            });
            run.succeeded();
        }
        for story_id in &outcome.unmatched {
            debug!(%story_id, "no remote counterpart");
            run.skipped();
        }
        run.result.stories_matched = outcome.matched.len();
        run.state.matched.clone_from(&outcome.matched);
        run.result.matched = outcome.matched;
        run.result.unmatched_stories = outcome.unmatched;
        run.leave().await
    }

    async fn update_epic(&self, run: &mut Run<'_>) -> Result<()> {
        let Some(epic) = run.epic.clone() else {
            debug!("document declares no epic; nothing to update");
            return Ok(());
        };
        run.enter(SyncPhase::UpdateEpic).await?;
        let key = run.epic_key.clone();

        match self.tracker.get_issue(&key).await {
            Err(err) => run.failed(FailedOperation::from_tracker("get_issue", Some(&key), None, &err)),
            Ok(issue) => {
                let mut updated = false;
                if !epic.title.trim().is_empty()
                    && normalize_whitespace(&epic.title) != normalize_whitespace(&issue.summary)
                {
                    let update = IssueFieldUpdate {
                        summary: Some(epic.title.clone()),
                        ..IssueFieldUpdate::default()
                    };
                    match self.apply(self.tracker.update_issue_fields(&key, update)).await {
                        Ok(()) => updated = true,
                        Err(err) => run.failed(FailedOperation::from_tracker(
                            "update_issue_fields",
                            Some(&key),
                            None,
                            &err,
                        )),
                    }
                }
                let description = epic.description.trim();
                if !description.is_empty()
                    && normalize_whitespace(description)
                        != normalize_whitespace(issue.description.as_deref().unwrap_or_default())
                {
                    let doc = self.formatter.format_text(description);
                    match self.apply(self.tracker.update_description(&key, doc)).await {
                        Ok(()) => updated = true,
                        Err(err) => run.failed(FailedOperation::from_tracker(
                            "update_description",
                            Some(&key),
                            None,
                            &err,
                        )),
                    }
                }
                if updated {
                    info!(epic_key = %key, dry_run = self.options.dry_run, "epic updated");
                    run.result.epic_updated = true;
                    run.succeeded();
                } else {
                    run.skipped();
                }
            }
        }
        run.leave().await
    }

    async fn create_stories(&self, run: &mut Run<'_>) -> Result<()> {
        if run.result.unmatched_stories.is_empty() {
            return Ok(());
        }
        run.enter(SyncPhase::CreateStories).await?;

        for story_id in std::mem::take(&mut run.result.unmatched_stories) {
            let Some(story) = run.story(&story_id).cloned() else {
                continue;
            };
            if self.options.dry_run {
                info!(%story_id, title = %story.title, "dry run: would create story");
                run.result.stories_created += 1;
                run.result.unmatched_stories.push(story_id);
                run.succeeded();
                continue;
            }
            match self.create_story(&story, &run.epic_key).await {
                Ok(issue) => {
                    let issue_key = issue.key.clone();
                    run.remote.push(issue);
                    run.result.matched.insert(story_id.clone(), issue_key.clone());
                    run.state.matched.insert(story_id.clone(), issue_key.clone());
                    run.result.stories_created += 1;
                    run.events.publish(SyncEvent::StoryCreated {
                        story_id,
                        issue_key,
                    });
                    run.succeeded();
                }
                Err(failure) => {
                    run.failed(failure);
                    run.result.unmatched_stories.push(story_id);
                }
            }
        }
        run.leave().await
    }

    /// Create one story, trying each configured issue type in turn.
    ///
    /// Stops at the first success, and on an authentication failure since no
    /// other type will fare better.
    async fn create_story(
        &self,
        story: &UserStory,
        epic_key: &IssueKey,
    ) -> std::result::Result<RemoteIssue, FailedOperation> {
        let description = self.formatter.format_text(&story.body_markdown());
        let mut last_error = TrackerError::Other("no story issue types configured".to_string());

        for issue_type in &self.options.story_issue_types {
            let new_story = NewStory {
                epic_key: epic_key.clone(),
                summary: story.title.clone(),
                description: description.clone(),
                issue_type: issue_type.clone(),
                story_points: story.story_points,
                priority: story.priority,
            };
            match self.tracker.create_story(new_story).await {
                Ok(key) => {
                    return Ok(RemoteIssue {
                        key,
                        summary: story.title.clone(),
                        description: Some(description.source.clone())
                            .filter(|d| !d.trim().is_empty()),
                        status: Status::Open.tracker_name().to_string(),
                        issue_type: issue_type.clone(),
                        story_points: story.story_points,
                        priority: Some(story.priority),
                        assignee: None,
                        subtasks: Vec::new(),
                    });
                }
                Err(err @ TrackerError::Authentication(_)) => {
                    last_error = err;
                    break;
                }
                Err(err) => {
                    debug!(story_id = %story.id, %issue_type, error = %err, "issue type rejected");
                    last_error = err;
                }
            }
        }
        Err(FailedOperation::from_tracker(
            "create_story",
            Some(epic_key),
            Some(&story.id),
            &last_error,
        ))
    }

    async fn detect_changes(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::DetectChanges).await?;
        let epic = run.epic_key.to_string();

        if self.options.incremental && !self.options.force_full_sync {
            let tracker =
                ChangeTracker::load(Arc::clone(&self.stores.fingerprints), &epic, &run.document_path)
                    .await?;
            let changes = tracker.detect_changes(&run.stories);
            for story in &run.stories {
                let unchanged = !changes.get(&story.id).copied().unwrap_or(true);
                if unchanged && run.result.matched.contains_key(&story.id) {
                    debug!(story_id = %story.id, "unchanged since last sync; skipping");
                    run.skipped.insert(story.id.clone());
                }
            }
            run.result.stories_skipped = run.skipped.len();
            run.state.progress_mut(SyncPhase::DetectChanges).skipped += run.skipped.len();
        }

        if self.options.conflict_detection
            && let Some(snapshot) = self.stores.snapshots.load(&epic, &run.document_path).await?
        {
            let active: Vec<UserStory> = run
                .stories
                .iter()
                .filter(|s| !run.skipped.contains(&s.id))
                .cloned()
                .collect();
            let report = ConflictDetector::detect(&active, &run.remote, &run.result.matched, &snapshot);
            run.result.conflicts_detected = report.conflicts.len();
            for conflict in &report.conflicts {
                run.events.publish(SyncEvent::ConflictDetected(conflict.clone()));
            }
            if self.options.bidirectional {
                run.result
                    .pull_changes
                    .extend(report.remote_changes.iter().map(|change| PullChange {
                        story_id: change.story_id.clone(),
                        issue_key: change.issue_key.clone(),
                        field: change.field,
                        local: change.base.clone(),
                        value: change.value.clone(),
                    }));
            }

            let mut resolver = ConflictResolver::new(self.options.strategy, self.options.merge);
            if let Some(prompt) = self.prompt.as_deref() {
                resolver = resolver.with_prompt(prompt);
            }
            let resolutions = resolver.resolve(&report)?;
            run.result.conflicts_resolved = resolutions.resolved_count();
            run.result.warnings.extend(resolutions.warnings.iter().cloned());
            run.planner = FieldPlanner::new(snapshot, resolutions);
        }
        run.leave().await
    }

    async fn sync_descriptions(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Descriptions).await?;
        for (index, key) in run.targets() {
            let story = run.stories[index].clone();
            let Some(issue) = run.issue(&key).cloned() else {
                continue;
            };
            let failures = run.result.failures();
            let mut updated = false;

            let mut fields = IssueFieldUpdate::default();
            if let Some(FieldValue::Text(title)) = run.plan(&story, &issue, ConflictField::Title) {
                fields.summary = Some(title);
            }
            if let Some(FieldValue::Number(points)) =
                run.plan(&story, &issue, ConflictField::StoryPoints)
            {
                fields.story_points = Some(Some(points));
            }
            if !fields.is_empty() {
                match self
                    .apply(self.tracker.update_issue_fields(&key, fields.clone()))
                    .await
                {
                    Ok(()) => {
                        updated = true;
                        if let Some(view) = run.issue_mut(&key) {
                            if let Some(summary) = fields.summary {
                                view.summary = summary;
                            }
                            if let Some(points) = fields.story_points {
                                view.story_points = points;
                            }
                        }
                    }
                    Err(err) => run.failed(FailedOperation::from_tracker(
                        "update_issue_fields",
                        Some(&key),
                        Some(&story.id),
                        &err,
                    )),
                }
            }

            if let Some(FieldValue::Text(body)) = run.plan(&story, &issue, ConflictField::Description)
            {
                let doc = self.formatter.format_text(&body);
                match self.apply(self.tracker.update_description(&key, doc)).await {
                    Ok(()) => {
                        updated = true;
                        if let Some(view) = run.issue_mut(&key) {
                            view.description = Some(body);
                        }
                    }
                    Err(err) => run.failed(FailedOperation::from_tracker(
                        "update_description",
                        Some(&key),
                        Some(&story.id),
                        &err,
                    )),
                }
            }

            if updated {
                debug!(story_id = %story.id, issue_key = %key, "story updated");
                run.result.stories_updated += 1;
                run.succeeded();
            } else if run.result.failures() == failures {
                run.skipped();
            }
        }
        run.leave().await
    }

    async fn sync_subtasks(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Subtasks).await?;
        let mut queued: Vec<(StoryId, NewSubtask)> = Vec::new();

        for (index, key) in run.targets() {
            let story = run.stories[index].clone();
            let Some(issue) = run.issue(&key).cloned() else {
                continue;
            };
            for subtask in &story.subtasks {
                let name = normalize_title(&subtask.name);
                let existing = issue
                    .subtasks
                    .iter()
                    .find(|remote| normalize_title(&remote.summary) == name);

                match existing {
                    Some(remote) => {
                        let update = self.subtask_update(subtask, remote);
                        if update.is_empty() {
                            run.skipped();
                            continue;
                        }
                        match self
                            .apply(self.tracker.update_subtask(&remote.key, update.clone()))
                            .await
                        {
                            Ok(()) => {
                                run.result.subtasks_updated += 1;
                                run.succeeded();
                                if let Some(view) = run.subtask_mut(&key, &remote.key) {
                                    apply_subtask_update(view, update);
                                }
                            }
                            Err(err) => run.failed(FailedOperation::from_tracker(
                                "update_subtask",
                                Some(&remote.key),
                                Some(&story.id),
                                &err,
                            )),
                        }
                    }
                    None => {
                        let new_subtask = NewSubtask {
                            parent_key: key.clone(),
                            summary: subtask.name.clone(),
                            description: self.formatter.format_text(&subtask.description),
                            story_points: subtask.story_points,
                            assignee: subtask.assignee.clone(),
                        };
                        if self.options.dry_run {
                            info!(story_id = %story.id, subtask = %subtask.name, "dry run: would create subtask");
                            run.result.subtasks_created += 1;
                            run.succeeded();
                        } else if self.options.batch.is_some() {
                            queued.push((story.id.clone(), new_subtask));
                        } else {
                            let result = self.tracker.create_subtask(new_subtask.clone()).await;
                            run.subtask_created(&story.id, new_subtask, result);
                        }
                    }
                }
            }
        }

        if let Some(batch) = self.options.batch
            && !queued.is_empty()
        {
            let executor = BatchExecutor::new(
                batch.max_concurrency,
                RateLimiter::new(batch.requests_per_second, batch.burst),
            );
            let subtasks = queued.iter().map(|(_, s)| s.clone()).collect();
            let outcome = executor.create_subtasks(&self.tracker, subtasks).await;
            info!(
                queued = queued.len(),
                succeeded = outcome.succeeded(),
                "batched subtask creation finished"
            );
            for ((story_id, new_subtask), item) in queued.into_iter().zip(outcome.items) {
                run.subtask_created(&story_id, new_subtask, item.result);
            }
        }
        run.leave().await
    }

    fn subtask_update(&self, local: &Subtask, remote: &RemoteSubtask) -> SubtaskUpdate {
        let mut update = SubtaskUpdate::default();
        if !local.description.trim().is_empty()
            && normalize_whitespace(&local.description)
                != normalize_whitespace(remote.description.as_deref().unwrap_or_default())
        {
            update.description = Some(self.formatter.format_text(&local.description));
        }
        if local.story_points.is_some() && !points_equal(local.story_points, remote.story_points) {
            update.story_points = Some(local.story_points);
        }
        if let Some(assignee) = &local.assignee
            && remote.assignee.as_ref() != Some(assignee)
        {
            update.assignee = Some(Some(assignee.clone()));
        }
        update
    }

    async fn sync_comments(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Comments).await?;
        for (index, key) in run.targets() {
            let story = &run.stories[index];
            if story.commits.is_empty() {
                continue;
            }
            let story_id = story.id.clone();
            let table = self.formatter.format_commits_table(&story.commits);

            let comments = match self.tracker.get_issue_comments(&key).await {
                Ok(comments) => comments,
                Err(err) => {
                    run.failed(FailedOperation::from_tracker(
                        "get_issue_comments",
                        Some(&key),
                        Some(&story_id),
                        &err,
                    ));
                    continue;
                }
            };
            if comments.iter().any(|c| c.body.contains(COMMITS_MARKER)) {
                debug!(%story_id, issue_key = %key, "commits already posted");
                run.skipped();
                continue;
            }
            match self.apply(self.tracker.add_comment(&key, table)).await {
                Ok(()) => {
                    run.result.comments_added += 1;
                    run.succeeded();
                }
                Err(err) => run.failed(FailedOperation::from_tracker(
                    "add_comment",
                    Some(&key),
                    Some(&story_id),
                    &err,
                )),
            }
        }
        run.leave().await
    }

    async fn sync_statuses(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::Statuses).await?;
        for (index, key) in run.targets() {
            let story = run.stories[index].clone();
            if !story.status.is_terminal() {
                continue;
            }
            let Some(issue) = run.issue(&key).cloned() else {
                continue;
            };
            let decision = run.plan(&story, &issue, ConflictField::Status);
            let in_place = ConflictField::Status
                .local_value(&story)
                .same_as(&ConflictField::Status.remote_value(&issue));
            let target = decision
                .as_ref()
                .map_or(story.status, |value| Status::from_tracker_name(value.as_text()));
            if (decision.is_none() && !in_place) || !target.is_terminal() {
                debug!(story_id = %story.id, issue_key = %key, "status change held back");
                run.skipped();
                continue;
            }

            for subtask in issue.subtasks.iter().filter(|s| !s.status().is_terminal()) {
                match self.apply(self.tracker.transition_issue(&subtask.key, target)).await {
                    Ok(()) => {
                        run.result.statuses_updated += 1;
                        run.succeeded();
                        if let Some(view) = run.subtask_mut(&key, &subtask.key) {
                            view.status = target.tracker_name().to_string();
                        }
                    }
                    Err(err) => run.failed(FailedOperation::from_tracker(
                        "transition_issue",
                        Some(&subtask.key),
                        Some(&story.id),
                        &err,
                    )),
                }
            }

            if decision.is_some() && !issue.status().is_terminal() {
                match self.apply(self.tracker.transition_issue(&key, target)).await {
                    Ok(()) => {
                        run.result.statuses_updated += 1;
                        run.succeeded();
                        if let Some(view) = run.issue_mut(&key) {
                            view.status = target.tracker_name().to_string();
                        }
                    }
                    Err(err) => run.failed(FailedOperation::from_tracker(
                        "transition_issue",
                        Some(&key),
                        Some(&story.id),
                        &err,
                    )),
                }
            }
        }
        run.leave().await
    }

    async fn persist_baselines(&self, run: &mut Run<'_>) -> Result<()> {
        run.enter(SyncPhase::PersistBaselines).await?;
        let epic = run.epic_key.to_string();
        let synced: Vec<UserStory> = run
            .stories
            .iter()
            .filter(|s| run.result.matched.contains_key(&s.id))
            .cloned()
            .collect();

        let mut tracker =
            ChangeTracker::load(Arc::clone(&self.stores.fingerprints), &epic, &run.document_path)
                .await?;
        tracker.save(&synced).await?;

        if self.options.conflict_detection {
            let previous = self.stores.snapshots.load(&epic, &run.document_path).await?;
            let snapshot = SyncSnapshot::capture(
                &epic,
                &run.document_path,
                &synced,
                &run.remote,
                &run.result.matched,
                previous.as_ref(),
            );
            self.stores.snapshots.save(&snapshot).await?;
        }
        info!(stories = synced.len(), "baselines persisted");
        run.succeeded();
        run.leave().await
    }
}

/// Mutable state of one run.
struct Run<'a> {
    sessions: StateManager,
    state: SyncState,
    events: &'a mut EventBus,
    phase: SyncPhase,
    epic_key: IssueKey,
    document_path: String,
    epic: Option<Epic>,
    stories: Vec<UserStory>,
    /// Tracker state as this run left it: fetched children plus the effect
    /// of every successful mutation.
    remote: Vec<RemoteIssue>,
    skipped: HashSet<StoryId>,
    planner: FieldPlanner,
    result: SyncResult,
}

impl Run<'_> {
    async fn enter(&mut self, phase: SyncPhase) -> Result<()> {
        self.phase = phase;
        self.sessions.transition(&mut self.state, phase).await?;
        self.events.publish(SyncEvent::PhaseStarted(phase));
        Ok(())
    }

    async fn leave(&mut self) -> Result<()> {
        let progress = *self.state.progress_mut(self.phase);
        self.events.publish(SyncEvent::PhaseCompleted {
            phase: self.phase,
            progress,
        });
        self.sessions.checkpoint(&mut self.state).await
    }

    fn succeeded(&mut self) {
        self.state.progress_mut(self.phase).succeeded += 1;
    }

    fn skipped(&mut self) {
        self.state.progress_mut(self.phase).skipped += 1;
    }

    fn failed(&mut self, failure: FailedOperation) {
        self.state.progress_mut(self.phase).failed += 1;
        self.events.publish(SyncEvent::OperationFailed(failure.clone()));
        self.result.record_failure(failure);
    }

    fn story(&self, story_id: &StoryId) -> Option<&UserStory> {
        self.stories.iter().find(|s| &s.id == story_id)
    }

    /// Matched stories the apply phases work on, in document order.
    fn targets(&self) -> Vec<(usize, IssueKey)> {
        self.stories
            .iter()
            .enumerate()
            .filter(|(_, story)| !self.skipped.contains(&story.id))
            .filter_map(|(index, story)| {
                self.result
                    .matched
                    .get(&story.id)
                    .map(|key| (index, key.clone()))
            })
            .collect()
    }

    fn issue(&self, key: &IssueKey) -> Option<&RemoteIssue> {
        self.remote.iter().find(|issue| &issue.key == key)
    }

    fn issue_mut(&mut self, key: &IssueKey) -> Option<&mut RemoteIssue> {
        self.remote.iter_mut().find(|issue| &issue.key == key)
    }

    fn subtask_mut(&mut self, parent: &IssueKey, key: &IssueKey) -> Option<&mut RemoteSubtask> {
        self.issue_mut(parent)?
            .subtasks
            .iter_mut()
            .find(|subtask| &subtask.key == key)
    }

    fn plan(
        &mut self,
        story: &UserStory,
        issue: &RemoteIssue,
        field: ConflictField,
    ) -> Option<FieldValue> {
        self.planner.push_value(
            &story.id,
            &issue.key,
            field,
            field.local_value(story),
            &field.remote_value(issue),
        )
    }

    fn subtask_created(
        &mut self,
        story_id: &StoryId,
        subtask: NewSubtask,
        result: TrackerResult<IssueKey>,
    ) {
        match result {
            Ok(key) => {
                debug!(%story_id, subtask_key = %key, "subtask created");
                self.result.subtasks_created += 1;
                self.succeeded();
                if let Some(parent) = self.issue_mut(&subtask.parent_key) {
                    parent.subtasks.push(RemoteSubtask {
                        key,
                        summary: subtask.summary,
                        description: Some(subtask.description.source)
                            .filter(|d| !d.trim().is_empty()),
                        status: Status::Open.tracker_name().to_string(),
                        story_points: subtask.story_points,
                        assignee: subtask.assignee,
                    });
                }
            }
            Err(err) => self.failed(FailedOperation::from_tracker(
                "create_subtask",
                Some(&subtask.parent_key),
                Some(story_id),
                &err,
            )),
        }
    }

    /// Close the session and hand back the result.
    async fn finish(mut self, outcome: Result<()>) -> Result<SyncResult> {
        match outcome {
            Ok(()) => {
                self.sessions
                    .transition(&mut self.state, SyncPhase::Completed)
                    .await?;
            }
            Err(err @ Error::ConflictAbort { .. }) => {
                warn!(error = %err, "sync aborted; baselines left untouched");
                self.result.aborted = true;
                self.result.record_error(err.to_string());
                self.sessions.fail(&mut self.state, err.to_string()).await?;
            }
            Err(err) => {
                error!(session_id = %self.state.session_id, error = %err, "sync failed");
                self.sessions.fail(&mut self.state, err.to_string()).await?;
                return Err(err);
            }
        }

        let mut result = self.result;
        result.pull_changes.extend(self.planner.take_pull_changes());
        self.events.publish(SyncEvent::Completed {
            success: result.success(),
            failures: result.failures(),
        });
        info!("{}", result.summary());
        Ok(result)
    }
}

fn apply_subtask_update(view: &mut RemoteSubtask, update: SubtaskUpdate) {
    if let Some(summary) = update.summary {
        view.summary = summary;
    }
    if let Some(description) = update.description {
        view.description = Some(description.source).filter(|d| !d.trim().is_empty());
    }
    if let Some(points) = update.story_points {
        view.story_points = points;
    }
    if let Some(assignee) = update.assignee {
        view.assignee = assignee;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{Resolution, ResolutionStrategy};
    use crate::domain::{CommitRef, Description};
    use crate::fingerprint::FingerprintStore;
    use crate::ports::document::{PlainTextFormatter, StaticDocument};
    use crate::ports::memory::{InMemoryTracker, TrackerOperation};
    use rstest::rstest;

    struct Fixture {
        tracker: InMemoryTracker,
        epic_key: IssueKey,
    }

    async fn fixture() -> Fixture {
        let tracker = InMemoryTracker::new("PROJ");
        let epic_key = tracker.create_epic("Checkout").await;
        Fixture { tracker, epic_key }
    }

    fn story(id: &str, title: &str) -> UserStory {
        let mut story = UserStory::new(id, title);
        story.description = Some(Description {
            role: "shopper".into(),
            want: format!("to {}", title.to_lowercase()),
            benefit: "I can pay".into(),
        });
        story
    }

    fn document(stories: Vec<UserStory>) -> StaticDocument {
        StaticDocument::new(Epic {
            key: None,
            title: "Checkout".into(),
            description: String::new(),
            stories,
        })
    }

    fn orchestrator(
        doc: StaticDocument,
        tracker: &InMemoryTracker,
        options: SyncOptions,
        stores: &SyncStores,
    ) -> SyncOrchestrator<StaticDocument, InMemoryTracker, PlainTextFormatter> {
        SyncOrchestrator::new(doc, tracker.clone(), PlainTextFormatter, options, stores.clone())
    }

    #[tokio::test]
    async fn creates_missing_stories_and_subtasks() {
        let Fixture { tracker, epic_key } = fixture().await;
        let mut first = story("US-001", "Pay by card");
        first.subtasks.push(Subtask {
            name: "Card form".into(),
            description: "Render the form".into(),
            story_points: Some(2.0),
            ..Subtask::default()
        });
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(document(vec![first]), &tracker, SyncOptions::default(), &stores);

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert!(result.success(), "{:?}", result.errors);
        assert_eq!(result.stories_created, 1);
        assert_eq!(result.subtasks_created, 1);
        assert!(result.unmatched_stories.is_empty());
        let key = &result.matched[&StoryId::new("US-001")];
        let issue = tracker.issue(key).await.unwrap();
        assert_eq!(issue.subtasks[0].summary, "Card form");
        assert!(result.backup_id.is_some());
    }

    #[tokio::test]
    async fn story_creation_falls_back_across_issue_types() {
        let Fixture { tracker, epic_key } = fixture().await;
        tracker.set_accepted_issue_types(&["Task"]).await;
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(
            document(vec![story("US-001", "Pay by card")]),
            &tracker,
            SyncOptions::default(),
            &stores,
        );

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert_eq!(result.stories_created, 1);
        let key = &result.matched[&StoryId::new("US-001")];
        assert_eq!(tracker.issue(key).await.unwrap().issue_type, "Task");
    }

    #[tokio::test]
    async fn authentication_failure_stops_issue_type_fallback() {
        let Fixture { tracker, epic_key } = fixture().await;
        tracker
            .fail(
                TrackerOperation::CreateStory,
                None,
                TrackerError::Authentication("token expired".into()),
            )
            .await;
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(
            document(vec![story("US-001", "Pay by card")]),
            &tracker,
            SyncOptions::default(),
            &stores,
        );

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert_eq!(tracker.call_count(TrackerOperation::CreateStory).await, 1);
        assert_eq!(result.failed_operations.len(), 1);
        assert_eq!(result.unmatched_stories, vec![StoryId::new("US-001")]);
        assert!(!result.failed_operations[0].recoverable);
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing_and_keeps_baselines() {
        let Fixture { tracker, epic_key } = fixture().await;
        tracker.insert_story(&epic_key, "Pay by card").await;
        let before = tracker.mutation_count().await;
        let stores = SyncStores::in_memory();
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let mut sync = orchestrator(
            document(vec![story("US-001", "Pay by card"), story("US-002", "Refund")]),
            &tracker,
            options,
            &stores,
        );

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert!(result.dry_run);
        assert_eq!(result.stories_created, 1);
        assert_eq!(result.stories_updated, 1);
        assert_eq!(tracker.mutation_count().await, before);
        assert!(result.backup_id.is_none());
        let fingerprints = stores.fingerprints.load("PROJ-1", "epic.md").await.unwrap();
        assert!(fingerprints.is_empty());
        assert!(stores.snapshots.load("PROJ-1", "epic.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_table_is_posted_once() {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let mut local = story("US-001", "Pay by card");
        local.commits.push(CommitRef {
            hash: "abc1234".into(),
            message: "Add card form".into(),
        });
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(document(vec![local]), &tracker, SyncOptions::default(), &stores);

        let first = sync.sync("", "epic.md", &epic_key).await.unwrap();
        let second = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert_eq!(first.comments_added, 1);
        assert_eq!(second.comments_added, 0);
        assert_eq!(tracker.comments(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn finished_story_closes_open_subtasks_first() {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let mut local = story("US-001", "Pay by card");
        local.status = Status::Done;
        local.subtasks.push(Subtask {
            name: "Card form".into(),
            ..Subtask::default()
        });
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(document(vec![local]), &tracker, SyncOptions::default(), &stores);

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert!(result.success(), "{:?}", result.errors);
        assert_eq!(result.statuses_updated, 2);
        let issue = tracker.issue(&key).await.unwrap();
        assert_eq!(issue.status(), Status::Done);
        assert!(issue.subtasks.iter().all(|s| s.status().is_terminal()));
    }

    #[tokio::test]
    async fn unreachable_tracker_fails_the_session() {
        let Fixture { tracker, epic_key } = fixture().await;
        tracker
            .fail(
                TrackerOperation::TestConnection,
                None,
                TrackerError::Transient("connection refused".into()),
            )
            .await;
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(
            document(vec![story("US-001", "Pay by card")]),
            &tracker,
            SyncOptions::default(),
            &stores,
        );

        let err = sync.sync("", "epic.md", &epic_key).await.unwrap_err();

        assert!(matches!(err, Error::Tracker(TrackerError::Transient(_))));
        let sessions = StateManager::new(Arc::clone(&stores.sessions));
        let state = sessions.list().await.unwrap().remove(0);
        assert_eq!(state.phase, SyncPhase::Failed);
        assert_eq!(tracker.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_document_is_rejected_before_touching_the_tracker() {
        let Fixture { tracker, epic_key } = fixture().await;
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(
            document(vec![story("US-001", "  ")]),
            &tracker,
            SyncOptions::default(),
            &stores,
        );

        let err = sync.sync("", "epic.md", &epic_key).await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(tracker.call_count(TrackerOperation::TestConnection).await, 0);
    }

    async fn conflicted_points(strategy: ResolutionStrategy) -> (InMemoryTracker, IssueKey, SyncResult) {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let stores = SyncStores::in_memory();
        let mut local = story("US-001", "Pay by card");
        local.story_points = Some(3.0);
        orchestrator(document(vec![local.clone()]), &tracker, SyncOptions::default(), &stores)
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();

        tracker.edit_issue(&key, |issue| issue.story_points = Some(8.0)).await;
        local.story_points = Some(5.0);
        let options = SyncOptions {
            strategy,
            ..SyncOptions::default()
        };
        let result = orchestrator(document(vec![local]), &tracker, options, &stores)
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();
        (tracker, key, result)
    }

    #[rstest]
    #[case::force_local(ResolutionStrategy::ForceLocal, 5.0)]
    #[case::force_remote(ResolutionStrategy::ForceRemote, 8.0)]
    #[case::skip(ResolutionStrategy::Skip, 8.0)]
    #[case::merge(ResolutionStrategy::Merge, 8.0)]
    #[tokio::test]
    async fn conflict_strategies_decide_the_pushed_value(
        #[case] strategy: ResolutionStrategy,
        #[case] expected: f64,
    ) {
        let (tracker, key, result) = conflicted_points(strategy).await;
        assert_eq!(result.conflicts_detected, 1);
        let points = tracker.issue(&key).await.unwrap().story_points.unwrap();
        assert!((points - expected).abs() < 1e-9, "{points}");
    }

    #[tokio::test]
    async fn abort_strategy_stops_before_applying() {
        let (tracker, key, result) = conflicted_points(ResolutionStrategy::Abort).await;
        assert!(result.aborted);
        assert!(!result.success());
        assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(8.0));
    }

    #[tokio::test]
    async fn ask_strategy_consults_the_prompt() {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let stores = SyncStores::in_memory();
        let mut local = story("US-001", "Pay by card");
        local.story_points = Some(3.0);
        orchestrator(document(vec![local.clone()]), &tracker, SyncOptions::default(), &stores)
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();
        tracker.edit_issue(&key, |issue| issue.story_points = Some(8.0)).await;
        local.story_points = Some(5.0);

        let options = SyncOptions {
            strategy: ResolutionStrategy::Ask,
            ..SyncOptions::default()
        };
        let result = orchestrator(document(vec![local]), &tracker, options, &stores)
            .with_prompt(|_: &crate::conflict::Conflict| Resolution::UseValue(FieldValue::Number(13.0)))
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();

        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(13.0));
        assert_eq!(result.pull_changes[0].value, FieldValue::Number(13.0));
    }

    #[tokio::test]
    async fn bidirectional_reports_remote_only_changes() {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let stores = SyncStores::in_memory();
        let mut local = story("US-001", "Pay by card");
        local.story_points = Some(3.0);
        orchestrator(document(vec![local.clone()]), &tracker, SyncOptions::default(), &stores)
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();
        tracker.edit_issue(&key, |issue| issue.story_points = Some(8.0)).await;

        let options = SyncOptions {
            bidirectional: true,
            ..SyncOptions::default()
        };
        let result = orchestrator(document(vec![local]), &tracker, options, &stores)
            .sync("", "epic.md", &epic_key)
            .await
            .unwrap();

        assert_eq!(result.stories_updated, 0);
        assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(8.0));
        assert_eq!(result.pull_changes.len(), 1);
        assert_eq!(result.pull_changes[0].field, ConflictField::StoryPoints);
        assert_eq!(result.pull_changes[0].value, FieldValue::Number(8.0));
    }

    #[tokio::test]
    async fn batched_subtask_creation_matches_sequential() {
        let Fixture { tracker, epic_key } = fixture().await;
        let key = tracker.insert_story(&epic_key, "Pay by card").await;
        let mut local = story("US-001", "Pay by card");
        for name in ["Form", "Validation", "Receipt"] {
            local.subtasks.push(Subtask {
                name: name.into(),
                ..Subtask::default()
            });
        }
        let options = SyncOptions {
            batch: Some(BatchOptions {
                requests_per_second: 0.0,
                ..BatchOptions::default()
            }),
            ..SyncOptions::default()
        };
        let stores = SyncStores::in_memory();
        let mut sync = orchestrator(document(vec![local]), &tracker, options, &stores);

        let result = sync.sync("", "epic.md", &epic_key).await.unwrap();

        assert_eq!(result.subtasks_created, 3);
        assert_eq!(tracker.issue(&key).await.unwrap().subtasks.len(), 3);
    }

    #[tokio::test]
    async fn events_cover_every_enabled_phase() {
        let Fixture { tracker, epic_key } = fixture().await;
        tracker.insert_story(&epic_key, "Pay by card").await;
        let stores = SyncStores::in_memory();
        let options = SyncOptions {
            phases: PhaseToggles {
                comments: false,
                ..PhaseToggles::default()
            },
            ..SyncOptions::default()
        };
        let mut sync = orchestrator(
            document(vec![story("US-001", "Pay by card")]),
            &tracker,
            options,
            &stores,
        );
        let mut rx = sync.events_mut().subscribe_channel();

        sync.sync("", "epic.md", &epic_key).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::PhaseStarted(phase) = event {
                phases.push(phase);
            }
        }
        assert!(!phases.contains(&SyncPhase::Comments));
        assert_eq!(phases.first(), Some(&SyncPhase::Backup));
        assert_eq!(phases.last(), Some(&SyncPhase::PersistBaselines));
        assert!(phases.windows(2).all(|w| w[0] < w[1]));
    }
}

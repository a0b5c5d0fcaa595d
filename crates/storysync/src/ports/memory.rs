//! In-memory issue tracker.
//!
//! An **ephemeral** [`IssueTracker`] where epics, stories, subtasks and
//! comments live in a `BTreeMap` behind a `tokio::sync::Mutex`. It behaves
//! like a small, well-mannered tracker project:
//!
//! - keys are `{PROJECT}-{n}`, allocated in creation order
//! - epic children are returned in creation order
//! - new stories start in `To Do`
//! - descriptions are stored as the markdown source of the [`RichDoc`]
//!
//! # Failure injection
//!
//! Tests can make any operation fail, optionally only for one key and only a
//! fixed number of times, via [`InMemoryTracker::fail`] and
//! [`InMemoryTracker::fail_times`]. Rejected issue types can be simulated with
//! [`InMemoryTracker::set_accepted_issue_types`].

use super::{IssueTracker, RichDoc, TrackerResult};
use crate::domain::{
    IssueFieldUpdate, IssueKey, NewStory, NewSubtask, Priority, RemoteComment, RemoteIssue,
    RemoteSubtask, Status, SubtaskUpdate,
};
use crate::error::TrackerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tracker operations, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerOperation {
    /// `test_connection`
    TestConnection,
    /// `get_epic_children`
    GetEpicChildren,
    /// `get_issue`
    GetIssue,
    /// `create_story`
    CreateStory,
    /// `update_issue_fields`
    UpdateIssueFields,
    /// `update_description`
    UpdateDescription,
    /// `create_subtask`
    CreateSubtask,
    /// `update_subtask`
    UpdateSubtask,
    /// `add_comment`
    AddComment,
    /// `get_issue_comments`
    GetIssueComments,
    /// `transition_issue`
    TransitionIssue,
    /// `get_issue_status`
    GetIssueStatus,
}

#[derive(Debug)]
struct FailureRule {
    operation: TrackerOperation,
    key: Option<IssueKey>,
    error: TrackerError,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct TrackerState {
    issues: BTreeMap<IssueKey, RemoteIssue>,
    epic_children: BTreeMap<IssueKey, Vec<IssueKey>>,
    subtask_parents: HashMap<IssueKey, IssueKey>,
    comments: HashMap<IssueKey, Vec<RemoteComment>>,
    next_number: u64,
    accepted_issue_types: Option<Vec<String>>,
    failures: Vec<FailureRule>,
    calls: Vec<(TrackerOperation, Option<IssueKey>)>,
    mutations: usize,
}

impl TrackerState {
    fn allocate_key(&mut self, project: &str) -> IssueKey {
        self.next_number += 1;
        IssueKey::new(format!("{project}-{}", self.next_number))
    }

    /// Record the call and return the injected failure, if any applies.
    fn enter(&mut self, operation: TrackerOperation, key: Option<&IssueKey>) -> TrackerResult<()> {
        self.calls.push((operation, key.cloned()));
        let Some(index) = self.failures.iter().position(|rule| {
            rule.operation == operation
                && rule.key.as_ref().is_none_or(|k| Some(k) == key)
        }) else {
            return Ok(());
        };
        let rule = &mut self.failures[index];
        let error = rule.error.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(index);
            }
        }
        Err(error)
    }

    fn subtask_mut(&mut self, key: &IssueKey) -> Option<&mut RemoteSubtask> {
        let parent = self.subtask_parents.get(key)?;
        self.issues
            .get_mut(parent)?
            .subtasks
            .iter_mut()
            .find(|s| &s.key == key)
    }

    fn exists(&self, key: &IssueKey) -> bool {
        self.issues.contains_key(key) || self.subtask_parents.contains_key(key)
    }
}

fn not_found(key: &IssueKey) -> TrackerError {
    TrackerError::NotFound(format!("issue {key} does not exist"))
}

fn description_from(doc: &RichDoc) -> Option<String> {
    (!doc.source.trim().is_empty()).then(|| doc.source.clone())
}

/// In-memory [`IssueTracker`] for tests and local experiments.
///
/// Clones share the same project, so a test can hand one clone to an
/// orchestrator and inspect the other.
#[derive(Debug, Clone)]
pub struct InMemoryTracker {
    project: String,
    state: Arc<Mutex<TrackerState>>,
}

impl InMemoryTracker {
    /// Create an empty tracker project with the given key prefix.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Create an epic and return its key.
    pub async fn create_epic(&self, summary: &str) -> IssueKey {
        let mut state = self.state.lock().await;
        let key = state.allocate_key(&self.project);
        state.issues.insert(
            key.clone(),
            RemoteIssue {
                key: key.clone(),
                summary: summary.to_string(),
                description: None,
                status: Status::Open.tracker_name().to_string(),
                issue_type: "Epic".to_string(),
                story_points: None,
                priority: None,
                assignee: None,
                subtasks: Vec::new(),
            },
        );
        state.epic_children.insert(key.clone(), Vec::new());
        key
    }

    /// Create a bare story under an epic, bypassing failure injection.
    pub async fn insert_story(&self, epic_key: &IssueKey, summary: &str) -> IssueKey {
        let mut state = self.state.lock().await;
        let key = state.allocate_key(&self.project);
        let issue = RemoteIssue {
            key: key.clone(),
            summary: summary.to_string(),
            description: None,
            status: Status::Open.tracker_name().to_string(),
            issue_type: "Story".to_string(),
            story_points: None,
            priority: Some(Priority::Medium),
            assignee: None,
            subtasks: Vec::new(),
        };
        state.issues.insert(key.clone(), issue);
        state
            .epic_children
            .entry(epic_key.clone())
            .or_default()
            .push(key.clone());
        key
    }

    /// Apply an out-of-band edit to an issue, as another tracker user would.
    ///
    /// Returns `false` if the issue does not exist.
    pub async fn edit_issue(&self, key: &IssueKey, edit: impl FnOnce(&mut RemoteIssue)) -> bool {
        let mut state = self.state.lock().await;
        let Some(issue) = state.issues.get_mut(key) else {
            return false;
        };
        edit(issue);
        let subtask_keys: Vec<IssueKey> = issue.subtasks.iter().map(|s| s.key.clone()).collect();
        for subtask_key in subtask_keys {
            state.subtask_parents.insert(subtask_key, key.clone());
        }
        true
    }

    /// Delete an issue out-of-band. Returns `false` if it did not exist.
    pub async fn remove_issue(&self, key: &IssueKey) -> bool {
        let mut state = self.state.lock().await;
        let Some(issue) = state.issues.remove(key) else {
            return false;
        };
        for subtask in &issue.subtasks {
            state.subtask_parents.remove(&subtask.key);
        }
        for children in state.epic_children.values_mut() {
            children.retain(|k| k != key);
        }
        true
    }

    /// Current state of an issue.
    pub async fn issue(&self, key: &IssueKey) -> Option<RemoteIssue> {
        self.state.lock().await.issues.get(key).cloned()
    }

    /// Comments of an issue.
    pub async fn comments(&self, key: &IssueKey) -> Vec<RemoteComment> {
        self.state
            .lock()
            .await
            .comments
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Restrict the issue types `create_story` accepts (case-insensitive).
    pub async fn set_accepted_issue_types(&self, types: &[&str]) {
        self.state.lock().await.accepted_issue_types =
            Some(types.iter().map(|t| t.to_ascii_lowercase()).collect());
    }

    /// Make an operation fail every time, optionally only for one key.
    pub async fn fail(
        &self,
        operation: TrackerOperation,
        key: Option<&IssueKey>,
        error: TrackerError,
    ) {
        self.push_failure(operation, key, error, None).await;
    }

    /// Make an operation fail the next `times` matching calls.
    pub async fn fail_times(
        &self,
        operation: TrackerOperation,
        key: Option<&IssueKey>,
        error: TrackerError,
        times: usize,
    ) {
        if times > 0 {
            self.push_failure(operation, key, error, Some(times)).await;
        }
    }

    /// Remove every injected failure.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Number of mutating calls that succeeded.
    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations
    }

    /// Number of calls made to an operation, successful or not.
    pub async fn call_count(&self, operation: TrackerOperation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    async fn push_failure(
        &self,
        operation: TrackerOperation,
        key: Option<&IssueKey>,
        error: TrackerError,
        remaining: Option<usize>,
    ) {
        self.state.lock().await.failures.push(FailureRule {
            operation,
            key: key.cloned(),
            error,
            remaining,
        });
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn test_connection(&self) -> TrackerResult<()> {
        self.state
            .lock()
            .await
            .enter(TrackerOperation::TestConnection, None)
    }

    async fn get_epic_children(&self, epic_key: &IssueKey) -> TrackerResult<Vec<RemoteIssue>> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::GetEpicChildren, Some(epic_key))?;
        let children = state
            .epic_children
            .get(epic_key)
            .ok_or_else(|| not_found(epic_key))?;
        Ok(children
            .iter()
            .filter_map(|key| state.issues.get(key).cloned())
            .collect())
    }

    async fn get_issue(&self, key: &IssueKey) -> TrackerResult<RemoteIssue> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::GetIssue, Some(key))?;
        if let Some(issue) = state.issues.get(key) {
            return Ok(issue.clone());
        }
        let subtask = state.subtask_mut(key).ok_or_else(|| not_found(key))?.clone();
        Ok(RemoteIssue {
            key: subtask.key,
            summary: subtask.summary,
            description: subtask.description,
            status: subtask.status,
            issue_type: "Sub-task".to_string(),
            story_points: subtask.story_points,
            priority: None,
            assignee: subtask.assignee,
            subtasks: Vec::new(),
        })
    }

    async fn create_story(&self, story: NewStory) -> TrackerResult<IssueKey> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::CreateStory, Some(&story.epic_key))?;
        if !state.epic_children.contains_key(&story.epic_key) {
            return Err(not_found(&story.epic_key));
        }
        if let Some(accepted) = &state.accepted_issue_types
            && !accepted.contains(&story.issue_type.to_ascii_lowercase())
        {
            return Err(TrackerError::Other(format!(
                "issue type '{}' is not valid for project {}",
                story.issue_type, self.project
            )));
        }
        let key = state.allocate_key(&self.project);
        state.issues.insert(
            key.clone(),
            RemoteIssue {
                key: key.clone(),
                summary: story.summary,
                description: description_from(&story.description),
                status: Status::Open.tracker_name().to_string(),
                issue_type: story.issue_type,
                story_points: story.story_points,
                priority: Some(story.priority),
                assignee: None,
                subtasks: Vec::new(),
            },
        );
        state
            .epic_children
            .entry(story.epic_key)
            .or_default()
            .push(key.clone());
        state.mutations += 1;
        Ok(key)
    }

    async fn update_issue_fields(
        &self,
        key: &IssueKey,
        update: IssueFieldUpdate,
    ) -> TrackerResult<()> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::UpdateIssueFields, Some(key))?;
        if let Some(issue) = state.issues.get_mut(key) {
            if let Some(summary) = update.summary {
                issue.summary = summary;
            }
            if let Some(points) = update.story_points {
                issue.story_points = points;
            }
            if let Some(priority) = update.priority {
                issue.priority = Some(priority);
            }
            if let Some(assignee) = update.assignee {
                issue.assignee = assignee;
            }
        } else {
            let subtask = state.subtask_mut(key).ok_or_else(|| not_found(key))?;
            if let Some(summary) = update.summary {
                subtask.summary = summary;
            }
            if let Some(points) = update.story_points {
                subtask.story_points = points;
            }
            if let Some(assignee) = update.assignee {
                subtask.assignee = assignee;
            }
        }
        state.mutations += 1;
        Ok(())
    }

    async fn update_description(
        &self,
        key: &IssueKey,
        description: RichDoc,
    ) -> TrackerResult<()> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::UpdateDescription, Some(key))?;
        let text = description_from(&description);
        if let Some(issue) = state.issues.get_mut(key) {
            issue.description = text;
        } else {
            state.subtask_mut(key).ok_or_else(|| not_found(key))?.description = text;
        }
        state.mutations += 1;
        Ok(())
    }

    async fn create_subtask(&self, subtask: NewSubtask) -> TrackerResult<IssueKey> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::CreateSubtask, Some(&subtask.parent_key))?;
        if !state.issues.contains_key(&subtask.parent_key) {
            return Err(not_found(&subtask.parent_key));
        }
        let key = state.allocate_key(&self.project);
        let created = RemoteSubtask {
            key: key.clone(),
            summary: subtask.summary,
            description: description_from(&subtask.description),
            status: Status::Open.tracker_name().to_string(),
            story_points: subtask.story_points,
            assignee: subtask.assignee,
        };
        if let Some(parent) = state.issues.get_mut(&subtask.parent_key) {
            parent.subtasks.push(created);
        }
        state
            .subtask_parents
            .insert(key.clone(), subtask.parent_key);
        state.mutations += 1;
        Ok(key)
    }

    async fn update_subtask(&self, key: &IssueKey, update: SubtaskUpdate) -> TrackerResult<()> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::UpdateSubtask, Some(key))?;
        let subtask = state.subtask_mut(key).ok_or_else(|| not_found(key))?;
        if let Some(summary) = update.summary {
            subtask.summary = summary;
        }
        if let Some(description) = update.description {
            subtask.description = description_from(&description);
        }
        if let Some(points) = update.story_points {
            subtask.story_points = points;
        }
        if let Some(assignee) = update.assignee {
            subtask.assignee = assignee;
        }
        state.mutations += 1;
        Ok(())
    }

    async fn add_comment(&self, key: &IssueKey, body: RichDoc) -> TrackerResult<()> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::AddComment, Some(key))?;
        if !state.exists(key) {
            return Err(not_found(key));
        }
        state.next_number += 1;
        let id = format!("comment-{}", state.next_number);
        state
            .comments
            .entry(key.clone())
            .or_default()
            .push(RemoteComment {
                id,
                author: Some("storysync".to_string()),
                body: body.source,
            });
        state.mutations += 1;
        Ok(())
    }

    async fn get_issue_comments(&self, key: &IssueKey) -> TrackerResult<Vec<RemoteComment>> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::GetIssueComments, Some(key))?;
        if !state.exists(key) {
            return Err(not_found(key));
        }
        Ok(state.comments.get(key).cloned().unwrap_or_default())
    }

    async fn transition_issue(&self, key: &IssueKey, target: Status) -> TrackerResult<()> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::TransitionIssue, Some(key))?;
        let name = target.tracker_name().to_string();
        if let Some(issue) = state.issues.get_mut(key) {
            issue.status = name;
        } else {
            state.subtask_mut(key).ok_or_else(|| not_found(key))?.status = name;
        }
        state.mutations += 1;
        Ok(())
    }

    async fn get_issue_status(&self, key: &IssueKey) -> TrackerResult<String> {
        let mut state = self.state.lock().await;
        state.enter(TrackerOperation::GetIssueStatus, Some(key))?;
        if let Some(issue) = state.issues.get(key) {
            return Ok(issue.status.clone());
        }
        Ok(state
            .subtask_mut(key)
            .ok_or_else(|| not_found(key))?
            .status
            .clone())
    }
}

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::common::env::{ELB_UNDO_TIMEOUT_MS, get_duration_from_env};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cluster,
    SharedStorage,
    StagedQueries,
    RunMetadata,
    Job,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::SharedStorage => "shared storage",
            ResourceKind::StagedQueries => "staged queries",
            ResourceKind::RunMetadata => "run metadata",
            ResourceKind::Job => "job",
        })
    }
}

type UndoFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

/// Reverses the creation of one resource.
///
/// The reversal must succeed when the resource is already gone.
pub struct UndoAction {
    kind: ResourceKind,
    id: String,
    reverse: Box<dyn FnOnce() -> UndoFuture>,
}

impl UndoAction {
    pub fn new<F, Fut>(kind: ResourceKind, id: impl Into<String>, reverse: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self {
            kind,
            id: id.into(),
            reverse: Box::new(move || Box::pin(reverse())),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Error)]
#[error("Cannot remove {kind} `{id}`: {message}")]
pub struct UndoError {
    pub kind: ResourceKind,
    pub id: String,
    pub message: String,
}

fn default_action_timeout() -> Duration {
    get_duration_from_env(ELB_UNDO_TIMEOUT_MS).unwrap_or_else(|| Duration::from_secs(30 * 60))
}

/// LIFO registry of resources created during a run.
pub struct CleanupStack {
    actions: Vec<UndoAction>,
    action_timeout: Duration,
}

impl Default for CleanupStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::with_action_timeout(default_action_timeout())
    }

    pub fn with_action_timeout(action_timeout: Duration) -> Self {
        Self {
            actions: Vec::new(),
            action_timeout,
        }
    }

    pub fn push(&mut self, action: UndoAction) {
        log::debug!("Registered cleanup of {} `{}`", action.kind, action.id);
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Registered resources, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = (ResourceKind, &str)> {
        self.actions.iter().map(|a| (a.kind, a.id.as_str()))
    }

    /// Runs every registered action, newest first. A failing action does not
    /// stop the unwinding. The stack is empty afterwards.
    pub async fn unwind_all(&mut self) -> Vec<UndoError> {
        let mut errors = vec![];
        if !self.actions.is_empty() {
            log::info!("Cleaning up {} resource(s)", self.actions.len());
        }
        while let Some(action) = self.actions.pop() {
            let UndoAction { kind, id, reverse } = action;
            log::debug!("Removing {kind} `{id}`");
            let message = match tokio::time::timeout(self.action_timeout, reverse()).await {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => format!("{error:?}"),
                Err(_) => format!(
                    "timed out after {}",
                    humantime::format_duration(self.action_timeout)
                ),
            };
            let error = UndoError { kind, id, message };
            log::warn!("{error}");
            errors.push(error);
        }
        errors
    }

    /// Forgets every registered action without running it. The resources stay alive.
    pub fn commit(&mut self) -> Vec<(ResourceKind, String)> {
        self.actions
            .drain(..)
            .map(|action| (action.kind, action.id))
            .collect()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            log::error!(
                "Cleanup stack dropped with {} pending action(s), these resources may be orphaned: {}",
                self.actions.len(),
                self.actions
                    .iter()
                    .map(|a| format!("{} `{}`", a.kind, a.id))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }
}

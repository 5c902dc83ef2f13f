//! Job handles
//!
//! A [`JobHandle`] is the caller's side of a running download: it observes the
//! state machine and progress, and can pause or cancel. Pausing keeps the
//! partial blob so a later job resumes from it; cancelling discards it.

use super::progress::Progress;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a download job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    ResolvingMetadata,
    CheckPointerOrBlobExists,
    AcquiringLock,
    Transferring,
    MovedToBlob,
    Linked,
    Done,
    Paused,
    Failed { reason: String },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Paused | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Where a paused transfer stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeToken {
    pub incomplete_path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
    discard: Arc<AtomicBool>,
    state: Arc<watch::Sender<JobState>>,
    progress: Arc<Progress>,
    resume: Arc<Mutex<Option<ResumeToken>>>,
}

impl JobHandle {
    pub(crate) fn new(progress: Arc<Progress>) -> Self {
        Self::with_parts(CancellationToken::new(), Arc::new(AtomicBool::new(false)), progress)
    }

    /// Handle for a job nested in a larger one
    ///
    /// `cancel` should be a child of the parent's token. The discard flag is
    /// shared so cancelling the parent discards the children's partial files.
    pub(crate) fn nested(&self, cancel: CancellationToken, progress: Arc<Progress>) -> Self {
        Self::with_parts(cancel, Arc::clone(&self.discard), progress)
    }

    fn with_parts(
        cancel: CancellationToken,
        discard: Arc<AtomicBool>,
        progress: Arc<Progress>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            cancel,
            discard,
            state: Arc::new(state),
            progress,
            resume: Arc::new(Mutex::new(None)),
        }
    }

    /// Stop the job, keeping its partial file for a later resume
    pub fn pause(&self) {
        self.cancel.cancel();
    }

    /// Stop the job and delete its partial file
    pub fn cancel(&self) {
        self.discard.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Set once a paused transfer left a partial file behind
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.resume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn discarding(&self) -> bool {
        self.discard.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, state: JobState) {
        tracing::trace!(state = ?state, "Job state");
        self.state.send_replace(state);
    }

    pub(crate) fn set_resume_token(&self, token: ResumeToken) {
        *self
            .resume
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }

    /// Map a job's final result onto the terminal state
    pub(crate) fn finish<T>(&self, result: &crate::error::HubResult<T>) {
        let state = match result {
            Ok(_) => JobState::Done,
            Err(e) if e.is_cancelled() && self.discarding() => JobState::Cancelled,
            Err(e) if e.is_cancelled() => JobState::Paused,
            Err(e) => JobState::Failed {
                reason: e.to_string(),
            },
        };
        self.set_state(state);
    }
}

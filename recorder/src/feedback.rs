//! User-visible feedback: status indicator, elapsed-time display, auth
//! badge and the notification log.
//!
//! Every notification is also emitted as a `tracing` event so a headless
//! deployment sees the same story in its logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use memo_common::protocol::{AuthBadge, Destination, Notice, NoticeLevel, StatusSnapshot};
use memo_common::recording::format_duration;

/// Notifications kept for the status endpoint.
const NOTICE_HISTORY: usize = 20;

#[derive(Debug, Default)]
struct FeedbackState {
    recording: bool,
    elapsed_secs: u64,
    status: String,
    auth: AuthBadge,
    destination: Option<Destination>,
    auto_upload: bool,
    deferred: Option<String>,
    notices: VecDeque<Notice>,
}

/// Cheap-to-clone handle onto the shared feedback state.
#[derive(Clone, Default)]
pub struct Feedback {
    inner: Arc<Mutex<FeedbackState>>,
}

impl Feedback {
    pub fn new() -> Self {
        let feedback = Self::default();
        feedback.lock().status = "Idle".into();
        feedback
    }

    fn lock(&self) -> MutexGuard<'_, FeedbackState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info | NoticeLevel::Success => info!("{message}"),
            NoticeLevel::Warning => warn!("{message}"),
            NoticeLevel::Error => error!("{message}"),
        }
        let mut state = self.lock();
        if state.notices.len() == NOTICE_HISTORY {
            state.notices.pop_front();
        }
        state.notices.push_back(Notice { level, message });
    }

    pub fn set_status(&self, status: impl Into<String>, recording: bool) {
        let mut state = self.lock();
        state.status = status.into();
        state.recording = recording;
    }

    pub fn set_elapsed(&self, seconds: u64) {
        self.lock().elapsed_secs = seconds;
    }

    pub fn set_auth(&self, badge: AuthBadge) {
        self.lock().auth = badge;
    }

    pub fn set_destination(&self, destination: Option<Destination>) {
        self.lock().destination = destination;
    }

    pub fn set_auto_upload(&self, enabled: bool) {
        self.lock().auto_upload = enabled;
    }

    pub fn set_deferred(&self, name: Option<String>) {
        self.lock().deferred = name;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        StatusSnapshot {
            recording: state.recording,
            elapsed: format_duration(state.elapsed_secs),
            status: state.status.clone(),
            auth: state.auth,
            destination: state.destination.clone(),
            auto_upload: state.auto_upload,
            deferred: state.deferred.clone(),
            notices: state.notices.iter().cloned().collect(),
        }
    }

    /// Messages logged so far, oldest first.
    #[cfg(test)]
    pub fn messages(&self) -> Vec<(NoticeLevel, String)> {
        self.lock()
            .notices
            .iter()
            .map(|n| (n.level, n.message.clone()))
            .collect()
    }
}

use std::sync::Mutex;

use async_trait::async_trait;

use crate::notify::{FailureNotice, Notifier};

/// Keeps every notice it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<FailureNotice> {
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.notices.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &FailureNotice) -> anyhow::Result<()> {
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notice.clone());
        Ok(())
    }
}

//! A capture source that records the engine's requests.

use cdcflow_core::SourceOffset;
use cdcflow_engine::{CaptureSource, CdcError, CdcResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Records `resume_from`, `pause` and `resume` calls.
#[derive(Debug, Default)]
pub struct RecordingSource {
    resumed_from: Mutex<Vec<Option<SourceOffset>>>,
    pauses: AtomicU32,
    resumes: AtomicU32,
    paused: AtomicBool,
    fail_resume: Mutex<Option<String>>,
}

impl RecordingSource {
    /// Creates a source that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `resume_from` fail with a transient error.
    pub fn fail_next_resume(&self, message: impl Into<String>) {
        *self.fail_resume.lock() = Some(message.into());
    }

    /// Every `resume_from` argument, in call order.
    pub fn resume_calls(&self) -> Vec<Option<SourceOffset>> {
        self.resumed_from.lock().clone()
    }

    /// Argument of the most recent `resume_from`. `None` if never called,
    /// `Some(None)` if asked to start from the beginning.
    pub fn last_resume(&self) -> Option<Option<SourceOffset>> {
        self.resumed_from.lock().last().cloned()
    }

    /// Number of `pause` calls.
    pub fn pauses(&self) -> u32 {
        self.pauses.load(Ordering::SeqCst)
    }

    /// Number of `resume` calls.
    pub fn resumes(&self) -> u32 {
        self.resumes.load(Ordering::SeqCst)
    }

    /// True between a `pause` and the following `resume`.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl CaptureSource for RecordingSource {
    fn resume_from(&self, offset: Option<&SourceOffset>) -> CdcResult<()> {
        self.resumed_from.lock().push(offset.cloned());
        match self.fail_resume.lock().take() {
            Some(message) => Err(CdcError::transient(message)),
            None => Ok(()),
        }
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcflow_core::SequencePosition;

    #[test]
    fn records_calls() {
        let source = RecordingSource::new();
        assert_eq!(source.last_resume(), None);

        source.resume_from(None).unwrap();
        let offset = SourceOffset::new(SequencePosition::new(7), "0/7");
        source.resume_from(Some(&offset)).unwrap();
        assert_eq!(source.resume_calls(), vec![None, Some(offset.clone())]);
        assert_eq!(source.last_resume(), Some(Some(offset)));

        source.pause();
        assert!(source.is_paused());
        source.resume();
        assert!(!source.is_paused());
        assert_eq!((source.pauses(), source.resumes()), (1, 1));
    }

    #[test]
    fn scripted_resume_failure_is_one_shot() {
        let source = RecordingSource::new();
        source.fail_next_resume("slot dropped");
        assert!(source.resume_from(None).is_err());
        assert!(source.resume_from(None).is_ok());
    }
}

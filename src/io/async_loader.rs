//! Background trace loading.
//!
//! A single worker thread decodes and correlates; the caller polls
//! `check_completion()` and may read progress or cancel in the meantime.

use super::loader::{load_trace, LoadedTrace};
use super::progress::LoadProgress;
use crate::config::LoadOptions;
use log::error;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

/// Result of a completed trace loading operation.
pub enum LoadResult {
    Success {
        trace: Box<LoadedTrace>,
        path: PathBuf,
    },
    /// Loading failed with an error
    Error(String),
    /// No loading operation finished yet
    None,
}

/// Manages one background load at a time.
pub struct AsyncLoader {
    progress: Arc<LoadProgress>,

    /// Channel receiver for loading results
    loading_receiver: Option<Receiver<Result<LoadedTrace, String>>>,

    /// Path of the file currently being loaded
    pending_load_path: Option<PathBuf>,
}

impl AsyncLoader {
    pub fn new() -> Self {
        Self {
            progress: Arc::new(LoadProgress::new()),
            loading_receiver: None,
            pending_load_path: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading_receiver.is_some()
    }

    pub fn progress(&self) -> &LoadProgress {
        &self.progress
    }

    /// Asks the worker to stop after the record it is decoding.
    pub fn cancel(&self) -> bool {
        self.progress.cancel()
    }

    /// Starts loading `path` on a worker thread. Call `check_completion()`
    /// regularly to pick up the result.
    pub fn start_file_load(&mut self, path: PathBuf, options: LoadOptions) {
        let (sender, receiver) = channel();
        self.loading_receiver = Some(receiver);
        self.pending_load_path = Some(path.clone());
        self.progress.begin();

        let progress = Arc::clone(&self.progress);
        thread::spawn(move || {
            let result = load_trace(&path, &options, &progress).map_err(|e| {
                error!("{:#}", e);
                format!("{:#}", e)
            });
            let _ = sender.send(result);
        });
    }

    /// Returns the finished load, if any, without blocking.
    pub fn check_completion(&mut self) -> LoadResult {
        let result = match &self.loading_receiver {
            Some(receiver) => match receiver.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => return LoadResult::None,
                Err(TryRecvError::Disconnected) => Err("load worker exited without a result".to_string()),
            },
            None => return LoadResult::None,
        };
        self.complete(result)
    }

    /// Blocks until the current load finishes.
    pub fn wait(&mut self) -> LoadResult {
        let result = match self.loading_receiver.as_ref().map(|r| r.recv()) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err("load worker exited without a result".to_string()),
            None => return LoadResult::None,
        };
        self.complete(result)
    }

    fn complete(&mut self, result: Result<LoadedTrace, String>) -> LoadResult {
        self.loading_receiver = None;
        let path = self.pending_load_path.take().unwrap_or_default();
        match result {
            Ok(trace) => LoadResult::Success {
                trace: Box::new(trace),
                path,
            },
            Err(error_msg) => LoadResult::Error(error_msg),
        }
    }
}

impl Default for AsyncLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::progress::LoadStatus;
    use std::env;

    #[test]
    fn test_async_loader_creation() {
        let loader = AsyncLoader::new();
        assert!(!loader.is_loading());
        assert!(!loader.cancel());
    }

    #[test]
    fn test_check_completion_when_idle() {
        let mut loader = AsyncLoader::new();
        assert!(matches!(loader.check_completion(), LoadResult::None));
    }

    #[test]
    fn test_missing_file_reports_error() {
        let mut loader = AsyncLoader::new();
        let path = env::temp_dir().join("rgpuvis_async_missing.dat");
        let _ = std::fs::remove_file(&path);
        loader.start_file_load(path, LoadOptions::default());
        match loader.wait() {
            LoadResult::Error(msg) => assert!(msg.contains("rgpuvis_async_missing.dat")),
            _ => panic!("expected an error"),
        }
        assert_eq!(loader.progress().status(), LoadStatus::Error);
        assert!(!loader.is_loading());
    }

    #[test]
    fn test_cancel_right_after_start_is_honored() -> anyhow::Result<()> {
        let path = env::temp_dir().join("rgpuvis_async_cancel.dat");
        let mut w = crate::writer::TraceDatWriter::new(6, 1);
        let tick = w.add_format("test", "tick", &[("n", crate::writer::FieldType::U32)]);
        for n in 0..500u32 {
            w.add_event(0, 1_000 + n as u64 * 10, 1, tick, &[n.into()])?;
        }
        w.write_to(&path)?;

        let mut loader = AsyncLoader::new();
        loader.start_file_load(path.clone(), LoadOptions::default());
        let accepted = loader.cancel();
        match loader.wait() {
            LoadResult::Success { trace, .. } => {
                assert_eq!(trace.cancelled, accepted);
            }
            _ => panic!("expected a loaded trace"),
        }

        std::fs::remove_file(&path)?;
        Ok(())
    }
}

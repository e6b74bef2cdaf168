#![forbid(unsafe_code)]

//! In-process extraction engine used by the unit tests.

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::Value;

use crate::engine::{EngineError, EngineOptions, ExtractionEngine, RawInfo};

/// Returns a canned payload and, for download runs, writes the configured
/// files next to the output template.
pub(crate) struct StubEngine {
    info: Value,
    files: Vec<(String, Vec<u8>)>,
    failure: Option<String>,
    calls: AtomicUsize,
    last_url: Mutex<Option<String>>,
    last_options: Mutex<Option<EngineOptions>>,
}

impl StubEngine {
    pub(crate) fn new(info: Value) -> Self {
        Self {
            info,
            files: Vec::new(),
            failure: None,
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
            last_options: Mutex::new(None),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        let mut stub = Self::new(Value::Null);
        stub.failure = Some(message.to_string());
        stub
    }

    pub(crate) fn with_file(mut self, name: &str, contents: &[u8]) -> Self {
        self.files.push((name.to_string(), contents.to_vec()));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_url(&self) -> Option<String> {
        self.last_url.lock().clone()
    }

    pub(crate) fn last_options(&self) -> Option<EngineOptions> {
        self.last_options.lock().clone()
    }
}

impl ExtractionEngine for StubEngine {
    fn extract(&self, url: &str, options: &EngineOptions) -> Result<RawInfo, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock() = Some(url.to_string());
        *self.last_options.lock() = Some(options.clone());

        if let Some(message) = &self.failure {
            return Err(EngineError::Failed(message.clone()));
        }
        if options.downloads_files() {
            let dir = options
                .output_template
                .as_deref()
                .and_then(|template| template.parent())
                .ok_or_else(|| EngineError::Failed("no output template".into()))?;
            for (name, contents) in &self.files {
                let path = dir.join(name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| EngineError::Failed(err.to_string()))?;
                }
                fs::write(&path, contents).map_err(|err| EngineError::Failed(err.to_string()))?;
            }
        }
        Ok(serde_json::from_value(self.info.clone())?)
    }
}

/// Polls until `path` is gone. Removal handed to the blocking pool finishes
/// on its own schedule.
pub(crate) fn wait_for_removal(path: &Path) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while path.exists() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

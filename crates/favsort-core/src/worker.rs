//! Run scans and exports on a background thread.
//!
//! The caller keeps a [`JobHandle`]: it drains [`WorkerEvent`]s from the
//! channel or polls the shared counter, may request cancellation, and
//! finally joins for the result. The worker is the only writer of the
//! progress counter; the caller is the only writer of the cancel flag.

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use log::debug;

use crate::cancel::{CancellationToken, ProgressCounter};
use crate::error::{Error, Result};
use crate::media::MediaEntry;
use crate::writer::{self, ExportOptions, ExportSummary};
use crate::{Progress, ProgressCallback, ScanOptions, ScanReport};

/// Message sent from the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Progress(Progress),
    /// The job returned a result; `join` will not block for long
    Finished,
    /// The job failed; the message is the error's display text
    Failed(String),
}

/// What to scan.
#[derive(Debug, Clone)]
pub enum ScanRequest {
    Cache { root: PathBuf, options: ScanOptions },
    Archive { path: PathBuf, options: ScanOptions },
}

/// Handle to a running job.
pub struct JobHandle<T> {
    events: Receiver<WorkerEvent>,
    cancel: CancellationToken,
    progress: ProgressCounter,
    thread: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Event stream; it disconnects once the worker exits.
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the job's token, e.g. for a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker and take its result.
    pub fn join(self) -> Result<T> {
        self.thread.join().map_err(|_| Error::WorkerPanicked)?
    }
}

fn spawn_job<T, F>(name: &str, job: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&ProgressCallback<'_>, &CancellationToken) -> Result<T> + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::unbounded();
    let cancel = CancellationToken::new();
    let progress = ProgressCounter::new();
    debug!("Starting {} worker", name);

    let thread = {
        let cancel = cancel.clone();
        let counter = progress.clone();
        std::thread::spawn(move || {
            let cb = |p: &Progress| {
                counter.set(p.current_index, p.total_count);
                // A dropped receiver only means nobody is listening
                let _ = tx.send(WorkerEvent::Progress(p.clone()));
            };
            let result = job(&cb, &cancel);
            let last = match &result {
                Ok(_) => WorkerEvent::Finished,
                Err(e) => WorkerEvent::Failed(e.to_string()),
            };
            let _ = tx.send(last);
            result
        })
    };

    JobHandle {
        events: rx,
        cancel,
        progress,
        thread,
    }
}

/// Scan a cache directory or archive in the background.
pub fn spawn_scan(request: ScanRequest) -> JobHandle<ScanReport> {
    spawn_job("scan", move |cb, cancel| match request {
        ScanRequest::Cache { root, options } => {
            crate::scan_cache_with_control(&root, &options, cb, Some(cancel))
        }
        ScanRequest::Archive { path, options } => {
            crate::scan_archive_with_control(&path, &options, cb, Some(cancel))
        }
    })
}

/// Export a reconciled sequence in the background.
pub fn spawn_export(entries: Vec<MediaEntry>, options: ExportOptions) -> JobHandle<ExportSummary> {
    spawn_job("export", move |cb, cancel| {
        writer::export(&entries, &options, cb, Some(cancel))
    })
}

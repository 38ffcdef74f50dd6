//! Run model, registry, and the per-run event bus.
//!
//! A [`RunEntry`] owns one run's mutable state behind a mutex, the cancel
//! handle the API facade can trigger, and the subscriber set events fan
//! out to. Entries are created and looked up through the [`RunRegistry`]
//! and live for the lifetime of the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::{Generator, Ulid};

use crate::messages::{rfc3339_nanos, ErrorCode, Event};

/// Bounded buffer per event subscriber; events beyond it are dropped for
/// that subscriber so publishing never blocks the supervisor.
pub const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Timeout,
    Canceled,
}

impl RunStatus {
    /// Once terminal, the run is immutable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Timeout | RunStatus::Canceled
        )
    }
}

/// One execution of a submitted snippet. Only the supervisor that owns
/// the run writes its status, exit, and time fields.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Run {
    fn new(id: String) -> Self {
        Self {
            id,
            status: RunStatus::Queued,
            exit_code: None,
            error_code: None,
            error_message: None,
            started_at: None,
            finished_at: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Current `run.stats` event for this snapshot, or `None` if the run
    /// has not started yet.
    pub fn stats_event(&self) -> Option<Event> {
        let started_at = self.started_at?;
        let now = Utc::now();
        Some(Event::stats(
            &self.id,
            rfc3339_nanos(now),
            (now - started_at).num_milliseconds(),
            self.stdout.len() as i64,
            self.stderr.len() as i64,
        ))
    }
}

pub struct RunEntry {
    id: String,
    run: Mutex<Run>,
    cancel: Mutex<Option<CancellationToken>>,
    subs: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_sub: AtomicU64,
}

impl RunEntry {
    fn new(id: String) -> Self {
        Self {
            run: Mutex::new(Run::new(id.clone())),
            id,
            cancel: Mutex::new(None),
            subs: Mutex::new(HashMap::new()),
            next_sub: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deep copy of the run, buffers included.
    pub fn snapshot(&self) -> Run {
        self.run.lock().expect("run lock poisoned").clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Run)) {
        let mut run = self.run.lock().expect("run lock poisoned");
        f(&mut run);
    }

    pub fn append_stdout(&self, chunk: &[u8]) {
        let mut run = self.run.lock().expect("run lock poisoned");
        run.stdout.extend_from_slice(chunk);
    }

    pub fn append_stderr(&self, chunk: &[u8]) {
        let mut run = self.run.lock().expect("run lock poisoned");
        run.stderr.extend_from_slice(chunk);
    }

    /// Register a subscriber. The returned channel closes when `token`
    /// completes; a watcher task removes the subscriber at that point.
    pub fn subscribe(self: &Arc<Self>, token: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let sub_id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.subs
            .lock()
            .expect("subscriber lock poisoned")
            .insert(sub_id, tx);

        let entry = Arc::clone(self);
        tokio::spawn(async move {
            token.cancelled().await;
            entry
                .subs
                .lock()
                .expect("subscriber lock poisoned")
                .remove(&sub_id);
        });

        rx
    }

    /// Fan the event out to every subscriber. A subscriber with a full
    /// buffer misses this event; publishing never blocks.
    pub fn publish(&self, event: Event) {
        let subs = self.subs.lock().expect("subscriber lock poisoned");
        for tx in subs.values() {
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn set_cancel(&self, token: Option<CancellationToken>) {
        let mut cancel = self.cancel.lock().expect("cancel lock poisoned");
        *cancel = token;
    }

    /// Trigger the run's cancellation handle. Returns false when no
    /// handle is installed (run not started yet, or already done).
    pub fn cancel(&self) -> bool {
        let token = self
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .clone();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Process-wide mapping of run id to entry. Ids are `run_` plus a
/// monotonic ULID, so ids sort by creation time.
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunEntry>>>,
    ids: Mutex<Generator>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            ids: Mutex::new(Generator::new()),
        }
    }

    pub fn create(&self) -> Arc<RunEntry> {
        let id = self.mint_id();
        let entry = Arc::new(RunEntry::new(id.clone()));
        self.runs
            .write()
            .expect("registry lock poisoned")
            .insert(id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.runs
            .read()
            .expect("registry lock poisoned")
            .get(run_id)
            .cloned()
    }

    fn mint_id(&self) -> String {
        let mut ids = self.ids.lock().expect("id generator lock poisoned");
        // The generator only errs when the random tail overflows within
        // one millisecond; fall back to a fresh ULID in that case.
        let id = ids.generate().unwrap_or_else(|_| Ulid::new());
        format!("run_{id}")
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

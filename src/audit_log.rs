//! Append-only CSV record of a run.
//!
//! Producers enqueue entries on a bounded channel and a dedicated writer
//! thread owns the file. A full queue blocks the producer for at most the
//! close timeout; entries that still do not fit are counted and dropped.

use chrono::Local;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const SESSION_START: &str = "SESSION_START";
pub const SESSION_END: &str = "SESSION_END";
pub const ROW_START: &str = "ROW_START";
pub const ROW_COMPLETE: &str = "ROW_COMPLETE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Start,
    Success,
    Failed,
    Error,
    Info,
}

/// One CSV row. `None` fields are written as blank cells.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub elapsed_ms: Option<u64>,
    pub row_index: Option<usize>,
    pub row_data: Option<String>,
    pub step_index: Option<usize>,
    pub step_name: String,
    pub step_type: Option<String>,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub details: Option<String>,
}

impl AuditEntry {
    fn new(step_name: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            elapsed_ms: None,
            row_index: None,
            row_data: None,
            step_index: None,
            step_name: step_name.into(),
            step_type: None,
            status,
            error_message: None,
            duration_ms: None,
            details: None,
        }
    }
}

/// Outcome of a single step as reported by the executor.
#[derive(Clone, Debug)]
pub struct StepRecord<'a> {
    pub row_index: Option<usize>,
    pub step_index: usize,
    pub step_name: &'a str,
    pub step_type: &'a str,
    pub success: bool,
    pub error: Option<&'a str>,
    pub duration: Duration,
    pub details: Option<String>,
}

enum Message {
    Entry(Box<AuditEntry>),
    Flush(Sender<()>),
    Shutdown,
}

/// Creates sessions in a log directory.
#[derive(Clone, Debug)]
pub struct AuditLog {
    dir: PathBuf,
    capacity: usize,
    close_timeout: Duration,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize, close_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            capacity: capacity.max(1),
            close_timeout,
        }
    }

    /// Opens `execution_<name>_<timestamp>.csv` and writes the `SESSION_START` row.
    pub fn start_session(&self, name: &str, source_id: &str) -> io::Result<AuditSession> {
        std::fs::create_dir_all(&self.dir)?;
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let path = self.dir.join(format!("execution_{}_{}.csv", safe, stamp));
        let file = File::create(&path)?;

        let (tx, rx) = bounded::<Message>(self.capacity);
        let (done_tx, done_rx) = bounded::<()>(1);
        let writer = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || write_loop(file, rx, done_tx))?;

        let handle = AuditHandle {
            tx,
            session_start: Instant::now(),
            flush_timeout: self.close_timeout,
            dropped: Arc::default(),
        };
        let mut start = AuditEntry::new(SESSION_START, AuditStatus::Info);
        start.elapsed_ms = Some(0);
        start.details = Some(format!("macro: {}; source: {}", name, source_id));
        handle.push(start);
        log::info!("Audit log: {}", path.display());

        Ok(AuditSession {
            path,
            handle,
            writer: Some(writer),
            done: done_rx,
            close_timeout: self.close_timeout,
        })
    }
}

fn write_loop(file: File, rx: Receiver<Message>, done: Sender<()>) {
    let mut writer = csv::Writer::from_writer(file);
    for message in rx.iter() {
        match message {
            Message::Entry(entry) => {
                if let Err(e) = writer.serialize(&*entry) {
                    log::error!("Audit log write failed: {}", e);
                }
            }
            Message::Flush(ack) => {
                if let Err(e) = writer.flush() {
                    log::error!("Audit log flush failed: {}", e);
                }
                let _ = ack.send(());
            }
            Message::Shutdown => break,
        }
    }
    if let Err(e) = writer.flush() {
        log::error!("Audit log flush failed: {}", e);
    }
    let _ = done.send(());
}

/// Producer side of a session; cheap to clone.
#[derive(Clone)]
pub struct AuditHandle {
    tx: Sender<Message>,
    session_start: Instant,
    flush_timeout: Duration,
    dropped: Arc<AtomicUsize>,
}

impl AuditHandle {
    fn push(&self, mut entry: AuditEntry) {
        if entry.elapsed_ms.is_none() {
            entry.elapsed_ms = Some(self.session_start.elapsed().as_millis() as u64);
        }
        let message = Message::Entry(Box::new(entry));
        match self.tx.send_timeout(message, self.flush_timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Disconnected(_)) => {
                log::debug!("Audit entry dropped: session already closed");
            }
            Err(SendTimeoutError::Timeout(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                log::warn!(
                    "Audit queue full for {:?}; entry dropped ({} so far)",
                    self.flush_timeout,
                    total
                );
            }
        }
    }

    /// Entries dropped because the writer could not keep up.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn log_row_start(&self, row_index: usize, row_data: &HashMap<String, String>) {
        let mut entry = AuditEntry::new(ROW_START, AuditStatus::Start);
        entry.row_index = Some(row_index);
        let sorted: BTreeMap<_, _> = row_data.iter().collect();
        entry.row_data = serde_json::to_string(&sorted).ok();
        self.push(entry);
    }

    pub fn log_step_execution(&self, record: StepRecord<'_>) {
        let status = if record.success {
            AuditStatus::Success
        } else {
            AuditStatus::Failed
        };
        let mut entry = AuditEntry::new(record.step_name, status);
        entry.row_index = record.row_index;
        entry.step_index = Some(record.step_index);
        entry.step_type = Some(record.step_type.to_string());
        entry.error_message = record.error.map(str::to_string);
        entry.duration_ms = Some(record.duration.as_millis() as u64);
        entry.details = record.details;
        self.push(entry);
    }

    pub fn log_row_complete(
        &self,
        row_index: usize,
        success: bool,
        duration: Duration,
        error: Option<&str>,
    ) {
        let status = if success {
            AuditStatus::Success
        } else {
            AuditStatus::Failed
        };
        let mut entry = AuditEntry::new(ROW_COMPLETE, status);
        entry.row_index = Some(row_index);
        entry.duration_ms = Some(duration.as_millis() as u64);
        entry.error_message = error.map(str::to_string);
        self.push(entry);
    }

    pub fn log_session_end(&self, total: usize, succeeded: usize, failed: usize) {
        let rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 * 100.0 / total as f64
        };
        let mut entry = AuditEntry::new(SESSION_END, AuditStatus::Info);
        entry.duration_ms = Some(self.session_start.elapsed().as_millis() as u64);
        entry.details = Some(format!(
            "total: {}, succeeded: {}, failed: {}, success rate: {:.1}%",
            total, succeeded, failed, rate
        ));
        self.push(entry);
    }

    pub fn log_error(&self, kind: &str, message: &str, details: Option<String>) {
        let mut entry = AuditEntry::new(kind, AuditStatus::Error);
        entry.error_message = Some(message.to_string());
        entry.details = details;
        self.push(entry);
    }

    /// Blocks until every entry queued before this call is written.
    pub fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Message::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(self.flush_timeout).is_ok()
    }
}

/// Owns the writer thread. Closing (or dropping) the session stops it.
pub struct AuditSession {
    path: PathBuf,
    handle: AuditHandle,
    writer: Option<JoinHandle<()>>,
    done: Receiver<()>,
    close_timeout: Duration,
}

impl AuditSession {
    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueues the shutdown sentinel and waits for the writer to flush.
    ///
    /// Returns `false` if the writer did not finish within the close timeout;
    /// the thread is then left to finish on its own.
    pub fn close(&mut self) -> bool {
        let Some(writer) = self.writer.take() else {
            return true;
        };
        if self
            .handle
            .tx
            .send_timeout(Message::Shutdown, self.close_timeout)
            .is_err()
        {
            log::warn!("Audit log queue stuck; could not enqueue shutdown");
            return false;
        }
        match self.done.recv_timeout(self.close_timeout) {
            Ok(()) => {
                let _ = writer.join();
                true
            }
            Err(_) => {
                log::warn!(
                    "Audit writer did not finish within {:?}; detaching",
                    self.close_timeout
                );
                false
            }
        }
    }
}

impl Drop for AuditSession {
    fn drop(&mut self) {
        self.close();
    }
}

//! In-memory ring of recent [`LogEntry`]s mirrored to a global log file and
//! per-task log files.
//!
//! Line format:
//!
//! ```text
//! 2024-05-01 13:37:00 [INFO ] #12 demo [planner]: message text
//! ```

use crate::fsutil::write_atomic;
use crate::types::{LogEntry, LogLevel, TaskId};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Smallest ring the daemon accepts.
pub const MIN_CAPACITY: usize = 100;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const GLOBAL_LOG: &str = "autopilot.log";

struct Inner {
    buf: VecDeque<LogEntry>,
    global: Option<File>,
}

pub struct LogRing {
    capacity: usize,
    dir: Option<PathBuf>,
    debug: AtomicBool,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub lines_dropped: usize,
    pub files_removed: usize,
}

impl LogRing {
    /// Ring backed by `dir/autopilot.log` and `dir/task-<id>.log`.
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self::build(Some(dir.into()), capacity)
    }

    /// Ring without any file output.
    pub fn in_memory(capacity: usize) -> Self {
        Self::build(None, capacity)
    }

    fn build(dir: Option<PathBuf>, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            capacity,
            dir,
            debug: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                global: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.store(on, Ordering::Relaxed);
    }

    pub fn global_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(GLOBAL_LOG))
    }

    pub fn task_path(&self, id: TaskId) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("task-{id}.log")))
    }

    /// Shorthand for building and adding an entry.
    pub fn log(&self, task_id: TaskId, project: &str, level: LogLevel, message: impl Into<String>) {
        self.add(LogEntry::new(task_id, project, level, message));
    }

    pub fn add(&self, entry: LogEntry) {
        if entry.level == LogLevel::Debug && !self.debug.load(Ordering::Relaxed) {
            return;
        }
        trace_entry(&entry);

        let line = format_line(&entry);
        let mut inner = self.acquire();
        if inner.buf.len() == self.capacity {
            inner.buf.pop_front();
        }
        let task_id = entry.task_id;
        inner.buf.push_back(entry);

        if let Err(e) = self.append_global(&mut inner, &line) {
            warn!(error = %e, "failed to write global log");
            inner.global = None;
        }
        if task_id > 0 {
            if let Some(path) = self.task_path(task_id) {
                if let Err(e) = append_line(&path, &line) {
                    warn!(task_id, error = %e, "failed to write task log");
                }
            }
        }
    }

    /// Buffered entries, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.acquire().buf.iter().cloned().collect()
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let inner = self.acquire();
        let skip = inner.buf.len().saturating_sub(n);
        inner.buf.iter().skip(skip).cloned().collect()
    }

    /// Lines for one task: the per-task file when present, otherwise the
    /// matching lines of the global file.
    pub fn read_task_log(&self, id: TaskId) -> io::Result<Vec<String>> {
        if let Some(path) = self.task_path(id) {
            match std::fs::read_to_string(&path) {
                Ok(text) => return Ok(text.lines().map(str::to_string).collect()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        let Some(global) = self.global_path() else {
            return Ok(Vec::new());
        };
        let text = match std::fs::read_to_string(&global) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(text
            .lines()
            .filter(|l| parse_line(l).is_some_and(|e| e.task_id == id))
            .map(str::to_string)
            .collect())
    }

    /// Load the last `n` parseable lines of the global file into the ring.
    /// Returns how many entries were restored.
    pub fn restore(&self, n: usize) -> io::Result<usize> {
        let Some(global) = self.global_path() else {
            return Ok(0);
        };
        let text = match std::fs::read_to_string(&global) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let n = n.min(self.capacity);
        let mut entries: Vec<LogEntry> = text.lines().rev().filter_map(parse_line).take(n).collect();
        entries.reverse();

        let mut inner = self.acquire();
        let restored = entries.len();
        let mut merged: VecDeque<LogEntry> = entries.into();
        merged.extend(inner.buf.drain(..));
        while merged.len() > self.capacity {
            merged.pop_front();
        }
        inner.buf = merged;
        Ok(restored)
    }

    /// Drop global log lines and per-task files older than `days`.
    pub fn prune(&self, days: u32) -> io::Result<PruneStats> {
        let Some(dir) = self.dir.clone() else {
            return Ok(PruneStats::default());
        };
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut stats = PruneStats::default();

        let mut inner = self.acquire();
        let global = dir.join(GLOBAL_LOG);
        if let Ok(text) = std::fs::read_to_string(&global) {
            let mut kept = String::with_capacity(text.len());
            for line in text.lines() {
                match parse_line(line) {
                    Some(entry) if entry.time < cutoff => stats.lines_dropped += 1,
                    _ => {
                        kept.push_str(line);
                        kept.push('\n');
                    }
                }
            }
            if stats.lines_dropped > 0 {
                inner.global = None;
                write_atomic(&global, kept.as_bytes())?;
            }
        }
        drop(inner);

        let max_age = Duration::from_secs(u64::from(days) * 24 * 60 * 60);
        for entry in std::fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !is_task_log(&path) {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if expired {
                std::fs::remove_file(&path)?;
                stats.files_removed += 1;
            }
        }
        debug!(?stats, "log retention pass complete");
        Ok(stats)
    }

    fn append_global(&self, inner: &mut Inner, line: &str) -> io::Result<()> {
        let Some(path) = self.global_path() else {
            return Ok(());
        };
        if inner.global.is_none() {
            inner.global = Some(open_append(&path)?);
        }
        match inner.global.as_mut() {
            Some(file) => writeln!(file, "{line}"),
            None => Ok(()),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_task_log(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("task-") && n.ends_with(".log"))
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = open_append(path)?;
    writeln!(file, "{line}")
}

fn trace_entry(entry: &LogEntry) {
    let task_id = entry.task_id;
    let project = entry.project.as_str();
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Debug => debug!(task_id, project, "{message}"),
        LogLevel::Info => info!(task_id, project, "{message}"),
        LogLevel::Success => info!(task_id, project, outcome = "success", "{message}"),
        LogLevel::Warn => warn!(task_id, project, "{message}"),
        LogLevel::Error => error!(task_id, project, "{message}"),
    }
}

// ---------------------------------------------------------------------------
// Line format
// ---------------------------------------------------------------------------

pub fn format_line(entry: &LogEntry) -> String {
    let time = entry.time.with_timezone(&Local).format(TIME_FORMAT);
    let message = entry.message.replace(['\r', '\n'], " ");
    match &entry.agent {
        Some(agent) => format!(
            "{time} [{}] #{} {} [{agent}]: {message}",
            entry.level.tag(),
            entry.task_id,
            entry.project
        ),
        None => format!(
            "{time} [{}] #{} {}: {message}",
            entry.level.tag(),
            entry.task_id,
            entry.project
        ),
    }
}

/// Inverse of [`format_line`]; `None` for lines in any other shape.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let stamp = line.get(..19)?;
    let naive = NaiveDateTime::parse_from_str(stamp, TIME_FORMAT).ok()?;
    let time: DateTime<Utc> = Local
        .from_local_datetime(&naive)
        .earliest()?
        .with_timezone(&Utc);

    let rest = line.get(19..)?.strip_prefix(" [")?;
    let tag = rest.get(..5)?;
    let level = LogLevel::from_tag(tag)?;
    let rest = rest.get(5..)?.strip_prefix("] #")?;

    let (id, rest) = rest.split_once(' ')?;
    let task_id = id.parse().ok()?;
    let (head, message) = rest.split_once(": ").or_else(|| {
        rest.strip_suffix(':').map(|head| (head, ""))
    })?;

    let (project, agent) = match head.strip_suffix(']').and_then(|h| h.rsplit_once(" [")) {
        Some((project, agent)) => (project, Some(agent.to_string())),
        None => (head, None),
    };

    Some(LogEntry {
        time,
        task_id,
        project: project.to_string(),
        message: message.to_string(),
        level,
        agent,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_chronological() {
        let ring = LogRing::in_memory(100);
        for i in 0..150 {
            ring.log(1, "demo", LogLevel::Info, format!("line {i}"));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 100);
        assert_eq!(snap.first().unwrap().message, "line 50");
        assert_eq!(snap.last().unwrap().message, "line 149");
        assert_eq!(ring.recent(2)[0].message, "line 148");
    }

    #[test]
    fn capacity_has_a_floor() {
        assert_eq!(LogRing::in_memory(10).capacity(), MIN_CAPACITY);
    }

    #[test]
    fn debug_entries_need_the_debug_flag() {
        let ring = LogRing::in_memory(100);
        ring.log(0, "sys", LogLevel::Debug, "hidden");
        assert!(ring.snapshot().is_empty());
        ring.set_debug(true);
        ring.log(0, "sys", LogLevel::Debug, "shown");
        assert_eq!(ring.snapshot().len(), 1);
    }

    #[test]
    fn line_format_parses_back() {
        let entry = LogEntry::new(12, "demo", LogLevel::Warn, "denied\nEdit").with_agent("executor");
        let line = format_line(&entry);
        assert!(line.contains("[WARN ] #12 demo [executor]: denied Edit"), "{line}");

        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.task_id, 12);
        assert_eq!(parsed.project, "demo");
        assert_eq!(parsed.agent.as_deref(), Some("executor"));
        assert_eq!(parsed.level, LogLevel::Warn);
        assert_eq!(parsed.message, "denied Edit");
        assert_eq!(parsed.time.timestamp(), entry.time.timestamp());
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(parse_line("").is_none());
        assert!(parse_line("hello world").is_none());
        assert!(parse_line("2024-01-01 00:00:00 [NOPE ] #1 x: y").is_none());
    }

    #[test]
    fn per_task_file_and_global_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let ring = LogRing::new(dir.path(), 100);
        ring.log(3, "demo", LogLevel::Info, "for three");
        ring.log(4, "demo", LogLevel::Info, "for four");
        ring.log(0, "demo", LogLevel::Info, "system");

        assert_eq!(ring.read_task_log(3).unwrap().len(), 1);

        std::fs::remove_file(ring.task_path(4).unwrap()).unwrap();
        let lines = ring.read_task_log(4).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("for four"));
        assert!(!dir.path().join("task-0.log").exists());
    }

    #[test]
    fn restore_reloads_recent_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ring = LogRing::new(dir.path(), 100);
            for i in 0..5 {
                ring.log(1, "demo", LogLevel::Info, format!("old {i}"));
            }
        }
        let ring = LogRing::new(dir.path(), 100);
        assert_eq!(ring.restore(3).unwrap(), 3);
        let snap = ring.snapshot();
        assert_eq!(snap[0].message, "old 2");
        assert_eq!(snap[2].message, "old 4");
    }

    #[test]
    fn prune_drops_old_global_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ring = LogRing::new(dir.path(), 100);
        let mut old = LogEntry::new(1, "demo", LogLevel::Info, "ancient");
        old.time = Utc::now() - chrono::Duration::days(30);
        ring.add(old);
        ring.log(1, "demo", LogLevel::Info, "fresh");

        let stats = ring.prune(7).unwrap();
        assert_eq!(stats.lines_dropped, 1);
        let text = std::fs::read_to_string(ring.global_path().unwrap()).unwrap();
        assert!(!text.contains("ancient"));
        assert!(text.contains("fresh"));

        ring.log(1, "demo", LogLevel::Info, "after prune");
        let text = std::fs::read_to_string(ring.global_path().unwrap()).unwrap();
        assert!(text.contains("after prune"));
    }
}

//! Token usage scanned from the agent's session transcripts
//! (`<claude_dir>/projects/**/*.jsonl`).
//!
//! Per-file results are cached by `(mtime, len)`, so a refresh only re-reads
//! transcripts that changed.

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

/// Context window assumed when reporting session usage.
pub const CONTEXT_WINDOW: u64 = 200_000;
const SCAN_DAYS: i64 = 31;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost_usd: f64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }

    fn add(&mut self, other: &TokenTotals) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub today: TokenTotals,
    pub week: TokenTotals,
    pub month: TokenTotals,
}

/// Context usage of the most recently active session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub context_tokens: u64,
    pub context_percent: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Transcript records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Record {
    #[serde(rename = "type", default)]
    kind: String,
    timestamp: Option<DateTime<Utc>>,
    message: Option<RecordMessage>,
}

#[derive(Debug, Deserialize)]
struct RecordMessage {
    id: Option<String>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// USD per million tokens: input, output, cache write, cache read.
fn price(model: &str) -> (f64, f64, f64, f64) {
    let model = model.to_ascii_lowercase();
    if model.contains("opus") {
        (15.0, 75.0, 18.75, 1.5)
    } else if model.contains("haiku") {
        (0.8, 4.0, 1.0, 0.08)
    } else {
        (3.0, 15.0, 3.75, 0.3)
    }
}

impl Usage {
    fn totals(&self, model: &str) -> TokenTotals {
        let (pi, po, pw, pr) = price(model);
        let cost = (self.input_tokens as f64 * pi
            + self.output_tokens as f64 * po
            + self.cache_creation_input_tokens as f64 * pw
            + self.cache_read_input_tokens as f64 * pr)
            / 1_000_000.0;
        TokenTotals {
            input: self.input_tokens,
            output: self.output_tokens,
            cache_read: self.cache_read_input_tokens,
            cache_write: self.cache_creation_input_tokens,
            cost_usd: cost,
        }
    }

    fn context(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Clone, Default)]
struct FileUsage {
    days: BTreeMap<NaiveDate, TokenTotals>,
    last: Option<SessionContext>,
}

fn parse_transcript(text: &str, session_id: &str) -> FileUsage {
    let mut usage = FileUsage::default();
    let mut seen: HashSet<String> = HashSet::new();

    for line in text.lines() {
        let Ok(record) = serde_json::from_str::<Record>(line) else {
            continue;
        };
        if record.kind != "assistant" {
            continue;
        }
        let (Some(ts), Some(message)) = (record.timestamp, record.message) else {
            continue;
        };
        let Some(u) = message.usage else {
            continue;
        };
        if let Some(id) = &message.id {
            if !seen.insert(id.clone()) {
                continue;
            }
        }
        let model = message.model.unwrap_or_default();
        let day = ts.with_timezone(&Local).date_naive();
        usage.days.entry(day).or_default().add(&u.totals(&model));

        let context_tokens = u.context();
        usage.last = Some(SessionContext {
            session_id: Some(session_id.to_string()),
            model: (!model.is_empty()).then_some(model),
            context_tokens,
            context_percent: context_tokens as f64 * 100.0 / CONTEXT_WINDOW as f64,
            updated_at: Some(ts),
        });
    }
    usage
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

struct CachedFile {
    modified: SystemTime,
    len: u64,
    usage: FileUsage,
}

pub struct MetricsScanner {
    claude_dir: PathBuf,
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
}

impl MetricsScanner {
    pub fn new(claude_dir: impl Into<PathBuf>) -> Self {
        Self {
            claude_dir: claude_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn scan(&self) -> (UsageMetrics, SessionContext) {
        self.scan_at(Local::now().date_naive())
    }

    fn scan_at(&self, today: NaiveDate) -> (UsageMetrics, SessionContext) {
        let files = transcript_files(&self.claude_dir.join("projects"));
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|path, _| files.iter().any(|(p, _)| p == path));

        let horizon = SystemTime::now() - std::time::Duration::from_secs(SCAN_DAYS as u64 * 86_400);
        for (path, meta) in &files {
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < horizon {
                cache.remove(path);
                continue;
            }
            let fresh = cache
                .get(path)
                .is_some_and(|c| c.modified == modified && c.len == meta.len());
            if fresh {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            let session_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            cache.insert(
                path.clone(),
                CachedFile {
                    modified,
                    len: meta.len(),
                    usage: parse_transcript(&text, &session_id),
                },
            );
        }

        let week_start = today - Duration::days(6);
        let month_start = today - Duration::days(29);
        let mut metrics = UsageMetrics::default();
        let mut latest: Option<(SystemTime, SessionContext)> = None;

        for cached in cache.values() {
            for (day, totals) in &cached.usage.days {
                if *day == today {
                    metrics.today.add(totals);
                }
                if *day >= week_start && *day <= today {
                    metrics.week.add(totals);
                }
                if *day >= month_start && *day <= today {
                    metrics.month.add(totals);
                }
            }
            if let Some(ctx) = &cached.usage.last {
                if latest.as_ref().is_none_or(|(m, _)| cached.modified > *m) {
                    latest = Some((cached.modified, ctx.clone()));
                }
            }
        }
        debug!(files = cache.len(), "session metrics scanned");
        (metrics, latest.map(|(_, c)| c).unwrap_or_default())
    }
}

fn transcript_files(dir: &Path) -> Vec<(PathBuf, std::fs::Metadata)> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                out.push((path, meta));
            }
        }
    }
    out
}

//! Structured logging for the ledger executor.
//!
//! Every record is a single JSON object on stdout. When `LOG_DIR` is set the
//! same lines are also appended to `<LOG_DIR>/<run_id>/events.jsonl`
//! (info and above) and `trace.jsonl` (trace/debug), so a run can be replayed
//! or grepped after the fact.
//!
//! Filtering:
//! - `LOG_LEVEL` sets the minimum level (default `info`)
//! - `LOG_DOMAINS` is `all` or a comma separated list of domains

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Monitor,   // Poll rounds, cursor, dedup
    Scheduler, // Schedule lifecycle
    Builder,   // Envelope construction
    Exec,      // Submission and finality
    Policy,    // Routing and gating decisions
    Analytics, // Outbound sink
    Ledger,    // Transport to the access node
    System,    // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Monitor => "monitor",
            Domain::Scheduler => "scheduler",
            Domain::Builder => "builder",
            Domain::Exec => "exec",
            Domain::Policy => "policy",
            Domain::Analytics => "analytics",
            Domain::Ledger => "ledger",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));

        let (events, trace) = match std::env::var("LOG_DIR") {
            Ok(base) => {
                let mut run_dir = PathBuf::from(base);
                run_dir.push(&run_id);
                match create_dir_all(&run_dir) {
                    Ok(()) => (
                        open_sink(run_dir.join("events.jsonl")),
                        open_sink(run_dir.join("trace.jsonl")),
                    ),
                    Err(err) => {
                        eprintln!("[log] failed to create run dir: {}", err);
                        (None, None)
                    }
                }
            }
            Err(_) => (None, None),
        };

        RunContext { run_id, events, trace }
    })
}

/// Identifier shared by every line this process writes.
pub fn run_id() -> String {
    ensure_run_context().run_id.clone()
}

const REDACTED_KEYS: [&str; 5] = [
    "authorization",
    "signature",
    "relay_secret",
    "private_key",
    "api_key",
];

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in REDACTED_KEYS {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["tx_id", "schedule_id", "event_kind", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

pub fn trace(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Trace, domain, event, fields);
}

pub fn debug(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Debug, domain, event, fields);
}

pub fn info(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Info, domain, event, fields);
}

pub fn warn(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Warn, domain, event, fields);
}

pub fn error(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Error, domain, event, fields);
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_poll_round(from: u64, to: u64, fetched: usize, emitted: usize, failed_queries: usize) {
    log(
        Level::Debug,
        Domain::Monitor,
        "poll_round",
        obj(&[
            ("from_height", v_u64(from)),
            ("to_height", v_u64(to)),
            ("fetched", v_u64(fetched as u64)),
            ("emitted", v_u64(emitted as u64)),
            ("failed_queries", v_u64(failed_queries as u64)),
        ]),
    );
}

pub fn log_schedule_transition(schedule_id: &str, action: &str, prev: &str, next: &str) {
    log(
        Level::Info,
        Domain::Scheduler,
        "schedule_state",
        obj(&[
            ("schedule_id", v_str(schedule_id)),
            ("action", v_str(action)),
            ("prev_state", v_str(prev)),
            ("new_state", v_str(next)),
        ]),
    );
}

pub fn log_submission(name: &str, fingerprint: &str, tx_id: Option<&str>, status: &str, success: bool) {
    log(
        if success { Level::Info } else { Level::Warn },
        Domain::Exec,
        "submission",
        obj(&[
            ("action", v_str(name)),
            ("fingerprint", v_str(fingerprint)),
            ("tx_id", tx_id.map(v_str).unwrap_or(Value::Null)),
            ("status", v_str(status)),
            ("success", Value::Bool(success)),
        ]),
    );
}

pub fn log_decision(event_kind: &str, decision: &str, reason: &str, confidence: f64, threshold: f64) {
    log(
        Level::Info,
        Domain::Policy,
        "decision",
        obj(&[
            ("event_kind", v_str(event_kind)),
            ("decision", v_str(decision)),
            ("reason", v_str(reason)),
            ("confidence", v_num(confidence)),
            ("threshold", v_num(threshold)),
        ]),
    );
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_u64(n: u64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_secrets_are_redacted() {
        let m = sanitize_fields(obj(&[
            ("relay_secret", v_str("hunter2")),
            ("tx_id", v_str("abc")),
        ]));
        assert_eq!(m.get("relay_secret").unwrap(), "[REDACTED]");
        assert_eq!(m.get("tx_id").unwrap(), "abc");
    }

    #[test]
    fn test_split_lifts_correlation_keys() {
        let (top, data) = split_fields(obj(&[
            ("schedule_id", v_str("schedule_1")),
            ("delay", v_u64(5)),
        ]));
        assert!(top.contains_key("schedule_id"));
        assert!(data.contains_key("delay"));
        assert!(!data.contains_key("schedule_id"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}

use arbor_broker::{Attributes, Value};
use serde::Serialize;
use std::io::Write;

pub use arbor_broker::types::now_ms;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

/// Attributes as a flat JSON object.
pub fn attributes_json(attrs: &Attributes) -> serde_json::Value {
    let map = attrs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::Str(s) => serde_json::Value::from(s.as_str()),
                Value::Int(i) => serde_json::Value::from(*i),
                Value::Bool(b) => serde_json::Value::from(*b),
            };
            (k.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub id: String,
    pub mode: &'static str,
    pub url: Option<String>,
    pub ts: u64,
}

impl EventStarted {
    pub fn new(id: &str, mode: &'static str, url: Option<String>) -> Self {
        Self {
            event: "started",
            id: id.to_string(),
            mode,
            url,
            ts: now_ms(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStopped {
    pub event: &'static str,
    pub id: String,
    pub elapsed_s: f64,
}

// ── Neighborhood events ─────────────────────────────────────────

#[derive(Serialize)]
pub struct EventNeighbor {
    pub event: &'static str,
    pub neighbor: String,
    pub broker: bool,
    pub reconfiguration: Option<String>,
    pub ts: u64,
}

// ── Client events ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSubscribed {
    pub event: &'static str,
    pub broker: String,
    pub filter: String,
}

#[derive(Serialize)]
pub struct EventMessage {
    pub event: &'static str,
    pub id: String,
    pub origin: Option<String>,
    pub repliable: bool,
    pub content: serde_json::Value,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct EventPublished {
    pub event: &'static str,
    pub id: String,
    pub repliable: bool,
    pub content: serde_json::Value,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct EventReplies {
    pub event: &'static str,
    pub id: String,
    pub complete: bool,
    pub replies: Vec<serde_json::Value>,
    pub elapsed_ms: f64,
}

//! Directory-backed message bus.
//!
//! A topic is a directory under the run dir; every publish is one JSON file
//! named `<nanos>-<uuid>.json`, written to a temp name first and renamed into
//! place so readers never see a partial record.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{Error, Result};

/// A worker finished a task attempt.
pub const TASK_RESULT: &str = "task_result";
/// The orchestrator merged (or failed to merge) a task.
pub const MERGE_RESULT: &str = "merge_result";
/// Summary of the previous wave, read by the next wave's workers.
pub const BOARD: &str = "board";

/// Sender name used by the orchestrator.
pub const ORCHESTRATOR: &str = "orchestrator";

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Topic name for a 1-based wave index.
pub fn wave_topic(wave: usize) -> String {
    format!("wave-{}", wave)
}

/// Sender name for a task worker.
pub fn task_sender(id: crate::core::TaskId) -> String {
    format!("task-{}", id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    pub topic: String,
    #[serde(serialize_with = "encode_payload", deserialize_with = "decode_payload")]
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(kind: &str, sender: &str, topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.to_string(),
            sender: sender.to_string(),
            topic: topic.to_string(),
            payload: payload.into(),
            published_at: Utc::now(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn encode_payload<S: Serializer>(payload: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

fn decode_payload<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    STANDARD.decode(text).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone)]
pub struct MessageBus {
    root: PathBuf,
}

impl MessageBus {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> Result<PathBuf> {
        let mut components = Path::new(topic).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name.to_str() == Some(topic) => {
                Ok(self.root.join(topic))
            }
            _ => Err(Error::InvalidTopic(topic.to_string())),
        }
    }

    /// Publish `message` to `topic`. Returns the record's path.
    pub fn publish(&self, topic: &str, message: &BusMessage) -> Result<PathBuf> {
        let dir = self.topic_dir(topic)?;
        fs::create_dir_all(&dir)?;

        let name = format!("{:020}-{}.json", next_stamp(), Uuid::new_v4());
        let path = dir.join(&name);
        let temp_path = dir.join(format!(".{}.tmp", name));
        fs::write(&temp_path, serde_json::to_vec(message)?)?;
        fs::rename(&temp_path, &path)?;

        tracing::debug!(topic, kind = %message.kind, sender = %message.sender, "published");
        Ok(path)
    }

    /// Delete a topic and all its records.
    pub fn remove_topic(&self, topic: &str) -> Result<()> {
        let dir = self.topic_dir(topic)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// The last `limit` messages of `topic`, in publish order.
    pub fn read(&self, topic: &str, limit: usize) -> Result<Vec<BusMessage>> {
        let dir = self.topic_dir(topic)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".json") && !name.starts_with('.'))
            .collect();
        names.sort();

        let start = names.len().saturating_sub(limit);
        names[start..]
            .iter()
            .map(|name| {
                let contents = fs::read(dir.join(name))?;
                Ok(serde_json::from_slice(&contents)?)
            })
            .collect()
    }
}

/// Nanosecond timestamp, strictly increasing within the process.
fn next_stamp() -> u64 {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or_default();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Compact text summary of a finished wave for the next wave's prompts.
pub fn format_board(wave: usize, messages: &[BusMessage]) -> String {
    let mut lines = vec![format!("Results of wave {}:", wave)];
    for message in messages.iter().filter(|m| m.kind != BOARD) {
        let text = message.payload_text();
        let first = text.lines().next().unwrap_or_default().trim();
        if !first.is_empty() {
            lines.push(format!("- [{}] {}", message.kind, first));
        }
    }
    if lines.len() == 1 {
        lines.push("- no results recorded".to_string());
    }
    lines.join("\n")
}

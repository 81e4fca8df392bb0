//! Plan document parsing.
//!
//! Two syntaxes are accepted. Markdown plans use one heading per task:
//!
//! ```text
//! ## Task 3: Wire the CLI
//! depends: [1, 2]
//! files: [src/main.rs]
//!
//! Free-text instructions for the agent.
//! ```
//!
//! TOML plans use `[[task]]` tables with `id`, `title`, `depends`, `files`
//! and `body` keys.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::{Task, TaskId};
use crate::{Error, Result};

/// `## Task <id>: <title>` at any heading level.
static TASK_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s{0,3}#{1,6}\s*task\s+(\d+)\s*(?:[:\-]\s*(.*?))?\s*#*\s*$").unwrap()
});

/// `depends: ...` / `files: ...`, optionally as a list bullet.
static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?(depends|dependencies|files)\s*:\s*(.*?)\s*$").unwrap()
});

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s{0,3}(```|~~~)").unwrap());

/// Supported plan syntaxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Markdown,
    Toml,
}

impl PlanFormat {
    /// `.toml` selects TOML; anything else is Markdown.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => PlanFormat::Toml,
            _ => PlanFormat::Markdown,
        }
    }
}

/// Read and parse a plan file.
pub fn parse_file(path: &Path) -> Result<Vec<Task>> {
    let text = std::fs::read_to_string(path)?;
    parse_str(&text, PlanFormat::from_path(path))
}

pub fn parse_str(text: &str, format: PlanFormat) -> Result<Vec<Task>> {
    let tasks = match format {
        PlanFormat::Markdown => parse_markdown(text)?,
        PlanFormat::Toml => parse_toml(text)?,
    };
    validate(&tasks)?;
    Ok(tasks)
}

#[derive(Debug)]
struct Draft {
    id: TaskId,
    title: String,
    depends: Vec<TaskId>,
    files: Vec<PathBuf>,
    body: Vec<String>,
    in_metadata: bool,
}

impl Draft {
    fn finish(self) -> Task {
        Task::new(self.id, &self.title, self.body.join("\n").trim())
            .with_dependencies(self.depends)
            .with_files(self.files)
    }
}

/// Parse a Markdown plan. Text before the first task heading is ignored.
pub fn parse_markdown(text: &str) -> Result<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut current: Option<Draft> = None;
    let mut in_fence = false;

    for (lineno, line) in text.lines().enumerate() {
        let lineno = lineno + 1;

        if FENCE_RE.is_match(line) {
            in_fence = !in_fence;
        }

        if !in_fence {
            if let Some(caps) = TASK_HEADING_RE.captures(line) {
                if let Some(done) = current.take() {
                    tasks.push(done.finish());
                }
                let id = parse_id(&caps[1])
                    .map_err(|e| Error::MalformedPlan(format!("line {}: {}", lineno, e)))?;
                let title = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                current = Some(Draft {
                    id,
                    title: title.to_string(),
                    depends: Vec::new(),
                    files: Vec::new(),
                    body: Vec::new(),
                    in_metadata: true,
                });
                continue;
            }
        }

        let Some(draft) = current.as_mut() else {
            continue;
        };

        if draft.in_metadata && !in_fence {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(caps) = METADATA_RE.captures(line) {
                let items = split_list(&caps[2])
                    .map_err(|e| Error::MalformedPlan(format!("line {}: {}", lineno, e)))?;
                if caps[1].eq_ignore_ascii_case("files") {
                    draft.files.extend(items.into_iter().map(PathBuf::from));
                } else {
                    for item in items {
                        let dep = parse_id(item.trim_start_matches('#')).map_err(|e| {
                            Error::MalformedPlan(format!("line {}: {}", lineno, e))
                        })?;
                        draft.depends.push(dep);
                    }
                }
                continue;
            }
        }

        draft.in_metadata = false;
        draft.body.push(line.to_string());
    }

    if let Some(done) = current.take() {
        tasks.push(done.finish());
    }

    Ok(tasks)
}

#[derive(Debug, Deserialize)]
struct TomlPlan {
    #[serde(default)]
    task: Vec<TomlTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlTask {
    id: i64,
    title: String,
    #[serde(default)]
    depends: Vec<i64>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    body: String,
}

/// Parse a TOML plan.
pub fn parse_toml(text: &str) -> Result<Vec<Task>> {
    let plan: TomlPlan =
        toml::from_str(text).map_err(|e| Error::MalformedPlan(format!("invalid TOML plan: {}", e)))?;

    plan.task
        .into_iter()
        .map(|t| {
            let id = toml_id(t.id)?;
            let depends = t
                .depends
                .into_iter()
                .map(toml_id)
                .collect::<Result<Vec<_>>>()?;
            Ok(Task::new(id, t.title.trim(), t.body.trim())
                .with_dependencies(depends)
                .with_files(t.files))
        })
        .collect()
}

fn toml_id(raw: i64) -> Result<TaskId> {
    u32::try_from(raw)
        .ok()
        .filter(|id| *id > 0)
        .map(TaskId)
        .ok_or_else(|| Error::MalformedPlan(format!("task id must be a positive integer, got {}", raw)))
}

fn parse_id(raw: &str) -> std::result::Result<TaskId, String> {
    match raw.trim().parse::<TaskId>() {
        Ok(TaskId(0)) => Err("task id must be positive, got 0".to_string()),
        Ok(id) => Ok(id),
        Err(_) => Err(format!("invalid task id '{}'", raw.trim())),
    }
}

/// Split a metadata value: `[a, b]`, `a, b`, `none` or empty.
fn split_list(raw: &str) -> std::result::Result<Vec<String>, String> {
    let raw = raw.trim();
    let opens = raw.starts_with('[');
    let closes = raw.ends_with(']');
    if opens != closes {
        return Err(format!("unbalanced brackets in '{}'", raw));
    }
    let inner = if opens {
        raw[1..raw.len() - 1].trim()
    } else {
        raw
    };

    if inner.is_empty() || inner.eq_ignore_ascii_case("none") {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '`' || c == '"' || c == '\''))
        .map(|item| {
            if item.is_empty() {
                Err(format!("empty entry in list '{}'", raw))
            } else {
                Ok(item.to_string())
            }
        })
        .collect()
}

/// Structural checks shared by both syntaxes.
fn validate(tasks: &[Task]) -> Result<()> {
    if tasks.is_empty() {
        return Err(Error::MalformedPlan("plan contains no tasks".into()));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id) {
            return Err(Error::MalformedPlan(format!("duplicate task id {}", task.id)));
        }
        if task.title.trim().is_empty() {
            return Err(Error::MalformedPlan(format!("task {} has an empty title", task.id)));
        }
    }

    for task in tasks {
        if let Some(missing) = task.dependencies.iter().find(|d| !seen.contains(*d)) {
            return Err(Error::MalformedPlan(format!(
                "task {} depends on unknown task {}",
                task.id, missing
            )));
        }
    }

    Ok(())
}

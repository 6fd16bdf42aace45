//! Per-attempt product artifacts under `.stepflow/{execution,validation,learnings}/`.
//!
//! These are always written, independent of `RUST_LOG`, so a human can audit what
//! each attempt did after the run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::ValidationOutcome;
use crate::io::paths::WorkspacePaths;

/// What one execution attempt produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord<'a> {
    pub step_number: usize,
    pub attempt: u32,
    pub replay: bool,
    pub title: &'a str,
    pub summary: Option<&'a str>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// What one validation call returned.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationRecord<'a> {
    pub step_number: usize,
    pub attempt: u32,
    pub outcome: Option<&'a ValidationOutcome>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ArtifactLog {
    execution_dir: PathBuf,
    validation_dir: PathBuf,
    learnings_dir: PathBuf,
}

impl ArtifactLog {
    pub fn new(paths: &WorkspacePaths) -> Self {
        Self {
            execution_dir: paths.execution_dir.clone(),
            validation_dir: paths.validation_dir.clone(),
            learnings_dir: paths.learnings_dir.clone(),
        }
    }

    pub fn execution_path(&self, step_number: usize, attempt: u32) -> PathBuf {
        attempt_path(&self.execution_dir, step_number, attempt)
    }

    pub fn validation_path(&self, step_number: usize, attempt: u32) -> PathBuf {
        attempt_path(&self.validation_dir, step_number, attempt)
    }

    pub fn learning_path(&self, step_number: usize) -> PathBuf {
        self.learnings_dir
            .join(format!("step_{step_number}_learning.md"))
    }

    pub fn record_execution(&self, record: &ExecutionRecord<'_>) -> Result<PathBuf> {
        let path = self.execution_path(record.step_number, record.attempt);
        write_json(&path, record)?;
        Ok(path)
    }

    pub fn record_validation(&self, record: &ValidationRecord<'_>) -> Result<PathBuf> {
        let path = self.validation_path(record.step_number, record.attempt);
        write_json(&path, record)?;
        Ok(path)
    }

    /// Append one learning entry to the step's markdown log.
    pub fn append_learning(
        &self,
        step_number: usize,
        attempt: u32,
        heading: &str,
        body: &str,
    ) -> Result<PathBuf> {
        let path = self.learning_path(step_number);
        fs::create_dir_all(&self.learnings_dir)
            .with_context(|| format!("create {}", self.learnings_dir.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let entry = format!(
            "## Attempt {attempt}: {heading}\n_{}_\n\n{}\n\n",
            Utc::now().to_rfc3339(),
            body.trim()
        );
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(path)
    }
}

fn attempt_path(dir: &Path, step_number: usize, attempt: u32) -> PathBuf {
    dir.join(format!("step_{step_number}"))
        .join(format!("attempt_{attempt}.json"))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

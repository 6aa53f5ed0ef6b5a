//! Workload trace loading.
//!
//! Two formats: a JSON array of job records, and a plain columnar text
//! format (`id kind submit_s exec_s`, `#` comments). Times are whole
//! seconds in both.

use std::path::Path;
use std::rc::Rc;

use serde::Deserialize;

use vinfra_core::error::{Result, SimError};
use vinfra_core::job::{Job, JobRef};
use vinfra_core::time::SECOND;

#[derive(Debug, Deserialize)]
struct JobRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    submit_s: u64,
    exec_s: u64,
}

/// Load a trace file, picking the format from the extension.
pub fn load_trace(path: &Path) -> Result<Vec<JobRef>> {
    let raw = std::fs::read_to_string(path).map_err(|e| SimError::TraceLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if path.extension().is_some_and(|ext| ext == "json") {
        parse_json(path, &raw)
    } else {
        parse_columns(path, &raw)
    }
}

fn parse_json(path: &Path, raw: &str) -> Result<Vec<JobRef>> {
    let records: Vec<JobRecord> =
        serde_json::from_str(raw).map_err(|e| SimError::TraceLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            Rc::new(Job::new(
                record.id.unwrap_or_else(|| format!("job-{index}")),
                record.kind.unwrap_or_default(),
                record.submit_s * SECOND,
                record.exec_s * SECOND,
            ))
        })
        .collect())
}

fn parse_columns(path: &Path, raw: &str) -> Result<Vec<JobRef>> {
    let mut jobs = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [id, kind, submit_s, exec_s] = fields.as_slice() else {
            return Err(SimError::TraceLoad {
                path: path.display().to_string(),
                message: format!("line {}: expected 4 columns, got {}", number + 1, fields.len()),
            });
        };
        let submit_s: u64 = submit_s.parse().map_err(|_| SimError::TraceLoad {
            path: path.display().to_string(),
            message: format!("line {}: bad submit time '{submit_s}'", number + 1),
        })?;
        let exec_s: u64 = exec_s.parse().map_err(|_| SimError::TraceLoad {
            path: path.display().to_string(),
            message: format!("line {}: bad execution time '{exec_s}'", number + 1),
        })?;
        jobs.push(Rc::new(Job::new(
            *id,
            *kind,
            submit_s * SECOND,
            exec_s * SECOND,
        )));
    }
    Ok(jobs)
}

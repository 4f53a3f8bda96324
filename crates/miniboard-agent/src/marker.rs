//! PID marker file: the last spawned server pid, as plain digits.
//!
//! Only ever a hint. A present marker means a server *may* still run; a
//! missing one proves nothing.

use std::{io, path::Path};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Absent,
    Pid(u32),
    Unreadable(String),
}

pub async fn read(path: &Path) -> Marker {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Marker::Absent,
        Err(e) => return Marker::Unreadable(e.to_string()),
    };
    let trimmed = raw.trim();
    match trimmed.parse::<u32>() {
        Ok(pid) => Marker::Pid(pid),
        Err(_) => Marker::Unreadable(format!("unexpected content {trimmed:?}")),
    }
}

pub async fn write(path: &Path, pid: u32) -> io::Result<()> {
    crate::files::write_whole(path, pid.to_string().as_bytes()).await
}

/// Diagnostic record of the current run, written next to the marker.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub instance_id: String,
    pub port: u16,
    pub save: String,
    pub started_at_unix_ms: u64,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_pid: Option<u32>,
    pub exec: String,
    pub args: Vec<String>,
}

pub async fn write_run_record(path: &Path, run: &RunRecord) -> anyhow::Result<()> {
    use anyhow::Context;

    let data = serde_json::to_vec_pretty(run).context("serialize run.json")?;
    crate::files::write_whole(path, &data).await.context("persist run.json")?;
    Ok(())
}

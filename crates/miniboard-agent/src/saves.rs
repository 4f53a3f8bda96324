use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveInfo {
    /// File name without the `.zip` extension.
    pub name: String,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

impl SaveInfo {
    pub fn display_size(&self) -> String {
        format_size(self.size_bytes)
    }

    pub fn display_date(&self) -> String {
        format_date(self.modified.with_timezone(&Local))
    }
}

/// Every `*.zip` in `dir`, sorted by name. Autosaves and backup slots included.
pub fn list_saves(dir: &Path) -> anyhow::Result<Vec<SaveInfo>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("unable to access saves folder {}", dir.display()))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read_dir {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".zip")) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(file = %entry.path().display(), %err, "skipping unreadable save");
                continue;
            }
        };
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        out.push(SaveInfo {
            name: name.to_string(),
            modified,
            size_bytes: meta.len(),
        });
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    let size = bytes as f64;
    if bytes < KB {
        format!("{bytes}B")
    } else if bytes < MB {
        format!("{:.3}Kb", size / KB as f64)
    } else if bytes < GB {
        format!("{:.3}Mb", size / MB as f64)
    } else {
        format!("{:.3}Gb", size / GB as f64)
    }
}

pub fn format_date<Tz: chrono::TimeZone>(at: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%a %b %d, %Y - %H:%M").to_string()
}

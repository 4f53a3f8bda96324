//! Autosave rotation.
//!
//! The server writes `_autosave*.zip` on its own schedule; each pass copies the
//! newest one over `<save>.zip` and `<save>.zip_back.zip` so the next start
//! resumes from recent progress.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;

use crate::{files::copy_whole, settings::SupervisorSettings};

#[derive(Debug, Clone)]
pub struct BackupLayout {
    pub saves_dir: PathBuf,
    pub save: String,
    pub autosave_prefix: String,
    pub verify: bool,
}

impl BackupLayout {
    pub fn new(settings: &SupervisorSettings, save: &str) -> Self {
        Self {
            saves_dir: settings.saves_dir.clone(),
            save: save.to_string(),
            autosave_prefix: settings.autosave_prefix.clone(),
            verify: settings.verify_autosave,
        }
    }

    pub fn canonical_slot(&self) -> PathBuf {
        self.saves_dir.join(format!("{}.zip", self.save))
    }

    pub fn backup_slot(&self) -> PathBuf {
        self.saves_dir.join(format!("{}.zip_back.zip", self.save))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Copied { source: PathBuf, bytes: u64 },
    Skipped { reason: String },
}

/// Newest file whose name starts with `prefix`. Equal mtimes keep the entry
/// listed first.
pub fn find_most_recent_autosave(dir: &Path, prefix: &str) -> std::io::Result<Option<PathBuf>> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) || name.ends_with(".tmp") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, entry.path()));
        }
    }
    Ok(best.map(|(_, p)| p))
}

fn verify_zip(path: &Path) -> anyhow::Result<()> {
    let f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let archive = zip::ZipArchive::new(f).context("not a readable zip archive")?;
    if archive.is_empty() {
        anyhow::bail!("zip archive has no entries");
    }
    Ok(())
}

/// One rotation pass. A missing or unreadable autosave is a skip, not an error;
/// failing to write a slot is.
pub fn run_pass(layout: &BackupLayout) -> anyhow::Result<BackupOutcome> {
    let source = match find_most_recent_autosave(&layout.saves_dir, &layout.autosave_prefix) {
        Ok(Some(p)) => p,
        Ok(None) => {
            return Ok(BackupOutcome::Skipped {
                reason: format!(
                    "no {}* file in {}",
                    layout.autosave_prefix,
                    layout.saves_dir.display()
                ),
            });
        }
        Err(err) => {
            return Ok(BackupOutcome::Skipped {
                reason: format!("cannot scan {}: {err}", layout.saves_dir.display()),
            });
        }
    };

    let canonical = layout.canonical_slot();
    let backup = layout.backup_slot();
    if source == canonical || source == backup {
        return Ok(BackupOutcome::Skipped {
            reason: format!("{} is one of the save slots", source.display()),
        });
    }

    if layout.verify {
        if let Err(err) = verify_zip(&source) {
            return Ok(BackupOutcome::Skipped {
                reason: format!("{}: {err:#}", source.display()),
            });
        }
    }

    let bytes = copy_whole(&source, &canonical)
        .with_context(|| format!("copy {} -> {}", source.display(), canonical.display()))?;
    copy_whole(&source, &backup)
        .with_context(|| format!("copy {} -> {}", source.display(), backup.display()))?;

    Ok(BackupOutcome::Copied { source, bytes })
}

/// [`run_pass`] off the async runtime, with the outcome logged.
pub async fn run_pass_logged(layout: BackupLayout) -> anyhow::Result<BackupOutcome> {
    let save = layout.save.clone();
    let outcome = tokio::task::spawn_blocking(move || run_pass(&layout))
        .await
        .context("backup task panicked")??;

    match &outcome {
        BackupOutcome::Copied { source, bytes } => {
            tracing::info!(
                save = %save,
                source = %source.display(),
                bytes,
                "save rotated from autosave"
            );
        }
        BackupOutcome::Skipped { reason } => {
            tracing::warn!(save = %save, reason = %reason, "backup pass skipped");
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        time::{Duration, SystemTime},
    };

    use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

    use super::*;

    fn write_zip(path: &Path, payload: &str) {
        let f = std::fs::File::create(path).unwrap();
        let mut zip = ZipWriter::new(f);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("level.dat", options).unwrap();
        zip.write_all(payload.as_bytes()).unwrap();
        zip.finish().unwrap();
    }

    fn set_age(path: &Path, secs_ago: u64) {
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    fn layout(dir: &Path) -> BackupLayout {
        BackupLayout {
            saves_dir: dir.to_path_buf(),
            save: "world".to_string(),
            autosave_prefix: "_autosave".to_string(),
            verify: true,
        }
    }

    #[test]
    fn newest_autosave_goes_to_both_slots() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("_autosave1.zip");
        let b = dir.path().join("_autosave2.zip");
        write_zip(&a, "older");
        write_zip(&b, "newer");
        set_age(&a, 600);
        set_age(&b, 60);

        let outcome = run_pass(&layout(dir.path())).unwrap();
        assert!(matches!(&outcome, BackupOutcome::Copied { source, .. } if *source == b));

        let b_bytes = std::fs::read(&b).unwrap();
        assert_eq!(std::fs::read(dir.path().join("world.zip")).unwrap(), b_bytes);
        assert_eq!(
            std::fs::read(dir.path().join("world.zip_back.zip")).unwrap(),
            b_bytes
        );
    }

    #[test]
    fn empty_folder_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("world.zip"), b"original").unwrap();

        let outcome = run_pass(&layout(dir.path())).unwrap();
        assert!(matches!(outcome, BackupOutcome::Skipped { .. }));
        assert_eq!(std::fs::read(dir.path().join("world.zip")).unwrap(), b"original");
        assert!(!dir.path().join("world.zip_back.zip").exists());
    }

    #[test]
    fn truncated_autosave_never_clobbers_the_save() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("world.zip"), b"original").unwrap();
        std::fs::write(dir.path().join("_autosave3.zip"), b"PK\x03\x04 half written").unwrap();

        let outcome = run_pass(&layout(dir.path())).unwrap();
        assert!(matches!(outcome, BackupOutcome::Skipped { .. }));
        assert_eq!(std::fs::read(dir.path().join("world.zip")).unwrap(), b"original");

        let mut unchecked = layout(dir.path());
        unchecked.verify = false;
        assert!(matches!(
            run_pass(&unchecked).unwrap(),
            BackupOutcome::Copied { .. }
        ));
    }

    #[test]
    fn other_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(&dir.path().join("other.zip"), "x");
        std::fs::create_dir(dir.path().join("_autosave_dir")).unwrap();
        std::fs::write(dir.path().join("_autosave9.zip.tmp"), b"partial").unwrap();

        assert_eq!(
            find_most_recent_autosave(dir.path(), "_autosave").unwrap(),
            None
        );
    }

    #[test]
    fn missing_folder_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_pass(&layout(&dir.path().join("nope"))).unwrap();
        assert!(matches!(outcome, BackupOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn logged_pass_runs_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        write_zip(&dir.path().join("_autosave1.zip"), "data");
        let outcome = run_pass_logged(layout(dir.path())).await.unwrap();
        assert!(matches!(outcome, BackupOutcome::Copied { .. }));
        assert!(dir.path().join("world.zip").exists());
    }
}

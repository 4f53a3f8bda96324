//! Per-port server configuration.
//!
//! `config.<port>.ini` is derived once from the `config.ini` template and
//! then left alone, so operators can edit it between runs.

use std::path::{Path, PathBuf};

use crate::error::SupervisorError;

pub const TEMPLATE_FILE: &str = "config.ini";

pub fn port_config_path(config_dir: &Path, port: u16) -> PathBuf {
    config_dir.join(format!("config.{port}.ini"))
}

/// Template lines are kept verbatim, except `port=` which gets the requested port.
pub fn derive_config(template: &str, port: u16) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    for line in template.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let eol = &line[body.len()..];
        match body.split_once('=') {
            Some((key, _)) if key.trim() == "port" => {
                out.push_str(key);
                out.push('=');
                out.push_str(&port.to_string());
                out.push_str(eol);
            }
            _ => out.push_str(line),
        }
    }
    out
}

/// Ensure `config.<port>.ini` exists; returns its path. No-op when present.
pub async fn ensure_port_config(config_dir: &Path, port: u16) -> Result<PathBuf, SupervisorError> {
    let path = port_config_path(config_dir, port);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        tracing::debug!(path = %path.display(), "per-port config already present");
        return Ok(path);
    }

    let template_path = config_dir.join(TEMPLATE_FILE);
    let template = tokio::fs::read_to_string(&template_path)
        .await
        .map_err(|_| SupervisorError::ConfigTemplateMissing {
            path: template_path.clone(),
        })?;

    let derived = derive_config(&template, port);
    crate::files::write_whole(&path, derived.as_bytes())
        .await
        .map_err(|source| SupervisorError::ConfigWrite {
            path: path.clone(),
            source,
        })?;

    tracing::info!(port, path = %path.display(), "derived per-port config from template");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "[path]\nread-data=__PATH__executable__/../../data\nwrite-data=__PATH__executable__/../..\n\n[other]\nport=34197\n; comment=keep\n";

    #[test]
    fn only_port_line_changes() {
        let out = derive_config(TEMPLATE, 40000);
        assert!(out.contains("\nport=40000\n"));
        assert!(!out.contains("34197"));
        assert_eq!(
            out.replace("port=40000", "port=34197"),
            TEMPLATE,
            "every other line is verbatim"
        );
    }

    #[test]
    fn keys_are_matched_exactly() {
        let out = derive_config("port_range=1-2\nmyport=5\n port = 1\n", 7);
        assert_eq!(out, "port_range=1-2\nmyport=5\n port =7\n");
    }

    #[test]
    fn crlf_and_missing_trailing_newline_survive() {
        assert_eq!(derive_config("a=1\r\nport=2", 9), "a=1\r\nport=9");
        assert_eq!(derive_config("port=2\r\n", 9), "port=9\r\n");
    }

    #[tokio::test]
    async fn missing_template_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_port_config(dir.path(), 34197).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigTemplateMissing { .. }));
        assert!(!port_config_path(dir.path(), 34197).exists());
    }

    #[tokio::test]
    async fn derives_then_stays_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TEMPLATE_FILE), TEMPLATE).unwrap();

        let path = ensure_port_config(dir.path(), 40000).await.unwrap();
        assert_eq!(path, dir.path().join("config.40000.ini"));
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("port=40000"));

        // Operator edits survive re-provisioning, even if the template changes.
        std::fs::write(&path, "port=40000\nedited=yes\n").unwrap();
        std::fs::write(dir.path().join(TEMPLATE_FILE), "port=1\n").unwrap();
        ensure_port_config(dir.path(), 40000).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "port=40000\nedited=yes\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unwritable_config_dir_is_a_write_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TEMPLATE_FILE), TEMPLATE).unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();

        let res = ensure_port_config(dir.path(), 40001).await;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        // Running as root bypasses directory permissions.
        if unsafe { libc::geteuid() } != 0 {
            assert!(matches!(res, Err(SupervisorError::ConfigWrite { .. })));
        }
    }
}

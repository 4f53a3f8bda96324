use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use miniboard_process::{InstanceId, InstanceSpec};

const DEFAULT_AUTOSAVE_INTERVAL_MIN: u64 = 10;
const DEFAULT_AUTOSAVE_PREFIX: &str = "_autosave";
const DEFAULT_ORPHAN_GRACE_MS: u64 = 2000;
const DEFAULT_STOP_GRACE_MS: u64 = 5000;
const DEFAULT_FORCE_KILL_WAIT_MS: u64 = 5000;
const DEFAULT_RELAY_DRAIN_MS: u64 = 2000;
const DEFAULT_LOG_CHUNK_BYTES: usize = 1024;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_GAME_PORT: u16 = 34197;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Source of raw configuration values. The process environment in production,
/// a plain map in tests.
pub trait Lookup {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl Lookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Lookup for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

pub(crate) fn lookup_u64(env: &impl Lookup, name: &str) -> Option<u64> {
    env.get(name).and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn lookup_usize(env: &impl Lookup, name: &str) -> Option<usize> {
    env.get(name).and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn lookup_bool(env: &impl Lookup, name: &str, default_value: bool) -> bool {
    match env
        .get(name)
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

fn lookup_path(env: &impl Lookup, name: &str) -> Option<PathBuf> {
    env.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn absolutize(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub data_root: PathBuf,
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub saves_dir: PathBuf,
    pub pid_file: PathBuf,
    /// Passed to the server as `--autosave-interval` (minutes).
    pub autosave_interval_min: u64,
    pub backup_interval: Duration,
    pub autosave_prefix: String,
    pub verify_autosave: bool,
    pub orphan_grace: Duration,
    pub stop_grace: Duration,
    pub force_kill: bool,
    pub force_kill_wait: Duration,
    pub relay_drain_timeout: Duration,
    pub log_chunk_bytes: usize,
    pub console_log: Option<PathBuf>,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
}

impl SupervisorSettings {
    /// Defaults laid out under `root`, without reading the environment.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            binary: root
                .join("factorio")
                .join("bin")
                .join("x64")
                .join("factorio"),
            config_dir: root.join("config"),
            saves_dir: root.join("saves"),
            pid_file: root.join("db").join("pidfile.txt"),
            autosave_interval_min: DEFAULT_AUTOSAVE_INTERVAL_MIN,
            backup_interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_MIN * 60),
            autosave_prefix: DEFAULT_AUTOSAVE_PREFIX.to_string(),
            verify_autosave: true,
            orphan_grace: Duration::from_millis(DEFAULT_ORPHAN_GRACE_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            force_kill: true,
            force_kill_wait: Duration::from_millis(DEFAULT_FORCE_KILL_WAIT_MS),
            relay_drain_timeout: Duration::from_millis(DEFAULT_RELAY_DRAIN_MS),
            log_chunk_bytes: DEFAULT_LOG_CHUNK_BYTES,
            console_log: Some(root.join("logs").join("console.log")),
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            data_root: root,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(env: &impl Lookup) -> Self {
        let root = absolutize(
            lookup_path(env, "MINIBOARD_DATA_ROOT").unwrap_or_else(|| PathBuf::from("./data")),
        );
        let mut s = Self::rooted_at(root);

        if let Some(p) = lookup_path(env, "MINIBOARD_SERVER_BINARY") {
            s.binary = absolutize(p);
        }
        if let Some(p) = lookup_path(env, "MINIBOARD_CONFIG_DIR") {
            s.config_dir = absolutize(p);
        }
        if let Some(p) = lookup_path(env, "MINIBOARD_SAVES_DIR") {
            s.saves_dir = absolutize(p);
        }
        if let Some(p) = lookup_path(env, "MINIBOARD_PID_FILE") {
            s.pid_file = absolutize(p);
        }

        s.autosave_interval_min = lookup_u64(env, "MINIBOARD_AUTOSAVE_INTERVAL_MIN")
            .map(|v| v.clamp(1, 24 * 60))
            .unwrap_or(DEFAULT_AUTOSAVE_INTERVAL_MIN);
        s.backup_interval = Duration::from_secs(
            lookup_u64(env, "MINIBOARD_BACKUP_INTERVAL_SEC")
                .map(|v| v.clamp(5, 24 * 60 * 60))
                .unwrap_or(s.autosave_interval_min * 60),
        );
        if let Some(prefix) = env
            .get("MINIBOARD_AUTOSAVE_PREFIX")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            s.autosave_prefix = prefix;
        }
        s.verify_autosave = lookup_bool(env, "MINIBOARD_VERIFY_AUTOSAVE", true);

        s.orphan_grace = Duration::from_millis(
            lookup_u64(env, "MINIBOARD_ORPHAN_GRACE_MS")
                .map(|v| v.clamp(0, 60_000))
                .unwrap_or(DEFAULT_ORPHAN_GRACE_MS),
        );
        s.stop_grace = Duration::from_millis(
            lookup_u64(env, "MINIBOARD_STOP_GRACE_MS")
                .map(|v| v.clamp(100, 120_000))
                .unwrap_or(DEFAULT_STOP_GRACE_MS),
        );
        s.force_kill = lookup_bool(env, "MINIBOARD_FORCE_KILL", true);
        s.force_kill_wait = Duration::from_millis(
            lookup_u64(env, "MINIBOARD_FORCE_KILL_WAIT_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_FORCE_KILL_WAIT_MS),
        );

        s.log_chunk_bytes = lookup_usize(env, "MINIBOARD_LOG_CHUNK_BYTES")
            .map(|v| v.clamp(256, 64 * 1024))
            .unwrap_or(DEFAULT_LOG_CHUNK_BYTES);
        s.log_file_max_bytes = lookup_u64(env, "MINIBOARD_LOG_FILE_MAX_BYTES")
            .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
        s.log_file_max_files = lookup_usize(env, "MINIBOARD_LOG_FILE_MAX_FILES")
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);

        s
    }

    pub fn save_path(&self, save: &str) -> PathBuf {
        self.saves_dir.join(format!("{save}.zip"))
    }

    /// `run.json` lives next to the marker file.
    pub fn run_record_path(&self) -> PathBuf {
        self.pid_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("run.json")
    }

    /// Upper bound for a `stop()` call, worker side included.
    pub fn stop_budget(&self) -> Duration {
        let mut budget = self.stop_grace + self.relay_drain_timeout;
        if self.force_kill {
            budget += self.force_kill_wait;
        }
        // Room for the final backup copy.
        budget + Duration::from_secs(30)
    }
}

/// Instance the agent binary starts by itself; `None` unless
/// `MINIBOARD_START_SAVE` is set.
pub fn autostart_spec(env: &impl Lookup) -> Option<InstanceSpec> {
    let save = env
        .get("MINIBOARD_START_SAVE")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())?;
    let port = env
        .get("MINIBOARD_START_PORT")
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_GAME_PORT);
    let instance_id = env
        .get("MINIBOARD_START_INSTANCE")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(InstanceId)
        .unwrap_or_default();
    Some(InstanceSpec::new(instance_id, port, save))
}

/// How often the agent binary drains the log queue.
pub fn poll_interval(env: &impl Lookup) -> Duration {
    Duration::from_millis(
        lookup_u64(env, "MINIBOARD_POLL_INTERVAL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rooted_layout_matches_factorio_defaults() {
        let s = SupervisorSettings::rooted_at("/srv/mb");
        assert_eq!(s.config_dir, PathBuf::from("/srv/mb/config"));
        assert_eq!(s.saves_dir, PathBuf::from("/srv/mb/saves"));
        assert_eq!(s.pid_file, PathBuf::from("/srv/mb/db/pidfile.txt"));
        assert_eq!(s.run_record_path(), PathBuf::from("/srv/mb/db/run.json"));
        assert_eq!(s.save_path("world"), PathBuf::from("/srv/mb/saves/world.zip"));
        assert_eq!(s.backup_interval, Duration::from_secs(600));
    }

    #[test]
    fn backup_interval_follows_autosave_interval() {
        let s = SupervisorSettings::from_lookup(&env(&[
            ("MINIBOARD_DATA_ROOT", "/srv/mb"),
            ("MINIBOARD_AUTOSAVE_INTERVAL_MIN", "3"),
        ]));
        assert_eq!(s.autosave_interval_min, 3);
        assert_eq!(s.backup_interval, Duration::from_secs(180));
    }

    #[test]
    fn values_are_clamped() {
        let s = SupervisorSettings::from_lookup(&env(&[
            ("MINIBOARD_DATA_ROOT", "/srv/mb"),
            ("MINIBOARD_AUTOSAVE_INTERVAL_MIN", "0"),
            ("MINIBOARD_BACKUP_INTERVAL_SEC", "1"),
            ("MINIBOARD_STOP_GRACE_MS", "999999999"),
            ("MINIBOARD_LOG_CHUNK_BYTES", "1"),
        ]));
        assert_eq!(s.autosave_interval_min, 1);
        assert_eq!(s.backup_interval, Duration::from_secs(5));
        assert_eq!(s.stop_grace, Duration::from_millis(120_000));
        assert_eq!(s.log_chunk_bytes, 256);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let s = SupervisorSettings::from_lookup(&env(&[
            ("MINIBOARD_DATA_ROOT", "/srv/mb"),
            ("MINIBOARD_ORPHAN_GRACE_MS", "soon"),
            ("MINIBOARD_FORCE_KILL", "maybe"),
            ("MINIBOARD_AUTOSAVE_PREFIX", "   "),
        ]));
        assert_eq!(s.orphan_grace, Duration::from_millis(DEFAULT_ORPHAN_GRACE_MS));
        assert!(s.force_kill);
        assert_eq!(s.autosave_prefix, "_autosave");
    }

    #[test]
    fn force_kill_can_be_disabled() {
        let s = SupervisorSettings::from_lookup(&env(&[
            ("MINIBOARD_DATA_ROOT", "/srv/mb"),
            ("MINIBOARD_FORCE_KILL", "off"),
        ]));
        assert!(!s.force_kill);
        assert!(s.stop_budget() < SupervisorSettings::rooted_at("/srv/mb").stop_budget());
    }

    #[test]
    fn explicit_paths_override_root() {
        let s = SupervisorSettings::from_lookup(&env(&[
            ("MINIBOARD_DATA_ROOT", "/srv/mb"),
            ("MINIBOARD_SERVER_BINARY", "/opt/factorio/bin/x64/factorio"),
            ("MINIBOARD_PID_FILE", "/run/mb/pid"),
        ]));
        assert_eq!(s.binary, PathBuf::from("/opt/factorio/bin/x64/factorio"));
        assert_eq!(s.run_record_path(), PathBuf::from("/run/mb/run.json"));
    }

    #[test]
    fn autostart_needs_a_save() {
        assert!(autostart_spec(&env(&[("MINIBOARD_START_PORT", "40000")])).is_none());

        let spec = autostart_spec(&env(&[
            ("MINIBOARD_START_SAVE", "world"),
            ("MINIBOARD_START_INSTANCE", "main"),
        ]))
        .unwrap();
        assert_eq!(spec.port, 34197);
        assert_eq!(spec.save, "world");
        assert_eq!(spec.instance_id, InstanceId("main".to_string()));
    }

    #[test]
    fn poll_interval_defaults_to_two_seconds() {
        assert_eq!(poll_interval(&env(&[])), Duration::from_secs(2));
        assert_eq!(
            poll_interval(&env(&[("MINIBOARD_POLL_INTERVAL_MS", "5")])),
            Duration::from_millis(100)
        );
    }
}

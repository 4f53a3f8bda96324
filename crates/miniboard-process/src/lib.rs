use specta::Type;

/// Opaque identifier of a supervised instance.
///
/// NOTE: This correlates to caller-owned metadata; the supervisor never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to run: one port, one save. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    pub port: u16,
    /// Save name without the `.zip` extension.
    pub save: String,
}

impl InstanceSpec {
    pub fn new(instance_id: InstanceId, port: u16, save: impl Into<String>) -> Self {
        Self {
            instance_id,
            port,
            save: save.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub enum InstanceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// A process may exist for this state.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceStatus {
    pub instance_id: Option<InstanceId>,
    pub port: Option<u16>,
    pub save: Option<String>,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub last_backup_unix_ms: Option<u64>,
    // Non-fatal condition worth surfacing (e.g. child still unresolved after stop).
    pub message: Option<String>,
    // Set when the process went away without being asked to.
    pub error: Option<String>,
}

impl InstanceStatus {
    pub fn idle() -> Self {
        Self {
            instance_id: None,
            port: None,
            save: None,
            state: InstanceState::Idle,
            pid: None,
            exit_code: None,
            last_backup_unix_ms: None,
            message: None,
            error: None,
        }
    }

    pub fn for_spec(spec: &InstanceSpec, state: InstanceState) -> Self {
        Self {
            instance_id: Some(spec.instance_id.clone()),
            port: Some(spec.port),
            save: Some(spec.save.clone()),
            state,
            ..Self::idle()
        }
    }

    pub fn crashed(&self) -> bool {
        self.state == InstanceState::Stopped && self.error.is_some()
    }
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// One unit of relayed output. Delivered once, in the order produced.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum LogChunk {
    Stdout(String),
    Stderr(String),
    /// Message from the supervisor itself (orphan takeover, crash, backups).
    Notice(String),
    /// Last chunk of a run: the process exited and its output is drained.
    EndOfStream,
}

impl LogChunk {
    pub fn is_end(&self) -> bool {
        matches!(self, LogChunk::EndOfStream)
    }

    pub fn render(&self) -> String {
        match self {
            LogChunk::Stdout(s) => format!("[stdout] {s}"),
            LogChunk::Stderr(s) => format!("[stderr] {s}"),
            LogChunk::Notice(s) => format!("[miniboard-agent] {s}"),
            LogChunk::EndOfStream => "[No more data]".to_string(),
        }
    }
}

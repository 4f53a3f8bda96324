//! One-line console rendering of a [`SupervisorError`]: a fixed prefix, then JSON.

use serde::Serialize;

use crate::error::SupervisorError;

/// Marks an error line as machine-readable for the console.
pub const PREFIX: &str = "MINIBOARD_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 4 * 1024;
const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    /// Offending `InstanceSpec` field, for `invalid_param`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
    /// Nothing was spawned, so fixing the cause and retrying is safe.
    pub pre_spawn: bool,
}

impl From<&SupervisorError> for ErrorPayload {
    fn from(err: &SupervisorError) -> Self {
        let field = match err {
            SupervisorError::InvalidSpec { field, .. } => Some(*field),
            _ => None,
        };
        Self {
            code: err.code(),
            message: clip(err.to_string(), MAX_MESSAGE_BYTES),
            field,
            hint: err.hint(),
            pre_spawn: err.is_pre_spawn(),
        }
    }
}

// io errors can drag long paths along; keep the line bounded.
fn clip(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let limit = max_bytes.saturating_sub(ELLIPSIS.len());
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    s.truncate(cut);
    s.push_str(ELLIPSIS);
    s
}

pub fn encode(err: &SupervisorError) -> String {
    let json = serde_json::to_string(&ErrorPayload::from(err))
        .unwrap_or_else(|_| format!("{{\"code\":\"{}\"}}", err.code()));
    format!("{PREFIX}{json}")
}

//! Wire types shared between the notebook client and the execution backend
//!
//! Every message on the socket is a flat JSON object: the payload fields of
//! one command plus a `command` field naming its kind. These types are used by:
//! - the native sync core (`sheets-client`)
//! - the rendering layer, through the generated TypeScript bindings
//!
//! Decoding always goes through the dispatch registry ([`decode`]), so an
//! unknown or malformed kind is reported as a [`DecodeError`] rather than a
//! partially built command.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use ts_rs::TS;

/// Name of the discriminator field carried by every wire message.
pub const COMMAND_FIELD: &str = "command";

// ============================================================================
// Command payloads
// ============================================================================

/// New content for a file, typed locally or changed on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub struct FileEdit {
    pub filename: String,
    pub content: String,
    /// True when the change originated outside the local editor.
    #[serde(default)]
    pub external_edit: bool,
}

/// Removal of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub struct FileDelete {
    pub filename: String,
    #[serde(default)]
    pub external_edit: bool,
}

/// Ask the backend to run a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub struct ExecutionRequest {
    pub filename: String,
    #[serde(default)]
    pub content: String,
    /// Report values of intermediate expressions as well as the final one.
    #[serde(default)]
    pub subexpressions: bool,
}

/// Static analysis of one version of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub struct Analysis {
    pub filename: String,
    /// The content the analysis was computed from.
    pub content: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub properties: serde_json::Value,
}

/// Result of running one version of a file.
///
/// Backends report results either as structured `emitted` values or as a
/// pre-rendered `output` string; both are kept as received. A missing
/// `emitted` decodes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub struct Execution {
    pub filename: String,
    /// The content that was executed.
    pub content: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub emitted: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub output: Option<String>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub defines: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub start_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub end_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub exec_time: Option<f64>,
    #[serde(default)]
    pub with_subexpressions: bool,
}

// ============================================================================
// Command
// ============================================================================

/// A discrete state-changing event exchanged with the execution backend.
///
/// Serializes to the flat wire record (payload fields plus `command`).
/// Deserialization is routed through [`decode`].
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(tag = "command")]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub enum Command {
    FileEdit(FileEdit),
    FileDelete(FileDelete),
    ExecutionRequest(ExecutionRequest),
    Analysis(Analysis),
    Execution(Execution),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::FileEdit(_) => CommandKind::FileEdit,
            Command::FileDelete(_) => CommandKind::FileDelete,
            Command::ExecutionRequest(_) => CommandKind::ExecutionRequest,
            Command::Analysis(_) => CommandKind::Analysis,
            Command::Execution(_) => CommandKind::Execution,
        }
    }

    /// Name of the file this command targets.
    pub fn filename(&self) -> &str {
        match self {
            Command::FileEdit(c) => &c.filename,
            Command::FileDelete(c) => &c.filename,
            Command::ExecutionRequest(c) => &c.filename,
            Command::Analysis(c) => &c.filename,
            Command::Execution(c) => &c.filename,
        }
    }

    /// True for edits and deletes pushed by the backend.
    pub fn is_external(&self) -> bool {
        match self {
            Command::FileEdit(c) => c.external_edit,
            Command::FileDelete(c) => c.external_edit,
            _ => false,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Encode as a wire message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<FileEdit> for Command {
    fn from(value: FileEdit) -> Self {
        Command::FileEdit(value)
    }
}

impl From<FileDelete> for Command {
    fn from(value: FileDelete) -> Self {
        Command::FileDelete(value)
    }
}

impl From<ExecutionRequest> for Command {
    fn from(value: ExecutionRequest) -> Self {
        Command::ExecutionRequest(value)
    }
}

impl From<Analysis> for Command {
    fn from(value: Analysis) -> Self {
        Command::Analysis(value)
    }
}

impl From<Execution> for Command {
    fn from(value: Execution) -> Self {
        Command::Execution(value)
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        decode(&value).map_err(serde::de::Error::custom)
    }
}

const SHORT_VALUE_LEN: usize = 20;

fn short_value(value: &serde_json::Value) -> String {
    let rendered = value.to_string();
    let chars: Vec<char> = rendered.chars().collect();
    if chars.len() <= SHORT_VALUE_LEN {
        return rendered;
    }
    let head: String = chars[..12].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{head}...{tail}")
}

/// One-line summary for logs, e.g. `<FileEdit content="x=1" external_edit=false filename="a.py">`.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.kind())?;
        if let Ok(serde_json::Value::Object(fields)) = self.to_value() {
            let mut names: Vec<&String> = fields.keys().collect();
            names.sort();
            for name in names {
                if name == COMMAND_FIELD {
                    continue;
                }
                write!(f, " {}={}", name, short_value(&fields[name]))?;
            }
        }
        write!(f, ">")
    }
}

// ============================================================================
// Dispatch registry
// ============================================================================

/// Closed set of command kinds understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/commands.ts")]
pub enum CommandKind {
    FileEdit,
    FileDelete,
    ExecutionRequest,
    Analysis,
    Execution,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::FileEdit,
        CommandKind::FileDelete,
        CommandKind::ExecutionRequest,
        CommandKind::Analysis,
        CommandKind::Execution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::FileEdit => "FileEdit",
            CommandKind::FileDelete => "FileDelete",
            CommandKind::ExecutionRequest => "ExecutionRequest",
            CommandKind::Analysis => "Analysis",
            CommandKind::Execution => "Execution",
        }
    }

    /// Build the command of this kind from a wire payload.
    pub fn decode(self, payload: &serde_json::Value) -> Result<Command, DecodeError> {
        Ok(match self {
            CommandKind::FileEdit => Command::FileEdit(payload_as(self, payload)?),
            CommandKind::FileDelete => Command::FileDelete(payload_as(self, payload)?),
            CommandKind::ExecutionRequest => {
                Command::ExecutionRequest(payload_as(self, payload)?)
            }
            CommandKind::Analysis => Command::Analysis(payload_as(self, payload)?),
            CommandKind::Execution => Command::Execution(payload_as(self, payload)?),
        })
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = DecodeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| DecodeError::UnknownKind(name.to_string()))
    }
}

fn payload_as<T: DeserializeOwned>(
    kind: CommandKind,
    payload: &serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload.clone()).map_err(|source| DecodeError::Malformed { kind, source })
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Message is not a JSON object")]
    NotAnObject,
    #[error("Message has no string `command` field")]
    MissingKind,
    #[error("Unknown command kind: {0}")]
    UnknownKind(String),
    #[error("Malformed {kind} payload: {source}")]
    Malformed {
        kind: CommandKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolve a wire payload to a typed command.
pub fn decode(payload: &serde_json::Value) -> Result<Command, DecodeError> {
    let object = payload.as_object().ok_or(DecodeError::NotAnObject)?;
    let name = object
        .get(COMMAND_FIELD)
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingKind)?;
    let kind: CommandKind = name.parse()?;
    kind.decode(payload)
}

/// Parse and resolve a raw text frame.
pub fn decode_str(text: &str) -> Result<Command, DecodeError> {
    let payload: serde_json::Value =
        serde_json::from_str(text).map_err(DecodeError::InvalidJson)?;
    decode(&payload)
}

// ============================================================================
// Tests
// ============================================================================

//! NDJSON wire protocol between the control plane and its agents.
//!
//! Every frame is one JSON object on its own line, tagged by `type`.
//! Agents open with [`AgentMessage::Hello`]; everything after that flows
//! in either direction on the same ordered connection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Shell an agent uses to run a command or script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shell {
    #[serde(rename = "PSCore")]
    PsCore,
    #[serde(rename = "WinPS")]
    WinPs,
    Bash,
    #[serde(rename = "CMD")]
    Cmd,
}

impl Shell {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PsCore => "PSCore",
            Self::WinPs => "WinPS",
            Self::Bash => "Bash",
            Self::Cmd => "CMD",
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shell {
    type Err = Error;

    /// Case-insensitive, so `bash`, `BASH` and `Bash` all parse.
    fn from_str(s: &str) -> Result<Self> {
        [Self::PsCore, Self::WinPs, Self::Bash, Self::Cmd]
            .into_iter()
            .find(|shell| shell.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Unable to parse shell type '{s}'. Use either PSCore, WinPS, Bash, or CMD."
                ))
            })
    }
}

/// What caused a script to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptInputType {
    /// Interactive run started by an operator.
    #[default]
    OneTimeScript,
    Api,
    ScheduledScript,
}

impl ScriptInputType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OneTimeScript => "OneTimeScript",
            Self::Api => "Api",
            Self::ScheduledScript => "ScheduledScript",
        }
    }
}

impl fmt::Display for ScriptInputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptInputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OneTimeScript" => Ok(Self::OneTimeScript),
            "Api" => Ok(Self::Api),
            "ScheduledScript" => Ok(Self::ScheduledScript),
            other => Err(Error::Protocol(format!("Unknown script input type '{other}'"))),
        }
    }
}

/// Output of one command or script execution on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResultReport {
    pub device_id: String,
    pub shell: Shell,
    pub script_input: String,
    #[serde(default)]
    pub standard_output: Vec<String>,
    #[serde(default)]
    pub error_output: Vec<String>,
    pub had_errors: bool,
    pub run_time_ms: u64,
    #[serde(default)]
    pub sender_user_name: Option<String>,
}

/// One slice of a file moving between server and agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: String,
    pub file_name: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub start_of_file: bool,
    #[serde(default)]
    pub end_of_file: bool,
}

/// Frames sent by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Must be the first frame on a connection.
    Hello {
        device_id: String,
        organization_id: String,
        device_name: String,
        #[serde(default)]
        alias: Option<String>,
    },
    /// Reply to [`ServerMessage::ExecuteCommand`].
    CommandResult {
        auth_token: String,
        request_id: String,
        /// Echoed from the instruction.
        #[serde(default)]
        input_type: ScriptInputType,
        result: ScriptResultReport,
    },
    /// Reply to [`ServerMessage::RunScript`].
    ScriptRunResult {
        auth_token: String,
        script_run_id: i64,
        result: ScriptResultReport,
    },
    FileChunk(FileChunk),
    Heartbeat,
}

/// Frames sent by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ExecuteCommand {
        shell: Shell,
        auth_token: String,
        request_id: String,
        command: String,
        /// Who asked for the command, shown in the agent's logs.
        sender: String,
        input_type: ScriptInputType,
    },
    RunScript {
        saved_script_id: Option<String>,
        script_run_id: i64,
        initiator: String,
        input_type: ScriptInputType,
        auth_token: String,
        shell: Shell,
        content: String,
    },
    FileChunk(FileChunk),
}

/// Serialize a frame as a single line (without the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one line received from an agent.
pub fn decode_agent_line(line: &str) -> Result<AgentMessage> {
    serde_json::from_str(line.trim()).map_err(|e| Error::Protocol(e.to_string()))
}

/// Decode one line received from the control plane.
pub fn decode_server_line(line: &str) -> Result<ServerMessage> {
    serde_json::from_str(line.trim()).map_err(|e| Error::Protocol(e.to_string()))
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

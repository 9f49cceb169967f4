//! # Controller ↔ Agent Wire Protocol
//!
//! Defines every message exchanged between the controller and its agents
//! over WebSocket connections. Messages are serialized as JSON text frames
//! using serde's internally-tagged representation (`"type": "..."` field).
//!
//! The protocol is deliberately small:
//! - `init` — the agent's first frame, carrying its identity and token
//! - `EXECUTE_TASK` / `CANCEL_TASK` — controller → agent work orders
//! - `result` / `agent_error` — agent → controller outcomes
//! - `ping` / `pong` — application-level liveness
//!
//! Frames with an unknown `type` are ignored by both sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Largest script body accepted by the controller, in bytes.
///
/// Frames themselves may exceed this (result stdout/stderr is unbounded);
/// only the stored script is capped.
pub const MAX_SCRIPT_BYTES: usize = 100 * 1024;

// ─── Close Codes ────────────────────────────────────────────────

/// Normal close (controller shutdown or clean disconnect).
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer sent a frame the controller could not read at all.
pub const CLOSE_INVALID_FRAME: u16 = 4000;
/// The first frame was not a valid `init` message.
pub const CLOSE_BAD_HANDSHAKE: u16 = 4001;
/// The supplied auth token did not match the agent's secret.
pub const CLOSE_UNAUTHORIZED: u16 = 4002;
/// The peer address is not in the agent's IP allow-list.
pub const CLOSE_IP_REJECTED: u16 = 4003;
/// No agent record exists for the supplied identifier.
pub const CLOSE_UNKNOWN_AGENT: u16 = 4004;
/// A newer connection for the same agent replaced this one.
pub const CLOSE_SUPERSEDED: u16 = 4005;
/// The agent was unregistered by an administrator.
pub const CLOSE_UNREGISTERED: u16 = 4006;

// ─── Interpreter Kinds ──────────────────────────────────────────

/// The interpreter a task's script is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    Bash,
    Python,
    Node,
}

impl Interpreter {
    /// The program the agent spawns for this kind of script.
    pub fn program(&self) -> &'static str {
        match self {
            Interpreter::Bash => "bash",
            Interpreter::Python => "python",
            Interpreter::Node => "node",
        }
    }

    /// File extension for the materialized temp script.
    pub fn extension(&self) -> &'static str {
        match self {
            Interpreter::Bash => "sh",
            Interpreter::Python => "py",
            Interpreter::Node => "js",
        }
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interpreter::Bash => "bash",
            Interpreter::Python => "python",
            Interpreter::Node => "node",
        })
    }
}

impl FromStr for Interpreter {
    type Err = UnknownInterpreter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(Interpreter::Bash),
            "python" => Ok(Interpreter::Python),
            "node" => Ok(Interpreter::Node),
            other => Err(UnknownInterpreter(other.to_string())),
        }
    }
}

/// Error returned when parsing an interpreter name fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownInterpreter(pub String);

impl fmt::Display for UnknownInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown interpreter: {}", self.0)
    }
}

impl std::error::Error for UnknownInterpreter {}

// ─── Payloads ───────────────────────────────────────────────────

/// Work order for a single run, controller → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub task_id: i64,
    pub run_id: i64,
    /// Task name, echoed back in the result for log correlation.
    pub name: String,
    /// Interpreter kind; serialized as `"type"` on the wire.
    #[serde(rename = "type")]
    pub interpreter: Interpreter,
    pub script: String,
    /// Effective parameters (task defaults merged with run overrides).
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Snapshot of every global asset at dispatch time.
    #[serde(default)]
    pub assets: BTreeMap<String, String>,
    /// Reserved pass-through options; forwarded verbatim.
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Cancellation order for an in-flight run, controller → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub task_id: i64,
    pub run_id: i64,
}

/// Terminal outcome reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Execution outcome, agent → controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub task_id: i64,
    pub run_id: i64,
    pub name: String,
    pub status: ResultStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

/// Out-of-band failure report from an agent (not tied to a run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReportPayload {
    /// Severity label, e.g. `"error"` or `"warn"`.
    pub level: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Messages ───────────────────────────────────────────────────

/// All frames exchanged between the controller and an agent.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field. For example, `WsMessage::Ping`
/// serializes to `{"type": "ping"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    // ── Handshake ─────────────────────────────────────────────────
    /// First frame on every connection, agent → controller.
    /// The controller authenticates it and either registers the agent
    /// or closes the socket with a 4xxx code.
    #[serde(rename = "init", rename_all = "camelCase")]
    Init {
        agent_id: String,
        auth_token: String,
    },

    // ── Work Orders ───────────────────────────────────────────────
    /// Dispatch of a run to the target agent.
    #[serde(rename = "EXECUTE_TASK")]
    ExecuteTask { payload: ExecutePayload },

    /// Cancellation of an in-flight run on the target agent.
    #[serde(rename = "CANCEL_TASK")]
    CancelTask { payload: CancelPayload },

    // ── Outcomes ──────────────────────────────────────────────────
    /// Terminal result for a dispatched run.
    #[serde(rename = "result")]
    TaskResult { payload: ResultPayload },

    /// Agent-side failure not attributable to a specific run.
    #[serde(rename = "agent_error")]
    AgentError { payload: ErrorReportPayload },

    // ── Heartbeat ─────────────────────────────────────────────────
    /// Application-level liveness probe.
    #[serde(rename = "ping")]
    Ping,

    /// Liveness response.
    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_frame_wire_format() {
        let msg = WsMessage::Init {
            agent_id: "build-01".into(),
            auth_token: "s3cr3t-token".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "init");
        assert_eq!(json["agentId"], "build-01");
        assert_eq!(json["authToken"], "s3cr3t-token");
    }

    #[test]
    fn execute_frame_round_trip() {
        let mut params = Map::new();
        params.insert("count".into(), Value::from(3));
        let msg = WsMessage::ExecuteTask {
            payload: ExecutePayload {
                task_id: 7,
                run_id: 42,
                name: "nightly-backup".into(),
                interpreter: Interpreter::Bash,
                script: "echo hi".into(),
                params,
                assets: BTreeMap::from([("region".to_string(), "eu-west-1".to_string())]),
                options: Map::new(),
            },
        };

        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"EXECUTE_TASK\""));
        assert!(text.contains("\"taskId\":7"));

        let back: WsMessage = serde_json::from_str(&text).unwrap();
        match back {
            WsMessage::ExecuteTask { payload } => {
                assert_eq!(payload.run_id, 42);
                assert_eq!(payload.interpreter, Interpreter::Bash);
                assert_eq!(payload.assets["region"], "eu-west-1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn result_frame_parses_spec_shape() {
        let text = r#"{
            "type": "result",
            "payload": {
                "taskId": 1, "runId": 2, "name": "t",
                "status": "error", "exitCode": 1,
                "stdout": "", "stderr": "boom", "durationMs": 12
            }
        }"#;
        let msg: WsMessage = serde_json::from_str(text).unwrap();
        match msg {
            WsMessage::TaskResult { payload } => {
                assert_eq!(payload.status, ResultStatus::Error);
                assert_eq!(payload.exit_code, Some(1));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        let res = serde_json::from_str::<WsMessage>(r#"{"type":"mystery"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn interpreter_names() {
        assert_eq!("python".parse::<Interpreter>().unwrap(), Interpreter::Python);
        assert_eq!(Interpreter::Node.extension(), "js");
        assert!("ruby".parse::<Interpreter>().is_err());
    }
}

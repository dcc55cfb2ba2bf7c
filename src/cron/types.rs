//! Cron job document types.
//!
//! Serialized forms use camelCase to match the on-disk jobs document;
//! unknown payload fields round-trip through the flattened extras map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::util::now_ms;

/// A persisted scheduled job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default)]
    pub session_target: SessionTarget,
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(default)]
    pub state: JobState,
}

impl CronJob {
    /// Build a new enabled job with a fresh UUID
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: Payload) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            created_at_ms: now,
            updated_at_ms: now,
            schedule,
            payload,
            session_target: SessionTarget::default(),
            delete_after_run: false,
            isolation: None,
            state: JobState::default(),
        }
    }

    /// One-shot jobs run at most once
    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::At { .. })
    }
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Run once at a fixed instant
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },
    /// Run on a fixed period
    #[serde(rename_all = "camelCase")]
    Every { every_ms: i64 },
    /// Standard 5-field cron expression, evaluated in `tz` (host-local
    /// when unset)
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

/// What a job run does
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub kind: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Fields this core does not interpret, preserved on round-trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Payload {
    pub fn agent_turn(text: impl Into<String>) -> Self {
        Self {
            kind: "agentTurn".to_string(),
            text: text.into(),
            model: None,
            timeout_seconds: default_timeout_seconds(),
            extra: Map::new(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    300
}

/// Which session a job's output lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    #[default]
    Main,
    Isolated,
}

/// How an isolated run reports back to the main session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Isolation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_to_main_prefix: Option<String>,
    #[serde(default)]
    pub post_to_main_mode: IsolationMode,
    #[serde(default = "default_isolation_max_chars")]
    pub post_to_main_max_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Summary,
    Full,
}

fn default_isolation_max_chars() -> usize {
    8000
}

/// Mutable scheduler-owned state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Set while a run is in flight; the single scheduling task is the
    /// only writer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

/// One line of a job's append-only run history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub ts_ms: i64,
    pub status: RunStatus,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_job_document_round_trip() {
        let json = r#"{
            "id": "7f4e2a7e-6f2e-4b2e-9b8e-000000000001",
            "name": "morning brief",
            "enabled": true,
            "createdAtMs": 1700000000000,
            "updatedAtMs": 1700000000000,
            "schedule": {"kind": "cron", "expr": "0 9 * * *", "tz": "UTC"},
            "payload": {"kind": "agentTurn", "text": "brief me", "timeoutSeconds": 300,
                        "customField": {"nested": true}},
            "sessionTarget": "isolated",
            "deleteAfterRun": false,
            "isolation": {"postToMainPrefix": "Cron",
                          "postToMainMode": "summary",
                          "postToMainMaxChars": 8000},
            "state": {"nextRunAtMs": 1700003600000}
        }"#;

        let job: CronJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.name, "morning brief");
        assert_eq!(job.session_target, SessionTarget::Isolated);
        assert!(matches!(job.schedule, Schedule::Cron { ref expr, .. } if expr == "0 9 * * *"));
        assert_eq!(job.payload.timeout_seconds, 300);
        // Unknown payload fields survive the round-trip
        assert!(job.payload.extra.contains_key("customField"));

        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back["schedule"]["kind"], "cron");
        assert_eq!(back["payload"]["customField"]["nested"], true);
        assert_eq!(back["isolation"]["postToMainMode"], "summary");
        assert_eq!(back["state"]["nextRunAtMs"], 1_700_003_600_000i64);
    }

    #[test]
    fn test_schedule_tag_forms() {
        let at: Schedule = serde_json::from_str(r#"{"kind":"at","atMs":123}"#).unwrap();
        assert_eq!(at, Schedule::At { at_ms: 123 });

        let every: Schedule = serde_json::from_str(r#"{"kind":"every","everyMs":60000}"#).unwrap();
        assert_eq!(every, Schedule::Every { every_ms: 60_000 });

        let cron: Schedule = serde_json::from_str(r#"{"kind":"cron","expr":"* * * * *"}"#).unwrap();
        assert!(matches!(cron, Schedule::Cron { tz: None, .. }));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = CronJob::new(
            "test",
            Schedule::Every { every_ms: 1000 },
            Payload::agent_turn("hello"),
        );
        assert!(job.enabled);
        assert!(!job.delete_after_run);
        assert_eq!(job.session_target, SessionTarget::Main);
        assert!(job.state.next_run_at_ms.is_none());
        assert!(!job.is_one_shot());
        assert!(Uuid::parse_str(&job.id).is_ok());

        let one_shot = CronJob::new(
            "once",
            Schedule::At { at_ms: 1 },
            Payload::agent_turn("x"),
        );
        assert!(one_shot.is_one_shot());
    }
}

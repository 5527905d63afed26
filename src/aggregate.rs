//! Merge per-server outcomes into one response.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::dispatch::{InvocationOutcome, OutcomeStatus};

/// Status of a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OverallStatus {
    /// Every target returned a result.
    Ok,
    /// Some targets did, some did not.
    PartialFailure,
    /// No target returned a result.
    Failed,
    /// The arguments were invalid for every target; nothing was sent.
    Rejected,
}

impl OverallStatus {
    pub fn from_outcomes(outcomes: &[InvocationOutcome]) -> Self {
        if outcomes.is_empty() {
            return Self::Failed;
        }
        if outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::ValidationError)
        {
            return Self::Rejected;
        }
        let ok = outcomes.iter().filter(|o| o.is_ok()).count();
        match ok {
            0 => Self::Failed,
            n if n == outcomes.len() => Self::Ok,
            _ => Self::PartialFailure,
        }
    }
}

/// Everything a request produced, ordered by server name.
#[derive(Debug, Clone)]
pub struct AggregatedResponse {
    pub request_id: Uuid,
    pub tool_name: String,
    pub outcomes: Vec<InvocationOutcome>,
    pub overall_status: OverallStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl AggregatedResponse {
    pub fn new(
        request_id: Uuid,
        tool_name: impl Into<String>,
        mut outcomes: Vec<InvocationOutcome>,
        started_at: DateTime<Utc>,
    ) -> Self {
        outcomes.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        Self {
            request_id,
            tool_name: tool_name.into(),
            overall_status: OverallStatus::from_outcomes(&outcomes),
            outcomes,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn outcome(&self, server: &str) -> Option<&InvocationOutcome> {
        self.outcomes.iter().find(|o| o.server_name == server)
    }

    pub fn successes(&self) -> impl Iterator<Item = &InvocationOutcome> {
        self.outcomes.iter().filter(|o| o.is_ok())
    }

    /// JSON handed back to the agent.
    pub fn to_agent_value(&self) -> Value {
        let results: Vec<Value> = self
            .outcomes
            .iter()
            .map(|outcome| {
                let mut entry = Map::new();
                entry.insert("server".into(), json!(outcome.server_name));
                entry.insert("tool".into(), json!(outcome.tool_name));
                entry.insert("status".into(), json!(outcome.status));
                if let Some(payload) = &outcome.payload {
                    entry.insert("result".into(), payload.clone());
                }
                if let Some(detail) = &outcome.error_detail {
                    entry.insert("error".into(), json!(detail));
                }
                entry.insert(
                    "latency_ms".into(),
                    json!(outcome.latency.as_millis() as u64),
                );
                Value::Object(entry)
            })
            .collect();

        json!({
            "request_id": self.request_id.to_string(),
            "tool": self.tool_name,
            "status": self.overall_status,
            "results": results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ok(server: &str) -> InvocationOutcome {
        InvocationOutcome::ok(server, "search", json!({"hits": 1}), Duration::from_millis(12))
    }

    fn failed(server: &str, status: OutcomeStatus) -> InvocationOutcome {
        InvocationOutcome::failed(server, "search", status, "boom", Duration::ZERO, false)
    }

    #[test]
    fn overall_status_rules() {
        assert_eq!(
            OverallStatus::from_outcomes(&[ok("a"), ok("b")]),
            OverallStatus::Ok
        );
        assert_eq!(
            OverallStatus::from_outcomes(&[ok("a"), failed("b", OutcomeStatus::Timeout)]),
            OverallStatus::PartialFailure
        );
        assert_eq!(
            OverallStatus::from_outcomes(&[
                failed("a", OutcomeStatus::Timeout),
                failed("b", OutcomeStatus::ValidationError),
            ]),
            OverallStatus::Failed
        );
        assert_eq!(
            OverallStatus::from_outcomes(&[failed("a", OutcomeStatus::ValidationError)]),
            OverallStatus::Rejected
        );
    }

    #[test]
    fn outcomes_are_ordered_by_server() {
        let response = AggregatedResponse::new(
            Uuid::new_v4(),
            "search",
            vec![ok("zeta"), failed("alpha", OutcomeStatus::ServerError), ok("mid")],
            Utc::now(),
        );
        let order: Vec<&str> = response
            .outcomes
            .iter()
            .map(|o| o.server_name.as_str())
            .collect();
        assert_eq!(order, vec!["alpha", "mid", "zeta"]);
        assert_eq!(response.overall_status, OverallStatus::PartialFailure);
        assert_eq!(response.successes().count(), 2);
        assert!(response.completed_at >= response.started_at);
    }

    #[test]
    fn agent_value_keeps_provenance() {
        let id = Uuid::new_v4();
        let response = AggregatedResponse::new(
            id,
            "search",
            vec![ok("b"), failed("a", OutcomeStatus::Timeout)],
            Utc::now(),
        );
        assert_eq!(
            response.to_agent_value(),
            json!({
                "request_id": id.to_string(),
                "tool": "search",
                "status": "partial_failure",
                "results": [
                    {"server": "a", "tool": "search", "status": "timeout", "error": "boom", "latency_ms": 0},
                    {"server": "b", "tool": "search", "status": "ok", "result": {"hits": 1}, "latency_ms": 12},
                ],
            })
        );
    }
}

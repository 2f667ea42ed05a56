//! Status documents distilled from a run's terminal stats event.

use crate::eventapi::{EventTime, StatusJobEvent};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// All counts are taken for this inventory host.
const HOST: &str = "localhost";

/// Summary of one run. Two statuses are equal when their four counts are
/// equal; the completion timestamp is deliberately ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub ok: i64,
    pub changed: i64,
    pub skipped: i64,
    pub failures: i64,
    pub completion: EventTime,
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.ok == other.ok
            && self.changed == other.changed
            && self.skipped == other.skipped
            && self.failures == other.failures
    }
}

impl Status {
    /// Distill a terminal stats event into a status.
    pub fn from_stats_event(event: &StatusJobEvent) -> Self {
        let count = |counts: &std::collections::HashMap<String, i64>| {
            counts.get(HOST).copied().unwrap_or(0)
        };
        Status {
            ok: count(&event.event_data.ok),
            changed: count(&event.event_data.changed),
            skipped: count(&event.event_data.skipped),
            failures: count(&event.event_data.failures),
            completion: event.created,
        }
    }

    /// Rebuild a status from a CR's stored status map, tolerating missing or
    /// oddly typed fields.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let count = |key: &str| map.get(key).and_then(Value::as_i64).unwrap_or(0);
        let completion = map
            .get("completion")
            .and_then(Value::as_str)
            .and_then(|s| EventTime::parse(s).ok())
            .unwrap_or_default();
        Status {
            ok: count("ok"),
            changed: count("changed"),
            skipped: count("skipped"),
            failures: count("failures"),
            completion,
        }
    }
}

/// Status written back to the CR: the latest run plus a rolling history of
/// prior summaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceStatus {
    #[serde(flatten)]
    pub status: Status,
    #[serde(rename = "reason", default, skip_serializing_if = "String::is_empty")]
    pub failure_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Status>,
}

/// Merge the terminal event of a run into an existing status map.
///
/// Returns `(false, _)` when the counts are unchanged; otherwise the previous
/// status is appended to the history and the fresh one takes its place.
pub fn update_resource_status(
    existing: &Map<String, Value>,
    event: &StatusJobEvent,
) -> (bool, ResourceStatus) {
    let new_status = Status::from_stats_event(event);
    let old_status = Status::from_map(existing);
    if new_status == old_status {
        return (false, ResourceStatus::default());
    }

    let mut history: Vec<Status> = existing
        .get("history")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_object)
                .map(Status::from_map)
                .collect()
        })
        .unwrap_or_default();
    history.push(old_status);
    (
        true,
        ResourceStatus {
            status: new_status,
            failure_message: String::new(),
            history,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventapi::{JobEvent, PLAYBOOK_ON_STATS};

    use serde_json::json;

    fn stats_event(ok: i64, changed: i64, skipped: i64, failures: i64) -> StatusJobEvent {
        let event = JobEvent {
            event: PLAYBOOK_ON_STATS.into(),
            event_data: json!({
                "ok": {"localhost": ok},
                "changed": {"localhost": changed},
                "skipped": {"localhost": skipped},
                "failures": {"localhost": failures},
            })
            .as_object()
            .unwrap()
            .clone(),
            created: EventTime::parse("2024-05-14T08:22:31.000000009").unwrap(),
            ..JobEvent::default()
        };
        StatusJobEvent::try_from(&event).unwrap()
    }

    #[test]
    fn distills_counts_with_missing_hosts_defaulting_to_zero() {
        let event = JobEvent {
            event: PLAYBOOK_ON_STATS.into(),
            event_data: json!({"ok": {"localhost": 2}, "changed": {"localhost": 1}})
                .as_object()
                .unwrap()
                .clone(),
            ..JobEvent::default()
        };
        let status = Status::from_stats_event(&StatusJobEvent::try_from(&event).unwrap());
        assert_eq!(status.ok, 2);
        assert_eq!(status.changed, 1);
        assert_eq!(status.skipped, 0);
        assert_eq!(status.failures, 0);
    }

    #[test]
    fn equality_ignores_completion_time() {
        let mut a = Status::from_stats_event(&stats_event(2, 1, 0, 0));
        let b = Status::from_stats_event(&stats_event(2, 1, 0, 0));
        a.completion = EventTime::parse("2030-01-01T00:00:00.0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unchanged_counts_yield_no_update() {
        let existing = json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0})
            .as_object()
            .unwrap()
            .clone();
        let (changed, _) = update_resource_status(&existing, &stats_event(2, 1, 0, 0));
        assert!(!changed);
    }

    #[test]
    fn changed_counts_append_previous_status_to_history() {
        let existing = json!({
            "ok": 2, "changed": 1, "skipped": 0, "failures": 0,
            "completion": "2024-05-14T08:22:31.000000009",
            "history": [{"ok": 1, "changed": 0, "skipped": 0, "failures": 0}],
        })
        .as_object()
        .unwrap()
        .clone();
        let (changed, resource_status) = update_resource_status(&existing, &stats_event(3, 2, 0, 0));
        assert!(changed);
        assert_eq!(resource_status.status.ok, 3);
        assert_eq!(resource_status.history.len(), 2);
        assert_eq!(resource_status.history[0].ok, 1);
        assert_eq!(resource_status.history[1].ok, 2);
    }

    #[test]
    fn serializes_inline_with_optional_fields_elided() {
        let status = ResourceStatus {
            status: Status::from_stats_event(&stats_event(2, 1, 0, 0)),
            ..ResourceStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["ok"], json!(2));
        assert_eq!(value["completion"], json!("2024-05-14T08:22:31.000000009"));
        assert!(value.get("reason").is_none());
        assert!(value.get("history").is_none());
    }
}

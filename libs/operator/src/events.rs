//! Sinks for job events emitted while a run is in flight.

use crate::eventapi::{JobEvent, PLAYBOOK_ON_TASK_START, RUNNER_ON_FAILED, RUNNER_ON_OK};

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tracing::{error, info};

const TASK_ACTION_SET_FACT: &str = "set_fact";
const TASK_ACTION_DEBUG: &str = "debug";

/// How chatty the built-in logging handler is.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Emit nothing.
    Nothing,
    /// One line per meaningful task transition.
    #[default]
    Tasks,
    /// Additionally dump every event's data.
    Everything,
}

/// A sink invoked with every event of a run. Handlers for one event run
/// concurrently with each other; no relative ordering is guaranteed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, cr: Arc<DynamicObject>, event: JobEvent);
}

/// Built-in handler logging task-level progress of a run.
pub struct LoggingEventHandler {
    pub log_level: LogLevel,
}

impl LoggingEventHandler {
    pub fn new(log_level: LogLevel) -> Self {
        LoggingEventHandler { log_level }
    }
}

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, cr: Arc<DynamicObject>, event: JobEvent) {
        let Some(line) = line_for(self.log_level, &event) else {
            return;
        };
        let gvk = cr
            .types
            .as_ref()
            .map(|t| format!("{}/{}", t.api_version, t.kind))
            .unwrap_or_default();
        let namespace = cr.meta().namespace.clone().unwrap_or_default();
        let name = cr.name_any();
        match line.level {
            LineLevel::Info => {
                info!(component = "logging_event_handler", %gvk, %namespace, %name, event_type = %event.event, "{}", line.message)
            }
            LineLevel::Error => {
                error!(component = "logging_event_handler", %gvk, %namespace, %name, event_type = %event.event, "{}", line.message)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineLevel {
    Info,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
struct LogLine {
    level: LineLevel,
    message: String,
}

/// Decide what, if anything, to log for an event.
fn line_for(level: LogLevel, event: &JobEvent) -> Option<LogLine> {
    if level == LogLevel::Nothing {
        return None;
    }

    if let Some(task) = event.event_data.get("task") {
        let action = event.event_data.get("task_action").and_then(|a| a.as_str());
        let quiet_action = matches!(action, Some(TASK_ACTION_SET_FACT) | Some(TASK_ACTION_DEBUG));

        if event.event == PLAYBOOK_ON_TASK_START && !quiet_action {
            let name = event.event_data.get("name").cloned().unwrap_or_default();
            return Some(LogLine {
                level: LineLevel::Info,
                message: format!("[playbook task]: {name}"),
            });
        }
        if event.event == RUNNER_ON_OK && action == Some(TASK_ACTION_DEBUG) {
            let args = event.event_data.get("task_args").cloned().unwrap_or_default();
            return Some(LogLine {
                level: LineLevel::Info,
                message: format!("[playbook debug]: {args}"),
            });
        }
        if event.event == RUNNER_ON_FAILED {
            let args = event.event_data.get("task_args").cloned().unwrap_or_default();
            return Some(LogLine {
                level: LineLevel::Error,
                message: format!("[failed]: [playbook task] '{task}' failed with task_args - {args}"),
            });
        }
    }

    if level == LogLevel::Everything {
        let data = serde_json::Value::Object(event.event_data.clone());
        return Some(LogLine {
            level: LineLevel::Info,
            message: format!("event: {data}"),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn event(name: &str, data: serde_json::Value) -> JobEvent {
        JobEvent {
            event: name.into(),
            event_data: data.as_object().unwrap().clone(),
            ..JobEvent::default()
        }
    }

    #[test]
    fn nothing_logs_nothing() {
        let e = event(RUNNER_ON_FAILED, json!({"task": "deploy"}));
        assert_eq!(line_for(LogLevel::Nothing, &e), None);
    }

    #[test]
    fn tasks_logs_task_start_unless_quiet_action() {
        let start = event(
            PLAYBOOK_ON_TASK_START,
            json!({"task": "deploy", "name": "deploy the app"}),
        );
        let line = line_for(LogLevel::Tasks, &start).unwrap();
        assert_eq!(line.level, LineLevel::Info);
        assert!(line.message.contains("deploy the app"));

        let quiet = event(
            PLAYBOOK_ON_TASK_START,
            json!({"task": "set vars", "task_action": "set_fact"}),
        );
        assert_eq!(line_for(LogLevel::Tasks, &quiet), None);
    }

    #[test]
    fn tasks_logs_debug_output_and_failures() {
        let debug = event(
            RUNNER_ON_OK,
            json!({"task": "debug", "task_action": "debug", "task_args": "msg=hello"}),
        );
        let line = line_for(LogLevel::Tasks, &debug).unwrap();
        assert!(line.message.contains("msg=hello"));

        let failed = event(
            RUNNER_ON_FAILED,
            json!({"task": "deploy", "task_args": "state=present"}),
        );
        let line = line_for(LogLevel::Tasks, &failed).unwrap();
        assert_eq!(line.level, LineLevel::Error);
        assert!(line.message.contains("deploy"));
    }

    #[test]
    fn everything_dumps_taskless_events() {
        let e = event("playbook_on_start", json!({"playbook": "site.yaml"}));
        assert_eq!(line_for(LogLevel::Tasks, &e), None);
        let line = line_for(LogLevel::Everything, &e).unwrap();
        assert!(line.message.contains("site.yaml"));
    }
}

//! Shared operator state and per-GVK controller registration.

use crate::error::Error;
use crate::events::{EventHandler, LogLevel, LoggingEventHandler};
use crate::metrics::Metrics;
use crate::reconcile::reconcile;
use crate::runner::{AnsibleRunner, Runner, RunnerSettings};
use crate::watches::WatchMap;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, ResourceExt};
use kube::client::Client;
use kube::discovery::ApiResource;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Process-wide knobs resolved from flags and environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Namespace scope for all watches; `None` watches everywhere.
    pub watch_namespace: Option<String>,
    /// Period of the forced re-reconcile of every watched object.
    pub resync_period: Duration,
    /// Requeue delay after a run that reported host failures.
    pub failure_requeue: Duration,
    pub runner: RunnerSettings,
    pub runner_log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            proxy_host: "localhost".to_string(),
            proxy_port: 8888,
            watch_namespace: None,
            resync_period: Duration::from_secs(60),
            failure_requeue: Duration::from_secs(60),
            runner: RunnerSettings::default(),
            runner_log_level: LogLevel::default(),
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "ansible-operator".into(),
        }
    }
}

/// Context injected into every reconcile invocation of one GVK's controller.
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// The watched resource's typing information
    pub api_resource: ApiResource,
    /// Engine binding for this GVK
    pub runner: Arc<dyn Runner>,
    /// Sinks receiving every job event
    pub event_handlers: Vec<Arc<dyn EventHandler>>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub failure_requeue: Duration,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
    settings: Settings,
}

impl State {
    pub fn new(mut registry: Registry, settings: Settings) -> Self {
        let metrics = Metrics::default().register(&mut registry);
        State {
            diagnostics: Arc::default(),
            metrics: Arc::new(metrics),
            registry: Arc::new(registry),
            settings,
        }
    }

    /// Encoded metrics for the scrape endpoint.
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn to_context(
        &self,
        client: Client,
        api_resource: ApiResource,
        runner: Arc<dyn Runner>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client,
            api_resource,
            runner,
            event_handlers: vec![Arc::new(LoggingEventHandler::new(
                self.settings.runner_log_level,
            ))],
            proxy_host: self.settings.proxy_host.clone(),
            proxy_port: self.settings.proxy_port,
            failure_requeue: self.settings.failure_requeue,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        msg = "failed reconciliation",
        namespace = %obj.namespace().unwrap_or_default(),
        name = %obj.name_any(),
        %error
    );
    ctx.metrics
        .reconcile_failure(&ctx.api_resource.kind, &obj.name_any(), error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Forced resync ticks, the framework-period half of `RESYNC_PERIOD`.
fn resync_stream(period: Duration) -> impl futures::Stream<Item = ()> {
    futures::stream::unfold(tokio::time::interval(period), |mut interval| async move {
        interval.tick().await;
        Some(((), interval))
    })
}

/// Register one controller per watched GVK and drive them all to completion.
///
/// Exits the process when a watched CRD is not queryable; everything else is
/// surfaced through per-reconcile errors.
pub async fn run_controllers(state: State, client: Client, watches: WatchMap) {
    let mut controllers = Vec::new();
    for (gvk, binding) in watches {
        let api_resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = match &state.settings.watch_namespace {
            Some(namespace) => Api::namespaced_with(client.clone(), namespace, &api_resource),
            None => Api::all_with(client.clone(), &api_resource),
        };
        if let Err(e) = api.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            std::process::exit(1);
        }

        info!(
            msg = "watching",
            group = %gvk.group,
            version = %gvk.version,
            kind = %gvk.kind,
            namespace = state.settings.watch_namespace.as_deref().unwrap_or("*"),
        );
        let runner = Arc::new(AnsibleRunner::new(binding, state.settings.runner.clone()));
        let ctx = state.to_context(client.clone(), api_resource.clone(), runner);
        let controller = Controller::new_with(api, watcher::Config::default().any_semantic(), api_resource)
            // debounce to filter out reconcile calls that happen in quick succession (only taking the latest)
            .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
            .reconcile_all_on(resync_stream(state.settings.resync_period))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));
        controllers.push(controller);
    }

    state.metrics.ready.set(controllers.len() as i64);
    futures::future::join_all(controllers).await;
}

//! The per-GVK reconciliation state machine.

use crate::controller::Context;
use crate::error::{Error, Result};
use crate::eventapi::{StatusJobEvent, PLAYBOOK_ON_STATS};
use crate::status::{update_resource_status, ResourceStatus, Status};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

use ansible_operator_proxy::kubeconfig;

/// Drive one CR toward its declared state by running the engine and folding
/// the outcome back into the CR's status.
#[instrument(skip(ctx, obj), fields(trace_id))]
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let _timer = ctx.metrics.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = obj.namespace().ok_or_else(|| {
        Error::UserInputError(
            "expected resource to be namespaced, can't reconcile without a namespace".to_owned(),
        )
    })?;
    let name = obj.name_any();
    let kind = ctx.api_resource.kind.clone();

    info!(msg = "reconciling", %kind, %namespace, %name);

    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &namespace, &ctx.api_resource);
    let pp = PostParams::default();

    // The delivered object may be stale; work on the live one.
    let Some(mut cr) = api.get_opt(&name).await? else {
        debug!(msg = "resource gone", %name);
        return Ok(Action::await_change());
    };

    let deleting = cr.metadata.deletion_timestamp.is_some();
    if let Some(finalizer) = ctx.runner.finalizer() {
        let present = cr.finalizers().iter().any(|f| f == finalizer);
        if !deleting && !present {
            cr.finalizers_mut().push(finalizer.to_string());
            api.replace(&name, &pp, &cr).await?;
            // The update event brings us right back here.
            return Ok(Action::await_change());
        }
        if deleting && !present {
            // Deletion already unblocked; nothing left for us to do.
            return Ok(Action::await_change());
        }
    }

    // Everything below expects spec and status to be maps.
    if !cr.data.is_object() {
        cr.data = json!({});
    }
    for key in ["spec", "status"] {
        if !cr.data[key].is_object() {
            debug!(msg = "normalizing shape", %key, %name);
            cr.data[key] = json!({});
            api.replace(&name, &pp, &cr).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
    }

    let status_is_empty = cr.data["status"]
        .as_object()
        .map(|status| status.is_empty())
        .unwrap_or(true);
    if status_is_empty {
        cr.data["status"]["phase"] = json!("Creating");
        cr = api.replace(&name, &pp, &cr).await?;
    }

    let owner_ref = OwnerReference {
        api_version: ctx.api_resource.api_version.clone(),
        kind: ctx.api_resource.kind.clone(),
        name: name.clone(),
        uid: cr.metadata.uid.clone().unwrap_or_default(),
        ..OwnerReference::default()
    };

    // Dropped on every return path below, deleting the file.
    let kubeconfig = kubeconfig::create(&owner_ref, &ctx.proxy_host, ctx.proxy_port, &namespace)
        .map_err(Error::KubeconfigError)?;

    let mut events = ctx.runner.run(&cr, kubeconfig.path()).await?;

    let shared_cr = Arc::new(cr.clone());
    let mut terminal: Option<StatusJobEvent> = None;
    while let Some(event) = events.recv().await {
        ctx.metrics.job_event_inc(&kind, &event.event);
        for handler in &ctx.event_handlers {
            let handler = handler.clone();
            let handler_cr = shared_cr.clone();
            let handler_event = event.clone();
            tokio::spawn(async move { handler.handle(handler_cr, handler_event).await });
        }
        if event.event == PLAYBOOK_ON_STATS {
            terminal = Some(StatusJobEvent::try_from(&event)?);
        }
    }

    let Some(terminal) = terminal else {
        return Err(Error::MissingStatsEvent);
    };
    let failed = terminal.any_failures();
    let mut needs_update = false;

    if deleting && !failed {
        if let Some(finalizer) = ctx.runner.finalizer() {
            let finalizers = cr.finalizers_mut();
            if let Some(position) = finalizers.iter().position(|f| f == finalizer) {
                finalizers.remove(position);
                needs_update = true;
            }
        }
    }

    match cr.data["status"].as_object().cloned() {
        Some(existing) => {
            let (changed, merged) = update_resource_status(&existing, &terminal);
            if changed {
                cr.data["status"] = serde_json::to_value(&merged)?;
                needs_update = true;
            }
        }
        None => {
            let first = ResourceStatus {
                status: Status::from_stats_event(&terminal),
                ..ResourceStatus::default()
            };
            info!(msg = "adding status for the first time", %name);
            cr.data["status"] = serde_json::to_value(&first)?;
            needs_update = true;
        }
    }

    if needs_update {
        api.replace(&name, &pp, &cr).await?;
    }

    if failed {
        Ok(Action::requeue(ctx.failure_requeue))
    } else {
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Context;
    use crate::eventapi::{EventTime, JobEvent};
    use crate::runner::Runner;

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use assert_json_diff::assert_json_include;
    use async_trait::async_trait;
    use http::{Request, Response};
    use kube::api::GroupVersionKind;
    use kube::client::Body;
    use kube::discovery::ApiResource;
    use kube::Client;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    const FINALIZER: &str = "finalizer.app.example.com";

    fn stats_event(ok: i64, changed: i64, failures: i64) -> JobEvent {
        JobEvent {
            counter: 99,
            event: PLAYBOOK_ON_STATS.into(),
            event_data: json!({
                "ok": {"localhost": ok},
                "changed": {"localhost": changed},
                "skipped": {},
                "failures": if failures > 0 { json!({"localhost": failures}) } else { json!({}) },
            })
            .as_object()
            .unwrap()
            .clone(),
            created: EventTime::parse("2024-05-14T08:22:31.000000009").unwrap(),
            ..JobEvent::default()
        }
    }

    fn task_event(counter: i64) -> JobEvent {
        JobEvent {
            counter,
            event: "runner_on_ok".into(),
            event_data: json!({"task": "deploy"}).as_object().unwrap().clone(),
            ..JobEvent::default()
        }
    }

    /// Scripted stand-in for the engine.
    struct FakeRunner {
        finalizer: Option<String>,
        script: Mutex<Vec<JobEvent>>,
        runs: AtomicUsize,
        last_cr: Mutex<Option<DynamicObject>>,
    }

    impl FakeRunner {
        fn new(finalizer: Option<&str>, script: Vec<JobEvent>) -> Arc<Self> {
            Arc::new(FakeRunner {
                finalizer: finalizer.map(str::to_string),
                script: Mutex::new(script),
                runs: AtomicUsize::new(0),
                last_cr: Mutex::new(None),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Runner for FakeRunner {
        async fn run(
            &self,
            cr: &DynamicObject,
            _kubeconfig: &Path,
        ) -> Result<mpsc::Receiver<JobEvent>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_cr.lock().unwrap() = Some(cr.clone());
            let script = std::mem::take(&mut *self.script.lock().unwrap());
            let (tx, rx) = mpsc::channel(20);
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }

        fn finalizer(&self) -> Option<&str> {
            self.finalizer.as_deref()
        }
    }

    fn database(finalizers: Vec<&str>, deleting: bool, status: Value) -> DynamicObject {
        let mut metadata = json!({
            "name": "db1",
            "namespace": "ns",
            "uid": "u1",
        });
        if !finalizers.is_empty() {
            metadata["finalizers"] = json!(finalizers);
        }
        if deleting {
            metadata["deletionTimestamp"] = json!("2024-05-14T08:00:00Z");
        }
        serde_json::from_value(json!({
            "apiVersion": "app.example.com/v1",
            "kind": "Database",
            "metadata": metadata,
            "spec": {"replicaCount": 3},
            "status": status,
        }))
        .unwrap()
    }

    fn api_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("app.example.com", "v1", "Database"))
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    /// Wraps the mock apiserver handle with chainable request expectations.
    struct ApiServerVerifier(ApiServerHandle);

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        fn run<F, Fut>(self, scenario: F) -> tokio::task::JoinHandle<()>
        where
            F: FnOnce(Self) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = Self> + Send,
        {
            tokio::spawn(async move {
                scenario(self).await;
            })
        }

        async fn handle_get(mut self, cr: DynamicObject) -> Self {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert!(
                request.uri().path().ends_with("/namespaces/ns/databases/db1"),
                "unexpected uri: {}",
                request.uri()
            );
            let response = serde_json::to_vec(&cr).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            self
        }

        /// Expect a PUT of the object, assert on the body, echo it back.
        async fn handle_replace<F: FnOnce(&DynamicObject) + Send>(mut self, check: F) -> Self {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PUT);
            assert!(
                request.uri().path().ends_with("/namespaces/ns/databases/db1"),
                "unexpected uri: {}",
                request.uri()
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let replaced: DynamicObject = serde_json::from_slice(&body).unwrap();
            check(&replaced);
            let response = serde_json::to_vec(&replaced).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            self
        }
    }

    impl Context {
        fn test(runner: Arc<FakeRunner>) -> (Arc<Self>, ApiServerVerifier) {
            let (mock_service, handle) =
                tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(mock_service, "default");
            let ctx = Context {
                client,
                api_resource: api_resource(),
                runner,
                event_handlers: Vec::new(),
                proxy_host: "localhost".to_string(),
                proxy_port: 8888,
                failure_requeue: Duration::from_secs(60),
                diagnostics: Default::default(),
                metrics: Default::default(),
            };
            (Arc::new(ctx), ApiServerVerifier(handle))
        }
    }

    #[tokio::test]
    async fn finalizer_is_added_exactly_once_before_any_run() {
        let runner = FakeRunner::new(Some(FINALIZER), vec![]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![], false, json!({}));

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(vec![], false, json!({})))
                .await
                .handle_replace(|replaced| {
                    assert_eq!(replaced.finalizers().to_vec(), vec![FINALIZER.to_string()]);
                })
                .await
        });

        let action = reconcile(Arc::new(cr), ctx).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!("{:?}", kube::runtime::controller::Action::await_change())
        );
        timeout_after_1s(mocks).await;
        assert_eq!(runner.runs(), 0);
    }

    #[tokio::test]
    async fn deleted_object_without_finalizer_never_runs() {
        let runner = FakeRunner::new(Some(FINALIZER), vec![]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![], true, json!({}));

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(vec![], true, json!({}))).await
        });

        reconcile(Arc::new(cr), ctx).await.unwrap();
        timeout_after_1s(mocks).await;
        assert_eq!(runner.runs(), 0);
    }

    #[tokio::test]
    async fn first_run_converges_status_without_requeue() {
        let runner = FakeRunner::new(
            Some(FINALIZER),
            vec![task_event(1), task_event(2), stats_event(2, 1, 0)],
        );
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![FINALIZER], false, json!({}));

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(vec![FINALIZER], false, json!({})))
                .await
                // empty status: first-time phase marker
                .handle_replace(|replaced| {
                    assert_eq!(replaced.data["status"]["phase"], json!("Creating"));
                })
                .await
                // post-run status convergence
                .handle_replace(|replaced| {
                    assert_json_include!(
                        actual: replaced.data.clone(),
                        expected: json!({"status": {"ok": 2, "changed": 1, "skipped": 0, "failures": 0}})
                    );
                    assert!(replaced.data["status"].get("phase").is_none());
                })
                .await
        });

        let action = reconcile(Arc::new(cr), ctx).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!("{:?}", kube::runtime::controller::Action::await_change())
        );
        timeout_after_1s(mocks).await;
        assert_eq!(runner.runs(), 1);
    }

    #[tokio::test]
    async fn host_failures_request_requeue() {
        let runner = FakeRunner::new(None, vec![task_event(1), stats_event(2, 1, 1)]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![], false, json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}));

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(
                vec![],
                false,
                json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
            ))
            .await
            .handle_replace(|replaced| {
                assert_eq!(replaced.data["status"]["failures"], json!(1));
                let history = replaced.data["status"]["history"].as_array().unwrap();
                assert_eq!(history.len(), 1);
                assert_eq!(history[0]["ok"], json!(2));
            })
            .await
        });

        let action = reconcile(Arc::new(cr), ctx.clone()).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!(
                "{:?}",
                kube::runtime::controller::Action::requeue(ctx.failure_requeue)
            )
        );
        timeout_after_1s(mocks).await;
    }

    #[tokio::test]
    async fn unchanged_status_issues_no_update() {
        let existing = json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0});
        let runner = FakeRunner::new(None, vec![stats_event(2, 1, 0)]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![], false, existing.clone());

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(
                vec![],
                false,
                json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
            ))
            .await
        });

        let action = reconcile(Arc::new(cr), ctx).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!("{:?}", kube::runtime::controller::Action::await_change())
        );
        timeout_after_1s(mocks).await;
    }

    #[tokio::test]
    async fn missing_stats_event_is_an_error() {
        let runner = FakeRunner::new(None, vec![task_event(1), task_event(2)]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(vec![], false, json!({"ok": 1, "changed": 0, "skipped": 0, "failures": 0}));

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(
                vec![],
                false,
                json!({"ok": 1, "changed": 0, "skipped": 0, "failures": 0}),
            ))
            .await
        });

        let err = reconcile(Arc::new(cr), ctx).await.unwrap_err();
        assert!(matches!(err, Error::MissingStatsEvent));
        timeout_after_1s(mocks).await;
    }

    #[tokio::test]
    async fn successful_finalizer_run_removes_the_finalizer() {
        let runner = FakeRunner::new(Some(FINALIZER), vec![stats_event(1, 1, 0)]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(
            vec![FINALIZER],
            true,
            json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
        );

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(
                vec![FINALIZER],
                true,
                json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
            ))
            .await
            .handle_replace(|replaced| {
                assert!(replaced.finalizers().is_empty());
                assert_eq!(replaced.data["status"]["ok"], json!(1));
            })
            .await
        });

        let action = reconcile(Arc::new(cr), ctx).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!("{:?}", kube::runtime::controller::Action::await_change())
        );
        timeout_after_1s(mocks).await;
        assert_eq!(runner.runs(), 1);
        let seen = runner.last_cr.lock().unwrap().clone().unwrap();
        assert!(seen.metadata.deletion_timestamp.is_some());
    }

    #[tokio::test]
    async fn failed_finalizer_run_keeps_the_finalizer() {
        let runner = FakeRunner::new(Some(FINALIZER), vec![stats_event(1, 0, 1)]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr = database(
            vec![FINALIZER],
            true,
            json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
        );

        let mocks = api_server.run(|v| async move {
            v.handle_get(database(
                vec![FINALIZER],
                true,
                json!({"ok": 2, "changed": 1, "skipped": 0, "failures": 0}),
            ))
            .await
            .handle_replace(|replaced| {
                assert_eq!(replaced.finalizers().to_vec(), vec![FINALIZER.to_string()]);
                assert_eq!(replaced.data["status"]["failures"], json!(1));
            })
            .await
        });

        let action = reconcile(Arc::new(cr), ctx.clone()).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!(
                "{:?}",
                kube::runtime::controller::Action::requeue(ctx.failure_requeue)
            )
        );
        timeout_after_1s(mocks).await;
    }

    #[tokio::test]
    async fn malformed_spec_is_normalized_and_requeued() {
        let runner = FakeRunner::new(None, vec![]);
        let (ctx, api_server) = Context::test(runner.clone());
        let cr: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "app.example.com/v1",
            "kind": "Database",
            "metadata": {"name": "db1", "namespace": "ns", "uid": "u1"},
            "spec": "not a map",
        }))
        .unwrap();
        let served = cr.clone();

        let mocks = api_server.run(|v| async move {
            v.handle_get(served)
                .await
                .handle_replace(|replaced| {
                    assert_eq!(replaced.data["spec"], json!({}));
                })
                .await
        });

        let action = reconcile(Arc::new(cr), ctx).await.unwrap();
        assert_eq!(
            format!("{action:?}"),
            format!(
                "{:?}",
                kube::runtime::controller::Action::requeue(Duration::from_secs(1))
            )
        );
        timeout_after_1s(mocks).await;
        assert_eq!(runner.runs(), 0);
    }
}

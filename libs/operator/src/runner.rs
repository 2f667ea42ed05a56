//! Launches the external engine for one CR instance and streams its events.

use crate::error::{Error, Result};
use crate::eventapi::{EventReceiver, JobEvent};
use crate::inputdir::InputDir;
use crate::params::map_to_snake;
use crate::watches::{Binding, Finalizer, Target};

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

const ENGINE: &str = "ansible-runner";

/// Process-wide runner configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Root under which per-CR input directories are materialized.
    pub base_dir: PathBuf,
    /// Where per-run event sockets live.
    pub socket_dir: PathBuf,
    /// Wall-clock bound on a single run; overruns kill the child.
    pub timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings {
            base_dir: PathBuf::from("/tmp/ansible-operator/runner"),
            socket_dir: PathBuf::from("/tmp/ansible-operator/eventapi"),
            timeout: Duration::from_secs(600),
        }
    }
}

/// The seam between the reconciler and the engine.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Launch a run for the CR and return its event stream.
    ///
    /// Returns immediately; the stream closes exactly once, after the child
    /// has exited. A deleted CR whose finalizer list does not contain this
    /// binding's finalizer yields an already-closed stream.
    async fn run(
        &self,
        cr: &DynamicObject,
        kubeconfig: &Path,
    ) -> Result<mpsc::Receiver<JobEvent>>;

    /// The binding's finalizer name, if one is declared.
    fn finalizer(&self) -> Option<&str>;
}

/// Runs `ansible-runner` for one GVK binding.
pub struct AnsibleRunner {
    binding: Binding,
    settings: RunnerSettings,
}

enum Selection<'a> {
    Primary,
    Finalizer(&'a Finalizer),
}

impl AnsibleRunner {
    pub fn new(binding: Binding, settings: RunnerSettings) -> Self {
        AnsibleRunner { binding, settings }
    }

    fn select(&self, cr: &DynamicObject) -> Option<Selection<'_>> {
        if cr.metadata.deletion_timestamp.is_none() {
            return Some(Selection::Primary);
        }
        match &self.binding.finalizer {
            Some(finalizer) if cr.finalizers().contains(&finalizer.name) => {
                Some(Selection::Finalizer(finalizer))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Runner for AnsibleRunner {
    async fn run(
        &self,
        cr: &DynamicObject,
        kubeconfig: &Path,
    ) -> Result<mpsc::Receiver<JobEvent>> {
        let name = cr.name_any();
        let namespace = cr.namespace().unwrap_or_default();

        let Some(selection) = self.select(cr) else {
            // Deletion is already unblocked; hand back a closed stream.
            let (_tx, rx) = mpsc::channel(1);
            return Ok(rx);
        };

        let ident = rand::thread_rng().gen::<u64>().to_string();
        let mut receiver = EventReceiver::bind(&ident, &self.settings.socket_dir).await?;
        let events = receiver
            .take_events()
            .ok_or_else(|| Error::EventApiError("event stream already taken".to_string()))?;

        let target = match &selection {
            Selection::Finalizer(finalizer) => finalizer
                .playbook
                .clone()
                .map(Target::Playbook)
                .or_else(|| finalizer.role.clone().map(Target::Role))
                .unwrap_or_else(|| self.binding.target.clone()),
            Selection::Primary => self.binding.target.clone(),
        };

        let finalizer_vars = match &selection {
            Selection::Finalizer(finalizer) => finalizer.vars.as_ref(),
            Selection::Primary => None,
        };
        let parameters = build_parameters(cr, &self.binding, &name, &namespace, finalizer_vars)?;

        let gvk = &self.binding.gvk;
        let input_dir = InputDir {
            path: self
                .settings
                .base_dir
                .join(&gvk.group)
                .join(&gvk.version)
                .join(&gvk.kind)
                .join(&namespace)
                .join(&name),
            target,
            parameters,
            env_vars: BTreeMap::from([(
                "K8S_AUTH_KUBECONFIG".to_string(),
                kubeconfig.display().to_string(),
            )]),
            settings: BTreeMap::from([
                (
                    "runner_http_url".to_string(),
                    receiver.socket_path.display().to_string(),
                ),
                ("runner_http_path".to_string(), receiver.url_path.clone()),
            ]),
        };
        if let Err(e) = input_dir.write().await {
            receiver.close().await;
            return Err(e);
        }

        let (program, args) = build_command(&input_dir.target, &ident, &input_dir.path);
        let child = Command::new(program)
            .args(args)
            .spawn()
            .map_err(|e| Error::RunnerError(format!("failed to launch {ENGINE}: {e}")));
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                receiver.close().await;
                return Err(e);
            }
        };

        let timeout = self.settings.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    info!(component = "runner", job = %ident, %name, %namespace, msg = "ansible-runner exited successfully")
                }
                Ok(Ok(status)) => {
                    error!(component = "runner", job = %ident, %name, %namespace, msg = "ansible-runner failed", %status)
                }
                Ok(Err(e)) => {
                    error!(component = "runner", job = %ident, %name, %namespace, msg = "error waiting for ansible-runner", %e)
                }
                Err(_elapsed) => {
                    error!(component = "runner", job = %ident, %name, %namespace, msg = "run exceeded timeout, killing", timeout_secs = timeout.as_secs());
                    if let Err(e) = child.kill().await {
                        error!(component = "runner", job = %ident, msg = "failed to kill ansible-runner", %e);
                    }
                }
            }
            receiver.close().await;
            if let Some(e) = receiver.drain_error() {
                error!(component = "runner", job = %ident, msg = "error from event api", %e);
            }
        });

        Ok(events)
    }

    fn finalizer(&self) -> Option<&str> {
        self.binding.finalizer.as_ref().map(|f| f.name.as_str())
    }
}

/// Assemble the extravars for a run: the CR spec, finalizer overrides, the
/// `meta` entry and the full object under `_<group>_<kind>`, all snake_cased.
fn build_parameters(
    cr: &DynamicObject,
    binding: &Binding,
    name: &str,
    namespace: &str,
    finalizer_vars: Option<&Map<String, Value>>,
) -> Result<Map<String, Value>> {
    let mut parameters = cr
        .data
        .get("spec")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    if let Some(vars) = finalizer_vars {
        for (key, value) in vars {
            parameters.insert(key.clone(), value.clone());
        }
    }
    parameters.insert(
        "meta".to_string(),
        json!({"namespace": namespace, "name": name}),
    );
    let object_key = format!(
        "_{}_{}",
        binding.gvk.group.replace('.', "_"),
        binding.gvk.kind.to_lowercase()
    );
    parameters.insert(object_key, serde_json::to_value(cr)?);
    Ok(map_to_snake(&parameters))
}

/// Argument vector for one engine invocation.
fn build_command(target: &Target, ident: &str, input_dir: &Path) -> (&'static str, Vec<OsString>) {
    let mut args: Vec<OsString> = vec!["-vv".into()];
    match target {
        Target::Playbook(playbook) => {
            args.push("-p".into());
            args.push(playbook.into());
        }
        Target::Role(role) => {
            args.push("--role".into());
            args.push(role.file_name().map(OsString::from).unwrap_or_default());
            args.push("--roles-path".into());
            args.push(
                role.parent()
                    .map(|p| p.as_os_str().to_os_string())
                    .unwrap_or_default(),
            );
            args.push("--hosts".into());
            args.push("localhost".into());
        }
    }
    args.push("-i".into());
    args.push(ident.into());
    args.push("run".into());
    args.push(input_dir.into());
    (ENGINE, args)
}

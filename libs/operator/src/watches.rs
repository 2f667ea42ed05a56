//! Loader for the watches file mapping GVKs to playbook or role bindings.
//!
//! The file is read once at startup; the resulting map is immutable for the
//! lifetime of the process.

use crate::error::{Error, Result};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kube::api::GroupVersionKind;
use serde::Deserialize;

pub const DEFAULT_WATCHES_FILE: &str = "/opt/ansible/watches.yaml";

/// What a binding ultimately executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Playbook(PathBuf),
    Role(PathBuf),
}

impl Target {
    pub fn path(&self) -> &Path {
        match self {
            Target::Playbook(p) => p,
            Target::Role(p) => p,
        }
    }
}

/// Deletion hook declared on a watch entry.
///
/// Exactly one of `playbook`, `role` or `vars` may be set. A finalizer with
/// only a name reruns the primary target unchanged.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Finalizer {
    pub name: String,
    #[serde(default)]
    pub playbook: Option<PathBuf>,
    #[serde(default)]
    pub role: Option<PathBuf>,
    #[serde(default)]
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One loaded watch entry: the GVK plus what to run for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub gvk: GroupVersionKind,
    pub target: Target,
    pub finalizer: Option<Finalizer>,
}

pub type WatchMap = HashMap<GroupVersionKind, Binding>;

#[derive(Debug, Deserialize)]
struct WatchEntry {
    group: String,
    version: String,
    kind: String,
    #[serde(default)]
    playbook: Option<PathBuf>,
    #[serde(default)]
    role: Option<PathBuf>,
    #[serde(default)]
    finalizer: Option<Finalizer>,
}

/// Read and validate the watches file.
pub fn load(path: &Path) -> Result<WatchMap> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigError(format!("failed to read {}: {e}", path.display())))?;
    let entries: Vec<WatchEntry> = serde_yaml::from_str(&raw)
        .map_err(|e| Error::ConfigError(format!("failed to parse {}: {e}", path.display())))?;

    let mut map = WatchMap::with_capacity(entries.len());
    for entry in entries {
        let gvk = GroupVersionKind::gvk(&entry.group, &entry.version, &entry.kind);
        let binding = validate(&gvk, entry)?;
        if map.insert(gvk.clone(), binding).is_some() {
            return Err(Error::ConfigError(format!(
                "duplicate watch for {}/{}, kind {}",
                gvk.group, gvk.version, gvk.kind
            )));
        }
    }
    Ok(map)
}

fn validate(gvk: &GroupVersionKind, entry: WatchEntry) -> Result<Binding> {
    let target = match (entry.playbook, entry.role) {
        (Some(p), None) => Target::Playbook(p),
        (None, Some(r)) => Target::Role(r),
        (Some(_), Some(_)) => {
            return Err(Error::ConfigError(format!(
                "watch for kind {} declares both a playbook and a role",
                gvk.kind
            )))
        }
        (None, None) => {
            return Err(Error::ConfigError(format!(
                "watch for kind {} declares neither a playbook nor a role",
                gvk.kind
            )))
        }
    };
    require_absolute(gvk, target.path())?;

    if let Some(finalizer) = &entry.finalizer {
        if finalizer.name.is_empty() {
            return Err(Error::ConfigError(format!(
                "finalizer for kind {} has an empty name",
                gvk.kind
            )));
        }
        let forms = [
            finalizer.playbook.is_some(),
            finalizer.role.is_some(),
            finalizer.vars.is_some(),
        ];
        if forms.iter().filter(|set| **set).count() > 1 {
            return Err(Error::ConfigError(format!(
                "finalizer {} must declare only one of playbook, role or vars",
                finalizer.name
            )));
        }
        if let Some(p) = &finalizer.playbook {
            require_absolute(gvk, p)?;
        }
        if let Some(r) = &finalizer.role {
            require_absolute(gvk, r)?;
        }
    }

    Ok(Binding {
        gvk: gvk.clone(),
        target,
        finalizer: entry.finalizer,
    })
}

fn require_absolute(gvk: &GroupVersionKind, path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::ConfigError(format!(
            "path {} for kind {} is not absolute",
            path.display(),
            gvk.kind
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn load_str(yaml: &str) -> Result<WatchMap> {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        load(f.path())
    }

    #[test]
    fn loads_playbook_and_role_entries() {
        let map = load_str(
            r#"
- group: app.example.com
  version: v1alpha1
  kind: Database
  playbook: /opt/ansible/database.yaml
- group: app.example.com
  version: v1alpha1
  kind: Cache
  role: /opt/ansible/roles/cache
"#,
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        let db = &map[&GroupVersionKind::gvk("app.example.com", "v1alpha1", "Database")];
        assert_eq!(
            db.target,
            Target::Playbook(PathBuf::from("/opt/ansible/database.yaml"))
        );
        assert!(db.finalizer.is_none());
        let cache = &map[&GroupVersionKind::gvk("app.example.com", "v1alpha1", "Cache")];
        assert_eq!(cache.target, Target::Role(PathBuf::from("/opt/ansible/roles/cache")));
    }

    #[test]
    fn loads_finalizer_with_vars() {
        let map = load_str(
            r#"
- group: app.example.com
  version: v1alpha1
  kind: Database
  playbook: /opt/ansible/database.yaml
  finalizer:
    name: finalizer.app.example.com
    vars:
      state: absent
"#,
        )
        .unwrap();
        let binding = &map[&GroupVersionKind::gvk("app.example.com", "v1alpha1", "Database")];
        let finalizer = binding.finalizer.as_ref().unwrap();
        assert_eq!(finalizer.name, "finalizer.app.example.com");
        assert_eq!(
            finalizer.vars.as_ref().unwrap()["state"],
            serde_json::json!("absent")
        );
    }

    #[test]
    fn rejects_duplicate_gvk() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
  playbook: /opt/ansible/foo.yaml
- group: app.example.com
  version: v1
  kind: Foo
  playbook: /opt/ansible/other.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate watch"));
    }

    #[test]
    fn rejects_missing_target() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("neither a playbook nor a role"));
    }

    #[test]
    fn rejects_both_targets() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
  playbook: /opt/ansible/foo.yaml
  role: /opt/ansible/roles/foo
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both a playbook and a role"));
    }

    #[test]
    fn rejects_relative_path() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
  playbook: playbooks/foo.yaml
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }

    #[test]
    fn rejects_finalizer_without_name() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
  playbook: /opt/ansible/foo.yaml
  finalizer:
    vars:
      state: absent
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn rejects_finalizer_with_multiple_forms() {
        let err = load_str(
            r#"
- group: app.example.com
  version: v1
  kind: Foo
  playbook: /opt/ansible/foo.yaml
  finalizer:
    name: finalizer.app.example.com
    playbook: /opt/ansible/teardown.yaml
    vars:
      state: absent
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("only one of playbook, role or vars"));
    }
}

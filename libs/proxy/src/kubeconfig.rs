//! Per-reconciliation kubeconfig pointing the engine at the proxy.
//!
//! The owner reference rides in the server URL's userinfo as base64 JSON; the
//! engine's client will present it back as basic auth, where the proxy
//! extracts it. The file lives in a [`tempfile::NamedTempFile`] so it is
//! removed on every reconcile exit path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not serialize kubeconfig: {0}")]
    SerializationError(#[from] serde_yaml::Error),

    #[error("could not serialize owner reference: {0}")]
    OwnerSerializationError(#[from] serde_json::Error),

    #[error("could not write kubeconfig: {0}")]
    IoError(#[from] std::io::Error),
}

/// Write a kubeconfig whose server URL smuggles the owner reference.
///
/// The returned handle deletes the file when dropped.
pub fn create(
    owner: &OwnerReference,
    proxy_host: &str,
    proxy_port: u16,
    namespace: &str,
) -> Result<NamedTempFile, Error> {
    let owner_b64 = BASE64.encode(serde_json::to_vec(owner)?);
    let server = format!("http://{owner_b64}@{proxy_host}:{proxy_port}");
    let context = format!("{namespace}/proxy-server");

    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "proxy-server",
            "cluster": {
                "insecure-skip-tls-verify": true,
                "server": server,
            },
        }],
        "users": [{
            "name": "admin/proxy-server",
            "user": {},
        }],
        "contexts": [{
            "name": context,
            "context": {
                "cluster": "proxy-server",
                "namespace": namespace,
                "user": "admin/proxy-server",
            },
        }],
        "current-context": context,
        "preferences": {},
    });

    let mut file = NamedTempFile::new()?;
    file.write_all(serde_yaml::to_string(&config)?.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "app/v1".to_string(),
            kind: "Foo".to_string(),
            name: "foo1".to_string(),
            uid: "u1".to_string(),
            ..OwnerReference::default()
        }
    }

    #[test]
    fn embeds_owner_reference_in_server_userinfo() {
        let file = create(&owner(), "localhost", 8888, "ns").unwrap();
        let raw = std::fs::read_to_string(file.path()).unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();

        let server = config["clusters"][0]["cluster"]["server"].as_str().unwrap();
        let userinfo = server
            .strip_prefix("http://")
            .and_then(|s| s.split('@').next())
            .unwrap();
        let decoded = BASE64.decode(userinfo).unwrap();
        let round_tripped: OwnerReference = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(round_tripped, owner());
        assert!(server.ends_with("@localhost:8888"));

        assert_eq!(config["current-context"].as_str().unwrap(), "ns/proxy-server");
        assert_eq!(
            config["contexts"][0]["context"]["namespace"].as_str().unwrap(),
            "ns"
        );
        assert_eq!(
            config["clusters"][0]["cluster"]["insecure-skip-tls-verify"]
                .as_bool()
                .unwrap(),
            true
        );
    }

    #[test]
    fn file_is_removed_on_drop() {
        let file = create(&owner(), "localhost", 8888, "ns").unwrap();
        let path = file.path().to_path_buf();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}

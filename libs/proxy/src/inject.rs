//! Owner-reference injection for create requests.
//!
//! The reconciler smuggles the owning CR's identity to us as JSON, base64
//! encoded in the basic-auth username of the kubeconfig it hands the engine.
//! Every POST passing through the proxy gets that owner reference appended to
//! `metadata.ownerReferences`, so objects the engine creates are garbage
//! collected with their CR.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("basic auth header not found")]
    MissingBasicAuth,

    #[error("could not base64 decode username: {0}")]
    InvalidBase64(#[source] base64::DecodeError),

    #[error("could not deserialize owner reference: {0}")]
    InvalidOwnerJson(#[source] serde_json::Error),

    #[error("could not deserialize request body: {0}")]
    InvalidBody(String),
}

impl InjectError {
    pub fn status(&self) -> StatusCode {
        match self {
            InjectError::MissingBasicAuth => StatusCode::UNAUTHORIZED,
            InjectError::InvalidBase64(_)
            | InjectError::InvalidOwnerJson(_)
            | InjectError::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Decode the owner reference from the request's basic-auth username.
pub fn owner_from_headers(headers: &HeaderMap) -> Result<OwnerReference, InjectError> {
    let user = basic_auth_user(headers).ok_or(InjectError::MissingBasicAuth)?;
    let owner_json = BASE64.decode(user).map_err(InjectError::InvalidBase64)?;
    let owner: OwnerReference =
        serde_json::from_slice(&owner_json).map_err(InjectError::InvalidOwnerJson)?;
    debug!(msg = "decoded owner reference", api_version = %owner.api_version, kind = %owner.kind, name = %owner.name);
    Ok(owner)
}

fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, _password) = credentials.split_once(':')?;
    Some(user.to_string())
}

/// Parse the request body, append the owner reference and re-serialize.
///
/// The body is parsed YAML-tolerantly; maps with non-string keys are coerced
/// to string keys recursively.
pub fn inject_owner_reference(
    body: &[u8],
    owner: &OwnerReference,
) -> Result<Vec<u8>, InjectError> {
    let parsed: serde_yaml::Value =
        serde_yaml::from_slice(body).map_err(|e| InjectError::InvalidBody(e.to_string()))?;
    let mut object = match yaml_to_json(parsed) {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(InjectError::InvalidBody(format!(
                "expected an object, got {other}"
            )))
        }
    };

    let owner_value =
        serde_json::to_value(owner).map_err(|e| InjectError::InvalidBody(e.to_string()))?;
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| serde_json::json!({}));
    let metadata = match metadata.as_object_mut() {
        Some(map) => map,
        None => return Err(InjectError::InvalidBody("metadata is not an object".into())),
    };
    match metadata
        .entry("ownerReferences")
        .or_insert_with(|| serde_json::json!([]))
        .as_array_mut()
    {
        Some(references) => references.push(owner_value),
        None => {
            return Err(InjectError::InvalidBody(
                "metadata.ownerReferences is not a list".into(),
            ))
        }
    }

    serde_json::to_vec(&serde_json::Value::Object(object))
        .map_err(|e| InjectError::InvalidBody(e.to_string()))
}

/// Convert parsed YAML to JSON, stringifying any non-string map keys.
fn yaml_to_json(value: serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                n.as_f64().map(serde_json::Value::from).unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s),
        serde_yaml::Value::Sequence(entries) => {
            serde_json::Value::Array(entries.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(mapping) => serde_json::Value::Object(
            mapping
                .into_iter()
                .map(|(key, value)| (stringify_key(key), yaml_to_json(value)))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn stringify_key(key: serde_yaml::Value) -> String {
    match yaml_to_json(key) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

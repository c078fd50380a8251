// ── Orchestrator commands – one JSON request per line, one response per line ──
//
//   request:  {"id": <any>, "tool": "<name>", "params": {...}}
//   response: {"id": <same>, "ok": true, "result": ...}
//             {"id": <same>, "ok": false, "error": {"kind", "message"}}
//
// `ok` reports whether the request was understood and ran; the outcome of a
// device operation is the `success` flag inside its report.

use crate::report::ReportError;
use crate::service::LabService;
use crate::transfer::{FilePair, SyncOptions};
use lablink_core::LabError;
use lablink_credentials::{CredentialError, CredentialKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

pub const TOOLS: &[&str] = &[
    "resolve",
    "ssh_exec",
    "copy_to_device",
    "copy_from_device",
    "copy_files_parallel",
    "sync_directory",
    "identify",
    "identify_many",
    "verify",
    "verify_fleet",
    "update_ip_if_verified",
    "cache_lookup",
    "cache_rename",
    "cache_clear",
    "credential_cache",
    "credential_remove",
    "credential_list",
    "pool_status",
    "pool_shutdown",
];

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, err: &LabError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ReportError::from(err)),
        }
    }
}

// ── Parameter shapes ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DeviceParams {
    device: String,
}

#[derive(Deserialize)]
struct ExecParams {
    device: String,
    command: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct PushParams {
    device: String,
    local: PathBuf,
    remote: String,
    #[serde(default)]
    mode: Option<i32>,
}

#[derive(Deserialize)]
struct PullParams {
    device: String,
    remote: String,
    local: PathBuf,
}

#[derive(Deserialize)]
struct ParallelParams {
    device: String,
    files: Vec<FilePair>,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Deserialize)]
struct SyncParams {
    device: String,
    local_dir: PathBuf,
    remote_dir: String,
    #[serde(flatten)]
    options: SyncOptions,
}

#[derive(Deserialize)]
struct IdentifyParams {
    ip: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_true")]
    use_cache: bool,
}

#[derive(Deserialize)]
struct IdentifyManyParams {
    ips: Vec<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_true")]
    use_cache: bool,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Deserialize)]
struct VerifyParams {
    device: String,
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Deserialize)]
struct FleetParams {
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Deserialize)]
struct UpdateIpParams {
    device: String,
    new_ip: String,
}

#[derive(Deserialize)]
struct CacheLookupParams {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Deserialize)]
struct CacheRenameParams {
    ip: String,
    friendly_name: String,
}

#[derive(Deserialize)]
struct CredentialParams {
    reference: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    kind: CredentialKind,
}

fn default_true() -> bool {
    true
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T, LabError> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(value).map_err(|e| LabError::InvalidRequest(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, LabError> {
    Ok(serde_json::to_value(value)?)
}

fn credential_error(err: CredentialError) -> LabError {
    match err {
        CredentialError::Storage(inner) => inner,
        other => LabError::InvalidRequest(other.to_string()),
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

pub async fn dispatch(service: &LabService, tool: &str, raw: Value) -> Result<Value, LabError> {
    match tool {
        "resolve" => {
            let p: DeviceParams = params(raw)?;
            to_value(service.resolve(&p.device).await?)
        }
        "ssh_exec" => {
            let p: ExecParams = params(raw)?;
            let timeout = p.timeout_secs.map(Duration::from_secs);
            to_value(service.ssh_exec(&p.device, &p.command, timeout).await)
        }
        "copy_to_device" => {
            let p: PushParams = params(raw)?;
            to_value(service.copy_to_device(&p.device, p.local, &p.remote, p.mode).await)
        }
        "copy_from_device" => {
            let p: PullParams = params(raw)?;
            to_value(service.copy_from_device(&p.device, &p.remote, p.local).await)
        }
        "copy_files_parallel" => {
            let p: ParallelParams = params(raw)?;
            to_value(
                service
                    .copy_files_parallel(&p.device, p.files, p.concurrency)
                    .await,
            )
        }
        "sync_directory" => {
            let p: SyncParams = params(raw)?;
            to_value(
                service
                    .sync_directory(&p.device, p.local_dir, &p.remote_dir, p.options)
                    .await,
            )
        }
        "identify" => {
            let p: IdentifyParams = params(raw)?;
            to_value(
                service
                    .identify(&p.ip, p.username.as_deref(), p.port, p.use_cache)
                    .await,
            )
        }
        "identify_many" => {
            let p: IdentifyManyParams = params(raw)?;
            to_value(
                service
                    .identify_many(p.ips, p.username.as_deref(), p.port, p.use_cache, p.concurrency)
                    .await,
            )
        }
        "verify" => {
            let p: VerifyParams = params(raw)?;
            to_value(service.verify(&p.device, p.ip.as_deref()).await)
        }
        "verify_fleet" => {
            let p: FleetParams = params(raw)?;
            to_value(service.verify_fleet(p.concurrency).await)
        }
        "update_ip_if_verified" => {
            let p: UpdateIpParams = params(raw)?;
            to_value(service.update_ip_if_verified(&p.device, &p.new_ip).await)
        }
        "cache_lookup" => {
            let p: CacheLookupParams = params(raw)?;
            match p.ip {
                Some(ip) => to_value(service.cache_lookup(&ip)),
                None => to_value(service.cache_entries()),
            }
        }
        "cache_rename" => {
            let p: CacheRenameParams = params(raw)?;
            let renamed = service.cache_rename(&p.ip, &p.friendly_name)?;
            Ok(json!({ "updated": renamed }))
        }
        "cache_clear" => {
            let cleared = service.cache_clear()?;
            Ok(json!({ "cleared": cleared }))
        }
        "credential_cache" => {
            let p: CredentialParams = params(raw)?;
            let username = p
                .username
                .ok_or_else(|| LabError::InvalidRequest("missing field `username`".into()))?;
            service
                .cache_credential(&p.reference, &username, p.password, p.kind)
                .map_err(credential_error)?;
            Ok(json!({ "cached": true }))
        }
        "credential_remove" => {
            let p: CredentialParams = params(raw)?;
            let removed = service
                .remove_credential(&p.reference, p.kind)
                .map_err(credential_error)?;
            Ok(json!({ "removed": removed }))
        }
        "credential_list" => to_value(service.list_credentials()),
        "pool_status" => Ok(json!({ "openSessions": service.open_sessions() })),
        "pool_shutdown" => Ok(json!({ "closed": service.shutdown() })),
        other => Err(LabError::InvalidRequest(format!(
            "unknown tool '{}' (known: {})",
            other,
            TOOLS.join(", ")
        ))),
    }
}

/// Handle one protocol line. Never fails; problems become error responses.
pub async fn handle_line(service: &LabService, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return Response::err(
                Value::Null,
                &LabError::InvalidRequest(format!("malformed request: {}", e)),
            )
        }
    };

    log::debug!("request {} -> {}", request.id, request.tool);
    match dispatch(service, &request.tool, request.params).await {
        Ok(result) => Response::ok(request.id, result),
        Err(err) => {
            log::warn!("{} failed: {}", request.tool, err);
            Response::err(request.id, &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_params_become_empty_object() {
        let p: FleetParams = params(Value::Null).unwrap();
        assert!(p.concurrency.is_none());
        let p: CacheLookupParams = params(json!({"ip": "10.0.0.5"})).unwrap();
        assert_eq!(p.ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_missing_field_is_invalid_request() {
        let err = params::<ExecParams>(json!({"device": "sentai-01"})).err().unwrap();
        assert!(matches!(err, LabError::InvalidRequest(_)));
    }

    #[test]
    fn test_sync_params_flatten_options() {
        let p: SyncParams = params(json!({
            "device": "sentai-01",
            "local_dir": "/tmp/app",
            "remote_dir": "/opt/app",
            "exclude": ["*.pyc"],
            "delete": true
        }))
        .unwrap();
        assert_eq!(p.options.exclude, vec!["*.pyc".to_string()]);
        assert!(p.options.delete);
    }

    #[test]
    fn test_identify_defaults_to_cache() {
        let p: IdentifyParams = params(json!({"ip": "10.0.0.5"})).unwrap();
        assert!(p.use_cache);
        let p: CredentialParams = params(json!({"reference": "sentai-01"})).unwrap();
        assert_eq!(p.kind, CredentialKind::Ssh);
    }
}

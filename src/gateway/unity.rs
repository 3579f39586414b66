//! Unity REST Array Gateway
//!
//! Implements [`ArrayGateway`] over the array's REST management API.
//!
//! Every response is reduced to either a JSON payload or an [`ArrayError`]
//! whose kind is classified here from the vendor `errorCode`. The CSRF token
//! required for mutating requests lives in a [`Session`] owned by the gateway
//! instance and is refreshed once when the array answers 401.

use crate::domain::model::{
    colon_delimited, AccessMask, Host, HostAccess, HostLunMapping, HostLunQuery, HostLunType, Initiator,
    InitiatorPath, Lun, LunSpec, Protocol, Snapshot, StorageProcessor, TargetPort,
};
use crate::domain::ports::{ArrayGateway, ArrayResult};
use crate::error::{ArrayError, ArrayErrorKind, Error, Result, CODE_TRANSPORT};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Header carrying the CSRF token on mutating requests
pub const CSRF_HEADER: &str = "EMC-CSRF-TOKEN";

const HOST_TYPE_MANUAL: u32 = 1;
const INITIATOR_TYPE_FC: u32 = 1;
const INITIATOR_TYPE_ISCSI: u32 = 2;
const SNAP_ACCESS_READ_WRITE: u32 = 1;

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for the array management API
#[derive(Debug, Clone, Deserialize)]
pub struct UnityConfig {
    /// Management address (IP or hostname)
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    443
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_username() -> String {
    "Local/admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl Default for UnityConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            scheme: default_scheme(),
            username: default_username(),
            password: String::new(),
            verify_tls: true,
            request_timeout_secs: default_timeout(),
        }
    }
}

impl UnityConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.address, self.port)
    }
}

// =============================================================================
// Session
// =============================================================================

/// Per-gateway session state
#[derive(Debug, Default)]
pub struct Session {
    csrf_token: RwLock<Option<String>>,
}

impl Session {
    pub fn token(&self) -> Option<String> {
        self.csrf_token.read().clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.csrf_token.write() = token;
    }
}

// =============================================================================
// Error Body
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    http_status_code: Option<u16>,
    #[serde(default)]
    messages: Vec<HashMap<String, String>>,
}

fn parse_error(status: StatusCode, body: &str) -> ArrayError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = envelope
                .error
                .messages
                .iter()
                .flat_map(|m| m.values())
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            ArrayError::from_response(
                envelope.error.error_code,
                envelope.error.http_status_code.or(Some(status.as_u16())),
                message,
            )
        }
        Err(_) => ArrayError::from_response(-1, Some(status.as_u16()), body.to_string()),
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Array gateway speaking the REST management API
pub struct UnityRestGateway {
    config: UnityConfig,
    http: reqwest::Client,
    base_url: String,
    session: Session,
}

impl UnityRestGateway {
    pub fn new(config: UnityConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(Error::Configuration("array address must be set".into()));
        }

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        info!("Array gateway targeting {}", config.base_url());

        Ok(Self {
            base_url: config.base_url(),
            config,
            http,
            session: Session::default(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn send(&self, method: Method, rel_url: &str, body: Option<&Value>) -> ArrayResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, rel_url);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Accept", "application/json")
            .header("X-EMC-REST-CLIENT", "true");
        if let Some(token) = self.session.token() {
            request = request.header(CSRF_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!("REQ: {} {}", method, url);
        request
            .send()
            .await
            .map_err(|e| ArrayError::from_response(CODE_TRANSPORT, None, e.to_string()))
    }

    async fn refresh_csrf_token(&self) -> ArrayResult<()> {
        info!("Updating CSRF token");
        let response = self
            .send(Method::GET, "/api/types/user/instances", None)
            .await?;
        let token = response
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if token.is_none() {
            warn!("Array returned no CSRF token");
        }
        self.session.set_token(token);
        Ok(())
    }

    /// Issue a request and return the decoded body, if any
    async fn request(&self, method: Method, rel_url: &str, body: Option<Value>) -> ArrayResult<Option<Value>> {
        let mut response = self.send(method.clone(), rel_url, body.as_ref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh_csrf_token().await?;
            response = self.send(method.clone(), rel_url, body.as_ref()).await?;
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ArrayError::from_response(CODE_TRANSPORT, None, e.to_string()))?;

        if !status.is_success() {
            let err = parse_error(status, &text);
            debug!("RESP: [{}] {} {}: {}", status, method, rel_url, err);
            return Err(err);
        }
        debug!("RESP: [{}] {} {}", status, method, rel_url);

        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text).map(Some).map_err(|e| {
            error!("Undecodable response from {}: {}", rel_url, e);
            ArrayError::from_response(-1, Some(status.as_u16()), e.to_string())
        })
    }

    async fn post(&self, rel_url: &str, body: Value) -> ArrayResult<Option<Value>> {
        self.request(Method::POST, rel_url, Some(body)).await
    }

    /// `GET /api/types/<type>/instances` with a filter expression
    async fn filter_instances(
        &self,
        category: &str,
        conditions: &[(&str, &str, String)],
        fields: &[&str],
    ) -> ArrayResult<Vec<Value>> {
        let mut url = format!("/api/types/{}/instances", category);
        let mut params = Vec::new();
        if !conditions.is_empty() {
            let filter = conditions
                .iter()
                .map(|(field, op, value)| format!("{} {} \"{}\"", field, op, value))
                .collect::<Vec<_>>()
                .join(" and ");
            params.push(format!("filter={}", urlencoding::encode(&filter)));
        }
        if !fields.is_empty() {
            params.push(format!("fields={}", fields.join(",")));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }

        let body = self.request(Method::GET, &url, None).await?;
        Ok(entries(body))
    }

    /// `GET /api/instances/<type>/<id>`; a missing object is `None`
    async fn get_instance(&self, category: &str, id: &str, fields: &[&str]) -> ArrayResult<Option<Value>> {
        let mut url = format!("/api/instances/{}/{}", category, urlencoding::encode(id));
        if !fields.is_empty() {
            url.push_str(&format!("?fields={}", fields.join(",")));
        }
        match self.request(Method::GET, &url, None).await {
            Ok(body) => Ok(body.and_then(|b| b.get("content").cloned())),
            Err(e) if e.is(ArrayErrorKind::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn iscsi_ports(&self) -> ArrayResult<Vec<TargetPort>> {
        let (nodes, portals) = futures::try_join!(
            self.filter_instances("iscsiNode", &[], &["id", "name"]),
            self.filter_instances(
                "iscsiPortal",
                &[],
                &["id", "ipAddress", "ethernetPort", "iscsiNode"],
            ),
        )?;
        let nodes: HashMap<String, String> = nodes
            .iter()
            .filter_map(|n| Some((str_field(n, "id")?, str_field(n, "name")?)))
            .collect();

        Ok(portals
            .iter()
            .filter_map(|p| parse_iscsi_portal(p, &nodes))
            .collect())
    }

    async fn fc_ports(&self) -> ArrayResult<Vec<TargetPort>> {
        let ports = self
            .filter_instances("fcPort", &[], &["id", "wwn", "storageProcessor"])
            .await?;
        Ok(ports.iter().filter_map(parse_fc_port).collect())
    }
}

const HOST_FIELDS: &[&str] = &["id", "name", "fcHostInitiators", "iscsiHostInitiators", "hostLUNs"];
const LUN_FIELDS: &[&str] = &["id", "name", "currentNode", "hostAccess", "storageResource"];
const SNAP_FIELDS: &[&str] = &["id", "name", "lun", "storageResource", "hostAccess"];

#[async_trait]
impl ArrayGateway for UnityRestGateway {
    async fn find_initiator(&self, uid: &str) -> ArrayResult<Option<Initiator>> {
        let found = self
            .filter_instances(
                "hostInitiator",
                &[("initiatorId", "eq", array_uid(uid))],
                &["id", "initiatorId", "type", "parentHost"],
            )
            .await?;
        Ok(found.first().and_then(parse_initiator))
    }

    async fn create_initiator(&self, uid: &str, host_id: &str) -> ArrayResult<Initiator> {
        let protocol = if is_iqn(uid) {
            Protocol::Iscsi
        } else {
            Protocol::Fc
        };
        let initiator_type = match protocol {
            Protocol::Iscsi => INITIATOR_TYPE_ISCSI,
            Protocol::Fc => INITIATOR_TYPE_FC,
        };
        let body = self
            .post(
                "/api/types/hostInitiator/instances",
                json!({
                    "host": {"id": host_id},
                    "initiatorType": initiator_type,
                    "initiatorWWNorIqn": array_uid(uid),
                }),
            )
            .await?;
        Ok(Initiator {
            id: content_id(&body).unwrap_or_default(),
            uid: uid.to_string(),
            protocol,
            host_id: Some(host_id.to_string()),
        })
    }

    async fn register_initiator(&self, initiator_id: &str, host_id: &str) -> ArrayResult<()> {
        self.post(
            &format!("/api/instances/hostInitiator/{}/action/modify", initiator_id),
            json!({"host": {"id": host_id}}),
        )
        .await
        .map(|_| ())
    }

    async fn find_host_by_name(&self, name: &str) -> ArrayResult<Option<Host>> {
        let found = self
            .filter_instances("host", &[("name", "eq", name.to_string())], HOST_FIELDS)
            .await?;
        Ok(found.first().and_then(parse_host))
    }

    async fn get_host(&self, host_id: &str) -> ArrayResult<Option<Host>> {
        Ok(self
            .get_instance("host", host_id, HOST_FIELDS)
            .await?
            .as_ref()
            .and_then(parse_host))
    }

    async fn create_host(&self, name: &str) -> ArrayResult<Host> {
        let body = self
            .post(
                "/api/types/host/instances",
                json!({"type": HOST_TYPE_MANUAL, "name": name}),
            )
            .await?;
        Ok(Host {
            id: content_id(&body).unwrap_or_default(),
            name: name.to_string(),
            initiators: Vec::new(),
            host_luns: Vec::new(),
        })
    }

    async fn get_host_lun_mappings(&self, query: &HostLunQuery) -> ArrayResult<Vec<HostLunMapping>> {
        let mut conditions = vec![
            ("id", "lk", format!("%{}_{}%", query.host_id, query.lun_id)),
            ("type", "eq", query.lun_type.as_code().to_string()),
        ];
        if let (HostLunType::LunSnap, Some(snap_id)) = (query.lun_type, &query.snap_id) {
            conditions.push(("snap.id", "eq", snap_id.clone()));
        }
        let found = self
            .filter_instances("hostLUN", &conditions, &["id", "host", "lun", "snap", "type", "hlu"])
            .await?;
        // `lk` also matches longer ids (`Host_1_sv_10` for `Host_1_sv_1`)
        Ok(found
            .iter()
            .filter_map(|v| parse_host_lun(v, query))
            .filter(|m| query.matches(m))
            .collect())
    }

    async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun> {
        self.get_instance("lun", lun_id, LUN_FIELDS)
            .await?
            .as_ref()
            .and_then(parse_lun)
            .ok_or_else(|| {
                ArrayError::of_kind(ArrayErrorKind::NotFound, format!("lun {} not found", lun_id))
            })
    }

    async fn find_lun_by_name(&self, name: &str) -> ArrayResult<Option<Lun>> {
        let found = self
            .filter_instances("lun", &[("name", "eq", name.to_string())], LUN_FIELDS)
            .await?;
        Ok(found.first().and_then(parse_lun))
    }

    async fn create_lun(&self, spec: &LunSpec) -> ArrayResult<Lun> {
        let body = self
            .post(
                "/api/types/storageResource/action/createLun",
                json!({
                    "name": spec.name,
                    "description": spec.name,
                    "lunParameters": {
                        "pool": {"id": spec.pool_id},
                        "size": spec.size_bytes,
                        "isThinEnabled": true,
                    },
                }),
            )
            .await?;
        let lun_id = body
            .as_ref()
            .and_then(|b| b.pointer("/content/storageResource/id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        self.get_lun(&lun_id).await
    }

    async fn get_snapshot(&self, snap_id: &str) -> ArrayResult<Snapshot> {
        self.get_instance("snap", snap_id, SNAP_FIELDS)
            .await?
            .as_ref()
            .and_then(parse_snapshot)
            .ok_or_else(|| {
                ArrayError::of_kind(
                    ArrayErrorKind::NotFound,
                    format!("Cannot find snapshot with id: {}", snap_id),
                )
            })
    }

    async fn modify_lun_access(
        &self,
        lun_id: &str,
        cg_id: Option<&str>,
        access: &[HostAccess],
    ) -> ArrayResult<()> {
        let host_access: Vec<Value> = access
            .iter()
            .map(|a| json!({"host": {"id": a.host_id}, "accessMask": u32::from(a.access_mask)}))
            .collect();
        let (url, body) = match cg_id {
            Some(cg) => (
                format!("/api/instances/storageResource/{}/action/modifyConsistencyGroup", cg),
                json!({"lunModify": [{
                    "lun": {"id": lun_id},
                    "lunParameters": {"hostAccess": host_access},
                }]}),
            ),
            None => (
                format!("/api/instances/storageResource/{}/action/modifyLun", lun_id),
                json!({"lunParameters": {"hostAccess": host_access}}),
            ),
        };
        self.post(&url, body).await.map(|_| ())
    }

    async fn attach_snapshot(&self, snap_id: &str, host_id: &str) -> ArrayResult<()> {
        self.post(
            &format!("/api/instances/snap/{}/action/attach", snap_id),
            json!({"hostAccess": [{
                "host": {"id": host_id},
                "allowedAccess": SNAP_ACCESS_READ_WRITE,
            }]}),
        )
        .await
        .map(|_| ())
    }

    async fn detach_snapshot(&self, snap_id: &str) -> ArrayResult<()> {
        self.request(
            Method::POST,
            &format!("/api/instances/snap/{}/action/detach", snap_id),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn get_fc_login_paths(&self, initiator_id: &str) -> ArrayResult<Vec<InitiatorPath>> {
        let paths = self
            .filter_instances(
                "hostInitiatorPath",
                &[("id", "lk", format!("{}%", initiator_id))],
                &["fcPort", "isLoggedIn"],
            )
            .await?;
        Ok(paths
            .iter()
            .filter_map(|p| {
                Some(InitiatorPath {
                    initiator_id: initiator_id.to_string(),
                    port_id: p.pointer("/fcPort/id")?.as_str()?.to_string(),
                    is_logged_in: p.get("isLoggedIn").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect())
    }

    async fn get_target_ports(&self, protocol: Protocol) -> ArrayResult<Vec<TargetPort>> {
        match protocol {
            Protocol::Iscsi => self.iscsi_ports().await,
            Protocol::Fc => self.fc_ports().await,
        }
    }

    fn gateway_name(&self) -> &str {
        "unity-rest"
    }
}

// =============================================================================
// Response Parsing
// =============================================================================

fn is_iqn(uid: &str) -> bool {
    uid.to_ascii_lowercase().starts_with("iqn")
}

/// Initiator id as the array stores it: IQNs verbatim, WWNs as `AA:BB:...`
fn array_uid(uid: &str) -> String {
    if is_iqn(uid) {
        uid.to_string()
    } else {
        colon_delimited(uid)
    }
}

fn entries(body: Option<Value>) -> Vec<Value> {
    body.and_then(|b| b.get("entries").cloned())
        .and_then(|e| e.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| entry.get("content").cloned())
        .collect()
}

fn content_id(body: &Option<Value>) -> Option<String> {
    body.as_ref()?
        .pointer("/content/id")?
        .as_str()
        .map(str::to_string)
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field)?.as_str().map(str::to_string)
}

fn nested_id(value: &Value, field: &str) -> Option<String> {
    value.get(field)?.get("id")?.as_str().map(str::to_string)
}

fn parse_initiator(value: &Value) -> Option<Initiator> {
    let protocol = match value.get("type").and_then(Value::as_u64) {
        Some(t) if t == INITIATOR_TYPE_ISCSI as u64 => Protocol::Iscsi,
        _ => Protocol::Fc,
    };
    Some(Initiator {
        id: str_field(value, "id")?,
        uid: str_field(value, "initiatorId").unwrap_or_default(),
        protocol,
        host_id: nested_id(value, "parentHost"),
    })
}

fn parse_host(value: &Value) -> Option<Host> {
    let id = str_field(value, "id")?;
    let listed = |field: &str, protocol: Protocol| -> Vec<Initiator> {
        value
            .get(field)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|i| {
                        Some(Initiator {
                            id: str_field(i, "id")?,
                            uid: str_field(i, "initiatorId").unwrap_or_default(),
                            protocol,
                            host_id: Some(id.clone()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut initiators = listed("fcHostInitiators", Protocol::Fc);
    initiators.extend(listed("iscsiHostInitiators", Protocol::Iscsi));

    let host_luns = value
        .get("hostLUNs")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(|l| str_field(l, "id")).collect())
        .unwrap_or_default();

    Some(Host {
        name: str_field(value, "name").unwrap_or_default(),
        id,
        initiators,
        host_luns,
    })
}

fn parse_host_access(value: &Value, mask_field: &str) -> Vec<HostAccess> {
    value
        .get("hostAccess")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let mask = entry
                        .get(mask_field)
                        .and_then(Value::as_u64)
                        .and_then(|m| AccessMask::try_from(m as u32).ok())
                        .unwrap_or(AccessMask::Production);
                    Some(HostAccess::new(nested_id(entry, "host")?, mask))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_lun(value: &Value) -> Option<Lun> {
    let id = str_field(value, "id")?;
    let current_owner = match value.get("currentNode").and_then(Value::as_u64) {
        Some(1) => StorageProcessor::B,
        _ => StorageProcessor::A,
    };
    // A LUN inside a consistency group reports the group as its storage resource
    let cg_id = nested_id(value, "storageResource").filter(|res| res != &id);
    Some(Lun {
        name: str_field(value, "name").unwrap_or_default(),
        current_owner,
        host_access: parse_host_access(value, "accessMask"),
        cg_id,
        id,
    })
}

fn parse_snapshot(value: &Value) -> Option<Snapshot> {
    Some(Snapshot {
        id: str_field(value, "id")?,
        name: str_field(value, "name").unwrap_or_default(),
        lun_id: nested_id(value, "lun").or_else(|| nested_id(value, "storageResource"))?,
        host_access: parse_host_access(value, "allowedAccess")
            .into_iter()
            .map(|a| HostAccess::new(a.host_id, AccessMask::Production))
            .collect(),
    })
}

fn parse_host_lun(value: &Value, query: &HostLunQuery) -> Option<HostLunMapping> {
    let lun_type = value
        .get("type")
        .and_then(Value::as_u64)
        .and_then(|t| HostLunType::from_code(t as u32))
        .unwrap_or(query.lun_type);
    Some(HostLunMapping {
        id: str_field(value, "id")?,
        host_id: nested_id(value, "host").unwrap_or_else(|| query.host_id.clone()),
        lun_id: nested_id(value, "lun").unwrap_or_else(|| query.lun_id.clone()),
        snap_id: nested_id(value, "snap"),
        lun_type,
        hlu: value.get("hlu").and_then(Value::as_u64).map(|h| h as u32),
    })
}

fn parse_iscsi_portal(value: &Value, nodes: &HashMap<String, String>) -> Option<TargetPort> {
    let id = str_field(value, "id")?;
    let eth_id = nested_id(value, "ethernetPort")?;
    let sp = match StorageProcessor::from_object_id(&eth_id) {
        Some(sp) => sp,
        None => {
            warn!("SP of {} is unknown", id);
            return None;
        }
    };
    let iqn = nodes.get(&nested_id(value, "iscsiNode")?)?;
    let ip = str_field(value, "ipAddress")?;
    Some(TargetPort::iscsi(&eth_id, sp, iqn, &ip))
}

fn parse_fc_port(value: &Value) -> Option<TargetPort> {
    let id = str_field(value, "id")?;
    let sp = match nested_id(value, "storageProcessor")
        .as_deref()
        .and_then(StorageProcessor::from_object_id)
    {
        Some(sp) => sp,
        None => {
            warn!("SP of {} is unknown", id);
            return None;
        }
    };
    let wwn: String = str_field(value, "wwn")?
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase();
    if wwn.len() < 32 || !wwn.chars().all(|c| c.is_ascii_hexdigit()) {
        warn!("FC port {} reports malformed WWN {}", id, wwn);
        return None;
    }
    Some(TargetPort::fc(&id, sp, &wwn[0..16], &wwn[16..32]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_error_envelope() {
        let body = r#"{"error":{"errorCode":108007456,"httpStatusCode":422,
            "messages":[{"en-US":"The specified LUN has nothing to modify."}]}}"#;
        let err = parse_error(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(err.kind, ArrayErrorKind::NothingToModify);
        assert_eq!(err.http_status, Some(422));
        assert!(err.message.contains("nothing to modify"));
    }

    #[test]
    fn test_parse_error_without_body() {
        let err = parse_error(StatusCode::CONFLICT, "");
        assert_eq!(err.kind, ArrayErrorKind::AlreadyExists);
    }

    #[test]
    fn test_parse_lun_in_group() {
        let value = json!({
            "id": "sv_12",
            "name": "volume-1",
            "currentNode": 1,
            "storageResource": {"id": "res_4"},
            "hostAccess": [{"host": {"id": "Host_1"}, "accessMask": 1}],
        });
        let lun = parse_lun(&value).unwrap();
        assert_eq!(lun.current_owner, StorageProcessor::B);
        assert_eq!(lun.cg_id.as_deref(), Some("res_4"));
        assert_eq!(lun.host_access, vec![HostAccess::new("Host_1", AccessMask::Production)]);

        let standalone = json!({"id": "sv_13", "currentNode": 0, "storageResource": {"id": "sv_13"}});
        assert_eq!(parse_lun(&standalone).unwrap().cg_id, None);
    }

    #[test]
    fn test_parse_fc_port_splits_wwn() {
        let value = json!({
            "id": "spa_iom_0_fc0",
            "wwn": "50:06:01:60:B6:E0:0E:5A:50:06:01:60:36:E0:0E:5A",
            "storageProcessor": {"id": "spa"},
        });
        let port = parse_fc_port(&value).unwrap();
        assert_eq!(port.sp, StorageProcessor::A);
        assert_eq!(port.port_wwn(), Some("5006016036e00e5a"));
    }

    #[test]
    fn test_parse_host_lists_initiators_and_luns() {
        let value = json!({
            "id": "Host_9",
            "name": "compute-1",
            "fcHostInitiators": [{"id": "HostInitiator_1"}],
            "iscsiHostInitiators": [{"id": "HostInitiator_2"}],
            "hostLUNs": [{"id": "Host_9_sv_1_prod"}],
        });
        let host = parse_host(&value).unwrap();
        assert_eq!(host.fc_initiators().count(), 1);
        assert_eq!(host.initiators.len(), 2);
        assert!(host.has_luns());
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("{}", addr.port())
    }

    fn gateway(port: &str) -> UnityRestGateway {
        UnityRestGateway::new(UnityConfig {
            address: "127.0.0.1".into(),
            port: port.parse().unwrap(),
            scheme: "http".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_csrf_refreshed_on_unauthorized() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let router = Router::new()
            .route(
                "/api/types/user/instances",
                get(|| async { ([(CSRF_HEADER, "token-1")], "{}") }),
            )
            .route(
                "/api/instances/hostInitiator/:id/action/modify",
                post(move |headers: HeaderMap| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        match headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
                            Some("token-1") => AxumStatus::NO_CONTENT.into_response(),
                            _ => AxumStatus::UNAUTHORIZED.into_response(),
                        }
                    }
                }),
            );
        let gw = gateway(&spawn(router).await);

        gw.register_initiator("HostInitiator_1", "Host_1").await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(gw.session().token().as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_filter_query_is_encoded() {
        let router = Router::new().route(
            "/api/types/hostInitiator/instances",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let filter = params.get("filter").cloned().unwrap_or_default();
                if filter == "initiatorId eq \"iqn.test\"" {
                    Json(json!({"entries": [{"content": {
                        "id": "HostInitiator_3",
                        "initiatorId": "iqn.test",
                        "type": 2,
                        "parentHost": {"id": "Host_2"},
                    }}]}))
                } else {
                    Json(json!({"entries": []}))
                }
            }),
        );
        let gw = gateway(&spawn(router).await);

        let initiator = gw.find_initiator("iqn.test").await.unwrap().unwrap();
        assert_eq!(initiator.protocol, Protocol::Iscsi);
        assert_eq!(initiator.host_id.as_deref(), Some("Host_2"));
        assert!(gw.find_initiator("iqn.other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fc_initiator_uses_colon_form() {
        let router = Router::new().route(
            "/api/types/hostInitiator/instances",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let filter = params.get("filter").cloned().unwrap_or_default();
                let wanted = "initiatorId eq \"20:00:00:90:FA:0D:67:54:10:00:00:90:FA:0D:67:54\"";
                if filter == wanted {
                    Json(json!({"entries": [{"content": {
                        "id": "HostInitiator_7",
                        "initiatorId": "20:00:00:90:FA:0D:67:54:10:00:00:90:FA:0D:67:54",
                        "type": 1,
                        "parentHost": {"id": "Host_4"},
                    }}]}))
                } else {
                    Json(json!({"entries": []}))
                }
            })
            .post(|Json(body): Json<Value>| async move {
                assert_eq!(
                    body["initiatorWWNorIqn"],
                    "20:00:00:90:FA:0D:67:55:10:00:00:90:FA:0D:67:55"
                );
                Json(json!({"content": {"id": "HostInitiator_8"}}))
            }),
        );
        let gw = gateway(&spawn(router).await);

        let found = gw
            .find_initiator("20000090FA0D675410000090FA0D6754")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.protocol, Protocol::Fc);
        assert_eq!(found.host_id.as_deref(), Some("Host_4"));

        let created = gw
            .create_initiator("20000090FA0D675510000090FA0D6755", "Host_4")
            .await
            .unwrap();
        assert_eq!(created.id, "HostInitiator_8");
        assert_eq!(created.protocol, Protocol::Fc);
    }

    #[tokio::test]
    async fn test_host_lun_lookup_ignores_longer_lun_ids() {
        let router = Router::new().route(
            "/api/types/hostLUN/instances",
            get(|| async {
                Json(json!({"entries": [
                    {"content": {"id": "Host_1_sv_10_prod", "host": {"id": "Host_1"},
                        "lun": {"id": "sv_10"}, "type": 1, "hlu": 5}},
                    {"content": {"id": "Host_1_sv_1_prod", "host": {"id": "Host_1"},
                        "lun": {"id": "sv_1"}, "type": 1, "hlu": 3}},
                ]}))
            }),
        );
        let gw = gateway(&spawn(router).await);

        let mappings = gw
            .get_host_lun_mappings(&HostLunQuery::new("Host_1", "sv_1", None))
            .await
            .unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].lun_id, "sv_1");
        assert_eq!(mappings[0].hlu, Some(3));
    }

    #[test]
    fn test_parse_fc_port_rejects_non_hex_wwn() {
        let value = json!({
            "id": "spa_iom_0_fc0",
            "wwn": "50:06:01:60:B6:E0:0E:5A:50:06:01:60:36:E0:0E:é5",
            "storageProcessor": {"id": "spa"},
        });
        assert!(parse_fc_port(&value).is_none());
    }

    #[tokio::test]
    async fn test_vendor_error_surfaces_as_array_error() {
        let router = Router::new().route(
            "/api/instances/snap/:id/action/attach",
            post(|| async {
                (
                    AxumStatus::UNPROCESSABLE_ENTITY,
                    Json(json!({"error": {"errorCode": 100666332, "httpStatusCode": 422,
                        "messages": [{"en-US": "already attached"}]}})),
                )
            }),
        );
        let gw = gateway(&spawn(router).await);

        let err = gw.attach_snapshot("snap_1", "Host_1").await.unwrap_err();
        assert_eq!(err.kind, ArrayErrorKind::SnapAlreadyAttached);
    }
}

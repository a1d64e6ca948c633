//! Fleet provider access: JSON-RPC client, the shared session holder and the
//! zone vehicle resolver.
//!
//! The session is the only process-wide mutable state. [`FleetSessions`]
//! serialises authentication behind one async mutex, so concurrent site
//! pipelines that all hit an expired session share a single re-authentication.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::FleetCredentials;
use crate::error::FleetError;
use crate::types::VehicleOnSite;

/// Error names the provider uses when a session is no longer valid.
const SESSION_EXPIRED_MARKERS: [&str; 2] = ["InvalidUserException", "DbUnavailableException"];

/// Placeholder driver id reported for devices with no assigned driver.
const UNKNOWN_DRIVER_ID: &str = "UnknownDriverId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSession {
    pub server: String,
    pub database: String,
    pub user_name: String,
    pub session_id: String,
}

impl FleetSession {
    fn credentials(&self) -> Value {
        json!({
            "database": self.database,
            "userName": self.user_name,
            "sessionId": self.session_id,
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EntityRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "deviceType")]
    pub device_type: Option<String>,
}

/// Drivers arrive either as a reference or as a bare placeholder id.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum DriverField {
    Ref(EntityRef),
    Placeholder(#[allow(dead_code)] String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device: EntityRef,
    #[serde(default)]
    pub driver: Option<DriverField>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_device_communicating: bool,
}

impl DeviceStatus {
    fn assigned_driver(&self) -> Option<&EntityRef> {
        match &self.driver {
            Some(DriverField::Ref(d)) if d.id != UNKNOWN_DRIVER_ID => Some(d),
            _ => None,
        }
    }

    fn is_equipment(&self) -> bool {
        self.device
            .device_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("none"))
    }
}

/// The fleet provider operations this service depends on.
#[async_trait]
pub trait FleetApi: Send + Sync {
    async fn authenticate(&self, creds: &FleetCredentials) -> Result<FleetSession, FleetError>;

    /// Position/status records for devices currently inside the zone.
    async fn device_statuses_in_zone(
        &self,
        session: &FleetSession,
        zone_id: &str,
    ) -> Result<Vec<DeviceStatus>, FleetError>;

    /// Raw phone number on the operator's user record, if any.
    async fn user_phone(
        &self,
        session: &FleetSession,
        user_id: &str,
    ) -> Result<Option<String>, FleetError>;

    /// Sends an in-cab text message; returns the provider message id.
    async fn send_text_message(
        &self,
        session: &FleetSession,
        device_id: &str,
        message: &str,
    ) -> Result<String, FleetError>;
}

pub struct GeotabClient {
    client: Client,
}

impl GeotabClient {
    pub fn new(timeout: Duration) -> Result<Self, FleetError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        server: &str,
        method: &str,
        mut params: Value,
        session: Option<&FleetSession>,
    ) -> Result<T, FleetError> {
        if let (Some(session), Some(obj)) = (session, params.as_object_mut()) {
            obj.insert("credentials".to_string(), session.credentials());
        }
        let url = format!("https://{server}/apiv1");
        let body = json!({ "method": method, "params": params, "id": 1 });

        let mut response: Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(method, server, "Fleet call completed");

        if let Some(error) = response.get("error") {
            return Err(classify_error(method, error));
        }
        let result = response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(result)?)
    }
}

fn classify_error(method: &str, error: &Value) -> FleetError {
    let text = error.to_string();
    if SESSION_EXPIRED_MARKERS.iter().any(|m| text.contains(m)) {
        FleetError::SessionExpired(text)
    } else {
        FleetError::Api {
            method: method.to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(text),
        }
    }
}

#[derive(Deserialize)]
struct AuthResult {
    credentials: AuthCredentials,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthCredentials {
    database: String,
    user_name: String,
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(default)]
    phone_number: Option<String>,
}

#[async_trait]
impl FleetApi for GeotabClient {
    async fn authenticate(&self, creds: &FleetCredentials) -> Result<FleetSession, FleetError> {
        let result: AuthResult = self
            .call(
                &creds.server,
                "Authenticate",
                json!({
                    "database": creds.database,
                    "userName": creds.user_name,
                    "password": creds.password,
                }),
                None,
            )
            .await
            .map_err(|e| match e {
                FleetError::Api { message, .. } | FleetError::SessionExpired(message) => {
                    FleetError::Auth(message)
                }
                other => other,
            })?;

        Ok(FleetSession {
            server: resolve_server(&creds.server, result.path.as_deref()),
            database: result.credentials.database,
            user_name: result.credentials.user_name,
            session_id: result.credentials.session_id,
        })
    }

    async fn device_statuses_in_zone(
        &self,
        session: &FleetSession,
        zone_id: &str,
    ) -> Result<Vec<DeviceStatus>, FleetError> {
        self.call(
            &session.server,
            "Get",
            json!({
                "typeName": "DeviceStatusInfo",
                "search": { "zoneId": { "id": zone_id } },
            }),
            Some(session),
        )
        .await
    }

    async fn user_phone(
        &self,
        session: &FleetSession,
        user_id: &str,
    ) -> Result<Option<String>, FleetError> {
        let users: Vec<UserRecord> = self
            .call(
                &session.server,
                "Get",
                json!({ "typeName": "User", "search": { "id": user_id } }),
                Some(session),
            )
            .await?;
        Ok(users.into_iter().next().and_then(|u| u.phone_number))
    }

    async fn send_text_message(
        &self,
        session: &FleetSession,
        device_id: &str,
        message: &str,
    ) -> Result<String, FleetError> {
        let id: Value = self
            .call(
                &session.server,
                "Add",
                json!({
                    "typeName": "TextMessage",
                    "entity": {
                        "device": { "id": device_id },
                        "isDirectionToVehicle": true,
                        "messageContent": { "contentType": "Normal", "message": message },
                        "sent": true,
                    },
                }),
                Some(session),
            )
            .await?;
        Ok(match id {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

/// The provider may redirect a database to another host on login.
fn resolve_server(configured: &str, path: Option<&str>) -> String {
    match path {
        Some(p) if !p.is_empty() && p != "ThisServer" => p.to_string(),
        _ => configured.to_string(),
    }
}

/// Owns the cached fleet session and its refresh contract.
pub struct FleetSessions {
    api: Arc<dyn FleetApi>,
    creds: FleetCredentials,
    current: Mutex<Option<FleetSession>>,
}

impl FleetSessions {
    pub fn new(api: Arc<dyn FleetApi>, creds: FleetCredentials) -> Self {
        Self {
            api,
            creds,
            current: Mutex::new(None),
        }
    }

    pub fn api(&self) -> &Arc<dyn FleetApi> {
        &self.api
    }

    /// Returns the cached session, authenticating if there is none.
    pub async fn session(&self) -> Result<FleetSession, FleetError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(session.clone());
        }
        let session = self.login().await?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// Replaces `stale` with a fresh session. If another task already
    /// refreshed it, the newer session is returned without logging in again.
    pub async fn refresh(&self, stale: &FleetSession) -> Result<FleetSession, FleetError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.session_id != stale.session_id {
                return Ok(session.clone());
            }
        }
        *current = None;
        let session = self.login().await?;
        *current = Some(session.clone());
        Ok(session)
    }

    async fn login(&self) -> Result<FleetSession, FleetError> {
        let session = self.api.authenticate(&self.creds).await?;
        tracing::info!(
            user = %self.creds.user_name,
            server = %session.server,
            database = %session.database,
            "Authenticated with fleet provider"
        );
        Ok(session)
    }

    /// Runs `op` with the current session, re-authenticating exactly once if
    /// the provider reports the session as expired.
    pub async fn call_with_retry<T, F, Fut>(&self, op: F) -> Result<T, FleetError>
    where
        F: Fn(FleetSession) -> Fut,
        Fut: Future<Output = Result<T, FleetError>>,
    {
        let session = self.session().await?;
        match op(session.clone()).await {
            Err(e) if e.is_session_expired() => {
                tracing::warn!(error = %e, "Fleet session expired, re-authenticating");
                let fresh = self.refresh(&session).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}

#[async_trait]
pub trait VehicleLocator: Send + Sync {
    async fn vehicles_in_zone(&self, zone_id: &str) -> Result<Vec<VehicleOnSite>, FleetError>;
}

pub struct VehicleResolver {
    sessions: Arc<FleetSessions>,
}

impl VehicleResolver {
    pub fn new(sessions: Arc<FleetSessions>) -> Self {
        Self { sessions }
    }

    /// Looks up each operator's phone concurrently. Failed or empty lookups
    /// are left out of the map.
    async fn resolve_phones(&self, driver_ids: BTreeSet<String>) -> HashMap<String, String> {
        if driver_ids.is_empty() {
            return HashMap::new();
        }
        let session = match self.sessions.session().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "No fleet session for operator lookups");
                return HashMap::new();
            }
        };
        let api = self.sessions.api();
        let lookups = driver_ids.into_iter().map(|id| {
            let session = &session;
            async move {
                let phone = api.user_phone(session, &id).await;
                (id, phone)
            }
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(id, phone)| match phone {
                Ok(Some(raw)) => normalize_phone(&raw).map(|p| (id, p)),
                Ok(None) => None,
                Err(e) => {
                    tracing::debug!(driver_id = %id, error = %e, "Operator lookup failed");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl VehicleLocator for VehicleResolver {
    async fn vehicles_in_zone(&self, zone_id: &str) -> Result<Vec<VehicleOnSite>, FleetError> {
        let api = self.sessions.api();
        let statuses = self
            .sessions
            .call_with_retry(|session| async move {
                api.device_statuses_in_zone(&session, zone_id).await
            })
            .await?;

        let live: Vec<DeviceStatus> = statuses
            .into_iter()
            .filter(|s| s.is_device_communicating)
            .collect();

        let driver_ids: BTreeSet<String> = live
            .iter()
            .filter_map(|s| s.assigned_driver().map(|d| d.id.clone()))
            .collect();
        let phones = self.resolve_phones(driver_ids).await;

        Ok(live
            .iter()
            .map(|s| {
                let driver = s.assigned_driver();
                VehicleOnSite {
                    device_id: s.device.id.clone(),
                    device_name: s.device.name.clone().unwrap_or_default(),
                    is_equipment: s.is_equipment(),
                    driver_id: driver.map(|d| d.id.clone()),
                    driver_name: driver.and_then(|d| d.name.clone()),
                    phone_number: driver.and_then(|d| phones.get(&d.id).cloned()),
                    lat: s.latitude,
                    lng: s.longitude,
                    speed: s.speed,
                    date_time: s.date_time,
                }
            })
            .collect())
    }
}

/// Canonical E.164 form of a phone number. `None` if it has no digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(match digits.len() {
        11 if digits.starts_with('1') => format!("+{digits}"),
        10 => format!("+1{digits}"),
        _ => format!("+{digits}"),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// In-process fleet provider. Sessions are numbered by login count.
    #[derive(Default)]
    pub(crate) struct FakeFleet {
        pub logins: AtomicUsize,
        pub zone_calls: AtomicUsize,
        pub expire_first_zone_calls: AtomicUsize,
        pub fail_auth: bool,
        pub statuses: Vec<DeviceStatus>,
        pub phones: HashMap<String, Result<Option<String>, String>>,
        pub failing_devices: BTreeSet<String>,
        pub sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl FleetApi for FakeFleet {
        async fn authenticate(&self, creds: &FleetCredentials) -> Result<FleetSession, FleetError> {
            if self.fail_auth {
                return Err(FleetError::Auth("bad password".into()));
            }
            tokio::task::yield_now().await;
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FleetSession {
                server: creds.server.clone(),
                database: creds.database.clone(),
                user_name: creds.user_name.clone(),
                session_id: format!("session-{n}"),
            })
        }

        async fn device_statuses_in_zone(
            &self,
            _session: &FleetSession,
            _zone_id: &str,
        ) -> Result<Vec<DeviceStatus>, FleetError> {
            self.zone_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.expire_first_zone_calls.load(Ordering::SeqCst);
            if remaining > 0 {
                self.expire_first_zone_calls.store(remaining - 1, Ordering::SeqCst);
                return Err(FleetError::SessionExpired("InvalidUserException".into()));
            }
            Ok(self.statuses.clone())
        }

        async fn user_phone(
            &self,
            _session: &FleetSession,
            user_id: &str,
        ) -> Result<Option<String>, FleetError> {
            match self.phones.get(user_id) {
                Some(Ok(phone)) => Ok(phone.clone()),
                Some(Err(msg)) => Err(FleetError::Api {
                    method: "Get".into(),
                    message: msg.clone(),
                }),
                None => Ok(None),
            }
        }

        async fn send_text_message(
            &self,
            _session: &FleetSession,
            device_id: &str,
            message: &str,
        ) -> Result<String, FleetError> {
            if self.failing_devices.contains(device_id) {
                return Err(FleetError::Api {
                    method: "Add".into(),
                    message: "device offline".into(),
                });
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((device_id.to_string(), message.to_string()));
            Ok(format!("msg-{}", sent.len()))
        }
    }

    pub(crate) fn creds() -> FleetCredentials {
        FleetCredentials {
            server: "my.geotab.com".into(),
            database: "demo_db".into(),
            user_name: "monitor@example.com".into(),
            password: "secret".into(),
        }
    }

    pub(crate) fn status(device: &str, driver: Option<&str>, communicating: bool) -> DeviceStatus {
        DeviceStatus {
            device: EntityRef {
                id: device.to_string(),
                name: Some(format!("Truck {device}")),
                device_type: Some("GO9".into()),
            },
            driver: driver.map(|d| {
                DriverField::Ref(EntityRef {
                    id: d.to_string(),
                    name: Some(format!("Driver {d}")),
                    device_type: None,
                })
            }),
            latitude: 43.65,
            longitude: -79.38,
            speed: 0.0,
            date_time: Some(Utc::now()),
            is_device_communicating: communicating,
        }
    }

    fn resolver(fake: FakeFleet) -> (Arc<FakeFleet>, VehicleResolver) {
        let fake = Arc::new(fake);
        let sessions = Arc::new(FleetSessions::new(fake.clone(), creds()));
        (fake, VehicleResolver::new(sessions))
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("(416) 555-0199").as_deref(), Some("+14165550199"));
        assert_eq!(normalize_phone("1-416-555-0199").as_deref(), Some("+14165550199"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn redirect_path_replaces_server() {
        assert_eq!(resolve_server("my.geotab.com", Some("my42.geotab.com")), "my42.geotab.com");
        assert_eq!(resolve_server("my.geotab.com", Some("ThisServer")), "my.geotab.com");
        assert_eq!(resolve_server("my.geotab.com", None), "my.geotab.com");
    }

    #[test]
    fn expiry_errors_are_classified() {
        let err = classify_error(
            "Get",
            &json!({ "message": "x", "errors": [{ "name": "InvalidUserException" }] }),
        );
        assert!(err.is_session_expired());

        let err = classify_error("Get", &json!({ "message": "Bad search" }));
        assert!(matches!(err, FleetError::Api { ref message, .. } if message == "Bad search"));
    }

    #[test]
    fn status_payload_deserializes() {
        let placeholder: DeviceStatus = serde_json::from_value(json!({
            "device": { "id": "b1", "name": "Crane 7", "deviceType": "None" },
            "driver": "UnknownDriverId",
            "latitude": 43.1,
            "longitude": -79.2,
            "speed": 3.5,
            "dateTime": "2026-07-01T14:00:00Z",
            "isDeviceCommunicating": true
        }))
        .unwrap();
        assert!(placeholder.is_equipment());
        assert!(placeholder.assigned_driver().is_none());
        assert_eq!(placeholder.speed, 3.5);

        let unknown: DeviceStatus = serde_json::from_value(json!({
            "device": { "id": "b2" },
            "driver": { "id": "UnknownDriverId" },
            "isDeviceCommunicating": false
        }))
        .unwrap();
        assert!(!unknown.is_equipment());
        assert!(unknown.assigned_driver().is_none());
        assert!(unknown.date_time.is_none());
    }

    #[tokio::test]
    async fn resolves_communicating_vehicles_with_contacts() {
        let mut phones = HashMap::new();
        phones.insert("d1".to_string(), Ok(Some("416-555-0100".to_string())));
        phones.insert("d2".to_string(), Err("lookup timed out".to_string()));
        let (fake, resolver) = resolver(FakeFleet {
            statuses: vec![
                status("v1", Some("d1"), true),
                status("v2", Some("d2"), true),
                status("v3", None, true),
                status("v4", Some("d1"), false),
            ],
            phones,
            ..Default::default()
        });

        let vehicles = resolver.vehicles_in_zone("zone-1").await.unwrap();
        assert_eq!(vehicles.len(), 3);
        assert_eq!(vehicles[0].phone_number.as_deref(), Some("+14165550100"));
        assert_eq!(vehicles[0].driver_name.as_deref(), Some("Driver d1"));
        // Failed lookup still keeps the vehicle on the list.
        assert_eq!(vehicles[1].device_id, "v2");
        assert_eq!(vehicles[1].phone_number, None);
        assert_eq!(vehicles[2].driver_id, None);
        assert_eq!(fake.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reauthenticates_once_on_expiry() {
        let (fake, resolver) = resolver(FakeFleet {
            statuses: vec![status("v1", None, true)],
            expire_first_zone_calls: AtomicUsize::new(1),
            ..Default::default()
        });

        let vehicles = resolver.vehicles_in_zone("zone-1").await.unwrap();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
        assert_eq!(fake.zone_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_expiry_propagates() {
        let (fake, resolver) = resolver(FakeFleet {
            expire_first_zone_calls: AtomicUsize::new(2),
            ..Default::default()
        });

        let err = resolver.vehicles_in_zone("zone-1").await.unwrap_err();
        assert!(err.is_session_expired());
        assert_eq!(fake.zone_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failure_surfaces() {
        let (_fake, resolver) = resolver(FakeFleet {
            fail_auth: true,
            ..Default::default()
        });
        let err = resolver.vehicles_in_zone("zone-1").await.unwrap_err();
        assert!(matches!(err, FleetError::Auth(_)));
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_login() {
        let fake = Arc::new(FakeFleet::default());
        let sessions = Arc::new(FleetSessions::new(fake.clone(), creds()));
        let stale = sessions.session().await.unwrap();

        let refreshes = (0..8).map(|_| {
            let sessions = sessions.clone();
            let stale = stale.clone();
            tokio::spawn(async move { sessions.refresh(&stale).await.unwrap() })
        });
        let fresh: Vec<FleetSession> = join_all(refreshes)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
        assert!(fresh.iter().all(|s| s.session_id == "session-2"));
    }
}

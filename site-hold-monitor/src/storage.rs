use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::error::StorageError;
use crate::types::{Hold, NotificationRecord, Rule, Site, VehicleOnSite, WeatherSnapshot};

/// Marks holds opened by the monitoring loop rather than by a person.
pub const ISSUED_BY_AUTO: &str = "auto";

/// Read/write operations the monitoring loop needs from persistence.
#[async_trait]
pub trait HoldStore: Send + Sync {
    async fn list_active_sites(&self) -> Result<Vec<Site>, StorageError>;

    /// Most recent hold for the site that has not been cleared.
    async fn get_open_hold(&self, site_id: Uuid) -> Result<Option<Hold>, StorageError>;

    async fn create_hold(
        &self,
        site_id: Uuid,
        rule: Rule,
        snapshot: &WeatherSnapshot,
        vehicles: &[VehicleOnSite],
        hold_duration_mins: Option<u32>,
    ) -> Result<Hold, StorageError>;

    /// Stamps the clearing time and attaches the all-clear notifications.
    async fn close_hold(
        &self,
        hold_id: Uuid,
        notifications: &[NotificationRecord],
    ) -> Result<(), StorageError>;

    async fn log_notification(
        &self,
        hold_id: Uuid,
        record: &NotificationRecord,
    ) -> Result<(), StorageError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sites (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        lat REAL NOT NULL,
        lng REAL NOT NULL,
        zone_id TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        radius_m REAL
    );
    CREATE TABLE IF NOT EXISTS holds_log (
        id TEXT PRIMARY KEY,
        site_id TEXT NOT NULL REFERENCES sites(id),
        triggered_at TEXT NOT NULL,
        trigger_rule TEXT NOT NULL,
        weather_snapshot TEXT NOT NULL,
        vehicles_on_site TEXT NOT NULL,
        hold_duration_mins INTEGER,
        all_clear_at TEXT,
        issued_by TEXT NOT NULL,
        notifications_sent TEXT NOT NULL DEFAULT '[]'
    );
    CREATE UNIQUE INDEX IF NOT EXISTS holds_one_open_per_site
        ON holds_log(site_id) WHERE all_clear_at IS NULL;
    CREATE TABLE IF NOT EXISTS notification_log (
        id INTEGER PRIMARY KEY,
        hold_id TEXT NOT NULL REFERENCES holds_log(id),
        driver_name TEXT,
        device_id TEXT NOT NULL,
        contact TEXT,
        message_type TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        provider_message_id TEXT,
        status TEXT NOT NULL
    );
";

const HOLD_COLUMNS: &str = "id, site_id, triggered_at, trigger_rule, weather_snapshot, \
    vehicles_on_site, hold_duration_mins, all_clear_at, issued_by, notifications_sent";

/// SQLite-backed store. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn init(path: &Path) -> Result<Self, StorageError> {
        info!("Initializing hold database at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        info!("Database initialization complete.");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Corrupt("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    /// Inserts or replaces a site definition.
    pub async fn upsert_site(&self, site: &Site) -> Result<(), StorageError> {
        let site = site.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sites (id, name, lat, lng, zone_id, active, radius_m)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, lat = excluded.lat, lng = excluded.lng,
                    zone_id = excluded.zone_id, active = excluded.active,
                    radius_m = excluded.radius_m",
                params![
                    site.id.to_string(),
                    site.name,
                    site.lat,
                    site.lng,
                    site.zone_id,
                    site.active,
                    site.radius_m,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Upserts each site in `sites`, returning how many were written.
    pub async fn seed_sites(&self, sites: &[Site]) -> Result<usize, StorageError> {
        for site in sites {
            self.upsert_site(site).await?;
        }
        info!("Seeded {} site(s)", sites.len());
        Ok(sites.len())
    }

    /// Every hold for a site, newest first.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn holds_for_site(&self, site_id: Uuid) -> Result<Vec<Hold>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HOLD_COLUMNS} FROM holds_log WHERE site_id = ?1 ORDER BY triggered_at DESC"
            ))?;
            let rows = stmt.query_map(params![site_id.to_string()], read_hold_row)?;
            let mut holds = Vec::new();
            for row in rows {
                holds.push(row?.into_hold()?);
            }
            Ok(holds)
        })
        .await
    }

    /// Rows in the notification log for a hold, in insertion order.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn notifications_for_hold(
        &self,
        hold_id: Uuid,
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT driver_name, device_id, contact, message_type, sent_at,
                        provider_message_id, status
                 FROM notification_log WHERE hold_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![hold_id.to_string()], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;
            let mut records = Vec::new();
            for row in rows {
                let (driver_name, device_id, contact, kind, sent_at, provider_message_id, status) =
                    row?;
                records.push(NotificationRecord {
                    driver_name,
                    device_id,
                    contact,
                    message_type: serde_json::from_value(serde_json::Value::String(kind))?,
                    sent_at,
                    provider_message_id,
                    status,
                });
            }
            Ok(records)
        })
        .await
    }
}

/// Raw `holds_log` columns before JSON and enum decoding.
struct HoldRow {
    id: String,
    site_id: String,
    triggered_at: DateTime<Utc>,
    trigger_rule: String,
    weather_snapshot: String,
    vehicles_on_site: String,
    hold_duration_mins: Option<u32>,
    all_clear_at: Option<DateTime<Utc>>,
    issued_by: String,
    notifications_sent: String,
}

fn read_hold_row(row: &Row<'_>) -> rusqlite::Result<HoldRow> {
    Ok(HoldRow {
        id: row.get(0)?,
        site_id: row.get(1)?,
        triggered_at: row.get(2)?,
        trigger_rule: row.get(3)?,
        weather_snapshot: row.get(4)?,
        vehicles_on_site: row.get(5)?,
        hold_duration_mins: row.get(6)?,
        all_clear_at: row.get(7)?,
        issued_by: row.get(8)?,
        notifications_sent: row.get(9)?,
    })
}

impl HoldRow {
    fn into_hold(self) -> Result<Hold, StorageError> {
        Ok(Hold {
            id: parse_uuid(&self.id)?,
            site_id: parse_uuid(&self.site_id)?,
            triggered_at: self.triggered_at,
            trigger_rule: Rule::parse(&self.trigger_rule)
                .ok_or_else(|| StorageError::Corrupt(format!("unknown rule {}", self.trigger_rule)))?,
            weather_snapshot: serde_json::from_str(&self.weather_snapshot)?,
            vehicles_on_site: serde_json::from_str(&self.vehicles_on_site)?,
            hold_duration_mins: self.hold_duration_mins,
            all_clear_at: self.all_clear_at,
            issued_by: self.issued_by,
            notifications_sent: serde_json::from_str(&self.notifications_sent)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Corrupt(format!("bad id {s}: {e}")))
}

fn open_hold_row(conn: &Connection, site_id: Uuid) -> Result<Option<HoldRow>, StorageError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {HOLD_COLUMNS} FROM holds_log
                 WHERE site_id = ?1 AND all_clear_at IS NULL
                 ORDER BY triggered_at DESC LIMIT 1"
            ),
            params![site_id.to_string()],
            read_hold_row,
        )
        .optional()?)
}

#[async_trait]
impl HoldStore for SqliteStore {
    async fn list_active_sites(&self) -> Result<Vec<Site>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, lat, lng, zone_id, active, radius_m
                 FROM sites WHERE active = 1 ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Site {
                        id: Uuid::nil(),
                        name: row.get(1)?,
                        lat: row.get(2)?,
                        lng: row.get(3)?,
                        zone_id: row.get(4)?,
                        active: row.get(5)?,
                        radius_m: row.get(6)?,
                    },
                ))
            })?;
            let mut sites = Vec::new();
            for row in rows {
                let (id, mut site) = row?;
                site.id = parse_uuid(&id)?;
                sites.push(site);
            }
            Ok(sites)
        })
        .await
    }

    async fn get_open_hold(&self, site_id: Uuid) -> Result<Option<Hold>, StorageError> {
        self.with_conn(move |conn| open_hold_row(conn, site_id)?.map(HoldRow::into_hold).transpose())
            .await
    }

    async fn create_hold(
        &self,
        site_id: Uuid,
        rule: Rule,
        snapshot: &WeatherSnapshot,
        vehicles: &[VehicleOnSite],
        hold_duration_mins: Option<u32>,
    ) -> Result<Hold, StorageError> {
        let hold = Hold {
            id: Uuid::new_v4(),
            site_id,
            triggered_at: Utc::now(),
            trigger_rule: rule,
            weather_snapshot: snapshot.clone(),
            vehicles_on_site: vehicles.to_vec(),
            hold_duration_mins,
            all_clear_at: None,
            issued_by: ISSUED_BY_AUTO.to_string(),
            notifications_sent: Vec::new(),
        };
        let snapshot_json = serde_json::to_string(&hold.weather_snapshot)?;
        let vehicles_json = serde_json::to_string(&hold.vehicles_on_site)?;

        let row = hold.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if open_hold_row(&tx, site_id)?.is_some() {
                return Err(StorageError::HoldAlreadyOpen(site_id));
            }
            tx.execute(
                "INSERT INTO holds_log (id, site_id, triggered_at, trigger_rule, weather_snapshot,
                    vehicles_on_site, hold_duration_mins, issued_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id.to_string(),
                    row.site_id.to_string(),
                    row.triggered_at,
                    row.trigger_rule.as_str(),
                    snapshot_json,
                    vehicles_json,
                    row.hold_duration_mins,
                    row.issued_by,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(hold)
    }

    async fn close_hold(
        &self,
        hold_id: Uuid,
        notifications: &[NotificationRecord],
    ) -> Result<(), StorageError> {
        let notifications_json = serde_json::to_string(notifications)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE holds_log SET all_clear_at = ?2, notifications_sent = ?3
                 WHERE id = ?1 AND all_clear_at IS NULL",
                params![hold_id.to_string(), Utc::now(), notifications_json],
            )?;
            if updated == 0 {
                return Err(StorageError::HoldNotFound(hold_id));
            }
            Ok(())
        })
        .await
    }

    async fn log_notification(
        &self,
        hold_id: Uuid,
        record: &NotificationRecord,
    ) -> Result<(), StorageError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO notification_log (hold_id, driver_name, device_id, contact,
                    message_type, sent_at, provider_message_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    hold_id.to_string(),
                    record.driver_name,
                    record.device_id,
                    record.contact,
                    record.message_type.as_str(),
                    record.sent_at,
                    record.provider_message_id,
                    record.status,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

//! SQLite implementation of `PersistenceGateway`
//!
//! One connection behind an async mutex. Each gateway call locks it for the
//! duration of the call; an `ArchivalSession` holds the lock for the whole
//! pass, inside one `BEGIN IMMEDIATE` transaction.

use super::db::{ArchivalSession, ArchiveWrite, PersistenceGateway};
use super::decimal::FixedDecimal;
use super::error::StoreError;
use super::geometry::MultiPolygon;
use super::snapshot::RunSnapshot;
use super::types::{
    ArchivedDetectionId, CoordinateTolerance, DetectionId, DetectionKey, GeoPoint, LiveMatch,
    NewDetection, ParcelId, Provenance,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const SCHEMA_VERSION: i64 = 1;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Upper bound on bound parameters per purge statement
const PURGE_CHUNK: usize = 500;

/// Column list shared by the live and archive tables
const DETECTION_COLUMNS: &str = "latitude, longitude, lat_deg, lon_deg, brightness, scan, track, \
     acq_date, acq_time, acquired_at, local_time, satellites, confidence, version, \
     bright_t31, frp, daynight, geom";

pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGateway {
    /// Opens (creating if needed) the store at `path` and applies migrations
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::info!("📊 Opened detection store {} (journal_mode={})", path.display(), mode);

        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        schema_version(&conn)
    }

    /// Adds a region boundary; degenerate geometry is rejected
    pub async fn insert_region_boundary(
        &self,
        name: &str,
        geometry: &MultiPolygon,
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        insert_reference_geometry(&conn, "region_boundaries", name, geometry)
    }

    pub async fn insert_forestry_parcel(
        &self,
        name: &str,
        geometry: &MultiPolygon,
    ) -> Result<ParcelId, StoreError> {
        let conn = self.conn.lock().await;
        insert_reference_geometry(&conn, "forestry_parcels", name, geometry).map(ParcelId)
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        log::info!("🔧 Running schema migrations");
        log::info!("   ├─ Executing: 001_schema.sql");
        conn.execute_batch(include_str!("../../sql/001_schema.sql"))?;
        conn.execute("PRAGMA user_version = 1", [])?;
        log::info!("   └─ ✅ Schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}

fn insert_reference_geometry(
    conn: &Connection,
    table: &str,
    name: &str,
    geometry: &MultiPolygon,
) -> Result<i64, StoreError> {
    let bbox = geometry.bbox();
    conn.execute(
        &format!(
            "INSERT INTO {} (name, geometry, min_lon, min_lat, max_lon, max_lat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            table
        ),
        params![
            name,
            geometry.to_json()?,
            bbox.min_lon,
            bbox.min_lat,
            bbox.max_lon,
            bbox.max_lat
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Unique and foreign-key violations surface as `Conflict`
fn classify(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => StoreError::Sqlite(err),
    }
}

fn parse_geometry(id: i64, raw: &str) -> Result<Option<MultiPolygon>, StoreError> {
    let geometry = MultiPolygon::from_json(raw)?;
    if geometry.is_none() {
        log::warn!("⚠️  Skipping degenerate geometry (row {})", id);
    }
    Ok(geometry)
}

fn load_geometry(conn: &Connection, table: &str) -> Result<Vec<(i64, MultiPolygon)>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT id, geometry FROM {} ORDER BY id", table))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, raw) in rows {
        if let Some(geometry) = parse_geometry(id, &raw)? {
            out.push((id, geometry));
        }
    }
    Ok(out)
}

/// Rows whose bounding box covers the point, with exact containment applied
fn containing(conn: &Connection, table: &str, point: GeoPoint) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, geometry FROM {}
         WHERE min_lon <= ?1 AND max_lon >= ?1 AND min_lat <= ?2 AND max_lat >= ?2
         ORDER BY id",
        table
    ))?;
    let rows = stmt
        .query_map(params![point.lon, point.lat], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = Vec::new();
    for (id, raw) in rows {
        if let Some(geometry) = parse_geometry(id, &raw)? {
            if geometry.contains(point) {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

fn decimal(column: &str, raw: &str) -> Result<FixedDecimal, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{} '{}': {}", column, raw, e)))
}

/// Raw key columns plus provenance, as read back from `detections`
struct StoredKey {
    id: i64,
    latitude: String,
    longitude: String,
    acq_date: String,
    acq_time: String,
    satellites: String,
}

impl StoredKey {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            latitude: row.get(1)?,
            longitude: row.get(2)?,
            acq_date: row.get(3)?,
            acq_time: row.get(4)?,
            satellites: row.get(5)?,
        })
    }

    fn into_match(self) -> Result<LiveMatch, StoreError> {
        let acq_date = NaiveDate::parse_from_str(&self.acq_date, DATE_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("acq_date '{}': {}", self.acq_date, e)))?;
        let acq_time = NaiveTime::parse_from_str(&self.acq_time, TIME_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("acq_time '{}': {}", self.acq_time, e)))?;
        Ok(LiveMatch {
            id: DetectionId(self.id),
            key: DetectionKey::new(
                decimal("latitude", &self.latitude)?,
                decimal("longitude", &self.longitude)?,
                acq_date,
                acq_time,
            ),
            provenance: Provenance::from_storage(&self.satellites)?,
        })
    }
}

const KEY_SELECT: &str =
    "SELECT id, latitude, longitude, acq_date, acq_time, satellites FROM detections";

fn find_exact(conn: &Connection, key: &DetectionKey) -> Result<Option<LiveMatch>, StoreError> {
    let stored = conn
        .query_row(
            &format!(
                "{} WHERE latitude = ?1 AND longitude = ?2 AND acq_date = ?3 AND acq_time = ?4",
                KEY_SELECT
            ),
            params![
                key.latitude.to_string(),
                key.longitude.to_string(),
                key.acq_date.format(DATE_FORMAT).to_string(),
                key.acq_time.format(TIME_FORMAT).to_string(),
            ],
            StoredKey::from_row,
        )
        .optional()?;
    stored.map(StoredKey::into_match).transpose()
}

/// REAL prefilter, then exact decimal comparison; closest wins, lowest id on ties
fn find_within(
    conn: &Connection,
    key: &DetectionKey,
    tolerance: CoordinateTolerance,
) -> Result<Option<LiveMatch>, StoreError> {
    let margin = tolerance.0.to_f64() + 1e-9;
    let mut stmt = conn.prepare(&format!(
        "{} WHERE acq_date = ?1 AND acq_time = ?2
           AND ABS(lat_deg - ?3) <= ?5 AND ABS(lon_deg - ?4) <= ?5
         ORDER BY id",
        KEY_SELECT
    ))?;
    let rows = stmt
        .query_map(
            params![
                key.acq_date.format(DATE_FORMAT).to_string(),
                key.acq_time.format(TIME_FORMAT).to_string(),
                key.latitude.to_f64(),
                key.longitude.to_f64(),
                margin,
            ],
            StoredKey::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut best: Option<((FixedDecimal, FixedDecimal), LiveMatch)> = None;
    for stored in rows {
        let candidate = stored.into_match()?;
        if !tolerance.matches(&candidate.key, key) {
            continue;
        }
        let distance = (
            candidate.key.latitude.abs_diff(&key.latitude),
            candidate.key.longitude.abs_diff(&key.longitude),
        );
        // Rows arrive in id order, so strict `<` keeps the lowest id on ties
        if best.as_ref().map_or(true, |(d, _)| distance < *d) {
            best = Some((distance, candidate));
        }
    }
    Ok(best.map(|(_, m)| m))
}

fn optional_text(value: &Option<FixedDecimal>) -> Option<String> {
    value.as_ref().map(ToString::to_string)
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn find_live_detection(
        &self,
        key: &DetectionKey,
        tolerance: CoordinateTolerance,
    ) -> Result<Option<LiveMatch>, StoreError> {
        let conn = self.conn.lock().await;
        if tolerance.is_exact() {
            find_exact(&conn, key)
        } else {
            find_within(&conn, key, tolerance)
        }
    }

    async fn create_detection(
        &self,
        detection: &NewDetection,
        parcels: &[ParcelId],
    ) -> Result<DetectionId, StoreError> {
        let mut conn = self.conn.lock().await;
        let fire = &detection.fire;
        let key = &fire.key;
        let satellites = detection.provenance.to_storage()?;

        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO detections ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                DETECTION_COLUMNS
            ),
            params![
                key.latitude.to_string(),
                key.longitude.to_string(),
                key.latitude.to_f64(),
                key.longitude.to_f64(),
                fire.brightness.to_string(),
                fire.scan.to_string(),
                fire.track.to_string(),
                key.acq_date.format(DATE_FORMAT).to_string(),
                key.acq_time.format(TIME_FORMAT).to_string(),
                key.acquired_at().format(TIMESTAMP_FORMAT).to_string(),
                fire.local_time.format(TIME_FORMAT).to_string(),
                satellites,
                fire.confidence,
                fire.version,
                optional_text(&fire.bright_t31),
                optional_text(&fire.frp),
                fire.daynight.as_str(),
                key.point().to_wkt(),
            ],
        )
        .map_err(classify)?;
        let id = tx.last_insert_rowid();

        {
            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO detection_forestry_links (detection_id, parcel_id)
                 VALUES (?1, ?2)",
            )?;
            for parcel in parcels {
                link.execute(params![id, parcel.0]).map_err(classify)?;
            }
        }

        tx.commit()?;
        Ok(DetectionId(id))
    }

    async fn update_provenance(
        &self,
        id: DetectionId,
        provenance: &Provenance,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE detections SET satellites = ?1 WHERE id = ?2",
            params![provenance.to_storage()?, id.0],
        )?;
        if changed == 0 {
            return Err(StoreError::MissingDetection(id));
        }
        Ok(())
    }

    async fn region_contains(&self, point: GeoPoint) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        Ok(!containing(&conn, "region_boundaries", point)?.is_empty())
    }

    async fn parcels_containing(&self, point: GeoPoint) -> Result<Vec<ParcelId>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(containing(&conn, "forestry_parcels", point)?
            .into_iter()
            .map(ParcelId)
            .collect())
    }

    async fn load_region_boundaries(&self) -> Result<Vec<MultiPolygon>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(load_geometry(&conn, "region_boundaries")?
            .into_iter()
            .map(|(_, geometry)| geometry)
            .collect())
    }

    async fn load_forestry_parcels(&self) -> Result<Vec<(ParcelId, MultiPolygon)>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(load_geometry(&conn, "forestry_parcels")?
            .into_iter()
            .map(|(id, geometry)| (ParcelId(id), geometry))
            .collect())
    }

    async fn materialize_snapshot(&self, snapshot: &RunSnapshot) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS run_snapshot (
                 latitude  TEXT NOT NULL,
                 longitude TEXT NOT NULL,
                 acq_date  TEXT NOT NULL,
                 acq_time  TEXT NOT NULL,
                 PRIMARY KEY (latitude, longitude, acq_date, acq_time)
             );
             DELETE FROM temp.run_snapshot;",
        )?;

        let mut written = 0;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO temp.run_snapshot (latitude, longitude, acq_date, acq_time)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for key in snapshot.iter() {
                written += insert.execute(params![
                    key.latitude.to_string(),
                    key.longitude.to_string(),
                    key.acq_date.format(DATE_FORMAT).to_string(),
                    key.acq_time.format(TIME_FORMAT).to_string(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    async fn discard_snapshot(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE IF EXISTS temp.run_snapshot")?;
        Ok(())
    }

    async fn begin_archival(&self) -> Result<Box<dyn ArchivalSession>, StoreError> {
        let conn = self.conn.clone().lock_owned().await;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteArchivalSession {
            conn,
            finished: false,
        }))
    }
}

/// Holds the connection for the whole pass; rolls back on drop unless committed
struct SqliteArchivalSession {
    conn: OwnedMutexGuard<Connection>,
    finished: bool,
}

impl Drop for SqliteArchivalSession {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::error!("❌ Archival rollback failed: {}", e);
            } else {
                log::warn!("⚠️  Archival pass rolled back");
            }
        }
    }
}

#[async_trait]
impl ArchivalSession for SqliteArchivalSession {
    async fn latest_acquisition(&mut self) -> Result<Option<NaiveDateTime>, StoreError> {
        let latest: Option<String> =
            self.conn
                .query_row("SELECT MAX(acquired_at) FROM detections", [], |row| row.get(0))?;
        latest
            .map(|raw| {
                NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
                    .map_err(|e| StoreError::Corrupt(format!("acquired_at '{}': {}", raw, e)))
            })
            .transpose()
    }

    async fn select_candidates(
        &mut self,
        cutoff: NaiveDateTime,
    ) -> Result<Vec<DetectionId>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM detections WHERE acquired_at < ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![cutoff.format(TIMESTAMP_FORMAT).to_string()], |row| {
                row.get::<_, i64>(0).map(DetectionId)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    async fn archive_detection(
        &mut self,
        id: DetectionId,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchiveWrite, StoreError> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO archived_detections (source_detection_id, {cols}, archived_at)
                 SELECT id, {cols}, ?2 FROM detections WHERE id = ?1
                 ON CONFLICT (latitude, longitude, acq_date, acq_time) DO NOTHING",
                cols = DETECTION_COLUMNS
            ),
            params![id.0, archived_at.to_rfc3339()],
        )?;
        if inserted == 1 {
            return Ok(ArchiveWrite::Inserted(ArchivedDetectionId(
                self.conn.last_insert_rowid(),
            )));
        }

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT a.id FROM archived_detections a
                 JOIN detections d
                   ON a.latitude = d.latitude AND a.longitude = d.longitude
                  AND a.acq_date = d.acq_date AND a.acq_time = d.acq_time
                 WHERE d.id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        existing
            .map(|archived| ArchiveWrite::Existing(ArchivedDetectionId(archived)))
            .ok_or(StoreError::MissingDetection(id))
    }

    async fn migrate_links(
        &mut self,
        from: DetectionId,
        to: ArchivedDetectionId,
    ) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "INSERT OR IGNORE INTO archived_detection_forestry_links (archived_detection_id, parcel_id)
             SELECT ?2, parcel_id FROM detection_forestry_links WHERE detection_id = ?1",
            params![from.0, to.0],
        )?)
    }

    async fn purge(&mut self, ids: &[DetectionId]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for chunk in ids.chunks(PURGE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let values = chunk.iter().map(|id| id.0);

            self.conn.execute(
                &format!(
                    "DELETE FROM detection_forestry_links WHERE detection_id IN ({})",
                    placeholders
                ),
                params_from_iter(values.clone()),
            )?;
            removed += self.conn.execute(
                &format!("DELETE FROM detections WHERE id IN ({})", placeholders),
                params_from_iter(values),
            )?;
        }
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut session = self;
        session.conn.execute_batch("COMMIT")?;
        session.finished = true;
        Ok(())
    }
}

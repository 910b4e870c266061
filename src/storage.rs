use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::detect::BoundingBox;
use crate::rules::RuleConfig;
use crate::supervisor::CameraStatus;
use crate::zone::{Geometry, Zone};
use crate::{Camera, CameraId, CandidateEvent, Event, EventId, EventStatus, ZoneId};

/// Persistence boundary: cameras, zones and accepted events.
///
/// Shared between the engine (registration and configuration) and the event
/// sink thread, so every method takes `&self`.
pub trait Store: Send + Sync {
    fn load_cameras(&self) -> Result<Vec<Camera>>;

    /// Stream addresses are unique; inserting a duplicate fails.
    fn insert_camera(
        &self,
        name: &str,
        stream_url: &str,
        location_tag: Option<&str>,
        target_fps: u32,
    ) -> Result<Camera>;

    /// Deletes the camera with its zones and events.
    fn delete_camera(&self, id: CameraId) -> Result<()>;

    fn update_camera_status(&self, id: CameraId, status: &CameraStatus) -> Result<()>;

    fn load_zones(&self, camera_id: CameraId) -> Result<Vec<Zone>>;

    /// Insert, or replace geometry and rules of the camera's zone with the same name.
    fn upsert_zone(
        &self,
        camera_id: CameraId,
        name: &str,
        geometry: &Geometry,
        rules: &RuleConfig,
    ) -> Result<Zone>;

    /// Returns the owning camera when the zone existed.
    fn delete_zone(&self, id: ZoneId) -> Result<Option<CameraId>>;

    fn save_event(&self, candidate: &CandidateEvent) -> Result<EventId>;

    /// Most recent events first.
    fn recent_events(&self, limit: usize) -> Result<Vec<Event>>;
}

// -------------------- SQLite --------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {db_path}"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS cameras (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              location_tag TEXT,
              stream_url TEXT NOT NULL UNIQUE,
              target_fps INTEGER NOT NULL,
              status TEXT NOT NULL DEFAULT 'disconnected',
              last_error TEXT,
              last_frame_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zones (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              kind TEXT NOT NULL,
              geometry_json TEXT NOT NULL,
              rules_json TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE (camera_id, name),
              FOREIGN KEY (camera_id) REFERENCES cameras(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL,
              zone_id INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              rule_type TEXT NOT NULL,
              object_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              bbox_json TEXT NOT NULL,
              snapshot_ref TEXT NOT NULL,
              priority TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'new',
              metadata_json TEXT,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (camera_id) REFERENCES cameras(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_events_camera ON events(camera_id);
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_events_rule ON events(rule_type);
            CREATE INDEX IF NOT EXISTS idx_events_priority ON events(priority);
            CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
            CREATE INDEX IF NOT EXISTS idx_events_composite ON events(camera_id, timestamp_ms DESC);
            "#,
        )?;
        Ok(())
    }
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: CameraId(row.get(0)?),
        name: row.get(1)?,
        location_tag: row.get(2)?,
        stream_url: row.get(3)?,
        target_fps: row.get(4)?,
    })
}

fn zone_from_parts(
    id: i64,
    camera_id: i64,
    name: String,
    geometry_json: &str,
    rules_json: &str,
) -> Result<Zone> {
    Ok(Zone {
        id: ZoneId(id),
        camera_id: CameraId(camera_id),
        name,
        geometry: serde_json::from_str(geometry_json)
            .with_context(|| format!("corrupt geometry for zone {id}"))?,
        rules: serde_json::from_str(rules_json)
            .with_context(|| format!("corrupt rules for zone {id}"))?,
    })
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{what} exceeds i64 range"))
}

impl Store for SqliteStore {
    fn load_cameras(&self) -> Result<Vec<Camera>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, location_tag, stream_url, target_fps FROM cameras ORDER BY id ASC",
        )?;
        let cameras = stmt
            .query_map([], camera_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cameras)
    }

    fn insert_camera(
        &self,
        name: &str,
        stream_url: &str,
        location_tag: Option<&str>,
        target_fps: u32,
    ) -> Result<Camera> {
        let now = to_i64(crate::now_ms()?, "timestamp")?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cameras(name, location_tag, stream_url, target_fps, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![name, location_tag, stream_url, target_fps, now],
        )
        .with_context(|| format!("insert camera {stream_url}"))?;
        Ok(Camera {
            id: CameraId(conn.last_insert_rowid()),
            name: name.to_string(),
            stream_url: stream_url.to_string(),
            location_tag: location_tag.map(str::to_string),
            target_fps,
        })
    }

    fn delete_camera(&self, id: CameraId) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM cameras WHERE id = ?1", params![id.0])?;
        Ok(())
    }

    fn update_camera_status(&self, id: CameraId, status: &CameraStatus) -> Result<()> {
        let now = to_i64(crate::now_ms()?, "timestamp")?;
        let last_frame = status
            .last_frame_at_ms
            .map(|ms| to_i64(ms, "last frame time"))
            .transpose()?;
        self.conn()?.execute(
            r#"
            UPDATE cameras
            SET status = ?2, last_error = ?3, last_frame_at_ms = ?4, updated_at_ms = ?5
            WHERE id = ?1
            "#,
            params![id.0, status.state.as_str(), status.last_error, last_frame, now],
        )?;
        Ok(())
    }

    fn load_zones(&self, camera_id: CameraId) -> Result<Vec<Zone>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, camera_id, name, geometry_json, rules_json
                FROM zones WHERE camera_id = ?1 ORDER BY id ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![camera_id.0], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let zones = rows
            .into_iter()
            .filter_map(|(id, camera, name, geometry, rules)| {
                match zone_from_parts(id, camera, name, &geometry, &rules) {
                    Ok(zone) => Some(zone),
                    Err(err) => {
                        log::warn!("camera {camera_id}: skipping stored zone: {err:#}");
                        None
                    }
                }
            })
            .collect();
        Ok(zones)
    }

    fn upsert_zone(
        &self,
        camera_id: CameraId,
        name: &str,
        geometry: &Geometry,
        rules: &RuleConfig,
    ) -> Result<Zone> {
        let geometry_json = serde_json::to_string(geometry)?;
        let rules_json = serde_json::to_string(rules)?;
        let now = to_i64(crate::now_ms()?, "timestamp")?;
        let id: i64 = self.conn()?.query_row(
            r#"
            INSERT INTO zones(camera_id, name, kind, geometry_json, rules_json, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(camera_id, name) DO UPDATE SET
              kind = excluded.kind,
              geometry_json = excluded.geometry_json,
              rules_json = excluded.rules_json,
              updated_at_ms = excluded.updated_at_ms
            RETURNING id
            "#,
            params![camera_id.0, name, geometry.kind(), geometry_json, rules_json, now],
            |row| row.get(0),
        )?;
        Ok(Zone {
            id: ZoneId(id),
            camera_id,
            name: name.to_string(),
            geometry: geometry.clone(),
            rules: rules.clone(),
        })
    }

    fn delete_zone(&self, id: ZoneId) -> Result<Option<CameraId>> {
        let conn = self.conn()?;
        let owner: Option<i64> = conn
            .query_row(
                "SELECT camera_id FROM zones WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some() {
            conn.execute("DELETE FROM zones WHERE id = ?1", params![id.0])?;
        }
        Ok(owner.map(CameraId))
    }

    fn save_event(&self, candidate: &CandidateEvent) -> Result<EventId> {
        let timestamp = to_i64(candidate.detected_at_ms, "event timestamp")?;
        let created_at = to_i64(crate::now_ms()?, "timestamp")?;
        let bbox_json = serde_json::to_string(&candidate.bbox)?;
        let metadata_json = candidate
            .dwell_ms
            .map(|dwell_ms| serde_json::json!({ "dwell_ms": dwell_ms }).to_string());

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO events(camera_id, zone_id, timestamp_ms, rule_type, object_type, confidence,
                               bbox_json, snapshot_ref, priority, status, metadata_json, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                candidate.camera_id.0,
                candidate.zone_id.0,
                timestamp,
                candidate.rule_type.as_str(),
                candidate.object_type.as_str(),
                candidate.confidence as f64,
                bbox_json,
                candidate.snapshot_ref,
                candidate.priority.as_str(),
                EventStatus::New.as_str(),
                metadata_json,
                created_at
            ],
        )?;
        Ok(EventId(conn.last_insert_rowid()))
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, camera_id, zone_id, timestamp_ms, rule_type, object_type, confidence,
                   bbox_json, snapshot_ref, priority, status, metadata_json
            FROM events ORDER BY timestamp_ms DESC, id DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    camera_id: row.get(1)?,
                    zone_id: row.get(2)?,
                    timestamp_ms: row.get(3)?,
                    rule_type: row.get(4)?,
                    object_type: row.get(5)?,
                    confidence: row.get(6)?,
                    bbox_json: row.get(7)?,
                    snapshot_ref: row.get(8)?,
                    priority: row.get(9)?,
                    status: row.get(10)?,
                    metadata_json: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}

struct EventRow {
    id: i64,
    camera_id: i64,
    zone_id: i64,
    timestamp_ms: i64,
    rule_type: String,
    object_type: String,
    confidence: f64,
    bbox_json: String,
    snapshot_ref: String,
    priority: String,
    status: String,
    metadata_json: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let quoted = |value: &str| serde_json::Value::String(value.to_string());
        let dwell_ms = match &self.metadata_json {
            Some(raw) => serde_json::from_str::<serde_json::Value>(raw)?
                .get("dwell_ms")
                .and_then(serde_json::Value::as_u64),
            None => None,
        };
        let bbox: BoundingBox = serde_json::from_str(&self.bbox_json)
            .with_context(|| format!("corrupt bbox for event {}", self.id))?;
        Ok(Event {
            id: EventId(self.id),
            candidate: CandidateEvent {
                camera_id: CameraId(self.camera_id),
                zone_id: ZoneId(self.zone_id),
                rule_type: serde_json::from_value(quoted(&self.rule_type))?,
                object_type: serde_json::from_value(quoted(&self.object_type))?,
                confidence: self.confidence as f32,
                detected_at_ms: u64::try_from(self.timestamp_ms).unwrap_or_default(),
                snapshot_ref: self.snapshot_ref,
                priority: serde_json::from_value(quoted(&self.priority))?,
                dwell_ms,
                bbox,
            },
            status: serde_json::from_value(quoted(&self.status))?,
        })
    }
}

// -------------------- In-memory --------------------

#[derive(Default)]
struct MemoryState {
    cameras: BTreeMap<CameraId, Camera>,
    statuses: BTreeMap<CameraId, CameraStatus>,
    zones: BTreeMap<ZoneId, Zone>,
    events: Vec<Event>,
    next_camera: i64,
    next_zone: i64,
    next_event: i64,
}

/// Store for tests and ephemeral runs. Same semantics as `SqliteStore`.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    reject_events: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variant whose `save_event` always fails.
    pub fn rejecting_events() -> Self {
        Self {
            state: Mutex::default(),
            reject_events: true,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    pub fn camera_status(&self, id: CameraId) -> Option<CameraStatus> {
        self.state().ok()?.statuses.get(&id).cloned()
    }

    pub fn event_count(&self) -> usize {
        self.state().map(|s| s.events.len()).unwrap_or_default()
    }
}

impl Store for InMemoryStore {
    fn load_cameras(&self) -> Result<Vec<Camera>> {
        Ok(self.state()?.cameras.values().cloned().collect())
    }

    fn insert_camera(
        &self,
        name: &str,
        stream_url: &str,
        location_tag: Option<&str>,
        target_fps: u32,
    ) -> Result<Camera> {
        let mut state = self.state()?;
        if state.cameras.values().any(|c| c.stream_url == stream_url) {
            return Err(anyhow!("camera with stream url {stream_url} already exists"));
        }
        state.next_camera += 1;
        let camera = Camera {
            id: CameraId(state.next_camera),
            name: name.to_string(),
            stream_url: stream_url.to_string(),
            location_tag: location_tag.map(str::to_string),
            target_fps,
        };
        state.cameras.insert(camera.id, camera.clone());
        Ok(camera)
    }

    fn delete_camera(&self, id: CameraId) -> Result<()> {
        let mut state = self.state()?;
        state.cameras.remove(&id);
        state.statuses.remove(&id);
        state.zones.retain(|_, zone| zone.camera_id != id);
        state.events.retain(|event| event.candidate.camera_id != id);
        Ok(())
    }

    fn update_camera_status(&self, id: CameraId, status: &CameraStatus) -> Result<()> {
        let mut state = self.state()?;
        if state.cameras.contains_key(&id) {
            state.statuses.insert(id, status.clone());
        }
        Ok(())
    }

    fn load_zones(&self, camera_id: CameraId) -> Result<Vec<Zone>> {
        Ok(self
            .state()?
            .zones
            .values()
            .filter(|zone| zone.camera_id == camera_id)
            .cloned()
            .collect())
    }

    fn upsert_zone(
        &self,
        camera_id: CameraId,
        name: &str,
        geometry: &Geometry,
        rules: &RuleConfig,
    ) -> Result<Zone> {
        let mut state = self.state()?;
        if !state.cameras.contains_key(&camera_id) {
            return Err(anyhow!("camera {camera_id} does not exist"));
        }
        let existing = state
            .zones
            .values()
            .find(|zone| zone.camera_id == camera_id && zone.name == name)
            .map(|zone| zone.id);
        let id = match existing {
            Some(id) => id,
            None => {
                state.next_zone += 1;
                ZoneId(state.next_zone)
            }
        };
        let zone = Zone {
            id,
            camera_id,
            name: name.to_string(),
            geometry: geometry.clone(),
            rules: rules.clone(),
        };
        state.zones.insert(id, zone.clone());
        Ok(zone)
    }

    fn delete_zone(&self, id: ZoneId) -> Result<Option<CameraId>> {
        Ok(self.state()?.zones.remove(&id).map(|zone| zone.camera_id))
    }

    fn save_event(&self, candidate: &CandidateEvent) -> Result<EventId> {
        if self.reject_events {
            return Err(anyhow!("event storage unavailable"));
        }
        let mut state = self.state()?;
        state.next_event += 1;
        let id = EventId(state.next_event);
        state.events.push(Event::persisted(id, candidate.clone()));
        Ok(id)
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let state = self.state()?;
        let mut events = state.events.clone();
        events.sort_by(|a, b| {
            b.candidate
                .detected_at_ms
                .cmp(&a.candidate.detected_at_ms)
                .then(b.id.0.cmp(&a.id.0))
        });
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;
    use crate::supervisor::CameraState;
    use crate::zone::Point;
    use crate::{Priority, RuleType};

    fn candidate(camera_id: CameraId, zone_id: ZoneId, at: u64) -> CandidateEvent {
        CandidateEvent {
            camera_id,
            zone_id,
            rule_type: RuleType::Loitering,
            object_type: ObjectClass::Person,
            confidence: 0.75,
            detected_at_ms: at,
            snapshot_ref: "snapshot:1:7:00ff".to_string(),
            priority: Priority::Medium,
            dwell_ms: Some(31_000),
            bbox: BoundingBox::new(1.0, 2.0, 3.0, 4.0),
        }
    }

    fn rect() -> Geometry {
        Geometry::rectangle(Point::new(0.0, 0.0), Point::new(100.0, 100.0))
    }

    fn exercise_store(store: &dyn Store) -> Result<()> {
        let camera = store.insert_camera("lobby", "stub://lobby", Some("hq"), 15)?;
        assert!(store
            .insert_camera("dup", "stub://lobby", None, 15)
            .is_err());
        assert_eq!(store.load_cameras()?, vec![camera.clone()]);

        let zone = store.upsert_zone(camera.id, "door", &rect(), &RuleConfig::default())?;
        let replaced = store.upsert_zone(
            camera.id,
            "door",
            &Geometry::polygon(vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(0.0, 10.0),
            ]),
            &RuleConfig::default().with_loitering(20),
        )?;
        assert_eq!(zone.id, replaced.id);
        let zones = store.load_zones(camera.id)?;
        assert_eq!(zones, vec![replaced.clone()]);

        store.update_camera_status(
            camera.id,
            &CameraStatus {
                state: CameraState::Error,
                consecutive_failures: 2,
                last_error: Some("refused".to_string()),
                last_frame_at_ms: Some(5),
            },
        )?;

        let first = store.save_event(&candidate(camera.id, zone.id, 1_000))?;
        let second = store.save_event(&candidate(camera.id, zone.id, 2_000))?;
        assert_ne!(first, second);
        let events = store.recent_events(10)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, second);
        assert_eq!(events[0].status, EventStatus::New);
        assert_eq!(events[0].candidate, candidate(camera.id, zone.id, 2_000));

        assert_eq!(store.delete_zone(zone.id)?, Some(camera.id));
        assert_eq!(store.delete_zone(zone.id)?, None);

        store.delete_camera(camera.id)?;
        assert!(store.load_cameras()?.is_empty());
        assert!(store.recent_events(10)?.is_empty());
        Ok(())
    }

    #[test]
    fn sqlite_store_round_trip() -> Result<()> {
        exercise_store(&SqliteStore::open_in_memory()?)
    }

    #[test]
    fn in_memory_store_round_trip() -> Result<()> {
        exercise_store(&InMemoryStore::new())
    }

    #[test]
    fn sqlite_store_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sentinel.db");
        let path = path.to_str().ok_or_else(|| anyhow!("non-utf8 path"))?;
        let camera = {
            let store = SqliteStore::open(path)?;
            let camera = store.insert_camera("yard", "rtsp://10.0.0.5/live", None, 10)?;
            store.upsert_zone(camera.id, "fence", &rect(), &RuleConfig::default())?;
            camera
        };
        let store = SqliteStore::open(path)?;
        assert_eq!(store.load_cameras()?, vec![camera.clone()]);
        assert_eq!(store.load_zones(camera.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_zone_rows_are_skipped() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        let camera = store.insert_camera("gate", "stub://gate", None, 10)?;
        let broken = store.upsert_zone(camera.id, "broken", &rect(), &RuleConfig::default())?;
        let intact = store.upsert_zone(camera.id, "intact", &rect(), &RuleConfig::default())?;
        store.conn()?.execute(
            "UPDATE zones SET rules_json = '{not json' WHERE id = ?1",
            params![broken.id.0],
        )?;

        let zones = store.load_zones(camera.id)?;
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].id, intact.id);
        Ok(())
    }

    #[test]
    fn rejecting_store_fails_event_writes() {
        let store = InMemoryStore::rejecting_events();
        assert!(store
            .save_event(&candidate(CameraId(1), ZoneId(1), 0))
            .is_err());
        assert_eq!(store.event_count(), 0);
    }
}

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::entities::{
    Alias, GeoInfo, LocationNode, LocationPatch, LocationStatus, LocationType, Tag,
};
use crate::error::{StoreError, StoreResult};
use crate::store::{AliasStore, AuditLog, LocationStore, TagStore};

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

const LOCATION_COLUMNS: &str = "id, name, display_name, canonical_name, location_type, parent_id,
     status, popularity_score, usage_count, sort_order, featured, geo, merged_into,
     created_at, updated_at";

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Locations Table (never deleted - status 'inactive' is the tombstone)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS locations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            canonical_name TEXT NOT NULL,
            location_type TEXT NOT NULL,
            parent_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            popularity_score INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            featured INTEGER NOT NULL DEFAULT 0,
            geo TEXT,
            merged_into TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Dependent tables: aliases, tags, tag usages
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS location_aliases (
            id TEXT PRIMARY KEY,
            alias TEXT NOT NULL,
            location_id TEXT NOT NULL REFERENCES locations(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tags (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            location_id TEXT REFERENCES locations(id),
            retired INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tag_usages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag_id TEXT NOT NULL REFERENCES tags(id),
            record_id TEXT NOT NULL,
            UNIQUE(tag_id, record_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail / event sourcing)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_locations_status ON locations(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_locations_parent ON locations(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_locations_key ON locations(canonical_name, location_type)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aliases_location ON location_aliases(location_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tags_location ON tags(location_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Row mapping
// ============================================================================

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {:?}: {}", value, e)))
}

fn location_from_row(row: &Row) -> rusqlite::Result<LocationNode> {
    let type_str: String = row.get(4)?;
    let status_str: String = row.get(6)?;
    let popularity: i64 = row.get(7)?;
    let usage: i64 = row.get(8)?;
    let geo_json: Option<String> = row.get(11)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    let location_type = LocationType::parse(&type_str)
        .ok_or_else(|| conversion_error(4, format!("unknown location type {:?}", type_str)))?;
    let status = LocationStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(6, format!("unknown status {:?}", status_str)))?;
    let geo = match geo_json {
        Some(json) => Some(
            serde_json::from_str::<GeoInfo>(&json)
                .map_err(|e| conversion_error(11, format!("bad geo column: {}", e)))?,
        ),
        None => None,
    };

    Ok(LocationNode {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        canonical_name: row.get(3)?,
        location_type,
        parent_id: row.get(5)?,
        status,
        popularity_score: popularity.clamp(0, 100) as u8,
        usage_count: usage.max(0) as u64,
        sort_order: row.get(9)?,
        featured: row.get(10)?,
        geo,
        merged_into: row.get(12)?,
        created_at: parse_timestamp(13, &created_at)?,
        updated_at: parse_timestamp(14, &updated_at)?,
    })
}

fn tag_from_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        location_id: row.get(2)?,
        retired: row.get(3)?,
    })
}

/// SQLite integers are signed; counts past i64::MAX are stored saturated
fn count_to_sql(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// "?{start}, ?{start+1}, ..." for an IN clause
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Free functions over a connection
// ============================================================================

pub fn insert_location(conn: &Connection, node: &LocationNode) -> StoreResult<()> {
    let geo_json = match &node.geo {
        Some(geo) => Some(serde_json::to_string(geo)?),
        None => None,
    };

    conn.execute(
        "INSERT INTO locations (
            id, name, display_name, canonical_name, location_type, parent_id,
            status, popularity_score, usage_count, sort_order, featured, geo, merged_into,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            node.id,
            node.name,
            node.display_name,
            node.canonical_name,
            node.location_type.as_str(),
            node.parent_id,
            node.status.as_str(),
            node.popularity_score as i64,
            count_to_sql(node.usage_count),
            node.sort_order,
            node.featured,
            geo_json,
            node.merged_into,
            node.created_at.to_rfc3339(),
            node.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

pub fn get_all_locations(conn: &Connection) -> StoreResult<Vec<LocationNode>> {
    let sql = format!("SELECT {} FROM locations ORDER BY sort_order, id", LOCATION_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;

    let nodes = stmt
        .query_map([], location_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(nodes)
}

pub fn verify_count(conn: &Connection) -> StoreResult<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))?;

    Ok(count)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> StoreResult<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> StoreResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_timestamp(1, &timestamp_str)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| conversion_error(5, format!("bad event payload: {}", e)))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SQLite-backed store
// ============================================================================

/// One connection behind a mutex; implements every store seam
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    // ========================================================================
    // Seeding and inspection (CRUD lives outside the engine)
    // ========================================================================

    pub fn insert_location(&self, node: &LocationNode) -> StoreResult<()> {
        insert_location(&*self.lock()?, node)
    }

    pub fn list_all(&self) -> StoreResult<Vec<LocationNode>> {
        get_all_locations(&*self.lock()?)
    }

    pub fn get(&self, id: &str) -> StoreResult<LocationNode> {
        self.get_by_ids(&[id.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn count(&self) -> StoreResult<i64> {
        verify_count(&*self.lock()?)
    }

    pub fn insert_alias(&self, alias: &Alias) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO location_aliases (id, alias, location_id) VALUES (?1, ?2, ?3)",
            params![alias.id, alias.alias, alias.location_id],
        )?;
        Ok(())
    }

    pub fn aliases_for(&self, location_id: &str) -> StoreResult<Vec<Alias>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, alias, location_id FROM location_aliases
             WHERE location_id = ?1 ORDER BY alias",
        )?;
        let aliases = stmt
            .query_map([location_id], |row| {
                Ok(Alias {
                    id: row.get(0)?,
                    alias: row.get(1)?,
                    location_id: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    pub fn insert_tag(&self, tag: &Tag) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO tags (id, name, location_id, retired) VALUES (?1, ?2, ?3, ?4)",
            params![tag.id, tag.name, tag.location_id, tag.retired],
        )?;
        Ok(())
    }

    pub fn get_tag(&self, tag_id: &str) -> StoreResult<Option<Tag>> {
        let tag = self
            .lock()?
            .query_row(
                "SELECT id, name, location_id, retired FROM tags WHERE id = ?1",
                [tag_id],
                tag_from_row,
            )
            .optional()?;
        Ok(tag)
    }

    pub fn insert_tag_usage(&self, tag_id: &str, record_id: &str) -> StoreResult<()> {
        self.lock()?.execute(
            "INSERT INTO tag_usages (tag_id, record_id) VALUES (?1, ?2)",
            params![tag_id, record_id],
        )?;
        Ok(())
    }

    pub fn count_tag_usages(&self, tag_id: &str) -> StoreResult<i64> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM tag_usages WHERE tag_id = ?1",
            [tag_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn events_for(&self, entity_type: &str, entity_id: &str) -> StoreResult<Vec<Event>> {
        get_events_for_entity(&*self.lock()?, entity_type, entity_id)
    }
}

impl LocationStore for SqliteStore {
    fn list_active(&self) -> StoreResult<Vec<LocationNode>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM locations WHERE status = 'active' ORDER BY sort_order, id",
            LOCATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        let nodes = stmt
            .query_map([], location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    fn get_by_ids(&self, ids: &[String]) -> StoreResult<Vec<LocationNode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM locations WHERE id IN ({}) ORDER BY id",
            LOCATION_COLUMNS,
            placeholders(1, ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;

        let nodes = stmt
            .query_map(params_from_iter(ids.iter()), location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    fn find_by_parents(&self, parent_ids: &[String]) -> StoreResult<Vec<LocationNode>> {
        if parent_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM locations WHERE parent_id IN ({}) ORDER BY id",
            LOCATION_COLUMNS,
            placeholders(1, parent_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;

        let nodes = stmt
            .query_map(params_from_iter(parent_ids.iter()), location_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    fn reparent(&self, ids: &[String], new_parent_id: &str) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let sql = format!(
            "UPDATE locations SET parent_id = ?1, updated_at = ?2 WHERE id IN ({})",
            placeholders(3, ids.len())
        );
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<&str> = vec![new_parent_id, &now];
        values.extend(ids.iter().map(|s| s.as_str()));

        let changed = conn.execute(&sql, params_from_iter(values))?;
        debug!(changed, new_parent_id, "reparented locations");
        Ok(changed)
    }

    fn update_fields(&self, id: &str, patch: &LocationPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let mut push = |column: &str, value: Box<dyn rusqlite::ToSql>| {
            values.push(value);
            sets.push(format!("{} = ?{}", column, values.len()));
        };

        if let Some(name) = &patch.name {
            push("name", Box::new(name.clone()));
        }
        if let Some(display_name) = &patch.display_name {
            push("display_name", Box::new(display_name.clone()));
        }
        if let Some(canonical_name) = &patch.canonical_name {
            push("canonical_name", Box::new(canonical_name.clone()));
        }
        if let Some(parent_id) = &patch.parent_id {
            push("parent_id", Box::new(parent_id.clone()));
        }
        if let Some(popularity) = patch.popularity_score {
            push("popularity_score", Box::new(popularity.min(100) as i64));
        }
        if let Some(usage) = patch.usage_count {
            push("usage_count", Box::new(count_to_sql(usage)));
        }
        push("updated_at", Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE locations SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );

        let changed = self
            .lock()?
            .execute(&sql, params_from_iter(values.iter()))?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    fn apply_merge_stats(
        &self,
        keeper_id: &str,
        usage_count: u64,
        popularity_score: u8,
        folded_ids: &[String],
    ) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        if !folded_ids.is_empty() {
            let sql = format!(
                "UPDATE locations SET merged_into = ?1, updated_at = ?2
                 WHERE id IN ({}) AND status = 'active' AND merged_into IS NULL",
                placeholders(3, folded_ids.len())
            );
            let mut values: Vec<&str> = vec![keeper_id, &now];
            values.extend(folded_ids.iter().map(|s| s.as_str()));

            let folded = tx.execute(&sql, params_from_iter(values))?;
            if folded != folded_ids.len() {
                // Dropping `tx` rolls back
                return Err(StoreError::Conflict(format!(
                    "expected to fold {} locations into {}, folded {}",
                    folded_ids.len(),
                    keeper_id,
                    folded
                )));
            }
        }

        let updated = tx.execute(
            "UPDATE locations SET usage_count = ?1, popularity_score = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'active' AND merged_into IS NULL",
            params![
                count_to_sql(usage_count),
                popularity_score.min(100) as i64,
                now,
                keeper_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::Conflict(format!(
                "keeper {} is no longer active or was folded into another location",
                keeper_id
            )));
        }

        tx.commit()?;
        Ok(())
    }

    fn bulk_update_status(&self, ids: &[String], status: LocationStatus) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        // Only rows whose current status may move to `status`; Inactive rows are terminal
        let sources: Vec<&str> = LocationStatus::ALL
            .iter()
            .filter(|from| **from != status && from.can_transition_to(status))
            .map(|from| from.as_str())
            .collect();
        if sources.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let sql = format!(
            "UPDATE locations SET status = ?1, updated_at = ?2
             WHERE id IN ({}) AND status IN ({})",
            placeholders(3, ids.len()),
            placeholders(3 + ids.len(), sources.len())
        );
        let now = Utc::now().to_rfc3339();
        let mut values: Vec<&str> = vec![status.as_str(), &now];
        values.extend(ids.iter().map(|s| s.as_str()));
        values.extend(sources);

        let changed = conn.execute(&sql, params_from_iter(values))?;
        Ok(changed)
    }
}

impl AliasStore for SqliteStore {
    fn reassign_location(
        &self,
        old_location_id: &str,
        new_location_id: &str,
    ) -> StoreResult<usize> {
        let changed = self.lock()?.execute(
            "UPDATE location_aliases SET location_id = ?2 WHERE location_id = ?1",
            params![old_location_id, new_location_id],
        )?;
        Ok(changed)
    }
}

impl TagStore for SqliteStore {
    fn find_tag_by_location(&self, location_id: &str) -> StoreResult<Option<Tag>> {
        let tag = self
            .lock()?
            .query_row(
                "SELECT id, name, location_id, retired FROM tags
                 WHERE location_id = ?1 AND retired = 0
                 ORDER BY id LIMIT 1",
                [location_id],
                tag_from_row,
            )
            .optional()?;
        Ok(tag)
    }

    fn reassign_tag_usages(&self, old_tag_id: &str, new_tag_id: &str) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // Records already using the new tag keep a single usage row
        let moved = tx.execute(
            "UPDATE OR IGNORE tag_usages SET tag_id = ?2 WHERE tag_id = ?1",
            params![old_tag_id, new_tag_id],
        )?;
        tx.execute("DELETE FROM tag_usages WHERE tag_id = ?1", [old_tag_id])?;

        tx.commit()?;
        Ok(moved)
    }

    fn retire_tag(&self, tag_id: &str) -> StoreResult<()> {
        let changed = self.lock()?.execute(
            "UPDATE tags SET retired = 1, location_id = NULL WHERE id = ?1",
            [tag_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(tag_id.to_string()));
        }
        Ok(())
    }

    fn set_tag_location(&self, tag_id: &str, location_id: &str) -> StoreResult<()> {
        let changed = self.lock()?.execute(
            "UPDATE tags SET location_id = ?2 WHERE id = ?1 AND retired = 0",
            params![tag_id, location_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(tag_id.to_string()));
        }
        Ok(())
    }
}

impl AuditLog for SqliteStore {
    fn record(&self, event: &Event) -> StoreResult<()> {
        insert_event(&*self.lock()?, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_location(id: &str, name: &str, location_type: LocationType) -> LocationNode {
        LocationNode::new(name, location_type, None).with_id(id)
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();

        let mut node = create_test_location("s1", "Piantini", LocationType::Sector)
            .with_stats(42, 7);
        node.parent_id = Some("c1".to_string());
        node.geo = Some(GeoInfo {
            latitude: 18.47,
            longitude: -69.94,
            bounds: None,
        });
        store.insert_location(&node).unwrap();

        let loaded = store.get("s1").unwrap();
        assert_eq!(loaded.name, "Piantini");
        assert_eq!(loaded.location_type, LocationType::Sector);
        assert_eq!(loaded.parent_id.as_deref(), Some("c1"));
        assert_eq!(loaded.popularity_score, 42);
        assert_eq!(loaded.usage_count, 7);
        assert_eq!(loaded.geo, node.geo);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_list_active_excludes_tombstones_and_drafts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(&create_test_location("a", "Naco", LocationType::Sector))
            .unwrap();
        store
            .insert_location(
                &create_test_location("b", "Naco", LocationType::Sector)
                    .with_status(LocationStatus::Inactive),
            )
            .unwrap();
        store
            .insert_location(
                &create_test_location("c", "Gazcue", LocationType::Sector)
                    .with_status(LocationStatus::Draft),
            )
            .unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn test_bulk_update_status_never_reactivates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(&create_test_location("a", "Naco", LocationType::Sector))
            .unwrap();
        store
            .insert_location(
                &create_test_location("b", "Naco", LocationType::Sector)
                    .with_status(LocationStatus::Inactive),
            )
            .unwrap();
        store
            .insert_location(
                &create_test_location("c", "Naco", LocationType::Sector)
                    .with_status(LocationStatus::Draft),
            )
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let changed = store.bulk_update_status(&ids, LocationStatus::Active).unwrap();

        // Only the draft moves; active is unchanged and inactive is terminal
        assert_eq!(changed, 1);
        assert_eq!(store.get("b").unwrap().status, LocationStatus::Inactive);
        assert_eq!(store.get("c").unwrap().status, LocationStatus::Active);
    }

    #[test]
    fn test_tombstoning_skips_rows_already_inactive() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(&create_test_location("a", "Naco", LocationType::Sector))
            .unwrap();
        store
            .insert_location(
                &create_test_location("b", "Naco", LocationType::Sector)
                    .with_status(LocationStatus::Inactive),
            )
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let changed = store.bulk_update_status(&ids, LocationStatus::Inactive).unwrap();

        assert_eq!(changed, 1);
        assert_eq!(store.get("a").unwrap().status, LocationStatus::Inactive);
    }

    #[test]
    fn test_apply_merge_stats_rejects_folded_keeper() {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in ["a", "b"] {
            store
                .insert_location(&create_test_location(id, "Naco", LocationType::Sector))
                .unwrap();
        }
        store
            .apply_merge_stats("b", 17, 75, &["a".to_string()])
            .unwrap();

        // a was folded into b; it cannot now absorb b
        let result = store.apply_merge_stats("a", 34, 80, &["b".to_string()]);

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.get("b").unwrap().merged_into.is_none());
        assert_eq!(store.get("a").unwrap().usage_count, 0);
        assert_eq!(store.get("b").unwrap().usage_count, 17);
    }

    #[test]
    fn test_huge_usage_count_saturates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(
                &create_test_location("a", "Naco", LocationType::Sector).with_stats(1, u64::MAX),
            )
            .unwrap();
        store
            .insert_location(&create_test_location("b", "Naco", LocationType::Sector))
            .unwrap();

        assert_eq!(store.get("a").unwrap().usage_count, i64::MAX as u64);

        store
            .apply_merge_stats("b", u64::MAX, 100, &["a".to_string()])
            .unwrap();
        assert_eq!(store.get("b").unwrap().usage_count, i64::MAX as u64);
    }

    #[test]
    fn test_apply_merge_stats_conflicts_when_already_folded() {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in ["k", "l1", "l2"] {
            store
                .insert_location(&create_test_location(id, "Naco", LocationType::Sector))
                .unwrap();
        }

        store
            .apply_merge_stats("k", 10, 50, &["l1".to_string()])
            .unwrap();
        assert_eq!(store.get("l1").unwrap().merged_into.as_deref(), Some("k"));

        // l1 already folded: whole call rolls back, l2 untouched
        let result = store.apply_merge_stats("k", 99, 99, &["l1".to_string(), "l2".to_string()]);
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.get("l2").unwrap().merged_into.is_none());
        assert_eq!(store.get("k").unwrap().usage_count, 10);
    }

    #[test]
    fn test_update_fields_unknown_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.update_fields("missing", &LocationPatch::parent("c1"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_reassign_tag_usages_keeps_one_row_per_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(&create_test_location("k", "Naco", LocationType::Sector))
            .unwrap();
        store
            .insert_location(&create_test_location("l", "Naco", LocationType::Sector))
            .unwrap();

        let keeper_tag = Tag::new("naco", Some("k"));
        let loser_tag = Tag::new("naco-2", Some("l"));
        store.insert_tag(&keeper_tag).unwrap();
        store.insert_tag(&loser_tag).unwrap();

        store.insert_tag_usage(&keeper_tag.id, "property-1").unwrap();
        store.insert_tag_usage(&loser_tag.id, "property-1").unwrap();
        store.insert_tag_usage(&loser_tag.id, "property-2").unwrap();

        let moved = store
            .reassign_tag_usages(&loser_tag.id, &keeper_tag.id)
            .unwrap();

        assert_eq!(moved, 1);
        assert_eq!(store.count_tag_usages(&keeper_tag.id).unwrap(), 2);
        assert_eq!(store.count_tag_usages(&loser_tag.id).unwrap(), 0);
    }

    #[test]
    fn test_retire_tag_unlinks_location() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_location(&create_test_location("l", "Naco", LocationType::Sector))
            .unwrap();
        let tag = Tag::new("naco", Some("l"));
        store.insert_tag(&tag).unwrap();

        store.retire_tag(&tag.id).unwrap();

        let retired = store.get_tag(&tag.id).unwrap().unwrap();
        assert!(retired.retired);
        assert!(retired.location_id.is_none());
        assert!(store.find_tag_by_location("l").unwrap().is_none());
    }

    #[test]
    fn test_event_log() {
        let store = SqliteStore::open_in_memory().unwrap();

        let event = Event::new(
            "location_merged",
            "location",
            "test_id_123",
            serde_json::json!({"tombstoned": ["a", "b"]}),
            "test_actor",
        );

        store.record(&event).unwrap();

        let events = store.events_for("location", "test_id_123").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "location_merged");
        assert_eq!(events[0].actor, "test_actor");
    }
}

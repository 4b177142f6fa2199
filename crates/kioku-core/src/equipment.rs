//! Item & Equipment Store
//!
//! Parallel persona-scoped inventory store (`equipment.db`), independent of
//! the memory engine but following the same write-path discipline. Tables:
//! items master, per-persona inventory quantities, equipment history, and
//! the current-equipment snapshot that memory creation captures into
//! `equipped_items`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::store::{Result, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub item_id: String,
    pub item_name: String,
    pub description: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    pub item: Item,
    pub quantity: i64,
    pub acquired_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EquipmentEvent {
    pub slot: String,
    pub item_name: Option<String>,
    pub action: String,
    pub timestamp: String,
}

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    item_id TEXT PRIMARY KEY,
    item_name TEXT NOT NULL UNIQUE,
    description TEXT,
    category TEXT DEFAULT 'misc',
    tags TEXT DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inventory (
    persona TEXT NOT NULL,
    item_id TEXT NOT NULL,
    quantity INTEGER DEFAULT 1,
    acquired_at TEXT NOT NULL,
    PRIMARY KEY (persona, item_id),
    FOREIGN KEY (item_id) REFERENCES items(item_id)
);

CREATE TABLE IF NOT EXISTS equipment_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    persona TEXT NOT NULL,
    item_id TEXT,
    slot TEXT NOT NULL,
    action TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (item_id) REFERENCES items(item_id)
);

CREATE TABLE IF NOT EXISTS current_equipment (
    persona TEXT NOT NULL,
    slot TEXT NOT NULL,
    item_id TEXT NOT NULL,
    equipped_at TEXT NOT NULL,
    PRIMARY KEY (persona, slot),
    FOREIGN KEY (item_id) REFERENCES items(item_id)
);

CREATE INDEX IF NOT EXISTS idx_inventory_persona ON inventory(persona);
CREATE INDEX IF NOT EXISTS idx_equipment_history_persona
    ON equipment_history(persona, timestamp);
"#;

/// Per-persona equipment database.
pub struct EquipmentStore {
    persona: String,
    conn: Mutex<Connection>,
}

impl EquipmentStore {
    pub fn open(path: &Path, persona: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(DDL)?;
        Ok(Self {
            persona: persona.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Init("Equipment lock poisoned".into()))
    }

    fn item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
        let tags: Option<String> = row.get(4)?;
        Ok(Item {
            item_id: row.get(0)?,
            item_name: row.get(1)?,
            description: row.get(2)?,
            category: row.get(3)?,
            tags: tags
                .and_then(|t| serde_json::from_str(&t).ok())
                .unwrap_or_default(),
            created_at: row.get(5)?,
        })
    }

    fn find_item(conn: &Connection, name: &str) -> rusqlite::Result<Option<Item>> {
        conn.query_row(
            "SELECT item_id, item_name, description, category, tags, created_at
             FROM items WHERE item_name = ?1",
            params![name],
            Self::item_row,
        )
        .optional()
    }

    /// Add quantity of a named item, creating the master row if needed.
    pub fn add_item(
        &self,
        name: &str,
        description: Option<&str>,
        category: Option<&str>,
        tags: &[String],
        quantity: i64,
        now: DateTime<FixedOffset>,
    ) -> Result<Item> {
        let conn = self.conn()?;
        let ts = now.to_rfc3339();

        let item = match Self::find_item(&conn, name)? {
            Some(item) => item,
            None => {
                let item_id = uuid::Uuid::new_v4().to_string();
                let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
                conn.execute(
                    "INSERT INTO items (item_id, item_name, description, category, tags, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        item_id,
                        name,
                        description,
                        category.unwrap_or("misc"),
                        tags_json,
                        ts
                    ],
                )?;
                Self::find_item(&conn, name)?
                    .ok_or_else(|| StoreError::NotFound(name.to_string()))?
            }
        };

        conn.execute(
            "INSERT INTO inventory (persona, item_id, quantity, acquired_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(persona, item_id) DO UPDATE SET
                 quantity = inventory.quantity + excluded.quantity",
            params![self.persona, item.item_id, quantity.max(1), ts],
        )?;
        Ok(item)
    }

    /// Decrease quantity; the inventory row is removed when it reaches zero.
    /// Returns the remaining quantity, or `NotFound` if the item is absent.
    pub fn remove_item(&self, name: &str, quantity: i64) -> Result<i64> {
        let conn = self.conn()?;
        let item =
            Self::find_item(&conn, name)?.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let current: Option<i64> = conn
            .query_row(
                "SELECT quantity FROM inventory WHERE persona = ?1 AND item_id = ?2",
                params![self.persona, item.item_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let remaining = (current - quantity.max(1)).max(0);
        if remaining == 0 {
            conn.execute(
                "DELETE FROM inventory WHERE persona = ?1 AND item_id = ?2",
                params![self.persona, item.item_id],
            )?;
        } else {
            conn.execute(
                "UPDATE inventory SET quantity = ?1 WHERE persona = ?2 AND item_id = ?3",
                params![remaining, self.persona, item.item_id],
            )?;
        }
        Ok(remaining)
    }

    pub fn update_item(
        &self,
        name: &str,
        description: Option<&str>,
        category: Option<&str>,
        tags: Option<&[String]>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let item =
            Self::find_item(&conn, name)?.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Some(desc) = description {
            conn.execute(
                "UPDATE items SET description = ?1 WHERE item_id = ?2",
                params![desc, item.item_id],
            )?;
        }
        if let Some(cat) = category {
            conn.execute(
                "UPDATE items SET category = ?1 WHERE item_id = ?2",
                params![cat, item.item_id],
            )?;
        }
        if let Some(tags) = tags {
            let json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
            conn.execute(
                "UPDATE items SET tags = ?1 WHERE item_id = ?2",
                params![json, item.item_id],
            )?;
        }
        Ok(())
    }

    pub fn rename_item(&self, name: &str, new_name: &str) -> Result<()> {
        let conn = self.conn()?;
        let item =
            Self::find_item(&conn, name)?.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if Self::find_item(&conn, new_name)?.is_some() {
            return Err(StoreError::Init(format!("Item '{}' already exists", new_name)));
        }
        conn.execute(
            "UPDATE items SET item_name = ?1 WHERE item_id = ?2",
            params![new_name, item.item_id],
        )?;
        Ok(())
    }

    /// Substring search over inventory, optionally narrowed by category.
    pub fn search(&self, query: Option<&str>, category: Option<&str>) -> Result<Vec<InventoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT i.item_id, i.item_name, i.description, i.category, i.tags, i.created_at,
                    inv.quantity, inv.acquired_at
             FROM inventory inv JOIN items i ON i.item_id = inv.item_id
             WHERE inv.persona = ?1
               AND (?2 IS NULL OR i.item_name LIKE '%' || ?2 || '%')
               AND (?3 IS NULL OR i.category = ?3)
             ORDER BY i.item_name",
        )?;
        let entries = stmt
            .query_map(params![self.persona, query, category], |row| {
                Ok(InventoryEntry {
                    item: Self::item_row(row)?,
                    quantity: row.get(6)?,
                    acquired_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Equip items into slots. `auto_add` creates missing items on the fly.
    /// Other slots keep their current content.
    pub fn equip(
        &self,
        equipment: &BTreeMap<String, String>,
        auto_add: bool,
        now: DateTime<FixedOffset>,
    ) -> Result<()> {
        for (slot, item_name) in equipment {
            {
                let conn = self.conn()?;
                if Self::find_item(&conn, item_name)?.is_none() {
                    if !auto_add {
                        return Err(StoreError::NotFound(item_name.clone()));
                    }
                    drop(conn);
                    self.add_item(item_name, None, None, &[], 1, now)?;
                }
            }
            let conn = self.conn()?;
            let item = Self::find_item(&conn, item_name)?
                .ok_or_else(|| StoreError::NotFound(item_name.clone()))?;
            let ts = now.to_rfc3339();
            conn.execute(
                "INSERT INTO current_equipment (persona, slot, item_id, equipped_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(persona, slot) DO UPDATE SET
                     item_id = excluded.item_id, equipped_at = excluded.equipped_at",
                params![self.persona, slot, item.item_id, ts],
            )?;
            conn.execute(
                "INSERT INTO equipment_history (persona, item_id, slot, action, timestamp)
                 VALUES (?1, ?2, ?3, 'equip', ?4)",
                params![self.persona, item.item_id, slot, ts],
            )?;
        }
        Ok(())
    }

    /// Clear the given slots, logging an unequip event for each.
    pub fn unequip(&self, slots: &[String], now: DateTime<FixedOffset>) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let ts = now.to_rfc3339();
        let mut cleared = Vec::new();
        for slot in slots {
            let item_id: Option<String> = conn
                .query_row(
                    "SELECT item_id FROM current_equipment WHERE persona = ?1 AND slot = ?2",
                    params![self.persona, slot],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(item_id) = item_id {
                conn.execute(
                    "DELETE FROM current_equipment WHERE persona = ?1 AND slot = ?2",
                    params![self.persona, slot],
                )?;
                conn.execute(
                    "INSERT INTO equipment_history (persona, item_id, slot, action, timestamp)
                     VALUES (?1, ?2, ?3, 'unequip', ?4)",
                    params![self.persona, item_id, slot, ts],
                )?;
                cleared.push(slot.clone());
            }
        }
        Ok(cleared)
    }

    /// Current equipment snapshot: slot -> item name.
    pub fn current_equipment(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT ce.slot, i.item_name
             FROM current_equipment ce JOIN items i ON i.item_id = ce.item_id
             WHERE ce.persona = ?1",
        )?;
        let rows = stmt
            .query_map(params![self.persona], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }

    /// Equip/unequip events since `cutoff`, optionally for a single slot.
    pub fn history(
        &self,
        slot: Option<&str>,
        cutoff: DateTime<FixedOffset>,
    ) -> Result<Vec<EquipmentEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT eh.slot, i.item_name, eh.action, eh.timestamp
             FROM equipment_history eh LEFT JOIN items i ON i.item_id = eh.item_id
             WHERE eh.persona = ?1 AND eh.timestamp >= ?2
               AND (?3 IS NULL OR eh.slot = ?3)
             ORDER BY eh.timestamp DESC",
        )?;
        let events = stmt
            .query_map(params![self.persona, cutoff.to_rfc3339(), slot], |row| {
                Ok(EquipmentEvent {
                    slot: row.get(0)?,
                    item_name: row.get(1)?,
                    action: row.get(2)?,
                    timestamp: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Cheap statistics: (distinct items, total quantity, equipped slots).
    pub fn stats(&self) -> Result<(u64, u64, u64)> {
        let conn = self.conn()?;
        let items: i64 = conn.query_row(
            "SELECT COUNT(*) FROM inventory WHERE persona = ?1",
            params![self.persona],
            |row| row.get(0),
        )?;
        let quantity: i64 = conn.query_row(
            "SELECT COALESCE(SUM(quantity), 0) FROM inventory WHERE persona = ?1",
            params![self.persona],
            |row| row.get(0),
        )?;
        let equipped: i64 = conn.query_row(
            "SELECT COUNT(*) FROM current_equipment WHERE persona = ?1",
            params![self.persona],
            |row| row.get(0),
        )?;
        Ok((items as u64, quantity as u64, equipped as u64))
    }
}

use std::path::Path;

use rusqlite::{Connection, params};

use fm_core::{MemoryNode, NodeContent, WireNode};

use crate::error::{Result, StoreError};
use crate::schema;

/// One row per memory node. Numeric state lives in columns; the record
/// content and access history are JSON.
pub struct NodeStore {
    conn: Connection,
}

impl NodeStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).ok();
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // --- Save ---

    /// Upsert `nodes` in a single transaction.
    pub fn save_nodes(&self, nodes: &[&MemoryNode]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO nodes
                 (id, category, x, y, z, act_resting, act_threshold, act_current,
                  confidence, resonance, access_history, last_adapted, created_at, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for node in nodes {
                let history: Vec<u64> = node.access_history.iter().copied().collect();
                stmt.execute(params![
                    node.id,
                    node.category(),
                    node.coordinates.x,
                    node.coordinates.y,
                    node.coordinates.z,
                    node.activation.resting,
                    node.activation.threshold,
                    node.activation.current,
                    node.confidence(),
                    node.resonance(),
                    serde_json::to_string(&history)?,
                    to_sql_ms(node.last_adapted),
                    to_sql_ms(node.created_at),
                    serde_json::to_string(&node.content)?,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(count = nodes.len(), "saved nodes");
        Ok(nodes.len())
    }

    pub fn delete_node(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute("DELETE FROM nodes WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute_batch("DELETE FROM nodes;")?;
        Ok(())
    }

    // --- Load ---

    /// Every stored node, ordered by id. Values are re-clamped on the way in.
    pub fn load_nodes(&self) -> Result<Vec<MemoryNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, x, y, z, act_resting, act_threshold, act_current,
                    confidence, resonance, access_history, last_adapted, created_at, content
             FROM nodes ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(NodeRow {
                    id: row.get(0)?,
                    coordinates: [row.get(1)?, row.get(2)?, row.get(3)?],
                    activation: [row.get(4)?, row.get(5)?, row.get(6)?],
                    confidence: row.get(7)?,
                    resonance: row.get(8)?,
                    access_history: row.get(9)?,
                    last_adapted: row.get(10)?,
                    created_at: row.get(11)?,
                    content: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    pub fn load_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        Ok(self.load_nodes()?.into_iter().find(|n| n.id == id))
    }

    pub fn node_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// `(category, count)` pairs, alphabetical.
    pub fn category_counts(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT category, COUNT(*) FROM nodes GROUP BY category ORDER BY category")?;
        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, count.max(0) as usize))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Force a WAL checkpoint. Called on clean shutdown.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

struct NodeRow {
    id: String,
    coordinates: [f64; 3],
    activation: [f64; 3],
    confidence: f64,
    resonance: f64,
    access_history: String,
    last_adapted: i64,
    created_at: i64,
    content: String,
}

impl NodeRow {
    fn into_node(self) -> Result<MemoryNode> {
        let content: NodeContent = serde_json::from_str(&self.content)?;
        let access_history: Vec<u64> = serde_json::from_str(&self.access_history)?;
        let wire = WireNode {
            id: self.id,
            category: content.category,
            title: content.title,
            description: content.description,
            tags: content.tags,
            payload: content.payload,
            signature: content.signature,
            coordinates: self.coordinates,
            activation: self.activation,
            confidence: self.confidence,
            resonance: self.resonance,
            access_history,
            last_adapted: self.last_adapted.max(0) as u64,
            created_at: self.created_at.max(0) as u64,
        };
        wire.into_node()
            .map_err(|e| StoreError::InvalidData(e.to_string()))
    }
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

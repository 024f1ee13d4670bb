use anyhow::Result;
use rusqlite::{params, Connection};

/// One submission attempt as written to the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub ts_ms: u64,
    pub name: String,
    pub action_type: String,
    pub fingerprint: String,
    pub tx_id: Option<String>,
    pub status: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    /// `immediate`, `scheduled` or `manual`.
    pub origin: String,
}

/// Append-only SQLite journal of submissions.
pub struct ExecutionStore {
    conn: Connection,
}

impl ExecutionStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                name TEXT NOT NULL,
                action_type TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                tx_id TEXT,
                status TEXT,
                success INTEGER NOT NULL,
                error TEXT,
                origin TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_fingerprint ON executions (fingerprint);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn record(&mut self, rec: &ExecutionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO executions (ts, name, action_type, fingerprint, tx_id, status, success, error, origin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.ts_ms as i64,
                rec.name,
                rec.action_type,
                rec.fingerprint,
                rec.tx_id,
                rec.status,
                rec.success as i64,
                rec.error,
                rec.origin,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, name, action_type, fingerprint, tx_id, status, success, error, origin
             FROM executions ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ExecutionRecord {
                ts_ms: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
                action_type: row.get(2)?,
                fingerprint: row.get(3)?,
                tx_id: row.get(4)?,
                status: row.get(5)?,
                success: row.get::<_, i64>(6)? != 0,
                error: row.get(7)?,
                origin: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Submissions recorded for an envelope identity.
    pub fn attempts_for(&self, fingerprint: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

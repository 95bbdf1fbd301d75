//! Database repository layer
//!
//! The pending record store. Every public operation runs as one statement or
//! one transaction on the shared connection, so callers on different threads
//! never observe a half-written record.

use crate::error::{Result, StorageError};
use crate::types::*;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "id, kind, event_type, project_token, base_url, authorization, \
     customer_ids, properties, timestamp, retries";

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the flush task read while tracking calls append
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a statement half-applied
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Customer identity
    // ============================================

    /// Identifiers of the current customer (empty until one is assigned)
    pub fn customer_ids(&self) -> std::result::Result<CustomerIds, StorageError> {
        let conn = self.connection();
        load_customer_ids(&conn).map_err(StorageError::read)
    }

    /// Push token last registered for the current customer
    pub fn push_token(&self) -> std::result::Result<Option<String>, StorageError> {
        let conn = self.connection();
        let token: Option<Option<String>> = conn
            .query_row("SELECT push_token FROM customer WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StorageError::read)?;
        Ok(token.flatten())
    }

    /// Return the customer's cookie id, minting one if the customer has none.
    pub fn ensure_cookie(&self) -> std::result::Result<String, StorageError> {
        let mut conn = self.connection();
        let tx = conn.transaction().map_err(StorageError::write)?;

        let mut ids = load_customer_ids(&tx).map_err(StorageError::read)?;
        if let Some(cookie) = ids.get(COOKIE_ID).filter(|c| !c.is_empty()) {
            return Ok(cookie.clone());
        }

        let cookie = uuid::Uuid::new_v4().to_string();
        ids.insert(COOKIE_ID.to_string(), cookie.clone());
        save_customer(&tx, &ids, None)?;
        tx.commit().map_err(StorageError::write)?;

        tracing::debug!(cookie = %cookie, "Created new customer cookie");
        Ok(cookie)
    }

    // ============================================
    // Pending records
    // ============================================

    /// Persist a record built from `records`, targeting the configured project.
    ///
    /// The project token must be among the data records; base URL and
    /// authorization fall back to the current configuration at flush time.
    pub fn append(
        &self,
        kind: RecordKind,
        records: &[DataRecord],
    ) -> std::result::Result<RecordId, StorageError> {
        self.insert_record(kind, records, None)
    }

    /// Persist a record bound to an explicit delivery target.
    pub fn append_for_project(
        &self,
        kind: RecordKind,
        project: &Project,
        records: &[DataRecord],
    ) -> std::result::Result<RecordId, StorageError> {
        let mut data = Vec::with_capacity(records.len() + 1);
        data.push(DataRecord::ProjectToken(project.project_token.clone()));
        data.extend_from_slice(records);
        self.insert_record(kind, &data, Some(project))
    }

    fn insert_record(
        &self,
        kind: RecordKind,
        records: &[DataRecord],
        project: Option<&Project>,
    ) -> std::result::Result<RecordId, StorageError> {
        let draft = RecordDraft::fold(records);
        draft.validate(kind)?;

        let mut conn = self.connection();
        let tx = conn.transaction().map_err(StorageError::write)?;

        // Customer updates re-key the identity before it is frozen into the record
        let mut customer_ids = load_customer_ids(&tx).map_err(StorageError::read)?;
        if kind == RecordKind::CustomerUpdate
            && (!draft.customer_ids.is_empty() || draft.push_token.is_some())
        {
            customer_ids.extend(draft.customer_ids.clone());
            save_customer(&tx, &customer_ids, draft.push_token.as_ref())?;
        }

        let timestamp = draft.timestamp.unwrap_or_else(now_secs);
        let event_type = match kind {
            RecordKind::Event => draft.event_type.as_deref(),
            RecordKind::CustomerUpdate => None,
        };
        let customer_ids_json = serde_json::to_string(&customer_ids).map_err(StorageError::write)?;
        let properties_json =
            serde_json::to_string(&draft.properties).map_err(StorageError::write)?;

        tx.execute(
            r#"
            INSERT INTO pending_records (
                kind, event_type, project_token, base_url, authorization,
                customer_ids, properties, timestamp, retries, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
            "#,
            params![
                kind.as_str(),
                event_type,
                draft.project_token.as_deref(),
                project.map(|p| p.base_url.as_str()),
                project.and_then(|p| p.authorization.header_value()),
                customer_ids_json,
                properties_json,
                timestamp,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(StorageError::write)?;
        let id = RecordId(tx.last_insert_rowid());
        tx.commit().map_err(StorageError::write)?;

        tracing::debug!(
            record_id = %id,
            kind = kind.as_str(),
            event_type = event_type.unwrap_or(""),
            "Added pending record"
        );
        Ok(id)
    }

    /// All pending customer updates in insertion order
    pub fn fetch_all_customer_updates(
        &self,
    ) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        self.fetch_all(RecordKind::CustomerUpdate)
    }

    /// All pending events in insertion order
    pub fn fetch_all_events(&self) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        self.fetch_all(RecordKind::Event)
    }

    fn fetch_all(&self, kind: RecordKind) -> std::result::Result<Vec<PendingRecord>, StorageError> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pending_records WHERE kind = ?1 ORDER BY id ASC",
                RECORD_COLUMNS
            ))
            .map_err(StorageError::read)?;

        let rows = stmt
            .query_map([kind.as_str()], row_to_record)
            .map_err(StorageError::read)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::read)
    }

    /// Get a single pending record by id
    pub fn get(&self, id: RecordId) -> std::result::Result<Option<PendingRecord>, StorageError> {
        let conn = self.connection();
        conn.query_row(
            &format!("SELECT {} FROM pending_records WHERE id = ?1", RECORD_COLUMNS),
            [id.0],
            row_to_record,
        )
        .optional()
        .map_err(StorageError::read)
    }

    /// Remove a record. Deleting a missing id is not an error.
    pub fn delete(&self, id: RecordId) -> std::result::Result<(), StorageError> {
        let conn = self.connection();
        let removed = conn
            .execute("DELETE FROM pending_records WHERE id = ?1", [id.0])
            .map_err(StorageError::write)?;
        if removed == 0 {
            tracing::trace!(record_id = %id, "Delete of missing record ignored");
        }
        Ok(())
    }

    /// Atomically bump the retry counter of a record.
    ///
    /// No ceiling is enforced here; callers decide when to delete instead.
    pub fn increment_retry(&self, id: RecordId) -> std::result::Result<(), StorageError> {
        let conn = self.connection();
        let updated = conn
            .execute(
                "UPDATE pending_records SET retries = retries + 1 WHERE id = ?1",
                [id.0],
            )
            .map_err(StorageError::write)?;
        if updated == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    /// Delete every pending record and forget the customer identity.
    pub fn clear(&self) -> std::result::Result<(), StorageError> {
        let mut conn = self.connection();
        let tx = conn.transaction().map_err(StorageError::write)?;
        tx.execute("DELETE FROM pending_records", [])
            .map_err(StorageError::write)?;
        tx.execute("DELETE FROM customer", [])
            .map_err(StorageError::write)?;
        tx.commit().map_err(StorageError::write)?;
        tracing::info!("Cleared pending records and customer identity");
        Ok(())
    }

    /// Cheap existence check across both record kinds
    pub fn has_any_pending(&self) -> std::result::Result<bool, StorageError> {
        let conn = self.connection();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_records)",
            [],
            |row| row.get(0),
        )
        .map_err(StorageError::read)
    }

    /// Number of pending customer updates
    pub fn count_customer_updates(&self) -> std::result::Result<usize, StorageError> {
        self.count(RecordKind::CustomerUpdate)
    }

    /// Number of pending events
    pub fn count_events(&self) -> std::result::Result<usize, StorageError> {
        self.count(RecordKind::Event)
    }

    fn count(&self, kind: RecordKind) -> std::result::Result<usize, StorageError> {
        let conn = self.connection();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pending_records WHERE kind = ?1",
                [kind.as_str()],
                |row| row.get(0),
            )
            .map_err(StorageError::read)?;
        Ok(count as usize)
    }
}

fn load_customer_ids(conn: &Connection) -> rusqlite::Result<CustomerIds> {
    let raw: Option<String> = conn
        .query_row("SELECT customer_ids FROM customer WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(CustomerIds::new()),
    }
}

/// Upsert the customer row. `push_token` of `None` keeps the stored token.
fn save_customer(
    tx: &Transaction<'_>,
    ids: &CustomerIds,
    push_token: Option<&Option<String>>,
) -> std::result::Result<(), StorageError> {
    let ids_json = serde_json::to_string(ids).map_err(StorageError::write)?;
    let now = Utc::now().to_rfc3339();
    match push_token {
        Some(token) => tx.execute(
            r#"
            INSERT INTO customer (id, customer_ids, push_token, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                customer_ids = excluded.customer_ids,
                push_token = excluded.push_token,
                updated_at = excluded.updated_at
            "#,
            params![ids_json, token.as_deref(), now],
        ),
        None => tx.execute(
            r#"
            INSERT INTO customer (id, customer_ids, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                customer_ids = excluded.customer_ids,
                updated_at = excluded.updated_at
            "#,
            params![ids_json, now],
        ),
    }
    .map_err(StorageError::write)?;
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<PendingRecord> {
    let kind_str: String = row.get(1)?;
    let kind = RecordKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown record kind: {}", kind_str).into(),
        )
    })?;

    let authorization: Option<String> = row.get(5)?;
    let authorization = authorization
        .map(|raw| raw.parse::<Authorization>())
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?;

    let retries: i64 = row.get(9)?;

    Ok(PendingRecord {
        id: RecordId(row.get(0)?),
        kind,
        event_type: row.get(2)?,
        project_token: row.get(3)?,
        base_url: row.get(4)?,
        authorization,
        customer_ids: json_column(row, 6)?,
        properties: json_column(row, 7)?,
        timestamp: row.get(8)?,
        retries: retries.max(0) as u32,
    })
}

//! Relational keystore repository (SQLite)
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use crate::key_types::{Alias, KeyEntryAttributes, KeyState, KeyStore, KeyUsage};
use crate::repository::{
    format_timestamp, parse_timestamp, KeyStoreRepository, KeyStoreSealer, SealedKeyStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sts_keystore (
    name TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    keystore BLOB NOT NULL,
    last_update TEXT
);
CREATE TABLE IF NOT EXISTS sts_key_entry (
    keystore_name TEXT NOT NULL REFERENCES sts_keystore(name) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    created_at TEXT,
    not_before TEXT,
    not_after TEXT,
    expire_at TEXT,
    validity_interval INTEGER NOT NULL,
    legacy_interval INTEGER NOT NULL,
    state TEXT NOT NULL,
    key_usage TEXT NOT NULL,
    PRIMARY KEY (keystore_name, alias)
);
"#;

fn db_error(e: rusqlite::Error) -> KeyError {
    KeyError::Write(format!("Database error: {}", e))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn optional_timestamp(value: Option<String>) -> KeyResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Row of `sts_key_entry` before validation
struct EntryRow {
    alias: String,
    created_at: Option<String>,
    not_before: Option<String>,
    not_after: Option<String>,
    expire_at: Option<String>,
    validity_interval: i64,
    legacy_interval: i64,
    state: String,
    key_usage: String,
}

impl EntryRow {
    fn into_attributes(self) -> KeyResult<KeyEntryAttributes> {
        let state = KeyState::parse(&self.state)
            .ok_or_else(|| KeyError::Corruption(format!("Unknown key state {:?}", self.state)))?;
        let key_usage = KeyUsage::parse(&self.key_usage)
            .ok_or_else(|| KeyError::Corruption(format!("Unknown key usage {:?}", self.key_usage)))?;
        Ok(KeyEntryAttributes {
            alias: self.alias,
            created_at: optional_timestamp(self.created_at)?,
            not_before: optional_timestamp(self.not_before)?,
            not_after: optional_timestamp(self.not_after)?,
            expire_at: optional_timestamp(self.expire_at)?,
            validity_interval: self.validity_interval,
            legacy_interval: self.legacy_interval,
            state,
            key_usage,
        })
    }
}

/// Keystores in two tables: one row per keystore holding the sealed blob, one row per entry
pub struct RelationalRepository {
    conn: Arc<Mutex<Connection>>,
    sealer: KeyStoreSealer,
    auto_create: bool,
    schema_ready: Arc<AtomicBool>,
}

impl RelationalRepository {
    /// Open (or create) a SQLite database file
    pub fn open<P: AsRef<Path>>(path: P, sealer: KeyStoreSealer, auto_create: bool) -> KeyResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_error)?;
        info!(path = %path.as_ref().display(), "Opened relational keystore database");
        Self::with_connection(conn, sealer, auto_create)
    }

    /// Private in-memory database
    pub fn in_memory(sealer: KeyStoreSealer) -> KeyResult<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_error)?, sealer, true)
    }

    fn with_connection(conn: Connection, sealer: KeyStoreSealer, auto_create: bool) -> KeyResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sealer,
            auto_create,
            schema_ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> KeyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> KeyResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let auto_create = self.auto_create;
        let schema_ready = Arc::clone(&self.schema_ready);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| KeyError::Write("Database connection lock poisoned".to_string()))?;
            if auto_create && !schema_ready.load(Ordering::Acquire) {
                conn.execute_batch(SCHEMA).map_err(db_error)?;
                schema_ready.store(true, Ordering::Release);
            }
            f(&mut conn)
        })
        .await
        .map_err(|e| KeyError::Write(format!("Database task failed: {}", e)))?
    }

    fn read_entries(conn: &Connection, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>> {
        let mut stmt = conn
            .prepare(
                "SELECT alias, created_at, not_before, not_after, expire_at, \
                 validity_interval, legacy_interval, state, key_usage \
                 FROM sts_key_entry WHERE keystore_name = ?1",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok(EntryRow {
                    alias: row.get(0)?,
                    created_at: row.get(1)?,
                    not_before: row.get(2)?,
                    not_after: row.get(3)?,
                    expire_at: row.get(4)?,
                    validity_interval: row.get(5)?,
                    legacy_interval: row.get(6)?,
                    state: row.get(7)?,
                    key_usage: row.get(8)?,
                })
            })
            .map_err(db_error)?;

        let mut entries = BTreeMap::new();
        for row in rows {
            let attributes = row.map_err(db_error)?.into_attributes()?;
            entries.insert(attributes.alias.clone(), attributes);
        }
        Ok(entries)
    }

    fn read_sealed(conn: &Connection, name: &str) -> KeyResult<SealedKeyStore> {
        let row: Option<(String, Vec<u8>, Option<String>)> = conn
            .query_row(
                "SELECT type, keystore, last_update FROM sts_keystore WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_error)?;
        let (store_type, keystore, last_update) =
            row.ok_or_else(|| KeyError::NotFound(name.to_string()))?;

        Ok(SealedKeyStore {
            name: name.to_string(),
            store_type,
            keystore,
            last_update: optional_timestamp(last_update)?,
            entries: Self::read_entries(conn, name)?,
        })
    }

    fn write_entries(tx: &Transaction<'_>, sealed: &SealedKeyStore) -> KeyResult<()> {
        tx.execute(
            "DELETE FROM sts_key_entry WHERE keystore_name = ?1",
            params![sealed.name],
        )
        .map_err(db_error)?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO sts_key_entry (keystore_name, alias, created_at, not_before, \
                 not_after, expire_at, validity_interval, legacy_interval, state, key_usage) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .map_err(db_error)?;
        for attributes in sealed.entries.values() {
            stmt.execute(params![
                sealed.name,
                attributes.alias,
                attributes.created_at.as_ref().map(format_timestamp),
                attributes.not_before.as_ref().map(format_timestamp),
                attributes.not_after.as_ref().map(format_timestamp),
                attributes.expire_at.as_ref().map(format_timestamp),
                attributes.validity_interval,
                attributes.legacy_interval,
                attributes.state.as_str(),
                attributes.key_usage.as_str(),
            ])
            .map_err(db_error)?;
        }
        Ok(())
    }

    fn insert_or_replace(conn: &mut Connection, sealed: &SealedKeyStore, replace: bool) -> KeyResult<()> {
        let tx = conn.transaction().map_err(db_error)?;
        let sql = if replace {
            "INSERT INTO sts_keystore (name, type, keystore, last_update) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET type = excluded.type, \
             keystore = excluded.keystore, last_update = excluded.last_update"
        } else {
            "INSERT INTO sts_keystore (name, type, keystore, last_update) VALUES (?1, ?2, ?3, ?4)"
        };
        let inserted = tx.execute(
            sql,
            params![
                sealed.name,
                sealed.store_type,
                sealed.keystore,
                sealed.last_update.as_ref().map(format_timestamp),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if !replace && is_constraint_violation(&e) => {
                return Err(KeyError::AlreadyExists(sealed.name.clone()));
            }
            Err(e) => return Err(db_error(e)),
        }
        Self::write_entries(&tx, sealed)?;
        tx.commit().map_err(db_error)
    }

    async fn persist(&self, store: &KeyStore, replace: bool) -> KeyResult<DateTime<Utc>> {
        let now = Utc::now();
        let sealed = self.sealer.seal(store, now)?;
        self.with_conn(move |conn| Self::insert_or_replace(conn, &sealed, replace))
            .await?;
        debug!(keystore = %store.name(), entries = store.len(), "Saved keystore to database");
        Ok(now)
    }
}

#[async_trait]
impl KeyStoreRepository for RelationalRepository {
    fn backend_name(&self) -> &'static str {
        "relational"
    }

    async fn exists(&self, name: &str) -> KeyResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM sts_keystore WHERE name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(db_error)
        })
        .await
    }

    async fn load(&self, name: &str) -> KeyResult<KeyStore> {
        let owned = name.to_string();
        let sealed = self
            .with_conn(move |conn| {
                // One read transaction so the keystore row and its entries are consistent
                let tx = conn.transaction().map_err(db_error)?;
                let sealed = Self::read_sealed(&tx, &owned)?;
                tx.commit().map_err(db_error)?;
                Ok(sealed)
            })
            .await?;
        self.sealer.unseal(sealed)
    }

    async fn save(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.persist(store, true).await
    }

    async fn create(&self, store: &KeyStore) -> KeyResult<DateTime<Utc>> {
        self.persist(store, false).await
    }

    async fn load_attributes(&self, name: &str) -> KeyResult<BTreeMap<Alias, KeyEntryAttributes>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sealed = Self::read_sealed(conn, &name)?;
            Ok(sealed.entries)
        })
        .await
    }

    async fn last_update(&self, name: &str) -> KeyResult<DateTime<Utc>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let row: Option<Option<String>> = conn
                .query_row(
                    "SELECT last_update FROM sts_keystore WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;
            let last_update = row.ok_or_else(|| KeyError::NotFound(name.clone()))?;
            Ok(optional_timestamp(last_update)?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
        })
        .await
    }
}

//! Persistence collaborators
//!
//! Two stores sit behind the engine:
//!
//! - a **document store**: named documents grouped into collections and owned by a person,
//!   backed here by a single SQLite table;
//! - a **local key-value store**: small typed scalars (rate-limit and survey timestamps)
//!   that belong to the installation rather than to a person.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::models::PersonProfile;

/// Document collections used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Users,
    FatigueLevels,
    HeatStrainLevels,
    HeartRates,
    GsrData,
    BvpData,
    SkinTemperatures,
    FatigueWarnings,
    SurveyResponses,
    EmaSurveys,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::FatigueLevels => "fatigue_levels",
            Collection::HeatStrainLevels => "heat_strain_levels",
            Collection::HeartRates => "heart_rates",
            Collection::GsrData => "gsr_data",
            Collection::BvpData => "bvp_data",
            Collection::SkinTemperatures => "skin_temperatures",
            Collection::FatigueWarnings => "fatigue_warnings",
            Collection::SurveyResponses => "survey_responses",
            Collection::EmaSurveys => "ema_surveys",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the single profile document each person owns in `users`
pub const PROFILE_DOCUMENT: &str = "profile";

/// One stored document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: Collection,
    pub owner_id: String,
    /// Unique within (collection, owner); rewriting the same name overwrites
    pub name: String,
    pub timestamp: f64,
    pub group_id: Option<String>,
    pub body: Value,
}

impl Document {
    pub fn new<T: Serialize>(
        collection: Collection,
        owner_id: impl Into<String>,
        name: impl Into<String>,
        timestamp: f64,
        body: &T,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            collection,
            owner_id: owner_id.into(),
            name: name.into(),
            timestamp,
            group_id: None,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Abstract document collection store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or overwrite a document
    async fn put(&self, document: Document) -> Result<(), StorageError>;

    async fn get(
        &self,
        collection: Collection,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<Document>, StorageError>;

    /// Documents of one owner with `start <= timestamp <= end`, oldest first
    async fn range(
        &self,
        collection: Collection,
        owner_id: &str,
        start: f64,
        end: f64,
    ) -> Result<Vec<Document>, StorageError>;

    /// Documents tagged with a group, newest first
    async fn by_group(
        &self,
        collection: Collection,
        group_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError>;
}

/// Document store backed by one SQLite table
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    /// Create or open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StorageError::LocalState {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                })?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "document store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    timestamp REAL NOT NULL,
                    group_id TEXT,
                    body TEXT NOT NULL,
                    PRIMARY KEY (collection, owner_id, name)
                );
                CREATE INDEX IF NOT EXISTS idx_documents_owner_time
                    ON documents(collection, owner_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_documents_group_time
                    ON documents(collection, group_id, timestamp);
                "#,
            )?;
            Ok(())
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        f(&conn)
    }

    /// Total number of stored documents in a collection
    pub fn count(&self, collection: Collection) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

type DocumentRow = (String, String, f64, Option<String>, String);

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<DocumentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_document(collection: Collection, row: DocumentRow) -> Result<Document, StorageError> {
    let (owner_id, name, timestamp, group_id, body) = row;
    Ok(Document {
        collection,
        owner_id,
        name,
        timestamp,
        group_id,
        body: serde_json::from_str(&body)?,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn put(&self, document: Document) -> Result<(), StorageError> {
        let body = serde_json::to_string(&document.body)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO documents (collection, owner_id, name, timestamp, group_id, body)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    document.collection.as_str(),
                    document.owner_id,
                    document.name,
                    document.timestamp,
                    document.group_id,
                    body,
                ],
            )?;
            Ok(())
        })?;
        debug!(collection = %document.collection, owner = %document.owner_id, name = %document.name, "document written");
        Ok(())
    }

    async fn get(
        &self,
        collection: Collection,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<Document>, StorageError> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    r#"
                    SELECT owner_id, name, timestamp, group_id, body FROM documents
                    WHERE collection = ?1 AND owner_id = ?2 AND name = ?3
                    "#,
                    params![collection.as_str(), owner_id, name],
                    read_row,
                )
                .optional()?)
        })?;
        row.map(|r| into_document(collection, r)).transpose()
    }

    async fn range(
        &self,
        collection: Collection,
        owner_id: &str,
        start: f64,
        end: f64,
    ) -> Result<Vec<Document>, StorageError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT owner_id, name, timestamp, group_id, body FROM documents
                WHERE collection = ?1 AND owner_id = ?2 AND timestamp >= ?3 AND timestamp <= ?4
                ORDER BY timestamp ASC, name ASC
                "#,
            )?;
            let rows = stmt
                .query_map(params![collection.as_str(), owner_id, start, end], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|r| into_document(collection, r))
            .collect()
    }

    async fn by_group(
        &self,
        collection: Collection,
        group_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT owner_id, name, timestamp, group_id, body FROM documents
                WHERE collection = ?1 AND group_id = ?2
                ORDER BY timestamp DESC, name ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt
                .query_map(params![collection.as_str(), group_id, limit], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|r| into_document(collection, r))
            .collect()
    }
}

/// Read a person's profile document, failing with `NotFound` when none is stored
pub async fn find_person(
    store: &dyn DocumentStore,
    person_id: &str,
) -> Result<PersonProfile, StorageError> {
    let document = store
        .get(Collection::Users, person_id, PROFILE_DOCUMENT)
        .await?
        .ok_or_else(|| StorageError::NotFound {
            collection: Collection::Users.to_string(),
            name: person_id.to_string(),
        })?;
    let mut profile: PersonProfile = document.decode()?;
    profile.person_id = person_id.to_string();
    Ok(profile)
}

/// Read a person's profile document.
///
/// A missing document yields placeholder calibration; a document with missing
/// calibration fields reads those fields as zero.
pub async fn load_person(
    store: &dyn DocumentStore,
    person_id: &str,
) -> Result<PersonProfile, StorageError> {
    match find_person(store, person_id).await {
        Err(StorageError::NotFound { .. }) => {
            debug!(person_id, "no profile document, using placeholder calibration");
            Ok(PersonProfile::new(person_id, "", ""))
        }
        other => other,
    }
}

pub async fn save_person(
    store: &dyn DocumentStore,
    profile: &PersonProfile,
    timestamp: f64,
) -> Result<(), StorageError> {
    let document = Document::new(
        Collection::Users,
        &profile.person_id,
        PROFILE_DOCUMENT,
        timestamp,
        profile,
    )?
    .with_group(&profile.group_id);
    store.put(document).await
}

/// Profiles of every member of a group
pub async fn group_members(
    store: &dyn DocumentStore,
    group_id: &str,
) -> Result<Vec<PersonProfile>, StorageError> {
    let mut members = store
        .by_group(Collection::Users, group_id, None)
        .await?
        .iter()
        .map(|d| d.decode::<PersonProfile>())
        .collect::<Result<Vec<_>, _>>()?;
    members.sort_by(|a, b| a.person_id.cmp(&b.person_id));
    Ok(members)
}

/// Installation-scoped typed scalar storage
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    fn get_f64(&self, key: &str) -> Result<Option<f64>, StorageError> {
        Ok(self.get(key)?.and_then(|v| v.as_f64()))
    }

    fn set_f64(&self, key: &str, value: f64) -> Result<(), StorageError> {
        self.set(key, Value::from(value))
    }

    fn get_f64_list(&self, key: &str) -> Result<Vec<f64>, StorageError> {
        Ok(self
            .get(key)?
            .and_then(|v| v.as_array().map(|a| a.iter().filter_map(|x| x.as_f64()).collect()))
            .unwrap_or_default())
    }

    fn push_f64(&self, key: &str, value: f64) -> Result<(), StorageError> {
        let mut list = self.get_f64_list(key)?;
        list.push(value);
        self.set(key, Value::from(list))
    }
}

/// Process-lifetime local store
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}

/// Local store persisted as a JSON object, rewritten on every change
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileLocalStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| StorageError::LocalState {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let local_state = |e: std::io::Error| StorageError::LocalState {
            path: self.path.clone(),
            reason: e.to_string(),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(local_state)?;
            }
        }
        let content = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, content).map_err(local_state)
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let values = self
            .values
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut values = self
            .values
            .lock()
            .map_err(|e| StorageError::LockPoisoned(e.to_string()))?;
        values.insert(key.to_string(), value);
        self.flush(&values)
    }
}

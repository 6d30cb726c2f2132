pub mod codec;
pub mod guard;
pub mod models;
pub mod schema;


use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use self::codec::{CodecError, FlatMap};
use self::guard::{GuardedTransaction, TransactionGuard};
use self::models::{Entry, EntryField, NewEntry, NewEntryField};
use self::schema::{entries, entry_fields};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 4;
/// Ids bound per statement, well under SQLite's limit on host parameters.
const ID_CHUNK: usize = 1000;

/// Sub-structure holding the lifecycle bookkeeping of a record.
pub const LIFECYCLE: &str = "lifecycle";
/// Mirror of the row id inside the record itself.
pub const LIFECYCLE_ID: &str = "lifecycle.id";
pub const LIFECYCLE_STATUS: &str = "lifecycle.status";

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Could not create database directory: {0}")]
  Io(#[from] std::io::Error),
  #[error("Connection pool error: {0}")]
  PoolError(#[from] diesel::r2d2::PoolError),
  #[error("Database migration error: {0}")]
  MigrationError(#[from] Box<dyn std::error::Error + Send + Sync>),
  #[error("Database operation error: {0}")]
  OperationError(String),
  #[error("There is no row with id {id} in table \"{table}\"")]
  NotFound { table: String, id: i32 },
  #[error("Invalid table name \"{0}\": only ASCII letters, digits and '_' are allowed")]
  InvalidTableName(String),
  #[error("Invalid row id: {0}")]
  InvalidId(String),
  #[error("Codec error: {0}")]
  Codec(#[from] CodecError),
  #[error("Transaction took more than {0} seconds to execute")]
  TransactionTimeout(u64),
  #[error("Transaction interrupted")]
  Interrupted,
}

pub(crate) fn operation_error(e: diesel::result::Error) -> StorageError {
  StorageError::OperationError(e.to_string())
}

/// Equality filter: dotted path -> expected leaf value.
pub type Filter = BTreeMap<String, Value>;

pub fn filter_eq(path: &str, value: impl Into<Value>) -> Filter {
  Filter::from([(path.to_string(), value.into())])
}

/// Detached snapshot of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
  pub id: i32,
  /// Registration fingerprint, fixed when the record was inserted.
  pub hash: String,
  pub data: Value,
}

impl Record {
  /// Looks up a dotted path inside the record data.
  pub fn get(&self, path: &str) -> Option<&Value> {
    path
      .split(codec::SEPARATOR)
      .try_fold(&self.data, |node, segment| node.get(segment))
  }

  fn id_mirror(&self) -> Option<i64> {
    self.get(LIFECYCLE_ID).and_then(Value::as_i64)
  }
}

/// Attribute-level change applied to existing rows.
/// `set` is a (nested) mapping of new values; `unset` lists paths removed with everything below them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
  pub set: Value,
  pub unset: Vec<String>,
}

impl RowUpdate {
  pub fn set(set: Value) -> Self {
    RowUpdate {
      set,
      unset: Vec::new(),
    }
  }

  pub fn unset(mut self, path: impl Into<String>) -> Self {
    self.unset.push(path.into());
    self
  }

  fn prepare(self) -> Result<PreparedUpdate, StorageError> {
    let mut set = if self.set.is_null() {
      FlatMap::new()
    } else {
      codec::flatten(&self.set)?
    };
    // The id mirror is owned by the store.
    set.retain(|path, _| !codec::is_under(LIFECYCLE_ID, path));
    let unset = self
      .unset
      .into_iter()
      .filter(|path| !codec::is_under(LIFECYCLE_ID, path))
      .collect();
    Ok(PreparedUpdate { set, unset })
  }
}

impl From<Value> for RowUpdate {
  fn from(set: Value) -> Self {
    RowUpdate::set(set)
  }
}

struct PreparedUpdate {
  set: FlatMap,
  unset: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
  Succeeded,
  Failed(String),
}

/// Per-row result of a best-effort batch operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
  outcomes: BTreeMap<i32, RowOutcome>,
}

impl BatchReport {
  pub fn outcomes(&self) -> &BTreeMap<i32, RowOutcome> {
    &self.outcomes
  }

  pub fn succeeded(&self) -> Vec<i32> {
    self
      .outcomes
      .iter()
      .filter(|(_, outcome)| **outcome == RowOutcome::Succeeded)
      .map(|(id, _)| *id)
      .collect()
  }

  pub fn failed(&self) -> Vec<(i32, &str)> {
    self
      .outcomes
      .iter()
      .filter_map(|(id, outcome)| match outcome {
        RowOutcome::Failed(reason) => Some((*id, reason.as_str())),
        RowOutcome::Succeeded => None,
      })
      .collect()
  }

  pub fn all_succeeded(&self) -> bool {
    self.failed().is_empty()
  }

  pub fn len(&self) -> usize {
    self.outcomes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.outcomes.is_empty()
  }

  pub(crate) fn mark_failed(&mut self, id: i32, reason: impl Into<String>) {
    self.outcomes.insert(id, RowOutcome::Failed(reason.into()));
  }
}

/// Anything that designates a stored row.
pub trait RowId {
  fn row_id(&self) -> i32;
}

impl RowId for Record {
  fn row_id(&self) -> i32 {
    self.id
  }
}

impl RowId for i32 {
  fn row_id(&self) -> i32 {
    *self
  }
}

/// Logical table names are embedded in derived names and command lines,
/// so the reserved separator `-` and anything else exotic is rejected.
pub fn validate_table_name(table: &str) -> Result<(), StorageError> {
  let valid = !table.is_empty()
    && table
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(StorageError::InvalidTableName(table.to_string()))
  }
}

/// Registration fingerprint of a record: its content without the row id and
/// without lifecycle bookkeeping other than the status.
pub fn fingerprint(data: &Value) -> String {
  let mut hashed = data.clone();
  if let Some(map) = hashed.as_object_mut() {
    map.remove("id");
    let status = map
      .get(LIFECYCLE)
      .and_then(|lifecycle| lifecycle.get("status"))
      .cloned();
    map.remove(LIFECYCLE);
    if let Some(status) = status {
      map.insert(LIFECYCLE.to_string(), json!({ "status": status }));
    }
  }
  codec::content_hash(&hashed)
}

#[derive(Debug)]
struct ConnectionOptions {
  busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
  fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
    conn
      .batch_execute(&format!(
        "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
        self.busy_timeout.as_millis()
      ))
      .map_err(diesel::r2d2::Error::QueryError)
  }
}

/// Entity store over a pooled SQLite database. Every operation runs inside a
/// guarded transaction on a connection acquired for that operation only.
pub struct Database {
  pool: Pool<ConnectionManager<SqliteConnection>>,
  guard: TransactionGuard,
  location: String,
}

impl Database {
  pub fn with_options(
    path: &Path,
    guard: TransactionGuard,
    busy_timeout: Duration,
  ) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    let location = path.to_string_lossy().to_string();
    let manager = ConnectionManager::<SqliteConnection>::new(location.as_str());
    let pool = Pool::builder()
      .max_size(POOL_SIZE)
      .connection_customizer(Box::new(ConnectionOptions { busy_timeout }))
      .build(manager)?;

    let mut pooled = pool.get()?;
    let conn: &mut SqliteConnection = &mut pooled;
    conn.run_pending_migrations(MIGRATIONS)?;

    debug!("Connected to database at {}.", location);
    Ok(Database {
      pool,
      guard,
      location,
    })
  }

  pub fn location(&self) -> &str {
    &self.location
  }

  fn transaction<T, F>(&self, work: F) -> Result<T, StorageError>
  where
    F: FnOnce(&mut GuardedTransaction<'_>) -> Result<T, StorageError>,
  {
    let mut pooled = self.pool.get()?;
    self.guard.run(&mut pooled, work)
  }

  /// Loads records of `table`: the single row `id` (or `NotFound`), the rows
  /// matching every entry of `filter`, or all rows.
  pub fn load(
    &self,
    table: &str,
    filter: Option<&Filter>,
    id: Option<i32>,
  ) -> Result<Vec<Record>, StorageError> {
    validate_table_name(table)?;
    let records = self.transaction(|tx| {
      debug!("Query table {}...", table);
      let entries = select_entries(tx, table, filter, id)?;
      let records = read_records(tx, entries)?;
      debug!("Query done");
      Ok(records)
    })?;
    self.check_integrity(table, records)
  }

  /// Loads the records of `table` whose fingerprint is one of `hashes`.
  pub fn load_by_hash(&self, table: &str, hashes: &[String]) -> Result<Vec<Record>, StorageError> {
    validate_table_name(table)?;
    let records = self.transaction(|tx| {
      let entries = entries::table
        .filter(entries::collection.eq(table))
        .filter(entries::hash.eq_any(hashes))
        .select(Entry::as_select())
        .order(entries::id.asc())
        .load(tx.conn()?)
        .map_err(operation_error)?;
      read_records(tx, entries)
    })?;
    self.check_integrity(table, records)
  }

  /// Inserts `data` as a new record, or, when it carries an integer `id`,
  /// updates only the supplied attributes of that record.
  pub fn save(&self, table: &str, mut data: Value) -> Result<Record, StorageError> {
    validate_table_name(table)?;
    let row_id = match data.as_object_mut().and_then(|map| map.remove("id")) {
      Some(id) => Some(
        id.as_i64()
          .and_then(|id| i32::try_from(id).ok())
          .ok_or_else(|| StorageError::InvalidId(id.to_string()))?,
      ),
      None => None,
    };

    let id = match row_id {
      Some(id) => {
        debug!("Update row {}", id);
        let update = RowUpdate::set(data).prepare()?;
        self.transaction(|tx| update_entry(tx, table, id, &update))?;
        id
      }
      None => {
        debug!("Insert new row");
        let hash = fingerprint(&data);
        let flat = codec::flatten(&data)?;
        self.transaction(|tx| insert_entry(tx, table, &hash, flat))?
      }
    };

    // Read back in a fresh transaction so the snapshot is what was committed.
    self
      .load(table, None, Some(id))?
      .pop()
      .ok_or_else(|| StorageError::NotFound {
        table: table.to_string(),
        id,
      })
  }

  /// Applies `update` to every record inside one transaction. A row that
  /// fails is rolled back alone and reported; the others are still applied.
  pub fn update<R: RowId>(
    &self,
    table: &str,
    records: &[R],
    update: impl Into<RowUpdate>,
  ) -> Result<BatchReport, StorageError> {
    validate_table_name(table)?;
    let update = update.into().prepare()?;
    self.transaction(|tx| {
      for_each_row(tx, records, "update", |tx, id| {
        update_entry(tx, table, id, &update)
      })
    })
  }

  /// Deletes every record inside one transaction, with the same per-row semantics as `update`.
  pub fn delete<R: RowId>(&self, table: &str, records: &[R]) -> Result<BatchReport, StorageError> {
    validate_table_name(table)?;
    self.transaction(|tx| {
      for_each_row(tx, records, "delete", |tx, id| delete_entry(tx, table, id))
    })
  }

  fn check_integrity(&self, table: &str, records: Vec<Record>) -> Result<Vec<Record>, StorageError> {
    records
      .into_iter()
      .map(|record| {
        if record.id_mirror() == Some(i64::from(record.id)) {
          Ok(record)
        } else {
          self.repair(table, record)
        }
      })
      .collect()
  }

  fn repair(&self, table: &str, record: Record) -> Result<Record, StorageError> {
    warn!(
      "Row id {} of table {} is broken, deleting and reinserting",
      record.id, table
    );
    let flat = codec::flatten(&record.data)?;
    let old_id = record.id;
    let new_id = self.transaction(|tx| {
      delete_entry(tx, table, old_id)?;
      insert_entry(tx, table, &record.hash, flat)
    })?;
    debug!("Row {} reinserted as {}", old_id, new_id);
    self
      .load(table, None, Some(new_id))?
      .pop()
      .ok_or_else(|| StorageError::NotFound {
        table: table.to_string(),
        id: new_id,
      })
  }
}

fn for_each_row<R: RowId, F>(
  tx: &mut GuardedTransaction<'_>,
  records: &[R],
  action: &str,
  mut apply: F,
) -> Result<BatchReport, StorageError>
where
  F: FnMut(&mut GuardedTransaction<'_>, i32) -> Result<(), StorageError>,
{
  let mut report = BatchReport::default();
  for record in records {
    let id = record.row_id();
    let outcome = match tx.savepoint(|tx| apply(tx, id)) {
      Ok(()) => RowOutcome::Succeeded,
      Err(e @ (StorageError::TransactionTimeout(_) | StorageError::Interrupted)) => return Err(e),
      Err(e) => {
        warn!("Failed to {} row {}: {}", action, id, e);
        RowOutcome::Failed(e.to_string())
      }
    };
    report.outcomes.insert(id, outcome);
  }
  Ok(report)
}

fn select_entries(
  tx: &mut GuardedTransaction<'_>,
  table: &str,
  filter: Option<&Filter>,
  id: Option<i32>,
) -> Result<Vec<Entry>, StorageError> {
  if let Some(id) = id {
    return Ok(vec![find_entry(tx, table, id)?]);
  }

  let Some(filter) = filter.filter(|filter| !filter.is_empty()) else {
    return entries::table
      .filter(entries::collection.eq(table))
      .select(Entry::as_select())
      .order(entries::id.asc())
      .load(tx.conn()?)
      .map_err(operation_error);
  };

  let ids = matching_ids(tx, table, filter)?;
  let mut selected = Vec::with_capacity(ids.len());
  for chunk in ids.chunks(ID_CHUNK) {
    let rows: Vec<Entry> = entries::table
      .filter(entries::collection.eq(table))
      .filter(entries::id.eq_any(chunk))
      .select(Entry::as_select())
      .order(entries::id.asc())
      .load(tx.conn()?)
      .map_err(operation_error)?;
    selected.extend(rows);
  }
  Ok(selected)
}

fn find_entry(tx: &mut GuardedTransaction<'_>, table: &str, id: i32) -> Result<Entry, StorageError> {
  entries::table
    .filter(entries::collection.eq(table))
    .filter(entries::id.eq(id))
    .select(Entry::as_select())
    .first(tx.conn()?)
    .optional()
    .map_err(operation_error)?
    .ok_or_else(|| StorageError::NotFound {
      table: table.to_string(),
      id,
    })
}

fn matching_ids(
  tx: &mut GuardedTransaction<'_>,
  table: &str,
  filter: &Filter,
) -> Result<Vec<i32>, StorageError> {
  let mut matching: Option<BTreeSet<i32>> = None;
  for (path, leaf) in filter {
    let encoded = codec::encode_leaf(leaf);
    let ids: BTreeSet<i32> = entry_fields::table
      .inner_join(entries::table)
      .filter(entries::collection.eq(table))
      .filter(entry_fields::path.eq(path))
      .filter(entry_fields::value.eq(&encoded))
      .select(entry_fields::entry_id)
      .load::<i32>(tx.conn()?)
      .map_err(operation_error)?
      .into_iter()
      .collect();
    matching = Some(match matching {
      Some(previous) => previous.intersection(&ids).copied().collect(),
      None => ids,
    });
  }
  Ok(matching.unwrap_or_default().into_iter().collect())
}

fn read_records(
  tx: &mut GuardedTransaction<'_>,
  entries: Vec<Entry>,
) -> Result<Vec<Record>, StorageError> {
  let mut grouped = Vec::with_capacity(entries.len());
  for chunk in entries.chunks(ID_CHUNK) {
    let fields = EntryField::belonging_to(chunk)
      .select(EntryField::as_select())
      .load(tx.conn()?)
      .map_err(operation_error)?;
    grouped.extend(fields.grouped_by(chunk));
  }

  entries
    .into_iter()
    .zip(grouped)
    .map(|(entry, fields)| -> Result<Record, StorageError> {
      let mut flat = FlatMap::new();
      for field in fields {
        let leaf = codec::decode_leaf(&field.value)?;
        flat.insert(field.path, leaf);
      }
      Ok(Record {
        id: entry.id,
        hash: entry.hash,
        data: codec::expand(&flat)?,
      })
    })
    .collect()
}

/// Inserts the entry and its fields, including the id mirror, as one unit.
fn insert_entry(
  tx: &mut GuardedTransaction<'_>,
  table: &str,
  hash: &str,
  mut flat: FlatMap,
) -> Result<i32, StorageError> {
  let id: i32 = diesel::insert_into(entries::table)
    .values(&NewEntry {
      collection: table,
      hash,
    })
    .returning(entries::id)
    .get_result(tx.conn()?)
    .map_err(operation_error)?;

  flat.retain(|path, _| !codec::is_under(path, LIFECYCLE_ID) && path != LIFECYCLE);
  flat.insert(LIFECYCLE_ID.to_string(), Value::from(id));
  write_fields(tx, id, &flat)?;
  Ok(id)
}

fn write_fields(tx: &mut GuardedTransaction<'_>, entry_id: i32, flat: &FlatMap) -> Result<(), StorageError> {
  if flat.is_empty() {
    return Ok(());
  }
  let encoded: Vec<(&str, String)> = flat
    .iter()
    .map(|(path, leaf)| (path.as_str(), codec::encode_leaf(leaf)))
    .collect();
  let rows: Vec<NewEntryField> = encoded
    .iter()
    .map(|(path, value)| NewEntryField {
      entry_id,
      path,
      value: value.as_str(),
    })
    .collect();
  diesel::insert_into(entry_fields::table)
    .values(&rows)
    .execute(tx.conn()?)
    .map_err(operation_error)?;
  Ok(())
}

fn update_entry(
  tx: &mut GuardedTransaction<'_>,
  table: &str,
  id: i32,
  update: &PreparedUpdate,
) -> Result<(), StorageError> {
  find_entry(tx, table, id)?;
  let current: Vec<String> = entry_fields::table
    .filter(entry_fields::entry_id.eq(id))
    .select(entry_fields::path)
    .load(tx.conn()?)
    .map_err(operation_error)?;

  let mut replaced: BTreeSet<&str> = BTreeSet::new();
  for prefix in &update.unset {
    replaced.extend(
      current
        .iter()
        .filter(|path| codec::is_under(path, prefix))
        .map(String::as_str),
    );
  }
  for path in update.set.keys() {
    // A new value replaces whatever sat at its ancestors or below it.
    replaced.extend(
      current
        .iter()
        .filter(|existing| {
          codec::is_under(existing, path) || codec::ancestors(path).any(|a| a == existing.as_str())
        })
        .map(String::as_str),
    );
  }

  if !replaced.is_empty() {
    let replaced: Vec<&str> = replaced.into_iter().collect();
    diesel::delete(
      entry_fields::table
        .filter(entry_fields::entry_id.eq(id))
        .filter(entry_fields::path.eq_any(replaced)),
    )
    .execute(tx.conn()?)
    .map_err(operation_error)?;
  }
  write_fields(tx, id, &update.set)
}

fn delete_entry(tx: &mut GuardedTransaction<'_>, table: &str, id: i32) -> Result<(), StorageError> {
  find_entry(tx, table, id)?;
  diesel::delete(entry_fields::table.filter(entry_fields::entry_id.eq(id)))
    .execute(tx.conn()?)
    .map_err(operation_error)?;
  diesel::delete(entries::table.filter(entries::id.eq(id)))
    .execute(tx.conn()?)
    .map_err(operation_error)?;
  Ok(())
}

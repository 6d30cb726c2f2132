use super::schema::{entries, entry_fields};
use diesel::prelude::*;

/// One stored record of a logical table (`collection`).
#[derive(Queryable, Selectable, Identifiable, Debug, PartialEq, Clone)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = entries)]
pub struct Entry {
  pub id: i32,
  pub collection: String,
  pub hash: String,
}

#[derive(Insertable)]
#[diesel(table_name = entries)]
pub struct NewEntry<'a> {
  pub collection: &'a str,
  pub hash: &'a str,
}

/// A single flattened leaf of a record: dotted `path` and JSON-encoded `value`.
#[derive(Queryable, Selectable, Associations, Identifiable, Debug, PartialEq, Clone)]
#[diesel(belongs_to(Entry))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(table_name = entry_fields)]
pub struct EntryField {
  pub id: i32,
  pub entry_id: i32,
  pub path: String,
  pub value: String,
}

#[derive(Insertable)]
#[diesel(table_name = entry_fields)]
pub struct NewEntryField<'a> {
  pub entry_id: i32,
  pub path: &'a str,
  pub value: &'a str,
}

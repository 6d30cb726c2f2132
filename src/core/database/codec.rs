use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator between the segments of a flattened path.
pub const SEPARATOR: char = '.';

/// Flattened representation of a configuration tree: dotted path -> leaf.
pub type FlatMap = BTreeMap<String, Value>;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
  #[error("Only mappings can be stored, got: {0}")]
  NotAMapping(String),
  #[error("Invalid key \"{0}\": keys must be non-empty and must not contain '.'")]
  InvalidKey(String),
  #[error("Path \"{0}\" is both a value and a mapping")]
  Conflict(String),
  #[error("Stored value could not be decoded: {0}")]
  Decode(String),
  #[error("Value could not be serialized: {0}")]
  Serialize(String),
}

/// Flattens a nested mapping into dotted-path leaves.
/// Lists and empty mappings are kept whole as leaves so that `expand` restores them exactly.
pub fn flatten(tree: &Value) -> Result<FlatMap, CodecError> {
  let Value::Object(map) = tree else {
    return Err(CodecError::NotAMapping(tree.to_string()));
  };
  let mut flat = FlatMap::new();
  flatten_into(map, None, &mut flat)?;
  Ok(flat)
}

fn flatten_into(
  map: &Map<String, Value>,
  prefix: Option<&str>,
  flat: &mut FlatMap,
) -> Result<(), CodecError> {
  for (key, value) in map {
    if key.is_empty() || key.contains(SEPARATOR) {
      return Err(CodecError::InvalidKey(key.clone()));
    }
    let path = match prefix {
      Some(prefix) => format!("{prefix}{SEPARATOR}{key}"),
      None => key.clone(),
    };
    match value {
      Value::Object(inner) if !inner.is_empty() => flatten_into(inner, Some(&path), flat)?,
      leaf => {
        flat.insert(path, leaf.clone());
      }
    }
  }
  Ok(())
}

/// Rebuilds the nested mapping from dotted-path leaves.
pub fn expand(flat: &FlatMap) -> Result<Value, CodecError> {
  let mut root = Map::new();
  for (path, leaf) in flat {
    let mut node = &mut root;
    let mut segments = path.split(SEPARATOR).peekable();
    while let Some(segment) = segments.next() {
      if segments.peek().is_none() {
        if node.contains_key(segment) {
          return Err(CodecError::Conflict(path.clone()));
        }
        node.insert(segment.to_string(), leaf.clone());
      } else {
        node = node
          .entry(segment.to_string())
          .or_insert_with(|| Value::Object(Map::new()))
          .as_object_mut()
          .ok_or_else(|| CodecError::Conflict(path.clone()))?;
      }
    }
  }
  Ok(Value::Object(root))
}

/// JSON text with object keys sorted at every level.
/// Two trees that compare equal always produce the same text.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

/// Hex SHA-256 of the canonical JSON of `value`.
pub fn content_hash(value: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(canonical_json(value).as_bytes());
  format!("{:x}", hasher.finalize())
}

/// Same as [`content_hash`] for any serializable value.
pub fn hash_serializable<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
  let value = serde_json::to_value(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
  Ok(content_hash(&value))
}

pub fn encode_leaf(leaf: &Value) -> String {
  canonical_json(leaf)
}

pub fn decode_leaf(text: &str) -> Result<Value, CodecError> {
  serde_json::from_str(text).map_err(|e| CodecError::Decode(format!("{text}: {e}")))
}

/// True when `path` equals `prefix` or is nested below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
  path == prefix
    || (path.starts_with(prefix) && path[prefix.len()..].starts_with(SEPARATOR))
}

/// Proper ancestors of a dotted path, outermost first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
  path
    .match_indices(SEPARATOR)
    .map(move |(i, _)| &path[..i])
}

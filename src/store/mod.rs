//! Transactional tensor store.
//!
//! Imported tensors land in a SQLite database (one row per tensor) under
//! keys of the form `__<submodel>__[<name>]__<role>__`. All writes of one
//! import happen inside a single transaction: an error returned from the
//! closure passed to [`TensorStore::with_transaction`] rolls every write
//! back.

mod schema;

pub use schema::CURRENT_VERSION;

use crate::archive::{decode_values, DType};
use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Precision tensors are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    #[default]
    F32,
}

impl Precision {
    fn dtype_name(self) -> &'static str {
        match self {
            Precision::F16 => "f16",
            Precision::F32 => "f32",
        }
    }

    fn encode(self, tensor: &Tensor) -> Vec<u8> {
        let values: Vec<f32> = tensor.iter().copied().collect();
        match self {
            Precision::F32 => bytemuck::cast_slice::<f32, u8>(values.as_slice()).to_vec(),
            Precision::F16 => {
                let halves: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
                bytemuck::cast_slice::<half::f16, u8>(halves.as_slice()).to_vec()
            }
        }
    }
}

/// Store key of a tensor.
///
/// `role` is `None` for full weights and dense diffs.
pub fn store_key(submodel: &str, name: &str, role: Option<&str>) -> String {
    match role {
        Some(role) => format!("__{submodel}__[{name}]__{role}__"),
        None => format!("__{submodel}__[{name}]"),
    }
}

/// Submodel, name and role of a store key.
pub fn parse_store_key(key: &str) -> Option<(&str, &str, Option<&str>)> {
    let rest = key.strip_prefix("__")?;
    let (submodel, rest) = rest.split_once("__[")?;
    let (name, rest) = rest.rsplit_once(']')?;
    if rest.is_empty() {
        return Some((submodel, name, None));
    }
    let role = rest.strip_prefix("__")?.strip_suffix("__")?;
    Some((submodel, name, Some(role)))
}

fn decode_row(dtype: &str, shape: &str, data: &[u8]) -> Result<Tensor> {
    let dtype = DType::parse(dtype)
        .ok_or_else(|| Error::InvalidHeader(format!("stored dtype '{dtype}'")))?;
    let shape: Vec<usize> = serde_json::from_str(shape)?;
    tensor::from_shape_vec(&shape, decode_values(dtype, data))
}

fn read_tensor(conn: &Connection, key: &str) -> Result<Option<Tensor>> {
    let row = conn
        .query_row(
            "SELECT dtype, shape, data FROM tensors WHERE name = ?1",
            [key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(dtype, shape, data)| decode_row(&dtype, &shape, &data))
        .transpose()
}

fn list_keys(conn: &Connection, prefix: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM tensors WHERE substr(name, 1, ?2) = ?1 ORDER BY name")?;
    let keys = stmt
        .query_map(params![prefix, prefix.len() as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(keys)
}

/// SQLite-backed tensor key-value store.
#[derive(Debug)]
pub struct TensorStore {
    conn: Connection,
    path: String,
    precision: Precision,
}

impl TensorStore {
    /// Open or create a store at `path` (`:memory:` for an in-memory store).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = if path_str == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path.as_ref())?
        };
        schema::init_schema(&conn)?;
        Ok(Self {
            conn,
            path: path_str,
            precision: Precision::default(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    pub fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut StoreTransaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let precision = self.precision;
        let tx = self.conn.transaction()?;
        let mut store = StoreTransaction {
            tx,
            precision,
            written: 0,
        };
        match f(&mut store) {
            Ok(value) => {
                let written = store.written;
                store.tx.commit()?;
                tracing::debug!(written, "committed store transaction");
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(error = %err, "rolling back store transaction");
                store.tx.rollback()?;
                Err(err)
            }
        }
    }

    pub fn read(&self, key: &str) -> Result<Option<Tensor>> {
        read_tensor(&self.conn, key)
    }

    /// Keys beginning with `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        list_keys(&self.conn, prefix)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tensors", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Write access inside an open transaction.
#[derive(Debug)]
pub struct StoreTransaction<'conn> {
    tx: Transaction<'conn>,
    precision: Precision,
    written: usize,
}

impl StoreTransaction<'_> {
    /// Insert or replace a tensor.
    pub fn write(&mut self, key: &str, tensor: &Tensor) -> Result<()> {
        let shape = serde_json::to_string(tensor.shape())?;
        self.tx.execute(
            "INSERT OR REPLACE INTO tensors (name, dtype, shape, data) VALUES (?1, ?2, ?3, ?4)",
            params![key, self.precision.dtype_name(), shape, self.precision.encode(tensor)],
        )?;
        self.written += 1;
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Option<Tensor>> {
        read_tensor(&self.tx, key)
    }

    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        list_keys(&self.tx, prefix)
    }

    /// Delete every tensor in the store.
    pub fn remove_all(&mut self) -> Result<()> {
        let removed = self.tx.execute("DELETE FROM tensors", [])?;
        tracing::debug!(removed, "cleared store");
        Ok(())
    }

    /// Delete every tensor whose key begins with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) -> Result<usize> {
        let removed = self.tx.execute(
            "DELETE FROM tensors WHERE substr(name, 1, ?2) = ?1",
            params![prefix, prefix.len() as i64],
        )?;
        tracing::debug!(prefix, removed, "cleared store prefix");
        Ok(removed)
    }

    /// Writes made through this transaction.
    pub fn written(&self) -> usize {
        self.written
    }
}

//! # Store: Persistent Record Sets
//!
//! The persistence layer for the engine, built on sled's embedded key-value
//! store. Every aggregate the components own is written here before the
//! in-memory copy is replaced, so a failed write leaves the engine exactly
//! where it was.
//!
//! ## Tree Layout
//!
//! | Tree           | Key             | Value                                  |
//! |----------------|-----------------|----------------------------------------|
//! | `assets`       | asset id (16B)  | `bincode(AssetAccount)` (asset + locks) |
//! | `proofs`       | proof id (16B)  | `bincode(ZkProof)`                      |
//! | `credit_lines` | line id (16B)   | `bincode(CreditLine)`                   |
//! | `agents`       | agent id (16B)  | `bincode(AgentRecord)` (config + spends) |
//! | `tokens`       | token id (16B)  | `bincode(TokenRecord)`                  |
//!
//! Keys are the raw UUID bytes. Values are bincode; JSON is for the API.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Batch, Db, Transactional, Tree};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// One keyed record set per entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Assets,
    Proofs,
    CreditLines,
    Agents,
    Tokens,
}

impl Collection {
    /// sled tree name backing this collection.
    pub fn tree_name(&self) -> &'static str {
        match self {
            Collection::Assets => "assets",
            Collection::Proofs => "proofs",
            Collection::CreditLines => "credit_lines",
            Collection::Agents => "agents",
            Collection::Tokens => "tokens",
        }
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// One pending record write, for [`Store::commit_pair`].
#[derive(Debug, Clone)]
pub struct Write {
    collection: Collection,
    key: Uuid,
    /// `None` removes the record.
    value: Option<Vec<u8>>,
}

impl Write {
    pub fn put<T: Serialize>(collection: Collection, id: &Uuid, value: &T) -> StoreResult<Self> {
        Ok(Self {
            collection,
            key: *id,
            value: Some(encode(value)?),
        })
    }

    pub fn delete(collection: Collection, id: &Uuid) -> Self {
        Self {
            collection,
            key: *id,
            value: None,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Typed access to the engine's sled database.
///
/// sled trees are thread-safe, so `Store` is cheap to clone and share; the
/// per-aggregate mutexes in the components decide write ordering, not the
/// store.
#[derive(Debug, Clone)]
pub struct Store {
    db: Db,
    assets: Tree,
    proofs: Tree,
    credit_lines: Tree,
    agents: Tree,
    tokens: Tree,
}

impl Store {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary store that is removed when dropped. Meant for tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            assets: db.open_tree(Collection::Assets.tree_name())?,
            proofs: db.open_tree(Collection::Proofs.tree_name())?,
            credit_lines: db.open_tree(Collection::CreditLines.tree_name())?,
            agents: db.open_tree(Collection::Agents.tree_name())?,
            tokens: db.open_tree(Collection::Tokens.tree_name())?,
            db,
        })
    }

    fn tree(&self, collection: Collection) -> &Tree {
        match collection {
            Collection::Assets => &self.assets,
            Collection::Proofs => &self.proofs,
            Collection::CreditLines => &self.credit_lines,
            Collection::Agents => &self.agents,
            Collection::Tokens => &self.tokens,
        }
    }

    /// Insert or replace a record.
    pub fn put<T: Serialize>(&self, collection: Collection, id: &Uuid, value: &T) -> StoreResult<()> {
        self.tree(collection).insert(id.as_bytes(), encode(value)?)?;
        Ok(())
    }

    /// Apply two writes so that either both land or neither does. Writes to
    /// different collections go through a sled transaction over both trees.
    pub fn commit_pair(&self, first: Write, second: Write) -> StoreResult<()> {
        if first.collection == second.collection {
            let mut batch = Batch::default();
            for write in [first.clone(), second] {
                match write.value {
                    Some(bytes) => batch.insert(&write.key.as_bytes()[..], bytes),
                    None => batch.remove(&write.key.as_bytes()[..]),
                }
            }
            self.tree(first.collection).apply_batch(batch)?;
            return Ok(());
        }

        (self.tree(first.collection), self.tree(second.collection))
            .transaction(|(a, b)| {
                for (tree, write) in [(a, &first), (b, &second)] {
                    match &write.value {
                        Some(bytes) => {
                            tree.insert(&write.key.as_bytes()[..], bytes.as_slice())?;
                        }
                        None => {
                            tree.remove(&write.key.as_bytes()[..])?;
                        }
                    }
                }
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(()) => {
                    StoreError::Serialization("store transaction aborted".into())
                }
            })
    }

    /// Fetch a record by id.
    pub fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &Uuid,
    ) -> StoreResult<Option<T>> {
        match self.tree(collection).get(id.as_bytes())? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Remove a record. Removing a missing id is not an error.
    pub fn delete(&self, collection: Collection, id: &Uuid) -> StoreResult<()> {
        self.tree(collection).remove(id.as_bytes())?;
        Ok(())
    }

    /// Load every record in a collection, in key order.
    pub fn load_all<T: DeserializeOwned>(&self, collection: Collection) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for entry in self.tree(collection).iter() {
            let (_key, value) = entry?;
            let record =
                bincode::deserialize(&value).map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push(record);
        }
        Ok(out)
    }

    /// Number of records in a collection.
    pub fn count(&self, collection: Collection) -> usize {
        self.tree(collection).len()
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

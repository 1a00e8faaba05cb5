//! Persistence adapter.
//!
//! The engine needs exactly four atomic primitives from its store:
//! increment-and-get on a counter row, insert-if-number-free for new records,
//! and compare-and-swap replace/remove keyed on a record's `status`. Replace
//! additionally checks the record `revision`. The sled implementation builds
//! them on `update_and_fetch` and serializable transactions, so they hold
//! across threads sharing one handle.
use crate::config::StoreConfig;
use crate::error::{DocflowError, Result};
use crate::record::DocumentRecord;
use crate::sequence::{SequenceCounter, SequenceScope};
use crate::workflow::{DocumentKind, Status};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    NumberTaken,
}

pub trait DocumentStore: Send + Sync {
    /// Atomically increments the counter for `scope` and returns the new value.
    fn increment(&self, scope: &SequenceScope) -> Result<u64>;

    fn counter(&self, scope: &SequenceScope) -> Result<Option<SequenceCounter>>;

    /// Inserts a new record together with its number index entry, unless the
    /// number is already indexed.
    fn insert_new(&self, record: &DocumentRecord) -> Result<InsertOutcome>;

    /// Marks an externally issued number as used. Returns false when the
    /// number was already taken.
    fn reserve_number(&self, kind: DocumentKind, human_number: &str, owner: &str) -> Result<bool>;

    fn load(&self, id: &str) -> Result<Option<DocumentRecord>>;

    fn find_by_number(&self, kind: DocumentKind, human_number: &str) -> Result<Option<DocumentRecord>>;

    /// Overwrites the stored record only if its status still equals `expected`
    /// and no other write has landed since `revision` was read.
    fn replace_if_current(&self, record: &DocumentRecord, expected: Status, revision: u64) -> Result<bool>;

    /// Removes the record only if its status still equals `expected`.
    fn remove_if_status(&self, id: &str, expected: Status) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHealth {
    pub records: usize,
    pub counters: usize,
    pub numbers: usize,
    pub size_on_disk: u64,
    pub recovered: bool,
}

/// Connection handle over a sled database, constructed once at start-up and
/// shared by reference.
pub struct SledStore {
    instance: Arc<sled::Db>,
    counters: sled::Tree,
    records: sled::Tree,
    numbers: sled::Tree,
}

fn number_key(kind: DocumentKind, human_number: &str) -> Vec<u8> {
    format!("{}/{}", kind.as_str(), human_number).into_bytes()
}

fn next_counter(scope: &SequenceScope, old: Option<&[u8]>) -> Option<Vec<u8>> {
    let mut counter = match old {
        None => SequenceCounter {
            document_type: scope.kind.as_str().to_string(),
            period_key: scope.period_key.clone(),
            last_value: 0,
        },
        Some(bytes) => {
            let decoded: std::result::Result<SequenceCounter, _> = minicbor::decode(bytes);
            match decoded {
                Ok(counter) => counter,
                // leave unreadable rows untouched; the caller reports them
                Err(_) => return Some(bytes.to_vec()),
            }
        }
    };
    counter.last_value += 1;
    match minicbor::to_vec(&counter) {
        Ok(bytes) => Some(bytes),
        Err(_) => old.map(<[u8]>::to_vec),
    }
}

fn flatten_tx<T>(result: TransactionResult<T, DocflowError>) -> Result<T> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => DocflowError::Storage(err),
    })
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            counters: instance.open_tree("counters")?,
            records: instance.open_tree("records")?,
            numbers: instance.open_tree("numbers")?,
            instance,
        })
    }

    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut sled_config = sled::Config::new()
            .temporary(config.temporary)
            .cache_capacity(config.cache_capacity_bytes)
            .flush_every_ms(config.flush_every_ms);
        if !config.temporary {
            sled_config = sled_config.path(&config.path);
        }
        let db = sled_config.open()?;
        tracing::info!(
            path = %config.path.display(),
            temporary = config.temporary,
            recovered = db.was_recovered(),
            "document store opened"
        );
        Self::new(Arc::new(db))
    }

    pub fn health_check(&self) -> Result<StoreHealth> {
        Ok(StoreHealth {
            records: self.records.len(),
            counters: self.counters.len(),
            numbers: self.numbers.len(),
            size_on_disk: self.instance.size_on_disk()?,
            recovered: self.instance.was_recovered(),
        })
    }

    /// Flushes outstanding writes. The handle is consumed so no work can be
    /// issued after shutdown.
    pub fn shutdown(self) -> Result<usize> {
        let flushed = self.instance.flush()?;
        tracing::info!(flushed, "document store flushed");
        Ok(flushed)
    }
}

impl DocumentStore for SledStore {
    fn increment(&self, scope: &SequenceScope) -> Result<u64> {
        let key = scope.storage_key();
        let updated = self
            .counters
            .update_and_fetch(&key, |old| next_counter(scope, old))?
            .ok_or_else(|| DocflowError::corrupt(&key, "counter vanished during increment"))?;
        let counter: SequenceCounter =
            minicbor::decode(&updated).map_err(|e| DocflowError::corrupt(&key, e))?;
        Ok(counter.last_value)
    }

    fn counter(&self, scope: &SequenceScope) -> Result<Option<SequenceCounter>> {
        let key = scope.storage_key();
        match self.counters.get(&key)? {
            Some(bytes) => minicbor::decode(&bytes)
                .map(Some)
                .map_err(|e| DocflowError::corrupt(&key, e)),
            None => Ok(None),
        }
    }

    fn insert_new(&self, record: &DocumentRecord) -> Result<InsertOutcome> {
        let index_key = number_key(record.kind, &record.human_number);
        let contents = record.to_cbor()?;

        let outcome: TransactionResult<InsertOutcome, DocflowError> =
            (&self.numbers, &self.records).transaction(|(numbers, records)| {
                if numbers.get(&index_key)?.is_some() {
                    return Ok(InsertOutcome::NumberTaken);
                }
                if records.get(record.id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(DocflowError::validation(
                        format!("record id {} already exists", record.id),
                    )));
                }
                numbers.insert(index_key.as_slice(), record.id.as_bytes())?;
                records.insert(record.id.as_bytes(), contents.as_slice())?;
                Ok(InsertOutcome::Inserted)
            });
        flatten_tx(outcome)
    }

    fn reserve_number(&self, kind: DocumentKind, human_number: &str, owner: &str) -> Result<bool> {
        let swapped = self.numbers.compare_and_swap(
            number_key(kind, human_number),
            None as Option<&[u8]>,
            Some(owner.as_bytes()),
        )?;
        Ok(swapped.is_ok())
    }

    fn load(&self, id: &str) -> Result<Option<DocumentRecord>> {
        match self.records.get(id.as_bytes())? {
            Some(bytes) => DocumentRecord::from_cbor(id.as_bytes(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn find_by_number(&self, kind: DocumentKind, human_number: &str) -> Result<Option<DocumentRecord>> {
        match self.numbers.get(number_key(kind, human_number))? {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).into_owned();
                self.load(&id)
            }
            None => Ok(None),
        }
    }

    fn replace_if_current(&self, record: &DocumentRecord, expected: Status, revision: u64) -> Result<bool> {
        let key = record.id.as_bytes();
        let contents = record.to_cbor()?;

        let outcome: TransactionResult<bool, DocflowError> = self.records.transaction(|records| {
            let Some(current) = records.get(key)? else {
                return Err(ConflictableTransactionError::Abort(DocflowError::NotFound(
                    record.id.clone(),
                )));
            };
            let current = DocumentRecord::from_cbor(key, &current)
                .map_err(ConflictableTransactionError::Abort)?;
            if current.status != expected || current.revision != revision {
                return Ok(false);
            }
            records.insert(key, contents.as_slice())?;
            Ok(true)
        });
        flatten_tx(outcome)
    }

    fn remove_if_status(&self, id: &str, expected: Status) -> Result<bool> {
        let key = id.as_bytes();

        let outcome: TransactionResult<bool, DocflowError> = self.records.transaction(|records| {
            let Some(current) = records.get(key)? else {
                return Err(ConflictableTransactionError::Abort(DocflowError::NotFound(
                    id.to_string(),
                )));
            };
            let current = DocumentRecord::from_cbor(key, &current)
                .map_err(ConflictableTransactionError::Abort)?;
            if current.status != expected {
                return Ok(false);
            }
            records.remove(key)?;
            Ok(true)
        });
        flatten_tx(outcome)
    }
}

//! Document number allocation.
//!
//! Two counters exist per document kind: an all-time serial that feeds
//! `sequence_number`, and a per-period counter that feeds the human-readable
//! number (`VOU-202405-0007`). Both advance through the store's atomic
//! increment, never through a read of existing records.
use crate::error::{DocflowError, Result};
use crate::store::{DocumentStore, InsertOutcome};
use crate::workflow::DocumentKind;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_PAD_WIDTH: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterPurpose {
    Serial,
    Period,
}

/// The key a counter is unique within.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceScope {
    pub kind: DocumentKind,
    pub purpose: CounterPurpose,
    pub period_key: String,
}

impl SequenceScope {
    pub fn serial(kind: DocumentKind) -> Self {
        Self {
            kind,
            purpose: CounterPurpose::Serial,
            period_key: String::new(),
        }
    }

    pub fn period(kind: DocumentKind, period_key: &str) -> Self {
        Self {
            kind,
            purpose: CounterPurpose::Period,
            period_key: period_key.to_string(),
        }
    }

    pub fn storage_key(&self) -> Vec<u8> {
        let purpose = match self.purpose {
            CounterPurpose::Serial => "serial",
            CounterPurpose::Period => "period",
        };
        format!("{}/{}/{}", self.kind.as_str(), purpose, self.period_key).into_bytes()
    }
}

/// Persisted counter row.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SequenceCounter {
    #[n(0)]
    pub document_type: String,
    #[n(1)]
    pub period_key: String,
    #[n(2)]
    pub last_value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct NumberFormat {
    pub prefix: String,
    #[serde(default = "default_pad_width")]
    pub pad_width: usize,
}

fn default_pad_width() -> usize {
    DEFAULT_PAD_WIDTH
}

impl NumberFormat {
    pub fn new(prefix: impl Into<String>, pad_width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            pad_width,
        }
    }

    pub fn render(&self, period_key: &str, value: u64) -> String {
        let width = self.pad_width;
        if period_key.is_empty() {
            format!("{}-{value:0width$}", self.prefix)
        } else {
            format!("{}-{period_key}-{value:0width$}", self.prefix)
        }
    }
}

/// Per-kind number formats; kinds without an override use the table prefix.
#[derive(Debug, Clone, Default)]
pub struct Numbering {
    overrides: HashMap<DocumentKind, NumberFormat>,
}

impl Numbering {
    pub fn with_override(mut self, kind: DocumentKind, format: NumberFormat) -> Self {
        self.overrides.insert(kind, format);
        self
    }

    pub fn format_for(&self, kind: DocumentKind) -> NumberFormat {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| NumberFormat::new(kind.workflow().default_prefix, DEFAULT_PAD_WIDTH))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub sequence_number: u64,
    pub period_key: String,
    pub period_value: u64,
    pub human_number: String,
}

/// Accepts an empty key (all-time numbering) or `YYYYMM`.
pub fn validate_period_key(period_key: &str) -> Result<()> {
    if period_key.is_empty() {
        return Ok(());
    }
    let well_formed = period_key.len() == 6
        && period_key.bytes().all(|b| b.is_ascii_digit())
        && matches!(period_key[4..].parse::<u32>(), Ok(1..=12));
    if well_formed {
        Ok(())
    } else {
        Err(DocflowError::validation(format!(
            "period key '{period_key}' is not YYYYMM"
        )))
    }
}

pub struct SequenceAllocator<S: DocumentStore> {
    store: Arc<S>,
    numbering: Numbering,
    max_attempts: u32,
}

impl<S: DocumentStore> SequenceAllocator<S> {
    pub fn new(store: Arc<S>, numbering: Numbering, max_attempts: u32) -> Self {
        Self {
            store,
            numbering,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn numbering(&self) -> &Numbering {
        &self.numbering
    }

    pub fn next_serial(&self, kind: DocumentKind) -> Result<u64> {
        self.store.increment(&SequenceScope::serial(kind))
    }

    /// Draws the next per-period value and renders it as a business number.
    pub fn next_number(&self, kind: DocumentKind, period_key: &str) -> Result<(u64, String)> {
        validate_period_key(period_key)?;
        let value = self.store.increment(&SequenceScope::period(kind, period_key))?;
        let number = self.numbering.format_for(kind).render(period_key, value);
        tracing::debug!(kind = %kind, period = period_key, value, number = %number, "drew document number");
        Ok((value, number))
    }

    pub fn allocate(&self, kind: DocumentKind, period_key: &str) -> Result<Allocation> {
        validate_period_key(period_key)?;
        let sequence_number = self.next_serial(kind)?;
        let (period_value, human_number) = self.next_number(kind, period_key)?;

        Ok(Allocation {
            sequence_number,
            period_key: period_key.to_string(),
            period_value,
            human_number,
        })
    }

    /// Allocates and hands the numbers to `commit`, which persists them under
    /// the store's unique number index. A number already present in the index
    /// is skipped and the next one drawn, up to `max_attempts` draws.
    pub fn allocate_unique<F>(&self, kind: DocumentKind, period_key: &str, mut commit: F) -> Result<Allocation>
    where
        F: FnMut(&Allocation) -> Result<InsertOutcome>,
    {
        let mut allocation = self.allocate(kind, period_key)?;

        for attempt in 1..=self.max_attempts {
            match commit(&allocation)? {
                InsertOutcome::Inserted => return Ok(allocation),
                InsertOutcome::NumberTaken => {
                    tracing::warn!(
                        kind = %kind,
                        number = %allocation.human_number,
                        attempt,
                        "document number already taken, drawing the next one"
                    );
                    if attempt < self.max_attempts {
                        let (value, number) = self.next_number(kind, period_key)?;
                        allocation.period_value = value;
                        allocation.human_number = number;
                    }
                }
            }
        }

        Err(DocflowError::AllocationExhausted {
            kind,
            period: period_key.to_string(),
            attempts: self.max_attempts,
        })
    }

    pub fn current(&self, kind: DocumentKind, period_key: &str) -> Result<Option<SequenceCounter>> {
        self.store.counter(&SequenceScope::period(kind, period_key))
    }
}

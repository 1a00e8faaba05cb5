//! Service layer API for document workflow operations
use crate::config::EngineConfig;
use crate::error::{DocflowError, Result};
use crate::record::{Approval, DocumentPayload, DocumentRecord};
use crate::sequence::{DEFAULT_MAX_ATTEMPTS, Numbering, SequenceAllocator, SequenceCounter};
use crate::store::{DocumentStore, SledStore};
use crate::types::{Actor, Role, TimeStamp};
use crate::utils;
use crate::workflow::{Action, DocumentKind, Status, apply_transition};
use std::sync::Arc;
use tracing::{info, warn};

pub struct DocumentService<S: DocumentStore = SledStore> {
    store: Arc<S>,
    allocator: SequenceAllocator<S>,
}

impl<S: DocumentStore> DocumentService<S> {
    pub fn new(store: Arc<S>, config: &EngineConfig) -> Result<Self> {
        let numbering = config
            .numbering_table()
            .map_err(|err| DocflowError::validation(err.to_string()))?;
        let allocator = SequenceAllocator::new(store.clone(), numbering, config.allocation.max_attempts);
        Ok(Self { store, allocator })
    }

    /// Table prefixes, default padding and retry budget.
    pub fn with_defaults(store: Arc<S>) -> Self {
        let allocator = SequenceAllocator::new(store.clone(), Numbering::default(), DEFAULT_MAX_ATTEMPTS);
        Self { store, allocator }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn allocator(&self) -> &SequenceAllocator<S> {
        &self.allocator
    }

    fn load_record(&self, id: &str) -> Result<DocumentRecord> {
        self.store
            .load(id)?
            .ok_or_else(|| DocflowError::NotFound(id.to_string()))
    }

    /// Writes `record` back if nobody moved it off `expected` in the meantime.
    fn persist(&self, record: &mut DocumentRecord, expected: Status) -> Result<()> {
        let revision = record.revision;
        record.revision += 1;
        if self.store.replace_if_current(record, expected, revision)? {
            return Ok(());
        }
        warn!(
            id = %record.id,
            kind = %record.kind,
            status = %expected,
            "lost a concurrent write, caller must reload"
        );
        Err(DocflowError::ConcurrentModification {
            id: record.id.clone(),
            expected,
        })
    }

    /// Create a new document in its initial status with freshly allocated
    /// numbers.
    pub fn create(&self, kind: DocumentKind, mut payload: DocumentPayload, actor: &Actor) -> Result<DocumentRecord> {
        let workflow = kind.workflow();
        if !workflow.can_originate(actor.role) {
            return Err(DocflowError::Forbidden {
                kind,
                role: actor.role,
                operation: "create",
            });
        }
        payload.validate_for_create(workflow)?;

        let now = TimeStamp::new();
        let dated = payload.dated().cloned().unwrap_or_else(|| now.clone());
        let period_key = workflow.period.key_for(&dated);
        let financials = payload.financials_for_create(workflow)?;
        let id = utils::new_record_id().map_err(|err| DocflowError::Encode(format!("record id: {err}")))?;

        let mut record = DocumentRecord {
            id,
            kind,
            sequence_number: 0,
            human_number: String::new(),
            period_key: period_key.clone(),
            status: workflow.initial,
            approvals: Vec::new(),
            fields: payload.take_fields(),
            financials,
            dated,
            created_by: actor.id.clone(),
            created_at: now.clone(),
            last_modified_by: actor.id.clone(),
            last_modified_at: now,
            archived: false,
            revision: 0,
        };

        self.allocator.allocate_unique(kind, &period_key, |allocation| {
            record.sequence_number = allocation.sequence_number;
            record.human_number = allocation.human_number.clone();
            self.store.insert_new(&record)
        })?;

        info!(
            id = %record.id,
            kind = %kind,
            number = %record.human_number,
            sequence = record.sequence_number,
            role = %actor.role,
            "document created"
        );
        Ok(record)
    }

    /// Merge `payload` into an editable document. Tax is recomputed when any
    /// financial input changes.
    pub fn update(&self, id: &str, payload: DocumentPayload, actor: &Actor) -> Result<DocumentRecord> {
        let mut record = self.load_record(id)?;
        let workflow = record.workflow();

        if !workflow.can_edit(actor.role, record.status) {
            return Err(DocflowError::ImmutableRecord {
                id: record.id,
                status: record.status,
                operation: "edited",
            });
        }
        payload.validate_for_update(workflow)?;
        if let Some(dated) = payload.dated() {
            let period_key = workflow.period.key_for(dated);
            if period_key != record.period_key {
                return Err(DocflowError::validation(format!(
                    "{} is numbered in period {}; a date in {} would not match its number",
                    record.human_number, record.period_key, period_key
                )));
            }
        }

        let expected = record.status;
        record.apply_payload(payload)?;
        record.last_modified_by = actor.id.clone();
        record.last_modified_at = TimeStamp::new();
        self.persist(&mut record, expected)?;

        info!(id = %record.id, kind = %record.kind, status = %record.status, role = %actor.role, "document updated");
        Ok(record)
    }

    pub fn transition(
        &self,
        id: &str,
        action: Action,
        actor: &Actor,
        remarks: Option<String>,
    ) -> Result<DocumentRecord> {
        let record = self.load_record(id)?;
        let from = record.status;

        let mut record = apply_transition(record, action, actor, remarks)?;
        self.persist(&mut record, from)?;

        info!(
            id = %record.id,
            kind = %record.kind,
            action = %action,
            from = %from,
            status = %record.status,
            role = %actor.role,
            "document transitioned"
        );
        Ok(record)
    }

    /// Remove a document that has not left its initial status. Its number
    /// stays in the index and is never handed out again.
    pub fn delete(&self, id: &str, actor: &Actor) -> Result<()> {
        let record = self.load_record(id)?;

        let workflow = record.workflow();
        if record.status != workflow.initial {
            return Err(DocflowError::ImmutableRecord {
                id: record.id,
                status: record.status,
                operation: "deleted",
            });
        }
        if !workflow.can_delete(actor.role, record.status) {
            return Err(DocflowError::Forbidden {
                kind: record.kind,
                role: actor.role,
                operation: "delete",
            });
        }

        if !self.store.remove_if_status(id, record.status)? {
            warn!(id, kind = %record.kind, "document moved on before delete");
            return Err(DocflowError::ConcurrentModification {
                id: record.id,
                expected: record.status,
            });
        }

        info!(id, kind = %record.kind, number = %record.human_number, role = %actor.role, "document deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<DocumentRecord> {
        self.load_record(id)
    }

    pub fn find_by_number(&self, kind: DocumentKind, human_number: &str) -> Result<DocumentRecord> {
        self.store
            .find_by_number(kind, human_number)?
            .ok_or_else(|| DocflowError::NotFound(format!("{kind} {human_number}")))
    }

    pub fn history(&self, id: &str) -> Result<Vec<Approval>> {
        Ok(self.load_record(id)?.approvals)
    }

    /// Actions `actor` could take on the document right now.
    pub fn available_actions(&self, id: &str, actor: &Actor) -> Result<Vec<Action>> {
        let record = self.load_record(id)?;
        Ok(record.workflow().available_actions(record.status, actor.role))
    }

    /// Flag a document as archived (or not). Admin only; allowed in any
    /// status since it does not touch business content.
    pub fn set_archived(&self, id: &str, archived: bool, actor: &Actor) -> Result<DocumentRecord> {
        let mut record = self.load_record(id)?;

        if actor.role != Role::Admin {
            return Err(DocflowError::Forbidden {
                kind: record.kind,
                role: actor.role,
                operation: "archive",
            });
        }
        if record.archived == archived {
            return Ok(record);
        }

        let expected = record.status;
        record.archived = archived;
        record.last_modified_by = actor.id.clone();
        record.last_modified_at = TimeStamp::new();
        self.persist(&mut record, expected)?;

        info!(id, kind = %record.kind, archived, "document archive flag changed");
        Ok(record)
    }

    /// Mark a number issued outside the engine (e.g. imported paper records)
    /// as used. Returns false when it was already taken.
    pub fn reserve_number(&self, kind: DocumentKind, human_number: &str) -> Result<bool> {
        if human_number.trim().is_empty() {
            return Err(DocflowError::validation("number to reserve must not be blank"));
        }
        let reserved = self.store.reserve_number(kind, human_number, "reserved")?;
        if reserved {
            info!(kind = %kind, number = human_number, "document number reserved");
        }
        Ok(reserved)
    }

    /// Last value drawn from the period counter, if any.
    pub fn current_counter(&self, kind: DocumentKind, period_key: &str) -> Result<Option<SequenceCounter>> {
        self.allocator.current(kind, period_key)
    }
}

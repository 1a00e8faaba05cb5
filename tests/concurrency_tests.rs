//! Allocation and status compare-and-swap under contention.
use anyhow::Context;
use docflow::config::EngineConfig;
use docflow::record::{DocumentPayload, DocumentRecord};
use docflow::sequence::{SequenceCounter, SequenceScope};
use docflow::store::{DocumentStore, InsertOutcome, SledStore};
use docflow::workflow::FinancialPolicy;
use docflow::{Action, Actor, DocflowError, DocumentKind, DocumentService, ErrorCode, Money, Role, Status, TimeStamp};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use tempfile::{TempDir, tempdir};

const WRITERS: usize = 50;

fn open_store(name: &str) -> anyhow::Result<(TempDir, Arc<SledStore>)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    Ok((temp_dir, Arc::new(SledStore::new(Arc::new(db))?)))
}

/// A payload that satisfies the kind's required fields, dated in May 2024.
fn payload_for(kind: DocumentKind) -> anyhow::Result<DocumentPayload> {
    let workflow = kind.workflow();
    let mut payload = DocumentPayload::new().set_dated(TimeStamp::new_with(2024, 5, 15, 12, 0, 0).context("valid date")?);
    for name in workflow.required_fields {
        payload = payload.set_field(*name, format!("{name} value"));
    }
    if workflow.financial == FinancialPolicy::Required {
        payload = payload.set_amount(Money::from(100));
    }
    Ok(payload)
}

#[test]
fn concurrent_creates_never_share_a_number() -> anyhow::Result<()> {
    let (_dir, store) = open_store("concurrent_creates.db")?;
    let service = Arc::new(DocumentService::with_defaults(store));

    for kind in DocumentKind::ALL {
        let originator = Actor::new("originator", kind.workflow().originators[0]);
        let barrier = Arc::new(Barrier::new(WRITERS));

        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let service = service.clone();
                let barrier = barrier.clone();
                let actor = originator.clone();
                let payload = payload_for(kind);
                thread::spawn(move || -> anyhow::Result<DocumentRecord> {
                    let payload = payload?;
                    barrier.wait();
                    Ok(service.create(kind, payload, &actor)?)
                })
            })
            .collect();

        let mut serials = BTreeSet::new();
        let mut numbers = HashSet::new();
        for handle in handles {
            let record = handle
                .join()
                .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
            serials.insert(record.sequence_number);
            numbers.insert(record.human_number);
        }

        assert_eq!(numbers.len(), WRITERS, "{kind}: duplicate human numbers");
        assert_eq!(serials, (1..=WRITERS as u64).collect::<BTreeSet<_>>(), "{kind}: serials");
    }

    assert_eq!(service.store().health_check()?.records, WRITERS * DocumentKind::ALL.len());
    Ok(())
}

/// Serves a frozen copy of chosen records from `load`, as a caller that read
/// before another writer committed would see them. Writes go straight through.
struct StaleReads {
    inner: SledStore,
    frozen: Mutex<HashMap<String, DocumentRecord>>,
}

impl StaleReads {
    fn freeze(&self, id: &str) -> anyhow::Result<()> {
        let record = self.inner.load(id)?.context("record to freeze")?;
        self.frozen
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .insert(id.to_string(), record);
        Ok(())
    }

    fn thaw(&self, id: &str) {
        if let Ok(mut frozen) = self.frozen.lock() {
            frozen.remove(id);
        }
    }
}

impl DocumentStore for StaleReads {
    fn increment(&self, scope: &SequenceScope) -> docflow::Result<u64> {
        self.inner.increment(scope)
    }

    fn counter(&self, scope: &SequenceScope) -> docflow::Result<Option<SequenceCounter>> {
        self.inner.counter(scope)
    }

    fn insert_new(&self, record: &DocumentRecord) -> docflow::Result<InsertOutcome> {
        self.inner.insert_new(record)
    }

    fn reserve_number(&self, kind: DocumentKind, human_number: &str, owner: &str) -> docflow::Result<bool> {
        self.inner.reserve_number(kind, human_number, owner)
    }

    fn load(&self, id: &str) -> docflow::Result<Option<DocumentRecord>> {
        let frozen = self.frozen.lock().ok().and_then(|frozen| frozen.get(id).cloned());
        match frozen {
            Some(record) => Ok(Some(record)),
            None => self.inner.load(id),
        }
    }

    fn find_by_number(&self, kind: DocumentKind, human_number: &str) -> docflow::Result<Option<DocumentRecord>> {
        self.inner.find_by_number(kind, human_number)
    }

    fn replace_if_current(&self, record: &DocumentRecord, expected: Status, revision: u64) -> docflow::Result<bool> {
        self.inner.replace_if_current(record, expected, revision)
    }

    fn remove_if_status(&self, id: &str, expected: Status) -> docflow::Result<bool> {
        self.inner.remove_if_status(id, expected)
    }
}

fn stale_service(name: &str) -> anyhow::Result<(TempDir, Arc<StaleReads>, DocumentService<StaleReads>)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    let store = Arc::new(StaleReads {
        inner: SledStore::new(Arc::new(db))?,
        frozen: Mutex::new(HashMap::new()),
    });
    let service = DocumentService::new(store.clone(), &EngineConfig::default())?;
    Ok((temp_dir, store, service))
}

#[test]
fn second_vp_approval_from_a_stale_read_is_refused() -> anyhow::Result<()> {
    let (_dir, store, service) = stale_service("stale_transition.db")?;
    let admin = Actor::new("adm_01", Role::Admin);
    let first_vp = Actor::new("vp_01", Role::VicePrincipal);
    let second_vp = Actor::new("vp_02", Role::VicePrincipal);

    let minutes = service.create(DocumentKind::MeetingMinutes, payload_for(DocumentKind::MeetingMinutes)?, &admin)?;
    service.transition(&minutes.id, Action::Submit, &admin, None)?;

    // both VPs read the record while it is Submitted
    store.freeze(&minutes.id)?;
    service.transition(&minutes.id, Action::VpApprove, &first_vp, None)?;
    let err = service
        .transition(&minutes.id, Action::VpApprove, &second_vp, None)
        .unwrap_err();
    store.thaw(&minutes.id);

    assert!(matches!(
        err,
        DocflowError::ConcurrentModification { expected: Status::Submitted, .. }
    ));
    assert!(err.user_message().contains("reload"));

    let minutes = service.get(&minutes.id)?;
    assert_eq!(minutes.status, Status::VpApproved);
    let vp_entries: Vec<_> = minutes
        .approvals
        .iter()
        .filter(|approval| approval.action == Action::VpApprove)
        .collect();
    assert_eq!(vp_entries.len(), 1);
    assert_eq!(vp_entries[0].actor_id, "vp_01");
    Ok(())
}

#[test]
fn stale_edits_do_not_overwrite_newer_ones() -> anyhow::Result<()> {
    let (_dir, store, service) = stale_service("stale_update.db")?;
    let accountant = Actor::new("acc_01", Role::Accountant);
    let admin = Actor::new("adm_01", Role::Admin);

    let voucher = service.create(DocumentKind::ExpenseLog, payload_for(DocumentKind::ExpenseLog)?, &accountant)?;

    store.freeze(&voucher.id)?;
    service.update(&voucher.id, DocumentPayload::new().set_field("paid_to", "First"), &accountant)?;
    // same status, but the record moved on underneath the second editor
    let err = service
        .update(&voucher.id, DocumentPayload::new().set_field("paid_to", "Second"), &admin)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentModification);

    // a stale delete is refused once the status has moved
    store.thaw(&voucher.id);
    store.freeze(&voucher.id)?;
    service.transition(&voucher.id, Action::Approve, &admin, None)?;
    let err = service.delete(&voucher.id, &accountant).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentModification);
    store.thaw(&voucher.id);

    let voucher = service.get(&voucher.id)?;
    assert_eq!(voucher.field("paid_to"), Some("First"));
    assert_eq!(voucher.status, Status::Approved);
    Ok(())
}

#[test]
fn racing_transitions_have_exactly_one_winner() -> anyhow::Result<()> {
    const RACERS: usize = 8;
    let (_dir, store) = open_store("racing_transitions.db")?;
    let service = Arc::new(DocumentService::with_defaults(store));
    let admin = Actor::new("adm_01", Role::Admin);

    let minutes = service.create(DocumentKind::MeetingMinutes, payload_for(DocumentKind::MeetingMinutes)?, &admin)?;
    service.transition(&minutes.id, Action::Submit, &admin, None)?;

    let barrier = Arc::new(Barrier::new(RACERS));
    let handles: Vec<_> = (0..RACERS)
        .map(|i| {
            let service = service.clone();
            let barrier = barrier.clone();
            let id = minutes.id.clone();
            thread::spawn(move || {
                let vp = Actor::new(format!("vp_{i:02}"), Role::VicePrincipal);
                barrier.wait();
                service.transition(&id, Action::VpApprove, &vp, None)
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.join().map_err(|_| anyhow::anyhow!("racer panicked"))? {
            Ok(record) => {
                winners += 1;
                assert_eq!(record.status, Status::VpApproved);
            }
            // losers either lost the swap or loaded after the winner committed
            Err(err) => assert!(
                matches!(
                    err.code(),
                    ErrorCode::ConcurrentModification | ErrorCode::InvalidTransition
                ),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(winners, 1);
    let minutes = service.get(&minutes.id)?;
    assert_eq!(minutes.approvals.len(), 2);
    assert_eq!(minutes.status, Status::VpApproved);
    Ok(())
}

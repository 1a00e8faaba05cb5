//! The document aggregate, its approval trail and the edit payload
use crate::error::{DocflowError, Result};
use crate::tax::{TaxBreakdown, compute_tax};
use crate::types::{Money, Percent, Role, TimeStamp};
use crate::workflow::{Action, DocumentKind, FinancialPolicy, Status, Workflow};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Largest amount a financial document may carry.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_569_325_055, 23_283_064, 0, false, 2);

/// One entry of the append-only approval trail.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    #[n(0)]
    pub role: Role,
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub remarks: String,
    #[n(4)]
    pub action: Action,
    #[n(5)]
    pub from: Status,
    #[n(6)]
    pub to: Status,
    #[n(7)]
    pub details_hash: String, // sha256 of the business content the actor signed off
}

/// Tax inputs plus the values derived from them. The derived half is only
/// ever written by [`Financials::recompute`].
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Financials {
    #[n(0)]
    pub amount: Money,
    #[n(1)]
    pub tax_applicable: bool,
    #[n(2)]
    pub tax_rate: Percent,
    #[n(3)]
    pub tax_number: Option<String>,
    #[n(4)]
    tax: TaxBreakdown,
}

impl Financials {
    pub fn new(
        amount: Money,
        tax_applicable: bool,
        tax_rate: Percent,
        tax_number: Option<String>,
    ) -> Result<Self> {
        let mut financials = Self {
            amount,
            tax_applicable,
            tax_rate,
            tax_number,
            tax: TaxBreakdown::default(),
        };
        financials.recompute()?;
        Ok(financials)
    }

    /// A present, non-blank tax number marks an intra-state supply.
    pub fn has_tax_number(&self) -> bool {
        self.tax_number
            .as_deref()
            .is_some_and(|number| !number.trim().is_empty())
    }

    pub fn recompute(&mut self) -> Result<()> {
        self.tax = compute_tax(
            self.amount,
            self.tax_applicable,
            self.tax_rate,
            self.has_tax_number(),
        )?;
        Ok(())
    }

    pub fn tax(&self) -> &TaxBreakdown {
        &self.tax
    }
    pub fn tax_amount(&self) -> Money {
        self.tax.tax_amount
    }
    pub fn cgst(&self) -> Money {
        self.tax.cgst
    }
    pub fn sgst(&self) -> Money {
        self.tax.sgst
    }
    pub fn igst(&self) -> Money {
        self.tax.igst
    }
    pub fn total_amount(&self) -> Money {
        self.tax.total_amount
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, storage key
    #[n(1)]
    pub kind: DocumentKind,
    #[n(2)]
    pub sequence_number: u64,
    #[n(3)]
    pub human_number: String,
    #[n(4)]
    pub period_key: String,
    #[n(5)]
    pub status: Status,
    #[n(6)]
    pub approvals: Vec<Approval>,
    #[n(7)]
    pub fields: BTreeMap<String, String>,
    #[n(8)]
    pub financials: Option<Financials>,
    #[n(9)]
    pub dated: TimeStamp<Utc>,
    #[n(10)]
    pub created_by: String,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
    #[n(12)]
    pub last_modified_by: String,
    #[n(13)]
    pub last_modified_at: TimeStamp<Utc>,
    #[n(14)]
    pub archived: bool,
    #[n(15)]
    pub revision: u64, // bumped by every successful write after insert
}

// the part of a record an approval attests to
#[derive(minicbor::Encode)]
struct BusinessContent<'a> {
    #[n(0)]
    human_number: &'a str,
    #[n(1)]
    fields: &'a BTreeMap<String, String>,
    #[n(2)]
    financials: &'a Option<Financials>,
    #[n(3)]
    dated: &'a TimeStamp<Utc>,
}

impl DocumentRecord {
    pub fn workflow(&self) -> &'static Workflow {
        self.kind.workflow()
    }

    pub fn is_terminal(&self) -> bool {
        self.workflow().is_terminal(self.status)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Hash of the CBOR encoded business content, recorded on each approval.
    pub fn details_hash(&self) -> Result<String> {
        let content = BusinessContent {
            human_number: &self.human_number,
            fields: &self.fields,
            financials: &self.financials,
            dated: &self.dated,
        };
        let cbor = minicbor::to_vec(&content)?;
        Ok(sha256::digest(&cbor))
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_cbor(key: &[u8], bytes: &[u8]) -> Result<Self> {
        minicbor::decode(bytes).map_err(|e| DocflowError::corrupt(key, e))
    }

    /// Merges an edit into the business fields. Tax values are recomputed
    /// whenever the payload touches any of their inputs. On error the record
    /// must be discarded.
    pub(crate) fn apply_payload(&mut self, payload: DocumentPayload) -> Result<()> {
        let touches_financials = payload.touches_financials();

        for (name, value) in payload.fields {
            self.fields.insert(name, value);
        }
        if let Some(dated) = payload.dated {
            self.dated = dated;
        }

        if let (true, Some(financials)) = (touches_financials, self.financials.as_mut()) {
            if let Some(amount) = payload.amount {
                financials.amount = amount;
            }
            if let Some(applicable) = payload.tax_applicable {
                financials.tax_applicable = applicable;
            }
            if let Some(rate) = payload.tax_rate {
                financials.tax_rate = rate;
            }
            if let Some(number) = payload.tax_number {
                financials.tax_number = number;
            }
            financials.recompute()?;
        }
        Ok(())
    }
}

/// Caller supplied content for `create` and `update`. Absent values leave the
/// stored value untouched on update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentPayload {
    fields: BTreeMap<String, String>,
    amount: Option<Money>,
    tax_applicable: Option<bool>,
    tax_rate: Option<Percent>,
    tax_number: Option<Option<String>>,
    dated: Option<TimeStamp<Utc>>,
}

impl DocumentPayload {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
    pub fn set_amount(mut self, amount: Money) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_tax_applicable(mut self, applicable: bool) -> Self {
        self.tax_applicable = Some(applicable);
        self
    }
    pub fn set_tax_rate(mut self, rate: Percent) -> Self {
        self.tax_rate = Some(rate);
        self
    }
    pub fn set_tax_number(mut self, number: impl Into<String>) -> Self {
        self.tax_number = Some(Some(number.into()));
        self
    }
    pub fn clear_tax_number(mut self) -> Self {
        self.tax_number = Some(None);
        self
    }
    pub fn set_dated(mut self, dated: TimeStamp<Utc>) -> Self {
        self.dated = Some(dated);
        self
    }

    pub fn dated(&self) -> Option<&TimeStamp<Utc>> {
        self.dated.as_ref()
    }

    pub fn touches_financials(&self) -> bool {
        self.amount.is_some()
            || self.tax_applicable.is_some()
            || self.tax_rate.is_some()
            || self.tax_number.is_some()
    }

    fn validate_common(&self, workflow: &Workflow) -> Result<()> {
        for (name, value) in &self.fields {
            if name.trim().is_empty() {
                return Err(DocflowError::validation("field names must not be blank"));
            }
            if workflow.required_fields.contains(&name.as_str()) && value.trim().is_empty() {
                return Err(DocflowError::validation(format!("'{name}' must not be blank")));
            }
        }

        if workflow.financial == FinancialPolicy::NotApplicable && self.touches_financials() {
            return Err(DocflowError::validation(format!(
                "a {} does not carry financial fields",
                workflow.kind
            )));
        }
        if let Some(amount) = self.amount {
            if amount.value() < Decimal::ZERO {
                return Err(DocflowError::validation("amount must not be negative"));
            }
            if amount.value() > MAX_AMOUNT {
                return Err(DocflowError::validation(format!("amount must not exceed {MAX_AMOUNT}")));
            }
        }
        if let Some(rate) = self.tax_rate {
            if rate.value() < Decimal::ZERO || rate.value() > Decimal::ONE_HUNDRED {
                return Err(DocflowError::validation("tax rate must be within 0..=100"));
            }
        }
        Ok(())
    }

    pub fn validate_for_create(&self, workflow: &Workflow) -> Result<()> {
        self.validate_common(workflow)?;

        let missing: Vec<&str> = workflow
            .required_fields
            .iter()
            .copied()
            .filter(|name| !self.fields.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(DocflowError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        if workflow.financial == FinancialPolicy::Required && self.amount.is_none() {
            return Err(DocflowError::validation(format!(
                "a {} requires an amount",
                workflow.kind
            )));
        }
        Ok(())
    }

    pub fn validate_for_update(&self, workflow: &Workflow) -> Result<()> {
        self.validate_common(workflow)
    }

    pub(crate) fn take_fields(&mut self) -> BTreeMap<String, String> {
        std::mem::take(&mut self.fields)
    }

    /// Financial block for a new record; `None` for kinds without amounts.
    pub(crate) fn financials_for_create(&self, workflow: &Workflow) -> Result<Option<Financials>> {
        match (workflow.financial, self.amount) {
            (FinancialPolicy::Required, Some(amount)) => Financials::new(
                amount,
                self.tax_applicable.unwrap_or(false),
                self.tax_rate.unwrap_or_default(),
                self.tax_number.clone().flatten(),
            )
            .map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn expense(amount: i64) -> DocumentRecord {
        let now = TimeStamp::new_with(2024, 5, 2, 10, 0, 0).unwrap();
        DocumentRecord {
            id: "doc_test".into(),
            kind: DocumentKind::ExpenseLog,
            sequence_number: 1,
            human_number: "VOU-202405-0001".into(),
            period_key: "202405".into(),
            status: Status::Pending,
            approvals: vec![],
            fields: BTreeMap::from([("category".into(), "stationery".into())]),
            financials: Some(Financials::new(
                Money::from(amount),
                true,
                Percent::from(18),
                Some("27ABCDE1234F1Z5".into()),
            )
            .unwrap()),
            dated: now.clone(),
            created_by: "user_a".into(),
            created_at: now.clone(),
            last_modified_by: "user_a".into(),
            last_modified_at: now,
            archived: false,
            revision: 0,
        }
    }

    #[test]
    fn financials_derive_on_construction() {
        let record = expense(1000);
        let financials = record.financials.as_ref().unwrap();

        assert_eq!(financials.cgst(), Money::from(90));
        assert_eq!(financials.total_amount(), Money::from(1180));
    }

    #[test]
    fn blank_tax_number_is_inter_state() {
        let financials = Financials::new(Money::from(1000), true, Percent::from(18), Some("  ".into())).unwrap();

        assert!(!financials.has_tax_number());
        assert_eq!(financials.igst(), Money::from(180));
    }

    #[test]
    fn payload_recomputes_tax_when_inputs_change() {
        let mut record = expense(1000);

        record.apply_payload(DocumentPayload::new().clear_tax_number()).unwrap();
        let financials = record.financials.as_ref().unwrap();
        assert_eq!(financials.cgst(), Money::ZERO);
        assert_eq!(financials.igst(), Money::from(180));

        record.apply_payload(DocumentPayload::new().set_amount(Money::from(2000))).unwrap();
        let financials = record.financials.as_ref().unwrap();
        assert_eq!(financials.igst(), Money::from(360));
        assert_eq!(financials.total_amount(), Money::from(2360));
    }

    #[test]
    fn payload_without_financials_leaves_tax_alone() {
        let mut record = expense(1000);
        let before = record.financials.clone();

        record.apply_payload(DocumentPayload::new().set_field("paid_to", "Stationery Mart")).unwrap();

        assert_eq!(record.financials, before);
        assert_eq!(record.field("paid_to"), Some("Stationery Mart"));
    }

    #[test]
    fn details_hash_tracks_business_content() {
        let mut record = expense(1000);
        let original = record.details_hash().unwrap();

        record.archived = true;
        record.revision += 1;
        record.last_modified_by = "user_b".into();
        assert_eq!(record.details_hash().unwrap(), original);

        record.apply_payload(DocumentPayload::new().set_amount(Money::from(999))).unwrap();
        assert_ne!(record.details_hash().unwrap(), original);
    }

    #[test]
    fn amounts_past_the_ceiling_are_refused() {
        let workflow = DocumentKind::ExpenseLog.workflow();
        let at_ceiling = DocumentPayload::new().set_amount(Money::new(MAX_AMOUNT));
        let past_ceiling = DocumentPayload::new().set_amount(Money::new(MAX_AMOUNT + Decimal::new(1, 2)));
        let near_max = DocumentPayload::new().set_amount(Money::new(Decimal::MAX));

        assert!(at_ceiling.validate_for_update(workflow).is_ok());
        assert_eq!(past_ceiling.validate_for_update(workflow).unwrap_err().code(), ErrorCode::Validation);
        assert_eq!(near_max.validate_for_update(workflow).unwrap_err().code(), ErrorCode::Validation);
    }

    #[test]
    fn overflowing_tax_leaves_an_error_not_a_panic() {
        let mut record = expense(1000);

        let err = record
            .apply_payload(DocumentPayload::new().set_amount(Money::new(Decimal::MAX)))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn record_cbor_roundtrip() {
        let record = expense(1000);

        let bytes = record.to_cbor().unwrap();
        let decoded = DocumentRecord::from_cbor(b"doc_test", &bytes).unwrap();

        assert_eq!(record, decoded);
    }

    #[test]
    fn create_validation_reports_missing_fields() {
        let workflow = DocumentKind::ExpenseLog.workflow();
        let payload = DocumentPayload::new()
            .set_field("category", "transport")
            .set_amount(Money::from(10));

        let err = payload.validate_for_create(workflow).unwrap_err();
        assert!(err.to_string().contains("paid_to"));
    }

    #[test]
    fn create_validation_rejects_bad_numbers() {
        let workflow = DocumentKind::ExpenseLog.workflow();
        let base = DocumentPayload::new()
            .set_field("category", "transport")
            .set_field("paid_to", "City Cabs");

        assert!(base.clone().validate_for_create(workflow).is_err()); // no amount
        assert!(
            base.clone()
                .set_amount(Money::from(-5))
                .validate_for_create(workflow)
                .is_err()
        );
        assert!(
            base.clone()
                .set_amount(Money::from(5))
                .set_tax_rate(Percent::from(101))
                .validate_for_create(workflow)
                .is_err()
        );
        assert!(base.set_amount(Money::from(5)).validate_for_create(workflow).is_ok());
    }

    #[test]
    fn non_financial_kinds_refuse_amounts() {
        let workflow = DocumentKind::MeetingMinutes.workflow();
        let payload = DocumentPayload::new()
            .set_field("title", "PTA")
            .set_field("meeting_date", "2024-05-02")
            .set_field("attendees", "Admin, VP")
            .set_amount(Money::from(1));

        assert!(payload.validate_for_create(workflow).is_err());
    }
}

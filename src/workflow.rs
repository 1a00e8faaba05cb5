//! Table-driven approval state machine.
//!
//! Every document kind owns one static [`Workflow`]: its initial status, the
//! enumerated terminal statuses, an ordered edge list `(from, action, to,
//! roles)` and the `(role, statuses)` grants that allow pre-approval edits.
//! Adding a document kind means adding a table, not new branching code.
use crate::error::{DocflowError, Result};
use crate::record::{Approval, DocumentRecord};
use crate::types::{Actor, Role, TimeStamp};
use crate::types::Role as R;
use std::str::FromStr;

use self::Action as A;
use self::Status as S;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentKind {
    #[n(0)]
    ExpenseLog,
    #[n(1)]
    IncomeLog,
    #[n(2)]
    MeetingMinutes,
    #[n(3)]
    DisciplinaryForm,
    #[n(4)]
    ItSupportTicket,
    #[n(5)]
    SubstituteRequest,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Paid,
    #[n(4)]
    Draft,
    #[n(5)]
    Submitted,
    #[n(6)]
    VpApproved,
    #[n(7)]
    PrincipalApproved,
    #[n(8)]
    Escalated,
    #[n(9)]
    Resolved,
    #[n(10)]
    Dismissed,
    #[n(11)]
    Open,
    #[n(12)]
    Assigned,
    #[n(13)]
    Closed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    #[n(0)]
    Submit,
    #[n(1)]
    Approve,
    #[n(2)]
    Reject,
    #[n(3)]
    Pay,
    #[n(4)]
    VpApprove,
    #[n(5)]
    PrincipalApprove,
    #[n(6)]
    Escalate,
    #[n(7)]
    Resolve,
    #[n(8)]
    Dismiss,
    #[n(9)]
    Assign,
    #[n(10)]
    Close,
}

/// Whether a kind carries amounts and derived tax fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinancialPolicy {
    Required,
    NotApplicable,
}

/// How the human-readable counter resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPolicy {
    Monthly,
    AllTime,
}

impl PeriodPolicy {
    pub fn key_for(&self, dated: &TimeStamp<chrono::Utc>) -> String {
        match self {
            Self::Monthly => dated.period_key(),
            Self::AllTime => String::new(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Edge {
    pub from: Status,
    pub action: Action,
    pub to: Status,
    pub roles: &'static [Role],
}

impl Edge {
    const fn new(from: Status, action: Action, to: Status, roles: &'static [Role]) -> Self {
        Self {
            from,
            action,
            to,
            roles,
        }
    }

    /// The single guard for an edge: status, action and role must all match.
    pub fn permits(&self, status: Status, action: Action, role: Role) -> bool {
        self.from == status && self.action == action && self.roles.contains(&role)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct EditGrant {
    pub role: Role,
    pub statuses: &'static [Status],
}

impl EditGrant {
    const fn new(role: Role, statuses: &'static [Status]) -> Self {
        Self { role, statuses }
    }
}

#[derive(Debug)]
pub struct Workflow {
    pub kind: DocumentKind,
    pub default_prefix: &'static str,
    pub initial: Status,
    pub terminal: &'static [Status],
    pub edges: &'static [Edge],
    pub editors: &'static [EditGrant],
    pub originators: &'static [Role],
    pub required_fields: &'static [&'static str],
    pub financial: FinancialPolicy,
    pub period: PeriodPolicy,
}

const FINANCIAL_EDGES: &[Edge] = &[
    Edge::new(S::Pending, A::Approve, S::Approved, &[R::Principal, R::Admin]),
    Edge::new(S::Pending, A::Reject, S::Rejected, &[R::Principal, R::Admin]),
    Edge::new(S::Pending, A::Pay, S::Paid, &[R::Admin]),
    Edge::new(S::Approved, A::Pay, S::Paid, &[R::Accountant, R::Admin]),
];

const FINANCIAL_EDITORS: &[EditGrant] = &[
    EditGrant::new(R::Accountant, &[S::Pending]),
    EditGrant::new(R::Admin, &[S::Pending]),
];

static EXPENSE_LOG: Workflow = Workflow {
    kind: DocumentKind::ExpenseLog,
    default_prefix: "VOU",
    initial: S::Pending,
    terminal: &[S::Rejected, S::Paid],
    edges: FINANCIAL_EDGES,
    editors: FINANCIAL_EDITORS,
    originators: &[R::Accountant, R::Admin],
    required_fields: &["category", "paid_to"],
    financial: FinancialPolicy::Required,
    period: PeriodPolicy::Monthly,
};

static INCOME_LOG: Workflow = Workflow {
    kind: DocumentKind::IncomeLog,
    default_prefix: "INC",
    initial: S::Pending,
    terminal: &[S::Rejected, S::Paid],
    edges: FINANCIAL_EDGES,
    editors: FINANCIAL_EDITORS,
    originators: &[R::Accountant, R::Admin],
    required_fields: &["category", "received_from"],
    financial: FinancialPolicy::Required,
    period: PeriodPolicy::Monthly,
};

static MEETING_MINUTES: Workflow = Workflow {
    kind: DocumentKind::MeetingMinutes,
    default_prefix: "MM",
    initial: S::Draft,
    terminal: &[S::PrincipalApproved, S::Rejected],
    edges: &[
        Edge::new(S::Draft, A::Submit, S::Submitted, &[R::Admin]),
        Edge::new(S::Submitted, A::VpApprove, S::VpApproved, &[R::VicePrincipal]),
        Edge::new(S::VpApproved, A::PrincipalApprove, S::PrincipalApproved, &[R::Principal]),
        Edge::new(S::Submitted, A::Reject, S::Rejected, &[R::VicePrincipal]),
        Edge::new(S::VpApproved, A::Reject, S::Rejected, &[R::Principal]),
    ],
    editors: &[
        EditGrant::new(R::Admin, &[S::Draft, S::Submitted]),
        EditGrant::new(R::VicePrincipal, &[S::Submitted, S::VpApproved]),
        EditGrant::new(R::Principal, &[S::VpApproved, S::PrincipalApproved]),
    ],
    originators: &[R::Admin],
    required_fields: &["title", "meeting_date", "attendees"],
    financial: FinancialPolicy::NotApplicable,
    period: PeriodPolicy::Monthly,
};

static DISCIPLINARY_FORM: Workflow = Workflow {
    kind: DocumentKind::DisciplinaryForm,
    default_prefix: "DIS",
    initial: S::Draft,
    terminal: &[S::Resolved, S::Dismissed],
    edges: &[
        Edge::new(S::Draft, A::Submit, S::Submitted, &[R::Teacher]),
        Edge::new(S::Submitted, A::Escalate, S::Escalated, &[R::VicePrincipal]),
        Edge::new(S::Submitted, A::Resolve, S::Resolved, &[R::VicePrincipal]),
        Edge::new(S::Submitted, A::Dismiss, S::Dismissed, &[R::VicePrincipal]),
        Edge::new(S::Escalated, A::Resolve, S::Resolved, &[R::Principal]),
        Edge::new(S::Escalated, A::Dismiss, S::Dismissed, &[R::Principal]),
    ],
    editors: &[
        EditGrant::new(R::Teacher, &[S::Draft]),
        EditGrant::new(R::VicePrincipal, &[S::Submitted]),
    ],
    originators: &[R::Teacher],
    required_fields: &["student_id", "incident_date", "description"],
    financial: FinancialPolicy::NotApplicable,
    period: PeriodPolicy::Monthly,
};

static IT_SUPPORT_TICKET: Workflow = Workflow {
    kind: DocumentKind::ItSupportTicket,
    default_prefix: "ITS",
    initial: S::Open,
    terminal: &[S::Closed, S::Rejected],
    edges: &[
        Edge::new(S::Open, A::Assign, S::Assigned, &[R::Admin]),
        Edge::new(S::Open, A::Reject, S::Rejected, &[R::Admin]),
        Edge::new(S::Assigned, A::Resolve, S::Resolved, &[R::Staff, R::Admin]),
        Edge::new(S::Resolved, A::Close, S::Closed, &[R::Teacher, R::Staff, R::Admin]),
    ],
    editors: &[
        EditGrant::new(R::Teacher, &[S::Open]),
        EditGrant::new(R::Staff, &[S::Open]),
        EditGrant::new(R::Admin, &[S::Open, S::Assigned]),
    ],
    originators: &[R::Teacher, R::Staff],
    required_fields: &["subject", "location", "description"],
    financial: FinancialPolicy::NotApplicable,
    period: PeriodPolicy::AllTime,
};

static SUBSTITUTE_REQUEST: Workflow = Workflow {
    kind: DocumentKind::SubstituteRequest,
    default_prefix: "SUB",
    initial: S::Pending,
    terminal: &[S::Approved, S::Rejected],
    edges: &[
        Edge::new(S::Pending, A::Approve, S::Approved, &[R::VicePrincipal, R::Principal]),
        Edge::new(S::Pending, A::Reject, S::Rejected, &[R::VicePrincipal, R::Principal]),
    ],
    editors: &[EditGrant::new(R::Teacher, &[S::Pending])],
    originators: &[R::Teacher],
    required_fields: &["absence_date", "class_id", "reason"],
    financial: FinancialPolicy::NotApplicable,
    period: PeriodPolicy::Monthly,
};

impl DocumentKind {
    pub const ALL: [DocumentKind; 6] = [
        DocumentKind::ExpenseLog,
        DocumentKind::IncomeLog,
        DocumentKind::MeetingMinutes,
        DocumentKind::DisciplinaryForm,
        DocumentKind::ItSupportTicket,
        DocumentKind::SubstituteRequest,
    ];

    pub fn workflow(&self) -> &'static Workflow {
        match self {
            Self::ExpenseLog => &EXPENSE_LOG,
            Self::IncomeLog => &INCOME_LOG,
            Self::MeetingMinutes => &MEETING_MINUTES,
            Self::DisciplinaryForm => &DISCIPLINARY_FORM,
            Self::ItSupportTicket => &IT_SUPPORT_TICKET,
            Self::SubstituteRequest => &SUBSTITUTE_REQUEST,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpenseLog => "expense_log",
            Self::IncomeLog => "income_log",
            Self::MeetingMinutes => "meeting_minutes",
            Self::DisciplinaryForm => "disciplinary_form",
            Self::ItSupportTicket => "it_support_ticket",
            Self::SubstituteRequest => "substitute_request",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DocflowError::validation(format!("unknown document kind '{s}'")))
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Paid => "Paid",
            Self::Draft => "Draft",
            Self::Submitted => "Submitted",
            Self::VpApproved => "VP Approved",
            Self::PrincipalApproved => "Principal Approved",
            Self::Escalated => "Escalated",
            Self::Resolved => "Resolved",
            Self::Dismissed => "Dismissed",
            Self::Open => "Open",
            Self::Assigned => "Assigned",
            Self::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Pay => "pay",
            Self::VpApprove => "vp_approve",
            Self::PrincipalApprove => "principal_approve",
            Self::Escalate => "escalate",
            Self::Resolve => "resolve",
            Self::Dismiss => "dismiss",
            Self::Assign => "assign",
            Self::Close => "close",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Workflow {
    pub fn is_terminal(&self, status: Status) -> bool {
        self.terminal.contains(&status)
    }

    /// Every status the table mentions, in first-seen order.
    pub fn statuses(&self) -> Vec<Status> {
        let mut seen = vec![self.initial];
        for edge in self.edges {
            for status in [edge.from, edge.to] {
                if !seen.contains(&status) {
                    seen.push(status);
                }
            }
        }
        seen
    }

    pub fn edge(&self, status: Status, action: Action, role: Role) -> Option<&'static Edge> {
        if self.is_terminal(status) {
            return None;
        }
        self.edges.iter().find(|edge| edge.permits(status, action, role))
    }

    pub fn can_transition(&self, status: Status, action: Action, role: Role) -> bool {
        self.edge(status, action, role).is_some()
    }

    /// Actions `role` may take from `status`, in table order.
    pub fn available_actions(&self, status: Status, role: Role) -> Vec<Action> {
        if self.is_terminal(status) {
            return vec![];
        }
        self.edges
            .iter()
            .filter(|edge| edge.from == status && edge.roles.contains(&role))
            .map(|edge| edge.action)
            .collect()
    }

    /// Business fields are editable only by a role holding a grant for the
    /// current status, and never once the status is terminal.
    pub fn can_edit(&self, role: Role, status: Status) -> bool {
        !self.is_terminal(status)
            && self
                .editors
                .iter()
                .any(|grant| grant.role == role && grant.statuses.contains(&status))
    }

    pub fn can_delete(&self, role: Role, status: Status) -> bool {
        status == self.initial && self.can_edit(role, status)
    }

    pub fn can_originate(&self, role: Role) -> bool {
        self.originators.contains(&role)
    }
}

pub fn can_transition(kind: DocumentKind, status: Status, action: Action, role: Role) -> bool {
    kind.workflow().can_transition(status, action, role)
}

/// Advances `record` along the edge matching `(status, action, role)`,
/// appending the approval entry and stamping the modifier. The record is
/// returned unsaved; persisting it is the caller's compare-and-swap.
pub fn apply_transition(
    mut record: DocumentRecord,
    action: Action,
    actor: &Actor,
    remarks: Option<String>,
) -> Result<DocumentRecord> {
    let workflow = record.kind.workflow();

    if workflow.is_terminal(record.status) {
        return Err(DocflowError::ImmutableRecord {
            id: record.id,
            status: record.status,
            operation: "transitioned",
        });
    }

    let edge = workflow
        .edge(record.status, action, actor.role)
        .ok_or(DocflowError::InvalidTransition {
            kind: record.kind,
            status: record.status,
            action,
            role: actor.role,
        })?;

    let now = TimeStamp::new();
    let approval = Approval {
        role: actor.role,
        actor_id: actor.id.clone(),
        timestamp: now.clone(),
        remarks: remarks.unwrap_or_default(),
        action,
        from: edge.from,
        to: edge.to,
        details_hash: record.details_hash()?,
    };

    record.approvals.push(approval);
    record.status = edge.to;
    record.last_modified_by = actor.id.clone();
    record.last_modified_at = now;

    Ok(record)
}

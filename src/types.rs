//! Core types and data structures for the reconciliation engine

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Account a movement was observed in or a provisional entry is issued to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceAccount {
    /// Physical cash register
    Cash,
    /// Bank current account
    Bank,
    /// Card / e-wallet account
    Card,
}

/// How a ledger movement came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementOrigin {
    /// Imported from a bank/cash statement batch
    Imported,
    /// Entered by hand by an operator
    Manual,
    /// Created by the engine when a payment method was confirmed; stands in
    /// for the real movement until a statement covers it
    Provisional,
}

/// Payment method chosen by the user when confirming a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    Bank,
}

impl PaymentMethod {
    /// The account a provisional entry for this method is issued in
    pub fn account(&self) -> SourceAccount {
        match self {
            PaymentMethod::Cash => SourceAccount::Cash,
            PaymentMethod::Bank => SourceAccount::Bank,
        }
    }
}

/// A single dated cash-flow entry from an imported statement or manual entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMovement {
    /// Unique identifier for the movement
    pub id: String,
    /// Value date of the movement
    pub date: NaiveDate,
    /// Signed amount: positive inflow, negative outflow
    pub amount: BigDecimal,
    /// Free-text description as imported
    pub description: String,
    /// Account the movement belongs to
    pub account: SourceAccount,
    /// How the movement was created
    pub origin: MovementOrigin,
    /// Reference to the import batch, if any
    pub source_batch: Option<String>,
    /// Id of the document that claimed this movement, if any
    pub consumed_by: Option<String>,
    /// When the movement was claimed
    pub consumed_at: Option<NaiveDateTime>,
    /// Soft-annulled movements stay on record but are excluded from matching
    pub annulled: bool,
    /// Audit note recorded when the movement was annulled
    pub annulment_note: Option<String>,
    /// When the movement record was created
    pub created_at: NaiveDateTime,
    /// When the movement record was last updated
    pub updated_at: NaiveDateTime,
}

impl LedgerMovement {
    /// Create a new movement
    pub fn new(
        id: String,
        date: NaiveDate,
        amount: BigDecimal,
        description: String,
        account: SourceAccount,
        origin: MovementOrigin,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            date,
            amount,
            description,
            account,
            origin,
            source_batch: None,
            consumed_by: None,
            consumed_at: None,
            annulled: false,
            annulment_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an imported movement carrying its statement batch reference
    pub fn imported(
        id: String,
        date: NaiveDate,
        amount: BigDecimal,
        description: String,
        account: SourceAccount,
        source_batch: String,
    ) -> Self {
        let mut movement = Self::new(
            id,
            date,
            amount,
            description,
            account,
            MovementOrigin::Imported,
        );
        movement.source_batch = Some(source_batch);
        movement
    }

    /// Create a provisional entry for a document confirmation
    pub fn provisional(
        document: &PayableDocument,
        account: SourceAccount,
        date: NaiveDate,
    ) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            date,
            -document.amount_due.clone(),
            format!("Provisional payment for {}", document.counterparty),
            account,
            MovementOrigin::Provisional,
        )
    }

    /// Whether the movement can still be offered as a match candidate
    pub fn is_available(&self) -> bool {
        self.consumed_by.is_none() && !self.annulled && self.origin != MovementOrigin::Provisional
    }
}

/// Kind of payable document, with the identifying data each kind carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Supplier or customer invoice
    Invoice {
        /// Invoice number as printed on the document
        number: String,
    },
    /// Traffic-ticket charge
    TicketCharge {
        /// Ticket identification number
        ticket_number: String,
    },
    /// Single payment line of a tax form
    TaxFormLine {
        /// Payment-slip identifier, if the form carries one
        slip_code: Option<String>,
        /// Tax period the line settles, e.g. "2026-Q1"
        period: String,
    },
    /// Card or e-wallet charge
    CardCharge {
        /// Circuit name, e.g. "VISA"
        circuit: String,
    },
}

impl DocumentKind {
    /// Discriminant tag used for per-kind configuration lookup
    pub fn tag(&self) -> DocumentKindTag {
        match self {
            DocumentKind::Invoice { .. } => DocumentKindTag::Invoice,
            DocumentKind::TicketCharge { .. } => DocumentKindTag::TicketCharge,
            DocumentKind::TaxFormLine { .. } => DocumentKindTag::TaxFormLine,
            DocumentKind::CardCharge { .. } => DocumentKindTag::CardCharge,
        }
    }
}

/// Discriminant-only view of [`DocumentKind`], usable as a map key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKindTag {
    Invoice,
    TicketCharge,
    TaxFormLine,
    CardCharge,
}

/// Lifecycle states of a payable document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcileState {
    /// Awaiting the user's choice of payment method
    PendingConfirmation,
    /// Paid in cash per the user; provisional entry issued, statement pending
    ConfirmedCash,
    /// Paid by bank per the user; provisional entry issued, statement pending
    ConfirmedBank,
    /// No statement data yet covers the expected settlement period
    SuspendedAwaitingStatement,
    /// Matched movement found in a different account than confirmed
    NeedsReviewMoveProposed,
    /// Matcher score fell in the review band; user must confirm or reject
    NeedsReviewUncertainMatch,
    /// Due date elapsed with no candidate ever found
    AnomalyNotInStatement,
    /// Settled: linked to the imported movement that paid it
    Reconciled,
    /// Excluded from automatic processing by a user lock
    ManualLock,
}

impl ReconcileState {
    /// Terminal for the normal flow; only manual unlink reopens it
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReconcileState::Reconciled)
    }

    /// States that carry a provisional ledger entry
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self,
            ReconcileState::ConfirmedCash | ReconcileState::ConfirmedBank
        )
    }

    /// States surfaced on the dashboard as requiring user action
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            ReconcileState::NeedsReviewMoveProposed
                | ReconcileState::NeedsReviewUncertainMatch
                | ReconcileState::AnomalyNotInStatement
        )
    }

    /// States the scheduled pass re-evaluates automatically
    pub fn is_auto_processed(&self) -> bool {
        matches!(
            self,
            ReconcileState::PendingConfirmation
                | ReconcileState::ConfirmedCash
                | ReconcileState::ConfirmedBank
                | ReconcileState::SuspendedAwaitingStatement
        )
    }
}

/// Any obligation to reconcile against a ledger movement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayableDocument {
    /// Unique identifier for the document
    pub id: String,
    /// Kind of document and its kind-specific identifiers
    pub kind: DocumentKind,
    /// Counterparty name exactly as extracted from the source
    pub counterparty_raw: String,
    /// Canonical counterparty name used for matching
    pub counterparty: String,
    /// Amount due (always positive)
    pub amount_due: BigDecimal,
    /// ISO currency code
    pub currency: String,
    /// Issue date of the obligation
    pub issue_date: NaiveDate,
    /// Date by which the obligation should be settled
    pub due_date: NaiveDate,
    /// Current lifecycle state
    pub state: ReconcileState,
    /// State to revert to when a review-band proposal is rejected
    pub prior_state: Option<ReconcileState>,
    /// Whether the document is locked out of automatic processing
    pub locked: bool,
    /// Reason recorded when the document was locked
    pub lock_reason: Option<String>,
    /// Imported movement that settled the document, once reconciled
    pub matched_movement_id: Option<String>,
    /// Provisional ledger entry created on payment-method confirmation
    pub provisional_entry_id: Option<String>,
    /// Soft-delete flag; deleted documents are invisible to passes
    pub deleted: bool,
    /// When the document record was created
    pub created_at: NaiveDateTime,
    /// When the document record was last updated
    pub updated_at: NaiveDateTime,
}

impl PayableDocument {
    /// Create a new document in the initial state
    pub fn new(
        id: String,
        kind: DocumentKind,
        counterparty: String,
        amount_due: BigDecimal,
        issue_date: NaiveDate,
        due_date: NaiveDate,
    ) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            id,
            kind,
            counterparty_raw: counterparty.clone(),
            counterparty,
            amount_due,
            currency: "EUR".to_string(),
            issue_date,
            due_date,
            state: ReconcileState::PendingConfirmation,
            prior_state: None,
            locked: false,
            lock_reason: None,
            matched_movement_id: None,
            provisional_entry_id: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the document is still subject to automatic processing
    pub fn is_open(&self) -> bool {
        !self.deleted && !self.locked && !self.state.is_terminal()
    }

    /// Check the state/link invariant: `Reconciled` implies a matched
    /// movement, confirmed states imply a provisional entry, and every
    /// other state implies no matched movement.
    pub fn check_link_consistency(&self) -> ReconcileResult<()> {
        match self.state {
            ReconcileState::Reconciled => {
                if self.matched_movement_id.is_none() {
                    return Err(ReconcileError::Validation(format!(
                        "Document '{}' is reconciled but has no matched movement",
                        self.id
                    )));
                }
            }
            state => {
                if self.matched_movement_id.is_some() {
                    return Err(ReconcileError::Validation(format!(
                        "Document '{}' in state {:?} must not reference a matched movement",
                        self.id, state
                    )));
                }
                if state.is_confirmed() && self.provisional_entry_id.is_none() {
                    return Err(ReconcileError::Validation(format!(
                        "Document '{}' is confirmed but has no provisional entry",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Kind of pending (sospeso) operation queued for a later pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    /// Waiting for a payment receipt to arrive
    AwaitingReceipt,
    /// Waiting for a statement covering the expected period
    AwaitingStatement,
    /// Waiting for an operator decision
    AwaitingReview,
}

/// A queued retry marker for an item the last pass could not resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique identifier for the pending operation
    pub id: String,
    /// Document the operation refers to
    pub document_id: String,
    /// Why the item is queued
    pub kind: PendingKind,
    /// Last recorded reason string, refreshed each unresolved pass
    pub reason: String,
    /// When the operation was first queued
    pub created_at: NaiveDateTime,
    /// Set once a later pass resolves the item
    pub resolved: bool,
}

impl PendingOperation {
    /// Queue a new pending operation for a document
    pub fn new(document_id: String, kind: PendingKind, reason: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id,
            kind,
            reason,
            created_at: chrono::Utc::now().naive_utc(),
            resolved: false,
        }
    }
}

/// Counterparty category an alias entry is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterpartyCategory {
    Supplier,
    Authority,
    CardCircuit,
    Other,
}

/// Canonical counterparty name with its known raw-string variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEntry {
    /// Canonical name used on documents
    pub canonical: String,
    /// Category the alias is scoped to
    pub category: CounterpartyCategory,
    /// Raw strings observed for this counterparty in movement descriptions
    pub variants: Vec<String>,
}

impl AliasEntry {
    pub fn new(canonical: String, category: CounterpartyCategory) -> Self {
        Self {
            canonical,
            category,
            variants: Vec::new(),
        }
    }
}

/// A schedule-of-payments line dependent on a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub document_id: String,
    pub due_date: NaiveDate,
    pub amount: BigDecimal,
    /// Cancelled entries stay on record for audit
    pub cancelled: bool,
}

/// Kind of physical payment instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Check,
    Riba,
    Other,
}

/// A physical payment instrument (check, riba) possibly linked to a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstrument {
    pub id: String,
    /// Linked document; cleared on document deletion, never the instrument
    pub document_id: Option<String>,
    pub kind: InstrumentKind,
    /// Instrument identifier, e.g. the check number
    pub identifier: String,
}

/// A warehouse movement registered against a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseMovement {
    pub id: String,
    pub document_id: String,
    pub annulled: bool,
    /// Audit note recorded on annulment
    pub audit_note: Option<String>,
}

/// Field updates to propagate to a document's dependent records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub amount_due: Option<BigDecimal>,
    pub due_date: Option<NaiveDate>,
    pub counterparty: Option<String>,
}

impl DocumentChange {
    pub fn is_empty(&self) -> bool {
        self.amount_due.is_none() && self.due_date.is_none() && self.counterparty.is_none()
    }
}

/// Options controlling document deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Double-confirmation flag required when downstream records exist
    pub confirmed: bool,
    /// Hard-delete dependent ledger lines instead of soft-annulling them
    pub hard_delete: bool,
}

/// One item that failed during a pass, kept in the report instead of
/// aborting the remaining items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassFailure {
    pub document_id: String,
    pub reason: String,
}

/// Aggregated outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Documents examined across both phases
    pub examined: usize,
    /// Backlog items resolved in phase 1
    pub backlog_resolved: usize,
    /// Backlog items still queued after phase 1
    pub backlog_remaining: usize,
    /// New pending operations queued in phase 2
    pub newly_pending: usize,
    /// Resulting state counts over all examined documents
    pub state_counts: HashMap<ReconcileState, usize>,
    /// Documents reconciled during this pass
    pub reconciled: Vec<String>,
    /// Documents moved to `NeedsReviewMoveProposed`
    pub proposed_moves: Vec<String>,
    /// Documents moved to `NeedsReviewUncertainMatch`
    pub uncertain: Vec<String>,
    /// Documents moved to `AnomalyNotInStatement`
    pub anomalies: Vec<String>,
    /// Per-item failures; the pass itself always completes
    pub failures: Vec<PassFailure>,
}

impl PassReport {
    pub(crate) fn record_state(&mut self, state: ReconcileState) {
        *self.state_counts.entry(state).or_insert(0) += 1;
    }
}

/// Normalized document row for dashboard lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub counterparty: String,
    pub amount_due: BigDecimal,
    pub due_date: NaiveDate,
    pub state: ReconcileState,
}

impl DocumentSummary {
    pub fn from_document(document: &PayableDocument) -> Self {
        Self {
            id: document.id.clone(),
            counterparty: document.counterparty.clone(),
            amount_due: document.amount_due.clone(),
            due_date: document.due_date,
            state: document.state,
        }
    }
}

/// Counts per state plus normalized lists of actionable documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub counts: HashMap<ReconcileState, usize>,
    pub uncertain: Vec<DocumentSummary>,
    pub proposed_moves: Vec<DocumentSummary>,
    pub anomalies: Vec<DocumentSummary>,
}

/// Errors that can occur in the reconciliation engine
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Document not found: {0}")]
    DocumentNotFound(String),
    #[error("Movement not found: {0}")]
    MovementNotFound(String),
    #[error("Invalid transition from {from:?}: {action}")]
    InvalidTransition {
        from: ReconcileState,
        action: String,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl ReconcileError {
    /// Conflicts are the only errors worth an automatic retry on the
    /// next pass; everything else needs caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Conflict(_))
    }
}

/// Result type for engine operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn document_survives_json_round_trip() {
        let mut document = PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::TaxFormLine {
                slip_code: Some("123456789012345".to_string()),
                period: "2026-Q1".to_string(),
            },
            "Agenzia Entrate".to_string(),
            BigDecimal::from_str("1234.56").unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
        );
        document.state = ReconcileState::NeedsReviewUncertainMatch;
        document.matched_movement_id = Some("m1".to_string());

        let json = serde_json::to_string(&document).unwrap();
        let decoded: PayableDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, document);
        // the kind payload survives, decimals included
        match decoded.kind {
            DocumentKind::TaxFormLine { slip_code, period } => {
                assert_eq!(slip_code.as_deref(), Some("123456789012345"));
                assert_eq!(period, "2026-Q1");
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        assert_eq!(decoded.amount_due, BigDecimal::from_str("1234.56").unwrap());
    }
}

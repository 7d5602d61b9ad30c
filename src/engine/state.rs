//! Per-document lifecycle and legal transitions
//!
//! Every transition is applied through the store's compare-and-set
//! primitives, so a manual action racing a scheduled pass loses cleanly
//! with a conflict instead of overwriting. Illegal transitions are
//! rejected without mutating anything.

use chrono::NaiveDate;
use tracing::debug;

use crate::traits::{DefaultDocumentValidator, DocumentValidator, RecordStore};
use crate::types::*;

/// Applies reconciliation state transitions through the record store
pub struct StateMachine<S: RecordStore> {
    storage: S,
    validator: Box<dyn DocumentValidator>,
}

impl<S: RecordStore> StateMachine<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            validator: Box::new(DefaultDocumentValidator),
        }
    }

    pub fn with_validator(storage: S, validator: Box<dyn DocumentValidator>) -> Self {
        Self { storage, validator }
    }

    async fn get_document_required(&self, document_id: &str) -> ReconcileResult<PayableDocument> {
        self.storage
            .get_document(document_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| ReconcileError::DocumentNotFound(document_id.to_string()))
    }

    fn illegal(document: &PayableDocument, action: &str) -> ReconcileError {
        ReconcileError::InvalidTransition {
            from: document.state,
            action: action.to_string(),
        }
    }

    fn require_unlocked(document: &PayableDocument, action: &str) -> ReconcileResult<()> {
        if document.locked {
            Err(Self::illegal(document, action))
        } else {
            Ok(())
        }
    }

    /// `PENDING_CONFIRMATION` → `CONFIRMED_CASH`/`CONFIRMED_BANK`
    ///
    /// Issues a provisional ledger entry in the chosen account; the entry
    /// stands in for the real movement until a statement covers it.
    pub async fn confirm_payment_method(
        &mut self,
        document_id: &str,
        method: PaymentMethod,
        payment_date: NaiveDate,
    ) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "confirm payment method")?;
        if document.state != ReconcileState::PendingConfirmation {
            return Err(Self::illegal(&document, "confirm payment method"));
        }
        self.validator.validate_document(&document)?;

        let provisional =
            LedgerMovement::provisional(&document, method.account(), payment_date);

        let mut updated = document.clone();
        updated.state = match method {
            PaymentMethod::Cash => ReconcileState::ConfirmedCash,
            PaymentMethod::Bank => ReconcileState::ConfirmedBank,
        };
        updated.provisional_entry_id = Some(provisional.id.clone());
        updated.updated_at = chrono::Utc::now().naive_utc();

        // CAS first: if a concurrent actor moved the document, the
        // provisional entry is never written
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        self.storage.save_movement(&provisional).await?;

        debug!(document = %document_id, state = ?updated.state, "payment method confirmed");
        Ok(updated)
    }

    /// Any confirmed/suspended/uncertain state → `RECONCILED`
    ///
    /// Claims the imported movement atomically; if the claim succeeds but
    /// the document moved underneath us, the claim is rolled back and the
    /// whole operation reports a conflict.
    pub async fn reconcile_with_movement(
        &mut self,
        document_id: &str,
        movement_id: &str,
    ) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "reconcile")?;
        let legal = matches!(
            document.state,
            ReconcileState::PendingConfirmation
                | ReconcileState::ConfirmedCash
                | ReconcileState::ConfirmedBank
                | ReconcileState::SuspendedAwaitingStatement
                | ReconcileState::NeedsReviewUncertainMatch
        );
        if !legal {
            return Err(Self::illegal(&document, "reconcile"));
        }

        let claimed = self.storage.claim_movement(movement_id, document_id).await?;

        let mut updated = document.clone();
        updated.state = ReconcileState::Reconciled;
        updated.matched_movement_id = Some(claimed.id.clone());
        updated.prior_state = None;
        updated.updated_at = chrono::Utc::now().naive_utc();

        if let Err(err) = self
            .storage
            .compare_and_swap_document(document.state, &updated)
            .await
        {
            self.storage.release_movement(movement_id).await?;
            return Err(err);
        }

        // the provisional entry is superseded by the imported movement
        if let Some(provisional_id) = &document.provisional_entry_id {
            self.annul_provisional(provisional_id, "superseded by imported movement")
                .await?;
        }

        debug!(document = %document_id, movement = %movement_id, "reconciled");
        Ok(updated)
    }

    /// Matched movement sits in a different account than the confirmed
    /// one → `NEEDS_REVIEW_MOVE_PROPOSED`
    pub async fn propose_move(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "propose move")?;
        if !document.state.is_confirmed() {
            return Err(Self::illegal(&document, "propose move"));
        }

        let mut updated = document.clone();
        updated.prior_state = Some(document.state);
        updated.state = ReconcileState::NeedsReviewMoveProposed;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// Resolve a proposed move: on accept, re-issue the provisional entry
    /// in the movement's account and reconcile; on reject, revert to the
    /// prior confirmed state.
    pub async fn apply_move(
        &mut self,
        document_id: &str,
        movement_id: &str,
        accept: bool,
    ) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "apply move")?;
        if document.state != ReconcileState::NeedsReviewMoveProposed {
            return Err(Self::illegal(&document, "apply move"));
        }

        if !accept {
            let mut updated = document.clone();
            updated.state = document
                .prior_state
                .unwrap_or(ReconcileState::PendingConfirmation);
            updated.prior_state = None;
            updated.updated_at = chrono::Utc::now().naive_utc();
            self.storage
                .compare_and_swap_document(document.state, &updated)
                .await?;
            return Ok(updated);
        }

        let movement = self
            .storage
            .get_movement(movement_id)
            .await?
            .ok_or_else(|| ReconcileError::MovementNotFound(movement_id.to_string()))?;

        let claimed = self.storage.claim_movement(movement_id, document_id).await?;

        // re-issue the ledger entry in the account the payment actually
        // went through
        let reissued = LedgerMovement::provisional(&document, movement.account, movement.date);
        let old_provisional = document.provisional_entry_id.clone();

        let mut updated = document.clone();
        updated.state = ReconcileState::Reconciled;
        updated.matched_movement_id = Some(claimed.id.clone());
        updated.provisional_entry_id = Some(reissued.id.clone());
        updated.prior_state = None;
        updated.updated_at = chrono::Utc::now().naive_utc();

        if let Err(err) = self
            .storage
            .compare_and_swap_document(document.state, &updated)
            .await
        {
            self.storage.release_movement(movement_id).await?;
            return Err(err);
        }

        self.storage.save_movement(&reissued).await?;
        if let Some(provisional_id) = &old_provisional {
            self.annul_provisional(provisional_id, "re-issued in correct account")
                .await?;
        }

        debug!(document = %document_id, movement = %movement_id, "move accepted");
        Ok(updated)
    }

    /// Score in the review band → `NEEDS_REVIEW_UNCERTAIN_MATCH`
    pub async fn flag_uncertain(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "flag uncertain")?;
        if !document.state.is_auto_processed() {
            return Err(Self::illegal(&document, "flag uncertain"));
        }

        let mut updated = document.clone();
        updated.prior_state = Some(document.state);
        updated.state = ReconcileState::NeedsReviewUncertainMatch;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// User decision on an uncertain match: confirm reconciles against
    /// the movement, reject reverts to the prior state
    pub async fn resolve_uncertain(
        &mut self,
        document_id: &str,
        movement_id: &str,
        accept: bool,
    ) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "resolve uncertain match")?;
        if document.state != ReconcileState::NeedsReviewUncertainMatch {
            return Err(Self::illegal(&document, "resolve uncertain match"));
        }

        if accept {
            return self.reconcile_with_movement(document_id, movement_id).await;
        }

        let mut updated = document.clone();
        updated.state = document
            .prior_state
            .unwrap_or(ReconcileState::PendingConfirmation);
        updated.prior_state = None;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// No statement data yet covers the expected period →
    /// `SUSPENDED_AWAITING_STATEMENT`; re-evaluated every pass
    pub async fn suspend(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "suspend")?;
        if !document.state.is_auto_processed()
            || document.state == ReconcileState::SuspendedAwaitingStatement
        {
            return Err(Self::illegal(&document, "suspend"));
        }

        let mut updated = document.clone();
        updated.prior_state = Some(document.state);
        updated.state = ReconcileState::SuspendedAwaitingStatement;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// Due date elapsed with no candidate ever found →
    /// `ANOMALY_NOT_IN_STATEMENT`; surfaced for manual intervention
    pub async fn mark_anomaly(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "mark anomaly")?;
        if !document.state.is_auto_processed() {
            return Err(Self::illegal(&document, "mark anomaly"));
        }

        let mut updated = document.clone();
        updated.prior_state = Some(document.state);
        updated.state = ReconcileState::AnomalyNotInStatement;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// Force exclusion from automatic processing, from any state
    pub async fn lock(
        &mut self,
        document_id: &str,
        reason: &str,
    ) -> ReconcileResult<PayableDocument> {
        if reason.trim().is_empty() {
            return Err(ReconcileError::Validation(
                "Lock reason cannot be empty".to_string(),
            ));
        }
        let document = self.get_document_required(document_id).await?;
        if document.locked {
            return Err(Self::illegal(&document, "lock"));
        }

        let mut updated = document.clone();
        updated.prior_state = Some(document.state);
        updated.state = ReconcileState::ManualLock;
        updated.locked = true;
        updated.lock_reason = Some(reason.to_string());
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// Return a locked document to automatic processing
    pub async fn unlock(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        if !document.locked {
            return Err(Self::illegal(&document, "unlock"));
        }

        let mut updated = document.clone();
        updated.state = document
            .prior_state
            .unwrap_or(ReconcileState::PendingConfirmation);
        updated.prior_state = None;
        updated.locked = false;
        updated.lock_reason = None;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        Ok(updated)
    }

    /// Explicit unmatch: release the consumed movement and reopen the
    /// document for processing
    pub async fn unlink_movement(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        let document = self.get_document_required(document_id).await?;
        Self::require_unlocked(&document, "unlink movement")?;
        if document.state != ReconcileState::Reconciled {
            return Err(Self::illegal(&document, "unlink movement"));
        }
        let movement_id = document.matched_movement_id.clone().ok_or_else(|| {
            ReconcileError::Validation(format!(
                "Document '{}' has no matched movement to unlink",
                document.id
            ))
        })?;

        let mut updated = document.clone();
        updated.state = ReconcileState::PendingConfirmation;
        updated.matched_movement_id = None;
        updated.provisional_entry_id = None;
        updated.updated_at = chrono::Utc::now().naive_utc();
        self.storage
            .compare_and_swap_document(document.state, &updated)
            .await?;
        self.storage.release_movement(&movement_id).await?;

        debug!(document = %document_id, movement = %movement_id, "unlinked");
        Ok(updated)
    }

    async fn annul_provisional(&mut self, movement_id: &str, note: &str) -> ReconcileResult<()> {
        if let Some(mut provisional) = self.storage.get_movement(movement_id).await? {
            provisional.annulled = true;
            provisional.annulment_note = Some(note.to_string());
            provisional.updated_at = chrono::Utc::now().naive_utc();
            self.storage.update_movement(&provisional).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_store::MemoryStore;
    use bigdecimal::BigDecimal;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seed_document(store: &mut MemoryStore) -> PayableDocument {
        let document = PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::Invoice {
                number: "2026/015".to_string(),
            },
            "Infocert Spa".to_string(),
            BigDecimal::from(122),
            date(2026, 1, 31),
            date(2026, 3, 2),
        );
        store.save_document(&document).await.unwrap();
        document
    }

    async fn seed_movement(store: &mut MemoryStore, id: &str) -> LedgerMovement {
        let movement = LedgerMovement::imported(
            id.to_string(),
            date(2026, 2, 3),
            BigDecimal::from(-122),
            "INFOCERT SPA PAGAMENTO".to_string(),
            SourceAccount::Bank,
            "batch-1".to_string(),
        );
        store.save_movement(&movement).await.unwrap();
        movement
    }

    #[tokio::test]
    async fn confirm_creates_provisional_entry() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;

        let mut machine = StateMachine::new(store.clone());
        let updated = machine
            .confirm_payment_method("doc1", PaymentMethod::Bank, date(2026, 2, 1))
            .await
            .unwrap();

        assert_eq!(updated.state, ReconcileState::ConfirmedBank);
        let provisional_id = updated.provisional_entry_id.unwrap();
        let provisional = store.get_movement(&provisional_id).await.unwrap().unwrap();
        assert_eq!(provisional.origin, MovementOrigin::Provisional);
        assert_eq!(provisional.account, SourceAccount::Bank);
        assert_eq!(provisional.amount, BigDecimal::from(-122));
    }

    #[tokio::test]
    async fn reconcile_claims_movement_and_supersedes_provisional() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;
        seed_movement(&mut store, "m1").await;

        let mut machine = StateMachine::new(store.clone());
        let confirmed = machine
            .confirm_payment_method("doc1", PaymentMethod::Bank, date(2026, 2, 1))
            .await
            .unwrap();
        let updated = machine.reconcile_with_movement("doc1", "m1").await.unwrap();

        assert_eq!(updated.state, ReconcileState::Reconciled);
        assert_eq!(updated.matched_movement_id.as_deref(), Some("m1"));
        updated.check_link_consistency().unwrap();

        let movement = store.get_movement("m1").await.unwrap().unwrap();
        assert_eq!(movement.consumed_by.as_deref(), Some("doc1"));

        let provisional = store
            .get_movement(confirmed.provisional_entry_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(provisional.annulled);
    }

    #[tokio::test]
    async fn double_consumption_is_rejected() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;
        let other = PayableDocument::new(
            "doc2".to_string(),
            DocumentKind::Invoice {
                number: "2026/016".to_string(),
            },
            "Infocert Spa".to_string(),
            BigDecimal::from(122),
            date(2026, 1, 31),
            date(2026, 3, 2),
        );
        store.save_document(&other).await.unwrap();
        seed_movement(&mut store, "m1").await;

        let mut machine = StateMachine::new(store.clone());
        machine.reconcile_with_movement("doc1", "m1").await.unwrap();

        let err = machine
            .reconcile_with_movement("doc2", "m1")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
        assert!(err.is_retryable());

        // loser is untouched
        let doc2 = store.get_document("doc2").await.unwrap().unwrap();
        assert_eq!(doc2.state, ReconcileState::PendingConfirmation);
        assert!(doc2.matched_movement_id.is_none());
    }

    #[tokio::test]
    async fn locked_document_rejects_transitions_without_mutating() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;

        let mut machine = StateMachine::new(store.clone());
        machine.lock("doc1", "under dispute").await.unwrap();

        let err = machine
            .confirm_payment_method("doc1", PaymentMethod::Cash, date(2026, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { .. }));

        let document = store.get_document("doc1").await.unwrap().unwrap();
        assert_eq!(document.state, ReconcileState::ManualLock);
        assert_eq!(document.lock_reason.as_deref(), Some("under dispute"));

        let unlocked = machine.unlock("doc1").await.unwrap();
        assert_eq!(unlocked.state, ReconcileState::PendingConfirmation);
        assert!(!unlocked.locked);
    }

    #[tokio::test]
    async fn rejected_move_reverts_to_prior_state() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;
        seed_movement(&mut store, "m1").await;

        let mut machine = StateMachine::new(store.clone());
        machine
            .confirm_payment_method("doc1", PaymentMethod::Cash, date(2026, 2, 1))
            .await
            .unwrap();
        machine.propose_move("doc1").await.unwrap();
        let updated = machine.apply_move("doc1", "m1", false).await.unwrap();

        assert_eq!(updated.state, ReconcileState::ConfirmedCash);
        // movement stays unconsumed
        let movement = store.get_movement("m1").await.unwrap().unwrap();
        assert!(movement.consumed_by.is_none());
    }

    #[tokio::test]
    async fn accepted_move_reissues_entry_and_reconciles() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;
        seed_movement(&mut store, "m1").await;

        let mut machine = StateMachine::new(store.clone());
        let confirmed = machine
            .confirm_payment_method("doc1", PaymentMethod::Cash, date(2026, 2, 1))
            .await
            .unwrap();
        machine.propose_move("doc1").await.unwrap();
        let updated = machine.apply_move("doc1", "m1", true).await.unwrap();

        assert_eq!(updated.state, ReconcileState::Reconciled);
        let old = store
            .get_movement(confirmed.provisional_entry_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(old.annulled);

        let reissued = store
            .get_movement(updated.provisional_entry_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reissued.account, SourceAccount::Bank);
    }

    #[tokio::test]
    async fn unlink_releases_movement_and_reopens_document() {
        let mut store = MemoryStore::new();
        seed_document(&mut store).await;
        seed_movement(&mut store, "m1").await;

        let mut machine = StateMachine::new(store.clone());
        machine.reconcile_with_movement("doc1", "m1").await.unwrap();
        let updated = machine.unlink_movement("doc1").await.unwrap();

        assert_eq!(updated.state, ReconcileState::PendingConfirmation);
        assert!(updated.matched_movement_id.is_none());
        let movement = store.get_movement("m1").await.unwrap().unwrap();
        assert!(movement.consumed_by.is_none());
        assert!(movement.consumed_at.is_none());
    }
}

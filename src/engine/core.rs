//! Engine facade tying the matcher, state machine, backlog and cascade
//! coordinator together behind one public API

use chrono::{NaiveDate, NaiveDateTime};
use tracing::info;

use crate::alias::AliasTable;
use crate::engine::cascade::CascadeCoordinator;
use crate::engine::pending::PendingManager;
use crate::engine::state::StateMachine;
use crate::matcher::Matcher;
use crate::traits::{DefaultDocumentValidator, DocumentValidator, RecordStore};
use crate::types::*;

/// Identity of one pass run, carried through its log lines
#[derive(Debug, Clone)]
pub struct PassContext {
    /// Lease token distinguishing this run from concurrent ones
    pub lease: String,
    /// When the pass snapshotted the store
    pub started_at: NaiveDateTime,
}

impl PassContext {
    pub fn new() -> Self {
        Self {
            lease: uuid::Uuid::new_v4().to_string(),
            started_at: chrono::Utc::now().naive_utc(),
        }
    }
}

impl Default for PassContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for the reconciliation engine
///
/// Wraps a [`RecordStore`] and exposes registration, the scheduled
/// pass, the user review actions and the dashboard. The storage handle
/// is cloned into each internal component; implementations are expected
/// to share underlying state across clones, the way a connection pool
/// or the in-memory store does.
pub struct ReconciliationEngine<S: RecordStore + Clone> {
    storage: S,
    matcher: Matcher,
    machine: StateMachine<S>,
    pending: PendingManager<S>,
    cascade: CascadeCoordinator<S>,
    validator: Box<dyn DocumentValidator>,
}

impl<S: RecordStore + Clone> ReconciliationEngine<S> {
    pub fn new(storage: S) -> Self {
        Self::with_matcher(storage, Matcher::default())
    }

    /// Build an engine with a custom validation policy; registrations
    /// and edits go through it instead of the default rules
    pub fn with_validator(storage: S, validator: Box<dyn DocumentValidator>) -> Self {
        let mut engine = Self::new(storage);
        engine.validator = validator;
        engine
    }

    /// Build an engine with a customized matcher configuration
    pub fn with_matcher(storage: S, matcher: Matcher) -> Self {
        Self {
            matcher,
            machine: StateMachine::new(storage.clone()),
            pending: PendingManager::new(storage.clone()),
            cascade: CascadeCoordinator::new(storage.clone()),
            validator: Box::new(DefaultDocumentValidator),
            storage,
        }
    }

    // --- registration ---

    /// Register a new payable document; it enters `PendingConfirmation`
    /// and is picked up by the next pass
    pub async fn register_document(&mut self, document: &PayableDocument) -> ReconcileResult<()> {
        self.validator.validate_document(document)?;
        if self.storage.get_document(&document.id).await?.is_some() {
            return Err(ReconcileError::Validation(format!(
                "Document '{}' already exists",
                document.id
            )));
        }
        self.storage.save_document(document).await
    }

    /// Register a single ledger movement
    pub async fn register_movement(&mut self, movement: &LedgerMovement) -> ReconcileResult<()> {
        if self.storage.get_movement(&movement.id).await?.is_some() {
            return Err(ReconcileError::Validation(format!(
                "Movement '{}' already exists",
                movement.id
            )));
        }
        self.storage.save_movement(movement).await
    }

    /// Import a statement batch; duplicate ids are skipped so re-importing
    /// the same batch is harmless
    pub async fn import_statement(
        &mut self,
        movements: &[LedgerMovement],
    ) -> ReconcileResult<usize> {
        let mut imported = 0;
        for movement in movements {
            if self.storage.get_movement(&movement.id).await?.is_none() {
                self.storage.save_movement(movement).await?;
                imported += 1;
            }
        }
        Ok(imported)
    }

    // --- the scheduled pass ---

    /// Run one two-phase reconciliation pass as of `today`
    pub async fn run_pass(&mut self, today: NaiveDate) -> ReconcileResult<PassReport> {
        let context = PassContext::new();
        info!(lease = %context.lease, %today, "pass started");
        let aliases = AliasTable::from_entries(self.storage.list_aliases().await?);
        let report = self.pending.run_pass(&self.matcher, &aliases, today).await?;
        info!(
            lease = %context.lease,
            examined = report.examined,
            reconciled = report.reconciled.len(),
            backlog_remaining = report.backlog_remaining,
            failures = report.failures.len(),
            "pass finished"
        );
        Ok(report)
    }

    // --- user actions ---

    /// Record the user's payment-method choice for a document
    pub async fn confirm_payment_method(
        &mut self,
        document_id: &str,
        method: PaymentMethod,
        payment_date: NaiveDate,
    ) -> ReconcileResult<PayableDocument> {
        self.machine
            .confirm_payment_method(document_id, method, payment_date)
            .await
    }

    /// User decision on a proposed account move
    pub async fn apply_move(
        &mut self,
        document_id: &str,
        movement_id: &str,
        accept: bool,
    ) -> ReconcileResult<PayableDocument> {
        self.machine.apply_move(document_id, movement_id, accept).await
    }

    /// User decision on an uncertain match
    ///
    /// Accepting also records the movement's description as a known
    /// variant of the document's counterparty, so the same noise string
    /// scores higher on future passes.
    pub async fn resolve_uncertain(
        &mut self,
        document_id: &str,
        movement_id: &str,
        accept: bool,
    ) -> ReconcileResult<PayableDocument> {
        let movement = self.storage.get_movement(movement_id).await?;
        let updated = self
            .machine
            .resolve_uncertain(document_id, movement_id, accept)
            .await?;

        if accept {
            if let Some(movement) = movement {
                let mut aliases = AliasTable::from_entries(self.storage.list_aliases().await?);
                let category = Self::category_for(&updated.kind);
                if let Some(entry) =
                    aliases.learn(&updated.counterparty, category, &movement.description)
                {
                    self.storage.save_alias(&entry).await?;
                    info!(
                        counterparty = %updated.counterparty,
                        "learned counterparty alias from confirmed match"
                    );
                }
            }
        }
        Ok(updated)
    }

    /// Exclude a document from automatic processing
    pub async fn lock(
        &mut self,
        document_id: &str,
        reason: &str,
    ) -> ReconcileResult<PayableDocument> {
        self.machine.lock(document_id, reason).await
    }

    /// Return a locked document to automatic processing
    pub async fn unlock(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        self.machine.unlock(document_id).await
    }

    /// Explicitly unmatch a reconciled document
    pub async fn unlink_movement(&mut self, document_id: &str) -> ReconcileResult<PayableDocument> {
        self.machine.unlink_movement(document_id).await
    }

    // --- edits and deletion, with cascade ---

    /// Apply field changes to a document and propagate them to its
    /// dependent records
    pub async fn update_document(
        &mut self,
        document_id: &str,
        change: &DocumentChange,
    ) -> ReconcileResult<PayableDocument> {
        let mut document = self
            .storage
            .get_document(document_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| ReconcileError::DocumentNotFound(document_id.to_string()))?;
        if document.locked {
            return Err(ReconcileError::InvalidTransition {
                from: document.state,
                action: "update".to_string(),
            });
        }
        if change.is_empty() {
            return Ok(document);
        }

        if let Some(amount) = &change.amount_due {
            document.amount_due = amount.clone();
        }
        if let Some(due_date) = change.due_date {
            document.due_date = due_date;
        }
        if let Some(counterparty) = &change.counterparty {
            document.counterparty = counterparty.clone();
        }
        document.updated_at = chrono::Utc::now().naive_utc();
        self.validator.validate_document(&document)?;

        self.storage.update_document(&document).await?;
        self.cascade.on_document_mutated(&document, change).await?;
        Ok(document)
    }

    /// Delete a document, tearing down its dependent records
    pub async fn delete_document(
        &mut self,
        document_id: &str,
        options: DeleteOptions,
    ) -> ReconcileResult<PayableDocument> {
        let document = self
            .storage
            .get_document(document_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| ReconcileError::DocumentNotFound(document_id.to_string()))?;
        self.cascade.on_document_deleted(&document, options).await
    }

    // --- read side ---

    /// Counts per state plus the actionable lists, for display
    ///
    /// Lists are ordered by due date then id so output is stable across
    /// calls.
    pub async fn get_dashboard(&self) -> ReconcileResult<Dashboard> {
        let documents = self.storage.list_documents(None).await?;
        let mut dashboard = Dashboard::default();
        for document in &documents {
            *dashboard.counts.entry(document.state).or_insert(0) += 1;
            let summary = DocumentSummary::from_document(document);
            match document.state {
                ReconcileState::NeedsReviewUncertainMatch => dashboard.uncertain.push(summary),
                ReconcileState::NeedsReviewMoveProposed => dashboard.proposed_moves.push(summary),
                ReconcileState::AnomalyNotInStatement => dashboard.anomalies.push(summary),
                _ => {}
            }
        }
        for list in [
            &mut dashboard.uncertain,
            &mut dashboard.proposed_moves,
            &mut dashboard.anomalies,
        ] {
            list.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        }
        Ok(dashboard)
    }

    /// Open pending operations in creation order
    pub async fn get_pending_backlog(&self) -> ReconcileResult<Vec<PendingOperation>> {
        self.storage.open_pending().await
    }

    /// Best-scoring candidate for a document against the current
    /// movement pool, without mutating anything
    pub async fn preview_match(
        &self,
        document_id: &str,
    ) -> ReconcileResult<crate::matcher::MatchResult> {
        let document = self
            .storage
            .get_document(document_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| ReconcileError::DocumentNotFound(document_id.to_string()))?;
        let movements = self.storage.list_movements(None).await?;
        let aliases = AliasTable::from_entries(self.storage.list_aliases().await?);
        Ok(self.matcher.find_best_match(&document, &movements, &aliases))
    }

    fn category_for(kind: &DocumentKind) -> CounterpartyCategory {
        match kind {
            DocumentKind::Invoice { .. } => CounterpartyCategory::Supplier,
            DocumentKind::TicketCharge { .. } | DocumentKind::TaxFormLine { .. } => {
                CounterpartyCategory::Authority
            }
            DocumentKind::CardCharge { .. } => CounterpartyCategory::CardCircuit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_store::MemoryStore;
    use bigdecimal::BigDecimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine() -> ReconciliationEngine<MemoryStore> {
        ReconciliationEngine::new(MemoryStore::new())
    }

    fn invoice(id: &str, amount: i64, counterparty: &str, issue: NaiveDate) -> PayableDocument {
        PayableDocument::new(
            id.to_string(),
            DocumentKind::Invoice {
                number: format!("{}-number", id),
            },
            counterparty.to_string(),
            BigDecimal::from(amount),
            issue,
            issue + chrono::Duration::days(30),
        )
    }

    fn bank_movement(id: &str, amount: i64, date: NaiveDate, description: &str) -> LedgerMovement {
        LedgerMovement::imported(
            id.to_string(),
            date,
            BigDecimal::from(-amount),
            description.to_string(),
            SourceAccount::Bank,
            "batch-1".to_string(),
        )
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut engine = engine();
        let document = invoice("doc1", 100, "Fornitore Srl", date(2026, 1, 10));
        engine.register_document(&document).await.unwrap();
        let err = engine.register_document(&document).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn custom_validator_gates_registration() {
        use crate::utils::validation::StrictDocumentValidator;

        let mut document = invoice("doc1", 100, "Fornitore Srl", date(2026, 1, 10));
        document.due_date = date(2026, 1, 1);

        // the default rules do not look at the date ordering
        let mut lenient = engine();
        lenient.register_document(&document).await.unwrap();

        let mut strict = ReconciliationEngine::with_validator(
            MemoryStore::new(),
            Box::new(StrictDocumentValidator),
        );
        let err = strict.register_document(&document).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn reimporting_a_statement_batch_is_harmless() {
        let mut engine = engine();
        let batch = vec![
            bank_movement("m1", 100, date(2026, 1, 12), "PAGAMENTO UNO"),
            bank_movement("m2", 200, date(2026, 1, 13), "PAGAMENTO DUE"),
        ];
        assert_eq!(engine.import_statement(&batch).await.unwrap(), 2);
        assert_eq!(engine.import_statement(&batch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn accepted_uncertain_match_learns_an_alias() {
        let store = MemoryStore::new();
        let mut engine = ReconciliationEngine::new(store.clone());
        engine
            .register_document(&invoice("doc1", 300, "Fornitore Srl", date(2026, 1, 15)))
            .await
            .unwrap();
        // exact amount and close date but an unrecognizable description
        engine
            .register_movement(&bank_movement(
                "m1",
                300,
                date(2026, 1, 16),
                "SDD CORE 0042 FRN",
            ))
            .await
            .unwrap();

        let report = engine.run_pass(date(2026, 1, 20)).await.unwrap();
        assert_eq!(report.uncertain, vec!["doc1".to_string()]);

        let updated = engine.resolve_uncertain("doc1", "m1", true).await.unwrap();
        assert_eq!(updated.state, ReconcileState::Reconciled);

        let aliases = AliasTable::from_entries(store.list_aliases().await.unwrap());
        assert_eq!(aliases.lookup("SDD CORE 0042 FRN"), Some("Fornitore Srl"));
    }

    #[tokio::test]
    async fn dashboard_lists_are_ordered_by_due_date_then_id() {
        let mut engine = engine();
        // no movements at all, both overdue: both become anomalies
        engine
            .register_document(&invoice("b-doc", 100, "Uno Srl", date(2026, 1, 20)))
            .await
            .unwrap();
        engine
            .register_document(&invoice("a-doc", 100, "Due Srl", date(2026, 1, 1)))
            .await
            .unwrap();
        engine
            .register_movement(&bank_movement("m1", 7, date(2026, 6, 1), "ALTRO"))
            .await
            .unwrap();
        engine.run_pass(date(2026, 6, 2)).await.unwrap();

        let dashboard = engine.get_dashboard().await.unwrap();
        assert_eq!(
            dashboard.counts.get(&ReconcileState::AnomalyNotInStatement),
            Some(&2)
        );
        let ids: Vec<&str> = dashboard.anomalies.iter().map(|s| s.id.as_str()).collect();
        // a-doc is due Jan 31, b-doc Feb 19
        assert_eq!(ids, vec!["a-doc", "b-doc"]);
    }

    #[tokio::test]
    async fn locked_document_rejects_updates() {
        let mut engine = engine();
        engine
            .register_document(&invoice("doc1", 100, "Fornitore Srl", date(2026, 1, 10)))
            .await
            .unwrap();
        engine.lock("doc1", "under dispute").await.unwrap();

        let err = engine
            .update_document(
                "doc1",
                &DocumentChange {
                    amount_due: Some(BigDecimal::from(150)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { .. }));
    }
}

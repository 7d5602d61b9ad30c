//! Pending-operations backlog and the two-phase reconciliation pass
//!
//! Phase 1 (completion) re-attempts every open pending operation in
//! creation order; only then does phase 2 (discovery) evaluate newly
//! arrived documents. The backlog is therefore never starved by a
//! continuously growing stream of new input. Errors on one item are
//! recorded in the pass report and never abort the remaining items.

use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::alias::AliasTable;
use crate::engine::state::StateMachine;
use crate::matcher::{MatchDecision, Matcher};
use crate::traits::RecordStore;
use crate::types::*;

/// What processing one document in a pass amounted to
#[derive(Debug, Clone, PartialEq)]
enum ItemOutcome {
    /// Linked to an imported movement
    Reconciled,
    /// Certain match in a different account; needs user review
    ProposedMove,
    /// Review-band match; needs user confirmation
    Uncertain,
    /// Due date elapsed, no candidate ever found
    Anomaly,
    /// Statement data does not yet cover the expected period
    Suspended { reason: String },
    /// Nothing to do this pass; stays queued
    Unresolved { kind: PendingKind, reason: String },
    /// Not subject to automatic processing (reconciled, locked, deleted)
    Settled,
}

/// Maintains the backlog and drives both phases of a pass
pub struct PendingManager<S: RecordStore + Clone> {
    storage: S,
    machine: StateMachine<S>,
}

impl<S: RecordStore + Clone> PendingManager<S> {
    pub fn new(storage: S) -> Self {
        Self {
            machine: StateMachine::new(storage.clone()),
            storage,
        }
    }

    /// Run one two-phase pass over the store's current snapshot
    pub async fn run_pass(
        &mut self,
        matcher: &Matcher,
        aliases: &AliasTable,
        today: NaiveDate,
    ) -> ReconcileResult<PassReport> {
        let mut report = PassReport::default();
        // movements are snapshotted upfront; consumption during the pass
        // is mirrored into the snapshot so later items never see a
        // movement that an earlier item already claimed
        let mut movements = self.storage.list_movements(None).await?;

        // Phase 1: completion
        let backlog = self.storage.open_pending().await?;
        let mut handled: HashSet<String> = HashSet::new();
        for mut operation in backlog {
            handled.insert(operation.document_id.clone());
            report.examined += 1;
            match self
                .process_document(&operation.document_id, matcher, aliases, &mut movements, today)
                .await
            {
                Ok(outcome) => {
                    self.settle_backlog_item(&mut operation, &outcome, &mut report)
                        .await?;
                    self.record_outcome(&operation.document_id, &outcome, &mut report);
                }
                Err(err) => {
                    warn!(document = %operation.document_id, error = %err, "backlog item failed");
                    operation.reason = err.to_string();
                    if matches!(err, ReconcileError::DocumentNotFound(_)) {
                        // the document is gone; retrying can never succeed
                        operation.resolved = true;
                        self.storage.update_pending(&operation).await?;
                        report.backlog_resolved += 1;
                    } else {
                        self.storage.update_pending(&operation).await?;
                        report.backlog_remaining += 1;
                    }
                    report.failures.push(PassFailure {
                        document_id: operation.document_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Phase 2: discovery
        let documents = self.storage.list_documents(None).await?;
        for document in &documents {
            if handled.contains(&document.id) {
                continue;
            }
            if !document.is_open() || !document.state.is_auto_processed() {
                continue;
            }
            report.examined += 1;
            match self
                .process_document(&document.id, matcher, aliases, &mut movements, today)
                .await
            {
                Ok(outcome) => {
                    if let Some(operation) = Self::backlog_entry_for(&document.id, &outcome) {
                        self.storage.save_pending(&operation).await?;
                        report.newly_pending += 1;
                    }
                    self.record_outcome(&document.id, &outcome, &mut report);
                }
                Err(err) => {
                    warn!(document = %document.id, error = %err, "discovery item failed");
                    if err.is_retryable() {
                        let operation = PendingOperation::new(
                            document.id.clone(),
                            PendingKind::AwaitingStatement,
                            err.to_string(),
                        );
                        self.storage.save_pending(&operation).await?;
                        report.newly_pending += 1;
                    }
                    report.failures.push(PassFailure {
                        document_id: document.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.finalize_report(&mut report).await?;
        Ok(report)
    }

    /// Evaluate one document against the movement snapshot and apply the
    /// resulting transition
    async fn process_document(
        &mut self,
        document_id: &str,
        matcher: &Matcher,
        aliases: &AliasTable,
        movements: &mut [LedgerMovement],
        today: NaiveDate,
    ) -> ReconcileResult<ItemOutcome> {
        let document = self
            .storage
            .get_document(document_id)
            .await?
            .ok_or_else(|| ReconcileError::DocumentNotFound(document_id.to_string()))?;

        if document.deleted || document.state.is_terminal() {
            return Ok(ItemOutcome::Settled);
        }
        if document.locked {
            return Ok(ItemOutcome::Unresolved {
                kind: PendingKind::AwaitingReview,
                reason: "document is locked".to_string(),
            });
        }
        if !document.state.is_auto_processed() {
            if document.state == ReconcileState::NeedsReviewUncertainMatch {
                // a statement imported after the flagging can still settle
                // the document outright when its reference code turns up;
                // anything short of a certain match stays with the user
                let result = matcher.find_best_match(&document, movements, aliases);
                if result.decision == MatchDecision::Accept && result.score >= 1.0 {
                    let movement_id = result
                        .movement_id
                        .clone()
                        .ok_or_else(|| ReconcileError::MovementNotFound(String::new()))?;
                    self.machine
                        .reconcile_with_movement(&document.id, &movement_id)
                        .await?;
                    Self::consume_in_snapshot(movements, &movement_id, &document.id);
                    debug!(document = %document.id, movement = %movement_id,
                           "certain match settled uncertain document");
                    return Ok(ItemOutcome::Reconciled);
                }
                return Ok(ItemOutcome::Uncertain);
            }
            return Ok(match document.state {
                ReconcileState::NeedsReviewMoveProposed => ItemOutcome::ProposedMove,
                _ => ItemOutcome::Unresolved {
                    kind: PendingKind::AwaitingReview,
                    reason: "awaiting manual intervention".to_string(),
                },
            });
        }

        let result = matcher.find_best_match(&document, movements, aliases);
        match result.decision {
            MatchDecision::Accept => {
                let movement_id = result.movement_id.as_deref().unwrap_or_default();
                let movement = movements
                    .iter()
                    .find(|m| m.id == movement_id)
                    .cloned()
                    .ok_or_else(|| ReconcileError::MovementNotFound(movement_id.to_string()))?;

                if document.state.is_confirmed()
                    && Self::confirmed_account(&document.state) != Some(movement.account)
                {
                    self.machine.propose_move(&document.id).await?;
                    return Ok(ItemOutcome::ProposedMove);
                }

                self.machine
                    .reconcile_with_movement(&document.id, &movement.id)
                    .await?;
                Self::consume_in_snapshot(movements, &movement.id, &document.id);
                debug!(document = %document.id, movement = %movement.id, score = result.score,
                       "pass reconciled document");
                Ok(ItemOutcome::Reconciled)
            }
            MatchDecision::Review => {
                if document.state != ReconcileState::NeedsReviewUncertainMatch {
                    self.machine.flag_uncertain(&document.id).await?;
                }
                Ok(ItemOutcome::Uncertain)
            }
            MatchDecision::NoMatch => {
                if document.due_date < today {
                    self.machine.mark_anomaly(&document.id).await?;
                    return Ok(ItemOutcome::Anomaly);
                }

                let account = Self::confirmed_account(&document.state)
                    .unwrap_or(Self::expected_account(&document));
                let coverage = self.storage.latest_statement_date(account).await?;
                let covered = coverage.is_some_and(|latest| latest >= document.issue_date);
                if !covered {
                    let reason = match coverage {
                        Some(latest) => format!(
                            "latest statement for {:?} is {}, before document date {}",
                            account, latest, document.issue_date
                        ),
                        None => format!("no statement imported yet for {:?}", account),
                    };
                    if document.state != ReconcileState::SuspendedAwaitingStatement {
                        self.machine.suspend(&document.id).await?;
                    }
                    return Ok(ItemOutcome::Suspended { reason });
                }

                Ok(ItemOutcome::Unresolved {
                    kind: PendingKind::AwaitingStatement,
                    reason: result.rationale,
                })
            }
        }
    }

    /// Update or resolve a phase-1 backlog entry according to the outcome
    async fn settle_backlog_item(
        &mut self,
        operation: &mut PendingOperation,
        outcome: &ItemOutcome,
        report: &mut PassReport,
    ) -> ReconcileResult<()> {
        match outcome {
            ItemOutcome::Reconciled | ItemOutcome::Anomaly | ItemOutcome::Settled => {
                operation.resolved = true;
                self.storage.update_pending(operation).await?;
                report.backlog_resolved += 1;
            }
            ItemOutcome::ProposedMove | ItemOutcome::Uncertain => {
                operation.kind = PendingKind::AwaitingReview;
                operation.reason = "awaiting user review".to_string();
                self.storage.update_pending(operation).await?;
                report.backlog_remaining += 1;
            }
            ItemOutcome::Suspended { reason } => {
                operation.kind = PendingKind::AwaitingStatement;
                operation.reason = reason.clone();
                self.storage.update_pending(operation).await?;
                report.backlog_remaining += 1;
            }
            ItemOutcome::Unresolved { kind, reason } => {
                operation.kind = *kind;
                operation.reason = reason.clone();
                self.storage.update_pending(operation).await?;
                report.backlog_remaining += 1;
            }
        }
        Ok(())
    }

    /// Backlog entry a phase-2 outcome warrants, if any
    fn backlog_entry_for(document_id: &str, outcome: &ItemOutcome) -> Option<PendingOperation> {
        match outcome {
            ItemOutcome::Reconciled | ItemOutcome::Anomaly | ItemOutcome::Settled => None,
            ItemOutcome::ProposedMove | ItemOutcome::Uncertain => Some(PendingOperation::new(
                document_id.to_string(),
                PendingKind::AwaitingReview,
                "awaiting user review".to_string(),
            )),
            ItemOutcome::Suspended { reason } => Some(PendingOperation::new(
                document_id.to_string(),
                PendingKind::AwaitingStatement,
                reason.clone(),
            )),
            ItemOutcome::Unresolved { kind, reason } => Some(PendingOperation::new(
                document_id.to_string(),
                *kind,
                reason.clone(),
            )),
        }
    }

    fn record_outcome(&self, document_id: &str, outcome: &ItemOutcome, report: &mut PassReport) {
        if *outcome == ItemOutcome::Reconciled {
            report.reconciled.push(document_id.to_string());
        }
    }

    /// Fill the snapshot-derived sections: state counts and the
    /// actionable lists, sorted by id for stable output
    async fn finalize_report(&self, report: &mut PassReport) -> ReconcileResult<()> {
        let documents = self.storage.list_documents(None).await?;
        for document in &documents {
            report.record_state(document.state);
            match document.state {
                ReconcileState::NeedsReviewMoveProposed => {
                    report.proposed_moves.push(document.id.clone())
                }
                ReconcileState::NeedsReviewUncertainMatch => {
                    report.uncertain.push(document.id.clone())
                }
                ReconcileState::AnomalyNotInStatement => report.anomalies.push(document.id.clone()),
                _ => {}
            }
        }
        report.proposed_moves.sort();
        report.uncertain.sort();
        report.anomalies.sort();
        report.reconciled.sort();
        Ok(())
    }

    fn confirmed_account(state: &ReconcileState) -> Option<SourceAccount> {
        match state {
            ReconcileState::ConfirmedCash => Some(SourceAccount::Cash),
            ReconcileState::ConfirmedBank => Some(SourceAccount::Bank),
            _ => None,
        }
    }

    /// Account a document's settlement is expected in before any
    /// confirmation happened
    fn expected_account(document: &PayableDocument) -> SourceAccount {
        match document.kind {
            DocumentKind::CardCharge { .. } => SourceAccount::Card,
            _ => SourceAccount::Bank,
        }
    }

    fn consume_in_snapshot(movements: &mut [LedgerMovement], movement_id: &str, document_id: &str) {
        if let Some(movement) = movements.iter_mut().find(|m| m.id == movement_id) {
            movement.consumed_by = Some(document_id.to_string());
        }
    }
}

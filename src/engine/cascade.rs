//! Cascade coordination for records that depend on a document
//!
//! Editing or deleting a payable document must keep its dependent
//! records consistent: provisional ledger lines, schedule-of-payments
//! entries, payment instruments and warehouse movements. The
//! coordinator enumerates those registrations, propagates field changes
//! to them, and gates deletion behind a double confirmation whenever
//! any of them exist.

use tracing::{debug, info};

use crate::traits::RecordStore;
use crate::types::*;

/// Dependent records currently registered against a document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownstreamRegistrations {
    /// Provisional or consumed ledger lines referencing the document
    pub ledger_lines: Vec<String>,
    /// Active schedule-of-payments entries
    pub schedule_entries: Vec<String>,
    /// Payment instruments linked to the document
    pub instruments: Vec<String>,
    /// Warehouse movements registered against the document
    pub warehouse_movements: Vec<String>,
}

impl DownstreamRegistrations {
    pub fn is_empty(&self) -> bool {
        self.ledger_lines.is_empty()
            && self.schedule_entries.is_empty()
            && self.instruments.is_empty()
            && self.warehouse_movements.is_empty()
    }

    /// Human-readable summary used in the deletion confirmation error
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.ledger_lines.is_empty() {
            parts.push(format!("{} ledger line(s)", self.ledger_lines.len()));
        }
        if !self.schedule_entries.is_empty() {
            parts.push(format!("{} schedule entry(ies)", self.schedule_entries.len()));
        }
        if !self.instruments.is_empty() {
            parts.push(format!("{} payment instrument(s)", self.instruments.len()));
        }
        if !self.warehouse_movements.is_empty() {
            parts.push(format!(
                "{} warehouse movement(s)",
                self.warehouse_movements.len()
            ));
        }
        parts.join(", ")
    }
}

/// Keeps dependent records consistent across document edits and deletes
pub struct CascadeCoordinator<S: RecordStore> {
    storage: S,
}

impl<S: RecordStore> CascadeCoordinator<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Enumerate every dependent record registered against a document
    pub async fn downstream_registrations(
        &self,
        document: &PayableDocument,
    ) -> ReconcileResult<DownstreamRegistrations> {
        let mut registrations = DownstreamRegistrations::default();

        if let Some(id) = &document.provisional_entry_id {
            if let Some(movement) = self.storage.get_movement(id).await? {
                if !movement.annulled {
                    registrations.ledger_lines.push(movement.id);
                }
            }
        }
        if let Some(id) = &document.matched_movement_id {
            registrations.ledger_lines.push(id.clone());
        }
        for entry in self.storage.list_schedule_entries(&document.id).await? {
            if !entry.cancelled {
                registrations.schedule_entries.push(entry.id);
            }
        }
        for instrument in self.storage.list_instruments(&document.id).await? {
            registrations.instruments.push(instrument.id);
        }
        for movement in self.storage.list_warehouse_movements(&document.id).await? {
            if !movement.annulled {
                registrations.warehouse_movements.push(movement.id);
            }
        }
        Ok(registrations)
    }

    /// Propagate a field change on a document to its dependent records
    ///
    /// The document passed in already carries the updated fields; the
    /// change describes which of them moved. Returns how many dependent
    /// records were rewritten.
    pub async fn on_document_mutated(
        &mut self,
        document: &PayableDocument,
        change: &DocumentChange,
    ) -> ReconcileResult<usize> {
        if change.is_empty() {
            return Ok(0);
        }
        let mut touched = 0;

        if let Some(id) = &document.provisional_entry_id {
            if let Some(mut movement) = self.storage.get_movement(id).await? {
                if !movement.annulled {
                    let mut dirty = false;
                    if let Some(amount) = &change.amount_due {
                        movement.amount = -amount.clone();
                        dirty = true;
                    }
                    if change.counterparty.is_some() {
                        movement.description =
                            format!("Provisional payment for {}", document.counterparty);
                        dirty = true;
                    }
                    if dirty {
                        movement.updated_at = chrono::Utc::now().naive_utc();
                        self.storage.update_movement(&movement).await?;
                        touched += 1;
                    }
                }
            }
        }

        for mut entry in self.storage.list_schedule_entries(&document.id).await? {
            if entry.cancelled {
                continue;
            }
            let mut dirty = false;
            if let Some(amount) = &change.amount_due {
                entry.amount = amount.clone();
                dirty = true;
            }
            if let Some(due_date) = change.due_date {
                entry.due_date = due_date;
                dirty = true;
            }
            if dirty {
                self.storage.update_schedule_entry(&entry).await?;
                touched += 1;
            }
        }

        debug!(document = %document.id, touched, "propagated document change");
        Ok(touched)
    }

    /// Tear down a document's dependent records and soft-delete the
    /// document itself
    ///
    /// When dependent records exist the caller must have collected a
    /// double confirmation (`options.confirmed`); otherwise the delete
    /// is refused with a validation error listing them. Provisional
    /// ledger lines are annulled with an audit note, or removed outright
    /// under `hard_delete`. A matched imported movement is released back
    /// to the candidate pool, never removed. Schedule entries are
    /// cancelled, warehouse movements annulled with an audit note, and
    /// instruments unlinked but preserved.
    pub async fn on_document_deleted(
        &mut self,
        document: &PayableDocument,
        options: DeleteOptions,
    ) -> ReconcileResult<PayableDocument> {
        if document.locked {
            return Err(ReconcileError::Validation(format!(
                "document {} is locked and cannot be deleted",
                document.id
            )));
        }
        let registrations = self.downstream_registrations(document).await?;
        if !registrations.is_empty() && !options.confirmed {
            return Err(ReconcileError::Validation(format!(
                "document {} has dependent records ({}); deletion requires confirmation",
                document.id,
                registrations.describe()
            )));
        }

        let audit_note = format!("document {} deleted", document.id);

        if let Some(id) = &document.provisional_entry_id {
            if options.hard_delete {
                self.storage.delete_movement(id).await?;
            } else if let Some(mut movement) = self.storage.get_movement(id).await? {
                if !movement.annulled {
                    movement.annulled = true;
                    movement.annulment_note = Some(audit_note.clone());
                    movement.updated_at = chrono::Utc::now().naive_utc();
                    self.storage.update_movement(&movement).await?;
                }
            }
        }
        if let Some(id) = &document.matched_movement_id {
            self.storage.release_movement(id).await?;
        }

        for mut entry in self.storage.list_schedule_entries(&document.id).await? {
            if !entry.cancelled {
                entry.cancelled = true;
                self.storage.update_schedule_entry(&entry).await?;
            }
        }
        for mut movement in self.storage.list_warehouse_movements(&document.id).await? {
            if !movement.annulled {
                movement.annulled = true;
                movement.audit_note = Some(audit_note.clone());
                self.storage.update_warehouse_movement(&movement).await?;
            }
        }
        for mut instrument in self.storage.list_instruments(&document.id).await? {
            instrument.document_id = None;
            self.storage.update_instrument(&instrument).await?;
        }

        let mut deleted = document.clone();
        deleted.deleted = true;
        deleted.matched_movement_id = None;
        deleted.provisional_entry_id = None;
        deleted.updated_at = chrono::Utc::now().naive_utc();
        self.storage.update_document(&deleted).await?;
        info!(document = %document.id, hard_delete = options.hard_delete, "document deleted");
        Ok(deleted)
    }
}

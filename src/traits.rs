//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::*;

/// Storage abstraction for the reconciliation engine
///
/// This trait allows the engine to work with any record store
/// (PostgreSQL, MySQL, SQLite, in-memory, etc.) by implementing these
/// methods. The two compare-and-set methods ([`claim_movement`] and
/// [`compare_and_swap_document`]) must be atomic: the check of the
/// precondition and the write have to happen under the same lock or
/// transaction, because they are the only mutations contended across
/// concurrent passes.
///
/// [`claim_movement`]: RecordStore::claim_movement
/// [`compare_and_swap_document`]: RecordStore::compare_and_swap_document
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Save a new payable document
    async fn save_document(&mut self, document: &PayableDocument) -> ReconcileResult<()>;

    /// Get a document by id
    async fn get_document(&self, document_id: &str) -> ReconcileResult<Option<PayableDocument>>;

    /// List all non-deleted documents, optionally filtered by state
    async fn list_documents(
        &self,
        state: Option<ReconcileState>,
    ) -> ReconcileResult<Vec<PayableDocument>>;

    /// Update a document unconditionally
    async fn update_document(&mut self, document: &PayableDocument) -> ReconcileResult<()>;

    /// Replace a document only if its stored state equals `expected`
    ///
    /// Fails with [`ReconcileError::Conflict`] when another actor changed
    /// the state since it was read.
    async fn compare_and_swap_document(
        &mut self,
        expected: ReconcileState,
        updated: &PayableDocument,
    ) -> ReconcileResult<()>;

    /// Save a new ledger movement
    async fn save_movement(&mut self, movement: &LedgerMovement) -> ReconcileResult<()>;

    /// Get a movement by id
    async fn get_movement(&self, movement_id: &str) -> ReconcileResult<Option<LedgerMovement>>;

    /// List movements, optionally filtered by account
    async fn list_movements(
        &self,
        account: Option<SourceAccount>,
    ) -> ReconcileResult<Vec<LedgerMovement>>;

    /// Update a movement unconditionally
    async fn update_movement(&mut self, movement: &LedgerMovement) -> ReconcileResult<()>;

    /// Atomically mark a movement consumed by a document
    ///
    /// Fails with [`ReconcileError::Conflict`] if the movement is already
    /// consumed or annulled; the movement is left untouched in that case.
    async fn claim_movement(
        &mut self,
        movement_id: &str,
        document_id: &str,
    ) -> ReconcileResult<LedgerMovement>;

    /// Clear the consumption marker on a movement
    async fn release_movement(&mut self, movement_id: &str) -> ReconcileResult<()>;

    /// Remove a movement outright; only the protected bulk-delete path
    /// may call this
    async fn delete_movement(&mut self, movement_id: &str) -> ReconcileResult<()>;

    /// Latest imported-statement date seen for an account, used to decide
    /// whether statement data covers a document's settlement window
    async fn latest_statement_date(
        &self,
        account: SourceAccount,
    ) -> ReconcileResult<Option<NaiveDate>>;

    /// Queue a pending operation
    async fn save_pending(&mut self, operation: &PendingOperation) -> ReconcileResult<()>;

    /// Open (unresolved) pending operations in creation order
    async fn open_pending(&self) -> ReconcileResult<Vec<PendingOperation>>;

    /// Update a pending operation (refresh reason, mark resolved)
    async fn update_pending(&mut self, operation: &PendingOperation) -> ReconcileResult<()>;

    /// Insert or replace an alias entry by canonical name
    async fn save_alias(&mut self, entry: &AliasEntry) -> ReconcileResult<()>;

    /// All alias entries
    async fn list_aliases(&self) -> ReconcileResult<Vec<AliasEntry>>;

    /// Save a schedule-of-payments entry
    async fn save_schedule_entry(&mut self, entry: &ScheduleEntry) -> ReconcileResult<()>;

    /// Schedule entries depending on a document
    async fn list_schedule_entries(
        &self,
        document_id: &str,
    ) -> ReconcileResult<Vec<ScheduleEntry>>;

    /// Update a schedule entry
    async fn update_schedule_entry(&mut self, entry: &ScheduleEntry) -> ReconcileResult<()>;

    /// Save a payment instrument
    async fn save_instrument(&mut self, instrument: &PaymentInstrument) -> ReconcileResult<()>;

    /// Instruments linked to a document
    async fn list_instruments(&self, document_id: &str)
        -> ReconcileResult<Vec<PaymentInstrument>>;

    /// Update a payment instrument
    async fn update_instrument(&mut self, instrument: &PaymentInstrument) -> ReconcileResult<()>;

    /// Save a warehouse movement
    async fn save_warehouse_movement(
        &mut self,
        movement: &WarehouseMovement,
    ) -> ReconcileResult<()>;

    /// Warehouse movements registered against a document
    async fn list_warehouse_movements(
        &self,
        document_id: &str,
    ) -> ReconcileResult<Vec<WarehouseMovement>>;

    /// Update a warehouse movement
    async fn update_warehouse_movement(
        &mut self,
        movement: &WarehouseMovement,
    ) -> ReconcileResult<()>;
}

/// Capability shared by everything the matcher can score
pub trait Reconcilable {
    /// Amount due
    fn amount(&self) -> &BigDecimal;

    /// Reference date matching windows are anchored on
    fn reference_date(&self) -> NaiveDate;

    /// Canonical counterparty name
    fn counterparty(&self) -> &str;

    /// Unique code embedded in the document, if it carries one
    fn embedded_code(&self) -> Option<&str>;
}

impl Reconcilable for PayableDocument {
    fn amount(&self) -> &BigDecimal {
        &self.amount_due
    }

    fn reference_date(&self) -> NaiveDate {
        self.issue_date
    }

    fn counterparty(&self) -> &str {
        &self.counterparty
    }

    fn embedded_code(&self) -> Option<&str> {
        match &self.kind {
            DocumentKind::Invoice { number } => Some(number),
            DocumentKind::TicketCharge { ticket_number } => Some(ticket_number),
            DocumentKind::TaxFormLine { slip_code, .. } => slip_code.as_deref(),
            DocumentKind::CardCharge { .. } => None,
        }
    }
}

/// Extracts the reference code the matcher searches movement descriptions
/// for. One extractor is registered per document kind, so new code formats
/// never touch the matching logic itself.
pub trait ReferenceCodeExtractor: Send + Sync {
    /// The code identifying this document in free text, normalized for
    /// containment search, or `None` when the document carries nothing
    /// distinctive enough
    fn extract(&self, document: &PayableDocument) -> Option<String>;
}

/// Strip everything but alphanumerics and uppercase, so codes survive the
/// spacing and punctuation noise of statement descriptions
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

static SLIP_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{12,18}$").unwrap());
static TICKET_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{6,}$").unwrap());

/// Extractor for payment-slip identifiers on tax-form lines
pub struct SlipCodeExtractor;

impl ReferenceCodeExtractor for SlipCodeExtractor {
    fn extract(&self, document: &PayableDocument) -> Option<String> {
        match &document.kind {
            DocumentKind::TaxFormLine {
                slip_code: Some(code),
                ..
            } => {
                let normalized = normalize_code(code);
                SLIP_CODE.is_match(&normalized).then_some(normalized)
            }
            _ => None,
        }
    }
}

/// Extractor for traffic-ticket numbers
pub struct TicketNumberExtractor;

impl ReferenceCodeExtractor for TicketNumberExtractor {
    fn extract(&self, document: &PayableDocument) -> Option<String> {
        match &document.kind {
            DocumentKind::TicketCharge { ticket_number } => {
                let normalized = normalize_code(ticket_number);
                TICKET_NUMBER.is_match(&normalized).then_some(normalized)
            }
            _ => None,
        }
    }
}

/// Extractor for invoice numbers
///
/// Short invoice numbers ("12", "2026/1") would match almost any
/// description, so only codes with at least six significant characters
/// count as unique.
pub struct InvoiceNumberExtractor;

impl ReferenceCodeExtractor for InvoiceNumberExtractor {
    fn extract(&self, document: &PayableDocument) -> Option<String> {
        match &document.kind {
            DocumentKind::Invoice { number } => {
                let normalized = normalize_code(number);
                (normalized.len() >= 6).then_some(normalized)
            }
            _ => None,
        }
    }
}

/// Trait for implementing custom document validation rules
pub trait DocumentValidator: Send + Sync {
    /// Validate a document before saving or transitioning
    fn validate_document(&self, document: &PayableDocument) -> ReconcileResult<()>;
}

/// Default document validator with basic rules
pub struct DefaultDocumentValidator;

impl DocumentValidator for DefaultDocumentValidator {
    fn validate_document(&self, document: &PayableDocument) -> ReconcileResult<()> {
        if document.id.trim().is_empty() {
            return Err(ReconcileError::Validation(
                "Document ID cannot be empty".to_string(),
            ));
        }

        if document.counterparty.trim().is_empty() {
            return Err(ReconcileError::Validation(
                "Counterparty cannot be empty".to_string(),
            ));
        }

        if document.amount_due <= BigDecimal::from(0) {
            return Err(ReconcileError::Validation(
                "Amount due must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tax_line(slip_code: Option<&str>) -> PayableDocument {
        PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::TaxFormLine {
                slip_code: slip_code.map(str::to_string),
                period: "2026-Q1".to_string(),
            },
            "Agenzia Entrate".to_string(),
            BigDecimal::from(250),
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
        )
    }

    #[test]
    fn slip_extractor_normalizes_and_validates() {
        let doc = tax_line(Some("1234 5678 9012 3456"));
        let code = SlipCodeExtractor.extract(&doc);
        assert_eq!(code.as_deref(), Some("1234567890123456"));

        let doc = tax_line(Some("too-short"));
        assert_eq!(SlipCodeExtractor.extract(&doc), None);

        let doc = tax_line(None);
        assert_eq!(SlipCodeExtractor.extract(&doc), None);
    }

    #[test]
    fn invoice_extractor_rejects_short_numbers() {
        let mut doc = tax_line(None);
        doc.kind = DocumentKind::Invoice {
            number: "2026/15".to_string(),
        };
        assert_eq!(InvoiceNumberExtractor.extract(&doc), Some("202615".to_string()));

        doc.kind = DocumentKind::Invoice {
            number: "15".to_string(),
        };
        assert_eq!(InvoiceNumberExtractor.extract(&doc), None);
    }

    #[test]
    fn default_validator_rejects_nonpositive_amount() {
        let mut doc = tax_line(None);
        doc.amount_due = BigDecimal::from(0);
        assert!(DefaultDocumentValidator.validate_document(&doc).is_err());
    }
}

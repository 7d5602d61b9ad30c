//! Validation utilities

use crate::traits::DocumentValidator;
use crate::types::*;
use bigdecimal::BigDecimal;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: &BigDecimal) -> ReconcileResult<()> {
    if *amount <= BigDecimal::from(0) {
        Err(ReconcileError::Validation(
            "Amount must be positive".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Validate that a record ID is valid
pub fn validate_record_id(record_id: &str) -> ReconcileResult<()> {
    if record_id.trim().is_empty() {
        return Err(ReconcileError::Validation(
            "Record ID cannot be empty".to_string(),
        ));
    }

    if record_id.len() > 64 {
        return Err(ReconcileError::Validation(
            "Record ID cannot exceed 64 characters".to_string(),
        ));
    }

    if !record_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ReconcileError::Validation(
            "Record ID can only contain alphanumeric characters, dashes, and underscores"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate that a counterparty name is valid
pub fn validate_counterparty(name: &str) -> ReconcileResult<()> {
    if name.trim().is_empty() {
        return Err(ReconcileError::Validation(
            "Counterparty name cannot be empty".to_string(),
        ));
    }

    if name.len() > 200 {
        return Err(ReconcileError::Validation(
            "Counterparty name cannot exceed 200 characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate a lock reason
pub fn validate_lock_reason(reason: &str) -> ReconcileResult<()> {
    if reason.trim().is_empty() {
        return Err(ReconcileError::Validation(
            "Lock reason cannot be empty".to_string(),
        ));
    }

    if reason.len() > 500 {
        return Err(ReconcileError::Validation(
            "Lock reason cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Strict document validator with detailed checks
pub struct StrictDocumentValidator;

impl DocumentValidator for StrictDocumentValidator {
    fn validate_document(&self, document: &PayableDocument) -> ReconcileResult<()> {
        validate_record_id(&document.id)?;
        validate_counterparty(&document.counterparty)?;
        validate_positive_amount(&document.amount_due)?;

        if document.due_date < document.issue_date {
            return Err(ReconcileError::Validation(format!(
                "Document '{}' due date precedes its issue date",
                document.id
            )));
        }

        document.check_link_consistency()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn record_id_rules() {
        assert!(validate_record_id("doc-2026_001").is_ok());
        assert!(validate_record_id("").is_err());
        assert!(validate_record_id("has spaces").is_err());
        assert!(validate_record_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn strict_validator_checks_date_order() {
        let mut document = PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::Invoice {
                number: "2026/1".to_string(),
            },
            "Fornitore Srl".to_string(),
            BigDecimal::from(100),
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        );
        assert!(StrictDocumentValidator.validate_document(&document).is_err());

        document.due_date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(StrictDocumentValidator.validate_document(&document).is_ok());
    }
}

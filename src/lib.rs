//! # Reconciliation Core
//!
//! A library for reconciling payable documents (invoices, traffic
//! tickets, tax-form lines, card charges) against imported bank and
//! cash statement movements.
//!
//! ## Features
//!
//! - **Fuzzy matching**: Weighted amount/name/date scoring with a
//!   reference-code shortcut and per-kind date windows
//! - **Document lifecycle**: A nine-state machine with compare-and-set
//!   transitions, so concurrent actors lose cleanly instead of
//!   overwriting each other
//! - **Two-phase passes**: A pending-operations backlog re-attempted
//!   before new documents are evaluated, so the backlog is never starved
//! - **Cascade coordination**: Document edits and deletions propagate to
//!   provisional ledger lines, schedules, instruments and warehouse
//!   movements
//! - **Alias learning**: Confirmed matches teach the matcher the noisy
//!   statement spellings of each counterparty
//! - **Storage abstraction**: Database-agnostic design with trait-based
//!   storage
//!
//! ## Quick Start
//!
//! ```rust
//! use reconciliation_core::{ReconciliationEngine, MemoryStore, PayableDocument, DocumentKind};
//! use bigdecimal::BigDecimal;
//! use chrono::NaiveDate;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let mut engine = ReconciliationEngine::new(MemoryStore::new());
//!     let document = PayableDocument::new(
//!         "inv-1".to_string(),
//!         DocumentKind::Invoice { number: "2026/001".to_string() },
//!         "Infocert Spa".to_string(),
//!         BigDecimal::from(122),
//!         NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
//!         NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
//!     );
//!     engine.register_document(&document).await.unwrap();
//!     let report = engine.run_pass(NaiveDate::from_ymd_opt(2026, 2, 10).unwrap()).await.unwrap();
//!     assert_eq!(report.examined, 1);
//! });
//! ```

pub mod alias;
pub mod engine;
pub mod matcher;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use alias::{normalize_name, AliasTable};
pub use engine::*;
pub use matcher::{MatchConfig, MatchDecision, MatchResult, Matcher};
pub use traits::*;
pub use types::*;
pub use utils::MemoryStore;

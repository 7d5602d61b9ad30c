//! In-memory record store implementation for testing and development

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::traits::RecordStore;
use crate::types::*;

/// In-memory store backing tests and development setups
///
/// Cloning shares the underlying maps, so one store can be handed to
/// several engine components. The compare-and-set methods hold the write
/// lock across the whole check-then-set, which is what makes them atomic
/// here; a database backend would use a conditional UPDATE instead.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<String, PayableDocument>>>,
    movements: Arc<RwLock<HashMap<String, LedgerMovement>>>,
    pending: Arc<RwLock<HashMap<String, PendingOperation>>>,
    aliases: Arc<RwLock<HashMap<String, AliasEntry>>>,
    schedule_entries: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
    instruments: Arc<RwLock<HashMap<String, PaymentInstrument>>>,
    warehouse_movements: Arc<RwLock<HashMap<String, WarehouseMovement>>>,
}

impl MemoryStore {
    /// Create a new memory store instance
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
            movements: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            aliases: Arc::new(RwLock::new(HashMap::new())),
            schedule_entries: Arc::new(RwLock::new(HashMap::new())),
            instruments: Arc::new(RwLock::new(HashMap::new())),
            warehouse_movements: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        self.documents.write().unwrap().clear();
        self.movements.write().unwrap().clear();
        self.pending.write().unwrap().clear();
        self.aliases.write().unwrap().clear();
        self.schedule_entries.write().unwrap().clear();
        self.instruments.write().unwrap().clear();
        self.warehouse_movements.write().unwrap().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save_document(&mut self, document: &PayableDocument) -> ReconcileResult<()> {
        self.documents
            .write()
            .unwrap()
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> ReconcileResult<Option<PayableDocument>> {
        Ok(self.documents.read().unwrap().get(document_id).cloned())
    }

    async fn list_documents(
        &self,
        state: Option<ReconcileState>,
    ) -> ReconcileResult<Vec<PayableDocument>> {
        let documents = self.documents.read().unwrap();
        let mut filtered: Vec<PayableDocument> = documents
            .values()
            .filter(|document| !document.deleted)
            .filter(|document| state.is_none_or(|s| document.state == s))
            .cloned()
            .collect();
        // stable order keeps pass results reproducible
        filtered.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filtered)
    }

    async fn update_document(&mut self, document: &PayableDocument) -> ReconcileResult<()> {
        let mut documents = self.documents.write().unwrap();
        if documents.contains_key(&document.id) {
            documents.insert(document.id.clone(), document.clone());
            Ok(())
        } else {
            Err(ReconcileError::DocumentNotFound(document.id.clone()))
        }
    }

    async fn compare_and_swap_document(
        &mut self,
        expected: ReconcileState,
        updated: &PayableDocument,
    ) -> ReconcileResult<()> {
        let mut documents = self.documents.write().unwrap();
        let current = documents
            .get(&updated.id)
            .ok_or_else(|| ReconcileError::DocumentNotFound(updated.id.clone()))?;
        if current.state != expected {
            return Err(ReconcileError::Conflict(format!(
                "document '{}' expected state {:?} but found {:?}",
                updated.id, expected, current.state
            )));
        }
        documents.insert(updated.id.clone(), updated.clone());
        Ok(())
    }

    async fn save_movement(&mut self, movement: &LedgerMovement) -> ReconcileResult<()> {
        self.movements
            .write()
            .unwrap()
            .insert(movement.id.clone(), movement.clone());
        Ok(())
    }

    async fn get_movement(&self, movement_id: &str) -> ReconcileResult<Option<LedgerMovement>> {
        Ok(self.movements.read().unwrap().get(movement_id).cloned())
    }

    async fn list_movements(
        &self,
        account: Option<SourceAccount>,
    ) -> ReconcileResult<Vec<LedgerMovement>> {
        let movements = self.movements.read().unwrap();
        let mut filtered: Vec<LedgerMovement> = movements
            .values()
            .filter(|movement| account.is_none_or(|a| movement.account == a))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filtered)
    }

    async fn update_movement(&mut self, movement: &LedgerMovement) -> ReconcileResult<()> {
        let mut movements = self.movements.write().unwrap();
        if movements.contains_key(&movement.id) {
            movements.insert(movement.id.clone(), movement.clone());
            Ok(())
        } else {
            Err(ReconcileError::MovementNotFound(movement.id.clone()))
        }
    }

    async fn claim_movement(
        &mut self,
        movement_id: &str,
        document_id: &str,
    ) -> ReconcileResult<LedgerMovement> {
        let mut movements = self.movements.write().unwrap();
        let movement = movements
            .get_mut(movement_id)
            .ok_or_else(|| ReconcileError::MovementNotFound(movement_id.to_string()))?;
        if let Some(consumer) = &movement.consumed_by {
            return Err(ReconcileError::Conflict(format!(
                "movement '{}' already consumed by document '{}'",
                movement_id, consumer
            )));
        }
        if movement.annulled {
            return Err(ReconcileError::Conflict(format!(
                "movement '{}' is annulled",
                movement_id
            )));
        }
        movement.consumed_by = Some(document_id.to_string());
        movement.consumed_at = Some(chrono::Utc::now().naive_utc());
        movement.updated_at = chrono::Utc::now().naive_utc();
        Ok(movement.clone())
    }

    async fn release_movement(&mut self, movement_id: &str) -> ReconcileResult<()> {
        let mut movements = self.movements.write().unwrap();
        let movement = movements
            .get_mut(movement_id)
            .ok_or_else(|| ReconcileError::MovementNotFound(movement_id.to_string()))?;
        movement.consumed_by = None;
        movement.consumed_at = None;
        movement.updated_at = chrono::Utc::now().naive_utc();
        Ok(())
    }

    async fn delete_movement(&mut self, movement_id: &str) -> ReconcileResult<()> {
        if self
            .movements
            .write()
            .unwrap()
            .remove(movement_id)
            .is_some()
        {
            Ok(())
        } else {
            Err(ReconcileError::MovementNotFound(movement_id.to_string()))
        }
    }

    async fn latest_statement_date(
        &self,
        account: SourceAccount,
    ) -> ReconcileResult<Option<NaiveDate>> {
        let movements = self.movements.read().unwrap();
        Ok(movements
            .values()
            .filter(|m| m.origin == MovementOrigin::Imported && m.account == account)
            .map(|m| m.date)
            .max())
    }

    async fn save_pending(&mut self, operation: &PendingOperation) -> ReconcileResult<()> {
        self.pending
            .write()
            .unwrap()
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    async fn open_pending(&self) -> ReconcileResult<Vec<PendingOperation>> {
        let pending = self.pending.read().unwrap();
        let mut open: Vec<PendingOperation> = pending
            .values()
            .filter(|op| !op.resolved)
            .cloned()
            .collect();
        // creation order; id as a tie-break for same-instant entries
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(open)
    }

    async fn update_pending(&mut self, operation: &PendingOperation) -> ReconcileResult<()> {
        let mut pending = self.pending.write().unwrap();
        if pending.contains_key(&operation.id) {
            pending.insert(operation.id.clone(), operation.clone());
            Ok(())
        } else {
            Err(ReconcileError::Storage(format!(
                "pending operation '{}' not found",
                operation.id
            )))
        }
    }

    async fn save_alias(&mut self, entry: &AliasEntry) -> ReconcileResult<()> {
        self.aliases
            .write()
            .unwrap()
            .insert(entry.canonical.clone(), entry.clone());
        Ok(())
    }

    async fn list_aliases(&self) -> ReconcileResult<Vec<AliasEntry>> {
        Ok(self.aliases.read().unwrap().values().cloned().collect())
    }

    async fn save_schedule_entry(&mut self, entry: &ScheduleEntry) -> ReconcileResult<()> {
        self.schedule_entries
            .write()
            .unwrap()
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn list_schedule_entries(
        &self,
        document_id: &str,
    ) -> ReconcileResult<Vec<ScheduleEntry>> {
        let entries = self.schedule_entries.read().unwrap();
        let mut filtered: Vec<ScheduleEntry> = entries
            .values()
            .filter(|entry| entry.document_id == document_id)
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filtered)
    }

    async fn update_schedule_entry(&mut self, entry: &ScheduleEntry) -> ReconcileResult<()> {
        let mut entries = self.schedule_entries.write().unwrap();
        if entries.contains_key(&entry.id) {
            entries.insert(entry.id.clone(), entry.clone());
            Ok(())
        } else {
            Err(ReconcileError::Storage(format!(
                "schedule entry '{}' not found",
                entry.id
            )))
        }
    }

    async fn save_instrument(&mut self, instrument: &PaymentInstrument) -> ReconcileResult<()> {
        self.instruments
            .write()
            .unwrap()
            .insert(instrument.id.clone(), instrument.clone());
        Ok(())
    }

    async fn list_instruments(
        &self,
        document_id: &str,
    ) -> ReconcileResult<Vec<PaymentInstrument>> {
        let instruments = self.instruments.read().unwrap();
        let mut filtered: Vec<PaymentInstrument> = instruments
            .values()
            .filter(|instrument| instrument.document_id.as_deref() == Some(document_id))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filtered)
    }

    async fn update_instrument(&mut self, instrument: &PaymentInstrument) -> ReconcileResult<()> {
        let mut instruments = self.instruments.write().unwrap();
        if instruments.contains_key(&instrument.id) {
            instruments.insert(instrument.id.clone(), instrument.clone());
            Ok(())
        } else {
            Err(ReconcileError::Storage(format!(
                "instrument '{}' not found",
                instrument.id
            )))
        }
    }

    async fn save_warehouse_movement(
        &mut self,
        movement: &WarehouseMovement,
    ) -> ReconcileResult<()> {
        self.warehouse_movements
            .write()
            .unwrap()
            .insert(movement.id.clone(), movement.clone());
        Ok(())
    }

    async fn list_warehouse_movements(
        &self,
        document_id: &str,
    ) -> ReconcileResult<Vec<WarehouseMovement>> {
        let movements = self.warehouse_movements.read().unwrap();
        let mut filtered: Vec<WarehouseMovement> = movements
            .values()
            .filter(|movement| movement.document_id == document_id)
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filtered)
    }

    async fn update_warehouse_movement(
        &mut self,
        movement: &WarehouseMovement,
    ) -> ReconcileResult<()> {
        let mut movements = self.warehouse_movements.write().unwrap();
        if movements.contains_key(&movement.id) {
            movements.insert(movement.id.clone(), movement.clone());
            Ok(())
        } else {
            Err(ReconcileError::Storage(format!(
                "warehouse movement '{}' not found",
                movement.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn claim_is_at_most_once() {
        let mut store = MemoryStore::new();
        let movement = LedgerMovement::imported(
            "m1".to_string(),
            date(2026, 2, 3),
            BigDecimal::from(-100),
            "PAGAMENTO".to_string(),
            SourceAccount::Bank,
            "batch-1".to_string(),
        );
        store.save_movement(&movement).await.unwrap();

        store.claim_movement("m1", "doc1").await.unwrap();
        let err = store.claim_movement("m1", "doc2").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));

        store.release_movement("m1").await.unwrap();
        store.claim_movement("m1", "doc2").await.unwrap();
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_state() {
        let mut store = MemoryStore::new();
        let document = PayableDocument::new(
            "doc1".to_string(),
            DocumentKind::CardCharge {
                circuit: "VISA".to_string(),
            },
            "Wirecard".to_string(),
            BigDecimal::from(50),
            date(2026, 1, 1),
            date(2026, 1, 31),
        );
        store.save_document(&document).await.unwrap();

        let mut updated = document.clone();
        updated.state = ReconcileState::ConfirmedBank;
        store
            .compare_and_swap_document(ReconcileState::PendingConfirmation, &updated)
            .await
            .unwrap();

        // second swap against the stale expected state fails
        let err = store
            .compare_and_swap_document(ReconcileState::PendingConfirmation, &updated)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)));
    }

    #[tokio::test]
    async fn open_pending_preserves_creation_order() {
        let mut store = MemoryStore::new();
        let mut first = PendingOperation::new(
            "doc1".to_string(),
            PendingKind::AwaitingStatement,
            "waiting".to_string(),
        );
        first.created_at = date(2026, 1, 1).and_hms_opt(9, 0, 0).unwrap();
        let mut second = PendingOperation::new(
            "doc2".to_string(),
            PendingKind::AwaitingReceipt,
            "waiting".to_string(),
        );
        second.created_at = date(2026, 1, 2).and_hms_opt(9, 0, 0).unwrap();
        store.save_pending(&second).await.unwrap();
        store.save_pending(&first).await.unwrap();

        let open = store.open_pending().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].document_id, "doc1");
        assert_eq!(open[1].document_id, "doc2");
    }

    #[tokio::test]
    async fn latest_statement_date_ignores_provisional_entries() {
        let mut store = MemoryStore::new();
        let imported = LedgerMovement::imported(
            "m1".to_string(),
            date(2026, 1, 31),
            BigDecimal::from(-10),
            "X".to_string(),
            SourceAccount::Bank,
            "batch-1".to_string(),
        );
        let provisional = LedgerMovement::new(
            "m2".to_string(),
            date(2026, 3, 1),
            BigDecimal::from(-10),
            "Y".to_string(),
            SourceAccount::Bank,
            MovementOrigin::Provisional,
        );
        store.save_movement(&imported).await.unwrap();
        store.save_movement(&provisional).await.unwrap();

        let latest = store.latest_statement_date(SourceAccount::Bank).await.unwrap();
        assert_eq!(latest, Some(date(2026, 1, 31)));
        let cash = store.latest_statement_date(SourceAccount::Cash).await.unwrap();
        assert_eq!(cash, None);
    }
}

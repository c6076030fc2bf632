//! Physical-inventory counting domain (event-sourced).
//!
//! Reconciles a frozen expected-stock snapshot against up to three blind
//! counts per unit, classifies serial-number discrepancies, and gates the
//! final adjustment export to an external ERP. Implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage); the one external
//! effect — the ERP hand-off — sits behind a trait in [`migration`].

pub mod discrepancy;
pub mod inventory;
pub mod ledger;
pub mod migration;
pub mod reconcile;
pub mod snapshot;
pub mod stage;

pub use discrepancy::{classify, Discrepancy, DiscrepancyStatus, DiscrepancyType};
pub use inventory::{
    CancelInventory, CloseStage, Inventory, InventoryCancelled, InventoryCommand, InventoryEvent,
    InventoryId, InventoryOpened, InventoryStatus, MarkUnitSkipped, OpenInventory, OpenStage,
    RecordErpMigration, RunClassification, SnapshotStore, SubmitCount,
};
pub use ledger::{CountLedger, CountReading, LedgerEntry, QuantityObservation, SerialObservation};
pub use migration::{
    build_adjustment_batch, execute_migration, migrate_permission, Adjustment, AdjustmentBatch,
    ErpAck, ErpClient, ErpError, MigrationError, MigrationLock, MigrationOutcome,
};
pub use reconcile::{reconcile_quantity, QuantityReconciliation, ResolvedQuantity, StageUsed};
pub use snapshot::{
    ExpectedQuantityLine, ExpectedSerial, FrozenSnapshot, LocationId, ProductId, SerialNumber,
    UnitKey,
};
pub use stage::CountStage;

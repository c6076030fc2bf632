//! ERP migration gate.
//!
//! The only external, non-idempotent effect in the engine: hand the final
//! adjustment batch to the ERP collaborator, and record the migration on the
//! inventory only once the collaborator acknowledges it. An ERP failure
//! leaves the inventory untouched and retryable; a successful migration is
//! strictly one-way.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocktake_auth::{authorize, AuthzError, Permission, Principal};
use stocktake_core::{Aggregate, DomainError, UserId};

use crate::inventory::{
    Inventory, InventoryCommand, InventoryEvent, InventoryId, InventoryStatus, RecordErpMigration,
};
use crate::snapshot::LocationId;

/// Permission required to request a migration.
pub fn migrate_permission() -> Permission {
    Permission::new("inventory.migrate")
}

/// One final-quantity correction for a divergent line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub product_code: String,
    pub location_id: LocationId,
    pub final_quantity: i64,
    pub inventory_code: String,
    /// Signed stock-value delta: divergence quantity × unit cost.
    pub value_delta: i64,
}

/// The opaque batch handed to the ERP collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentBatch {
    pub inventory_id: InventoryId,
    pub inventory_code: String,
    pub adjustments: Vec<Adjustment>,
}

/// The collaborator's acknowledgment — the only accepted proof of success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpAck {
    pub reference: String,
    pub acknowledged_at: DateTime<Utc>,
}

/// External collaborator failure. The migration flag is never set on these;
/// the operation is safely retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErpError {
    #[error("erp unreachable: {0}")]
    Unreachable(String),

    #[error("erp rejected batch: {0}")]
    Rejected(String),
}

/// Boundary to the external ERP system.
pub trait ErpClient {
    fn post_adjustments(&self, batch: &AdjustmentBatch) -> Result<ErpAck, ErpError>;
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Another migration attempt for the same inventory is in flight.
    #[error("migration already in flight for this inventory")]
    InFlight,

    #[error(transparent)]
    Erp(#[from] ErpError),
}

impl From<AuthzError> for MigrationError {
    fn from(_: AuthzError) -> Self {
        MigrationError::Domain(DomainError::Unauthorized)
    }
}

/// Per-inventory single-flight guard.
///
/// The gate's external effect is non-idempotent, so two concurrent attempts
/// for one inventory must not both reach the ERP; the loser aborts instead.
#[derive(Debug, Default)]
pub struct MigrationLock {
    in_flight: Mutex<HashSet<InventoryId>>,
}

impl MigrationLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, inventory_id: InventoryId) -> Option<MigrationGuard<'_>> {
        // The set stays consistent even if a holder panicked mid-update, so
        // recover from poisoning rather than aborting every later gate run.
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !in_flight.insert(inventory_id) {
            return None;
        }
        Some(MigrationGuard {
            lock: self,
            inventory_id,
        })
    }

    fn release(&self, inventory_id: InventoryId) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        in_flight.remove(&inventory_id);
    }
}

struct MigrationGuard<'a> {
    lock: &'a MigrationLock,
    inventory_id: InventoryId,
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.inventory_id);
    }
}

/// Result of a successful gate execution. The caller applies `events` to the
/// aggregate (and persists them); the flag flips only through that apply.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub events: Vec<InventoryEvent>,
    pub adjustment_count: usize,
    pub ack: ErpAck,
}

/// Build the adjustment batch for every divergent, reconciled quantity line.
pub fn build_adjustment_batch(inventory: &Inventory) -> AdjustmentBatch {
    let adjustments = inventory
        .divergent_lines()
        .into_iter()
        .map(|(line, resolved)| Adjustment {
            product_code: line.product_code.clone(),
            location_id: line.location_id,
            final_quantity: resolved.final_quantity,
            inventory_code: inventory.code().to_string(),
            value_delta: resolved.divergence_quantity * line.unit_cost,
        })
        .collect();

    AdjustmentBatch {
        inventory_id: inventory.id_typed(),
        inventory_code: inventory.code().to_string(),
        adjustments,
    }
}

/// Execute the migration gate for one inventory.
///
/// Preconditions, fail fast and in order: inventory closed; not already
/// migrated; actor authorized; no quantity line left `Incomplete`. Only after
/// the ERP acknowledges the batch are the recording events produced — a
/// partial or failed hand-off leaves `erp_migrated` false.
pub fn execute_migration<C: ErpClient>(
    inventory: &Inventory,
    principal: &Principal,
    erp: &C,
    lock: &MigrationLock,
    occurred_at: DateTime<Utc>,
) -> Result<MigrationOutcome, MigrationError> {
    let _guard = lock
        .acquire(inventory.id_typed())
        .ok_or(MigrationError::InFlight)?;

    // Precondition order is part of the contract: closed, not yet migrated,
    // actor eligible, reconciliation complete.
    if inventory.status() != InventoryStatus::Closed {
        return Err(DomainError::state(format!(
            "only a closed inventory can be migrated (inventory is {})",
            inventory.status()
        ))
        .into());
    }
    if inventory.erp_migrated() {
        return Err(DomainError::conflict("inventory already migrated to ERP").into());
    }
    authorize(principal, &migrate_permission())?;

    // Dry-run the recording command before anything external happens: it
    // re-checks the lifecycle preconditions and rejects while any quantity
    // line is still Incomplete.
    let command = InventoryCommand::RecordErpMigration(RecordErpMigration {
        tenant_id: principal.active_tenant_id,
        inventory_id: inventory.id_typed(),
        actor: UserId::from_uuid(*principal.principal_id.as_uuid()),
        occurred_at,
    });
    let events = inventory.handle(&command)?;

    let batch = build_adjustment_batch(inventory);
    tracing::info!(
        inventory = %inventory.id_typed(),
        adjustments = batch.adjustments.len(),
        "handing adjustment batch to erp"
    );

    let ack = erp.post_adjustments(&batch)?;

    tracing::info!(
        inventory = %inventory.id_typed(),
        reference = %ack.reference,
        adjustments = batch.adjustments.len(),
        "erp acknowledged adjustment batch"
    );

    Ok(MigrationOutcome {
        events,
        adjustment_count: batch.adjustments.len(),
        ack,
    })
}

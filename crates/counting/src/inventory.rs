use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, TenantId, UserId};
use stocktake_events::Event;

use crate::discrepancy::{classify, Discrepancy, DiscrepancyStatus};
use crate::ledger::{CountLedger, CountReading, LedgerEntry, QuantityObservation, SerialObservation};
use crate::reconcile::{reconcile_quantity, requires_third_count, QuantityReconciliation, ResolvedQuantity};
use crate::snapshot::{ExpectedQuantityLine, ExpectedSerial, FrozenSnapshot, UnitKey};
use crate::stage::CountStage;

/// Inventory run identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryId(pub AggregateId);

impl InventoryId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InventoryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Read-only accessor to the frozen snapshot store (external collaborator).
///
/// The store captures expected stock when an inventory is frozen; the engine
/// never writes through this boundary.
pub trait SnapshotStore {
    fn snapshot(&self, inventory_id: InventoryId) -> DomainResult<FrozenSnapshot>;
}

/// Inventory lifecycle status.
///
/// Closing the second count derives its successor immediately (either a third
/// count is required or counting is done), so the transient closed-count-2 /
/// closed-count-3 readings never rest as observable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    Open,
    Count1Open,
    Count1Closed,
    Count2Open,
    Count3Required,
    Count3Open,
    Closed,
    Cancelled,
}

impl InventoryStatus {
    /// The counting stage currently accepting submissions, if any.
    pub fn open_stage(self) -> Option<CountStage> {
        match self {
            InventoryStatus::Count1Open => Some(CountStage::First),
            InventoryStatus::Count2Open => Some(CountStage::Second),
            InventoryStatus::Count3Open => Some(CountStage::Third),
            _ => None,
        }
    }

    /// Whether the second count has closed (audit observations become legal).
    pub fn second_count_closed(self) -> bool {
        matches!(
            self,
            InventoryStatus::Count3Required | InventoryStatus::Count3Open | InventoryStatus::Closed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InventoryStatus::Closed | InventoryStatus::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            InventoryStatus::Open => "open",
            InventoryStatus::Count1Open => "count1_open",
            InventoryStatus::Count1Closed => "count1_closed",
            InventoryStatus::Count2Open => "count2_open",
            InventoryStatus::Count3Required => "count3_required",
            InventoryStatus::Count3Open => "count3_open",
            InventoryStatus::Closed => "closed",
            InventoryStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for InventoryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Aggregate root: a physical-inventory run.
///
/// Owns the frozen snapshot, the count ledger, the third-count assignment
/// set, and (after classification) the materialized discrepancy set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    id: InventoryId,
    tenant_id: Option<TenantId>,
    code: String,
    status: InventoryStatus,
    snapshot: FrozenSnapshot,
    ledger: CountLedger,
    third_count_units: BTreeSet<UnitKey>,
    discrepancies: Vec<Discrepancy>,
    cancel_reason: Option<String>,
    erp_migrated: bool,
    version: u64,
    created: bool,
}

impl Inventory {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InventoryId) -> Self {
        Self {
            id,
            tenant_id: None,
            code: String::new(),
            status: InventoryStatus::Open,
            snapshot: FrozenSnapshot::empty(),
            ledger: CountLedger::new(),
            third_count_units: BTreeSet::new(),
            discrepancies: Vec::new(),
            cancel_reason: None,
            erp_migrated: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> InventoryStatus {
        self.status
    }

    pub fn snapshot(&self) -> &FrozenSnapshot {
        &self.snapshot
    }

    pub fn ledger(&self) -> &CountLedger {
        &self.ledger
    }

    pub fn third_count_units(&self) -> &BTreeSet<UnitKey> {
        &self.third_count_units
    }

    pub fn discrepancies(&self) -> &[Discrepancy] {
        &self.discrepancies
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn erp_migrated(&self) -> bool {
        self.erp_migrated
    }

    /// Reconcile one quantity line against the ledger.
    ///
    /// `None` when the rule cannot run yet (a first or second count is
    /// missing or the unit was skipped); otherwise the rule's result,
    /// including `Incomplete`.
    pub fn reconcile_line(&self, line: &ExpectedQuantityLine) -> Option<QuantityReconciliation> {
        let unit = line.unit_key();
        let count1 = self.ledger.quantity(&unit, CountStage::First)?;
        let count2 = self.ledger.quantity(&unit, CountStage::Second)?;
        let count3 = self.ledger.quantity(&unit, CountStage::Third);
        Some(reconcile_quantity(line.expected_quantity, count1, count2, count3))
    }

    /// Quantity units currently stuck in the `Incomplete` state (third count
    /// mandatory but absent).
    pub fn incomplete_units(&self) -> Vec<UnitKey> {
        self.snapshot
            .quantity_lines()
            .filter(|line| {
                matches!(
                    self.reconcile_line(line),
                    Some(QuantityReconciliation::Incomplete)
                )
            })
            .map(ExpectedQuantityLine::unit_key)
            .collect()
    }

    /// Every divergent, fully reconciled quantity line with its resolution.
    pub fn divergent_lines(&self) -> Vec<(&ExpectedQuantityLine, ResolvedQuantity)> {
        self.snapshot
            .quantity_lines()
            .filter_map(|line| {
                let resolved = self.reconcile_line(line)?.resolved()?.clone();
                resolved.divergent.then_some((line, resolved))
            })
            .collect()
    }

    /// Units assigned to a lifecycle stage. Stages 1 and 2 cover every
    /// snapshot unit; stage 3 covers only the disagreement set computed when
    /// stage 2 closed; the audit pass assigns nothing.
    pub fn assigned_units(&self, stage: CountStage) -> Vec<UnitKey> {
        match stage {
            CountStage::First | CountStage::Second => self.snapshot.unit_keys().collect(),
            CountStage::Third => self.third_count_units.iter().cloned().collect(),
            CountStage::Audit => Vec::new(),
        }
    }
}

impl AggregateRoot for Inventory {
    type Id = InventoryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenInventory (freezes the snapshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInventory {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub code: String,
    pub snapshot: FrozenSnapshot,
    pub occurred_at: DateTime<Utc>,
}

impl OpenInventory {
    /// Build the opening command by pulling the freeze-time snapshot from
    /// the store. Store failures (no capture for this inventory) propagate.
    pub fn from_store<S: SnapshotStore>(
        store: &S,
        tenant_id: TenantId,
        inventory_id: InventoryId,
        code: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        Ok(Self {
            tenant_id,
            inventory_id,
            code: code.into(),
            snapshot: store.snapshot(inventory_id)?,
            occurred_at,
        })
    }
}

/// Command: OpenStage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenStage {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub stage: CountStage,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SubmitCount (single-cell upsert keyed by unit + stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCount {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub unit: UnitKey,
    pub stage: CountStage,
    pub reading: CountReading,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkUnitSkipped (explicit not-applicable marker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkUnitSkipped {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub unit: UnitKey,
    pub stage: CountStage,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CloseStage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseStage {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub stage: CountStage,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInventory (terminal, requires a reason).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInventory {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RunClassification (rebuilds the discrepancy set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunClassification {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordErpMigration (issued by the migration gate after the ERP
/// acknowledged the adjustment batch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordErpMigration {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    OpenInventory(OpenInventory),
    OpenStage(OpenStage),
    SubmitCount(SubmitCount),
    MarkUnitSkipped(MarkUnitSkipped),
    CloseStage(CloseStage),
    CancelInventory(CancelInventory),
    RunClassification(RunClassification),
    RecordErpMigration(RecordErpMigration),
}

/// Event: InventoryOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryOpened {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub code: String,
    pub snapshot: FrozenSnapshot,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StageOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOpened {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub stage: CountStage,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountSubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountSubmitted {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub unit: UnitKey,
    pub stage: CountStage,
    pub reading: CountReading,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitSkipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSkipped {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub unit: UnitKey,
    pub stage: CountStage,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StageClosed. Closing the second count carries the derived
/// third-count decision so `apply` stays a pure replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageClosed {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub stage: CountStage,
    pub requires_third_count: bool,
    pub third_count_units: Vec<UnitKey>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InventoryCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryCancelled {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DiscrepanciesClassified. Carries the full rebuilt set; applying it
/// replaces the prior set wholesale (the delete-then-reinsert transaction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepanciesClassified {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub discrepancies: Vec<Discrepancy>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ErpMigrationRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErpMigrationRecorded {
    pub tenant_id: TenantId,
    pub inventory_id: InventoryId,
    pub actor: UserId,
    pub adjustment_count: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    InventoryOpened(InventoryOpened),
    StageOpened(StageOpened),
    CountSubmitted(CountSubmitted),
    UnitSkipped(UnitSkipped),
    StageClosed(StageClosed),
    InventoryCancelled(InventoryCancelled),
    DiscrepanciesClassified(DiscrepanciesClassified),
    ErpMigrationRecorded(ErpMigrationRecorded),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::InventoryOpened(_) => "counting.inventory.opened",
            InventoryEvent::StageOpened(_) => "counting.inventory.stage_opened",
            InventoryEvent::CountSubmitted(_) => "counting.inventory.count_submitted",
            InventoryEvent::UnitSkipped(_) => "counting.inventory.unit_skipped",
            InventoryEvent::StageClosed(_) => "counting.inventory.stage_closed",
            InventoryEvent::InventoryCancelled(_) => "counting.inventory.cancelled",
            InventoryEvent::DiscrepanciesClassified(_) => {
                "counting.inventory.discrepancies_classified"
            }
            InventoryEvent::ErpMigrationRecorded(_) => "counting.inventory.erp_migration_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::InventoryOpened(e) => e.occurred_at,
            InventoryEvent::StageOpened(e) => e.occurred_at,
            InventoryEvent::CountSubmitted(e) => e.occurred_at,
            InventoryEvent::UnitSkipped(e) => e.occurred_at,
            InventoryEvent::StageClosed(e) => e.occurred_at,
            InventoryEvent::InventoryCancelled(e) => e.occurred_at,
            InventoryEvent::DiscrepanciesClassified(e) => e.occurred_at,
            InventoryEvent::ErpMigrationRecorded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Inventory {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::InventoryOpened(e) => {
                self.id = e.inventory_id;
                self.tenant_id = Some(e.tenant_id);
                self.code = e.code.clone();
                self.status = InventoryStatus::Open;
                self.snapshot = e.snapshot.clone();
                self.ledger = CountLedger::new();
                self.third_count_units.clear();
                self.discrepancies.clear();
                self.cancel_reason = None;
                self.erp_migrated = false;
                self.created = true;
            }
            InventoryEvent::StageOpened(e) => {
                self.status = match e.stage {
                    CountStage::First => InventoryStatus::Count1Open,
                    CountStage::Second => InventoryStatus::Count2Open,
                    CountStage::Third => InventoryStatus::Count3Open,
                    CountStage::Audit => self.status,
                };
            }
            InventoryEvent::CountSubmitted(e) => {
                let entry = match &e.reading {
                    CountReading::Quantity(quantity) => {
                        LedgerEntry::Quantity(QuantityObservation {
                            quantity: *quantity,
                            actor: e.actor,
                            recorded_at: e.occurred_at,
                        })
                    }
                    CountReading::Serial {
                        found,
                        found_location,
                    } => LedgerEntry::Serial(SerialObservation {
                        found: *found,
                        found_location: *found_location,
                        actor: e.actor,
                        recorded_at: e.occurred_at,
                    }),
                };
                self.ledger.record(e.unit.clone(), e.stage, entry);
            }
            InventoryEvent::UnitSkipped(e) => {
                self.ledger.record(
                    e.unit.clone(),
                    e.stage,
                    LedgerEntry::Skipped {
                        actor: e.actor,
                        recorded_at: e.occurred_at,
                    },
                );
            }
            InventoryEvent::StageClosed(e) => {
                self.status = match e.stage {
                    CountStage::First => InventoryStatus::Count1Closed,
                    CountStage::Second => {
                        if e.requires_third_count {
                            self.third_count_units = e.third_count_units.iter().cloned().collect();
                            InventoryStatus::Count3Required
                        } else {
                            InventoryStatus::Closed
                        }
                    }
                    CountStage::Third => InventoryStatus::Closed,
                    CountStage::Audit => self.status,
                };
            }
            InventoryEvent::InventoryCancelled(e) => {
                self.status = InventoryStatus::Cancelled;
                self.cancel_reason = Some(e.reason.clone());
            }
            InventoryEvent::DiscrepanciesClassified(e) => {
                // Replace wholesale: the set is a materialized view.
                self.discrepancies = e.discrepancies.clone();
            }
            InventoryEvent::ErpMigrationRecorded(_) => {
                self.erp_migrated = true;
                for discrepancy in &mut self.discrepancies {
                    discrepancy.status = DiscrepancyStatus::Migrated;
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::OpenInventory(cmd) => self.handle_open(cmd),
            InventoryCommand::OpenStage(cmd) => self.handle_open_stage(cmd),
            InventoryCommand::SubmitCount(cmd) => self.handle_submit(cmd),
            InventoryCommand::MarkUnitSkipped(cmd) => self.handle_skip(cmd),
            InventoryCommand::CloseStage(cmd) => self.handle_close_stage(cmd),
            InventoryCommand::CancelInventory(cmd) => self.handle_cancel(cmd),
            InventoryCommand::RunClassification(cmd) => self.handle_classify(cmd),
            InventoryCommand::RecordErpMigration(cmd) => self.handle_record_migration(cmd),
        }
    }
}

impl Inventory {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_inventory_id(&self, inventory_id: InventoryId) -> Result<(), DomainError> {
        if self.id != inventory_id {
            return Err(DomainError::invariant("inventory_id mismatch"));
        }
        Ok(())
    }

    fn ensure_not_cancelled(&self) -> Result<(), DomainError> {
        if self.status == InventoryStatus::Cancelled {
            return Err(DomainError::state("inventory is cancelled"));
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenInventory) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("inventory already exists"));
        }
        if cmd.code.trim().is_empty() {
            return Err(DomainError::validation("inventory code cannot be empty"));
        }
        if cmd.snapshot.is_empty() {
            return Err(DomainError::validation(
                "cannot open an inventory over an empty snapshot",
            ));
        }

        Ok(vec![InventoryEvent::InventoryOpened(InventoryOpened {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            code: cmd.code.clone(),
            snapshot: cmd.snapshot.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_open_stage(&self, cmd: &OpenStage) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;
        self.ensure_not_cancelled()?;

        let legal = matches!(
            (self.status, cmd.stage),
            (InventoryStatus::Open, CountStage::First)
                | (InventoryStatus::Count1Closed, CountStage::Second)
                | (InventoryStatus::Count3Required, CountStage::Third)
        );
        if !legal {
            return Err(DomainError::state(format!(
                "cannot open {} while inventory is {}",
                cmd.stage, self.status
            )));
        }

        Ok(vec![InventoryEvent::StageOpened(StageOpened {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            stage: cmd.stage,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn ensure_stage_accepts(&self, unit: &UnitKey, stage: CountStage) -> Result<(), DomainError> {
        if stage == CountStage::Audit {
            if !self.status.second_count_closed() {
                return Err(DomainError::state(
                    "audit observations are only accepted once the second count has closed",
                ));
            }
            return Ok(());
        }

        if self.status.open_stage() != Some(stage) {
            return Err(DomainError::state(format!(
                "{} is not open (inventory is {})",
                stage, self.status
            )));
        }
        if stage == CountStage::Third && !self.third_count_units.contains(unit) {
            return Err(DomainError::state(format!(
                "unit {unit} is not assigned to the third count"
            )));
        }
        Ok(())
    }

    fn validate_reading(&self, unit: &UnitKey, reading: &CountReading) -> Result<(), DomainError> {
        match (unit, reading) {
            (UnitKey::Quantity { .. }, CountReading::Quantity(quantity)) => {
                if *quantity < 0 {
                    return Err(DomainError::validation("count cannot be negative"));
                }
                Ok(())
            }
            (UnitKey::Quantity { .. }, CountReading::Serial { .. }) => Err(
                DomainError::validation("serial reading for a quantity-tracked unit"),
            ),
            (UnitKey::Serial(_), CountReading::Quantity(_)) => Err(DomainError::validation(
                "quantity reading for a serialized unit",
            )),
            (UnitKey::Serial(_), CountReading::Serial {
                found,
                found_location,
            }) => {
                if *found && found_location.is_none() {
                    return Err(DomainError::validation(
                        "a found serial must name the location it was found at",
                    ));
                }
                if !*found && found_location.is_some() {
                    return Err(DomainError::validation(
                        "a not-found serial cannot carry a location",
                    ));
                }
                Ok(())
            }
        }
    }

    fn handle_submit(&self, cmd: &SubmitCount) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;
        self.ensure_not_cancelled()?;

        if !self.snapshot.contains_unit(&cmd.unit) {
            return Err(DomainError::validation(format!(
                "unknown unit {}",
                cmd.unit
            )));
        }
        self.ensure_stage_accepts(&cmd.unit, cmd.stage)?;
        self.validate_reading(&cmd.unit, &cmd.reading)?;

        Ok(vec![InventoryEvent::CountSubmitted(CountSubmitted {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            unit: cmd.unit.clone(),
            stage: cmd.stage,
            reading: cmd.reading.clone(),
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_skip(&self, cmd: &MarkUnitSkipped) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;
        self.ensure_not_cancelled()?;

        if cmd.stage == CountStage::Audit {
            return Err(DomainError::validation("the audit pass cannot be skipped"));
        }
        if cmd.stage == CountStage::Third {
            // A mandatory third count is exactly what resolves Incomplete;
            // skipping it would leave the stage unclosable by design intent.
            return Err(DomainError::state("the third count cannot be skipped"));
        }
        if !self.snapshot.contains_unit(&cmd.unit) {
            return Err(DomainError::validation(format!(
                "unknown unit {}",
                cmd.unit
            )));
        }
        self.ensure_stage_accepts(&cmd.unit, cmd.stage)?;

        Ok(vec![InventoryEvent::UnitSkipped(UnitSkipped {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            unit: cmd.unit.clone(),
            stage: cmd.stage,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_close_stage(&self, cmd: &CloseStage) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;
        self.ensure_not_cancelled()?;

        if cmd.stage == CountStage::Audit {
            return Err(DomainError::state("the audit pass is never opened or closed"));
        }
        if self.status.open_stage() != Some(cmd.stage) {
            return Err(DomainError::state(format!(
                "cannot close {}: inventory is {}",
                cmd.stage, self.status
            )));
        }

        let unresolved = self
            .ledger
            .unresolved_units(self.assigned_units(cmd.stage), cmd.stage);
        if !unresolved.is_empty() {
            return Err(DomainError::state(format!(
                "cannot close {}: unresolved units: {}",
                cmd.stage,
                join_units(&unresolved)
            )));
        }

        let (requires_third, third_units) = match cmd.stage {
            CountStage::Second => {
                let units = self.third_count_candidates();
                (!units.is_empty(), units)
            }
            _ => (false, Vec::new()),
        };

        if cmd.stage == CountStage::Third {
            // Skip markers are rejected for stage 3 at submission, so every
            // assigned unit holds a real observation by the guard above.
            let still_incomplete = self.incomplete_units();
            if !still_incomplete.is_empty() {
                return Err(DomainError::state(format!(
                    "cannot close {}: third count missing for: {}",
                    cmd.stage,
                    join_units(&still_incomplete)
                )));
            }
        }

        tracing::info!(
            inventory = %self.id,
            stage = %cmd.stage,
            requires_third_count = requires_third,
            "closing count stage"
        );

        Ok(vec![InventoryEvent::StageClosed(StageClosed {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            stage: cmd.stage,
            requires_third_count: requires_third,
            third_count_units: third_units,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Units whose first two counts disagree with each other and with the
    /// snapshot, forcing a third count. Quantity lines follow the
    /// reconciliation rule; serials follow its presence equivalent.
    fn third_count_candidates(&self) -> Vec<UnitKey> {
        let mut units: Vec<UnitKey> = self
            .snapshot
            .quantity_lines()
            .filter(|line| {
                let unit = line.unit_key();
                match (
                    self.ledger.quantity(&unit, CountStage::First),
                    self.ledger.quantity(&unit, CountStage::Second),
                ) {
                    (Some(c1), Some(c2)) => requires_third_count(line.expected_quantity, c1, c2),
                    _ => false,
                }
            })
            .map(ExpectedQuantityLine::unit_key)
            .collect();

        units.extend(
            self.snapshot
                .serials()
                .filter(|expected| self.serial_needs_third_count(expected))
                .map(ExpectedSerial::unit_key),
        );

        units
    }

    /// The serial equivalent of the three-way quantity disagreement: the two
    /// stage readings disagree and neither matches the snapshot expectation.
    /// A reading matches the snapshot when it reports the serial found at its
    /// expected location (or confirms absence for a not-expected serial), so
    /// a split where one stage saw the item where it belongs settles without
    /// a third count.
    fn serial_needs_third_count(&self, expected: &ExpectedSerial) -> bool {
        let (Some(first), Some(second)) = (
            self.ledger.serial_observation(&expected.serial, CountStage::First),
            self.ledger.serial_observation(&expected.serial, CountStage::Second),
        ) else {
            return false;
        };

        let matches_snapshot = |obs: &SerialObservation| {
            if expected.expected_present {
                obs.found && obs.found_location == Some(expected.expected_location)
            } else {
                !obs.found
            }
        };

        let disagree = (first.found, first.found_location) != (second.found, second.found_location);
        disagree && !matches_snapshot(first) && !matches_snapshot(second)
    }

    fn handle_cancel(&self, cmd: &CancelInventory) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;

        if self.status == InventoryStatus::Closed {
            return Err(DomainError::state("a closed inventory cannot be cancelled"));
        }
        if self.status == InventoryStatus::Cancelled {
            return Err(DomainError::state("inventory is already cancelled"));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("cancellation requires a reason"));
        }

        Ok(vec![InventoryEvent::InventoryCancelled(InventoryCancelled {
            tenant_id: cmd.tenant_id,
            inventory_id: cmd.inventory_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_classify(&self, cmd: &RunClassification) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;
        self.ensure_not_cancelled()?;

        let discrepancies = classify(&self.snapshot, &self.ledger);
        tracing::info!(
            inventory = %self.id,
            discrepancies = discrepancies.len(),
            "rebuilt serial discrepancy set"
        );

        Ok(vec![InventoryEvent::DiscrepanciesClassified(
            DiscrepanciesClassified {
                tenant_id: cmd.tenant_id,
                inventory_id: cmd.inventory_id,
                discrepancies,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_record_migration(
        &self,
        cmd: &RecordErpMigration,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_inventory_id(cmd.inventory_id)?;

        if self.status != InventoryStatus::Closed {
            return Err(DomainError::state(format!(
                "only a closed inventory can be migrated (inventory is {})",
                self.status
            )));
        }
        if self.erp_migrated {
            return Err(DomainError::conflict("inventory already migrated to ERP"));
        }
        let incomplete = self.incomplete_units();
        if !incomplete.is_empty() {
            return Err(DomainError::state(format!(
                "reconciliation incomplete for: {}",
                join_units(&incomplete)
            )));
        }

        Ok(vec![InventoryEvent::ErpMigrationRecorded(
            ErpMigrationRecorded {
                tenant_id: cmd.tenant_id,
                inventory_id: cmd.inventory_id,
                actor: cmd.actor,
                adjustment_count: self.divergent_lines().len() as u32,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

fn join_units(units: &[UnitKey]) -> String {
    units
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

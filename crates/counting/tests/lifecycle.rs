//! Full counting lifecycle driven through the public API: open an inventory
//! over a mixed snapshot, run blind counts, adjudicate, classify, and migrate.

use chrono::Utc;

use stocktake_auth::{Permission, Principal, PrincipalId, Role, TenantMembership};
use stocktake_core::{Aggregate, AggregateId, DomainResult, TenantId, UserId};
use stocktake_counting::{
    execute_migration, AdjustmentBatch, CloseStage, CountReading, CountStage, DiscrepancyType,
    ErpAck, ErpClient, ErpError, ExpectedQuantityLine, ExpectedSerial, FrozenSnapshot, Inventory,
    InventoryCommand, InventoryId, InventoryStatus, LocationId, MigrationLock, OpenInventory,
    OpenStage, ProductId, RunClassification, SerialNumber, SnapshotStore, SubmitCount, UnitKey,
};

/// Freeze-time capture, keyed by inventory, the way the surrounding
/// application would expose it.
struct CapturedSnapshots {
    inventory_id: InventoryId,
    snapshot: FrozenSnapshot,
}

impl SnapshotStore for CapturedSnapshots {
    fn snapshot(&self, inventory_id: InventoryId) -> DomainResult<FrozenSnapshot> {
        if inventory_id == self.inventory_id {
            Ok(self.snapshot.clone())
        } else {
            Err(stocktake_core::DomainError::not_found())
        }
    }
}

struct AcceptingErp;

impl ErpClient for AcceptingErp {
    fn post_adjustments(&self, batch: &AdjustmentBatch) -> Result<ErpAck, ErpError> {
        Ok(ErpAck {
            reference: format!("ERP-{}", batch.inventory_code),
            acknowledged_at: Utc::now(),
        })
    }
}

struct World {
    inventory: Inventory,
    tenant_id: TenantId,
    inventory_id: InventoryId,
    actor: UserId,
}

impl World {
    fn drive(&mut self, command: InventoryCommand) {
        let events = self.inventory.handle(&command).unwrap();
        for event in &events {
            self.inventory.apply(event);
        }
    }

    fn open_stage(&mut self, stage: CountStage) {
        self.drive(InventoryCommand::OpenStage(OpenStage {
            tenant_id: self.tenant_id,
            inventory_id: self.inventory_id,
            stage,
            occurred_at: Utc::now(),
        }));
    }

    fn close_stage(&mut self, stage: CountStage) {
        self.drive(InventoryCommand::CloseStage(CloseStage {
            tenant_id: self.tenant_id,
            inventory_id: self.inventory_id,
            stage,
            occurred_at: Utc::now(),
        }));
    }

    fn submit(&mut self, unit: UnitKey, stage: CountStage, reading: CountReading) {
        self.drive(InventoryCommand::SubmitCount(SubmitCount {
            tenant_id: self.tenant_id,
            inventory_id: self.inventory_id,
            unit,
            stage,
            reading,
            actor: self.actor,
            occurred_at: Utc::now(),
        }));
    }
}

#[test]
fn full_lifecycle_from_freeze_to_erp_migration() {
    stocktake_observability::init();

    let tenant_id = TenantId::new();
    let inventory_id = InventoryId::new(AggregateId::new());
    let widget = ProductId::new(AggregateId::new());
    let gadget = ProductId::new(AggregateId::new());
    let aisle_1 = LocationId::new(AggregateId::new());
    let aisle_2 = LocationId::new(AggregateId::new());

    let sn_present = SerialNumber::new("SN-100").unwrap();
    let sn_moved = SerialNumber::new("SN-200").unwrap();
    let sn_missing = SerialNumber::new("SN-300").unwrap();

    let snapshot = FrozenSnapshot::new(
        vec![
            // Will reconcile clean: count1 matches stock.
            ExpectedQuantityLine {
                product_id: widget,
                location_id: aisle_1,
                product_code: "WIDGET".into(),
                expected_quantity: 40,
                unit_cost: 125,
            },
            // Will disagree three ways and need a third count.
            ExpectedQuantityLine {
                product_id: gadget,
                location_id: aisle_2,
                product_code: "GADGET".into(),
                expected_quantity: 12,
                unit_cost: 900,
            },
        ],
        vec![
            ExpectedSerial {
                serial: sn_present.clone(),
                product_id: gadget,
                expected_location: aisle_1,
                expected_present: true,
            },
            ExpectedSerial {
                serial: sn_moved.clone(),
                product_id: gadget,
                expected_location: aisle_1,
                expected_present: true,
            },
            ExpectedSerial {
                serial: sn_missing.clone(),
                product_id: gadget,
                expected_location: aisle_2,
                expected_present: true,
            },
        ],
    )
    .unwrap();

    let store = CapturedSnapshots {
        inventory_id,
        snapshot,
    };

    let mut world = World {
        inventory: Inventory::empty(inventory_id),
        tenant_id,
        inventory_id,
        actor: UserId::new(),
    };
    let open =
        OpenInventory::from_store(&store, tenant_id, inventory_id, "INV-FY24-Q3", Utc::now())
            .unwrap();
    world.drive(InventoryCommand::OpenInventory(open));

    let widget_unit = UnitKey::Quantity {
        product_id: widget,
        location_id: aisle_1,
    };
    let gadget_unit = UnitKey::Quantity {
        product_id: gadget,
        location_id: aisle_2,
    };

    // First blind count.
    world.open_stage(CountStage::First);
    world.submit(widget_unit.clone(), CountStage::First, CountReading::Quantity(40));
    world.submit(gadget_unit.clone(), CountStage::First, CountReading::Quantity(10));
    world.submit(
        UnitKey::Serial(sn_present.clone()),
        CountStage::First,
        CountReading::Serial {
            found: true,
            found_location: Some(aisle_1),
        },
    );
    world.submit(
        UnitKey::Serial(sn_moved.clone()),
        CountStage::First,
        CountReading::Serial {
            found: false,
            found_location: None,
        },
    );
    world.submit(
        UnitKey::Serial(sn_missing.clone()),
        CountStage::First,
        CountReading::Serial {
            found: false,
            found_location: None,
        },
    );
    world.close_stage(CountStage::First);
    assert_eq!(world.inventory.status(), InventoryStatus::Count1Closed);

    // Second blind count: gadget disagrees again, SN-200 turns up in the
    // wrong aisle.
    world.open_stage(CountStage::Second);
    world.submit(widget_unit.clone(), CountStage::Second, CountReading::Quantity(38));
    world.submit(gadget_unit.clone(), CountStage::Second, CountReading::Quantity(11));
    world.submit(
        UnitKey::Serial(sn_present.clone()),
        CountStage::Second,
        CountReading::Serial {
            found: true,
            found_location: Some(aisle_1),
        },
    );
    world.submit(
        UnitKey::Serial(sn_moved.clone()),
        CountStage::Second,
        CountReading::Serial {
            found: true,
            found_location: Some(aisle_2),
        },
    );
    world.submit(
        UnitKey::Serial(sn_missing.clone()),
        CountStage::Second,
        CountReading::Serial {
            found: false,
            found_location: None,
        },
    );
    world.close_stage(CountStage::Second);

    // Gadget line and the moved serial both need adjudication.
    assert_eq!(world.inventory.status(), InventoryStatus::Count3Required);
    assert!(world.inventory.third_count_units().contains(&gadget_unit));
    assert!(world
        .inventory
        .third_count_units()
        .contains(&UnitKey::Serial(sn_moved.clone())));
    assert_eq!(world.inventory.incomplete_units(), vec![gadget_unit.clone()]);

    // Third count settles both.
    world.open_stage(CountStage::Third);
    world.submit(gadget_unit.clone(), CountStage::Third, CountReading::Quantity(11));
    world.submit(
        UnitKey::Serial(sn_moved.clone()),
        CountStage::Third,
        CountReading::Serial {
            found: true,
            found_location: Some(aisle_2),
        },
    );
    world.close_stage(CountStage::Third);
    assert_eq!(world.inventory.status(), InventoryStatus::Closed);
    assert!(world.inventory.incomplete_units().is_empty());

    // Classify: SN-200 moved, SN-300 missing, SN-100 clean.
    world.drive(InventoryCommand::RunClassification(RunClassification {
        tenant_id,
        inventory_id,
        occurred_at: Utc::now(),
    }));
    let discrepancies = world.inventory.discrepancies();
    assert_eq!(discrepancies.len(), 2);
    let moved = discrepancies
        .iter()
        .find(|d| d.serial_number == sn_moved)
        .unwrap();
    assert_eq!(moved.discrepancy_type, DiscrepancyType::LocationMismatch);
    assert_eq!(moved.found_location, Some(aisle_2));
    assert_eq!(moved.count_stage, Some(CountStage::Second));
    let missing = discrepancies
        .iter()
        .find(|d| d.serial_number == sn_missing)
        .unwrap();
    assert_eq!(missing.discrepancy_type, DiscrepancyType::NotFound);

    // Migrate: one divergent line (gadget 12 → 11).
    let principal = Principal {
        principal_id: PrincipalId::new(),
        active_tenant_id: tenant_id,
        membership: TenantMembership {
            tenant_id,
            roles: vec![Role::new("supervisor")],
            permissions: vec![Permission::new("inventory.migrate")],
        },
    };
    let lock = MigrationLock::new();
    let outcome = execute_migration(
        &world.inventory,
        &principal,
        &AcceptingErp,
        &lock,
        Utc::now(),
    )
    .unwrap();
    assert_eq!(outcome.adjustment_count, 1);

    let events = outcome.events;
    for event in &events {
        world.inventory.apply(event);
    }
    assert!(world.inventory.erp_migrated());

    // One-way: a second request is rejected regardless of retries.
    let err = execute_migration(
        &world.inventory,
        &principal,
        &AcceptingErp,
        &lock,
        Utc::now(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        stocktake_counting::MigrationError::Domain(stocktake_core::DomainError::Conflict(_))
    ));
}

//! Serial discrepancy classification.
//!
//! Three independent, explicitly ordered scans over the per-serial ledger,
//! one per discrepancy type. A serial may appear under more than one type
//! when its situation is genuinely ambiguous; within one type there is at
//! most one record per serial. The match case (expected, found, at the
//! expected location) is never materialized.
//!
//! The output is a materialized view: each run rebuilds the whole set, so
//! re-running after new counts is safe and expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::UserId;

use crate::ledger::CountLedger;
use crate::snapshot::{FrozenSnapshot, LocationId, ProductId, SerialNumber};
use crate::stage::CountStage;

/// Classified real-world disposition of a serial that does not match the
/// frozen snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    /// Found, but somewhere other than where the snapshot expected it.
    LocationMismatch,
    /// Expected present, never found by any stage.
    NotFound,
    /// Not expected present, yet found by some stage.
    UnexpectedFound,
}

/// Resolution state of a discrepancy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyStatus {
    Pending,
    Resolved,
    Migrated,
}

/// One serial-level mismatch, derived from snapshot + ledger.
///
/// Derived, not authoritative: the classifier recomputes the full set on
/// every run, resetting status to `Pending`. `Migrated` is stamped by the
/// migration gate on the set that was exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub serial_number: SerialNumber,
    pub product_id: ProductId,
    pub discrepancy_type: DiscrepancyType,
    pub expected_location: Option<LocationId>,
    pub found_location: Option<LocationId>,
    pub found_by: Option<UserId>,
    pub found_at: Option<DateTime<Utc>>,
    pub count_stage: Option<CountStage>,
    pub status: DiscrepancyStatus,
}

/// Classify every serial in the snapshot against the ledger.
///
/// Deterministic: scans iterate the snapshot (BTreeMap order), never the
/// ledger's physical row order, and ties between stages are broken by the
/// first-true-wins rule in [`CountLedger::first_found`]. Output order is
/// serial order within each pass, passes in type order (location mismatch,
/// not found, unexpected found).
pub fn classify(snapshot: &FrozenSnapshot, ledger: &CountLedger) -> Vec<Discrepancy> {
    let mut discrepancies = scan_location_mismatch(snapshot, ledger);
    discrepancies.extend(scan_not_found(snapshot, ledger));
    discrepancies.extend(scan_unexpected_found(snapshot, ledger));

    tracing::debug!(
        total = discrepancies.len(),
        "serial discrepancy classification complete"
    );

    discrepancies
}

/// Serials whose final disposition is "found", at a location other than the
/// one the snapshot recorded for that exact serial.
fn scan_location_mismatch(snapshot: &FrozenSnapshot, ledger: &CountLedger) -> Vec<Discrepancy> {
    snapshot
        .serials()
        .filter_map(|expected| {
            let (stage, obs) = ledger.first_found(&expected.serial)?;
            let found_location = obs.found_location?;
            if found_location == expected.expected_location {
                return None;
            }
            Some(Discrepancy {
                serial_number: expected.serial.clone(),
                product_id: expected.product_id,
                discrepancy_type: DiscrepancyType::LocationMismatch,
                expected_location: Some(expected.expected_location),
                found_location: Some(found_location),
                found_by: Some(obs.actor),
                found_at: Some(obs.recorded_at),
                count_stage: Some(stage),
                status: DiscrepancyStatus::Pending,
            })
        })
        .collect()
}

/// Serials expected present that no stage ever found.
fn scan_not_found(snapshot: &FrozenSnapshot, ledger: &CountLedger) -> Vec<Discrepancy> {
    snapshot
        .serials()
        .filter(|expected| expected.expected_present)
        .filter(|expected| ledger.first_found(&expected.serial).is_none())
        .map(|expected| Discrepancy {
            serial_number: expected.serial.clone(),
            product_id: expected.product_id,
            discrepancy_type: DiscrepancyType::NotFound,
            expected_location: Some(expected.expected_location),
            found_location: None,
            found_by: None,
            found_at: None,
            count_stage: None,
            status: DiscrepancyStatus::Pending,
        })
        .collect()
}

/// Serials not expected present that some stage nonetheless found.
fn scan_unexpected_found(snapshot: &FrozenSnapshot, ledger: &CountLedger) -> Vec<Discrepancy> {
    snapshot
        .serials()
        .filter(|expected| !expected.expected_present)
        .filter_map(|expected| {
            let (stage, obs) = ledger.first_found(&expected.serial)?;
            Some(Discrepancy {
                serial_number: expected.serial.clone(),
                product_id: expected.product_id,
                discrepancy_type: DiscrepancyType::UnexpectedFound,
                expected_location: Some(expected.expected_location),
                found_location: obs.found_location,
                found_by: Some(obs.actor),
                found_at: Some(obs.recorded_at),
                count_stage: Some(stage),
                status: DiscrepancyStatus::Pending,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocktake_core::AggregateId;

    use crate::ledger::{LedgerEntry, SerialObservation};
    use crate::snapshot::{ExpectedSerial, UnitKey};

    struct Fixture {
        snapshot: FrozenSnapshot,
        ledger: CountLedger,
        location_a: LocationId,
        location_b: LocationId,
    }

    fn serial(s: &str) -> SerialNumber {
        SerialNumber::new(s).unwrap()
    }

    fn fixture(serials: Vec<ExpectedSerial>) -> Fixture {
        Fixture {
            snapshot: FrozenSnapshot::new(vec![], serials).unwrap(),
            ledger: CountLedger::new(),
            location_a: LocationId::new(AggregateId::new()),
            location_b: LocationId::new(AggregateId::new()),
        }
    }

    fn expected_at(serial_no: &str, location: LocationId, present: bool) -> ExpectedSerial {
        ExpectedSerial {
            serial: serial(serial_no),
            product_id: ProductId::new(AggregateId::new()),
            expected_location: location,
            expected_present: present,
        }
    }

    fn record_found(ledger: &mut CountLedger, sn: &str, stage: CountStage, loc: LocationId) {
        ledger.record(
            UnitKey::Serial(serial(sn)),
            stage,
            LedgerEntry::Serial(SerialObservation {
                found: true,
                found_location: Some(loc),
                actor: UserId::new(),
                recorded_at: Utc::now(),
            }),
        );
    }

    fn record_not_found(ledger: &mut CountLedger, sn: &str, stage: CountStage) {
        ledger.record(
            UnitKey::Serial(serial(sn)),
            stage,
            LedgerEntry::Serial(SerialObservation {
                found: false,
                found_location: None,
                actor: UserId::new(),
                recorded_at: Utc::now(),
            }),
        );
    }

    #[test]
    fn never_found_expected_serial_yields_not_found() {
        let loc = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-42", loc, true)]);
        record_not_found(&mut fx.ledger, "SN-42", CountStage::First);
        record_not_found(&mut fx.ledger, "SN-42", CountStage::Second);

        let set = classify(&fx.snapshot, &fx.ledger);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].discrepancy_type, DiscrepancyType::NotFound);
        assert_eq!(set[0].expected_location, Some(loc));
        assert_eq!(set[0].count_stage, None);
        assert_eq!(set[0].status, DiscrepancyStatus::Pending);
    }

    #[test]
    fn found_elsewhere_yields_location_mismatch_attributed_to_first_finding_stage() {
        let a = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-42", a, true)]);
        let b = fx.location_b;
        record_not_found(&mut fx.ledger, "SN-42", CountStage::First);
        record_found(&mut fx.ledger, "SN-42", CountStage::Second, b);

        let set = classify(&fx.snapshot, &fx.ledger);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].discrepancy_type, DiscrepancyType::LocationMismatch);
        assert_eq!(set[0].expected_location, Some(a));
        assert_eq!(set[0].found_location, Some(b));
        assert_eq!(set[0].count_stage, Some(CountStage::Second));
    }

    #[test]
    fn later_stage_does_not_overwrite_first_found_attribution() {
        let a = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-1", a, true)]);
        let (b, c) = (fx.location_a, fx.location_b);
        record_found(&mut fx.ledger, "SN-1", CountStage::Second, b);
        record_found(&mut fx.ledger, "SN-1", CountStage::Audit, c);

        let set = classify(&fx.snapshot, &fx.ledger);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].count_stage, Some(CountStage::Second));
        assert_eq!(set[0].found_location, Some(b));
    }

    #[test]
    fn found_at_expected_location_produces_no_discrepancy() {
        let loc = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-OK", loc, true)]);
        record_found(&mut fx.ledger, "SN-OK", CountStage::First, loc);

        assert!(classify(&fx.snapshot, &fx.ledger).is_empty());
    }

    #[test]
    fn unexpected_serial_found_yields_unexpected_found() {
        let loc = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-GHOST", loc, false)]);
        let b = fx.location_b;
        record_found(&mut fx.ledger, "SN-GHOST", CountStage::Third, b);

        let set = classify(&fx.snapshot, &fx.ledger);
        // Found at a location that is not its recorded one while not expected
        // present at all: both passes report it, no dedupe across types.
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].discrepancy_type, DiscrepancyType::LocationMismatch);
        assert_eq!(set[1].discrepancy_type, DiscrepancyType::UnexpectedFound);
        assert_eq!(set[1].count_stage, Some(CountStage::Third));
        assert_eq!(set[1].found_location, Some(b));
    }

    #[test]
    fn classification_is_idempotent_on_unchanged_ledger() {
        let loc = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![
            expected_at("SN-1", loc, true),
            expected_at("SN-2", loc, true),
            expected_at("SN-3", loc, false),
        ]);
        let b = fx.location_b;
        record_found(&mut fx.ledger, "SN-1", CountStage::Second, b);
        record_not_found(&mut fx.ledger, "SN-2", CountStage::First);
        record_found(&mut fx.ledger, "SN-3", CountStage::First, loc);

        let first = classify(&fx.snapshot, &fx.ledger);
        let second = classify(&fx.snapshot, &fx.ledger);
        assert_eq!(first, second);
    }

    #[test]
    fn at_most_one_record_per_serial_within_a_type() {
        let loc = LocationId::new(AggregateId::new());
        let mut fx = fixture(vec![expected_at("SN-9", loc, true)]);
        let b = fx.location_b;
        // Multiple stages find it at wrong locations; only one mismatch row.
        record_found(&mut fx.ledger, "SN-9", CountStage::First, b);
        record_found(&mut fx.ledger, "SN-9", CountStage::Second, fx.location_a);
        record_found(&mut fx.ledger, "SN-9", CountStage::Audit, b);

        let set = classify(&fx.snapshot, &fx.ledger);
        let mismatches: Vec<_> = set
            .iter()
            .filter(|d| d.discrepancy_type == DiscrepancyType::LocationMismatch)
            .collect();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].count_stage, Some(CountStage::First));
    }
}

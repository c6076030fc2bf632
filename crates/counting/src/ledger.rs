use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::UserId;

use crate::snapshot::{LocationId, SerialNumber, UnitKey};
use crate::stage::CountStage;

/// The value a counter submits for one (unit, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountReading {
    /// Numeric quantity for a quantity-tracked line.
    Quantity(i64),
    /// Presence reading for a serialized item. A `found` reading must name
    /// the location it was found at; a not-found reading must not.
    Serial {
        found: bool,
        found_location: Option<LocationId>,
    },
}

/// Recorded quantity observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityObservation {
    pub quantity: i64,
    pub actor: UserId,
    pub recorded_at: DateTime<Utc>,
}

/// Recorded serial presence observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialObservation {
    pub found: bool,
    pub found_location: Option<LocationId>,
    pub actor: UserId,
    pub recorded_at: DateTime<Utc>,
}

/// One ledger cell: what (if anything) stage X recorded for unit Y.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntry {
    Quantity(QuantityObservation),
    Serial(SerialObservation),
    /// Explicit not-applicable marker; satisfies the stage-close guard
    /// without contributing a reading.
    Skipped {
        actor: UserId,
        recorded_at: DateTime<Utc>,
    },
}

/// Per-inventory count ledger: at most one entry per (unit, stage).
///
/// Resubmission to the same pair overwrites it wholesale (last-writer-wins,
/// the writer's timestamp is authoritative; no merge). Entries for different
/// pairs never interact, so concurrent submissions commute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountLedger {
    entries: BTreeMap<(UnitKey, CountStage), LedgerEntry>,
}

impl CountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the entry for (unit, stage).
    pub fn record(&mut self, unit: UnitKey, stage: CountStage, entry: LedgerEntry) {
        self.entries.insert((unit, stage), entry);
    }

    pub fn entry(&self, unit: &UnitKey, stage: CountStage) -> Option<&LedgerEntry> {
        self.entries.get(&(unit.clone(), stage))
    }

    /// Whether the stage-close guard is satisfied for this unit: an
    /// observation or an explicit skip marker exists.
    pub fn is_satisfied(&self, unit: &UnitKey, stage: CountStage) -> bool {
        self.entry(unit, stage).is_some()
    }

    /// Numeric quantity recorded for a quantity unit at a stage, if any.
    /// Skip markers and serial entries yield `None`.
    pub fn quantity(&self, unit: &UnitKey, stage: CountStage) -> Option<i64> {
        match self.entry(unit, stage) {
            Some(LedgerEntry::Quantity(obs)) => Some(obs.quantity),
            _ => None,
        }
    }

    /// Serial observation recorded for a serial at a stage, if any.
    pub fn serial_observation(
        &self,
        serial: &SerialNumber,
        stage: CountStage,
    ) -> Option<&SerialObservation> {
        match self.entry(&UnitKey::Serial(serial.clone()), stage) {
            Some(LedgerEntry::Serial(obs)) => Some(obs),
            _ => None,
        }
    }

    /// First stage that recorded `found == true` for this serial, scanning in
    /// attribution priority order (count1 → count2 → count3 → audit).
    ///
    /// First true wins: later stages never overwrite the attributed
    /// actor/timestamp, even if they also found the item.
    pub fn first_found(&self, serial: &SerialNumber) -> Option<(CountStage, &SerialObservation)> {
        CountStage::ALL.iter().find_map(|stage| {
            self.serial_observation(serial, *stage)
                .filter(|obs| obs.found)
                .map(|obs| (*stage, obs))
        })
    }

    /// Units from `assigned` that have neither an observation nor a skip
    /// marker for `stage`, in assignment order.
    pub fn unresolved_units<I>(&self, assigned: I, stage: CountStage) -> Vec<UnitKey>
    where
        I: IntoIterator<Item = UnitKey>,
    {
        assigned
            .into_iter()
            .filter(|unit| !self.is_satisfied(unit, stage))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocktake_core::AggregateId;

    use crate::snapshot::{LocationId, ProductId};

    fn serial(s: &str) -> SerialNumber {
        SerialNumber::new(s).unwrap()
    }

    fn serial_entry(found: bool, location: Option<LocationId>) -> LedgerEntry {
        LedgerEntry::Serial(SerialObservation {
            found,
            found_location: location,
            actor: UserId::new(),
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn resubmission_overwrites_same_pair() {
        let unit = UnitKey::Quantity {
            product_id: ProductId::new(AggregateId::new()),
            location_id: LocationId::new(AggregateId::new()),
        };
        let mut ledger = CountLedger::new();

        ledger.record(
            unit.clone(),
            CountStage::First,
            LedgerEntry::Quantity(QuantityObservation {
                quantity: 5,
                actor: UserId::new(),
                recorded_at: Utc::now(),
            }),
        );
        ledger.record(
            unit.clone(),
            CountStage::First,
            LedgerEntry::Quantity(QuantityObservation {
                quantity: 7,
                actor: UserId::new(),
                recorded_at: Utc::now(),
            }),
        );

        assert_eq!(ledger.quantity(&unit, CountStage::First), Some(7));
    }

    #[test]
    fn first_found_prefers_earliest_stage() {
        let sn = serial("SN-42");
        let loc_b = LocationId::new(AggregateId::new());
        let loc_c = LocationId::new(AggregateId::new());
        let mut ledger = CountLedger::new();

        ledger.record(
            UnitKey::Serial(sn.clone()),
            CountStage::First,
            serial_entry(false, None),
        );
        ledger.record(
            UnitKey::Serial(sn.clone()),
            CountStage::Second,
            serial_entry(true, Some(loc_b)),
        );
        ledger.record(
            UnitKey::Serial(sn.clone()),
            CountStage::Audit,
            serial_entry(true, Some(loc_c)),
        );

        let (stage, obs) = ledger.first_found(&sn).unwrap();
        assert_eq!(stage, CountStage::Second);
        assert_eq!(obs.found_location, Some(loc_b));
    }

    #[test]
    fn first_found_is_none_when_never_found() {
        let sn = serial("SN-43");
        let mut ledger = CountLedger::new();
        ledger.record(
            UnitKey::Serial(sn.clone()),
            CountStage::First,
            serial_entry(false, None),
        );

        assert!(ledger.first_found(&sn).is_none());
    }

    #[test]
    fn skip_marker_satisfies_close_guard_but_yields_no_quantity() {
        let unit = UnitKey::Quantity {
            product_id: ProductId::new(AggregateId::new()),
            location_id: LocationId::new(AggregateId::new()),
        };
        let mut ledger = CountLedger::new();
        ledger.record(
            unit.clone(),
            CountStage::First,
            LedgerEntry::Skipped {
                actor: UserId::new(),
                recorded_at: Utc::now(),
            },
        );

        assert!(ledger.is_satisfied(&unit, CountStage::First));
        assert_eq!(ledger.quantity(&unit, CountStage::First), None);
    }

    #[test]
    fn unresolved_units_lists_missing_entries_in_order() {
        let unit_a = UnitKey::Serial(serial("SN-A"));
        let unit_b = UnitKey::Serial(serial("SN-B"));
        let mut ledger = CountLedger::new();
        ledger.record(unit_a.clone(), CountStage::First, serial_entry(false, None));

        let unresolved = ledger.unresolved_units(
            vec![unit_a.clone(), unit_b.clone()],
            CountStage::First,
        );
        assert_eq!(unresolved, vec![unit_b]);
    }
}

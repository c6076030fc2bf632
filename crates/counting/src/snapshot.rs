use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stocktake_core::{AggregateId, DomainError, DomainResult, Entity, ValueObject};

/// Product identifier (catalog is an external collaborator; only the id and
/// the freeze-time attributes below cross into the engine).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Stock location identifier.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LocationId(pub AggregateId);

impl LocationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LocationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A unique physical serial number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(String);

impl SerialNumber {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation("serial number cannot be empty"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One countable unit: either a quantity-tracked product × location line, or
/// a single serialized item.
///
/// A product is exclusively one kind, fixed at catalog time; the frozen
/// snapshot carries that decision and the engine never re-derives it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKey {
    Quantity {
        product_id: ProductId,
        location_id: LocationId,
    },
    Serial(SerialNumber),
}

impl core::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UnitKey::Quantity {
                product_id,
                location_id,
            } => write!(f, "quantity:{product_id}@{location_id}"),
            UnitKey::Serial(serial) => write!(f, "serial:{serial}"),
        }
    }
}

/// Expected state of one quantity-tracked line at freeze time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedQuantityLine {
    pub product_id: ProductId,
    pub location_id: LocationId,
    /// Catalog code handed to the ERP in the adjustment batch.
    pub product_code: String,
    pub expected_quantity: i64,
    /// Unit cost in the smallest currency unit (e.g. cents); used to value
    /// adjustment deltas at migration time.
    pub unit_cost: i64,
}

impl ExpectedQuantityLine {
    pub fn unit_key(&self) -> UnitKey {
        UnitKey::Quantity {
            product_id: self.product_id,
            location_id: self.location_id,
        }
    }
}

/// Expected placement of one serialized item at freeze time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSerial {
    pub serial: SerialNumber,
    pub product_id: ProductId,
    pub expected_location: LocationId,
    /// False when the unit was already known to be absent from that location
    /// when the inventory was frozen.
    pub expected_present: bool,
}

impl ExpectedSerial {
    pub fn unit_key(&self) -> UnitKey {
        UnitKey::Serial(self.serial.clone())
    }
}

impl Entity for ExpectedSerial {
    type Id = SerialNumber;

    fn id(&self) -> &SerialNumber {
        &self.serial
    }
}

/// Immutable point-in-time copy of expected stock, captured once when an
/// inventory is opened and owned by it until the inventory itself is deleted.
///
/// Keyed by `BTreeMap` so every consumer iterates in a stable order; the
/// discrepancy classifier's determinism relies on this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenSnapshot {
    quantity_lines: BTreeMap<(ProductId, LocationId), ExpectedQuantityLine>,
    serials: BTreeMap<SerialNumber, ExpectedSerial>,
}

impl FrozenSnapshot {
    /// Build a snapshot from freeze-time captures.
    ///
    /// Rejects negative expected quantities and duplicate keys; a snapshot
    /// must be unambiguous ground truth.
    pub fn new(
        lines: Vec<ExpectedQuantityLine>,
        serials: Vec<ExpectedSerial>,
    ) -> DomainResult<Self> {
        let mut line_map = BTreeMap::new();
        for line in lines {
            if line.expected_quantity < 0 {
                return Err(DomainError::validation(format!(
                    "expected quantity cannot be negative for {}",
                    line.unit_key()
                )));
            }
            let key = (line.product_id, line.location_id);
            if line_map.insert(key, line).is_some() {
                return Err(DomainError::validation(format!(
                    "duplicate quantity line for product {} at location {}",
                    key.0, key.1
                )));
            }
        }

        let mut serial_map = BTreeMap::new();
        for serial in serials {
            let key = serial.serial.clone();
            if serial_map.insert(key.clone(), serial).is_some() {
                return Err(DomainError::validation(format!(
                    "duplicate serial {key} in snapshot"
                )));
            }
        }

        Ok(Self {
            quantity_lines: line_map,
            serials: serial_map,
        })
    }

    /// Empty snapshot for not-yet-opened aggregates.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn quantity_lines(&self) -> impl Iterator<Item = &ExpectedQuantityLine> {
        self.quantity_lines.values()
    }

    pub fn serials(&self) -> impl Iterator<Item = &ExpectedSerial> {
        self.serials.values()
    }

    pub fn quantity_line(
        &self,
        product_id: ProductId,
        location_id: LocationId,
    ) -> Option<&ExpectedQuantityLine> {
        self.quantity_lines.get(&(product_id, location_id))
    }

    pub fn serial(&self, serial: &SerialNumber) -> Option<&ExpectedSerial> {
        self.serials.get(serial)
    }

    /// Every countable unit in this snapshot, quantity lines first, in key
    /// order. This is the stage-1/stage-2 assignment set.
    pub fn unit_keys(&self) -> impl Iterator<Item = UnitKey> + '_ {
        self.quantity_lines
            .values()
            .map(ExpectedQuantityLine::unit_key)
            .chain(self.serials.values().map(ExpectedSerial::unit_key))
    }

    pub fn contains_unit(&self, unit: &UnitKey) -> bool {
        match unit {
            UnitKey::Quantity {
                product_id,
                location_id,
            } => self.quantity_lines.contains_key(&(*product_id, *location_id)),
            UnitKey::Serial(serial) => self.serials.contains_key(serial),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity_lines.is_empty() && self.serials.is_empty()
    }
}

impl ValueObject for FrozenSnapshot {}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(expected: i64) -> ExpectedQuantityLine {
        ExpectedQuantityLine {
            product_id: ProductId::new(AggregateId::new()),
            location_id: LocationId::new(AggregateId::new()),
            product_code: "P-001".into(),
            expected_quantity: expected,
            unit_cost: 250,
        }
    }

    #[test]
    fn rejects_negative_expected_quantity() {
        let err = FrozenSnapshot::new(vec![line(-1)], vec![]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_quantity_line() {
        let a = line(5);
        let b = a.clone();
        let err = FrozenSnapshot::new(vec![a, b], vec![]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_duplicate_serial() {
        let serial = SerialNumber::new("SN-1").unwrap();
        let entry = ExpectedSerial {
            serial: serial.clone(),
            product_id: ProductId::new(AggregateId::new()),
            expected_location: LocationId::new(AggregateId::new()),
            expected_present: true,
        };
        let err = FrozenSnapshot::new(vec![], vec![entry.clone(), entry]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn rejects_empty_serial_number() {
        assert!(SerialNumber::new("  ").is_err());
    }

    #[test]
    fn unit_keys_covers_both_kinds() {
        let q = line(3);
        let q_key = q.unit_key();
        let serial = SerialNumber::new("SN-2").unwrap();
        let s = ExpectedSerial {
            serial: serial.clone(),
            product_id: ProductId::new(AggregateId::new()),
            expected_location: LocationId::new(AggregateId::new()),
            expected_present: true,
        };
        let snapshot = FrozenSnapshot::new(vec![q], vec![s]).unwrap();

        let keys: Vec<UnitKey> = snapshot.unit_keys().collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&q_key));
        assert!(keys.contains(&UnitKey::Serial(serial)));
    }
}

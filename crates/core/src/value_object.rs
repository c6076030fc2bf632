//! Value object trait: equality by value, not identity.

/// Marker trait for immutable, value-compared domain objects.
///
/// Two value objects with the same attribute values are the same value; there
/// is no identity to track. "Modifying" one means constructing a new one.
/// The frozen stock snapshot is the canonical example here: it is captured
/// once when an inventory opens and never changes afterward.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

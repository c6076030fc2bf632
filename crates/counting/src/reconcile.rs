use serde::{Deserialize, Serialize};

/// Which reading supplied the accepted final quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageUsed {
    /// A count matched the frozen snapshot; the expected value stands.
    Stock,
    /// Counts 1 and 2 agreed against the snapshot; count 2 stands.
    Count2,
    /// Counts disagreed; the mandatory third count stands.
    Count3,
}

impl StageUsed {
    pub fn label(self) -> &'static str {
        match self {
            StageUsed::Stock => "stock",
            StageUsed::Count2 => "count2",
            StageUsed::Count3 => "count3",
        }
    }
}

/// A fully reconciled quantity line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedQuantity {
    pub final_quantity: i64,
    pub divergent: bool,
    pub stage_used: StageUsed,
    /// `final_quantity - expected`.
    pub divergence_quantity: i64,
    /// `divergence_quantity / expected`; undefined (None) when expected is 0.
    pub divergence_percent: Option<f64>,
}

/// Outcome of the quantity reconciliation rule.
///
/// `Incomplete` is a first-class result, not an error: the unit simply cannot
/// close its inventory stage until a third count exists. It is surfaced
/// distinctly from divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityReconciliation {
    Resolved(ResolvedQuantity),
    Incomplete,
}

impl QuantityReconciliation {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, QuantityReconciliation::Incomplete)
    }

    pub fn resolved(&self) -> Option<&ResolvedQuantity> {
        match self {
            QuantityReconciliation::Resolved(r) => Some(r),
            QuantityReconciliation::Incomplete => None,
        }
    }
}

/// Whether counts 1 and 2 force a mandatory third count: they disagree with
/// each other and neither matches the snapshot.
pub fn requires_third_count(expected: i64, count1: i64, count2: i64) -> bool {
    count1 != expected && count2 != expected && count1 != count2
}

/// The quantity reconciliation rule. Deterministic, total.
///
/// 1. Either count matches the snapshot → the expected value stands, not
///    divergent ("stock" wins even when the other count disagrees).
/// 2. Counts agree with each other against the snapshot → count 2 stands,
///    divergent.
/// 3. Counts disagree and neither matches → the third count stands when
///    present, divergent; otherwise `Incomplete`, never a default value.
///
/// Negative counts are rejected at submission and never reach this function.
pub fn reconcile_quantity(
    expected: i64,
    count1: i64,
    count2: i64,
    count3: Option<i64>,
) -> QuantityReconciliation {
    if count1 == expected || count2 == expected {
        return resolved(expected, expected, false, StageUsed::Stock);
    }

    if count1 == count2 {
        return resolved(expected, count2, true, StageUsed::Count2);
    }

    match count3 {
        Some(c3) => resolved(expected, c3, true, StageUsed::Count3),
        None => QuantityReconciliation::Incomplete,
    }
}

fn resolved(
    expected: i64,
    final_quantity: i64,
    divergent: bool,
    stage_used: StageUsed,
) -> QuantityReconciliation {
    let divergence_quantity = final_quantity - expected;
    let divergence_percent = if expected == 0 {
        None
    } else {
        Some(divergence_quantity as f64 / expected as f64)
    };

    QuantityReconciliation::Resolved(ResolvedQuantity {
        final_quantity,
        divergent,
        stage_used,
        divergence_quantity,
        divergence_percent,
    })
}

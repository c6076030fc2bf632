use serde::{Deserialize, Serialize};

/// One counting pass.
///
/// Stages 1–3 are sequential blind counts gated by the inventory lifecycle.
/// `Audit` is an optional adjudication pass: its observations enter the
/// ledger and participate in serial attribution, but it never gates a
/// lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CountStage {
    #[serde(rename = "count1")]
    First,
    #[serde(rename = "count2")]
    Second,
    #[serde(rename = "count3")]
    Third,
    #[serde(rename = "audit")]
    Audit,
}

impl CountStage {
    /// All stages in attribution priority order (first-true-wins scans).
    pub const ALL: [CountStage; 4] = [
        CountStage::First,
        CountStage::Second,
        CountStage::Third,
        CountStage::Audit,
    ];

    /// Wire/report label for this stage.
    pub fn label(self) -> &'static str {
        match self {
            CountStage::First => "count1",
            CountStage::Second => "count2",
            CountStage::Third => "count3",
            CountStage::Audit => "audit",
        }
    }

    /// Whether this stage gates the inventory lifecycle (audit does not).
    pub fn is_lifecycle_stage(self) -> bool {
        !matches!(self, CountStage::Audit)
    }
}

impl core::fmt::Display for CountStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

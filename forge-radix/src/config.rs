//! Engine configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digit::DigitWidth;
use crate::error::Stage;
use crate::layout::SortLayout;
use crate::scan::{ScanKind, SpinPolicy};

/// Largest input a sort accepts: lookback cells carry 30-bit counts.
pub const MAX_KEYS: usize = (1 << 30) - 1;

/// Default engine capacity.
pub const DEFAULT_MAX_KEYS: usize = 1 << 20;

/// The three radix-sort designs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Design {
    /// 4-bit digits, eight passes of histogram, scan and split scatter.
    MultiPass4,
    /// 8-bit digits, four passes of histogram, scan and split scatter.
    MultiPass8,
    /// 8-bit digits, four fused rank/lookback/scatter passes.
    #[default]
    OneSweep,
}

impl Design {
    pub const ALL: [Design; 3] = [Design::MultiPass4, Design::MultiPass8, Design::OneSweep];

    pub fn name(self) -> &'static str {
        match self {
            Design::MultiPass4 => "multipass4",
            Design::MultiPass8 => "multipass8",
            Design::OneSweep => "onesweep",
        }
    }

    /// Parse a design name as printed by [`Design::name`].
    pub fn from_name(name: &str) -> Option<Design> {
        Design::ALL.into_iter().find(|d| d.name() == name)
    }

    pub const fn layout(self) -> SortLayout {
        match self {
            Design::MultiPass4 => SortLayout::new(DigitWidth::Four, 4),
            Design::MultiPass8 | Design::OneSweep => SortLayout::new(DigitWidth::Eight, 8),
        }
    }

    /// First kernel stage of a sort, the one that rejects an incompatible
    /// subgroup width before any other.
    pub fn first_stage(self) -> Stage {
        match self {
            Design::MultiPass4 | Design::MultiPass8 => Stage::Histogram,
            Design::OneSweep => Stage::GlobalHistogram,
        }
    }

    /// Whether the scan strategy is fixed by the design (fused lookback).
    pub fn fuses_scan(self) -> bool {
        matches!(self, Design::OneSweep)
    }
}

impl fmt::Display for Design {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything fixed at engine construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub design: Design,
    /// Scan strategy of the multi-pass designs. Ignored by OneSweep.
    pub scan: ScanKind,
    /// Force a kernel variant by name (`w32`, `w16`, `w8`) instead of
    /// selecting one from the probed width.
    pub variant: Option<String>,
    /// Scratch capacity in keys.
    pub max_keys: usize,
    pub spin: SpinPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            design: Design::default(),
            scan: ScanKind::default(),
            variant: None,
            max_keys: DEFAULT_MAX_KEYS,
            spin: SpinPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(design: Design) -> Self {
        Self {
            design,
            ..Self::default()
        }
    }

    pub fn with_scan(mut self, scan: ScanKind) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_variant(mut self, name: impl Into<String>) -> Self {
        self.variant = Some(name.into());
        self
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_spin_policy(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Scan strategy the engine will actually run.
    pub fn effective_scan(&self) -> ScanKind {
        if self.design.fuses_scan() {
            ScanKind::Lookback
        } else {
            self.scan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_design_layouts() {
        assert_eq!(Design::MultiPass4.layout().partition_size(), 1024);
        assert_eq!(Design::MultiPass4.layout().passes(), 8);
        assert_eq!(Design::MultiPass8.layout().partition_size(), 2048);
        assert_eq!(Design::OneSweep.layout().passes(), 4);
    }

    #[test]
    fn test_design_names_round_trip() {
        for design in Design::ALL {
            assert_eq!(Design::from_name(design.name()), Some(design));
        }
        assert_eq!(Design::from_name("bitonic"), None);
    }

    #[test]
    fn test_builder_and_effective_scan() {
        let config = EngineConfig::new(Design::MultiPass8)
            .with_scan(ScanKind::Lookback)
            .with_variant("w16")
            .with_max_keys(4096);
        assert_eq!(config.effective_scan(), ScanKind::Lookback);
        assert_eq!(config.variant.as_deref(), Some("w16"));
        assert_eq!(config.max_keys, 4096);

        let onesweep = EngineConfig::new(Design::OneSweep).with_scan(ScanKind::TwoLevel);
        assert_eq!(onesweep.effective_scan(), ScanKind::Lookback);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"design":"multi_pass4","max_keys":500}"#).unwrap();
        assert_eq!(config.design, Design::MultiPass4);
        assert_eq!(config.max_keys, 500);
        assert_eq!(config.scan, ScanKind::TwoLevel);
        assert_eq!(config.spin, SpinPolicy::default());
    }
}

//! The price-stage registry.
//!
//! Every source spells its value-chain stages differently ("farm-gate",
//! "field sale", "Producer Prices", "pərakəndə"...). This is the single place
//! that maps those spellings to the canonical codes, and the canonical code
//! doubles as the market-type code of aggregates.

use crate::catalog_store::{SourceKind, StageLink};
use crate::matching::normalize::words;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceStage {
    Producer,
    Wholesale,
    Retail,
    Processing,
}

/// Spellings every source may use.
const COMMON_SYNONYMS: &[(&str, PriceStage)] = &[
    ("producer", PriceStage::Producer),
    ("producer price", PriceStage::Producer),
    ("farm gate", PriceStage::Producer),
    ("farmgate", PriceStage::Producer),
    ("wholesale", PriceStage::Wholesale),
    ("retail", PriceStage::Retail),
    ("consumer", PriceStage::Retail),
    ("processing", PriceStage::Processing),
    ("processing purchase", PriceStage::Processing),
];

const AZ_SYNONYMS: &[(&str, PriceStage)] = &[
    ("field sale", PriceStage::Producer),
    ("sahe satisi", PriceStage::Producer),
    ("istehsalci", PriceStage::Producer),
    ("topdan", PriceStage::Wholesale),
    ("topdan satis", PriceStage::Wholesale),
    ("perakende", PriceStage::Retail),
    ("perakende satis", PriceStage::Retail),
    ("emal", PriceStage::Processing),
];

const EU_SYNONYMS: &[(&str, PriceStage)] = &[
    ("selling price", PriceStage::Producer),
    ("ex farm", PriceStage::Producer),
    ("purchase price for processing", PriceStage::Processing),
    ("industry purchase", PriceStage::Processing),
];

const FAO_SYNONYMS: &[(&str, PriceStage)] = &[
    ("producer prices", PriceStage::Producer),
    ("producer price lcu tonne", PriceStage::Producer),
    ("producer price usd tonne", PriceStage::Producer),
];

const FPMA_SYNONYMS: &[(&str, PriceStage)] = &[
    ("retail prices", PriceStage::Retail),
    ("wholesale prices", PriceStage::Wholesale),
];

impl PriceStage {
    pub const ALL: [PriceStage; 4] = [
        PriceStage::Producer,
        PriceStage::Wholesale,
        PriceStage::Retail,
        PriceStage::Processing,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            PriceStage::Producer => "PRODUCER",
            PriceStage::Wholesale => "WHOLESALE",
            PriceStage::Retail => "RETAIL",
            PriceStage::Processing => "PROCESSING",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PriceStage::Producer => "Producer price",
            PriceStage::Wholesale => "Wholesale price",
            PriceStage::Retail => "Retail price",
            PriceStage::Processing => "Processing purchase price",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.code().eq_ignore_ascii_case(code.trim()))
    }

    /// Every known spelling of this stage, across sources.
    pub fn synonyms(&self) -> Vec<&'static str> {
        [
            COMMON_SYNONYMS,
            AZ_SYNONYMS,
            EU_SYNONYMS,
            FAO_SYNONYMS,
            FPMA_SYNONYMS,
        ]
        .iter()
        .flat_map(|table| table.iter())
        .filter(|(_, stage)| stage == self)
        .map(|(spelling, _)| *spelling)
        .collect()
    }

    /// Folded lookup key of a raw stage spelling. Also used as the external
    /// code of source price-stage entities.
    pub fn key(raw: &str) -> String {
        words(raw).join(" ")
    }

    /// Map a source's raw stage label to its canonical stage.
    pub fn normalize(source: SourceKind, raw: &str) -> Option<Self> {
        let key = Self::key(raw);
        if key.is_empty() {
            return None;
        }
        if let Some(stage) = Self::from_code(&key) {
            return Some(stage);
        }
        let source_table = match source {
            SourceKind::Az => AZ_SYNONYMS,
            SourceKind::Eu => EU_SYNONYMS,
            SourceKind::Fao => FAO_SYNONYMS,
            SourceKind::Fpma => FPMA_SYNONYMS,
        };
        source_table
            .iter()
            .chain(COMMON_SYNONYMS)
            .find(|(spelling, _)| *spelling == key)
            .map(|(_, stage)| *stage)
    }
}

impl fmt::Display for PriceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Resolves raw stage labels to market-type codes. Operator links on source
/// price-stage entities win over the built-in registry.
#[derive(Clone, Debug, Default)]
pub struct StageResolver {
    linked: HashMap<(SourceKind, String), String>,
}

impl StageResolver {
    pub fn new(links: Vec<StageLink>) -> Self {
        let linked = links
            .into_iter()
            .map(|(source, external_code, code)| ((source, PriceStage::key(&external_code)), code))
            .collect();
        StageResolver { linked }
    }

    pub fn resolve(&self, source: SourceKind, raw: &str) -> Option<String> {
        let key = PriceStage::key(raw);
        if let Some(code) = self.linked.get(&(source, key)) {
            return Some(code.clone());
        }
        PriceStage::normalize(source, raw).map(|stage| stage.code().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_normalize_to_themselves() {
        for stage in PriceStage::ALL {
            assert_eq!(PriceStage::normalize(SourceKind::Eu, stage.code()), Some(stage));
        }
    }

    #[test]
    fn test_source_vocabularies() {
        assert_eq!(
            PriceStage::normalize(SourceKind::Az, "Farm-gate"),
            Some(PriceStage::Producer)
        );
        assert_eq!(
            PriceStage::normalize(SourceKind::Az, "Field sale"),
            Some(PriceStage::Producer)
        );
        assert_eq!(
            PriceStage::normalize(SourceKind::Az, "Pərakəndə satış"),
            Some(PriceStage::Retail)
        );
        assert_eq!(
            PriceStage::normalize(SourceKind::Fao, "Producer Price (LCU/tonne)"),
            Some(PriceStage::Producer)
        );
        assert_eq!(
            PriceStage::normalize(SourceKind::Fpma, "Wholesale prices"),
            Some(PriceStage::Wholesale)
        );
    }

    #[test]
    fn test_source_specific_spelling_does_not_leak() {
        assert_eq!(PriceStage::normalize(SourceKind::Fpma, "topdan"), None);
        assert_eq!(PriceStage::normalize(SourceKind::Az, ""), None);
    }

    #[test]
    fn test_linked_stage_overrides_registry() {
        let resolver = StageResolver::new(vec![(
            SourceKind::Az,
            "field sale".to_string(),
            "WHOLESALE".to_string(),
        )]);
        assert_eq!(
            resolver.resolve(SourceKind::Az, "Field  Sale"),
            Some("WHOLESALE".to_string())
        );
        assert_eq!(
            resolver.resolve(SourceKind::Eu, "field sale"),
            None
        );
        assert_eq!(
            resolver.resolve(SourceKind::Eu, "retail"),
            Some("RETAIL".to_string())
        );
    }

    #[test]
    fn test_synonyms_cover_every_stage() {
        for stage in PriceStage::ALL {
            assert!(!stage.synonyms().is_empty());
        }
    }
}

// =============================================================================
// Symbol Catalog — vendor symbol ↔ internal instrument resolution
// =============================================================================

use std::collections::HashMap;

use crate::types::{Instrument, InstrumentClass, InstrumentTier};

/// Resolves vendor symbols to internal instruments and back.  Built once at
/// startup from the configured universe; lookups are read-only afterwards.
pub struct SymbolCatalog {
    by_code: HashMap<String, Instrument>,
    by_vendor: HashMap<String, String>,
}

impl SymbolCatalog {
    pub fn new(instruments: &[Instrument]) -> Self {
        let mut by_code = HashMap::new();
        let mut by_vendor = HashMap::new();
        for inst in instruments {
            by_vendor.insert(inst.vendor_symbol.clone(), inst.code.clone());
            by_code.insert(inst.code.clone(), inst.clone());
        }
        Self { by_code, by_vendor }
    }

    /// Resolve a vendor symbol from the live feed. Unknown symbols return
    /// `None` and are ignored at the boundary.
    pub fn from_vendor(&self, vendor_symbol: &str) -> Option<&Instrument> {
        self.by_vendor
            .get(vendor_symbol)
            .and_then(|code| self.by_code.get(code))
    }

    pub fn get(&self, code: &str) -> Option<&Instrument> {
        self.by_code.get(code)
    }

    pub fn class_of(&self, code: &str) -> Option<InstrumentClass> {
        self.by_code.get(code).map(|i| i.class)
    }

    pub fn all(&self) -> impl Iterator<Item = &Instrument> {
        self.by_code.values()
    }

    pub fn by_tier(&self, tier: InstrumentTier) -> Vec<&Instrument> {
        self.by_code.values().filter(|i| i.tier == tier).collect()
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SymbolCatalog {
        SymbolCatalog::new(&[
            Instrument {
                code: "EURUSD".into(),
                vendor_symbol: "EUR/USD".into(),
                class: InstrumentClass::Forex,
                tier: InstrumentTier::Primary,
            },
            Instrument {
                code: "BTCUSD".into(),
                vendor_symbol: "BTC/USD".into(),
                class: InstrumentClass::Crypto,
                tier: InstrumentTier::Secondary,
            },
        ])
    }

    #[test]
    fn resolves_vendor_symbols() {
        let cat = sample();
        assert_eq!(cat.from_vendor("EUR/USD").unwrap().code, "EURUSD");
        assert!(cat.from_vendor("DOGE/USD").is_none());
    }

    #[test]
    fn class_lookup() {
        let cat = sample();
        assert_eq!(cat.class_of("BTCUSD"), Some(InstrumentClass::Crypto));
        assert_eq!(cat.class_of("UNKNOWN"), None);
    }

    #[test]
    fn tier_filter() {
        let cat = sample();
        let primary = cat.by_tier(InstrumentTier::Primary);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].code, "EURUSD");
    }
}

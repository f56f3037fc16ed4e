//! Canonical asset symbols with historical-ticker alias resolution.
//!
//! Centralizes the prefix-stripping rules that Kraken-era exports scatter across
//! raw CSV columns (`XXBT`, `ZEUR`, `XETH`, ...) into one ordered rule list.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Fiat currencies the engine recognizes as non-crypto.
const FIAT_SYMBOLS: &[&str] = &["EUR", "USD", "GBP", "JPY", "CAD", "AUD", "CHF"];

/// Crypto symbols eligible for the generic `X`-prefix strip (rule 3). This is not
/// exhaustive of all crypto assets the engine can represent — unlisted symbols
/// simply fall through to rule 4 (uppercase as-is) rather than losing a leading
/// `X` that might be a legitimate part of the ticker (e.g. `XRP` itself).
const KNOWN_X_PREFIXED: &[&str] = &[
    "ETH", "ETC", "XRP", "LTC", "XLM", "XMR", "ZEC", "REP", "XDG", "DOGE", "ADA", "DOT", "SOL",
    "ATOM", "LINK", "UNI", "AAVE", "BCH", "EOS", "XTZ", "MLN",
];

/// A canonical, alias-resolved asset symbol.
///
/// Two `AssetId`s constructed from different historical spellings of the same
/// asset compare equal, since construction always canonicalizes.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(Arc<str>);

impl AssetId {
    /// Canonicalizes a raw ticker per the fixed rule order:
    ///
    /// 1. `XBT`/`XXBT` -> `BTC`.
    /// 2. `Z`-prefixed known fiat code -> strip the `Z`.
    /// 3. `X`-prefixed known 3-4 letter crypto code -> strip the `X`.
    /// 4. Otherwise, uppercase as-is.
    pub fn new(raw: &str) -> Self {
        Self(Arc::from(canonicalize(raw)))
    }

    pub fn canonical(&self) -> &str {
        &self.0
    }

    pub fn is_fiat(&self) -> bool {
        FIAT_SYMBOLS.contains(&self.canonical())
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn btc() -> Self {
        Self::new("BTC")
    }
}

fn canonicalize(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();

    if upper == "XBT" || upper == "XXBT" {
        return "BTC".to_owned();
    }

    if let Some(rest) = upper.strip_prefix('Z') {
        if FIAT_SYMBOLS.contains(&rest) {
            return rest.to_owned();
        }
    }

    if let Some(rest) = upper.strip_prefix('X') {
        if (rest.len() == 3 || rest.len() == 4) && KNOWN_X_PREFIXED.contains(&rest) {
            return rest.to_owned();
        }
    }

    upper
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(raw: &str) -> Self {
        AssetId::new(raw)
    }
}

impl From<String> for AssetId {
    fn from(raw: String) -> Self {
        AssetId::new(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xbt_variants_canonicalize_to_btc() {
        assert_eq!(AssetId::new("XBT").canonical(), "BTC");
        assert_eq!(AssetId::new("XXBT").canonical(), "BTC");
        assert_eq!(AssetId::new("btc").canonical(), "BTC");
    }

    #[test]
    fn z_prefixed_fiat_strips_z() {
        assert_eq!(AssetId::new("ZEUR").canonical(), "EUR");
        assert_eq!(AssetId::new("ZUSD").canonical(), "USD");
    }

    #[test]
    fn x_prefixed_known_crypto_strips_x() {
        assert_eq!(AssetId::new("XETH").canonical(), "ETH");
        assert_eq!(AssetId::new("XXRP").canonical(), "XRP");
        assert_eq!(AssetId::new("XLTC").canonical(), "LTC");
    }

    #[test]
    fn unknown_x_prefixed_symbol_is_left_alone() {
        // XRP itself must not be mistaken for X + RP.
        assert_eq!(AssetId::new("XRP").canonical(), "XRP");
    }

    #[test]
    fn fiat_detection() {
        assert!(AssetId::new("EUR").is_fiat());
        assert!(AssetId::new("ZUSD").is_fiat());
        assert!(!AssetId::new("BTC").is_fiat());
    }

    #[test]
    fn equality_across_aliases() {
        assert_eq!(AssetId::new("XBT"), AssetId::new("XXBT"));
        assert_eq!(AssetId::new("XBT"), AssetId::new("BTC"));
    }

    #[test]
    fn canonicalization_round_trip() {
        let inputs = ["XBT", "XXBT", "ZEUR", "XETH", "BTC", "usdt"];

        for raw in inputs {
            let once = AssetId::new(raw);
            let twice = AssetId::new(once.canonical());
            assert_eq!(once, twice);
        }
    }
}

//! Symbol normalization shared by every provider adapter.
//!
//! Raw user input arrives as "$MSFT ", "tsla\n", "BTCUSD" and similar; all
//! adapters operate on the canonical uppercase form, with vendor-specific
//! rewrites applied at the adapter boundary.

/// Crypto shorthand mapped to the canonical pair form.
const SHORTHAND_MAP: &[(&str, &str)] = &[
    ("BTCUSD", "BTC-USD"),
    ("ETHUSD", "ETH-USD"),
    ("SOLUSD", "SOL-USD"),
    ("BTC", "BTC-USD"),
    ("ETH", "ETH-USD"),
    ("SOL", "SOL-USD"),
];

/// Canonical form: trimmed, uppercased, currency prefixes stripped,
/// crypto shorthand expanded.
pub fn normalize(symbol: &str) -> String {
    let mut s = symbol.trim().to_uppercase();

    while let Some(rest) = s
        .strip_prefix('$')
        .or_else(|| s.strip_prefix('€'))
        .or_else(|| s.strip_prefix('£'))
    {
        s = rest.trim_start().to_string();
    }

    // Keep alphanumerics plus '.' (class shares) and '-' (crypto pairs).
    s.retain(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');

    for (from, to) in SHORTHAND_MAP {
        if s == *from {
            return (*to).to_string();
        }
    }
    s
}

/// Twelve Data writes crypto pairs with a slash: BTC-USD -> BTC/USD.
pub fn to_twelvedata(symbol: &str) -> String {
    let normalized = normalize(symbol);
    match normalized.split_once('-') {
        Some((base, quote)) if quote == "USD" || quote == "EUR" => format!("{}/{}", base, quote),
        _ => normalized,
    }
}

/// Whether a canonical symbol looks like a plausible ticker.
pub fn is_valid(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= 10
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
}

/// Whether the canonical symbol denotes a crypto pair.
pub fn is_crypto(symbol: &str) -> bool {
    symbol.contains('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_noise() {
        assert_eq!(normalize("$MSFT "), "MSFT");
        assert_eq!(normalize("tsla\n"), "TSLA");
        assert_eq!(normalize("  AAPL  "), "AAPL");
        assert_eq!(normalize("BRK.B"), "BRK.B");
    }

    #[test]
    fn test_normalize_crypto_shorthand() {
        assert_eq!(normalize("BTCUSD"), "BTC-USD");
        assert_eq!(normalize("btc"), "BTC-USD");
        assert_eq!(normalize("ETH-USD"), "ETH-USD");
    }

    #[test]
    fn test_twelvedata_format() {
        assert_eq!(to_twelvedata("BTC-USD"), "BTC/USD");
        assert_eq!(to_twelvedata("BTCUSD"), "BTC/USD");
        assert_eq!(to_twelvedata("AAPL"), "AAPL");
    }

    #[test]
    fn test_validation() {
        assert!(is_valid("AAPL"));
        assert!(is_valid("BTC-USD"));
        assert!(is_valid("BRK.B"));
        assert!(!is_valid(""));
        assert!(!is_valid("WAY-TOO-LONG-SYMBOL"));
    }
}

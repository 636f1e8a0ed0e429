//! Kraken pair name mapping: user-facing `BASE/USD` vs the REST API's
//! legacy names (XBT for BTC, XDG for DOGE).

const PAIR_MAP: &[(&str, &str)] = &[
    ("BTC/USD", "XBTUSD"),
    ("ETH/USD", "ETHUSD"),
    ("SOL/USD", "SOLUSD"),
    ("XRP/USD", "XRPUSD"),
    ("DOGE/USD", "XDGUSD"),
    ("ADA/USD", "ADAUSD"),
    ("LINK/USD", "LINKUSD"),
    ("AVAX/USD", "AVAXUSD"),
    ("DOT/USD", "DOTUSD"),
];

pub fn to_kraken_pair(symbol: &str) -> String {
    PAIR_MAP
        .iter()
        .find(|(user, _)| *user == symbol)
        .map(|(_, kraken)| kraken.to_string())
        .unwrap_or_else(|| symbol.replace('/', ""))
}

pub fn from_kraken_pair(pair: &str) -> String {
    if let Some((user, _)) = PAIR_MAP.iter().find(|(_, kraken)| *kraken == pair) {
        return user.to_string();
    }
    // WS v2 uses slash-separated names with Kraken's internal bases
    match pair {
        "XBT/USD" => "BTC/USD".to_string(),
        "XDG/USD" => "DOGE/USD".to_string(),
        _ => pair.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_pairs_map_both_ways() {
        assert_eq!(to_kraken_pair("BTC/USD"), "XBTUSD");
        assert_eq!(to_kraken_pair("DOGE/USD"), "XDGUSD");
        assert_eq!(from_kraken_pair("XBTUSD"), "BTC/USD");
        assert_eq!(from_kraken_pair("XBT/USD"), "BTC/USD");
    }

    #[test]
    fn unknown_pairs_fall_back_to_slash_stripping() {
        assert_eq!(to_kraken_pair("PEPE/USD"), "PEPEUSD");
        assert_eq!(from_kraken_pair("UNKNOWN"), "UNKNOWN");
    }
}

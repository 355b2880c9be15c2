use serde::{Deserialize, Serialize};

/// Instrument metadata used to enforce exchange-realistic order rules.
///
/// `min_size` is expressed in contracts; `contract_size` converts a
/// contract into base-currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub min_size: u32,
    pub contract_size: f64,
    pub tick_size: f64,
    pub base_currency: String,
}

impl SymbolSpec {
    /// Minimum order quantity in base-currency units.
    pub fn minimum_qty(&self) -> f64 {
        self.min_size as f64 * self.contract_size
    }

    /// Approximate specs used when the candle source cannot supply real
    /// instrument metadata (typical USDT-SWAP values).
    pub fn fallback_for(base_currency: &str) -> Self {
        let (min_size, contract_size, tick_size) = match base_currency {
            "BTC" => (1, 0.001, 0.1),
            "ETH" => (1, 0.01, 0.01),
            "SOL" => (1, 1.0, 0.001),
            "BNB" => (1, 0.1, 0.01),
            "ADA" => (1, 10.0, 0.0001),
            "AVAX" => (1, 1.0, 0.001),
            "MATIC" => (1, 10.0, 0.0001),
            "DOT" => (1, 1.0, 0.001),
            "LINK" => (1, 1.0, 0.001),
            "DOGE" => (1, 100.0, 0.00001),
            "SHIB" => (1, 1_000_000.0, 0.0000001),
            "XRP" => (1, 10.0, 0.0001),
            _ => (1, 1.0, 0.001),
        };

        Self {
            min_size,
            contract_size,
            tick_size,
            base_currency: base_currency.to_string(),
        }
    }

    /// Extract the base currency from a symbol like "BTC-USDT-SWAP".
    pub fn base_of(symbol: &str) -> &str {
        symbol.split('-').next().unwrap_or("BTC")
    }
}

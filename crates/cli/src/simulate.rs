use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Payloads published by the simulator, shaped like the terminal's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FeedMessage {
    #[serde(rename = "tick")]
    Tick {
        symbol: String,
        bid: Decimal,
        ask: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl FeedMessage {
    pub fn topic(&self) -> String {
        match self {
            FeedMessage::Tick { symbol, .. } => format!("tick.{symbol}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Quote {
    symbol: String,
    mid: Decimal,
    pip: Decimal,
}

/// Random-walk quote generator, one quote per symbol.
#[derive(Debug)]
pub struct TickSimulator<R> {
    rng: R,
    quotes: Vec<Quote>,
    max_step_pips: i64,
}

impl<R: Rng> TickSimulator<R> {
    pub fn new(symbols: &[String], rng: R) -> Self {
        let quotes = symbols
            .iter()
            .map(|s| {
                let symbol = s.trim().to_uppercase();
                let (mid, pip) = seed_quote(&symbol);
                Quote { symbol, mid, pip }
            })
            .collect();
        Self {
            rng,
            quotes,
            max_step_pips: 3,
        }
    }

    /// Move every quote and return one tick per symbol.
    pub fn step(&mut self, now: DateTime<Utc>) -> Vec<FeedMessage> {
        let max = self.max_step_pips;
        let rng = &mut self.rng;
        self.quotes
            .iter_mut()
            .map(|quote| {
                let pips = rng.gen_range(-max..=max);
                quote.mid = (quote.mid + quote.pip * Decimal::from(pips)).max(quote.pip * dec!(10));
                // One-pip spread either side of mid.
                FeedMessage::Tick {
                    symbol: quote.symbol.clone(),
                    bid: quote.mid - quote.pip,
                    ask: quote.mid + quote.pip,
                    timestamp: now,
                }
            })
            .collect()
    }
}

fn seed_quote(symbol: &str) -> (Decimal, Decimal) {
    match symbol {
        "EURUSD" => (dec!(1.08450), dec!(0.0001)),
        "GBPUSD" => (dec!(1.26800), dec!(0.0001)),
        "AUDUSD" => (dec!(0.65500), dec!(0.0001)),
        "USDCHF" => (dec!(0.88200), dec!(0.0001)),
        "USDJPY" => (dec!(149.500), dec!(0.01)),
        s if s.ends_with("JPY") => (dec!(150.000), dec!(0.01)),
        _ => (dec!(1.00000), dec!(0.0001)),
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{Error, Result};

/// Canonical entity key: trimmed and uppercased (`btc` and ` BTC ` are the same ticker).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("ticker", "empty"));
        }
        Ok(Ticker(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickers_are_canonicalised() {
        assert_eq!(Ticker::parse(" btc ").unwrap().as_str(), "BTC");
        assert_eq!(Ticker::parse("Eth").unwrap(), Ticker::parse("ETH").unwrap());
    }

    #[test]
    fn blank_ticker_is_rejected() {
        assert!(Ticker::parse("   ").unwrap_err().is_validation());
    }
}

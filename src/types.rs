// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Lifecycle state of a bot: evaluated on ticks only while Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Running,
}

impl Default for BotStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Aggregate position lifecycle for a bot.
///
/// Transitions:
///   Closed --buy fill--> Building
///   Building --buy fill (tranches < max)--> Building
///   Building --max tranches or sell signal--> Open
///   Open --partial sell--> Reducing --remaining > 0--> Open
///   Open/Reducing --last tranche closed--> Closed
///   any --emergency stop--> Closing --all sold--> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Closed,
    Building,
    Open,
    Reducing,
    Closing,
}

impl Default for PositionStatus {
    fn default() -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Building => write!(f, "building"),
            Self::Open => write!(f, "open"),
            Self::Reducing => write!(f, "reducing"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Action emitted by an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
}

impl TradeAction {
    /// The order side this action maps to, if it produces an order at all.
    pub fn side(self) -> Option<TradeSide> {
        match self {
            Self::Buy => Some(TradeSide::Buy),
            Self::Sell => Some(TradeSide::Sell),
            Self::Hold => None,
        }
    }
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// Persistence state of a submitted trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Filled,
    Failed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Filled => write!(f, "filled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Coarse projection of composite score strength, used for dashboards and as
/// a safety input (the gate can refuse Cool/Frozen intents).
///
/// Ordering matters: Frozen < Cool < Warm < Hot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Frozen,
    Cool,
    Warm,
    Hot,
}

impl Default for Temperature {
    fn default() -> Self {
        Self::Frozen
    }
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frozen => write!(f, "frozen"),
            Self::Cool => write!(f, "cool"),
            Self::Warm => write!(f, "warm"),
            Self::Hot => write!(f, "hot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_ordering_supports_floor_comparison() {
        assert!(Temperature::Hot > Temperature::Warm);
        assert!(Temperature::Warm > Temperature::Cool);
        assert!(Temperature::Cool > Temperature::Frozen);
    }

    #[test]
    fn action_maps_to_side() {
        assert_eq!(TradeAction::Buy.side(), Some(TradeSide::Buy));
        assert_eq!(TradeAction::Sell.side(), Some(TradeSide::Sell));
        assert_eq!(TradeAction::Hold.side(), None);
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&PositionStatus::Building).unwrap(),
            "\"building\""
        );
        let t: Temperature = serde_json::from_str("\"hot\"").unwrap();
        assert_eq!(t, Temperature::Hot);
    }
}

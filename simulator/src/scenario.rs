//! Simulation scenarios.
//!
//! Built-in scenarios are selected by name; any other name is read as a
//! path to a JSON scenario file.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Sellers the scenario addresses by index.
    pub sellers: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Sellers are indices into the registered sellers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Pause.
    Wait { millis: u64 },
    /// Request a deposit and approve it.
    Deposit { seller: usize, amount: String },
    /// Request a deposit and reject it.
    RejectedDeposit { seller: usize, amount: String },
    /// One sale.
    Sale { seller: usize, amount: String },
    /// `count` sales of the same amount fired at once.
    ConcurrentSales {
        seller: usize,
        amount: String,
        count: usize,
    },
    /// Random traffic across all sellers.
    RandomLoad { requests: u64 },
    /// Check a condition.
    Assert { condition: AssertCondition },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum AssertCondition {
    /// Seller balance equals.
    BalanceEquals { seller: usize, amount: String },
    /// Successful sales for a seller so far.
    SaleCount { seller: usize, count: usize },
    /// Balance equals deposits minus sales for every seller.
    LedgerConsistent,
}

impl Scenario {
    /// Load a built-in scenario by name, or a JSON file by path.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "overdraft-race" => Ok(Self::overdraft_race()),
            "deposit-then-sell" => Ok(Self::deposit_then_sell()),
            "mixed-load" => Ok(Self::mixed_load()),
            path if Path::new(path).is_file() => {
                let contents = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&contents)?)
            }
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Concurrent sales against a balance that covers only half of them.
    fn overdraft_race() -> Self {
        Self {
            name: "overdraft-race".to_string(),
            description: "Ten concurrent 1000 sales against a 5000 balance".to_string(),
            sellers: 2,
            steps: vec![
                ScenarioStep::Deposit {
                    seller: 0,
                    amount: "5000".to_string(),
                },
                ScenarioStep::Deposit {
                    seller: 1,
                    amount: "1000".to_string(),
                },
                ScenarioStep::ConcurrentSales {
                    seller: 0,
                    amount: "1000".to_string(),
                    count: 10,
                },
                ScenarioStep::ConcurrentSales {
                    seller: 1,
                    amount: "1000".to_string(),
                    count: 2,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        seller: 0,
                        amount: "0".to_string(),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::SaleCount { seller: 0, count: 5 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::SaleCount { seller: 1, count: 1 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerConsistent,
                },
            ],
        }
    }

    /// The basic deposit, approve, sell round trip.
    fn deposit_then_sell() -> Self {
        Self {
            name: "deposit-then-sell".to_string(),
            description: "Approve a deposit, sell from it, reject a second deposit".to_string(),
            sellers: 1,
            steps: vec![
                ScenarioStep::Sale {
                    seller: 0,
                    amount: "1000".to_string(),
                },
                ScenarioStep::Deposit {
                    seller: 0,
                    amount: "2000".to_string(),
                },
                ScenarioStep::Sale {
                    seller: 0,
                    amount: "1000".to_string(),
                },
                ScenarioStep::RejectedDeposit {
                    seller: 0,
                    amount: "50000".to_string(),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        seller: 0,
                        amount: "1000".to_string(),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerConsistent,
                },
            ],
        }
    }

    /// Random traffic with a consistency check at the end.
    fn mixed_load() -> Self {
        Self {
            name: "mixed-load".to_string(),
            description: "Random sales and deposits across sellers".to_string(),
            sellers: 4,
            steps: vec![
                ScenarioStep::Deposit {
                    seller: 0,
                    amount: "20000".to_string(),
                },
                ScenarioStep::RandomLoad { requests: 2000 },
                ScenarioStep::Wait { millis: 100 },
                ScenarioStep::Assert {
                    condition: AssertCondition::LedgerConsistent,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenarios() {
        for name in ["overdraft-race", "deposit-then-sell", "mixed-load"] {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("no-such-scenario").is_err());
    }

    #[test]
    fn test_scenario_json() {
        let json = r#"{
            "name": "custom",
            "description": "one sale",
            "sellers": 1,
            "steps": [
                {"step": "deposit", "seller": 0, "amount": "1000"},
                {"step": "sale", "seller": 0, "amount": "1000"},
                {"step": "assert", "condition": {"check": "balance_equals", "seller": 0, "amount": "0"}}
            ]
        }"#;

        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.steps.len(), 3);
        assert!(matches!(
            scenario.steps[2],
            ScenarioStep::Assert {
                condition: AssertCondition::BalanceEquals { .. }
            }
        ));
    }
}

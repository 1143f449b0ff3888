//! Foreshadowing tokens: named obligations that a setup unit precedes a payoff unit.
//!
//! The table is keyed by token name. Ordering checks are advisory: they
//! produce [`ValidationWarning`]s and never mutate the table.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::unit::UnitId;
use crate::error::{Error, Result};

/// Lifecycle of a foreshadowing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Declared at graph-build time.
    #[default]
    Setup,
    /// The setup unit's artifact actually contains the planted element.
    Planted,
    /// The payoff unit's artifact resolves it.
    Resolved,
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenStatus::Setup => write!(f, "setup"),
            TokenStatus::Planted => write!(f, "planted"),
            TokenStatus::Resolved => write!(f, "resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeshadowingToken {
    pub name: String,
    pub setup_unit: UnitId,
    pub payoff_unit: UnitId,
    pub description: String,
    pub status: TokenStatus,
}

impl ForeshadowingToken {
    pub fn new(name: &str, setup_unit: UnitId, payoff_unit: UnitId, description: &str) -> Self {
        Self {
            name: name.to_string(),
            setup_unit,
            payoff_unit,
            description: description.to_string(),
            status: TokenStatus::Setup,
        }
    }
}

/// Non-fatal finding about foreshadowing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationWarning {
    /// The payoff unit is not scheduled strictly after the setup unit.
    PayoffNotAfterSetup {
        token: String,
        setup_unit: UnitId,
        payoff_unit: UnitId,
    },
    /// The token refers to a unit that is not part of the execution order.
    UnitNotScheduled { token: String, unit: UnitId },
    /// No token with this name exists.
    UnknownToken { token: String },
    /// The graph has no execution order, so nothing can be checked.
    NoExecutionOrder,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::PayoffNotAfterSetup {
                token,
                setup_unit,
                payoff_unit,
            } => write!(
                f,
                "token '{}' pays off in unit {} which is not after its setup unit {}",
                token, payoff_unit, setup_unit
            ),
            ValidationWarning::UnitNotScheduled { token, unit } => {
                write!(f, "token '{}' refers to unscheduled unit {}", token, unit)
            }
            ValidationWarning::UnknownToken { token } => {
                write!(f, "unknown foreshadowing token '{}'", token)
            }
            ValidationWarning::NoExecutionOrder => {
                write!(f, "graph has no execution order")
            }
        }
    }
}

/// Tokens relevant to one unit, as handed to producers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitForeshadowing {
    /// Tokens this unit must plant.
    pub setup: Vec<ForeshadowingToken>,
    /// Tokens this unit must pay off.
    pub payoff: Vec<ForeshadowingToken>,
    /// Tokens planted earlier and paid off later; must be kept alive.
    pub active: Vec<ForeshadowingToken>,
}

impl UnitForeshadowing {
    pub fn is_empty(&self) -> bool {
        self.setup.is_empty() && self.payoff.is_empty() && self.active.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForeshadowingTable {
    tokens: BTreeMap<String, ForeshadowingToken>,
}

impl ForeshadowingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateToken`] if the name is taken.
    pub fn add(&mut self, token: ForeshadowingToken) -> Result<()> {
        if self.tokens.contains_key(&token.name) {
            return Err(Error::DuplicateToken(token.name));
        }
        self.tokens.insert(token.name.clone(), token);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ForeshadowingToken> {
        self.tokens.get(name)
    }

    pub fn mark_planted(&mut self, name: &str) -> Result<()> {
        self.set_status(name, TokenStatus::Planted)
    }

    pub fn mark_resolved(&mut self, name: &str) -> Result<()> {
        self.set_status(name, TokenStatus::Resolved)
    }

    fn set_status(&mut self, name: &str, status: TokenStatus) -> Result<()> {
        let token = self
            .tokens
            .get_mut(name)
            .ok_or_else(|| Error::TokenNotFound(name.to_string()))?;
        tracing::debug!(token = name, from = %token.status, to = %status, "foreshadowing status");
        token.status = status;
        Ok(())
    }

    /// Names of every token not yet resolved, in name order.
    pub fn unresolved(&self) -> Vec<String> {
        self.tokens
            .values()
            .filter(|t| t.status != TokenStatus::Resolved)
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tokens.keys().cloned().collect()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &ForeshadowingToken> {
        self.tokens.values()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check each named token against an execution order position map.
    ///
    /// A token is valid when its payoff position is strictly greater than
    /// its setup position.
    pub fn check_order(
        &self,
        names: &[&str],
        positions: &HashMap<UnitId, usize>,
    ) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        for name in names {
            let Some(token) = self.tokens.get(*name) else {
                warnings.push(ValidationWarning::UnknownToken {
                    token: name.to_string(),
                });
                continue;
            };
            let setup = positions.get(&token.setup_unit);
            let payoff = positions.get(&token.payoff_unit);
            match (setup, payoff) {
                (Some(s), Some(p)) if p > s => {}
                (Some(_), Some(_)) => warnings.push(ValidationWarning::PayoffNotAfterSetup {
                    token: token.name.clone(),
                    setup_unit: token.setup_unit,
                    payoff_unit: token.payoff_unit,
                }),
                (None, _) => warnings.push(ValidationWarning::UnitNotScheduled {
                    token: token.name.clone(),
                    unit: token.setup_unit,
                }),
                (_, None) => warnings.push(ValidationWarning::UnitNotScheduled {
                    token: token.name.clone(),
                    unit: token.payoff_unit,
                }),
            }
        }
        warnings
    }

    /// Classify tokens relative to `unit` using execution order positions.
    pub fn for_unit(&self, unit: UnitId, positions: &HashMap<UnitId, usize>) -> UnitForeshadowing {
        let mut view = UnitForeshadowing::default();
        let here = positions.get(&unit).copied();
        for token in self.tokens.values() {
            if token.setup_unit == unit {
                view.setup.push(token.clone());
            } else if token.payoff_unit == unit {
                view.payoff.push(token.clone());
            } else if let (Some(here), Some(s), Some(p)) = (
                here,
                positions.get(&token.setup_unit),
                positions.get(&token.payoff_unit),
            ) {
                if *s < here && here < *p {
                    view.active.push(token.clone());
                }
            }
        }
        view
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Negotiation state of the session.
///
/// `making_offer` is only meaningful while a round is open, so it lives inside
/// the variants that can have one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing negotiated yet, or just recovered
    Idle,
    Negotiating { making_offer: bool },
    /// A colliding remote offer was ignored; its candidates are dropped until
    /// the next remote description is applied
    IgnoringOffer { making_offer: bool },
    Stable,
    /// The media connection is being rebuilt
    Recovering,
}

impl NegotiationState {
    #[must_use]
    pub const fn is_making_offer(&self) -> bool {
        matches!(
            self,
            Self::Negotiating { making_offer: true } | Self::IgnoringOffer { making_offer: true }
        )
    }

    #[must_use]
    pub const fn is_ignoring_offer(&self) -> bool {
        matches!(self, Self::IgnoringOffer { .. })
    }

    #[must_use]
    pub const fn is_recovering(&self) -> bool {
        matches!(self, Self::Recovering)
    }

    /// Same state with the making-offer flag set to `making`
    #[must_use]
    pub const fn with_making_offer(self, making: bool) -> Self {
        match self {
            Self::IgnoringOffer { .. } => Self::IgnoringOffer {
                making_offer: making,
            },
            Self::Recovering => Self::Recovering,
            Self::Negotiating { .. } => Self::Negotiating {
                making_offer: making,
            },
            Self::Idle | Self::Stable if making => Self::Negotiating { making_offer: true },
            other => other,
        }
    }

    #[must_use]
    pub const fn lifecycle(&self) -> LifecycleState {
        match self {
            Self::Idle => LifecycleState::Idle,
            Self::Negotiating { .. } | Self::IgnoringOffer { .. } => LifecycleState::Negotiating,
            Self::Stable => LifecycleState::Stable,
            Self::Recovering => LifecycleState::Recovering,
        }
    }
}

/// Coarse session state exposed to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Negotiating,
    Stable,
    Recovering,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Stable => "stable",
            Self::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

// Action patterns for rule addressing

//! # Action Matching
//!
//! Every routing rule stores an `action` (or `method`) field that says which
//! incoming actions it owns. The stored string has three shapes:
//!
//! - an exact token: `"create"`
//! - a comma separated list: `"create,update"`
//! - the wildcard literal: `"all"`
//!
//! The string is parsed once, when the rule is loaded, into [`ActionPattern`].
//! Matching then works on exact tokens, so `"update"` never matches a rule
//! listing `"bulk_update"`.
//!
//! ## Rust Learning Notes:
//!
//! ### Parse, Don't Validate
//! Instead of re-splitting the string every time an event arrives, the
//! `#[serde(from = "String")]` attribute turns the raw column into an enum
//! during deserialization. Code that holds an `ActionPattern` never has to
//! think about commas or whitespace again.
//!
//! ### Ordered Enums
//! `MatchRank` derives `PartialOrd` and `Ord`. For fieldless enums the derived
//! ordering follows declaration order, which is exactly the priority order
//! we want: `Exact < Listed < Wildcard`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The wildcard literal accepted in place of an action list
pub const WILDCARD_ACTION: &str = "all";

/// A rule's action selector, parsed from its stored string form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionPattern {
    /// Matches one action exactly
    Exact(String),

    /// Matches any action in the list (comma separated in storage)
    Set(Vec<String>),

    /// Matches every action
    Wildcard,

    /// Blank pattern. Never matches anything.
    Empty,
}

/// Precedence of a successful match. Lower is stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRank {
    Exact,
    Listed,
    Wildcard,
}

impl MatchRank {
    /// Numeric rank as stored in logs and plans (1 = exact, 2 = list, 3 = wildcard)
    pub fn value(self) -> u8 {
        match self {
            MatchRank::Exact => 1,
            MatchRank::Listed => 2,
            MatchRank::Wildcard => 3,
        }
    }
}

impl ActionPattern {
    /// Parse the stored representation of an action selector
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ActionPattern::Empty;
        }
        if trimmed == WILDCARD_ACTION {
            return ActionPattern::Wildcard;
        }
        if trimmed.contains(',') {
            let tokens: Vec<String> = trimmed
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect();
            if tokens.is_empty() {
                return ActionPattern::Empty;
            }
            return ActionPattern::Set(tokens);
        }
        ActionPattern::Exact(trimmed.to_string())
    }

    /// Decide whether `action` is owned by this pattern and at which rank
    ///
    /// Returns `None` when the pattern does not match. An empty pattern and
    /// an empty action both fail closed.
    pub fn matches(&self, action: &str) -> Option<MatchRank> {
        let action = action.trim();
        if action.is_empty() {
            return None;
        }
        match self {
            ActionPattern::Exact(token) if token == action => Some(MatchRank::Exact),
            ActionPattern::Set(tokens) if tokens.iter().any(|t| t == action) => {
                Some(MatchRank::Listed)
            }
            ActionPattern::Wildcard => Some(MatchRank::Wildcard),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ActionPattern::Empty)
    }
}

impl From<String> for ActionPattern {
    fn from(raw: String) -> Self {
        ActionPattern::parse(&raw)
    }
}

impl From<&str> for ActionPattern {
    fn from(raw: &str) -> Self {
        ActionPattern::parse(raw)
    }
}

impl From<ActionPattern> for String {
    fn from(pattern: ActionPattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for ActionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionPattern::Exact(token) => write!(f, "{}", token),
            ActionPattern::Set(tokens) => write!(f, "{}", tokens.join(",")),
            ActionPattern::Wildcard => write!(f, "{}", WILDCARD_ACTION),
            ActionPattern::Empty => Ok(()),
        }
    }
}

/// Something that is addressed by an action pattern and carries a version
///
/// Implemented by every versioned routing row so that inbound rules,
/// outbound rules and endpoints share one selection routine.
pub trait Versioned {
    fn pattern(&self) -> &ActionPattern;
    fn version(&self) -> u32;
    fn is_active(&self) -> bool;
}

/// Pick the row that owns `action`: lowest rank first, then highest version
///
/// Inactive rows are ignored even if the caller passed them in.
pub fn select_best<'a, T: Versioned>(
    candidates: impl IntoIterator<Item = &'a T>,
    action: &str,
) -> Option<(&'a T, MatchRank)>
where
    T: 'a,
{
    candidates
        .into_iter()
        .filter(|row| row.is_active())
        .filter_map(|row| row.pattern().matches(action).map(|rank| (row, rank)))
        .min_by(|(a, rank_a), (b, rank_b)| {
            rank_a
                .cmp(rank_b)
                .then_with(|| b.version().cmp(&a.version()))
        })
}

//! Status transition table.
//!
//! Legality of a status change depends on the actor's role. Each role with
//! any legal moves has its own sparse table of `(from, to)` edges; every
//! pair missing from a table resolves to that table's `absent` rule.
//!
//! The two tables do not share a convention for `review_required`:
//! admin entries are review-required unless built with
//! [`Rule::without_review`], provider entries spell the flag out. Both
//! report `review_required = true` for absent pairs. Keep it that way; the
//! worker only reads the flag for legal provider edges.

use crate::types::{ApplicationStatus, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use ApplicationStatus::*;

// ---------------------------------------------------------------------------
// Edge / Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

impl Edge {
    pub const fn new(from: ApplicationStatus, to: ApplicationStatus) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub legal: bool,
    pub review_required: bool,
}

impl Rule {
    pub const DENIED: Rule = Rule {
        legal: false,
        review_required: false,
    };

    /// Illegal, but still flagged for review.
    pub const DENIED_REVIEWED: Rule = Rule {
        legal: false,
        review_required: true,
    };

    pub const fn allowed(review_required: bool) -> Self {
        Self {
            legal: true,
            review_required,
        }
    }

    /// Admin table entry: legal and review-required.
    const fn moderated() -> Self {
        Self::allowed(true)
    }

    pub const fn without_review(self) -> Self {
        Self {
            legal: self.legal,
            review_required: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransitionTable {
    entries: BTreeMap<Edge, Rule>,
    absent: Rule,
}

impl TransitionTable {
    pub fn new(absent: Rule) -> Self {
        Self {
            entries: BTreeMap::new(),
            absent,
        }
    }

    pub fn with(mut self, from: ApplicationStatus, to: ApplicationStatus, rule: Rule) -> Self {
        self.entries.insert(Edge::new(from, to), rule);
        self
    }

    /// Edges an application's owning provider may request.
    pub fn provider() -> Self {
        Self::new(Rule::DENIED_REVIEWED)
            .with(Draft, Pending, Rule::allowed(false))
            .with(Pending, Approved, Rule::allowed(false))
            .with(Approved, Published, Rule::allowed(false))
            .with(Rejected, Approved, Rule::allowed(false))
            .with(Published, Suspended, Rule::allowed(false))
            .with(Published, Deleted, Rule::allowed(false))
            .with(Published, Achieved, Rule::allowed(false))
    }

    /// Moderation edges. `Published -> Banned` is deliberately absent:
    /// an application has to be hidden or suspended before it is banned.
    pub fn admin() -> Self {
        Self::new(Rule::DENIED_REVIEWED)
            .with(Pending, Approved, Rule::moderated())
            .with(Pending, Rejected, Rule::moderated())
            .with(Approved, Rejected, Rule::moderated())
            .with(Published, Hidden, Rule::moderated())
            .with(Published, Suspended, Rule::moderated())
            .with(Hidden, Published, Rule::moderated().without_review())
            .with(Suspended, Published, Rule::moderated().without_review())
            .with(Suspended, Banned, Rule::moderated())
            .with(Hidden, Banned, Rule::moderated())
            .with(Banned, Deleted, Rule::moderated())
            .with(Rejected, Deleted, Rule::moderated())
    }

    pub fn lookup(&self, from: ApplicationStatus, to: ApplicationStatus) -> Rule {
        self.entries
            .get(&Edge::new(from, to))
            .copied()
            .unwrap_or(self.absent)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Edge, &Rule)> {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn provider_table() -> &'static TransitionTable {
    static TABLE: OnceLock<TransitionTable> = OnceLock::new();
    TABLE.get_or_init(TransitionTable::provider)
}

fn admin_table() -> &'static TransitionTable {
    static TABLE: OnceLock<TransitionTable> = OnceLock::new();
    TABLE.get_or_init(TransitionTable::admin)
}

/// Table for `role`, or `None` for roles that may never transition.
pub fn table_for(role: Role) -> Option<&'static TransitionTable> {
    match role {
        Role::Provider => Some(provider_table()),
        Role::Admin => Some(admin_table()),
        Role::User => None,
    }
}

/// Decide whether `role` may move an application from `prev` to `next`.
pub fn evaluate(prev: ApplicationStatus, next: ApplicationStatus, role: Role) -> Rule {
    match table_for(role) {
        Some(table) => table.lookup(prev, next),
        None => Rule::DENIED,
    }
}

/// Every status `role` may move an application in `prev` to, in
/// [`ApplicationStatus::all`] order.
pub fn available_statuses(prev: ApplicationStatus, role: Role) -> Vec<ApplicationStatus> {
    ApplicationStatus::all()
        .iter()
        .copied()
        .filter(|&next| evaluate(prev, next, role).legal)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! NAPT switch selection strategies.

use serde::{Deserialize, Serialize};
use snat_types::SwitchId;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::store::NatStore;

/// Picks the primary switch of a router.
///
/// Implementations must be deterministic for identical inputs and store
/// contents, never return an excluded switch, and return `None` when every
/// candidate is excluded.
pub trait NaptSwitchSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, candidates: &BTreeSet<SwitchId>, exclude: &BTreeSet<SwitchId>) -> Option<SwitchId>;
}

/// Lowest switch id that is not excluded.
#[derive(Debug, Default)]
pub struct FirstAvailableSelector;

impl NaptSwitchSelector for FirstAvailableSelector {
    fn name(&self) -> &'static str {
        "first-available"
    }

    fn select(&self, candidates: &BTreeSet<SwitchId>, exclude: &BTreeSet<SwitchId>) -> Option<SwitchId> {
        candidates.difference(exclude).next().copied()
    }
}

/// Switch currently serving the fewest routers as NAPT switch; ties go to
/// the lowest switch id.
pub struct LeastLoadedSelector {
    store: Arc<dyn NatStore>,
}

impl LeastLoadedSelector {
    pub fn new(store: Arc<dyn NatStore>) -> Self {
        Self { store }
    }
}

impl NaptSwitchSelector for LeastLoadedSelector {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&self, candidates: &BTreeSet<SwitchId>, exclude: &BTreeSet<SwitchId>) -> Option<SwitchId> {
        let mut load: HashMap<SwitchId, usize> = HashMap::new();
        for switch in self.store.assignments().into_iter().filter_map(|a| a.switch) {
            *load.entry(switch).or_default() += 1;
        }
        // BTreeSet iteration is ascending, and min_by_key keeps the first
        // minimum.
        candidates
            .difference(exclude)
            .min_by_key(|s| load.get(*s).copied().unwrap_or(0))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    FirstAvailable,
    LeastLoaded,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::FirstAvailable => write!(f, "first-available"),
            SelectionStrategy::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}

pub fn build_selector(
    strategy: SelectionStrategy,
    store: Arc<dyn NatStore>,
) -> Arc<dyn NaptSwitchSelector> {
    match strategy {
        SelectionStrategy::FirstAvailable => Arc::new(FirstAvailableSelector),
        SelectionStrategy::LeastLoaded => Arc::new(LeastLoadedSelector::new(store)),
    }
}

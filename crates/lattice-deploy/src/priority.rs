//! Rule priority allocation
//!
//! A listener's rules share the priority range 1..=100 with rules we do not
//! own. Desired rules get strictly increasing priorities in route order.
//! A live rule keeps its priority while that preserves the order, so
//! repeated deploys of an unchanged route issue no updates.

use std::collections::{BTreeSet, HashMap};

use lattice_common::{Error, Result};

/// Lowest rule priority
pub const MIN_PRIORITY: u32 = 1;

/// Highest rule priority
pub const MAX_PRIORITY: u32 = 100;

/// A rule currently on the listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveRule {
    /// Rule name
    pub name: String,
    /// Current priority
    pub priority: u32,
}

/// Allocate priorities for `desired` rule names, in order.
///
/// `live` holds every rule remaining on the listener after stale rules were
/// removed, ours and foreign. A reassigned rule only moves to a priority no
/// live rule holds, so updates never collide with rules not yet updated.
pub fn allocate(desired: &[String], live: &[LiveRule]) -> Result<Vec<u32>> {
    let current: HashMap<&str, u32> = live
        .iter()
        .map(|r| (r.name.as_str(), r.priority))
        .collect();
    let held: BTreeSet<u32> = live.iter().map(|r| r.priority).collect();

    let mut assigned = Vec::with_capacity(desired.len());
    let mut previous = 0;
    for name in desired {
        let priority = match current.get(name.as_str()) {
            Some(&p) if p > previous => p,
            _ => ((previous + 1).max(MIN_PRIORITY)..=MAX_PRIORITY)
                .find(|p| !held.contains(p))
                .ok_or_else(|| {
                    Error::cloud_permanent(
                        "AllocateRulePriority",
                        format!(
                            "no free priority above {previous} for rule {name} ({} rules on listener)",
                            live.len()
                        ),
                    )
                })?,
        };
        assigned.push(priority);
        previous = priority;
    }
    Ok(assigned)
}

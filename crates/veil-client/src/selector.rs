//! Best server selection
//!
//! ```text
//! sort by latency
//! best >= ceiling        -> best (nothing usable, take the least bad)
//! otherwise              -> random pick among
//!                           latency <= best + spread && latency < ceiling
//! ```
//!
//! The random pick spreads users across servers that are equally good
//! instead of piling everyone onto the single fastest one.

use crate::server::{ServerDescriptor, ServerId};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Thresholds for automatic selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionPolicy {
    /// Servers at or above this are not considered usable
    #[serde(default = "default_latency_ceiling")]
    pub latency_ceiling_ms: u32,
    /// How far above the best a server may be and still count as equal
    #[serde(default = "default_spread")]
    pub spread_ms: u32,
}

fn default_latency_ceiling() -> u32 {
    200
}

fn default_spread() -> u32 {
    30
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            latency_ceiling_ms: default_latency_ceiling(),
            spread_ms: default_spread(),
        }
    }
}

/// Pick the best server automatically.
///
/// Returns `None` only for an empty candidate list.
pub fn select_best<'a, R: Rng + ?Sized>(
    candidates: &'a [ServerDescriptor],
    policy: &SelectionPolicy,
    rng: &mut R,
) -> Option<&'a ServerDescriptor> {
    let mut sorted: Vec<&ServerDescriptor> = candidates.iter().collect();
    sorted.sort_by_key(|s| s.rank_latency());

    let best = *sorted.first()?;
    let best_latency = best.rank_latency();
    if best_latency >= policy.latency_ceiling_ms {
        return Some(best);
    }

    let limit = best_latency.saturating_add(policy.spread_ms);
    let pool: Vec<&ServerDescriptor> = sorted
        .into_iter()
        .take_while(|s| s.rank_latency() <= limit)
        .filter(|s| s.rank_latency() < policy.latency_ceiling_ms)
        .collect();

    pool.choose(rng).copied().or(Some(best))
}

/// Resolve which server a connect should use.
///
/// 1. `manual`, if the catalog still has it
/// 2. a server the catalog marks as selected
/// 3. [`select_best`] when there is more than one candidate
/// 4. the sole candidate
pub fn resolve_target<R: Rng + ?Sized>(
    candidates: &[ServerDescriptor],
    manual: Option<&ServerId>,
    policy: &SelectionPolicy,
    rng: &mut R,
) -> Option<ServerDescriptor> {
    if let Some(id) = manual {
        if let Some(server) = candidates.iter().find(|s| &s.id == id) {
            return Some(server.clone());
        }
        tracing::warn!("Selected server {} is no longer available", id);
    }

    if let Some(server) = candidates.iter().find(|s| s.selected) {
        return Some(server.clone());
    }

    match candidates {
        [] => None,
        [only] => Some(only.clone()),
        _ => select_best(candidates, policy, rng).cloned(),
    }
}

//! Minimum Rank with Hysteresis Objective Function (RFC 6719)
//!
//! Assumes ETX as the metric, carried in RFC 6551 form (x128) with no
//! metric container. Parent switches are damped by a path-cost hysteresis.

use tracing::{debug, warn};

use crate::instance::Instance;
use crate::neighbour::Neighbour;
use crate::objective::{LinkCosts, SelectionOutcome};
use crate::platform::etx;
use crate::policy::Policy;
use crate::rank::{self, RANK_INFINITE, RplCmp};

/// Link ETX in RFC 6551 metric form (x128); 0xFFFF = infinite.
pub(crate) fn link_metric(etx88: u16) -> u16 {
    match etx88 {
        etx::UNKNOWN => 2 * 128,    // assume poor
        etx::NO_SERVICE => 128,     // assume good
        etx::NOT_ASSOCIATED => RANK_INFINITE,
        _ => etx88 >> 1,
    }
}

pub(crate) fn path_cost(n: &Neighbour, etx88: u16) -> u16 {
    rank::add(n.rank, link_metric(etx88))
}

pub(crate) fn neighbour_acceptable(policy: &Policy, etx88: u16) -> bool {
    link_metric(etx88) <= policy.mrhof_max_link_metric_fp8
}

/// Rank limit for taking extra parents beyond the preferred one.
fn max_stretched_rank(greediness_rank_limit: u16, base_rank: u16, policy: &Policy) -> u16 {
    rank::add(base_rank, policy.mrhof_max_rank_stretch_for_extra_parents).min(greediness_rank_limit)
}

/// Backup feasible successor selection. Backups are restricted to the
/// preferred parent's exact DODAG version to keep the feasibility
/// reasoning simple. May raise `rank` to what the backup requires.
fn select_backup_parent(
    instance: &Instance,
    cands: &[Neighbour],
    pref_idx: usize,
    rank: &mut u16,
    max_rank: u16,
    policy: &Policy,
    costs: &LinkCosts,
) -> Option<usize> {
    let pref_version = cands[pref_idx].version?;
    let mut best: Option<usize> = None;
    let mut best_rank = RANK_INFINITE;
    let mut best_path_cost = RANK_INFINITE;

    for (idx, c) in cands.iter().enumerate() {
        if idx == pref_idx || c.dodag_parent {
            continue;
        }
        if c.version != Some(pref_version) {
            continue;
        }
        let Some((dodag, _)) = instance.resolve(&pref_version) else {
            continue;
        };

        if link_metric(costs.etx(c)) > policy.mrhof_max_link_metric_fp8 {
            continue;
        }

        // Must not push our rank up too much: rules 2 and 3 of
        // RFC 6719 §3.3
        let path_cost = path_cost(c, costs.etx(c));
        let next_rank_rule2 = rank::next_level(c.rank, dodag.min_hop_rank_increase());
        let path_cost_rule3 = rank::sub(path_cost, dodag.conf.max_rank_increase);
        let new_rank = next_rank_rule2.max(path_cost_rule3);
        if new_rank > max_rank {
            continue;
        }

        if let Some(_best_idx) = best {
            // Prefer lesser path cost; ties keep the first in the list
            if path_cost >= best_path_cost {
                continue;
            }
        }
        best = Some(idx);
        best_path_cost = path_cost;
        best_rank = new_rank;
    }

    if best.is_some() && best_rank > *rank {
        *rank = best_rank;
    }
    best
}

/// RFC 6719 §3.2.2: select the parent with lowest path cost, with
/// hysteresis against the previous preferred parent. MRHOF is fuzzy about
/// DODAG and version selection, so the grounded/preference logic is kept
/// from OF0.
fn select_best_parent(
    instance: &Instance,
    cands: &[Neighbour],
    prev_preferred: Option<usize>,
    policy: &Policy,
    costs: &LinkCosts,
) -> Option<(usize, u16)> {
    let mut best: Option<usize> = None;
    let mut best_rank = RANK_INFINITE;
    let mut best_path_cost = RANK_INFINITE;
    let mut best_link_metric = RANK_INFINITE;
    let metric_threshold = policy.mrhof_max_link_metric_fp8;

    let prev_preferred_path_cost =
        prev_preferred.map(|i| path_cost(&cands[i], costs.etx(&cands[i]))).unwrap_or(RANK_INFINITE);

    'candidates: for (idx, c) in cands.iter().enumerate() {
        let Some(vref) = c.version else { continue };
        let Some((dodag, version)) = instance.resolve(&vref) else {
            continue;
        };

        // Ignore totally unreachable neighbours
        let link_metric_c = link_metric(costs.etx(c));
        if link_metric_c == RANK_INFINITE {
            continue;
        }

        // For ETX the rank is the path cost, but we must still increase by
        // MinHopRankIncrease (usually superfluous at 0x80)
        let cost = path_cost(c, costs.etx(c));
        let min_rank = rank::add(c.rank, dodag.min_hop_rank_increase());
        let mut new_rank = cost.max(min_rank);
        if new_rank > version.hard_rank_limit {
            new_rank = RANK_INFINITE;
        }

        let Some(best_idx) = best else {
            best = Some(idx);
            best_rank = new_rank;
            best_path_cost = cost;
            best_link_metric = link_metric_c;
            continue;
        };
        let best_n = &cands[best_idx];
        let best_dodag = best_n
            .version
            .as_ref()
            .and_then(|v| instance.resolve(v))
            .map(|(d, _)| d)
            .expect("best always resolves");

        'ladder: {
            // Avoid high-metric links, unless there is no alternative
            if link_metric_c <= metric_threshold && best_link_metric > metric_threshold {
                break 'ladder;
            } else if link_metric_c > metric_threshold && best_link_metric <= metric_threshold {
                continue 'candidates;
            }

            // Prefer connection to a grounded DODAG
            if dodag.grounded() != best_dodag.grounded() {
                if dodag.grounded() {
                    break 'ladder;
                } else {
                    continue 'candidates;
                }
            }

            // Go by DODAG preference
            match dodag.pref().cmp(&best_dodag.pref()) {
                std::cmp::Ordering::Greater => break 'ladder,
                std::cmp::Ordering::Less => continue 'candidates,
                std::cmp::Ordering::Equal => {}
            }

            // Hysteresis: do not switch away from the current parent until
            // the threshold is met. The current parent is first in the
            // list, so it is always `best` by the time we compare.
            if Some(best_idx) == prev_preferred {
                if rank::add(cost, policy.mrhof_parent_switch_threshold_fp8) <= prev_preferred_path_cost {
                    break 'ladder;
                } else {
                    continue 'candidates;
                }
            }

            // Prefer lesser resulting path cost
            if cost < best_path_cost {
                break 'ladder;
            } else if cost > best_path_cost {
                continue 'candidates;
            }

            // Prefer the parent that most recently sent a DIO
            if c.dio_timestamp != best_n.dio_timestamp {
                if rank::serial_greater_32(c.dio_timestamp, best_n.dio_timestamp) {
                    break 'ladder;
                } else {
                    continue 'candidates;
                }
            }

            continue 'candidates;
        }

        best = Some(idx);
        best_rank = new_rank;
        best_path_cost = cost;
        best_link_metric = link_metric_c;
    }

    best.map(|idx| (idx, best_rank))
}

/// See the contract on [`crate::objective::Objective::run_parent_selection`].
pub(crate) fn parent_selection(instance: &mut Instance, policy: &Policy, costs: &LinkCosts) -> SelectionOutcome {
    let prev_preferred = instance
        .candidates
        .first()
        .filter(|n| n.was_dodag_parent || n.dodag_parent)
        .map(|_| 0usize);

    let mut cands = std::mem::take(&mut instance.candidates);

    let Some((pref_idx, mut rank)) = select_best_parent(instance, &cands, prev_preferred, policy, costs)
    else {
        debug!(instance = instance.id, "No preferred parent (mrhof), rank set to infinite");
        instance.candidates = cands;
        return SelectionOutcome::none();
    };

    let vref = cands[pref_idx].version.expect("selected parent resolves");
    let mhri = instance
        .dodag(&vref.dodag_id)
        .map(|d| d.min_hop_rank_increase())
        .unwrap_or(256);
    if let Some(v) = instance
        .dodag_mut(&vref.dodag_id)
        .and_then(|d| d.version_mut(vref.number))
    {
        v.raise_greediness(rank, mhri);
    }
    let greediness_limit = instance
        .resolve(&vref)
        .map(|(_, v)| v.greediness_rank_limit)
        .unwrap_or(RANK_INFINITE);

    cands[pref_idx].dodag_parent = true;
    cands[pref_idx].dodag_pref = 0;
    let mut order = vec![pref_idx];

    let mut last_pref = 0u8;
    let mut last_cost = path_cost(&cands[pref_idx], costs.etx(&cands[pref_idx]));
    let max_rank = max_stretched_rank(greediness_limit, rank, policy);
    let mut more_successors = policy.mrhof_parent_set_size.saturating_sub(1);

    while more_successors > 0 {
        more_successors -= 1;
        let Some(b_idx) =
            select_backup_parent(instance, &cands, pref_idx, &mut rank, max_rank, policy, costs)
        else {
            break;
        };

        if rank != RANK_INFINITE && rank > greediness_limit {
            warn!(instance = instance.id, rank, limit = greediness_limit, "Rank excess during stretch");
            rank = greediness_limit;
            break;
        }

        // Preference levels compare path cost. With hysteresis the
        // preferred parent can cost more than the backups, which then all
        // share one preference level.
        let backup_cost = path_cost(&cands[b_idx], costs.etx(&cands[b_idx]));
        if backup_cost > last_cost && last_pref < 15 {
            last_pref += 1;
            last_cost = backup_cost;
        }
        cands[b_idx].dodag_parent = true;
        cands[b_idx].dodag_pref = last_pref;
        order.push(b_idx);
    }

    let mut slots: Vec<Option<Neighbour>> = cands.into_iter().map(Some).collect();
    let mut reordered = Vec::with_capacity(slots.len());
    for idx in order {
        reordered.push(slots[idx].take().expect("selected once"));
    }
    reordered.extend(slots.into_iter().flatten());
    instance.candidates = reordered;

    SelectionOutcome { version: Some(vref), rank }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_metric_mapping() {
        assert_eq!(link_metric(0x0000), 256);
        assert_eq!(link_metric(0x0001), 128);
        assert_eq!(link_metric(0xFFFF), RANK_INFINITE);
        // 2.0 ETX in 8.8 is 0x200; RFC 6551 form is x128 = 256
        assert_eq!(link_metric(0x200), 256);
        assert_eq!(link_metric(0x100), 128);
    }

    #[test]
    fn test_acceptability_threshold() {
        let policy = Policy::default();
        // Threshold 512 in metric form corresponds to ETX 4.0 (0x400)
        assert!(neighbour_acceptable(&policy, 0x400));
        assert!(!neighbour_acceptable(&policy, 0x500));
    }
}

//! Objective Function Zero (RFC 6552)
//!
//! Link quality maps ETX onto a step-of-rank in 1..=9; anything worse is
//! unreachable. Rank increase is rank_factor * step * MinHopRankIncrease.

use tracing::{debug, warn};

use crate::dodag::Dodag;
use crate::instance::Instance;
use crate::neighbour::Neighbour;
use crate::objective::{LinkCosts, SelectionOutcome};
use crate::policy::Policy;
use crate::rank::{self, RANK_INFINITE, RplCmp};

const DEFAULT_STEP_OF_RANK: u8 = 3;
const MAXIMUM_STEP_OF_RANK: u8 = 9;
const SUITABLE_STEP_OF_RANK: u8 = 8;

/// Map 8.8 fixed-point ETX onto a step of rank. Readings below 1.0 mean
/// the ETX is not known yet.
pub(crate) fn step_of_rank(etx88: u16) -> u8 {
    if etx88 < 0x100 {
        return DEFAULT_STEP_OF_RANK;
    }
    // 0x100 = 1, 0x101-0x108 = 2, ... 0x201-0x400 = 8, 0x401-0xFFFE = 9,
    // 0xFFFF = 10 (unreachable)
    const ETX_THRESHOLDS: [u16; 10] =
        [0x100, 0x108, 0x110, 0x120, 0x140, 0x180, 0x200, 0x400, 0xFFFE, 0xFFFF];
    let mut step = 1u8;
    while etx88 > ETX_THRESHOLDS[step as usize - 1] {
        step += 1;
    }
    step
}

pub(crate) fn neighbour_acceptable(etx: u16) -> bool {
    step_of_rank(etx) <= SUITABLE_STEP_OF_RANK
}

/// Rank increase through a link of the given ETX; 0xFFFF when unreachable.
pub(crate) fn rank_increase(etx: u16, min_hop_rank_increase: u16, policy: &Policy) -> u16 {
    let step = step_of_rank(etx);
    if step > MAXIMUM_STEP_OF_RANK {
        return 0xFFFF;
    }
    let inc = policy.of0_rank_factor as u32 * step as u32 * min_hop_rank_increase as u32;
    inc.min(0xFFFF) as u16
}

fn dodag_of<'a>(instance: &'a Instance, n: &Neighbour) -> Option<&'a Dodag> {
    instance.resolve(n.version.as_ref()?).map(|(d, _)| d)
}

pub(crate) fn path_cost(instance: &Instance, n: &Neighbour, etx: u16, policy: &Policy) -> u16 {
    let Some(dodag) = dodag_of(instance, n) else {
        return RANK_INFINITE;
    };
    rank::add(n.rank, rank_increase(etx, dodag.min_hop_rank_increase(), policy))
}

/// Highest rank we may take beyond the cost through `pref` to accommodate
/// a bigger parent set.
fn max_stretched_rank(instance: &Instance, pref: &Neighbour, policy: &Policy, costs: &LinkCosts) -> u16 {
    let base = path_cost(instance, pref, costs.etx(pref), policy);
    let Some((dodag, version)) = pref.version.as_ref().and_then(|v| instance.resolve(v)) else {
        return base;
    };
    let stretch =
        (policy.of0_stretch_of_rank as u32 * dodag.min_hop_rank_increase() as u32).min(0xFFFF) as u16;
    rank::add(base, stretch).min(version.greediness_rank_limit)
}

/// RFC 6552 §4.2.2: selection of a backup feasible successor. Called
/// repeatedly to pick multiple successors, and to check the backup of a
/// potential preferred parent.
fn select_backup_parent(
    instance: &Instance,
    cands: &[Neighbour],
    pref_idx: usize,
    max_rank: u16,
    costs: &LinkCosts,
) -> Option<usize> {
    let pref_version = cands[pref_idx].version?;
    let mut best: Option<usize> = None;
    let mut best_step = 0xFFu8;

    for (idx, c) in cands.iter().enumerate() {
        // Must not be the (potential) preferred parent or already a parent
        if idx == pref_idx || c.dodag_parent {
            continue;
        }

        // Must be in the same DODAG, same or later version
        let Some(vref) = c.version else { continue };
        if vref.dodag_id != pref_version.dodag_id {
            continue;
        }
        let Some((dodag, _)) = instance.resolve(&vref) else {
            continue;
        };
        if !rank::seq_compare(vref.number, pref_version.number).ge() {
            continue;
        }

        // Must have lower DAGRank than our permitted maximum. Backups just
        // need lesser rank, not a full step below ours.
        let mhri = dodag.min_hop_rank_increase();
        if !rank::compare(c.rank, max_rank, mhri).is_less() {
            continue;
        }

        let step = step_of_rank(costs.etx(c));
        if step > MAXIMUM_STEP_OF_RANK {
            continue;
        }

        let Some(best_idx) = best else {
            best = Some(idx);
            best_step = step;
            continue;
        };

        // Prefer lesser rank
        match rank::compare(c.rank, cands[best_idx].rank, mhri) {
            RplCmp::Less => {}
            RplCmp::Greater => continue,
            _ => {
                // Prefer suitable link quality
                if step <= SUITABLE_STEP_OF_RANK && best_step > SUITABLE_STEP_OF_RANK {
                } else if step > SUITABLE_STEP_OF_RANK && best_step <= SUITABLE_STEP_OF_RANK {
                    continue;
                } else if c.was_dodag_parent && !cands[best_idx].was_dodag_parent {
                    // Prefer router previously in use
                } else {
                    // Tie: keep the first in the list, retaining any
                    // previous parent ordering
                    continue;
                }
            }
        }
        best = Some(idx);
        best_step = step;
    }

    best
}

/// RFC 6552 §4.2.1: selection of the preferred parent. Also reports the
/// first backup and the resulting rank.
fn select_preferred_parent(
    instance: &Instance,
    cands: &[Neighbour],
    prev_preferred: Option<usize>,
    policy: &Policy,
    costs: &LinkCosts,
) -> Option<(usize, Option<usize>, u16)> {
    let mut best: Option<usize> = None;
    let mut best_rank = RANK_INFINITE;
    let mut best_step = 0xFFu8;
    let mut best_backup: Option<usize> = None;

    'candidates: for (idx, c) in cands.iter().enumerate() {
        let Some(vref) = c.version else { continue };
        let Some((dodag, version)) = instance.resolve(&vref) else {
            continue;
        };
        let step = step_of_rank(costs.etx(c));
        // Ignore totally unreachable
        if step > MAXIMUM_STEP_OF_RANK {
            continue;
        }

        // Selection mustn't increase our rank excessively
        let mut new_rank = path_cost(instance, c, costs.etx(c), policy);
        if new_rank > version.hard_rank_limit {
            new_rank = RANK_INFINITE;
        }

        let c_backup =
            select_backup_parent(instance, cands, idx, max_stretched_rank(instance, c, policy, costs), costs);

        let Some(best_idx) = best else {
            best = Some(idx);
            best_rank = new_rank;
            best_step = step;
            best_backup = c_backup;
            continue;
        };
        let best_n = &cands[best_idx];
        let best_dodag = dodag_of(instance, best_n).expect("best always resolves");

        'ladder: {
            // Prefer suitable connectivity
            if step <= SUITABLE_STEP_OF_RANK && best_step > SUITABLE_STEP_OF_RANK {
                break 'ladder;
            } else if step > SUITABLE_STEP_OF_RANK && best_step <= SUITABLE_STEP_OF_RANK {
                continue 'candidates;
            }

            // DODAG preference first, if policy says it supersedes the
            // grounded check
            let pref_cmp = dodag.pref().cmp(&best_dodag.pref());
            if policy.of0_dodag_preference_supersedes_grounded {
                match pref_cmp {
                    std::cmp::Ordering::Greater => break 'ladder,
                    std::cmp::Ordering::Less => continue 'candidates,
                    std::cmp::Ordering::Equal => {}
                }
            }

            // Prefer connection to a grounded DODAG
            if dodag.grounded() != best_dodag.grounded() {
                if dodag.grounded() {
                    break 'ladder;
                } else {
                    continue 'candidates;
                }
            }

            // DODAG preference (if not already applied)
            if !policy.of0_dodag_preference_supersedes_grounded {
                match pref_cmp {
                    std::cmp::Ordering::Greater => break 'ladder,
                    std::cmp::Ordering::Less => continue 'candidates,
                    std::cmp::Ordering::Equal => {}
                }
            }

            // Prefer newer DODAG version within the same DODAG
            if let Some(best_vref) = best_n.version {
                if vref.dodag_id == best_vref.dodag_id {
                    match rank::seq_compare(vref.number, best_vref.number) {
                        RplCmp::Greater => break 'ladder,
                        RplCmp::Less => continue 'candidates,
                        _ => {}
                    }
                }
            }

            // Prefer lesser resulting rank
            match rank::compare(new_rank, best_rank, dodag.min_hop_rank_increase()) {
                RplCmp::Less => break 'ladder,
                RplCmp::Greater => continue 'candidates,
                _ => {}
            }

            // Prefer a parent that gives us a backup
            if c_backup.is_some() && best_backup.is_none() {
                break 'ladder;
            } else if c_backup.is_none() && best_backup.is_some() {
                continue 'candidates;
            }

            // Stick with the previous preferred parent
            if Some(idx) == prev_preferred {
                break 'ladder;
            } else if Some(best_idx) == prev_preferred {
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
        best_step = step;
        best_backup = c_backup;
    }

    best.map(|idx| (idx, best_backup, best_rank))
}

/// Reorder the candidate list: the parent set first in preference order,
/// then everyone else in their previous order. See the contract on
/// [`crate::objective::Objective::run_parent_selection`].
pub(crate) fn parent_selection(instance: &mut Instance, policy: &Policy, costs: &LinkCosts) -> SelectionOutcome {
    let prev_preferred = instance
        .candidates
        .first()
        .filter(|n| n.was_dodag_parent || n.dodag_parent)
        .map(|_| 0usize);

    let mut cands = std::mem::take(&mut instance.candidates);

    let Some((pref_idx, first_backup, mut rank)) =
        select_preferred_parent(instance, &cands, prev_preferred, policy, costs)
    else {
        debug!(instance = instance.id, "No preferred parent (of0), rank set to infinite");
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

    // We only stretch to accommodate current candidate backups, not ones
    // that appear later. Nodes entering a version earlier may thus end up
    // with lower rank and less stretch.
    let max_stretched = max_stretched_rank(instance, &cands[pref_idx], policy, costs);
    let mut last_pref = 0u8;
    let mut last_cost = rank;
    let mut more_successors = policy.of0_max_backup_successors;
    let mut backup = if more_successors > 0 { first_backup } else { None };

    while let Some(b_idx) = backup {
        // Stretch rank to accommodate this backup
        if rank::compare(cands[b_idx].rank, rank, mhri).ge() {
            rank = rank::next_level(cands[b_idx].rank, mhri);
            if rank != RANK_INFINITE && rank > greediness_limit {
                warn!(instance = instance.id, rank, limit = greediness_limit, "Rank excess during stretch");
                rank = greediness_limit;
                break;
            }
        }
        // Preference levels require an exact cost match for equality
        let backup_cost = path_cost(instance, &cands[b_idx], costs.etx(&cands[b_idx]), policy);
        if backup_cost != last_cost && last_pref < 15 {
            last_pref += 1;
            last_cost = backup_cost;
        }
        cands[b_idx].dodag_parent = true;
        cands[b_idx].dodag_pref = last_pref;
        order.push(b_idx);

        more_successors -= 1;
        backup = if more_successors > 0 {
            select_backup_parent(instance, &cands, pref_idx, max_stretched, costs)
        } else {
            None
        };
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
    fn test_step_of_rank_table() {
        assert_eq!(step_of_rank(0x0000), DEFAULT_STEP_OF_RANK);
        assert_eq!(step_of_rank(0x0001), DEFAULT_STEP_OF_RANK);
        assert_eq!(step_of_rank(0x100), 1);
        assert_eq!(step_of_rank(0x101), 2);
        assert_eq!(step_of_rank(0x108), 2);
        assert_eq!(step_of_rank(0x109), 3);
        assert_eq!(step_of_rank(0x200), 7);
        assert_eq!(step_of_rank(0x201), 8);
        assert_eq!(step_of_rank(0x400), 8);
        assert_eq!(step_of_rank(0x401), 9);
        assert_eq!(step_of_rank(0xFFFE), 9);
        assert_eq!(step_of_rank(0xFFFF), 10);
    }

    #[test]
    fn test_acceptability_boundary() {
        assert!(neighbour_acceptable(0x400)); // step 8
        assert!(!neighbour_acceptable(0x401)); // step 9
        assert!(!neighbour_acceptable(0xFFFF)); // not associated
    }

    #[test]
    fn test_rank_increase_saturates() {
        let mut policy = Policy::default();
        policy.of0_rank_factor = 4;
        // 4 * 9 * 0x800 overflows 16 bits and must clamp
        assert_eq!(rank_increase(0x500, 0x800, &policy), 0xFFFF);
        assert_eq!(rank_increase(0xFFFF, 256, &policy), 0xFFFF);
        policy.of0_rank_factor = 1;
        assert_eq!(rank_increase(0x100, 256, &policy), 256);
    }
}

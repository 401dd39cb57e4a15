//! Fairness-ordered, capacity-aware work queue.
//!
//! Issues are grouped by team tag and each group is sorted by priority
//! (highest first), then story points (largest first), then key. Teams take
//! turns: one issue from each team per round, roster order first, then any
//! teams seen only on issues in ascending tag order. Untagged issues follow
//! every team round.
//!
//! Every team with an enforced limit keeps a running total (points or issue
//! count). Its cut-line is the first position at which the running total
//! exceeds the limit. The queue-wide cut-line is the smallest team cut-line.
//!
//! Generation is pure: the same snapshot and plan always yield the same
//! ordering.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use sprintsync_core::types::{
    CapacityPlan, CapacityUnit, Issue, Queue, QueueEntry, SprintSnapshot, TeamId,
};

use crate::error::QueueError;

/// Generate a queue stamped with the current time.
pub fn generate(snapshot: &SprintSnapshot, plan: &CapacityPlan) -> Result<Queue, QueueError> {
    generate_at(snapshot, plan, Utc::now())
}

pub fn generate_at(
    snapshot: &SprintSnapshot,
    plan: &CapacityPlan,
    generated_at: DateTime<Utc>,
) -> Result<Queue, QueueError> {
    if snapshot.issues.is_empty() && plan.roster.is_empty() {
        return Err(QueueError::EmptySnapshot {
            sprint: snapshot.sprint_id.clone(),
        });
    }

    let roster: HashSet<&TeamId> = plan.roster.iter().collect();
    let mut limits = BTreeMap::new();
    for profile in &plan.profiles {
        if !roster.contains(&profile.team) {
            return Err(QueueError::InvalidCapacityProfile {
                team: profile.team.clone(),
            });
        }
        // Later profiles for the same team override earlier ones.
        match profile.effective_limit() {
            Some(limit) => {
                limits.insert(profile.team.clone(), limit);
            }
            None => {
                limits.remove(&profile.team);
            }
        }
    }

    let mut groups: BTreeMap<&TeamId, Vec<&Issue>> = BTreeMap::new();
    let mut unassigned = Vec::new();
    for issue in &snapshot.issues {
        match &issue.team {
            Some(team) => groups.entry(team).or_default().push(issue),
            None => unassigned.push(issue),
        }
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| rank(a, b));
    }
    unassigned.sort_by(|a, b| rank(a, b));

    // Roster order, then unknown tags ascending (BTreeMap order).
    let mut order: Vec<&TeamId> = Vec::new();
    let mut placed = HashSet::new();
    for team in &plan.roster {
        if groups.contains_key(team) && placed.insert(team) {
            order.push(team);
        }
    }
    for team in groups.keys() {
        if !placed.contains(team) {
            order.push(*team);
        }
    }

    let mut lanes: Vec<(&TeamId, VecDeque<&Issue>)> = order
        .into_iter()
        .map(|team| (team, groups.remove(team).unwrap_or_default().into()))
        .collect();

    let mut entries = Vec::with_capacity(snapshot.issues.len());
    loop {
        let mut took_any = false;
        for (team, lane) in lanes.iter_mut() {
            if let Some(issue) = lane.pop_front() {
                entries.push(QueueEntry {
                    position: entries.len() + 1,
                    team: Some((*team).clone()),
                    issue: issue.clone(),
                });
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
    }
    for issue in unassigned {
        entries.push(QueueEntry {
            position: entries.len() + 1,
            team: None,
            issue: issue.clone(),
        });
    }

    let team_cut_lines = cut_lines(&entries, &limits, plan.unit);
    let cut_line = team_cut_lines.values().copied().min();

    Ok(Queue {
        sprint_id: snapshot.sprint_id.clone(),
        snapshot_id: snapshot.id.clone(),
        generated_at,
        unit: plan.unit,
        entries,
        limits,
        team_cut_lines,
        cut_line,
    })
}

/// Priority desc, points desc, key asc.
fn rank(a: &Issue, b: &Issue) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.points().total_cmp(&a.points()))
        .then_with(|| a.key.cmp(&b.key))
}

fn weight(issue: &Issue, unit: CapacityUnit) -> f64 {
    match unit {
        CapacityUnit::Points => issue.points(),
        CapacityUnit::Issues => 1.0,
    }
}

fn cut_lines(
    entries: &[QueueEntry],
    limits: &BTreeMap<TeamId, f64>,
    unit: CapacityUnit,
) -> BTreeMap<TeamId, usize> {
    let mut totals: BTreeMap<&TeamId, f64> = BTreeMap::new();
    let mut lines = BTreeMap::new();
    for entry in entries {
        let Some(team) = &entry.team else {
            continue;
        };
        let Some(limit) = limits.get(team) else {
            continue;
        };
        if lines.contains_key(team) {
            continue;
        }
        let total = totals.entry(team).or_insert(0.0);
        *total += weight(&entry.issue, unit);
        if *total > *limit {
            lines.insert(team.clone(), entry.position);
        }
    }
    lines
}

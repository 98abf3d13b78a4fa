//! # Assignment Planner
//!
//! Pure selection logic: given a target, its tier policy and the live agent
//! pool, decide which agents probe it. Selection is keyed on a stable hash
//! of (target_id, agent_id) so reruns with unchanged inputs produce the
//! same set and small fleet changes cause minimal churn.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use twox_hash::XxHash64;

use sentinel_store::{
    Agent, AgentId, AgentSelectionPolicy, SelectionStrategy, Target, TargetId,
};

use crate::types::PlanWarning;

const HASH_SEED: u64 = 0x53454e54; // stable across runs and processes

/// Stable rank of an agent for a target. Lower ranks are preferred.
pub fn stable_rank(target_id: TargetId, agent_id: AgentId) -> u64 {
    let mut hasher = XxHash64::with_seed(HASH_SEED);
    hasher.write(target_id.as_bytes());
    hasher.write(agent_id.as_bytes());
    hasher.finish()
}

/// Filter the agent pool down to the tier policy's candidates.
pub fn candidate_pool<'a>(policy: &AgentSelectionPolicy, agents: &'a [Agent]) -> Vec<&'a Agent> {
    agents
        .iter()
        .filter(|agent| {
            if !policy.include_regions.is_empty() && !policy.include_regions.contains(&agent.region)
            {
                return false;
            }
            if policy.exclude_regions.contains(&agent.region) {
                return false;
            }
            if !policy.include_providers.is_empty()
                && !policy.include_providers.contains(&agent.provider)
            {
                return false;
            }
            if policy.exclude_providers.contains(&agent.provider) {
                return false;
            }
            for (key, value) in &policy.required_tags {
                if agent.tags.get(key) != Some(value) {
                    return false;
                }
            }
            for (key, value) in &policy.excluded_tags {
                if agent.tags.get(key) == Some(value) {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Select the probing agents for one target.
///
/// `loads` carries the per-agent assignment count planned so far this run;
/// the distributed branch skips agents that would overshoot `max_targets`.
/// Diversity shortfalls widen the selection by ascending hash distance
/// (over-selection is preferred to under-diversification); an unattainable
/// floor returns a warning alongside the best achievable set.
pub fn select_agents(
    target: &Target,
    policy: &AgentSelectionPolicy,
    agents: &[Agent],
    loads: &mut HashMap<AgentId, u32>,
) -> (Vec<AgentId>, Option<PlanWarning>) {
    let pool = candidate_pool(policy, agents);
    if pool.is_empty() {
        return (
            Vec::new(),
            Some(PlanWarning::EmptyCandidatePool {
                target_id: target.id,
                tier: target.tier.clone(),
            }),
        );
    }

    match policy.strategy {
        SelectionStrategy::All => {
            let mut selected: Vec<&Agent> = pool;
            selected.sort_by(|a, b| a.name.cmp(&b.name));
            for agent in &selected {
                *loads.entry(agent.id).or_insert(0) += 1;
            }
            (selected.iter().map(|a| a.id).collect(), None)
        }
        SelectionStrategy::Distributed => {
            let count = policy.count.unwrap_or(1).max(1) as usize;

            // Hash-ordered ring; name then id break ties deterministically.
            let mut ranked: Vec<&Agent> = pool;
            ranked.sort_by(|a, b| {
                stable_rank(target.id, a.id)
                    .cmp(&stable_rank(target.id, b.id))
                    .then_with(|| a.name.cmp(&b.name))
                    .then_with(|| a.id.cmp(&b.id))
            });

            let mut selected: Vec<&Agent> = Vec::with_capacity(count);
            let mut skipped: Vec<&Agent> = Vec::new();
            for agent in ranked.iter().copied() {
                if selected.len() >= count {
                    skipped.push(agent);
                    continue;
                }
                if at_capacity(agent, loads) {
                    continue;
                }
                selected.push(agent);
            }

            // Widen along the ring until the diversity floor is met.
            let mut warning = None;
            if policy.min_regions > 0 || policy.min_providers > 0 {
                let mut remaining = skipped.into_iter();
                loop {
                    let regions = distinct(&selected, |a| &a.region);
                    let providers = distinct(&selected, |a| &a.provider);
                    if regions >= policy.min_regions as usize
                        && providers >= policy.min_providers as usize
                    {
                        break;
                    }
                    let widened = remaining.find(|agent| {
                        !at_capacity(agent, loads)
                            && (adds_dimension(&selected, |a| &a.region, &agent.region)
                                || adds_dimension(&selected, |a| &a.provider, &agent.provider))
                    });
                    match widened {
                        Some(agent) => selected.push(agent),
                        None => {
                            warning = Some(PlanWarning::DiversityUnattainable {
                                target_id: target.id,
                                regions: distinct(&selected, |a| &a.region),
                                providers: distinct(&selected, |a| &a.provider),
                            });
                            break;
                        }
                    }
                }
            }

            for agent in &selected {
                *loads.entry(agent.id).or_insert(0) += 1;
            }
            (selected.iter().map(|a| a.id).collect(), warning)
        }
    }
}

fn at_capacity(agent: &Agent, loads: &HashMap<AgentId, u32>) -> bool {
    agent.max_targets > 0 && loads.get(&agent.id).copied().unwrap_or(0) >= agent.max_targets
}

fn distinct<'a>(agents: &[&'a Agent], dim: impl Fn(&'a Agent) -> &'a String) -> usize {
    agents
        .iter()
        .map(|a| dim(a))
        .collect::<HashSet<_>>()
        .len()
}

fn adds_dimension<'a>(
    agents: &[&'a Agent],
    dim: impl Fn(&'a Agent) -> &'a String,
    value: &String,
) -> bool {
    !agents.iter().any(|a| dim(a) == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sentinel_store::{IpType, MonitoringState, Ownership, ProbeKind, TargetOrigin};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn agent(name: &str, region: &str, provider: &str, max_targets: u32) -> Agent {
        let now = Utc::now();
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: region.to_string(),
            provider: provider.to_string(),
            location: String::new(),
            public_ip: None,
            capabilities: vec![ProbeKind::Icmp],
            max_targets,
            version: String::new(),
            tags: HashMap::new(),
            api_key_hash: None,
            last_heartbeat: Some(now),
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn target(ip: &str) -> Target {
        let now = Utc::now();
        Target {
            id: Uuid::new_v4(),
            ip: ip.parse().unwrap(),
            tier: "vip".to_string(),
            ownership: Ownership::Auto,
            origin: TargetOrigin::Sync,
            ip_type: IpType::Customer,
            monitoring_state: MonitoringState::Active,
            state_changed_at: now,
            subnet_id: None,
            is_representative: false,
            needs_review: false,
            first_response_at: None,
            last_response_at: None,
            baseline_established_at: None,
            expected_outcome: None,
            tags: HashMap::new(),
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn distributed_selection_is_deterministic() {
        let agents: Vec<Agent> = (0..10)
            .map(|i| agent(&format!("probe-{i}"), ["ord", "nyc", "lax"][i % 3], "colo", 0))
            .collect();
        let t = target("10.0.0.1");
        let mut policy = sentinel_store::AgentSelectionPolicy::distributed(3);
        policy.min_regions = 2;

        let (first, warn) = select_agents(&t, &policy, &agents, &mut HashMap::new());
        assert_eq!(first.len(), 3);
        assert!(warn.is_none());

        let (second, _) = select_agents(&t, &policy, &agents, &mut HashMap::new());
        assert_eq!(first, second);

        let regions: std::collections::HashSet<&str> = agents
            .iter()
            .filter(|a| first.contains(&a.id))
            .map(|a| a.region.as_str())
            .collect();
        assert!(regions.len() >= 2);
    }

    #[test]
    fn diversity_widens_rather_than_violates() {
        // Nine agents in one region, one in another; min_regions 2 must pull
        // the odd region in even if hash order buries it.
        let mut agents: Vec<Agent> = (0..9)
            .map(|i| agent(&format!("probe-ord-{i}"), "ord", "colo", 0))
            .collect();
        agents.push(agent("probe-nyc", "nyc", "colo", 0));
        let t = target("10.0.0.1");
        let mut policy = sentinel_store::AgentSelectionPolicy::distributed(2);
        policy.min_regions = 2;

        let (selected, warn) = select_agents(&t, &policy, &agents, &mut HashMap::new());
        assert!(warn.is_none());
        let regions: std::collections::HashSet<&str> = agents
            .iter()
            .filter(|a| selected.contains(&a.id))
            .map(|a| a.region.as_str())
            .collect();
        assert_eq!(regions.len(), 2);
        // Over-selection is allowed; the floor is a floor.
        assert!(selected.len() >= 2);
    }

    #[test]
    fn unattainable_diversity_warns() {
        let agents: Vec<Agent> = (0..4)
            .map(|i| agent(&format!("probe-{i}"), "ord", "colo", 0))
            .collect();
        let t = target("10.0.0.1");
        let mut policy = sentinel_store::AgentSelectionPolicy::distributed(2);
        policy.min_regions = 2;

        let (selected, warn) = select_agents(&t, &policy, &agents, &mut HashMap::new());
        assert_eq!(selected.len(), 2);
        assert!(matches!(
            warn,
            Some(PlanWarning::DiversityUnattainable { regions: 1, .. })
        ));
    }

    #[test]
    fn capacity_skips_full_agents() {
        let small = agent("probe-small", "ord", "colo", 1);
        let big = agent("probe-big", "ord", "colo", 0);
        let agents = vec![small.clone(), big.clone()];
        let policy = sentinel_store::AgentSelectionPolicy::distributed(1);

        let mut loads = HashMap::new();
        loads.insert(small.id, 1); // already full from earlier targets

        let (selected, _) = select_agents(&target("10.0.0.1"), &policy, &agents, &mut loads);
        assert_eq!(selected, vec![big.id]);
    }

    #[test]
    fn filters_apply_before_ranking() {
        let keep = agent("probe-keep", "ord", "colo", 0);
        let wrong_region = agent("probe-region", "nyc", "colo", 0);
        let wrong_provider = agent("probe-provider", "ord", "transit", 0);
        let mut tagged = agent("probe-tagged", "ord", "colo", 0);
        tagged.tags.insert("maintenance".to_string(), "true".to_string());

        let mut policy = sentinel_store::AgentSelectionPolicy::all();
        policy.include_regions = vec!["ord".to_string()];
        policy.exclude_providers = vec!["transit".to_string()];
        policy
            .excluded_tags
            .insert("maintenance".to_string(), "true".to_string());

        let agents = vec![keep.clone(), wrong_region, wrong_provider, tagged];
        let pool = candidate_pool(&policy, &agents);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, keep.id);
    }

    #[test]
    fn empty_pool_warns_without_selection() {
        let agents = vec![agent("probe-1", "ord", "colo", 0)];
        let mut policy = sentinel_store::AgentSelectionPolicy::distributed(1);
        policy.include_regions = vec!["mars".to_string()];

        let (selected, warn) = select_agents(&target("10.0.0.1"), &policy, &agents, &mut HashMap::new());
        assert!(selected.is_empty());
        assert!(matches!(warn, Some(PlanWarning::EmptyCandidatePool { .. })));
    }
}

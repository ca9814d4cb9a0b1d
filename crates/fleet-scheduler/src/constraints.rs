//! Placement constraint evaluation against offers and the running fleet.

use regex::Regex;
use std::collections::BTreeMap;

use fleet_model::{Constraint, ConstraintOperator, Instance};

use crate::offer::Offer;

/// Whether placing one more instance on the offered agent satisfies the
/// constraint, given the instances already running for the same spec.
pub fn offer_matches_constraint(
    constraint: &Constraint,
    offer: &Offer,
    running: &[Instance],
) -> bool {
    let offered = offer.attribute(&constraint.field);
    let seen: Vec<String> = running
        .iter()
        .filter_map(|i| i.agent.attribute(&constraint.field))
        .collect();

    match &constraint.operator {
        ConstraintOperator::Unique => match offered {
            Some(value) => !seen.contains(&value),
            None => false,
        },
        ConstraintOperator::Cluster { value } => match offered {
            Some(offered) if !value.is_empty() => offered == *value,
            // Empty value: all instances must agree; the first placement
            // pins the value.
            Some(offered) => seen.first().map(|first| *first == offered).unwrap_or(true),
            None => false,
        },
        ConstraintOperator::GroupBy { value: buckets } => {
            let Some(offered) = offered else { return false };
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for v in &seen {
                *counts.entry(v.as_str()).or_default() += 1;
            }
            let min_count = if *buckets as usize > counts.len() {
                // Some bucket is still empty; only an unseen value keeps
                // the distribution balanced.
                0
            } else {
                counts.values().copied().min().unwrap_or(0)
            };
            counts.get(offered.as_str()).copied().unwrap_or(0) <= min_count
        }
        ConstraintOperator::Like { value } => match (offered, full_match_regex(value)) {
            (Some(offered), Some(re)) => re.is_match(&offered),
            _ => false,
        },
        ConstraintOperator::Unlike { value } => match offered {
            Some(offered) => {
                full_match_regex(value).map(|re| !re.is_match(&offered)).unwrap_or(false)
            }
            None => true,
        },
        ConstraintOperator::MaxPer { value: limit } => match offered {
            Some(offered) => {
                let count = seen.iter().filter(|v| **v == offered).count();
                count < *limit as usize
            }
            None => false,
        },
    }
}

/// Order scale-down victims so that removals keep `GROUP_BY` distributions
/// balanced: instances from over-represented buckets go first. Within one
/// bucket the caller's kill-selection order is preserved.
pub fn order_victims_for_constraints(
    constraints: &[Constraint],
    mut candidates: Vec<Instance>,
) -> Vec<Instance> {
    let group_by = constraints.iter().find(|c| {
        matches!(c.operator, ConstraintOperator::GroupBy { .. })
    });
    let Some(constraint) = group_by else {
        return candidates;
    };
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for instance in &candidates {
        if let Some(value) = instance.agent.attribute(&constraint.field) {
            *counts.entry(value).or_default() += 1;
        }
    }
    // Stable sort keeps the kill-selection order within equal buckets.
    candidates.sort_by_key(|i| {
        std::cmp::Reverse(
            i.agent
                .attribute(&constraint.field)
                .and_then(|v| counts.get(&v).copied())
                .unwrap_or(0),
        )
    });
    candidates
}

fn full_match_regex(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_model::{
        AgentInfo, Attribute, AttributeValue, Condition, InstanceId, InstanceState, PathId,
        UnreachableStrategy,
    };
    use std::collections::BTreeMap as Map;

    fn instance_on(host: &str, rack: Option<&str>) -> Instance {
        let mut attributes = Vec::new();
        if let Some(rack) = rack {
            attributes.push(Attribute {
                name: "rack".to_string(),
                value: AttributeValue::Text(rack.to_string()),
            });
        }
        Instance {
            id: InstanceId::for_run_spec(PathId::parse("/app").unwrap()),
            agent: AgentInfo { host: host.to_string(), agent_id: None, attributes },
            state: InstanceState {
                condition: Condition::Running,
                since: Utc::now(),
                active_since: Some(Utc::now()),
                healthy: None,
            },
            tasks: Map::new(),
            run_spec_version: Utc::now(),
            unreachable_strategy: UnreachableStrategy::default(),
        }
    }

    fn constraint(field: &str, operator: ConstraintOperator) -> Constraint {
        Constraint { field: field.to_string(), operator }
    }

    #[test]
    fn test_unique_hostname() {
        let c = constraint("hostname", ConstraintOperator::Unique);
        let offer = Offer::plain("o", "h1", 1.0, 64.0, None);
        assert!(offer_matches_constraint(&c, &offer, &[]));
        assert!(offer_matches_constraint(&c, &offer, &[instance_on("h2", None)]));
        assert!(!offer_matches_constraint(&c, &offer, &[instance_on("h1", None)]));
    }

    #[test]
    fn test_cluster_with_and_without_value() {
        let offer = Offer::plain("o", "h1", 1.0, 64.0, None);

        let pinned = constraint(
            "hostname",
            ConstraintOperator::Cluster { value: "h1".to_string() },
        );
        assert!(offer_matches_constraint(&pinned, &offer, &[]));

        let wrong = constraint(
            "hostname",
            ConstraintOperator::Cluster { value: "h2".to_string() },
        );
        assert!(!offer_matches_constraint(&wrong, &offer, &[]));

        // Empty value: first placement pins the cluster value.
        let agree = constraint("hostname", ConstraintOperator::Cluster { value: String::new() });
        assert!(offer_matches_constraint(&agree, &offer, &[]));
        assert!(offer_matches_constraint(&agree, &offer, &[instance_on("h1", None)]));
        assert!(!offer_matches_constraint(&agree, &offer, &[instance_on("h2", None)]));
    }

    #[test]
    fn test_group_by_balances() {
        let c = constraint("rack", ConstraintOperator::GroupBy { value: 2 });
        let mut offer = Offer::plain("o", "h", 1.0, 64.0, None);
        offer.attributes.push(Attribute {
            name: "rack".to_string(),
            value: AttributeValue::Text("r1".to_string()),
        });

        // Nothing placed: any rack accepted.
        assert!(offer_matches_constraint(&c, &offer, &[]));

        // One instance on r1, none on r2: r1 must wait for r2.
        let one_on_r1 = [instance_on("h1", Some("r1"))];
        assert!(!offer_matches_constraint(&c, &offer, &one_on_r1));

        // Balanced again: r1 acceptable.
        let balanced = [instance_on("h1", Some("r1")), instance_on("h2", Some("r2"))];
        assert!(offer_matches_constraint(&c, &offer, &balanced));
    }

    #[test]
    fn test_like_and_unlike() {
        let offer = Offer::plain("o", "node-7", 1.0, 64.0, None);
        let like = constraint("hostname", ConstraintOperator::Like { value: "node-[0-9]+".to_string() });
        assert!(offer_matches_constraint(&like, &offer, &[]));
        let unlike =
            constraint("hostname", ConstraintOperator::Unlike { value: "node-7".to_string() });
        assert!(!offer_matches_constraint(&unlike, &offer, &[]));
        // LIKE is a full match, not a substring match.
        let partial = constraint("hostname", ConstraintOperator::Like { value: "node".to_string() });
        assert!(!offer_matches_constraint(&partial, &offer, &[]));
    }

    #[test]
    fn test_max_per() {
        let c = constraint("rack", ConstraintOperator::MaxPer { value: 2 });
        let mut offer = Offer::plain("o", "h", 1.0, 64.0, None);
        offer.attributes.push(Attribute {
            name: "rack".to_string(),
            value: AttributeValue::Text("r1".to_string()),
        });
        let one = [instance_on("h1", Some("r1"))];
        assert!(offer_matches_constraint(&c, &offer, &one));
        let two = [instance_on("h1", Some("r1")), instance_on("h2", Some("r1"))];
        assert!(!offer_matches_constraint(&c, &offer, &two));
    }

    #[test]
    fn test_victim_ordering_prefers_crowded_buckets() {
        let c = constraint("rack", ConstraintOperator::GroupBy { value: 2 });
        let candidates = vec![
            instance_on("h1", Some("r1")),
            instance_on("h2", Some("r2")),
            instance_on("h3", Some("r2")),
        ];
        let ordered = order_victims_for_constraints(&[c], candidates);
        assert_eq!(ordered[0].agent.attribute("rack").as_deref(), Some("r2"));
        assert_eq!(ordered[1].agent.attribute("rack").as_deref(), Some("r2"));
    }
}

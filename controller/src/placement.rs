use crate::error::{self, Result};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kecs_model::constants::LABEL_TASK_FAMILY;
use kecs_model::{PlacementConstraint, PlacementConstraintType};
use maplit::btreemap;
use regex::Regex;
use snafu::OptionExt;
use std::collections::BTreeMap;

/// EC2 instance types the `=~` operator can expand against. Task placement only needs the
/// families commonly used with ECS; an expression matching none of these is rejected rather
/// than silently scheduling everywhere.
const INSTANCE_TYPES: &[&str] = &[
    "t2.nano", "t2.micro", "t2.small", "t2.medium", "t2.large", "t2.xlarge", "t2.2xlarge",
    "t3.nano", "t3.micro", "t3.small", "t3.medium", "t3.large", "t3.xlarge", "t3.2xlarge",
    "m5.large", "m5.xlarge", "m5.2xlarge", "m5.4xlarge",
    "c5.large", "c5.xlarge", "c5.2xlarge", "c5.4xlarge",
    "r5.large", "r5.xlarge", "r5.2xlarge", "r5.4xlarge",
];

const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// The Kubernetes scheduling directives produced from a set of ECS placement constraints.
#[derive(Debug, Default, PartialEq)]
pub struct PlacementRules {
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<Affinity>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Operator {
    Eq,
    Ne,
    In,
    Matches,
}

/// Translate ECS placement constraints into a node selector plus affinity rules.
///
/// `memberOf attribute:X == V` becomes a plain node selector; `!=`, `in` and `=~` become
/// required node-affinity match expressions; `distinctInstance` becomes a preferred
/// pod-anti-affinity keyed on the task family with the hostname topology key. Placement itself
/// is delegated to the Kubernetes scheduler.
pub fn translate_constraints(
    constraints: &[PlacementConstraint],
    task_family: &str,
) -> Result<PlacementRules> {
    let mut node_selector = BTreeMap::new();
    let mut match_expressions: Vec<NodeSelectorRequirement> = Vec::new();
    let mut distinct_instance = false;

    for constraint in constraints {
        match constraint.constraint_type {
            PlacementConstraintType::DistinctInstance => distinct_instance = true,
            PlacementConstraintType::MemberOf => {
                let expression = constraint.expression.as_deref().context(
                    error::InvalidPlacementExpressionSnafu {
                        expression: "",
                        reason: "memberOf requires an expression",
                    },
                )?;
                let (attribute, operator, values) = parse_expression(expression)?;
                let key = kubernetes_label(&attribute);
                match operator {
                    Operator::Eq => {
                        node_selector.insert(key, values.into_iter().next().unwrap_or_default());
                    }
                    Operator::Ne => {
                        match_expressions.push(requirement(key, "NotIn", values));
                    }
                    Operator::In => {
                        match_expressions.push(requirement(key, "In", values));
                    }
                    Operator::Matches => {
                        let expanded = expand_instance_types(expression, &key, &values)?;
                        match_expressions.push(requirement(key, "In", expanded));
                    }
                }
            }
        }
    }

    let node_affinity = if match_expressions.is_empty() {
        None
    } else {
        Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(match_expressions),
                    ..NodeSelectorTerm::default()
                }],
            }),
            ..NodeAffinity::default()
        })
    };

    let pod_anti_affinity = if distinct_instance {
        Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(btreemap! {
                                LABEL_TASK_FAMILY.to_string() => task_family.to_string(),
                            }),
                            ..LabelSelector::default()
                        }),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..PodAffinityTerm::default()
                    },
                },
            ]),
            ..PodAntiAffinity::default()
        })
    } else {
        None
    };

    let affinity = if node_affinity.is_some() || pod_anti_affinity.is_some() {
        Some(Affinity {
            node_affinity,
            pod_anti_affinity,
            ..Affinity::default()
        })
    } else {
        None
    };

    Ok(PlacementRules {
        node_selector,
        affinity,
    })
}

/// Parse a cluster-query-language expression of the form `attribute:NAME OP VALUE`.
fn parse_expression(expression: &str) -> Result<(String, Operator, Vec<String>)> {
    let rest = expression.trim().strip_prefix("attribute:").context(
        error::InvalidPlacementExpressionSnafu {
            expression,
            reason: "expected an 'attribute:' prefix",
        },
    )?;

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 3 {
        return error::InvalidPlacementExpressionSnafu {
            expression,
            reason: "expected 'attribute:NAME OP VALUE'",
        }
        .fail();
    }
    let attribute = tokens[0].to_owned();
    let value = tokens[2..].join(" ");
    let (operator, values) = match tokens[1] {
        "==" => (Operator::Eq, vec![value]),
        "!=" => (Operator::Ne, vec![value]),
        "=~" => (Operator::Matches, vec![value]),
        "in" => {
            let list = value
                .trim_start_matches('[')
                .trim_end_matches(']')
                .split(',')
                .map(|item| item.trim().to_owned())
                .filter(|item| !item.is_empty())
                .collect::<Vec<String>>();
            if list.is_empty() {
                return error::InvalidPlacementExpressionSnafu {
                    expression,
                    reason: "empty 'in' list",
                }
                .fail();
            }
            (Operator::In, list)
        }
        other => {
            return error::InvalidPlacementExpressionSnafu {
                expression,
                reason: format!("unknown operator '{}'", other),
            }
            .fail();
        }
    };
    Ok((attribute, operator, values))
}

/// Map a well-known ECS attribute onto its standard Kubernetes node label. Custom attributes
/// pass through unchanged.
fn kubernetes_label(attribute: &str) -> String {
    match attribute {
        "ecs.instance-type" => INSTANCE_TYPE_LABEL,
        "ecs.availability-zone" => "topology.kubernetes.io/zone",
        "ecs.os-type" => "kubernetes.io/os",
        "ecs.cpu-architecture" => "kubernetes.io/arch",
        other => other,
    }
    .to_owned()
}

/// Expand a `=~` pattern against the known instance types. Only the instance-type attribute
/// can be expanded; node labels cannot be regex-matched by the Kubernetes scheduler.
fn expand_instance_types(expression: &str, key: &str, values: &[String]) -> Result<Vec<String>> {
    if key != INSTANCE_TYPE_LABEL {
        return error::InvalidPlacementExpressionSnafu {
            expression,
            reason: "'=~' is only supported for attribute:ecs.instance-type",
        }
        .fail();
    }
    let pattern = values.first().map(String::as_str).unwrap_or_default();
    let regex = Regex::new(&format!("^{}$", pattern)).ok().context(
        error::InvalidPlacementExpressionSnafu {
            expression,
            reason: "invalid regular expression",
        },
    )?;
    let matches: Vec<String> = INSTANCE_TYPES
        .iter()
        .filter(|candidate| regex.is_match(candidate))
        .map(|candidate| (*candidate).to_owned())
        .collect();
    if matches.is_empty() {
        return error::InvalidPlacementExpressionSnafu {
            expression,
            reason: "matches no known instance types",
        }
        .fail();
    }
    Ok(matches)
}

fn requirement(key: String, operator: &str, values: Vec<String>) -> NodeSelectorRequirement {
    NodeSelectorRequirement {
        key,
        operator: operator.to_owned(),
        values: Some(values),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn member_of(expression: &str) -> PlacementConstraint {
        PlacementConstraint {
            constraint_type: PlacementConstraintType::MemberOf,
            expression: Some(expression.to_string()),
        }
    }

    #[test]
    fn equality_becomes_node_selector() {
        let rules = translate_constraints(
            &[member_of("attribute:ecs.instance-type == t2.micro")],
            "web",
        )
        .unwrap();
        assert_eq!(
            rules.node_selector,
            btreemap! { "node.kubernetes.io/instance-type".to_string() => "t2.micro".to_string() }
        );
        assert!(rules.affinity.is_none());
    }

    #[test]
    fn distinct_instance_becomes_preferred_anti_affinity() {
        let rules = translate_constraints(
            &[PlacementConstraint {
                constraint_type: PlacementConstraintType::DistinctInstance,
                expression: None,
            }],
            "web",
        )
        .unwrap();
        let anti = rules.affinity.unwrap().pod_anti_affinity.unwrap();
        let terms = anti
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].pod_affinity_term.topology_key, "kubernetes.io/hostname");
        assert_eq!(
            terms[0]
                .pod_affinity_term
                .label_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()
                .get(LABEL_TASK_FAMILY),
            Some(&"web".to_string())
        );
    }

    #[test]
    fn regex_expands_instance_family() {
        let rules = translate_constraints(
            &[member_of("attribute:ecs.instance-type =~ t2.*")],
            "web",
        )
        .unwrap();
        let affinity = rules.affinity.unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let requirement = &terms[0].match_expressions.as_ref().unwrap()[0];
        assert_eq!(requirement.key, "node.kubernetes.io/instance-type");
        assert_eq!(requirement.operator, "In");
        let values = requirement.values.as_ref().unwrap();
        assert!(values.contains(&"t2.micro".to_string()));
        assert!(values.contains(&"t2.2xlarge".to_string()));
        assert!(values.iter().all(|v| v.starts_with("t2.")));
    }

    #[test]
    fn in_list_and_not_equal() {
        let rules = translate_constraints(
            &[
                member_of("attribute:ecs.availability-zone in [us-east-1a, us-east-1b]"),
                member_of("attribute:ecs.os-type != windows"),
            ],
            "web",
        )
        .unwrap();
        let affinity = rules.affinity.unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(expressions[0].key, "topology.kubernetes.io/zone");
        assert_eq!(expressions[0].operator, "In");
        assert_eq!(
            expressions[0].values.as_ref().unwrap(),
            &vec!["us-east-1a".to_string(), "us-east-1b".to_string()]
        );
        assert_eq!(expressions[1].key, "kubernetes.io/os");
        assert_eq!(expressions[1].operator, "NotIn");
    }

    #[test]
    fn bad_expressions() {
        for expression in [
            "ecs.instance-type == t2.micro",
            "attribute:ecs.instance-type ~= t2.micro",
            "attribute:ecs.instance-type in []",
            "attribute:ecs.availability-zone =~ us-east.*",
        ] {
            assert!(translate_constraints(&[member_of(expression)], "web").is_err());
        }
    }
}

//! Published status document and the mutations applied to it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A condition as computed by one pass. Timestamps are the store's business.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(r#type: impl Into<String>, status: ConditionStatus) -> Self {
        Self { r#type: r#type.into(), status, reason: String::new(), message: String::new() }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Last generation of a managed resource that this controller acted on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub last_generation: i64,
}

impl GenerationStatus {
    pub fn deployment(namespace: &str, name: &str, generation: i64) -> Self {
        Self {
            group: "apps".into(),
            resource: "deployments".into(),
            namespace: namespace.into(),
            name: name.into(),
            last_generation: generation,
        }
    }

    fn same_target(&self, other: &GenerationStatus) -> bool {
        self.group == other.group
            && self.resource == other.resource
            && self.namespace == other.namespace
            && self.name == other.name
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<OperatorCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<GenerationStatus>,
}

impl OperatorStatus {
    pub fn condition(&self, r#type: &str) -> Option<&OperatorCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    pub fn generation(&self, group: &str, resource: &str, namespace: &str, name: &str) -> Option<i64> {
        self.generations
            .iter()
            .find(|g| g.group == group && g.resource == resource && g.namespace == namespace && g.name == name)
            .map(|g| g.last_generation)
    }
}

/// One field-level change to the status document. A pass hands the store a
/// list of these and the store applies them as a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMutation {
    SetCondition(Condition),
    SetGeneration(GenerationStatus),
}

impl StatusMutation {
    fn apply(&self, status: &mut OperatorStatus, now: DateTime<Utc>) {
        match self {
            StatusMutation::SetCondition(c) => set_condition(&mut status.conditions, c, now),
            StatusMutation::SetGeneration(g) => {
                match status.generations.iter_mut().find(|e| e.same_target(g)) {
                    Some(existing) => existing.last_generation = g.last_generation,
                    None => status.generations.push(g.clone()),
                }
            }
        }
    }
}

// lastTransitionTime only moves when the status value flips.
fn set_condition(conditions: &mut Vec<OperatorCondition>, c: &Condition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|e| e.r#type == c.r#type) {
        Some(existing) => {
            if existing.status != c.status {
                existing.status = c.status;
                existing.last_transition_time = Some(now);
            }
            existing.reason = c.reason.clone();
            existing.message = c.message.clone();
        }
        None => conditions.push(OperatorCondition {
            r#type: c.r#type.clone(),
            status: c.status,
            reason: c.reason.clone(),
            message: c.message.clone(),
            last_transition_time: Some(now),
        }),
    }
}

/// Apply `mutations` to a copy of `current`, in order.
pub fn apply_mutations(current: &OperatorStatus, mutations: &[StatusMutation], now: DateTime<Utc>) -> OperatorStatus {
    let mut next = current.clone();
    for m in mutations {
        m.apply(&mut next, now);
    }
    next
}

/// Result of a single status write-through.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub old: Arc<OperatorStatus>,
    pub new: Arc<OperatorStatus>,
    pub changed: bool,
}

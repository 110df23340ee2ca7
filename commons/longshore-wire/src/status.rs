use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health of a single tracked resource. The derived order ranks worse states
/// higher, so aggregation is a plain `max`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Ready,
    Degraded,
    Unavailable,
    Missing,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Ready => "ready",
            State::Degraded => "degraded",
            State::Unavailable => "unavailable",
            State::Missing => "missing",
        };
        f.write_str(s)
    }
}

/// Worst-wins aggregation: `Missing > Unavailable > Degraded > Ready`.
/// An empty input set yields `Missing`.
pub fn min_state<I>(states: I) -> State
where
    I: IntoIterator<Item = State>,
{
    states.into_iter().max().unwrap_or(State::Missing)
}

/// Health of one tracked resource. Identity is `(kind, name, namespace)`;
/// only `state` changes over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub state: State,
}

impl ResourceState {
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.kind, &self.name, &self.namespace)
    }

    /// Total lexicographic order over the identity fields, used to keep
    /// `AppStatus.resource_states` sorted.
    pub fn identity_order(a: &ResourceState, b: &ResourceState) -> Ordering {
        a.identity().cmp(&b.identity())
    }
}

/// Aggregated application health, replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub app_id: String,
    pub resource_states: Vec<ResourceState>,
    pub updated_at: DateTime<Utc>,
}

impl AppStatus {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            resource_states: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_state_is_worst_wins() {
        assert_eq!(
            min_state([State::Ready, State::Missing, State::Degraded]),
            State::Missing
        );
        assert_eq!(
            min_state([State::Ready, State::Degraded]),
            State::Degraded
        );
        assert_eq!(min_state([State::Ready, State::Ready]), State::Ready);
        assert_eq!(
            min_state([State::Degraded, State::Unavailable]),
            State::Unavailable
        );
    }

    #[test]
    fn min_state_of_empty_set_is_missing() {
        assert_eq!(min_state([]), State::Missing);
    }

    #[test]
    fn identity_order_falls_through_all_fields() {
        let rs = |kind: &str, name: &str, ns: &str| ResourceState {
            kind: kind.into(),
            name: name.into(),
            namespace: ns.into(),
            state: State::Ready,
        };
        // equal kind and name must still order by namespace
        assert_eq!(
            ResourceState::identity_order(
                &rs("deployment", "web", "a"),
                &rs("deployment", "web", "b")
            ),
            Ordering::Less
        );
        assert_eq!(
            ResourceState::identity_order(
                &rs("deployment", "web", "a"),
                &rs("deployment", "web", "a")
            ),
            Ordering::Equal
        );
        assert_eq!(
            ResourceState::identity_order(
                &rs("service", "a", "z"),
                &rs("deployment", "z", "a")
            ),
            Ordering::Greater
        );
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&State::Unavailable).unwrap(),
            r#""unavailable""#
        );
        let s: State = serde_json::from_str(r#""missing""#).unwrap();
        assert_eq!(s, State::Missing);
    }
}

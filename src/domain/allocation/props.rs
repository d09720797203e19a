use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::allocation::allocation::Allocation;

/// Dimensions the façade can aggregate or filter on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationProperty {
    Cluster,
    Node,
    Namespace,
    ControllerKind,
    Controller,
    Pod,
    Container,
    Service,
    ProviderId,
    Label(String),
    Annotation(String),
}

impl FromStr for AllocationProperty {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("label:") {
            return Ok(AllocationProperty::Label(name.to_string()));
        }
        if let Some(name) = s.strip_prefix("annotation:") {
            return Ok(AllocationProperty::Annotation(name.to_string()));
        }
        match s.to_lowercase().as_str() {
            "cluster" => Ok(AllocationProperty::Cluster),
            "node" => Ok(AllocationProperty::Node),
            "namespace" => Ok(AllocationProperty::Namespace),
            "controllerkind" => Ok(AllocationProperty::ControllerKind),
            "controller" => Ok(AllocationProperty::Controller),
            "pod" => Ok(AllocationProperty::Pod),
            "container" => Ok(AllocationProperty::Container),
            "service" => Ok(AllocationProperty::Service),
            "providerid" => Ok(AllocationProperty::ProviderId),
            other => Err(anyhow!("unknown allocation property '{}'", other)),
        }
    }
}

impl AllocationProperty {
    /// Value of this dimension on an allocation. Aggregation names missing
    /// values `__unallocated__` so they do not collapse into one another.
    pub fn value_of(&self, alloc: &Allocation) -> String {
        let p = &alloc.properties;
        let v = match self {
            AllocationProperty::Cluster => p.cluster.clone(),
            AllocationProperty::Node => p.node.clone(),
            AllocationProperty::Namespace => p.namespace.clone(),
            AllocationProperty::ControllerKind => p.controller_kind.clone(),
            AllocationProperty::Controller => p.controller.clone(),
            AllocationProperty::Pod => p.pod.clone(),
            AllocationProperty::Container => p.container.clone(),
            AllocationProperty::Service => p.services.first().cloned().unwrap_or_default(),
            AllocationProperty::ProviderId => p.provider_id.clone(),
            AllocationProperty::Label(name) => p.labels.get(name).cloned().unwrap_or_default(),
            AllocationProperty::Annotation(name) => {
                p.annotations.get(name).cloned().unwrap_or_default()
            }
        };
        if v.is_empty() {
            "__unallocated__".to_string()
        } else {
            v
        }
    }
}

/// How accumulated sub-windows group back together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulateOption {
    None,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    All,
}

impl FromStr for AccumulateOption {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(AccumulateOption::None),
            "hour" => Ok(AccumulateOption::Hour),
            "day" => Ok(AccumulateOption::Day),
            "week" => Ok(AccumulateOption::Week),
            "month" => Ok(AccumulateOption::Month),
            "quarter" => Ok(AccumulateOption::Quarter),
            "all" | "true" => Ok(AccumulateOption::All),
            other => Err(anyhow!("unknown accumulate option '{}'", other)),
        }
    }
}

/// One clause of a filter expression: equality or prefix match (`value*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterClause {
    pub property: AllocationProperty,
    pub value: String,
}

impl FilterClause {
    fn matches(&self, alloc: &Allocation) -> bool {
        let matches_one = |candidate: &str| {
            if let Some(prefix) = self.value.strip_suffix('*') {
                candidate.starts_with(prefix)
            } else {
                candidate == self.value
            }
        };
        // Services are a list; a clause matches when any member does.
        if self.property == AllocationProperty::Service {
            return alloc.properties.services.iter().any(|s| matches_one(s));
        }
        matches_one(&self.property.value_of(alloc))
    }
}

/// Conjunction of clauses. The empty filter matches everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocationFilter {
    pub clauses: Vec<FilterClause>,
}

impl AllocationFilter {
    pub fn none() -> Self {
        AllocationFilter::default()
    }

    pub fn with(mut self, property: AllocationProperty, value: &str) -> Self {
        self.clauses.push(FilterClause {
            property,
            value: value.to_string(),
        });
        self
    }

    pub fn matches(&self, alloc: &Allocation) -> bool {
        self.clauses.iter().all(|c| c.matches(alloc))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::window::Window;
    use crate::domain::allocation::allocation::AllocationProperties;
    use chrono::{TimeZone, Utc};

    fn alloc() -> Allocation {
        let window = Window::new(
            Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 9, 1, 1, 0, 0).unwrap(),
        )
        .unwrap();
        let mut properties = AllocationProperties {
            cluster: "c1".into(),
            node: "n1".into(),
            namespace: "kube-system".into(),
            pod: "dns-1".into(),
            container: "dns".into(),
            ..Default::default()
        };
        properties.labels.insert("team".into(), "platform".into());
        properties.services.push("kube-dns".into());
        Allocation::new(properties, window)
    }

    #[test]
    fn parses_properties() {
        assert_eq!(
            "namespace".parse::<AllocationProperty>().unwrap(),
            AllocationProperty::Namespace
        );
        assert_eq!(
            "label:team".parse::<AllocationProperty>().unwrap(),
            AllocationProperty::Label("team".into())
        );
        assert!("flavor".parse::<AllocationProperty>().is_err());
    }

    #[test]
    fn parses_accumulate_options() {
        assert_eq!(
            "day".parse::<AccumulateOption>().unwrap(),
            AccumulateOption::Day
        );
        assert_eq!(
            "".parse::<AccumulateOption>().unwrap(),
            AccumulateOption::None
        );
        assert!("fortnight".parse::<AccumulateOption>().is_err());
    }

    #[test]
    fn missing_values_aggregate_as_unallocated() {
        let a = alloc();
        assert_eq!(AllocationProperty::Controller.value_of(&a), "__unallocated__");
        assert_eq!(
            AllocationProperty::Label("team".into()).value_of(&a),
            "platform"
        );
    }

    #[test]
    fn filter_conjunction_and_prefix() {
        let a = alloc();
        let f = AllocationFilter::none()
            .with(AllocationProperty::Namespace, "kube-system")
            .with(AllocationProperty::Pod, "dns-*");
        assert!(f.matches(&a));

        let f = f.with(AllocationProperty::Cluster, "other");
        assert!(!f.matches(&a));
    }

    #[test]
    fn service_filter_matches_any_member() {
        let a = alloc();
        let f = AllocationFilter::none().with(AllocationProperty::Service, "kube-dns");
        assert!(f.matches(&a));
        let f = AllocationFilter::none().with(AllocationProperty::Service, "other");
        assert!(!f.matches(&a));
    }
}

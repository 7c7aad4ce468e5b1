//! Offer predicates: can this task run on that offer?
//!
//! A [`PredicateChain`] is a conjunction. Predicates are pure; they read the
//! task and the offer and never reserve anything.

use tracing::trace;

use crate::model::ResourceOffer;
use crate::node::labels;
use crate::podtask::Task;

/// One acceptance rule.
pub trait Predicate: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, task: &Task, offer: &ResourceOffer) -> bool;
}

/// Rejects offers that carry no resources at all when the task needs some.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfferPresentPredicate;

impl Predicate for OfferPresentPredicate {
    fn name(&self) -> &'static str {
        "OfferPresent"
    }

    fn matches(&self, task: &Task, offer: &ResourceOffer) -> bool {
        !offer.resources.is_empty() || (task.cpu().0 <= 0.0 && task.mem().0 <= 0.0)
    }
}

/// Every node selector entry must match a label derived from the offer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSelectorPredicate;

impl Predicate for NodeSelectorPredicate {
    fn name(&self) -> &'static str {
        "NodeSelector"
    }

    fn matches(&self, task: &Task, offer: &ResourceOffer) -> bool {
        let selector = &task.pod.spec.node_selector;
        if selector.is_empty() {
            return true;
        }
        let mut node_labels = labels::attributes_to_labels(&offer.attributes);
        node_labels.insert(labels::HOSTNAME_LABEL.to_string(), offer.hostname.clone());

        selector
            .iter()
            .all(|(k, v)| node_labels.get(k).is_some_and(|have| have == v))
    }
}

/// Every non-zero host port must lie in an offered port range.
///
/// A host port of zero asks for no particular port and never constrains the
/// offer, even one without port ranges.
#[derive(Debug, Default, Clone, Copy)]
pub struct PodFitsPortsPredicate;

impl Predicate for PodFitsPortsPredicate {
    fn name(&self) -> &'static str {
        "PodFitsPorts"
    }

    fn matches(&self, task: &Task, offer: &ResourceOffer) -> bool {
        task.host_ports().into_iter().all(|port| offer.has_port(port))
    }
}

/// The offer must cover the task's CPU and memory limits.
#[derive(Debug, Default, Clone, Copy)]
pub struct PodFitsResourcesPredicate;

impl Predicate for PodFitsResourcesPredicate {
    fn name(&self) -> &'static str {
        "PodFitsResources"
    }

    fn matches(&self, task: &Task, offer: &ResourceOffer) -> bool {
        offer.cpus() >= task.cpu().0 && offer.mem() >= task.mem().0
    }
}

/// Ordered conjunction of predicates.
pub struct PredicateChain {
    predicates: Vec<Box<dyn Predicate>>,
}

impl PredicateChain {
    pub fn new(predicates: Vec<Box<dyn Predicate>>) -> Self {
        Self { predicates }
    }

    /// True iff an offer is present and every predicate accepts it.
    pub fn matches(&self, task: &Task, offer: Option<&ResourceOffer>) -> bool {
        let Some(offer) = offer else {
            return false;
        };
        for predicate in &self.predicates {
            if !predicate.matches(task, offer) {
                trace!(
                    task = %task.id,
                    offer = %offer.id,
                    predicate = predicate.name(),
                    "Offer rejected"
                );
                return false;
            }
        }
        true
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }
}

impl Default for PredicateChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(OfferPresentPredicate),
            Box::new(NodeSelectorPredicate),
            Box::new(PodFitsPortsPredicate),
            Box::new(PodFitsResourcesPredicate),
        ])
    }
}

impl std::fmt::Debug for PredicateChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, Container, Pod};
    use crate::resources::{DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT};
    use proptest::prelude::*;

    const MIN_CPU: f64 = 128.0;
    const MIN_MEM: f64 = 128.0;

    fn task_for(pod: Pod) -> Task {
        Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT)
    }

    fn single_container_task() -> Task {
        task_for(Pod::new("default", "foo").with_container(Container::new("a")))
    }

    #[test]
    fn test_empty_offer() {
        let chain = PredicateChain::default();
        let task = single_container_task();

        assert!(!chain.matches(&task, None), "accepted nil offer");
        assert!(
            !chain.matches(&task, Some(&ResourceOffer::new("n1"))),
            "accepted empty offer"
        );
    }

    #[test]
    fn test_no_ports_in_pod_or_offer() {
        let chain = PredicateChain::default();
        let task = single_container_task();

        let tiny = ResourceOffer::new("n1").with_cpus(0.001).with_mem(0.001);
        assert!(!chain.matches(&task, Some(&tiny)));

        let big = ResourceOffer::new("n1").with_cpus(MIN_CPU).with_mem(MIN_MEM);
        assert!(chain.matches(&task, Some(&big)));
    }

    #[test]
    fn test_accept_offer_ports() {
        let chain = PredicateChain::default();
        let mut task = task_for(Pod::new("default", "foo"));

        let offer = ResourceOffer::new("n1")
            .with_cpus(MIN_CPU)
            .with_mem(MIN_MEM)
            .with_ports(1, 1);
        assert!(chain.matches(&task, Some(&offer)));

        task.pod = Pod::new("default", "foo").with_container(Container::new("a").with_host_port(80, 123));
        crate::resources::limit_pod_cpu(&mut task.pod, DEFAULT_CONTAINER_CPU_LIMIT);
        crate::resources::limit_pod_mem(&mut task.pod, DEFAULT_CONTAINER_MEM_LIMIT);
        assert!(!chain.matches(&task, Some(&offer)));

        task.pod.spec.containers[0].ports[0].host_port = 1;
        assert!(chain.matches(&task, Some(&offer)));

        task.pod.spec.containers[0].ports[0].host_port = 0;
        assert!(chain.matches(&task, Some(&offer)));

        let no_ports = ResourceOffer::new("n1").with_cpus(MIN_CPU).with_mem(MIN_MEM);
        assert!(chain.matches(&task, Some(&no_ports)));

        task.pod.spec.containers[0].ports[0].host_port = 1;
        assert!(!chain.matches(&task, Some(&no_ports)));
    }

    #[test]
    fn test_node_selector() {
        let chain = PredicateChain::default();
        let task = task_for(
            Pod::new("default", "foo")
                .with_container(Container::new("a"))
                .with_node_selector("quarry.dev/attribute-rack", "a1"),
        );

        let matching = ResourceOffer::new("n1")
            .with_cpus(1.0)
            .with_mem(128.0)
            .with_attribute(Attribute::text("rack", "a1"));
        let other_rack = ResourceOffer::new("n2")
            .with_cpus(1.0)
            .with_mem(128.0)
            .with_attribute(Attribute::text("rack", "b2"));
        let unlabeled = ResourceOffer::new("n3").with_cpus(1.0).with_mem(128.0);

        assert!(chain.matches(&task, Some(&matching)));
        assert!(!chain.matches(&task, Some(&other_rack)));
        assert!(!chain.matches(&task, Some(&unlabeled)));
    }

    #[test]
    fn test_node_selector_on_hostname() {
        let task = task_for(
            Pod::new("default", "foo").with_node_selector(labels::HOSTNAME_LABEL, "n1"),
        );
        assert!(NodeSelectorPredicate.matches(&task, &ResourceOffer::new("n1")));
        assert!(!NodeSelectorPredicate.matches(&task, &ResourceOffer::new("n2")));
    }

    #[test]
    fn test_default_chain_order() {
        assert_eq!(
            PredicateChain::default().names(),
            vec!["OfferPresent", "NodeSelector", "PodFitsPorts", "PodFitsResources"]
        );
    }

    proptest! {
        #[test]
        fn explicit_port_matches_iff_in_range(
            port in 1u16..=u16::MAX,
            begin in 1u16..60000,
            width in 0u16..100,
        ) {
            let end = begin.saturating_add(width);
            let mut task = task_for(
                Pod::new("default", "foo").with_container(Container::new("a").with_host_port(80, port)),
            );
            let offer = ResourceOffer::new("n1")
                .with_cpus(MIN_CPU)
                .with_mem(MIN_MEM)
                .with_ports(begin, end);
            let chain = PredicateChain::default();

            prop_assert_eq!(chain.matches(&task, Some(&offer)), begin <= port && port <= end);

            task.pod.spec.containers[0].ports[0].host_port = 0;
            prop_assert!(chain.matches(&task, Some(&offer)));
        }

        #[test]
        fn portless_pod_ignores_offer_ranges(
            ranges in prop::option::of((1u16..60000, 0u16..100)),
        ) {
            let task = single_container_task();
            let mut offer = ResourceOffer::new("n1").with_cpus(1.0).with_mem(64.0);
            if let Some((begin, width)) = ranges {
                offer = offer.with_ports(begin, begin.saturating_add(width));
            }
            prop_assert!(PredicateChain::default().matches(&task, Some(&offer)));
        }
    }
}

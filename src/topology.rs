//! Fan-out target selection.
//!
//! A [`TargetSelector`] maps the origin endpoint of a message to the set of
//! endpoints it should be forwarded to. The router does not care which
//! selector is installed; it only strips the origin from whatever comes back
//! and sends.

use crate::message::EndpointId;
use ahash::AHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Computes fan-out targets from the origin and the currently connected
/// endpoints. Implementations must only return ids from `connected`.
pub trait TargetSelector: Send + Sync {
    fn targets(&self, origin: &EndpointId, connected: &[EndpointId]) -> Vec<EndpointId>;
}

/// Built-in topologies, selected by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Topology {
    /// Every connected endpoint except the origin.
    #[default]
    Broadcast,
    /// Spokes forward only to the hub; the hub forwards to every spoke.
    HubAndSpoke { hub: EndpointId },
    /// Explicit origin -> targets links. Origins without an entry forward
    /// nowhere.
    Adjacency { links: BTreeMap<String, Vec<EndpointId>> },
}

impl Topology {
    /// Compile into a selector.
    pub fn selector(&self) -> Box<dyn TargetSelector> {
        match self {
            Topology::Broadcast => Box::new(BroadcastSelector),
            Topology::HubAndSpoke { hub } => Box::new(HubSelector { hub: hub.clone() }),
            Topology::Adjacency { links } => Box::new(AdjacencySelector {
                links: links
                    .iter()
                    .map(|(origin, targets)| (EndpointId::new(origin.clone()), targets.clone()))
                    .collect(),
            }),
        }
    }
}

struct BroadcastSelector;

impl TargetSelector for BroadcastSelector {
    fn targets(&self, origin: &EndpointId, connected: &[EndpointId]) -> Vec<EndpointId> {
        connected.iter().filter(|id| *id != origin).cloned().collect()
    }
}

struct HubSelector {
    hub: EndpointId,
}

impl TargetSelector for HubSelector {
    fn targets(&self, origin: &EndpointId, connected: &[EndpointId]) -> Vec<EndpointId> {
        if *origin == self.hub {
            return connected.iter().filter(|id| *id != origin).cloned().collect();
        }
        if connected.contains(&self.hub) {
            vec![self.hub.clone()]
        } else {
            Vec::new()
        }
    }
}

struct AdjacencySelector {
    links: AHashMap<EndpointId, Vec<EndpointId>>,
}

impl TargetSelector for AdjacencySelector {
    fn targets(&self, origin: &EndpointId, connected: &[EndpointId]) -> Vec<EndpointId> {
        match self.links.get(origin) {
            Some(targets) => targets
                .iter()
                .filter(|id| *id != origin && connected.contains(id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

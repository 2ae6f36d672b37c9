use std::{fmt::Debug, time::Duration};

use super::description::{ServerAddress, ServerDescription, ServerType, TopologyType};
use crate::selection_criteria::{ReadPreference, TagSet};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Narrows a set of candidate servers to those suitable for an operation. Deployments apply the
/// selector to every known server and pick one of the survivors.
pub trait ServerSelector: Debug + Send + Sync {
    fn select<'a>(
        &self,
        topology: TopologyType,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription>;
}

/// Selects the servers eligible for a read preference in the given topology.
#[derive(Clone, Debug)]
pub struct ReadPreferenceSelector {
    read_preference: ReadPreference,
}

impl ReadPreferenceSelector {
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }
}

impl ServerSelector for ReadPreferenceSelector {
    fn select<'a>(
        &self,
        topology: TopologyType,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        match topology {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => candidates,
            TopologyType::Sharded => with_types(candidates, &[ServerType::Mongos]),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                suitable_servers_in_replica_set(&self.read_preference, candidates)
            }
        }
    }
}

fn with_types<'a>(
    candidates: Vec<&'a ServerDescription>,
    types: &[ServerType],
) -> Vec<&'a ServerDescription> {
    candidates
        .into_iter()
        .filter(|server| types.contains(&server.server_type))
        .collect()
}

fn suitable_servers_in_replica_set<'a>(
    read_preference: &ReadPreference,
    candidates: Vec<&'a ServerDescription>,
) -> Vec<&'a ServerDescription> {
    let tag_sets = read_preference.tag_sets();
    let secondaries = |candidates: &[&'a ServerDescription]| {
        let mut servers = with_types(candidates.to_vec(), &[ServerType::RsSecondary]);
        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }
        servers
    };

    match read_preference {
        ReadPreference::Primary => with_types(candidates, &[ServerType::RsPrimary]),
        ReadPreference::Secondary { .. } => secondaries(&candidates),
        ReadPreference::PrimaryPreferred { .. } => {
            let primaries = with_types(candidates.clone(), &[ServerType::RsPrimary]);
            if primaries.is_empty() {
                secondaries(&candidates)
            } else {
                primaries
            }
        }
        ReadPreference::SecondaryPreferred { .. } => {
            let servers = secondaries(&candidates);
            if servers.is_empty() {
                with_types(candidates, &[ServerType::RsPrimary])
            } else {
                servers
            }
        }
        ReadPreference::Nearest { .. } => {
            let mut servers = with_types(
                candidates,
                &[ServerType::RsPrimary, ServerType::RsSecondary],
            );
            if let Some(tag_sets) = tag_sets {
                filter_servers_by_tag_sets(&mut servers, tag_sets);
            }
            servers
        }
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);
            return;
        }
    }

    servers.clear();
}

/// Keeps only the servers whose average round trip time is within `local_threshold` of the
/// fastest candidate.
#[derive(Clone, Debug)]
pub struct LatencySelector {
    local_threshold: Duration,
}

impl LatencySelector {
    pub fn new(local_threshold: impl Into<Option<Duration>>) -> Self {
        Self {
            local_threshold: local_threshold.into().unwrap_or(DEFAULT_LOCAL_THRESHOLD),
        }
    }
}

impl ServerSelector for LatencySelector {
    fn select<'a>(
        &self,
        _topology: TopologyType,
        mut candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        let shortest = candidates
            .iter()
            .filter_map(|server| server.average_round_trip_time)
            .min();
        // Without any measurements there is nothing to compare against.
        let Some(shortest) = shortest else {
            return candidates;
        };
        let max_rtt = shortest + self.local_threshold;
        candidates.retain(|server| {
            server
                .average_round_trip_time
                .map(|rtt| rtt <= max_rtt)
                .unwrap_or(false)
        });
        candidates
    }
}

/// Applies each selector in turn to the survivors of the previous one.
#[derive(Debug)]
pub struct CompositeSelector {
    selectors: Vec<Box<dyn ServerSelector>>,
}

impl CompositeSelector {
    pub fn new(selectors: Vec<Box<dyn ServerSelector>>) -> Self {
        Self { selectors }
    }

    /// The selector used when an operation doesn't supply one: the read preference (primary when
    /// unset) followed by the default latency window.
    pub(crate) fn for_read_preference(read_preference: Option<&ReadPreference>) -> Self {
        let read_preference = read_preference.cloned().unwrap_or(ReadPreference::Primary);
        Self::new(vec![
            Box::new(ReadPreferenceSelector::new(read_preference)),
            Box::new(LatencySelector::new(None)),
        ])
    }
}

impl ServerSelector for CompositeSelector {
    fn select<'a>(
        &self,
        topology: TopologyType,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        self.selectors
            .iter()
            .fold(candidates, |candidates, selector| {
                selector.select(topology, candidates)
            })
    }
}

/// Selects exactly the server at the given address. Cursors use this to stay on the server that
/// owns them.
#[derive(Clone, Debug)]
pub struct AddressSelector {
    address: ServerAddress,
}

impl AddressSelector {
    pub fn new(address: ServerAddress) -> Self {
        Self { address }
    }
}

impl ServerSelector for AddressSelector {
    fn select<'a>(
        &self,
        _topology: TopologyType,
        candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        candidates
            .into_iter()
            .filter(|server| server.address == self.address)
            .collect()
    }
}

/// Drops deprioritized servers from `candidates` in a sharded topology, unless that would leave
/// nothing to choose from.
pub fn filter_deprioritized<'a>(
    topology: TopologyType,
    candidates: Vec<&'a ServerDescription>,
    deprioritized: &[ServerAddress],
) -> Vec<&'a ServerDescription> {
    if topology != TopologyType::Sharded || deprioritized.is_empty() {
        return candidates;
    }
    let preferred: Vec<_> = candidates
        .iter()
        .copied()
        .filter(|server| !deprioritized.contains(&server.address))
        .collect();
    if preferred.is_empty() {
        candidates
    } else {
        preferred
    }
}

/// Runs a full selection over `servers`: unavailable servers are skipped, deprioritized servers
/// are dropped where possible, then `selector` narrows the rest.
pub fn suitable_servers<'a>(
    topology: TopologyType,
    servers: impl IntoIterator<Item = &'a ServerDescription>,
    selector: &dyn ServerSelector,
    deprioritized: &[ServerAddress],
) -> Vec<&'a ServerDescription> {
    let available = servers
        .into_iter()
        .filter(|server| server.is_available())
        .collect();
    let candidates = filter_deprioritized(topology, available, deprioritized);
    selector.select(topology, candidates)
}

// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::bgp::msg_update::{
    AsPathSegment, AsPathSegmentType, Origin, PathAttrValue, PathAttribute, UpdateMessage,
};
use crate::rib::types::RouteSource;
use std::cmp::Ordering;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// LOCAL_PREF assumed for paths that do not carry one.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// BGP path attributes of one path.
/// Compiler-checked equality (no manual PartialEq needed).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathAttrs {
    pub origin: Origin,
    pub as_path: Vec<AsPathSegment>,
    pub next_hop: Ipv4Addr,
    pub source: RouteSource,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<(u16, Ipv4Addr)>,
    pub unknown_attrs: Vec<PathAttribute>,
    /// RFC 4456 ORIGINATOR_ID
    pub originator_id: Option<Ipv4Addr>,
    /// RFC 4456 CLUSTER_LIST
    pub cluster_list: Vec<Ipv4Addr>,
}

impl PathAttrs {
    /// Encode as UPDATE path attributes, ordered by type code.
    pub fn to_attributes(&self) -> Vec<PathAttribute> {
        let mut attrs = vec![
            PathAttribute::new(PathAttrValue::Origin(self.origin)),
            PathAttribute::new(PathAttrValue::AsPath(self.as_path.clone())),
            PathAttribute::new(PathAttrValue::NextHop(self.next_hop)),
        ];
        if let Some(med) = self.med {
            attrs.push(PathAttribute::new(PathAttrValue::MultiExitDisc(med)));
        }
        if let Some(local_pref) = self.local_pref {
            attrs.push(PathAttribute::new(PathAttrValue::LocalPref(local_pref)));
        }
        if self.atomic_aggregate {
            attrs.push(PathAttribute::new(PathAttrValue::AtomicAggregate));
        }
        if let Some((asn, address)) = self.aggregator {
            attrs.push(PathAttribute::new(PathAttrValue::Aggregator { asn, address }));
        }
        if let Some(id) = self.originator_id {
            attrs.push(PathAttribute::new(PathAttrValue::OriginatorId(id)));
        }
        if !self.cluster_list.is_empty() {
            attrs.push(PathAttribute::new(PathAttrValue::ClusterList(
                self.cluster_list.clone(),
            )));
        }
        attrs.extend(self.unknown_attrs.iter().cloned());
        attrs
    }
}

/// A route was refused before entering Adj-RIB-In.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteRejected {
    MissingAttribute(&'static str),
    /// ORIGINATOR_ID or CLUSTER_LIST shows the route already passed through us.
    ReflectionLoop,
}

impl fmt::Display for RouteRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRejected::MissingAttribute(name) => write!(f, "missing {} attribute", name),
            RouteRejected::ReflectionLoop => write!(f, "route reflection loop"),
        }
    }
}

impl std::error::Error for RouteRejected {}

/// Knobs of the decision process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionConfig {
    /// Compare MED between paths from different neighboring ASes.
    pub always_compare_med: bool,
}

/// A path as stored in the RIBs. Shared between tables through `Arc<Path>`;
/// use .attrs for attribute comparison, Arc::ptr_eq() for identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub attrs: PathAttrs,
    /// IGP metric to the next hop, resolved when the path is accepted.
    pub igp_cost: u32,
}

impl Path {
    pub fn origin(&self) -> Origin {
        self.attrs.origin
    }

    pub fn as_path(&self) -> &[AsPathSegment] {
        &self.attrs.as_path
    }

    pub fn next_hop(&self) -> Ipv4Addr {
        self.attrs.next_hop
    }

    pub fn source(&self) -> RouteSource {
        self.attrs.source
    }

    pub fn local_pref(&self) -> Option<u32> {
        self.attrs.local_pref
    }

    pub fn med(&self) -> Option<u32> {
        self.attrs.med
    }

    pub fn originator_id(&self) -> Option<Ipv4Addr> {
        self.attrs.originator_id
    }

    pub fn cluster_list(&self) -> &[Ipv4Addr] {
        &self.attrs.cluster_list
    }

    /// A locally originated path. Next hop 0.0.0.0 means "self" and is
    /// rewritten on export.
    pub fn local() -> Self {
        Path {
            attrs: PathAttrs {
                origin: Origin::IGP,
                as_path: vec![],
                next_hop: Ipv4Addr::UNSPECIFIED,
                source: RouteSource::Local,
                local_pref: Some(DEFAULT_LOCAL_PREF),
                med: None,
                atomic_aggregate: false,
                aggregator: None,
                unknown_attrs: vec![],
                originator_id: None,
                cluster_list: vec![],
            },
            igp_cost: 0,
        }
    }

    /// Build the path carried by an UPDATE's announced prefixes.
    ///
    /// ORIGIN, AS_PATH and NEXT_HOP are mandatory. LOCAL_PREF is only
    /// honoured from internal peers and defaults to 100 there.
    pub fn from_update_msg(
        update_msg: &UpdateMessage,
        source: RouteSource,
        igp_cost: u32,
    ) -> Result<Self, RouteRejected> {
        let origin = update_msg
            .get_origin()
            .ok_or(RouteRejected::MissingAttribute("ORIGIN"))?;
        let as_path = update_msg
            .get_as_path()
            .ok_or(RouteRejected::MissingAttribute("AS_PATH"))?;
        let next_hop = update_msg
            .get_next_hop()
            .ok_or(RouteRejected::MissingAttribute("NEXT_HOP"))?;

        let local_pref = match source {
            RouteSource::Ibgp { .. } => {
                Some(update_msg.get_local_pref().unwrap_or(DEFAULT_LOCAL_PREF))
            }
            _ => None,
        };

        Ok(Path {
            attrs: PathAttrs {
                origin,
                as_path,
                next_hop,
                source,
                local_pref,
                med: update_msg.get_med(),
                atomic_aggregate: update_msg.get_atomic_aggregate(),
                aggregator: update_msg.get_aggregator(),
                unknown_attrs: update_msg.get_unknown_attrs(),
                originator_id: update_msg.get_originator_id(),
                cluster_list: update_msg.get_cluster_list(),
            },
            igp_cost,
        })
    }

    /// AS_SEQUENCE counts each ASN, AS_SET counts as 1 regardless of size.
    pub fn as_path_length(&self) -> usize {
        self.as_path()
            .iter()
            .map(|segment| match segment.segment_type {
                AsPathSegmentType::AsSequence => segment.asn_list.len(),
                AsPathSegmentType::AsSet => 1,
            })
            .sum()
    }

    /// First AS of the leading AS_SEQUENCE, None for locally originated paths.
    pub(crate) fn neighboring_as(&self) -> Option<u16> {
        match self.as_path().first() {
            Some(segment) if segment.segment_type == AsPathSegmentType::AsSequence => {
                segment.asn_list.first().copied()
            }
            _ => None,
        }
    }

    pub fn contains_asn(&self, asn: u16) -> bool {
        self.as_path()
            .iter()
            .any(|segment| segment.asn_list.contains(&asn))
    }

    /// Router id used for the final tie-break: ORIGINATOR_ID when reflected.
    fn router_id(&self) -> Ipv4Addr {
        self.originator_id()
            .or_else(|| self.source().bgp_id())
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

impl Path {
    /// Compare paths for best path selection per RFC 4271 9.1.2.2.
    /// Returns Ordering::Greater if self is better.
    ///
    /// Not transitive across neighboring ASes when MED is only compared
    /// within one AS. Rank a candidate set with `rank_paths` instead of
    /// sorting by this directly.
    pub fn best_path_cmp(&self, other: &Self, config: &DecisionConfig) -> Ordering {
        self.compare(other, self.med_comparable(other, config))
    }

    /// Whether MED takes part when comparing these two paths.
    pub(crate) fn med_comparable(&self, other: &Self, config: &DecisionConfig) -> bool {
        config.always_compare_med || self.neighboring_as() == other.neighboring_as()
    }

    /// Every step but MED. Total over paths from distinct sources.
    pub(crate) fn cmp_without_med(&self, other: &Self) -> Ordering {
        self.compare(other, false)
    }

    fn compare(&self, other: &Self, compare_med: bool) -> Ordering {
        // Step 1: highest LOCAL_PREF
        let self_local_pref = self.local_pref().unwrap_or(DEFAULT_LOCAL_PREF);
        let other_local_pref = other.local_pref().unwrap_or(DEFAULT_LOCAL_PREF);
        match self_local_pref.cmp(&other_local_pref) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 2: shortest AS_PATH
        match other.as_path_length().cmp(&self.as_path_length()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 3: lowest ORIGIN (IGP < EGP < INCOMPLETE)
        match other.origin().cmp(&self.origin()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 4: lowest MED, missing MED is 0. Only comparable within the
        // same neighboring AS unless always_compare_med is set.
        if compare_med {
            let self_med = self.med().unwrap_or(0);
            let other_med = other.med().unwrap_or(0);
            match other_med.cmp(&self_med) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        // Step 5: eBGP over iBGP. Local routes beat anything learned.
        match source_rank(&self.source()).cmp(&source_rank(&other.source())) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 6: lowest IGP cost to the next hop
        match other.igp_cost.cmp(&self.igp_cost) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 7: lowest router id
        match other.router_id().cmp(&self.router_id()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Two peers may share a router id; fall back to the peer address
        other.source().peer_ip().cmp(&self.source().peer_ip())
    }
}

/// Order candidate paths best-first, independent of their input order.
///
/// Each neighboring AS group is reduced to its winner with MED in play, then
/// the group winners are compared without MED. The overall winner is taken
/// out and the rest is ranked again, so every position is chosen the same way.
pub fn rank_paths(mut remaining: Vec<Arc<Path>>, config: &DecisionConfig) -> Vec<Arc<Path>> {
    let mut ranked = Vec::with_capacity(remaining.len());
    while let Some(idx) = best_index(&remaining, config) {
        ranked.push(remaining.swap_remove(idx));
    }
    ranked
}

fn best_index(paths: &[Arc<Path>], config: &DecisionConfig) -> Option<usize> {
    let mut group_winners: Vec<usize> = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        match group_winners
            .iter()
            .position(|&winner| paths[winner].med_comparable(path, config))
        {
            Some(group) => {
                if path.best_path_cmp(&paths[group_winners[group]], config) == Ordering::Greater {
                    group_winners[group] = idx;
                }
            }
            None => group_winners.push(idx),
        }
    }

    group_winners.into_iter().reduce(|best, idx| {
        if paths[idx].cmp_without_med(&paths[best]) == Ordering::Greater {
            idx
        } else {
            best
        }
    })
}

fn source_rank(source: &RouteSource) -> u8 {
    match source {
        RouteSource::Local => 2,
        RouteSource::Ebgp { .. } => 1,
        RouteSource::Ibgp { .. } => 0,
    }
}

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

//! Route propagation: export rules, export attributes and the per-peer
//! Adj-RIB-Out diff that turns Loc-RIB changes into UPDATE messages.

use crate::bgp::msg::{Message, BGP_HEADER_SIZE_BYTES, MAX_MESSAGE_SIZE};
use crate::bgp::msg_update::{AsPathSegment, AsPathSegmentType, PathAttrFlag, UpdateMessage};
use crate::log::{debug, error};
use crate::net::Ipv4Net;
use crate::peer::PeerOp;
use crate::rib::rib_loc::LocRib;
use crate::rib::rib_out::AdjRibOut;
use crate::rib::{Path, PathAttrs, RouteSource, DEFAULT_LOCAL_PREF};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The receiving side of an export.
#[derive(Debug, Clone, Copy)]
pub struct ExportTarget {
    pub peer_ip: IpAddr,
    pub peer_asn: u16,
    pub local_asn: u16,
    pub local_router_id: Ipv4Addr,
    /// Our address on the session, used as NEXT_HOP self.
    pub local_ip: Option<Ipv4Addr>,
    pub rr_client: bool,
    /// The local speaker reflects routes between iBGP peers.
    pub route_reflector: bool,
}

impl ExportTarget {
    pub fn is_ebgp(&self) -> bool {
        self.peer_asn != self.local_asn
    }

    fn next_hop_self(&self) -> Ipv4Addr {
        self.local_ip.unwrap_or(self.local_router_id)
    }
}

/// Export rules: may `path` be advertised to `target` at all?
pub fn should_export(path: &Path, target: &ExportTarget) -> bool {
    // Never back to the peer it came from
    if path.source().is_from(target.peer_ip) {
        return false;
    }

    if target.is_ebgp() {
        // The peer would drop it as a loop
        return !path.contains_asn(target.peer_asn);
    }

    match path.source() {
        RouteSource::Ibgp { rr_client, .. } => {
            // RFC 4456: iBGP routes only go to iBGP peers by reflection
            target.route_reflector && (rr_client || target.rr_client)
        }
        RouteSource::Ebgp { .. } | RouteSource::Local => true,
    }
}

/// True if the export to `target` reflects an iBGP-learned route.
fn is_reflection(path: &Path, target: &ExportTarget) -> bool {
    !target.is_ebgp() && path.source().is_ibgp()
}

/// RFC 4271 5.1.2: prepend the local ASN towards eBGP peers, leave the path
/// untouched towards iBGP peers. AS_SET segments are preserved.
pub fn build_export_as_path(path: &Path, local_asn: u16, is_ebgp: bool) -> Vec<AsPathSegment> {
    if !is_ebgp {
        return path.as_path().to_vec();
    }

    let mut segments = path.as_path().to_vec();
    match segments.first_mut() {
        Some(first)
            if first.segment_type == AsPathSegmentType::AsSequence
                && first.asn_list.len() < u8::MAX as usize =>
        {
            first.asn_list.insert(0, local_asn);
        }
        _ => segments.insert(0, AsPathSegment::sequence(vec![local_asn])),
    }
    segments
}

/// RFC 4271 5.1.3: NEXT_HOP self towards eBGP peers. Towards iBGP peers the
/// received NEXT_HOP is kept, locally originated routes get self.
pub fn build_export_next_hop(path: &Path, target: &ExportTarget) -> Ipv4Addr {
    if target.is_ebgp() || path.next_hop().is_unspecified() {
        target.next_hop_self()
    } else {
        path.next_hop()
    }
}

/// Attributes of `path` as sent to `target`. None if it must not be sent.
pub fn export_path(path: &Arc<Path>, target: &ExportTarget) -> Option<Arc<Path>> {
    if !should_export(path, target) {
        return None;
    }

    let is_ebgp = target.is_ebgp();
    let attrs = &path.attrs;

    let (local_pref, med, originator_id, cluster_list) = if is_ebgp {
        // MED only crosses one AS boundary; keep it when we set it
        let med = if path.source().is_local() { attrs.med } else { None };
        (None, med, None, vec![])
    } else if is_reflection(path, target) {
        let originator_id = attrs.originator_id.or_else(|| path.source().bgp_id());
        let mut cluster_list = vec![target.local_router_id];
        cluster_list.extend_from_slice(&attrs.cluster_list);
        (
            Some(attrs.local_pref.unwrap_or(DEFAULT_LOCAL_PREF)),
            attrs.med,
            originator_id,
            cluster_list,
        )
    } else {
        (
            Some(attrs.local_pref.unwrap_or(DEFAULT_LOCAL_PREF)),
            attrs.med,
            attrs.originator_id,
            attrs.cluster_list.clone(),
        )
    };

    // Unrecognized optional transitive attributes pass on marked Partial,
    // non-transitive ones stop here
    let unknown_attrs = attrs
        .unknown_attrs
        .iter()
        .filter(|attr| attr.is_transitive())
        .cloned()
        .map(|mut attr| {
            attr.flags |= PathAttrFlag::PARTIAL;
            attr
        })
        .collect();

    Some(Arc::new(Path {
        attrs: PathAttrs {
            origin: attrs.origin,
            as_path: build_export_as_path(path, target.local_asn, is_ebgp),
            next_hop: build_export_next_hop(path, target),
            source: attrs.source,
            local_pref,
            med,
            atomic_aggregate: attrs.atomic_aggregate,
            aggregator: attrs.aggregator,
            unknown_attrs,
            originator_id,
            cluster_list,
        },
        igp_cost: path.igp_cost,
    }))
}

/// Changes to advertise to one peer.
#[derive(Debug, Default, PartialEq)]
pub struct PeerExport {
    pub withdrawn: Vec<Ipv4Net>,
    pub announced: Vec<(Ipv4Net, Arc<Path>)>,
}

impl PeerExport {
    pub fn is_empty(&self) -> bool {
        self.withdrawn.is_empty() && self.announced.is_empty()
    }
}

/// Diff the Loc-RIB best paths for `prefixes` against the peer's Adj-RIB-Out.
///
/// Adj-RIB-Out is updated here, before anything is sent. A prefix whose
/// exported attributes are unchanged produces nothing.
pub fn compute_peer_export(
    loc_rib: &LocRib,
    rib_out: &mut AdjRibOut,
    target: &ExportTarget,
    prefixes: &[Ipv4Net],
) -> PeerExport {
    let mut export = PeerExport::default();

    for prefix in prefixes {
        let exported = loc_rib
            .get_best_path(prefix)
            .and_then(|best| export_path(best, target));

        match exported {
            Some(path) => {
                if rib_out.insert(*prefix, Arc::clone(&path)) {
                    export.announced.push((*prefix, path));
                }
            }
            None => {
                if rib_out.remove_prefix(prefix) {
                    export.withdrawn.push(*prefix);
                }
            }
        }
    }
    export
}

/// Every prefix relevant to a full resync: all Loc-RIB prefixes plus
/// whatever the peer still holds from us.
pub fn full_sync_prefixes(loc_rib: &LocRib, rib_out: &AdjRibOut) -> Vec<Ipv4Net> {
    let prefixes: BTreeSet<Ipv4Net> = loc_rib
        .iter_best()
        .map(|(prefix, _)| prefix)
        .chain(rib_out.prefixes())
        .collect();
    prefixes.into_iter().collect()
}

// 2-byte withdrawn routes length + 2-byte total path attribute length
const UPDATE_FIXED_LEN: usize = BGP_HEADER_SIZE_BYTES + 4;

fn nlri_len(prefix: &Ipv4Net) -> usize {
    1 + prefix.wire_len()
}

/// Split prefixes into chunks that fit in one message next to `overhead` bytes.
fn chunk_prefixes(prefixes: &[Ipv4Net], overhead: usize) -> Vec<Vec<Ipv4Net>> {
    let budget = (MAX_MESSAGE_SIZE as usize).saturating_sub(overhead);
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;

    for prefix in prefixes {
        let len = nlri_len(prefix);
        if used + len > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(*prefix);
        used += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Group announcements by attribute set, preserving first-seen order.
fn batch_announcements_by_path(announced: &[(Ipv4Net, Arc<Path>)]) -> Vec<(PathAttrs, Vec<Ipv4Net>)> {
    let mut index: HashMap<&PathAttrs, usize> = HashMap::new();
    let mut batches: Vec<(PathAttrs, Vec<Ipv4Net>)> = Vec::new();

    for (prefix, path) in announced {
        match index.get(&path.attrs) {
            Some(&i) => batches[i].1.push(*prefix),
            None => {
                index.insert(&path.attrs, batches.len());
                batches.push((path.attrs.clone(), vec![*prefix]));
            }
        }
    }
    batches
}

/// Encode a peer export as UPDATE messages no larger than 4096 bytes.
/// Withdrawals come first, in their own messages.
pub fn build_updates(export: &PeerExport) -> Vec<UpdateMessage> {
    let mut updates = Vec::new();

    for chunk in chunk_prefixes(&export.withdrawn, UPDATE_FIXED_LEN) {
        updates.push(UpdateMessage::new_withdraw(chunk));
    }

    for (attrs, prefixes) in batch_announcements_by_path(&export.announced) {
        let path_attributes = attrs.to_attributes();
        let overhead = UpdateMessage::new(path_attributes.clone(), vec![])
            .serialize()
            .len();
        for chunk in chunk_prefixes(&prefixes, overhead) {
            updates.push(UpdateMessage::new(path_attributes.clone(), chunk));
        }
    }
    updates
}

/// Queue the UPDATE messages of `export` on the peer's channel.
pub fn send_export_to_peer(
    peer_ip: IpAddr,
    peer_tx: &mpsc::UnboundedSender<PeerOp>,
    export: &PeerExport,
) {
    if export.is_empty() {
        return;
    }
    for update in build_updates(export) {
        if let Err(e) = peer_tx.send(PeerOp::SendUpdate(update)) {
            error!(%peer_ip, error = %e, "failed to queue UPDATE for peer");
            return;
        }
    }
    debug!(
        %peer_ip,
        announced = export.announced.len(),
        withdrawn = export.withdrawn.len(),
        "propagated routes to peer"
    );
}

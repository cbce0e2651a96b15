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

//! Management query contract: request handlers on the coordinator, response
//! payloads and a client handle.

use crate::config::PeerConfig;
use crate::bgp::msg_notification::CeaseSubcode;
use crate::bgp::msg_update::{AsPathSegment, AsPathSegmentType};
use crate::log::{debug, info, warn};
use crate::net::Ipv4Net;
use crate::peer::{BgpState, PeerOp, PeerStatistics, SessionType};
use crate::rib::{Path, Route};
use crate::server::{BgpServer, MgmtOp, PeerInfo};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Errors reported to management callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtError {
    PeerNotFound(IpAddr),
    InvalidAddress(String),
    PeerExists(IpAddr),
    InvalidConfig(String),
    /// The coordinator is gone
    ServerShutdown,
}

impl fmt::Display for MgmtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MgmtError::PeerNotFound(addr) => write!(f, "peer {} not found", addr),
            MgmtError::InvalidAddress(addr) => write!(f, "invalid address {:?}", addr),
            MgmtError::PeerExists(addr) => write!(f, "peer {} already exists", addr),
            MgmtError::InvalidConfig(msg) => write!(f, "{}", msg),
            MgmtError::ServerShutdown => write!(f, "server shut down"),
        }
    }
}

impl std::error::Error for MgmtError {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub address: IpAddr,
    pub remote_asn: u16,
    pub state: BgpState,
    pub session_type: SessionType,
    pub bgp_id: Option<Ipv4Addr>,
    pub update_count: u64,
    pub routes_received: usize,
    pub routes_advertised: usize,
    pub routes_rejected: u64,
    pub statistics: PeerStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    pub prefix: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub as_path: String,
    pub origin: String,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    /// Peer address, or "local"
    pub source: String,
    pub best: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RibSummary {
    pub address: IpAddr,
    pub remote_asn: u16,
    pub routes: Vec<RouteSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub listen_addr: Option<SocketAddr>,
    pub asn: u16,
    pub router_id: Ipv4Addr,
    pub peer_count: usize,
    pub route_count: usize,
}

/// Render a response payload as JSON.
pub fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String, serde_json::Error> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

fn format_as_path(segments: &[AsPathSegment]) -> String {
    segments
        .iter()
        .map(|seg| {
            let asns: Vec<String> = seg.asn_list.iter().map(|asn| asn.to_string()).collect();
            match seg.segment_type {
                AsPathSegmentType::AsSequence => asns.join(" "),
                AsPathSegmentType::AsSet => format!("{{{}}}", asns.join(",")),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl RouteSummary {
    pub fn from_path(prefix: Ipv4Net, path: &Path, best: bool) -> Self {
        RouteSummary {
            prefix,
            next_hop: path.next_hop(),
            as_path: format_as_path(path.as_path()),
            origin: path.origin().to_string(),
            local_pref: path.local_pref(),
            med: path.med(),
            source: match path.source().peer_ip() {
                Some(ip) => ip.to_string(),
                None => "local".to_string(),
            },
            best,
        }
    }
}

/// Summaries sorted by prefix, candidates in preference order.
fn summarize_routes(routes: Vec<Route>, best_only: bool) -> Vec<RouteSummary> {
    let mut routes = routes;
    routes.sort_by_key(|route| route.prefix);
    routes
        .iter()
        .flat_map(|route| {
            let take = if best_only { 1 } else { route.paths.len() };
            route
                .paths
                .iter()
                .take(take)
                .enumerate()
                .map(move |(i, path)| RouteSummary::from_path(route.prefix, path, i == 0))
        })
        .collect()
}

fn parse_peer_addr(addr: &str) -> Result<IpAddr, MgmtError> {
    addr.parse()
        .map_err(|_| MgmtError::InvalidAddress(addr.to_string()))
}

impl PeerInfo {
    fn summary(&self, address: IpAddr, statistics: PeerStatistics) -> PeerSummary {
        PeerSummary {
            address,
            remote_asn: self.config.remote_asn,
            state: self.state,
            session_type: self.session_type,
            bgp_id: self.bgp_id,
            update_count: self.update_count,
            routes_received: self.adj_rib_in.prefix_count(),
            routes_advertised: self.adj_rib_out.prefix_count(),
            routes_rejected: self.routes_rejected,
            statistics,
        }
    }
}

/// Ask a peer task for its counters. A gone task yields zeroed counters.
async fn fetch_statistics(peer_tx: mpsc::UnboundedSender<PeerOp>) -> PeerStatistics {
    let (tx, rx) = oneshot::channel();
    if peer_tx.send(PeerOp::GetStatistics(tx)).is_err() {
        return PeerStatistics::default();
    }
    rx.await.unwrap_or_default()
}

impl BgpServer {
    pub(crate) fn handle_mgmt_op(&mut self, op: MgmtOp) {
        match op {
            MgmtOp::GetPeer { addr, response } => self.handle_get_peer(addr, response),
            MgmtOp::GetPeers { response } => self.handle_get_peers(response),
            MgmtOp::GetAdjRibIn { addr, response } => {
                let _ = response.send(self.rib_summary(&addr, |peer| peer.adj_rib_in.get_all_routes()));
            }
            MgmtOp::GetAdjRibOut { addr, response } => {
                let _ = response.send(self.rib_summary(&addr, |peer| peer.adj_rib_out.get_routes()));
            }
            MgmtOp::GetLocRib { response } => {
                let _ = response.send(summarize_routes(self.loc_rib.get_all_routes(), false));
            }
            MgmtOp::GetLocRibBest { response } => {
                let _ = response.send(summarize_routes(self.loc_rib.get_all_routes(), true));
            }
            MgmtOp::AddPeer { config, response } => {
                let _ = response.send(self.handle_add_peer(config));
            }
            MgmtOp::RemovePeer { addr, response } => {
                let _ = response.send(self.handle_remove_peer(&addr));
            }
            MgmtOp::AddRoute { prefix, response } => {
                if self.loc_rib.add_local_route(prefix, Arc::new(Path::local())) {
                    self.propagate_routes(&[prefix]);
                }
                let _ = response.send(Ok(()));
            }
            MgmtOp::RemoveRoute { prefix, response } => {
                let removed = match self.loc_rib.remove_local_route(prefix) {
                    Some(changed) => {
                        if changed {
                            self.propagate_routes(&[prefix]);
                        }
                        true
                    }
                    None => false,
                };
                let _ = response.send(Ok(removed));
            }
            MgmtOp::GetServerInfo { response } => {
                let _ = response.send(ServerInfo {
                    listen_addr: self.local_addr,
                    asn: self.config.asn,
                    router_id: self.config.router_id,
                    peer_count: self.peers.len(),
                    route_count: self.loc_rib.routes_len(),
                });
            }
        }
    }

    /// Statistics live in the peer task; the reply is completed off the
    /// coordinator loop so a busy peer never stalls it.
    fn handle_get_peer(
        &self,
        addr: String,
        response: oneshot::Sender<Result<PeerSummary, MgmtError>>,
    ) {
        let peer_ip = match parse_peer_addr(&addr) {
            Ok(ip) => ip,
            Err(e) => {
                let _ = response.send(Err(e));
                return;
            }
        };
        let Some(peer) = self.peers.get(&peer_ip) else {
            let _ = response.send(Err(MgmtError::PeerNotFound(peer_ip)));
            return;
        };

        let summary = peer.summary(peer_ip, PeerStatistics::default());
        let peer_tx = peer.peer_tx.clone();
        tokio::spawn(async move {
            let statistics = fetch_statistics(peer_tx).await;
            let _ = response.send(Ok(PeerSummary {
                statistics,
                ..summary
            }));
        });
    }

    fn handle_get_peers(&self, response: oneshot::Sender<Vec<PeerSummary>>) {
        let mut pending: Vec<(PeerSummary, mpsc::UnboundedSender<PeerOp>)> = self
            .peers
            .iter()
            .map(|(ip, peer)| (peer.summary(*ip, PeerStatistics::default()), peer.peer_tx.clone()))
            .collect();
        pending.sort_by_key(|(summary, _)| summary.address);

        tokio::spawn(async move {
            let mut summaries = Vec::with_capacity(pending.len());
            for (summary, peer_tx) in pending {
                let statistics = fetch_statistics(peer_tx).await;
                summaries.push(PeerSummary {
                    statistics,
                    ..summary
                });
            }
            let _ = response.send(summaries);
        });
    }

    fn rib_summary(
        &self,
        addr: &str,
        routes: impl FnOnce(&PeerInfo) -> Vec<Route>,
    ) -> Result<RibSummary, MgmtError> {
        let peer_ip = parse_peer_addr(addr)?;
        let peer = self
            .peers
            .get(&peer_ip)
            .ok_or(MgmtError::PeerNotFound(peer_ip))?;
        Ok(RibSummary {
            address: peer_ip,
            remote_asn: peer.config.remote_asn,
            routes: summarize_routes(routes(peer), false),
        })
    }

    fn handle_add_peer(&mut self, config: PeerConfig) -> Result<(), MgmtError> {
        let peer_ip = parse_peer_addr(&config.address)?;
        if self.peers.contains_key(&peer_ip) {
            return Err(MgmtError::PeerExists(peer_ip));
        }
        config
            .validate()
            .map_err(|e| MgmtError::InvalidConfig(e.to_string()))?;
        self.spawn_peer(peer_ip, config);
        Ok(())
    }

    /// Stop the peer task and withdraw everything learned from it.
    fn handle_remove_peer(&mut self, addr: &str) -> Result<(), MgmtError> {
        let peer_ip = parse_peer_addr(addr)?;
        let peer = self
            .peers
            .remove(&peer_ip)
            .ok_or(MgmtError::PeerNotFound(peer_ip))?;

        if peer
            .peer_tx
            .send(PeerOp::Shutdown(CeaseSubcode::PeerDeconfigured))
            .is_err()
        {
            warn!(%peer_ip, "peer task already gone");
        }

        let changed = self.loc_rib.remove_routes_from_peer(peer_ip);
        debug!(%peer_ip, changed = changed.len(), "withdrawing routes of removed peer");
        self.propagate_routes(&changed);
        info!(%peer_ip, "peer removed");
        Ok(())
    }
}

/// Cloneable client for the management query contract.
#[derive(Clone)]
pub struct MgmtHandle {
    tx: mpsc::UnboundedSender<MgmtOp>,
}

impl MgmtHandle {
    pub fn new(tx: mpsc::UnboundedSender<MgmtOp>) -> Self {
        MgmtHandle { tx }
    }

    async fn request<T>(
        &self,
        make_op: impl FnOnce(oneshot::Sender<T>) -> MgmtOp,
    ) -> Result<T, MgmtError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make_op(tx))
            .map_err(|_| MgmtError::ServerShutdown)?;
        rx.await.map_err(|_| MgmtError::ServerShutdown)
    }

    pub async fn get_peer(&self, addr: &str) -> Result<PeerSummary, MgmtError> {
        let addr = addr.to_string();
        self.request(|response| MgmtOp::GetPeer { addr, response })
            .await?
    }

    pub async fn get_peers(&self) -> Result<Vec<PeerSummary>, MgmtError> {
        self.request(|response| MgmtOp::GetPeers { response }).await
    }

    pub async fn get_adj_rib_in(&self, addr: &str) -> Result<RibSummary, MgmtError> {
        let addr = addr.to_string();
        self.request(|response| MgmtOp::GetAdjRibIn { addr, response })
            .await?
    }

    pub async fn get_adj_rib_out(&self, addr: &str) -> Result<RibSummary, MgmtError> {
        let addr = addr.to_string();
        self.request(|response| MgmtOp::GetAdjRibOut { addr, response })
            .await?
    }

    pub async fn get_loc_rib(&self) -> Result<Vec<RouteSummary>, MgmtError> {
        self.request(|response| MgmtOp::GetLocRib { response }).await
    }

    pub async fn get_loc_rib_best(&self) -> Result<Vec<RouteSummary>, MgmtError> {
        self.request(|response| MgmtOp::GetLocRibBest { response })
            .await
    }

    pub async fn add_peer(&self, config: PeerConfig) -> Result<(), MgmtError> {
        self.request(|response| MgmtOp::AddPeer { config, response })
            .await?
    }

    pub async fn remove_peer(&self, addr: &str) -> Result<(), MgmtError> {
        let addr = addr.to_string();
        self.request(|response| MgmtOp::RemovePeer { addr, response })
            .await?
    }

    pub async fn add_route(&self, prefix: Ipv4Net) -> Result<(), MgmtError> {
        self.request(|response| MgmtOp::AddRoute { prefix, response })
            .await?
    }

    pub async fn remove_route(&self, prefix: Ipv4Net) -> Result<bool, MgmtError> {
        self.request(|response| MgmtOp::RemoveRoute { prefix, response })
            .await?
    }

    pub async fn get_server_info(&self) -> Result<ServerInfo, MgmtError> {
        self.request(|response| MgmtOp::GetServerInfo { response })
            .await
    }
}

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

//! Server coordinator.
//!
//! `BgpServer::run` is the only writer of RIB state. Peer tasks and the
//! management gateway talk to it over channels and every message is handled
//! to completion before the next one is read.

use crate::bgp::msg_update::UpdateMessage;
use crate::config::{Config, ConfigError, PeerConfig};
use crate::log::{debug, info, warn};
use crate::net::{peer_ip, Ipv4Net};
use crate::peer::{BgpState, Peer, PeerOp, SessionType};
use crate::propagate::{
    compute_peer_export, full_sync_prefixes, send_export_to_peer, ExportTarget,
};
use crate::rib::rib_in::AdjRibIn;
use crate::rib::rib_loc::LocRib;
use crate::rib::rib_out::AdjRibOut;
use crate::rib::{DecisionConfig, Path, RouteRejected, RouteSource};
use crate::server_ops::{
    MgmtError, MgmtHandle, PeerSummary, RibSummary, RouteSummary, ServerInfo,
};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Messages from peer tasks to the coordinator.
#[derive(Debug)]
pub enum ServerOp {
    PeerStateChanged {
        peer_ip: IpAddr,
        state: BgpState,
    },
    PeerEstablished {
        peer_ip: IpAddr,
        bgp_id: Ipv4Addr,
        /// Our end of the session, used as NEXT_HOP self
        local_ip: Option<Ipv4Addr>,
    },
    PeerUpdate {
        peer_ip: IpAddr,
        update: UpdateMessage,
    },
    /// Session torn down; every route from this peer is withdrawn
    PeerDisconnected {
        peer_ip: IpAddr,
    },
    /// Peer asked for the full Adj-RIB-Out again
    RouteRefresh {
        peer_ip: IpAddr,
    },
}

/// Management requests. Each carries the channel its single response goes to.
pub enum MgmtOp {
    GetPeer {
        addr: String,
        response: oneshot::Sender<Result<PeerSummary, MgmtError>>,
    },
    GetPeers {
        response: oneshot::Sender<Vec<PeerSummary>>,
    },
    GetAdjRibIn {
        addr: String,
        response: oneshot::Sender<Result<RibSummary, MgmtError>>,
    },
    GetAdjRibOut {
        addr: String,
        response: oneshot::Sender<Result<RibSummary, MgmtError>>,
    },
    /// Every candidate path per prefix
    GetLocRib {
        response: oneshot::Sender<Vec<RouteSummary>>,
    },
    /// Only the selected path per prefix
    GetLocRibBest {
        response: oneshot::Sender<Vec<RouteSummary>>,
    },
    AddPeer {
        config: PeerConfig,
        response: oneshot::Sender<Result<(), MgmtError>>,
    },
    RemovePeer {
        addr: String,
        response: oneshot::Sender<Result<(), MgmtError>>,
    },
    /// Originate a prefix locally
    AddRoute {
        prefix: Ipv4Net,
        response: oneshot::Sender<Result<(), MgmtError>>,
    },
    /// Stop originating a prefix. Responds with whether it was originated.
    RemoveRoute {
        prefix: Ipv4Net,
        response: oneshot::Sender<Result<bool, MgmtError>>,
    },
    GetServerInfo {
        response: oneshot::Sender<ServerInfo>,
    },
}

/// Coordinator-side view of a configured peer.
pub struct PeerInfo {
    pub config: PeerConfig,
    pub state: BgpState,
    pub session_type: SessionType,
    /// Router id from the peer's OPEN, while established
    pub bgp_id: Option<Ipv4Addr>,
    pub local_ip: Option<Ipv4Addr>,
    pub adj_rib_in: AdjRibIn,
    pub adj_rib_out: AdjRibOut,
    pub peer_tx: mpsc::UnboundedSender<PeerOp>,
    pub update_count: u64,
    /// Announced prefixes rejected before reaching Adj-RIB-In
    pub routes_rejected: u64,
}

impl PeerInfo {
    fn new(config: PeerConfig, local_asn: u16, peer_tx: mpsc::UnboundedSender<PeerOp>) -> Self {
        PeerInfo {
            session_type: SessionType::from_asns(local_asn, config.remote_asn),
            config,
            state: BgpState::Idle,
            bgp_id: None,
            local_ip: None,
            adj_rib_in: AdjRibIn::new(),
            adj_rib_out: AdjRibOut::new(),
            peer_tx,
            update_count: 0,
            routes_rejected: 0,
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == BgpState::Established
    }

    fn route_source(&self, peer_ip: IpAddr) -> RouteSource {
        RouteSource::from_session(
            self.session_type,
            peer_ip,
            self.bgp_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
            self.config.route_reflector_client,
        )
    }

    fn export_target(&self, peer_ip: IpAddr, config: &Config) -> ExportTarget {
        ExportTarget {
            peer_ip,
            peer_asn: self.config.remote_asn,
            local_asn: config.asn,
            local_router_id: config.router_id,
            local_ip: self.local_ip,
            rr_client: self.config.route_reflector_client,
            route_reflector: config.route_reflector,
        }
    }
}

pub struct BgpServer {
    pub config: Config,
    pub peers: HashMap<IpAddr, PeerInfo>,
    pub loc_rib: LocRib,
    pub mgmt_tx: mpsc::UnboundedSender<MgmtOp>,
    mgmt_rx: mpsc::UnboundedReceiver<MgmtOp>,
    server_tx: mpsc::UnboundedSender<ServerOp>,
    server_rx: mpsc::UnboundedReceiver<ServerOp>,
    /// Bound listener address, once running
    pub(crate) local_addr: Option<SocketAddr>,
}

impl BgpServer {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let (mgmt_tx, mgmt_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let mut loc_rib = LocRib::new(DecisionConfig {
            always_compare_med: config.always_compare_med,
        });
        for network in &config.networks {
            loc_rib.add_local_route(*network, Arc::new(Path::local()));
        }

        Ok(BgpServer {
            config,
            peers: HashMap::new(),
            loc_rib,
            mgmt_tx,
            mgmt_rx,
            server_tx,
            server_rx,
            local_addr: None,
        })
    }

    /// Client for the management query contract.
    pub fn mgmt_handle(&self) -> MgmtHandle {
        MgmtHandle::new(self.mgmt_tx.clone())
    }

    pub async fn run(mut self) -> io::Result<()> {
        let listener = if self.config.listen {
            let addr = self
                .config
                .listen_sockaddr()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            let listener = TcpListener::bind(addr).await?;
            self.local_addr = Some(listener.local_addr()?);
            Some(listener)
        } else {
            None
        };
        info!(
            listen_addr = ?self.local_addr,
            asn = self.config.asn,
            router_id = %self.config.router_id,
            "BGP server starting"
        );

        let peer_configs = self.config.peers.clone();
        for peer_config in peer_configs {
            match peer_config.ip() {
                Ok(ip) => self.spawn_peer(ip, peer_config),
                Err(e) => warn!(error = %e, "skipping peer"),
            }
        }

        loop {
            tokio::select! {
                result = accept(&listener) => {
                    match result {
                        Ok((stream, _)) => self.accept_peer(stream),
                        Err(e) => warn!(error = %e, "failed to accept connection"),
                    }
                }
                Some(op) = self.server_rx.recv() => {
                    self.handle_server_op(op);
                }
                Some(op) = self.mgmt_rx.recv() => {
                    self.handle_mgmt_op(op);
                }
            }
        }
    }

    pub(crate) fn spawn_peer(&mut self, peer_ip: IpAddr, config: PeerConfig) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            peer_ip,
            config.clone(),
            &self.config,
            peer_rx,
            self.server_tx.clone(),
        );
        tokio::spawn(peer.run());
        info!(%peer_ip, remote_asn = config.remote_asn, "peer added");
        self.peers
            .insert(peer_ip, PeerInfo::new(config, self.config.asn, peer_tx));
    }

    /// Hand an inbound connection to the peer task for its source address.
    fn accept_peer(&mut self, stream: TcpStream) {
        let Some(addr) = peer_ip(&stream) else {
            return;
        };
        // IPv4-mapped sources from dual-stack listeners
        let addr = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
            v4 => v4,
        };

        match self.peers.get(&addr) {
            Some(peer) => {
                debug!(peer_ip = %addr, "inbound connection");
                let _ = peer.peer_tx.send(PeerOp::TcpConnectionAccepted { stream });
            }
            None => {
                info!(peer_ip = %addr, "rejecting connection from unconfigured peer");
            }
        }
    }

    pub(crate) fn handle_server_op(&mut self, op: ServerOp) {
        match op {
            ServerOp::PeerStateChanged { peer_ip, state } => {
                if let Some(peer) = self.peers.get_mut(&peer_ip) {
                    debug!(%peer_ip, ?state, "peer state changed");
                    peer.state = state;
                }
            }
            ServerOp::PeerEstablished {
                peer_ip,
                bgp_id,
                local_ip,
            } => self.handle_peer_established(peer_ip, bgp_id, local_ip),
            ServerOp::PeerUpdate { peer_ip, update } => self.handle_peer_update(peer_ip, update),
            ServerOp::PeerDisconnected { peer_ip } => self.handle_peer_down(peer_ip),
            ServerOp::RouteRefresh { peer_ip } => {
                info!(%peer_ip, "ROUTE-REFRESH received, resending Adj-RIB-Out");
                if let Some(peer) = self.peers.get_mut(&peer_ip) {
                    peer.adj_rib_out.clear();
                }
                self.sync_peer(peer_ip);
            }
        }
    }

    fn handle_peer_established(
        &mut self,
        peer_ip: IpAddr,
        bgp_id: Ipv4Addr,
        local_ip: Option<Ipv4Addr>,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_ip) else {
            return;
        };
        peer.state = BgpState::Established;
        peer.bgp_id = Some(bgp_id);
        peer.local_ip = local_ip;
        peer.adj_rib_out.clear();
        info!(%peer_ip, %bgp_id, session_type = ?peer.session_type, "peer established");

        self.sync_peer(peer_ip);
    }

    /// Send the peer everything in Loc-RIB it does not have yet.
    fn sync_peer(&mut self, peer_ip: IpAddr) {
        let Some(peer) = self.peers.get_mut(&peer_ip) else {
            return;
        };
        if !peer.is_established() {
            return;
        }
        let target = peer.export_target(peer_ip, &self.config);
        let prefixes = full_sync_prefixes(&self.loc_rib, &peer.adj_rib_out);
        let export = compute_peer_export(&self.loc_rib, &mut peer.adj_rib_out, &target, &prefixes);
        send_export_to_peer(peer_ip, &peer.peer_tx, &export);
    }

    /// Apply one UPDATE to Adj-RIB-In and Loc-RIB, then propagate changes.
    fn handle_peer_update(&mut self, peer_ip: IpAddr, update: UpdateMessage) {
        let router_id = self.config.router_id;
        let Some(peer) = self.peers.get_mut(&peer_ip) else {
            return;
        };
        if !peer.is_established() {
            debug!(%peer_ip, "ignoring UPDATE from peer that is not established");
            return;
        }
        peer.update_count += 1;

        let mut withdrawn = update.withdrawn_routes().to_vec();
        let mut announced = Vec::new();

        if !update.nlri_list().is_empty() {
            let source = peer.route_source(peer_ip);
            let result = Path::from_update_msg(&update, source, 0).and_then(|mut path| {
                if path.originator_id() == Some(router_id)
                    || path.cluster_list().contains(&router_id)
                {
                    return Err(RouteRejected::ReflectionLoop);
                }
                path.igp_cost = self.config.igp_cost(path.next_hop());
                Ok(Arc::new(path))
            });

            match result {
                Ok(path) => {
                    for prefix in update.nlri_list() {
                        announced.push((*prefix, Arc::clone(&path)));
                    }
                }
                Err(reason) => {
                    // Treat as withdraw so a stale earlier route does not linger
                    peer.routes_rejected += update.nlri_list().len() as u64;
                    warn!(
                        %peer_ip,
                        %reason,
                        prefixes = update.nlri_list().len(),
                        "rejected announced routes"
                    );
                    withdrawn.extend_from_slice(update.nlri_list());
                }
            }
        }

        for prefix in &withdrawn {
            peer.adj_rib_in.remove_route(*prefix);
        }
        for (prefix, path) in &announced {
            peer.adj_rib_in.add_route(*prefix, Arc::clone(path));
        }

        let changed = self
            .loc_rib
            .apply_peer_update(peer_ip, &withdrawn, &announced);
        debug!(
            %peer_ip,
            withdrawn = withdrawn.len(),
            announced = announced.len(),
            changed = changed.len(),
            "UPDATE processed"
        );
        self.propagate_routes(&changed);
    }

    /// Implicit withdrawal of everything the peer sent us.
    fn handle_peer_down(&mut self, peer_ip: IpAddr) {
        let Some(peer) = self.peers.get_mut(&peer_ip) else {
            return;
        };
        // The Idle state change trails this op; stop exporting to it now
        peer.state = BgpState::Idle;
        let removed = peer.adj_rib_in.clear();
        peer.adj_rib_out.clear();
        peer.bgp_id = None;
        peer.local_ip = None;
        info!(%peer_ip, routes = removed.len(), "peer disconnected");

        let changed = self.loc_rib.remove_routes_from_peer(peer_ip);
        self.propagate_routes(&changed);
    }

    /// Diff the changed prefixes against every established peer's Adj-RIB-Out.
    pub(crate) fn propagate_routes(&mut self, changed: &[Ipv4Net]) {
        if changed.is_empty() {
            return;
        }
        for (peer_ip, peer) in self.peers.iter_mut() {
            if !peer.is_established() {
                continue;
            }
            let target = peer.export_target(*peer_ip, &self.config);
            let export = compute_peer_export(&self.loc_rib, &mut peer.adj_rib_out, &target, changed);
            send_export_to_peer(*peer_ip, &peer.peer_tx, &export);
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

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

use crate::net::Ipv4Net;
use crate::peer::SessionType;
use crate::rib::path::Path;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Where a path came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum RouteSource {
    /// Learned from an eBGP peer, with the peer's BGP identifier.
    Ebgp { peer_ip: IpAddr, bgp_id: Ipv4Addr },
    /// Learned from an iBGP peer. `rr_client` is set when we reflect for that peer.
    Ibgp {
        peer_ip: IpAddr,
        bgp_id: Ipv4Addr,
        rr_client: bool,
    },
    /// Originated by this speaker.
    Local,
}

impl RouteSource {
    pub fn from_session(
        session_type: SessionType,
        peer_ip: IpAddr,
        bgp_id: Ipv4Addr,
        rr_client: bool,
    ) -> Self {
        match session_type {
            SessionType::Ebgp => RouteSource::Ebgp { peer_ip, bgp_id },
            SessionType::Ibgp => RouteSource::Ibgp {
                peer_ip,
                bgp_id,
                rr_client,
            },
        }
    }

    pub fn is_rr_client(&self) -> bool {
        matches!(
            self,
            RouteSource::Ibgp {
                rr_client: true,
                ..
            }
        )
    }

    pub fn is_ibgp(&self) -> bool {
        matches!(self, RouteSource::Ibgp { .. })
    }

    pub fn is_ebgp(&self) -> bool {
        matches!(self, RouteSource::Ebgp { .. })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RouteSource::Local)
    }

    pub fn bgp_id(&self) -> Option<Ipv4Addr> {
        match self {
            RouteSource::Ebgp { bgp_id, .. } | RouteSource::Ibgp { bgp_id, .. } => Some(*bgp_id),
            RouteSource::Local => None,
        }
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        match self {
            RouteSource::Ebgp { peer_ip, .. } | RouteSource::Ibgp { peer_ip, .. } => Some(*peer_ip),
            RouteSource::Local => None,
        }
    }

    /// True if this path was received from `peer_ip`.
    pub fn is_from(&self, peer_ip: IpAddr) -> bool {
        self.peer_ip() == Some(peer_ip)
    }
}

/// All candidate paths to a prefix, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: Ipv4Net,
    pub paths: Vec<Arc<Path>>,
}

impl Route {
    pub fn best(&self) -> Option<&Arc<Path>> {
        self.paths.first()
    }
}

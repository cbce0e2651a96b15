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

//! Management queries and peer lifecycle through the handle.

mod utils;
pub use utils::*;

use rbgp::bgp::msg_notification::{BgpError, CeaseSubcode};
use rbgp::config::PeerConfig;
use rbgp::peer::BgpState;
use rbgp::server_ops::{to_json, MgmtError};
use std::net::Ipv4Addr;

#[tokio::test]
async fn test_server_info() {
    let mut config = test_config(65001);
    config.networks = vec![prefix("10.200.0.0/16")];
    config.peers.push(passive_peer("127.0.0.2", 65002));
    let server = start_test_server(config).await;

    let info = server.handle.get_server_info().await.unwrap();
    assert_eq!(info.asn, 65001);
    assert_eq!(info.router_id, Ipv4Addr::new(1, 1, 1, 1));
    assert_eq!(info.peer_count, 1);
    assert_eq!(info.route_count, 1);
    assert_eq!(info.listen_addr.map(|a| a.port()), Some(server.bgp_port));
}

#[tokio::test]
async fn test_unknown_peer() {
    let server = setup_server_with_passive_peer().await;
    assert_eq!(
        server.handle.get_peer("192.0.2.1").await,
        Err(MgmtError::PeerNotFound("192.0.2.1".parse().unwrap()))
    );
    assert_eq!(
        server.handle.get_adj_rib_out("bogus").await,
        Err(MgmtError::InvalidAddress("bogus".to_string()))
    );
    assert!(matches!(
        server.handle.remove_peer("192.0.2.1").await,
        Err(MgmtError::PeerNotFound(_))
    ));
}

#[tokio::test]
async fn test_add_peer_at_runtime() {
    let server = start_test_server(test_config(65001)).await;
    assert!(server.handle.get_peers().await.unwrap().is_empty());

    let config = PeerConfig {
        passive_mode: true,
        ..PeerConfig::new("127.0.0.4", 65004)
    };
    server.handle.add_peer(config.clone()).await.unwrap();
    assert_eq!(
        server.handle.add_peer(config).await,
        Err(MgmtError::PeerExists("127.0.0.4".parse().unwrap()))
    );
    assert!(matches!(
        server.handle.add_peer(PeerConfig::new("127.0.0.5", 0)).await,
        Err(MgmtError::InvalidConfig(_))
    ));

    poll_peer_state(&server, "127.0.0.4", BgpState::Active).await;
    let _peer =
        FakePeer::connect_and_handshake("127.0.0.4", &server, 65004, Ipv4Addr::new(4, 4, 4, 4))
            .await;
    poll_peer_state(&server, "127.0.0.4", BgpState::Established).await;

    let peers = server.handle.get_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote_asn, 65004);
}

#[tokio::test]
async fn test_remove_peer_sends_cease() {
    let (server, mut peer) = setup_server_and_fake_peer().await;
    peer.send_update(build_announce(
        vec![prefix("10.10.0.0/24")],
        vec![65002],
        Ipv4Addr::new(127, 0, 0, 2),
        vec![],
    ))
    .await;
    poll_until(
        || async { server.best_prefixes().await.len() == 1 },
        "Timeout waiting for route",
    )
    .await;

    server.handle.remove_peer("127.0.0.2").await.unwrap();

    let notif = peer.read_notification().await;
    assert_eq!(
        notif.error(),
        &BgpError::Cease(CeaseSubcode::PeerDeconfigured)
    );
    assert!(server.best_prefixes().await.is_empty());
    assert!(matches!(
        server.handle.get_peer("127.0.0.2").await,
        Err(MgmtError::PeerNotFound(_))
    ));
}

#[tokio::test]
async fn test_peer_summary_json() {
    let (server, _peer) = setup_server_and_fake_peer().await;
    let peers = server.handle.get_peers().await.unwrap();
    let json = to_json(&peers, false).unwrap();
    assert!(json.contains(r#""address":"127.0.0.2""#));
    assert!(json.contains(r#""state":"Established""#));
    assert!(json.contains(r#""session_type":"Ebgp""#));
}

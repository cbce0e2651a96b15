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

use super::fsm::{BgpState, FsmEvent};
use super::{Peer, PeerError, PeerOp, TcpConnection, TIMER_TICK};
use crate::bgp::msg_keepalive::KeepaliveMessage;
use crate::bgp::msg_notification::{BgpError, CeaseSubcode, NotificationMessage};
use crate::bgp::msg_open::OpenMessage;
use crate::log::{debug, info, warn};
use crate::net::create_and_bind_tcp_socket;
use crate::server::ServerOp;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

impl Peer {
    /// Idle: start immediately the first time, otherwise after one connect
    /// retry interval. Passive peers go straight back to listening.
    /// Returns true if shutdown requested.
    pub(super) async fn handle_idle_state(&mut self) -> bool {
        let delay = if self.restarting && !self.fsm.passive_mode() {
            self.fsm.timers.connect_retry_time
        } else {
            Duration::ZERO
        };
        // Ops answered while waiting must not push the restart back
        let restart_at = Instant::now() + delay;

        loop {
            tokio::select! {
                op = self.peer_rx.recv() => match op {
                    Some(PeerOp::Shutdown(_)) | None => return true,
                    Some(PeerOp::GetStatistics(response)) => {
                        let _ = response.send(self.statistics.clone());
                    }
                    Some(PeerOp::TcpConnectionAccepted { stream }) => {
                        debug!(peer_ip = %self.addr, "connection refused in Idle state");
                        drop(stream);
                    }
                    Some(PeerOp::SendUpdate(_)) => {}
                },
                _ = tokio::time::sleep_until(restart_at) => {
                    self.restarting = true;
                    let event = self.fsm.start_event();
                    self.try_process_event(&event).await;
                    return false;
                }
            }
        }
    }

    /// Connect: dial the peer while honouring the connect retry timer and
    /// accepting an inbound connection if one arrives first.
    pub(super) async fn handle_connect_state(&mut self) -> bool {
        let peer_addr = SocketAddr::new(self.addr, self.config.port);
        let connect = create_and_bind_tcp_socket(self.local_ip, peer_addr);
        tokio::pin!(connect);
        let mut timer_interval = tokio::time::interval(TIMER_TICK);

        loop {
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok(stream) => {
                            info!(peer_ip = %self.addr, "TCP connection established");
                            self.connection_up(stream).await;
                        }
                        Err(e) => {
                            debug!(peer_ip = %self.addr, error = %e, "TCP connection failed");
                            self.try_process_event(&FsmEvent::TcpConnectionFails).await;
                        }
                    }
                    return false;
                }
                op = self.peer_rx.recv() => {
                    if let Some(shutdown) = self.handle_unconnected_op(op).await {
                        return shutdown;
                    }
                }
                _ = timer_interval.tick() => {
                    if self.fsm.timers.connect_retry_expired() {
                        debug!(peer_ip = %self.addr, "ConnectRetryTimer expired");
                        self.try_process_event(&FsmEvent::ConnectRetryTimerExpires).await;
                        return false;
                    }
                }
            }
        }
    }

    /// Active: wait for the server to hand over an inbound connection.
    pub(super) async fn handle_active_state(&mut self) -> bool {
        let mut timer_interval = tokio::time::interval(TIMER_TICK);

        loop {
            tokio::select! {
                op = self.peer_rx.recv() => {
                    if let Some(shutdown) = self.handle_unconnected_op(op).await {
                        return shutdown;
                    }
                }
                _ = timer_interval.tick() => {
                    if self.fsm.timers.connect_retry_expired() {
                        self.try_process_event(&FsmEvent::ConnectRetryTimerExpires).await;
                        if self.fsm.state() != BgpState::Active {
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Handles an op while no connection exists. Returns Some(shutdown) when
    /// the caller should leave its state loop.
    async fn handle_unconnected_op(&mut self, op: Option<PeerOp>) -> Option<bool> {
        match op {
            Some(PeerOp::Shutdown(subcode)) => {
                self.try_process_event(&FsmEvent::AutomaticStop(subcode)).await;
                Some(true)
            }
            None => Some(true),
            Some(PeerOp::TcpConnectionAccepted { stream }) => {
                debug!(peer_ip = %self.addr, "TcpConnectionAccepted");
                self.connection_up(stream).await;
                Some(false)
            }
            Some(PeerOp::GetStatistics(response)) => {
                let _ = response.send(self.statistics.clone());
                None
            }
            Some(PeerOp::SendUpdate(_)) => None,
        }
    }

    async fn connection_up(&mut self, stream: TcpStream) {
        self.conn = Some(TcpConnection::new(stream, self.addr));
        self.try_process_event(&FsmEvent::TcpConnectionConfirmed).await;
    }

    /// Process FSM event, transition state, and execute associated actions.
    pub(super) async fn process_event(&mut self, event: &FsmEvent) -> Result<(), PeerError> {
        let old_state = self.fsm.state();
        let new_state = self.fsm.handle_event(event);

        match (old_state, new_state) {
            (BgpState::Idle, BgpState::Connect | BgpState::Active) => {
                self.fsm.timers.start_connect_retry();
            }
            (BgpState::Connect | BgpState::Active, BgpState::Connect | BgpState::Active) => {
                if matches!(event, FsmEvent::ConnectRetryTimerExpires) {
                    self.fsm.timers.start_connect_retry();
                }
                self.conn = None;
            }
            (BgpState::Connect | BgpState::Active, BgpState::OpenSent) => {
                self.fsm.timers.stop_connect_retry();
                self.enter_open_sent().await?;
            }
            (BgpState::OpenSent, BgpState::OpenConfirm) => {
                if let FsmEvent::BgpOpenReceived(params) = event {
                    self.fsm
                        .timers
                        .set_negotiated_hold_time(params.negotiated_hold_time());
                    self.peer_bgp_id = Some(Ipv4Addr::from(params.peer_bgp_id));
                }
                self.send_message(&KeepaliveMessage {}).await?;
                self.fsm.timers.reset_hold_timer();
                self.fsm.timers.reset_keepalive_timer();
            }
            (BgpState::OpenConfirm, BgpState::Established) => {
                self.statistics.established_transitions += 1;
                self.fsm.timers.reset_hold_timer();
                info!(peer_ip = %self.addr, "session established");
                let _ = self.server_tx.send(ServerOp::PeerEstablished {
                    peer_ip: self.addr,
                    bgp_id: self.peer_bgp_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    local_ip: self.conn.as_ref().and_then(|c| c.local_ip),
                });
                return Ok(());
            }
            (
                BgpState::OpenConfirm | BgpState::Established,
                BgpState::OpenConfirm | BgpState::Established,
            ) => {
                if matches!(event, FsmEvent::KeepaliveTimerExpires) {
                    self.send_message(&KeepaliveMessage {}).await?;
                    self.fsm.timers.reset_keepalive_timer();
                }
            }
            (BgpState::OpenSent, BgpState::Active) => {
                warn!(peer_ip = %self.addr, "connection lost in OpenSent");
                self.disconnect();
                self.fsm.timers.start_connect_retry();
            }
            (_, BgpState::Idle) if old_state != BgpState::Idle => {
                self.enter_idle(old_state, event).await;
            }
            _ => {}
        }

        if old_state != new_state {
            debug!(peer_ip = %self.addr, ?old_state, ?new_state, "state changed");
            self.notify_state_change();
        }
        Ok(())
    }

    async fn enter_open_sent(&mut self) -> Result<(), PeerError> {
        let open = OpenMessage::new(
            self.fsm.local_asn(),
            self.fsm.local_hold_time(),
            self.fsm.local_bgp_id(),
        );
        self.send_message(&open).await?;
        self.fsm.timers.set_initial_hold_time();
        self.fsm.timers.reset_hold_timer();
        Ok(())
    }

    /// Tear down the session, sending a NOTIFICATION when the event calls for one.
    async fn enter_idle(&mut self, old_state: BgpState, event: &FsmEvent) {
        let connected = matches!(
            old_state,
            BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established
        );
        let reason = teardown_reason(event, connected);
        if let Some(notif) = teardown_notification(event, &reason) {
            if self.conn.is_some() {
                self.send_notification(notif).await;
            }
        }
        warn!(peer_ip = %self.addr, ?old_state, %reason, "session closed");
        self.disconnect();
        self.fsm.timers.stop_connect_retry();
    }
}

/// Why a session left for Idle.
fn teardown_reason(event: &FsmEvent, connected: bool) -> PeerError {
    match event {
        FsmEvent::HoldTimerExpires => PeerError::HoldTimerExpired,
        FsmEvent::AutomaticStop(_) => PeerError::Shutdown,
        FsmEvent::BgpHeaderErr(notif)
        | FsmEvent::BgpOpenMsgErr(notif)
        | FsmEvent::BgpUpdateMsgErr(notif) => PeerError::Protocol(notif.clone()),
        FsmEvent::TcpConnectionFails => PeerError::Io(std::io::ErrorKind::ConnectionReset.into()),
        FsmEvent::NotifMsg | FsmEvent::NotifMsgVerErr => {
            PeerError::Io(std::io::Error::other("NOTIFICATION received"))
        }
        _ if connected => PeerError::Fsm,
        _ => PeerError::Io(std::io::Error::other("no connection")),
    }
}

fn teardown_notification(event: &FsmEvent, reason: &PeerError) -> Option<NotificationMessage> {
    if let FsmEvent::AutomaticStop(subcode) = event {
        return Some(NotificationMessage::new(
            BgpError::Cease(subcode.clone()),
            Vec::new(),
        ));
    }
    let error = match reason {
        PeerError::HoldTimerExpired => BgpError::HoldTimerExpired,
        PeerError::Shutdown => BgpError::Cease(CeaseSubcode::AdministrativeShutdown),
        PeerError::Fsm => BgpError::FiniteStateMachineError,
        PeerError::Protocol(notif) => return Some(notif.clone()),
        PeerError::Io(_) => return None,
    };
    Some(NotificationMessage::new(error, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use super::*;
    use crate::bgp::msg_notification::UpdateMessageError;

    #[tokio::test]
    async fn test_connect_retry_timer_started_on_idle_transition() {
        let test_cases = vec![
            (FsmEvent::AutomaticStart, BgpState::Connect),
            (FsmEvent::AutomaticStartPassive, BgpState::Active),
        ];

        for (event, expected_state) in test_cases {
            let (mut peer, _server_rx) = create_test_peer_with_state(BgpState::Idle).await;
            assert!(peer.fsm.timers.connect_retry_started.is_none());

            peer.process_event(&event).await.unwrap();

            assert_eq!(peer.state(), expected_state);
            assert!(
                peer.fsm.timers.connect_retry_started.is_some(),
                "ConnectRetryTimer should be started after {:?}",
                event
            );
        }
    }

    #[tokio::test]
    async fn test_idle_restart_delay_not_reset_by_queries() {
        use tokio::sync::{mpsc, oneshot};

        let (mut peer, _server_rx) = create_test_peer_with_state(BgpState::Idle).await;
        let delay = Duration::from_millis(300);
        peer.fsm.timers.connect_retry_time = delay;
        peer.restarting = true;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        peer.peer_rx = peer_rx;

        // Statistics queries arrive faster than the restart delay
        let poller = tokio::spawn(async move {
            loop {
                let (tx, rx) = oneshot::channel();
                if peer_tx.send(PeerOp::GetStatistics(tx)).is_err() || rx.await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let started = Instant::now();
        let shutdown = tokio::time::timeout(Duration::from_secs(5), peer.handle_idle_state())
            .await
            .expect("Idle never restarted");
        poller.abort();

        assert!(!shutdown);
        assert_eq!(peer.state(), BgpState::Connect);
        assert!(started.elapsed() >= delay);
        assert!(peer.fsm.timers.connect_retry_started.is_some());
    }

    #[tokio::test]
    async fn test_tcp_confirmed_sends_open() {
        let (mut peer, mut server_rx) = create_test_peer_with_state(BgpState::Connect).await;
        peer.fsm.timers.start_connect_retry();

        peer.process_event(&FsmEvent::TcpConnectionConfirmed)
            .await
            .unwrap();

        assert_eq!(peer.state(), BgpState::OpenSent);
        assert_eq!(peer.statistics.open_sent, 1);
        assert!(peer.fsm.timers.connect_retry_started.is_none());
        assert!(peer.fsm.timers.hold_timer_started.is_some());
        assert!(matches!(
            server_rx.try_recv(),
            Ok(ServerOp::PeerStateChanged {
                state: BgpState::OpenSent,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_hold_timer_expiry_sends_one_notification() {
        let (mut peer, mut server_rx) = create_test_peer_with_state(BgpState::Established).await;

        peer.process_event(&FsmEvent::HoldTimerExpires).await.unwrap();

        assert_eq!(peer.state(), BgpState::Idle);
        assert_eq!(peer.statistics.notification_sent, 1);
        assert!(peer.conn.is_none());
        assert!(matches!(
            server_rx.try_recv(),
            Ok(ServerOp::PeerDisconnected { .. })
        ));
        assert!(matches!(
            server_rx.try_recv(),
            Ok(ServerOp::PeerStateChanged {
                state: BgpState::Idle,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_notification_received_sends_nothing() {
        let (mut peer, _server_rx) = create_test_peer_with_state(BgpState::Established).await;
        peer.process_event(&FsmEvent::NotifMsg).await.unwrap();
        assert_eq!(peer.state(), BgpState::Idle);
        assert_eq!(peer.statistics.notification_sent, 0);
    }

    #[tokio::test]
    async fn test_keepalive_timer_sends_keepalive() {
        let (mut peer, _server_rx) = create_test_peer_with_state(BgpState::Established).await;
        peer.process_event(&FsmEvent::KeepaliveTimerExpires)
            .await
            .unwrap();
        assert_eq!(peer.state(), BgpState::Established);
        assert_eq!(peer.statistics.keepalive_sent, 1);
        assert!(peer.fsm.timers.keepalive_timer_started.is_some());
    }

    #[test]
    fn test_teardown_notification() {
        let update_err = NotificationMessage::new(
            BgpError::UpdateMessageError(UpdateMessageError::MalformedASPath),
            vec![],
        );
        let cases = vec![
            (FsmEvent::HoldTimerExpires, true, Some(BgpError::HoldTimerExpired)),
            (
                FsmEvent::AutomaticStop(CeaseSubcode::PeerDeconfigured),
                true,
                Some(BgpError::Cease(CeaseSubcode::PeerDeconfigured)),
            ),
            (
                FsmEvent::AutomaticStop(CeaseSubcode::AdministrativeShutdown),
                true,
                Some(BgpError::Cease(CeaseSubcode::AdministrativeShutdown)),
            ),
            (
                FsmEvent::BgpUpdateMsgErr(update_err.clone()),
                true,
                Some(update_err.error().clone()),
            ),
            (
                FsmEvent::BgpUpdateReceived,
                true,
                Some(BgpError::FiniteStateMachineError),
            ),
            (FsmEvent::BgpUpdateReceived, false, None),
            (FsmEvent::TcpConnectionFails, true, None),
            (FsmEvent::NotifMsg, true, None),
        ];
        for (event, connected, expected) in cases {
            let reason = teardown_reason(&event, connected);
            assert_eq!(
                teardown_notification(&event, &reason).map(|n| n.error().clone()),
                expected,
                "{:?}",
                event
            );
        }
    }
}

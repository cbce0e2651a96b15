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

use super::connection::ReadResult;
use super::fsm::{BgpOpenParams, BgpState, FsmEvent};
use super::{Peer, PeerError, PeerOp, TIMER_TICK};
use crate::bgp::msg::BgpMessage;
use crate::bgp::msg_notification::{BgpError, NotificationMessage, OpenMessageError};
use crate::bgp::msg_open::OpenMessage;
use crate::log::{debug, error, info, warn};
use crate::server::ServerOp;

impl Peer {
    /// OpenSent, OpenConfirm and Established share one loop: inbound
    /// messages, ops from the server and timer ticks.
    /// Returns true if shutdown requested.
    pub(super) async fn handle_session(&mut self) -> bool {
        let mut timer_interval = tokio::time::interval(TIMER_TICK);

        loop {
            let conn = match self.conn.as_mut() {
                Some(conn) => conn,
                None => {
                    self.try_process_event(&FsmEvent::TcpConnectionFails).await;
                    return false;
                }
            };

            tokio::select! {
                result = conn.msg_rx.recv() => {
                    self.handle_read_result(result).await;
                }
                op = self.peer_rx.recv() => {
                    match op {
                        Some(PeerOp::SendUpdate(update)) => {
                            if self.fsm.is_established() {
                                if let Err(e) = self.send_message(&update).await {
                                    error!(peer_ip = %self.addr, error = %e, "failed to send UPDATE");
                                    self.try_process_event(&FsmEvent::TcpConnectionFails).await;
                                }
                            }
                        }
                        Some(PeerOp::GetStatistics(response)) => {
                            let _ = response.send(self.statistics.clone());
                        }
                        Some(PeerOp::Shutdown(subcode)) => {
                            info!(peer_ip = %self.addr, ?subcode, "shutdown requested");
                            self.try_process_event(&FsmEvent::AutomaticStop(subcode)).await;
                            return true;
                        }
                        Some(PeerOp::TcpConnectionAccepted { stream }) => {
                            debug!(peer_ip = %self.addr, "session exists, dropping inbound connection");
                            drop(stream);
                        }
                        None => return true,
                    }
                }
                _ = timer_interval.tick() => {
                    if self.fsm.timers.hold_timer_expired() {
                        error!(peer_ip = %self.addr, "hold timer expired");
                        self.try_process_event(&FsmEvent::HoldTimerExpires).await;
                    } else if self.fsm.timers.keepalive_timer_expired() {
                        self.try_process_event(&FsmEvent::KeepaliveTimerExpires).await;
                    }
                }
            }

            match self.fsm.state() {
                BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established => {}
                _ => return false,
            }
        }
    }

    async fn handle_read_result(&mut self, result: Option<ReadResult>) {
        match result {
            Some(Ok(message)) => {
                // Any message from the peer proves liveness
                self.fsm.timers.reset_hold_timer();
                self.handle_received_message(message).await;
            }
            Some(Err(e)) => {
                let err = PeerError::from(e);
                warn!(peer_ip = %self.addr, error = %err, "error reading message");
                self.try_process_event(&err.into_event()).await;
            }
            None => {
                debug!(peer_ip = %self.addr, "reader task exited");
                self.try_process_event(&FsmEvent::TcpConnectionFails).await;
            }
        }
    }

    pub(super) async fn handle_received_message(&mut self, message: BgpMessage) {
        let peer_ip = self.addr;
        match message {
            BgpMessage::Open(open) => {
                self.statistics.open_received += 1;
                debug!(%peer_ip, asn = open.asn, hold_time = open.hold_time, "OPEN received");
                let event = match self.validate_open(&open) {
                    Ok(params) => FsmEvent::BgpOpenReceived(params),
                    Err(notif) => FsmEvent::BgpOpenMsgErr(notif),
                };
                self.try_process_event(&event).await;
            }
            BgpMessage::Keepalive(_) => {
                self.statistics.keepalive_received += 1;
                self.try_process_event(&FsmEvent::BgpKeepaliveReceived).await;
            }
            BgpMessage::Update(update) => {
                self.statistics.update_received += 1;
                self.try_process_event(&FsmEvent::BgpUpdateReceived).await;
                if self.fsm.is_established() {
                    let _ = self
                        .server_tx
                        .send(ServerOp::PeerUpdate { peer_ip, update });
                }
            }
            BgpMessage::Notification(notif) => {
                self.statistics.notification_received += 1;
                warn!(%peer_ip, %notif, "NOTIFICATION received");
                let event = if notif.is_version_error() {
                    FsmEvent::NotifMsgVerErr
                } else {
                    FsmEvent::NotifMsg
                };
                self.try_process_event(&event).await;
            }
            BgpMessage::RouteRefresh(refresh) => {
                self.statistics.route_refresh_received += 1;
                if !self.fsm.is_established() {
                    debug!(%peer_ip, "ignoring ROUTE-REFRESH before Established");
                } else if !refresh.is_ipv4_unicast() {
                    debug!(%peer_ip, afi = refresh.afi, safi = refresh.safi, "ignoring ROUTE-REFRESH for unsupported family");
                } else {
                    let _ = self.server_tx.send(ServerOp::RouteRefresh { peer_ip });
                }
            }
        }
    }

    /// Checks a received OPEN against the peer's configuration. Version,
    /// hold time and identifier syntax are already checked by the codec.
    fn validate_open(&self, open: &OpenMessage) -> Result<BgpOpenParams, NotificationMessage> {
        let open_error = |err: OpenMessageError, data: Vec<u8>| {
            NotificationMessage::new(BgpError::OpenMessageError(err), data)
        };

        if open.asn != self.config.remote_asn {
            return Err(open_error(
                OpenMessageError::BadPeerAs,
                open.asn.to_be_bytes().to_vec(),
            ));
        }
        if open.bgp_identifier == self.fsm.local_bgp_id() {
            return Err(open_error(OpenMessageError::BadBgpIdentifier, Vec::new()));
        }
        if let Some(param) = open.unsupported_params.first() {
            return Err(open_error(
                OpenMessageError::UnsupportedOptionalParameter,
                vec![*param],
            ));
        }
        if !open.supports_ipv4_unicast() {
            return Err(open_error(OpenMessageError::UnsupportedCapability, Vec::new()));
        }

        Ok(BgpOpenParams {
            peer_asn: open.asn,
            peer_hold_time: open.hold_time,
            peer_bgp_id: open.bgp_identifier,
            local_asn: self.fsm.local_asn(),
            local_hold_time: self.fsm.local_hold_time(),
        })
    }
}

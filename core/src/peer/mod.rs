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

//! Per-peer session task.
//!
//! Each configured neighbor runs one `Peer` task that owns its FSM, timers and
//! transport. The task never touches RIB state; it reports state changes and
//! received updates to the coordinator as `ServerOp` messages.

use crate::bgp::msg::Message;
use crate::bgp::msg_notification::{BgpError, CeaseSubcode, NotificationMessage};
use crate::bgp::msg_update::UpdateMessage;
use crate::bgp::utils::ParserError;
use crate::config::{Config, PeerConfig};
use crate::log::{debug, error, warn};
use crate::server::ServerOp;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

mod connection;
mod fsm;
mod session;
mod states;

pub use fsm::{BgpOpenParams, BgpState, Fsm, FsmEvent, FsmTimers, INITIAL_HOLD_TIME};

use connection::TcpConnection;

/// Interval at which hold, keepalive and connect-retry timers are checked.
const TIMER_TICK: Duration = Duration::from_millis(100);

/// Errors that end a session.
#[derive(Debug)]
pub enum PeerError {
    /// Transport failure
    Io(io::Error),
    /// Protocol error reported to the peer with this NOTIFICATION
    Protocol(NotificationMessage),
    HoldTimerExpired,
    /// Event not valid in the current state
    Fsm,
    /// Administrative stop
    Shutdown,
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "I/O error: {}", e),
            PeerError::Protocol(notif) => write!(f, "protocol error: {}", notif),
            PeerError::HoldTimerExpired => write!(f, "hold timer expired"),
            PeerError::Fsm => write!(f, "FSM error"),
            PeerError::Shutdown => write!(f, "administrative shutdown"),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        PeerError::Io(e)
    }
}

impl From<ParserError> for PeerError {
    fn from(e: ParserError) -> Self {
        match e {
            ParserError::IoError(msg) => PeerError::Io(io::Error::other(msg)),
            ParserError::BgpError { error, data } => {
                PeerError::Protocol(NotificationMessage::new(error, data))
            }
        }
    }
}

impl PeerError {
    /// Maps a parse failure to the FSM event it raises.
    pub fn into_event(self) -> FsmEvent {
        match self {
            PeerError::Protocol(notif) => match notif.error() {
                BgpError::MessageHeaderError(_) => FsmEvent::BgpHeaderErr(notif),
                BgpError::OpenMessageError(_) => FsmEvent::BgpOpenMsgErr(notif),
                _ => FsmEvent::BgpUpdateMsgErr(notif),
            },
            _ => FsmEvent::TcpConnectionFails,
        }
    }
}

/// Operations that can be sent to a peer task
pub enum PeerOp {
    SendUpdate(UpdateMessage),
    GetStatistics(oneshot::Sender<PeerStatistics>),
    /// Send CEASE with the given subcode, close the session and exit the task
    Shutdown(CeaseSubcode),
    /// Inbound connection from this peer's address, accepted by the server
    TcpConnectionAccepted { stream: TcpStream },
}

/// Type of BGP session based on AS relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionType {
    /// External BGP session (different AS)
    Ebgp,
    /// Internal BGP session (same AS)
    Ibgp,
}

impl SessionType {
    pub fn from_asns(local_asn: u16, remote_asn: u16) -> Self {
        if local_asn == remote_asn {
            SessionType::Ibgp
        } else {
            SessionType::Ebgp
        }
    }
}

/// Message counters for one peer, kept across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatistics {
    pub open_sent: u64,
    pub open_received: u64,
    pub update_sent: u64,
    pub update_received: u64,
    pub keepalive_sent: u64,
    pub keepalive_received: u64,
    pub notification_sent: u64,
    pub notification_received: u64,
    pub route_refresh_sent: u64,
    pub route_refresh_received: u64,
    pub established_transitions: u64,
}

pub struct Peer {
    pub addr: IpAddr,
    pub fsm: Fsm,
    pub statistics: PeerStatistics,
    pub config: PeerConfig,
    /// Populated from the peer's OPEN
    pub peer_bgp_id: Option<Ipv4Addr>,
    pub session_type: SessionType,
    conn: Option<TcpConnection>,
    peer_rx: mpsc::UnboundedReceiver<PeerOp>,
    server_tx: mpsc::UnboundedSender<ServerOp>,
    /// Source address for outbound connections
    local_ip: Option<IpAddr>,
    /// Set after the first session attempt; later starts wait one retry interval.
    restarting: bool,
}

impl Peer {
    /// Create a new Peer in Idle state.
    pub fn new(
        addr: IpAddr,
        config: PeerConfig,
        global: &Config,
        peer_rx: mpsc::UnboundedReceiver<PeerOp>,
        server_tx: mpsc::UnboundedSender<ServerOp>,
    ) -> Self {
        let hold_time = config.hold_time_secs.unwrap_or(global.hold_time_secs) as u16;
        let connect_retry =
            Duration::from_secs(config.connect_retry_secs.unwrap_or(global.connect_retry_secs));
        let timers = FsmTimers::new(connect_retry, global.min_keepalive());
        let local_ip = global.listen_sockaddr().ok().map(|addr| addr.ip());

        Peer {
            addr,
            fsm: Fsm::new(
                global.asn,
                hold_time,
                u32::from(global.router_id),
                timers,
                config.passive_mode,
            ),
            statistics: PeerStatistics::default(),
            peer_bgp_id: None,
            session_type: SessionType::from_asns(global.asn, config.remote_asn),
            config,
            conn: None,
            peer_rx,
            server_tx,
            local_ip,
            restarting: false,
        }
    }

    /// Main peer task. Runs until shut down or the server drops its handle.
    pub async fn run(mut self) {
        let peer_ip = self.addr;
        debug!(%peer_ip, passive = self.config.passive_mode, "starting peer task");

        loop {
            let shutdown = match self.fsm.state() {
                BgpState::Idle => self.handle_idle_state().await,
                BgpState::Connect => self.handle_connect_state().await,
                BgpState::Active => self.handle_active_state().await,
                BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established => {
                    self.handle_session().await
                }
            };
            if shutdown {
                break;
            }
        }

        self.disconnect();
        debug!(%peer_ip, "peer task exited");
    }

    pub fn state(&self) -> BgpState {
        self.fsm.state()
    }

    /// Drop the transport and stop session timers. Notifies the coordinator
    /// so the peer's routes are withdrawn.
    fn disconnect(&mut self) {
        self.fsm.timers.stop_session_timers();
        self.fsm.timers.set_initial_hold_time();
        self.peer_bgp_id = None;
        if self.conn.take().is_some() {
            let _ = self
                .server_tx
                .send(ServerOp::PeerDisconnected { peer_ip: self.addr });
        }
    }

    fn notify_state_change(&self) {
        let _ = self.server_tx.send(ServerOp::PeerStateChanged {
            peer_ip: self.addr,
            state: self.fsm.state(),
        });
    }

    /// Write one message to the transport and count it.
    async fn send_message<M: Message>(&mut self, msg: &M) -> Result<(), PeerError> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(PeerError::Io(io::ErrorKind::NotConnected.into())),
        };
        conn.send(&msg.serialize()).await?;

        let stats = &mut self.statistics;
        match msg.kind() {
            crate::bgp::msg::MessageType::Open => stats.open_sent += 1,
            crate::bgp::msg::MessageType::Update => stats.update_sent += 1,
            crate::bgp::msg::MessageType::Keepalive => stats.keepalive_sent += 1,
            crate::bgp::msg::MessageType::Notification => stats.notification_sent += 1,
            crate::bgp::msg::MessageType::RouteRefresh => stats.route_refresh_sent += 1,
        }
        Ok(())
    }

    /// Best effort: the session is going down either way.
    async fn send_notification(&mut self, notif: NotificationMessage) {
        warn!(peer_ip = %self.addr, %notif, "sending NOTIFICATION");
        if let Err(e) = self.send_message(&notif).await {
            debug!(peer_ip = %self.addr, error = %e, "failed to send NOTIFICATION");
        }
    }

    /// Process an event; on failure log and treat the transport as lost.
    async fn try_process_event(&mut self, event: &FsmEvent) {
        if let Err(e) = self.process_event(event).await {
            error!(peer_ip = %self.addr, ?event, error = %e, "failed to process event");
            // TcpConnectionFails never sends, so this cannot fail again
            let _ = self.process_event(&FsmEvent::TcpConnectionFails).await;
        }
    }
}

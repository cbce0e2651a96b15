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

//! BGP finite state machine (RFC 4271 section 8).
//!
//! `Fsm::handle_event` is a pure transition table. The peer task performs the
//! side effects (sending messages, arming timers) based on the resulting state.

use serde::Serialize;
use std::time::{Duration, Instant};

use crate::bgp::msg_notification::{CeaseSubcode, NotificationMessage};

/// Hold time used while waiting for the peer's OPEN (RFC 4271 suggests 4 minutes).
pub const INITIAL_HOLD_TIME: Duration = Duration::from_secs(240);

/// BGP FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BgpState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl std::fmt::Display for BgpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Parameters from a received OPEN message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgpOpenParams {
    pub peer_asn: u16,
    pub peer_hold_time: u16,
    pub peer_bgp_id: u32,
    pub local_asn: u16,
    pub local_hold_time: u16,
}

impl BgpOpenParams {
    /// Negotiated hold time is the smaller of the two proposals.
    pub fn negotiated_hold_time(&self) -> u16 {
        self.peer_hold_time.min(self.local_hold_time)
    }
}

/// FSM events, numbered after RFC 4271 section 8.1 where one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    /// Event 3
    AutomaticStart,
    /// Event 5
    AutomaticStartPassive,
    /// Event 8: carries the Cease subcode to send
    AutomaticStop(CeaseSubcode),
    /// Event 9
    ConnectRetryTimerExpires,
    /// Event 10
    HoldTimerExpires,
    /// Event 11
    KeepaliveTimerExpires,
    /// Events 16/17: transport is up, ready to send OPEN
    TcpConnectionConfirmed,
    /// Event 18
    TcpConnectionFails,
    /// Event 19
    BgpOpenReceived(BgpOpenParams),
    /// Event 21: carries the NOTIFICATION to send
    BgpHeaderErr(NotificationMessage),
    /// Event 22: carries the NOTIFICATION to send
    BgpOpenMsgErr(NotificationMessage),
    /// Event 24
    NotifMsgVerErr,
    /// Event 25
    NotifMsg,
    /// Event 26
    BgpKeepaliveReceived,
    /// Event 27
    BgpUpdateReceived,
    /// Event 28: carries the NOTIFICATION to send
    BgpUpdateMsgErr(NotificationMessage),
}

/// BGP FSM timers
#[derive(Debug, Clone)]
pub struct FsmTimers {
    pub connect_retry_time: Duration,

    /// Negotiated hold time. Zero disables the hold and keepalive timers.
    pub hold_time: Duration,

    pub keepalive_time: Duration,

    /// Lower bound applied to the derived keepalive interval
    pub min_keepalive_time: Duration,

    pub connect_retry_started: Option<Instant>,
    pub hold_timer_started: Option<Instant>,
    pub keepalive_timer_started: Option<Instant>,
}

impl FsmTimers {
    pub fn new(connect_retry_time: Duration, min_keepalive_time: Duration) -> Self {
        Self {
            connect_retry_time,
            hold_time: INITIAL_HOLD_TIME,
            keepalive_time: INITIAL_HOLD_TIME / 3,
            min_keepalive_time,
            connect_retry_started: None,
            hold_timer_started: None,
            keepalive_timer_started: None,
        }
    }

    fn expired(started: Option<Instant>, period: Duration) -> bool {
        match started {
            Some(started) => started.elapsed() >= period,
            None => false,
        }
    }

    pub fn connect_retry_expired(&self) -> bool {
        Self::expired(self.connect_retry_started, self.connect_retry_time)
    }

    pub fn hold_timer_expired(&self) -> bool {
        Self::expired(self.hold_timer_started, self.hold_time)
    }

    pub fn keepalive_timer_expired(&self) -> bool {
        Self::expired(self.keepalive_timer_started, self.keepalive_time)
    }

    pub fn start_connect_retry(&mut self) {
        self.connect_retry_started = Some(Instant::now());
    }

    pub fn stop_connect_retry(&mut self) {
        self.connect_retry_started = None;
    }

    /// Starts (or restarts) the hold timer unless the hold time is zero.
    pub fn reset_hold_timer(&mut self) {
        if self.hold_time.is_zero() {
            self.hold_timer_started = None;
        } else {
            self.hold_timer_started = Some(Instant::now());
        }
    }

    pub fn stop_hold_timer(&mut self) {
        self.hold_timer_started = None;
    }

    /// Starts (or restarts) the keepalive timer unless the hold time is zero.
    pub fn reset_keepalive_timer(&mut self) {
        if self.hold_time.is_zero() {
            self.keepalive_timer_started = None;
        } else {
            self.keepalive_timer_started = Some(Instant::now());
        }
    }

    pub fn stop_keepalive_timer(&mut self) {
        self.keepalive_timer_started = None;
    }

    /// Applies the negotiated hold time. Keepalive is a third of it, never
    /// below the configured minimum.
    pub fn set_negotiated_hold_time(&mut self, hold_time: u16) {
        self.hold_time = Duration::from_secs(hold_time as u64);
        if hold_time == 0 {
            self.keepalive_time = Duration::ZERO;
            self.stop_hold_timer();
            self.stop_keepalive_timer();
        } else {
            self.keepalive_time = (self.hold_time / 3).max(self.min_keepalive_time);
        }
    }

    /// Back to the provisional hold time used before OPEN negotiation.
    pub fn set_initial_hold_time(&mut self) {
        self.hold_time = INITIAL_HOLD_TIME;
        self.keepalive_time = INITIAL_HOLD_TIME / 3;
    }

    pub fn stop_session_timers(&mut self) {
        self.stop_hold_timer();
        self.stop_keepalive_timer();
    }
}

/// BGP Finite State Machine
pub struct Fsm {
    state: BgpState,

    pub timers: FsmTimers,

    local_asn: u16,
    local_hold_time: u16,
    local_bgp_id: u32,

    /// Wait for the peer to connect instead of dialing out
    passive_mode: bool,
}

impl Fsm {
    pub fn new(
        local_asn: u16,
        local_hold_time: u16,
        local_bgp_id: u32,
        timers: FsmTimers,
        passive_mode: bool,
    ) -> Self {
        Fsm {
            state: BgpState::Idle,
            timers,
            local_asn,
            local_hold_time,
            local_bgp_id,
            passive_mode,
        }
    }

    #[cfg(test)]
    pub fn with_state(state: BgpState, passive_mode: bool) -> Self {
        let mut fsm = Fsm::new(
            65000,
            180,
            0x01010101,
            FsmTimers::new(Duration::from_secs(30), Duration::from_secs(1)),
            passive_mode,
        );
        fsm.state = state;
        fsm
    }

    pub fn state(&self) -> BgpState {
        self.state
    }

    pub fn local_asn(&self) -> u16 {
        self.local_asn
    }

    pub fn local_hold_time(&self) -> u16 {
        self.local_hold_time
    }

    pub fn local_bgp_id(&self) -> u32 {
        self.local_bgp_id
    }

    pub fn passive_mode(&self) -> bool {
        self.passive_mode
    }

    /// The start event matching this peer's connection mode.
    pub fn start_event(&self) -> FsmEvent {
        if self.passive_mode {
            FsmEvent::AutomaticStartPassive
        } else {
            FsmEvent::AutomaticStart
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == BgpState::Established
    }

    /// Handle an event and return the new state.
    ///
    /// Notifications and cleanup are performed by the caller based on the
    /// (old state, event, new state) triple.
    pub fn handle_event(&mut self, event: &FsmEvent) -> BgpState {
        let new_state = match (&self.state, event) {
            // ===== Idle =====
            (BgpState::Idle, FsmEvent::AutomaticStart) => BgpState::Connect,
            (BgpState::Idle, FsmEvent::AutomaticStartPassive) => BgpState::Active,

            // ===== Connect =====
            (BgpState::Connect, FsmEvent::ConnectRetryTimerExpires) => BgpState::Connect,
            (BgpState::Connect, FsmEvent::TcpConnectionConfirmed) => BgpState::OpenSent,
            // Keep listening for the peer until the retry timer fires
            (BgpState::Connect, FsmEvent::TcpConnectionFails) => BgpState::Active,

            // ===== Active =====
            (BgpState::Active, FsmEvent::ConnectRetryTimerExpires) => {
                if self.passive_mode {
                    BgpState::Active
                } else {
                    BgpState::Connect
                }
            }
            (BgpState::Active, FsmEvent::TcpConnectionConfirmed) => BgpState::OpenSent,
            (BgpState::Active, FsmEvent::TcpConnectionFails) => BgpState::Active,

            // Any other event in Connect/Active drops back to Idle
            (BgpState::Connect, _) | (BgpState::Active, _) => BgpState::Idle,

            // ===== OpenSent =====
            (BgpState::OpenSent, FsmEvent::BgpOpenReceived(_)) => BgpState::OpenConfirm,
            (BgpState::OpenSent, FsmEvent::TcpConnectionFails) => BgpState::Active,

            // ===== OpenConfirm =====
            (BgpState::OpenConfirm, FsmEvent::KeepaliveTimerExpires) => BgpState::OpenConfirm,
            (BgpState::OpenConfirm, FsmEvent::BgpKeepaliveReceived) => BgpState::Established,

            // ===== Established =====
            (BgpState::Established, FsmEvent::KeepaliveTimerExpires)
            | (BgpState::Established, FsmEvent::BgpKeepaliveReceived)
            | (BgpState::Established, FsmEvent::BgpUpdateReceived) => BgpState::Established,

            // Start events are ignored once a connection exists
            (
                BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established,
                FsmEvent::AutomaticStart | FsmEvent::AutomaticStartPassive,
            ) => self.state,

            // Everything else in a connected state is an error or a stop (RFC 4271 6.6)
            (BgpState::OpenSent | BgpState::OpenConfirm | BgpState::Established, _) => {
                BgpState::Idle
            }

            // Idle ignores everything but start events
            (BgpState::Idle, _) => BgpState::Idle,
        };

        self.state = new_state;
        new_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg_notification::{BgpError, UpdateMessageError};

    fn open_params() -> BgpOpenParams {
        BgpOpenParams {
            peer_asn: 65001,
            peer_hold_time: 90,
            peer_bgp_id: 0x02020202,
            local_asn: 65000,
            local_hold_time: 180,
        }
    }

    #[test]
    fn test_successful_connection_establishment() {
        let mut fsm = Fsm::with_state(BgpState::Idle, false);

        assert_eq!(fsm.handle_event(&FsmEvent::AutomaticStart), BgpState::Connect);
        assert_eq!(
            fsm.handle_event(&FsmEvent::TcpConnectionConfirmed),
            BgpState::OpenSent
        );
        assert_eq!(
            fsm.handle_event(&FsmEvent::BgpOpenReceived(open_params())),
            BgpState::OpenConfirm
        );
        assert_eq!(
            fsm.handle_event(&FsmEvent::BgpKeepaliveReceived),
            BgpState::Established
        );
        assert!(fsm.is_established());
    }

    #[test]
    fn test_all_valid_state_transitions() {
        let stop = || FsmEvent::AutomaticStop(CeaseSubcode::AdministrativeShutdown);
        // (initial_state, event, expected_state)
        let test_cases = vec![
            // From Idle
            (BgpState::Idle, FsmEvent::AutomaticStart, BgpState::Connect),
            (BgpState::Idle, FsmEvent::AutomaticStartPassive, BgpState::Active),
            (BgpState::Idle, FsmEvent::HoldTimerExpires, BgpState::Idle),
            (BgpState::Idle, FsmEvent::BgpKeepaliveReceived, BgpState::Idle),
            // From Connect
            (BgpState::Connect, stop(), BgpState::Idle),
            (BgpState::Connect, FsmEvent::ConnectRetryTimerExpires, BgpState::Connect),
            (BgpState::Connect, FsmEvent::TcpConnectionConfirmed, BgpState::OpenSent),
            (BgpState::Connect, FsmEvent::TcpConnectionFails, BgpState::Active),
            (BgpState::Connect, FsmEvent::BgpOpenReceived(open_params()), BgpState::Idle),
            (BgpState::Connect, FsmEvent::NotifMsg, BgpState::Idle),
            // From Active
            (BgpState::Active, stop(), BgpState::Idle),
            (BgpState::Active, FsmEvent::ConnectRetryTimerExpires, BgpState::Connect),
            (BgpState::Active, FsmEvent::TcpConnectionConfirmed, BgpState::OpenSent),
            (BgpState::Active, FsmEvent::BgpKeepaliveReceived, BgpState::Idle),
            // From OpenSent
            (BgpState::OpenSent, stop(), BgpState::Idle),
            (BgpState::OpenSent, FsmEvent::HoldTimerExpires, BgpState::Idle),
            (BgpState::OpenSent, FsmEvent::TcpConnectionFails, BgpState::Active),
            (BgpState::OpenSent, FsmEvent::BgpOpenReceived(open_params()), BgpState::OpenConfirm),
            (BgpState::OpenSent, FsmEvent::BgpKeepaliveReceived, BgpState::Idle),
            (BgpState::OpenSent, FsmEvent::NotifMsgVerErr, BgpState::Idle),
            (BgpState::OpenSent, FsmEvent::NotifMsg, BgpState::Idle),
            (BgpState::OpenSent, FsmEvent::AutomaticStart, BgpState::OpenSent),
            // From OpenConfirm
            (BgpState::OpenConfirm, stop(), BgpState::Idle),
            (BgpState::OpenConfirm, FsmEvent::HoldTimerExpires, BgpState::Idle),
            (BgpState::OpenConfirm, FsmEvent::KeepaliveTimerExpires, BgpState::OpenConfirm),
            (BgpState::OpenConfirm, FsmEvent::TcpConnectionFails, BgpState::Idle),
            (BgpState::OpenConfirm, FsmEvent::BgpKeepaliveReceived, BgpState::Established),
            (BgpState::OpenConfirm, FsmEvent::NotifMsg, BgpState::Idle),
            // From Established
            (BgpState::Established, stop(), BgpState::Idle),
            (BgpState::Established, FsmEvent::HoldTimerExpires, BgpState::Idle),
            (BgpState::Established, FsmEvent::KeepaliveTimerExpires, BgpState::Established),
            (BgpState::Established, FsmEvent::TcpConnectionFails, BgpState::Idle),
            (BgpState::Established, FsmEvent::BgpKeepaliveReceived, BgpState::Established),
            (BgpState::Established, FsmEvent::BgpUpdateReceived, BgpState::Established),
            (BgpState::Established, FsmEvent::NotifMsg, BgpState::Idle),
            (BgpState::Established, FsmEvent::AutomaticStart, BgpState::Established),
        ];

        for (initial_state, event, expected_state) in test_cases {
            let mut fsm = Fsm::with_state(initial_state, false);
            let new_state = fsm.handle_event(&event);

            assert_eq!(
                new_state, expected_state,
                "Failed transition: {:?} + {:?} should -> {:?}, got {:?}",
                initial_state, event, expected_state, new_state
            );
            assert_eq!(fsm.state(), expected_state);
        }
    }

    #[test]
    fn test_fsm_errors() {
        // RFC 4271 6.6: unexpected events in connected states are FSM errors
        let test_cases = vec![
            (BgpState::OpenSent, FsmEvent::BgpUpdateReceived),
            (BgpState::OpenConfirm, FsmEvent::BgpUpdateReceived),
            (BgpState::OpenConfirm, FsmEvent::ConnectRetryTimerExpires),
            (BgpState::OpenConfirm, FsmEvent::BgpOpenReceived(open_params())),
            (BgpState::Established, FsmEvent::ConnectRetryTimerExpires),
            (BgpState::Established, FsmEvent::BgpOpenReceived(open_params())),
        ];

        for (initial_state, event) in test_cases {
            let mut fsm = Fsm::with_state(initial_state, false);
            let new_state = fsm.handle_event(&event);
            assert_eq!(
                new_state,
                BgpState::Idle,
                "{:?} + {:?} should transition to Idle",
                initial_state,
                event
            );
        }
    }

    #[test]
    fn test_passive_connect_retry_stays_active() {
        let mut fsm = Fsm::with_state(BgpState::Active, true);
        assert_eq!(
            fsm.handle_event(&FsmEvent::ConnectRetryTimerExpires),
            BgpState::Active
        );

        let mut fsm = Fsm::with_state(BgpState::Active, false);
        assert_eq!(
            fsm.handle_event(&FsmEvent::ConnectRetryTimerExpires),
            BgpState::Connect
        );
    }

    #[test]
    fn test_start_event() {
        assert_eq!(
            Fsm::with_state(BgpState::Idle, true).start_event(),
            FsmEvent::AutomaticStartPassive
        );
        assert_eq!(
            Fsm::with_state(BgpState::Idle, false).start_event(),
            FsmEvent::AutomaticStart
        );
    }

    #[test]
    fn test_message_errors() {
        let notif = NotificationMessage::new(
            BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
            vec![],
        );

        for state in [
            BgpState::Connect,
            BgpState::Active,
            BgpState::OpenSent,
            BgpState::OpenConfirm,
            BgpState::Established,
        ] {
            for event in [
                FsmEvent::BgpUpdateMsgErr(notif.clone()),
                FsmEvent::BgpHeaderErr(notif.clone()),
                FsmEvent::BgpOpenMsgErr(notif.clone()),
            ] {
                let mut fsm = Fsm::with_state(state, false);
                assert_eq!(fsm.handle_event(&event), BgpState::Idle, "{:?}", state);
            }
        }
    }

    #[test]
    fn test_negotiated_hold_time() {
        let mut timers = FsmTimers::new(Duration::from_secs(30), Duration::from_secs(1));
        assert_eq!(timers.hold_time, INITIAL_HOLD_TIME);

        timers.set_negotiated_hold_time(open_params().negotiated_hold_time());
        assert_eq!(timers.hold_time, Duration::from_secs(90));
        assert_eq!(timers.keepalive_time, Duration::from_secs(30));

        // 3 / 3 = 1, raised to the configured minimum
        let mut timers = FsmTimers::new(Duration::from_secs(30), Duration::from_secs(2));
        timers.set_negotiated_hold_time(3);
        assert_eq!(timers.keepalive_time, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_hold_time_disables_timers() {
        let mut timers = FsmTimers::new(Duration::from_secs(30), Duration::from_secs(1));
        timers.reset_hold_timer();
        timers.reset_keepalive_timer();
        assert!(timers.hold_timer_started.is_some());

        timers.set_negotiated_hold_time(0);
        assert!(timers.hold_timer_started.is_none());
        assert!(timers.keepalive_timer_started.is_none());

        timers.reset_hold_timer();
        timers.reset_keepalive_timer();
        assert!(!timers.hold_timer_expired());
        assert!(!timers.keepalive_timer_expired());
    }

    #[test]
    fn test_timer_expiry() {
        let mut timers = FsmTimers::new(Duration::ZERO, Duration::from_secs(1));
        assert!(!timers.connect_retry_expired());
        timers.start_connect_retry();
        assert!(timers.connect_retry_expired());
        timers.stop_connect_retry();
        assert!(!timers.connect_retry_expired());

        timers.reset_hold_timer();
        assert!(!timers.hold_timer_expired());
    }
}

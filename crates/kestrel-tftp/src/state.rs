//! Stop-and-wait transfer state machine
//!
//! The machine performs no I/O. [`StateMachine::step`] maps the current
//! state plus one [`Event`] to the next state and a list of [`Action`]s; the
//! transfer context carries them out (sending, writing, reading the next
//! block) and feeds the next event back in.
//!
//! ```text
//!  Start ──▶ Negotiating ──▶ Transferring ──▶ Completed
//!    │            │               │
//!    └────────────┴───────────────┴──────────▶ Error
//! ```
//!
//! Block numbers are 16-bit and wrap; "behind" and "ahead" are judged with
//! wrapping arithmetic over half the number space.

use bytes::Bytes;

use crate::error::TftpError;
use crate::options::{Negotiation, OptionSet, RequestKind};
use crate::packet::{Packet, Request, TransferMode};
use crate::retransmit::{
    DuplicateDecision, Duplicate, RetransmissionController, TimeoutDecision,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Negotiating,
    Transferring,
    Completed,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Which way DATA flows from this end's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We send DATA and wait for ACKs
    Sending,
    /// We receive DATA and answer with ACKs
    Receiving,
}

#[derive(Debug)]
pub enum Event {
    Packet(Packet),
    Timeout,
    /// Datagram from the peer that could not be decoded
    Malformed(String),
    /// Lock, read or write failure on our side
    LocalFailure(TftpError),
}

#[derive(Debug)]
pub enum Action {
    /// Send a new packet; it replaces the packet kept for retransmission
    Send(Packet),
    /// Read the next chunk from the source and send it as this DATA block
    SendData(u16),
    /// Retransmit the last packet unchanged
    Resend,
    /// Append a DATA payload to the destination
    Write(Bytes),
    /// Options are settled for the rest of the transfer
    Negotiated(OptionSet),
    /// A packet was ignored or answered as a duplicate
    Duplicate,
    /// Tell the peer why the transfer ends; never retransmitted
    Notify(Packet),
    Finish,
    Fail(TftpError),
}

#[derive(Debug)]
pub struct Transition {
    pub state: State,
    pub actions: Vec<Action>,
}

#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    direction: Direction,
    state: State,
    /// Sending: DATA block in flight. Receiving: last block acknowledged.
    block: u16,
    requested: OptionSet,
    options: OptionSet,
    final_sent: bool,
    opening: Option<Packet>,
    retransmit: RetransmissionController,
}

impl StateMachine {
    /// Client side: `start` sends the RRQ (receiving) or WRQ (sending)
    pub fn client(
        direction: Direction,
        filename: &str,
        mode: TransferMode,
        requested: OptionSet,
        retransmit: RetransmissionController,
    ) -> Self {
        let request = Request {
            filename: filename.to_string(),
            mode,
            options: requested.to_raw(),
        };
        let opening = match direction {
            Direction::Receiving => Packet::Rrq(request),
            Direction::Sending => Packet::Wrq(request),
        };

        Self {
            role: Role::Client,
            direction,
            state: State::Start,
            block: 0,
            requested,
            options: OptionSet::default(),
            final_sent: false,
            opening: Some(opening),
            retransmit,
        }
    }

    /// Server side, for a request already accepted and negotiated
    pub fn server(
        direction: Direction,
        negotiation: Negotiation,
        retransmit: RetransmissionController,
    ) -> Self {
        Self {
            role: Role::Server,
            direction,
            state: State::Start,
            block: 0,
            requested: negotiation.accepted,
            options: negotiation.accepted,
            final_sent: false,
            opening: negotiation.reply,
            retransmit,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn retransmit(&self) -> &RetransmissionController {
        &self.retransmit
    }

    pub fn block_size(&self) -> usize {
        self.options.block_size()
    }

    /// Kick off the exchange
    pub fn start(&mut self) -> Transition {
        if self.state != State::Start {
            return self.stay(Vec::new());
        }

        match (self.role, self.direction) {
            (Role::Client, _) => {
                let mut actions = Vec::new();
                if let Some(request) = self.opening.take() {
                    actions.push(Action::Send(request));
                }
                self.transition(State::Negotiating, actions)
            }
            (Role::Server, Direction::Sending) => {
                let mut actions = vec![Action::Negotiated(self.options)];
                self.apply_timeout();
                match self.opening.take() {
                    Some(oack) => {
                        actions.push(Action::Send(oack));
                        self.transition(State::Negotiating, actions)
                    }
                    None => {
                        self.block = 1;
                        actions.push(Action::SendData(1));
                        self.transition(State::Transferring, actions)
                    }
                }
            }
            (Role::Server, Direction::Receiving) => {
                let reply = self.opening.take().unwrap_or(Packet::Ack { block: 0 });
                self.apply_timeout();
                let actions = vec![Action::Negotiated(self.options), Action::Send(reply)];
                self.transition(State::Negotiating, actions)
            }
        }
    }

    /// Record the size of the DATA payload just read for `SendData`; a
    /// payload shorter than the block size is the last one.
    pub fn record_data_sent(&mut self, payload_len: usize) {
        self.final_sent = payload_len < self.block_size();
    }

    /// Feed one event. Once terminal, only a local failure still counts: a
    /// write of the last block can fail after the machine saw it complete.
    pub fn step(&mut self, event: Event) -> Transition {
        if self.state == State::Error
            || (self.state == State::Completed && !matches!(event, Event::LocalFailure(_)))
        {
            return self.stay(Vec::new());
        }

        match event {
            Event::Timeout => self.on_timeout(),
            Event::Malformed(reason) => self.fail(TftpError::MalformedPacket(reason)),
            Event::LocalFailure(err) => self.fail(err),
            Event::Packet(Packet::Error { code, message }) => {
                // Never answer an ERROR with an ERROR.
                let err = TftpError::Peer { code, message };
                self.transition(State::Error, vec![Action::Fail(err)])
            }
            Event::Packet(packet) => match (self.state, self.direction) {
                (State::Negotiating, Direction::Receiving) => self.negotiating_receive(packet),
                (State::Negotiating, Direction::Sending) => self.negotiating_send(packet),
                (State::Transferring, Direction::Receiving) => self.transfer_receive(packet),
                (State::Transferring, Direction::Sending) => self.transfer_send(packet),
                _ => self.illegal(&packet, "before the transfer started"),
            },
        }
    }

    fn on_timeout(&mut self) -> Transition {
        if self.state == State::Start {
            return self.stay(Vec::new());
        }
        match self.retransmit.on_timeout() {
            TimeoutDecision::Retry => self.stay(vec![Action::Resend]),
            TimeoutDecision::GiveUp(kind) => {
                let block = match self.direction {
                    Direction::Sending => self.block,
                    Direction::Receiving => self.block.wrapping_add(1),
                };
                self.fail(TftpError::Timeout { block, kind })
            }
        }
    }

    /// Client download waiting for OACK or DATA 1, server upload waiting for DATA 1
    fn negotiating_receive(&mut self, packet: Packet) -> Transition {
        match packet {
            Packet::Oack { options } if self.role == Role::Client => {
                match self.requested.accept_oack(&options, RequestKind::Read) {
                    Ok(accepted) => {
                        let mut actions = self.settle(accepted);
                        self.block = 0;
                        actions.push(Action::Send(Packet::Ack { block: 0 }));
                        self.transition(State::Transferring, actions)
                    }
                    Err(err) => self.fail(err),
                }
            }
            Packet::Data { block: 1, payload } => {
                let mut actions = Vec::new();
                if self.role == Role::Client {
                    // No OACK: the server ignored every option.
                    actions = self.settle(OptionSet::default());
                }
                self.block = 0;
                self.state = State::Transferring;
                let mut next = self.receive_data(1, payload);
                actions.append(&mut next.actions);
                Transition {
                    state: next.state,
                    actions,
                }
            }
            other => self.illegal(&other, "while negotiating"),
        }
    }

    /// Client upload waiting for ACK 0 or OACK, server download waiting for ACK 0
    fn negotiating_send(&mut self, packet: Packet) -> Transition {
        let mut actions = match packet {
            Packet::Ack { block: 0 } => {
                if self.role == Role::Client {
                    self.settle(OptionSet::default())
                } else {
                    self.retransmit.on_progress();
                    Vec::new()
                }
            }
            Packet::Oack { options } if self.role == Role::Client => {
                match self.requested.accept_oack(&options, RequestKind::Write) {
                    Ok(accepted) => self.settle(accepted),
                    Err(err) => return self.fail(err),
                }
            }
            other => return self.illegal(&other, "while negotiating"),
        };

        self.block = 1;
        actions.push(Action::SendData(1));
        self.transition(State::Transferring, actions)
    }

    fn transfer_receive(&mut self, packet: Packet) -> Transition {
        match packet {
            Packet::Data { block, payload } => self.receive_data(block, payload),
            Packet::Oack { .. } if self.role == Role::Client && self.block == 0 => {
                self.duplicate(Duplicate::Oack)
            }
            other => self.illegal(&other, "while receiving data"),
        }
    }

    fn receive_data(&mut self, block: u16, payload: Bytes) -> Transition {
        let expected = self.block.wrapping_add(1);

        if block == expected {
            if payload.len() > self.block_size() {
                return self.fail(TftpError::IllegalOperation(format!(
                    "DATA block {} carries {} bytes, blksize is {}",
                    block,
                    payload.len(),
                    self.block_size()
                )));
            }
            self.block = block;
            self.retransmit.on_progress();
            let last = payload.len() < self.block_size();
            let mut actions = vec![Action::Write(payload), Action::Send(Packet::Ack { block })];
            if last {
                actions.push(Action::Finish);
                return self.transition(State::Completed, actions);
            }
            self.stay(actions)
        } else if is_behind(block, self.block) {
            self.duplicate(Duplicate::Data(block))
        } else {
            self.fail(TftpError::IllegalOperation(format!(
                "DATA block {} ahead of expected block {}",
                block, expected
            )))
        }
    }

    fn transfer_send(&mut self, packet: Packet) -> Transition {
        match packet {
            Packet::Ack { block } if block == self.block => {
                self.retransmit.on_progress();
                if self.final_sent {
                    return self.transition(State::Completed, vec![Action::Finish]);
                }
                self.block = self.block.wrapping_add(1);
                self.stay(vec![Action::SendData(self.block)])
            }
            Packet::Ack { block } if is_behind(block, self.block) => {
                self.duplicate(Duplicate::Ack(block))
            }
            Packet::Ack { block } => self.fail(TftpError::IllegalOperation(format!(
                "ACK for block {} ahead of block {} in flight",
                block, self.block
            ))),
            // DATA 1 was lost and the server repeats its OACK.
            Packet::Oack { .. } if self.role == Role::Client && self.block == 1 => {
                self.duplicate(Duplicate::Oack)
            }
            other => self.illegal(&other, "while sending data"),
        }
    }

    fn duplicate(&mut self, duplicate: Duplicate) -> Transition {
        match self.retransmit.on_duplicate(duplicate) {
            DuplicateDecision::Resend => self.stay(vec![Action::Duplicate, Action::Resend]),
            DuplicateDecision::Ignore => self.stay(vec![Action::Duplicate]),
            DuplicateDecision::Abort => {
                let limit = self.retransmit.max_dups();
                let mut transition = self.fail(TftpError::DuplicateLimit(limit));
                transition.actions.insert(0, Action::Duplicate);
                transition
            }
        }
    }

    /// Adopt the negotiated options
    fn settle(&mut self, accepted: OptionSet) -> Vec<Action> {
        self.options = accepted;
        self.apply_timeout();
        self.retransmit.on_progress();
        vec![Action::Negotiated(accepted)]
    }

    fn apply_timeout(&mut self) {
        if let Some(secs) = self.options.timeout {
            self.retransmit
                .set_timeout(std::time::Duration::from_secs(u64::from(secs)));
        }
    }

    fn illegal(&mut self, packet: &Packet, context: &str) -> Transition {
        self.fail(TftpError::IllegalOperation(format!(
            "unexpected {} {}",
            packet, context
        )))
    }

    fn fail(&mut self, err: TftpError) -> Transition {
        let notify = match self.role {
            Role::Server => !matches!(
                err,
                TftpError::Timeout { .. } | TftpError::DuplicateLimit(_) | TftpError::Peer { .. }
            ),
            Role::Client => matches!(err, TftpError::FailedNegotiation(_)),
        };

        let mut actions = Vec::new();
        if notify {
            actions.push(Action::Notify(Packet::Error {
                code: err.error_code(),
                message: err.to_string(),
            }));
        }
        actions.push(Action::Fail(err));
        self.transition(State::Error, actions)
    }

    fn stay(&self, actions: Vec<Action>) -> Transition {
        Transition {
            state: self.state,
            actions,
        }
    }

    fn transition(&mut self, state: State, actions: Vec<Action>) -> Transition {
        self.state = state;
        Transition { state, actions }
    }
}

/// `block` lies in the half of the number space before `current` (inclusive)
fn is_behind(block: u16, current: u16) -> bool {
    current.wrapping_sub(block) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeoutKind;
    use crate::options::{ServerPolicy, negotiate};
    use crate::packet::ErrorCode;
    use crate::retransmit::MAX_DUPS;
    use std::time::Duration;

    fn controller() -> RetransmissionController {
        RetransmissionController::new(Duration::from_millis(10), 3)
    }

    fn data(block: u16, len: usize) -> Packet {
        Packet::Data {
            block,
            payload: Bytes::from(vec![0x5a; len]),
        }
    }

    fn sent_packets(transition: &Transition) -> Vec<&Packet> {
        transition
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(p) | Action::Notify(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn failure(transition: &Transition) -> Option<&TftpError> {
        transition.actions.iter().find_map(|a| match a {
            Action::Fail(err) => Some(err),
            _ => None,
        })
    }

    fn upload_in_flight() -> StateMachine {
        let mut machine = StateMachine::client(
            Direction::Sending,
            "up.bin",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        machine.start();
        machine.step(Event::Packet(Packet::Ack { block: 0 }));
        machine.record_data_sent(512);
        machine
    }

    #[test]
    fn download_of_1000_bytes_takes_two_blocks() {
        let mut machine = StateMachine::client(
            Direction::Receiving,
            "file.bin",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        let t = machine.start();
        assert_eq!(t.state, State::Negotiating);
        assert!(matches!(sent_packets(&t)[..], [Packet::Rrq(_)]));

        let t = machine.step(Event::Packet(data(1, 512)));
        assert_eq!(t.state, State::Transferring);
        assert_eq!(sent_packets(&t), vec![&Packet::Ack { block: 1 }]);

        let t = machine.step(Event::Packet(data(2, 488)));
        assert_eq!(t.state, State::Completed);
        assert_eq!(sent_packets(&t), vec![&Packet::Ack { block: 2 }]);
        assert!(matches!(t.actions.last(), Some(Action::Finish)));
    }

    #[test]
    fn empty_download_completes_on_first_block() {
        let mut machine = StateMachine::client(
            Direction::Receiving,
            "empty",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        machine.start();
        let t = machine.step(Event::Packet(data(1, 0)));
        assert_eq!(t.state, State::Completed);
        assert_eq!(sent_packets(&t), vec![&Packet::Ack { block: 1 }]);
    }

    #[test]
    fn upload_sends_trailing_empty_block_on_exact_multiple() {
        let mut machine = upload_in_flight();
        let t = machine.step(Event::Packet(Packet::Ack { block: 1 }));
        assert!(matches!(t.actions[..], [Action::SendData(2)]));
        machine.record_data_sent(0);
        let t = machine.step(Event::Packet(Packet::Ack { block: 2 }));
        assert_eq!(t.state, State::Completed);
    }

    #[test]
    fn oack_settles_options_and_acks_block_zero() {
        let mut machine = StateMachine::client(
            Direction::Receiving,
            "file.bin",
            TransferMode::Octet,
            OptionSet::new().with_blksize(1024).with_transfer_size(0),
            controller(),
        );
        machine.start();
        let t = machine.step(Event::Packet(Packet::Oack {
            options: OptionSet::new().with_blksize(1024).with_transfer_size(9000).to_raw(),
        }));
        assert_eq!(t.state, State::Transferring);
        assert_eq!(machine.block_size(), 1024);
        assert_eq!(sent_packets(&t), vec![&Packet::Ack { block: 0 }]);

        // Our ACK 0 was lost and the server repeats its OACK.
        let t = machine.step(Event::Packet(Packet::Oack {
            options: OptionSet::new().with_blksize(1024).to_raw(),
        }));
        assert!(matches!(t.actions[..], [Action::Duplicate, Action::Resend]));
    }

    #[test]
    fn repeated_oack_during_upload_resends_first_block() {
        let requested = OptionSet::new().with_blksize(1024).with_transfer_size(4000);
        let mut machine = StateMachine::client(
            Direction::Sending,
            "up.bin",
            TransferMode::Octet,
            requested,
            controller(),
        );
        machine.start();
        let oack = Packet::Oack {
            options: requested.to_raw(),
        };
        let t = machine.step(Event::Packet(oack.clone()));
        assert!(matches!(t.actions[..], [Action::Negotiated(_), Action::SendData(1)]));
        machine.record_data_sent(1024);

        let t = machine.step(Event::Packet(oack.clone()));
        assert_eq!(t.state, State::Transferring);
        assert!(matches!(t.actions[..], [Action::Duplicate, Action::Resend]));

        let t = machine.step(Event::Packet(Packet::Ack { block: 1 }));
        assert!(matches!(t.actions[..], [Action::SendData(2)]));

        // Past block 1 an OACK is a protocol violation again.
        machine.record_data_sent(1024);
        let t = machine.step(Event::Packet(oack));
        assert_eq!(t.state, State::Error);
        assert!(matches!(failure(&t), Some(TftpError::IllegalOperation(_))));
    }

    #[test]
    fn bad_oack_is_refused_with_error_8() {
        let mut machine = StateMachine::client(
            Direction::Sending,
            "file.bin",
            TransferMode::Octet,
            OptionSet::new().with_blksize(512),
            controller(),
        );
        machine.start();
        let t = machine.step(Event::Packet(Packet::Oack {
            options: OptionSet::new().with_blksize(4096).to_raw(),
        }));
        assert_eq!(t.state, State::Error);
        assert!(matches!(
            sent_packets(&t)[..],
            [Packet::Error {
                code: ErrorCode::FailedNegotiation,
                ..
            }]
        ));
        assert!(matches!(failure(&t), Some(TftpError::FailedNegotiation(_))));
    }

    #[test]
    fn peer_error_aborts_without_reply() {
        let mut machine = StateMachine::client(
            Direction::Sending,
            "denied.bin",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        machine.start();
        let t = machine.step(Event::Packet(Packet::Error {
            code: ErrorCode::AccessViolation,
            message: "Access violation".to_string(),
        }));
        assert_eq!(t.state, State::Error);
        assert!(sent_packets(&t).is_empty());
        match failure(&t) {
            Some(TftpError::Peer { code, message }) => {
                assert_eq!(*code, ErrorCode::AccessViolation);
                assert_eq!(message, "Access violation");
            }
            other => panic!("unexpected failure {other:?}"),
        }
    }

    #[test]
    fn timeouts_resend_then_give_up() {
        let mut machine = upload_in_flight();
        for _ in 0..3 {
            let t = machine.step(Event::Timeout);
            assert!(matches!(t.actions[..], [Action::Resend]));
        }
        let t = machine.step(Event::Timeout);
        assert!(matches!(
            failure(&t),
            Some(TftpError::Timeout {
                block: 1,
                kind: TimeoutKind::NoResponse
            })
        ));
    }

    #[test]
    fn duplicate_ack_storm_never_resends_and_aborts() {
        let mut machine = upload_in_flight();
        machine.step(Event::Packet(Packet::Ack { block: 1 }));
        machine.record_data_sent(512);

        for _ in 0..MAX_DUPS {
            let t = machine.step(Event::Packet(Packet::Ack { block: 1 }));
            assert!(matches!(t.actions[..], [Action::Duplicate]));
        }
        let t = machine.step(Event::Packet(Packet::Ack { block: 1 }));
        assert_eq!(t.state, State::Error);
        assert!(matches!(failure(&t), Some(TftpError::DuplicateLimit(20))));
    }

    #[test]
    fn duplicate_acks_turn_timeout_into_expect_ack() {
        let mut machine = StateMachine::client(
            Direction::Sending,
            "x",
            TransferMode::Octet,
            OptionSet::new(),
            RetransmissionController::new(Duration::from_millis(10), 0),
        );
        machine.start();
        machine.step(Event::Packet(Packet::Ack { block: 0 }));
        machine.record_data_sent(512);
        machine.step(Event::Packet(Packet::Ack { block: 0 }));
        let t = machine.step(Event::Timeout);
        assert!(matches!(
            failure(&t),
            Some(TftpError::Timeout {
                kind: TimeoutKind::ExpectAck,
                ..
            })
        ));
    }

    #[test]
    fn duplicate_data_is_reacknowledged() {
        let mut machine = StateMachine::client(
            Direction::Receiving,
            "x",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        machine.start();
        machine.step(Event::Packet(data(1, 512)));
        let t = machine.step(Event::Packet(data(1, 512)));
        assert!(matches!(t.actions[..], [Action::Duplicate, Action::Resend]));
        assert_eq!(t.state, State::Transferring);
    }

    #[test]
    fn future_block_is_a_protocol_violation() {
        let mut machine = StateMachine::client(
            Direction::Receiving,
            "x",
            TransferMode::Octet,
            OptionSet::new(),
            controller(),
        );
        machine.start();
        machine.step(Event::Packet(data(1, 512)));
        let t = machine.step(Event::Packet(data(5, 512)));
        assert_eq!(t.state, State::Error);
        assert!(matches!(failure(&t), Some(TftpError::IllegalOperation(_))));
        // Clients do not report protocol violations back.
        assert!(sent_packets(&t).is_empty());
    }

    #[test]
    fn server_reports_illegal_operation_to_peer() {
        let negotiation = negotiate(
            &OptionSet::new(),
            &ServerPolicy::default(),
            RequestKind::Read,
            Some(10),
        );
        let mut machine = StateMachine::server(Direction::Sending, negotiation, controller());
        let t = machine.start();
        assert!(matches!(t.actions[..], [Action::Negotiated(_), Action::SendData(1)]));
        machine.record_data_sent(10);

        let t = machine.step(Event::Packet(data(1, 3)));
        assert!(matches!(
            sent_packets(&t)[..],
            [Packet::Error {
                code: ErrorCode::IllegalTftpOp,
                ..
            }]
        ));
    }

    #[test]
    fn server_write_acks_block_zero_without_options() {
        let negotiation = negotiate(
            &OptionSet::new(),
            &ServerPolicy::default(),
            RequestKind::Write,
            None,
        );
        let mut machine = StateMachine::server(Direction::Receiving, negotiation, controller());
        let t = machine.start();
        assert_eq!(sent_packets(&t), vec![&Packet::Ack { block: 0 }]);
        let t = machine.step(Event::Packet(data(1, 100)));
        assert_eq!(t.state, State::Completed);
    }

    #[test]
    fn local_failure_is_reported_by_server() {
        let negotiation = negotiate(
            &OptionSet::new(),
            &ServerPolicy::default(),
            RequestKind::Write,
            None,
        );
        let mut machine = StateMachine::server(Direction::Receiving, negotiation, controller());
        machine.start();
        let t = machine.step(Event::LocalFailure(TftpError::DiskFull("out.bin".into())));
        assert!(matches!(
            sent_packets(&t)[..],
            [Packet::Error {
                code: ErrorCode::DiskFull,
                ..
            }]
        ));
    }

    /// Drive a client download against a server read entirely in memory.
    #[test]
    fn block_numbers_wrap_past_65535() {
        const BLKSIZE: usize = 8;
        const FULL_BLOCKS: u32 = 70_000;
        const TAIL: usize = 3;

        let requested = OptionSet::new().with_blksize(BLKSIZE as u32);
        let mut client = StateMachine::client(
            Direction::Receiving,
            "big.bin",
            TransferMode::Octet,
            requested,
            controller(),
        );
        let negotiation = negotiate(&requested, &ServerPolicy::default(), RequestKind::Read, None);
        let mut server = StateMachine::server(Direction::Sending, negotiation, controller());

        let mut blocks_sent: u32 = 0;
        let mut written: usize = 0;
        let mut to_server: Vec<Packet> = Vec::new();
        let mut to_client: Vec<Packet> = Vec::new();

        let route = |machine: &mut StateMachine,
                         t: Transition,
                         out: &mut Vec<Packet>,
                         blocks_sent: &mut u32,
                         written: &mut usize| {
            for action in t.actions {
                match action {
                    Action::Send(p) => out.push(p),
                    Action::SendData(block) => {
                        let len = if *blocks_sent < FULL_BLOCKS { BLKSIZE } else { TAIL };
                        *blocks_sent += 1;
                        machine.record_data_sent(len);
                        out.push(data(block, len));
                    }
                    Action::Write(payload) => *written += payload.len(),
                    Action::Fail(err) => panic!("transfer failed: {err}"),
                    _ => {}
                }
            }
        };

        let t = client.start();
        route(&mut client, t, &mut to_server, &mut blocks_sent, &mut written);
        assert!(matches!(to_server.pop(), Some(Packet::Rrq(_))));
        let t = server.start();
        route(&mut server, t, &mut to_client, &mut blocks_sent, &mut written);

        while !(client.state().is_terminal() && server.state().is_terminal()) {
            for packet in std::mem::take(&mut to_client) {
                let t = client.step(Event::Packet(packet));
                route(&mut client, t, &mut to_server, &mut blocks_sent, &mut written);
            }
            for packet in std::mem::take(&mut to_server) {
                let t = server.step(Event::Packet(packet));
                route(&mut server, t, &mut to_client, &mut blocks_sent, &mut written);
            }
        }

        assert_eq!(client.state(), State::Completed);
        assert_eq!(server.state(), State::Completed);
        assert_eq!(blocks_sent, FULL_BLOCKS + 1);
        assert_eq!(written, FULL_BLOCKS as usize * BLKSIZE + TAIL);
        assert_eq!(client.block(), ((FULL_BLOCKS + 1) % 65536) as u16);
    }
}

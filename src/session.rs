//! Sessions and slots.
//!
//! A session is the client- or server-side half of a logical connection
//! between two endpoints. Slots track individual request/response
//! transactions inside the session's fixed in-flight window.

use std::cell::Cell;
use std::collections::VecDeque;

use crate::buffer::MsgBuffer;
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::sm::EndpointDescriptor;
use crate::transport::RouteHandle;
use crate::wheel::WheelEntry;

/// Session management state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the reply.
    ConnectInProgress,
    /// Session is connected and ready for requests.
    Connected,
    /// User destroyed the session before the connect settled; waiting for
    /// the connect reply before the disconnect can start.
    DisconnectWaitForConnect,
    /// Disconnect request sent, waiting for the reply.
    DisconnectInProgress,
    /// Terminal state.
    Disconnected,
}

impl SessionState {
    /// Whether a management reply is still outstanding for this state.
    #[inline]
    pub fn awaits_sm_reply(&self) -> bool {
        matches!(
            self,
            SessionState::ConnectInProgress
                | SessionState::DisconnectWaitForConnect
                | SessionState::DisconnectInProgress
        )
    }
}

/// Which side of the session this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Initiator; the only side that may originate requests.
    Client,
    /// Responder.
    Server,
}

/// One element of a session's in-flight window.
///
/// On the client side a slot covers a request from `enqueue_request` until
/// `release_response`. On the server side it covers a request from its
/// first received packet until the response is fully transmitted.
pub struct Slot<U> {
    /// Slot index within the session.
    pub index: usize,
    /// Occupied flag.
    pub in_use: bool,
    /// Request number of the current (or last) transaction.
    pub req_num: u64,
    /// Next request number this slot will carry (client side).
    pub next_req_num: u64,
    /// Request type of the current transaction.
    pub req_type: u8,
    /// Caller state carried through to the continuation.
    pub user_data: Option<U>,
    /// Message this side transmits: the request copy (client) or the
    /// response (server).
    pub tx_buf: Option<MsgBuffer>,
    /// Packets in the transmit message.
    pub tx_num_pkts: u16,
    /// Packets released to the transport so far.
    pub tx_pkts_sent: u16,
    /// Pool index of the transmit buffer, when it came from the endpoint's
    /// preallocated response pool.
    pub tx_pool_idx: Option<usize>,
    /// Whether this request has consumed its session credit.
    pub credit_consumed: bool,
    /// Reassembly buffer for the inbound message.
    pub rx_buf: Option<MsgBuffer>,
    /// Packets expected in the inbound message.
    pub rx_num_pkts: u16,
    /// Packets received so far.
    pub rx_pkts_rcvd: u16,
    /// Total byte length of the inbound message, known once its final
    /// packet arrives.
    pub rx_msg_len: usize,
    /// Response fully received; the slot stays occupied until released.
    pub completed: bool,
    /// Timestamp of enqueue, for the optional progress watchdog.
    pub enqueue_tsc: u64,
}

impl<U> Slot<U> {
    /// Create a new free slot. Its first request number equals its index.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            in_use: false,
            req_num: 0,
            next_req_num: index as u64,
            req_type: 0,
            user_data: None,
            tx_buf: None,
            tx_num_pkts: 0,
            tx_pkts_sent: 0,
            tx_pool_idx: None,
            credit_consumed: false,
            rx_buf: None,
            rx_num_pkts: 0,
            rx_pkts_rcvd: 0,
            rx_msg_len: 0,
            completed: false,
            enqueue_tsc: 0,
        }
    }

    /// Check if the slot is free.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.in_use
    }

    /// Release the slot for reuse.
    pub fn reset(&mut self) {
        self.in_use = false;
        self.req_type = 0;
        self.user_data = None;
        self.tx_buf = None;
        self.tx_num_pkts = 0;
        self.tx_pkts_sent = 0;
        self.tx_pool_idx = None;
        self.credit_consumed = false;
        self.rx_buf = None;
        self.rx_num_pkts = 0;
        self.rx_pkts_rcvd = 0;
        self.rx_msg_len = 0;
        self.completed = false;
        self.enqueue_tsc = 0;
    }

    /// Occupy the slot for an outbound request (client side), advancing the
    /// slot's request-number sequence by the window size.
    pub fn begin_request(
        &mut self,
        window: usize,
        req_type: u8,
        user_data: U,
        tx_buf: MsgBuffer,
        tx_num_pkts: u16,
        now: u64,
    ) -> u64 {
        debug_assert!(!self.in_use);
        let req_num = self.next_req_num;
        self.next_req_num += window as u64;

        self.in_use = true;
        self.req_num = req_num;
        self.req_type = req_type;
        self.user_data = Some(user_data);
        self.tx_buf = Some(tx_buf);
        self.tx_num_pkts = tx_num_pkts;
        self.tx_pkts_sent = 0;
        self.tx_pool_idx = None;
        self.credit_consumed = false;
        self.rx_buf = None;
        self.rx_num_pkts = 0;
        self.rx_pkts_rcvd = 0;
        self.rx_msg_len = 0;
        self.completed = false;
        self.enqueue_tsc = now;
        req_num
    }

    /// Occupy the slot for an inbound request (server side).
    pub fn begin_server_request(&mut self, req_num: u64, req_type: u8, rx_num_pkts: u16, now: u64) {
        self.in_use = true;
        self.req_num = req_num;
        self.req_type = req_type;
        self.user_data = None;
        self.tx_buf = None;
        self.tx_num_pkts = 0;
        self.tx_pkts_sent = 0;
        self.tx_pool_idx = None;
        self.credit_consumed = false;
        self.rx_buf = None;
        self.rx_num_pkts = rx_num_pkts;
        self.rx_pkts_rcvd = 0;
        self.rx_msg_len = 0;
        self.completed = false;
        self.enqueue_tsc = now;
    }

    /// Whether all inbound packets have arrived.
    #[inline]
    pub fn rx_complete(&self) -> bool {
        self.rx_num_pkts > 0 && self.rx_pkts_rcvd >= self.rx_num_pkts
    }

    /// Whether all outbound packets have been released to the transport.
    #[inline]
    pub fn tx_complete(&self) -> bool {
        self.tx_num_pkts > 0 && self.tx_pkts_sent >= self.tx_num_pkts
    }
}

/// A session: one side of a logical connection.
pub struct Session<U> {
    /// Local session number.
    pub local_session_num: u16,
    /// Peer's session number, learned during the handshake.
    pub remote_session_num: u16,
    /// Which side this endpoint plays.
    pub role: SessionRole,
    /// Management state.
    pub state: SessionState,
    /// Client-side descriptor.
    pub client: EndpointDescriptor,
    /// Server-side descriptor.
    pub server: EndpointDescriptor,
    /// Resolved data-plane route to the peer.
    pub route: Option<RouteHandle>,
    /// The in-flight window.
    pub slots: Vec<Slot<U>>,
    /// Transmit credits remaining.
    pub credits: Cell<usize>,
    /// First packets parked while credits were exhausted, oldest first.
    pub stalled: VecDeque<WheelEntry>,
    /// Pacing cursor: earliest timestamp for the next outbound packet.
    pub next_send_tsc: Cell<u64>,
    /// Window size.
    pub req_window: usize,
}

impl<U> Session<U> {
    /// Create a new session in the given role and state.
    pub fn new(
        local_session_num: u16,
        role: SessionRole,
        state: SessionState,
        client: EndpointDescriptor,
        server: EndpointDescriptor,
        config: &RpcConfig,
    ) -> Self {
        let req_window = config.session_req_window;
        let slots = (0..req_window).map(Slot::new).collect();

        Self {
            local_session_num,
            remote_session_num: 0,
            role,
            state,
            client,
            server,
            route: None,
            slots,
            credits: Cell::new(config.session_credits),
            stalled: VecDeque::new(),
            next_send_tsc: Cell::new(0),
            req_window,
        }
    }

    /// Check if the session is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Descriptor of the local side.
    #[inline]
    pub fn local_desc(&self) -> &EndpointDescriptor {
        match self.role {
            SessionRole::Client => &self.client,
            SessionRole::Server => &self.server,
        }
    }

    /// Descriptor of the remote side.
    #[inline]
    pub fn remote_desc(&self) -> &EndpointDescriptor {
        match self.role {
            SessionRole::Client => &self.server,
            SessionRole::Server => &self.client,
        }
    }

    /// Find a free slot.
    #[inline]
    pub fn alloc_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    /// Find the occupied slot carrying `req_num`.
    ///
    /// Slot k only ever carries request numbers congruent to k modulo the
    /// window, so the lookup is O(1).
    #[inline]
    pub fn find_slot_by_req_num(&self, req_num: u64) -> Option<usize> {
        let idx = (req_num % self.req_window as u64) as usize;
        let slot = &self.slots[idx];
        if slot.in_use && slot.req_num == req_num {
            Some(idx)
        } else {
            None
        }
    }

    /// Check if credits are available.
    #[inline]
    pub fn has_credits(&self) -> bool {
        self.credits.get() > 0
    }

    /// Consume a credit.
    pub fn consume_credit(&self) -> Result<()> {
        let credits = self.credits.get();
        if credits == 0 {
            return Err(Error::InvalidArgument("no credits to consume".into()));
        }
        self.credits.set(credits - 1);
        Ok(())
    }

    /// Return a credit.
    pub fn return_credit(&self) {
        self.credits.set(self.credits.get() + 1);
    }

    /// Number of occupied slots.
    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }

    /// Number of free slots.
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }
}

/// Session table keyed by local session number.
pub struct SessionTable<U> {
    sessions: Vec<Option<Session<U>>>,
    next_session_num: u16,
}

impl<U> SessionTable<U> {
    /// Create a table with room for `max_sessions`.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| None).collect(),
            next_session_num: 0,
        }
    }

    /// Allocate the next free session number, round-robin.
    pub fn alloc_session_num(&mut self) -> Option<u16> {
        let start = self.next_session_num as usize;
        for i in 0..self.sessions.len() {
            let idx = (start + i) % self.sessions.len();
            if self.sessions[idx].is_none() {
                self.next_session_num = ((idx + 1) % self.sessions.len()) as u16;
                return Some(idx as u16);
            }
        }
        None
    }

    /// Insert a session under its local number.
    pub fn insert(&mut self, session: Session<U>) {
        let idx = session.local_session_num as usize;
        debug_assert!(self.sessions[idx].is_none());
        self.sessions[idx] = Some(session);
    }

    /// Get a reference to a session.
    pub fn get(&self, session_num: u16) -> Option<&Session<U>> {
        self.sessions.get(session_num as usize).and_then(|s| s.as_ref())
    }

    /// Get a mutable reference to a session.
    pub fn get_mut(&mut self, session_num: u16) -> Option<&mut Session<U>> {
        self.sessions.get_mut(session_num as usize).and_then(|s| s.as_mut())
    }

    /// Remove a session.
    pub fn remove(&mut self, session_num: u16) -> Option<Session<U>> {
        self.sessions.get_mut(session_num as usize).and_then(|s| s.take())
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<U>> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }

    /// Iterate mutably over live sessions.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<U>> {
        self.sessions.iter_mut().filter_map(|s| s.as_mut())
    }
}

//! The endpoint: a polling-thread-bound runtime object owning sessions, the
//! timing wheel, the management retransmit list, and the transport.
//!
//! One endpoint is driven by exactly one thread through
//! [`Endpoint::run_event_loop_once`]. Background handlers run on the Nexus'
//! worker pool and feed their effects back through an op mailbox drained by
//! the polling loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::background::BgTask;
use crate::buffer::{BufferPool, MsgBuffer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::handler::{
    Continuation, HandlerClass, MailboxOp, ReqHandle, RespHandle, RespStatus, RpcContext, RpcCore,
    SmEvent, SmHandler,
};
use crate::nexus::Nexus;
use crate::packet::{PktHdr, PktKind, PKT_HDR_SIZE};
use crate::session::{Session, SessionRole, SessionState, SessionTable, Slot};
use crate::sm::{EndpointDescriptor, SmPkt, SmPktKind, SmStatus};
use crate::timing::{ms_to_cycles, rdtsc, us_to_cycles};
use crate::transport::{RouteInfo, RxPkt, Transport, TransportType, TxItem};
use crate::wheel::{pkt_gap_cycles, TimingWheel, WheelEntry, WheelStats};

/// Packets pulled from the transport per polling iteration.
const RX_BURST: usize = 64;

/// Preallocated response buffers kept per endpoint.
const RESP_POOL_SIZE: usize = 64;

/// Iterations between watchdog scans, when the watchdog is enabled.
const WATCHDOG_STRIDE: u64 = 4096;

/// Client-side state carried in a slot until the response completes.
struct PendingRequest {
    cont: Option<Continuation>,
    tag: u64,
    /// Whether the request was enqueued from background work; its
    /// continuation then runs on the background pool as well.
    bg: bool,
}

/// An in-flight management request awaiting its reply.
struct InFlightSm {
    session_num: u16,
    last_tx_tsc: u64,
}

#[derive(Default)]
struct Counters {
    requests_sent: Cell<u64>,
    responses_sent: Cell<u64>,
    responses_delivered: Cell<u64>,
    sm_retransmits: Cell<u64>,
    credit_stalls: Cell<u64>,
    pkts_transmitted: Cell<u64>,
}

/// Endpoint counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointStats {
    /// Requests admitted into the pipeline.
    pub requests_sent: u64,
    /// Responses enqueued for transmission.
    pub responses_sent: u64,
    /// Continuations dispatched.
    pub responses_delivered: u64,
    /// Management packets retransmitted by the sweep.
    pub sm_retransmits: u64,
    /// First packets parked for lack of credits.
    pub credit_stalls: u64,
    /// Data packets released to the transport.
    pub pkts_transmitted: u64,
}

/// A polling-thread-bound RPC endpoint, generic over its transport.
pub struct Endpoint<T: Transport> {
    id: u8,
    nexus: Arc<Nexus>,
    config: RpcConfig,
    freq_ghz: f64,
    mtu: usize,
    payload_per_pkt: usize,
    transport_type: TransportType,
    local_route: RouteInfo,
    pkt_gap_tsc: u64,

    transport: RefCell<T>,
    sessions: RefCell<SessionTable<PendingRequest>>,
    wheel: RefCell<TimingWheel>,
    in_flight_sm: RefCell<Vec<InFlightSm>>,
    resp_pool: RefCell<BufferPool>,
    rx_scratch: RefCell<Vec<RxPkt>>,
    deferred_ops: RefCell<VecDeque<MailboxOp>>,
    sm_handler: RefCell<Option<SmHandler>>,

    sm_rx: Receiver<SmPkt>,
    mailbox_rx: Receiver<MailboxOp>,
    bg_tx: Sender<BgTask>,

    counters: Counters,
    loop_count: Cell<u64>,
}

impl<T: Transport> Endpoint<T> {
    /// Create an endpoint bound to `nexus` under `id`, owning `transport`.
    pub fn new(nexus: &Arc<Nexus>, id: u8, transport: T) -> Result<Self> {
        let config = nexus.config().clone();
        let freq_ghz = nexus.freq_ghz();

        let mtu = transport.mtu();
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig("transport mtu must exceed the packet header".into()));
        }
        let payload_per_pkt = mtu - PKT_HDR_SIZE;
        if config.max_msg_size.div_ceil(payload_per_pkt) > u16::MAX as usize {
            return Err(Error::InvalidConfig(
                "max_msg_size needs more packets than the header can count at this mtu".into(),
            ));
        }

        let mut wheel = TimingWheel::new(
            config.wheel_num_buckets,
            config.wheel_bucket_width_us,
            freq_ghz,
            config.wheel_entry_cap,
        );
        wheel.reset(rdtsc());

        let pkt_gap_tsc = pkt_gap_cycles(mtu, config.target_rate_bps, freq_ghz);
        let resp_pool = BufferPool::new(RESP_POOL_SIZE, payload_per_pkt)?;

        let transport_type = transport.transport_type();
        let local_route = transport.local_route();

        // Registration last: everything fallible is already behind us.
        let (bg_tx, bg_rx) = bounded(config.bg_queue_depth);
        let (mailbox_tx, mailbox_rx) = unbounded();
        let sm_rx = nexus.register_endpoint(id, bg_rx, mailbox_tx)?;

        Ok(Self {
            id,
            nexus: nexus.clone(),
            config,
            freq_ghz,
            mtu,
            payload_per_pkt,
            transport_type,
            local_route,
            pkt_gap_tsc,
            transport: RefCell::new(transport),
            sessions: RefCell::new(SessionTable::new(nexus.config().max_sessions)),
            wheel: RefCell::new(wheel),
            in_flight_sm: RefCell::new(Vec::new()),
            resp_pool: RefCell::new(resp_pool),
            rx_scratch: RefCell::new(Vec::with_capacity(RX_BURST)),
            deferred_ops: RefCell::new(VecDeque::new()),
            sm_handler: RefCell::new(None),
            sm_rx,
            mailbox_rx,
            bg_tx,
            counters: Counters::default(),
            loop_count: Cell::new(0),
        })
    }

    /// Endpoint id.
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// MTU of the underlying transport.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Install the session-management event callback.
    pub fn set_sm_handler<F>(&self, f: F)
    where
        F: FnMut(u16, SmEvent) + 'static,
    {
        *self.sm_handler.borrow_mut() = Some(Box::new(f));
    }

    /// Counters snapshot.
    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            requests_sent: self.counters.requests_sent.get(),
            responses_sent: self.counters.responses_sent.get(),
            responses_delivered: self.counters.responses_delivered.get(),
            sm_retransmits: self.counters.sm_retransmits.get(),
            credit_stalls: self.counters.credit_stalls.get(),
            pkts_transmitted: self.counters.pkts_transmitted.get(),
        }
    }

    /// Timing wheel counters.
    pub fn wheel_stats(&self) -> WheelStats {
        self.wheel.borrow().stats()
    }

    /// Management state of a session, if it exists.
    pub fn session_state(&self, session_num: u16) -> Option<SessionState> {
        self.sessions.borrow().get(session_num).map(|s| s.state)
    }

    /// Remaining credits of a session, if it exists.
    pub fn session_credits(&self, session_num: u16) -> Option<usize> {
        self.sessions.borrow().get(session_num).map(|s| s.credits.get())
    }

    /// Free window slots of a session, if it exists.
    pub fn session_free_slots(&self, session_num: u16) -> Option<usize> {
        self.sessions.borrow().get(session_num).map(|s| s.free_slots())
    }

    /// Number of management requests awaiting replies.
    pub fn in_flight_sm_count(&self) -> usize {
        self.in_flight_sm.borrow().len()
    }

    // =========================================================================
    // Session management
    // =========================================================================

    /// Open a client session to `remote_hostname` (`host:port` of the peer
    /// Nexus) and endpoint `remote_endpoint_id`. The connect handshake
    /// proceeds in the event loop; the session-management callback reports
    /// the outcome.
    pub fn create_session(&self, remote_hostname: &str, remote_endpoint_id: u8) -> Result<u16> {
        let session_num = {
            let mut sessions = self.sessions.borrow_mut();
            let session_num = sessions.alloc_session_num().ok_or(Error::NoSessions)?;

            let mut client = EndpointDescriptor::new(
                self.nexus.mgmt_addr(),
                self.transport_type as u8,
                self.id,
                session_num,
            )?;
            client.set_route(&self.local_route);
            let server = EndpointDescriptor::new(
                remote_hostname,
                self.transport_type as u8,
                remote_endpoint_id,
                0,
            )?;

            let session = Session::new(
                session_num,
                SessionRole::Client,
                SessionState::ConnectInProgress,
                client,
                server,
                &self.config,
            );
            sessions.insert(session);
            session_num
        };

        self.send_sm_for_session(session_num);
        self.add_in_flight(session_num);
        tracing::debug!(session = session_num, remote = remote_hostname, "connect started");
        Ok(session_num)
    }

    /// Start disconnecting a session. In `connect-in-progress` the
    /// disconnect waits for the connect reply first.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = sessions
                .get_mut(session_num)
                .ok_or(Error::SessionNotFound(session_num))?;
            if sess.role != SessionRole::Client {
                return Err(Error::InvalidArgument(
                    "only client-role sessions can be destroyed".into(),
                ));
            }
            match sess.state {
                SessionState::Connected => {
                    sess.state = SessionState::DisconnectInProgress;
                    true
                }
                SessionState::ConnectInProgress => {
                    sess.state = SessionState::DisconnectWaitForConnect;
                    false
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "session {session_num} cannot be destroyed in state {:?}",
                        sess.state
                    )))
                }
            }
        };

        if action {
            self.send_sm_for_session(session_num);
            self.add_in_flight(session_num);
        }
        tracing::debug!(session = session_num, "disconnect started");
        Ok(())
    }

    /// Send (or resend) the management request appropriate for a session's
    /// current state. Retransmission never changes session state.
    fn send_sm_for_session(&self, session_num: u16) {
        let (pkt, dest) = {
            let sessions = self.sessions.borrow();
            let Some(sess) = sessions.get(session_num) else { return };
            let kind = match sess.state {
                SessionState::ConnectInProgress | SessionState::DisconnectWaitForConnect => {
                    SmPktKind::ConnectReq
                }
                SessionState::DisconnectInProgress => SmPktKind::DisconnectReq,
                _ => return,
            };
            let pkt = SmPkt::new(kind, SmStatus::Ok, sess.client, sess.server);
            (pkt, sess.remote_desc().hostname_str().to_string())
        };

        if let Err(e) = self.nexus.send_sm(&pkt, &dest) {
            tracing::debug!(session = session_num, "sm send failed: {e}");
        }
    }

    fn add_in_flight(&self, session_num: u16) {
        let mut in_flight = self.in_flight_sm.borrow_mut();
        debug_assert!(in_flight.iter().all(|r| r.session_num != session_num));
        in_flight.push(InFlightSm { session_num, last_tx_tsc: rdtsc() });
    }

    fn remove_in_flight(&self, session_num: u16) {
        self.in_flight_sm.borrow_mut().retain(|r| r.session_num != session_num);
    }

    fn restamp_in_flight(&self, session_num: u16) {
        let now = rdtsc();
        for r in self.in_flight_sm.borrow_mut().iter_mut() {
            if r.session_num == session_num {
                r.last_tx_tsc = now;
            }
        }
    }

    /// Retransmit management requests whose replies are overdue.
    fn sweep_sm_retransmit(&self, now: u64) {
        let threshold = ms_to_cycles(self.config.mgmt_retrans_ms, self.freq_ghz);
        let due: Vec<u16> = {
            let sessions = self.sessions.borrow();
            let mut in_flight = self.in_flight_sm.borrow_mut();
            // Entries whose session settled without passing through the
            // normal removal path are stale; drop them.
            in_flight.retain(|r| {
                sessions
                    .get(r.session_num)
                    .map(|s| s.state.awaits_sm_reply())
                    .unwrap_or(false)
            });
            let mut due = Vec::new();
            for r in in_flight.iter_mut() {
                if now.wrapping_sub(r.last_tx_tsc) >= threshold {
                    r.last_tx_tsc = now;
                    due.push(r.session_num);
                }
            }
            due
        };

        for session_num in due {
            tracing::debug!(session = session_num, "sm retransmit");
            self.send_sm_for_session(session_num);
            self.counters
                .sm_retransmits
                .set(self.counters.sm_retransmits.get() + 1);
        }
    }

    fn fire_sm_event(&self, session_num: u16, event: SmEvent) {
        let mut handler = self.sm_handler.borrow_mut().take();
        if let Some(ref mut f) = handler {
            f(session_num, event);
        }
        let mut cell = self.sm_handler.borrow_mut();
        if cell.is_none() {
            *cell = handler;
        }
    }

    fn process_sm(&self) -> usize {
        let mut events = 0;
        while let Ok(pkt) = self.sm_rx.try_recv() {
            events += 1;
            match pkt.pkt_kind() {
                SmPktKind::ConnectReq => self.handle_connect_req(pkt),
                SmPktKind::ConnectReply => self.handle_connect_reply(pkt),
                SmPktKind::DisconnectReq => self.handle_disconnect_req(pkt),
                SmPktKind::DisconnectReply => self.handle_disconnect_reply(pkt),
            }
        }
        events
    }

    /// Server side: a client asks to connect.
    fn handle_connect_req(&self, pkt: SmPkt) {
        let dest = pkt.client.hostname_str().to_string();

        if pkt.client.transport_type != self.transport_type as u8 {
            tracing::debug!(
                remote = %dest,
                remote_type = pkt.client.transport_type,
                "connect refused: transport mismatch"
            );
            let _ = self.nexus.send_sm(&pkt.reply(SmStatus::TransportMismatch), &dest);
            return;
        }

        let reply = {
            let mut sessions = self.sessions.borrow_mut();

            // A retransmitted connect-req for a session we already accepted
            // is answered with the existing descriptors.
            let existing_reply = sessions
                .iter()
                .find(|s| {
                    s.role == SessionRole::Server
                        && s.client.hostname == pkt.client.hostname
                        && s.client.endpoint_id == pkt.client.endpoint_id
                        && s.client.session_num == pkt.client.session_num
                })
                .map(|sess| {
                    let mut reply = pkt.reply(SmStatus::Ok);
                    reply.server = sess.server;
                    reply
                });
            if let Some(reply) = existing_reply {
                reply
            } else {
                let Some(session_num) = sessions.alloc_session_num() else {
                    tracing::debug!(remote = %dest, "connect refused: no sessions");
                    let _ = self.nexus.send_sm(&pkt.reply(SmStatus::NoSessions), &dest);
                    return;
                };

                let route = match self.transport.borrow_mut().resolve_route(&pkt.client.route()) {
                    Ok(route) => route,
                    Err(e) => {
                        tracing::debug!(remote = %dest, "connect refused: bad route material: {e}");
                        let _ = self.nexus.send_sm(&pkt.reply(SmStatus::TransportMismatch), &dest);
                        return;
                    }
                };

                let mut server = match EndpointDescriptor::new(
                    self.nexus.mgmt_addr(),
                    self.transport_type as u8,
                    self.id,
                    session_num,
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::error!("cannot build server descriptor: {e}");
                        return;
                    }
                };
                server.set_route(&self.local_route);

                let mut session = Session::new(
                    session_num,
                    SessionRole::Server,
                    SessionState::Connected,
                    pkt.client,
                    server,
                    &self.config,
                );
                session.remote_session_num = pkt.client.session_num;
                session.route = Some(route);
                sessions.insert(session);

                tracing::debug!(session = session_num, remote = %dest, "server session accepted");
                let mut reply = pkt.reply(SmStatus::Ok);
                reply.server = server;
                reply
            }
        };

        let _ = self.nexus.send_sm(&reply, &dest);
    }

    /// Client side: the server answered our connect request.
    fn handle_connect_reply(&self, pkt: SmPkt) {
        let session_num = pkt.client.session_num;
        let event = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(session_num) else {
                return;
            };
            if sess.role != SessionRole::Client {
                return;
            }

            match sess.state {
                SessionState::ConnectInProgress => {
                    self.remove_in_flight(session_num);
                    if pkt.status() == SmStatus::Ok {
                        match self.transport.borrow_mut().resolve_route(&pkt.server.route()) {
                            Ok(route) => {
                                sess.server = pkt.server;
                                sess.remote_session_num = pkt.server.session_num;
                                sess.route = Some(route);
                                sess.state = SessionState::Connected;
                                tracing::debug!(session = session_num, "connected");
                                Some(SmEvent::Connected)
                            }
                            Err(e) => {
                                tracing::debug!(session = session_num, "bad server route: {e}");
                                sess.state = SessionState::Disconnected;
                                Some(SmEvent::ConnectFailed(SmStatus::TransportMismatch))
                            }
                        }
                    } else {
                        tracing::debug!(
                            session = session_num,
                            error = %Error::from_sm_status(pkt.status(), sess.server.endpoint_id),
                            "connect failed"
                        );
                        sess.state = SessionState::Disconnected;
                        Some(SmEvent::ConnectFailed(pkt.status()))
                    }
                }
                SessionState::DisconnectWaitForConnect => {
                    if pkt.status() == SmStatus::Ok {
                        // The connect settled; now the disconnect can start.
                        sess.server = pkt.server;
                        sess.remote_session_num = pkt.server.session_num;
                        sess.state = SessionState::DisconnectInProgress;
                        None
                    } else {
                        self.remove_in_flight(session_num);
                        sess.state = SessionState::Disconnected;
                        Some(SmEvent::Disconnected)
                    }
                }
                // Duplicate reply after the transition already happened.
                _ => return,
            }
        };

        match event {
            Some(ev) => self.fire_sm_event(session_num, ev),
            None => {
                // DisconnectWaitForConnect -> DisconnectInProgress: emit the
                // disconnect request and keep the in-flight entry armed.
                self.send_sm_for_session(session_num);
                self.restamp_in_flight(session_num);
            }
        }
    }

    /// Server side: the client asks to disconnect.
    fn handle_disconnect_req(&self, pkt: SmPkt) {
        let session_num = pkt.server.session_num;
        {
            let mut sessions = self.sessions.borrow_mut();
            let matches = sessions
                .get(session_num)
                .map(|s| {
                    s.role == SessionRole::Server
                        && s.client.session_num == pkt.client.session_num
                        && s.client.hostname == pkt.client.hostname
                })
                .unwrap_or(false);
            if matches {
                sessions.remove(session_num);
                tracing::debug!(session = session_num, "server session torn down");
            }
        }
        // Reply even when the session is already gone, so a retransmitted
        // disconnect-req still settles the client.
        let dest = pkt.client.hostname_str().to_string();
        let _ = self.nexus.send_sm(&pkt.reply(SmStatus::Ok), &dest);
    }

    /// Client side: the server confirmed the disconnect.
    fn handle_disconnect_reply(&self, pkt: SmPkt) {
        let session_num = pkt.client.session_num;

        let failed: Vec<(PendingRequest, u64)> = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(session_num) else { return };
            if sess.role != SessionRole::Client || sess.state != SessionState::DisconnectInProgress {
                return;
            }

            sess.state = SessionState::Disconnected;
            sess.stalled.clear();

            let mut failed = Vec::new();
            for slot in sess.slots.iter_mut() {
                if slot.in_use {
                    if let Some(pending) = slot.user_data.take() {
                        failed.push((pending, slot.req_num));
                    }
                    slot.reset();
                }
            }
            failed
        };

        self.remove_in_flight(session_num);
        tracing::debug!(session = session_num, "disconnected");

        // Outstanding requests complete exactly once, with an error.
        for (pending, req_num) in failed {
            let resp = RespHandle {
                session_num,
                slot_idx: (req_num % self.config.session_req_window as u64) as usize,
                req_num,
                resp_msgbuf: MsgBuffer::empty(),
                status: RespStatus::SessionDisconnected,
            };
            if let Some(cont) = pending.cont {
                self.dispatch_continuation(cont, resp, pending.tag, pending.bg);
            }
        }

        self.fire_sm_event(session_num, SmEvent::Disconnected);
    }

    // =========================================================================
    // Request pipeline
    // =========================================================================

    /// Enqueue a request on a connected client session.
    ///
    /// The payload is copied out of `req` before the call returns. The
    /// continuation runs when the response completes (or the session
    /// disconnects), receiving `tag` verbatim.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        req: &MsgBuffer,
        cont: F,
        tag: u64,
    ) -> Result<()>
    where
        F: FnOnce(&RpcContext<'_>, RespHandle, u64) + Send + 'static,
    {
        self.enqueue_request_owned(
            session_num,
            req_type,
            MsgBuffer::from_slice(req.as_slice())?,
            Box::new(cont),
            tag,
            false,
        )
    }

    fn enqueue_request_owned(
        &self,
        session_num: u16,
        req_type: u8,
        req: MsgBuffer,
        cont: Continuation,
        tag: u64,
        bg: bool,
    ) -> Result<()> {
        if req.is_empty() {
            return Err(Error::InvalidArgument("request payload cannot be empty".into()));
        }
        if req.len() > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: req.len(),
                max: self.config.max_msg_size,
            });
        }

        let now = rdtsc();
        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions
            .get_mut(session_num)
            .ok_or(Error::SessionNotFound(session_num))?;

        if sess.role != SessionRole::Client {
            return Err(Error::InvalidArgument(
                "server-role sessions cannot originate requests".into(),
            ));
        }
        match sess.state {
            SessionState::Connected => {}
            SessionState::ConnectInProgress => {
                return Err(Error::SessionNotConnected(session_num))
            }
            _ => return Err(Error::SessionDisconnected(session_num)),
        }

        let slot_idx = sess.alloc_slot().ok_or(Error::NoFreeSlot(session_num))?;
        let num_pkts = PktHdr::calc_num_pkts(req.len(), self.mtu);

        let pending = PendingRequest { cont: Some(cont), tag, bg };
        let req_num = sess.slots[slot_idx].begin_request(
            self.config.session_req_window,
            req_type,
            pending,
            req,
            num_pkts,
            now,
        );

        // Schedule every packet at its paced timestamp. Credits gate the
        // transmit stage, not this insertion.
        let start = now.max(sess.next_send_tsc.get());
        let mut wheel = self.wheel.borrow_mut();
        for i in 0..num_pkts {
            wheel.insert(
                WheelEntry {
                    session_num,
                    slot_idx: slot_idx as u16,
                    pkt_idx: i,
                    req_num,
                },
                start + i as u64 * self.pkt_gap_tsc,
            );
        }
        sess.next_send_tsc.set(start + num_pkts as u64 * self.pkt_gap_tsc);

        self.counters.requests_sent.set(self.counters.requests_sent.get() + 1);
        Ok(())
    }

    /// Send the response for a request handle. Public counterpart of the
    /// context method, for foreground handlers that deferred the handle.
    pub fn enqueue_response(&self, req: ReqHandle) -> Result<()> {
        self.enqueue_response_core(req)
    }

    /// Return a response handle, freeing its slot.
    pub fn release_response(&self, resp: RespHandle) {
        self.release_response_core(resp)
    }

    /// Allocate a transport-registered message buffer.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        if size == 0 || size > self.config.max_msg_size {
            return Err(Error::InvalidArgument(format!(
                "buffer size must be in [1, {}]",
                self.config.max_msg_size
            )));
        }
        let mut buf = MsgBuffer::new(size)?;
        let reg = self
            .transport
            .borrow_mut()
            .reg_mr(buf.as_mut_ptr(), buf.capacity())?;
        buf.set_reg(reg);
        Ok(buf)
    }

    /// Free a message buffer, deregistering it from the transport.
    pub fn free_msg_buffer(&self, mut buf: MsgBuffer) {
        if let Some(reg) = buf.take_reg() {
            self.transport.borrow_mut().dereg_mr(reg);
        }
    }

    /// Resize a message buffer within its allocated capacity.
    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_size: usize) -> Result<()> {
        buf.resize(new_size)
    }

    fn dispatch_continuation(&self, cont: Continuation, resp: RespHandle, tag: u64, bg: bool) {
        self.counters
            .responses_delivered
            .set(self.counters.responses_delivered.get() + 1);
        if bg {
            if let Err(e) = self.bg_tx.try_send(BgTask::Continuation { cont, resp, tag }) {
                tracing::error!("background continuation dropped: {e}");
            }
        } else {
            let ctx = RpcContext::foreground(self as &dyn RpcCore);
            cont(&ctx, resp, tag);
        }
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    fn process_rx(&self) -> usize {
        let mut pkts = std::mem::take(&mut *self.rx_scratch.borrow_mut());
        pkts.clear();
        self.transport.borrow_mut().rx_burst(&mut pkts, RX_BURST);

        let count = pkts.len();
        for pkt in pkts.drain(..) {
            match pkt.hdr.pkt_kind() {
                PktKind::Req => self.rx_request(pkt),
                PktKind::Resp => self.rx_response(pkt),
            }
        }
        *self.rx_scratch.borrow_mut() = pkts;
        count
    }

    /// Reassemble one inbound packet into its slot's receive buffer.
    /// Returns true when the message is complete.
    fn reassemble(slot: &mut Slot<PendingRequest>, hdr: &PktHdr, payload: &[u8], per_pkt: usize) -> bool {
        let pkt_idx = hdr.pkt_idx as usize;
        let offset = pkt_idx * per_pkt;

        if let Some(buf) = slot.rx_buf.as_mut() {
            let end = offset + payload.len();
            if end <= buf.capacity() {
                buf.as_mut_slice()[offset..end].copy_from_slice(payload);
            } else {
                tracing::debug!("dropping packet overrunning its reassembly buffer");
                return false;
            }
        }
        slot.rx_pkts_rcvd += 1;
        if hdr.pkt_idx == hdr.pkt_cnt - 1 {
            slot.rx_msg_len = (hdr.pkt_cnt as usize - 1) * per_pkt + payload.len();
        }
        slot.rx_complete()
    }

    fn rx_request(&self, pkt: RxPkt) {
        let hdr = pkt.hdr;
        let session_num = hdr.dest_session_num;
        let req_num = hdr.req_num();
        let now = rdtsc();

        let dispatch = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(session_num) else {
                tracing::debug!(session = session_num, "request for unknown session dropped");
                return;
            };
            if sess.role != SessionRole::Server || !sess.is_connected() {
                tracing::debug!(session = session_num, "request for non-server session dropped");
                return;
            }

            let slot_idx = (req_num % sess.req_window as u64) as usize;
            let slot = &mut sess.slots[slot_idx];

            if slot.in_use {
                if slot.req_num != req_num || slot.rx_complete() {
                    // Duplicate or a request racing a still-busy slot; the
                    // window on the client side prevents the latter.
                    tracing::debug!(session = session_num, req_num, "stale request packet dropped");
                    return;
                }
            } else {
                // Server slots advance next_req_num when a response finishes
                // transmitting; anything older is a duplicate.
                if req_num < slot.next_req_num {
                    tracing::debug!(session = session_num, req_num, "expired request packet dropped");
                    return;
                }
                slot.begin_server_request(req_num, hdr.req_type, hdr.pkt_cnt, now);
                match MsgBuffer::new(hdr.pkt_cnt as usize * self.payload_per_pkt) {
                    Ok(buf) => slot.rx_buf = Some(buf),
                    Err(e) => {
                        tracing::error!("request reassembly buffer allocation failed: {e}");
                        slot.reset();
                        return;
                    }
                }
            }

            if !Self::reassemble(slot, &hdr, &pkt.payload, self.payload_per_pkt) {
                return;
            }

            // Full request assembled; build the handle and pick the handler.
            let mut req_msgbuf = slot.rx_buf.take().expect("reassembly buffer missing");
            req_msgbuf.set_len(slot.rx_msg_len);

            let Some((handler, class)) = self.nexus.handler(hdr.req_type) else {
                tracing::debug!(req_type = hdr.req_type, "no handler registered, request dropped");
                slot.reset();
                return;
            };

            let (prealloc_idx, mut prealloc_resp) = match self.resp_pool.borrow_mut().take() {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("response buffer allocation failed: {e}");
                    slot.reset();
                    return;
                }
            };
            prealloc_resp.set_len(prealloc_resp.capacity());

            let handle = ReqHandle {
                session_num,
                slot_idx,
                req_num,
                req_type: hdr.req_type,
                req_msgbuf,
                prealloc_resp,
                prealloc_idx,
                dyn_resp_msgbuf: None,
                prealloc_used: true,
            };
            Some((handler, class, handle, slot_idx))
        };

        let Some((handler, class, handle, slot_idx)) = dispatch else { return };

        // Handlers run with no interior borrows held: the class rule routes
        // background work to the pool, everything else runs inline.
        match class {
            HandlerClass::Background => {
                if let Err(e) = self.bg_tx.try_send(BgTask::Handler { handler, req: handle }) {
                    tracing::error!("background handler dropped: {e}");
                    let mut sessions = self.sessions.borrow_mut();
                    if let Some(sess) = sessions.get_mut(session_num) {
                        sess.slots[slot_idx].reset();
                    }
                }
            }
            HandlerClass::FgTerminal | HandlerClass::FgNonterminal => {
                let ctx = RpcContext::foreground(self as &dyn RpcCore);
                handler(&ctx, handle);

                if class == HandlerClass::FgTerminal {
                    let sessions = self.sessions.borrow();
                    if let Some(sess) = sessions.get(session_num) {
                        let slot = &sess.slots[slot_idx];
                        if slot.in_use && slot.tx_num_pkts == 0 {
                            tracing::warn!(
                                req_type = hdr.req_type,
                                "fg-terminal handler returned without responding"
                            );
                        }
                    }
                }
            }
        }
    }

    fn rx_response(&self, pkt: RxPkt) {
        let hdr = pkt.hdr;
        let session_num = hdr.dest_session_num;
        let req_num = hdr.req_num();
        let now = rdtsc();

        let completed = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(sess) = sessions.get_mut(session_num) else {
                tracing::debug!(session = session_num, "response for unknown session dropped");
                return;
            };
            if sess.role != SessionRole::Client {
                return;
            }
            let Some(slot_idx) = sess.find_slot_by_req_num(req_num) else {
                // Stale or duplicate response after the slot moved on.
                tracing::debug!(session = session_num, req_num, "stale response dropped");
                return;
            };
            let slot = &mut sess.slots[slot_idx];
            if slot.completed {
                return;
            }

            if slot.rx_buf.is_none() {
                slot.rx_num_pkts = hdr.pkt_cnt;
                slot.rx_pkts_rcvd = 0;
                match MsgBuffer::new(hdr.pkt_cnt as usize * self.payload_per_pkt) {
                    Ok(buf) => slot.rx_buf = Some(buf),
                    Err(e) => {
                        tracing::error!("response reassembly buffer allocation failed: {e}");
                        return;
                    }
                }
            }

            if !Self::reassemble(slot, &hdr, &pkt.payload, self.payload_per_pkt) {
                return;
            }

            // Final response packet: the credit comes back now, and any
            // stalled packets get re-admitted through the wheel.
            slot.completed = true;
            slot.tx_buf = None;
            let credit_back = slot.credit_consumed;

            let mut resp_msgbuf = slot.rx_buf.take().expect("reassembly buffer missing");
            resp_msgbuf.set_len(slot.rx_msg_len);
            let pending = slot.user_data.take();

            if credit_back {
                sess.return_credit();
            }
            if !sess.stalled.is_empty() {
                let mut wheel = self.wheel.borrow_mut();
                while let Some(ent) = sess.stalled.pop_front() {
                    wheel.insert(ent, now);
                }
            }

            pending.map(|p| {
                (
                    p,
                    RespHandle {
                        session_num,
                        slot_idx,
                        req_num,
                        resp_msgbuf,
                        status: RespStatus::Ok,
                    },
                )
            })
        };

        if let Some((pending, resp)) = completed {
            if let Some(cont) = pending.cont {
                self.dispatch_continuation(cont, resp, pending.tag, pending.bg);
            }
        }
    }

    // =========================================================================
    // Transmit path
    // =========================================================================

    fn process_tx(&self) -> usize {
        // Phase 1: drain the ready queue and plan transmissions. First
        // packets of credit-less requests park in their session's stall
        // FIFO; stale entries are dropped. Reap once more first, so
        // requests enqueued during this iteration's dispatch make this
        // transmit pass.
        let mut plan: Vec<(u16, usize, u16, PktHdr, crate::transport::RouteHandle)> = Vec::new();
        {
            let mut wheel = self.wheel.borrow_mut();
            wheel.reap(rdtsc());
            let mut sessions = self.sessions.borrow_mut();

            while let Some(ent) = wheel.pop_ready() {
                let Some(sess) = sessions.get_mut(ent.session_num) else { continue };
                if sess.state != SessionState::Connected {
                    continue;
                }
                let role = sess.role;
                let remote_session_num = sess.remote_session_num;
                let route_opt = sess.route;
                let slot_idx = ent.slot_idx as usize;

                {
                    let slot = &sess.slots[slot_idx];
                    if !slot.in_use || slot.req_num != ent.req_num || slot.tx_buf.is_none() {
                        continue;
                    }
                    if ent.pkt_idx >= slot.tx_num_pkts {
                        continue;
                    }
                }

                if role == SessionRole::Client && !sess.slots[slot_idx].credit_consumed {
                    if ent.pkt_idx == 0 && sess.has_credits() {
                        let _ = sess.consume_credit();
                        sess.slots[slot_idx].credit_consumed = true;
                    } else {
                        sess.stalled.push_back(ent);
                        self.counters
                            .credit_stalls
                            .set(self.counters.credit_stalls.get() + 1);
                        continue;
                    }
                }

                let Some(route) = route_opt else {
                    tracing::debug!(session = ent.session_num, "no route, packet dropped");
                    continue;
                };
                let kind = match role {
                    SessionRole::Client => PktKind::Req,
                    SessionRole::Server => PktKind::Resp,
                };

                let slot = &mut sess.slots[slot_idx];
                let hdr = PktHdr::new(
                    slot.req_type,
                    kind,
                    remote_session_num,
                    ent.pkt_idx,
                    slot.tx_num_pkts,
                    slot.req_num,
                );
                slot.tx_pkts_sent += 1;
                plan.push((ent.session_num, slot_idx, ent.pkt_idx, hdr, route));
            }
        }

        if plan.is_empty() {
            return 0;
        }

        // Phase 2: build the burst from slot-owned payloads and hand it to
        // the transport in one call.
        {
            let sessions = self.sessions.borrow();
            let mut items = Vec::with_capacity(plan.len());
            for (session_num, slot_idx, pkt_idx, hdr, route) in &plan {
                let Some(sess) = sessions.get(*session_num) else { continue };
                let slot = &sess.slots[*slot_idx];
                let Some(buf) = slot.tx_buf.as_ref() else { continue };

                let offset = *pkt_idx as usize * self.payload_per_pkt;
                let end = (offset + self.payload_per_pkt).min(buf.len());
                if offset > end {
                    continue;
                }
                items.push(TxItem {
                    route: *route,
                    hdr: *hdr,
                    payload: &buf.as_slice()[offset..end],
                });
            }

            if let Err(e) = self.transport.borrow_mut().tx_burst(&items) {
                tracing::error!("tx burst failed: {e}");
            }
            self.counters
                .pkts_transmitted
                .set(self.counters.pkts_transmitted.get() + items.len() as u64);
        }

        // Phase 3: server slots whose response is fully out are released;
        // dynamic response buffers die here, pool buffers go back.
        {
            let mut sessions = self.sessions.borrow_mut();
            let mut resp_pool = self.resp_pool.borrow_mut();
            for (session_num, slot_idx, _, _, _) in &plan {
                let Some(sess) = sessions.get_mut(*session_num) else { continue };
                if sess.role != SessionRole::Server {
                    continue;
                }
                let window = sess.req_window as u64;
                let slot = &mut sess.slots[*slot_idx];
                if slot.in_use && slot.tx_complete() {
                    if let Some(buf) = slot.tx_buf.take() {
                        if let Some(idx) = slot.tx_pool_idx.take() {
                            resp_pool.put(Some(idx), buf);
                        }
                    }
                    slot.next_req_num = slot.req_num + window;
                    slot.reset();
                }
            }
        }

        plan.len()
    }

    // =========================================================================
    // Background mailbox
    // =========================================================================

    fn drain_mailbox(&self) -> usize {
        let mut ops: Vec<MailboxOp> = self.deferred_ops.borrow_mut().drain(..).collect();
        while let Ok(op) = self.mailbox_rx.try_recv() {
            ops.push(op);
        }

        let count = ops.len();
        for op in ops {
            match op {
                MailboxOp::EnqueueRequest { session_num, req_type, req, cont, tag } => {
                    self.admit_background_request(session_num, req_type, req, cont, tag);
                }
                MailboxOp::EnqueueResponse(handle) => {
                    if let Err(e) = self.enqueue_response_core(handle) {
                        tracing::warn!("background response dropped: {e}");
                    }
                }
                MailboxOp::ReleaseResponse(resp) => self.release_response_core(resp),
            }
        }
        count
    }

    /// Admit a request deposited by background work. A full window defers
    /// the op to the next iteration; a dead session fails the continuation.
    fn admit_background_request(
        &self,
        session_num: u16,
        req_type: u8,
        req: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) {
        enum Admission {
            Admit,
            Defer,
            Fail,
        }

        let admission = {
            let sessions = self.sessions.borrow();
            match sessions.get(session_num) {
                Some(sess) if sess.is_connected() => {
                    if sess.alloc_slot().is_some() {
                        Admission::Admit
                    } else {
                        Admission::Defer
                    }
                }
                Some(sess) if sess.state == SessionState::ConnectInProgress => Admission::Defer,
                _ => Admission::Fail,
            }
        };

        match admission {
            Admission::Admit => {
                if let Err(e) =
                    self.enqueue_request_owned(session_num, req_type, req, cont, tag, true)
                {
                    tracing::warn!(session = session_num, "background request dropped: {e}");
                }
            }
            Admission::Defer => {
                self.deferred_ops.borrow_mut().push_back(MailboxOp::EnqueueRequest {
                    session_num,
                    req_type,
                    req,
                    cont,
                    tag,
                });
            }
            Admission::Fail => {
                let resp = RespHandle {
                    session_num,
                    slot_idx: 0,
                    req_num: 0,
                    resp_msgbuf: MsgBuffer::empty(),
                    status: RespStatus::SessionDisconnected,
                };
                self.dispatch_continuation(cont, resp, tag, true);
            }
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run one iteration of the event loop. Returns the number of events
    /// processed.
    pub fn run_event_loop_once(&self) -> usize {
        let now = rdtsc();
        let mut events = 0;

        // Pacing first: release everything the clock has crossed.
        self.wheel.borrow_mut().reap(now);

        // Effects deposited by background workers.
        events += self.drain_mailbox();

        // Receive and dispatch.
        events += self.process_rx();

        // Transmit the ready queue.
        events += self.process_tx();

        // Management plane: inbound packets, then the retransmit sweep.
        events += self.process_sm();
        self.sweep_sm_retransmit(now);

        let iter = self.loop_count.get().wrapping_add(1);
        self.loop_count.set(iter);
        if self.config.slot_watchdog_us.is_some() && iter % WATCHDOG_STRIDE == 0 {
            self.watchdog_scan(now);
        }

        events
    }

    /// Run the event loop for at least `duration`.
    pub fn run_event_loop(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.run_event_loop_once();
        }
    }

    fn watchdog_scan(&self, now: u64) {
        let Some(watchdog_us) = self.config.slot_watchdog_us else { return };
        let threshold = us_to_cycles(watchdog_us as f64, self.freq_ghz);
        let sessions = self.sessions.borrow();
        for sess in sessions.iter() {
            for slot in &sess.slots {
                if slot.in_use && now.wrapping_sub(slot.enqueue_tsc) > threshold {
                    tracing::warn!(
                        session = sess.local_session_num,
                        slot = slot.index,
                        req_num = slot.req_num,
                        "slot has made no progress past the watchdog threshold"
                    );
                }
            }
        }
    }
}

impl<T: Transport> RpcCore for Endpoint<T> {
    fn enqueue_request_boxed(
        &self,
        session_num: u16,
        req_type: u8,
        req: &MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()> {
        self.enqueue_request_owned(
            session_num,
            req_type,
            MsgBuffer::from_slice(req.as_slice())?,
            cont,
            tag,
            false,
        )
    }

    fn enqueue_response_core(&self, mut req: ReqHandle) -> Result<()> {
        let now = rdtsc();
        let mut sessions = self.sessions.borrow_mut();
        let sess = sessions
            .get_mut(req.session_num)
            .ok_or(Error::SessionNotFound(req.session_num))?;
        if sess.role != SessionRole::Server {
            return Err(Error::InvalidArgument("response on a client-role session".into()));
        }
        if !sess.is_connected() {
            return Err(Error::SessionDisconnected(req.session_num));
        }

        let slot = &mut sess.slots[req.slot_idx];
        if !slot.in_use || slot.req_num != req.req_num {
            tracing::debug!(
                session = req.session_num,
                req_num = req.req_num,
                "response for stale request dropped"
            );
            return Ok(());
        }

        let mut resp_pool = self.resp_pool.borrow_mut();
        let (resp, pool_idx) = if req.prealloc_used {
            (req.prealloc_resp, req.prealloc_idx)
        } else {
            let dyn_buf = req.dyn_resp_msgbuf.take().ok_or_else(|| {
                Error::InvalidArgument("prealloc_used is false but no dynamic buffer attached".into())
            })?;
            // The unused preallocated buffer goes straight back.
            resp_pool.put(req.prealloc_idx, req.prealloc_resp);
            (dyn_buf, None)
        };

        if resp.len() > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size: resp.len(),
                max: self.config.max_msg_size,
            });
        }

        let num_pkts = PktHdr::calc_num_pkts(resp.len(), self.mtu);
        slot.tx_buf = Some(resp);
        slot.tx_pool_idx = pool_idx;
        slot.tx_num_pkts = num_pkts;
        slot.tx_pkts_sent = 0;

        let start = now.max(sess.next_send_tsc.get());
        let mut wheel = self.wheel.borrow_mut();
        for i in 0..num_pkts {
            wheel.insert(
                WheelEntry {
                    session_num: req.session_num,
                    slot_idx: req.slot_idx as u16,
                    pkt_idx: i,
                    req_num: req.req_num,
                },
                start + i as u64 * self.pkt_gap_tsc,
            );
        }
        sess.next_send_tsc.set(start + num_pkts as u64 * self.pkt_gap_tsc);

        self.counters.responses_sent.set(self.counters.responses_sent.get() + 1);
        Ok(())
    }

    fn release_response_core(&self, resp: RespHandle) {
        let mut sessions = self.sessions.borrow_mut();
        let Some(sess) = sessions.get_mut(resp.session_num) else { return };
        let Some(slot) = sess.slots.get_mut(resp.slot_idx) else { return };
        if slot.in_use && slot.req_num == resp.req_num && slot.completed {
            slot.reset();
        }
    }

    fn alloc_msg_buffer_core(&self, size: usize) -> Result<MsgBuffer> {
        self.alloc_msg_buffer(size)
    }
}

impl<T: Transport> Drop for Endpoint<T> {
    fn drop(&mut self) {
        self.nexus.unregister_endpoint(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimHub, SimTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_config() -> RpcConfig {
        RpcConfig::default()
            .with_mgmt_retrans_ms(2)
            .with_target_rate_bps(1.0e12)
    }

    fn poll_until<F: FnMut() -> bool>(mut f: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
        }
        false
    }

    fn connect(
        client: &Endpoint<SimTransport>,
        server: &Endpoint<SimTransport>,
        server_ep_id: u8,
    ) -> u16 {
        let session = client
            .create_session(client.nexus.mgmt_addr(), server_ep_id)
            .unwrap();
        assert!(
            poll_until(
                || {
                    client.run_event_loop_once();
                    server.run_event_loop_once();
                    client.session_state(session) == Some(SessionState::Connected)
                },
                Duration::from_secs(5),
            ),
            "session never connected"
        );
        session
    }

    #[test]
    fn test_session_handshake() {
        let nexus = Nexus::with_config("127.0.0.1", 0, fast_config()).unwrap();
        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        client.set_sm_handler(move |sn, ev| events2.lock().unwrap().push((sn, ev)));

        let session = connect(&client, &server, 1);

        assert_eq!(client.in_flight_sm_count(), 0);
        assert_eq!(events.lock().unwrap().as_slice(), &[(session, SmEvent::Connected)]);
        // The server side allocated its own session for us.
        assert_eq!(server.sessions.borrow().active_count(), 1);
    }

    #[test]
    fn test_connect_to_unknown_endpoint_fails() {
        let nexus = Nexus::with_config("127.0.0.1", 0, fast_config()).unwrap();
        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        client.set_sm_handler(move |sn, ev| events2.lock().unwrap().push((sn, ev)));

        let session = client.create_session(nexus.mgmt_addr(), 99).unwrap();
        assert!(poll_until(
            || {
                client.run_event_loop_once();
                client.session_state(session) == Some(SessionState::Disconnected)
            },
            Duration::from_secs(5),
        ));
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[(session, SmEvent::ConnectFailed(SmStatus::InvalidRemote))]
        );
        assert_eq!(client.in_flight_sm_count(), 0);
    }

    #[test]
    fn test_echo_roundtrip_prealloc() {
        let nexus = Nexus::with_config("127.0.0.1", 0, fast_config()).unwrap();
        nexus
            .register_req_func(7, HandlerClass::FgTerminal, |ctx, mut req| {
                assert!(!ctx.in_background());
                let n = req.req_msgbuf().len();
                req.prealloc_resp.resize(n).unwrap();
                let data = req.req_msgbuf().as_slice().to_vec();
                req.prealloc_resp.as_mut_slice().copy_from_slice(&data);
                ctx.enqueue_response(req).unwrap();
            })
            .unwrap();

        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let window = nexus.config().session_req_window;
        let credits = nexus.config().session_credits;

        let mut req = client.alloc_msg_buffer(32).unwrap();
        req.as_mut_slice().fill(0x42);

        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        client
            .enqueue_request(
                session,
                7,
                &req,
                move |ctx, resp, tag| {
                    assert_eq!(tag, 0xABCD);
                    assert!(resp.is_ok());
                    *got2.lock().unwrap() = Some(resp.resp_msgbuf().as_slice().to_vec());
                    ctx.release_response(resp);
                },
                0xABCD,
            )
            .unwrap();

        assert!(poll_until(
            || {
                client.run_event_loop_once();
                server.run_event_loop_once();
                got.lock().unwrap().is_some()
            },
            Duration::from_secs(5),
        ));
        assert_eq!(got.lock().unwrap().as_deref(), Some(vec![0x42u8; 32].as_slice()));

        // Slot released, credit restored.
        assert_eq!(client.session_free_slots(session), Some(window));
        assert_eq!(client.session_credits(session), Some(credits));
        client.free_msg_buffer(req);
    }

    #[test]
    fn test_multi_packet_roundtrip() {
        let config = fast_config().with_mtu(256);
        let nexus = Nexus::with_config("127.0.0.1", 0, config).unwrap();
        nexus
            .register_req_func(9, HandlerClass::FgTerminal, |ctx, mut req| {
                // Respond with every byte incremented, in a dynamic buffer.
                let mut resp = ctx.alloc_msg_buffer(req.req_msgbuf().len()).unwrap();
                for (dst, src) in resp.as_mut_slice().iter_mut().zip(req.req_msgbuf().as_slice()) {
                    *dst = src.wrapping_add(1);
                }
                req.dyn_resp_msgbuf = Some(resp);
                req.prealloc_used = false;
                ctx.enqueue_response(req).unwrap();
            })
            .unwrap();

        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 256).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 256).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let msg_len = 1000; // several packets at this MTU
        let mut req = client.alloc_msg_buffer(msg_len).unwrap();
        for (i, b) in req.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let expect: Vec<u8> = req.as_slice().iter().map(|b| b.wrapping_add(1)).collect();

        let got = Arc::new(Mutex::new(None));
        let got2 = got.clone();
        client
            .enqueue_request(
                session,
                9,
                &req,
                move |ctx, resp, _| {
                    *got2.lock().unwrap() = Some(resp.resp_msgbuf().as_slice().to_vec());
                    ctx.release_response(resp);
                },
                0,
            )
            .unwrap();

        assert!(poll_until(
            || {
                client.run_event_loop_once();
                server.run_event_loop_once();
                got.lock().unwrap().is_some()
            },
            Duration::from_secs(5),
        ));
        assert_eq!(got.lock().unwrap().as_deref(), Some(expect.as_slice()));
    }

    #[test]
    fn test_enqueue_requires_connected_session() {
        let nexus = Nexus::with_config("127.0.0.1", 0, fast_config()).unwrap();
        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();

        let session = client.create_session("127.0.0.1:1", 0).unwrap();
        let req = client.alloc_msg_buffer(8).unwrap();

        // Still connect-in-progress.
        let err = client
            .enqueue_request(session, 1, &req, |_, _, _| {}, 0)
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotConnected(_)));

        let err = client
            .enqueue_request(99, 1, &req, |_, _, _| {}, 0)
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(99)));
    }

    #[test]
    fn test_enqueue_validates_payload() {
        let nexus = Nexus::with_config("127.0.0.1", 0, fast_config()).unwrap();
        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let empty = MsgBuffer::empty();
        let err = client
            .enqueue_request(session, 1, &empty, |_, _, _| {}, 0)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let max = nexus.config().max_msg_size;
        let mut big = MsgBuffer::new(max + 1).unwrap();
        big.set_len(max + 1);
        let err = client
            .enqueue_request(session, 1, &big, |_, _, _| {}, 0)
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[test]
    fn test_window_exhaustion_returns_no_free_slot() {
        let config = fast_config().with_req_window(1).with_session_credits(1);
        let nexus = Nexus::with_config("127.0.0.1", 0, config).unwrap();
        nexus
            .register_req_func(1, HandlerClass::FgTerminal, |ctx, mut req| {
                req.prealloc_resp.resize(1).unwrap();
                ctx.enqueue_response(req).unwrap();
            })
            .unwrap();

        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let req = client.alloc_msg_buffer(8).unwrap();
        client.enqueue_request(session, 1, &req, |ctx, resp, _| ctx.release_response(resp), 0).unwrap();

        let err = client
            .enqueue_request(session, 1, &req, |_, _, _| {}, 0)
            .unwrap_err();
        assert!(matches!(err, Error::NoFreeSlot(_)));
    }

    /// A continuation that enqueues during dispatch sees slot availability
    /// as of the moment of the call: occupied before release_response,
    /// free after.
    #[test]
    fn test_reentrant_enqueue_from_continuation() {
        let config = fast_config().with_req_window(1).with_session_credits(1);
        let nexus = Nexus::with_config("127.0.0.1", 0, config).unwrap();
        nexus
            .register_req_func(1, HandlerClass::FgTerminal, |ctx, mut req| {
                req.prealloc_resp.resize(1).unwrap();
                req.prealloc_resp.as_mut_slice()[0] = 0xEE;
                ctx.enqueue_response(req).unwrap();
            })
            .unwrap();

        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let second_done = Arc::new(AtomicUsize::new(0));
        let second_done2 = second_done.clone();

        let req = client.alloc_msg_buffer(8).unwrap();
        let probe = MsgBuffer::from_slice(&[1u8; 8]).unwrap();
        client
            .enqueue_request(
                session,
                1,
                &req,
                move |ctx, resp, _| {
                    // Slot still occupied by this very request.
                    let before = ctx.enqueue_request(session, 1, &probe, |_, _, _| {}, 0);
                    ctx.release_response(resp);
                    // Slot free now; this enqueue must win.
                    let after = ctx.enqueue_request(
                        session,
                        1,
                        &probe,
                        move |ctx2, resp2, _| {
                            second_done2.fetch_add(1, Ordering::SeqCst);
                            ctx2.release_response(resp2);
                        },
                        0,
                    );
                    *outcome2.lock().unwrap() = Some((before.is_err(), after.is_ok()));
                },
                0,
            )
            .unwrap();

        assert!(poll_until(
            || {
                client.run_event_loop_once();
                server.run_event_loop_once();
                second_done.load(Ordering::SeqCst) == 1
            },
            Duration::from_secs(5),
        ));
        assert_eq!(*outcome.lock().unwrap(), Some((true, true)));
    }

    /// With fewer credits than window slots, transmission stalls while the
    /// window keeps accepting requests; everything still completes.
    #[test]
    fn test_credit_stall_and_drain() {
        let config = fast_config().with_req_window(8).with_session_credits(2);
        let nexus = Nexus::with_config("127.0.0.1", 0, config).unwrap();
        nexus
            .register_req_func(1, HandlerClass::FgTerminal, |ctx, mut req| {
                req.prealloc_resp.resize(1).unwrap();
                ctx.enqueue_response(req).unwrap();
            })
            .unwrap();

        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let done = Arc::new(AtomicUsize::new(0));
        let req = client.alloc_msg_buffer(16).unwrap();
        for _ in 0..8 {
            let done2 = done.clone();
            client
                .enqueue_request(
                    session,
                    1,
                    &req,
                    move |ctx, resp, _| {
                        done2.fetch_add(1, Ordering::SeqCst);
                        ctx.release_response(resp);
                    },
                    0,
                )
                .unwrap();
        }

        assert!(poll_until(
            || {
                client.run_event_loop_once();
                server.run_event_loop_once();
                done.load(Ordering::SeqCst) == 8
            },
            Duration::from_secs(5),
        ));

        // 8 admitted requests with only 2 credits must have parked some
        // first packets.
        assert!(client.stats().credit_stalls > 0);
        assert_eq!(client.session_credits(session), Some(2));
    }

    /// destroy_session on a connected session walks the disconnect sequence
    /// and fails outstanding requests exactly once.
    #[test]
    fn test_destroy_session_fails_outstanding() {
        let config = fast_config().with_req_window(4).with_session_credits(4);
        let nexus = Nexus::with_config("127.0.0.1", 0, config).unwrap();
        // No handler for type 1 on purpose: requests go out, responses never come.
        let hub = SimHub::new();
        let client = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let server = Endpoint::new(&nexus, 1, SimTransport::new(&hub, 1024).unwrap()).unwrap();
        let session = connect(&client, &server, 1);

        let errors = Arc::new(AtomicUsize::new(0));
        let req = client.alloc_msg_buffer(8).unwrap();
        for _ in 0..3 {
            let errors2 = errors.clone();
            client
                .enqueue_request(
                    session,
                    1,
                    &req,
                    move |_, resp, _| {
                        assert_eq!(resp.status(), RespStatus::SessionDisconnected);
                        assert!(resp.resp_msgbuf().is_empty());
                        errors2.fetch_add(1, Ordering::SeqCst);
                    },
                    0,
                )
                .unwrap();
        }

        client.destroy_session(session).unwrap();
        assert!(poll_until(
            || {
                client.run_event_loop_once();
                server.run_event_loop_once();
                client.session_state(session) == Some(SessionState::Disconnected)
            },
            Duration::from_secs(5),
        ));

        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert_eq!(client.in_flight_sm_count(), 0);
        // The server side tore its session down too.
        assert!(poll_until(
            || {
                server.run_event_loop_once();
                server.sessions.borrow().active_count() == 0
            },
            Duration::from_secs(1),
        ));
    }
}

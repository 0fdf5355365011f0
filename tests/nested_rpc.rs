//! Nested request tests: a handler issues its own request and responds to
//! the original caller only after the nested response arrives.
//!
//! Topology: client -> server-0 -> server-1. The client fills its request
//! window with randomly sized requests whose bytes encode the buffer index;
//! each hop increments every byte, so the client expects `index + 3` back.

mod common;

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{init_tracing, pack_tag, poll_until, unpack_tag};
use pacerpc::{
    Endpoint, HandlerClass, MsgBuffer, Nexus, RespHandle, RpcConfig, RpcContext, SessionState,
    SimHub, SimTransport,
};

/// Client-to-server-0 request type.
const REQ_TYPE_CS: u8 = 2;
/// Server-0-to-server-1 request type.
const REQ_TYPE_SS: u8 = 3;

const NUM_REQS: usize = 30;
const WINDOW: usize = 8;
const MAX_MSG: usize = 4096;

fn test_config(bg_threads: usize) -> RpcConfig {
    RpcConfig::default()
        .with_req_window(WINDOW)
        .with_session_credits(WINDOW)
        .with_max_msg_size(MAX_MSG)
        .with_mgmt_retrans_ms(2)
        .with_target_rate_bps(1.0e12)
        .with_bg_threads(bg_threads)
}

struct ClientState {
    session: u16,
    bufs: Mutex<Vec<MsgBuffer>>,
    rng: Mutex<StdRng>,
    num_sent: AtomicUsize,
    num_resps: AtomicUsize,
}

fn client_send(state: &Arc<ClientState>, ctx: &RpcContext<'_>, msgbuf_i: usize) {
    let req_i = state.num_sent.fetch_add(1, Ordering::SeqCst);
    let size = state.rng.lock().unwrap().gen_range(1..MAX_MSG);
    let tag = pack_tag(req_i as u16, msgbuf_i as u16, size as u32);

    let mut bufs = state.bufs.lock().unwrap();
    let buf = &mut bufs[msgbuf_i];
    buf.resize(size).unwrap();
    buf.as_mut_slice().fill(msgbuf_i as u8);

    let st = state.clone();
    ctx.enqueue_request(
        state.session,
        REQ_TYPE_CS,
        buf,
        move |ctx2, resp, tag| client_cont(&st, ctx2, resp, tag),
        tag,
    )
    .unwrap();
}

fn client_cont(state: &Arc<ClientState>, ctx: &RpcContext<'_>, resp: RespHandle, tag: u64) {
    assert!(!ctx.in_background());
    assert!(resp.is_ok());

    let (_req_i, msgbuf_i, req_size) = unpack_tag(tag);
    let data = resp.resp_msgbuf().as_slice();
    assert_eq!(data.len(), req_size as usize);
    for &b in data {
        assert_eq!(b, (msgbuf_i as u8).wrapping_add(3));
    }

    state.num_resps.fetch_add(1, Ordering::SeqCst);
    ctx.release_response(resp);

    if state.num_sent.load(Ordering::SeqCst) < NUM_REQS {
        client_send(state, ctx, msgbuf_i as usize);
    }
}

fn run_nested(s0_bg: bool, s1_bg: bool, seed: u64) {
    init_tracing();

    let client_nexus = Nexus::with_config("127.0.0.1", 0, test_config(0)).unwrap();
    let s0_nexus = Nexus::with_config("127.0.0.1", 0, test_config(if s0_bg { 1 } else { 0 })).unwrap();
    let s1_nexus = Nexus::with_config("127.0.0.1", 0, test_config(if s1_bg { 1 } else { 0 })).unwrap();

    // Server 0 forwards client requests to server 1, bumping every byte,
    // and answers the client only from its continuation.
    let ss_session = Arc::new(AtomicU16::new(u16::MAX));
    let ss_session2 = ss_session.clone();
    s0_nexus
        .register_req_func(
            REQ_TYPE_CS,
            if s0_bg { HandlerClass::Background } else { HandlerClass::FgNonterminal },
            move |ctx, req| {
                assert_eq!(ctx.in_background(), s0_bg);

                let n = req.req_msgbuf().len();
                let mut fwd = ctx.alloc_msg_buffer(n).unwrap();
                for (dst, src) in fwd.as_mut_slice().iter_mut().zip(req.req_msgbuf().as_slice()) {
                    *dst = src.wrapping_add(1);
                }
                let expected: Vec<u8> = fwd.as_slice().iter().map(|b| b.wrapping_add(1)).collect();

                let mut req = req;
                let session = ss_session2.load(Ordering::SeqCst);
                ctx.enqueue_request(
                    session,
                    REQ_TYPE_SS,
                    &fwd,
                    move |ctx2, resp_ss, _tag| {
                        assert_eq!(ctx2.in_background(), s0_bg);
                        assert!(resp_ss.is_ok());
                        assert_eq!(resp_ss.resp_msgbuf().len(), expected.len());
                        assert_eq!(resp_ss.resp_msgbuf().as_slice(), expected.as_slice());

                        // Client response = nested response + 1.
                        let mut out = ctx2.alloc_msg_buffer(expected.len()).unwrap();
                        for (dst, src) in
                            out.as_mut_slice().iter_mut().zip(resp_ss.resp_msgbuf().as_slice())
                        {
                            *dst = src.wrapping_add(1);
                        }
                        ctx2.release_response(resp_ss);

                        req.dyn_resp_msgbuf = Some(out);
                        req.prealloc_used = false;
                        ctx2.enqueue_response(req).unwrap();
                    },
                    0,
                )
                .unwrap();
            },
        )
        .unwrap();

    // Server 1 echoes with every byte bumped.
    s1_nexus
        .register_req_func(
            REQ_TYPE_SS,
            if s1_bg { HandlerClass::Background } else { HandlerClass::FgTerminal },
            move |ctx, req| {
                assert_eq!(ctx.in_background(), s1_bg);

                let n = req.req_msgbuf().len();
                let mut resp = ctx.alloc_msg_buffer(n).unwrap();
                for (dst, src) in resp.as_mut_slice().iter_mut().zip(req.req_msgbuf().as_slice()) {
                    *dst = src.wrapping_add(1);
                }
                let mut req = req;
                req.dyn_resp_msgbuf = Some(resp);
                req.prealloc_used = false;
                ctx.enqueue_response(req).unwrap();
            },
        )
        .unwrap();

    let hub = SimHub::new();
    let client = Endpoint::new(&client_nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
    let server0 = Endpoint::new(&s0_nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();
    let server1 = Endpoint::new(&s1_nexus, 0, SimTransport::new(&hub, 1024).unwrap()).unwrap();

    // Server 0 is a client toward server 1.
    let ss = server0.create_session(s1_nexus.mgmt_addr(), 0).unwrap();
    ss_session.store(ss, Ordering::SeqCst);
    let cs = client.create_session(s0_nexus.mgmt_addr(), 0).unwrap();

    assert!(
        poll_until(
            || {
                client.run_event_loop_once();
                server0.run_event_loop_once();
                server1.run_event_loop_once();
                client.session_state(cs) == Some(SessionState::Connected)
                    && server0.session_state(ss) == Some(SessionState::Connected)
            },
            Duration::from_secs(5),
        ),
        "sessions never connected"
    );

    let mut bufs = Vec::with_capacity(WINDOW);
    for _ in 0..WINDOW {
        bufs.push(client.alloc_msg_buffer(MAX_MSG).unwrap());
    }
    let state = Arc::new(ClientState {
        session: cs,
        bufs: Mutex::new(bufs),
        rng: Mutex::new(StdRng::seed_from_u64(seed)),
        num_sent: AtomicUsize::new(0),
        num_resps: AtomicUsize::new(0),
    });

    // Fill the window from the polling thread.
    for msgbuf_i in 0..WINDOW {
        let req_i = state.num_sent.fetch_add(1, Ordering::SeqCst);
        let size = state.rng.lock().unwrap().gen_range(1..MAX_MSG);
        let tag = pack_tag(req_i as u16, msgbuf_i as u16, size as u32);

        let mut bufs = state.bufs.lock().unwrap();
        let buf = &mut bufs[msgbuf_i];
        buf.resize(size).unwrap();
        buf.as_mut_slice().fill(msgbuf_i as u8);

        let st = state.clone();
        client
            .enqueue_request(
                cs,
                REQ_TYPE_CS,
                buf,
                move |ctx, resp, tag| client_cont(&st, ctx, resp, tag),
                tag,
            )
            .unwrap();
    }

    assert!(
        poll_until(
            || {
                client.run_event_loop_once();
                server0.run_event_loop_once();
                server1.run_event_loop_once();
                state.num_resps.load(Ordering::SeqCst) >= NUM_REQS
            },
            Duration::from_secs(30),
        ),
        "completed {} of {NUM_REQS} requests",
        state.num_resps.load(Ordering::SeqCst)
    );
    assert_eq!(state.num_resps.load(Ordering::SeqCst), NUM_REQS);
    assert_eq!(state.num_sent.load(Ordering::SeqCst), NUM_REQS);

    // Window fully drained on the client.
    assert_eq!(client.session_free_slots(cs), Some(WINDOW));
}

/// Both servers run in the foreground.
#[test]
fn nested_rpc_both_foreground() {
    run_nested(false, false, 0x5EED_0001);
}

/// Server 0 runs in the background, server 1 in the foreground.
#[test]
fn nested_rpc_server_zero_background() {
    run_nested(true, false, 0x5EED_0002);
}

/// Both servers run in the background.
#[test]
fn nested_rpc_both_background() {
    run_nested(true, true, 0x5EED_0003);
}

//! # pacerpc - datagram RPC for high-speed fabrics
//!
//! This crate implements a user-space RPC runtime for lossless or
//! near-lossless fabrics: connection-oriented sessions over a lossy
//! management side channel, small-to-large request/response exchanges with
//! per-session credit-based flow control, and rate-paced transmission
//! through a TSC-driven timing wheel.
//!
//! ## Features
//!
//! - **Session handshake over UDP**: a retransmitting management state
//!   machine is the only reliability mechanism on the side channel
//! - **Bounded in-flight window**: each session multiplexes up to `W`
//!   tagged requests across fixed slots
//! - **Credit-gated transmission**: credits gate when packets leave the
//!   pacer, not when requests are enqueued
//! - **Timing-wheel pacing**: outbound packets are released at precomputed
//!   timestamps to realize a target bytes-per-second rate
//! - **Foreground and background handlers**: latency-critical handlers run
//!   in the polling thread; blocking handlers run on a worker pool and feed
//!   effects back through a mailbox
//!
//! ## Usage
//!
//! ```ignore
//! use pacerpc::{Endpoint, HandlerClass, Nexus, SimHub, SimTransport};
//!
//! let nexus = Nexus::new("127.0.0.1", 31850)?;
//! nexus.register_req_func(1, HandlerClass::FgTerminal, |ctx, mut req| {
//!     let n = req.req_msgbuf().len();
//!     req.prealloc_resp.resize(n).unwrap();
//!     req.prealloc_resp.as_mut_slice().copy_from_slice(req.req_msgbuf().as_slice());
//!     ctx.enqueue_response(req).unwrap();
//! })?;
//!
//! let hub = SimHub::new();
//! let endpoint = Endpoint::new(&nexus, 0, SimTransport::new(&hub, 1024)?)?;
//! let session = endpoint.create_session("127.0.0.1:31851", 0)?;
//!
//! let req = endpoint.alloc_msg_buffer(64)?;
//! endpoint.enqueue_request(session, 1, &req, |ctx, resp, tag| {
//!     println!("response for tag {tag}: {} bytes", resp.resp_msgbuf().len());
//!     ctx.release_response(resp);
//! }, 0)?;
//!
//! loop {
//!     endpoint.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: runtime configuration (`RpcConfig`)
//! - [`error`]: error taxonomy (`Error`)
//! - [`timing`]: TSC access and conversions
//! - [`packet`]: data-plane packet header (`PktHdr`)
//! - [`sm`]: session-management wire format (`SmPkt`)
//! - [`buffer`]: message buffers (`MsgBuffer`, `BufferPool`)
//! - [`wheel`]: pacing timing wheel (`TimingWheel`)
//! - [`transport`]: transport seam (`Transport`) and the UDP/sim transports
//! - [`background`]: background worker pool
//! - [`handler`]: request/response handles and the execution context
//! - [`nexus`]: per-process hub (`Nexus`)
//! - [`endpoint`]: the polling-thread runtime (`Endpoint`)

pub mod background;
pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod nexus;
pub mod packet;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod wheel;

// Re-export main types
pub use buffer::{BufferPool, MsgBuffer};
pub use config::RpcConfig;
pub use endpoint::{Endpoint, EndpointStats};
pub use error::{Error, Result};
pub use handler::{
    HandlerClass, ReqHandle, RespHandle, RespStatus, RpcContext, SmEvent,
};
pub use nexus::Nexus;
pub use packet::{PktHdr, PktKind, PKT_HDR_SIZE};
pub use session::{SessionRole, SessionState};
pub use sm::{EndpointDescriptor, SmPkt, SmPktKind, SmStatus};
pub use transport::{
    MemRegInfo, RouteHandle, RouteInfo, RxPkt, SimHub, SimTransport, Transport, TransportType,
    TxItem, UdpTransport,
};
pub use wheel::{TimingWheel, WheelEntry, WheelStats};

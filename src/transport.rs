//! Transport abstraction.
//!
//! The core consumes a narrow capability set: memory registration hooks,
//! batched send, polled receive, and route resolution from opaque
//! descriptor material. Endpoints are generic over the transport, so
//! concrete NIC transports plug in at compile time.
//!
//! Two transports ship with the crate for tests and development:
//! [`UdpTransport`] over real sockets and [`SimTransport`] over an
//! in-process hub.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::packet::{PktHdr, PKT_HDR_SIZE};

/// Maximum length of opaque route material in a descriptor.
pub const ROUTE_INFO_LEN: usize = 32;

/// Transport type discriminant carried in endpoint descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportType {
    /// UDP datagram transport.
    Udp = 1,
    /// In-process simulated transport.
    Sim = 2,
}

/// Opaque transport address material, as carried in endpoint descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfo {
    data: [u8; ROUTE_INFO_LEN],
    len: u8,
}

impl RouteInfo {
    /// Wrap raw address material.
    ///
    /// # Panics
    /// Panics if `bytes` exceeds [`ROUTE_INFO_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= ROUTE_INFO_LEN);
        let mut data = [0u8; ROUTE_INFO_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            data,
            len: bytes.len() as u8,
        }
    }

    /// The valid address bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Opaque memory-registration token issued by a transport.
///
/// DMA-capable transports put their lkey-equivalent here; others hand out
/// the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRegInfo {
    /// Local access key.
    pub lkey: u32,
    /// Transport-private cookie.
    pub token: u64,
}

/// Handle to a resolved peer route, valid for the issuing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteHandle(pub u32);

/// One packet handed to `tx_burst`.
pub struct TxItem<'a> {
    /// Resolved destination.
    pub route: RouteHandle,
    /// Packet header, serialized in front of the payload.
    pub hdr: PktHdr,
    /// Payload bytes for this packet.
    pub payload: &'a [u8],
}

/// One received packet.
#[derive(Debug)]
pub struct RxPkt {
    /// Decoded packet header.
    pub hdr: PktHdr,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// The capability set the core consumes.
pub trait Transport {
    /// Transport type discriminant for descriptor validation.
    fn transport_type(&self) -> TransportType;

    /// MTU in bytes, including the packet header.
    fn mtu(&self) -> usize;

    /// Local address material for this endpoint's descriptors.
    fn local_route(&self) -> RouteInfo;

    /// Resolve a peer's address material into a send handle.
    fn resolve_route(&mut self, remote: &RouteInfo) -> Result<RouteHandle>;

    /// Register a memory region for transport use.
    fn reg_mr(&mut self, addr: *mut u8, len: usize) -> Result<MemRegInfo>;

    /// Deregister a memory region.
    fn dereg_mr(&mut self, info: MemRegInfo);

    /// Post a batch of packets for transmission.
    fn tx_burst(&mut self, batch: &[TxItem<'_>]) -> Result<()>;

    /// Poll for received packets, appending at most `max` to `out`.
    /// Returns the number received.
    fn rx_burst(&mut self, out: &mut Vec<RxPkt>, max: usize) -> usize;
}

fn decode_frame(frame: &[u8]) -> Option<RxPkt> {
    match PktHdr::from_bytes(frame) {
        Ok(hdr) => Some(RxPkt {
            hdr,
            payload: frame[PKT_HDR_SIZE..].to_vec(),
        }),
        Err(e) => {
            tracing::debug!("dropping malformed data packet: {e}");
            None
        }
    }
}

// =============================================================================
// UDP transport
// =============================================================================

/// Data-plane transport over a nonblocking UDP socket.
///
/// Route material is the socket address rendered as `host:port`.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    routes: Vec<SocketAddr>,
    route_map: HashMap<SocketAddr, RouteHandle>,
    mtu: usize,
    frame: Vec<u8>,
}

impl UdpTransport {
    /// Bind a new data socket on `bind_addr` (use port 0 for ephemeral).
    pub fn new(bind_addr: &str, mtu: usize) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig("mtu must exceed the packet header".into()));
        }
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            routes: Vec::new(),
            route_map: HashMap::new(),
            mtu,
            frame: vec![0u8; mtu],
        })
    }

    /// The bound local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Transport for UdpTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_route(&self) -> RouteInfo {
        RouteInfo::from_slice(self.local_addr.to_string().as_bytes())
    }

    fn resolve_route(&mut self, remote: &RouteInfo) -> Result<RouteHandle> {
        let addr_str = std::str::from_utf8(remote.as_slice())
            .map_err(|_| Error::InvalidPacket("route material is not utf-8".into()))?;
        let addr = addr_str
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidPacket(format!("unresolvable route {addr_str}")))?;

        if let Some(handle) = self.route_map.get(&addr) {
            return Ok(*handle);
        }
        let handle = RouteHandle(self.routes.len() as u32);
        self.routes.push(addr);
        self.route_map.insert(addr, handle);
        Ok(handle)
    }

    fn reg_mr(&mut self, _addr: *mut u8, _len: usize) -> Result<MemRegInfo> {
        Ok(MemRegInfo::default())
    }

    fn dereg_mr(&mut self, _info: MemRegInfo) {}

    fn tx_burst(&mut self, batch: &[TxItem<'_>]) -> Result<()> {
        for item in batch {
            let dest = self
                .routes
                .get(item.route.0 as usize)
                .copied()
                .ok_or_else(|| Error::InvalidArgument(format!("bad route handle {}", item.route.0)))?;

            let frame_len = PKT_HDR_SIZE + item.payload.len();
            debug_assert!(frame_len <= self.mtu);
            unsafe { item.hdr.write_to(self.frame.as_mut_ptr()) };
            self.frame[PKT_HDR_SIZE..frame_len].copy_from_slice(item.payload);

            match self.socket.send_to(&self.frame[..frame_len], dest) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Socket buffer full; the fabric is assumed lossless but
                    // the host stack is not. Surface and keep going.
                    tracing::warn!("udp tx would block, packet dropped");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn rx_burst(&mut self, out: &mut Vec<RxPkt>, max: usize) -> usize {
        let mut buf = vec![0u8; self.mtu];
        let mut count = 0;
        while count < max {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    if let Some(pkt) = decode_frame(&buf[..len]) {
                        out.push(pkt);
                        count += 1;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("udp rx error: {e}");
                    break;
                }
            }
        }
        count
    }
}

// =============================================================================
// Simulated transport
// =============================================================================

/// Process-local fabric shared by [`SimTransport`] instances.
///
/// Each transport registers a receive queue under a hub-assigned id; the id
/// is the route material.
pub struct SimHub {
    queues: Mutex<HashMap<u32, Sender<Vec<u8>>>>,
    next_id: AtomicU32,
}

impl SimHub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    fn attach(&self) -> (u32, Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.queues.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn detach(&self, id: u32) {
        self.queues.lock().unwrap().remove(&id);
    }

    fn deliver(&self, id: u32, frame: Vec<u8>) {
        let queues = self.queues.lock().unwrap();
        if let Some(tx) = queues.get(&id) {
            let _ = tx.send(frame);
        } else {
            tracing::debug!("sim hub: no receiver {id}, frame dropped");
        }
    }
}

/// In-process datagram transport for deterministic tests.
pub struct SimTransport {
    hub: Arc<SimHub>,
    id: u32,
    rx: Receiver<Vec<u8>>,
    routes: Vec<u32>,
    mtu: usize,
}

impl SimTransport {
    /// Attach a new transport to `hub`.
    pub fn new(hub: &Arc<SimHub>, mtu: usize) -> Result<Self> {
        if mtu <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig("mtu must exceed the packet header".into()));
        }
        let (id, rx) = hub.attach();
        Ok(Self {
            hub: hub.clone(),
            id,
            rx,
            routes: Vec::new(),
            mtu,
        })
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

impl Transport for SimTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Sim
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_route(&self) -> RouteInfo {
        RouteInfo::from_slice(&self.id.to_le_bytes())
    }

    fn resolve_route(&mut self, remote: &RouteInfo) -> Result<RouteHandle> {
        let bytes: [u8; 4] = remote
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidPacket("sim route material must be 4 bytes".into()))?;
        let handle = RouteHandle(self.routes.len() as u32);
        self.routes.push(u32::from_le_bytes(bytes));
        Ok(handle)
    }

    fn reg_mr(&mut self, _addr: *mut u8, _len: usize) -> Result<MemRegInfo> {
        Ok(MemRegInfo::default())
    }

    fn dereg_mr(&mut self, _info: MemRegInfo) {}

    fn tx_burst(&mut self, batch: &[TxItem<'_>]) -> Result<()> {
        for item in batch {
            let dest = *self
                .routes
                .get(item.route.0 as usize)
                .ok_or_else(|| Error::InvalidArgument(format!("bad route handle {}", item.route.0)))?;

            let mut frame = vec![0u8; PKT_HDR_SIZE + item.payload.len()];
            unsafe { item.hdr.write_to(frame.as_mut_ptr()) };
            frame[PKT_HDR_SIZE..].copy_from_slice(item.payload);
            self.hub.deliver(dest, frame);
        }
        Ok(())
    }

    fn rx_burst(&mut self, out: &mut Vec<RxPkt>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if let Some(pkt) = decode_frame(&frame) {
                        out.push(pkt);
                        count += 1;
                    }
                }
                Err(_) => break,
            }
        }
        count
    }
}

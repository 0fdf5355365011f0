//! Session-management wire format.
//!
//! Management packets travel over the Nexus' unreliable UDP side channel.
//! The retransmit sweep in the endpoint is the only reliability mechanism,
//! so every record is a fixed-size, self-contained datagram in native byte
//! order.

use crate::error::{Error, Result};
use crate::transport::{RouteInfo, ROUTE_INFO_LEN};

/// Maximum length of the `host:port` string in a descriptor.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Management packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SmPktKind {
    /// Connect request (client to server).
    ConnectReq = 1,
    /// Connect reply (server to client).
    ConnectReply = 2,
    /// Disconnect request (client to server).
    DisconnectReq = 3,
    /// Disconnect reply (server to client).
    DisconnectReply = 4,
}

impl SmPktKind {
    /// Whether this kind is a request (as opposed to a reply).
    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self, SmPktKind::ConnectReq | SmPktKind::DisconnectReq)
    }

    /// The reply kind answering this request kind.
    #[inline]
    pub fn reply_kind(&self) -> SmPktKind {
        match self {
            SmPktKind::ConnectReq => SmPktKind::ConnectReply,
            SmPktKind::DisconnectReq => SmPktKind::DisconnectReply,
            other => *other,
        }
    }
}

impl TryFrom<u8> for SmPktKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SmPktKind::ConnectReq),
            2 => Ok(SmPktKind::ConnectReply),
            3 => Ok(SmPktKind::DisconnectReq),
            4 => Ok(SmPktKind::DisconnectReply),
            _ => Err(Error::InvalidPacket(format!("unknown sm packet kind {value}"))),
        }
    }
}

/// Status code carried by management replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmStatus {
    /// Success.
    Ok = 0,
    /// The addressed remote endpoint is not registered.
    InvalidRemote = 1,
    /// The remote endpoint has no free session slot.
    NoSessions = 2,
    /// The endpoints disagree on the transport type.
    TransportMismatch = 3,
}

impl TryFrom<u8> for SmStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmStatus::Ok),
            1 => Ok(SmStatus::InvalidRemote),
            2 => Ok(SmStatus::NoSessions),
            3 => Ok(SmStatus::TransportMismatch),
            _ => Err(Error::InvalidPacket(format!("unknown sm status {value}"))),
        }
    }
}

/// One side of a session, as carried on the management wire.
///
/// `hostname` is the `host:port` address of the owning Nexus' management
/// socket, NUL-padded. `route` is opaque transport address material.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct EndpointDescriptor {
    /// Management address of the owning Nexus, NUL-padded.
    pub hostname: [u8; MAX_HOSTNAME_LEN],
    /// Transport type discriminant.
    pub transport_type: u8,
    /// Endpoint id, unique within its Nexus.
    pub endpoint_id: u8,
    /// Session number, local to the descriptor's side.
    pub session_num: u16,
    /// Number of valid bytes in `route`.
    route_len: u8,
    _pad: [u8; 3],
    /// Opaque transport-specific address material.
    route: [u8; ROUTE_INFO_LEN],
}

/// Size of an encoded management packet.
pub const SM_PKT_SIZE: usize = std::mem::size_of::<SmPkt>();

impl EndpointDescriptor {
    /// Create a descriptor with an empty route.
    pub fn new(hostname: &str, transport_type: u8, endpoint_id: u8, session_num: u16) -> Result<Self> {
        if hostname.is_empty() || hostname.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::InvalidArgument(format!(
                "hostname must be 1..{MAX_HOSTNAME_LEN} bytes, got {}",
                hostname.len()
            )));
        }
        let mut hn = [0u8; MAX_HOSTNAME_LEN];
        hn[..hostname.len()].copy_from_slice(hostname.as_bytes());
        Ok(Self {
            hostname: hn,
            transport_type,
            endpoint_id,
            session_num,
            route_len: 0,
            _pad: [0; 3],
            route: [0; ROUTE_INFO_LEN],
        })
    }

    /// The hostname as a string slice.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    /// Store transport route material.
    pub fn set_route(&mut self, route: &RouteInfo) {
        let bytes = route.as_slice();
        self.route[..bytes.len()].copy_from_slice(bytes);
        self.route_len = bytes.len() as u8;
    }

    /// Extract the transport route material.
    pub fn route(&self) -> RouteInfo {
        RouteInfo::from_slice(&self.route[..self.route_len as usize])
    }
}

impl std::fmt::Debug for EndpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointDescriptor")
            .field("hostname", &self.hostname_str())
            .field("transport_type", &self.transport_type)
            .field("endpoint_id", &self.endpoint_id)
            .field("session_num", &self.session_num)
            .field("route_len", &self.route_len)
            .finish()
    }
}

/// A session-management packet: kind, status, and both endpoint descriptors.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SmPkt {
    kind: u8,
    status: u8,
    reserved: u16,
    /// Client-side descriptor.
    pub client: EndpointDescriptor,
    /// Server-side descriptor.
    pub server: EndpointDescriptor,
}

impl SmPkt {
    /// Create a management packet.
    pub fn new(
        kind: SmPktKind,
        status: SmStatus,
        client: EndpointDescriptor,
        server: EndpointDescriptor,
    ) -> Self {
        Self {
            kind: kind as u8,
            status: status as u8,
            reserved: 0,
            client,
            server,
        }
    }

    /// Build the reply to this request, echoing both descriptors.
    pub fn reply(&self, status: SmStatus) -> Self {
        let mut pkt = *self;
        pkt.kind = self.pkt_kind().reply_kind() as u8;
        pkt.status = status as u8;
        pkt
    }

    /// Get the packet kind.
    #[inline]
    pub fn pkt_kind(&self) -> SmPktKind {
        // Only constructed through validated paths.
        SmPktKind::try_from(self.kind).unwrap_or(SmPktKind::ConnectReq)
    }

    /// Get the status.
    #[inline]
    pub fn status(&self) -> SmStatus {
        SmStatus::try_from(self.status).unwrap_or(SmStatus::Ok)
    }

    /// Encode into a fixed-size native-byte-order record.
    pub fn to_bytes(&self) -> [u8; SM_PKT_SIZE] {
        let mut out = [0u8; SM_PKT_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Self as *const u8,
                out.as_mut_ptr(),
                SM_PKT_SIZE,
            );
        }
        out
    }

    /// Decode and validate a record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PKT_SIZE {
            return Err(Error::BufferTooSmall {
                required: SM_PKT_SIZE,
                available: bytes.len(),
            });
        }
        let pkt = unsafe {
            let mut pkt = std::mem::MaybeUninit::<Self>::uninit();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), pkt.as_mut_ptr() as *mut u8, SM_PKT_SIZE);
            pkt.assume_init()
        };
        SmPktKind::try_from(pkt.kind)?;
        SmStatus::try_from(pkt.status)?;
        if pkt.client.route_len as usize > ROUTE_INFO_LEN
            || pkt.server.route_len as usize > ROUTE_INFO_LEN
        {
            return Err(Error::InvalidPacket("descriptor route overruns its field".into()));
        }
        Ok(pkt)
    }
}

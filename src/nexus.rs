//! The Nexus: per-process hub for management transport and the request
//! handler registry.
//!
//! The Nexus owns the management UDP socket and runs one routing thread
//! that dispatches inbound session-management packets to per-endpoint
//! queues. The handler registry is immutable once the first endpoint is
//! created. A shared background pool hosts background-class handlers for
//! every endpoint of the process.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::background::{BackgroundPool, BgTask};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::handler::{HandlerClass, MailboxOp, ReqHandle, ReqHandlerFn, RpcContext};
use crate::sm::{SmPkt, SmPktKind, SmStatus, SM_PKT_SIZE};
use crate::timing::measure_rdtsc_freq;

/// State shared between the Nexus and its routing thread.
struct SmShared {
    socket: UdpSocket,
    endpoints: Mutex<HashMap<u8, Sender<SmPkt>>>,
    /// Outbound fault injection: kind -> packets left to drop.
    fault_drops: Mutex<HashMap<SmPktKind, usize>>,
    shutdown: AtomicBool,
}

impl SmShared {
    /// Send a management packet, honoring the fault-injection filter.
    fn send_sm(&self, pkt: &SmPkt, dest: &str) -> Result<()> {
        {
            let mut drops = self.fault_drops.lock().unwrap();
            if let Some(remaining) = drops.get_mut(&pkt.pkt_kind()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    tracing::debug!(kind = ?pkt.pkt_kind(), dest, "fault injection: dropping sm packet");
                    return Ok(());
                }
            }
        }
        self.socket.send_to(&pkt.to_bytes(), dest)?;
        Ok(())
    }

    /// Route an inbound packet to its target endpoint queue.
    fn route(&self, pkt: SmPkt) {
        let kind = pkt.pkt_kind();
        let (target, is_request) = if kind.is_request() {
            (pkt.server.endpoint_id, true)
        } else {
            (pkt.client.endpoint_id, false)
        };

        let endpoints = self.endpoints.lock().unwrap();
        if let Some(queue) = endpoints.get(&target) {
            let _ = queue.send(pkt);
            return;
        }
        drop(endpoints);

        if !is_request {
            tracing::debug!(kind = ?kind, target, "dropping sm reply for unknown endpoint");
            return;
        }

        // Requests addressed to an unknown endpoint are answered here.
        // A dangling disconnect is settled idempotently; a connect is
        // refused so the client can fail fast.
        let status = match kind {
            SmPktKind::ConnectReq => SmStatus::InvalidRemote,
            _ => SmStatus::Ok,
        };
        let reply = pkt.reply(status);
        let dest = pkt.client.hostname_str().to_string();
        tracing::debug!(kind = ?kind, target, ?status, "answering sm request for unknown endpoint");
        if let Err(e) = self.send_sm(&reply, &dest) {
            tracing::debug!("failed to send sm reply to {dest}: {e}");
        }
    }
}

fn sm_thread_loop(shared: Arc<SmShared>, socket: UdpSocket) {
    let mut buf = [0u8; SM_PKT_SIZE * 2];
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => match SmPkt::from_bytes(&buf[..len]) {
                Ok(pkt) => {
                    tracing::trace!(kind = ?pkt.pkt_kind(), %src, "sm packet received");
                    shared.route(pkt);
                }
                Err(e) => tracing::debug!(%src, "dropping malformed sm packet: {e}"),
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::debug!("sm socket error: {e}");
            }
        }
    }
}

/// Per-process hub: management transport, handler registry, background pool.
pub struct Nexus {
    mgmt_addr: String,
    config: RpcConfig,
    freq_ghz: f64,
    shared: Arc<SmShared>,
    registry: Mutex<HashMap<u8, (ReqHandlerFn, HandlerClass)>>,
    frozen: AtomicBool,
    pool: BackgroundPool,
    sm_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Nexus {
    /// Create a Nexus with default configuration, binding the management
    /// socket on `hostname:mgmt_port`. Port 0 binds an ephemeral port;
    /// [`Nexus::mgmt_addr`] reports the resulting address.
    pub fn new(hostname: &str, mgmt_port: u16) -> Result<Arc<Self>> {
        Self::with_config(hostname, mgmt_port, RpcConfig::default())
    }

    /// Create a Nexus with an explicit configuration.
    pub fn with_config(hostname: &str, mgmt_port: u16, config: RpcConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let socket = UdpSocket::bind((hostname, mgmt_port))?;
        let local = socket.local_addr()?;
        let mgmt_addr = format!("{hostname}:{}", local.port());

        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(1)))?;

        let shared = Arc::new(SmShared {
            socket,
            endpoints: Mutex::new(HashMap::new()),
            fault_drops: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let sm_thread = std::thread::Builder::new()
            .name("pacerpc-sm".into())
            .spawn(move || sm_thread_loop(thread_shared, recv_socket))?;

        let pool = BackgroundPool::new(config.bg_threads);
        let freq_ghz = measure_rdtsc_freq();

        tracing::debug!(%mgmt_addr, freq_ghz, "nexus up");

        Ok(Arc::new(Self {
            mgmt_addr,
            config,
            freq_ghz,
            shared,
            registry: Mutex::new(HashMap::new()),
            frozen: AtomicBool::new(false),
            pool,
            sm_thread: Mutex::new(Some(sm_thread)),
        }))
    }

    /// The `host:port` address of the management socket.
    pub fn mgmt_addr(&self) -> &str {
        &self.mgmt_addr
    }

    /// The configuration endpoints inherit.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Measured TSC frequency in GHz.
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Register a request handler for `req_type`.
    ///
    /// The registry freezes when the first endpoint is created; later
    /// registrations are rejected.
    pub fn register_req_func<F>(&self, req_type: u8, class: HandlerClass, f: F) -> Result<()>
    where
        F: Fn(&RpcContext<'_>, ReqHandle) + Send + Sync + 'static,
    {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::InvalidConfig(
                "handler registry is frozen once an endpoint exists".into(),
            ));
        }
        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&req_type) {
            return Err(Error::InvalidArgument(format!(
                "request type {req_type} already registered"
            )));
        }
        registry.insert(req_type, (Arc::new(f), class));
        Ok(())
    }

    /// Look up the handler and class for a request type.
    pub(crate) fn handler(&self, req_type: u8) -> Option<(ReqHandlerFn, HandlerClass)> {
        self.registry.lock().unwrap().get(&req_type).cloned()
    }

    /// Wire a new endpoint into SM routing and the background pool.
    /// Returns the endpoint's SM queue.
    pub(crate) fn register_endpoint(
        &self,
        id: u8,
        bg_tasks: Receiver<BgTask>,
        mailbox: Sender<MailboxOp>,
    ) -> Result<Receiver<SmPkt>> {
        self.frozen.store(true, Ordering::Release);

        if self.pool.num_threads() == 0 {
            let registry = self.registry.lock().unwrap();
            if registry.values().any(|(_, class)| *class == HandlerClass::Background) {
                return Err(Error::InvalidConfig(
                    "background-class handlers registered but bg_threads is 0".into(),
                ));
            }
        }

        let mut endpoints = self.shared.endpoints.lock().unwrap();
        if endpoints.contains_key(&id) {
            return Err(Error::InvalidArgument(format!("endpoint id {id} already in use")));
        }
        let (tx, rx) = unbounded();
        endpoints.insert(id, tx);
        drop(endpoints);

        self.pool.register_endpoint(id, bg_tasks, mailbox);
        Ok(rx)
    }

    /// Tear an endpoint out of SM routing and the background pool.
    pub(crate) fn unregister_endpoint(&self, id: u8) {
        self.shared.endpoints.lock().unwrap().remove(&id);
        self.pool.unregister_endpoint(id);
    }

    /// Send a management packet to `dest` (`host:port`).
    pub(crate) fn send_sm(&self, pkt: &SmPkt, dest: &str) -> Result<()> {
        self.shared.send_sm(pkt, dest)
    }

    /// Fault injection for tests: drop the next `count` outbound management
    /// packets of the given kind.
    pub fn fault_drop_sm(&self, kind: SmPktKind, count: usize) {
        *self.shared.fault_drops.lock().unwrap().entry(kind).or_insert(0) += count;
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.sm_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.pool.shutdown();
    }
}

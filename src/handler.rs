//! Handler-facing types: request and response handles, the execution
//! context passed to handlers and continuations, and the operation mailbox
//! that carries background work back into the polling loop.

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::buffer::MsgBuffer;
use crate::error::{Error, Result};
use crate::sm::SmStatus;

/// Execution class of a registered request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerClass {
    /// Runs in the polling thread and must respond synchronously.
    FgTerminal,
    /// Runs in the polling thread; may hold the request handle and respond
    /// later, typically from a nested request's continuation.
    FgNonterminal,
    /// Runs on a background worker; may block.
    Background,
}

/// Handle to a received request, owned by the handler until it responds.
///
/// The handler fills either the preallocated response buffer (and leaves
/// `prealloc_used` set) or attaches a dynamically allocated buffer in
/// `dyn_resp_msgbuf` with `prealloc_used = false`. Dynamic buffers are
/// freed by the runtime after the response is transmitted.
pub struct ReqHandle {
    pub(crate) session_num: u16,
    pub(crate) slot_idx: usize,
    pub(crate) req_num: u64,
    pub(crate) req_type: u8,
    pub(crate) req_msgbuf: MsgBuffer,
    /// Preallocated response buffer; holds at most one packet's payload.
    pub prealloc_resp: MsgBuffer,
    pub(crate) prealloc_idx: Option<usize>,
    /// Dynamically allocated response buffer, used when `prealloc_used`
    /// is false.
    pub dyn_resp_msgbuf: Option<MsgBuffer>,
    /// Whether the response lives in `prealloc_resp`.
    pub prealloc_used: bool,
}

impl ReqHandle {
    /// The request payload.
    #[inline]
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        &self.req_msgbuf
    }

    /// The request type.
    #[inline]
    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// The local (server-side) session number the request arrived on.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }
}

/// Completion status attached to a response handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespStatus {
    /// Response received.
    Ok,
    /// The session was disconnected before the response arrived; the
    /// payload is empty.
    SessionDisconnected,
    /// The endpoint went away mid-flight; the payload is empty.
    EndpointGone,
}

/// Handle to a completed response, passed to the continuation.
///
/// The client slot stays occupied until the continuation returns the
/// handle via `release_response`.
pub struct RespHandle {
    pub(crate) session_num: u16,
    pub(crate) slot_idx: usize,
    pub(crate) req_num: u64,
    pub(crate) resp_msgbuf: MsgBuffer,
    pub(crate) status: RespStatus,
}

impl RespHandle {
    /// The response payload.
    #[inline]
    pub fn resp_msgbuf(&self) -> &MsgBuffer {
        &self.resp_msgbuf
    }

    /// Completion status.
    #[inline]
    pub fn status(&self) -> RespStatus {
        self.status
    }

    /// Whether the response completed successfully.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == RespStatus::Ok
    }

    /// The session the response arrived on.
    #[inline]
    pub fn session_num(&self) -> u16 {
        self.session_num
    }
}

/// Continuation invoked when a response completes. Receives the execution
/// context, the response handle, and the tag passed to `enqueue_request`.
pub type Continuation = Box<dyn FnOnce(&RpcContext<'_>, RespHandle, u64) + Send>;

/// Registered request handler.
pub type ReqHandlerFn = Arc<dyn Fn(&RpcContext<'_>, ReqHandle) + Send + Sync>;

/// Session-management event delivered to the endpoint's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEvent {
    /// The session reached the connected state.
    Connected,
    /// The connect attempt was refused; the session is terminal.
    ConnectFailed(SmStatus),
    /// The session reached the disconnected state.
    Disconnected,
}

/// Session-management callback: `(session_num, event)`.
pub type SmHandler = Box<dyn FnMut(u16, SmEvent)>;

/// Operations deposited by background workers, drained by the polling loop.
pub(crate) enum MailboxOp {
    EnqueueRequest {
        session_num: u16,
        req_type: u8,
        req: MsgBuffer,
        cont: Continuation,
        tag: u64,
    },
    EnqueueResponse(ReqHandle),
    ReleaseResponse(RespHandle),
}

/// Object-safe slice of the endpoint consumed by foreground contexts.
pub(crate) trait RpcCore {
    fn enqueue_request_boxed(
        &self,
        session_num: u16,
        req_type: u8,
        req: &MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> Result<()>;
    fn enqueue_response_core(&self, req: ReqHandle) -> Result<()>;
    fn release_response_core(&self, resp: RespHandle);
    fn alloc_msg_buffer_core(&self, size: usize) -> Result<MsgBuffer>;
}

enum CtxInner<'a> {
    /// Polling thread: operations apply immediately.
    Fg(&'a dyn RpcCore),
    /// Background worker: operations are deposited on the endpoint mailbox
    /// and drained at the next polling iteration.
    Bg(&'a Sender<MailboxOp>),
}

/// Execution context handed to request handlers and continuations.
///
/// In the polling thread a nested `enqueue_request` enters the pipeline
/// immediately and succeeds iff a slot is free at the moment of the call.
/// In a background worker, operations are queued for the polling loop.
pub struct RpcContext<'a> {
    inner: CtxInner<'a>,
}

impl<'a> RpcContext<'a> {
    pub(crate) fn foreground(core: &'a dyn RpcCore) -> Self {
        Self { inner: CtxInner::Fg(core) }
    }

    pub(crate) fn background(mailbox: &'a Sender<MailboxOp>) -> Self {
        Self { inner: CtxInner::Bg(mailbox) }
    }

    /// Whether this context runs on a background worker.
    #[inline]
    pub fn in_background(&self) -> bool {
        matches!(self.inner, CtxInner::Bg(_))
    }

    /// Enqueue a request on a session owned by the same endpoint.
    ///
    /// The payload is copied out of `req` before the call returns, so the
    /// buffer is immediately reusable.
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
        match &self.inner {
            CtxInner::Fg(core) => {
                core.enqueue_request_boxed(session_num, req_type, req, Box::new(cont), tag)
            }
            CtxInner::Bg(mailbox) => {
                let op = MailboxOp::EnqueueRequest {
                    session_num,
                    req_type,
                    req: MsgBuffer::from_slice(req.as_slice())?,
                    cont: Box::new(cont),
                    tag,
                };
                mailbox
                    .send(op)
                    .map_err(|_| Error::EndpointGone(0))
            }
        }
    }

    /// Send the response for a request handle.
    pub fn enqueue_response(&self, req: ReqHandle) -> Result<()> {
        match &self.inner {
            CtxInner::Fg(core) => core.enqueue_response_core(req),
            CtxInner::Bg(mailbox) => mailbox
                .send(MailboxOp::EnqueueResponse(req))
                .map_err(|_| Error::EndpointGone(0)),
        }
    }

    /// Return a response handle, freeing the client-side slot.
    pub fn release_response(&self, resp: RespHandle) {
        match &self.inner {
            CtxInner::Fg(core) => core.release_response_core(resp),
            CtxInner::Bg(mailbox) => {
                let _ = mailbox.send(MailboxOp::ReleaseResponse(resp));
            }
        }
    }

    /// Allocate a message buffer.
    ///
    /// In the polling thread the buffer is registered with the transport.
    /// Background allocations are plain memory; their payloads are staged
    /// into endpoint-owned buffers at enqueue time, so registration is not
    /// needed on that path.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        match &self.inner {
            CtxInner::Fg(core) => core.alloc_msg_buffer_core(size),
            CtxInner::Bg(_) => MsgBuffer::new(size),
        }
    }
}

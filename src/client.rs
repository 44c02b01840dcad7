//! # Client
//!
//! An [`RpcClient`] owns one session to a remote server. Three tasks run per
//! client: a writer draining the outbound queue, a receive loop multiplexing
//! replies to pending futures by request id, and (under the coalescing
//! policy) a release flusher batching dropped-proxy notices.
//!
//! Public operations are callable from any task or thread. A `sync` call
//! submits the request and parks on its future until the receive loop
//! delivers the reply or the deadline passes; an `async` call hands the
//! future to the caller; a fire-and-forget call allocates no request id and
//! expects nothing back.
//!
//! Sessions never reconnect. When the transport breaks, every pending future
//! fails with `CONNECTION_LOST` and the client is permanently dead.

use crate::codec::{claim_embedded, ForwardIncref};
use crate::config::{ClientOptions, ReleasePolicy};
use crate::error::{ErrorKind, RpcError, RpcResult};
use crate::objects::Kwargs;
use crate::proxy::{ObjectProxy, PathSegment, ProxyDescriptor, ProxyTable};
use crate::transport::{self, Addr};
use crate::value::Value;
use crate::wire::{CallMode, Frame, LogLevel, Notice, Opcode, Reply, Request, ReturnMode, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// One operation to submit, before a request id and mode are attached.
pub struct RequestSpec {
    pub op: Opcode,
    pub target: u64,
    pub path: Vec<PathSegment>,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub return_mode: ReturnMode,
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Deadline override; `None` uses the client default
    pub timeout: Option<Duration>,
    /// Return mode requested from the server
    pub return_mode: ReturnMode,
}

/// A decoded reply payload plus the live handles claimed from it.
///
/// Every object reference embedded in the payload has already been turned
/// into a proxy; dropping the `Returned` drops those handles and schedules
/// their releases.
pub struct Returned {
    /// The payload as received, references included
    pub value: Value,
    proxies: Vec<ObjectProxy>,
}

impl Returned {
    pub(crate) fn new(value: Value, proxies: Vec<ObjectProxy>) -> Self {
        Self { value, proxies }
    }

    /// Handles claimed from the payload, in tree order.
    pub fn proxies(&self) -> &[ObjectProxy] {
        &self.proxies
    }

    /// Consume a reply whose payload is a single object reference.
    pub fn into_proxy(mut self) -> Option<ObjectProxy> {
        match self.value {
            Value::ObjectRef(_) if !self.proxies.is_empty() => Some(self.proxies.remove(0)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Returned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Returned")
            .field("value", &self.value)
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

enum Slot {
    Pending,
    Ready(RpcResult<Returned>),
    Cancelled,
    Taken,
}

pub(crate) struct FutureState {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl FutureState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::Pending),
            notify: Notify::new(),
        })
    }

    /// Deliver a result. Cancelled futures swallow late replies.
    fn complete(&self, result: RpcResult<Returned>) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(result);
            drop(slot);
            self.notify.notify_waiters();
        }
    }

    /// Move a pending future to cancelled. Returns false when a result
    /// already landed.
    fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Cancelled;
            drop(slot);
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    fn has_result(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.has_result() {
                return;
            }
            notified.await;
        }
    }

    fn take(&self) -> RpcResult<Returned> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Cancelled => {
                *slot = Slot::Cancelled;
                Err(RpcError::Cancelled)
            }
            Slot::Pending | Slot::Taken => Err(RpcError::Protocol(
                "future consumed before completion".to_string(),
            )),
        }
    }
}

/// Handle for a request issued in async mode.
pub struct CallFuture {
    id: u64,
    state: Arc<FutureState>,
    client: Arc<RpcClient>,
}

impl CallFuture {
    /// Request id this future observes.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a result (or cancellation) has landed.
    pub fn has_result(&self) -> bool {
        self.state.has_result()
    }

    /// Wait for the result. `timeout: None` waits indefinitely; a deadline
    /// abandons the request, and a late reply is discarded.
    pub async fn result(self, timeout: Option<Duration>) -> RpcResult<Returned> {
        match timeout {
            Some(deadline) => {
                if tokio::time::timeout(deadline, self.state.wait()).await.is_err() {
                    self.client.abandon(self.id);
                    return Err(RpcError::Timeout);
                }
            }
            None => self.state.wait().await,
        }
        self.state.take()
    }

    /// Wait until a result lands without consuming the handle.
    pub(crate) async fn wait_ready(&self) {
        self.state.wait().await;
    }

    /// Best-effort cancellation: the future resolves to `CANCELLED` exactly
    /// once and a cancel notice is sent; late replies are dropped.
    pub fn cancel(&self) {
        if self.state.cancel() {
            debug!(id = self.id, "cancelling pending request");
            self.client.abandon(self.id);
            self.client
                .send_notice(Notice::Cancel { request: self.id });
        }
    }
}

enum ClientState {
    Open,
    Lost(ErrorKind),
    Closed,
}

enum OutMsg {
    Frame(Frame),
    /// Drain marker: acked by the writer once everything before it is on
    /// the wire.
    Flush(oneshot::Sender<()>),
}

/// One session to a remote server.
pub struct RpcClient {
    addr: String,
    peer_name: String,
    opts: ClientOptions,
    out_tx: mpsc::UnboundedSender<OutMsg>,
    pending: Mutex<HashMap<u64, Arc<FutureState>>>,
    next_id: AtomicU64,
    state: Mutex<ClientState>,
    table: ProxyTable,
    release_queue: Mutex<Vec<(u64, i64)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Connect to a listening server.
    ///
    /// The first frame on the session is the handshake notice naming this
    /// peer; servers key reference attribution and reentrancy decisions on
    /// that name.
    pub fn connect(
        addr: &str,
        opts: ClientOptions,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RpcResult<Arc<RpcClient>>> + Send + '_>>
    {
        Box::pin(async move {
            let parsed = Addr::parse(addr).map_err(|e| RpcError::Protocol(e.to_string()))?;
            let canonical = parsed.to_url();

            let (reader, writer) = transport::connect(&parsed, opts.buffer_size)
                .await
                .map_err(|e| {
                    warn!(addr = %canonical, error = %e, "connect failed");
                    RpcError::ConnectionLost
                })?;

            let peer_name = match &opts.peer_name {
                Some(name) => name.clone(),
                None => crate::local::default_peer_name(),
            };
            let release = opts.release;

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let client = Arc::new(RpcClient {
                addr: canonical,
                peer_name: peer_name.clone(),
                opts,
                out_tx,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                state: Mutex::new(ClientState::Open),
                table: ProxyTable::default(),
                release_queue: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            });

            client.send_notice(Notice::Hello { peer: peer_name });

            let writer_task = tokio::spawn(Self::writer_loop(Arc::clone(&client), writer, out_rx));
            let recv_task = tokio::spawn(Self::recv_loop(Arc::clone(&client), reader));
            let mut tasks = vec![writer_task, recv_task];
            if let ReleasePolicy::Coalesced { every, .. } = release {
                tasks.push(tokio::spawn(Self::release_loop(Arc::clone(&client), every)));
            }
            *client.tasks.lock() = tasks;

            info!(addr = %client.addr, peer = %client.peer_name, "client connected");
            Ok(client)
        })
    }

    /// Canonical address of the remote server.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Name this client announced in its handshake.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub(crate) fn proxy_table(&self) -> &ProxyTable {
        &self.table
    }

    /// Resolve a decoded descriptor to a live handle through this client.
    pub(crate) fn claim_proxy(
        self: &Arc<Self>,
        desc: ProxyDescriptor,
        counted: bool,
    ) -> ObjectProxy {
        self.table.claim(self, desc, counted)
    }

    /// Number of live proxies cached for this client. Mostly of interest to
    /// tests watching lifetime behavior.
    pub fn live_proxies(&self) -> usize {
        self.table.live_count()
    }

    /// Fetch a published module by name and return its proxy.
    pub async fn import(self: &Arc<Self>, name: &str) -> RpcResult<ObjectProxy> {
        let returned = self
            .request(
                RequestSpec {
                    op: Opcode::Import,
                    target: 0,
                    path: Vec::new(),
                    args: vec![Value::from(name)],
                    kwargs: Kwargs::new(),
                    return_mode: ReturnMode::Proxy,
                },
                CallOptions::default(),
            )
            .await?;
        returned
            .into_proxy()
            .ok_or_else(|| RpcError::Protocol("IMPORT reply carried no reference".to_string()))
    }

    /// Invoke a published object by name in a single round trip, without
    /// holding a proxy to it. Maps to the CALL builtin on target 0.
    pub async fn call_published(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
    ) -> RpcResult<Returned> {
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(Value::from(name));
        full_args.extend(args);
        self.request(
            RequestSpec {
                op: Opcode::Call,
                target: 0,
                path: Vec::new(),
                args: full_args,
                kwargs: Kwargs::new(),
                return_mode: ReturnMode::Auto,
            },
            CallOptions::default(),
        )
        .await
    }

    /// No-op round trip against the server builtin surface.
    pub async fn ping(self: &Arc<Self>) -> RpcResult<()> {
        self.request(
            RequestSpec {
                op: Opcode::Ping,
                target: 0,
                path: Vec::new(),
                args: Vec::new(),
                kwargs: Kwargs::new(),
                return_mode: ReturnMode::Value,
            },
            CallOptions::default(),
        )
        .await
        .map(|_| ())
    }

    /// Submit a request in sync mode and wait for its reply.
    pub async fn request(
        self: &Arc<Self>,
        spec: RequestSpec,
        opts: CallOptions,
    ) -> RpcResult<Returned> {
        let deadline = opts.timeout.unwrap_or(self.opts.default_timeout);
        let future = self.submit_mode(spec, CallMode::Sync)?;
        future.result(Some(deadline)).await
    }

    /// Submit a request in async mode.
    pub fn submit(self: &Arc<Self>, spec: RequestSpec) -> RpcResult<CallFuture> {
        self.submit_mode(spec, CallMode::Async)
    }

    /// Submit a fire-and-forget request: no id, no reply, failures invisible
    /// here.
    pub fn send_off(self: &Arc<Self>, spec: RequestSpec) -> RpcResult<()> {
        self.ensure_open()?;
        self.account_outgoing(&spec);
        let frame = Frame::Req(Request {
            id: 0,
            op: spec.op,
            target: spec.target,
            path: spec.path,
            args: spec.args,
            kwargs: spec.kwargs,
            mode: CallMode::Off,
            return_mode: spec.return_mode,
        });
        self.send_frame(frame)
    }

    fn submit_mode(self: &Arc<Self>, spec: RequestSpec, mode: CallMode) -> RpcResult<CallFuture> {
        self.ensure_open()?;
        self.account_outgoing(&spec);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = FutureState::new();
        self.pending.lock().insert(id, Arc::clone(&state));

        let frame = Frame::Req(Request {
            id,
            op: spec.op,
            target: spec.target,
            path: spec.path,
            args: spec.args,
            kwargs: spec.kwargs,
            mode,
            return_mode: spec.return_mode,
        });

        if let Err(err) = self.send_frame(frame) {
            self.pending.lock().remove(&id);
            return Err(err);
        }
        // The session may have died between registering the future and the
        // send; anything drained by that loss must not wait for a reply
        // that cannot come.
        if let Err(err) = self.ensure_open() {
            self.pending.lock().remove(&id);
            state.complete(Err(err));
        }
        trace!(id, "request submitted");

        Ok(CallFuture {
            id,
            state,
            client: Arc::clone(self),
        })
    }

    /// Queue a reference release for a dropped proxy.
    pub(crate) fn schedule_release(&self, object_id: u64, n: i64) {
        match self.opts.release {
            ReleasePolicy::Immediate => {
                self.send_notice(Notice::Release {
                    pairs: vec![(object_id, n)],
                });
            }
            ReleasePolicy::Coalesced { max, .. } => {
                let flush_now = {
                    let mut queue = self.release_queue.lock();
                    queue.push((object_id, n));
                    queue.len() >= max
                };
                if flush_now {
                    self.flush_releases();
                }
            }
        }
    }

    /// Send the queued release batch, if any.
    pub fn flush_releases(&self) {
        let pairs: Vec<(u64, i64)> = std::mem::take(&mut *self.release_queue.lock());
        if pairs.is_empty() {
            return;
        }
        trace!(count = pairs.len(), "flushing release batch");
        self.send_notice(Notice::Release { pairs });
    }

    /// Close the session: cancel pending futures, push a final release
    /// batch, then stop the background tasks.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ClientState::Closed) {
                return;
            }
            *state = ClientState::Closed;
        }
        info!(addr = %self.addr, "closing client");

        self.flush_releases();

        // Wait for the writer to drain what we queued, best effort.
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.out_tx.send(OutMsg::Flush(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(1), ack_rx).await;
        }

        self.fail_pending(RpcError::Closed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        crate::local::forget_client(&self.addr);
    }

    fn ensure_open(&self) -> RpcResult<()> {
        match &*self.state.lock() {
            ClientState::Open => Ok(()),
            ClientState::Lost(ErrorKind::ShuttingDown) => Err(RpcError::ShuttingDown),
            ClientState::Lost(_) => Err(RpcError::ConnectionLost),
            ClientState::Closed => Err(RpcError::Closed),
        }
    }

    fn send_frame(&self, frame: Frame) -> RpcResult<()> {
        self.out_tx
            .send(OutMsg::Frame(frame))
            .map_err(|_| RpcError::ConnectionLost)
    }

    /// Queue a notice, ignoring delivery failures.
    pub(crate) fn send_notice(&self, notice: Notice) {
        let _ = self.out_tx.send(OutMsg::Frame(Frame::Notice(notice)));
    }

    /// Forget a pending request; a late reply will be claimed and dropped.
    fn abandon(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Account for descriptors leaving this process in the arguments.
    fn account_outgoing(&self, spec: &RequestSpec) {
        let mut forwards: Vec<ForwardIncref> = Vec::new();
        let local = crate::local::registry_of(&self.peer_name);
        let local_ref = local
            .as_ref()
            .map(|registry| (self.peer_name.as_str(), registry.as_ref()));

        crate::codec::account_outgoing_args(&spec.args, &self.addr, local_ref, &mut forwards);
        let kwarg_values: Vec<Value> = spec.kwargs.values().cloned().collect();
        crate::codec::account_outgoing_args(&kwarg_values, &self.addr, local_ref, &mut forwards);

        for forward in forwards {
            crate::local::send_incref(forward);
        }
    }

    /// Fail every pending future with clones of the given error.
    fn fail_pending(&self, err: RpcError) {
        let drained: Vec<Arc<FutureState>> = self.pending.lock().drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), error = %err, "failing pending requests");
        }
        for state in drained {
            state.complete(Err(err.clone()));
        }
    }

    fn mark_lost(&self, kind: ErrorKind) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ClientState::Closed | ClientState::Lost(_)) {
                return;
            }
            *state = ClientState::Lost(kind);
        }
        let err = match kind {
            ErrorKind::ShuttingDown => RpcError::ShuttingDown,
            _ => RpcError::ConnectionLost,
        };
        warn!(addr = %self.addr, kind = %kind, "session lost");
        self.fail_pending(err);
        crate::local::forget_client(&self.addr);
    }

    async fn writer_loop(
        client: Arc<RpcClient>,
        mut writer: transport::FrameWriter,
        mut out_rx: mpsc::UnboundedReceiver<OutMsg>,
    ) {
        while let Some(msg) = out_rx.recv().await {
            match msg {
                OutMsg::Frame(frame) => {
                    if let Err(err) = writer.send(&frame).await {
                        debug!(error = %err, "writer failed");
                        client.mark_lost(ErrorKind::ConnectionLost);
                        break;
                    }
                }
                OutMsg::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn recv_loop(client: Arc<RpcClient>, mut reader: transport::FrameReader) {
        loop {
            match reader.recv().await {
                Ok(frame) => client.handle_frame(frame).await,
                Err(err) => {
                    debug!(addr = %client.addr, error = %err, "receive loop ended");
                    client.mark_lost(ErrorKind::ConnectionLost);
                    break;
                }
            }
        }
    }

    async fn release_loop(client: Arc<RpcClient>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            client.flush_releases();
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Rep(reply) => self.handle_reply(reply).await,
            Frame::Notice(Notice::ServerClosed) => {
                info!(addr = %self.addr, "server announced shutdown");
                self.mark_lost(ErrorKind::ShuttingDown);
            }
            Frame::Notice(Notice::Log { level, message }) => match level {
                LogLevel::Trace => trace!(target: "objlink::remote", addr = %self.addr, "{message}"),
                LogLevel::Debug => debug!(target: "objlink::remote", addr = %self.addr, "{message}"),
                LogLevel::Info => info!(target: "objlink::remote", addr = %self.addr, "{message}"),
                LogLevel::Warn => warn!(target: "objlink::remote", addr = %self.addr, "{message}"),
                LogLevel::Error => error!(target: "objlink::remote", addr = %self.addr, "{message}"),
            },
            Frame::Notice(other) => {
                warn!(addr = %self.addr, notice = ?other, "unexpected notice on client session")
            }
            Frame::Req(req) => {
                // Requests travel to servers, never to plain clients.
                warn!(
                    addr = %self.addr,
                    op = req.op.name(),
                    "unexpected request frame on client session"
                );
            }
        }
    }

    async fn handle_reply(self: &Arc<Self>, reply: Reply) {
        let Reply {
            id,
            status,
            payload,
        } = reply;

        // Claim embedded references before looking for a waiter: even a
        // discarded late reply transferred references that must be returned.
        let result: RpcResult<Returned> = match status {
            Status::Ok => {
                let claimed = claim_embedded(&payload, self).await;
                match claimed {
                    Ok(proxies) => Ok(Returned::new(payload, proxies)),
                    Err(err) => Err(err),
                }
            }
            Status::Err(kind) => Err(RpcError::from_wire(kind, &payload)),
        };

        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(state) => state.complete(result),
            None => {
                debug!(id, "late reply discarded");
            }
        }
    }
}

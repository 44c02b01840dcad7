//! # Server
//!
//! An [`RpcServer`] binds a listening transport and runs one dispatch loop.
//! Per-connection reader tasks do nothing but decode frames and forward them
//! to that loop, so opcode execution is strictly serialized: hosted objects
//! never see two operations at once, which is the thread-safety contract
//! proxied values rely on.
//!
//! ## Reentrancy
//!
//! A hosted object's `call` may invoke one of its arguments, a proxy back
//! into the calling process, through its [`CallCx`]. While the loop waits for
//! that nested reply it keeps dispatching requests arriving from the peer it
//! is waiting on (so callback chains cannot deadlock) and backlogs frames
//! from everyone else, preserving per-peer FIFO outside the window.
//!
//! ## Close contract
//!
//! `close` stops accepting sessions, lets the in-flight request finish,
//! rejects queued ones with `SHUTTING_DOWN`, pushes a `SERVER_CLOSED` notice
//! down every connection and drains the registry before it returns.

use crate::client::{CallFuture, Returned, RpcClient};
use crate::codec::{encode_outcome, ServerEncodeCx};
use crate::config::{ClientOptions, ServerOptions};
use crate::error::{RemoteError, RpcError, RpcResult};
use crate::objects::{Caps, Kwargs, OpError, OpResult, Outcome, RemoteObject};
use crate::proxy::{ObjectProxy, PathSegment, ProxyDescriptor};
use crate::registry::ObjectRegistry;
use crate::transport::{Addr, FrameListener, FrameReader, FrameWriter};
use crate::value::Value;
use crate::wire::{CallMode, Frame, Notice, Opcode, Reply, Request, Status};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Counters exposed for observability and tests.
#[derive(Default)]
pub struct ServerStats {
    requests_handled: AtomicU64,
    logged_failures: AtomicU64,
}

enum ConnOut {
    Frame(Frame),
    Flush(oneshot::Sender<()>),
}

struct ConnHandle {
    peer: Option<String>,
    tx: mpsc::UnboundedSender<ConnOut>,
    tasks: Vec<JoinHandle<()>>,
}

enum Event {
    Conn(u64, Frame),
    ConnClosed(u64),
    Shutdown,
}

struct ServerShared {
    addr: String,
    opts: ServerOptions,
    registry: Arc<Mutex<ObjectRegistry>>,
    published: Mutex<HashMap<String, Arc<dyn RemoteObject>>>,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    in_tx: mpsc::UnboundedSender<Event>,
    next_conn: AtomicU64,
    closing: AtomicBool,
    /// Cancellations recorded out of band by connection readers, so a
    /// cancel can overtake a request still waiting in the dispatch queue.
    cancelled: Mutex<HashSet<(u64, u64)>>,
    stats: ServerStats,
    /// Clients this server uses for nested calls into callback homes,
    /// announced under this server's own address.
    nested: tokio::sync::Mutex<HashMap<String, Arc<RpcClient>>>,
}

impl ServerShared {
    fn send_to(&self, conn: u64, frame: Frame) {
        if let Some(handle) = self.conns.lock().get(&conn) {
            let _ = handle.tx.send(ConnOut::Frame(frame));
        }
    }

    fn peer_name_of(&self, conn: u64) -> String {
        self.conns
            .lock()
            .get(&conn)
            .and_then(|handle| handle.peer.clone())
            .unwrap_or_else(|| format!("anon-{conn}"))
    }

    /// Client for nested calls to `addr`, created on first use.
    async fn nested_client(&self, addr: &str) -> RpcResult<Arc<RpcClient>> {
        let mut nested = self.nested.lock().await;
        if let Some(existing) = nested.get(addr) {
            return Ok(Arc::clone(existing));
        }
        let client = RpcClient::connect(
            addr,
            ClientOptions {
                peer_name: Some(self.addr.clone()),
                ..Default::default()
            },
        )
        .await?;
        nested.insert(addr.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

/// A server hosting objects for remote peers.
pub struct RpcServer {
    shared: Arc<ServerShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed_rx: watch::Receiver<bool>,
}

impl RpcServer {
    /// Bind a listening server on `tcp://host:port` or `inproc://name`.
    ///
    /// Binding TCP port 0 picks an ephemeral port; [`RpcServer::addr`]
    /// reports the canonical reachable address either way.
    pub async fn bind(addr: &str, opts: ServerOptions) -> RpcResult<Arc<RpcServer>> {
        let parsed = Addr::parse(addr).map_err(|e| RpcError::Protocol(e.to_string()))?;
        let (listener, bound) = FrameListener::bind(&parsed, opts.buffer_size)
            .await
            .map_err(|e| RpcError::Protocol(e.to_string()))?;
        let canonical = bound.to_url();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(ServerShared {
            addr: canonical.clone(),
            opts,
            registry: Arc::new(Mutex::new(ObjectRegistry::new())),
            published: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            in_tx,
            next_conn: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            cancelled: Mutex::new(HashSet::new()),
            stats: ServerStats::default(),
            nested: tokio::sync::Mutex::new(HashMap::new()),
        });

        crate::local::register_server(&canonical, Arc::clone(&shared.registry));

        let accept_task = tokio::spawn(Self::accept_loop(Arc::clone(&shared), listener));
        let dispatch = DispatchLoop {
            shared: Arc::clone(&shared),
            in_rx,
            backlog: VecDeque::new(),
            closing: false,
        };
        tokio::spawn(dispatch.run(closed_tx));

        info!(addr = %canonical, "server listening");
        Ok(Arc::new(RpcServer {
            shared,
            accept_task: Mutex::new(Some(accept_task)),
            closed_rx,
        }))
    }

    /// Canonical address peers connect to and descriptors embed.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Expose an object under a name importable by clients.
    pub fn publish(&self, name: &str, obj: Arc<dyn RemoteObject>) {
        debug!(addr = %self.shared.addr, name, "publishing object");
        self.shared.published.lock().insert(name.to_string(), obj);
    }

    /// Register a value by reference and hand `holder` one reference to it.
    ///
    /// This is how local values become transmittable: the returned
    /// descriptor names this server as the object's home.
    pub fn host_object(&self, obj: &Arc<dyn RemoteObject>, holder: &str) -> ProxyDescriptor {
        let mut registry = self.shared.registry.lock();
        let id = registry.own(obj);
        registry.incref(id, 1, holder);
        let (type_name, caps) = registry.meta(id).expect("freshly owned entry");
        ProxyDescriptor {
            server_addr: self.shared.addr.clone(),
            object_id: id,
            type_name,
            caps,
            path: Vec::new(),
        }
    }

    /// Requests dispatched so far, reentrant ones included.
    pub fn requests_handled(&self) -> u64 {
        self.shared.stats.requests_handled.load(Ordering::Relaxed)
    }

    /// Fire-and-forget failures that were logged instead of reported.
    pub fn logged_failures(&self) -> u64 {
        self.shared.stats.logged_failures.load(Ordering::Relaxed)
    }

    /// Summed refcount of a registry entry, for lifetime inspection.
    pub fn refcount(&self, id: u64) -> Option<i64> {
        self.shared.registry.lock().refcount(id)
    }

    /// Contribution of one peer to one entry, for lifetime inspection.
    pub fn contribution(&self, id: u64, peer: &str) -> i64 {
        self.shared.registry.lock().contribution(id, peer)
    }

    /// Number of live registry entries.
    pub fn registry_len(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Close the server: stop accepting, finish the in-flight request,
    /// reject queued ones, notify every peer and drain the registry.
    /// Returns once all of that has happened.
    pub async fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            if let Some(task) = self.accept_task.lock().take() {
                task.abort();
            }
            let _ = self.shared.in_tx.send(Event::Shutdown);
        }

        let mut closed = self.closed_rx.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    async fn accept_loop(shared: Arc<ServerShared>, mut listener: FrameListener) {
        loop {
            match listener.accept().await {
                Ok((reader, writer)) => {
                    let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(addr = %shared.addr, conn, "session accepted");

                    let (tx, rx) = mpsc::unbounded_channel();
                    let writer_task = tokio::spawn(Self::conn_writer(writer, rx));
                    let reader_task =
                        tokio::spawn(Self::conn_reader(Arc::clone(&shared), conn, reader));

                    shared.conns.lock().insert(
                        conn,
                        ConnHandle {
                            peer: None,
                            tx,
                            tasks: vec![writer_task, reader_task],
                        },
                    );
                }
                Err(err) => {
                    warn!(addr = %shared.addr, error = %err, "accept loop ended");
                    break;
                }
            }
        }
    }

    async fn conn_reader(shared: Arc<ServerShared>, conn: u64, mut reader: FrameReader) {
        loop {
            match reader.recv().await {
                // Cancellations bypass the dispatch queue, otherwise they
                // could never beat the requests they target.
                Ok(Frame::Notice(Notice::Cancel { request })) => {
                    trace!(conn, request, "cancel notice");
                    shared.cancelled.lock().insert((conn, request));
                }
                Ok(frame) => {
                    if shared.in_tx.send(Event::Conn(conn, frame)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(conn, error = %err, "session ended");
                    let _ = shared.in_tx.send(Event::ConnClosed(conn));
                    break;
                }
            }
        }
    }

    async fn conn_writer(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<ConnOut>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ConnOut::Frame(frame) => {
                    if let Err(err) = writer.send(&frame).await {
                        debug!(error = %err, "session writer failed");
                        break;
                    }
                }
                ConnOut::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }
}

/// Target of an opcode after path resolution.
enum Resolved {
    Obj(Arc<dyn RemoteObject>),
    Val(Value),
}

struct DispatchLoop {
    shared: Arc<ServerShared>,
    in_rx: mpsc::UnboundedReceiver<Event>,
    /// Frames deferred during reentrancy windows, drained before new
    /// traffic so per-peer FIFO holds outside those windows.
    backlog: VecDeque<(u64, Frame)>,
    closing: bool,
}

impl DispatchLoop {
    async fn run(mut self, closed_tx: watch::Sender<bool>) {
        loop {
            let event = if let Some((conn, frame)) = self.backlog.pop_front() {
                Event::Conn(conn, frame)
            } else if self.closing {
                match self.in_rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            } else {
                match self.in_rx.recv().await {
                    Some(event) => event,
                    None => break,
                }
            };

            match event {
                Event::Conn(conn, frame) => self.handle_frame(conn, frame).await,
                Event::ConnClosed(conn) => self.drop_conn(conn),
                Event::Shutdown => {
                    info!(addr = %self.shared.addr, "shutdown requested");
                    self.closing = true;
                }
            }
        }

        self.finish_close().await;
        let _ = closed_tx.send(true);
    }

    async fn handle_frame(&mut self, conn: u64, frame: Frame) {
        match frame {
            Frame::Req(req) => self.dispatch(conn, req).await,
            Frame::Notice(notice) => self.handle_notice(conn, notice),
            Frame::Rep(reply) => {
                // Nested replies arrive on this server's client sessions,
                // never on serving connections.
                warn!(conn, id = reply.id, "unexpected reply frame on serving session");
            }
        }
    }

    fn handle_notice(&mut self, conn: u64, notice: Notice) {
        match notice {
            Notice::Hello { peer } => {
                trace!(conn, %peer, "handshake");
                if let Some(handle) = self.shared.conns.lock().get_mut(&conn) {
                    handle.peer = Some(peer);
                }
            }
            Notice::Release { pairs } => {
                let peer = self.shared.peer_name_of(conn);
                let mut registry = self.shared.registry.lock();
                for (id, n) in pairs {
                    registry.decref(id, n, &peer);
                }
            }
            Notice::Incref { id, n, holder } => {
                self.shared.registry.lock().incref(id, n, &holder);
            }
            Notice::Cancel { request } => {
                // Normally intercepted by the reader; recorded here too for
                // frames that arrived through the backlog.
                self.shared.cancelled.lock().insert((conn, request));
            }
            other => {
                warn!(conn, notice = ?other, "unexpected notice on serving session");
            }
        }
    }

    fn drop_conn(&mut self, conn: u64) {
        let removed = self.shared.conns.lock().remove(&conn);
        let Some(handle) = removed else { return };
        for task in handle.tasks {
            task.abort();
        }
        self.shared.cancelled.lock().retain(|(c, _)| *c != conn);

        match handle.peer {
            Some(peer) => {
                // Several connections may share one peer name; the peer's
                // references go away with its last connection.
                let still_connected = self
                    .shared
                    .conns
                    .lock()
                    .values()
                    .any(|other| other.peer.as_deref() == Some(peer.as_str()));
                if !still_connected {
                    self.shared.registry.lock().release_all_from(&peer);
                }
                debug!(conn, %peer, "peer disconnected");
            }
            None => {
                let anon = format!("anon-{conn}");
                self.shared.registry.lock().release_all_from(&anon);
            }
        }
    }

    async fn dispatch(&mut self, conn: u64, req: Request) {
        // The atomic flips the moment `close` is called, so requests still
        // queued behind the in-flight one are rejected rather than run.
        if self.closing || self.shared.closing.load(Ordering::SeqCst) {
            if req.mode != CallMode::Off {
                self.reply_err(conn, req.id, &RpcError::ShuttingDown);
            }
            return;
        }
        if req.id != 0 && self.shared.cancelled.lock().remove(&(conn, req.id)) {
            debug!(conn, id = req.id, "request skipped by cancellation");
            self.reply_err(conn, req.id, &RpcError::Cancelled);
            return;
        }

        self.shared
            .stats
            .requests_handled
            .fetch_add(1, Ordering::Relaxed);
        trace!(conn, id = req.id, op = req.op.name(), target = req.target, "dispatch");

        let peer = self.shared.peer_name_of(conn);
        let mode = req.mode;
        let return_mode = req.return_mode;
        let id = req.id;

        // Hold the references transferred with the arguments for the
        // duration of the request; anything the target did not retain is
        // released afterwards.
        let _arg_holders = self.claim_request_refs(&req).await;

        let executed = self.execute(req).await;

        if mode == CallMode::Off {
            if let Err(err) = executed {
                self.shared
                    .stats
                    .logged_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(conn, error = %err, "fire-and-forget request failed");
            }
            return;
        }

        match executed {
            Ok(outcome) => {
                let mut cx = ServerEncodeCx {
                    server_addr: &self.shared.addr,
                    registry: &*self.shared.registry,
                    dest_peer: &peer,
                    threshold: self.shared.opts.auto_proxy_threshold,
                    serializer: self.shared.opts.serializer,
                    forwards: Vec::new(),
                };
                match encode_outcome(outcome, return_mode, &mut cx) {
                    Ok(payload) => {
                        for forward in cx.forwards {
                            crate::local::send_incref(forward);
                        }
                        self.shared.send_to(
                            conn,
                            Frame::Rep(Reply {
                                id,
                                status: Status::Ok,
                                payload,
                            }),
                        );
                    }
                    Err(err) => self.reply_err(conn, id, &err),
                }
            }
            Err(err) => self.reply_err(conn, id, &err),
        }
    }

    fn reply_err(&self, conn: u64, id: u64, err: &RpcError) {
        debug!(conn, id, kind = %err.kind(), "request failed");
        self.shared.send_to(
            conn,
            Frame::Rep(Reply {
                id,
                status: Status::Err(err.kind()),
                payload: err.to_payload(),
            }),
        );
    }

    /// Claim the references embedded in the request arguments, so they stay
    /// alive while the target runs. Descriptors homed here need no claim:
    /// they resolve to owned values.
    async fn claim_request_refs(&mut self, req: &Request) -> Vec<ObjectProxy> {
        let mut proxies = Vec::new();
        let mut stack: Vec<&Value> = req.args.iter().chain(req.kwargs.values()).collect();
        while let Some(node) = stack.pop() {
            match node {
                Value::ObjectRef(desc) if desc.server_addr != self.shared.addr => {
                    match self.shared.nested_client(&desc.server_addr).await {
                        Ok(client) => proxies.push(client.claim_proxy(desc.clone(), true)),
                        Err(err) => {
                            warn!(home = %desc.server_addr, error = %err,
                                "cannot claim argument reference");
                        }
                    }
                }
                Value::List(items) => stack.extend(items.iter()),
                Value::Map(map) => stack.extend(map.values()),
                _ => {}
            }
        }
        proxies
    }

    async fn execute(&mut self, req: Request) -> Result<Outcome, RpcError> {
        // Identity and liveness checks need no path walk.
        match req.op {
            Opcode::Ping => return Ok(Outcome::Value(Value::Null)),
            Opcode::GetId => {
                // Ids name registry entries; a path-derived target has no
                // id of its own to report.
                if !req.path.is_empty() {
                    return Err(RpcError::UnsupportedOp(
                        "GET_ID identifies root objects, not path-derived targets".to_string(),
                    ));
                }
                if req.target != 0 && self.shared.registry.lock().get(req.target).is_none() {
                    return Err(RpcError::UnknownObject(req.target));
                }
                return Ok(Outcome::Value(Value::Int(req.target as i64)));
            }
            _ => {}
        }

        if req.target == 0 {
            if req.op == Opcode::Call {
                return self.call_published(req).await;
            }
            return self.execute_builtin(req);
        }

        let root = self
            .shared
            .registry
            .lock()
            .get(req.target)
            .ok_or(RpcError::UnknownObject(req.target))?;

        let mut target = Resolved::Obj(root);
        for segment in &req.path {
            target = self.walk_step(target, segment)?;
        }

        self.apply_op(target, req).await
    }

    /// Builtin surface of target 0: module import, item access and deletion
    /// over the published-name table. The fourth builtin, calling a
    /// published name directly, lives in [`DispatchLoop::call_published`].
    fn execute_builtin(&mut self, req: Request) -> Result<Outcome, RpcError> {
        if !req.path.is_empty() {
            return Err(RpcError::UnsupportedOp(
                "the server itself has no attribute paths".to_string(),
            ));
        }
        match req.op {
            Opcode::Import | Opcode::GetItem => {
                let name = req
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::UnsupportedOp("IMPORT needs a name".to_string()))?;
                match self.shared.published.lock().get(name) {
                    Some(obj) => Ok(Outcome::ByRef(Arc::clone(obj))),
                    None => Err(missing_module("ImportError", name)),
                }
            }
            Opcode::DelItem => {
                let name = req
                    .args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::UnsupportedOp("DELITEM needs a name".to_string()))?;
                match self.shared.published.lock().remove(name) {
                    Some(_) => Ok(Outcome::Value(Value::Null)),
                    None => Err(missing_module("KeyError", name)),
                }
            }
            other => Err(RpcError::UnsupportedOp(format!(
                "{} is not part of the server builtin surface",
                other.name()
            ))),
        }
    }

    /// CALL on target 0: invoke a published object by name in one round
    /// trip, without importing a proxy first. The first argument names the
    /// object, the rest are forwarded to it.
    async fn call_published(&mut self, mut req: Request) -> Result<Outcome, RpcError> {
        if !req.path.is_empty() {
            return Err(RpcError::UnsupportedOp(
                "the server itself has no attribute paths".to_string(),
            ));
        }
        if req.args.first().and_then(Value::as_str).is_none() {
            return Err(RpcError::UnsupportedOp(
                "CALL on the server needs a published name as its first argument".to_string(),
            ));
        }
        let Value::Str(name) = req.args.remove(0) else {
            unreachable!("checked above");
        };

        let obj = match self.shared.published.lock().get(&name) {
            Some(obj) => Arc::clone(obj),
            None => return Err(missing_module("ImportError", &name)),
        };
        // The remaining arguments flow through the ordinary call path,
        // capability gate and call context included.
        self.apply_op(Resolved::Obj(obj), req).await
    }

    /// Resolve one path segment, collapsing descriptors homed here back to
    /// their owned objects so identity survives the round trip.
    fn walk_step(&self, target: Resolved, segment: &PathSegment) -> Result<Resolved, RpcError> {
        match target {
            Resolved::Obj(obj) => {
                let result = match segment {
                    PathSegment::Attr(name) => {
                        self.require_cap(&obj, Caps::GET_ATTR, "GETATTR")?;
                        obj.get_attr(name)
                    }
                    PathSegment::Item(key) => {
                        self.require_cap(&obj, Caps::GET_ITEM, "GETITEM")?;
                        obj.get_item(key)
                    }
                };
                match result {
                    Ok(Outcome::ByRef(next)) => Ok(Resolved::Obj(next)),
                    Ok(Outcome::Value(value)) => Ok(self.resolve_value(value)),
                    Err(err) => Err(self.op_error(err, &obj, segment)),
                }
            }
            Resolved::Val(value) => {
                let next = match segment {
                    PathSegment::Attr(name) => value.item(&Value::from(name.as_str())),
                    PathSegment::Item(key) => value.item(key),
                };
                match next {
                    Some(found) => Ok(self.resolve_value(found.clone())),
                    None => Err(RpcError::Remote(RemoteError {
                        type_name: "LookupError".to_string(),
                        message: format!("no such member in {}", value.kind_name()),
                        traceback: format!("LookupError: no such member in {}", value.kind_name()),
                        chain: vec![format!("no such member in {}", value.kind_name())],
                    })),
                }
            }
        }
    }

    /// A root descriptor homed at this server is the object itself, not a
    /// proxy.
    fn resolve_value(&self, value: Value) -> Resolved {
        if let Value::ObjectRef(desc) = &value {
            if desc.server_addr == self.shared.addr && desc.path.is_empty() {
                if let Some(obj) = self.shared.registry.lock().get(desc.object_id) {
                    return Resolved::Obj(obj);
                }
            }
        }
        Resolved::Val(value)
    }

    fn require_cap(
        &self,
        obj: &Arc<dyn RemoteObject>,
        required: Caps,
        op: &'static str,
    ) -> Result<(), RpcError> {
        if obj.caps().contains(required) {
            Ok(())
        } else {
            Err(RpcError::UnsupportedOp(format!(
                "{} does not support {op}",
                obj.type_name()
            )))
        }
    }

    fn op_error(
        &self,
        err: OpError,
        obj: &Arc<dyn RemoteObject>,
        context: &dyn std::fmt::Debug,
    ) -> RpcError {
        match err {
            OpError::Unsupported => RpcError::UnsupportedOp(format!(
                "{} does not support {context:?}",
                obj.type_name()
            )),
            OpError::Raised(raised) => RpcError::Remote(RemoteError::from_anyhow(&raised)),
        }
    }

    async fn apply_op(&mut self, target: Resolved, req: Request) -> Result<Outcome, RpcError> {
        let Request {
            op, args, kwargs, ..
        } = req;

        match target {
            Resolved::Obj(obj) => {
                // A nameless GETATTR fetches the target itself and needs no
                // capability; everything else is gated by the bitmap.
                let materialize = op == Opcode::GetAttr
                    && matches!(args.first(), None | Some(Value::Null));
                if !materialize {
                    if let Some(required) = cap_for(op) {
                        self.require_cap(&obj, required, op.name())?;
                    }
                }

                let result: OpResult = match op {
                    Opcode::Call => {
                        let mut cx = CallCx {
                            dispatch: Some(self),
                        };
                        obj.call(&mut cx, args, kwargs).await
                    }
                    Opcode::GetAttr => match args.first() {
                        // No name: fetch the resolved target itself. This is
                        // the materialization point of a lazy path.
                        None | Some(Value::Null) => Ok(Outcome::ByRef(Arc::clone(&obj))),
                        Some(Value::Str(name)) => obj.get_attr(name),
                        Some(other) => Err(OpError::Raised(anyhow::anyhow!(
                            "GETATTR name must be a string, got {}",
                            other.kind_name()
                        ))),
                    },
                    Opcode::SetAttr => match args.first().and_then(Value::as_str) {
                        Some(name) => {
                            let name = name.to_string();
                            let value = args.into_iter().nth(1).unwrap_or(Value::Null);
                            obj.set_attr(&name, value)
                        }
                        None => Err(OpError::Raised(anyhow::anyhow!(
                            "SETATTR needs a string name"
                        ))),
                    },
                    Opcode::GetItem => {
                        let key = args.first().cloned().unwrap_or(Value::Null);
                        obj.get_item(&key)
                    }
                    Opcode::SetItem => {
                        let mut args = args.into_iter();
                        let key = args.next().unwrap_or(Value::Null);
                        let value = args.next().unwrap_or(Value::Null);
                        obj.set_item(&key, value)
                    }
                    Opcode::DelItem => {
                        let key = args.first().cloned().unwrap_or(Value::Null);
                        obj.del_item(&key)
                    }
                    Opcode::Cmp(cmp) => {
                        let other = args.first().cloned().unwrap_or(Value::Null);
                        obj.compare(cmp, &other)
                    }
                    Opcode::Len => obj.len(),
                    Opcode::Import | Opcode::GetId | Opcode::Ping => {
                        return Err(RpcError::UnsupportedOp(format!(
                            "{} does not apply to hosted objects",
                            op.name()
                        )))
                    }
                };

                result.map_err(|err| self.op_error(err, &obj, &op.name()))
            }
            Resolved::Val(value) => apply_value_op(op, value, args),
        }
    }

    /// Send a nested request and keep serving the peer it addresses until
    /// the reply lands. This is the reentrancy window: requests from that
    /// peer dispatch recursively, frames from everyone else wait in the
    /// backlog.
    async fn pump_nested(&mut self, future: CallFuture, peer_addr: &str) -> RpcResult<Returned> {
        loop {
            // The select only picks what woke us; all handling happens
            // below, once the arm futures are gone.
            let inbound = tokio::select! {
                biased;
                _ = future.wait_ready() => None,
                event = self.in_rx.recv() => Some(event),
            };
            let Some(event) = inbound else { break };

            match event {
                Some(Event::Conn(conn, frame)) => match frame {
                    Frame::Req(req) if self.shared.peer_name_of(conn) == peer_addr => {
                        trace!(conn, id = req.id, "reentrant dispatch");
                        self.dispatch(conn, req).await;
                    }
                    Frame::Notice(notice) => self.handle_notice(conn, notice),
                    other => self.backlog.push_back((conn, other)),
                },
                Some(Event::ConnClosed(conn)) => self.drop_conn(conn),
                Some(Event::Shutdown) => {
                    info!(addr = %self.shared.addr, "shutdown requested during nested call");
                    self.closing = true;
                }
                None => return Err(RpcError::ConnectionLost),
            }
        }
        future.result(None).await
    }

    async fn finish_close(&mut self) {
        info!(addr = %self.shared.addr, "closing server");

        let handles: Vec<ConnHandle> = {
            let mut conns = self.shared.conns.lock();
            conns.drain().map(|(_, handle)| handle).collect()
        };

        // Every peer hears about the shutdown before the transport goes
        // away; the flush marker waits until the notice is on the wire.
        let mut acks = Vec::new();
        for handle in &handles {
            let _ = handle.tx.send(ConnOut::Frame(Frame::Notice(Notice::ServerClosed)));
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.tx.send(ConnOut::Flush(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = tokio::time::timeout(Duration::from_secs(1), ack).await;
        }
        for handle in handles {
            for task in handle.tasks {
                task.abort();
            }
        }

        let drained = self.shared.registry.lock().drain();
        if drained > 0 {
            debug!(drained, "registry drained");
        }
        self.shared.published.lock().clear();

        let nested: Vec<Arc<RpcClient>> =
            self.shared.nested.lock().await.drain().map(|(_, c)| c).collect();
        for client in nested {
            client.close().await;
        }

        crate::local::unregister_server(&self.shared.addr);
        info!(addr = %self.shared.addr, "server closed");
    }
}

/// Remote error for a published name that is not there, under the error
/// type the failing builtin reports.
fn missing_module(kind: &str, name: &str) -> RpcError {
    RpcError::Remote(RemoteError {
        type_name: kind.to_string(),
        message: format!("no published module named {name:?}"),
        traceback: format!("{kind}: no published module named {name:?}"),
        chain: vec![format!("no published module named {name:?}")],
    })
}

/// Capability demanded by each opcode. `None` means no gate: identity and
/// liveness checks work on every object.
fn cap_for(op: Opcode) -> Option<Caps> {
    match op {
        Opcode::Call => Some(Caps::CALL),
        Opcode::GetAttr | Opcode::SetAttr => Some(Caps::GET_ATTR),
        Opcode::GetItem => Some(Caps::GET_ITEM),
        Opcode::SetItem | Opcode::DelItem => Some(Caps::SET_ITEM),
        Opcode::Len => Some(Caps::LEN),
        Opcode::Cmp(cmp) => Some(match cmp {
            crate::wire::CmpOp::Eq | crate::wire::CmpOp::Ne => Caps::CMP_EQ,
            _ => Caps::CMP_ORD,
        }),
        Opcode::Import | Opcode::GetId | Opcode::Ping => None,
    }
}

/// Opcodes applied to a plain value reached through a path walk. Reads
/// work; mutations would only touch a copy, so they are rejected.
fn apply_value_op(op: Opcode, value: Value, args: Vec<Value>) -> Result<Outcome, RpcError> {
    match op {
        Opcode::GetAttr => match args.first() {
            None | Some(Value::Null) => Ok(Outcome::Value(value)),
            Some(Value::Str(name)) => value
                .item(&Value::from(name.as_str()))
                .cloned()
                .map(Outcome::Value)
                .ok_or_else(|| {
                    RpcError::Remote(RemoteError {
                        type_name: "LookupError".to_string(),
                        message: format!("no member {name:?}"),
                        traceback: format!("LookupError: no member {name:?}"),
                        chain: vec![format!("no member {name:?}")],
                    })
                }),
            Some(other) => Err(RpcError::UnsupportedOp(format!(
                "GETATTR name must be a string, got {}",
                other.kind_name()
            ))),
        },
        Opcode::GetItem => {
            let key = args.first().cloned().unwrap_or(Value::Null);
            value
                .item(&key)
                .cloned()
                .map(Outcome::Value)
                .ok_or_else(|| {
                    RpcError::Remote(RemoteError {
                        type_name: "LookupError".to_string(),
                        message: format!("no item in {}", value.kind_name()),
                        traceback: format!("LookupError: no item in {}", value.kind_name()),
                        chain: vec![format!("no item in {}", value.kind_name())],
                    })
                })
        }
        Opcode::Len => value
            .len_of()
            .map(|n| Outcome::Value(Value::Int(n as i64)))
            .ok_or_else(|| {
                RpcError::UnsupportedOp(format!("{} has no length", value.kind_name()))
            }),
        Opcode::Cmp(cmp) => {
            let other = args.first().cloned().unwrap_or(Value::Null);
            value
                .compare(cmp, &other)
                .map(|b| Outcome::Value(Value::Bool(b)))
                .ok_or_else(|| {
                    RpcError::UnsupportedOp(format!(
                        "cannot compare {} with {}",
                        value.kind_name(),
                        other.kind_name()
                    ))
                })
        }
        other => Err(RpcError::UnsupportedOp(format!(
            "{} does not apply to a value reached through a path",
            other.name()
        ))),
    }
}

/// Execution context handed to a hosted object's `call`.
///
/// It is the bridge back into the dispatch loop: calling a proxy argument
/// routes through the owning server's client session while the loop keeps
/// serving the peer being waited on.
pub struct CallCx<'a> {
    dispatch: Option<&'a mut DispatchLoop>,
}

impl CallCx<'_> {
    /// Context with no dispatch loop behind it, for unit-testing hosted
    /// objects. Nested proxy calls fail in a detached context.
    pub fn detached() -> CallCx<'static> {
        CallCx { dispatch: None }
    }

    /// Address of the server executing the current request, when attached.
    pub fn server_addr(&self) -> Option<&str> {
        self.dispatch
            .as_ref()
            .map(|dispatch| dispatch.shared.addr.as_str())
    }

    /// Invoke a value that should be callable: an object reference argument
    /// or a plain descriptor.
    ///
    /// A reference homed at this very server short-circuits to a direct
    /// call, preserving identity. Anything else becomes a nested request
    /// through this server's client to the reference's home; the dispatch
    /// loop keeps serving that peer until the reply lands.
    pub async fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> anyhow::Result<Returned> {
        let Value::ObjectRef(desc) = callee else {
            anyhow::bail!("value of kind {} is not callable", callee.kind_name());
        };
        let Some(dispatch) = self.dispatch.as_deref_mut() else {
            anyhow::bail!("detached call context cannot reach {}", desc.server_addr);
        };

        if desc.server_addr == dispatch.shared.addr {
            // Our own object: no wire, no proxy, the value itself.
            let obj = dispatch
                .shared
                .registry
                .lock()
                .get(desc.object_id)
                .ok_or(RpcError::UnknownObject(desc.object_id))?;
            let mut target = Resolved::Obj(obj);
            for segment in &desc.path {
                target = dispatch.walk_step(target, segment)?;
            }
            let req = Request {
                id: 0,
                op: Opcode::Call,
                target: desc.object_id,
                path: Vec::new(),
                args,
                kwargs,
                mode: CallMode::Sync,
                return_mode: crate::wire::ReturnMode::Auto,
            };
            let outcome = dispatch.apply_op(target, req).await?;
            return match outcome {
                Outcome::Value(value) => Ok(Returned::new(value, Vec::new())),
                Outcome::ByRef(_) => anyhow::bail!(
                    "local nested call returned an unhosted object by reference"
                ),
            };
        }

        let client = dispatch.shared.nested_client(&desc.server_addr).await?;
        let future = client.submit(crate::client::RequestSpec {
            op: Opcode::Call,
            target: desc.object_id,
            path: desc.path.clone(),
            args,
            kwargs,
            return_mode: crate::wire::ReturnMode::Auto,
        })?;

        let home = desc.server_addr.clone();
        Ok(dispatch.pump_nested(future, &home).await?)
    }

    /// Claim a live handle for an object reference argument, so it can be
    /// retained beyond the current request.
    pub async fn claim_value(&mut self, value: &Value) -> anyhow::Result<Option<ObjectProxy>> {
        let Value::ObjectRef(desc) = value else {
            return Ok(None);
        };
        let Some(dispatch) = self.dispatch.as_deref_mut() else {
            anyhow::bail!("detached call context cannot claim references");
        };
        if desc.server_addr == dispatch.shared.addr {
            return Ok(None);
        }
        let client = dispatch.shared.nested_client(&desc.server_addr).await?;
        Ok(Some(client.claim_proxy(desc.clone(), false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_table_matches_opcodes() {
        assert_eq!(cap_for(Opcode::Call), Some(Caps::CALL));
        assert_eq!(cap_for(Opcode::Len), Some(Caps::LEN));
        assert_eq!(
            cap_for(Opcode::Cmp(crate::wire::CmpOp::Lt)),
            Some(Caps::CMP_ORD)
        );
        assert_eq!(
            cap_for(Opcode::Cmp(crate::wire::CmpOp::Eq)),
            Some(Caps::CMP_EQ)
        );
        assert_eq!(cap_for(Opcode::Ping), None);
        assert_eq!(cap_for(Opcode::GetId), None);
    }

    #[test]
    fn value_ops_read_but_never_write() {
        let list = Value::List(vec![Value::Int(5), Value::Int(6)]);

        let got = apply_value_op(Opcode::GetItem, list.clone(), vec![Value::Int(1)]).unwrap();
        match got {
            Outcome::Value(v) => assert_eq!(v, Value::Int(6)),
            Outcome::ByRef(_) => panic!("expected a value"),
        }

        let len = apply_value_op(Opcode::Len, list.clone(), Vec::new()).unwrap();
        match len {
            Outcome::Value(v) => assert_eq!(v, Value::Int(2)),
            Outcome::ByRef(_) => panic!("expected a value"),
        }

        let err = apply_value_op(
            Opcode::SetItem,
            list,
            vec![Value::Int(0), Value::Int(9)],
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedOp(_)));
    }
}

//! Lock daemon: accept loop, per-connection workers, per-key FIFO queues.
//!
//! Thread model: the accept loop spawns one reader thread per connection;
//! requests on a connection are read serially. Grant completions may be
//! delivered by any thread but always write under the connection's output
//! mutex. Per-key state is serialized under that key's own mutex, and no
//! lock is held across blocking I/O.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::config::IpcConfig;
use crate::ipc::proto::{self, Frame};
use crate::ipc::{DaemonInfo, IpcError, IpcListener, IpcStream, SocketFamily, connect_address};

/// One scope of lock ownership, owned by a single client connection.
struct LockContext {
    id: String,
    shared: bool,
    /// Keys this context holds or waits on, in acquisition order.
    keys: Mutex<Vec<String>>,
}

/// Per-key lock: current holders plus a FIFO wait queue.
///
/// Invariant: `holders` is empty, a single exclusive context, or one or
/// more shared contexts.
#[derive(Default)]
struct LockState {
    holders: Vec<Arc<LockContext>>,
    waiters: VecDeque<LockWaiter>,
}

struct LockWaiter {
    context: Arc<LockContext>,
    /// One-shot grant channel; dropping it cancels the wait.
    grant: Sender<()>,
}

/// Grants the key to `context` or queues it. Returns the grant receiver
/// when the caller must wait.
fn lock(state: &mut LockState, context: &Arc<LockContext>) -> Option<Receiver<()>> {
    if state.holders.is_empty() || (state.holders[0].shared && context.shared) {
        state.holders.push(Arc::clone(context));
        return None;
    }
    let (grant, wait) = bounded(1);
    state.waiters.push_back(LockWaiter {
        context: Arc::clone(context),
        grant,
    });
    Some(wait)
}

/// Releases the key for `context`: drops its hold and promotes compatible
/// waiters from the head of the queue as a batch, or cancels its pending
/// wait if it never held the key.
fn unlock(state: &mut LockState, context: &Arc<LockContext>) {
    if let Some(pos) = state.holders.iter().position(|h| h.id == context.id) {
        state.holders.remove(pos);
        loop {
            let compatible = match state.waiters.front() {
                Some(head) => {
                    state.holders.is_empty() || (state.holders[0].shared && head.context.shared)
                }
                None => false,
            };
            if !compatible {
                break;
            }
            if let Some(waiter) = state.waiters.pop_front() {
                state.holders.push(Arc::clone(&waiter.context));
                let _ = waiter.grant.send(());
            }
        }
    } else {
        state.waiters.retain(|w| w.context.id != context.id);
    }
}

struct ServerState {
    listener: IpcListener,
    address: String,
    config: IpcConfig,
    counter: AtomicU32,
    locks: DashMap<String, Arc<Mutex<LockState>>>,
    contexts: DashMap<String, Arc<LockContext>>,
    connections: DashMap<u64, IpcStream>,
    connection_counter: AtomicU64,
    clients: AtomicUsize,
    started: Instant,
    last_used_ms: AtomicU64,
    closing: AtomicBool,
}

impl ServerState {
    fn touch(&self) {
        self.last_used_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }

    fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn initiate_shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("lock daemon shutting down");
        for entry in self.connections.iter() {
            entry.value().shutdown();
        }
    }

    fn lock_state(&self, key: &str) -> Arc<Mutex<LockState>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(Default::default)
            .clone()
    }

    /// Registers `keys` on the context and attempts each grant. Pending
    /// grants come back as receivers the caller must wait on.
    fn acquire(&self, context: &Arc<LockContext>, keys: Vec<String>) -> Vec<Receiver<()>> {
        context
            .keys
            .lock()
            .expect("context key list poisoned")
            .extend(keys.iter().cloned());
        let mut pending = Vec::new();
        for key in keys {
            let state = self.lock_state(&key);
            let mut state = state.lock().expect("lock state poisoned");
            if let Some(wait) = lock(&mut state, context) {
                pending.push(wait);
            }
        }
        pending
    }

    /// Releases every key the context holds or waits on.
    fn release_context(&self, context: &Arc<LockContext>) {
        let keys = context
            .keys
            .lock()
            .expect("context key list poisoned")
            .clone();
        for key in keys {
            let state = self.lock_state(&key);
            let mut state = state.lock().expect("lock state poisoned");
            unlock(&mut state, context);
        }
    }
}

/// The daemon. Bind, then [`LockServer::run`] until shutdown.
pub struct LockServer {
    state: Arc<ServerState>,
}

impl LockServer {
    pub fn bind(config: IpcConfig) -> Result<Self, IpcError> {
        let listener = IpcListener::bind(config.family)?;
        let address = listener.local_address()?;
        Ok(Self {
            state: Arc::new(ServerState {
                listener,
                address,
                config,
                counter: AtomicU32::new(0),
                locks: DashMap::new(),
                contexts: DashMap::new(),
                connections: DashMap::new(),
                connection_counter: AtomicU64::new(0),
                clients: AtomicUsize::new(0),
                started: Instant::now(),
                last_used_ms: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// The address clients dial, e.g. `unix:/run/user/1000/quarry/lockd.sock`.
    pub fn local_address(&self) -> &str {
        &self.state.address
    }

    /// Requests a graceful shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Serves until idle expiry, `STOP` or [`ShutdownHandle::shutdown`].
    pub fn run(&self) -> Result<(), IpcError> {
        let state = &self.state;
        state.touch();
        info!(address = %state.address, "lock daemon started");

        if !state.config.no_fork {
            self.write_meta();
        }

        {
            let state = Arc::clone(state);
            thread::spawn(move || expiry_loop(&state));
        }

        state.listener.set_nonblocking(true)?;
        loop {
            if state.closing() {
                break;
            }
            match state.listener.accept() {
                Ok(stream) => {
                    let conn_id = state.connection_counter.fetch_add(1, Ordering::Relaxed);
                    if let Ok(clone) = stream.try_clone() {
                        state.connections.insert(conn_id, clone);
                    }
                    let state = Arc::clone(state);
                    thread::spawn(move || handle_client(state, stream, conn_id));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    if !state.closing() {
                        error!("accept error: {e}");
                    }
                }
            }
        }

        for entry in state.connections.iter() {
            entry.value().shutdown();
        }
        state.listener.unlink();
        if !state.config.no_fork {
            let _ = std::fs::remove_file(crate::paths::meta_path());
        }
        info!("lock daemon stopped");
        Ok(())
    }

    fn write_meta(&self) {
        let meta = DaemonInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            address: self.state.address.clone(),
        };
        let path = crate::paths::meta_path();
        match serde_json::to_vec(&meta) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), "failed to write daemon metadata: {e}");
                    return;
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ =
                        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
                }
            }
            Err(e) => tracing::warn!("failed to encode daemon metadata: {e}"),
        }
    }
}

/// Clonable handle that can stop a running server.
pub struct ShutdownHandle {
    state: Arc<ServerState>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.state.initiate_shutdown();
    }
}

fn expiry_loop(state: &ServerState) {
    loop {
        if state.closing() {
            return;
        }
        let idle = state.idle_for();
        if state.clients.load(Ordering::SeqCst) == 0 && idle >= state.config.idle_timeout {
            info!("lock daemon idle, expiring");
            state.initiate_shutdown();
            return;
        }
        let left = state.config.idle_timeout.saturating_sub(idle);
        thread::sleep(left.clamp(Duration::from_millis(10), Duration::from_millis(200)));
    }
}

fn handle_client(state: Arc<ServerState>, stream: IpcStream, conn_id: u64) {
    let mut reader = match stream.try_clone() {
        Ok(r) => r,
        Err(e) => {
            error!("failed to clone client stream: {e}");
            state.connections.remove(&conn_id);
            return;
        }
    };
    let output = Arc::new(Mutex::new(stream));

    let count = state.clients.fetch_add(1, Ordering::SeqCst) + 1;
    info!(clients = count, "client connected");
    state.touch();

    let mut client_contexts: HashMap<String, Arc<LockContext>> = HashMap::new();

    loop {
        if state.closing() {
            break;
        }
        match proto::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                state.touch();
                if let Err(e) = dispatch(&state, &output, &mut client_contexts, frame) {
                    if !state.closing() {
                        error!("error processing request: {e}, closing connection");
                    }
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if !state.closing() {
                    error!("error reading request: {e}, closing connection");
                }
                break;
            }
        }
    }

    // Implicit CLOSE of every context this connection created.
    for (_, context) in client_contexts.drain() {
        state.contexts.remove(&context.id);
        state.release_context(&context);
    }
    output
        .lock()
        .expect("connection output poisoned")
        .shutdown();
    state.connections.remove(&conn_id);
    let count = state.clients.fetch_sub(1, Ordering::SeqCst) - 1;
    if !state.closing() {
        info!(clients = count, "client disconnected");
    }
}

fn dispatch(
    state: &Arc<ServerState>,
    output: &Arc<Mutex<IpcStream>>,
    client_contexts: &mut HashMap<String, Arc<LockContext>>,
    frame: Frame,
) -> Result<(), IpcError> {
    let request_id = frame.request_id;
    let mut args = frame.args.into_iter();
    let Some(command) = args.next() else {
        return Err(IpcError::protocol("received empty request"));
    };

    match command.as_str() {
        proto::CMD_CONTEXT => {
            let shared = match (args.next(), args.next()) {
                (Some(flag), None) => flag.eq_ignore_ascii_case("true"),
                _ => {
                    return Err(IpcError::protocol("CONTEXT expects exactly one argument"));
                }
            };
            let id = format!("{:08x}", state.counter.fetch_add(1, Ordering::SeqCst) + 1);
            let context = Arc::new(LockContext {
                id: id.clone(),
                shared,
                keys: Mutex::new(Vec::new()),
            });
            state.contexts.insert(id.clone(), Arc::clone(&context));
            client_contexts.insert(id.clone(), context);
            if state.config.debug {
                debug!(context = %id, shared, "created context");
            }
            write_response(state, output, request_id, &[proto::CMD_CONTEXT, &id])
        }
        proto::CMD_ACQUIRE => {
            let Some(context_id) = args.next() else {
                return Err(IpcError::protocol("ACQUIRE expects a context id"));
            };
            let Some(context) = state.contexts.get(&context_id).map(|c| Arc::clone(c.value()))
            else {
                return Err(IpcError::protocol(format!("unknown context `{context_id}`")));
            };
            let keys: Vec<String> = args.collect();
            if state.config.debug {
                debug!(context = %context.id, keys = keys.len(), "acquire");
            }
            let pending = state.acquire(&context, keys);
            if pending.is_empty() {
                write_response(state, output, request_id, &[proto::CMD_ACQUIRE])
            } else {
                // Reply from whichever thread completes the last grant. A
                // cancelled wait (context closed, daemon stopping) drops the
                // grant channel and the reply is silently skipped.
                let state = Arc::clone(state);
                let output = Arc::clone(output);
                thread::spawn(move || {
                    for wait in pending {
                        if wait.recv().is_err() {
                            debug!(context = %context.id, "acquire cancelled");
                            return;
                        }
                    }
                    if let Err(e) = write_response(&state, &output, request_id, &[proto::CMD_ACQUIRE])
                    {
                        if !state.closing() {
                            error!("error writing lock response: {e}");
                        }
                        output
                            .lock()
                            .expect("connection output poisoned")
                            .shutdown();
                    }
                });
                Ok(())
            }
        }
        proto::CMD_CLOSE => {
            let context_id = match (args.next(), args.next()) {
                (Some(id), None) => id,
                _ => return Err(IpcError::protocol("CLOSE expects exactly one argument")),
            };
            client_contexts.remove(&context_id);
            let Some((_, context)) = state.contexts.remove(&context_id) else {
                return Err(IpcError::protocol(format!("unknown context `{context_id}`")));
            };
            state.release_context(&context);
            if state.config.debug {
                debug!(context = %context.id, "closed context");
            }
            write_response(state, output, request_id, &[proto::CMD_CLOSE])
        }
        proto::CMD_STOP => {
            if args.next().is_some() {
                return Err(IpcError::protocol("STOP expects no arguments"));
            }
            write_response(state, output, request_id, &[proto::CMD_STOP])?;
            state.initiate_shutdown();
            Ok(())
        }
        other => Err(IpcError::protocol(format!("unknown request `{other}`"))),
    }
}

fn write_response(
    state: &ServerState,
    output: &Arc<Mutex<IpcStream>>,
    request_id: u32,
    args: &[&str],
) -> Result<(), IpcError> {
    let mut stream = output.lock().expect("connection output poisoned");
    proto::write_frame(&mut *stream, request_id, args)?;
    state.touch();
    Ok(())
}

// =============================================================================
// Daemon entry points
// =============================================================================

/// Runs the daemon in the foreground (`quarry daemon run`). SIGTERM/SIGINT
/// trigger a graceful shutdown.
pub fn run_daemon(config: IpcConfig) -> Result<(), IpcError> {
    let server = LockServer::bind(config)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted));
    {
        let handle = server.shutdown_handle();
        let interrupted = Arc::clone(&interrupted);
        thread::spawn(move || {
            while !interrupted.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
            }
            info!("shutdown signal received");
            handle.shutdown();
        });
    }

    server.run()
}

/// Entry point for a daemon spawned by a client (`quarry daemon serve`).
///
/// Binds, dials the client's one-shot rendezvous endpoint, writes the nonce
/// and the final listening address, then serves.
pub fn run_spawned(
    family: SocketFamily,
    rendezvous: &str,
    nonce: &str,
    mut config: IpcConfig,
) -> Result<(), IpcError> {
    config.family = family;

    // The spawning client shares our process group; its Ctrl-C must not
    // take the daemon down with it.
    let _ = signal_hook::flag::register(
        signal_hook::consts::SIGINT,
        Arc::new(AtomicBool::new(false)),
    );

    let server = LockServer::bind(config)?;

    let mut stream = connect_address(rendezvous)?;
    proto::write_string(&mut stream, nonce)?;
    proto::write_string(&mut stream, server.local_address())?;
    drop(stream);

    server.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(id: &str, shared: bool) -> Arc<LockContext> {
        Arc::new(LockContext {
            id: id.to_string(),
            shared,
            keys: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn shared_holders_coexist() {
        let mut state = LockState::default();
        let a = context("a", true);
        let b = context("b", true);
        assert!(lock(&mut state, &a).is_none());
        assert!(lock(&mut state, &b).is_none());
        assert_eq!(state.holders.len(), 2);
    }

    #[test]
    fn exclusive_waits_behind_shared() {
        let mut state = LockState::default();
        let a = context("a", true);
        let b = context("b", true);
        let c = context("c", false);
        assert!(lock(&mut state, &a).is_none());
        assert!(lock(&mut state, &b).is_none());
        let wait = lock(&mut state, &c).expect("exclusive must wait");
        assert!(wait.try_recv().is_err());

        unlock(&mut state, &a);
        assert!(wait.try_recv().is_err(), "still one shared holder");
        unlock(&mut state, &b);
        wait.recv().expect("granted after all shared released");
        assert_eq!(state.holders.len(), 1);
        assert_eq!(state.holders[0].id, "c");
    }

    #[test]
    fn shared_waits_behind_exclusive_and_promotes_as_batch() {
        let mut state = LockState::default();
        let x = context("x", false);
        let a = context("a", true);
        let b = context("b", true);
        assert!(lock(&mut state, &x).is_none());
        let wait_a = lock(&mut state, &a).expect("waits");
        let wait_b = lock(&mut state, &b).expect("waits");

        unlock(&mut state, &x);
        wait_a.recv().expect("batch grant a");
        wait_b.recv().expect("batch grant b");
        assert_eq!(state.holders.len(), 2);
        assert!(state.waiters.is_empty());
    }

    #[test]
    fn exclusive_waiters_are_fifo() {
        let mut state = LockState::default();
        let x = context("x", false);
        let y = context("y", false);
        let z = context("z", false);
        assert!(lock(&mut state, &x).is_none());
        let wait_y = lock(&mut state, &y).expect("waits");
        let wait_z = lock(&mut state, &z).expect("waits");

        unlock(&mut state, &x);
        wait_y.recv().expect("y first");
        assert!(wait_z.try_recv().is_err(), "z still queued behind y");
        unlock(&mut state, &y);
        wait_z.recv().expect("z after y");
    }

    #[test]
    fn shared_batch_stops_at_exclusive_waiter() {
        let mut state = LockState::default();
        let x = context("x", false);
        let a = context("a", true);
        let e = context("e", false);
        let b = context("b", true);
        assert!(lock(&mut state, &x).is_none());
        let wait_a = lock(&mut state, &a).expect("waits");
        let wait_e = lock(&mut state, &e).expect("waits");
        let wait_b = lock(&mut state, &b).expect("waits");

        unlock(&mut state, &x);
        wait_a.recv().expect("head shared granted");
        assert!(wait_e.try_recv().is_err(), "exclusive incompatible with a");
        assert!(wait_b.try_recv().is_err(), "b queued behind exclusive");

        unlock(&mut state, &a);
        wait_e.recv().expect("exclusive granted alone");
        unlock(&mut state, &e);
        wait_b.recv().expect("trailing shared granted");
    }

    #[test]
    fn cancelled_waiter_is_removed_without_grant() {
        let mut state = LockState::default();
        let x = context("x", false);
        let y = context("y", false);
        let z = context("z", false);
        assert!(lock(&mut state, &x).is_none());
        let wait_y = lock(&mut state, &y).expect("waits");
        let wait_z = lock(&mut state, &z).expect("waits");

        // y gives up before ever holding the key
        unlock(&mut state, &y);
        assert!(wait_y.recv().is_err(), "cancelled wait fails, not grants");

        unlock(&mut state, &x);
        wait_z.recv().expect("z unaffected by the cancellation");
    }
}

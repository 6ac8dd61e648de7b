//! Lock daemon client: discovery, auto-spawn, request multiplexing.
//!
//! A connection owns a demultiplexing reader thread; callers block on a
//! one-shot channel keyed by request id, so many requests (notably slow
//! `ACQUIRE`s) can be outstanding at once on a single connection.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Sender, bounded};
use rand::Rng;
use tracing::debug;

use crate::config::{self, IpcConfig};
use crate::ipc::proto;
use crate::ipc::server::LockServer;
use crate::ipc::{DaemonInfo, IpcError, IpcListener, IpcStream, SocketFamily, connect_address};
use crate::paths;

const SPAWN_DEADLINE: Duration = Duration::from_secs(30);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<u32, Sender<Vec<String>>>>>;

/// A connection to the lock daemon.
pub struct LockClient {
    output: Arc<Mutex<IpcStream>>,
    pending: PendingMap,
    next_request: AtomicU32,
}

impl LockClient {
    /// Connects to the daemon, spawning one if none is reachable. With
    /// `no_fork` set the daemon runs on an in-process thread instead.
    pub fn connect(config: &IpcConfig) -> Result<Self, IpcError> {
        if config.no_fork {
            let server = LockServer::bind(config.clone())?;
            let address = server.local_address().to_string();
            thread::spawn(move || {
                let _ = server.run();
            });
            return Self::connect_to(&address);
        }

        match Self::connect_existing(config) {
            Ok(client) => Ok(client),
            Err(e) => {
                debug!("no reachable lock daemon ({e}), spawning one");
                Self::spawn_and_connect(config)
            }
        }
    }

    /// Connects to an explicit daemon address.
    pub fn connect_to(address: &str) -> Result<Self, IpcError> {
        Self::from_stream(connect_address(address)?)
    }

    fn connect_existing(config: &IpcConfig) -> Result<Self, IpcError> {
        if let Some(info) = read_daemon_meta()
            && let Ok(stream) = connect_address(&info.address)
        {
            return Self::from_stream(stream);
        }
        if config.family == SocketFamily::Unix {
            let address = crate::ipc::format_unix_address(&paths::socket_path());
            return Self::connect_to(&address);
        }
        Err(IpcError::unavailable("no daemon metadata found"))
    }

    fn from_stream(stream: IpcStream) -> Result<Self, IpcError> {
        let reader = stream.try_clone()?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        {
            let pending = Arc::clone(&pending);
            thread::spawn(move || reader_loop(reader, pending));
        }
        Ok(Self {
            output: Arc::new(Mutex::new(stream)),
            pending,
            next_request: AtomicU32::new(0),
        })
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Opens a lock ownership scope on the daemon.
    pub fn new_context(&self, shared: bool) -> Result<String, IpcError> {
        let flag = if shared { "true" } else { "false" };
        let mut response = self.request(&[proto::CMD_CONTEXT, flag])?;
        self.expect(proto::CMD_CONTEXT, &response)?;
        if response.len() != 2 {
            return Err(IpcError::protocol("CONTEXT response missing context id"));
        }
        Ok(response.remove(1))
    }

    /// Acquires all `keys` for the context, blocking until every key is
    /// granted. Keys are sorted before sending so that independent clients
    /// queue in a deadlock-free order.
    pub fn acquire(&self, context_id: &str, keys: &[&str]) -> Result<(), IpcError> {
        let mut sorted: Vec<&str> = keys.to_vec();
        sorted.sort_unstable();
        let mut args = Vec::with_capacity(2 + sorted.len());
        args.push(proto::CMD_ACQUIRE);
        args.push(context_id);
        args.extend(sorted);
        let response = self.request(&args)?;
        self.expect(proto::CMD_ACQUIRE, &response)
    }

    /// Closes the context, releasing every key it holds or waits on.
    pub fn close_context(&self, context_id: &str) -> Result<(), IpcError> {
        let response = self.request(&[proto::CMD_CLOSE, context_id])?;
        self.expect(proto::CMD_CLOSE, &response)
    }

    /// Asks the daemon to shut down.
    pub fn stop(&self) -> Result<(), IpcError> {
        let response = self.request(&[proto::CMD_STOP])?;
        self.expect(proto::CMD_STOP, &response)
    }

    /// Closes the connection. The daemon treats this as an implicit `CLOSE`
    /// of every context opened on it; requests still in flight fail with
    /// [`IpcError::Unavailable`].
    pub fn close(&self) {
        self.output
            .lock()
            .expect("client output poisoned")
            .shutdown();
    }

    fn request(&self, args: &[&str]) -> Result<Vec<String>, IpcError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending
            .lock()
            .expect("pending request map poisoned")
            .insert(request_id, tx);

        {
            let mut output = self.output.lock().expect("client output poisoned");
            if let Err(e) = proto::write_frame(&mut *output, request_id, args) {
                self.pending
                    .lock()
                    .expect("pending request map poisoned")
                    .remove(&request_id);
                return Err(e);
            }
        }

        rx.recv()
            .map_err(|_| IpcError::unavailable("connection to lock daemon closed"))
    }

    fn expect(&self, command: &str, response: &[String]) -> Result<(), IpcError> {
        match response.first() {
            Some(echoed) if echoed == command => Ok(()),
            Some(other) => Err(IpcError::protocol(format!(
                "expected {command} response, got `{other}`"
            ))),
            None => Err(IpcError::protocol(format!("empty {command} response"))),
        }
    }

    // =========================================================================
    // Auto-spawn
    // =========================================================================

    fn spawn_and_connect(config: &IpcConfig) -> Result<Self, IpcError> {
        let lock_path = paths::spawn_lock_path();
        maybe_remove_stale_lock(&lock_path);

        let we_spawned = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .is_ok();

        if we_spawned {
            let result = Self::spawn_daemon(config);
            let _ = fs::remove_file(&lock_path);
            return result;
        }

        // Another client is spawning; wait for the daemon to become
        // reachable instead of racing a second fork.
        let deadline = Instant::now() + SPAWN_DEADLINE;
        let mut backoff = Duration::from_millis(50);
        loop {
            match Self::connect_existing(config) {
                Ok(client) => return Ok(client),
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_millis(200));
                }
                Err(_) => {
                    return Err(IpcError::unavailable(
                        "timed out waiting for another client's daemon spawn",
                    ));
                }
            }
        }
    }

    fn spawn_daemon(config: &IpcConfig) -> Result<Self, IpcError> {
        // One-shot rendezvous endpoint; the daemon dials back exactly once
        // with the nonce and its final listening address.
        let rendezvous = bind_rendezvous(config.family)?;
        let rendezvous_address = rendezvous.local_address()?;
        let nonce = format!("{:016x}", rand::thread_rng().r#gen::<u64>());

        let mut cmd = daemon_command();
        cmd.arg(config.family.as_str())
            .arg(&rendezvous_address)
            .arg(&nonce)
            .env(
                config::ENV_IDLE_TIMEOUT,
                format!("{}ms", config.idle_timeout.as_millis()),
            )
            .env(config::ENV_DEBUG, config.debug.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn()
            .map_err(|e| IpcError::unavailable(format!("failed to spawn daemon: {e}")))?;

        let address = await_handshake(&rendezvous, &nonce)?;
        rendezvous.unlink();
        Self::connect_to(&address)
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.output
            .lock()
            .expect("client output poisoned")
            .shutdown();
    }
}

fn reader_loop(mut reader: IpcStream, pending: PendingMap) {
    loop {
        match proto::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                let sender = pending
                    .lock()
                    .expect("pending request map poisoned")
                    .remove(&frame.request_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(frame.args);
                    }
                    None => debug!(
                        request_id = frame.request_id,
                        "response for unknown request"
                    ),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Dropping the senders fails every request still in flight.
    pending
        .lock()
        .expect("pending request map poisoned")
        .clear();
}

fn daemon_command() -> Command {
    if let Ok(exe) = std::env::current_exe() {
        let mut cmd = Command::new(exe);
        cmd.arg("daemon").arg("serve");
        return cmd;
    }

    let mut cmd = Command::new("quarry");
    cmd.arg("daemon").arg("serve");
    cmd
}

fn bind_rendezvous(family: SocketFamily) -> Result<IpcListener, IpcError> {
    match family {
        SocketFamily::Unix => {
            let dir = paths::ensure_runtime_dir()?;
            let name = format!(
                "handshake-{}-{:08x}.sock",
                std::process::id(),
                rand::thread_rng().r#gen::<u32>()
            );
            Ok(IpcListener::bind_unix(&dir.join(name))?)
        }
        SocketFamily::Inet => Ok(IpcListener::bind(SocketFamily::Inet)?),
    }
}

fn await_handshake(rendezvous: &IpcListener, nonce: &str) -> Result<String, IpcError> {
    rendezvous.set_nonblocking(true)?;
    let deadline = Instant::now() + SPAWN_DEADLINE;
    let stream = loop {
        match rendezvous.accept() {
            Ok(stream) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(IpcError::unavailable(
                        "timed out waiting for spawned daemon handshake",
                    ));
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(IpcError::Io(e)),
        }
    };

    let _ = stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT));
    let mut stream = stream;
    let echoed = proto::read_string(&mut stream)?;
    if echoed != nonce {
        return Err(IpcError::protocol("daemon handshake nonce mismatch"));
    }
    proto::read_string(&mut stream)
}

fn read_daemon_meta() -> Option<DaemonInfo> {
    let contents = fs::read_to_string(meta_path_checked()?).ok()?;
    serde_json::from_str(&contents).ok()
}

fn meta_path_checked() -> Option<PathBuf> {
    let path = paths::meta_path();
    path.exists().then_some(path)
}

fn maybe_remove_stale_lock(lock_path: &PathBuf) {
    if let Ok(meta) = fs::metadata(lock_path)
        && let Ok(modified) = meta.modified()
        && let Ok(age) = modified.elapsed()
        && age > Duration::from_secs(10)
    {
        let _ = fs::remove_file(lock_path);
    }
}

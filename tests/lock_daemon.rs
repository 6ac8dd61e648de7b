//! Integration tests for the lock daemon, run in-process over loopback TCP
//! so parallel test binaries cannot collide on a socket path.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use quarry::config::IpcConfig;
use quarry::ipc::{LockClient, LockServer, SocketFamily};

struct DaemonFixture {
    address: String,
    server_thread: Option<thread::JoinHandle<()>>,
    shutdown: quarry::ipc::server::ShutdownHandle,
}

impl DaemonFixture {
    fn start() -> Self {
        Self::start_with_idle_timeout(Duration::from_secs(60))
    }

    fn start_with_idle_timeout(idle_timeout: Duration) -> Self {
        let config = IpcConfig {
            idle_timeout,
            family: SocketFamily::Inet,
            no_fork: true,
            debug: true,
        };
        let server = LockServer::bind(config).expect("bind server");
        let address = server.local_address().to_string();
        let shutdown = server.shutdown_handle();
        let server_thread = thread::spawn(move || {
            server.run().expect("server run");
        });
        Self {
            address,
            server_thread: Some(server_thread),
            shutdown,
        }
    }

    fn client(&self) -> LockClient {
        LockClient::connect_to(&self.address).expect("connect client")
    }

    fn join(mut self) {
        if let Some(handle) = self.server_thread.take() {
            handle.join().expect("server thread");
        }
    }
}

impl Drop for DaemonFixture {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.server_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawns `f` and asserts it stays blocked for at least `grace`.
fn assert_blocks<F>(grace: Duration, f: F) -> (thread::JoinHandle<()>, Arc<AtomicBool>)
where
    F: FnOnce() + Send + 'static,
{
    let done = Arc::new(AtomicBool::new(false));
    let done_clone = Arc::clone(&done);
    let handle = thread::spawn(move || {
        f();
        done_clone.store(true, Ordering::SeqCst);
    });
    thread::sleep(grace);
    assert!(!done.load(Ordering::SeqCst), "operation should still block");
    (handle, done)
}

#[test]
fn shared_holders_do_not_block_each_other() {
    let daemon = DaemonFixture::start();

    let a = daemon.client();
    let b = daemon.client();

    let ctx_a = a.new_context(true).expect("context a");
    let ctx_b = b.new_context(true).expect("context b");

    a.acquire(&ctx_a, &["artifact:org/demo"]).expect("a acquires");
    b.acquire(&ctx_b, &["artifact:org/demo"]).expect("b acquires");

    a.close_context(&ctx_a).expect("close a");
    b.close_context(&ctx_b).expect("close b");
}

#[test]
fn exclusive_waits_for_all_shared_holders() {
    let daemon = DaemonFixture::start();

    let a = daemon.client();
    let b = daemon.client();
    let c = Arc::new(daemon.client());

    let ctx_a = a.new_context(true).expect("context a");
    let ctx_b = b.new_context(true).expect("context b");
    let ctx_c = c.new_context(false).expect("context c");

    a.acquire(&ctx_a, &["k"]).expect("a acquires");
    b.acquire(&ctx_b, &["k"]).expect("b acquires");

    let c_worker = Arc::clone(&c);
    let (handle, done) = assert_blocks(Duration::from_millis(200), move || {
        c_worker.acquire(&ctx_c, &["k"]).expect("c acquires");
    });

    a.close_context(&ctx_a).expect("close a");
    thread::sleep(Duration::from_millis(100));
    assert!(
        !done.load(Ordering::SeqCst),
        "one shared holder left, exclusive must still wait"
    );

    b.close_context(&ctx_b).expect("close b");
    handle.join().expect("c grant");
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn multi_key_acquire_is_granted_atomically() {
    let daemon = DaemonFixture::start();

    let a = daemon.client();
    let b = Arc::new(daemon.client());

    let ctx_a = a.new_context(false).expect("context a");
    let ctx_b = b.new_context(false).expect("context b");

    a.acquire(&ctx_a, &["k2"]).expect("a acquires k2");

    // b needs both keys; k1 is free but the grant must wait for k2
    let b_worker = Arc::clone(&b);
    let (handle, _done) = assert_blocks(Duration::from_millis(200), move || {
        b_worker.acquire(&ctx_b, &["k2", "k1"]).expect("b acquires both");
    });

    a.close_context(&ctx_a).expect("close a");
    handle.join().expect("b granted both keys");
}

#[test]
fn cancelled_waiter_does_not_delay_later_waiters() {
    let daemon = DaemonFixture::start();

    let holder = daemon.client();
    let cancelled = Arc::new(daemon.client());
    let successor = Arc::new(daemon.client());

    let ctx_holder = holder.new_context(false).expect("holder context");
    let ctx_cancelled = cancelled.new_context(false).expect("cancelled context");
    let ctx_successor = successor.new_context(false).expect("successor context");

    holder.acquire(&ctx_holder, &["k"]).expect("holder acquires");

    // This wait is abandoned below; the daemon silently drops its grant, so
    // the acquire call only returns once the connection goes away.
    let cancelled_worker = Arc::clone(&cancelled);
    let ctx_cancelled_for_worker = ctx_cancelled.clone();
    let (cancelled_handle, cancelled_done) =
        assert_blocks(Duration::from_millis(100), move || {
            let _ = cancelled_worker.acquire(&ctx_cancelled_for_worker, &["k"]);
        });

    let successor_worker = Arc::clone(&successor);
    let (successor_handle, _) = assert_blocks(Duration::from_millis(100), move || {
        successor_worker
            .acquire(&ctx_successor, &["k"])
            .expect("successor acquires");
    });

    cancelled.close_context(&ctx_cancelled).expect("cancel wait");
    assert!(
        !cancelled_done.load(Ordering::SeqCst),
        "cancelled waiter must not receive an acquire response"
    );

    holder.close_context(&ctx_holder).expect("release");
    successor_handle.join().expect("successor granted");

    // Tearing down the cancelled client's connection unblocks its thread.
    cancelled.close();
    cancelled_handle.join().expect("cancelled thread ends");
}

#[test]
fn client_disconnect_releases_held_keys() {
    let daemon = DaemonFixture::start();

    let a = daemon.client();
    let ctx_a = a.new_context(false).expect("context a");
    a.acquire(&ctx_a, &["k1", "k2", "k3"]).expect("a acquires");
    drop(a);

    // The acquire queues behind the dying connection's holds and is granted
    // once the daemon's implicit close releases them.
    let b = daemon.client();
    let ctx_b = b.new_context(false).expect("context b");
    b.acquire(&ctx_b, &["k1", "k2", "k3"])
        .expect("all three keys released by the disconnect");
}

#[test]
fn malformed_frame_closes_only_that_connection() {
    let daemon = DaemonFixture::start();

    let healthy = daemon.client();
    let ctx = healthy.new_context(true).expect("healthy context");

    // Raw connection sending an absurd argument count.
    let addr = daemon
        .address
        .strip_prefix("inet:")
        .expect("inet address")
        .to_string();
    let mut rogue = TcpStream::connect(&addr).expect("rogue connect");
    rogue.write_all(&1u32.to_be_bytes()).expect("request id");
    rogue.write_all(&u32::MAX.to_be_bytes()).expect("bogus count");
    rogue.flush().expect("flush");

    // The daemon drops the rogue connection...
    rogue
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let mut buf = [0u8; 1];
    use std::io::Read;
    match rogue.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected EOF on rogue connection, got {other:?}"),
    }

    // ...while the healthy one keeps working.
    healthy.acquire(&ctx, &["k"]).expect("healthy still served");
    healthy.close_context(&ctx).expect("close");
}

#[test]
fn stop_command_shuts_the_daemon_down() {
    let daemon = DaemonFixture::start();

    let client = daemon.client();
    client.stop().expect("stop acknowledged");

    let address = daemon.address.clone();
    daemon.join();

    assert!(
        LockClient::connect_to(&address).is_err(),
        "daemon must not accept connections after STOP"
    );
}

#[test]
fn idle_expiry_fires_only_without_clients() {
    let daemon = DaemonFixture::start_with_idle_timeout(Duration::from_millis(300));

    // An idle but connected client holds expiry off.
    let client = daemon.client();
    thread::sleep(Duration::from_millis(600));
    let ctx = client.new_context(true).expect("still serving");
    client.close_context(&ctx).expect("close");
    drop(client);

    // With no clients left, the daemon expires on its own.
    daemon.join();
}

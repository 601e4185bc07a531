//! Spawn and migrate protocol tests: byte-level framing against a manual
//! child, and round trips through the child-side receiver.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

use common::InertProfile;
use umbra::spawn::{accept_handoff, Runnable};
use umbra::{EngineConfig, Runtime, Session, UmbraError};

struct MockChild {
    released: Arc<AtomicBool>,
}

impl MockChild {
    fn new() -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        (
            MockChild {
                released: released.clone(),
            },
            released,
        )
    }
}

impl Runnable for MockChild {
    fn start(&mut self) -> umbra::Result<()> {
        Ok(())
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

fn unique_name(tag: &str) -> String {
    format!("umbra-{tag}-{}-{:x}", std::process::id(), rand_suffix())
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64
}

fn pipe_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{name}.{:x}", std::process::id()))
}

/// Rolling XOR matching the handoff stream keying.
struct Xor {
    key: Vec<u8>,
    pos: usize,
}

impl Xor {
    fn new(key: &str) -> Self {
        Xor {
            key: key.as_bytes().to_vec(),
            pos: 0,
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for b in data {
            *b ^= self.key[self.pos % self.key.len()];
            self.pos += 1;
        }
    }
}

fn client_session(profile_bytes: &[u8]) -> std::sync::Arc<Session> {
    let profile = Arc::new(InertProfile {
        bytes: profile_bytes.to_vec(),
    });
    Session::connect_with(Runtime::new(EngineConfig::default()), profile).unwrap()
}

#[tokio::test]
async fn migrate_framing_is_byte_exact() {
    common::init_tracing();
    let name = unique_name("mg");
    let path = pipe_path(&name);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    let session = client_session(b"profile-alpha");
    let device = *session.device().as_bytes();

    let key = name.clone();
    let child = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut rx = Xor::new(&key);
        let mut tx = Xor::new(&key);

        let mut head = [0u8; 3];
        conn.read_exact(&mut head).await.unwrap();
        rx.apply(&mut head);
        assert_eq!(head, [0x00, 0x07, 0x0D], "migrate header with job 7");

        let mut len = [0u8; 8];
        conn.read_exact(&mut len).await.unwrap();
        rx.apply(&mut len);
        let n = u64::from_be_bytes(len) as usize;
        assert_eq!(n, b"profile-alpha".len());

        let mut profile = vec![0u8; n];
        conn.read_exact(&mut profile).await.unwrap();
        rx.apply(&mut profile);
        assert_eq!(profile, b"profile-alpha");

        let mut id = [0u8; 20];
        conn.read_exact(&mut id).await.unwrap();
        rx.apply(&mut id);
        assert_eq!(id, device);

        let mut proxy_len = [0u8; 8];
        conn.read_exact(&mut proxy_len).await.unwrap();
        rx.apply(&mut proxy_len);
        assert_eq!(u64::from_be_bytes(proxy_len), 0, "no proxy profile");

        let mut ok = *b"OK";
        tx.apply(&mut ok);
        conn.write_all(&ok).await.unwrap();
        conn.flush().await.unwrap();

        let mut trailer = [0u8; 2];
        conn.read_exact(&mut trailer).await.unwrap();
        rx.apply(&mut trailer);
        assert_eq!(&trailer, b"OK", "parent confirms after the ack");
    });

    let shutdown_fired = Arc::new(AtomicBool::new(false));
    let flag = shutdown_fired.clone();
    session.on_shutdown(move |_| {
        flag.store(true, Ordering::SeqCst);
    });

    let (mut run, released) = MockChild::new();
    let pid = session.migrate(false, &name, 7, &mut run).await.unwrap();
    assert_eq!(pid, std::process::id());

    child.await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .expect("migrated session must close");
    // The loop observes the migration on its next wake and finishes the
    // shutdown chain.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !session.is_closed() {
        assert!(tokio::time::Instant::now() < deadline, "session never closed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released.load(Ordering::SeqCst), "child handle is released");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !shutdown_fired.load(Ordering::SeqCst),
        "shutdown callback must not run for a migrated session"
    );
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn spawn_hands_profile_to_child() {
    common::init_tracing();
    let name = unique_name("sp");
    let child = tokio::spawn({
        let name = name.clone();
        async move { accept_handoff(&name, Duration::from_secs(5)).await }
    });
    // Give the child a moment to bind the pipe.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = client_session(b"profile-beta");
    let (mut run, _released) = MockChild::new();
    let pid = session.spawn(&name, &mut run).await.unwrap();
    assert_eq!(pid, std::process::id());

    let handoff = child.await.unwrap().unwrap();
    assert_eq!(handoff.job, 0);
    assert_eq!(handoff.profile, b"profile-beta");
    assert!(handoff.identity.is_none());
    assert!(handoff.proxy.is_none());

    // A spawn leaves the parent session running.
    assert!(session.is_active());
    session.close().await;
}

#[tokio::test]
async fn migrate_hands_identity_to_child() {
    common::init_tracing();
    let name = unique_name("mi");
    let child = tokio::spawn({
        let name = name.clone();
        async move { accept_handoff(&name, Duration::from_secs(5)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let session = client_session(b"profile-gamma");
    let (mut run, _released) = MockChild::new();
    session.migrate(false, &name, 9, &mut run).await.unwrap();

    let handoff = child.await.unwrap().unwrap();
    assert_eq!(handoff.job, 9);
    assert_eq!(handoff.profile, b"profile-gamma");
    assert_eq!(handoff.identity, Some(session.device()));
    assert!(handoff.proxy.is_none());

    tokio::time::timeout(Duration::from_secs(5), session.wait())
        .await
        .expect("migrated session must close");
}

#[tokio::test]
async fn spawn_times_out_without_a_child() {
    common::init_tracing();
    let session = client_session(b"profile-delta");
    let (mut run, _) = MockChild::new();
    let err = session
        .spawn_profile(
            &unique_name("none"),
            None,
            Duration::from_millis(300),
            &mut run,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UmbraError::NoConn));
    assert!(session.is_active(), "a failed spawn leaves the session up");
    assert!(!session.is_moving());
    session.close().await;
}

#[tokio::test]
async fn empty_pipe_name_is_refused() {
    common::init_tracing();
    let session = client_session(b"profile-eps");
    let (mut run, _) = MockChild::new();
    assert!(matches!(
        session.spawn("", &mut run).await.unwrap_err(),
        UmbraError::InvalidName
    ));
    assert!(matches!(
        session.migrate(false, "", 3, &mut run).await.unwrap_err(),
        UmbraError::InvalidName
    ));
    session.close().await;
}

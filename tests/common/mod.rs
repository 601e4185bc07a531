//! In-memory profiles and transports shared by the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use umbra::profile::{Accepter, BoxFuture, Link, Profile, ProfileMarshal, Transport};
use umbra::UmbraError;

/// An in-memory network: client dials produce transport pairs, the server
/// half lands in the accepter's queue.
pub struct MemNet {
    tx: mpsc::UnboundedSender<DuplexStream>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DuplexStream>>>,
}

impl MemNet {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(MemNet {
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }
}

/// Profile over a [`MemNet`], with adjustable timing.
pub struct MemProfile {
    net: Arc<MemNet>,
    pub sleep: Duration,
    pub jitter: i8,
}

impl MemProfile {
    pub fn new(net: &Arc<MemNet>, sleep: Duration) -> Arc<Self> {
        Arc::new(MemProfile {
            net: net.clone(),
            sleep,
            jitter: 0,
        })
    }
}

impl Profile for MemProfile {
    fn next(&self) -> Link {
        Link::to("mem")
    }

    fn sleep(&self) -> Duration {
        self.sleep
    }

    fn jitter(&self) -> i8 {
        self.jitter
    }

    fn connect<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Transport>>> {
        Box::pin(async {
            let (a, b) = tokio::io::duplex(1 << 16);
            self.net
                .tx
                .send(b)
                .map_err(|_| UmbraError::Transport(std::io::ErrorKind::NotConnected.into()))?;
            Ok(Box::new(a) as Box<dyn Transport>)
        })
    }

    fn listen<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Accepter>>> {
        Box::pin(async {
            let rx = self
                .net
                .rx
                .lock()
                .unwrap()
                .take()
                .expect("listen called twice on one MemNet");
            Ok(Box::new(MemAccepter { rx }) as Box<dyn Accepter>)
        })
    }
}

struct MemAccepter {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Accepter for MemAccepter {
    fn accept(&mut self) -> BoxFuture<'_, umbra::Result<(Box<dyn Transport>, String)>> {
        Box::pin(async {
            match self.rx.recv().await {
                Some(s) => Ok((Box::new(s) as Box<dyn Transport>, "mem".to_string())),
                None => Err(UmbraError::Transport(
                    std::io::ErrorKind::BrokenPipe.into(),
                )),
            }
        })
    }

    fn local_addr(&self) -> String {
        "mem".to_string()
    }
}

/// Profile whose dials always fail, for error-budget tests.
pub struct FailProfile {
    pub sleep: Duration,
}

impl Profile for FailProfile {
    fn next(&self) -> Link {
        Link::to("unreachable")
    }

    fn sleep(&self) -> Duration {
        self.sleep
    }

    fn connect<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Transport>>> {
        Box::pin(async {
            Err(UmbraError::Transport(
                std::io::ErrorKind::ConnectionRefused.into(),
            ))
        })
    }

    fn listen<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Accepter>>> {
        Box::pin(async {
            Err(UmbraError::Transport(
                std::io::ErrorKind::Unsupported.into(),
            ))
        })
    }
}

/// A marshalable [`FailProfile`], for spawn/migrate tests.
pub struct InertProfile {
    pub bytes: Vec<u8>,
}

impl Profile for InertProfile {
    fn next(&self) -> Link {
        Link::to("unreachable")
    }

    fn sleep(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn connect<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Transport>>> {
        Box::pin(async {
            Err(UmbraError::Transport(
                std::io::ErrorKind::ConnectionRefused.into(),
            ))
        })
    }

    fn listen<'a>(&'a self, _: &'a str) -> BoxFuture<'a, umbra::Result<Box<dyn Accepter>>> {
        Box::pin(async {
            Err(UmbraError::Transport(
                std::io::ErrorKind::Unsupported.into(),
            ))
        })
    }
}

impl ProfileMarshal for InertProfile {
    fn marshal(&self) -> umbra::Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

/// Route engine tracing to the test output. Honors `RUST_LOG`; safe to
/// call from every test.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// Poll `f` until it returns `Some` or the deadline passes.
pub async fn wait_for<T, F: FnMut() -> Option<T>>(mut f: F, limit: Duration) -> T {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(v) = f() {
            return v;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

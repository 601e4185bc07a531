//! Server endpoint: accepts inbound transports and drives the server half
//! of every session.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::device::Machine;
use crate::events::EventQueue;
use crate::profile::{Accepter, Link, Profile, Transport};
use crate::protocol::packet::Packet;
use crate::protocol::{flags, ids, read_packet, write_packet};
use crate::runtime::Runtime;
use crate::session::Session;

/// How long an inbound connection may idle before its first packet.
const ACCEPT_DEADLINE: Duration = Duration::from_secs(30);

pub type SessionFn = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Accepts inbound dials, instantiates server-side sessions keyed by
/// device hash, and dispatches their events.
pub struct Listener {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    runtime: Runtime,
    profile: Arc<dyn Profile>,
    link: Mutex<Link>,
    sessions: DashMap<u64, Arc<Session>>,
    events: EventQueue,
    new_cb: Mutex<Option<SessionFn>>,
    closing: AtomicBool,
    ctx: CancellationToken,
    done: CancellationToken,
}

/// Non-owning back-reference a server-side session keeps to its listener.
#[derive(Clone)]
pub(crate) struct ListenerHandle {
    inner: Weak<Shared>,
}

#[cfg(test)]
pub(crate) fn detached_handle() -> ListenerHandle {
    ListenerHandle { inner: Weak::new() }
}

impl ListenerHandle {
    /// Deregister a session. Skipped while the listener itself is going
    /// down, which tears the registry as one unit.
    pub fn remove(&self, hash: u64) {
        if let Some(s) = self.inner.upgrade() {
            if !s.closing.load(Ordering::Acquire) {
                s.sessions.remove(&hash);
            }
        }
    }
}

impl Listener {
    /// Bind `host` through the profile and start accepting sessions.
    pub async fn bind(
        runtime: Runtime,
        name: impl Into<String>,
        host: &str,
        profile: Arc<dyn Profile>,
    ) -> crate::Result<Self> {
        let link = profile.next();
        let bind = match host {
            "" => link.host.clone().unwrap_or_default(),
            h => h.to_string(),
        };
        let accepter = profile.listen(&bind).await?;
        let shared = Arc::new(Shared {
            name: name.into(),
            runtime,
            profile,
            link: Mutex::new(link),
            sessions: DashMap::new(),
            events: EventQueue::start(),
            new_cb: Mutex::new(None),
            closing: AtomicBool::new(false),
            ctx: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        tracing::info!(listener = %shared.name, addr = %accepter.local_addr(), "listener bound");
        tokio::spawn(accept_loop(shared.clone(), accepter));
        Ok(Listener { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Invoked (serialized) whenever a new device registers.
    pub fn on_session<F: Fn(&Arc<Session>) + Send + Sync + 'static>(&self, f: F) {
        *self.shared.new_cb.lock().unwrap() = Some(Box::new(f));
    }

    /// The session registered for the supplied device hash, if any.
    pub fn session(&self, hash: u64) -> Option<Arc<Session>> {
        self.shared.sessions.get(&hash).map(|s| s.value().clone())
    }

    /// All sessions currently registered.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Stop accepting, close every session, and drop the registry.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            self.shared.done.cancelled().await;
            return;
        }
        self.shared.ctx.cancel();
        let all: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        for s in all {
            s.close().await;
        }
        self.shared.sessions.clear();
        self.shared.done.cancel();
        tracing::info!(listener = %self.shared.name, "listener closed");
    }

    /// Wait until this listener has fully closed.
    pub async fn wait(&self) {
        self.shared.done.cancelled().await;
    }
}

async fn accept_loop(shared: Arc<Shared>, mut accepter: Box<dyn Accepter>) {
    loop {
        let next = tokio::select! {
            _ = shared.ctx.cancelled() => break,
            r = accepter.accept() => r,
        };
        let (conn, peer) = match next {
            Ok(c) => c,
            Err(e) => {
                if shared.closing.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!(listener = %shared.name, error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(listener = %shared.name, peer = %peer, "new connection");
        let sh = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(&sh, conn, &peer).await {
                tracing::warn!(listener = %sh.name, peer = %peer, error = %e, "connection handler error");
            }
        });
    }
    tracing::trace!(listener = %shared.name, "accept loop stopped");
}

/// Serve one inbound transport: read the packet, route it to (or create)
/// the owning session, then either answer with the session's next
/// outbound packet or hand the transport over to channel mode.
async fn handle_conn(
    shared: &Arc<Shared>,
    conn: Box<dyn Transport>,
    peer: &str,
) -> crate::Result<()> {
    let link = shared.link.lock().unwrap().clone();
    let (mut rd, mut wr) = tokio::io::split(conn);
    let p = tokio::time::timeout(
        ACCEPT_DEADLINE,
        read_packet(&mut rd, &*link.wrapper, &*link.transform),
    )
    .await
    .map_err(|_| crate::UmbraError::Transport(std::io::ErrorKind::TimedOut.into()))??;
    if p.device.is_empty() {
        tracing::warn!(listener = %shared.name, peer = %peer, "dropping packet without a device id");
        return Err(crate::UmbraError::MalformedPacket);
    }
    let session = match route(shared, &p, peer) {
        Some(s) => s,
        None => return Ok(()),
    };
    *session.host.lock().unwrap() = peer.to_string();
    session.receive(p).await?;
    let mut reply = match session.next(true).await {
        Some(r) => r,
        None => Packet::keep_alive(session.device()),
    };
    if session.state.channel_can_start() {
        reply.flags.set(flags::CHANNEL);
        session.state.set(crate::state::CHANNEL);
    } else if reply.flags.contains(flags::CHANNEL) {
        session.state.set(crate::state::CHANNEL);
    }
    tracing::debug!(listener = %shared.name, id = %session.device(), packet = %reply, "replying");
    write_packet(&mut wr, &*link.wrapper, &*link.transform, &reply).await?;
    if session.state.channel() {
        // The exchange continues as a duplex stream on this transport.
        session.channel(rd, wr, &link).await;
        return Ok(());
    }
    let _ = wr.shutdown().await;
    Ok(())
}

/// Find the session a packet belongs to, creating one when a hello
/// arrives from an unknown device.
fn route(shared: &Arc<Shared>, p: &Packet, peer: &str) -> Option<Arc<Session>> {
    let hash = p.device.hash();
    if let Some(s) = shared.sessions.get(&hash) {
        return Some(s.clone());
    }
    if p.id != ids::HELLO {
        tracing::warn!(
            listener = %shared.name,
            device = %p.device,
            "dropping packet for an unknown session"
        );
        return None;
    }
    let machine = {
        let mut buf = bytes::Bytes::from(p.payload.clone());
        match Machine::read_from(&mut buf) {
            Ok(m) if m.id == p.device => m,
            _ => Machine {
                id: p.device,
                ..Default::default()
            },
        }
    };
    let session = Session::server(
        shared.runtime.clone(),
        machine,
        shared.profile.clone(),
        ListenerHandle {
            inner: Arc::downgrade(shared),
        },
        shared.events.clone(),
    );
    shared.sessions.insert(hash, session.clone());
    tracing::info!(
        listener = %shared.name,
        device = %session.device(),
        peer = %peer,
        "new session registered"
    );
    if shared.new_cb.lock().unwrap().is_some() {
        let sh = shared.clone();
        let s = session.clone();
        shared.events.queue(move || {
            if let Some(cb) = &*sh.new_cb.lock().unwrap() {
                cb(&s);
            }
        });
    }
    Some(session)
}

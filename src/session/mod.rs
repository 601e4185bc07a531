//! Logical session between one endpoint and one listener.
//!
//! A client session owns a dedicated task driving the wake/connect/
//! exchange loop against the active profile. A server-side session is
//! passive: it is driven entirely by inbound transports delivered through
//! its parent listener.

mod cluster;
mod exchange;
mod wake;


use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceId, Machine};
use crate::events::EventQueue;
use crate::job::Job;
use crate::listener::ListenerHandle;
use crate::profile::{Link, Profile, ProfileMarshal};
use crate::protocol::packet::Packet;
use crate::protocol::{flags, ids};
use crate::proxy::Proxy;
use crate::runtime::Runtime;
use crate::state::{self, State};
use cluster::Cluster;

/// Fallback exchange interval when a profile declines to provide one.
const DEFAULT_SLEEP: Duration = Duration::from_secs(60);
/// Fallback jitter percentage.
const DEFAULT_JITTER: u8 = 10;

pub type ShutdownFn = Box<dyn Fn(&Session) + Send + Sync>;
pub type ReceiveFn = Box<dyn Fn(&Session, &Packet) + Send + Sync>;

pub(crate) struct ProfileSlot {
    pub profile: Arc<dyn Profile>,
    /// Marshaled form captured when the profile implements
    /// [`ProfileMarshal`]; required by spawn, migrate and profile tasks.
    pub bytes: Option<Vec<u8>>,
}

pub(crate) struct Guarded {
    pub frags: HashMap<u16, Cluster>,
    pub jobs: HashMap<u16, Arc<Job>>,
}

pub struct Session {
    pub(crate) device: DeviceId,
    machine: Mutex<Machine>,
    created: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,

    pub(crate) runtime: Runtime,
    pub(crate) state: State,
    pub(crate) host: Mutex<String>,
    pub(crate) link: Mutex<Link>,
    pub(crate) sleep: Mutex<Duration>,
    pub(crate) jitter: AtomicU8,
    pub(crate) errors: AtomicU8,

    pub(crate) profile: Mutex<ProfileSlot>,
    pub(crate) swap: Mutex<Option<ProfileSlot>>,

    pub(crate) send_tx: mpsc::Sender<Packet>,
    pub(crate) send_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    pub(crate) wake_tx: mpsc::Sender<()>,
    pub(crate) wake_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    recv_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    recv_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Packet>>>,
    pub(crate) peek: Mutex<Option<Packet>>,

    pub(crate) guarded: tokio::sync::RwLock<Guarded>,
    pub(crate) proxy: Mutex<Option<Proxy>>,
    pub(crate) parent: Option<ListenerHandle>,
    pub(crate) events: EventQueue,
    pub(crate) ticker: tokio::sync::Mutex<Option<tokio::time::Interval>>,

    shutdown_cb: Mutex<Option<ShutdownFn>>,
    receive_cb: Mutex<Option<ReceiveFn>>,

    pub(crate) ctx: CancellationToken,
    pub(crate) done: CancellationToken,
}

impl Session {
    fn build(
        runtime: Runtime,
        device: DeviceId,
        machine: Machine,
        profile: Arc<dyn Profile>,
        profile_bytes: Option<Vec<u8>>,
        parent: Option<ListenerHandle>,
        events: EventQueue,
    ) -> Arc<Self> {
        let cfg = runtime.config();
        let (send_tx, send_rx) = mpsc::channel(cfg.send_queue_capacity);
        let (wake_tx, wake_rx) = mpsc::channel(cfg.wake_queue_capacity.max(1));
        let link = profile.next();
        let host = link.host.clone().unwrap_or_default();
        let sleep = match profile.sleep() {
            d if d > Duration::ZERO => d,
            _ => DEFAULT_SLEEP,
        };
        let jitter = match profile.jitter() {
            j if (0..=100).contains(&j) => j as u8,
            _ => DEFAULT_JITTER,
        };
        Arc::new(Session {
            device,
            machine: Mutex::new(machine),
            created: Utc::now(),
            last_seen: Mutex::new(Utc::now()),
            runtime,
            state: State::new(),
            host: Mutex::new(host),
            link: Mutex::new(link),
            sleep: Mutex::new(sleep),
            jitter: AtomicU8::new(jitter),
            errors: AtomicU8::new(0),
            profile: Mutex::new(ProfileSlot {
                profile,
                bytes: profile_bytes,
            }),
            swap: Mutex::new(None),
            send_tx,
            send_rx: tokio::sync::Mutex::new(send_rx),
            wake_tx,
            wake_rx: tokio::sync::Mutex::new(wake_rx),
            recv_tx: Mutex::new(None),
            recv_rx: tokio::sync::Mutex::new(None),
            peek: Mutex::new(None),
            guarded: tokio::sync::RwLock::new(Guarded {
                frags: HashMap::new(),
                jobs: HashMap::new(),
            }),
            proxy: Mutex::new(None),
            parent,
            events,
            ticker: tokio::sync::Mutex::new(None),
            shutdown_cb: Mutex::new(None),
            receive_cb: Mutex::new(None),
            ctx: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Start a client session driven by the supplied profile. The session
    /// queues its hello and begins the wake/exchange loop immediately.
    /// Must be called from within a Tokio runtime.
    ///
    /// A session built this way can only spawn or migrate with an explicit
    /// profile blob; use [`Session::connect_with`] when the profile is
    /// marshalable.
    pub fn connect(runtime: Runtime, profile: Arc<dyn Profile>) -> Arc<Self> {
        Self::client(runtime, profile, None)
    }

    /// Start a client session whose profile can cross a process boundary,
    /// enabling spawn, migrate and profile-swap tasks.
    pub fn connect_with<P: ProfileMarshal + 'static>(
        runtime: Runtime,
        profile: Arc<P>,
    ) -> crate::Result<Arc<Self>> {
        let bytes = profile.marshal()?;
        Ok(Self::client(runtime, profile, Some(bytes)))
    }

    fn client(runtime: Runtime, profile: Arc<dyn Profile>, bytes: Option<Vec<u8>>) -> Arc<Self> {
        let device = runtime.device();
        let machine = runtime.machine().clone();
        let events = EventQueue::start();
        let s = Self::build(runtime, device, machine, profile, bytes, None, events);
        let mut hello = Packet::new(ids::HELLO);
        hello.device = s.device;
        let mut buf = bytes::BytesMut::new();
        s.machine.lock().unwrap().write_to(&mut buf);
        hello.payload = buf.to_vec();
        let _ = s.send_tx.try_send(hello);
        tokio::spawn(s.clone().run());
        s.wake();
        s
    }

    /// Build the server half of a session for a remote device. Driven by
    /// the listener; it never sleeps or dials.
    pub(crate) fn server(
        runtime: Runtime,
        machine: Machine,
        profile: Arc<dyn Profile>,
        parent: ListenerHandle,
        events: EventQueue,
    ) -> Arc<Self> {
        let device = machine.id;
        Self::build(runtime, device, machine, profile, None, Some(parent), events)
    }

    // --- identity and status -------------------------------------------

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn machine(&self) -> Machine {
        self.machine.lock().unwrap().clone()
    }

    pub(crate) fn set_machine(&self, m: Machine) {
        *self.machine.lock().unwrap() = m;
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock().unwrap()
    }

    pub(crate) fn update_seen(&self) {
        *self.last_seen.lock().unwrap() = Utc::now();
    }

    /// True when this end initiated the connection (no parent listener).
    pub fn is_client(&self) -> bool {
        self.parent.is_none()
    }

    /// True while the session can still exchange packets.
    pub fn is_active(&self) -> bool {
        !self.state.closing()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed()
    }

    /// True when a migration is transferring this session elsewhere.
    pub fn is_moving(&self) -> bool {
        self.parent.is_none() && self.state.moving()
    }

    pub fn is_proxy(&self) -> bool {
        !self.state.closing() && self.proxy.lock().unwrap().is_some()
    }

    /// True when this session is in channel mode or has it latched on.
    pub fn in_channel(&self) -> bool {
        self.state.channel() || self.state.channel_value()
    }

    /// Display form of the last host this session exchanged with.
    pub fn remote_addr(&self) -> String {
        self.host.lock().unwrap().clone()
    }

    /// Interval between exchanges on the client side.
    pub fn time(&self) -> Duration {
        *self.sleep.lock().unwrap()
    }

    pub fn jitter(&self) -> u8 {
        self.jitter.load(Ordering::Relaxed)
    }

    pub fn set_proxy(&self, p: Option<Proxy>) {
        *self.proxy.lock().unwrap() = p;
    }

    // --- callbacks -----------------------------------------------------

    /// Invoked once when the session closes, unless it is migrating.
    pub fn on_shutdown<F: Fn(&Session) + Send + Sync + 'static>(&self, f: F) {
        *self.shutdown_cb.lock().unwrap() = Some(Box::new(f));
    }

    /// Invoked (serialized) for every delivered logical packet.
    pub fn on_receive<F: Fn(&Session, &Packet) + Send + Sync + 'static>(&self, f: F) {
        *self.receive_cb.lock().unwrap() = Some(Box::new(f));
    }

    // --- outbound ------------------------------------------------------

    /// Queue a packet for the next exchange, waiting for room when the
    /// send buffer is full.
    pub async fn send(&self, p: Packet) -> crate::Result<()> {
        self.enqueue(true, p).await
    }

    /// Queue a packet for the next exchange without blocking. Returns
    /// [`FullBuffer`](crate::UmbraError::FullBuffer) when the send buffer
    /// cannot take the whole write.
    pub async fn write(&self, p: Packet) -> crate::Result<()> {
        self.enqueue(false, p).await
    }

    async fn enqueue(&self, blocking: bool, mut p: Packet) -> crate::Result<()> {
        if self.state.closing() || self.state.send_closed() {
            return Err(crate::UmbraError::ClosedPipe);
        }
        if p.device.is_empty() {
            p.device = self.device;
        }
        let limit = self.runtime.config().frag_limit;
        if limit == 0 || p.size() <= limit {
            if blocking {
                self.send_tx
                    .send(p)
                    .await
                    .map_err(|_| crate::UmbraError::ClosedPipe)?;
            } else {
                self.send_tx.try_send(p).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => crate::UmbraError::FullBuffer,
                    mpsc::error::TrySendError::Closed(_) => crate::UmbraError::ClosedPipe,
                })?;
            }
            if self.state.channel() {
                self.wake_raw();
            }
            return Ok(());
        }
        self.enqueue_fragments(blocking, p, limit).await
    }

    /// Split an oversized packet into a fragment group and queue every
    /// part, all or nothing.
    async fn enqueue_fragments(
        &self,
        blocking: bool,
        p: Packet,
        limit: usize,
    ) -> crate::Result<()> {
        let count = p.size().div_ceil(limit);
        let permits = if blocking {
            self.send_tx
                .reserve_many(count)
                .await
                .map_err(|_| crate::UmbraError::ClosedPipe)?
        } else {
            self.send_tx.try_reserve_many(count).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => crate::UmbraError::FullBuffer,
                mpsc::error::TrySendError::Closed(_) => crate::UmbraError::ClosedPipe,
            })?
        };
        let group = loop {
            let g = rand::random::<u16>();
            if g != 0 {
                break g;
            }
        };
        tracing::trace!(
            id = %self.device,
            group = format_args!("{group:X}"),
            parts = count,
            "fragmenting packet"
        );
        let mut chunks = p.payload.chunks(limit);
        for (i, permit) in permits.enumerate() {
            let mut part = Packet {
                id: p.id,
                job: p.job,
                device: p.device,
                flags: p.flags,
                payload: chunks.next().map(<[u8]>::to_vec).unwrap_or_default(),
                limit: 0,
                tags: p.tags.clone(),
            };
            part.flags.set_group(group);
            part.flags.set_len(count as u16);
            part.flags.set_position(i as u16);
            permit.send(part);
        }
        if self.state.channel() {
            self.wake_raw();
        }
        Ok(())
    }

    /// Best-effort enqueue used by the engine's own control packets.
    pub(crate) fn queue(&self, mut p: Packet) {
        if self.state.send_closed() {
            return;
        }
        if p.device.is_empty() {
            p.device = self.device;
        }
        tracing::trace!(id = %self.device, packet = %p, "queueing packet");
        if self.send_tx.try_send(p).is_err() {
            tracing::warn!(id = %self.device, "packet dropped on a full send queue");
        }
    }

    // --- inbound -------------------------------------------------------

    /// Enable the inbound packet queue. Packets that are not correlated to
    /// a job are buffered for [`Session::read`]/[`Session::recv`] once
    /// this has been called. Safe to call more than once.
    pub fn enable_receiver(&self) {
        if self.is_moving() {
            return;
        }
        let mut tx_slot = self.recv_tx.lock().unwrap();
        if tx_slot.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.runtime.config().recv_queue_capacity);
        // Nothing reads the receiver slot until CAN_RECV is visible, so
        // the try_lock cannot contend.
        if let Ok(mut rx_slot) = self.recv_rx.try_lock() {
            *rx_slot = Some(rx);
            *tx_slot = Some(tx);
            self.state.set(state::CAN_RECV);
            tracing::info!(id = %self.device, "enabled packet receive queue");
        }
    }

    /// Grab a buffered packet without waiting. Returns `None` when the
    /// buffer is empty or receiving is not enabled.
    pub fn read(&self) -> Option<Packet> {
        if !self.state.can_recv() {
            return None;
        }
        self.recv_rx.try_lock().ok()?.as_mut()?.try_recv().ok()
    }

    /// Wait for the next buffered packet. Returns `None` once the session
    /// closes with the buffer drained, or when receiving is not enabled.
    pub async fn recv(&self) -> Option<Packet> {
        if !self.state.can_recv() {
            return None;
        }
        self.recv_rx.lock().await.as_mut()?.recv().await
    }

    pub(crate) fn deliver(self: &Arc<Self>, p: Packet) {
        if self.state.can_recv() {
            if let Some(tx) = &*self.recv_tx.lock().unwrap() {
                if tx.try_send(p.clone()).is_err() {
                    tracing::warn!(id = %self.device, "inbound packet dropped on a full receive queue");
                }
            }
        }
        if self.receive_cb.lock().unwrap().is_some() {
            // Callbacks run serialized on the event task.
            let this = self.clone();
            self.events.queue(move || {
                if let Some(cb) = &*this.receive_cb.lock().unwrap() {
                    cb(&this, &p);
                }
            });
        }
    }

    // --- jobs ----------------------------------------------------------

    /// Attach a job id to `n` (when empty), queue it toward the client and
    /// return the job promise. Server-side sessions only.
    pub async fn task(&self, mut n: Packet) -> crate::Result<Arc<Job>> {
        if n.id == ids::NOP && n.is_empty() {
            return Err(crate::UmbraError::EmptyPacket);
        }
        if self.parent.is_none() {
            return Err(crate::UmbraError::NoTaskOnClient);
        }
        if self.state.moving() {
            return Err(crate::UmbraError::MigrationInProgress);
        }
        if n.device.is_empty() {
            n.device = self.device;
        }
        let mut g = self.guarded.write().await;
        if n.job == 0 {
            n.job = Self::free_job_id(&g.jobs)?;
        } else if g.jobs.contains_key(&n.job) {
            return Err(crate::UmbraError::JobIdInUse(n.job));
        }
        let (id, kind) = (n.job, n.id);
        self.send_tx.try_send(n).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => crate::UmbraError::FullBuffer,
            mpsc::error::TrySendError::Closed(_) => crate::UmbraError::ClosedPipe,
        })?;
        let j = Job::new(id, kind, &self.ctx);
        g.jobs.insert(id, j.clone());
        drop(g);
        tracing::info!(id = %self.device, job = id, "tracking job");
        Ok(j)
    }

    /// Sample up to 512 random ids, skipping the reserved 0 and 1 and any
    /// id already tracked.
    fn free_job_id(jobs: &HashMap<u16, Arc<Job>>) -> crate::Result<u16> {
        for _ in 0..512 {
            let i = rand::random::<u16>();
            if i > 1 && !jobs.contains_key(&i) {
                return Ok(i);
            }
        }
        Err(crate::UmbraError::NoFreeJobId)
    }

    /// All jobs currently tracked by this session.
    pub async fn jobs(&self) -> Vec<Arc<Job>> {
        self.guarded.read().await.jobs.values().cloned().collect()
    }

    /// The tracked job with the supplied id, if any.
    pub async fn job(&self, id: u16) -> Option<Arc<Job>> {
        if id < 2 {
            return None;
        }
        self.guarded.read().await.jobs.get(&id).cloned()
    }

    // --- timing and profile -------------------------------------------

    /// Set the exchange interval, keeping the current jitter.
    pub async fn set_sleep(&self, d: Duration) -> crate::Result<Arc<Job>> {
        let j = self.jitter();
        self.set_duration(d, i16::from(j)).await
    }

    /// Set the jitter percentage, keeping the current interval.
    pub async fn set_jitter(&self, j: i16) -> crate::Result<Arc<Job>> {
        let d = self.time();
        self.set_duration(d, j).await
    }

    /// Set both the exchange interval and jitter. The new values take
    /// effect on the next loop iteration; an exchange already underway
    /// finishes under the old timing.
    ///
    /// On a server-side session this queues a timing task toward the
    /// client and returns its job. On a client session the change is
    /// applied locally and
    /// [`NoTaskOnClient`](crate::UmbraError::NoTaskOnClient) is returned
    /// afterwards to signal that no job exists.
    pub async fn set_duration(&self, d: Duration, j: i16) -> crate::Result<Arc<Job>> {
        let j = j.clamp(0, 100) as u8;
        self.jitter.store(j, Ordering::Relaxed);
        if d > Duration::ZERO {
            *self.sleep.lock().unwrap() = d;
        }
        if self.parent.is_none() {
            return Err(crate::UmbraError::NoTaskOnClient);
        }
        let mut n = Packet::new(ids::TASK_TIME);
        n.device = self.device;
        n.payload.push(j);
        n.payload
            .extend_from_slice(&(d.as_nanos() as u64).to_le_bytes());
        self.task(n).await
    }

    /// Swap the profile used by this session.
    ///
    /// Server side, the marshaled profile is sent to the client as a task
    /// and the job is returned. Client side, the swap is staged and
    /// applied at the next wake, then
    /// [`NoTaskOnClient`](crate::UmbraError::NoTaskOnClient) is returned.
    pub async fn set_profile<P: ProfileMarshal + 'static>(
        &self,
        p: Arc<P>,
    ) -> crate::Result<Arc<Job>> {
        let bytes = p.marshal()?;
        self.stage_profile(p, bytes).await
    }

    /// Swap the profile from its marshaled form, using the runtime's
    /// registered parser.
    pub async fn set_profile_bytes(&self, b: Vec<u8>) -> crate::Result<Arc<Job>> {
        let p = self.runtime.parse_profile(&b)?;
        self.stage_profile(p, b).await
    }

    async fn stage_profile(
        &self,
        p: Arc<dyn Profile>,
        bytes: Vec<u8>,
    ) -> crate::Result<Arc<Job>> {
        if self.parent.is_none() {
            *self.swap.lock().unwrap() = Some(ProfileSlot {
                profile: p,
                bytes: Some(bytes),
            });
            return Err(crate::UmbraError::NoTaskOnClient);
        }
        *self.profile.lock().unwrap() = ProfileSlot {
            profile: p,
            bytes: Some(bytes.clone()),
        };
        let mut n = Packet::new(ids::TASK_PROFILE);
        n.device = self.device;
        n.payload = bytes;
        self.task(n).await
    }

    // --- channel mode and lifecycle ------------------------------------

    /// Latch channel (long-poll) mode on or off. The change rides the next
    /// packet as a channel flag; the peer observing the flag mirrors the
    /// mode.
    pub fn set_channel(&self, on: bool) {
        if self.state.closing() || self.is_moving() || !self.state.set_channel(on) {
            return;
        }
        let mut p = Packet::keep_alive(self.device);
        p.flags.set(if on { flags::CHANNEL } else { flags::CHANNEL_END });
        self.queue(p);
        if !self.state.channel() && self.parent.is_none() {
            self.wake();
        }
    }

    /// Interrupt the current sleep, forcing an exchange now. Lossy and
    /// idempotent; has no effect on server-side sessions.
    pub fn wake(&self) {
        if self.parent.is_some() || self.state.wake_closed() {
            return;
        }
        self.wake_raw();
    }

    pub(crate) fn wake_raw(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Ask the parent listener to drop this session. No effect on client
    /// sessions.
    pub fn remove(&self) {
        if let Some(p) = &self.parent {
            p.remove(self.device.hash());
        }
    }

    /// Stop the session and release its resources. Blocks until shutdown
    /// completes on client sessions.
    pub async fn close(self: &Arc<Self>) {
        if self.state.closing() {
            return;
        }
        self.state.unset(state::CHANNEL_VALUE);
        self.state.unset(state::CHANNEL);
        self.state.set(state::CLOSING);
        if self.parent.is_some() {
            self.shutdown_chain().await;
            return;
        }
        self.wake_raw();
        self.done.cancelled().await;
    }

    /// Wait until this session has fully closed.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// Completion token, cancelled exactly once when the session closes.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Release everything this session owns, in a fixed order. Every step
    /// is idempotent; the shutdown callback is skipped while migrating.
    pub(crate) async fn shutdown_chain(self: &Arc<Self>) {
        // Cancel first: any exchange or channel loop blocked on the queues
        // observes the token and releases its locks.
        self.ctx.cancel();
        self.wake_raw();
        if !self.state.moving() {
            if let Some(cb) = self.shutdown_cb.lock().unwrap().take() {
                let this = self.clone();
                self.events.queue(move || cb(&this));
            }
        }
        *self.proxy.lock().unwrap() = None;
        if !self.state.send_closed() {
            self.state.set(state::SEND_CLOSE);
            self.send_rx.lock().await.close();
        }
        if !self.state.wake_closed() {
            self.state.set(state::WAKE_CLOSE);
            self.wake_rx.lock().await.close();
        }
        if self.state.can_recv() && !self.state.recv_closed() {
            self.state.set(state::RECV_CLOSE);
            if let Some(tx) = self.recv_tx.lock().unwrap().take() {
                drop(tx);
            }
        }
        *self.ticker.lock().await = None;
        let aborted: Vec<Arc<Job>> = {
            let mut g = self.guarded.write().await;
            g.frags.clear();
            g.jobs.drain().map(|(_, j)| j).collect()
        };
        for j in aborted {
            j.abort("session closed");
            let job = j.clone();
            self.events.queue(move || job.run_update());
        }
        if let Some(p) = &self.parent {
            p.remove(self.device.hash());
        }
        self.state.set(state::CLOSED);
        self.done.cancel();
        tracing::info!(id = %self.device, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device)
            .field("client", &self.is_client())
            .field("active", &self.is_active())
            .finish()
    }
}

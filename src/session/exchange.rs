//! The wake/connect/exchange loop and the shared receive path.
//!
//! One exchange over an established transport is exactly one write
//! followed by one read. When channel mode is active the transport stays
//! open and both directions stream independently until one side sends a
//! channel-end flag, the transport errors out, or a read deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::{ProfileSlot, Session};
use crate::profile::{Link, Transport};
use crate::protocol::packet::Packet;
use crate::protocol::{flags, ids, read_packet, write_packet};
use crate::state;

/// Floor for read deadlines, so short poll intervals do not starve slow
/// transports.
const READ_DEADLINE_MIN: Duration = Duration::from_secs(5);

/// Most packets merged into one multi-packet per pick.
const COALESCE_MAX: usize = 32;

impl Session {
    /// Client loop: sleep, reconnect, exchange, until closed or the error
    /// budget runs out.
    pub(crate) async fn run(self: Arc<Self>) {
        debug_assert!(self.parent.is_none());
        let max = self.runtime.config().max_errors;
        let mut failed = false;
        loop {
            self.wait_interval().await;
            tracing::debug!(id = %self.device, "waking up");
            if self.state.closing() {
                if self.state.moving() {
                    tracing::info!(id = %self.device, "session is migrating, stopping the loop");
                    break;
                }
                tracing::info!(id = %self.device, "shutdown indicated, queueing goodbye");
                let mut bye = Packet::new(ids::SHUTDOWN);
                bye.device = self.device;
                *self.peek.lock().unwrap() = Some(bye);
                self.state.set(state::SHUTDOWN);
                self.state.unset(state::CHANNEL_VALUE);
                self.state.unset(state::CHANNEL);
            }
            self.apply_swap();
            {
                let slot = self.profile.lock().unwrap();
                if slot.profile.switch(failed) {
                    let link = slot.profile.next();
                    drop(slot);
                    self.adopt_link(link);
                }
            }
            let host = self.host.lock().unwrap().clone();
            let link = self.link.lock().unwrap().clone();
            let conn = {
                let connect = {
                    let slot = self.profile.lock().unwrap();
                    slot.profile.clone()
                };
                connect.connect(&host).await
            };
            let conn = match conn {
                Ok(c) => c,
                Err(e) => {
                    if self.state.closing() {
                        break;
                    }
                    tracing::warn!(id = %self.device, host = %host, error = %e, "connect failed");
                    failed = true;
                    if self.bump_errors(max) {
                        break;
                    }
                    continue;
                }
            };
            tracing::debug!(id = %self.device, host = %host, "connected");
            if self.exchange(conn, &link).await {
                failed = false;
                self.errors.store(0, Ordering::Relaxed);
            } else {
                failed = true;
                if self.bump_errors(max) {
                    break;
                }
            }
            if self.state.shutdown() {
                break;
            }
        }
        tracing::trace!(id = %self.device, "stopping transaction loop");
        self.shutdown_chain().await;
    }

    /// Record one failed exchange. True once the budget is exhausted.
    fn bump_errors(&self, max: u8) -> bool {
        let n = self.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if n > max {
            tracing::error!(id = %self.device, errors = n, "too many errors, closing session");
            return true;
        }
        false
    }

    /// Stage the pending profile swap, if one was set since the last wake.
    fn apply_swap(&self) {
        let Some(slot) = self.swap.lock().unwrap().take() else {
            return;
        };
        tracing::info!(id = %self.device, "performing a profile swap");
        let link = slot.profile.next();
        let sleep = slot.profile.sleep();
        let jitter = slot.profile.jitter();
        *self.profile.lock().unwrap() = ProfileSlot {
            profile: slot.profile,
            bytes: slot.bytes,
        };
        self.adopt_link(link);
        if sleep > Duration::ZERO {
            *self.sleep.lock().unwrap() = sleep;
        }
        if (0..=100).contains(&jitter) {
            self.jitter.store(jitter as u8, Ordering::Relaxed);
        }
    }

    fn adopt_link(&self, link: Link) {
        if let Some(h) = &link.host {
            if !h.is_empty() {
                *self.host.lock().unwrap() = h.clone();
            }
        }
        *self.link.lock().unwrap() = link;
    }

    pub(crate) fn read_deadline(&self) -> Duration {
        (*self.sleep.lock().unwrap() * 2).max(READ_DEADLINE_MIN)
    }

    /// One write/read exchange, continuing into channel mode when the
    /// channel state is (or becomes) active. Returns false on any
    /// transport or processing error.
    pub(crate) async fn exchange(self: &Arc<Self>, conn: Box<dyn Transport>, link: &Link) -> bool {
        let (mut rd, mut wr) = tokio::io::split(conn);
        let Some(mut n) = self.next(false).await else {
            return true;
        };
        self.state.unset(state::CHANNEL);
        if self.state.channel_can_start() {
            tracing::trace!(id = %self.device, "setting the channel flag on the next packet");
            n.flags.set(flags::CHANNEL);
            self.state.set(state::CHANNEL);
        } else if n.flags.contains(flags::CHANNEL) {
            self.state.set(state::CHANNEL);
        }
        tracing::debug!(id = %self.device, packet = %n, "sending packet");
        if let Err(e) = write_packet(&mut wr, &*link.wrapper, &*link.transform, &n).await {
            tracing::error!(id = %self.device, error = %e, "error writing packet");
            return false;
        }
        n.clear();
        let r = match tokio::time::timeout(
            self.read_deadline(),
            read_packet(&mut rd, &*link.wrapper, &*link.transform),
        )
        .await
        {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::error!(id = %self.device, error = %e, "error reading packet");
                return false;
            }
            Err(_) => {
                tracing::error!(id = %self.device, "timed out reading packet");
                return false;
            }
        };
        tracing::debug!(id = %self.device, packet = %r, "received packet");
        if r.flags.contains(flags::CHANNEL) && !self.state.channel() {
            tracing::trace!(id = %self.device, "channel enabled by the received packet");
            self.state.set(state::CHANNEL);
        }
        if let Err(e) = self.receive(r).await {
            tracing::warn!(id = %self.device, error = %e, "error processing packet");
            return false;
        }
        if !self.state.channel() {
            return true;
        }
        self.channel(rd, wr, link).await;
        true
    }

    /// Duplex the transport until channel mode ends. The writer runs
    /// inline; the reader runs as its own task and is cut loose through a
    /// stop token once the writer finishes.
    pub(crate) async fn channel(
        self: &Arc<Self>,
        rd: ReadHalf<Box<dyn Transport>>,
        mut wr: WriteHalf<Box<dyn Transport>>,
        link: &Link,
    ) {
        tracing::debug!(id = %self.device, "entering channel mode");
        let stop = CancellationToken::new();
        let reader = tokio::spawn(
            self.clone()
                .channel_read(rd, link.clone(), stop.clone()),
        );
        self.channel_write(&mut wr, link).await;
        stop.cancel();
        let _ = wr.shutdown().await;
        let _ = reader.await;
        self.state.unset(state::CHANNEL);
        tracing::debug!(id = %self.device, "channel mode ended");
    }

    async fn channel_write(self: &Arc<Self>, wr: &mut WriteHalf<Box<dyn Transport>>, link: &Link) {
        loop {
            if self.state.channel_can_stop() {
                break;
            }
            let Some(n) = self.next(false).await else {
                break;
            };
            if !self.state.channel() {
                // Mode ended while we were blocked; keep the packet for
                // the next exchange.
                *self.peek.lock().unwrap() = Some(n);
                break;
            }
            tracing::debug!(id = %self.device, packet = %n, "channel send");
            if let Err(e) = write_packet(wr, &*link.wrapper, &*link.transform, &n).await {
                tracing::error!(id = %self.device, error = %e, "channel write failed");
                break;
            }
            if n.flags.contains(flags::CHANNEL_END) {
                self.state.unset(state::CHANNEL);
                break;
            }
        }
    }

    async fn channel_read(
        self: Arc<Self>,
        mut rd: ReadHalf<Box<dyn Transport>>,
        link: Link,
        stop: CancellationToken,
    ) {
        loop {
            let r = tokio::select! {
                _ = stop.cancelled() => break,
                r = tokio::time::timeout(
                    self.read_deadline(),
                    read_packet(&mut rd, &*link.wrapper, &*link.transform),
                ) => r,
            };
            let p = match r {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => {
                    tracing::debug!(id = %self.device, error = %e, "channel read ended");
                    break;
                }
                Err(_) => {
                    tracing::debug!(id = %self.device, "channel read deadline passed");
                    break;
                }
            };
            tracing::debug!(id = %self.device, packet = %p, "channel received");
            let ended = p.flags.contains(flags::CHANNEL_END);
            if let Err(e) = self.receive(p).await {
                tracing::warn!(id = %self.device, error = %e, "error processing channel packet");
            }
            if ended || !self.state.channel() {
                // Nudge the writer out of its blocking pick.
                self.wake_raw();
                break;
            }
        }
    }

    // --- outbound selection --------------------------------------------

    fn try_dequeue(&self) -> Option<Packet> {
        self.send_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Pick one packet for the wire, preferring the peek slot, then the
    /// queue, then a synthesized keep-alive. In channel mode the pick
    /// blocks: server side until traffic or a wake, client side racing a
    /// sleeping keep-alive emitter against real traffic.
    async fn pick(self: &Arc<Self>, immediate: bool) -> Option<Packet> {
        if let Some(p) = self.peek.lock().unwrap().take() {
            return Some(p);
        }
        if let Some(p) = self.try_dequeue() {
            return Some(p);
        }
        if self.parent.is_some() && self.state.channel() {
            let mut rx = self.send_rx.lock().await;
            let mut wake = self.wake_rx.lock().await;
            return tokio::select! {
                p = rx.recv() => p,
                _ = wake.recv() => None,
                _ = self.ctx.cancelled() => None,
            };
        }
        if !immediate && self.parent.is_none() && self.state.channel() {
            let won = Arc::new(AtomicBool::new(false));
            let flag = won.clone();
            let this = self.clone();
            tokio::spawn(async move {
                this.wait_interval().await;
                if !flag.load(Ordering::Acquire) {
                    let _ = this.send_tx.try_send(Packet::keep_alive(this.device));
                }
            });
            let p = tokio::select! {
                p = async { self.send_rx.lock().await.recv().await } => p,
                _ = self.ctx.cancelled() => None,
            };
            won.store(true, Ordering::Release);
            return p;
        }
        if immediate {
            return None;
        }
        Some(Packet::keep_alive(self.device))
    }

    /// Select and shape the next outbound packet: proxy tags, repeat-group
    /// fairness, and coalescing of compatible queued packets.
    pub(crate) async fn next(self: &Arc<Self>, immediate: bool) -> Option<Packet> {
        let mut n = self.pick(immediate).await?;
        let proxy_tags = self
            .proxy
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.tags())
            .unwrap_or_default();
        if self.send_queue_empty() && n.verify(&self.device) {
            if n.device.is_empty() {
                n.device = self.device;
            }
            n.tags = merge_tags(n.tags, proxy_tags);
            self.accept_job(n.job).await;
            self.state.set_last(0);
            return Some(n);
        }
        let tags = merge_tags(n.tags.clone(), proxy_tags);
        let last = self.state.last();
        if last != 0 {
            let mut skipped = Vec::new();
            while n.flags.group() == last {
                match self.try_dequeue() {
                    Some(q) => {
                        skipped.push(n);
                        n = q;
                    }
                    None => break,
                }
            }
            self.state.set_last(0);
            let repeat = n.flags.group() == last;
            if repeat {
                skipped.push(n.clone());
            }
            for p in skipped {
                if self.send_tx.try_send(p).is_err() {
                    tracing::warn!(id = %self.device, "deferred packet dropped on a full send queue");
                }
            }
            if repeat {
                let mut ka = Packet::keep_alive(self.device);
                ka.tags = tags;
                return Some(ka);
            }
        }
        let (mut n, leftover) = self.coalesce(n);
        if leftover.is_some() {
            *self.peek.lock().unwrap() = leftover;
        }
        if n.device.is_empty() {
            n.device = self.device;
        }
        n.tags = merge_tags(n.tags, tags);
        self.accept_job(n.job).await;
        // Remember the group we are about to emit so the next pick can
        // prefer a different one.
        let group = n.flags.group();
        if group != 0 {
            self.state.set_last(group);
        }
        Some(n)
    }

    /// Merge queued packets sharing `(id, job, device)` with the candidate
    /// into one multi-packet. The first incompatible packet becomes the
    /// leftover for the peek slot.
    fn coalesce(&self, first: Packet) -> (Packet, Option<Packet>) {
        if first.flags.contains(flags::CHANNEL) || first.flags.contains(flags::CHANNEL_END) {
            return (first, None);
        }
        let mut rest = Vec::new();
        let mut leftover = None;
        while rest.len() < COALESCE_MAX {
            match self.try_dequeue() {
                Some(q)
                    if q.id == first.id
                        && q.job == first.job
                        && q.device == first.device
                        && !q.flags.contains(flags::CHANNEL)
                        && !q.flags.contains(flags::CHANNEL_END) =>
                {
                    rest.push(q)
                }
                Some(q) => {
                    leftover = Some(q);
                    break;
                }
                None => break,
            }
        }
        if rest.is_empty() {
            return (first, leftover);
        }
        tracing::trace!(id = %self.device, merged = rest.len() + 1, "coalesced queued packets");
        let group = first.flags.group();
        let mut out = first.into_multi(rest);
        // Keep the fairness bookkeeping meaningful for merged fragments.
        out.flags.set_group(group);
        (out, leftover)
    }

    fn send_queue_empty(&self) -> bool {
        self.send_tx.capacity() == self.send_tx.max_capacity()
            && self.peek.lock().unwrap().is_none()
    }

    /// Flag the job carried by an outbound task packet as handed to the
    /// transport.
    async fn accept_job(&self, id: u16) {
        if id < 2 || self.parent.is_none() {
            return;
        }
        let j = {
            let g = self.guarded.read().await;
            g.jobs.get(&id).cloned()
        };
        let Some(j) = j else { return };
        if j.mark_accepted() {
            tracing::trace!(id = %self.device, job = id, "job accepted");
            let job = j.clone();
            self.events.queue(move || job.run_update());
        }
    }

    // --- inbound -------------------------------------------------------

    /// Validate, reassemble and route one received packet.
    pub(crate) async fn receive(self: &Arc<Self>, n: Packet) -> crate::Result<()> {
        if !n.verify(&self.device) {
            tracing::warn!(id = %self.device, packet = %n, "dropping packet for a foreign device");
            return Err(crate::UmbraError::MalformedPacket);
        }
        self.update_seen();
        if n.flags.contains(flags::CHANNEL) && !self.state.channel() {
            self.state.set(state::CHANNEL);
        }
        if n.flags.contains(flags::CHANNEL_END) && self.state.channel() {
            self.state.unset(state::CHANNEL);
            self.wake_raw();
        }
        if n.flags.contains(flags::MULTI) {
            for p in n.split_multi()? {
                self.receive_one(p).await?;
            }
            return Ok(());
        }
        self.receive_one(n).await
    }

    async fn receive_one(self: &Arc<Self>, n: Packet) -> crate::Result<()> {
        if !n.flags.is_frag() {
            return self.process(n).await;
        }
        let group = n.flags.group();
        if self.parent.is_some() {
            self.frag_progress(n.job, n.flags.position() + 1, n.flags.len())
                .await;
        }
        tracing::trace!(
            id = %self.device,
            group = format_args!("{group:X}"),
            part = n.flags.position(),
            of = n.flags.len(),
            "tracking fragment"
        );
        let assembled = {
            let mut g = self.guarded.write().await;
            let done = g.frags.entry(group).or_default().add(n);
            if done.is_some() {
                g.frags.remove(&group);
            }
            done
        };
        match assembled {
            Some(full) => self.process(full).await,
            None => Ok(()),
        }
    }

    async fn frag_progress(&self, job: u16, current: u16, total: u16) {
        if job < 2 {
            return;
        }
        let j = {
            let g = self.guarded.read().await;
            g.jobs.get(&job).cloned()
        };
        let Some(j) = j else { return };
        j.mark_receiving(current, total);
        let job = j.clone();
        self.events.queue(move || job.run_update());
    }

    /// Route one complete logical packet.
    async fn process(self: &Arc<Self>, n: Packet) -> crate::Result<()> {
        match n.id {
            ids::NOP | ids::COMPLETE => Ok(()),
            ids::HELLO if self.parent.is_some() => {
                if !n.is_empty() {
                    let mut buf = bytes::Bytes::from(n.payload.clone());
                    match crate::device::Machine::read_from(&mut buf) {
                        Ok(m) => self.set_machine(m),
                        Err(_) => {
                            tracing::warn!(id = %self.device, "hello carried unreadable machine facts");
                        }
                    }
                }
                self.queue(Packet::new(ids::COMPLETE));
                Ok(())
            }
            ids::SHUTDOWN => {
                tracing::info!(id = %self.device, "peer indicated shutdown");
                self.state.set(state::CLOSING);
                if self.parent.is_some() {
                    self.shutdown_chain().await;
                }
                Ok(())
            }
            ids::TASK_TIME if self.parent.is_none() => self.task_time(n),
            ids::TASK_PROFILE if self.parent.is_none() => self.task_profile(n),
            ids::RESULT | ids::MIGRATED if self.parent.is_some() && n.job >= 2 => {
                if !self.resolve_job(n.clone()).await {
                    self.deliver(n);
                }
                Ok(())
            }
            _ => {
                self.deliver(n);
                Ok(())
            }
        }
    }

    /// Apply a timing task: one jitter byte and a little-endian nanosecond
    /// interval. Acknowledged with an empty result.
    fn task_time(self: &Arc<Self>, n: Packet) -> crate::Result<()> {
        if n.payload.len() < 9 {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let j = n.payload[0].min(100);
        let nanos = u64::from_le_bytes(n.payload[1..9].try_into().unwrap());
        self.jitter.store(j, Ordering::Relaxed);
        if nanos > 0 {
            *self.sleep.lock().unwrap() = Duration::from_nanos(nanos);
        }
        tracing::info!(id = %self.device, jitter = j, nanos, "timing updated by task");
        self.queue(Packet::with_job(ids::RESULT, n.job));
        Ok(())
    }

    /// Stage a profile swap from its marshaled form; applied at the next
    /// wake. Acknowledged with an empty result.
    fn task_profile(self: &Arc<Self>, n: Packet) -> crate::Result<()> {
        if n.is_empty() {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let p = self
            .runtime
            .parse_profile(&n.payload)
            .map_err(|e| {
                tracing::warn!(id = %self.device, error = %e, "rejecting profile task");
                e
            })?;
        *self.swap.lock().unwrap() = Some(ProfileSlot {
            profile: p,
            bytes: Some(n.payload.clone()),
        });
        tracing::info!(id = %self.device, "profile swap staged");
        self.queue(Packet::with_job(ids::RESULT, n.job));
        Ok(())
    }

    /// Resolve the tracked job a result packet correlates to. Returns
    /// false when the job is unknown, handing the packet back for normal
    /// delivery.
    async fn resolve_job(&self, n: Packet) -> bool {
        if self.state.moving() {
            tracing::warn!(id = %self.device, job = n.job, "dropping job result mid-migration");
            return true;
        }
        let j = {
            let mut g = self.guarded.write().await;
            g.jobs.remove(&n.job)
        };
        let Some(j) = j else {
            tracing::warn!(id = %self.device, job = n.job, "received an untracked job id");
            return false;
        };
        tracing::info!(id = %self.device, job = j.id, "received job response");
        j.resolve(n);
        let job = j.clone();
        self.events.queue(move || job.run_update());
        true
    }
}

fn merge_tags(mut a: Vec<u32>, b: Vec<u32>) -> Vec<u32> {
    a.extend(b);
    a.sort_unstable();
    a.dedup();
    a
}

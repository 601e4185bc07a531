//! Spawn and migrate: hand a profile (and, for migration, the session
//! identity) to a freshly launched child over a local pipe.
//!
//! Framing, big-endian for multi-byte lengths:
//!
//! ```text
//! spawn   : [00 00 0F] [profile_len:u64] [profile]            <- "OK"
//! migrate : [job_hi job_lo 0D] [profile_len:u64] [profile]
//!           [device:20] [proxy_len:u64] [proxy?]              <- "OK"
//!           -> "OK", pipe closed
//! ```
//!
//! The pipe name is `<base>.<child_pid_hex>` and every byte on it is
//! XOR-keyed by the base name.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::device::{DeviceId, ID_LEN};
use crate::session::Session;
use crate::state;

/// Interval between pipe connection attempts while the child starts up.
const SPIN: Duration = Duration::from_millis(100);
/// Ceiling on profile and proxy blobs crossing the pipe.
const MAX_BLOB: usize = 16 * 1024 * 1024;

const OP_SPAWN: u8 = 0x0F;
const OP_MIGRATE: u8 = 0x0D;

/// A launchable child process. `release` detaches without killing.
pub trait Runnable: Send {
    fn start(&mut self) -> crate::Result<()>;
    fn pid(&self) -> u32;
    fn release(&mut self);
}

/// What a child receives over the handoff pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct Handoff {
    /// Job id the new process should complete once it is connected; zero
    /// for a spawn.
    pub job: u16,
    pub profile: Vec<u8>,
    /// Identity to keep speaking as; `None` for a spawn, which derives a
    /// fresh one.
    pub identity: Option<DeviceId>,
    /// Marshaled proxy profile to re-establish, when the parent had one.
    pub proxy: Option<Vec<u8>>,
}

impl Session {
    /// Launch `r` and hand it this session's profile, creating an
    /// additional, independent session in the child. Returns the child
    /// pid.
    pub async fn spawn(&self, name: &str, r: &mut dyn Runnable) -> crate::Result<u32> {
        self.spawn_profile(name, None, Duration::ZERO, r).await
    }

    /// [`Session::spawn`] with an explicit profile blob and pipe timeout.
    /// An empty timeout uses the configured default.
    pub async fn spawn_profile(
        &self,
        name: &str,
        profile: Option<Vec<u8>>,
        timeout: Duration,
        r: &mut dyn Runnable,
    ) -> crate::Result<u32> {
        let (b, limit) = self.handoff_args(name, profile, timeout)?;
        tracing::info!(id = %self.device, "starting spawn");
        r.start()?;
        let pid = r.pid();
        tracing::debug!(id = %self.device, pid, "started child, waiting for pipe");
        let Some(conn) = poll_pipe(&self.ctx, &pipe_path(name, pid), limit).await else {
            return Err(crate::UmbraError::NoConn);
        };
        let mut io = XorIo::new(conn, name.as_bytes());
        io.write_all(&[0, 0, OP_SPAWN]).await?;
        io.write_all(&(b.len() as u64).to_be_bytes()).await?;
        io.write_all(&b).await?;
        io.flush().await?;
        read_ok(&mut io).await?;
        tracing::info!(id = %self.device, pid, "spawn complete");
        Ok(pid)
    }

    /// Launch `r` and transfer this live session to it: profile, identity
    /// and any proxy profile cross the pipe, outstanding jobs are
    /// cancelled, and the session closes without invoking its shutdown
    /// callback. `job` tells the server which migration task the new
    /// process should complete. When `wait` is set, queued events drain
    /// first.
    pub async fn migrate(
        self: &Arc<Self>,
        wait: bool,
        name: &str,
        job: u16,
        r: &mut dyn Runnable,
    ) -> crate::Result<u32> {
        self.migrate_profile(wait, name, None, job, Duration::ZERO, r)
            .await
    }

    /// [`Session::migrate`] with an explicit profile blob and pipe
    /// timeout.
    pub async fn migrate_profile(
        self: &Arc<Self>,
        wait: bool,
        name: &str,
        profile: Option<Vec<u8>>,
        job: u16,
        timeout: Duration,
        r: &mut dyn Runnable,
    ) -> crate::Result<u32> {
        let (b, limit) = self.handoff_args(name, profile, timeout)?;
        let proxy = {
            let p = self.proxy.lock().unwrap();
            match &*p {
                Some(p) => Some(p.marshaled()?),
                None => None,
            }
        };
        tracing::info!(id = %self.device, "starting migration");
        if wait {
            while self.events.count() > 0 {
                tracing::trace!(id = %self.device, left = self.events.count(), "waiting for events");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        {
            // One lock scope covers the moving flag and job cleanup.
            let mut g = self.guarded.write().await;
            self.state.set(state::MOVING);
            g.frags.clear();
            for (_, j) in g.jobs.drain() {
                if !j.is_done() {
                    tracing::trace!(id = %self.device, job = j.id, "cancelling job for migration");
                    j.abort("session migrating");
                    let job = j.clone();
                    self.events.queue(move || job.run_update());
                }
            }
        }
        let pid = match self.migrate_handoff(name, &b, proxy.as_deref(), job, limit, r).await {
            Ok(pid) => pid,
            Err(e) => {
                self.state.unset(state::MOVING);
                return Err(e);
            }
        };
        tracing::debug!(id = %self.device, pid, "child acknowledged, shutting down");
        self.state.set(state::CLOSING);
        *self.proxy.lock().unwrap() = None;
        self.wake_raw();
        r.release();
        self.done.cancel();
        tracing::info!(id = %self.device, pid, "migration complete");
        Ok(pid)
    }

    /// The wire part of a migration: start the child, connect, send the
    /// framing and confirm both acknowledgements.
    async fn migrate_handoff(
        &self,
        name: &str,
        profile: &[u8],
        proxy: Option<&[u8]>,
        job: u16,
        limit: Duration,
        r: &mut dyn Runnable,
    ) -> crate::Result<u32> {
        r.start()?;
        let pid = r.pid();
        tracing::debug!(id = %self.device, pid, "started child, waiting for pipe");
        let Some(conn) = poll_pipe(&self.ctx, &pipe_path(name, pid), limit).await else {
            return Err(crate::UmbraError::NoConn);
        };
        let mut io = XorIo::new(conn, name.as_bytes());
        let [hi, lo] = job.to_be_bytes();
        io.write_all(&[hi, lo, OP_MIGRATE]).await?;
        io.write_all(&(profile.len() as u64).to_be_bytes()).await?;
        io.write_all(profile).await?;
        io.write_all(self.device.as_bytes()).await?;
        let k = proxy.unwrap_or_default();
        io.write_all(&(k.len() as u64).to_be_bytes()).await?;
        if !k.is_empty() {
            io.write_all(k).await?;
        }
        io.flush().await?;
        read_ok(&mut io).await?;
        io.write_all(b"OK").await?;
        io.flush().await?;
        Ok(pid)
    }

    /// Shared validation for both handoff operations: client side only,
    /// not already moving, a usable pipe name, and a marshaled profile.
    fn handoff_args(
        &self,
        name: &str,
        profile: Option<Vec<u8>>,
        timeout: Duration,
    ) -> crate::Result<(Vec<u8>, Duration)> {
        if self.parent.is_some() {
            return Err(crate::UmbraError::NoTaskOnClient);
        }
        if self.is_moving() {
            return Err(crate::UmbraError::MigrationInProgress);
        }
        if name.is_empty() {
            return Err(crate::UmbraError::InvalidName);
        }
        let b = match profile {
            Some(b) if !b.is_empty() => b,
            _ => self
                .profile
                .lock()
                .unwrap()
                .bytes
                .clone()
                .ok_or(crate::UmbraError::CannotMarshalProfile)?,
        };
        let limit = if timeout.is_zero() {
            self.runtime.config().spawn_timeout
        } else {
            timeout
        };
        Ok((b, limit))
    }
}

/// Child side: listen on the handoff pipe for this process and receive
/// what the parent sends. Used by a freshly launched child before it
/// builds its runtime and session.
pub async fn accept_handoff(name: &str, limit: Duration) -> crate::Result<Handoff> {
    if name.is_empty() {
        return Err(crate::UmbraError::InvalidName);
    }
    let path = pipe_path(name, std::process::id());
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let accepted = tokio::time::timeout(limit, listener.accept())
        .await
        .map_err(|_| crate::UmbraError::NoConn)?;
    let (conn, _) = accepted?;
    let mut io = XorIo::new(conn, name.as_bytes());
    let mut head = [0u8; 3];
    io.read_exact(&mut head).await?;
    let profile = read_blob(&mut io).await?;
    let out = match head[2] {
        OP_SPAWN => {
            io.write_all(b"OK").await?;
            io.flush().await?;
            Handoff {
                job: 0,
                profile,
                identity: None,
                proxy: None,
            }
        }
        OP_MIGRATE => {
            let mut id = [0u8; ID_LEN];
            io.read_exact(&mut id).await?;
            let proxy = read_blob(&mut io).await?;
            io.write_all(b"OK").await?;
            io.flush().await?;
            read_ok(&mut io).await?;
            Handoff {
                job: u16::from_be_bytes([head[0], head[1]]),
                profile,
                identity: Some(DeviceId::new(id)),
                proxy: (!proxy.is_empty()).then_some(proxy),
            }
        }
        _ => return Err(crate::UmbraError::UnexpectedAck),
    };
    drop(io);
    drop(listener);
    let _ = std::fs::remove_file(&path);
    Ok(out)
}

async fn read_ok<R: AsyncRead + Unpin>(r: &mut R) -> crate::Result<()> {
    let mut ok = [0u8; 2];
    r.read_exact(&mut ok).await?;
    if &ok != b"OK" {
        return Err(crate::UmbraError::UnexpectedAck);
    }
    Ok(())
}

async fn read_blob<R: AsyncRead + Unpin>(r: &mut R) -> crate::Result<Vec<u8>> {
    let mut len = [0u8; 8];
    r.read_exact(&mut len).await?;
    let n = u64::from_be_bytes(len) as usize;
    if n > MAX_BLOB {
        return Err(crate::UmbraError::MalformedPacket);
    }
    let mut b = vec![0u8; n];
    if n > 0 {
        r.read_exact(&mut b).await?;
    }
    Ok(b)
}

/// Resolve a pipe name to its filesystem path. Relative names land in the
/// system temp directory.
fn pipe_path(name: &str, pid: u32) -> PathBuf {
    let full = format!("{name}.{pid:x}");
    if full.starts_with('/') {
        PathBuf::from(full)
    } else {
        std::env::temp_dir().join(full)
    }
}

/// Poll for the child's pipe with a fixed backoff until `limit` passes or
/// the session is cancelled.
async fn poll_pipe(
    ctx: &CancellationToken,
    path: &Path,
    limit: Duration,
) -> Option<UnixStream> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Ok(c) = UnixStream::connect(path).await {
            return Some(c);
        }
        if tokio::time::Instant::now() + SPIN >= deadline {
            return None;
        }
        tokio::select! {
            _ = ctx.cancelled() => return None,
            _ = tokio::time::sleep(SPIN) => {}
        }
    }
}

/// Symmetric rolling-XOR layer over the handoff pipe, keyed by the base
/// pipe name. Read and write lanes keep independent key positions.
struct XorIo<S> {
    inner: S,
    key: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl<S> XorIo<S> {
    fn new(inner: S, key: &[u8]) -> Self {
        debug_assert!(!key.is_empty());
        XorIo {
            inner,
            key: key.to_vec(),
            rpos: 0,
            wpos: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for XorIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        for b in &mut buf.filled_mut()[before..] {
            *b ^= this.key[this.rpos % this.key.len()];
            this.rpos += 1;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for XorIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut out = buf.to_vec();
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= this.key[(this.wpos + i) % this.key.len()];
        }
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &out))?;
        this.wpos += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn xor_io_is_symmetric() {
        let (a, b) = tokio::io::duplex(256);
        let mut left = XorIo::new(a, b"pipe-key");
        let mut right = XorIo::new(b, b"pipe-key");
        left.write_all(b"first").await.unwrap();
        left.write_all(b" second").await.unwrap();
        left.flush().await.unwrap();
        let mut got = [0u8; 12];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"first second");
    }

    #[tokio::test]
    async fn xor_io_hides_plaintext() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut left = XorIo::new(a, b"k3y");
        left.write_all(b"profile-bytes").await.unwrap();
        left.flush().await.unwrap();
        let mut raw = [0u8; 13];
        b.read_exact(&mut raw).await.unwrap();
        assert_ne!(&raw, b"profile-bytes");
    }

    #[test]
    fn pipe_path_formats_pid_hex() {
        let p = pipe_path("handoff", 0x1A2B);
        assert!(p.to_string_lossy().ends_with("handoff.1a2b"));
        let abs = pipe_path("/run/handoff", 16);
        assert_eq!(abs, PathBuf::from("/run/handoff.10"));
    }
}

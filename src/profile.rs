//! Pluggable policy consumed by the session engine.
//!
//! A [`Profile`] decides where to connect, how long to sleep between
//! exchanges, and which wrap/transform layers shape the bytes of every
//! frame. Concrete encodings (XOR, AES, DNS, HTTP, ...) and transports
//! live outside this crate; the engine only drives these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An established, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A bound server endpoint producing inbound transports.
pub trait Accepter: Send {
    /// Wait for the next inbound connection. The returned string is a
    /// display form of the peer address.
    fn accept(&mut self) -> BoxFuture<'_, crate::Result<(Box<dyn Transport>, String)>>;

    /// Display form of the local bind address.
    fn local_addr(&self) -> String;
}

/// Reversible byte layer applied to each serialized packet (compression,
/// ciphers). Wrap runs on send, unwrap on receive.
pub trait Wrapper: Send + Sync {
    fn wrap(&self, data: Vec<u8>) -> crate::Result<Vec<u8>>;
    fn unwrap(&self, data: Vec<u8>) -> crate::Result<Vec<u8>>;
}

/// Final encoding layer applied outside the wrapper (hex, base64, DNS
/// shaping). Encode runs last on send, decode first on receive.
pub trait Transform: Send + Sync {
    fn encode(&self, data: Vec<u8>) -> crate::Result<Vec<u8>>;
    fn decode(&self, data: Vec<u8>) -> crate::Result<Vec<u8>>;
}

/// Pass-through wrapper and transform, used when a profile has no byte
/// shaping of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Wrapper for Identity {
    fn wrap(&self, data: Vec<u8>) -> crate::Result<Vec<u8>> {
        Ok(data)
    }
    fn unwrap(&self, data: Vec<u8>) -> crate::Result<Vec<u8>> {
        Ok(data)
    }
}

impl Transform for Identity {
    fn encode(&self, data: Vec<u8>) -> crate::Result<Vec<u8>> {
        Ok(data)
    }
    fn decode(&self, data: Vec<u8>) -> crate::Result<Vec<u8>> {
        Ok(data)
    }
}

/// One hop's worth of policy handed out by [`Profile::next`].
#[derive(Clone)]
pub struct Link {
    /// Target (or bind) address. `None` keeps the previous host.
    pub host: Option<String>,
    pub wrapper: Arc<dyn Wrapper>,
    pub transform: Arc<dyn Transform>,
}

impl Link {
    pub fn to(host: impl Into<String>) -> Self {
        Link {
            host: Some(host.into()),
            wrapper: Arc::new(Identity),
            transform: Arc::new(Identity),
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Link {
            host: None,
            wrapper: Arc::new(Identity),
            transform: Arc::new(Identity),
        }
    }
}

/// Connection policy for a session. Object safe; implementations form an
/// open set.
pub trait Profile: Send + Sync {
    /// Rotate to (or restate) the current host and byte layers.
    fn next(&self) -> Link;

    /// Whether the engine should call [`Profile::next`] before the coming
    /// connection attempt. `prev_failed` reports the previous exchange.
    fn switch(&self, prev_failed: bool) -> bool {
        prev_failed
    }

    /// Interval between client exchanges. Zero or negative values are
    /// ignored by the session, keeping its current interval.
    fn sleep(&self) -> Duration {
        Duration::ZERO
    }

    /// Jitter percentage 0..=100. Values outside the range leave the
    /// session's current jitter untouched.
    fn jitter(&self) -> i8 {
        -1
    }

    /// Dial the supplied host.
    fn connect<'a>(&'a self, host: &'a str) -> BoxFuture<'a, crate::Result<Box<dyn Transport>>>;

    /// Bind the supplied host for inbound connections.
    fn listen<'a>(&'a self, host: &'a str) -> BoxFuture<'a, crate::Result<Box<dyn Accepter>>>;
}

/// Marker capability for profiles that can cross a process boundary.
/// Spawn, migrate and profile-swap tasks all require it; the engine
/// captures the marshaled form eagerly so a `dyn Profile` never needs a
/// runtime downcast.
pub trait ProfileMarshal: Profile {
    fn marshal(&self) -> crate::Result<Vec<u8>>;
}

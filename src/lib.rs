//! Session engine for long-lived implant/listener channels.
//!
//! The engine maintains logical [`Session`]s between remote client endpoints
//! and a central [`Listener`], exchanging self-describing [`Packet`]s over
//! transports supplied by a pluggable [`Profile`]. On top of the session
//! layer sits the [`Job`] subsystem that correlates asynchronous responses
//! to server-issued work, and the spawn/migrate protocol that can hand a
//! live session to a freshly launched child process.
//!
//! Transports and concrete profile encodings live outside this crate; the
//! engine only sees the [`Profile`] and [`Runnable`] capabilities.

pub mod config;
pub mod device;
pub mod filter;
pub mod job;
pub mod listener;
pub mod profile;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod spawn;

mod events;
mod proxy;
mod state;

pub use config::EngineConfig;
pub use device::{DeviceId, Machine};
pub use filter::Filter;
pub use job::{Job, JobStatus};
pub use listener::Listener;
pub use profile::{Profile, ProfileMarshal, Transform, Transport, Wrapper};
pub use protocol::packet::Packet;
pub use proxy::Proxy;
pub use runtime::Runtime;
pub use session::Session;
pub use spawn::Runnable;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UmbraError {
    #[error("malformed packet")]
    MalformedPacket,

    #[error("empty or nil packet")]
    EmptyPacket,

    #[error("send buffer is full")]
    FullBuffer,

    #[error("session is closed or closing")]
    ClosedPipe,

    #[error("cannot assign a free job id")]
    NoFreeJobId,

    #[error("job id {0} is in use")]
    JobIdInUse(u16),

    #[error("no job created for a client session")]
    NoTaskOnClient,

    #[error("cannot marshal profile")]
    CannotMarshalProfile,

    #[error("no profile parser loaded")]
    NoProfileParser,

    #[error("profile parse failed: {0}")]
    InvalidProfile(String),

    #[error("migration in progress")]
    MigrationInProgress,

    #[error("timed out waiting for child pipe")]
    NoConn,

    #[error("invalid pipe name")]
    InvalidName,

    #[error("unexpected handshake value")]
    UnexpectedAck,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),
}

impl From<std::io::Error> for UmbraError {
    fn from(e: std::io::Error) -> Self {
        UmbraError::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, UmbraError>;

//! On-wire packet format and stream framing.
//!
//! A serialized packet is self-describing:
//!
//! ```text
//! id:u8 job:u16 flags:u64 device:[u8;20] payload_len:varuint payload
//! tag_count:varuint tags:[u32]*
//! ```
//!
//! Multi-byte integers are little-endian. Over a stream transport each
//! packet travels inside a length-prefixed frame whose body has been run
//! through the active profile's wrapper and transform layers.

pub mod flags;
pub mod packet;

pub(crate) mod wire;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::profile::{Transform, Wrapper};
use packet::Packet;

/// Hard ceiling on a single frame, applied before unwrap.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Packet ids the engine itself produces or inspects. User traffic may use
/// any id at or above [`ids::USER_BASE`]; the engine transports it opaquely.
pub mod ids {
    /// Keep-alive. An id of zero with an empty device marks a nop frame.
    pub const NOP: u8 = 0x00;
    /// First packet of a client session; payload carries machine facts.
    pub const HELLO: u8 = 0x01;
    /// Server acknowledgement of a hello or of a received task packet.
    pub const COMPLETE: u8 = 0x03;
    /// Goodbye. Queued as the final packet when a session shuts down.
    pub const SHUTDOWN: u8 = 0x04;

    /// Task response carrying a job result.
    pub const RESULT: u8 = 0x64;
    /// Completion notice sent by a migrated process for the handoff job.
    pub const MIGRATED: u8 = 0x65;

    /// Instructs a client to swap its profile; payload is marshaled profile.
    pub const TASK_PROFILE: u8 = 0xB0;
    /// Instructs a client to change sleep/jitter; payload is jitter + nanos.
    pub const TASK_TIME: u8 = 0xB1;

    /// Lowest id considered free-form user traffic.
    pub const USER_BASE: u8 = 0x10;
}

/// Write one packet as a frame: wrap, transform, then length-prefix.
pub async fn write_packet<W>(
    w: &mut W,
    wrapper: &dyn Wrapper,
    transform: &dyn Transform,
    p: &Packet,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = bytes::BytesMut::with_capacity(64 + p.size());
    p.write_to(&mut buf);
    let body = transform.encode(wrapper.wrap(buf.to_vec())?)?;
    if body.len() > MAX_FRAME {
        return Err(crate::UmbraError::MalformedPacket);
    }
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame and decode it back into a packet.
pub async fn read_packet<R>(
    r: &mut R,
    wrapper: &dyn Wrapper,
    transform: &dyn Transform,
) -> crate::Result<Packet>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = r.read_u32_le().await? as usize;
    if len > MAX_FRAME {
        return Err(crate::UmbraError::MalformedPacket);
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    let body = wrapper.unwrap(transform.decode(body)?)?;
    let mut buf = bytes::Bytes::from(body);
    Packet::read_from(&mut buf)
}

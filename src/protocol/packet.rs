use bytes::{Buf, BufMut};
use std::fmt;

use super::flags::{self, Flags};
use super::wire;
use crate::device::DeviceId;

/// One on-wire frame. May be a member of a fragment group, a coalesced
/// multi-packet, or a bare keep-alive.
#[derive(Clone, Default, PartialEq)]
pub struct Packet {
    /// Message kind. Zero with an empty device marks a keep-alive.
    pub id: u8,
    /// Correlation id; zero and one are reserved.
    pub job: u16,
    pub flags: Flags,
    pub device: DeviceId,
    pub payload: Vec<u8>,
    /// Soft payload ceiling enforced by `append`; zero means unbounded.
    pub limit: usize,
    /// Proxy routing hints, forwarded verbatim.
    pub tags: Vec<u32>,
}

impl Packet {
    pub fn new(id: u8) -> Self {
        Packet {
            id,
            ..Default::default()
        }
    }

    /// A device-tagged empty packet, emitted when there is nothing to say.
    pub fn keep_alive(device: DeviceId) -> Self {
        Packet {
            device,
            ..Default::default()
        }
    }

    pub fn with_job(id: u8, job: u16) -> Self {
        Packet {
            id,
            job,
            ..Default::default()
        }
    }

    /// Current payload length.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True for synthesized keep-alive frames.
    pub fn is_nop(&self) -> bool {
        self.id == super::ids::NOP && self.device.is_empty()
    }

    /// Release the payload allocation.
    pub fn clear(&mut self) {
        self.payload = Vec::new();
    }

    /// Append payload bytes, honoring the soft limit. Returns how many
    /// bytes were taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let take = if self.limit > 0 {
            data.len().min(self.limit.saturating_sub(self.payload.len()))
        } else {
            data.len()
        };
        self.payload.extend_from_slice(&data[..take]);
        take
    }

    /// A packet is acceptable for a session when its device is empty (the
    /// engine stamps its own) or matches the expected identity.
    pub fn verify(&self, expected: &DeviceId) -> bool {
        self.device.is_empty() || self.device == *expected
    }

    /// Payload interpreted as a UTF-8 error string (the `ERROR` flag lane).
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.id);
        buf.put_u16_le(self.job);
        buf.put_u64_le(self.flags.0);
        self.device.write_to(buf);
        wire::put_uvarint(buf, self.payload.len() as u64);
        buf.put_slice(&self.payload);
        wire::put_uvarint(buf, self.tags.len() as u64);
        for t in &self.tags {
            buf.put_u32_le(*t);
        }
    }

    pub fn read_from<B: Buf>(buf: &mut B) -> crate::Result<Self> {
        if buf.remaining() < 1 + 2 + 8 + crate::device::ID_LEN {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let id = buf.get_u8();
        let job = buf.get_u16_le();
        let flags = Flags(buf.get_u64_le());
        let device = DeviceId::read_from(buf)?;
        let n = wire::get_uvarint(buf)? as usize;
        if buf.remaining() < n {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let mut payload = vec![0u8; n];
        buf.copy_to_slice(&mut payload);
        let c = wire::get_uvarint(buf)? as usize;
        if buf.remaining() < c * 4 {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let mut tags = Vec::with_capacity(c);
        for _ in 0..c {
            tags.push(buf.get_u32_le());
        }
        Ok(Packet {
            id,
            job,
            flags,
            device,
            payload,
            limit: 0,
            tags,
        })
    }

    /// Combine `self` and `rest` into one multi-packet. All parts are
    /// serialized whole so each keeps its own flags on arrival.
    pub fn into_multi(self, rest: Vec<Packet>) -> Packet {
        let mut out = Packet {
            id: self.id,
            job: self.job,
            device: self.device,
            ..Default::default()
        };
        out.flags.set(flags::MULTI);
        let mut buf = bytes::BytesMut::new();
        wire::put_uvarint(&mut buf, (1 + rest.len()) as u64);
        self.write_to(&mut buf);
        for p in rest {
            p.write_to(&mut buf);
        }
        out.payload = buf.to_vec();
        out
    }

    /// Unpack a multi-packet payload into its member packets.
    pub fn split_multi(&self) -> crate::Result<Vec<Packet>> {
        if !self.flags.contains(flags::MULTI) {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let mut buf = bytes::Bytes::from(self.payload.clone());
        let n = wire::get_uvarint(&mut buf)? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(Packet::read_from(&mut buf)?);
        }
        Ok(out)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02X}/{:?} J{} {}B",
            self.id,
            self.flags,
            self.job,
            self.payload.len()
        )
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

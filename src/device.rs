use bytes::{Buf, BufMut};
use std::fmt;

use crate::protocol::wire;

/// Length in bytes of an endpoint identity.
pub const ID_LEN: usize = 20;

/// Opaque 20-byte endpoint identity. The first sixteen bytes identify the
/// host, the trailing four disambiguate processes on the same host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId([u8; ID_LEN]);

impl DeviceId {
    pub const fn new(bytes: [u8; ID_LEN]) -> Self {
        DeviceId(bytes)
    }

    /// Derive a fresh identity from the supplied entropy source.
    pub fn generate<R: rand::Rng>(rng: &mut R) -> Self {
        let mut b = [0u8; ID_LEN];
        rng.fill(&mut b[..]);
        DeviceId(b)
    }

    /// True when every byte is zero. Packets constructed without an owner
    /// carry an empty id until the session stamps its own.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// FNV-1a over the full id. Keys the listener's session registry.
    pub fn hash(&self) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in &self.0 {
            h ^= u64::from(*b);
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub(crate) fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }

    pub(crate) fn read_from<B: Buf>(buf: &mut B) -> crate::Result<Self> {
        if buf.remaining() < ID_LEN {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let mut b = [0u8; ID_LEN];
        buf.copy_to_slice(&mut b);
        Ok(DeviceId(b))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]).to_uppercase())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0).to_uppercase())
    }
}

impl From<[u8; ID_LEN]> for DeviceId {
    fn from(b: [u8; ID_LEN]) -> Self {
        DeviceId(b)
    }
}

/// Snapshot of the endpoint a session speaks for. Gathered once on the
/// client, carried to the server in the hello packet, then kept for
/// display and filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Machine {
    pub id: DeviceId,
    pub hostname: String,
    pub username: String,
    pub os: String,
    pub arch: Architecture,
    pub pid: u32,
    pub elevated: bool,
}

/// Chipset family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Architecture {
    X64 = 0x0,
    X86 = 0x1,
    Arm = 0x2,
    PowerPc = 0x3,
    Mips = 0x4,
    Risc = 0x5,
    Arm64 = 0x6,
    Wasm = 0x7,
    #[default]
    Unknown = 0x8,
}

impl Architecture {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Architecture::X64,
            "x86" => Architecture::X86,
            "arm" => Architecture::Arm,
            "aarch64" => Architecture::Arm64,
            "powerpc" | "powerpc64" => Architecture::PowerPc,
            "mips" | "mips64" => Architecture::Mips,
            "riscv64" => Architecture::Risc,
            "wasm32" => Architecture::Wasm,
            _ => Architecture::Unknown,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0x0 => Architecture::X64,
            0x1 => Architecture::X86,
            0x2 => Architecture::Arm,
            0x3 => Architecture::PowerPc,
            0x4 => Architecture::Mips,
            0x5 => Architecture::Risc,
            0x6 => Architecture::Arm64,
            0x7 => Architecture::Wasm,
            _ => Architecture::Unknown,
        }
    }
}

impl Machine {
    /// Gather local facts for this process under the supplied identity.
    pub fn local(id: DeviceId) -> Self {
        Machine {
            id,
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            os: format!("{} ({})", std::env::consts::OS, std::env::consts::FAMILY),
            arch: Architecture::current(),
            pid: std::process::id(),
            elevated: false,
        }
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.id.write_to(buf);
        wire::put_string(buf, &self.hostname);
        wire::put_string(buf, &self.username);
        wire::put_string(buf, &self.os);
        buf.put_u8(self.arch as u8);
        buf.put_u32_le(self.pid);
        buf.put_u8(u8::from(self.elevated));
    }

    pub fn read_from<B: Buf>(buf: &mut B) -> crate::Result<Self> {
        let id = DeviceId::read_from(buf)?;
        let hostname = wire::get_string(buf)?;
        let username = wire::get_string(buf)?;
        let os = wire::get_string(buf)?;
        if buf.remaining() < 6 {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let arch = Architecture::from_u8(buf.get_u8());
        let pid = buf.get_u32_le();
        let elevated = buf.get_u8() != 0;
        Ok(Machine {
            id,
            hostname,
            username,
            os,
            arch,
            pid,
            elevated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn empty_id() {
        assert!(DeviceId::default().is_empty());
        let mut b = [0u8; ID_LEN];
        b[3] = 1;
        assert!(!DeviceId::new(b).is_empty());
    }

    #[test]
    fn hash_is_stable_and_distinct() {
        let a = DeviceId::new([1u8; ID_LEN]);
        let b = DeviceId::new([2u8; ID_LEN]);
        assert_eq!(a.hash(), a.hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn machine_roundtrip() {
        let m = Machine {
            id: DeviceId::new([7u8; ID_LEN]),
            hostname: "unit-07".into(),
            username: "svc".into(),
            os: "linux (unix)".into(),
            arch: Architecture::Arm64,
            pid: 4411,
            elevated: true,
        };
        let mut buf = BytesMut::new();
        m.write_to(&mut buf);
        let d = Machine::read_from(&mut buf).unwrap();
        assert_eq!(d, m);
    }
}

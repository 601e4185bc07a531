//! Process targeting filter carried inside spawn and migrate tasks.
//!
//! The engine does not act on a filter; it only serializes one so an
//! operator can steer which process a child launcher selects.

use bytes::{Buf, BufMut};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::protocol::wire;

/// Tri-state field: unset, required true, required false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "Option<bool>")]
pub enum Tri {
    #[default]
    Empty,
    True,
    False,
}

impl From<Option<bool>> for Tri {
    fn from(v: Option<bool>) -> Self {
        match v {
            None => Tri::Empty,
            Some(true) => Tri::True,
            Some(false) => Tri::False,
        }
    }
}

impl Serialize for Tri {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Tri::Empty => s.serialize_str(""),
            Tri::True => s.serialize_bool(true),
            Tri::False => s.serialize_bool(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub pid: u32,
    pub fallback: bool,
    pub session: Tri,
    pub elevated: Tri,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut m = s.serialize_map(None)?;
        m.serialize_entry("fallback", &self.fallback)?;
        if self.pid != 0 {
            m.serialize_entry("pid", &self.pid)?;
        }
        if self.session != Tri::Empty {
            m.serialize_entry("session", &self.session)?;
        }
        if self.elevated != Tri::Empty {
            m.serialize_entry("elevated", &self.elevated)?;
        }
        if !self.exclude.is_empty() {
            m.serialize_entry("exclude", &self.exclude)?;
        }
        if !self.include.is_empty() {
            m.serialize_entry("include", &self.include)?;
        }
        m.end()
    }
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        *self == Filter::default()
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.pid);
        buf.put_u8(u8::from(self.fallback));
        buf.put_u8(tri_byte(self.session));
        buf.put_u8(tri_byte(self.elevated));
        wire::put_uvarint(buf, self.exclude.len() as u64);
        for s in &self.exclude {
            wire::put_string(buf, s);
        }
        wire::put_uvarint(buf, self.include.len() as u64);
        for s in &self.include {
            wire::put_string(buf, s);
        }
    }

    pub fn read_from<B: Buf>(buf: &mut B) -> crate::Result<Self> {
        if buf.remaining() < 7 {
            return Err(crate::UmbraError::MalformedPacket);
        }
        let pid = buf.get_u32_le();
        let fallback = buf.get_u8() != 0;
        let session = tri_from(buf.get_u8());
        let elevated = tri_from(buf.get_u8());
        let mut exclude = Vec::new();
        for _ in 0..wire::get_uvarint(buf)? {
            exclude.push(wire::get_string(buf)?);
        }
        let mut include = Vec::new();
        for _ in 0..wire::get_uvarint(buf)? {
            include.push(wire::get_string(buf)?);
        }
        Ok(Filter {
            pid,
            fallback,
            session,
            elevated,
            exclude,
            include,
        })
    }
}

fn tri_byte(t: Tri) -> u8 {
    match t {
        Tri::Empty => 0,
        Tri::True => 1,
        Tri::False => 2,
    }
}

fn tri_from(b: u8) -> Tri {
    match b {
        1 => Tri::True,
        2 => Tri::False,
        _ => Tri::Empty,
    }
}

//! Hierarchical NDN-style names.
//!
//! A [`Name`] is an ordered list of opaque byte [`Component`]s. Names
//! identify everything on the wire: devices, actions, file segments, and
//! sync digests. Interest/data matching is by name prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// One opaque component of a [`Name`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Component(Vec<u8>);

impl Component {
    /// Create a component from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes of this component.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Interpret this component as UTF-8 text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Interpret this component as a decimal number.
    pub fn as_number(&self) -> Option<u64> {
        self.as_str()?.parse().ok()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            // Keep URI-friendly characters readable, percent-encode the rest.
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({})", self)
    }
}

/// A hierarchical name: an ordered list of byte components.
///
/// Displayed in URI form (`/alice/chronoshare/action/shared/5`); components
/// holding non-printable bytes are percent-encoded.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Name(Vec<Component>);

impl Name {
    /// The empty name (`/`).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a name from string components.
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            components
                .into_iter()
                .map(|c| Component::from_bytes(c.as_ref().as_bytes().to_vec()))
                .collect(),
        )
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a raw-bytes component.
    pub fn append_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.0.push(Component::from_bytes(bytes));
        self
    }

    /// Append a UTF-8 component.
    pub fn append(mut self, s: &str) -> Self {
        self.0.push(Component::from_bytes(s.as_bytes().to_vec()));
        self
    }

    /// Append a decimal-number component.
    pub fn append_number(mut self, n: u64) -> Self {
        self.0
            .push(Component::from_bytes(n.to_string().into_bytes()));
        self
    }

    /// Append every component of another name.
    pub fn append_name(mut self, other: &Name) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// Get a component by index.
    pub fn component(&self, i: usize) -> Option<&Component> {
        self.0.get(i)
    }

    /// Get the `i`-th component counting from the back (0 = last).
    pub fn component_from_back(&self, i: usize) -> Option<&Component> {
        if i < self.0.len() {
            self.0.get(self.0.len() - 1 - i)
        } else {
            None
        }
    }

    /// The sub-name `[start, start + count)`.
    pub fn sub_name(&self, start: usize, count: usize) -> Name {
        let end = (start + count).min(self.0.len());
        Name(self.0.get(start..end).unwrap_or(&[]).to_vec())
    }

    /// Whether this name is a prefix of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Canonical byte encoding: each component is length-prefixed with a
    /// 4-byte big-endian count. Used for BLOB storage and digest input.
    pub fn wire_encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for c in &self.0 {
            out.extend_from_slice(&(c.0.len() as u32).to_be_bytes());
            out.extend_from_slice(&c.0);
        }
        out
    }

    /// Decode a name from its canonical byte encoding.
    pub fn wire_decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut components = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(ProtocolError::MalformedName(
                    "truncated component length".into(),
                ));
            }
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                return Err(ProtocolError::MalformedName("truncated component".into()));
            }
            components.push(Component::from_bytes(rest[..len].to_vec()));
            rest = &rest[len..];
        }
        Ok(Self(components))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for c in &self.0 {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

impl FromStr for Name {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut name = Name::root();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let mut bytes = Vec::with_capacity(part.len());
            let mut chars = part.bytes();
            while let Some(b) = chars.next() {
                if b == b'%' {
                    let hi = chars.next();
                    let lo = chars.next();
                    let (hi, lo) = match (hi, lo) {
                        (Some(h), Some(l)) => (h, l),
                        _ => {
                            return Err(ProtocolError::MalformedName(format!(
                                "truncated percent escape in '{}'",
                                part
                            )))
                        }
                    };
                    let hex = [hi, lo];
                    let hex = std::str::from_utf8(&hex)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok());
                    match hex {
                        Some(v) => bytes.push(v),
                        None => {
                            return Err(ProtocolError::MalformedName(format!(
                                "bad percent escape in '{}'",
                                part
                            )))
                        }
                    }
                } else {
                    bytes.push(b);
                }
            }
            name = name.append_bytes(bytes);
        }
        Ok(name)
    }
}

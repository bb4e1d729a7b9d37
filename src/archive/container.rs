//! Container format holding named binary entries.
//!
//! The layout is a header with the magic bytes `RTXA`, a `u32` format version
//! and a `u32` entry count, followed by each entry as a `u32` name length,
//! the UTF-8 name, a `u64` data length and the data. All integers are
//! little-endian.

/// Little-endian encoding of primitive values.
pub(crate) trait LeBytes: Sized {
    const LEN: usize;

    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_le_bytes {
    ($type:ty) => {
        impl LeBytes for $type {
            const LEN: usize = std::mem::size_of::<$type>();

            fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(<$type>::from_le_bytes)
            }
        }
    };
}

impl_le_bytes!(u8);
impl_le_bytes!(u32);
impl_le_bytes!(u64);
impl_le_bytes!(f32);

/// Read little-endian encoded values from a byte buffer.
pub(crate) struct ValueReader<'a> {
    pos: usize,
    buf: &'a [u8],
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { pos: 0, buf }
    }

    /// Return the next `len` bytes, or None if there aren't enough.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let chunk = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(chunk)
    }

    /// Read a little-endian encoded value.
    ///
    /// Returns None if there are not enough bytes left in the buffer.
    pub fn read<T: LeBytes>(&mut self) -> Option<T> {
        self.read_bytes(T::LEN).and_then(T::from_le_slice)
    }

    /// Read a string prefixed with its `u32` length.
    pub fn read_str(&mut self) -> Option<&'a str> {
        let len = self.read::<u32>()? as usize;
        std::str::from_utf8(self.read_bytes(len)?).ok()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Append a string prefixed with its `u32` length.
pub(crate) fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend((s.len() as u32).to_le_bytes());
    buf.extend(s.as_bytes());
}

/// Errors when reading a container.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ContainerError {
    #[error("container is truncated")]
    TooShort,

    #[error("incorrect container magic")]
    InvalidMagic,

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),

    #[error("entry name is not valid UTF-8")]
    InvalidName,

    #[error("entry \"{0}\" appears more than once")]
    DuplicateEntry(String),

    #[error("container has {0} bytes of trailing data")]
    TrailingData(usize),
}

/// An ordered collection of named byte buffers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Container {
    entries: Vec<(String, Vec<u8>)>,
}

impl Container {
    const MAGIC: &'static [u8; 4] = b"RTXA";
    const VERSION: u32 = 1;

    pub fn new() -> Container {
        Container::default()
    }

    /// Add an entry, replacing any existing entry with the same name.
    pub fn add(&mut self, name: &str, data: Vec<u8>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = data,
            None => self.entries.push((name.to_string(), data)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    /// Return entry names, in the order they were added.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Serialize the container.
    pub fn to_buf(&self) -> Vec<u8> {
        let data_len: usize = self
            .entries
            .iter()
            .map(|(name, data)| 12 + name.len() + data.len())
            .sum();
        let mut buf = Vec::with_capacity(12 + data_len);

        buf.extend(Self::MAGIC);
        buf.extend(Self::VERSION.to_le_bytes());
        buf.extend((self.entries.len() as u32).to_le_bytes());
        for (name, data) in &self.entries {
            write_str(&mut buf, name);
            buf.extend((data.len() as u64).to_le_bytes());
            buf.extend(data);
        }
        buf
    }

    /// Read a container from a buffer holding exactly one container.
    pub fn from_buf(buf: &[u8]) -> Result<Container, ContainerError> {
        let mut reader = ValueReader::new(buf);

        let Some(magic) = reader.read_bytes(4) else {
            return Err(ContainerError::TooShort);
        };
        if magic != Self::MAGIC {
            return Err(ContainerError::InvalidMagic);
        }
        let version = reader.read::<u32>().ok_or(ContainerError::TooShort)?;
        if version != Self::VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let count = reader.read::<u32>().ok_or(ContainerError::TooShort)?;

        let mut container = Container::new();
        for _ in 0..count {
            let name_len = reader.read::<u32>().ok_or(ContainerError::TooShort)? as usize;
            let name = reader
                .read_bytes(name_len)
                .ok_or(ContainerError::TooShort)?;
            let name = std::str::from_utf8(name).map_err(|_| ContainerError::InvalidName)?;
            let data_len = reader.read::<u64>().ok_or(ContainerError::TooShort)?;
            let data_len = usize::try_from(data_len).map_err(|_| ContainerError::TooShort)?;
            let data = reader
                .read_bytes(data_len)
                .ok_or(ContainerError::TooShort)?;

            if container.get(name).is_some() {
                return Err(ContainerError::DuplicateEntry(name.to_string()));
            }
            container.entries.push((name.to_string(), data.to_vec()));
        }

        if reader.remaining() > 0 {
            return Err(ContainerError::TrailingData(reader.remaining()));
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::TestCases;

    use super::{Container, ContainerError};

    #[test]
    fn test_container() {
        let mut container = Container::new();
        container.add("version", b"1.0".to_vec());
        container.add("extra_files/notes.txt", b"hello".to_vec());
        container.add("version", b"1.1".to_vec());

        let buf = container.to_buf();
        let loaded = Container::from_buf(&buf).unwrap();
        assert_eq!(loaded, container);
        assert_eq!(loaded.get("version"), Some(b"1.1".as_slice()));
        let names: Vec<_> = loaded.names().collect();
        assert_eq!(names, ["version", "extra_files/notes.txt"]);
    }

    #[test]
    fn test_invalid_container() {
        #[derive(Debug)]
        struct Case {
            buf: Vec<u8>,
            expected: ContainerError,
        }

        let mut valid = Container::new();
        valid.add("a", vec![1, 2, 3]);
        let valid = valid.to_buf();

        let mut trailing = valid.clone();
        trailing.push(0);

        let mut bad_version = valid.clone();
        bad_version[4] = 7;

        let cases = [
            Case {
                buf: Vec::new(),
                expected: ContainerError::TooShort,
            },
            Case {
                buf: b"This is some text and not a container".to_vec(),
                expected: ContainerError::InvalidMagic,
            },
            Case {
                buf: bad_version,
                expected: ContainerError::UnsupportedVersion(7),
            },
            Case {
                buf: valid[..valid.len() - 1].to_vec(),
                expected: ContainerError::TooShort,
            },
            Case {
                buf: trailing,
                expected: ContainerError::TrailingData(1),
            },
        ];

        cases.test_each(|case| {
            assert_eq!(Container::from_buf(&case.buf), Err(case.expected.clone()));
        })
    }
}

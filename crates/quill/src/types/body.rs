use std::{
    fmt,
    io::{self, Write},
    path::Path,
};

use bytes::{Bytes, BytesMut};
use tempfile::NamedTempFile;
use tracing::debug;

/// A request body, kept in memory until it grows past a threshold, then
/// spooled to a temporary file. The file is deleted when the body is
/// dropped.
pub struct RequestBody {
    storage: Storage,
    len: u64,
    memory_limit: usize,
}

enum Storage {
    Memory(BytesMut),
    Spooled(NamedTempFile),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("len", &self.len)
            .field("spooled", &self.is_spooled())
            .finish()
    }
}

impl RequestBody {
    /// Creates an empty body that spools to disk past `memory_limit` bytes.
    pub fn new(memory_limit: usize) -> Self {
        Self {
            storage: Storage::Memory(BytesMut::new()),
            len: 0,
            memory_limit,
        }
    }

    /// Creates an in-memory body with the given contents.
    pub fn from_bytes(data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        Self {
            storage: Storage::Memory(BytesMut::from(data)),
            len: data.len() as u64,
            memory_limit: usize::MAX,
        }
    }

    /// Appends `data`, moving everything to a temporary file if the
    /// in-memory threshold is crossed.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.storage {
            Storage::Memory(buf) => {
                if buf.len() + data.len() > self.memory_limit {
                    let mut file = NamedTempFile::new()?;
                    debug!(
                        path = %file.path().display(),
                        len = buf.len() + data.len(),
                        "spooling request body to disk"
                    );
                    file.write_all(&buf[..])?;
                    file.write_all(data)?;
                    self.storage = Storage::Spooled(file);
                } else {
                    buf.extend_from_slice(data);
                }
            }
            Storage::Spooled(file) => file.write_all(data)?,
        }
        self.len += data.len() as u64;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size past which the body moves to disk
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self.storage, Storage::Spooled(_))
    }

    /// Location of the spool file, if the body was spooled.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Memory(_) => None,
            Storage::Spooled(file) => Some(file.path()),
        }
    }

    /// Reads the whole body into memory.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        match &self.storage {
            Storage::Memory(buf) => Ok(Bytes::copy_from_slice(buf)),
            Storage::Spooled(file) => {
                let mut handle = file.as_file();
                handle.flush()?;
                Ok(std::fs::read(file.path())?.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestBody;

    #[test]
    fn test_body_stays_in_memory() {
        let mut body = RequestBody::new(16);
        body.write(b"hello ").unwrap();
        body.write(b"world").unwrap();
        assert!(!body.is_spooled());
        assert_eq!(body.len(), 11);
        assert_eq!(&body.to_bytes().unwrap()[..], b"hello world");
    }

    #[test]
    fn test_body_spools_and_cleans_up() {
        let mut body = RequestBody::new(8);
        body.write(b"0123").unwrap();
        body.write(b"456789").unwrap();
        body.write(b"abc").unwrap();
        assert!(body.is_spooled());
        assert_eq!(body.len(), 13);
        assert_eq!(&body.to_bytes().unwrap()[..], b"0123456789abc");

        let path = body.path().unwrap().to_path_buf();
        assert!(path.exists());
        drop(body);
        assert!(!path.exists());
    }
}

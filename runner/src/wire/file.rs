use super::{TxBuffer, WireError, WireRead, WireWrite};
use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};
use tracing::trace;

/// Append-only file sink; each flushed block is synced to disk
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: File,
    tx: TxBuffer,
}

impl FileWriter {
    /// open `path` for appending, creating it if needed
    pub fn append(path: impl AsRef<Path>) -> Result<Self, WireError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file,
            tx: TxBuffer::new(),
        })
    }

    /// open `path` truncating any previous contents
    pub fn create(path: impl AsRef<Path>) -> Result<Self, WireError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            path,
            file,
            tx: TxBuffer::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn put(file: &mut File, bytes: &[u8]) -> Result<(), WireError> {
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }
}

impl WireWrite for FileWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let file = &mut self.file;
        self.tx.write(bytes, |bytes| Self::put(file, bytes))
    }

    fn start_transaction(&mut self) {
        self.tx.begin();
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        let file = &mut self.file;
        self.tx.end(|bytes| {
            trace!(bytes = bytes.len(), "Flushing file transaction");
            Self::put(file, bytes)
        })
    }
}

/// Sequential reader over a file
#[derive(Debug)]
pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WireError> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// open `path` if it exists
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Option<Self>, WireError> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self { file })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

impl WireRead for FileReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(WireError::ShortRead {
                        wanted: buf.len(),
                        available: filled,
                    })
                }
                Ok(read) => filled += read,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}

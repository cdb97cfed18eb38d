use super::{TxBuffer, WireError, WireRead, WireWrite};
use std::collections::VecDeque;

/// Growable in-memory sink, also used to pre-serialize values
#[derive(Debug, Default)]
pub struct MemWriter {
    buffer: Vec<u8>,
    limit: Option<usize>,
    depth: usize,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// writer refusing to grow past `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            limit: Some(limit),
            depth: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

impl WireWrite for MemWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if let Some(limit) = self.limit {
            let space = limit - self.buffer.len();
            if bytes.len() > space {
                return Err(WireError::ShortWrite {
                    wanted: bytes.len(),
                    space,
                });
            }
        }

        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn start_transaction(&mut self) {
        self.depth += 1;
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        self.depth = self
            .depth
            .checked_sub(1)
            .ok_or(WireError::UnbalancedTransaction)?;
        Ok(())
    }
}

/// Reader over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct MemReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> MemReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl WireRead for MemReader<'_> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() > self.remaining() {
            return Err(WireError::ShortRead {
                wanted: buf.len(),
                available: self.remaining(),
            });
        }

        buf.copy_from_slice(&self.data[self.position..self.position + buf.len()]);
        self.position += buf.len();
        Ok(())
    }
}

/// In-memory FIFO byte queue, readable and writable
#[derive(Debug, Default)]
pub struct DequeChannel {
    queue: VecDeque<u8>,
    tx: TxBuffer,
}

impl DequeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl WireWrite for DequeChannel {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let queue = &mut self.queue;
        self.tx.write(bytes, |bytes| {
            queue.extend(bytes);
            Ok(())
        })
    }

    fn start_transaction(&mut self) {
        self.tx.begin();
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        let queue = &mut self.queue;
        self.tx.end(|bytes| {
            queue.extend(bytes);
            Ok(())
        })
    }
}

impl WireRead for DequeChannel {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        if self.queue.len() < buf.len() {
            return Err(WireError::ShortRead {
                wanted: buf.len(),
                available: self.queue.len(),
            });
        }

        let wanted = buf.len();
        for (slot, byte) in buf.iter_mut().zip(self.queue.drain(..wanted)) {
            *slot = byte;
        }
        Ok(())
    }
}

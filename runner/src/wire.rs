pub mod file;
pub mod memory;

#[cfg(test)]
mod wire_test;

pub use file::{FileReader, FileWriter};
pub use memory::{DequeChannel, MemReader, MemWriter};

use std::{collections::BTreeMap, io};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Short read: wanted {wanted} bytes, {available} available")]
    ShortRead { wanted: usize, available: usize },
    #[error("Short write: {wanted} bytes requested, {space} bytes of space left")]
    ShortWrite { wanted: usize, space: usize },
    #[error("Read of {wanted} bytes crosses a message boundary ({remaining} left in message)")]
    Boundary { wanted: usize, remaining: usize },
    #[error("Transaction closed without being opened")]
    UnbalancedTransaction,
    #[error("Encoded length {0} does not fit the wire format")]
    Length(usize),
    #[error("Invalid encoded value: {0}")]
    Invalid(String),
    #[error("Peer {0} is unavailable")]
    Unavailable(i32),
    #[error("Timed out waiting for data from peer {0}")]
    Timeout(i32),
    #[error("Transport I/O failed")]
    Io(#[from] io::Error),
}

/// Sink side of a byte channel
pub trait WireWrite {
    /// write (or buffer, inside a transaction) a block of raw bytes
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError>;
    /// open a (possibly nested) write transaction
    fn start_transaction(&mut self);
    /// close a write transaction, flushing once the outermost one closes
    fn end_transaction(&mut self) -> Result<(), WireError>;
}

/// Source side of a byte channel
pub trait WireRead {
    /// blocking read filling all of `buf`
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError>;
}

/// Bidirectional channel as handed to job payload hooks
pub trait Channel: WireWrite + WireRead {}

impl<T: WireWrite + WireRead + ?Sized> Channel for T {}

pub trait Encode {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError>;
}

pub trait Decode: Sized {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError>;
}

pub trait WireWriteExt: WireWrite {
    fn send<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), WireError> {
        value.encode(self)
    }

    /// run `body` inside one transaction, closing it on every path
    fn transaction<F>(&mut self, body: F) -> Result<(), WireError>
    where
        F: FnOnce(&mut Self) -> Result<(), WireError>,
    {
        self.start_transaction();
        let result = body(self);
        let closed = self.end_transaction();

        result.and(closed)
    }
}

impl<W: WireWrite + ?Sized> WireWriteExt for W {}

pub trait WireReadExt: WireRead {
    fn receive<T: Decode>(&mut self) -> Result<T, WireError> {
        T::decode(self)
    }
}

impl<R: WireRead + ?Sized> WireReadExt for R {}

/// Deferred write buffer implementing nested transactions
#[derive(Debug, Default)]
pub struct TxBuffer {
    depth: usize,
    pending: Vec<u8>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(mut pending: Vec<u8>) -> Self {
        pending.clear();
        Self { depth: 0, pending }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// write through `flush` when no transaction is open, buffer otherwise
    pub fn write<F>(&mut self, bytes: &[u8], flush: F) -> Result<(), WireError>
    where
        F: FnOnce(&[u8]) -> Result<(), WireError>,
    {
        if self.depth == 0 {
            flush(bytes)
        } else {
            self.pending.extend_from_slice(bytes);
            Ok(())
        }
    }

    pub fn end<F>(&mut self, flush: F) -> Result<(), WireError>
    where
        F: FnOnce(&[u8]) -> Result<(), WireError>,
    {
        if self.depth == 0 {
            return Err(WireError::UnbalancedTransaction);
        }

        self.depth -= 1;
        if self.depth == 0 && !self.pending.is_empty() {
            let result = flush(&self.pending);
            self.pending.clear();
            result
        } else {
            Ok(())
        }
    }

    /// Drop every open transaction without flushing, returning how many
    /// bytes were thrown away
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.depth = 0;
        self.pending.clear();
        dropped
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.pending
    }
}

macro_rules! wire_primitive {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
                    w.write_bytes(&self.to_ne_bytes())
                }
            }

            impl Decode for $t {
                fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    r.read_bytes(&mut buf)?;
                    Ok(<$t>::from_ne_bytes(buf))
                }
            }
        )*
    };
}

wire_primitive!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl Encode for bool {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        (*self as u8).encode(w)
    }
}

impl Decode for bool {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        match u8::decode(r)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Invalid(format!("{other} is not a bool"))),
        }
    }
}

/// i32 length prefix as used for strings and sequences
fn encode_length<W: WireWrite + ?Sized>(len: usize, w: &mut W) -> Result<(), WireError> {
    let len = i32::try_from(len).map_err(|_| WireError::Length(len))?;
    len.encode(w)
}

fn decode_length<R: WireRead + ?Sized>(r: &mut R) -> Result<usize, WireError> {
    let len = i32::decode(r)?;
    usize::try_from(len).map_err(|_| WireError::Invalid(format!("negative length {len}")))
}

impl Encode for str {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        w.start_transaction();
        let result = encode_length(self.len(), w).and_then(|_| w.write_bytes(self.as_bytes()));
        let closed = w.end_transaction();
        result.and(closed)
    }
}

impl Encode for String {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        self.as_str().encode(w)
    }
}

impl Decode for String {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        let mut bytes = vec![0u8; decode_length(r)?];
        r.read_bytes(&mut bytes)?;

        String::from_utf8(bytes).map_err(|error| WireError::Invalid(error.to_string()))
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        // element sizes are not known up front, so serialize the payload first
        let mut payload = MemWriter::new();
        for item in self {
            item.encode(&mut payload)?;
        }
        let payload = payload.into_inner();

        w.start_transaction();
        let result = encode_length(payload.len(), w).and_then(|_| w.write_bytes(&payload));
        let closed = w.end_transaction();
        result.and(closed)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        self.as_slice().encode(w)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        let mut payload = vec![0u8; decode_length(r)?];
        r.read_bytes(&mut payload)?;

        let mut reader = MemReader::new(&payload);
        let mut items = Vec::new();
        while !reader.is_empty() {
            items.push(T::decode(&mut reader)?);
        }

        Ok(items)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        w.transaction(|w| {
            self.len().encode(w)?;
            for (key, value) in self {
                key.encode(w)?;
                value.encode(w)?;
            }
            Ok(())
        })
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        let count = usize::decode(r)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::decode(r)?;
            map.insert(key, V::decode(r)?);
        }

        Ok(map)
    }
}

macro_rules! wire_tuple {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
                let ($($name,)+) = self;
                w.transaction(|w| {
                    $($name.encode(w)?;)+
                    Ok(())
                })
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
                Ok(($($name::decode(r)?,)+))
            }
        }
    };
}

wire_tuple!(A);
wire_tuple!(A, B);
wire_tuple!(A, B, C);
wire_tuple!(A, B, C, D);

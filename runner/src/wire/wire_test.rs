use super::{
    DequeChannel, FileReader, FileWriter, MemReader, MemWriter, TxBuffer, WireError, WireRead,
    WireReadExt, WireWrite, WireWriteExt,
};
use std::collections::BTreeMap;

/// sink recording every block handed to the transport
#[derive(Default)]
struct CountingSink {
    tx: TxBuffer,
    blocks: Vec<Vec<u8>>,
}

impl WireWrite for CountingSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let blocks = &mut self.blocks;
        self.tx.write(bytes, |bytes| {
            blocks.push(bytes.to_vec());
            Ok(())
        })
    }

    fn start_transaction(&mut self) {
        self.tx.begin();
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        let blocks = &mut self.blocks;
        self.tx.end(|bytes| {
            blocks.push(bytes.to_vec());
            Ok(())
        })
    }
}

fn encoded<T: super::Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = MemWriter::new();
    writer.send(value).unwrap();
    writer.into_inner()
}

#[test]
pub fn strings_round_trip() {
    for value in ["", "a", "JobWorker", "ünïcödé"] {
        let bytes = encoded(value);
        assert_eq!(bytes.len(), 4 + value.len());

        let decoded: String = MemReader::new(&bytes).receive().unwrap();
        assert_eq!(decoded, value);
    }
}

#[test]
pub fn sequence_prefix_is_payload_bytes() {
    let values: Vec<u32> = vec![1, 2, 3];
    let bytes = encoded(&values);

    assert_eq!(&bytes[..4], &12i32.to_ne_bytes());
    assert_eq!(bytes.len(), 16);
}

#[test]
pub fn sequences_round_trip() {
    let empty: Vec<f64> = Vec::new();
    let decoded: Vec<f64> = MemReader::new(&encoded(&empty)).receive().unwrap();
    assert_eq!(decoded, empty);

    let names = vec!["x".to_string(), String::new(), "longer name".to_string()];
    let decoded: Vec<String> = MemReader::new(&encoded(&names)).receive().unwrap();
    assert_eq!(decoded, names);

    let nested = vec![vec![1u8, 2], vec![], vec![3]];
    let decoded: Vec<Vec<u8>> = MemReader::new(&encoded(&nested)).receive().unwrap();
    assert_eq!(decoded, nested);
}

#[test]
pub fn maps_round_trip() {
    let mut map = BTreeMap::new();
    let decoded: BTreeMap<String, i64> = MemReader::new(&encoded(&map)).receive().unwrap();
    assert!(decoded.is_empty());

    map.insert("NSamples".to_string(), 1000i64);
    map.insert("seed".to_string(), -7);
    let bytes = encoded(&map);
    assert_eq!(&bytes[..8], &2usize.to_ne_bytes());

    let decoded: BTreeMap<String, i64> = MemReader::new(&bytes).receive().unwrap();
    assert_eq!(decoded, map);
}

#[test]
pub fn tuples_round_trip() {
    let value = (7i32, "seven".to_string(), 7.5f64, true);
    let decoded: (i32, String, f64, bool) = MemReader::new(&encoded(&value)).receive().unwrap();
    assert_eq!(decoded, value);
}

#[test]
pub fn map_is_flushed_as_one_block() {
    let mut map = BTreeMap::new();
    map.insert(1u32, "one".to_string());
    map.insert(2u32, "two".to_string());

    let mut sink = CountingSink::default();
    sink.send(&map).unwrap();

    assert_eq!(sink.blocks.len(), 1);
    assert_eq!(sink.blocks[0], encoded(&map));
}

#[test]
pub fn nested_transactions_flush_once() {
    let mut sink = CountingSink::default();

    sink.start_transaction();
    sink.send(&1u8).unwrap();
    sink.start_transaction();
    sink.send(&2u8).unwrap();
    sink.end_transaction().unwrap();
    assert!(sink.blocks.is_empty());
    sink.send(&3u8).unwrap();
    sink.end_transaction().unwrap();

    assert_eq!(sink.blocks, vec![vec![1, 2, 3]]);

    // outside a transaction every write is its own block
    sink.send(&4u8).unwrap();
    assert_eq!(sink.blocks.len(), 2);
}

#[test]
pub fn discarded_transaction_is_never_flushed() {
    let mut sink = CountingSink::default();

    sink.start_transaction();
    sink.send(&1u32).unwrap();
    sink.start_transaction();
    sink.send(&2u8).unwrap();
    assert_eq!(sink.tx.discard(), 5);
    assert_eq!(sink.tx.depth(), 0);
    assert!(sink.blocks.is_empty());

    // the buffer is usable again afterwards
    sink.start_transaction();
    sink.send(&3u8).unwrap();
    sink.end_transaction().unwrap();
    assert_eq!(sink.blocks, vec![vec![3]]);
}

#[test]
pub fn unbalanced_transaction_is_rejected() {
    let mut sink = CountingSink::default();
    assert!(matches!(
        sink.end_transaction(),
        Err(WireError::UnbalancedTransaction)
    ));
}

#[test]
pub fn short_reads_fail() {
    let bytes = encoded("truncated");
    let mut reader = MemReader::new(&bytes[..6]);
    assert!(matches!(
        reader.receive::<String>(),
        Err(WireError::ShortRead { wanted: 9, available: 2 })
    ));

    let mut deque = DequeChannel::new();
    deque.send(&1u16).unwrap();
    assert!(matches!(
        deque.receive::<u32>(),
        Err(WireError::ShortRead { wanted: 4, available: 2 })
    ));
}

#[test]
pub fn deque_is_fifo() {
    let mut deque = DequeChannel::new();
    deque.send("first").unwrap();
    deque.send(&2u64).unwrap();

    assert_eq!(deque.receive::<String>().unwrap(), "first");
    assert_eq!(deque.receive::<u64>().unwrap(), 2);
    assert!(deque.is_empty());
}

#[test]
pub fn limited_writer_refuses_overflow() {
    let mut writer = MemWriter::with_limit(6);
    writer.send(&1u32).unwrap();
    assert!(matches!(
        writer.send(&1u32),
        Err(WireError::ShortWrite { wanted: 4, space: 2 })
    ));
}

#[test]
pub fn invalid_bool_is_rejected() {
    let mut reader = MemReader::new(&[2u8]);
    assert!(matches!(
        reader.receive::<bool>(),
        Err(WireError::Invalid(_))
    ));
}

#[test]
pub fn files_append_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffer.dat");

    FileWriter::append(&path).unwrap().send("hello").unwrap();
    FileWriter::append(&path).unwrap().send(&vec![1i32, 2]).unwrap();

    let mut reader = FileReader::open(&path).unwrap();
    assert_eq!(reader.receive::<String>().unwrap(), "hello");
    assert_eq!(reader.receive::<Vec<i32>>().unwrap(), vec![1, 2]);

    let mut rest = [0u8; 1];
    assert!(matches!(
        reader.read_bytes(&mut rest),
        Err(WireError::ShortRead { .. })
    ));
    assert!(FileReader::open_existing(dir.path().join("missing"))
        .unwrap()
        .is_none());
}

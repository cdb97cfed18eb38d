use super::{Pool, PoolError};
use std::thread;

#[test]
pub fn checkout_is_returned_on_drop() {
    let pool: Pool<Vec<u8>> = Pool::new(8, 8);

    {
        let mut buffer = pool.checkout().unwrap();
        buffer.extend_from_slice(b"payload");
        assert_eq!(pool.outstanding(), 1);
    }

    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.idle(), 1);

    // the recycled object comes back cleared and no new allocation happens
    let buffer = pool.checkout().unwrap();
    assert!(buffer.is_empty());
    assert_eq!(pool.allocated(), 1);
}

#[test]
pub fn checkout_is_returned_on_error_paths() {
    let pool: Pool<String> = Pool::new(8, 8);

    let failing = |pool: &Pool<String>| -> Result<(), PoolError> {
        let mut scratch = pool.checkout()?;
        scratch.push_str("partial");
        Err(PoolError::Exhausted {
            outstanding: 0,
            limit: 0,
        })
    };

    assert!(failing(&pool).is_err());
    assert_eq!(pool.outstanding(), 0);
}

#[test]
pub fn excessive_checkouts_are_refused() {
    let pool: Pool<Vec<u8>> = Pool::new(8, 2);
    let first = pool.checkout().unwrap();
    let _second = pool.checkout().unwrap();

    assert_eq!(
        pool.checkout().unwrap_err(),
        PoolError::Exhausted {
            outstanding: 2,
            limit: 2
        }
    );

    drop(first);
    assert!(pool.checkout().is_ok());
}

#[test]
pub fn idle_objects_are_capped() {
    let pool: Pool<Vec<u8>> = Pool::new(1, 8);
    let first = pool.checkout().unwrap();
    let second = pool.checkout().unwrap();
    drop(first);
    drop(second);

    assert_eq!(pool.idle(), 1);
}

#[test]
pub fn detached_objects_free_their_slot() {
    let pool: Pool<Vec<u8>> = Pool::new(8, 1);
    let mut buffer = pool.checkout().unwrap();
    buffer.push(1);

    let kept = buffer.detach();
    assert_eq!(kept, vec![1]);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.idle(), 0);
}

#[test]
pub fn checkouts_cross_threads() {
    let pool: Pool<Vec<u64>> = Pool::new(16, 16);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut buffer = pool.checkout().unwrap();
                    buffer.push(i);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.outstanding(), 0);
    assert!(pool.allocated() <= 4);
}

//! Smoke tests to verify basic functionality

#![cfg(feature = "std")]

extern crate std;
use std::println;
use std::vec::Vec;

use aint_safe::{
    AcquireError, CommitOrder, DoubleBuffer, Mcas, Membag, NestedQueue, Node, QueueConfig,
};

/// Membag of 3 slots of 4 bytes: fill, refuse, release slot 2, get it back
#[test]
fn test_membag_fill_and_reuse() {
    println!("\n=== SMOKE: Membag fill and reuse ===");
    static BAG: Membag<[u8; 4], 3> = Membag::new([0; 4]);
    BAG.init();

    let first = BAG.acquire().unwrap();
    let second = BAG.acquire().unwrap();
    let third = BAG.acquire().unwrap();
    let addresses = [
        &*first as *const [u8; 4],
        &*second as *const [u8; 4],
        &*third as *const [u8; 4],
    ];
    assert_ne!(addresses[0], addresses[1]);
    assert_ne!(addresses[0], addresses[2]);
    assert_ne!(addresses[1], addresses[2]);

    assert_eq!(BAG.acquire().err(), Some(AcquireError::Exhausted));

    BAG.release(third);
    let again = BAG.acquire().unwrap();
    assert_eq!(&*again as *const [u8; 4], addresses[2]);

    println!("membag stats: {}", BAG.stats());
}

/// Live slots never exceed capacity and never alias
#[test]
fn test_membag_live_slots_are_distinct() {
    let bag: Membag<usize, 8> = Membag::new(usize::MAX);
    bag.init();

    for round in 0..4 {
        let mut live = Vec::new();
        while let Ok(mut slot) = bag.acquire() {
            *slot = round;
            live.push(slot);
        }
        assert_eq!(live.len(), 8);

        let mut indices: Vec<usize> = live.iter().map(|slot| slot.index()).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 8);

        // Release every other slot, then everything.
        live.retain(|slot| slot.index() % 2 == 0);
        assert_eq!(bag.available(), 4);
        live.clear();
        assert_eq!(bag.available(), 8);
    }
}

/// NestedQueue of capacity 4, FCFS on both sides
#[test]
fn test_fcfs_queue_round_trip() {
    println!("\n=== SMOKE: FCFS queue round trip ===");
    static QUEUE: NestedQueue<u32, 4> = NestedQueue::new(0, QueueConfig::fcfs());

    let mut writers = Vec::new();
    for value in 100..104 {
        let mut slot = QUEUE.write_acquire().unwrap();
        *slot = value;
        writers.push(slot);
    }
    assert_eq!(QUEUE.write_acquire().err(), Some(AcquireError::Full));
    for slot in writers {
        QUEUE.write_commit(slot);
    }

    let mut readers = Vec::new();
    for value in 100..104 {
        let slot = QUEUE.read_acquire().unwrap();
        assert_eq!(*slot, value);
        readers.push(slot);
    }
    assert_eq!(QUEUE.read_acquire().err(), Some(AcquireError::Empty));
    for slot in readers {
        QUEUE.read_release(slot);
    }

    assert!(QUEUE.write_acquire().is_ok());
    println!("queue stats: {}", QUEUE.stats());
}

/// Nested writers inside an open write commit in one step, in acquire order
#[test]
fn test_nested_queue_preserves_chain_order() {
    let queue: NestedQueue<char, 8> = NestedQueue::new(' ', QueueConfig::new());

    let mut outer = queue.write_acquire().unwrap();
    *outer = 'a';
    {
        let mut middle = queue.write_acquire().unwrap();
        *middle = 'b';
        {
            let mut inner = queue.write_acquire().unwrap();
            *inner = 'c';
        }
        assert_eq!(queue.readable(), 0);
    }
    assert_eq!(queue.readable(), 0);
    outer.commit();
    assert_eq!(queue.readable(), 3);

    let drained: Vec<char> = core::iter::from_fn(|| queue.read_acquire().ok().map(|slot| *slot))
        .collect();
    assert_eq!(drained, ['a', 'b', 'c']);
    assert_eq!(queue.writable(), 8);
}

/// Counts never exceed capacity through mixed traffic
#[test]
fn test_queue_counts_bounded_by_capacity() {
    let config = QueueConfig::new().read_order(CommitOrder::Fcfs);
    let queue: NestedQueue<u8, 5> = NestedQueue::new(0, config);

    for step in 0u8..200 {
        if step % 3 != 2 {
            if let Ok(mut slot) = queue.write_acquire() {
                *slot = step;
            }
        } else if let Ok(slot) = queue.read_acquire() {
            assert!(*slot < step);
        }
        assert!(queue.readable() + queue.writable() <= queue.capacity());
    }
}

/// Mcas over two words: the read never sees a half-applied swap
#[test]
fn test_mcas_pair_all_or_nothing() {
    println!("\n=== SMOKE: Mcas pair ===");
    static PAIR: Mcas<2> = Mcas::new([0, 0]);

    assert!(PAIR.compare_exchange(&[0, 0], &[1, 1]));
    let seen = PAIR.read();
    assert_eq!(seen, [1, 1]);
    assert!(!PAIR.compare_exchange(&[0, 0], &[1, 1]));
    assert!(!PAIR.compare_exchange(&[1, 0], &[2, 2]));
    assert_eq!(PAIR.read(), [1, 1]);
    assert!(PAIR.is_idle());

    println!("mcas stats: {}", PAIR.stats());
}

/// The latest committed value is what a later reader sees
#[test]
fn test_double_buffer_latest_value() {
    let buffer: DoubleBuffer<[u64; 4]> = DoubleBuffer::new([0; 4]);
    for generation in 1..=10u64 {
        let mut slot = buffer.write_acquire().unwrap();
        *slot = [generation; 4];
        buffer.write_commit(slot);

        let read = buffer.read_acquire();
        assert_eq!(*read, [generation; 4]);
    }
    assert_eq!(buffer.readers(), 0);
}

/// Appends and deletes on a sentinel-headed list
#[test]
fn test_slist_append_and_delete() {
    let head = Node::new(0u32);
    let nodes: Vec<Node<'_, u32>> = (1..=5).map(Node::new).collect();

    let mut tail = &head;
    for node in &nodes {
        tail = tail.append(node).unwrap();
    }
    let values: Vec<u32> = head.iter().map(|node| **node).collect();
    assert_eq!(values, [1, 2, 3, 4, 5]);

    head.delete_after(&nodes[0]).unwrap();
    head.delete_after(&nodes[4]).unwrap();
    nodes[1].delete_after(&nodes[2]).unwrap();
    let values: Vec<u32> = head.iter().map(|node| **node).collect();
    assert_eq!(values, [2, 4]);
}

#![no_main]

use aint_safe::{AcquireError, CommitOrder, NestedQueue, QueueConfig};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use std::collections::VecDeque;

const CAPACITY: usize = 6;

#[derive(Debug, Arbitrary)]
struct QueueSetup {
    nested_writes: bool,
    ops: Vec<QueueOperation>,
}

#[derive(Debug, Arbitrary)]
enum QueueOperation {
    /// Write a value, nesting `depth` further writes inside it
    Write { value: u16, depth: u8 },
    Read,
    /// Acquire several reads, then release them in order
    ReadBatch(u8),
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    if let Ok(setup) = QueueSetup::arbitrary(&mut u) {
        fuzz_queue(setup);
    }
});

fn nested_write(
    queue: &NestedQueue<u16, CAPACITY>,
    model: &mut VecDeque<u16>,
    pending: &mut Vec<u16>,
    value: u16,
    depth: u8,
) {
    match queue.write_acquire() {
        Ok(mut slot) => {
            *slot = value;
            pending.push(value);
            if depth > 0 {
                nested_write(queue, model, pending, value.wrapping_add(1), depth - 1);
            }
        }
        Err(error) => assert_eq!(error, AcquireError::Full),
    }
    // Everything becomes readable once the outermost slot is committed.
    if queue.write_acquired().len() == 0 {
        model.extend(pending.drain(..));
    }
}

fn fuzz_queue(setup: QueueSetup) {
    let config = if setup.nested_writes {
        QueueConfig::new().read_order(CommitOrder::Fcfs)
    } else {
        QueueConfig::fcfs()
    };
    let queue: NestedQueue<u16, CAPACITY> = NestedQueue::new(0, config);
    let mut model: VecDeque<u16> = VecDeque::new();
    let mut pending = Vec::new();

    for op in setup.ops.into_iter().take(128) {
        match op {
            QueueOperation::Write { value, depth } => {
                let depth = if setup.nested_writes { depth % 4 } else { 0 };
                nested_write(&queue, &mut model, &mut pending, value, depth);
            }
            QueueOperation::Read => match queue.read_acquire() {
                Ok(slot) => assert_eq!(Some(*slot), model.pop_front()),
                Err(error) => {
                    assert_eq!(error, AcquireError::Empty);
                    assert!(model.is_empty());
                }
            },
            QueueOperation::ReadBatch(count) => {
                let mut batch = Vec::new();
                for _ in 0..count % (CAPACITY as u8 + 1) {
                    match queue.read_acquire() {
                        Ok(slot) => {
                            assert_eq!(Some(*slot), model.pop_front());
                            batch.push(slot);
                        }
                        Err(_) => break,
                    }
                }
                assert_eq!(queue.read_acquired().len(), batch.len());
                for slot in batch {
                    queue.read_release(slot);
                }
            }
        }

        assert!(pending.is_empty());
        assert_eq!(queue.readable(), model.len());
        assert!(queue.readable() + queue.writable() <= CAPACITY);
    }
}

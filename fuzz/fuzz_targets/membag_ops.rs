#![no_main]

use aint_safe::{AcquireError, Membag};
use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

const CAPACITY: usize = 8;

#[derive(Debug, Arbitrary)]
enum MembagOperation {
    Acquire(u32),
    Release(usize), // Index into held slots
    Write { held: usize, value: u32 },
    IntoRawAndBack(usize),
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);

    let operations: Result<Vec<MembagOperation>, _> = (0..64)
        .map(|_| MembagOperation::arbitrary(&mut u))
        .collect();

    if let Ok(ops) = operations {
        fuzz_membag(ops);
    }
});

fn fuzz_membag(ops: Vec<MembagOperation>) {
    let bag: Membag<u32, CAPACITY> = Membag::new(0);
    bag.init();

    let mut held = Vec::new();
    // Model: slot index -> value its holder last wrote
    let mut model: HashMap<usize, u32> = HashMap::new();

    for op in ops {
        match op {
            MembagOperation::Acquire(value) => match bag.acquire() {
                Ok(mut slot) => {
                    assert!(model.len() < CAPACITY);
                    assert!(!model.contains_key(&slot.index()), "slot handed out twice");
                    *slot = value;
                    model.insert(slot.index(), value);
                    held.push(slot);
                }
                Err(error) => {
                    assert_eq!(error, AcquireError::Exhausted);
                    assert_eq!(model.len(), CAPACITY);
                }
            },
            MembagOperation::Release(index) => {
                if !held.is_empty() {
                    let slot = held.swap_remove(index % held.len());
                    model.remove(&slot.index());
                    bag.release(slot);
                }
            }
            MembagOperation::Write { held: index, value } => {
                if !held.is_empty() {
                    let slot = &mut held[index % held.len()];
                    **slot = value;
                    model.insert(slot.index(), value);
                }
            }
            MembagOperation::IntoRawAndBack(index) => {
                if !held.is_empty() {
                    let slot = held.swap_remove(index % held.len());
                    let raw = slot.into_raw();
                    held.push(unsafe { bag.from_raw(raw) });
                }
            }
        }

        for slot in &held {
            assert_eq!(Some(&**slot), model.get(&slot.index()));
        }
        assert_eq!(bag.available(), CAPACITY - model.len());
    }

    drop(held);
    assert_eq!(bag.available(), CAPACITY);
}

use aint_safe::{Mcas, Membag, NestedQueue, QueueConfig};
use std::hint::black_box;
use std::time::Instant;

const ITERATIONS: u32 = 1_000_000;

static PAIR: Mcas<2> = Mcas::new([0, 0]);
static WIDE: Mcas<8> = Mcas::new([0; 8]);
static QUEUE: NestedQueue<u64, 64> = NestedQueue::new(0, QueueConfig::new());
static FCFS_QUEUE: NestedQueue<u64, 64> = NestedQueue::new(0, QueueConfig::fcfs());
static POOL: Membag<[u8; 64], 32> = Membag::new([0; 64]);

fn report(name: &str, start: Instant) {
    let elapsed = start.elapsed();
    println!(
        "{:<32} {:>10.2?} total, {:>6} ns/op",
        name,
        elapsed,
        elapsed.as_nanos() / ITERATIONS as u128
    );
}

fn main() {
    println!("\n=== aint-safe - Uncontended Operation Benchmarks ===\n");

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        black_box(PAIR.read());
    }
    report("Mcas<2>::read", start);

    let start = Instant::now();
    for i in 0..ITERATIONS as isize {
        black_box(PAIR.compare_exchange(&[i, i], &[i + 1, i + 1]));
    }
    report("Mcas<2>::compare_exchange", start);

    let start = Instant::now();
    for i in 0..ITERATIONS as isize {
        black_box(WIDE.compare_exchange(&[i; 8], &[i + 1; 8]));
    }
    report("Mcas<8>::compare_exchange", start);

    for (name, queue) in [("NestedQueue (nested)", &QUEUE), ("NestedQueue (fcfs)", &FCFS_QUEUE)] {
        let start = Instant::now();
        for i in 0..ITERATIONS as u64 {
            if let Ok(mut slot) = queue.write_acquire() {
                *slot = i;
            }
            if let Ok(slot) = queue.read_acquire() {
                black_box(*slot);
            }
        }
        report(name, start);
    }

    POOL.init();
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        if let Ok(mut slot) = POOL.acquire() {
            slot[0] = 1;
            black_box(&*slot);
        }
    }
    report("Membag acquire/release", start);

    println!("\nMcas<2> stats: {}", PAIR.stats());
    println!("Queue stats:   {}", QUEUE.stats());
    println!("Membag stats:  {}", POOL.stats());
}

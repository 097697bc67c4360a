//! Stress test - many fibers
//!
//! Schedules a large batch of fibers that each yield a few times, then
//! reports how long the scheduler took to drain them.

use cofiber::{Fiber, Scheduler, Work};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

fn main() -> cofiber::SchedResult<()> {
    cofiber::init_logging();
    println!("=== cofiber Stress Test ===\n");

    let num_fibers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(10_000);
    let workers: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);

    println!("Scheduling {} fibers on {} workers...", num_fibers, workers);

    let scheduler = Scheduler::new(workers, false, "stress")?;
    scheduler.start()?;

    let completed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    // One lock acquisition and at most one tickle per batch
    const BATCH: usize = 1000;
    let mut scheduled = 0;
    while scheduled < num_fibers {
        let n = BATCH.min(num_fibers - scheduled);
        let batch: Vec<Work> = (0..n)
            .map(|_| {
                let completed = completed.clone();
                Work::call(move || {
                    for _ in 0..10 {
                        cofiber::yield_now();
                    }
                    completed.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        scheduler.schedule_batch(batch);
        scheduled += n;
        print!("\rScheduled: {}/{}", scheduled, num_fibers);
    }

    let schedule_time = start.elapsed();
    println!("\n\nSchedule time: {:?}", schedule_time);
    println!(
        "Schedule rate: {:.0} fibers/sec",
        num_fibers as f64 / schedule_time.as_secs_f64()
    );

    println!("\nWaiting for completion...");
    let run_start = Instant::now();
    scheduler.stop();

    let total_time = start.elapsed();
    let run_time = run_start.elapsed();
    let done = completed.load(Ordering::Relaxed);
    info!(done, live = Fiber::total(), "scheduler drained");

    println!("\n=== Results ===");
    println!("Total fibers:    {}", num_fibers);
    println!("Completed:       {}", done);
    println!("Schedule time:   {:?}", schedule_time);
    println!("Drain time:      {:?}", run_time);
    println!("Total time:      {:?}", total_time);
    println!(
        "Throughput:      {:.0} fibers/sec",
        num_fibers as f64 / total_time.as_secs_f64()
    );

    println!("\n=== Stress Test Complete ===");
    Ok(())
}

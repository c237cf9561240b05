//! Benchmark call-out round trips. Operations complete either inline in `begin`, or from a completer thread
//! through the callback, which is the path racing the post-begin check.

use callbridge::{AsyncCallback, AsyncOperation, CancellationSource, Config, OutboundBridge};
use lazy_static::lazy_static;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

lazy_static! {
    static ref HISTOGRAM: Mutex<hdrhistogram::Histogram<u64>> = Mutex::new(new_histogram());
}

fn record(data: u64) {
    let mut hist = HISTOGRAM.lock().unwrap();
    hist.saturating_record(data);
}

fn take() -> hdrhistogram::Histogram<u64> {
    std::mem::replace(&mut *HISTOGRAM.lock().unwrap(), new_histogram())
}

fn new_histogram() -> hdrhistogram::Histogram<u64> {
    hdrhistogram::Histogram::<u64>::new_with_bounds(1, 1000 * 1000, 3).unwrap()
}

struct Op {
    synchronous: bool,
    completed: Arc<AtomicBool>,
}

impl AsyncOperation for Op {
    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    fn completed_synchronously(&self) -> bool {
        self.synchronous
    }

    fn cancel(&self) {}
}

type Completion = (Arc<dyn AsyncCallback<Op>>, Arc<AtomicBool>);

struct Bench {
    num_threads: u64,
    num_events: u64,
    synchronous: bool,
}

const BENCH_RUNS: &[Bench] = &[
    Bench {
        num_threads: 1,
        num_events: 1_000_000,
        synchronous: true,
    },
    Bench {
        num_threads: 4,
        num_events: 1_000_000,
        synchronous: true,
    },
    Bench {
        num_threads: 1,
        num_events: 200_000,
        synchronous: false,
    },
    Bench {
        num_threads: 4,
        num_events: 200_000,
        synchronous: false,
    },
];

struct Measurement {
    total_events: u64,
    total_threads: u64,
    synchronous: bool,
    duration: Duration,
    histogram: hdrhistogram::Histogram<u64>,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r"completed {} {} invocations across {} threads, {} per thread
            duration: {:?}",
            self.total_events,
            if self.synchronous { "synchronous" } else { "asynchronous" },
            self.total_threads,
            self.total_events / self.total_threads,
            self.duration
        )
    }
}

fn main() {
    for bench in BENCH_RUNS {
        let measurement = run_bench(bench);
        println!("{}", measurement);
        println!(
            "50'th invoke percentile (ns): {}",
            measurement.histogram.value_at_quantile(0.50)
        );
        println!(
            "99'th invoke percentile (ns): {}",
            measurement.histogram.value_at_quantile(0.99)
        );
        println!(
            "99.9'th invoke percentile (ns): {}\n",
            measurement.histogram.value_at_quantile(0.999)
        );
    }
}

fn run_bench(bench: &Bench) -> Measurement {
    let bridge = OutboundBridge::new("bench", &Config::new());
    let (tx, rx) = mpsc::channel::<Completion>();
    let completer = thread::spawn(move || {
        for (callback, completed) in rx {
            completed.store(true, Ordering::Release);
            callback.invoke(Op {
                synchronous: false,
                completed,
            });
        }
    });

    let per_thread = bench.num_events / bench.num_threads;
    let start_time = Instant::now();
    let workers: Vec<_> = (0..bench.num_threads)
        .map(|_| {
            let bridge = bridge.clone();
            let tx = tx.clone();
            let synchronous = bench.synchronous;
            thread::spawn(move || {
                let source = CancellationSource::new();
                let token = source.token();
                for _ in 0..per_thread {
                    let start = Instant::now();
                    let future = bridge.invoke(
                        |callback: Arc<dyn AsyncCallback<Op>>| {
                            let completed = Arc::new(AtomicBool::new(synchronous));
                            if !synchronous {
                                tx.send((callback, Arc::clone(&completed))).unwrap();
                            }
                            Ok(Op {
                                synchronous,
                                completed,
                            })
                        },
                        |op: &Op| Ok(op.is_completed()),
                        &token,
                    );
                    assert!(future.wait().unwrap());
                    record(start.elapsed().as_nanos() as u64);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let duration = start_time.elapsed();
    drop(tx);
    completer.join().unwrap();

    Measurement {
        total_events: per_thread * bench.num_threads,
        total_threads: bench.num_threads,
        synchronous: bench.synchronous,
        duration,
        histogram: take(),
    }
}

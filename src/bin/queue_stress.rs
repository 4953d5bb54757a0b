//! Stress both queues from many threads and report anomalies and wall-clock time.
//!
//! Usage:
//!     cargo run --release --bin queue_stress [--features tracing]
//!
//! Environment variables:
//!     LFQ_MESSAGES=1048576  Values pushed per run
//!     LFQ_CAPACITY=1024     Ring buffer capacity
//!     LFQ_PRODUCERS=4       MPMC producer threads
//!     LFQ_CONSUMERS=4       MPMC consumer threads
//!     LFQ_SEED=24301        Base seed of the injected delays
//!     LFQ_MAX_DELAY_NS=0    Longest injected pause (0 disables pauses)

use std::process::ExitCode;

use lfqueues::harness::{run_mpmc, run_spsc, StressConfig};
use lfqueues::trace::init_tracing;

const MAX_LISTED_ANOMALIES: usize = 32;

fn main() -> ExitCode {
    init_tracing();

    let config = match StressConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("queue_stress: {e}");
            return ExitCode::from(2);
        }
    };
    println!("{config:?}");

    let mut clean = true;
    for run in [run_spsc, run_mpmc] {
        let report = match run(&config) {
            Ok(report) => report,
            Err(e) => {
                eprintln!("queue_stress: {e}");
                return ExitCode::from(2);
            }
        };
        println!("{report}");
        for anomaly in report.anomalies.iter().take(MAX_LISTED_ANOMALIES) {
            println!("    {anomaly}");
        }
        if report.anomalies.len() > MAX_LISTED_ANOMALIES {
            println!(
                "    ... and {} more",
                report.anomalies.len() - MAX_LISTED_ANOMALIES
            );
        }
        clean &= report.is_clean();
    }

    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

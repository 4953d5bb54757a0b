//! Multi-threaded stress runs for both queues.
//!
//! Each run pushes a known sequence of `u64` values, optionally pausing on a seeded schedule,
//! times the whole exchange and audits what came out: the SPSC ring must deliver `0..K` exactly
//! in order, the MPMC queue must deliver every pushed value exactly once.
use std::env;
use std::fmt;
use std::hint;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::queues::ring::{Full, RingBuffer};
use crate::queues::unbounded::UnboundedQueue;
use crate::trace::{debug, error, info, warn};
use crate::QueueError;

/// Parameters of a stress run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressConfig {
    /// Values pushed in total. MPMC runs split them across producers, the last one taking the
    /// remainder.
    pub messages: u64,
    /// Ring capacity for SPSC runs.
    pub capacity: usize,
    pub producers: usize,
    pub consumers: usize,
    /// Base seed for every delay script.
    pub seed: u64,
    /// Upper bound of an injected pause. Zero disables pauses.
    pub max_delay: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            messages: 1 << 20,
            capacity: 1024,
            producers: 4,
            consumers: 4,
            seed: 0x5EED,
            max_delay: Duration::ZERO,
        }
    }
}

impl StressConfig {
    /// Reads overrides from `LFQ_MESSAGES`, `LFQ_CAPACITY`, `LFQ_PRODUCERS`, `LFQ_CONSUMERS`,
    /// `LFQ_SEED` and `LFQ_MAX_DELAY_NS`; anything unset keeps its default.
    pub fn from_env() -> Result<Self, QueueError> {
        let defaults = Self::default();
        let config = Self {
            messages: env_or("LFQ_MESSAGES", defaults.messages)?,
            capacity: env_or("LFQ_CAPACITY", defaults.capacity)?,
            producers: env_or("LFQ_PRODUCERS", defaults.producers)?,
            consumers: env_or("LFQ_CONSUMERS", defaults.consumers)?,
            seed: env_or("LFQ_SEED", defaults.seed)?,
            max_delay: Duration::from_nanos(env_or("LFQ_MAX_DELAY_NS", 0u64)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        let checks = [
            ("messages", self.message_slots()?),
            ("capacity", self.capacity),
            ("producers", self.producers),
            ("consumers", self.consumers),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((key, value)) => Err(QueueError::InvalidConfig {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// `messages` as an audit length; a count the address space cannot index is rejected.
    fn message_slots(&self) -> Result<usize, QueueError> {
        usize::try_from(self.messages).map_err(|_| QueueError::InvalidConfig {
            key: "messages".to_string(),
            value: self.messages.to_string(),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, QueueError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| QueueError::InvalidConfig {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// Deterministic schedule of short pauses for one thread.
///
/// Every thread of a run derives its own stream from the base seed, so a failing run can be
/// replayed with the same `LFQ_SEED`.
#[derive(Debug, Clone)]
pub struct DelayScript {
    rng: StdRng,
    max_nanos: u64,
}

impl DelayScript {
    /// Roughly one operation in this many is followed by a pause.
    const PAUSE_ONE_IN: u32 = 64;

    pub fn new(seed: u64, stream: u64, max_delay: Duration) -> Self {
        let mixed = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            rng: StdRng::seed_from_u64(mixed),
            max_nanos: max_delay.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    /// The pause to take after the current operation, if any.
    pub fn next_pause(&mut self) -> Option<Duration> {
        if self.max_nanos == 0 || !self.rng.gen_ratio(1, Self::PAUSE_ONE_IN) {
            return None;
        }
        Some(Duration::from_nanos(self.rng.gen_range(0..=self.max_nanos)))
    }

    pub fn pause(&mut self) {
        if let Some(delay) = self.next_pause() {
            thread::sleep(delay);
        }
    }
}

/// Something a run delivered that it should not have, or failed to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Values between `expected` and `found` were skipped at the time `found` arrived.
    Gap { expected: u64, found: u64 },
    /// `found` arrived after a later value had already been delivered.
    Reordered { expected: u64, found: u64 },
    Duplicate { value: u64 },
    /// `len` consecutive values starting at `start` never arrived.
    Missing { start: u64, len: u64 },
    /// A value outside the pushed range.
    OutOfRange { value: u64 },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::Gap { expected, found } => {
                write!(f, "gap: expected {expected}, got {found}")
            }
            Anomaly::Reordered { expected, found } => {
                write!(f, "reordered: {found} arrived while expecting {expected}")
            }
            Anomaly::Duplicate { value } => write!(f, "duplicate: {value}"),
            Anomaly::Missing { start, len } => {
                write!(f, "missing: {len} value(s) from {start}")
            }
            Anomaly::OutOfRange { value } => write!(f, "out of range: {value}"),
        }
    }
}

/// Checks an ordered stream against `0..expected`.
#[derive(Debug)]
pub struct SequenceAudit {
    next: u64,
    delivered: Vec<bool>,
    anomalies: Vec<Anomaly>,
}

impl SequenceAudit {
    pub fn new(expected: usize) -> Self {
        Self {
            next: 0,
            delivered: vec![false; expected],
            anomalies: Vec::new(),
        }
    }

    pub fn observe(&mut self, value: u64) {
        let slot = usize::try_from(value).ok();
        let Some(seen) = slot.and_then(|i| self.delivered.get_mut(i)) else {
            self.anomalies.push(Anomaly::OutOfRange { value });
            return;
        };
        if *seen {
            self.anomalies.push(Anomaly::Duplicate { value });
            return;
        }
        *seen = true;

        if value > self.next {
            self.anomalies.push(Anomaly::Gap {
                expected: self.next,
                found: value,
            });
        } else if value < self.next {
            self.anomalies.push(Anomaly::Reordered {
                expected: self.next,
                found: value,
            });
            return;
        }
        self.next = value + 1;
    }

    pub fn finish(mut self) -> Vec<Anomaly> {
        self.anomalies.extend(missing_ranges(self.delivered.iter().copied()));
        self.anomalies
    }
}

/// Checks an unordered multiset of deliveries against `0..expected`.
#[derive(Debug)]
pub struct ConservationAudit {
    counts: Vec<u32>,
    anomalies: Vec<Anomaly>,
}

impl ConservationAudit {
    pub fn new(expected: usize) -> Self {
        Self {
            counts: vec![0; expected],
            anomalies: Vec::new(),
        }
    }

    pub fn observe(&mut self, value: u64) {
        let slot = usize::try_from(value).ok();
        match slot.and_then(|i| self.counts.get_mut(i)) {
            Some(count) => {
                *count += 1;
                if *count > 1 {
                    self.anomalies.push(Anomaly::Duplicate { value });
                }
            }
            None => self.anomalies.push(Anomaly::OutOfRange { value }),
        }
    }

    pub fn finish(mut self) -> Vec<Anomaly> {
        self.anomalies
            .extend(missing_ranges(self.counts.iter().map(|&c| c > 0)));
        self.anomalies
    }
}

fn missing_ranges(delivered: impl Iterator<Item = bool>) -> Vec<Anomaly> {
    let mut ranges = Vec::new();
    let mut open: Option<u64> = None;
    let mut index = 0u64;
    for seen in delivered {
        match (seen, open) {
            (false, None) => open = Some(index),
            (true, Some(start)) => {
                ranges.push(Anomaly::Missing {
                    start,
                    len: index - start,
                });
                open = None;
            }
            _ => {}
        }
        index += 1;
    }
    if let Some(start) = open {
        ranges.push(Anomaly::Missing {
            start,
            len: index - start,
        });
    }
    ranges
}

/// Outcome of one stress run.
#[derive(Debug, Clone)]
pub struct Report {
    pub label: &'static str,
    pub messages: u64,
    pub elapsed: Duration,
    pub anomalies: Vec<Anomaly>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    /// Messages per second over the whole run.
    pub fn throughput(&self) -> f64 {
        self.messages as f64 / self.elapsed.as_secs_f64().max(f64::MIN_POSITIVE)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} messages in {:?} ({:.2} Mmsg/s), {} anomalies",
            self.label,
            self.messages,
            self.elapsed,
            self.throughput() / 1e6,
            self.anomalies.len()
        )
    }
}

fn join<T>(handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => {
            error!("stress worker panicked");
            std::panic::resume_unwind(panic)
        }
    }
}

fn backoff(spins: &mut u32) {
    if *spins < 64 {
        hint::spin_loop();
        *spins += 1;
    } else {
        thread::yield_now();
    }
}

/// One producer pushes `0..messages` through a ring of `capacity` while one consumer audits the
/// stream for gaps, repeats and reordering.
pub fn run_spsc(config: &StressConfig) -> Result<Report, QueueError> {
    config.validate()?;
    let messages = config.messages;
    let slots = config.message_slots()?;
    let (mut producer, mut consumer) = RingBuffer::<u64>::new(config.capacity)?;
    let barrier = Arc::new(Barrier::new(3));
    debug!(messages, capacity = config.capacity, "spsc run starting");

    let mut delays = DelayScript::new(config.seed, 0, config.max_delay);
    let prod_barrier = Arc::clone(&barrier);
    let producer = thread::spawn(move || {
        prod_barrier.wait();
        for value in 0..messages {
            let mut spins = 0;
            let mut pending = value;
            while let Err(Full(rejected)) = producer.push(pending) {
                pending = rejected;
                backoff(&mut spins);
            }
            delays.pause();
        }
    });

    let mut delays = DelayScript::new(config.seed, 1, config.max_delay);
    let cons_barrier = Arc::clone(&barrier);
    let consumer = thread::spawn(move || {
        let mut audit = SequenceAudit::new(slots);
        let mut received = 0;
        cons_barrier.wait();
        while received < messages {
            let mut spins = 0;
            loop {
                match consumer.pop() {
                    Ok(value) => {
                        audit.observe(value);
                        received += 1;
                        break;
                    }
                    // A vanished producer means nothing else is coming.
                    Err(_) if consumer.is_abandoned() && consumer.is_empty() => {
                        return audit.finish();
                    }
                    Err(_) => backoff(&mut spins),
                }
            }
            delays.pause();
        }
        audit.finish()
    });

    barrier.wait();
    let start = Instant::now();
    join(producer);
    let anomalies = join(consumer);
    let report = Report {
        label: "spsc ring buffer",
        messages,
        elapsed: start.elapsed(),
        anomalies,
    };
    log_report(&report);
    Ok(report)
}

/// `producers` threads push disjoint ranges covering `0..messages` into an unbounded queue while
/// `consumers` threads drain it until production is over and the queue reads empty. Every value
/// must come out exactly once.
pub fn run_mpmc(config: &StressConfig) -> Result<Report, QueueError> {
    config.validate()?;
    let messages = config.messages;
    let slots = config.message_slots()?;
    let share = messages / config.producers as u64;
    let remainder = messages % config.producers as u64;
    let queue = Arc::new(UnboundedQueue::<u64>::new());
    let barrier = Arc::new(Barrier::new(config.producers + config.consumers + 1));
    let producing = Arc::new(AtomicBool::new(true));
    debug!(
        messages,
        producers = config.producers,
        consumers = config.consumers,
        "mpmc run starting"
    );

    let producers: Vec<_> = (0..config.producers)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let mut delays = DelayScript::new(config.seed, p as u64, config.max_delay);
            let first = p as u64 * share;
            let count = if p + 1 == config.producers {
                share + remainder
            } else {
                share
            };
            thread::spawn(move || {
                barrier.wait();
                for value in first..first + count {
                    queue.push(value);
                    delays.pause();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..config.consumers)
        .map(|c| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let producing = Arc::clone(&producing);
            let stream = (config.producers + c) as u64;
            let mut delays = DelayScript::new(config.seed, stream, config.max_delay);
            thread::spawn(move || {
                let mut received = Vec::new();
                let mut spins = 0;
                barrier.wait();
                loop {
                    match queue.pop() {
                        Ok(value) => {
                            received.push(value);
                            spins = 0;
                            delays.pause();
                        }
                        Err(_) if !producing.load(Ordering::Acquire) && queue.is_empty() => {
                            break;
                        }
                        Err(_) => backoff(&mut spins),
                    }
                }
                received
            })
        })
        .collect();

    barrier.wait();
    let start = Instant::now();
    for handle in producers {
        join(handle);
    }
    producing.store(false, Ordering::Release);

    let mut audit = ConservationAudit::new(slots);
    for handle in consumers {
        for value in join(handle) {
            audit.observe(value);
        }
    }
    let report = Report {
        label: "mpmc unbounded queue",
        messages,
        elapsed: start.elapsed(),
        anomalies: audit.finish(),
    };
    log_report(&report);
    Ok(report)
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn log_report(report: &Report) {
    for anomaly in report.anomalies.iter().take(16) {
        warn!(label = report.label, %anomaly, "stress anomaly");
    }
    info!(
        label = report.label,
        messages = report.messages,
        elapsed_us = report.elapsed.as_micros() as u64,
        anomalies = report.anomalies.len(),
        "stress run finished"
    );
}

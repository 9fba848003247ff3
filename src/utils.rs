use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    bytes: u64,
}

/// Running event and byte totals for one side of the data path.
///
/// Besides the totals it keeps the readouts of the last `span` so the
/// progress line can show a live throughput next to the run average.
#[derive(Debug, Clone)]
pub struct Counter {
    pub events: u64,
    pub bytes: u64,
    /// Start of counting (creation or last `clear`)
    pub since: Instant,

    span: Duration,
    recent: VecDeque<Sample>,
    recent_bytes: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_span(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    fn with_span(span: Duration) -> Self {
        Self {
            events: 0,
            bytes: 0,
            since: Instant::now(),
            span,
            recent: VecDeque::new(),
            recent_bytes: 0,
        }
    }

    /// Adds `events` events carrying `bytes` bytes.
    pub fn record(&mut self, events: u64, bytes: u64) {
        let now = Instant::now();
        self.events += events;
        self.bytes += bytes;
        self.recent.push_back(Sample { at: now, bytes });
        self.recent_bytes += bytes;
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.recent.front().copied() {
            if now.duration_since(oldest.at) <= self.span {
                break;
            }
            self.recent.pop_front();
            self.recent_bytes -= oldest.bytes;
        }
    }

    /// MB/s over the last `span`.
    pub fn live_rate(&self) -> f64 {
        per_second(self.recent_bytes as f64 / MIB, self.span.as_secs_f64())
    }

    /// MB/s since `since`.
    pub fn mean_rate(&self) -> f64 {
        per_second(self.bytes as f64 / MIB, self.since.elapsed().as_secs_f64())
    }

    pub fn clear(&mut self) {
        *self = Self::with_span(self.span);
    }
}

/// Data read from the board and data written to the output, kept apart.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub read: Counter,
    pub written: Counter,
}

impl RunCounters {
    pub fn clear(&mut self) {
        self.read.clear();
        self.written.clear();
    }
}

/// Per-second rate, zero when no time has elapsed.
pub fn per_second(value: f64, secs: f64) -> f64 {
    if secs > 0.0 {
        value / secs
    } else {
        0.0
    }
}

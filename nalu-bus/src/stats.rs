//! Rolling decode statistics.
//!
//! Counters are plain atomics so the ingest and feeder threads never wait on
//! each other to count. Timing sums and the window baseline sit behind one
//! mutex that is only held for an add or for computing a snapshot.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DecodingStats {
    pub current_fps: f32,
    pub current_kbits_per_second: f32,
    pub avg_parse_time_ms: f32,
    pub avg_wait_for_input_time_ms: f32,
    pub avg_decode_time_ms: f32,
    pub units_received: u64,
    pub units_fed: u64,
    pub units_dropped: u64,
    pub units_unparseable: u64,
    pub decode_failures: u64,
    pub frames_decoded: u64,
    pub bytes_received: u64,
}

impl std::fmt::Display for DecodingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fps: {:.1}, kbit/s: {:.1}, parse: {:.2}ms, wait: {:.2}ms, decode: {:.2}ms, units: {} received / {} fed / {} dropped / {} unparseable",
            self.current_fps,
            self.current_kbits_per_second,
            self.avg_parse_time_ms,
            self.avg_wait_for_input_time_ms,
            self.avg_decode_time_ms,
            self.units_received,
            self.units_fed,
            self.units_dropped,
            self.units_unparseable
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Avg {
    sum: Duration,
    count: u64,
}

impl Avg {
    fn add(&mut self, d: Duration) {
        self.sum += d;
        self.count += 1;
    }

    fn avg_ms(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum.as_secs_f32() * 1000.0 / self.count as f32
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Rates {
    fps: f32,
    kbps: f32,
    parse_ms: f32,
    wait_ms: f32,
    decode_ms: f32,
}

struct Window {
    started: Instant,
    bytes_base: u64,
    frames_base: u64,
    parse: Avg,
    wait: Avg,
    decode: Avg,
}

impl Window {
    fn new(started: Instant, bytes_base: u64, frames_base: u64) -> Self {
        Self {
            started,
            bytes_base,
            frames_base,
            parse: Avg::default(),
            wait: Avg::default(),
            decode: Avg::default(),
        }
    }

    fn rates(&self, elapsed: Duration, bytes: u64, frames: u64) -> Rates {
        let secs = elapsed.as_secs_f32();
        let (fps, kbps) = if secs > 0.0 {
            (
                frames.saturating_sub(self.frames_base) as f32 / secs,
                bytes.saturating_sub(self.bytes_base) as f32 * 8.0 / 1000.0 / secs,
            )
        } else {
            (0.0, 0.0)
        };
        Rates {
            fps,
            kbps,
            parse_ms: self.parse.avg_ms(),
            wait_ms: self.wait.avg_ms(),
            decode_ms: self.decode.avg_ms(),
        }
    }
}

struct Rolling {
    current: Window,
    published: Option<Rates>,
}

pub struct StatsAggregator {
    window: Duration,
    bytes_received: AtomicU64,
    units_received: AtomicU64,
    units_fed: AtomicU64,
    units_dropped: AtomicU64,
    units_unparseable: AtomicU64,
    decode_failures: AtomicU64,
    frames_decoded: AtomicU64,
    rolling: Mutex<Rolling>,
}

impl StatsAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            bytes_received: AtomicU64::new(0),
            units_received: AtomicU64::new(0),
            units_fed: AtomicU64::new(0),
            units_dropped: AtomicU64::new(0),
            units_unparseable: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            rolling: Mutex::new(Rolling {
                current: Window::new(Instant::now(), 0, 0),
                published: None,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn record_bytes(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A unit left the framer. `parse` is the time from its first byte
    /// arriving to the boundary being found.
    pub fn record_received(&self, parse: Duration) {
        self.units_received.fetch_add(1, Ordering::Relaxed);
        self.with_window(|w| w.parse.add(parse));
    }

    /// Counts as received too, so nothing disappears from the totals.
    pub fn record_unparseable(&self) {
        self.units_received.fetch_add(1, Ordering::Relaxed);
        self.units_unparseable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: u64) {
        self.units_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_fed(&self, wait: Duration, decode: Duration) {
        self.units_fed.fetch_add(1, Ordering::Relaxed);
        self.with_window(|w| {
            w.wait.add(wait);
            w.decode.add(decode);
        });
    }

    pub fn record_frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn units_received(&self) -> u64 {
        self.units_received.load(Ordering::Relaxed)
    }

    pub fn units_parsed(&self) -> u64 {
        self.units_received()
            .saturating_sub(self.units_unparseable.load(Ordering::Relaxed))
    }

    /// Units framed but neither fed, dropped nor rejected yet: the ones
    /// sitting in the queue or in the feeder's hands.
    pub fn in_flight(&self) -> u64 {
        let settled = self.units_fed.load(Ordering::Acquire)
            + self.units_dropped.load(Ordering::Acquire)
            + self.units_unparseable.load(Ordering::Acquire);
        self.units_received.load(Ordering::Acquire).saturating_sub(settled)
    }

    /// Closes the current window if it has run its length, then reports the
    /// most recently closed window. Until the first window closes the
    /// partial one is reported.
    pub fn snapshot(&self) -> DecodingStats {
        let now = Instant::now();
        let bytes = self.bytes_received.load(Ordering::Relaxed);
        let frames = self.frames_decoded.load(Ordering::Relaxed);

        let rates = {
            let mut rolling = self.rolling.lock().unwrap_or_else(|e| e.into_inner());
            let elapsed = now.saturating_duration_since(rolling.current.started);
            if elapsed >= self.window {
                let rates = rolling.current.rates(elapsed, bytes, frames);
                rolling.published = Some(rates);
                rolling.current = Window::new(now, bytes, frames);
                rates
            } else {
                match rolling.published {
                    Some(rates) => rates,
                    None => rolling.current.rates(elapsed, bytes, frames),
                }
            }
        };

        DecodingStats {
            current_fps: rates.fps,
            current_kbits_per_second: rates.kbps,
            avg_parse_time_ms: rates.parse_ms,
            avg_wait_for_input_time_ms: rates.wait_ms,
            avg_decode_time_ms: rates.decode_ms,
            units_received: self.units_received.load(Ordering::Relaxed),
            units_fed: self.units_fed.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            units_unparseable: self.units_unparseable.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            frames_decoded: frames,
            bytes_received: bytes,
        }
    }

    fn with_window(&self, f: impl FnOnce(&mut Window)) {
        let mut rolling = self.rolling.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rolling.current);
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;

//! Plot/scope subscription manager
//!
//! Samples expressions at fixed per-series rates to build numeric time
//! series for charting. Multiple consumers may subscribe the same
//! `(expression, rate)` pair; series are reference-counted under the key
//! `"<rate>:<expression>"`.
//!
//! Each series keeps a bounded rolling buffer (trimmed to twice its display
//! window and hard-capped by [`MAX_SERIES_SAMPLES`]) and can be resampled on
//! demand into a fixed-length window for display. Pausing a series freezes
//! the query window's right edge and takes the series out of the sampling
//! rotation; an evaluation already in flight still records its sample.
//!
//! # Sampling overlap
//!
//! A per-series `busy` flag guarantees that no two samples for the same
//! series are in flight at once: while an evaluation is outstanding, due
//! ticks *skip* that series rather than queuing a catch-up sample, so the
//! nominal rate is an upper bound.

use crate::config::RemoteConfig;
use crate::session::RemoteSession;
use crate::types::{RefreshEvent, Sample};
use crossbeam_channel::Sender;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Fixed sampling scan tick; per-series due times gate actual evaluations
pub const SCOPE_SCAN_INTERVAL: Duration = Duration::from_millis(50);

/// Absolute cap on retained samples per series, oldest trimmed first
pub const MAX_SERIES_SAMPLES: usize = 10_000;

/// Key for a `(rate, expression)` series, as exposed in snapshots.
pub fn series_key(rate_hz: f64, expression: &str) -> String {
    format!("{}:{}", rate_hz, expression)
}

/// Parse a textual evaluation result as a sample value.
///
/// Tries JSON first (the remote encodes plain numbers as JSON scalars), then
/// falls back to numeric coercion. Non-finite results are discarded.
pub fn parse_sample_value(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let value = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.as_f64())
        .or_else(|| trimmed.parse::<f64>().ok())?;
    value.is_finite().then_some(value)
}

/// Bounded, time-ordered sample buffer with windowed resampling
#[derive(Debug, Clone, Default)]
pub struct SeriesBuffer {
    samples: VecDeque<Sample>,
}

impl SeriesBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest retained sample, if any.
    pub fn oldest(&self) -> Option<Sample> {
        self.samples.front().copied()
    }

    /// Append a sample, then enforce the retention bounds: samples older
    /// than twice the display window are dropped, and the buffer never
    /// exceeds [`MAX_SERIES_SAMPLES`].
    ///
    /// A sample older than the current tail would break time ordering and is
    /// discarded.
    pub fn push(&mut self, sample: Sample, window_ms: u64) {
        if let Some(last) = self.samples.back() {
            if sample.at_ms < last.at_ms {
                tracing::trace!(at_ms = sample.at_ms, "out-of-order sample discarded");
                return;
            }
        }
        self.samples.push_back(sample);

        let cutoff = sample.at_ms.saturating_sub(window_ms.saturating_mul(2));
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.at_ms < cutoff)
        {
            self.samples.pop_front();
        }
        while self.samples.len() > MAX_SERIES_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Produce exactly `count` evenly spaced values covering the window
    /// `[end_ms - window_ms, end_ms]` by a forward-scanning merge.
    ///
    /// For each target time, the nearest retained sample *by side* is used:
    /// with a preceding and a following sample, the fractional position
    /// within the interval selects the earlier value below `0.5` and the
    /// later value otherwise (step/hold with the threshold at the midpoint).
    /// With only one side available, that side's value is used. With no
    /// samples at all, the output is `NaN`, which consumers must treat as
    /// "no data, skip point".
    pub fn resample(&self, end_ms: u64, window_ms: u64, count: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }

        let end = end_ms as f64;
        let start = end_ms.saturating_sub(window_ms) as f64;
        let step = if count > 1 {
            (end - start) / (count - 1) as f64
        } else {
            0.0
        };

        // Forward scan: targets are ascending, so the cursor never rewinds
        let mut idx = 0usize;
        for i in 0..count {
            let target = if count > 1 { start + step * i as f64 } else { end };
            while idx < self.samples.len() && (self.samples[idx].at_ms as f64) < target {
                idx += 1;
            }
            let after = self.samples.get(idx);
            let before = idx.checked_sub(1).and_then(|j| self.samples.get(j));

            let value = match (before, after) {
                (None, None) => f64::NAN,
                (None, Some(after)) => after.value,
                (Some(before), None) => before.value,
                (Some(before), Some(after)) => {
                    let span = after.at_ms.saturating_sub(before.at_ms) as f64;
                    if span <= 0.0 {
                        after.value
                    } else {
                        let frac = (target - before.at_ms as f64) / span;
                        if frac < 0.5 {
                            before.value
                        } else {
                            after.value
                        }
                    }
                }
            };
            out.push(value);
        }
        out
    }
}

/// One reference-counted `(expression, rate)` series
struct Series {
    expression: String,
    rate_hz: f64,
    /// Resampled output length; also sets the display window via
    /// `sample_count / rate_hz` seconds
    sample_count: usize,
    buffer: SeriesBuffer,
    last_sample_at: Option<u64>,
    ref_count: usize,
    /// An evaluation for this series is in flight; due ticks skip it
    busy: bool,
    paused: bool,
    /// Frozen right edge for snapshot queries while paused
    paused_at_ms: Option<u64>,
}

impl Series {
    fn window_ms(&self) -> u64 {
        ((self.sample_count as f64 / self.rate_hz) * 1000.0) as u64
    }

    fn sample_interval_ms(&self) -> u64 {
        (1000.0 / self.rate_hz).floor() as u64
    }

    fn due(&self, now_ms: u64) -> bool {
        if self.busy || self.paused {
            return false;
        }
        match self.last_sample_at {
            Some(last) => now_ms.saturating_sub(last) >= self.sample_interval_ms(),
            None => true,
        }
    }
}

/// Fixed-length resampled view of one series
#[derive(Debug, Clone)]
pub struct ScopeSeriesSnapshot {
    /// The sampled expression
    pub expression: String,
    /// Nominal sample rate in Hz
    pub rate_hz: f64,
    /// Exactly `sample_count` values; `NaN` marks a gap
    pub values: Vec<f64>,
    /// Left edge of the window, in manager-clock milliseconds
    pub start_time: u64,
    /// Right edge of the window (frozen while paused)
    pub end_time: u64,
}

struct ScopeState {
    series: HashMap<String, Series>,
}

/// Samples subscribed expressions into per-series rolling buffers
pub struct ScopeManager {
    session: Arc<RemoteSession>,
    state: Mutex<ScopeState>,
    refresh_tx: Sender<RefreshEvent>,
    /// Zero point of the manager's millisecond clock
    epoch: Instant,
    default_rate_hz: f64,
    default_sample_count: usize,
    running: AtomicBool,
}

impl ScopeManager {
    /// Create a manager sampling through the given session.
    pub fn new(
        session: Arc<RemoteSession>,
        refresh_tx: Sender<RefreshEvent>,
        config: &RemoteConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            state: Mutex::new(ScopeState {
                series: HashMap::new(),
            }),
            refresh_tx,
            epoch: Instant::now(),
            default_rate_hz: config.scope_rate_hz,
            default_sample_count: config.scope_sample_count.max(1),
            running: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Fall back to the default rate for missing or invalid rates.
    fn normalize_rate(&self, rate_hz: Option<f64>) -> f64 {
        match rate_hz {
            Some(rate) if rate.is_finite() && rate > 0.0 => rate,
            _ => self.default_rate_hz,
        }
    }

    /// Reference-count a series subscription; the first subscriber fixes the
    /// series' rate and output length.
    pub fn subscribe(&self, expression: &str, rate_hz: Option<f64>, sample_count: Option<usize>) {
        let rate = self.normalize_rate(rate_hz);
        let key = series_key(rate, expression);
        let mut state = self.lock();
        let series = state.series.entry(key).or_insert_with(|| Series {
            expression: expression.to_string(),
            rate_hz: rate,
            sample_count: sample_count.unwrap_or(self.default_sample_count).max(1),
            buffer: SeriesBuffer::new(),
            last_sample_at: None,
            ref_count: 0,
            busy: false,
            paused: false,
            paused_at_ms: None,
        });
        series.ref_count += 1;
    }

    /// Drop one reference; the last reference destroys the series and its
    /// samples.
    pub fn unsubscribe(&self, expression: &str, rate_hz: Option<f64>) {
        let key = series_key(self.normalize_rate(rate_hz), expression);
        let mut state = self.lock();
        let Some(series) = state.series.get_mut(&key) else {
            return;
        };
        series.ref_count -= 1;
        if series.ref_count == 0 {
            state.series.remove(&key);
        }
    }

    /// Freeze (or unfreeze) the snapshot window for one series.
    ///
    /// Paused series are skipped by subsequent sampling ticks; an in-flight
    /// evaluation is not cancelled.
    pub fn set_paused(&self, expression: &str, rate_hz: Option<f64>, paused: bool) {
        let key = series_key(self.normalize_rate(rate_hz), expression);
        let now = self.now_ms();
        let mut state = self.lock();
        let Some(series) = state.series.get_mut(&key) else {
            return;
        };
        if paused && !series.paused {
            series.paused_at_ms = Some(now);
        } else if !paused {
            series.paused_at_ms = None;
        }
        series.paused = paused;
    }

    /// Resampled view of every active series, keyed by `"<rate>:<expr>"`.
    pub fn snapshot(&self) -> HashMap<String, ScopeSeriesSnapshot> {
        let now = self.now_ms();
        let state = self.lock();
        state
            .series
            .iter()
            .map(|(key, series)| {
                let end_time = series.paused_at_ms.unwrap_or(now);
                let window_ms = series.window_ms();
                (
                    key.clone(),
                    ScopeSeriesSnapshot {
                        expression: series.expression.clone(),
                        rate_hz: series.rate_hz,
                        values: series.buffer.resample(end_time, window_ms, series.sample_count),
                        start_time: end_time.saturating_sub(window_ms),
                        end_time,
                    },
                )
            })
            .collect()
    }

    /// Spawn the sampling loop. Stop it with [`ScopeManager::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCOPE_SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while manager.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.tick();
            }
            tracing::debug!("scope manager stopped");
        })
    }

    /// Stop the sampling loop after its current tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One sampling tick: kick off an evaluation for every due series.
    fn tick(self: &Arc<Self>) {
        if !self.session.is_connected() {
            // Keep the subscriptions, drop the stale samples
            let cleared = {
                let mut state = self.lock();
                let mut cleared = false;
                for series in state.series.values_mut() {
                    if !series.buffer.is_empty() || series.last_sample_at.is_some() {
                        series.buffer.clear();
                        series.last_sample_at = None;
                        cleared = true;
                    }
                }
                cleared
            };
            if cleared {
                let _ = self.refresh_tx.send(RefreshEvent::Scope);
            }
            return;
        }

        let now = self.now_ms();
        let due: Vec<(String, String)> = {
            let mut state = self.lock();
            state
                .series
                .iter_mut()
                .filter(|(_, series)| series.due(now))
                .map(|(key, series)| {
                    series.busy = true;
                    (key.clone(), series.expression.clone())
                })
                .collect()
        };

        for (key, expression) in due {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.sample_series(key, expression).await;
            });
        }
    }

    /// Evaluate one series' expression and record the sample.
    ///
    /// `busy` is cleared and `last_sample_at` updated only after the
    /// evaluation settles, so a slow remote cannot cause overlapping samples
    /// for the same series.
    async fn sample_series(&self, key: String, expression: String) {
        let result = self.session.eval_expr(&expression).await;
        let now = self.now_ms();

        let mut state = self.lock();
        let Some(series) = state.series.get_mut(&key) else {
            // Unsubscribed while the evaluation was in flight
            return;
        };
        series.busy = false;
        series.last_sample_at = Some(now);

        match result {
            Ok(text) => match parse_sample_value(&text) {
                Some(value) => {
                    let window_ms = series.window_ms();
                    series.buffer.push(Sample::new(now, value), window_ms);
                }
                None => {
                    tracing::trace!(expression = %series.expression, %text, "non-numeric result, no sample");
                }
            },
            Err(e) => {
                tracing::debug!(expression = %series.expression, error = %e, "scope sample failed");
            }
        }
    }

    #[cfg(test)]
    fn inject_sample(&self, key: &str, sample: Sample) {
        let mut state = self.lock();
        if let Some(series) = state.series.get_mut(key) {
            let window_ms = series.window_ms();
            series.buffer.push(sample, window_ms);
        }
    }
}

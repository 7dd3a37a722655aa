//! Workout session state machine.
//!
//! Owns the retained samples of one session, smooths power, detects
//! auto-pause and computes the summary on finalize.

use crate::metrics::smoothing::RollingAverage;
use crate::recording::types::{
    IngestOutcome, PauseInterval, SessionConfig, SessionRecord, SessionState, SessionSummary,
};
use crate::sensors::types::{DeviceKind, Sample};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Activity metric values below this count as idle.
const IDLE_THRESHOLD: f32 = 0.5;

/// A single workout session from start to a terminal state.
pub struct WorkoutSession {
    id: Uuid,
    kind: DeviceKind,
    config: SessionConfig,
    started_at: DateTime<Utc>,
    state: SessionState,
    samples: Vec<Sample>,
    pauses: Vec<PauseInterval>,
    power_filter: RollingAverage,
    /// Timestamp of the first idle sample in the current idle run
    idle_since: Option<DateTime<Utc>>,
}

impl WorkoutSession {
    /// Begin a session in Recording.
    pub fn new(id: Uuid, kind: DeviceKind, started_at: DateTime<Utc>, config: SessionConfig) -> Self {
        let power_filter = RollingAverage::new(config.smoothing_window);
        Self {
            id,
            kind,
            config,
            started_at,
            state: SessionState::Recording,
            samples: Vec::new(),
            pauses: Vec::new(),
            power_filter,
            idle_since: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn pauses(&self) -> &[PauseInterval] {
        &self.pauses
    }

    pub fn last_sample(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Apply one sample.
    ///
    /// The sample is retained with smoothed power and monotone distance and
    /// calories. Terminal sessions and samples from another device kind are
    /// ignored.
    pub fn ingest(&mut self, mut sample: Sample) -> IngestOutcome {
        if self.state.is_terminal() {
            tracing::warn!(session_id = %self.id, state = %self.state, "Sample for finished session ignored");
            return IngestOutcome::Ignored;
        }
        if sample.kind != self.kind {
            tracing::warn!(
                session_id = %self.id,
                expected = %self.kind,
                got = %sample.kind,
                "Sample from wrong device kind rejected"
            );
            return IngestOutcome::Ignored;
        }

        let smoothed = sample.power_watts.map(|p| self.power_filter.add(p));
        sample.power_watts = smoothed.map(|p| p.round() as i16);

        if let Some(last) = self.samples.iter().rev().find_map(|s| s.distance_m) {
            sample.distance_m = sample.distance_m.map(|d| d.max(last));
        }
        if let Some(last) = self.samples.iter().rev().find_map(|s| s.calories_kcal) {
            sample.calories_kcal = sample.calories_kcal.map(|c| c.max(last));
        }

        let metric = match self.kind {
            DeviceKind::Bike => smoothed,
            DeviceKind::Rower => sample.stroke_rate_spm,
        };
        let timestamp = sample.timestamp;
        self.samples.push(sample);

        let outcome = self.track_activity(metric, timestamp);

        let elapsed = (timestamp - self.started_at).to_std().unwrap_or_default();
        if elapsed >= self.config.max_duration() {
            tracing::info!(session_id = %self.id, "Maximum session duration reached");
            return IngestOutcome::Completed(Box::new(self.finish(Utc::now())));
        }

        outcome
    }

    fn track_activity(&mut self, metric: Option<f32>, at: DateTime<Utc>) -> IngestOutcome {
        let Some(metric) = metric else {
            return IngestOutcome::Appended;
        };

        if metric < IDLE_THRESHOLD {
            let since = *self.idle_since.get_or_insert(at);
            let Some(threshold) = self.config.auto_pause_threshold() else {
                return IngestOutcome::Appended;
            };
            let idle = (at - since).to_std().unwrap_or_default();
            if self.state == SessionState::Recording && idle > threshold {
                self.enter_pause(at);
                tracing::info!(session_id = %self.id, "Auto-paused after {:?} idle", idle);
                return IngestOutcome::Paused;
            }
            IngestOutcome::Appended
        } else {
            self.idle_since = None;
            if self.state == SessionState::Paused {
                self.state = SessionState::Recording;
                if let Some(open) = self.pauses.last_mut().filter(|p| p.ended_at.is_none()) {
                    open.ended_at = Some(at);
                }
                tracing::info!(session_id = %self.id, "Resumed recording");
                return IngestOutcome::Resumed;
            }
            IngestOutcome::Appended
        }
    }

    fn enter_pause(&mut self, at: DateTime<Utc>) {
        self.state = SessionState::Paused;
        self.pauses.push(PauseInterval {
            started_at: at,
            ended_at: None,
        });
    }

    /// Pause from outside, e.g. when the link has failed.
    ///
    /// Returns false unless the session was Recording.
    pub fn pause(&mut self, at: DateTime<Utc>) -> bool {
        if self.state != SessionState::Recording {
            return false;
        }
        self.enter_pause(at);
        tracing::info!(session_id = %self.id, "Paused recording");
        true
    }

    /// Complete the session and compute its summary.
    ///
    /// The end time is the last sample's timestamp, or `now` when no sample
    /// was retained.
    pub fn finish(&mut self, now: DateTime<Utc>) -> SessionRecord {
        let ended_at = self
            .samples
            .last()
            .map(|s| s.timestamp)
            .unwrap_or(now)
            .max(self.started_at);
        self.close_pause(ended_at);
        self.state = SessionState::Completed;

        let summary = summarize(self.started_at, ended_at, &self.samples, &self.pauses);
        tracing::info!(
            session_id = %self.id,
            samples = self.samples.len(),
            elapsed_secs = summary.total_elapsed_secs,
            "Session completed"
        );
        self.to_record(ended_at, Some(summary), None)
    }

    /// Abandon the session without a summary.
    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) -> SessionRecord {
        let ended_at = now.max(self.started_at);
        self.close_pause(ended_at);
        self.state = SessionState::Aborted;
        tracing::warn!(session_id = %self.id, reason, "Session aborted");
        self.to_record(ended_at, None, Some(reason.to_string()))
    }

    fn close_pause(&mut self, at: DateTime<Utc>) {
        if let Some(open) = self.pauses.last_mut().filter(|p| p.ended_at.is_none()) {
            open.ended_at = Some(at.max(open.started_at));
        }
    }

    fn to_record(
        &mut self,
        ended_at: DateTime<Utc>,
        summary: Option<SessionSummary>,
        abort_reason: Option<String>,
    ) -> SessionRecord {
        SessionRecord {
            id: self.id,
            kind: self.kind,
            started_at: self.started_at,
            ended_at: Some(ended_at),
            state: self.state,
            abort_reason,
            summary,
            samples: std::mem::take(&mut self.samples),
            pauses: self.pauses.clone(),
        }
    }
}

/// Running mean and maximum for one optional field.
struct FieldStats {
    sum: f64,
    count: u32,
    max: Option<f64>,
}

impl FieldStats {
    fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            max: None,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }

    fn max(&self) -> Option<f64> {
        self.max
    }
}

/// Compute the summary over retained samples.
pub fn summarize(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    samples: &[Sample],
    pauses: &[PauseInterval],
) -> SessionSummary {
    let mut power = FieldStats::new();
    let mut cadence = FieldStats::new();
    let mut stroke_rate = FieldStats::new();
    let mut heart_rate = FieldStats::new();
    let mut speed = FieldStats::new();

    for sample in samples {
        power.push(sample.power_watts.map(f64::from));
        cadence.push(sample.cadence_rpm.map(f64::from));
        stroke_rate.push(sample.stroke_rate_spm.map(f64::from));
        heart_rate.push(sample.heart_rate_bpm.map(f64::from));
        speed.push(sample.speed_kmh.map(f64::from));
    }

    let elapsed = (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let paused: i64 = pauses
        .iter()
        .map(|p| p.duration(ended_at).num_milliseconds())
        .sum();
    let timer = (elapsed - paused as f64 / 1000.0).max(0.0);

    SessionSummary {
        total_elapsed_secs: elapsed,
        total_timer_secs: timer,
        avg_power: power.mean(),
        max_power: power.max().map(|v| v as i16),
        avg_cadence: cadence.mean(),
        max_cadence: cadence.max().map(|v| v as f32),
        avg_stroke_rate: stroke_rate.mean(),
        max_stroke_rate: stroke_rate.max().map(|v| v as f32),
        avg_heart_rate: heart_rate.mean(),
        max_heart_rate: heart_rate.max().map(|v| v as u8),
        avg_speed_kmh: speed.mean(),
        max_speed_kmh: speed.max().map(|v| v as f32),
        total_distance_m: samples.iter().filter_map(|s| s.distance_m).max(),
        total_calories: samples.iter().filter_map(|s| s.calories_kcal).max(),
        total_strokes: samples.iter().filter_map(|s| s.stroke_count).max(),
        pause_count: pauses.len() as u32,
    }
}

//! Unit tests for workout session recording and summaries.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ftmsbridge::recording::recorder::SessionRecorder;
use ftmsbridge::recording::types::{
    IngestOutcome, SessionConfig, SessionError, SessionRecord, SessionState,
};
use ftmsbridge::sensors::types::{DeviceKind, Sample};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 2, 18, 30, 0).unwrap()
}

fn bike(secs: i64, power: i16, cadence: f32) -> Sample {
    let mut s = Sample::new(DeviceKind::Bike, t0() + Duration::seconds(secs));
    s.power_watts = Some(power);
    s.cadence_rpm = Some(cadence);
    s.speed_kmh = Some(power as f32 / 5.0);
    s.distance_m = Some((secs * 8) as u32);
    s
}

fn rower(secs: i64, stroke_rate: f32, strokes: u16) -> Sample {
    let mut s = Sample::new(DeviceKind::Rower, t0() + Duration::seconds(secs));
    s.stroke_rate_spm = Some(stroke_rate);
    s.stroke_count = Some(strokes);
    s.power_watts = Some(if stroke_rate > 0.0 { 180 } else { 0 });
    s
}

fn record_session(recorder: &mut SessionRecorder, samples: Vec<Sample>) -> SessionRecord {
    for sample in samples {
        recorder.ingest(sample);
    }
    recorder.end().unwrap()
}

/// 90 seconds of steady riding at 150 W and 80 RPM with no heart rate strap.
#[test]
fn test_steady_bike_session_summary() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let record = record_session(
        &mut recorder,
        (1..=90).map(|t| bike(t, 150, 80.0)).collect(),
    );

    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.samples.len(), 90);
    assert_eq!(record.ended_at, Some(t0() + Duration::seconds(90)));

    let summary = record.summary.unwrap();
    assert_eq!(summary.total_elapsed_secs, 90.0);
    assert_eq!(summary.total_timer_secs, 90.0);
    assert_eq!(summary.avg_power, Some(150.0));
    assert_eq!(summary.max_power, Some(150));
    assert_eq!(summary.avg_cadence, Some(80.0));
    assert_eq!(summary.max_cadence, Some(80.0));
    assert_eq!(summary.avg_heart_rate, None);
    assert_eq!(summary.max_heart_rate, None);
    assert_eq!(summary.avg_stroke_rate, None);
    assert_eq!(summary.total_distance_m, Some(720));
    assert_eq!(summary.pause_count, 0);
}

#[test]
fn test_idle_stretch_pauses_exactly_once() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let mut samples: Vec<Sample> = (0..20).map(|t| bike(t, 150, 80.0)).collect();
    samples.extend((20..80).map(|t| bike(t, 0, 0.0)));
    samples.extend((80..100).map(|t| bike(t, 150, 80.0)));

    let mut paused = 0;
    let mut resumed = 0;
    for sample in samples {
        match recorder.ingest(sample) {
            IngestOutcome::Paused => paused += 1,
            IngestOutcome::Resumed => resumed += 1,
            IngestOutcome::Appended => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(paused, 1);
    assert_eq!(resumed, 1);

    let record = recorder.end().unwrap();
    assert_eq!(record.pauses.len(), 1);
    let pause = record.pauses[0];
    let ended = pause.ended_at.unwrap();
    assert!(ended > pause.started_at);

    let summary = record.summary.unwrap();
    assert_eq!(summary.pause_count, 1);
    assert!(summary.total_timer_secs < summary.total_elapsed_secs);
    assert_eq!(
        summary.total_elapsed_secs - summary.total_timer_secs,
        (ended - pause.started_at).num_milliseconds() as f64 / 1000.0
    );
}

#[test]
fn test_short_idle_does_not_pause() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let mut samples: Vec<Sample> = (0..10).map(|t| bike(t, 150, 80.0)).collect();
    samples.extend((10..35).map(|t| bike(t, 0, 0.0)));
    samples.extend((35..45).map(|t| bike(t, 150, 80.0)));

    for sample in samples {
        assert!(matches!(recorder.ingest(sample), IngestOutcome::Appended));
    }
    assert_eq!(recorder.end().unwrap().pauses.len(), 0);
}

#[test]
fn test_rower_pauses_on_stroke_rate() {
    let config = SessionConfig {
        auto_pause_threshold_secs: 10,
        ..Default::default()
    };
    let mut recorder = SessionRecorder::new(config);
    recorder.start_at(DeviceKind::Rower, t0()).unwrap();

    let mut outcomes = Vec::new();
    for t in 0..10 {
        outcomes.push(recorder.ingest(rower(t, 24.0, t as u16 * 2)));
    }
    for t in 10..30 {
        outcomes.push(recorder.ingest(rower(t, 0.0, 20)));
    }
    for t in 30..35 {
        outcomes.push(recorder.ingest(rower(t, 26.0, 20 + (t - 30) as u16 * 2)));
    }

    let paused = outcomes.iter().filter(|o| **o == IngestOutcome::Paused).count();
    let resumed = outcomes.iter().filter(|o| **o == IngestOutcome::Resumed).count();
    assert_eq!((paused, resumed), (1, 1));
    // Idle from t=10, pause once idle exceeds 10 s
    assert_eq!(outcomes[21], IngestOutcome::Paused);
    assert_eq!(outcomes[30], IngestOutcome::Resumed);

    let summary = recorder.end().unwrap().summary.unwrap();
    assert_eq!(summary.total_strokes, Some(28));
    assert_eq!(summary.max_stroke_rate, Some(26.0));
    assert_eq!(summary.avg_cadence, None);
}

#[test]
fn test_second_start_leaves_first_session_alone() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    let first = recorder.start_at(DeviceKind::Bike, t0()).unwrap();
    for t in 0..3 {
        recorder.ingest(bike(t, 120, 70.0));
    }

    let err = recorder.start_at(DeviceKind::Rower, t0()).unwrap_err();
    assert_eq!(err, SessionError::SessionAlreadyActive(first));

    let status = recorder.status();
    assert_eq!(status.session_id, Some(first));
    assert_eq!(status.kind, Some(DeviceKind::Bike));
    assert_eq!(status.state, Some(SessionState::Recording));
    assert_eq!(status.sample_count, 3);
}

#[test]
fn test_new_session_after_end() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    let first = recorder.start_at(DeviceKind::Bike, t0()).unwrap();
    recorder.end().unwrap();

    let second = recorder.start(DeviceKind::Rower).unwrap();
    assert_ne!(first, second);
    assert_eq!(recorder.status().kind, Some(DeviceKind::Rower));
}

#[test]
fn test_maximum_duration_completes_session() {
    let config = SessionConfig {
        max_duration_secs: 60,
        ..Default::default()
    };
    let mut recorder = SessionRecorder::new(config);
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    for t in 0..60 {
        assert!(!matches!(
            recorder.ingest(bike(t, 150, 80.0)),
            IngestOutcome::Completed(_)
        ));
    }
    let IngestOutcome::Completed(record) = recorder.ingest(bike(60, 150, 80.0)) else {
        panic!("session should complete at the maximum duration");
    };

    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.samples.len(), 61);
    assert!(!recorder.is_active());
    assert_eq!(recorder.ingest(bike(61, 150, 80.0)), IngestOutcome::Ignored);
    assert_eq!(recorder.end().unwrap_err(), SessionError::NoActiveSession);
}

#[test]
fn test_aborted_session_has_reason_and_no_summary() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();
    recorder.ingest(bike(1, 150, 80.0));

    let record = recorder.abort("rider stopped").unwrap();
    assert_eq!(record.state, SessionState::Aborted);
    assert_eq!(record.abort_reason.as_deref(), Some("rider stopped"));
    assert!(record.summary.is_none());
    assert!(!recorder.is_active());
}

#[test]
fn test_aggregate_maximum_never_below_average() {
    let mut recorder = SessionRecorder::new(SessionConfig {
        smoothing_window: 1,
        ..Default::default()
    });
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let samples = (0..120)
        .map(|t| {
            let mut s = bike(t, 100 + ((t * 37) % 150) as i16, 60.0 + ((t * 13) % 40) as f32);
            if t % 3 == 0 {
                s.heart_rate_bpm = Some(120 + (t % 50) as u8);
            }
            s
        })
        .collect();
    let summary = record_session(&mut recorder, samples).summary.unwrap();

    assert!(summary.max_power.unwrap() as f32 >= summary.avg_power.unwrap());
    assert!(summary.max_cadence.unwrap() >= summary.avg_cadence.unwrap());
    assert!(summary.max_speed_kmh.unwrap() >= summary.avg_speed_kmh.unwrap());
    assert!(summary.max_heart_rate.unwrap() as f32 >= summary.avg_heart_rate.unwrap());
}

#[test]
fn test_smoothing_follows_window() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let record = record_session(
        &mut recorder,
        vec![
            bike(0, 100, 80.0),
            bike(1, 200, 80.0),
            bike(2, 300, 80.0),
            bike(3, 400, 80.0),
        ],
    );

    let powers: Vec<Option<i16>> = record.samples.iter().map(|s| s.power_watts).collect();
    assert_eq!(powers, vec![Some(100), Some(150), Some(200), Some(300)]);
}

#[test]
fn test_distance_never_decreases() {
    let mut recorder = SessionRecorder::new(SessionConfig::default());
    recorder.start_at(DeviceKind::Bike, t0()).unwrap();

    let mut glitch = bike(2, 150, 80.0);
    glitch.distance_m = Some(3);
    let record = record_session(
        &mut recorder,
        vec![bike(1, 150, 80.0), glitch, bike(3, 150, 80.0)],
    );

    let distances: Vec<Option<u32>> = record.samples.iter().map(|s| s.distance_m).collect();
    assert_eq!(distances, vec![Some(8), Some(8), Some(24)]);
}

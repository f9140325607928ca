//! Offline statistical pattern analysis over admitted-call history.
//!
//! Purely advisory: nothing here ever touches a window or a queue entry.
//! Analysis only runs for tenants whose tier grants may-learn-patterns;
//! callers are expected to check that before invoking `analyze`.
//!
//! Statistics are plain `f64` arithmetic — no external stats crate, to
//! keep the dependency surface aligned with the rest of the stack.

use chrono::{DateTime, Datelike, Timelike, Utc};
use quotaguard_core::{EventKind, Pattern, PatternKind};
use quotaguard_storage::QuotaStore;
use std::sync::Arc;
use tracing::debug;

const MORNING: (u32, u32) = (6, 12);
const AFTERNOON: (u32, u32) = (12, 18);
const EVENING: (u32, u32) = (18, 24);

#[derive(Debug, Clone)]
pub struct AnalysisSummary {
    pub patterns: Vec<Pattern>,
    pub overall_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub pattern: Pattern,
    pub recommendations: Vec<String>,
}

pub struct PatternDetector {
    store: Arc<dyn QuotaStore>,
}

impl PatternDetector {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Runs all three analyses over the tenant's `allowed` events from the
    /// last `lookback_days`. Returns `None` ("insufficient data") below
    /// `min_events` observations.
    pub fn analyze(
        &self,
        tenant_id: &str,
        lookback_days: i64,
        min_events: usize,
        confidence_threshold: f64,
    ) -> quotaguard_core::Result<Option<AnalysisSummary>> {
        let since = Utc::now() - chrono::Duration::days(lookback_days);
        let events = self.store.get_events(tenant_id, Some(EventKind::Allowed), since)?;

        if events.len() < min_events {
            debug!(tenant_id, count = events.len(), min_events, "insufficient data for pattern analysis");
            return Ok(None);
        }

        let timestamps: Vec<DateTime<Utc>> = events.iter().map(|e| e.timestamp).collect();
        let now = Utc::now();

        let mut patterns = Vec::new();
        if let Some(p) = hourly_pattern(tenant_id, &timestamps, now) {
            if p.confidence >= confidence_threshold {
                patterns.push(p);
            }
        }
        if let Some(p) = weekly_pattern(tenant_id, &timestamps, now) {
            if p.confidence >= confidence_threshold {
                patterns.push(p);
            }
        }
        if let Some(p) = burst_pattern(tenant_id, &timestamps, now) {
            if p.confidence >= confidence_threshold {
                patterns.push(p);
            }
        }

        for pattern in &patterns {
            self.store.upsert_pattern(pattern)?;
        }

        let overall_confidence = if patterns.is_empty() {
            0.0
        } else {
            let mean = patterns.iter().map(|p| p.confidence).sum::<f64>() / patterns.len() as f64;
            let bonus = if patterns.len() > 1 { 0.1 } else { 0.0 };
            (mean + bonus).min(1.0)
        };

        Ok(Some(AnalysisSummary { patterns, overall_confidence }))
    }

    /// Returns the tenant's stored pattern with the highest confidence,
    /// plus a short list of advisory recommendations derived from it and
    /// the current instant.
    pub fn predict_usage(&self, tenant_id: &str) -> quotaguard_core::Result<Option<Prediction>> {
        let patterns = self.store.get_patterns(tenant_id, 100)?;
        let Some(best) = patterns.into_iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence)) else {
            return Ok(None);
        };

        let mut recommendations = Vec::new();
        let now = Utc::now();
        match best.kind {
            PatternKind::TimeOfDay => {
                if in_window(now, MORNING) && best.label.contains("morning") {
                    recommendations.push("currently in peak window".to_string());
                } else if in_window(now, AFTERNOON) && best.label.contains("afternoon") {
                    recommendations.push("currently in peak window".to_string());
                } else if in_window(now, EVENING) && best.label.contains("evening") {
                    recommendations.push("currently in peak window".to_string());
                } else if !in_window(now, MORNING) && !in_window(now, AFTERNOON) && !in_window(now, EVENING)
                    && best.label.contains("night")
                {
                    recommendations.push("currently in peak window".to_string());
                }
            }
            PatternKind::DayOfWeek => {
                let is_weekend = now.weekday().num_days_from_monday() >= 5;
                if (is_weekend && best.label == "weekend-heavy") || (!is_weekend && best.label == "weekday-heavy") {
                    recommendations.push("currently in peak window".to_string());
                }
            }
            PatternKind::Burst => {
                if let Some(size) = best.suggested_queue_size {
                    recommendations.push(format!("bursty traffic — consider queue size {size}"));
                }
            }
        }

        Ok(Some(Prediction { pattern: best, recommendations }))
    }
}

fn in_window(ts: DateTime<Utc>, (start, end): (u32, u32)) -> bool {
    let hour = ts.hour();
    hour >= start && hour < end
}

fn mean_variance(counts: &[f64]) -> (f64, f64) {
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<f64>() / n;
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

fn hourly_pattern(tenant_id: &str, timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<Pattern> {
    let mut counts = [0i64; 24];
    for ts in timestamps {
        counts[ts.hour() as usize] += 1;
    }
    let counts_f: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
    let (mean, variance) = mean_variance(&counts_f);
    if mean == 0.0 {
        return None;
    }

    let peak_hours: Vec<u32> = (0..24u32)
        .filter(|&h| counts_f[h as usize] > 1.5 * mean)
        .collect();

    let label = if peak_hours.is_empty() {
        "no-clear-peak".to_string()
    } else {
        let mut windows = Vec::new();
        if peak_hours.iter().any(|&h| h >= MORNING.0 && h < MORNING.1) {
            windows.push("morning");
        }
        if peak_hours.iter().any(|&h| h >= AFTERNOON.0 && h < AFTERNOON.1) {
            windows.push("afternoon");
        }
        if peak_hours.iter().any(|&h| h >= EVENING.0 && h < EVENING.1) {
            windows.push("evening");
        }
        if peak_hours.iter().any(|&h| h < 6) {
            windows.push("night");
        }
        windows.join("+")
    };

    let max_count = *counts.iter().max().unwrap_or(&0);
    let peak_rpm = (max_count as f64 / 60.0).ceil() as i64;
    let suggested_limit = (peak_rpm as f64 * 1.2).ceil() as i64;
    let confidence = if peak_hours.is_empty() {
        0.3
    } else {
        (variance / mean * 0.5 + 0.3).min(1.0)
    };

    Some(Pattern {
        pattern_id: format!("{tenant_id}:hourly"),
        tenant_id: tenant_id.to_string(),
        kind: PatternKind::TimeOfDay,
        label,
        average_rpm: mean / 60.0,
        peak_rpm,
        confidence,
        suggested_limit: Some(suggested_limit),
        suggested_queue_size: None,
        observation_count: timestamps.len() as i64,
        first_detected: now,
        last_observed: now,
        description: format!("hourly usage peaks around {} with confidence {:.2}", peak_hours_str(&peak_hours), confidence),
    })
}

fn peak_hours_str(hours: &[u32]) -> String {
    if hours.is_empty() {
        "no consistent hour".to_string()
    } else {
        hours.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(", ")
    }
}

fn weekly_pattern(tenant_id: &str, timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<Pattern> {
    let mut counts = [0i64; 7];
    for ts in timestamps {
        counts[ts.weekday().num_days_from_monday() as usize] += 1;
    }
    let counts_f: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
    let (mean, variance) = mean_variance(&counts_f);
    if mean == 0.0 {
        return None;
    }

    let weekday_sum: f64 = counts_f[0..5].iter().sum();
    let weekend_sum: f64 = counts_f[5..7].iter().sum();
    let label = if weekday_sum > 1.5 * weekend_sum {
        "weekday-heavy"
    } else if weekend_sum > 1.5 * weekday_sum {
        "weekend-heavy"
    } else {
        "balanced"
    };

    let max_count = *counts.iter().max().unwrap_or(&0);
    let peak_rpm = (max_count as f64 / (24.0 * 60.0)).ceil() as i64;
    let confidence = (variance / mean * 0.4 + 0.4).min(1.0);

    Some(Pattern {
        pattern_id: format!("{tenant_id}:weekly"),
        tenant_id: tenant_id.to_string(),
        kind: PatternKind::DayOfWeek,
        label: label.to_string(),
        average_rpm: mean / (24.0 * 60.0),
        peak_rpm,
        confidence,
        suggested_limit: None,
        suggested_queue_size: None,
        observation_count: timestamps.len() as i64,
        first_detected: now,
        last_observed: now,
        description: format!("weekly traffic is {label} (confidence {confidence:.2})"),
    })
}

fn burst_pattern(tenant_id: &str, timestamps: &[DateTime<Utc>], now: DateTime<Utc>) -> Option<Pattern> {
    if timestamps.len() < 2 {
        return None;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let deltas: Vec<f64> = sorted
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
        .collect();

    let (mean, variance) = mean_variance(&deltas);
    if mean == 0.0 {
        return None;
    }
    let stdev = variance.sqrt();
    let cv = stdev / mean;

    let label = if cv > 1.0 {
        "bursty"
    } else if cv < 0.5 {
        "steady"
    } else {
        "mixed"
    };

    let suggested_queue_size = if cv > 2.0 {
        100
    } else if cv > 1.5 {
        50
    } else if cv > 1.0 {
        25
    } else {
        10
    };

    let confidence = ((cv - 1.0).abs() * 0.5 + 0.4).min(1.0);

    Some(Pattern {
        pattern_id: format!("{tenant_id}:burst"),
        tenant_id: tenant_id.to_string(),
        kind: PatternKind::Burst,
        label: label.to_string(),
        average_rpm: 60.0 / mean,
        peak_rpm: 0,
        confidence,
        suggested_limit: None,
        suggested_queue_size: Some(suggested_queue_size),
        observation_count: timestamps.len() as i64,
        first_detected: now,
        last_observed: now,
        description: format!("call arrivals are {label} (cv={cv:.2}), suggested queue size {suggested_queue_size}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_core::{Event, Horizon};
    use quotaguard_storage::SqliteStore;
    use tempfile::NamedTempFile;

    fn detector() -> (PatternDetector, Arc<dyn QuotaStore>) {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        let store: Arc<dyn QuotaStore> = Arc::new(SqliteStore::new(path));
        (PatternDetector::new(store.clone()), store)
    }

    fn allowed_event(tenant_id: &str, timestamp: DateTime<Utc>) -> Event {
        Event {
            id: 0,
            tenant_id: tenant_id.to_string(),
            provider: "anthropic".to_string(),
            model: "claude".to_string(),
            timestamp,
            kind: EventKind::Allowed,
            horizon: Some(Horizon::Minute),
            current_count: Some(1),
            limit: Some(50),
            percent_used: Some(2.0),
            request_id: "r".to_string(),
            was_queued: false,
            queue_time_ms: None,
            detected_pattern_tag: None,
        }
    }

    #[test]
    fn below_minimum_events_returns_insufficient_data() {
        let (detector, store) = detector();
        let now = Utc::now();
        for i in 0..5 {
            store.record_event(&allowed_event("t1", now - chrono::Duration::minutes(i))).unwrap();
        }
        let result = detector.analyze("t1", 7, 10, 0.6).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn concentrated_hourly_traffic_is_detected_as_a_pattern() {
        let (detector, store) = detector();
        let now = Utc::now();
        let peak_hour = now.with_hour(9).unwrap();
        for i in 0..30 {
            store.record_event(&allowed_event("t1", peak_hour - chrono::Duration::minutes(i))).unwrap();
        }
        for i in 0..5 {
            store.record_event(&allowed_event("t1", now.with_hour(2).unwrap() - chrono::Duration::minutes(i))).unwrap();
        }

        let summary = detector.analyze("t1", 7, 10, 0.0).unwrap().unwrap();
        assert!(summary.patterns.iter().any(|p| p.kind == PatternKind::TimeOfDay));
    }

    #[test]
    fn predict_usage_returns_highest_confidence_pattern() {
        let (detector, store) = detector();
        let now = Utc::now();
        store
            .upsert_pattern(&Pattern {
                pattern_id: "t1:weekly".to_string(),
                tenant_id: "t1".to_string(),
                kind: PatternKind::DayOfWeek,
                label: "weekday-heavy".to_string(),
                average_rpm: 1.0,
                peak_rpm: 2,
                confidence: 0.5,
                suggested_limit: None,
                suggested_queue_size: None,
                observation_count: 20,
                first_detected: now,
                last_observed: now,
                description: "d".to_string(),
            })
            .unwrap();
        store
            .upsert_pattern(&Pattern {
                pattern_id: "t1:burst".to_string(),
                tenant_id: "t1".to_string(),
                kind: PatternKind::Burst,
                label: "bursty".to_string(),
                average_rpm: 5.0,
                peak_rpm: 0,
                confidence: 0.9,
                suggested_limit: None,
                suggested_queue_size: Some(50),
                observation_count: 20,
                first_detected: now,
                last_observed: now,
                description: "d".to_string(),
            })
            .unwrap();

        let prediction = detector.predict_usage("t1").unwrap().unwrap();
        assert_eq!(prediction.pattern.kind, PatternKind::Burst);
        assert!(prediction.recommendations[0].contains("queue size 50"));
    }
}

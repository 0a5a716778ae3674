//! Statistical Baseline
//!
//! イベント種別ごとに、時間窓あたりの件数の平均と分散を Welford 法で逐次更新する。

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::types::{AnomalyIndicator, AnomalyKind};
use crate::events::SecurityEventType;

/// 一度に埋める空の時間窓の上限
const MAX_EMPTY_WINDOWS: i64 = 16;
/// 分散が小さすぎる場合の標準偏差の下限
const MIN_STD_DEV: f64 = 1.0;

/// 平均・分散の逐次計算
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// 標本分散
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn z_score(&self, value: f64) -> f64 {
        (value - self.mean) / self.std_dev().max(MIN_STD_DEV)
    }
}

#[derive(Debug, Clone)]
struct TypeWindow {
    stats: RunningStats,
    window_start: DateTime<Utc>,
    count: u64,
    flagged: bool,
}

/// 1実行分のベースライン
#[derive(Debug, Clone)]
pub struct BaselineTracker {
    window: Duration,
    threshold: f64,
    min_samples: u64,
    types: HashMap<SecurityEventType, TypeWindow>,
}

impl BaselineTracker {
    /// `threshold` は感度で割った後の z スコアしきい値
    pub fn new(window: Duration, threshold: f64, min_samples: u64) -> Self {
        Self {
            window,
            threshold,
            min_samples,
            types: HashMap::new(),
        }
    }

    /// イベントを1件観測する。異常と判定したら返す
    pub fn observe(
        &mut self,
        event_type: &SecurityEventType,
        at: DateTime<Utc>,
    ) -> Option<AnomalyIndicator> {
        let window = self.window;
        let entry = self
            .types
            .entry(event_type.clone())
            .or_insert_with(|| TypeWindow {
                stats: RunningStats::default(),
                window_start: at,
                count: 0,
                flagged: false,
            });

        let mut anomaly = None;
        if at >= entry.window_start + window {
            // 閉じた窓の件数をベースラインに入れる前に評価する
            if entry.stats.count() >= self.min_samples && !entry.flagged {
                let z = entry.stats.z_score(entry.count as f64);
                if z.abs() > self.threshold {
                    anomaly = Some(indicator(event_type, z, entry.count, at));
                }
            }
            entry.stats.update(entry.count as f64);

            let elapsed = (at - entry.window_start).num_milliseconds() / window.num_milliseconds().max(1);
            let empty = (elapsed - 1).clamp(0, MAX_EMPTY_WINDOWS);
            for _ in 0..empty {
                entry.stats.update(0.0);
            }
            entry.window_start = entry.window_start + window * elapsed as i32;
            entry.count = 0;
            entry.flagged = false;
        }

        entry.count += 1;

        // 窓の途中での急増
        if anomaly.is_none() && !entry.flagged && entry.stats.count() >= self.min_samples {
            let z = entry.stats.z_score(entry.count as f64);
            if z > self.threshold {
                entry.flagged = true;
                anomaly = Some(indicator(event_type, z, entry.count, at));
            }
        }
        anomaly
    }

    /// 種別ごとの（平均, 標準偏差, 窓数）
    pub fn snapshot(&self) -> Vec<(SecurityEventType, f64, f64, u64)> {
        self.types
            .iter()
            .map(|(t, w)| (t.clone(), w.stats.mean(), w.stats.std_dev(), w.stats.count()))
            .collect()
    }
}

fn indicator(
    event_type: &SecurityEventType,
    z: f64,
    count: u64,
    at: DateTime<Utc>,
) -> AnomalyIndicator {
    AnomalyIndicator {
        kind: AnomalyKind::Frequency,
        event_type: Some(event_type.clone()),
        z_score: Some(z),
        description: format!(
            "{} events in one window deviate from baseline (z = {:.2})",
            count, z
        ),
        detected_at: at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_matches_direct_computation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut stats = RunningStats::default();
        for v in values {
            stats.update(v);
        }
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        // 標本分散 = 32 / 7
        assert!((stats.variance() - 32.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_spike_after_baseline() {
        let start = Utc::now();
        let mut tracker = BaselineTracker::new(Duration::seconds(10), 3.0, 5);
        let event = SecurityEventType::StorageAccess;

        // 6窓ぶん、各2件
        for w in 0..6 {
            for i in 0..2 {
                let at = start + Duration::seconds(w * 10) + Duration::milliseconds(i * 100);
                assert!(tracker.observe(&event, at).is_none());
            }
        }

        // 次の窓で急増
        let base = start + Duration::seconds(60);
        let mut detected = None;
        for i in 0..20 {
            if let Some(a) = tracker.observe(&event, base + Duration::milliseconds(i * 10)) {
                detected = Some(a);
                break;
            }
        }
        let anomaly = detected.expect("spike should be detected");
        assert_eq!(anomaly.kind, AnomalyKind::Frequency);
        assert!(anomaly.z_score.unwrap() > 3.0);
    }

    #[test]
    fn test_no_anomaly_before_min_samples() {
        let start = Utc::now();
        let mut tracker = BaselineTracker::new(Duration::seconds(10), 3.0, 5);
        for i in 0..100 {
            assert!(tracker
                .observe(&SecurityEventType::Log, start + Duration::milliseconds(i))
                .is_none());
        }
    }
}

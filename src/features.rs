//! Feature extraction (C6): converts raw session events into fixed-length,
//! normalized vectors consumed by the ML anomaly detector.

use serde::{Deserialize, Serialize};

/// Describes one slot of a feature vector: its valid range and its
/// relative importance. `normalized` is populated once `normalize` runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub weight: f32,
    pub normalized: Option<f32>,
}

impl FeatureDescriptor {
    pub fn new(name: &str, min: f32, max: f32, weight: f32) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
            weight,
            normalized: None,
        }
    }

    pub fn normalize(&mut self, raw: f32) -> f32 {
        let span = (self.max - self.min).max(f32::EPSILON);
        let clamped = raw.clamp(self.min, self.max);
        let v = (clamped - self.min) / span;
        self.normalized = Some(v);
        v
    }
}

#[derive(Debug, Clone)]
pub struct FeatureVector {
    pub descriptors: Vec<FeatureDescriptor>,
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn in_bounds(&self) -> bool {
        self.values.iter().all(|v| (0.0..=1.0).contains(v))
    }

    /// Drops every feature whose descriptor weight is below `threshold`,
    /// keeping descriptors and values in lock-step.
    pub fn select_most_important(&self, threshold: f32) -> FeatureVector {
        let mut descriptors = Vec::new();
        let mut values = Vec::new();
        for (d, v) in self.descriptors.iter().zip(self.values.iter()) {
            if d.weight >= threshold {
                descriptors.push(d.clone());
                values.push(*v);
            }
        }
        FeatureVector { descriptors, values }
    }
}

/// Raw movement sample: positions in arrival order with timestamps in ms.
#[derive(Debug, Clone)]
pub struct MovementSample {
    pub positions: Vec<(f32, f32, f64)>,
}

/// Raw combat sample: (interval_ms, damage) pairs and a streak counter.
#[derive(Debug, Clone)]
pub struct CombatSample {
    pub hits: Vec<(f64, f32)>,
    pub crit_streak: u32,
}

#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub gather_events_per_minute: f32,
    pub baseline_per_minute: f32,
    pub resource_type_counts: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct PacketSample {
    pub sizes: Vec<u32>,
    pub type_ids: Vec<u8>,
    pub inter_arrival_ms: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct ClickSample {
    pub inter_click_ms: Vec<f64>,
    pub positions: Vec<(f32, f32)>,
}

#[derive(Debug, Clone)]
pub struct HardwareSample {
    pub vm_indicator_bits: u8,
    pub spoof_score: f32,
    pub component_consistency: f32,
}

pub struct FeatureExtractor;

const IMPOSSIBLE_SPEED_UNITS_PER_SEC: f32 = 40.0;

impl FeatureExtractor {
    pub fn extract_movement(sample: &MovementSample) -> FeatureVector {
        let mut path_len = 0.0f32;
        let mut speeds = Vec::new();
        let mut angles = Vec::new();
        let mut impossible = 0u32;

        for w in sample.positions.windows(2) {
            let (x0, y0, t0) = w[0];
            let (x1, y1, t1) = w[1];
            let dx = x1 - x0;
            let dy = y1 - y0;
            let dist = (dx * dx + dy * dy).sqrt();
            path_len += dist;
            let dt = ((t1 - t0).max(1.0) / 1000.0) as f32;
            let speed = dist / dt;
            speeds.push(speed);
            if speed > IMPOSSIBLE_SPEED_UNITS_PER_SEC {
                impossible += 1;
            }
            angles.push(dy.atan2(dx));
        }

        let speed_mean = mean(&speeds);
        let speed_var = variance(&speeds, speed_mean);
        let turn_entropy = angle_entropy(&angles);
        let straight_ratio = straight_line_ratio(&sample.positions);

        let mut descriptors = vec![
            FeatureDescriptor::new("movement.path_length", 0.0, 10_000.0, 0.5),
            FeatureDescriptor::new("movement.speed_mean", 0.0, 100.0, 1.0),
            FeatureDescriptor::new("movement.speed_variance", 0.0, 500.0, 0.6),
            FeatureDescriptor::new("movement.turn_entropy", 0.0, 4.0, 0.4),
            FeatureDescriptor::new("movement.straight_ratio", 0.0, 1.0, 0.3),
            FeatureDescriptor::new("movement.impossible_speed_count", 0.0, 50.0, 1.0),
        ];
        let raws = [
            path_len,
            speed_mean,
            speed_var,
            turn_entropy,
            straight_ratio,
            impossible as f32,
        ];
        normalize_all(&mut descriptors, &raws)
    }

    pub fn extract_combat(sample: &CombatSample) -> FeatureVector {
        let intervals: Vec<f64> = sample.hits.windows(2).map(|w| w[1].0 - w[0].0).collect();
        let damages: Vec<f32> = sample.hits.iter().map(|h| h.1).collect();
        let interval_mean = mean64(&intervals);
        let interval_var = variance64(&intervals, interval_mean);
        let regularity = if interval_mean > 0.0 {
            1.0 - (interval_var.sqrt() / interval_mean).min(1.0) as f32
        } else {
            0.0
        };
        let avg_damage = mean(&damages);
        let ratio = if interval_mean > 0.0 {
            avg_damage / interval_mean as f32
        } else {
            0.0
        };

        let mut descriptors = vec![
            FeatureDescriptor::new("combat.interval_regularity", 0.0, 1.0, 0.9),
            FeatureDescriptor::new("combat.damage_interval_ratio", 0.0, 50.0, 0.7),
            FeatureDescriptor::new("combat.crit_streak", 0.0, 30.0, 0.8),
        ];
        let raws = [regularity, ratio, sample.crit_streak as f32];
        normalize_all(&mut descriptors, &raws)
    }

    pub fn extract_resources(sample: &ResourceSample) -> FeatureVector {
        let rate_ratio = if sample.baseline_per_minute > 0.0 {
            sample.gather_events_per_minute / sample.baseline_per_minute
        } else {
            0.0
        };
        let diversity = entropy_of_counts(&sample.resource_type_counts);

        let mut descriptors = vec![
            FeatureDescriptor::new("resources.rate_ratio", 0.0, 10.0, 0.8),
            FeatureDescriptor::new("resources.diversity_entropy", 0.0, 4.0, 0.4),
        ];
        let raws = [rate_ratio, diversity];
        normalize_all(&mut descriptors, &raws)
    }

    pub fn extract_packets(sample: &PacketSample) -> FeatureVector {
        let mut sizes = sample.sizes.clone();
        sizes.sort_unstable();
        let p50 = quantile(&sizes, 0.5);
        let p95 = quantile(&sizes, 0.95);
        let type_histogram_entropy = entropy_of_bytes(&sample.type_ids);
        let inter_arrival_mean = mean64(&sample.inter_arrival_ms);
        let inter_arrival_var = variance64(&sample.inter_arrival_ms, inter_arrival_mean);
        let regularity = if inter_arrival_mean > 0.0 {
            1.0 - (inter_arrival_var.sqrt() / inter_arrival_mean).min(1.0) as f32
        } else {
            0.0
        };

        let mut descriptors = vec![
            FeatureDescriptor::new("packets.size_p50", 0.0, 4096.0, 0.3),
            FeatureDescriptor::new("packets.size_p95", 0.0, 8192.0, 0.3),
            FeatureDescriptor::new("packets.type_entropy", 0.0, 4.0, 0.5),
            FeatureDescriptor::new("packets.inter_arrival_regularity", 0.0, 1.0, 0.9),
        ];
        let raws = [p50 as f32, p95 as f32, type_histogram_entropy, regularity];
        normalize_all(&mut descriptors, &raws)
    }

    pub fn extract_clicks(sample: &ClickSample) -> FeatureVector {
        let jitter_mean = mean64(&sample.inter_click_ms);
        let jitter_var = variance64(&sample.inter_click_ms, jitter_mean);
        let clustering = spatial_clustering(&sample.positions);
        let auto_repeat = if jitter_var < 1.0 && sample.inter_click_ms.len() > 5 {
            1.0
        } else {
            0.0
        };

        let mut descriptors = vec![
            FeatureDescriptor::new("clicks.jitter_variance", 0.0, 10_000.0, 0.6),
            FeatureDescriptor::new("clicks.spatial_clustering", 0.0, 1.0, 0.4),
            FeatureDescriptor::new("clicks.auto_repeat_flag", 0.0, 1.0, 1.0),
        ];
        let raws = [jitter_var as f32, clustering, auto_repeat];
        normalize_all(&mut descriptors, &raws)
    }

    pub fn extract_hardware(sample: &HardwareSample) -> FeatureVector {
        let mut descriptors = vec![
            FeatureDescriptor::new("hardware.vm_indicator_bits", 0.0, 255.0, 0.7),
            FeatureDescriptor::new("hardware.spoof_score", 0.0, 1.0, 0.9),
            FeatureDescriptor::new("hardware.component_consistency", 0.0, 1.0, 0.5),
        ];
        let raws = [
            sample.vm_indicator_bits as f32,
            sample.spoof_score,
            sample.component_consistency,
        ];
        normalize_all(&mut descriptors, &raws)
    }
}

fn normalize_all(descriptors: &mut [FeatureDescriptor], raws: &[f32]) -> FeatureVector {
    let mut values = Vec::with_capacity(raws.len());
    for (d, raw) in descriptors.iter_mut().zip(raws.iter()) {
        values.push(d.normalize(*raw));
    }
    FeatureVector {
        descriptors: descriptors.to_vec(),
        values,
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn variance(values: &[f32], mean_v: f32) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - mean_v).powi(2)).sum::<f32>() / values.len() as f32
    }
}

fn mean64(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn variance64(values: &[f64], mean_v: f64) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - mean_v).powi(2)).sum::<f64>() / values.len() as f64
    }
}

fn angle_entropy(angles: &[f32]) -> f32 {
    if angles.is_empty() {
        return 0.0;
    }
    const BUCKETS: usize = 8;
    let mut counts = [0u32; BUCKETS];
    for a in angles {
        let normalized = (a + std::f32::consts::PI) / (2.0 * std::f32::consts::PI);
        let idx = ((normalized * BUCKETS as f32) as usize).min(BUCKETS - 1);
        counts[idx] += 1;
    }
    entropy_of_counts(&counts)
}

fn entropy_of_counts(counts: &[u32]) -> f32 {
    let total: u32 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    -counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / total as f32;
            p * p.log2()
        })
        .sum::<f32>()
}

fn entropy_of_bytes(bytes: &[u8]) -> f32 {
    let mut counts = [0u32; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    entropy_of_counts(&counts)
}

fn straight_line_ratio(positions: &[(f32, f32, f64)]) -> f32 {
    if positions.len() < 2 {
        return 1.0;
    }
    let (x0, y0, _) = positions[0];
    let (xn, yn, _) = positions[positions.len() - 1];
    let direct = ((xn - x0).powi(2) + (yn - y0).powi(2)).sqrt();
    let mut path = 0.0f32;
    for w in positions.windows(2) {
        let (xa, ya, _) = w[0];
        let (xb, yb, _) = w[1];
        path += ((xb - xa).powi(2) + (yb - ya).powi(2)).sqrt();
    }
    if path <= f32::EPSILON {
        1.0
    } else {
        (direct / path).clamp(0.0, 1.0)
    }
}

fn quantile(sorted: &[u32], q: f32) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f32 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn spatial_clustering(positions: &[(f32, f32)]) -> f32 {
    if positions.len() < 2 {
        return 0.0;
    }
    let n = positions.len() as f32;
    let cx = positions.iter().map(|p| p.0).sum::<f32>() / n;
    let cy = positions.iter().map(|p| p.1).sum::<f32>() / n;
    let avg_dist = positions
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f32>()
        / n;
    (1.0 / (1.0 + avg_dist)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_features_stay_in_bounds() {
        let sample = MovementSample {
            positions: vec![(0.0, 0.0, 0.0), (5.0, 5.0, 1000.0), (10.0, 0.0, 2000.0)],
        };
        let fv = FeatureExtractor::extract_movement(&sample);
        assert!(fv.in_bounds());
        assert_eq!(fv.len(), 6);
    }

    #[test]
    fn impossible_speed_detected() {
        let sample = MovementSample {
            positions: vec![(0.0, 0.0, 0.0), (10_000.0, 0.0, 10.0)],
        };
        let fv = FeatureExtractor::extract_movement(&sample);
        assert!(fv.in_bounds());
        let idx = fv.descriptors.iter().position(|d| d.name == "movement.impossible_speed_count").unwrap();
        assert!(fv.values[idx] > 0.0);
    }

    #[test]
    fn combat_features_stay_in_bounds() {
        let sample = CombatSample {
            hits: vec![(0.0, 10.0), (500.0, 12.0), (1000.0, 11.0)],
            crit_streak: 3,
        };
        let fv = FeatureExtractor::extract_combat(&sample);
        assert!(fv.in_bounds());
    }

    #[test]
    fn feature_selection_drops_low_weight_descriptors() {
        let sample = HardwareSample {
            vm_indicator_bits: 5,
            spoof_score: 0.4,
            component_consistency: 0.9,
        };
        let fv = FeatureExtractor::extract_hardware(&sample);
        let selected = fv.select_most_important(0.8);
        assert!(selected.len() < fv.len());
        assert!(selected.descriptors.iter().all(|d| d.weight >= 0.8));
    }

    #[test]
    fn empty_samples_produce_in_bounds_zero_vector() {
        let sample = MovementSample { positions: vec![] };
        let fv = FeatureExtractor::extract_movement(&sample);
        assert!(fv.in_bounds());
    }
}

//! ML anomaly detection (C7): per-anomaly-type models, ensembled, with
//! online incremental training and auto-adjusting thresholds.
//!
//! No machine-learning crate is prescribed for this exact model mix, so
//! each family is a small from-scratch numeric implementation behind one
//! uniform trait.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::features::FeatureVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    SpeedHack,
    Teleport,
    CombatPattern,
    BotAutomation,
    PacketAnomaly,
    HardwareSpoof,
}

#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub features: FeatureVector,
    pub label: bool,
    pub weight: f32,
}

#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub label: bool,
    pub confidence: f32,
    pub feature_importances: Vec<(String, f32)>,
    /// Per-class score, e.g. `{"benign": 0.2, "anomalous": 0.8}`.
    pub class_scores: HashMap<String, f32>,
}

fn class_scores_from_confidence(label: bool, confidence: f32) -> HashMap<String, f32> {
    let anomalous = if label { confidence } else { 1.0 - confidence };
    let mut scores = HashMap::with_capacity(2);
    scores.insert("benign".to_string(), 1.0 - anomalous);
    scores.insert("anomalous".to_string(), anomalous);
    scores
}

fn named_importances(features: &FeatureVector, weights: &[(usize, f32)]) -> Vec<(String, f32)> {
    weights
        .iter()
        .filter_map(|(idx, weight)| features.descriptors.get(*idx).map(|d| (d.name.clone(), *weight)))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelPerformanceMetrics {
    pub true_positives: u32,
    pub false_positives: u32,
    pub true_negatives: u32,
    pub false_negatives: u32,
}

impl ModelPerformanceMetrics {
    pub fn precision(&self) -> f32 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f32 / denom as f32
        }
    }

    pub fn recall(&self) -> f32 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f32 / denom as f32
        }
    }

    pub fn false_positive_rate(&self) -> f32 {
        let denom = self.false_positives + self.true_negatives;
        if denom == 0 {
            0.0
        } else {
            self.false_positives as f32 / denom as f32
        }
    }

    pub fn balanced_accuracy(&self) -> f32 {
        let sensitivity = self.recall();
        let specificity_denom = self.true_negatives + self.false_positives;
        let specificity = if specificity_denom == 0 {
            0.0
        } else {
            self.true_negatives as f32 / specificity_denom as f32
        };
        (sensitivity + specificity) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub epochs: u32,
    pub learning_rate: f32,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 0.05,
        }
    }
}

/// Uniform contract every model family satisfies.
pub trait AnomalyModel: Send + Sync {
    fn train(&mut self, samples: &[TrainingSample], options: &TrainingOptions);
    fn train_incremental(&mut self, sample: &TrainingSample);
    fn predict(&self, features: &FeatureVector) -> PredictionResult;
    fn name(&self) -> &'static str;
    /// Serializes the model's learned parameters (not training data).
    fn save(&self) -> Value;
    /// Restores parameters saved by `save`. Shape mismatches are a
    /// deserialization error, not a panic.
    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error>;
}

/// A decision-stump forest: each stump thresholds a single feature index;
/// the forest votes by majority with confidence = vote fraction.
pub struct RandomForestModel {
    stumps: Vec<Stump>,
    n_trees: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stump {
    feature_idx: usize,
    threshold: f32,
    positive_above: bool,
}

impl RandomForestModel {
    pub fn new(n_trees: usize) -> Self {
        Self {
            stumps: Vec::new(),
            n_trees,
        }
    }

    fn best_stump(samples: &[TrainingSample], feature_idx: usize) -> Option<Stump> {
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<f32> = samples.iter().filter_map(|s| s.features.values.get(feature_idx).copied()).collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut best: Option<(f32, bool, f32)> = None;
        for &threshold in &values {
            for positive_above in [true, false] {
                let correct = samples
                    .iter()
                    .filter(|s| {
                        let v = s.features.values.get(feature_idx).copied().unwrap_or(0.0);
                        let predicted = if positive_above { v > threshold } else { v <= threshold };
                        predicted == s.label
                    })
                    .count() as f32;
                let score = correct / samples.len() as f32;
                if best.map(|(b, _, _)| score > b).unwrap_or(true) {
                    best = Some((score, positive_above, threshold));
                }
            }
        }
        best.map(|(_, positive_above, threshold)| Stump {
            feature_idx,
            threshold,
            positive_above,
        })
    }
}

impl AnomalyModel for RandomForestModel {
    fn train(&mut self, samples: &[TrainingSample], _options: &TrainingOptions) {
        self.stumps.clear();
        let n_features = samples.first().map(|s| s.features.len()).unwrap_or(0);
        if n_features == 0 {
            return;
        }
        for i in 0..self.n_trees {
            let idx = i % n_features;
            if let Some(stump) = Self::best_stump(samples, idx) {
                self.stumps.push(stump);
            }
        }
    }

    fn train_incremental(&mut self, sample: &TrainingSample) {
        // Online update: nudge the weakest stump's threshold toward the
        // new sample if it currently misclassifies it.
        if let Some(stump) = self.stumps.iter_mut().min_by(|a, b| {
            let va = sample.features.values.get(a.feature_idx).copied().unwrap_or(0.0);
            let vb = sample.features.values.get(b.feature_idx).copied().unwrap_or(0.0);
            va.partial_cmp(&vb).unwrap()
        }) {
            let v = sample.features.values.get(stump.feature_idx).copied().unwrap_or(0.0);
            let predicted = if stump.positive_above { v > stump.threshold } else { v <= stump.threshold };
            if predicted != sample.label {
                stump.threshold = (stump.threshold + v) / 2.0;
            }
        }
    }

    fn predict(&self, features: &FeatureVector) -> PredictionResult {
        if self.stumps.is_empty() {
            return PredictionResult {
                label: false,
                confidence: 0.0,
                feature_importances: vec![],
                class_scores: class_scores_from_confidence(false, 0.0),
            };
        }
        let mut votes_true = 0;
        let mut stump_counts: HashMap<usize, f32> = HashMap::new();
        for stump in &self.stumps {
            let v = features.values.get(stump.feature_idx).copied().unwrap_or(0.0);
            let predicted = if stump.positive_above { v > stump.threshold } else { v <= stump.threshold };
            if predicted {
                votes_true += 1;
            }
            *stump_counts.entry(stump.feature_idx).or_insert(0.0) += 1.0;
        }
        let fraction = votes_true as f32 / self.stumps.len() as f32;
        let label = fraction >= 0.5;
        let confidence = fraction.max(1.0 - fraction);
        let total: f32 = stump_counts.values().sum();
        let mut weights: Vec<(usize, f32)> =
            stump_counts.into_iter().map(|(idx, count)| (idx, if total > 0.0 { count / total } else { 0.0 })).collect();
        weights.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        PredictionResult {
            label,
            confidence,
            feature_importances: named_importances(features, &weights),
            class_scores: class_scores_from_confidence(label, confidence),
        }
    }

    fn name(&self) -> &'static str {
        "random_forest"
    }

    fn save(&self) -> Value {
        serde_json::json!({ "n_trees": self.n_trees, "stumps": self.stumps })
    }

    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        #[derive(Deserialize)]
        struct State {
            n_trees: usize,
            stumps: Vec<Stump>,
        }
        let parsed: State = serde_json::from_value(state.clone())?;
        self.n_trees = parsed.n_trees;
        self.stumps = parsed.stumps;
        Ok(())
    }
}

/// Single-hidden-layer feedforward network trained with plain gradient
/// descent on binary cross-entropy.
pub struct NeuralNetworkModel {
    input_dim: usize,
    hidden_dim: usize,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: f32,
}

impl NeuralNetworkModel {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Self {
        let mut w1 = vec![0.0; input_dim * hidden_dim];
        let mut w2 = vec![0.0; hidden_dim];
        let mut seed = 0x9E3779B9u32;
        for w in w1.iter_mut().chain(w2.iter_mut()) {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            *w = ((seed >> 8) as f32 / u32::MAX as f32 - 0.5) * 0.2;
        }
        Self {
            input_dim,
            hidden_dim,
            w1,
            b1: vec![0.0; hidden_dim],
            w2,
            b2: 0.0,
        }
    }

    fn forward(&self, x: &[f32]) -> (Vec<f32>, f32) {
        let mut hidden = vec![0.0; self.hidden_dim];
        for h in 0..self.hidden_dim {
            let mut sum = self.b1[h];
            for i in 0..self.input_dim.min(x.len()) {
                sum += self.w1[h * self.input_dim + i] * x[i];
            }
            hidden[h] = sum.max(0.0); // ReLU
        }
        let mut out = self.b2;
        for h in 0..self.hidden_dim {
            out += self.w2[h] * hidden[h];
        }
        (hidden, sigmoid(out))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl AnomalyModel for NeuralNetworkModel {
    fn train(&mut self, samples: &[TrainingSample], options: &TrainingOptions) {
        for _ in 0..options.epochs {
            for sample in samples {
                self.train_incremental_with_rate(sample, options.learning_rate);
            }
        }
    }

    fn train_incremental(&mut self, sample: &TrainingSample) {
        self.train_incremental_with_rate(sample, 0.05);
    }

    fn predict(&self, features: &FeatureVector) -> PredictionResult {
        let (_, out) = self.forward(&features.values);
        let label = out >= 0.5;
        let confidence = (out - 0.5).abs() * 2.0;
        // Input sensitivity: sum over hidden units of |w1| * |w2|, the
        // magnitude each input contributes to the output through the
        // network, not a gradient-based attribution.
        let mut raw = vec![0.0f32; self.input_dim];
        for h in 0..self.hidden_dim {
            for i in 0..self.input_dim {
                raw[i] += self.w1[h * self.input_dim + i].abs() * self.w2[h].abs();
            }
        }
        let total: f32 = raw.iter().sum();
        let weights: Vec<(usize, f32)> =
            raw.iter().enumerate().map(|(i, v)| (i, if total > 0.0 { v / total } else { 0.0 })).collect();
        PredictionResult {
            label,
            confidence,
            feature_importances: named_importances(features, &weights),
            class_scores: class_scores_from_confidence(label, confidence),
        }
    }

    fn name(&self) -> &'static str {
        "neural_network"
    }

    fn save(&self) -> Value {
        serde_json::json!({
            "input_dim": self.input_dim,
            "hidden_dim": self.hidden_dim,
            "w1": self.w1,
            "b1": self.b1,
            "w2": self.w2,
            "b2": self.b2,
        })
    }

    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        #[derive(Deserialize)]
        struct State {
            input_dim: usize,
            hidden_dim: usize,
            w1: Vec<f32>,
            b1: Vec<f32>,
            w2: Vec<f32>,
            b2: f32,
        }
        let parsed: State = serde_json::from_value(state.clone())?;
        self.input_dim = parsed.input_dim;
        self.hidden_dim = parsed.hidden_dim;
        self.w1 = parsed.w1;
        self.b1 = parsed.b1;
        self.w2 = parsed.w2;
        self.b2 = parsed.b2;
        Ok(())
    }
}

impl NeuralNetworkModel {
    fn train_incremental_with_rate(&mut self, sample: &TrainingSample, lr: f32) {
        let x = &sample.features.values;
        let (hidden, out) = self.forward(x);
        let target = if sample.label { 1.0 } else { 0.0 };
        let d_out = (out - target) * sample.weight;

        for h in 0..self.hidden_dim {
            self.w2[h] -= lr * d_out * hidden[h];
        }
        self.b2 -= lr * d_out;

        for h in 0..self.hidden_dim {
            if hidden[h] <= 0.0 {
                continue;
            }
            let d_hidden = d_out * self.w2[h];
            for i in 0..self.input_dim.min(x.len()) {
                self.w1[h * self.input_dim + i] -= lr * d_hidden * x[i];
            }
            self.b1[h] -= lr * d_hidden;
        }
    }
}

/// Linear-kernel margin classifier trained with a simple Pegasos-style
/// hinge-loss update.
pub struct SvmModel {
    weights: Vec<f32>,
    bias: f32,
}

impl SvmModel {
    pub fn new(input_dim: usize) -> Self {
        Self {
            weights: vec![0.0; input_dim],
            bias: 0.0,
        }
    }

    fn margin(&self, x: &[f32]) -> f32 {
        let mut s = self.bias;
        for i in 0..self.weights.len().min(x.len()) {
            s += self.weights[i] * x[i];
        }
        s
    }
}

impl AnomalyModel for SvmModel {
    fn train(&mut self, samples: &[TrainingSample], options: &TrainingOptions) {
        for epoch in 1..=options.epochs {
            let lr = options.learning_rate / epoch as f32;
            for sample in samples {
                self.update(sample, lr);
            }
        }
    }

    fn train_incremental(&mut self, sample: &TrainingSample) {
        self.update(sample, 0.01);
    }

    fn predict(&self, features: &FeatureVector) -> PredictionResult {
        let margin = self.margin(&features.values);
        let label = margin > 0.0;
        let confidence = (margin.abs() / 2.0).min(1.0);
        let x = &features.values;
        let contributions: Vec<f32> =
            (0..self.weights.len().min(x.len())).map(|i| (self.weights[i] * x[i]).abs()).collect();
        let total: f32 = contributions.iter().sum();
        let weights: Vec<(usize, f32)> = contributions
            .iter()
            .enumerate()
            .map(|(i, v)| (i, if total > 0.0 { v / total } else { 0.0 }))
            .collect();
        PredictionResult {
            label,
            confidence,
            feature_importances: named_importances(features, &weights),
            class_scores: class_scores_from_confidence(label, confidence),
        }
    }

    fn name(&self) -> &'static str {
        "svm"
    }

    fn save(&self) -> Value {
        serde_json::json!({ "weights": self.weights, "bias": self.bias })
    }

    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        #[derive(Deserialize)]
        struct State {
            weights: Vec<f32>,
            bias: f32,
        }
        let parsed: State = serde_json::from_value(state.clone())?;
        self.weights = parsed.weights;
        self.bias = parsed.bias;
        Ok(())
    }
}

impl SvmModel {
    fn update(&mut self, sample: &TrainingSample, lr: f32) {
        let y = if sample.label { 1.0 } else { -1.0 };
        let x = &sample.features.values;
        let margin = self.margin(x) * y;
        if margin < 1.0 {
            for i in 0..self.weights.len().min(x.len()) {
                self.weights[i] += lr * (y * x[i] * sample.weight - 0.01 * self.weights[i]);
            }
            self.bias += lr * y * sample.weight;
        } else {
            for w in &mut self.weights {
                *w -= lr * 0.01 * *w;
            }
        }
    }
}

/// Staged residual boosting over decision stumps.
pub struct GradientBoostingModel {
    stages: Vec<(Stump, f32)>,
    n_stages: usize,
}

impl GradientBoostingModel {
    pub fn new(n_stages: usize) -> Self {
        Self {
            stages: Vec::new(),
            n_stages,
        }
    }
}

impl AnomalyModel for GradientBoostingModel {
    fn train(&mut self, samples: &[TrainingSample], _options: &TrainingOptions) {
        self.stages.clear();
        let n_features = samples.first().map(|s| s.features.len()).unwrap_or(0);
        if n_features == 0 {
            return;
        }
        for i in 0..self.n_stages {
            let idx = i % n_features;
            if let Some(stump) = RandomForestModel::best_stump(samples, idx) {
                self.stages.push((stump, 1.0 / (i as f32 + 1.0)));
            }
        }
    }

    fn train_incremental(&mut self, sample: &TrainingSample) {
        if let Some((stump, weight)) = self.stages.last_mut() {
            let v = sample.features.values.get(stump.feature_idx).copied().unwrap_or(0.0);
            let predicted = if stump.positive_above { v > stump.threshold } else { v <= stump.threshold };
            if predicted != sample.label {
                *weight *= 0.95;
            }
        }
    }

    fn predict(&self, features: &FeatureVector) -> PredictionResult {
        let mut score = 0.0f32;
        let mut total_weight = 0.0f32;
        let mut contrib: HashMap<usize, f32> = HashMap::new();
        for (stump, weight) in &self.stages {
            let v = features.values.get(stump.feature_idx).copied().unwrap_or(0.0);
            let predicted = if stump.positive_above { v > stump.threshold } else { v <= stump.threshold };
            score += if predicted { *weight } else { -*weight };
            total_weight += weight.abs();
            *contrib.entry(stump.feature_idx).or_insert(0.0) += weight.abs();
        }
        let normalized = if total_weight > 0.0 { score / total_weight } else { 0.0 };
        let label = normalized > 0.0;
        let confidence = normalized.abs().min(1.0);
        let weights: Vec<(usize, f32)> = contrib
            .into_iter()
            .map(|(idx, w)| (idx, if total_weight > 0.0 { w / total_weight } else { 0.0 }))
            .collect();
        PredictionResult {
            label,
            confidence,
            feature_importances: named_importances(features, &weights),
            class_scores: class_scores_from_confidence(label, confidence),
        }
    }

    fn name(&self) -> &'static str {
        "gradient_boosting"
    }

    fn save(&self) -> Value {
        serde_json::json!({ "stages": self.stages, "n_stages": self.n_stages })
    }

    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        #[derive(Deserialize)]
        struct State {
            stages: Vec<(Stump, f32)>,
            n_stages: usize,
        }
        let parsed: State = serde_json::from_value(state.clone())?;
        self.stages = parsed.stages;
        self.n_stages = parsed.n_stages;
        Ok(())
    }
}

/// Weighted average over an arbitrary set of base models. Weights always
/// sum to 1.0 after any mutation.
pub struct EnsembleModel {
    base: Vec<(Box<dyn AnomalyModel>, f32)>,
}

impl EnsembleModel {
    pub fn new() -> Self {
        Self { base: Vec::new() }
    }

    pub fn add_base_model(&mut self, model: Box<dyn AnomalyModel>, weight: f32) {
        self.base.push((model, weight));
        self.normalize_weights();
    }

    pub fn remove_base_model(&mut self, name: &str) {
        self.base.retain(|(m, _)| m.name() != name);
        self.normalize_weights();
    }

    pub fn update_model_weight(&mut self, name: &str, weight: f32) {
        if let Some(entry) = self.base.iter_mut().find(|(m, _)| m.name() == name) {
            entry.1 = weight;
        }
        self.normalize_weights();
    }

    pub fn normalize_weights(&mut self) {
        let total: f32 = self.base.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            let n = self.base.len().max(1) as f32;
            for (_, w) in &mut self.base {
                *w = 1.0 / n;
            }
        } else {
            for (_, w) in &mut self.base {
                *w /= total;
            }
        }
    }

    pub fn weight_sum(&self) -> f32 {
        self.base.iter().map(|(_, w)| w).sum()
    }
}

impl Default for EnsembleModel {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyModel for EnsembleModel {
    fn train(&mut self, samples: &[TrainingSample], options: &TrainingOptions) {
        for (model, _) in &mut self.base {
            model.train(samples, options);
        }
    }

    fn train_incremental(&mut self, sample: &TrainingSample) {
        for (model, _) in &mut self.base {
            model.train_incremental(sample);
        }
    }

    fn predict(&self, features: &FeatureVector) -> PredictionResult {
        if self.base.is_empty() {
            return PredictionResult {
                label: false,
                confidence: 0.0,
                feature_importances: vec![],
                class_scores: class_scores_from_confidence(false, 0.0),
            };
        }
        let mut score = 0.0f32;
        let mut importances: HashMap<String, f32> = HashMap::new();
        for (model, weight) in &self.base {
            let p = model.predict(features);
            let signed = if p.label { p.confidence } else { -p.confidence };
            score += signed * weight;
            for (name, imp) in p.feature_importances {
                *importances.entry(name).or_insert(0.0) += imp * weight;
            }
        }
        let label = score > 0.0;
        let confidence = score.abs().min(1.0);
        let mut feature_importances: Vec<(String, f32)> = importances.into_iter().collect();
        feature_importances.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        PredictionResult {
            label,
            confidence,
            feature_importances,
            class_scores: class_scores_from_confidence(label, confidence),
        }
    }

    fn name(&self) -> &'static str {
        "ensemble"
    }

    fn save(&self) -> Value {
        let items: Vec<Value> = self
            .base
            .iter()
            .map(|(m, w)| serde_json::json!({ "type": m.name(), "weight": w, "state": m.save() }))
            .collect();
        Value::Array(items)
    }

    fn load(&mut self, state: &Value) -> Result<(), serde_json::Error> {
        let arr = state.as_array().cloned().unwrap_or_default();
        for (entry, (model, weight)) in arr.iter().zip(self.base.iter_mut()) {
            if entry.get("type").and_then(|v| v.as_str()) != Some(model.name()) {
                continue;
            }
            if let Some(w) = entry.get("weight").and_then(|v| v.as_f64()) {
                *weight = w as f32;
            }
            if let Some(inner) = entry.get("state") {
                model.load(inner)?;
            }
        }
        Ok(())
    }
}

/// Per-anomaly-type detection thresholds and the model backing each type.
pub struct MlAnomalyDetector {
    models: RwLock<HashMap<AnomalyType, EnsembleModel>>,
    detection_threshold: RwLock<HashMap<AnomalyType, f32>>,
    confidence_threshold: RwLock<HashMap<AnomalyType, f32>>,
    auto_threshold: bool,
    target_fp_rate: f32,
}

impl MlAnomalyDetector {
    pub fn new(auto_threshold: bool, target_fp_rate: f32) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            detection_threshold: RwLock::new(HashMap::new()),
            confidence_threshold: RwLock::new(HashMap::new()),
            auto_threshold,
            target_fp_rate,
        }
    }

    pub fn register_model(&self, anomaly_type: AnomalyType, model: EnsembleModel) {
        self.models.write().expect("lock poisoned").insert(anomaly_type, model);
        self.detection_threshold.write().expect("lock poisoned").entry(anomaly_type).or_insert(0.5);
        self.confidence_threshold.write().expect("lock poisoned").entry(anomaly_type).or_insert(0.6);
    }

    pub fn set_detection_threshold(&self, anomaly_type: AnomalyType, threshold: f32) {
        self.detection_threshold.write().expect("lock poisoned").insert(anomaly_type, threshold.clamp(0.0, 1.0));
    }

    pub fn set_confidence_threshold(&self, anomaly_type: AnomalyType, threshold: f32) {
        self.confidence_threshold.write().expect("lock poisoned").insert(anomaly_type, threshold.clamp(0.0, 1.0));
    }

    pub fn train(&self, anomaly_type: AnomalyType, samples: &[TrainingSample], options: &crate::ml::TrainingOptions) {
        if let Some(model) = self.models.write().expect("lock poisoned").get_mut(&anomaly_type) {
            model.train(samples, options);
        }
    }

    pub fn train_incremental(&self, anomaly_type: AnomalyType, sample: &TrainingSample) {
        if let Some(model) = self.models.write().expect("lock poisoned").get_mut(&anomaly_type) {
            model.train_incremental(sample);
        }
    }

    /// Fires only when both the raw model score clears `detection_threshold`
    /// and the model's own confidence clears `confidence_threshold`.
    pub fn detect(&self, anomaly_type: AnomalyType, features: &FeatureVector) -> Option<PredictionResult> {
        let models = self.models.read().expect("lock poisoned");
        let model = models.get(&anomaly_type)?;
        let prediction = model.predict(features);
        let detection_threshold = *self.detection_threshold.read().expect("lock poisoned").get(&anomaly_type).unwrap_or(&0.5);
        let confidence_threshold = *self.confidence_threshold.read().expect("lock poisoned").get(&anomaly_type).unwrap_or(&0.6);
        let score = if prediction.label { prediction.confidence } else { 0.0 };
        if score >= detection_threshold && prediction.confidence >= confidence_threshold {
            Some(prediction)
        } else {
            None
        }
    }

    pub fn evaluate(&self, anomaly_type: AnomalyType, samples: &[TrainingSample]) -> ModelPerformanceMetrics {
        let mut metrics = ModelPerformanceMetrics::default();
        for sample in samples {
            let predicted = self.detect(anomaly_type, &sample.features).is_some();
            match (predicted, sample.label) {
                (true, true) => metrics.true_positives += 1,
                (true, false) => metrics.false_positives += 1,
                (false, true) => metrics.false_negatives += 1,
                (false, false) => metrics.true_negatives += 1,
            }
        }
        if self.auto_threshold {
            self.adjust_threshold(anomaly_type, &metrics);
        }
        metrics
    }

    /// Proportional controller nudging the detection threshold toward the
    /// configured target false-positive rate after each evaluated batch.
    fn adjust_threshold(&self, anomaly_type: AnomalyType, metrics: &ModelPerformanceMetrics) {
        let current_fp = metrics.false_positive_rate();
        let error = current_fp - self.target_fp_rate;
        let mut thresholds = self.detection_threshold.write().expect("lock poisoned");
        let entry = thresholds.entry(anomaly_type).or_insert(0.5);
        *entry = (*entry + error * 0.5).clamp(0.0, 1.0);
    }

    pub fn save_model(&self, anomaly_type: AnomalyType) -> Option<Value> {
        let models = self.models.read().expect("lock poisoned");
        models.get(&anomaly_type).map(|m| m.save())
    }

    pub fn load_model(&self, anomaly_type: AnomalyType, state: &Value) -> Result<(), serde_json::Error> {
        let mut models = self.models.write().expect("lock poisoned");
        if let Some(model) = models.get_mut(&anomaly_type) {
            model.load(state)?;
        }
        Ok(())
    }
}

/// Maps a config key (snake_case) to the `AnomalyType` it configures.
pub fn anomaly_type_from_str(s: &str) -> Option<AnomalyType> {
    match s {
        "speed_hack" => Some(AnomalyType::SpeedHack),
        "teleport" => Some(AnomalyType::Teleport),
        "combat_pattern" => Some(AnomalyType::CombatPattern),
        "bot_automation" => Some(AnomalyType::BotAutomation),
        "packet_anomaly" => Some(AnomalyType::PacketAnomaly),
        "hardware_spoof" => Some(AnomalyType::HardwareSpoof),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDescriptor;

    fn fv(values: Vec<f32>) -> FeatureVector {
        let descriptors = values
            .iter()
            .enumerate()
            .map(|(i, _)| FeatureDescriptor::new(&format!("f{i}"), 0.0, 1.0, 1.0))
            .collect();
        FeatureVector { descriptors, values }
    }

    fn sample(values: Vec<f32>, label: bool) -> TrainingSample {
        TrainingSample {
            features: fv(values),
            label,
            weight: 1.0,
        }
    }

    fn training_set() -> Vec<TrainingSample> {
        let mut samples = Vec::new();
        for _ in 0..50 {
            samples.push(sample(vec![0.1, 0.1], false));
            samples.push(sample(vec![0.9, 0.9], true));
        }
        samples
    }

    #[test]
    fn ensemble_weights_sum_to_one_after_updates() {
        let mut ensemble = EnsembleModel::new();
        ensemble.add_base_model(Box::new(RandomForestModel::new(5)), 0.5);
        ensemble.add_base_model(Box::new(SvmModel::new(2)), 0.3);
        ensemble.update_model_weight("random_forest", 0.9);
        assert!((ensemble.weight_sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn random_forest_learns_separable_data() {
        let mut model = RandomForestModel::new(5);
        model.train(&training_set(), &TrainingOptions::default());
        let pred = model.predict(&fv(vec![0.95, 0.95]));
        assert!(pred.label);
        let pred_neg = model.predict(&fv(vec![0.05, 0.05]));
        assert!(!pred_neg.label);
    }

    #[test]
    fn neural_network_learns_separable_data() {
        let mut model = NeuralNetworkModel::new(2, 4);
        model.train(&training_set(), &TrainingOptions { epochs: 60, learning_rate: 0.2 });
        let pred = model.predict(&fv(vec![0.95, 0.95]));
        assert!(pred.label);
    }

    #[test]
    fn detector_applies_both_thresholds() {
        let detector = MlAnomalyDetector::new(false, 0.01);
        let mut ensemble = EnsembleModel::new();
        ensemble.add_base_model(Box::new(RandomForestModel::new(5)), 1.0);
        ensemble.train(&training_set(), &TrainingOptions::default());
        detector.register_model(AnomalyType::SpeedHack, ensemble);
        detector.set_detection_threshold(AnomalyType::SpeedHack, 0.5);
        detector.set_confidence_threshold(AnomalyType::SpeedHack, 0.5);
        let hit = detector.detect(AnomalyType::SpeedHack, &fv(vec![0.95, 0.95]));
        assert!(hit.is_some());
        let miss = detector.detect(AnomalyType::SpeedHack, &fv(vec![0.05, 0.05]));
        assert!(miss.is_none());
    }

    #[test]
    fn random_forest_reports_nonempty_importances_and_class_scores() {
        let mut model = RandomForestModel::new(5);
        model.train(&training_set(), &TrainingOptions::default());
        let pred = model.predict(&fv(vec![0.95, 0.95]));
        assert!(!pred.feature_importances.is_empty());
        assert!((pred.class_scores["benign"] + pred.class_scores["anomalous"] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn random_forest_save_load_round_trips_predictions() {
        let mut model = RandomForestModel::new(5);
        model.train(&training_set(), &TrainingOptions::default());
        let saved = model.save();
        let mut restored = RandomForestModel::new(5);
        restored.load(&saved).unwrap();
        let a = model.predict(&fv(vec![0.95, 0.95]));
        let b = restored.predict(&fv(vec![0.95, 0.95]));
        assert_eq!(a.label, b.label);
        assert!((a.confidence - b.confidence).abs() < 1e-6);
    }

    #[test]
    fn ensemble_save_load_round_trips_through_members() {
        let mut ensemble = EnsembleModel::new();
        ensemble.add_base_model(Box::new(RandomForestModel::new(5)), 0.6);
        ensemble.add_base_model(Box::new(SvmModel::new(2)), 0.4);
        ensemble.train(&training_set(), &TrainingOptions::default());
        let saved = ensemble.save();

        let mut restored = EnsembleModel::new();
        restored.add_base_model(Box::new(RandomForestModel::new(5)), 0.6);
        restored.add_base_model(Box::new(SvmModel::new(2)), 0.4);
        restored.load(&saved).unwrap();

        let a = ensemble.predict(&fv(vec![0.95, 0.95]));
        let b = restored.predict(&fv(vec![0.95, 0.95]));
        assert_eq!(a.label, b.label);
    }

    #[test]
    fn anomaly_type_from_str_maps_known_keys() {
        assert_eq!(anomaly_type_from_str("speed_hack"), Some(AnomalyType::SpeedHack));
        assert_eq!(anomaly_type_from_str("bogus"), None);
    }

    #[test]
    fn performance_metrics_balanced_accuracy() {
        let metrics = ModelPerformanceMetrics {
            true_positives: 9,
            false_positives: 1,
            true_negatives: 9,
            false_negatives: 1,
        };
        assert!((metrics.balanced_accuracy() - 0.9).abs() < 1e-6);
    }
}

//! ============================================================================
//! Ranking Model - Per-user learned preference scorer
//! ============================================================================
//! A shallow feed-forward network `D → hidden (ReLU) → 1 (sigmoid)` trained
//! with binary cross-entropy and Adam.
//!
//! The output layer starts at zero, so a fresh model scores every input at
//! exactly 0.5 (uninformative) until feedback arrives. The hidden layer is
//! He-initialised from the model's seed so units start out differentiated.
//! ============================================================================

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::RankingConfig;
use crate::types::{clamp_label, validate_embedding, ConverseError, Result, TrainingSample};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

/// Bumped whenever the snapshot layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

/// Adam first/second moment estimates for one parameter tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}

impl Moments {
    fn zeros(len: usize) -> Self {
        Self {
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    fn len_matches(&self, len: usize) -> bool {
        self.m.len() == len && self.v.len() == len
    }

    /// One Adam update of `params` given `grads` at (1-based) step `t`
    fn apply(&mut self, params: &mut [f32], grads: &[f32], learning_rate: f32, t: u64) {
        let bias1 = 1.0 - BETA1.powi(t.min(i32::MAX as u64) as i32);
        let bias2 = 1.0 - BETA2.powi(t.min(i32::MAX as u64) as i32);
        for (k, param) in params.iter_mut().enumerate() {
            let g = grads[k];
            self.m[k] = BETA1 * self.m[k] + (1.0 - BETA1) * g;
            self.v[k] = BETA2 * self.v[k] + (1.0 - BETA2) * g * g;
            let m_hat = self.m[k] / bias1;
            let v_hat = self.v[k] / bias2;
            *param -= learning_rate * m_hat / (v_hat.sqrt() + EPSILON);
        }
    }
}

/// Serializable form of a model: parameters + optimizer state + counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    pub dim: usize,
    pub hidden: usize,
    /// Row-major `hidden × dim`
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: f32,
    pub w1_moments: Moments,
    pub b1_moments: Moments,
    pub w2_moments: Moments,
    pub b2_moments: Moments,
    /// Adam step counter
    pub adam_steps: u64,
    pub train_steps: u64,
    pub seed: u64,
}

/// Scores candidate embeddings against one user's learned preferences
#[derive(Debug, Clone)]
pub struct RankingModel {
    dim: usize,
    hidden: usize,
    learning_rate: f32,
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: f32,
    w1_moments: Moments,
    b1_moments: Moments,
    w2_moments: Moments,
    b2_moments: Moments,
    adam_steps: u64,
    train_steps: u64,
    seed: u64,
}

/// Intermediate values of one forward pass
struct Forward {
    pre_activation: Vec<f32>,
    hidden: Vec<f32>,
    logit: f32,
}

/// Parameter gradients of one sample
struct Gradients {
    w1: Vec<f32>,
    b1: Vec<f32>,
    w2: Vec<f32>,
    b2: f32,
}

impl RankingModel {
    /// Fresh model with a random seed
    pub fn new(config: &RankingConfig) -> Self {
        Self::with_seed(config, rand::thread_rng().gen())
    }

    /// Fresh model whose initial weights and shuffles derive from `seed`
    pub fn with_seed(config: &RankingConfig, seed: u64) -> Self {
        let dim = config.embedding_dim;
        let hidden = config.hidden_units;

        let mut rng = StdRng::seed_from_u64(seed);
        let limit = (6.0 / dim as f32).sqrt();
        let w1 = (0..hidden * dim).map(|_| rng.gen_range(-limit..limit)).collect();

        Self {
            dim,
            hidden,
            learning_rate: config.learning_rate,
            w1,
            b1: vec![0.0; hidden],
            w2: vec![0.0; hidden],
            b2: 0.0,
            w1_moments: Moments::zeros(hidden * dim),
            b1_moments: Moments::zeros(hidden),
            w2_moments: Moments::zeros(hidden),
            b2_moments: Moments::zeros(1),
            adam_steps: 0,
            train_steps: 0,
            seed,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn hidden_units(&self) -> usize {
        self.hidden
    }

    /// Number of training steps ever applied
    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Predicted preference probability in [0, 1]. Read-only and deterministic.
    pub fn score(&self, embedding: &[f32]) -> Result<f32> {
        validate_embedding(embedding, self.dim)?;
        Ok(sigmoid(self.forward(embedding).logit))
    }

    /// One gradient step on a single sample; returns the loss the step was
    /// computed from.
    pub fn train_one(&mut self, embedding: &[f32], label: f32) -> Result<f32> {
        validate_embedding(embedding, self.dim)?;
        let label = clamp_label(label)?;
        Ok(self.step(embedding, label))
    }

    /// `epochs` passes over `samples`, reshuffled every epoch. Returns the
    /// mean loss of the final epoch. The whole batch is validated before any
    /// weight changes.
    pub fn train_batch(&mut self, samples: &[TrainingSample], epochs: usize) -> Result<f32> {
        if samples.is_empty() {
            return Ok(0.0);
        }

        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            validate_embedding(&sample.embedding, self.dim)?;
            labels.push(clamp_label(sample.label)?);
        }

        let mut rng = StdRng::seed_from_u64(self.seed ^ self.train_steps);
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut epoch_loss = 0.0;

        for _ in 0..epochs.max(1) {
            order.shuffle(&mut rng);
            epoch_loss = 0.0;
            for &idx in &order {
                epoch_loss += self.step(&samples[idx].embedding, labels[idx]);
            }
            epoch_loss /= samples.len() as f32;
        }

        Ok(epoch_loss)
    }

    /// Binary cross-entropy of the current prediction, without training
    pub fn loss(&self, embedding: &[f32], label: f32) -> Result<f32> {
        validate_embedding(embedding, self.dim)?;
        let label = clamp_label(label)?;
        Ok(bce_with_logit(self.forward(embedding).logit, label))
    }

    fn forward(&self, x: &[f32]) -> Forward {
        let mut pre_activation = Vec::with_capacity(self.hidden);
        let mut hidden = Vec::with_capacity(self.hidden);
        for j in 0..self.hidden {
            let row = &self.w1[j * self.dim..(j + 1) * self.dim];
            let z = self.b1[j] + row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f32>();
            pre_activation.push(z);
            hidden.push(z.max(0.0));
        }
        let logit = self.b2 + self.w2.iter().zip(&hidden).map(|(w, h)| w * h).sum::<f32>();
        Forward {
            pre_activation,
            hidden,
            logit,
        }
    }

    fn backward(&self, x: &[f32], forward: &Forward, label: f32) -> Gradients {
        // d(BCE)/d(logit) for a sigmoid output
        let d_logit = sigmoid(forward.logit) - label;

        let w2: Vec<f32> = forward.hidden.iter().map(|h| d_logit * h).collect();
        let b1: Vec<f32> = (0..self.hidden)
            .map(|j| {
                if forward.pre_activation[j] > 0.0 {
                    d_logit * self.w2[j]
                } else {
                    0.0
                }
            })
            .collect();

        let mut w1 = vec![0.0; self.hidden * self.dim];
        for (j, dh) in b1.iter().enumerate() {
            if *dh == 0.0 {
                continue;
            }
            let row = &mut w1[j * self.dim..(j + 1) * self.dim];
            for (g, xi) in row.iter_mut().zip(x) {
                *g = dh * xi;
            }
        }

        Gradients {
            w1,
            b1,
            w2,
            b2: d_logit,
        }
    }

    fn step(&mut self, x: &[f32], label: f32) -> f32 {
        let forward = self.forward(x);
        let loss = bce_with_logit(forward.logit, label);
        let grads = self.backward(x, &forward, label);

        self.adam_steps += 1;
        let t = self.adam_steps;
        let lr = self.learning_rate;
        self.w1_moments.apply(&mut self.w1, &grads.w1, lr, t);
        self.b1_moments.apply(&mut self.b1, &grads.b1, lr, t);
        self.w2_moments.apply(&mut self.w2, &grads.w2, lr, t);
        self.b2_moments
            .apply(std::slice::from_mut(&mut self.b2), &[grads.b2], lr, t);

        self.train_steps += 1;
        loss
    }

    /// Copy out everything needed to resume training later
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            version: SNAPSHOT_VERSION,
            dim: self.dim,
            hidden: self.hidden,
            w1: self.w1.clone(),
            b1: self.b1.clone(),
            w2: self.w2.clone(),
            b2: self.b2,
            w1_moments: self.w1_moments.clone(),
            b1_moments: self.b1_moments.clone(),
            w2_moments: self.w2_moments.clone(),
            b2_moments: self.b2_moments.clone(),
            adam_steps: self.adam_steps,
            train_steps: self.train_steps,
            seed: self.seed,
        }
    }

    /// Rebuild a model, rejecting snapshots that are inconsistent with
    /// themselves or with the configured shape
    pub fn from_snapshot(snapshot: ModelSnapshot, config: &RankingConfig) -> Result<Self> {
        let corrupt = |msg: String| Err(ConverseError::InvalidInput(msg));

        if snapshot.version != SNAPSHOT_VERSION {
            return corrupt(format!("unsupported snapshot version {}", snapshot.version));
        }
        if snapshot.dim != config.embedding_dim || snapshot.hidden != config.hidden_units {
            return corrupt(format!(
                "snapshot shape {}x{} does not match configured {}x{}",
                snapshot.dim, snapshot.hidden, config.embedding_dim, config.hidden_units
            ));
        }

        let (dim, hidden) = (snapshot.dim, snapshot.hidden);
        let shapes_ok = snapshot.w1.len() == dim * hidden
            && snapshot.b1.len() == hidden
            && snapshot.w2.len() == hidden
            && snapshot.w1_moments.len_matches(dim * hidden)
            && snapshot.b1_moments.len_matches(hidden)
            && snapshot.w2_moments.len_matches(hidden)
            && snapshot.b2_moments.len_matches(1);
        if !shapes_ok {
            return corrupt("snapshot tensors have inconsistent lengths".to_string());
        }

        let all_finite = snapshot
            .w1
            .iter()
            .chain(&snapshot.b1)
            .chain(&snapshot.w2)
            .chain(std::iter::once(&snapshot.b2))
            .all(|v| v.is_finite());
        if !all_finite {
            return corrupt("snapshot contains non-finite weights".to_string());
        }

        Ok(Self {
            dim,
            hidden,
            learning_rate: config.learning_rate,
            w1: snapshot.w1,
            b1: snapshot.b1,
            w2: snapshot.w2,
            b2: snapshot.b2,
            w1_moments: snapshot.w1_moments,
            b1_moments: snapshot.b1_moments,
            w2_moments: snapshot.w2_moments,
            b2_moments: snapshot.b2_moments,
            adam_steps: snapshot.adam_steps,
            train_steps: snapshot.train_steps,
            seed: snapshot.seed,
        })
    }
}

fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// `-(y·ln σ(z) + (1-y)·ln(1-σ(z)))`, computed without overflow
fn bce_with_logit(z: f32, label: f32) -> f32 {
    z.max(0.0) - z * label + (-z.abs()).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dim: usize) -> RankingConfig {
        RankingConfig {
            embedding_dim: dim,
            hidden_units: 8,
            ..RankingConfig::default()
        }
    }

    fn unit_vector(dim: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    #[test]
    fn test_cold_start_scores_half() {
        let model = RankingModel::with_seed(&config(16), 7);
        for seed in 0..5 {
            let score = model.score(&unit_vector(16, seed)).unwrap();
            assert_eq!(score, 0.5);
        }
    }

    #[test]
    fn test_score_is_deterministic() {
        let mut model = RankingModel::with_seed(&config(16), 7);
        let x = unit_vector(16, 1);
        model.train_one(&x, 1.0).unwrap();
        model.train_one(&x, 1.0).unwrap();

        let first = model.score(&x).unwrap();
        for _ in 0..10 {
            assert_eq!(model.score(&x).unwrap(), first);
        }
        let twin = RankingModel::from_snapshot(model.snapshot(), &config(16)).unwrap();
        assert_eq!(twin.score(&x).unwrap(), first);
    }

    #[test]
    fn test_repeated_positive_training_converges_monotonically() {
        let mut model = RankingModel::with_seed(&config(32), 42);
        let x = unit_vector(32, 3);

        let mut previous = model.score(&x).unwrap();
        for step in 0..200 {
            model.train_one(&x, 1.0).unwrap();
            let current = model.score(&x).unwrap();
            assert!(
                current > previous,
                "score did not increase at step {}: {} -> {}",
                step,
                previous,
                current
            );
            previous = current;
        }
        assert!(previous > 0.6, "score after 200 steps: {}", previous);
        assert_eq!(model.train_steps(), 200);
    }

    #[test]
    fn test_negative_training_pushes_down() {
        let mut model = RankingModel::with_seed(&config(16), 9);
        let x = unit_vector(16, 4);
        for _ in 0..100 {
            model.train_one(&x, 0.0).unwrap();
        }
        assert!(model.score(&x).unwrap() < 0.5);
    }

    #[test]
    fn test_train_one_returns_pre_step_loss() {
        let mut model = RankingModel::with_seed(&config(16), 1);
        let x = unit_vector(16, 2);
        let loss = model.train_one(&x, 1.0).unwrap();
        // ln 2 for p = 0.5
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        assert!(model.loss(&x, 1.0).unwrap() < loss);
    }

    #[test]
    fn test_labels_are_clamped() {
        let mut a = RankingModel::with_seed(&config(16), 5);
        let mut b = RankingModel::with_seed(&config(16), 5);
        let x = unit_vector(16, 6);
        a.train_one(&x, 3.5).unwrap();
        b.train_one(&x, 1.0).unwrap();
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_invalid_input_leaves_weights_untouched() {
        let mut model = RankingModel::with_seed(&config(4), 5);
        let before = model.snapshot();

        assert!(model.train_one(&[0.1, f32::NAN, 0.2, 0.3], 1.0).is_err());
        assert!(model.train_one(&[0.1, 0.2], 1.0).is_err());
        assert!(model.train_one(&[0.1, 0.2, 0.3, 0.4], f32::NAN).is_err());
        assert!(model.score(&[f32::INFINITY, 0.0, 0.0, 0.0]).is_err());

        let batch = vec![
            TrainingSample::new(vec![0.1, 0.2, 0.3, 0.4], 1.0),
            TrainingSample::new(vec![0.1, f32::NAN, 0.3, 0.4], 1.0),
        ];
        assert!(model.train_batch(&batch, 3).is_err());

        assert_eq!(model.snapshot(), before);
    }

    #[test]
    fn test_batch_training_separates_classes() {
        let fast = RankingConfig {
            learning_rate: 0.01,
            ..config(16)
        };
        let mut model = RankingModel::with_seed(&fast, 11);
        let liked: Vec<_> = (0..4).map(|s| unit_vector(16, 100 + s)).collect();
        let disliked: Vec<_> = liked.iter().map(|v| v.iter().map(|x| -x).collect::<Vec<f32>>()).collect();

        let mut samples = Vec::new();
        for v in &liked {
            samples.push(TrainingSample::new(v.clone(), 1.0));
        }
        for v in &disliked {
            samples.push(TrainingSample::new(v.clone(), 0.0));
        }

        let first = model.train_batch(&samples, 1).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = model.train_batch(&samples, 5).unwrap();
        }
        assert!(last < first);
        assert_eq!(model.train_steps(), 8 * (1 + 20 * 5));

        for (good, bad) in liked.iter().zip(&disliked) {
            assert!(model.score(good).unwrap() > model.score(bad).unwrap());
        }
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut model = RankingModel::with_seed(&config(4), 5);
        assert_eq!(model.train_batch(&[], 3).unwrap(), 0.0);
        assert_eq!(model.train_steps(), 0);
    }

    #[test]
    fn test_snapshot_rejects_shape_mismatch_and_corruption() {
        let model = RankingModel::with_seed(&config(16), 5);

        assert!(RankingModel::from_snapshot(model.snapshot(), &config(32)).is_err());

        let mut broken = model.snapshot();
        broken.w2.pop();
        assert!(RankingModel::from_snapshot(broken, &config(16)).is_err());

        let mut poisoned = model.snapshot();
        poisoned.b1[0] = f32::NAN;
        assert!(RankingModel::from_snapshot(poisoned, &config(16)).is_err());

        let mut future = model.snapshot();
        future.version = SNAPSHOT_VERSION + 1;
        assert!(RankingModel::from_snapshot(future, &config(16)).is_err());
    }

    #[test]
    fn test_bce_matches_definition() {
        for &(z, y) in &[(0.0f32, 1.0f32), (2.0, 0.0), (-3.0, 1.0), (1.5, 0.3)] {
            let p = sigmoid(z);
            let direct = -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
            assert!((bce_with_logit(z, y) - direct).abs() < 1e-5);
        }
    }
}

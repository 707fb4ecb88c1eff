/// Temperature sampler for language-model logits.
///
/// Applies temperature scaling and a stabilized softmax, then draws from
/// the resulting distribution with a single inverse-CDF walk. A simple
/// xorshift generator keeps draws reproducible for a given seed; the
/// per-vocabulary probability scratch is allocated once and reused on
/// every step.
#[derive(Debug)]
pub struct Sampler {
    probs: Vec<f32>,
    temperature: f32,
    rng_state: u64,
}

impl Sampler {
    /// Creates a sampler for a vocabulary of `vocab_size` logits.
    ///
    /// # Arguments
    /// * `vocab_size` - Size of the vocabulary
    /// * `temperature` - Sampling temperature; non-positive values fall
    ///   back to 1.0 at sampling time
    /// * `rng_seed` - Random seed for reproducibility
    pub fn new(vocab_size: usize, temperature: f32, rng_seed: u64) -> Self {
        assert!(vocab_size > 0, "vocab size must be positive");

        Self {
            probs: vec![0.0; vocab_size],
            temperature,
            // Xorshift cannot leave the all-zero state.
            rng_state: if rng_seed == 0 { 0x9E3779B9 } else { rng_seed },
        }
    }

    /// Xorshift-based random number generator.
    fn random_u32(&mut self) -> u32 {
        self.rng_state ^= self.rng_state >> 12;
        self.rng_state ^= self.rng_state << 25;
        self.rng_state ^= self.rng_state >> 27;
        ((self.rng_state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Returns a random float in [0, 1).
    fn random_f32(&mut self) -> f32 {
        (self.random_u32() >> 8) as f32 / 16777216.0
    }

    /// Samples a token index from a raw logits row.
    ///
    /// The caller's logits are left untouched: temperature scaling and the
    /// softmax happen in the internal scratch buffer. Deterministic for a
    /// given generator state.
    pub fn sample(&mut self, logits: &[f32]) -> usize {
        assert_eq!(
            logits.len(),
            self.probs.len(),
            "logits row does not match the sampler's vocabulary size"
        );

        let temperature = if self.temperature > 0.0 {
            self.temperature
        } else {
            1.0
        };

        // Stabilized softmax of logits / temperature into the scratch.
        let max_logit = logits.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let mut sum = 0.0;
        for (p, &logit) in self.probs.iter_mut().zip(logits) {
            *p = ((logit - max_logit) / temperature).exp();
            sum += *p;
        }
        let inv_sum = sum.recip();
        self.probs.iter_mut().for_each(|p| *p *= inv_sum);

        // Inverse-CDF draw: first index whose cumulative mass exceeds the
        // coin. Falling through is only possible via floating-point
        // underflow; the last token is the documented fallback.
        let coin = self.random_f32();
        let mut cdf = 0.0;
        for (i, &p) in self.probs.iter().enumerate() {
            cdf += p;
            if coin < cdf {
                return i;
            }
        }
        self.probs.len() - 1
    }
}

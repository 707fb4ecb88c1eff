use crate::error::{EngineError, Result};
use crate::tensor::{IndexTensor, Tensor};

/// An affine projection `y = x * W^T + b`.
///
/// `weight` is `[out_features, in_features]`, `bias` is `[1, out_features]`.
/// Immutable after construction; the weight set is loaded once.
#[derive(Clone)]
pub struct LinearWeights {
    weight: Tensor,
    bias: Tensor,
}

impl LinearWeights {
    pub fn new(weight: Tensor, bias: Tensor) -> Result<Self> {
        if bias.rows() != 1 || bias.cols() != weight.rows() {
            return Err(EngineError::InvalidInput(format!(
                "linear bias must be 1x{}, got {}x{}",
                weight.rows(),
                bias.rows(),
                bias.cols()
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.cols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.rows()
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Projects `x: [n, in]` to `[n, out]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        linear(x, &self.weight, &self.bias)
    }
}

impl std::fmt::Debug for LinearWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearWeights")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .finish()
    }
}

/// The affine projection as a free function, so callers holding a tied
/// weight matrix (the language-model head) can reuse it without owning a
/// duplicate copy.
pub fn linear(x: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let weight_t = weight.transpose()?;
    let product = x.matmul(&weight_t)?;
    product.add(bias)
}

/// Token embedding table of shape `[vocab_size, embed_dim]`.
#[derive(Clone)]
pub struct EmbeddingWeights {
    weight: Tensor,
}

impl EmbeddingWeights {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.rows()
    }

    pub fn embed_dim(&self) -> usize {
        self.weight.cols()
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Gathers the embedding rows for a `1 x k` index vector, producing
    /// `[k, embed_dim]`. Any identifier at or past the vocabulary size is
    /// rejected.
    pub fn forward(&self, indices: &IndexTensor) -> Result<Tensor> {
        for &id in indices.data() {
            if id as usize >= self.vocab_size() {
                return Err(EngineError::InvalidInput(format!(
                    "token id {} outside vocabulary of size {}",
                    id,
                    self.vocab_size()
                )));
            }
        }
        self.weight.row_select(indices)
    }
}

impl std::fmt::Debug for EmbeddingWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingWeights")
            .field("vocab_size", &self.vocab_size())
            .field("embed_dim", &self.embed_dim())
            .finish()
    }
}

/// Element-wise rectifier `max(x, 0)` on a fresh copy.
pub fn relu(m: &Tensor) -> Result<Tensor> {
    let mut res = m.clone();
    res.clamp_min(0.0);
    Ok(res)
}

/// Row-wise softmax with the standard stabilization: subtract the row
/// maximum before exponentiating, so the largest exponent is `exp(0) = 1`
/// and arbitrarily large inputs cannot overflow.
///
/// Entries of `-inf` (from the causal mask) contribute zero probability
/// mass. Every row must keep at least one finite entry; a fully masked row
/// would divide by zero.
pub fn softmax_rows(m: &Tensor) -> Result<Tensor> {
    let mut res = m.clone();
    for row in res.data_mut().chunks_mut(m.cols()) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        debug_assert!(
            max_val.is_finite(),
            "softmax row has no finite entry; the causal mask is wrong"
        );
        let sum = row
            .iter_mut()
            .map(|v| {
                *v = (*v - max_val).exp();
                *v
            })
            .sum::<f32>();
        let inv_sum = sum.recip();
        row.iter_mut().for_each(|v| *v *= inv_sum);
    }
    Ok(res)
}

/// The four projections of the single-head attention block, all square
/// `[embed_dim, embed_dim]`.
#[derive(Clone, Debug)]
pub struct AttentionWeights {
    pub wq: LinearWeights,
    pub wk: LinearWeights,
    pub wv: LinearWeights,
    pub wo: LinearWeights,
}

impl AttentionWeights {
    pub fn new(
        wq: LinearWeights,
        wk: LinearWeights,
        wv: LinearWeights,
        wo: LinearWeights,
    ) -> Result<Self> {
        let embed_dim = wq.in_features();
        for (name, p) in [("Wq", &wq), ("Wk", &wk), ("Wv", &wv), ("Wo", &wo)] {
            if p.in_features() != embed_dim || p.out_features() != embed_dim {
                return Err(EngineError::InvalidInput(format!(
                    "attention projection {} must be {}x{}, got {}x{}",
                    name,
                    embed_dim,
                    embed_dim,
                    p.out_features(),
                    p.in_features()
                )));
            }
        }
        Ok(Self { wq, wk, wv, wo })
    }

    pub fn embed_dim(&self) -> usize {
        self.wq.in_features()
    }
}

/// Append-only accumulator of every key and value produced in the current
/// generation session.
///
/// Starts Empty (`len() == 0`) and becomes Primed after the first forward
/// pass; rows only ever grow. There is no reset short of dropping the cache,
/// and a cache must never be shared between sessions.
pub struct AttentionCache {
    k: Tensor,
    v: Tensor,
}

impl AttentionCache {
    pub fn new(embed_dim: usize) -> Self {
        Self {
            k: Tensor::empty(embed_dim),
            v: Tensor::empty(embed_dim),
        }
    }

    /// Number of tokens cached so far.
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.k.rows(), self.v.rows());
        self.k.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> &Tensor {
        &self.k
    }

    pub fn values(&self) -> &Tensor {
        &self.v
    }

    /// Extends the cache by the freshly projected keys and values. The two
    /// blocks must carry the same number of rows.
    pub fn append(&mut self, k_new: &Tensor, v_new: &Tensor) -> Result<()> {
        if k_new.rows() != v_new.rows() {
            return Err(EngineError::InvalidInput(format!(
                "key and value row counts differ: {} vs {}",
                k_new.rows(),
                v_new.rows()
            )));
        }
        self.k.append_rows(k_new)?;
        self.v.append_rows(v_new)
    }
}

impl std::fmt::Debug for AttentionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionCache")
            .field("len", &self.len())
            .field("embed_dim", &self.k.cols())
            .finish()
    }
}

/// Scaled dot-product self-attention with causal masking and a residual
/// connection, threading the key/value cache.
///
/// For input `x: [n, embed]` against a cache of `t` prior tokens:
/// the new keys and values are appended first, scores `Q * K_full^T` are
/// scaled by `1/sqrt(embed)` (single head, so the full embedding width is
/// the divisor), masked so the query at absolute position `t + i` sees only
/// positions `0..=t + i`, soft-maxed row-wise, and applied to the values.
/// Returns `x + Wo(A * V_full)`.
pub fn attention_forward(
    x: &Tensor,
    weights: &AttentionWeights,
    cache: &mut AttentionCache,
) -> Result<Tensor> {
    let prior_len = cache.len();

    let q = weights.wq.forward(x)?;
    let k_new = weights.wk.forward(x)?;
    let v_new = weights.wv.forward(x)?;
    cache.append(&k_new, &v_new)?;

    let k_t = cache.keys().transpose()?;
    let mut scores = q.matmul(&k_t)?;
    scores.scale((weights.embed_dim() as f32).sqrt().recip());

    mask_causal(&mut scores, prior_len);

    let attn = softmax_rows(&scores)?;
    let context = attn.matmul(cache.values())?;
    let out = weights.wo.forward(&context)?;
    x.add(&out)
}

/// Masks scores `[n, t + n]` so the local query `i` (absolute position
/// `t + i`) cannot attend past itself. During single-step decode (`n == 1`)
/// no cell is masked; during prefill (`t == 0`) this is the standard
/// lower-triangular mask.
fn mask_causal(scores: &mut Tensor, prior_len: usize) {
    let cols = scores.cols();
    for (i, row) in scores.data_mut().chunks_mut(cols).enumerate() {
        let visible = prior_len + i + 1;
        for v in &mut row[visible.min(cols)..] {
            *v = f32::NEG_INFINITY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f32 = 1e-4;

    fn tensor(rows: usize, cols: usize, values: &[f32]) -> Tensor {
        Tensor::from_vec(rows, cols, values.to_vec()).unwrap()
    }

    /// Deterministic pseudo-random fill so attention tests exercise
    /// non-trivial values without a PRNG dependency.
    fn patterned(rows: usize, cols: usize, scale: f32) -> Tensor {
        let mut m = Tensor::new(rows, cols).unwrap();
        for (i, v) in m.data_mut().iter_mut().enumerate() {
            *v = (((i * 31 + 7) % 23) as f32 / 23.0 - 0.5) * scale;
        }
        m
    }

    fn patterned_attention(embed_dim: usize) -> AttentionWeights {
        let projection = |offset: usize| {
            let mut w = patterned(embed_dim, embed_dim, 0.6);
            // Vary each projection so Q, K, V, O differ.
            w.shift(offset as f32 * 0.05);
            let bias = patterned(1, embed_dim, 0.1);
            LinearWeights::new(w, bias).unwrap()
        };
        AttentionWeights::new(projection(0), projection(1), projection(2), projection(3)).unwrap()
    }

    #[test]
    fn test_linear_forward_known_values() {
        // y = x * W^T + b with W = [[1, 2], [3, 4]], b = [10, 20]
        let weights = LinearWeights::new(
            tensor(2, 2, &[1.0, 2.0, 3.0, 4.0]),
            tensor(1, 2, &[10.0, 20.0]),
        )
        .unwrap();
        let x = tensor(1, 2, &[1.0, 1.0]);
        let y = weights.forward(&x).unwrap();
        assert_eq!(y.data(), &[13.0, 27.0]);
    }

    #[test]
    fn test_linear_bias_broadcasts_over_rows() {
        let weights =
            LinearWeights::new(Tensor::identity(2).unwrap(), tensor(1, 2, &[1.0, -1.0])).unwrap();
        let x = tensor(3, 2, &[0.0, 0.0, 2.0, 3.0, 5.0, 7.0]);
        let y = weights.forward(&x).unwrap();
        assert_eq!(y.data(), &[1.0, -1.0, 3.0, 2.0, 6.0, 6.0]);
    }

    #[test]
    fn test_linear_rejects_bad_bias_shape() {
        let result = LinearWeights::new(Tensor::new(2, 3).unwrap(), Tensor::new(1, 3).unwrap());
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_embedding_lookup() {
        let table = EmbeddingWeights::new(tensor(3, 2, &[0.0, 0.1, 1.0, 1.1, 2.0, 2.1]));
        let indices = IndexTensor::from_slice(&[2, 0, 2]).unwrap();
        let out = table.forward(&indices).unwrap();
        assert_eq!(out.rows(), 3);
        assert_eq!(out.data(), &[2.0, 2.1, 0.0, 0.1, 2.0, 2.1]);
    }

    #[test]
    fn test_embedding_rejects_out_of_vocab() {
        let table = EmbeddingWeights::new(Tensor::new(3, 2).unwrap());
        let indices = IndexTensor::from_slice(&[3]).unwrap();
        assert!(matches!(
            table.forward(&indices),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_relu() {
        let m = tensor(1, 4, &[-2.0, -0.5, 0.0, 3.0]);
        let out = relu(&m).unwrap();
        assert_eq!(out.data(), &[0.0, 0.0, 0.0, 3.0]);
        // Input is untouched.
        assert_eq!(m.data()[0], -2.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let m = patterned(4, 6, 8.0);
        let out = softmax_rows(&m).unwrap();
        for i in 0..out.rows() {
            let row = out.row(i).unwrap();
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < TOLERANCE);
            assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn test_softmax_extreme_values_stay_finite() {
        let m = tensor(1, 3, &[-100.0, 0.0, 100.0]);
        let out = softmax_rows(&m).unwrap();
        let row = out.row(0).unwrap();
        assert!(row.iter().all(|p| p.is_finite()));
        assert!(row[2] > 0.99);
        assert!((row.iter().sum::<f32>() - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_softmax_uniform_input() {
        let m = tensor(1, 4, &[3.0, 3.0, 3.0, 3.0]);
        let out = softmax_rows(&m).unwrap();
        for &p in out.row(0).unwrap() {
            assert!((p - 0.25).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_softmax_masked_entries_get_zero_mass() {
        let m = tensor(1, 3, &[1.0, f32::NEG_INFINITY, 2.0]);
        let out = softmax_rows(&m).unwrap();
        let row = out.row(0).unwrap();
        assert_eq!(row[1], 0.0);
        assert!((row[0] + row[2] - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_attention_weights_reject_non_square() {
        let square = LinearWeights::new(Tensor::new(4, 4).unwrap(), Tensor::new(1, 4).unwrap())
            .unwrap();
        let rect =
            LinearWeights::new(Tensor::new(4, 2).unwrap(), Tensor::new(1, 4).unwrap()).unwrap();
        let result = AttentionWeights::new(square.clone(), square.clone(), square, rect);
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_cache_starts_empty_and_grows() {
        let weights = patterned_attention(4);
        let mut cache = AttentionCache::new(4);
        assert!(cache.is_empty());

        let x = patterned(3, 4, 1.0);
        attention_forward(&x, &weights, &mut cache).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.keys().rows(), cache.values().rows());

        let step = patterned(1, 4, 0.5);
        attention_forward(&step, &weights, &mut cache).unwrap();
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_cache_append_rejects_row_mismatch() {
        let mut cache = AttentionCache::new(4);
        let k = Tensor::new(2, 4).unwrap();
        let v = Tensor::new(3, 4).unwrap();
        assert!(matches!(
            cache.append(&k, &v),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_attention_output_shape_and_residual() {
        // With all projections zero the block reduces to the residual path.
        let zero = || {
            LinearWeights::new(Tensor::new(4, 4).unwrap(), Tensor::new(1, 4).unwrap()).unwrap()
        };
        let weights = AttentionWeights::new(zero(), zero(), zero(), zero()).unwrap();
        let mut cache = AttentionCache::new(4);
        let x = patterned(2, 4, 1.0);
        let out = attention_forward(&x, &weights, &mut cache).unwrap();
        assert_eq!(out.rows(), 2);
        assert_eq!(out.cols(), 4);
        assert_eq!(out, x);
    }

    #[test]
    fn test_prefill_matches_stepwise_decode() {
        // The last row of a 3-token prefill must equal the output of the
        // third single-token step against an incrementally built cache.
        let weights = patterned_attention(4);
        let x = patterned(3, 4, 1.0);

        let mut prefill_cache = AttentionCache::new(4);
        let prefill_out = attention_forward(&x, &weights, &mut prefill_cache).unwrap();

        let mut step_cache = AttentionCache::new(4);
        let mut last_row = None;
        for i in 0..3 {
            let row = Tensor::from_vec(1, 4, x.row(i).unwrap().to_vec()).unwrap();
            last_row = Some(attention_forward(&row, &weights, &mut step_cache).unwrap());
        }

        let expected = prefill_out.row(2).unwrap();
        let actual = last_row.unwrap();
        for (a, e) in actual.row(0).unwrap().iter().zip(expected) {
            assert!((a - e).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_causal_mask_blocks_future_positions() {
        // A query must not change when a future token changes. Run a 2-token
        // prefill twice, varying only the second token; row 0 must agree.
        let weights = patterned_attention(4);

        let mut first = patterned(2, 4, 1.0);
        let mut cache_a = AttentionCache::new(4);
        let out_a = attention_forward(&first, &weights, &mut cache_a).unwrap();

        for v in &mut first.data_mut()[4..] {
            *v += 5.0;
        }
        let mut cache_b = AttentionCache::new(4);
        let out_b = attention_forward(&first, &weights, &mut cache_b).unwrap();

        for (a, b) in out_a.row(0).unwrap().iter().zip(out_b.row(0).unwrap()) {
            assert!((a - b).abs() < TOLERANCE);
        }
    }
}

use crate::configuration::ModelConfig;
use crate::error::{EngineError, Result};
use crate::layers::{
    attention_forward, linear, relu, AttentionCache, AttentionWeights, EmbeddingWeights,
    LinearWeights,
};
use crate::loader;
use crate::tensor::{IndexTensor, Tensor};
use log::debug;

/// The full learned parameter set of the single-layer decoder.
///
/// The language-model head is weight-tied: its projection matrix is the
/// token-embedding table itself, so only the head's bias is stored here and
/// the logits projection borrows the embedding matrix at call time.
#[derive(Debug)]
pub struct TransformerParameters {
    /// Token embedding table, `[vocab_size, embed_dim]`. Doubles as the
    /// LM-head projection.
    pub token_embed: EmbeddingWeights,

    /// Learned absolute positional embeddings, `[max_seq_len, embed_dim]`.
    pub pos_embed: Tensor,

    /// The four attention projections, each `[embed_dim, embed_dim]`.
    pub attn: AttentionWeights,

    /// Feed-forward up projection, `[ff_dim, embed_dim]`.
    pub w1: LinearWeights,

    /// Feed-forward down projection, `[embed_dim, ff_dim]`.
    pub w2: LinearWeights,

    /// LM head bias, `[1, vocab_size]`.
    pub lm_head_bias: Tensor,
}

/// Single-layer causal decoder: embeddings plus positions, one attention
/// block with a key/value cache, a two-layer rectifier feed-forward, and
/// the tied language-model head.
pub struct Transformer {
    config: ModelConfig,
    params: TransformerParameters,
}

impl Transformer {
    /// Validates the parameter shapes against each other and derives the
    /// model configuration from them.
    pub fn new(params: TransformerParameters) -> Result<Self> {
        let config = ModelConfig::from_parameters(&params)?;
        Ok(Self { config, params })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// A fresh, empty cache sized for this model. One per generation
    /// session; caches are never shared.
    pub fn new_cache(&self) -> AttentionCache {
        AttentionCache::new(self.config.embed_dim)
    }

    /// One forward pass over `tokens`, a `1 x n` index row starting at
    /// absolute position `pos`. Extends `cache` by `n` rows and returns the
    /// `[n, vocab_size]` logits.
    ///
    /// `pos` is 0 during prefill and the current cache length during
    /// decode; a window that would run past the positional table is
    /// rejected.
    pub fn forward(
        &self,
        tokens: &IndexTensor,
        cache: &mut AttentionCache,
        pos: usize,
    ) -> Result<Tensor> {
        if tokens.rows() != 1 {
            return Err(EngineError::InvalidInput(format!(
                "batched input is not supported: token indices must be a single row, got {} rows",
                tokens.rows()
            )));
        }
        let n = tokens.cols();
        if pos + n > self.config.max_seq_len {
            return Err(EngineError::InvalidInput(format!(
                "positions {}..{} exceed the model context of {}",
                pos,
                pos + n,
                self.config.max_seq_len
            )));
        }

        // Token embeddings plus the positional rows for this window.
        let embedded = self.params.token_embed.forward(tokens)?;
        let positions = IndexTensor::from_range(pos, pos + n)?;
        let pos_rows = self.params.pos_embed.row_select(&positions)?;
        let mut x = embedded.add(&pos_rows)?;

        // Attention sub-block; the residual is folded in.
        x = attention_forward(&x, &self.params.attn, cache)?;

        // Feed-forward sub-block with residual.
        let hidden = relu(&self.params.w1.forward(&x)?)?;
        let hidden = self.params.w2.forward(&hidden)?;
        let x = x.add(&hidden)?;

        // Tied LM head: project back into the vocabulary with the
        // embedding matrix.
        linear(&x, self.params.token_embed.weight(), &self.params.lm_head_bias)
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("params", &self.params)
            .finish()
    }
}

/// Builder for a [`Transformer`] backed by an on-disk weight directory.
pub struct TransformerBuilder {
    weights_dir: String,
    ctx_length: Option<usize>,
}

impl TransformerBuilder {
    pub fn new(weights_dir: &str) -> Self {
        Self {
            weights_dir: weights_dir.to_string(),
            ctx_length: None,
        }
    }

    /// Clamps the usable context below the positional table's native size.
    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Transformer> {
        let params = loader::load_model_weights(&self.weights_dir)?;
        let mut transformer = Transformer::new(params)?;

        if let Some(ctx_len) = self.ctx_length {
            transformer.config.max_seq_len = ctx_len.min(transformer.config.max_seq_len);
            debug!(
                "context length clamped to {}",
                transformer.config.max_seq_len
            );
        }

        Ok(transformer)
    }
}

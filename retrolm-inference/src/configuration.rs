use crate::error::{EngineError, Result};
use crate::transformer::TransformerParameters;

/// Model dimensions, derived from the shapes of the loaded weight set and
/// cross-validated so a malformed weight directory fails at load time
/// instead of mid-generation.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub ff_dim: usize,
    pub max_seq_len: usize,
}

impl ModelConfig {
    /// Reads the dimensions off the parameter set and verifies that every
    /// matrix agrees with them.
    pub fn from_parameters(params: &TransformerParameters) -> Result<Self> {
        let embed_dim = params.token_embed.embed_dim();
        let vocab_size = params.token_embed.vocab_size();
        let max_seq_len = params.pos_embed.rows();
        let ff_dim = params.w1.out_features();

        if params.pos_embed.cols() != embed_dim {
            return Err(shape_error(
                "positional embeddings",
                max_seq_len,
                embed_dim,
                params.pos_embed.rows(),
                params.pos_embed.cols(),
            ));
        }
        if params.attn.embed_dim() != embed_dim {
            return Err(EngineError::InvalidInput(format!(
                "attention projections are {0}x{0} but the embedding width is {1}",
                params.attn.embed_dim(),
                embed_dim
            )));
        }
        if params.w1.in_features() != embed_dim {
            return Err(shape_error(
                "W1",
                ff_dim,
                embed_dim,
                params.w1.out_features(),
                params.w1.in_features(),
            ));
        }
        if params.w2.in_features() != ff_dim || params.w2.out_features() != embed_dim {
            return Err(shape_error(
                "W2",
                embed_dim,
                ff_dim,
                params.w2.out_features(),
                params.w2.in_features(),
            ));
        }
        if params.lm_head_bias.rows() != 1 || params.lm_head_bias.cols() != vocab_size {
            return Err(shape_error(
                "LM head bias",
                1,
                vocab_size,
                params.lm_head_bias.rows(),
                params.lm_head_bias.cols(),
            ));
        }

        Ok(Self {
            vocab_size,
            embed_dim,
            ff_dim,
            max_seq_len,
        })
    }
}

fn shape_error(
    name: &str,
    want_rows: usize,
    want_cols: usize,
    got_rows: usize,
    got_cols: usize,
) -> EngineError {
    EngineError::InvalidInput(format!(
        "{name} must be {want_rows}x{want_cols}, got {got_rows}x{got_cols}"
    ))
}

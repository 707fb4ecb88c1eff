//! Weight loading from a directory of per-matrix binary files.
//!
//! Each file is `u32 LE rows`, `u32 LE cols`, then `rows * cols` IEEE-754
//! single-precision floats in row-major order. The language-model head's
//! projection matrix is not stored on disk; it is the token-embedding table.

use crate::error::{EngineError, Result};
use crate::layers::{AttentionWeights, EmbeddingWeights, LinearWeights};
use crate::tensor::Tensor;
use crate::transformer::TransformerParameters;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Longest accepted weights-directory path.
const MAX_DIR_LEN: usize = 1000;

/// Reads one weight matrix from `path`.
pub fn load_weight_matrix(path: &Path) -> Result<Tensor> {
    let file = File::open(path).map_err(|e| {
        EngineError::File(format!(
            "failed to open weight file {}: {e}",
            path.display()
        ))
    })?;
    let mut reader = BufReader::new(file);

    let rows = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_failure(path, "row count", e))?;
    let cols = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| read_failure(path, "column count", e))?;

    let mut matrix = Tensor::new(rows as usize, cols as usize)?;
    reader
        .read_f32_into::<LittleEndian>(matrix.data_mut())
        .map_err(|e| read_failure(path, "matrix data", e))?;

    Ok(matrix)
}

fn read_failure(path: &Path, what: &str, e: std::io::Error) -> EngineError {
    EngineError::File(format!("failed to read {} from {}: {e}", what, path.display()))
}

fn load_weight(dir: &Path, filename: &str) -> Result<Tensor> {
    debug!("loading {filename}");
    load_weight_matrix(&dir.join(filename))
}

fn load_linear(dir: &Path, name: &str) -> Result<LinearWeights> {
    let weight = load_weight(dir, &format!("{name}_weight.bin"))?;
    let bias = load_weight(dir, &format!("{name}_bias.bin"))?;
    LinearWeights::new(weight, bias)
}

/// Loads the complete parameter set from `weights_dir`.
///
/// Shape consistency across the files is checked when the transformer is
/// constructed; this function only enforces each file's own framing.
pub fn load_model_weights(weights_dir: &str) -> Result<TransformerParameters> {
    if weights_dir.is_empty() {
        return Err(EngineError::Value(
            "empty weights directory path".to_string(),
        ));
    }
    if weights_dir.len() > MAX_DIR_LEN {
        return Err(EngineError::Value(format!(
            "weights directory path too long ({} bytes)",
            weights_dir.len()
        )));
    }

    info!("loading model weights from {weights_dir}");
    let dir = Path::new(weights_dir);

    let token_embed = EmbeddingWeights::new(load_weight(dir, "token_embed.bin")?);
    let pos_embed = load_weight(dir, "pos_embed.bin")?;

    let attn = AttentionWeights::new(
        load_linear(dir, "Wq")?,
        load_linear(dir, "Wk")?,
        load_linear(dir, "Wv")?,
        load_linear(dir, "Wo")?,
    )?;

    let w1 = load_linear(dir, "W1")?;
    let w2 = load_linear(dir, "W2")?;

    // The head's projection is tied to the embedding table; only its bias
    // lives on disk.
    let lm_head_bias = load_weight(dir, "lm_head_bias.bin")?;

    info!("all weights loaded");

    Ok(TransformerParameters {
        token_embed,
        pos_embed,
        attn,
        w1,
        w2,
        lm_head_bias,
    })
}

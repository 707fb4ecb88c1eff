//! RetroLM inference library.
//!
//! A from-scratch inference engine for a small single-layer decoder-only
//! transformer, built for memory- and CPU-constrained machines: row-major
//! tensor primitives, scaled dot-product attention with an append-only
//! key/value cache, temperature sampling, and a streaming generation loop.

pub mod configuration;
pub mod error;
pub mod generation;
pub mod layers;
pub mod loader;
pub mod sampler;
pub mod tensor;
pub mod transformer;

use anyhow::Result;
use log::debug;
use std::time::{SystemTime, UNIX_EPOCH};

pub use configuration::ModelConfig;
pub use error::EngineError;
pub use generation::GenerationOptions;
pub use sampler::Sampler;
pub use tensor::{IndexTensor, Tensor};
pub use transformer::{Transformer, TransformerBuilder};

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub weights_dir: String,
    pub temperature: f32,
    pub ctx_length: Option<usize>,
    pub mode: String,
    pub prompt: Option<String>,
    pub max_tokens: usize,
    pub halt_on_unprintable: bool,
    pub seed: u64,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    weights_dir: Option<String>,
    temperature: Option<f32>,
    ctx_length: Option<usize>,
    mode: Option<String>,
    prompt: Option<String>,
    max_tokens: Option<usize>,
    halt_on_unprintable: Option<bool>,
    seed: Option<u64>,
}

impl InferenceConfigBuilder {
    pub fn weights_dir(mut self, dir: Option<&String>) -> Self {
        self.weights_dir = dir.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn halt_on_unprintable(mut self, halt: Option<bool>) -> Self {
        self.halt_on_unprintable = halt;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn build(self) -> Result<InferenceConfig, String> {
        let defaults = GenerationOptions::default();
        Ok(InferenceConfig {
            weights_dir: self.weights_dir.ok_or("weights_dir is required")?,
            temperature: self.temperature.unwrap_or(1.0),
            ctx_length: self.ctx_length,
            mode: self.mode.unwrap_or_else(|| "chat".to_string()),
            prompt: self.prompt,
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            halt_on_unprintable: self
                .halt_on_unprintable
                .unwrap_or(defaults.halt_on_unprintable),
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
        })
    }
}

/// Runs inference.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    let transformer = TransformerBuilder::new(&inference_config.weights_dir)
        .with_ctx_length(inference_config.ctx_length)
        .build()?;

    debug!("{transformer:#?}");

    let mut sampler = Sampler::new(
        transformer.config().vocab_size,
        inference_config.temperature,
        inference_config.seed,
    );

    let options = GenerationOptions {
        max_tokens: inference_config.max_tokens,
        halt_on_unprintable: inference_config.halt_on_unprintable,
    };
    let prompt = inference_config.prompt.as_deref();

    // Run
    match inference_config.mode.as_str() {
        "generate" => generation::generate(&transformer, &mut sampler, prompt, &options),
        "chat" => generation::chat(&transformer, &mut sampler, prompt, &options),
        _ => anyhow::bail!("Unknown mode: {inference_config:?}"),
    }
}

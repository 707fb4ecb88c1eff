use crate::layers::AttentionCache;
use crate::sampler::Sampler;
use crate::tensor::IndexTensor;
use crate::transformer::Transformer;
use anyhow::Result;
use log::debug;
use std::io::{self, Write};
use std::time::Instant;

/// Token that always terminates a response.
const NEWLINE_TOKEN: u32 = b'\n' as u32;

/// Inclusive range of byte values surfaced to the output sink.
const PRINTABLE_MIN: u32 = 32;
const PRINTABLE_MAX: u32 = 126;

/// First byte value outside the byte-printable range.
const UNPRINTABLE_START: u32 = 127;

/// Console input cap per user turn.
const MAX_INPUT: usize = 256;

/// Default response budget per turn.
const MAX_RESPONSE_TOKENS: usize = 512;

/// Knobs for a single generation run.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Upper bound on decode steps per response.
    pub max_tokens: usize,

    /// When true (the default), a sampled token at or above 127 terminates
    /// the response. When false it is kept but suppressed from the visible
    /// stream, like the control codes below 32.
    pub halt_on_unprintable: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: MAX_RESPONSE_TOKENS,
            halt_on_unprintable: true,
        }
    }
}

/// One autoregressive generation run: the attention cache, the token
/// sequence seen so far, and the reusable single-token input buffer.
///
/// The cache belongs exclusively to this session and only ever grows; a new
/// conversation turn builds a fresh session. The `1 x 1` step input is
/// allocated once here so the decode loop does not allocate an index tensor
/// per token.
pub struct GenerationSession<'a> {
    transformer: &'a Transformer,
    cache: AttentionCache,
    tokens: Vec<u32>,
    step_input: IndexTensor,
}

impl<'a> GenerationSession<'a> {
    /// Creates a session and prefills the cache with the whole prompt in a
    /// single forward pass (the prefill logits are discarded; the pass
    /// exists to populate the cache). The prompt is byte-level identity
    /// tokenized and must not be empty.
    pub fn new(transformer: &'a Transformer, prompt: &[u8]) -> crate::error::Result<Self> {
        if prompt.is_empty() {
            return Err(crate::error::EngineError::InvalidInput(
                "prompt must not be empty".to_string(),
            ));
        }

        let tokens: Vec<u32> = prompt.iter().map(|&b| b as u32).collect();
        let mut cache = transformer.new_cache();

        let input = IndexTensor::from_slice(&tokens)?;
        transformer.forward(&input, &mut cache, 0)?;

        Ok(Self {
            transformer,
            cache,
            tokens,
            step_input: IndexTensor::new(1, 1)?,
        })
    }

    /// Tokens the cache currently covers.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Decode steps still possible before the positional table runs out.
    pub fn context_remaining(&self) -> usize {
        self.transformer.config().max_seq_len - self.cache.len()
    }

    /// One decode step: feeds the most recent token at the next absolute
    /// position and samples from the resulting logits row. The sampled
    /// token is returned but not yet appended; the caller applies the stop
    /// rule first.
    pub fn step(&mut self, sampler: &mut Sampler) -> crate::error::Result<u32> {
        let last = self.tokens.last().copied().unwrap_or(0);
        *self.step_input.at_mut(0, 0)? = last;

        let pos = self.cache.len();
        let logits = self.transformer.forward(&self.step_input, &mut self.cache, pos)?;

        Ok(sampler.sample(logits.row(0)?) as u32)
    }

    /// Accepts a sampled token into the sequence.
    pub fn push(&mut self, token: u32) {
        self.tokens.push(token);
    }
}

/// Runs one prompt to completion, streaming printable tokens into `sink`
/// (flushed after every emission) and returning the response text.
///
/// The prompt is trimmed to the trailing context-window's worth of ASCII
/// bytes; the decode loop stops on the newline token, on an unprintable
/// token (subject to [`GenerationOptions::halt_on_unprintable`]), when
/// `max_tokens` is reached, or when the model context is exhausted.
/// Suppressed tokens are kept in the sequence and rendered as spaces in the
/// returned text.
pub fn generate_stream(
    transformer: &Transformer,
    sampler: &mut Sampler,
    prompt: &str,
    options: &GenerationOptions,
    sink: &mut dyn Write,
) -> Result<String> {
    let window = transformer.config().max_seq_len;
    let prompt_bytes: Vec<u8> = prompt.bytes().filter(u8::is_ascii).collect();
    let start = prompt_bytes.len().saturating_sub(window);
    let prompt_bytes = &prompt_bytes[start..];

    if prompt_bytes.is_empty() {
        anyhow::bail!("please provide a prompt");
    }

    let mut session = GenerationSession::new(transformer, prompt_bytes)?;
    let mut metrics = TokenMetrics::new();
    let mut response = String::new();

    for _ in 0..options.max_tokens {
        if session.context_remaining() == 0 {
            debug!("model context exhausted after {} tokens", session.cache_len());
            break;
        }

        metrics.start_generation();
        let next = session.step(sampler)?;
        metrics.increment_token();

        if next == NEWLINE_TOKEN {
            break;
        }
        if next >= UNPRINTABLE_START && options.halt_on_unprintable {
            break;
        }

        session.push(next);

        if (PRINTABLE_MIN..=PRINTABLE_MAX).contains(&next) {
            let ch = next as u8 as char;
            response.push(ch);
            write!(sink, "{ch}")?;
            sink.flush()?;
        } else {
            // Kept in the sequence, hidden from the stream.
            response.push(' ');
        }
    }

    metrics.report_and_reset();
    Ok(response)
}

/// One-shot generation mode: echo the prompt, stream the continuation to
/// stdout, finish with a newline.
pub fn generate(
    transformer: &Transformer,
    sampler: &mut Sampler,
    prompt: Option<&str>,
    options: &GenerationOptions,
) -> Result<()> {
    let prompt = prompt.unwrap_or("");
    if prompt.is_empty() {
        anyhow::bail!("please provide a prompt");
    }

    let mut stdout = io::stdout();
    write!(stdout, "{prompt}")?;
    stdout.flush()?;

    generate_stream(transformer, sampler, prompt, options, &mut stdout)?;
    writeln!(stdout)?;
    Ok(())
}

/// Interactive chat loop.
///
/// Reads one line per turn (capped at 256 bytes), treats `quit` and `exit`
/// as a clean shutdown, skips empty input, and keeps a rolling character
/// history that is replayed as the prompt of every turn. The window covers
/// half the model context so the other half stays available for the
/// response. A prompt passed on the command line plays a single turn.
pub fn chat(
    transformer: &Transformer,
    sampler: &mut Sampler,
    cli_prompt: Option<&str>,
    options: &GenerationOptions,
) -> Result<()> {
    let stdin = io::stdin();
    let window = (transformer.config().max_seq_len / 2).max(1);
    let mut history = String::new();
    let mut first_turn = true;

    if cli_prompt.is_none() {
        println!("Type 'quit' or 'exit' to end the conversation\n");
    }

    loop {
        let Some(input) = read_user_turn(&stdin, first_turn, cli_prompt)? else {
            break;
        };
        first_turn = false;

        if input == "quit" || input == "exit" {
            println!("\nGoodbye!");
            break;
        }
        if input.is_empty() {
            continue;
        }

        update_history(&mut history, &input, window);

        print!("Bot: ");
        io::stdout().flush()?;

        let response = generate_stream(transformer, sampler, &history, options, &mut io::stdout())?;
        println!();

        update_history(&mut history, &response, window);
    }

    Ok(())
}

/// Returns the next user input, or `None` to end the conversation. A CLI
/// prompt is consumed on the first turn and ends the session on the next.
fn read_user_turn(
    stdin: &io::Stdin,
    first_turn: bool,
    cli_prompt: Option<&str>,
) -> Result<Option<String>> {
    match (first_turn, cli_prompt) {
        (true, Some(prompt)) => Ok(Some(sanitize_input(prompt))),
        (false, Some(_)) => Ok(None),
        _ => {
            print!("You: ");
            io::stdout().flush()?;

            let mut line = String::new();
            if stdin.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            Ok(Some(sanitize_input(line.trim_end_matches(['\n', '\r']))))
        }
    }
}

/// Byte-level tokenization only covers ASCII, so anything else is dropped
/// before the input reaches the model; the turn is also capped at the
/// console input limit.
fn sanitize_input(input: &str) -> String {
    input.chars().filter(char::is_ascii).take(MAX_INPUT).collect()
}

/// Appends a turn to the rolling history, keeping only the trailing
/// `window` bytes.
fn update_history(history: &mut String, new_text: &str, window: usize) {
    if !history.is_empty() {
        history.push(' ');
    }
    history.push_str(new_text);

    if history.len() > window {
        let cut = history.len() - window;
        history.drain(..cut);
    }
}

/// Tracks token generation throughput per response.
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self {
            start_time: None,
            generated_count: 0,
        }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                debug!(
                    "generated {} tokens in {:.2}s ({tps:.2} tokens/sec)",
                    self.generated_count,
                    duration.as_secs_f64()
                );
            }
        }
        self.generated_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{AttentionWeights, EmbeddingWeights, LinearWeights};
    use crate::tensor::Tensor;
    use crate::transformer::TransformerParameters;

    fn patterned(rows: usize, cols: usize, scale: f32, offset: usize) -> Tensor {
        let mut m = Tensor::new(rows, cols).unwrap();
        for (i, v) in m.data_mut().iter_mut().enumerate() {
            *v = (((i * 13 + offset * 7 + 5) % 29) as f32 / 29.0 - 0.5) * scale;
        }
        m
    }

    fn patterned_linear(out: usize, inp: usize, offset: usize) -> LinearWeights {
        LinearWeights::new(
            patterned(out, inp, 0.4, offset),
            patterned(1, out, 0.1, offset + 1),
        )
        .unwrap()
    }

    fn tiny_model(vocab: usize, embed: usize, ff: usize, seq: usize) -> Transformer {
        let params = TransformerParameters {
            token_embed: EmbeddingWeights::new(patterned(vocab, embed, 1.0, 0)),
            pos_embed: patterned(seq, embed, 0.2, 1),
            attn: AttentionWeights::new(
                patterned_linear(embed, embed, 2),
                patterned_linear(embed, embed, 3),
                patterned_linear(embed, embed, 4),
                patterned_linear(embed, embed, 5),
            )
            .unwrap(),
            w1: patterned_linear(ff, embed, 6),
            w2: patterned_linear(embed, ff, 7),
            lm_head_bias: patterned(1, vocab, 0.1, 8),
        };
        Transformer::new(params).unwrap()
    }

    #[test]
    fn test_session_rejects_empty_prompt() {
        let model = tiny_model(128, 8, 16, 16);
        assert!(GenerationSession::new(&model, b"").is_err());
    }

    #[test]
    fn test_cache_grows_by_one_per_decode_step() {
        let model = tiny_model(128, 8, 16, 16);
        let mut sampler = Sampler::new(128, 1.0, 42);

        let mut session = GenerationSession::new(&model, b"abcd").unwrap();
        assert_eq!(session.cache_len(), 4);

        let next = session.step(&mut sampler).unwrap();
        session.push(next);
        assert_eq!(session.cache_len(), 5);

        for _ in 0..9 {
            let next = session.step(&mut sampler).unwrap();
            session.push(next);
        }
        assert_eq!(session.cache_len(), 14);
    }

    #[test]
    fn test_generation_is_reproducible_for_a_seed() {
        let model = tiny_model(128, 8, 16, 32);
        let options = GenerationOptions::default();

        let run = |seed: u64| {
            let mut sampler = Sampler::new(128, 1.0, seed);
            let mut sink = Vec::new();
            generate_stream(&model, &mut sampler, "hello", &options, &mut sink).unwrap()
        };

        let first = run(0x5EED);
        let second = run(0x5EED);
        assert_eq!(first, second);
    }

    #[test]
    fn test_stream_only_carries_printable_bytes() {
        let model = tiny_model(128, 8, 16, 32);
        let mut sampler = Sampler::new(128, 1.0, 7);
        let options = GenerationOptions {
            max_tokens: 20,
            halt_on_unprintable: false,
        };

        let mut sink = Vec::new();
        generate_stream(&model, &mut sampler, "hi", &options, &mut sink).unwrap();
        assert!(sink.iter().all(|&b| (32..=126).contains(&b)));
    }

    #[test]
    fn test_generation_respects_token_budget() {
        let model = tiny_model(128, 8, 16, 64);
        let mut sampler = Sampler::new(128, 1.0, 11);
        let options = GenerationOptions {
            max_tokens: 5,
            halt_on_unprintable: false,
        };

        let mut sink = Vec::new();
        let response = generate_stream(&model, &mut sampler, "abc", &options, &mut sink).unwrap();
        assert!(response.len() <= 5);
    }

    #[test]
    fn test_generation_stops_at_model_context() {
        let model = tiny_model(128, 8, 16, 8);
        let mut sampler = Sampler::new(128, 1.0, 3);
        let options = GenerationOptions {
            max_tokens: 100,
            halt_on_unprintable: false,
        };

        // 4 prompt bytes leave 4 decode steps before the positional table
        // runs out; the loop must stop cleanly rather than error.
        let mut sink = Vec::new();
        let response = generate_stream(&model, &mut sampler, "abcd", &options, &mut sink).unwrap();
        assert!(response.len() <= 4);
    }

    #[test]
    fn test_overlong_prompt_is_windowed() {
        let model = tiny_model(128, 8, 16, 8);
        let mut sampler = Sampler::new(128, 1.0, 9);
        let options = GenerationOptions::default();

        let long_prompt = "x".repeat(100);
        let mut sink = Vec::new();
        assert!(generate_stream(&model, &mut sampler, &long_prompt, &options, &mut sink).is_ok());
    }

    #[test]
    fn test_update_history_keeps_trailing_window() {
        let mut history = String::new();
        update_history(&mut history, "hello", 8);
        assert_eq!(history, "hello");

        update_history(&mut history, "world", 8);
        assert_eq!(history, "lo world");
    }

    #[test]
    fn test_sanitize_input_drops_non_ascii_and_caps_length() {
        assert_eq!(sanitize_input("héllo"), "hllo");
        let long = "a".repeat(MAX_INPUT + 50);
        assert_eq!(sanitize_input(&long).len(), MAX_INPUT);
    }
}

use model2vec_rs::model::StaticModel;
use tracing::{info, warn};

use crate::config::{AcceleratorMode, EmbeddingConfig};
use crate::error::{Error, Result};
use crate::progress::{CancelToken, ProgressEvent, ProgressSink};

/// Where the encoder currently runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Accelerator,
    Cpu,
}

/// Raw failure from an encoder backend. The engine classifies it as
/// transient (accelerator hiccup) or not from the message text.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EncodeError(pub String);

/// Accelerator errors mention their device; everything else is treated as
/// an input problem and salvaged item by item.
fn is_transient(message: &str) -> bool {
    let m = message.to_lowercase();
    ["cuda", "device", "gpu"].iter().any(|t| m.contains(t))
}

/// Backend seam for the embedding model. The production backend wraps
/// model2vec; tests script failures through it to exercise the adaptive
/// loop. Deliberately not `Send`: the model is owned by exactly one
/// component and batching happens inside it.
pub trait TextEncoder {
    fn dim(&self) -> usize;
    fn device(&self) -> Device;
    /// Encode one batch. Row order must match input order.
    fn encode_batch(&mut self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EncodeError>;
    /// Tear down any accelerator context (release model, free caches,
    /// synchronise) and reinitialise on CPU.
    fn fall_back_to_cpu(&mut self) -> std::result::Result<(), EncodeError>;
}

/// model2vec static embeddings. Static models always execute on CPU, so
/// `fall_back_to_cpu` is trivially satisfied; the seam matters for
/// accelerator-backed encoders and for tests.
pub struct Model2VecEncoder {
    model: StaticModel,
    dim: usize,
}

impl Model2VecEncoder {
    pub fn load(cfg: &EmbeddingConfig) -> Result<Self> {
        let model = StaticModel::from_pretrained(&cfg.model, None, None, None)
            .map_err(|e| Error::DeviceFatal(format!("loading {}: {e}", cfg.model)))?;
        let dim = model.encode_single("dim probe").len();
        if dim != cfg.dim {
            return Err(Error::DimMismatch {
                stored: dim,
                configured: cfg.dim,
            });
        }
        Ok(Self { model, dim })
    }
}

impl TextEncoder for Model2VecEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn encode_batch(&mut self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
        Ok(texts.iter().map(|t| self.model.encode_single(t)).collect())
    }

    fn fall_back_to_cpu(&mut self) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

/// Counters surfaced into [`crate::indexer::Stats`] and asserted by the
/// fallback tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedStats {
    /// Failed encode attempts on the accelerator (one log line each).
    pub device_retries: usize,
    pub cpu_fallback: bool,
    /// Items that failed even one-at-a-time and were zero-filled.
    pub zero_filled: usize,
}

pub struct EmbedOutcome {
    /// One row per input, each either L2-normalised and finite or all-zero.
    pub vectors: Vec<Vec<f32>>,
    /// `invalid[i]` marks a zero-filled row.
    pub invalid: Vec<bool>,
    pub stats: EmbedStats,
}

/// Adaptive-batching embedding engine.
///
/// The loop is a small state machine: encode the batch at the current
/// size; on a transient accelerator error halve the batch (floor
/// `min_batch_size`) and retry the same batch up to `max_batch_shrinks`
/// times, then tear the accelerator down and continue on CPU; on any other
/// error salvage the batch one item at a time, zero-filling what still
/// fails.
pub struct EmbeddingEngine {
    encoder: Box<dyn TextEncoder>,
    cfg: EmbeddingConfig,
    batch_size: usize,
}

impl EmbeddingEngine {
    pub fn new(encoder: Box<dyn TextEncoder>, cfg: EmbeddingConfig) -> Self {
        let batch_size = cfg.initial_batch_size.max(cfg.min_batch_size);
        Self {
            encoder,
            cfg,
            batch_size,
        }
    }

    /// Load the configured model2vec model, honouring the accelerator
    /// setting. Static models execute on CPU only, so `on` cannot be
    /// satisfied and is rejected up front rather than silently ignored;
    /// `auto` resolves to CPU.
    pub fn from_config(cfg: &EmbeddingConfig) -> Result<Self> {
        match cfg.accelerator {
            AcceleratorMode::On => {
                return Err(Error::Config(
                    "use_accelerator=on requested, but the model2vec backend executes on CPU only"
                        .into(),
                ));
            }
            AcceleratorMode::Auto => {
                info!("no accelerator backend available; encoding on cpu");
            }
            AcceleratorMode::Off => {}
        }
        let encoder = Model2VecEncoder::load(cfg)?;
        Ok(Self::new(Box::new(encoder), cfg.clone()))
    }

    pub fn dim(&self) -> usize {
        self.encoder.dim()
    }

    pub fn model_name(&self) -> &str {
        &self.cfg.model
    }

    /// Embed a single query text. Empty queries produce the zero vector so
    /// downstream similarity degenerates to the documented tie-break order.
    pub fn encode_query(&mut self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dim()]);
        }
        let batch = vec![truncate_for_model(text, &self.cfg).to_string()];
        match self.encoder.encode_batch(&batch) {
            Ok(mut rows) if !rows.is_empty() => {
                let (v, _) = normalize(rows.remove(0), self.dim());
                Ok(v)
            }
            Ok(_) => Err(Error::DeviceFatal("empty encoder response".into())),
            Err(e) if is_transient(&e.0) => {
                warn!("transient device error on query encode ({e}); retrying on cpu");
                self.encoder
                    .fall_back_to_cpu()
                    .map_err(|e| Error::DeviceFatal(e.0))?;
                let mut rows = self
                    .encoder
                    .encode_batch(&batch)
                    .map_err(|e| Error::DeviceFatal(e.0))?;
                if rows.is_empty() {
                    return Err(Error::DeviceFatal("empty encoder response".into()));
                }
                let (v, _) = normalize(rows.remove(0), self.dim());
                Ok(v)
            }
            Err(e) => Err(Error::DeviceFatal(e.0)),
        }
    }

    /// Embed every text, in order. Callers may cancel between batches; no
    /// partial output escapes on cancellation.
    pub fn encode_all(
        &mut self,
        texts: &[String],
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<EmbedOutcome> {
        let dim = self.dim();
        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_for_model(t, &self.cfg).to_string())
            .collect();

        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut invalid: Vec<bool> = Vec::with_capacity(texts.len());
        let mut stats = EmbedStats::default();

        let mut cursor = 0usize;
        let mut shrinks_this_failure = 0usize;
        while cursor < truncated.len() {
            cancel.checkpoint()?;
            let end = (cursor + self.batch_size).min(truncated.len());
            let batch = &truncated[cursor..end];

            match self.encoder.encode_batch(batch) {
                Ok(rows) => {
                    if rows.len() != batch.len() {
                        return Err(Error::DeviceFatal(format!(
                            "encoder returned {} rows for a batch of {}",
                            rows.len(),
                            batch.len()
                        )));
                    }
                    for row in rows {
                        let (v, valid) = normalize(row, dim);
                        if !valid {
                            stats.zero_filled += 1;
                        }
                        invalid.push(!valid);
                        vectors.push(v);
                    }
                    shrinks_this_failure = 0;
                    cursor = end;
                    progress.emit(&ProgressEvent::BatchEncoded {
                        rows: batch.len(),
                        total_rows: truncated.len(),
                    });
                }
                Err(e) if is_transient(&e.0) => {
                    if self.encoder.device() == Device::Cpu {
                        // CPU was the fallback of last resort.
                        return Err(Error::DeviceFatal(e.0));
                    }
                    stats.device_retries += 1;
                    warn!(
                        "transient device error at batch size {} ({e}); retrying",
                        self.batch_size
                    );
                    if shrinks_this_failure < self.cfg.max_batch_shrinks
                        && self.batch_size > self.cfg.min_batch_size
                    {
                        self.batch_size = (self.batch_size / 2).max(self.cfg.min_batch_size);
                        shrinks_this_failure += 1;
                    } else {
                        info!("accelerator exhausted; re-encoding on cpu");
                        self.encoder
                            .fall_back_to_cpu()
                            .map_err(|e| Error::DeviceFatal(e.0))?;
                        stats.cpu_fallback = true;
                        shrinks_this_failure = 0;
                        self.batch_size = self.cfg.initial_batch_size;
                    }
                }
                Err(_) => {
                    // Non-transient (or already on CPU): salvage one at a
                    // time so a single poisoned text cannot sink the run.
                    for text in batch {
                        let one = std::slice::from_ref(text);
                        match self.encoder.encode_batch(one) {
                            Ok(mut rows) if !rows.is_empty() => {
                                let (v, valid) = normalize(rows.remove(0), dim);
                                if !valid {
                                    stats.zero_filled += 1;
                                }
                                invalid.push(!valid);
                                vectors.push(v);
                            }
                            Ok(_) | Err(_) => {
                                warn!("item encoding failed; zero-filling row {}", vectors.len());
                                stats.zero_filled += 1;
                                invalid.push(true);
                                vectors.push(vec![0.0; dim]);
                            }
                        }
                    }
                    cursor = end;
                    progress.emit(&ProgressEvent::BatchEncoded {
                        rows: batch.len(),
                        total_rows: truncated.len(),
                    });
                }
            }
        }

        Ok(EmbedOutcome {
            vectors,
            invalid,
            stats,
        })
    }
}

/// Strict truncation to `(max_tokens − safety_buffer) × chars_per_token`
/// chars, cut on a char boundary.
fn truncate_for_model<'a>(text: &'a str, cfg: &EmbeddingConfig) -> &'a str {
    let budget_tokens = cfg.max_tokens.saturating_sub(cfg.token_safety_buffer);
    let max_chars = budget_tokens.saturating_mul(cfg.chars_per_token);
    if text.len() <= max_chars {
        return text;
    }
    let mut cut = max_chars;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// L2-normalise in place; reject wrong-dimension, non-finite and zero
/// vectors by replacing them with the zero vector.
fn normalize(mut v: Vec<f32>, dim: usize) -> (Vec<f32>, bool) {
    if v.len() != dim || v.iter().any(|x| !x.is_finite()) {
        return (vec![0.0; dim], false);
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return (vec![0.0; dim], false);
    }
    for x in &mut v {
        *x /= norm;
    }
    (v, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;
    use std::collections::HashSet;

    const DIM: usize = 8;

    /// Scripted backend: fails with the given message while on the
    /// accelerator (optionally only for specific item indices), succeeds on
    /// CPU. Records every batch size it was asked to encode.
    struct ScriptedEncoder {
        device: Device,
        fail_message: Option<String>,
        poison: HashSet<usize>,
        offset: usize,
        batch_sizes: Vec<usize>,
    }

    impl ScriptedEncoder {
        fn healthy() -> Self {
            Self {
                device: Device::Cpu,
                fail_message: None,
                poison: HashSet::new(),
                offset: 0,
                batch_sizes: Vec::new(),
            }
        }

        fn flaky_accelerator(message: &str) -> Self {
            Self {
                device: Device::Accelerator,
                fail_message: Some(message.to_string()),
                poison: HashSet::new(),
                offset: 0,
                batch_sizes: Vec::new(),
            }
        }

        fn row(seed: usize) -> Vec<f32> {
            (0..DIM).map(|d| (seed * 31 + d + 1) as f32).collect()
        }
    }

    impl TextEncoder for ScriptedEncoder {
        fn dim(&self) -> usize {
            DIM
        }

        fn device(&self) -> Device {
            self.device
        }

        fn encode_batch(
            &mut self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, EncodeError> {
            self.batch_sizes.push(texts.len());
            if self.device == Device::Accelerator {
                if let Some(msg) = &self.fail_message {
                    return Err(EncodeError(msg.clone()));
                }
            }
            if texts.len() == 1 && self.poison.contains(&self.offset) {
                self.offset += 1;
                return Err(EncodeError("tokenizer choked".into()));
            }
            if texts.len() > 1 && !self.poison.is_empty() {
                return Err(EncodeError("tokenizer choked".into()));
            }
            let start = self.offset;
            self.offset += texts.len();
            Ok((start..start + texts.len()).map(Self::row).collect())
        }

        fn fall_back_to_cpu(&mut self) -> std::result::Result<(), EncodeError> {
            self.device = Device::Cpu;
            Ok(())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("chunk text {i}")).collect()
    }

    fn cfg() -> EmbeddingConfig {
        EmbeddingConfig::default()
    }

    #[test]
    fn healthy_path_normalises_every_row() {
        let mut engine = EmbeddingEngine::new(Box::new(ScriptedEncoder::healthy()), cfg());
        let out = engine
            .encode_all(&texts(40), &CancelToken::new(), &NullSink)
            .unwrap();
        assert_eq!(out.vectors.len(), 40);
        assert!(out.invalid.iter().all(|&b| !b));
        for v in &out.vectors {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
        assert_eq!(out.stats, EmbedStats::default());
    }

    #[test]
    fn transient_failure_shrinks_then_falls_back_to_cpu() {
        let mut engine = EmbeddingEngine::new(
            Box::new(ScriptedEncoder::flaky_accelerator("CUDA error: out of memory")),
            cfg(),
        );
        let out = engine
            .encode_all(&texts(20), &CancelToken::new(), &NullSink)
            .unwrap();

        // 16 → 8 → 4 → 2 → 1 all fail: five logged retries, then CPU.
        assert_eq!(out.stats.device_retries, 5);
        assert!(out.stats.cpu_fallback);
        assert_eq!(out.vectors.len(), 20);
        assert!(out.invalid.iter().all(|&b| !b));
        for v in &out.vectors {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn non_transient_failure_salvages_items_and_zero_fills() {
        let mut enc = ScriptedEncoder::healthy();
        enc.poison.insert(3);
        let mut engine = EmbeddingEngine::new(Box::new(enc), cfg());
        let out = engine
            .encode_all(&texts(6), &CancelToken::new(), &NullSink)
            .unwrap();

        assert_eq!(out.vectors.len(), 6);
        assert_eq!(out.stats.zero_filled, 1);
        assert!(out.invalid[3]);
        assert!(out.vectors[3].iter().all(|&x| x == 0.0));
        // The other five rows survived.
        for (i, v) in out.vectors.iter().enumerate() {
            if i != 3 {
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                assert!((norm - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn inputs_are_truncated_before_encoding() {
        let mut c = cfg();
        c.max_tokens = 20;
        c.token_safety_buffer = 10;
        c.chars_per_token = 4;
        let long = "x".repeat(500);
        assert_eq!(truncate_for_model(&long, &c).len(), 40);
        let short = "short";
        assert_eq!(truncate_for_model(short, &c), "short");
    }

    #[test]
    fn cancellation_observed_between_batches() {
        let token = CancelToken::new();
        token.cancel();
        let mut engine = EmbeddingEngine::new(Box::new(ScriptedEncoder::healthy()), cfg());
        let err = engine.encode_all(&texts(4), &token, &NullSink);
        assert!(matches!(err, Err(Error::Cancelled)));
    }

    #[test]
    fn forcing_the_accelerator_on_a_cpu_only_backend_is_rejected() {
        let mut c = cfg();
        c.accelerator = AcceleratorMode::On;
        assert!(matches!(
            EmbeddingEngine::from_config(&c),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_query_encodes_to_zero_vector() {
        let mut engine = EmbeddingEngine::new(Box::new(ScriptedEncoder::healthy()), cfg());
        let v = engine.encode_query("   ").unwrap();
        assert_eq!(v.len(), DIM);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn query_encode_is_normalised() {
        let mut engine = EmbeddingEngine::new(Box::new(ScriptedEncoder::healthy()), cfg());
        let v = engine.encode_query("collision detection").unwrap();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}

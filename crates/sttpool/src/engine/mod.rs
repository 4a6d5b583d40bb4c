//! Recognition engine contract.
//!
//! The decoder pool never talks to a concrete recognizer. It drives an [`Engine`]
//! created by an [`EngineFactory`], which keeps the pool testable with scripted
//! engines and lets the sherpa-onnx backend live behind the `sherpa` feature.

#[cfg(feature = "sherpa")]
pub mod sherpa;

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Sample rate every inbound stream is assumed to use.
pub const SAMPLE_RATE: u32 = 16_000;

/// Silence fed before finishing a stream: 0.3 s at 16 kHz.
///
/// Must exceed the model's chunk lookahead or buffered audio is lost on reset.
pub const TAIL_PADDING_SAMPLES: usize = 4_800;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model path for {name} is empty")]
    EmptyModelPath { name: &'static str },

    #[error("model file for {name} is unreadable ({}): {reason}", .path.display())]
    UnreadableModel {
        name: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("failed to create recognizer: {0}")]
    Create(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("engine already closed")]
    Closed,
}

/// Model files for a transducer recognizer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelPaths {
    pub tokens: PathBuf,
    pub encoder: PathBuf,
    pub decoder: PathBuf,
    pub joiner: PathBuf,
}

impl ModelPaths {
    /// Resolve the four files inside `dir` using their conventional names.
    pub fn in_dir(dir: impl AsRef<Path>, encoder: &str, decoder: &str, joiner: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            tokens: dir.join("tokens.txt"),
            encoder: dir.join(encoder),
            decoder: dir.join(decoder),
            joiner: dir.join(joiner),
        }
    }

    fn entries(&self) -> [(&'static str, &Path); 4] {
        [
            ("tokens", self.tokens.as_path()),
            ("encoder", self.encoder.as_path()),
            ("decoder", self.decoder.as_path()),
            ("joiner", self.joiner.as_path()),
        ]
    }

    /// Every path must be non-empty and name a readable regular file.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, path) in self.entries() {
            if path.as_os_str().is_empty() {
                return Err(EngineError::EmptyModelPath { name });
            }
            let unreadable = |reason: String| EngineError::UnreadableModel {
                name,
                path: path.to_path_buf(),
                reason,
            };
            let meta = std::fs::metadata(path).map_err(|e| unreadable(e.to_string()))?;
            if !meta.is_file() {
                return Err(unreadable("not a regular file".to_string()));
            }
            std::fs::File::open(path).map_err(|e| unreadable(e.to_string()))?;
        }
        Ok(())
    }
}

/// Recognizer parameters shared by every pooled instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub feature_dim: u32,
    pub num_threads: u32,
    pub provider: String,
    pub decoding_method: String,
    pub max_active_paths: u32,
    pub enable_endpoint: bool,
    pub rule1_min_trailing_silence: f32,
    pub rule2_min_trailing_silence: f32,
    pub rule3_min_utterance_length: f32,
    pub tail_padding: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            feature_dim: 80,
            num_threads: 1,
            provider: "cpu".to_string(),
            decoding_method: "greedy_search".to_string(),
            max_active_paths: 4,
            enable_endpoint: true,
            rule1_min_trailing_silence: 2.4,
            rule2_min_trailing_silence: 1.2,
            rule3_min_utterance_length: 300.0,
            tail_padding: TAIL_PADDING_SAMPLES,
        }
    }
}

/// One streaming recognizer with a single input stream.
///
/// Calls are blocking and may be slow; the engine is closed when dropped.
pub trait Engine: Send {
    /// Queue samples (normalized to [-1, 1]) for decoding.
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]) -> Result<(), EngineError>;

    /// Whether enough audio is buffered to run another decode step.
    fn is_ready(&self) -> bool;

    fn decode(&mut self) -> Result<(), EngineError>;

    /// Best transcript of the current utterance.
    fn transcript(&self) -> Result<String, EngineError>;

    /// Whether the engine detected the end of an utterance.
    fn is_endpoint(&self) -> bool;

    /// Start a fresh utterance on the same stream.
    fn reset(&mut self);

    /// Signal that no more audio follows until the next reset.
    fn input_finished(&mut self);
}

/// Creates engines for the pool.
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        paths: &ModelPaths,
        config: &EngineConfig,
    ) -> Result<Box<dyn Engine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&ModelPaths, &EngineConfig) -> Result<Box<dyn Engine>, EngineError> + Send + Sync,
{
    fn create(
        &self,
        paths: &ModelPaths,
        config: &EngineConfig,
    ) -> Result<Box<dyn Engine>, EngineError> {
        self(paths, config)
    }
}

//! Command line arguments.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use sttpool::{EngineConfig, ModelPaths, PoolConfig, ServerConfig, SessionConfig};

/// Pooled streaming speech recognition over raw TCP.
#[derive(Debug, Parser)]
#[command(name = "sttpool", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load the decoder pool and accept PCM streams.
    Serve(ServeArgs),

    /// Stream a raw PCM file to a server and print transcripts.
    Stream(StreamArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "STTPOOL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "STTPOOL_PORT", default_value_t = 8888)]
    pub port: u16,

    /// Number of recognizer instances, i.e. concurrent connections.
    #[arg(short = 'n', long, env = "STTPOOL_DECODERS", default_value_t = 1)]
    pub decoders: usize,

    /// Directory holding tokens.txt and the transducer models.
    #[arg(long, env = "STTPOOL_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Overrides <model-dir>/tokens.txt.
    #[arg(long, env = "STTPOOL_TOKENS")]
    pub tokens: Option<PathBuf>,

    /// Encoder file; relative names resolve inside --model-dir.
    #[arg(long, env = "STTPOOL_ENCODER", default_value = "encoder.onnx")]
    pub encoder: PathBuf,

    #[arg(long, env = "STTPOOL_DECODER", default_value = "decoder.onnx")]
    pub decoder: PathBuf,

    #[arg(long, env = "STTPOOL_JOINER", default_value = "joiner.onnx")]
    pub joiner: PathBuf,

    /// Inference threads per recognizer.
    #[arg(long, env = "STTPOOL_NUM_THREADS", default_value_t = 1)]
    pub num_threads: u32,

    #[arg(long, env = "STTPOOL_PROVIDER", default_value = "cpu")]
    pub provider: String,

    #[arg(long, env = "STTPOOL_DECODING_METHOD", default_value = "greedy_search")]
    pub decoding_method: String,

    #[arg(long, env = "STTPOOL_MAX_ACTIVE_PATHS", default_value_t = 4)]
    pub max_active_paths: u32,

    /// Disable endpoint detection (one utterance per connection).
    #[arg(long, env = "STTPOOL_NO_ENDPOINT")]
    pub no_endpoint: bool,

    /// Largest chunk decoded per read, in bytes.
    #[arg(long, env = "STTPOOL_MAX_CHUNK_BYTES", default_value_t = sttpool::session::DEFAULT_MAX_CHUNK_BYTES)]
    pub max_chunk_bytes: usize,

    /// Close connections idle for this many seconds; 0 disables.
    #[arg(long, env = "STTPOOL_IDLE_TIMEOUT", default_value_t = 30)]
    pub idle_timeout: u64,
}

impl ServeArgs {
    pub fn model_paths(&self) -> anyhow::Result<ModelPaths> {
        let resolve = |file: &PathBuf| match &self.model_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.clone(),
        };
        let tokens = match (&self.tokens, &self.model_dir) {
            (Some(tokens), _) => resolve(tokens),
            (None, Some(dir)) => dir.join("tokens.txt"),
            (None, None) => bail!("either --model-dir or --tokens is required"),
        };
        Ok(ModelPaths {
            tokens,
            encoder: resolve(&self.encoder),
            decoder: resolve(&self.decoder),
            joiner: resolve(&self.joiner),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            num_threads: self.num_threads,
            provider: self.provider.clone(),
            decoding_method: self.decoding_method.clone(),
            max_active_paths: self.max_active_paths,
            enable_endpoint: !self.no_endpoint,
            ..EngineConfig::default()
        }
    }

    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        if self.decoders == 0 {
            bail!("--decoders must be at least 1");
        }
        Ok(PoolConfig {
            size: self.decoders,
            model: self.model_paths()?,
            engine: self.engine_config(),
        })
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        // One s16le sample is two bytes.
        if self.max_chunk_bytes < 2 {
            bail!("--max-chunk-bytes must be at least 2");
        }
        Ok(SessionConfig {
            max_chunk_bytes: self.max_chunk_bytes,
            idle_timeout: (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout)),
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Debug, Args)]
pub struct StreamArgs {
    /// Server address.
    #[arg(short, long, env = "STTPOOL_ADDR", default_value = "127.0.0.1:8888")]
    pub addr: String,

    /// Raw 16 kHz mono s16le PCM file.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Bytes per write.
    #[arg(long, default_value_t = sttpool::session::DEFAULT_MAX_CHUNK_BYTES)]
    pub chunk_bytes: usize,

    /// Pace writes at the audio's real duration.
    #[arg(long)]
    pub realtime: bool,
}

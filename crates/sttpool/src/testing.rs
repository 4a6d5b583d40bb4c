//! Scripted engines for unit tests.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::decoder::{DecoderPool, PoolConfig};
use crate::engine::{Engine, EngineConfig, EngineError, EngineFactory, ModelPaths};

/// Everything a [`FakeEngine`] was asked to do.
#[derive(Debug, Default)]
pub(crate) struct EngineLog {
    pub accepted: Vec<Vec<f32>>,
    pub decodes: usize,
    pub resets: usize,
    pub input_finished: usize,
    pub endpoints: usize,
    pub closed: bool,
    /// Thread that ran the most recent reset.
    pub reset_thread: Option<std::thread::ThreadId>,
}

/// Transcript is the number of samples fed since the last reset, so tests can see
/// whether a decode started from a clean utterance.
pub(crate) struct FakeEngine {
    log: Arc<Mutex<EngineLog>>,
    fed: usize,
    pending: usize,
    endpoint_after: Option<usize>,
    fail_decode: bool,
}

impl Engine for FakeEngine {
    fn accept_waveform(&mut self, _sample_rate: u32, samples: &[f32]) -> Result<(), EngineError> {
        self.log.lock().unwrap().accepted.push(samples.to_vec());
        self.fed += samples.len();
        self.pending += samples.len();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.pending > 0
    }

    fn decode(&mut self) -> Result<(), EngineError> {
        if self.fail_decode {
            return Err(EngineError::Decode("scripted failure".to_string()));
        }
        self.pending = 0;
        self.log.lock().unwrap().decodes += 1;
        Ok(())
    }

    fn transcript(&self) -> Result<String, EngineError> {
        Ok(self.fed.to_string())
    }

    fn is_endpoint(&self) -> bool {
        let hit = self.endpoint_after.is_some_and(|n| self.fed >= n);
        if hit {
            self.log.lock().unwrap().endpoints += 1;
        }
        hit
    }

    fn reset(&mut self) {
        self.fed = 0;
        self.pending = 0;
        let mut log = self.log.lock().unwrap();
        log.resets += 1;
        log.reset_thread = Some(std::thread::current().id());
    }

    fn input_finished(&mut self) {
        self.log.lock().unwrap().input_finished += 1;
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.closed = true;
        }
    }
}

/// Factory that hands out [`FakeEngine`]s and keeps their logs in creation order.
#[derive(Clone, Default)]
pub(crate) struct FakeFactory {
    pub logs: Arc<Mutex<Vec<Arc<Mutex<EngineLog>>>>>,
    pub endpoint_after: Option<usize>,
    pub fail_decode: bool,
    /// Creation fails for the engine with this index.
    pub fail_create_at: Option<usize>,
}

impl FakeFactory {
    pub fn with_endpoint_after(samples: usize) -> Self {
        Self {
            endpoint_after: Some(samples),
            ..Self::default()
        }
    }

    pub fn failing_decode() -> Self {
        Self {
            fail_decode: true,
            ..Self::default()
        }
    }

    pub fn log(&self, index: usize) -> Arc<Mutex<EngineLog>> {
        Arc::clone(&self.logs.lock().unwrap()[index])
    }
}

impl EngineFactory for FakeFactory {
    fn create(
        &self,
        _paths: &ModelPaths,
        _config: &EngineConfig,
    ) -> Result<Box<dyn Engine>, EngineError> {
        let mut logs = self.logs.lock().unwrap();
        if self.fail_create_at == Some(logs.len()) {
            return Err(EngineError::Create("scripted create failure".to_string()));
        }
        let log = Arc::new(Mutex::new(EngineLog::default()));
        logs.push(Arc::clone(&log));
        Ok(Box::new(FakeEngine {
            log,
            fed: 0,
            pending: 0,
            endpoint_after: self.endpoint_after,
            fail_decode: self.fail_decode,
        }))
    }
}

/// Temporary directory holding four placeholder model files.
pub(crate) fn model_dir() -> (TempDir, ModelPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = ModelPaths::in_dir(dir.path(), "encoder.onnx", "decoder.onnx", "joiner.onnx");
    for path in [&paths.tokens, &paths.encoder, &paths.decoder, &paths.joiner] {
        std::fs::write(path, b"placeholder").unwrap();
    }
    (dir, paths)
}

/// Pool of `size` fake engines; keep the `TempDir` alive for the test's duration.
pub(crate) fn fake_pool(size: usize, factory: &FakeFactory) -> (TempDir, Arc<DecoderPool>) {
    let (dir, model) = model_dir();
    let config = PoolConfig {
        size,
        model,
        engine: EngineConfig::default(),
    };
    let pool = DecoderPool::new(&config, factory).unwrap();
    (dir, Arc::new(pool))
}

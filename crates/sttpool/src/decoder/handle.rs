//! DecoderHandle - one engine instance plus its exclusivity flags.
//!
//! The engine sits behind a mutex that is never contended in practice: `busy`
//! guarantees a single lease holder, and only that holder calls into the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::engine::{Engine, EngineConfig, EngineError, EngineFactory, ModelPaths};

/// Stable index of a handle inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandleId(pub(crate) usize);

impl HandleId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct DecoderHandle {
    id: HandleId,
    busy: AtomicBool,
    poisoned: AtomicBool,
    /// `None` once the pool has been torn down.
    engine: Mutex<Option<Box<dyn Engine>>>,
    sample_rate: u32,
    tail_padding: usize,
}

impl DecoderHandle {
    pub(crate) fn open(
        index: usize,
        factory: &dyn EngineFactory,
        paths: &ModelPaths,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let engine = factory.create(paths, config)?;
        Ok(Self {
            id: HandleId(index),
            busy: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            engine: Mutex::new(Some(engine)),
            sample_rate: config.sample_rate,
            tail_padding: config.tail_padding,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Claim the handle if it is free. Exactly one concurrent caller can win.
    pub(crate) fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the busy flag. Returns whether it was set.
    pub(crate) fn unclaim(&self) -> bool {
        self.busy.swap(false, Ordering::AcqRel)
    }

    /// Mark permanently unusable. Returns `true` on the first call only.
    pub(crate) fn mark_poisoned(&self) -> bool {
        // Busy stays set so acquisition skips the handle without another check.
        self.busy.store(true, Ordering::Release);
        !self.poisoned.swap(true, Ordering::AcqRel)
    }

    fn engine(&self) -> MutexGuard<'_, Option<Box<dyn Engine>>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed samples and return the transcript of the current utterance.
    ///
    /// When the engine reports an endpoint the stream is reset before returning,
    /// so the next call starts a new utterance.
    pub(crate) fn decode(&self, samples: &[f32]) -> Result<String, EngineError> {
        let mut guard = self.engine();
        let engine = guard.as_mut().ok_or(EngineError::Closed)?;

        engine.accept_waveform(self.sample_rate, samples)?;
        while engine.is_ready() {
            engine.decode()?;
        }
        let text = engine.transcript()?;

        if engine.is_endpoint() {
            tracing::debug!(handle = %self.id, "Utterance boundary, resetting stream");
            engine.reset();
        }
        Ok(text)
    }

    /// Flush buffered audio with silence padding and discard the final result.
    fn drain(&self, engine: &mut dyn Engine) -> Result<(), EngineError> {
        let padding = vec![0.0_f32; self.tail_padding];
        engine.accept_waveform(self.sample_rate, &padding)?;
        engine.input_finished();
        while engine.is_ready() {
            engine.decode()?;
        }
        let _ = engine.transcript()?;
        Ok(())
    }

    /// Drain and start a fresh stream so the handle can serve another session.
    pub(crate) fn reset(&self) -> Result<(), EngineError> {
        let mut guard = self.engine();
        let engine = guard.as_mut().ok_or(EngineError::Closed)?;
        self.drain(engine.as_mut())?;
        engine.reset();
        Ok(())
    }

    /// Drain and release the engine. Returns whether an engine was still open.
    pub(crate) fn close(&self) -> bool {
        let Some(mut engine) = self.engine().take() else {
            return false;
        };
        if !self.is_poisoned()
            && let Err(e) = self.drain(engine.as_mut())
        {
            tracing::warn!(handle = %self.id, error = %e, "Failed to drain decoder before close");
        }
        drop(engine);
        tracing::debug!(handle = %self.id, "Decoder closed");
        true
    }
}

impl std::fmt::Debug for DecoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderHandle")
            .field("id", &self.id)
            .field("busy", &self.is_busy())
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, model_dir};

    fn open_handle(factory: &FakeFactory) -> DecoderHandle {
        let (_dir, paths) = model_dir();
        DecoderHandle::open(0, factory, &paths, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn claim_is_exclusive() {
        let handle = open_handle(&FakeFactory::default());

        assert!(handle.try_claim());
        assert!(!handle.try_claim());
        assert!(handle.unclaim());
        assert!(!handle.unclaim());
        assert!(handle.try_claim());
    }

    #[test]
    fn decode_returns_running_transcript() {
        let factory = FakeFactory::default();
        let handle = open_handle(&factory);

        assert_eq!(handle.decode(&[0.1; 100]).unwrap(), "100");
        assert_eq!(handle.decode(&[0.1; 50]).unwrap(), "150");

        let log = factory.log(0);
        let log = log.lock().unwrap();
        assert_eq!(log.decodes, 2);
        assert_eq!(log.resets, 0);
    }

    #[test]
    fn endpoint_resets_once_per_boundary() {
        let factory = FakeFactory::with_endpoint_after(200);
        let handle = open_handle(&factory);

        assert_eq!(handle.decode(&[0.0; 100]).unwrap(), "100");
        // Boundary reached: transcript still reports the finished utterance.
        assert_eq!(handle.decode(&[0.0; 100]).unwrap(), "200");
        // Next decode starts clean.
        assert_eq!(handle.decode(&[0.0; 100]).unwrap(), "100");

        let log = factory.log(0);
        let log = log.lock().unwrap();
        assert_eq!(log.endpoints, 1);
        assert_eq!(log.resets, 1);
    }

    #[test]
    fn reset_drains_with_padding() {
        let factory = FakeFactory::default();
        let handle = open_handle(&factory);

        handle.decode(&[0.5; 10]).unwrap();
        handle.reset().unwrap();

        let log = factory.log(0);
        let log = log.lock().unwrap();
        let padding = log.accepted.last().unwrap();
        assert_eq!(padding.len(), 4_800);
        assert!(padding.iter().all(|s| *s == 0.0));
        assert_eq!(log.input_finished, 1);
        assert_eq!(log.resets, 1);
        assert!(!log.closed);
    }

    #[test]
    fn close_drops_engine_once() {
        let factory = FakeFactory::default();
        let handle = open_handle(&factory);

        assert!(handle.close());
        assert!(!handle.close());
        assert!(factory.log(0).lock().unwrap().closed);
        assert!(matches!(handle.decode(&[0.0]), Err(EngineError::Closed)));
    }

    #[test]
    fn poison_keeps_handle_busy() {
        let handle = open_handle(&FakeFactory::default());

        assert!(handle.mark_poisoned());
        assert!(!handle.mark_poisoned());
        assert!(handle.is_busy());
        assert!(!handle.try_claim());
    }
}

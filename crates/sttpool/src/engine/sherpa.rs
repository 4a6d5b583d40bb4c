//! sherpa-onnx streaming transducer backend.
//!
//! The recognizer config is built by `csrc/sherpa_shim.c`, compiled against the
//! installed `c-api.h`, so no sherpa-onnx struct layout is declared here. Only
//! opaque pointers and scalars cross the boundary. The build script links
//! libsherpa-onnx-c-api from `SHERPA_ONNX_LIB_DIR`.

use std::ffi::{CStr, CString};
use std::path::Path;

use super::{Engine, EngineConfig, EngineError, EngineFactory, ModelPaths};

mod ffi {
    use std::ffi::c_char;

    #[repr(C)]
    pub struct OnlineRecognizer {
        _private: [u8; 0],
    }

    #[repr(C)]
    pub struct OnlineStream {
        _private: [u8; 0],
    }

    /// Owned by the library; read through `sttpool_sherpa_result_text`.
    #[repr(C)]
    pub struct OnlineRecognizerResult {
        _private: [u8; 0],
    }

    unsafe extern "C" {
        pub fn sttpool_sherpa_create(
            tokens: *const c_char,
            encoder: *const c_char,
            decoder: *const c_char,
            joiner: *const c_char,
            sample_rate: i32,
            feature_dim: i32,
            num_threads: i32,
            provider: *const c_char,
            decoding_method: *const c_char,
            max_active_paths: i32,
            enable_endpoint: i32,
            rule1_min_trailing_silence: f32,
            rule2_min_trailing_silence: f32,
            rule3_min_utterance_length: f32,
        ) -> *const OnlineRecognizer;
        pub fn sttpool_sherpa_result_text(result: *const OnlineRecognizerResult) -> *const c_char;
    }

    unsafe extern "C" {
        pub fn SherpaOnnxDestroyOnlineRecognizer(recognizer: *const OnlineRecognizer);
        pub fn SherpaOnnxCreateOnlineStream(
            recognizer: *const OnlineRecognizer,
        ) -> *const OnlineStream;
        pub fn SherpaOnnxDestroyOnlineStream(stream: *const OnlineStream);
        pub fn SherpaOnnxOnlineStreamAcceptWaveform(
            stream: *const OnlineStream,
            sample_rate: i32,
            samples: *const f32,
            n: i32,
        );
        pub fn SherpaOnnxIsOnlineStreamReady(
            recognizer: *const OnlineRecognizer,
            stream: *const OnlineStream,
        ) -> i32;
        pub fn SherpaOnnxDecodeOnlineStream(
            recognizer: *const OnlineRecognizer,
            stream: *const OnlineStream,
        );
        pub fn SherpaOnnxGetOnlineStreamResult(
            recognizer: *const OnlineRecognizer,
            stream: *const OnlineStream,
        ) -> *const OnlineRecognizerResult;
        pub fn SherpaOnnxDestroyOnlineRecognizerResult(result: *const OnlineRecognizerResult);
        pub fn SherpaOnnxOnlineStreamReset(
            recognizer: *const OnlineRecognizer,
            stream: *const OnlineStream,
        );
        pub fn SherpaOnnxOnlineStreamInputFinished(stream: *const OnlineStream);
        pub fn SherpaOnnxOnlineStreamIsEndpoint(
            recognizer: *const OnlineRecognizer,
            stream: *const OnlineStream,
        ) -> i32;
    }
}

fn c_string(name: &'static str, value: &str) -> Result<CString, EngineError> {
    CString::new(value).map_err(|_| EngineError::Create(format!("{name} contains a NUL byte")))
}

fn c_path(name: &'static str, path: &Path) -> Result<CString, EngineError> {
    let value = path
        .to_str()
        .ok_or_else(|| EngineError::Create(format!("{name} path is not valid UTF-8")))?;
    c_string(name, value)
}

/// Creates one recognizer plus one stream per pooled handle.
#[derive(Debug, Default, Clone, Copy)]
pub struct SherpaFactory;

impl EngineFactory for SherpaFactory {
    fn create(
        &self,
        paths: &ModelPaths,
        config: &EngineConfig,
    ) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(SherpaEngine::open(paths, config)?))
    }
}

/// A recognizer and its single online stream.
pub struct SherpaEngine {
    recognizer: *const ffi::OnlineRecognizer,
    stream: *const ffi::OnlineStream,
}

// SAFETY: the recognizer and stream are only touched through `&mut self` or
// `&self` behind the handle's mutex, never from two threads at once.
unsafe impl Send for SherpaEngine {}

impl SherpaEngine {
    pub fn open(paths: &ModelPaths, config: &EngineConfig) -> Result<Self, EngineError> {
        let tokens = c_path("tokens", &paths.tokens)?;
        let encoder = c_path("encoder", &paths.encoder)?;
        let decoder = c_path("decoder", &paths.decoder)?;
        let joiner = c_path("joiner", &paths.joiner)?;
        let provider = c_string("provider", &config.provider)?;
        let method = c_string("decoding_method", &config.decoding_method)?;

        let int = |name: &'static str, value: u32| {
            i32::try_from(value).map_err(|_| EngineError::Create(format!("{name} out of range: {value}")))
        };

        // SAFETY: every string is a live CString for the duration of the call; the
        // library copies the configuration.
        let recognizer = unsafe {
            ffi::sttpool_sherpa_create(
                tokens.as_ptr(),
                encoder.as_ptr(),
                decoder.as_ptr(),
                joiner.as_ptr(),
                int("sample_rate", config.sample_rate)?,
                int("feature_dim", config.feature_dim)?,
                int("num_threads", config.num_threads)?,
                provider.as_ptr(),
                method.as_ptr(),
                int("max_active_paths", config.max_active_paths)?,
                i32::from(config.enable_endpoint),
                config.rule1_min_trailing_silence,
                config.rule2_min_trailing_silence,
                config.rule3_min_utterance_length,
            )
        };
        if recognizer.is_null() {
            return Err(EngineError::Create(format!(
                "sherpa-onnx rejected model {}",
                paths.encoder.display()
            )));
        }

        // SAFETY: recognizer is non-null and owned by us.
        let stream = unsafe { ffi::SherpaOnnxCreateOnlineStream(recognizer) };
        if stream.is_null() {
            // SAFETY: recognizer was created above and is not shared.
            unsafe { ffi::SherpaOnnxDestroyOnlineRecognizer(recognizer) };
            return Err(EngineError::Create("failed to create online stream".to_string()));
        }

        Ok(Self { recognizer, stream })
    }
}

impl Engine for SherpaEngine {
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]) -> Result<(), EngineError> {
        let n = i32::try_from(samples.len())
            .map_err(|_| EngineError::Decode(format!("chunk of {} samples", samples.len())))?;
        // SAFETY: the slice is valid for `n` floats for the duration of the call.
        unsafe {
            ffi::SherpaOnnxOnlineStreamAcceptWaveform(
                self.stream,
                sample_rate as i32,
                samples.as_ptr(),
                n,
            )
        };
        Ok(())
    }

    fn is_ready(&self) -> bool {
        // SAFETY: pointers are valid until drop.
        unsafe { ffi::SherpaOnnxIsOnlineStreamReady(self.recognizer, self.stream) != 0 }
    }

    fn decode(&mut self) -> Result<(), EngineError> {
        // SAFETY: pointers are valid until drop.
        unsafe { ffi::SherpaOnnxDecodeOnlineStream(self.recognizer, self.stream) };
        Ok(())
    }

    fn transcript(&self) -> Result<String, EngineError> {
        // SAFETY: pointers are valid until drop; the result is destroyed below.
        let result = unsafe { ffi::SherpaOnnxGetOnlineStreamResult(self.recognizer, self.stream) };
        if result.is_null() {
            return Err(EngineError::Decode("no result returned".to_string()));
        }
        // SAFETY: result is non-null; `text` is a NUL-terminated string or null and
        // is copied before the result is destroyed.
        let text = unsafe {
            let text = ffi::sttpool_sherpa_result_text(result);
            let owned = if text.is_null() {
                String::new()
            } else {
                CStr::from_ptr(text)
                    .to_string_lossy()
                    .into_owned()
            };
            ffi::SherpaOnnxDestroyOnlineRecognizerResult(result);
            owned
        };
        Ok(text)
    }

    fn is_endpoint(&self) -> bool {
        // SAFETY: pointers are valid until drop.
        unsafe { ffi::SherpaOnnxOnlineStreamIsEndpoint(self.recognizer, self.stream) != 0 }
    }

    fn reset(&mut self) {
        // SAFETY: pointers are valid until drop.
        unsafe { ffi::SherpaOnnxOnlineStreamReset(self.recognizer, self.stream) };
    }

    fn input_finished(&mut self) {
        // SAFETY: pointer is valid until drop.
        unsafe { ffi::SherpaOnnxOnlineStreamInputFinished(self.stream) };
    }
}

impl Drop for SherpaEngine {
    fn drop(&mut self) {
        // SAFETY: both were created in `open` and are destroyed exactly once.
        unsafe {
            ffi::SherpaOnnxDestroyOnlineStream(self.stream);
            ffi::SherpaOnnxDestroyOnlineRecognizer(self.recognizer);
        }
    }
}

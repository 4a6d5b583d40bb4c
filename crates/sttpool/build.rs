//! Build script for sttpool.
//!
//! With the `sherpa` feature, compiles the config shim in `csrc/` against the
//! installed sherpa-onnx headers and links libsherpa-onnx-c-api.

fn main() {
    println!("cargo:rerun-if-env-changed=SHERPA_ONNX_LIB_DIR");
    println!("cargo:rerun-if-env-changed=SHERPA_ONNX_INCLUDE_DIR");

    #[cfg(feature = "sherpa")]
    sherpa::build();
}

#[cfg(feature = "sherpa")]
mod sherpa {
    use std::env;
    use std::path::PathBuf;

    const SHIM: &str = "csrc/sherpa_shim.c";

    /// `SHERPA_ONNX_INCLUDE_DIR`, else the `include/` next to `SHERPA_ONNX_LIB_DIR`.
    /// Without either the headers must be on the compiler's default path.
    fn include_dir(lib_dir: Option<&str>) -> Option<PathBuf> {
        if let Some(dir) = env::var_os("SHERPA_ONNX_INCLUDE_DIR") {
            return Some(PathBuf::from(dir));
        }
        let lib_dir = PathBuf::from(lib_dir?);
        Some(lib_dir.parent()?.join("include"))
    }

    pub fn build() {
        println!("cargo:rerun-if-changed={SHIM}");
        let lib_dir = env::var("SHERPA_ONNX_LIB_DIR").ok();

        let mut shim = cc::Build::new();
        shim.file(SHIM).warnings(true);
        if let Some(dir) = include_dir(lib_dir.as_deref()) {
            shim.include(dir);
        }
        shim.compile("sttpool_sherpa_shim");

        // After the shim so the static archive resolves against the library.
        if let Some(lib_dir) = &lib_dir {
            println!("cargo:rustc-link-search=native={lib_dir}");
            println!("cargo:rustc-link-arg=-Wl,-rpath,{lib_dir}");
        }
        println!("cargo:rustc-link-lib=dylib=sherpa-onnx-c-api");
    }
}

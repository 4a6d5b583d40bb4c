//! `sttpool` -- pooled streaming speech recognition server.
//!
//! - `sttpool serve` -- load the decoder pool and accept raw PCM over TCP.
//! - `sttpool stream` -- send a PCM file to a running server and print transcripts.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sttpool::{DecoderPool, Dispatcher, EngineFactory, VersionInfo};
use tracing::info;

mod cli;
mod client;
mod logging;

use cli::{Cli, Command, ServeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Stream(args) => client::run(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!(version = %VersionInfo::new().describe(), "sttpool starting");

    let factory = engine_factory()?;
    let pool_config = args.pool_config()?;
    let session_config = args.session_config()?;
    info!(
        decoders = pool_config.size,
        tokens = %pool_config.model.tokens.display(),
        provider = %pool_config.engine.provider,
        "Loading decoder pool"
    );
    // Model loading is slow and blocking.
    let pool = tokio::task::spawn_blocking(move || DecoderPool::new(&pool_config, factory.as_ref()))
        .await?
        .context("failed to start decoder pool")?;

    let dispatcher = Dispatcher::new(Arc::new(pool), session_config);
    sttpool::serve(args.server_config(), dispatcher)
        .await
        .context("server failed")?;
    Ok(())
}

#[cfg(feature = "sherpa")]
fn engine_factory() -> anyhow::Result<Box<dyn EngineFactory>> {
    Ok(Box::new(sttpool::SherpaFactory))
}

#[cfg(not(feature = "sherpa"))]
fn engine_factory() -> anyhow::Result<Box<dyn EngineFactory>> {
    anyhow::bail!("this build has no recognition engine; rebuild with `--features sherpa`")
}

//! `sttpool stream`: send a raw PCM file and print transcript lines.

use std::time::Duration;

use anyhow::{Context, bail};
use futures::StreamExt;
use sttpool::TranscriptCodec;
use sttpool::engine::SAMPLE_RATE;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::cli::StreamArgs;

/// How a streaming run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Server closed without sending anything, i.e. no decoder was free.
    Rejected,
    Completed { lines: usize },
}

pub async fn run(args: StreamArgs) -> anyhow::Result<()> {
    if args.chunk_bytes == 0 {
        bail!("--chunk-bytes must be at least 1");
    }
    let audio = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    tracing::info!(addr = %args.addr, bytes = audio.len(), "Connected, streaming audio");

    let pace = args.realtime.then(|| {
        Duration::from_millis(sttpool::pcm::duration_ms(args.chunk_bytes, SAMPLE_RATE))
    });

    let mut stdout = tokio::io::stdout();
    match stream_audio(stream, &audio, args.chunk_bytes, pace, &mut stdout).await? {
        StreamOutcome::Rejected => {
            bail!("server at {} closed the connection without a transcript (no free decoder?)", args.addr)
        }
        StreamOutcome::Completed { lines } => {
            tracing::info!(lines, "Stream finished");
            Ok(())
        }
    }
}

/// Write `audio` in chunks, half-close, and copy every transcript line to `out`.
pub async fn stream_audio<S, O>(
    stream: S,
    audio: &[u8],
    chunk_bytes: usize,
    pace: Option<Duration>,
    out: &mut O,
) -> anyhow::Result<StreamOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, TranscriptCodec::new());

    let send = async {
        for chunk in audio.chunks(chunk_bytes) {
            writer.write_all(chunk).await?;
            if let Some(pace) = pace {
                tokio::time::sleep(pace).await;
            }
        }
        writer.shutdown().await?;
        anyhow::Ok(())
    };

    let receive = async {
        let mut count = 0;
        while let Some(line) = lines.next().await {
            let line = line.context("failed to read transcript")?;
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            count += 1;
        }
        out.flush().await?;
        anyhow::Ok(count)
    };

    let (sent, received) = tokio::join!(send, receive);
    let lines = received?;
    if lines == 0 {
        // A refused connection may also fail the write side; either way nothing came back.
        return Ok(StreamOutcome::Rejected);
    }
    sent.context("failed to send audio")?;
    Ok(StreamOutcome::Completed { lines })
}

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use live_telemetry::config::Settings;
use live_telemetry::log_tail::{HttpLogSource, LogTailState, LogTailer, TailStatus};
use live_telemetry::metrics::StreamMetrics;
use live_telemetry::visibility::VisibilityGate;

use super::{http_client, log_metrics, spawn_visibility_signals};

#[derive(Parser)]
pub struct LogsArgs {
    /// Run id whose log to follow
    pub subject: String,

    /// Save the buffered log into this directory on exit
    #[arg(long)]
    pub save: Option<PathBuf>,
}

/// Keyboard commands read from stdin, one per line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    End,
    Clear,
    Save,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "p" | "pause" => Some(Self::Pause),
            "r" | "resume" => Some(Self::Resume),
            "e" | "end" => Some(Self::End),
            "c" | "clear" => Some(Self::Clear),
            "s" | "save" => Some(Self::Save),
            _ => None,
        }
    }
}

/// The part of the buffer that arrived since the previous state, given the
/// offset advance. Seeks move the offset without filling the buffer, so the
/// slice is bounded by what the buffer holds.
fn fresh_text(state: &LogTailState, previous_offset: u64) -> &str {
    let advanced = state.offset.saturating_sub(previous_offset) as usize;
    let text = state.buffer.as_str();
    let keep = advanced.min(state.buffer.len());
    let skip = state.buffer.len() - keep;
    text.char_indices()
        .nth(skip)
        .map_or("", |(i, _)| &text[i..])
}

pub async fn run(settings: &Settings, args: LogsArgs) -> Result<()> {
    let gate = VisibilityGate::new();
    spawn_visibility_signals(gate.clone())?;

    let metrics = Arc::new(StreamMetrics::new());
    let tailer = LogTailer::with_metrics(
        Arc::new(HttpLogSource::new(http_client()?, settings.endpoints.clone())),
        settings.tail.clone(),
        gate.watch(),
        metrics.clone(),
    );

    let save_dir = args.save.clone().unwrap_or_else(|| PathBuf::from("."));
    tailer.start(&args.subject).await;
    info!(subject = %args.subject, offset = tailer.offset(), "tailing (commands: p, r, e, c, s)");

    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    follow(
        &tailer,
        BufReader::new(tokio::io::stdin()),
        &mut std::io::stdout(),
        &save_dir,
        interrupted,
    )
    .await?;

    if args.save.is_some() {
        save(&tailer, &save_dir).await;
    }
    tailer.stop();
    log_metrics(&metrics);
    Ok(())
}

/// Print log text as it arrives and apply commands from `input` until
/// `shutdown` resolves. Closed input stops command handling, not tailing.
async fn follow<R, W>(
    tailer: &LogTailer,
    input: R,
    out: &mut W,
    save_dir: &Path,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut states = tailer.subscribe_state();
    let mut offset = tailer.offset();
    let mut status = tailer.state().connection_status;
    states.borrow_and_update();

    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if state.offset > offset {
                    out.write_all(fresh_text(&state, offset).as_bytes())
                        .and_then(|()| out.flush())
                        .context("Failed to write log text")?;
                    offset = state.offset;
                }
                if state.connection_status != status {
                    match state.connection_status {
                        TailStatus::Error => warn!("log poll failing"),
                        s => info!(status = %s, "log tail"),
                    }
                    status = state.connection_status;
                }
            }
            line = lines.next_line(), if input_open => {
                let Ok(Some(line)) = line else {
                    debug!("command input closed");
                    input_open = false;
                    continue;
                };
                match Command::parse(&line) {
                    Some(Command::Pause) => tailer.pause(),
                    Some(Command::Resume) => tailer.resume(),
                    Some(Command::End) => {
                        tailer.jump_to_end().await;
                        offset = tailer.offset();
                        states.borrow_and_update();
                    }
                    Some(Command::Clear) => tailer.clear(),
                    Some(Command::Save) => save(tailer, save_dir).await,
                    None => eprintln!("[livetail: unknown command {:?}]", line.trim()),
                }
            }
            () = &mut shutdown => break,
        }
    }
    Ok(())
}

async fn save(tailer: &LogTailer, dir: &Path) {
    match tailer.download(dir).await {
        Ok(path) => eprintln!("[livetail: saved {}]", path.display()),
        Err(e) => warn!(error = %e, "failed to save log"),
    }
}

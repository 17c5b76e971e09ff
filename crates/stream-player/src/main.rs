//! Stream Player: a small CLI around the `audio-stream` engine.
//!
//! - `play`: open a file, start muted, then unmute and hand control to stdin.
//! - `transcode`: read a file through [`StreamReader`] and re-encode it with
//!   [`StreamWriter`].

mod cli;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use audio_stream::{
    AudioPlayer, PlaybackConfig, PlaybackState, StreamOptions, StreamReader, StreamWriter, Whence,
};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing_subscriber::EnvFilter;

/// Bytes pulled from the reader per transcode step.
const TRANSCODE_CHUNK: usize = 16 * 1024;
const SKIP_US: i64 = 10_000_000;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_player=info,audio_stream=info")
        }))
        .init();

    if args.list_devices {
        let host = cpal::default_host();
        for name in audio_stream::device::list_devices(&host)? {
            println!("{name}");
        }
        return Ok(());
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let _ = ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
        });
    }

    let config = PlaybackConfig {
        chunk_frames: args.chunk_frames,
        refill_max_frames: args.refill_max_frames,
        buffer_seconds: args.buffer_seconds,
        buffer_frames: args.buffer_frames,
        device: args.device.clone(),
    };

    match args.cmd {
        Some(cli::Command::Play {
            path,
            format,
            loops,
            no_resample,
            show_position,
        }) => {
            let options = stream_options(&format)
                .with_loops(loops)
                .with_resample(!no_resample);
            play(config, &path, options, show_position, &interrupted)
        }
        Some(cli::Command::Transcode {
            input,
            output,
            format,
            bit_rate,
            comment,
        }) => {
            let mut options = stream_options(&format);
            options.bit_rate = bit_rate;
            options.comment.extend(comment);
            transcode(&input, &output, options, &interrupted)
        }
        None => Err(anyhow!("no command given (try `play <file>` or --help)")),
    }
}

fn stream_options(format: &cli::FormatArgs) -> StreamOptions {
    let mut options = StreamOptions::default()
        .with_format(format.rate, format.channels, format.depth)
        .with_float(format.float);
    options.unsigned = format.unsigned;
    options
}

fn play(
    config: PlaybackConfig,
    path: &std::path::Path,
    options: StreamOptions,
    show_position: bool,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut player = AudioPlayer::new(config);
    player.open(path, options)?;
    tracing::info!(info = %player.info(), "source");
    player.play()?;

    let lines = spawn_stdin_reader();
    let mut last_report = Instant::now();
    loop {
        if interrupted.load(Ordering::SeqCst) {
            tracing::info!("interrupted");
            break;
        }
        if player.state() == PlaybackState::Stopped {
            break;
        }
        if show_position && last_report.elapsed() >= Duration::from_secs(1) {
            last_report = Instant::now();
            if let Ok(us) = player.tell() {
                println!("{} / {}", format_us(us), format_us(player.length()));
            }
        }

        let line = match lines.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            // stdin closed; keep playing until the end.
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if !handle_command(&mut player, line.trim())? {
            break;
        }
    }

    player.stop();
    let status = player.status();
    if let Some(error) = &status.error {
        return Err(anyhow!("playback failed: {error}"));
    }
    tracing::info!(reason = ?status.end_reason, "done");
    Ok(())
}

/// Apply one stdin command; `false` means quit.
fn handle_command(player: &mut AudioPlayer, line: &str) -> Result<bool> {
    let (cmd, arg) = match line.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    let outcome = match cmd {
        "" | "q" => return Ok(false),
        "p" => {
            if player.paused() {
                player.play()?;
            } else {
                player.pause();
            }
            Ok(())
        }
        "s" => match arg.parse::<f64>() {
            Ok(secs) => player.seek((secs * 1_000_000.0) as i64, Whence::Start),
            Err(_) => {
                println!("usage: s <seconds>");
                Ok(())
            }
        },
        "+" => player.seek(SKIP_US, Whence::Current),
        "-" => player.seek(-SKIP_US, Whence::Current),
        "l" => match arg.parse::<i32>() {
            Ok(n) => player.set_loops(n),
            Err(_) => {
                println!("usage: l <loops>");
                Ok(())
            }
        },
        "i" => {
            let status = serde_json::to_string_pretty(&player.status())?;
            println!("{status}");
            if let (Ok(loops), Ok(count)) = (player.loops(), player.loop_count()) {
                println!("loops: {loops} (done {count})");
            }
            Ok(())
        }
        other => {
            println!("unknown command {other:?}");
            Ok(())
        }
    };
    if let Err(e) = outcome {
        tracing::warn!("command failed: {e}");
    }
    Ok(true)
}

fn spawn_stdin_reader() -> crossbeam_channel::Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn transcode(
    input: &std::path::Path,
    output: &std::path::Path,
    options: StreamOptions,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut read_options = options.clone().with_loops(0);
    read_options.unsigned = options.unsigned || (!options.floatp && options.depth < 16);
    let mut reader = StreamReader::open(input, &read_options)
        .with_context(|| format!("open {:?}", input))?;
    tracing::info!(info = %reader.info(), "source");

    let mut writer = StreamWriter::create(output, &options)
        .with_context(|| format!("create {:?}", output))?;

    let started = Instant::now();
    let mut total = 0u64;
    while !interrupted.load(Ordering::SeqCst) {
        let chunk = reader.read(TRANSCODE_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        let audio = &chunk[..chunk.len() - reader.padding()];
        total += audio.len() as u64;
        writer.write(audio)?;
    }
    writer.close()?;
    reader.close();

    tracing::info!(
        bytes = total,
        seconds = total as f64 / writer.descriptor().bytes_per_second().max(1) as f64,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transcode finished"
    );
    Ok(())
}

fn format_us(us: i64) -> String {
    let secs = us.max(0) / 1_000_000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wav(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("stream-player-{}-{name}.wav", std::process::id()))
    }

    #[test]
    fn transcode_keeps_the_source_length() {
        let input = temp_wav("transcode-in");
        let output = temp_wav("transcode-out");
        let options = stream_options(&cli::FormatArgs {
            rate: 8_000,
            channels: 1,
            depth: 16,
            float: false,
            unsigned: false,
        });
        {
            let ramp: Vec<u8> = (0..3_000i16).flat_map(|i| (i * 5).to_le_bytes()).collect();
            let mut writer = StreamWriter::create(&input, &options).unwrap();
            writer.write(&ramp).unwrap();
            writer.close().unwrap();
        }

        transcode(&input, &output, options.clone(), &AtomicBool::new(false)).unwrap();

        let reader = StreamReader::open(&output, &options.with_loops(0)).unwrap();
        assert_eq!(reader.length(), 375_000);
        let _ = std::fs::remove_file(&input);
        let _ = std::fs::remove_file(&output);
    }

    #[test]
    fn format_us_renders_minutes_and_seconds() {
        assert_eq!(format_us(0), "0:00");
        assert_eq!(format_us(125_500_000), "2:05");
        assert_eq!(format_us(-5), "0:00");
    }
}

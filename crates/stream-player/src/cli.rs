use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("STREAM_PLAYER_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "stream-player", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Output queue target in seconds
    #[arg(long, default_value_t = 0.5)]
    pub buffer_seconds: f32,

    /// Frames handed to the output per worker iteration
    #[arg(long, default_value_t = 2048)]
    pub buffer_frames: usize,
}

/// Caller-side sample layout.
#[derive(ClapArgs, Debug, Clone)]
pub struct FormatArgs {
    /// Output sample rate in Hz
    #[arg(long, default_value_t = 44_100)]
    pub rate: u32,

    /// Output channel count
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Bits per sample
    #[arg(long, default_value_t = 16)]
    pub depth: u16,

    /// IEEE float samples (32-bit unless --depth 64)
    #[arg(long)]
    pub float: bool,

    /// Unsigned integer samples
    #[arg(long)]
    pub unsigned: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a file with interactive control on stdin
    ///
    /// Commands: `p` toggle pause, `s <secs>` seek, `+`/`-` skip 10s,
    /// `l <n>` set loops, `i` print status, empty line or `q` quit.
    Play {
        /// Path to audio file
        path: PathBuf,

        #[command(flatten)]
        format: FormatArgs,

        /// Restarts after the end of the file (-1 = forever)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        loops: i32,

        /// Play in the file's native layout instead of --rate/--channels/--depth
        #[arg(long)]
        no_resample: bool,

        /// Print the position once per second
        #[arg(long)]
        show_position: bool,
    },

    /// Decode a file and re-encode it as WAV
    Transcode {
        /// Source audio file
        input: PathBuf,

        /// Destination (.wav)
        output: PathBuf,

        #[command(flatten)]
        format: FormatArgs,

        /// Encoder bit rate in bits per second (WAV only accepts its PCM rate)
        #[arg(long)]
        bit_rate: Option<u32>,

        /// Metadata tag written to the output, e.g. --comment title=Intro
        #[arg(long, value_name = "KEY=VALUE", value_parser = parse_comment)]
        comment: Vec<(String, String)>,
    },
}

fn parse_comment(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err("comment key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}

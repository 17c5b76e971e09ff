//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for listing output devices and picking either
//! the default device or one by substring match, plus the stream config the
//! sink opens it with.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle`
/// (case-insensitive), or the host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .is_ok_and(|desc| matches_device_name(&desc.name(), needle))
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// Prefers the highest supported rate that is `<= target_rate`; if none is,
/// the lowest rate above it. Ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()?
        .map(|range| {
            let min = range.min_sample_rate();
            let rate = target_rate.clamp(min, range.max_sample_rate().max(min));
            let rank = Candidate::new(rate, target_rate, format_rank(range.sample_format()));
            (rank, range.with_sample_rate(rate))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, config)| config)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Names of the host's output devices.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<String>> {
    host.output_devices()
        .context("No output devices")?
        .map(|d| -> Result<String> { Ok(d.description()?.to_string()) })
        .collect()
}

/// Ordering key for a candidate config; smaller is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    above_target: bool,
    distance: u32,
    format_rank: u8,
}

impl Candidate {
    fn new(rate: u32, target: u32, format_rank: u8) -> Self {
        Self {
            above_target: rate > target,
            distance: rate.abs_diff(target),
            format_rank,
        }
    }
}

fn format_rank(format: cpal::SampleFormat) -> u8 {
    use cpal::SampleFormat::*;
    match format {
        F32 => 0,
        I32 => 1,
        I16 => 2,
        U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

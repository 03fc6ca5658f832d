//! Output device lookup.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Host default output device, or the first whose name contains `needle`
/// (case-insensitive).
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle.map(str::trim).filter(|n| !n.is_empty()) else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"));
    };
    let needle_lc = needle.to_lowercase();
    host.output_devices()
        .context("enumerate output devices")?
        .find(|d| {
            d.description()
                .map(|desc| name_matches(&desc.name(), &needle_lc))
                .unwrap_or(false)
        })
        .ok_or_else(|| anyhow!("no output device matched: {needle}"))
}

fn name_matches(name: &str, needle_lc: &str) -> bool {
    name.to_lowercase().contains(needle_lc)
}

/// Print output devices to stdout, marking the default.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|desc| desc.to_string());
    for (i, d) in host
        .output_devices()
        .context("enumerate output devices")?
        .enumerate()
    {
        let name = d.description()?.to_string();
        let marker = if default_name.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!("#{i}: {name}{marker}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_match_is_case_insensitive_substring() {
        assert!(name_matches("Built-in USB DAC", "usb dac"));
        assert!(!name_matches("Speakers", "hdmi"));
    }
}

use anyhow::{Context, Result};
use std::process::Command;

/// Check if the encoder binary is available and return its version line
pub fn ffmpeg_version(program: &str) -> Result<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .with_context(|| format!("Failed to execute {}. Is ffmpeg installed and in PATH?", program))?;

    if !output.status.success() {
        anyhow::bail!("{} -version failed with status: {}", program, output.status);
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let first_line = version_output.lines().next().unwrap_or("Unknown version");

    Ok(first_line.to_string())
}

/// Names of the encoders the binary was built with
pub fn available_encoders(program: &str) -> Result<Vec<String>> {
    let output = Command::new(program)
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} -encoders failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `ffmpeg -encoders` output.
///
/// Entries follow a ` ------` separator line and look like
/// ` V....D libx264  libx264 H.264 / AVC ...`.
pub fn parse_encoder_list(text: &str) -> Vec<String> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let flags = fields.next()?;
            let name = fields.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use super::types::{AudioOptions, FilterOrder, OutputOptions, OutputSpec, VideoOptions};

/// Encoder invocation settings shared by every output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub ffmpeg_path: String,
    pub loglevel: String,
    /// Forced demuxer for the stdin input; probed by FFmpeg when unset
    pub input_format: Option<String>,
    pub filter_order: FilterOrder,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            loglevel: "quiet".to_string(),
            input_format: None,
            filter_order: FilterOrder::default(),
        }
    }
}

/// Where the encoder writes its results
#[derive(Debug, Clone, Copy)]
pub enum OutputSinks<'a> {
    /// One muxed MPEG-TS stream on stdout
    Stdout,
    /// One path per output, in registration order
    Pipes(&'a [PathBuf]),
}

/// A fully built encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: String,
    args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Value following the first occurrence of `flag`
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for EncoderCommand {
    /// Shell-safe rendering for logs and dry runs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted = std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|arg| {
                shlex::try_quote(arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.clone())
            })
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&quoted)
    }
}

/// Label of the split tap feeding output `index`
fn tap_label(index: usize) -> String {
    format!("s{}", index)
}

/// Label of the filtered result of output `index`
fn result_label(index: usize) -> String {
    format!("v{}", index)
}

/// Build the filter graph fanning the decoded input out to every video output.
///
/// Returns `None` when no video output is registered.
pub fn build_filter_graph(specs: &[OutputSpec], order: FilterOrder) -> Option<String> {
    let video: Vec<(usize, &VideoOptions)> = specs
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| match &spec.options {
            OutputOptions::Video(v) => Some((index, v)),
            OutputOptions::Audio(_) => None,
        })
        .collect();

    if video.is_empty() {
        return None;
    }

    let mut fragments = Vec::with_capacity(video.len() + 1);

    let taps: String = video
        .iter()
        .map(|(index, _)| format!("[{}]", tap_label(*index)))
        .collect();
    fragments.push(format!("[0:v]split={}{}", video.len(), taps));

    for (index, v) in &video {
        let scale = format!("scale={}:{}", v.width, v.height);
        let fps = format!("fps={}", v.frame_rate);
        let chain = match order {
            FilterOrder::ScaleThenFps => format!("{},{}", scale, fps),
            FilterOrder::FpsThenScale => format!("{},{}", fps, scale),
        };
        fragments.push(format!(
            "[{}]{}[{}]",
            tap_label(*index),
            chain,
            result_label(*index)
        ));
    }

    Some(fragments.join(";"))
}

/// Keyframe expression forcing an IDR every `gop_size` frames worth of time
fn force_key_frames_expr(v: &VideoOptions) -> String {
    format!("expr:gte(t,n_forced*{})", v.frame_rate.seconds_for(v.gop_size))
}

fn apply_video_flags(args: &mut Vec<String>, spec: &str, v: &VideoOptions) {
    let mut flag = |name: &str, value: String| {
        args.push(format!("-{}:{}", name, spec));
        args.push(value);
    };

    flag("c", v.codec.clone());
    if let Some(crf) = v.crf {
        flag("crf", crf.to_string());
    }
    flag("preset", v.preset.clone());
    if let Some(tune) = &v.tune {
        flag("tune", tune.clone());
    }
    flag("profile", v.profile.clone());

    // GOP & keyframes
    flag("g", v.gop_size.to_string());
    flag("keyint_min", v.gop_size.to_string());
    flag("rc-lookahead", v.gop_size.to_string());
    flag("force_key_frames", force_key_frames_expr(v));
    flag("bf", v.b_frames.to_string());

    // Rate control
    flag("b", format!("{}k", v.bitrate_kbps));
    flag("bufsize", format!("{}k", v.bitrate_kbps.saturating_mul(2)));
}

fn apply_audio_flags(args: &mut Vec<String>, spec: &str, a: &AudioOptions) {
    args.push(format!("-c:{}", spec));
    args.push(a.codec.clone());
    args.push(format!("-b:{}", spec));
    args.push(format!("{}k", a.bitrate_kbps));
    args.push(format!("-ar:{}", spec));
    args.push(a.sample_rate.to_string());
}

fn apply_output_group(args: &mut Vec<String>, index: usize, spec: &OutputSpec, specifier: &str) {
    match &spec.options {
        OutputOptions::Video(v) => {
            args.push("-map".to_string());
            args.push(format!("[{}]", result_label(index)));
            apply_video_flags(args, specifier, v);
        }
        OutputOptions::Audio(a) => {
            args.push("-map".to_string());
            args.push("0:a:0".to_string());
            apply_audio_flags(args, specifier, a);
        }
    }
}

/// Build the complete encoder invocation for the registered outputs.
///
/// The result depends only on its inputs: the same outputs, settings and
/// sinks always produce the same argument vector.
pub fn build_encoder_cmd(
    specs: &[OutputSpec],
    settings: &EncoderSettings,
    sinks: OutputSinks<'_>,
) -> EncoderCommand {
    let mut args: Vec<String> = Vec::new();

    // Global flags
    args.extend(["-y", "-hide_banner", "-loglevel"].map(String::from));
    args.push(settings.loglevel.clone());

    // Input from stdin
    if let Some(format) = &settings.input_format {
        args.push("-f".to_string());
        args.push(format.clone());
    }
    args.push("-i".to_string());
    args.push("-".to_string());

    if let Some(graph) = build_filter_graph(specs, settings.filter_order) {
        args.push("-filter_complex".to_string());
        args.push(graph);
    }

    match sinks {
        OutputSinks::Stdout => {
            // Single output file: stream index equals mapping order
            for (index, spec) in specs.iter().enumerate() {
                apply_output_group(&mut args, index, spec, &index.to_string());
            }
            for (index, spec) in specs.iter().enumerate() {
                args.push("-streamid".to_string());
                args.push(format!("{}:{}", index, spec.id));
            }
            args.extend(
                ["-f", "mpegts", "-muxdelay", "0", "-muxpreload", "0", "-"].map(String::from),
            );
        }
        OutputSinks::Pipes(paths) => {
            debug_assert_eq!(paths.len(), specs.len(), "one pipe per output");
            for (index, (spec, path)) in specs.iter().zip(paths).enumerate() {
                apply_output_group(&mut args, index, spec, spec.options.stream_type());
                args.push("-f".to_string());
                args.push(spec.options.muxer().to_string());
                args.push(path.to_string_lossy().into_owned());
            }
        }
    }

    EncoderCommand::new(settings.ffmpeg_path.clone(), args)
}

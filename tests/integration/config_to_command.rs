use crate::common::helpers::{RecordingDownstream, feed_all, sh_cmd};
use ffladder::config::Config;
use ffladder::engine::{
    EncoderCommand, OutputMode, OutputSinks, StageError, TranscodeStage, build_encoder_cmd,
};

const LADDER: &str = r#"
[encoder]
loglevel = "error"
mode = "combined"

[[outputs]]
id = 256
video = { width = 1280, height = 720, bitrate_kbps = 3000 }

[[outputs]]
id = 257
video = { width = 640, height = 360, bitrate_kbps = 800, profile = "main" }
"#;

fn stage_from(cfg: &Config, mode: Option<OutputMode>) -> Result<TranscodeStage, StageError> {
    let mut stage = TranscodeStage::new(cfg.encoder.stage_settings(mode));
    for entry in &cfg.outputs {
        stage.register(entry.id, entry.options.clone())?;
    }
    Ok(stage)
}

/// Activate with the real builder, but run a passthrough in its place
fn capture_command(stage: &mut TranscodeStage) -> EncoderCommand {
    let mut captured = None;
    let input = stage
        .activate_with(|specs, settings, sinks| {
            captured = Some(build_encoder_cmd(specs, settings, sinks));
            match sinks {
                OutputSinks::Stdout => sh_cmd("exec cat", &[]),
                OutputSinks::Pipes(paths) => {
                    // Open every pipe, write nothing
                    let args: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    sh_cmd("cat > /dev/null; for p in \"$@\"; do : > \"$p\"; done", &args)
                }
            }
        })
        .unwrap();
    feed_all(&input, b"stream", 3);
    stage.run(&mut RecordingDownstream::default()).unwrap();
    captured.unwrap()
}

#[test]
fn test_two_rung_ladder_builds_two_scale_taps() {
    let cfg: Config = toml::from_str(LADDER).unwrap();
    let mut stage = stage_from(&cfg, None).unwrap();
    let cmd = capture_command(&mut stage);

    let graph = cmd.flag_value("-filter_complex").unwrap();
    assert_eq!(graph.matches("scale=").count(), 2);
    assert!(graph.contains("scale=1280:720"));
    assert!(graph.contains("scale=640:360"));

    assert_eq!(cmd.flag_value("-loglevel"), Some("error"));
    assert_eq!(cmd.flag_value("-b:0"), Some("3000k"));
    assert_eq!(cmd.flag_value("-b:1"), Some("800k"));
    assert_eq!(cmd.flag_value("-profile:0"), Some("high"));
    assert_eq!(cmd.flag_value("-profile:1"), Some("main"));
    assert_eq!(cmd.flag_value("-streamid"), Some("0:256"));
}

#[test]
fn test_mode_override_switches_to_pipes() {
    let cfg: Config = toml::from_str(LADDER).unwrap();
    let mut stage = stage_from(&cfg, Some(OutputMode::MultiSink)).unwrap();
    let cmd = capture_command(&mut stage);

    let args = cmd.args();
    assert!(!args.iter().any(|a| a == "-streamid"));
    assert_eq!(cmd.flag_value("-b:v"), Some("3000k"));
    assert_eq!(
        args.iter().filter(|a| a.ends_with(".fifo")).count(),
        2,
        "{cmd}"
    );
}

#[test]
fn test_out_of_range_stream_id_rejected_in_combined_mode() {
    let cfg: Config = toml::from_str(
        r#"
        [[outputs]]
        id = 1
        video = {}
        "#,
    )
    .unwrap();

    let err = stage_from(&cfg, Some(OutputMode::Combined)).err().unwrap();
    assert!(matches!(err, StageError::InvalidSpec { .. }), "{err:?}");

    // Any identifier is fine once each output has its own pipe
    assert!(stage_from(&cfg, Some(OutputMode::MultiSink)).is_ok());
}

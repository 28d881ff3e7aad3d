use crate::common::helpers::{RecordingDownstream, feed_all, payload, sh_cmd, video};
use ffladder::engine::{
    Channel, EncoderCommand, OutputMode, OutputSinks, StageSettings, StagePhase, StreamFormat,
    TranscodeStage,
};

fn combined_stage() -> TranscodeStage {
    let mut stage = TranscodeStage::new(StageSettings::new(OutputMode::Combined));
    stage.register(0x100, video(1280, 720)).unwrap();
    stage.register(0x101, video(640, 360)).unwrap();
    stage
}

#[test]
fn test_combined_passthrough_delivers_every_byte_in_order() {
    let mut stage = combined_stage();
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();

    let bytes = payload(300_000);
    feed_all(&input, &bytes, 4096);
    drop(input);

    let mut downstream = RecordingDownstream::default();
    let report = stage.run(&mut downstream).unwrap();

    assert_eq!(downstream.bytes(Channel::Combined), bytes.as_slice());
    assert_eq!(downstream.eos, vec![Channel::Combined], "exactly one end of stream");

    assert_eq!(report.mode, OutputMode::Combined);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.bytes_in, bytes.len() as u64);
    let channel = report.channel(Channel::Combined).unwrap();
    assert!(channel.complete);
    assert_eq!(channel.bytes, bytes.len() as u64);
    assert_eq!(stage.phase(), StagePhase::Finished);
}

#[test]
fn test_format_declaration_forwarded_as_unstructured() {
    let mut stage = combined_stage();
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();

    input
        .send_format(StreamFormat::Elementary {
            codec: "h264".to_string(),
        })
        .unwrap();
    feed_all(&input, b"nal units", 4);

    let mut downstream = RecordingDownstream::default();
    stage.run(&mut downstream).unwrap();

    assert_eq!(
        downstream.formats,
        vec![(Channel::Combined, StreamFormat::Unstructured)]
    );
    assert_eq!(downstream.bytes(Channel::Combined), b"nal units");
}

#[test]
fn test_empty_input_still_completes() {
    let mut stage = combined_stage();
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();
    input.end_of_input().unwrap();

    let mut downstream = RecordingDownstream::default();
    let report = stage.run(&mut downstream).unwrap();

    assert_eq!(report.bytes_in, 0);
    assert!(downstream.bytes(Channel::Combined).is_empty());
    assert_eq!(downstream.eos, vec![Channel::Combined]);
}

#[test]
fn test_cloned_inputs_share_one_upstream() {
    let mut stage = combined_stage();
    let input = stage
        .activate_with(|_, _, _| sh_cmd("exec cat", &[]))
        .unwrap();
    let second = stage.input().unwrap();

    input.send_chunk(b"first ".to_vec()).unwrap();
    second.send_chunk(b"second".to_vec()).unwrap();
    drop(second);
    input.end_of_input().unwrap();

    let mut downstream = RecordingDownstream::default();
    stage.run(&mut downstream).unwrap();
    assert_eq!(downstream.bytes(Channel::Combined), b"first second");
}

#[test]
fn test_activation_uses_registered_outputs_and_stdout_sink() {
    let mut stage = combined_stage();
    let mut built: Option<EncoderCommand> = None;

    let input = stage
        .activate_with(|specs, settings, sinks| {
            assert!(matches!(sinks, OutputSinks::Stdout));
            built = Some(ffladder::engine::build_encoder_cmd(specs, settings, sinks));
            sh_cmd("exec cat", &[])
        })
        .unwrap();
    feed_all(&input, b"x", 1);
    stage.run(&mut RecordingDownstream::default()).unwrap();

    let cmd = built.unwrap();
    assert_eq!(
        cmd.flag_value("-filter_complex"),
        Some("[0:v]split=2[s0][s1];[s0]scale=1280:720,fps=30[v0];[s1]scale=640:360,fps=30[v1]")
    );
    assert_eq!(cmd.flag_value("-c:0"), Some("libx264"));
    assert_eq!(cmd.flag_value("-b:1"), Some("3000k"));
    assert_eq!(cmd.flag_value("-f"), Some("mpegts"));
    assert_eq!(stage.command().map(|c| c.program()), Some("sh"));
}

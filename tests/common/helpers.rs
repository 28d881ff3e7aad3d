#![allow(dead_code)]

use ffladder::engine::{
    AudioOptions, Channel, Downstream, EncoderCommand, OutputOptions, StageInput, StreamFormat,
    VideoOptions,
};
use std::collections::HashMap;
use std::io;

/// Downstream that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingDownstream {
    pub formats: Vec<(Channel, StreamFormat)>,
    pub data: HashMap<Channel, Vec<u8>>,
    pub chunks: HashMap<Channel, usize>,
    pub eos: Vec<Channel>,
}

impl RecordingDownstream {
    pub fn bytes(&self, channel: Channel) -> &[u8] {
        self.data.get(&channel).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Downstream for RecordingDownstream {
    fn stream_format(&mut self, channel: Channel, format: &StreamFormat) -> io::Result<()> {
        self.formats.push((channel, format.clone()));
        Ok(())
    }

    fn write_chunk(&mut self, channel: Channel, chunk: &[u8]) -> io::Result<()> {
        assert!(
            !self.eos.contains(&channel),
            "data for {channel} after end of stream"
        );
        self.data.entry(channel).or_default().extend_from_slice(chunk);
        *self.chunks.entry(channel).or_default() += 1;
        Ok(())
    }

    fn end_of_stream(&mut self, channel: Channel) -> io::Result<()> {
        self.eos.push(channel);
        Ok(())
    }
}

/// Stand-in encoder: `sh -c <script> sh <args...>`
pub fn sh_cmd(script: &str, args: &[String]) -> EncoderCommand {
    let mut argv = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    argv.extend_from_slice(args);
    EncoderCommand::new("sh", argv)
}

pub fn video(width: u32, height: u32) -> OutputOptions {
    OutputOptions::Video(VideoOptions {
        width,
        height,
        ..VideoOptions::default()
    })
}

pub fn audio() -> OutputOptions {
    OutputOptions::Audio(AudioOptions::default())
}

/// Deterministic, non-repeating test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Send `bytes` in `chunk` sized pieces followed by end of input
pub fn feed_all(input: &StageInput, bytes: &[u8], chunk: usize) {
    for piece in bytes.chunks(chunk) {
        input.send_chunk(piece).unwrap();
    }
    input.end_of_input().unwrap();
}

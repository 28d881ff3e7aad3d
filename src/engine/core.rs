mod error;
pub mod fifo;
mod ffmpeg_cmd;
mod ffmpeg_info;
mod process;
mod registry;
mod types;

pub use error::{ExitFailure, StageError, StagePhase};
pub use ffmpeg_cmd::{
    EncoderCommand, EncoderSettings, OutputSinks, build_encoder_cmd, build_filter_graph,
};
pub use ffmpeg_info::{available_encoders, ffmpeg_version, parse_encoder_list};
pub use fifo::FifoSet;
pub use process::{EncoderProcess, ProcessState};
pub use registry::{EncodeSpecRegistry, MPEGTS_PID_RANGE};
pub use types::{
    AudioOptions, Channel, FilterOrder, FrameRate, OutputId, OutputMode, OutputOptions,
    OutputSpec, StreamFormat, VideoOptions,
};

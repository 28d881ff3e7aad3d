// Transcode engine - independent of the CLI

pub mod collector;
pub mod core;
pub mod stage;

pub use core::*;
pub use stage::{
    ChannelReport, Downstream, StageEvent, StageInput, StageReport, StageSettings,
    TranscodeStage, default_exit_timeout,
};

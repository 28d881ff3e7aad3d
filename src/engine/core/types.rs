use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one requested encoding variant.
///
/// Used as the container stream id in combined mode and as the
/// downstream channel tag in multi-sink mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(pub u16);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for OutputId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

/// How encoder results leave the subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// One MPEG-TS stream on stdout carrying every output
    #[default]
    Combined,
    /// One named pipe per output carrying its raw elementary stream
    MultiSink,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Combined => write!(f, "combined"),
            OutputMode::MultiSink => write!(f, "multi-sink"),
        }
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(OutputMode::Combined),
            "multi-sink" | "multisink" => Ok(OutputMode::MultiSink),
            other => Err(format!("unknown output mode '{}'", other)),
        }
    }
}

/// Order of the per-tap filters in the filter graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOrder {
    #[default]
    ScaleThenFps,
    FpsThenScale,
}

/// Logical output channel as seen downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// The single multiplexed stream of combined mode
    Combined,
    /// A dedicated per-output stream of multi-sink mode
    Output(OutputId),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Combined => write!(f, "combined"),
            Channel::Output(id) => write!(f, "output {}", id),
        }
    }
}

/// Stream format declarations passed through the stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFormat {
    /// Encoded video elementary stream without container (e.g. "h264")
    Elementary { codec: String },
    /// Opaque byte stream; what every output channel declares
    Unstructured,
}

/// Frame rate as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrameRateRepr", into = "FrameRateRepr")]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Duration of `frames` frames in seconds
    pub fn seconds_for(&self, frames: u32) -> f64 {
        frames as f64 * self.den as f64 / self.num as f64
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::new(30, 1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl FromStr for FrameRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (num, den) = match s.split_once('/') {
            Some((num, den)) => (num, den),
            None => (s, "1"),
        };
        let num = num
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid frame rate '{}'", s))?;
        let den = den
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid frame rate '{}'", s))?;
        if num == 0 || den == 0 {
            return Err(format!("frame rate '{}' must be positive", s));
        }
        Ok(Self { num, den })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FrameRateRepr {
    Whole(u32),
    Ratio(String),
}

impl TryFrom<FrameRateRepr> for FrameRate {
    type Error = String;

    fn try_from(repr: FrameRateRepr) -> Result<Self, Self::Error> {
        match repr {
            FrameRateRepr::Whole(0) => Err("frame rate must be positive".to_string()),
            FrameRateRepr::Whole(num) => Ok(FrameRate::new(num, 1)),
            FrameRateRepr::Ratio(s) => s.parse(),
        }
    }
}

impl From<FrameRate> for FrameRateRepr {
    fn from(rate: FrameRate) -> Self {
        if rate.den == 1 {
            FrameRateRepr::Whole(rate.num)
        } else {
            FrameRateRepr::Ratio(rate.to_string())
        }
    }
}

/// Encoding parameters of one video output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoOptions {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub bitrate_kbps: u32,
    pub codec: String,
    pub profile: String,
    pub preset: String,
    pub tune: Option<String>,
    pub crf: Option<u8>,
    pub gop_size: u32,
    pub b_frames: u32,
    /// Raw muxer used when the output gets its own pipe
    pub muxer: String,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: FrameRate::default(),
            bitrate_kbps: 3000,
            codec: "libx264".to_string(),
            profile: "high".to_string(),
            preset: "veryfast".to_string(),
            tune: None,
            crf: None,
            gop_size: 60,
            b_frames: 0,
            muxer: "h264".to_string(),
        }
    }
}

/// Encoding parameters of one audio output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioOptions {
    pub codec: String,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub muxer: String,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            codec: "aac".to_string(),
            bitrate_kbps: 128,
            sample_rate: 48000,
            muxer: "adts".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputOptions {
    Video(VideoOptions),
    Audio(AudioOptions),
}

impl OutputOptions {
    /// Stream type letter used in FFmpeg stream specifiers
    pub fn stream_type(&self) -> &'static str {
        match self {
            OutputOptions::Video(_) => "v",
            OutputOptions::Audio(_) => "a",
        }
    }

    pub fn muxer(&self) -> &str {
        match self {
            OutputOptions::Video(v) => &v.muxer,
            OutputOptions::Audio(a) => &a.muxer,
        }
    }

    /// Check the options at the registration boundary
    pub fn validate(&self) -> Result<(), String> {
        match self {
            OutputOptions::Video(v) => {
                if v.width == 0 || v.height == 0 {
                    return Err(format!("resolution {}x{} must be non-zero", v.width, v.height));
                }
                // yuv420p encoders reject odd dimensions
                if v.width % 2 != 0 || v.height % 2 != 0 {
                    return Err(format!("resolution {}x{} must be even", v.width, v.height));
                }
                if v.frame_rate.num == 0 || v.frame_rate.den == 0 {
                    return Err("frame rate must be positive".to_string());
                }
                if v.bitrate_kbps == 0 {
                    return Err("bitrate must be positive".to_string());
                }
                if let Some(crf) = v.crf {
                    if crf > 51 {
                        return Err(format!("crf {} out of range 0-51", crf));
                    }
                }
                if v.gop_size == 0 {
                    return Err("gop_size must be positive".to_string());
                }
                if v.codec.is_empty() || v.preset.is_empty() || v.profile.is_empty() {
                    return Err("codec, preset and profile must not be empty".to_string());
                }
                if v.muxer.is_empty() {
                    return Err("muxer must not be empty".to_string());
                }
                Ok(())
            }
            OutputOptions::Audio(a) => {
                if a.bitrate_kbps == 0 {
                    return Err("bitrate must be positive".to_string());
                }
                if a.sample_rate == 0 {
                    return Err("sample_rate must be positive".to_string());
                }
                if a.codec.is_empty() || a.muxer.is_empty() {
                    return Err("codec and muxer must not be empty".to_string());
                }
                Ok(())
            }
        }
    }
}

/// One registered output
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub id: OutputId,
    pub options: OutputOptions,
}

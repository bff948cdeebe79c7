use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{FifoError, StageError};

/// What a stage does with its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    AudioEncoder,
    AudioDecoder,
    VideoEncoder,
    VideoDecoder,
    Bypass,
    Transcoder,
    RtspMuxer,
    RtspDemuxer,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::AudioEncoder => "audio-encoder",
            StageKind::AudioDecoder => "audio-decoder",
            StageKind::VideoEncoder => "video-encoder",
            StageKind::VideoDecoder => "video-decoder",
            StageKind::Bypass => "bypass",
            StageKind::Transcoder => "transcoder",
            StageKind::RtspMuxer => "rtsp-muxer",
            StageKind::RtspDemuxer => "rtsp-demuxer",
        };
        f.write_str(name)
    }
}

/// Runtime settings of a stage as plain key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageSettings(BTreeMap<String, String>);

impl StageSettings {
    pub fn new() -> StageSettings {
        StageSettings::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> StageSettings {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Typed value of `key`, `None` when unset.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, StageError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e: T::Err| StageError::Settings {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Receives the frames a processor produces.
pub type FrameSink<'a> = dyn FnMut(&[u8]) -> Result<(), FifoError> + 'a;

/// The resource a stage protects, e.g. one codec instance.
pub trait FrameProcessor: Send {
    fn kind(&self) -> StageKind;

    /// Transforms one input frame, handing every output frame to `sink`.
    /// Errors from `sink` should be returned as they are.
    fn process(&mut self, frame: &[u8], sink: &mut FrameSink<'_>) -> Result<(), StageError>;

    /// Called once before the processor is dropped.
    fn close(&mut self) {}
}

/// Opens processors of one kind from settings.
pub trait ProcessorFactory: Send + Sync {
    fn kind(&self) -> StageKind;

    fn open(&self, settings: &StageSettings) -> Result<Box<dyn FrameProcessor>, StageError>;
}

/// Passes frames through untouched.
#[derive(Debug, Default)]
pub struct BypassProcessor {
    frames: u64,
}

impl BypassProcessor {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameProcessor for BypassProcessor {
    fn kind(&self) -> StageKind {
        StageKind::Bypass
    }

    fn process(&mut self, frame: &[u8], sink: &mut FrameSink<'_>) -> Result<(), StageError> {
        sink(frame)?;
        self.frames += 1;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BypassFactory;

impl ProcessorFactory for BypassFactory {
    fn kind(&self) -> StageKind {
        StageKind::Bypass
    }

    fn open(&self, _settings: &StageSettings) -> Result<Box<dyn FrameProcessor>, StageError> {
        Ok(Box::new(BypassProcessor::default()))
    }
}

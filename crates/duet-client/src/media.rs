//! Local media acquisition and display sinks.
//!
//! Capturing from a real camera/microphone and rendering to a screen live
//! outside this crate; the coordinator only sees `MediaSource` and
//! `DisplaySink`.

use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Handle to an audio/video stream, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub label: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    /// A stream with one audio and one video track.
    pub fn audio_video(label: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            tracks: vec![
                MediaTrack {
                    id: format!("{id}-audio"),
                    kind: TrackKind::Audio,
                },
                MediaTrack {
                    id: format!("{id}-video"),
                    kind: TrackKind::Video,
                },
            ],
            id,
            label: label.into(),
        }
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Source of the local audio/video stream.
pub trait MediaSource: Send {
    fn acquire(&mut self) -> Result<MediaStream>;
}

/// Media source that fabricates stream handles without touching hardware.
pub struct SyntheticMedia {
    label: String,
    available: bool,
}

impl SyntheticMedia {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            available: true,
        }
    }

    /// Always fails, as a denied camera/microphone permission would.
    pub fn unavailable() -> Self {
        Self {
            label: String::new(),
            available: false,
        }
    }
}

impl MediaSource for SyntheticMedia {
    fn acquire(&mut self) -> Result<MediaStream> {
        if !self.available {
            return Err(anyhow!("media access denied"));
        }
        Ok(MediaStream::audio_video(self.label.clone()))
    }
}

/// Where a stream is shown.
pub trait DisplaySink: Send + Sync {
    fn attach(&self, stream: MediaStream);
    fn clear(&self);
}

/// Display sink that just remembers the attached stream and lets
/// presentation code watch it.
#[derive(Debug)]
pub struct SinkSlot {
    tx: watch::Sender<Option<MediaStream>>,
}

impl SinkSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn current(&self) -> Option<MediaStream> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<MediaStream>> {
        self.tx.subscribe()
    }
}

impl Default for SinkSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplaySink for SinkSlot {
    fn attach(&self, stream: MediaStream) {
        self.tx.send_replace(Some(stream));
    }

    fn clear(&self) {
        self.tx.send_replace(None);
    }
}

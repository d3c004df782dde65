// --- Media selection -------------------------------------------------------
//
// The dashboard lets a user pick either one video (looped) or a background
// image plus an ordered list of audio tracks. `resolve` turns that selection
// into a `StreamComposition` the command builder can trust.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type MediaId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            "image" => Some(MediaKind::Image),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored media file, as handed out by the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub id: MediaId,
    pub owner: OwnerId,
    pub kind: MediaKind,
    pub filename: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMode {
    Video,
    AudioPlaylist,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Video => f.write_str("video loop"),
            StreamMode::AudioPlaylist => f.write_str("audio playlist"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamComposition {
    VideoLoop {
        video: MediaDescriptor,
    },
    AudioPlaylist {
        background: MediaDescriptor,
        tracks: Vec<MediaDescriptor>,
    },
}

impl StreamComposition {
    pub fn mode(&self) -> StreamMode {
        match self {
            StreamComposition::VideoLoop { .. } => StreamMode::Video,
            StreamComposition::AudioPlaylist { .. } => StreamMode::AudioPlaylist,
        }
    }

    /// Every input file in the order the transcoder will open it.
    pub fn inputs(&self) -> Vec<&MediaDescriptor> {
        match self {
            StreamComposition::VideoLoop { video } => vec![video],
            StreamComposition::AudioPlaylist { background, tracks } => {
                std::iter::once(background).chain(tracks.iter()).collect()
            }
        }
    }
}

/// Resolves a user's selection into a composition.
///
/// `selections` is the ordered list of descriptors the user picked. For an
/// audio playlist the image may appear anywhere; audio tracks keep their
/// relative order.
pub fn resolve(
    mode: StreamMode,
    selections: &[MediaDescriptor],
) -> Result<StreamComposition, StreamError> {
    match mode {
        StreamMode::Video => {
            let mut videos = selections.iter().filter(|m| m.kind == MediaKind::Video);
            let video = videos
                .next()
                .ok_or_else(|| StreamError::IncompleteSelection("select a video to loop".into()))?;
            if videos.next().is_some() {
                return Err(StreamError::IncompleteSelection(
                    "a video loop takes exactly one video".into(),
                ));
            }
            if let Some(other) = selections.iter().find(|m| m.kind != MediaKind::Video) {
                return Err(StreamError::InvalidComposition(format!(
                    "{} '{}' cannot be part of a video loop",
                    other.kind, other.filename
                )));
            }
            Ok(StreamComposition::VideoLoop {
                video: video.clone(),
            })
        }
        StreamMode::AudioPlaylist => {
            let mut images = selections.iter().filter(|m| m.kind == MediaKind::Image);
            let background = images.next().ok_or_else(|| {
                StreamError::IncompleteSelection("select a background image".into())
            })?;
            if images.next().is_some() {
                return Err(StreamError::IncompleteSelection(
                    "an audio playlist takes exactly one background image".into(),
                ));
            }
            if let Some(video) = selections.iter().find(|m| m.kind == MediaKind::Video) {
                return Err(StreamError::InvalidComposition(format!(
                    "video '{}' cannot be part of an audio playlist",
                    video.filename
                )));
            }
            let tracks: Vec<MediaDescriptor> = selections
                .iter()
                .filter(|m| m.kind == MediaKind::Audio)
                .cloned()
                .collect();
            if tracks.is_empty() {
                return Err(StreamError::IncompleteSelection(
                    "select at least one audio track".into(),
                ));
            }
            Ok(StreamComposition::AudioPlaylist {
                background: background.clone(),
                tracks,
            })
        }
    }
}

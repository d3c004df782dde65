// --- Transcoder invocation -------------------------------------------------
//
// Builds the exact argv for one stream. Nothing here goes through a shell:
// file names and the destination URL are discrete arguments, so quotes,
// spaces and `;` in user input stay inside their own argument.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::destination::{redact_secret, Destination};
use crate::error::StreamError;
use crate::media::{MediaDescriptor, MediaId, OwnerId, StreamComposition, StreamMode};

/// Constant encoder settings shared by both stream modes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EncodingProfile {
    pub video_codec: String,
    pub preset: String,
    pub max_bitrate: String,
    pub buffer_size: String,
    pub pixel_format: String,
    pub keyframe_interval: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub loglevel: String,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            video_codec: "libx264".into(),
            preset: "veryfast".into(),
            max_bitrate: "3000k".into(),
            buffer_size: "6000k".into(),
            pixel_format: "yuv420p".into(),
            keyframe_interval: 50,
            audio_codec: "aac".into(),
            audio_bitrate: "128k".into(),
            audio_sample_rate: 44_100,
            loglevel: "warning".into(),
        }
    }
}

/// Playlist file the concat demuxer reads. Written by the supervisor right
/// before spawn and removed after exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistManifest {
    pub path: PathBuf,
    pub body: String,
}

/// What a session is streaming, with the target already redacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamContext {
    pub mode: StreamMode,
    pub media_ids: Vec<MediaId>,
    pub target: String,
    #[serde(rename = "loop")]
    pub looped: bool,
}

/// A fully specified process start: program plus discrete arguments.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub manifest: Option<PlaylistManifest>,
    pub context: Option<StreamContext>,
    secrets: Vec<String>,
}

impl ProcessInvocation {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            manifest: None,
            context: None,
            secrets: Vec::new(),
        }
    }

    /// Registers a value that must be masked whenever this invocation, or
    /// output produced by it, is logged.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn redact(&self, line: &str) -> String {
        self.secrets
            .iter()
            .fold(line.to_string(), |acc, s| redact_secret(&acc, s))
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Human readable command line for logs. Never executed.
    pub fn display_redacted(&self) -> String {
        let mut out = self.program_name();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&self.redact(arg));
        }
        out
    }
}

impl fmt::Debug for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInvocation")
            .field("program", &self.program)
            .field(
                "args",
                &self.args.iter().map(|a| self.redact(a)).collect::<Vec<_>>(),
            )
            .field("manifest", &self.manifest.as_ref().map(|m| &m.path))
            .field("context", &self.context)
            .finish()
    }
}

pub struct CommandBuilder {
    ffmpeg: PathBuf,
    work_dir: PathBuf,
    profile: EncodingProfile,
}

impl CommandBuilder {
    pub fn new(ffmpeg: impl Into<PathBuf>, work_dir: impl AsRef<Path>, profile: EncodingProfile) -> Self {
        let work_dir = work_dir.as_ref();
        let work_dir = if work_dir.is_absolute() {
            work_dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(work_dir))
                .unwrap_or_else(|_| work_dir.to_path_buf())
        };
        Self {
            ffmpeg: ffmpeg.into(),
            work_dir,
            profile,
        }
    }

    pub fn profile(&self) -> &EncodingProfile {
        &self.profile
    }

    pub fn manifest_path(&self, owner: OwnerId) -> PathBuf {
        self.work_dir.join(format!("{owner}.ffconcat"))
    }

    /// Maps a composition to a ready-to-spawn invocation. Checks that every
    /// input exists and is readable, but never runs anything.
    pub fn build(
        &self,
        owner: OwnerId,
        composition: &StreamComposition,
        destination: &Destination,
        looped: bool,
    ) -> Result<ProcessInvocation, StreamError> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            self.profile.loglevel.clone(),
        ];
        let mut manifest = None;

        match composition {
            StreamComposition::VideoLoop { video } => {
                let input = readable_input(video)?;
                args.push("-re".into());
                if looped {
                    args.extend(["-stream_loop".into(), "-1".into()]);
                }
                args.extend(["-i".into(), file_url(&input)]);
                self.push_video_encoding(&mut args, false);
                self.push_audio_encoding(&mut args);
            }
            StreamComposition::AudioPlaylist { background, tracks } => {
                ensure_single_format(tracks)?;
                let image = readable_input(background)?;
                let mut body = String::from("ffconcat version 1.0\n");
                for track in tracks {
                    let path = readable_input(track)?;
                    body.push_str(&concat_entry(&path, track)?);
                }
                let manifest_path = self.manifest_path(owner);

                args.extend([
                    "-re".into(),
                    "-loop".into(),
                    "1".into(),
                    "-i".into(),
                    file_url(&image),
                    "-re".into(),
                ]);
                if looped {
                    args.extend(["-stream_loop".into(), "-1".into()]);
                }
                args.extend([
                    "-f".into(),
                    "concat".into(),
                    "-safe".into(),
                    "0".into(),
                    "-i".into(),
                    file_url(&manifest_path),
                    "-map".into(),
                    "0:v:0".into(),
                    "-map".into(),
                    "1:a:0".into(),
                ]);
                self.push_video_encoding(&mut args, true);
                self.push_audio_encoding(&mut args);
                // The still image never ends on its own.
                args.push("-shortest".into());

                manifest = Some(PlaylistManifest {
                    path: manifest_path,
                    body,
                });
            }
        }

        args.extend(["-f".into(), "flv".into(), destination.target()]);

        let mut invocation = ProcessInvocation::new(&self.ffmpeg, args).with_secret(destination.secret());
        invocation.manifest = manifest;
        invocation.context = Some(StreamContext {
            mode: composition.mode(),
            media_ids: composition.inputs().iter().map(|m| m.id).collect(),
            target: destination.redacted_target(),
            looped,
        });
        Ok(invocation)
    }

    fn push_video_encoding(&self, args: &mut Vec<String>, still: bool) {
        let p = &self.profile;
        args.extend(["-c:v".into(), p.video_codec.clone(), "-preset".into(), p.preset.clone()]);
        if still {
            args.extend(["-tune".into(), "stillimage".into()]);
        }
        args.extend([
            "-maxrate".into(),
            p.max_bitrate.clone(),
            "-bufsize".into(),
            p.buffer_size.clone(),
            "-pix_fmt".into(),
            p.pixel_format.clone(),
            "-g".into(),
            p.keyframe_interval.to_string(),
        ]);
    }

    fn push_audio_encoding(&self, args: &mut Vec<String>) {
        let p = &self.profile;
        args.extend([
            "-c:a".into(),
            p.audio_codec.clone(),
            "-b:a".into(),
            p.audio_bitrate.clone(),
            "-ar".into(),
            p.audio_sample_rate.to_string(),
        ]);
    }
}

/// Resolves a descriptor to an absolute path of a readable regular file.
fn readable_input(media: &MediaDescriptor) -> Result<PathBuf, StreamError> {
    let invalid = |why: String| {
        StreamError::InvalidComposition(format!("{} '{}' {why}", media.kind, media.filename))
    };

    let path = std::fs::canonicalize(&media.path).map_err(|e| invalid(format!("is missing: {e}")))?;
    let meta = std::fs::metadata(&path).map_err(|e| invalid(format!("cannot be inspected: {e}")))?;
    if !meta.is_file() {
        return Err(invalid("is not a regular file".into()));
    }
    std::fs::File::open(&path).map_err(|e| invalid(format!("is not readable: {e}")))?;
    if path.to_str().is_none() {
        return Err(invalid("has a path that is not valid UTF-8".into()));
    }
    Ok(path)
}

/// The concat demuxer decodes every entry with the first entry's stream
/// parameters, so all tracks of a playlist must share one container format.
fn ensure_single_format(tracks: &[MediaDescriptor]) -> Result<(), StreamError> {
    let format = |m: &MediaDescriptor| {
        Path::new(&m.filename)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    };
    let Some(first) = tracks.first() else {
        return Ok(());
    };
    let expected = format(first);
    match tracks.iter().find(|t| format(t) != expected) {
        Some(other) => Err(StreamError::InvalidComposition(format!(
            "playlist tracks must share one format, '{}' and '{}' differ",
            first.filename, other.filename
        ))),
        None => Ok(()),
    }
}

// Inputs always go through the file protocol, so a name is never parsed as
// an option or another protocol.
fn file_url(path: &Path) -> String {
    format!("file:{}", path.display())
}

fn concat_entry(path: &Path, media: &MediaDescriptor) -> Result<String, StreamError> {
    let s = path.to_string_lossy();
    if s.contains('\n') || s.contains('\r') {
        return Err(StreamError::InvalidComposition(format!(
            "audio '{}' has a line break in its path",
            media.filename
        )));
    }
    Ok(format!("file '{}'\n", s.replace('\'', r"'\''")))
}

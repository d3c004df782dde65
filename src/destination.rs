// --- Destination (RTMP ingest) ---------------------------------------------
//
// The stream key is a credential. It is only ever written into the argument
// vector handed to the transcoder; everything that reaches logs, events or the
// API goes through `redact_secret` / `redacted_target` first.

use serde::Serialize;

use crate::error::StreamError;

const REDACTED: &str = "****";

#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    base_url: String,
    key: String,
}

// Hand-written so a stray `{:?}` can't print the key.
impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("base_url", &self.base_url)
            .field("key", &REDACTED)
            .finish()
    }
}

impl Destination {
    pub fn new(base_url: &str, key: &str) -> Result<Self, StreamError> {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(StreamError::DestinationInvalid("server URL is empty".into()));
        }
        let parsed = url::Url::parse(base).map_err(|e| {
            StreamError::DestinationInvalid(format!("server URL is malformed: {e}"))
        })?;
        if parsed.scheme() != "rtmp" && parsed.scheme() != "rtmps" {
            return Err(StreamError::DestinationInvalid(format!(
                "unsupported scheme '{}', expected rtmp or rtmps",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(StreamError::DestinationInvalid("server URL has no host".into()));
        }

        let key = key.trim().trim_start_matches('/');
        if key.is_empty() {
            return Err(StreamError::DestinationInvalid("stream key is empty".into()));
        }
        // The key is one argv element, so spaces and shell characters are
        // harmless; line breaks would still corrupt logs and the RTMP request.
        if key.chars().any(char::is_control) {
            return Err(StreamError::DestinationInvalid(
                "stream key contains control characters".into(),
            ));
        }

        Ok(Self {
            base_url: base.to_string(),
            key: key.to_string(),
        })
    }

    /// Full ingest URL including the key. Only for the transcoder's argv.
    pub fn target(&self) -> String {
        format!("{}/{}", self.base_url, self.key)
    }

    pub fn redacted_target(&self) -> String {
        format!("{}/{}", self.base_url, REDACTED)
    }

    pub(crate) fn secret(&self) -> &str {
        &self.key
    }
}

pub(crate) fn redact_secret(line: &str, secret: &str) -> String {
    if secret.is_empty() {
        return line.to_string();
    }
    line.replace(secret, REDACTED)
}

#[derive(Clone, Debug, Serialize)]
pub struct DestinationPreset {
    pub name: &'static str,
    pub base_url: &'static str,
}

/// Ingest endpoints offered in the dashboard's platform picker.
pub fn presets() -> Vec<DestinationPreset> {
    vec![
        DestinationPreset { name: "YouTube", base_url: "rtmp://a.rtmp.youtube.com/live2/" },
        DestinationPreset { name: "Facebook", base_url: "rtmps://live-api-s.facebook.com:443/rtmp/" },
        DestinationPreset { name: "Twitch", base_url: "rtmp://live.twitch.tv/app/" },
        // TikTok hands out a per-broadcast server URL; the user completes it.
        DestinationPreset { name: "TikTok", base_url: "rtmp://" },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slashes_are_normalised() {
        let with = Destination::new("rtmp://a.rtmp.youtube.com/live2/", "abcd-1234").unwrap();
        let without = Destination::new("rtmp://a.rtmp.youtube.com/live2", "/abcd-1234").unwrap();
        assert_eq!(with.target(), "rtmp://a.rtmp.youtube.com/live2/abcd-1234");
        assert_eq!(with.target(), without.target());
    }

    #[test]
    fn rtmps_is_accepted() {
        let d = Destination::new("rtmps://live-api-s.facebook.com:443/rtmp/", "FB-1").unwrap();
        assert_eq!(d.target(), "rtmps://live-api-s.facebook.com:443/rtmp/FB-1");
    }

    #[test]
    fn rejects_bad_urls_and_keys() {
        for (url, key) in [
            ("", "key"),
            ("http://example.com/live", "key"),
            ("rtmp://", "key"),
            ("not a url", "key"),
            ("rtmp://live.twitch.tv/app", ""),
            ("rtmp://live.twitch.tv/app", "   "),
            ("rtmp://live.twitch.tv/app", "live\nkey"),
            ("rtmp://live.twitch.tv/app", "live\tkey"),
        ] {
            let err = Destination::new(url, key).unwrap_err();
            assert!(
                matches!(err, StreamError::DestinationInvalid(_)),
                "{url:?} / {key:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn key_with_spaces_and_shell_characters_is_kept_verbatim() {
        let d = Destination::new("rtmp://live.twitch.tv/app", "; rm -rf /").unwrap();
        assert_eq!(d.target(), "rtmp://live.twitch.tv/app/; rm -rf /");
        assert_eq!(d.redacted_target(), "rtmp://live.twitch.tv/app/****");
    }

    #[test]
    fn key_never_shows_in_debug_or_redacted_output() {
        let d = Destination::new("rtmp://live.twitch.tv/app", "live_secret_42").unwrap();
        assert!(!format!("{d:?}").contains("live_secret_42"));
        assert_eq!(d.redacted_target(), "rtmp://live.twitch.tv/app/****");
        assert_eq!(
            redact_secret("Error opening rtmp://live.twitch.tv/app/live_secret_42: I/O error", d.secret()),
            "Error opening rtmp://live.twitch.tv/app/****: I/O error"
        );
    }

    #[test]
    fn presets_include_the_main_platforms() {
        let names: Vec<_> = presets().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["YouTube", "Facebook", "Twitch", "TikTok"]);
    }
}

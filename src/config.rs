// Engine configuration.
//
// Everything is read from the environment once at start-up. Defaults are
// chosen so `cargo run` works from a checkout with ffmpeg on PATH.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::command::EncodingProfile;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    /// Where playlist manifests are written while a session runs.
    pub work_dir: PathBuf,
    pub ffmpeg: PathBuf,
    pub event_capacity: usize,
    pub stop_grace: Duration,
    pub diag_lines_per_sec: u32,
    pub max_upload_bytes: usize,
    pub profile: EncodingProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            db_path: PathBuf::from("./cloudstream.db"),
            upload_dir: PathBuf::from("./uploads"),
            work_dir: PathBuf::from("./run"),
            ffmpeg: PathBuf::from("ffmpeg"),
            event_capacity: 100,
            stop_grace: Duration::from_millis(5000),
            diag_lines_per_sec: 20,
            max_upload_bytes: 2048 * 1024 * 1024,
            profile: EncodingProfile::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup so tests don't have to
    /// mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("CLOUDSTREAM_BIND") {
            cfg.bind = v
                .parse()
                .with_context(|| format!("CLOUDSTREAM_BIND is not a socket address: {v}"))?;
        }
        if let Some(v) = lookup("CLOUDSTREAM_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLOUDSTREAM_UPLOAD_DIR") {
            cfg.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLOUDSTREAM_WORK_DIR") {
            cfg.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLOUDSTREAM_FFMPEG") {
            cfg.ffmpeg = PathBuf::from(v);
        }
        if let Some(v) = lookup("CLOUDSTREAM_EVENT_CAPACITY") {
            let n: usize = v
                .parse()
                .with_context(|| format!("CLOUDSTREAM_EVENT_CAPACITY is not a number: {v}"))?;
            anyhow::ensure!(n > 0, "CLOUDSTREAM_EVENT_CAPACITY must be at least 1");
            cfg.event_capacity = n;
        }
        if let Some(v) = lookup("CLOUDSTREAM_STOP_GRACE_MS") {
            let ms: u64 = v
                .parse()
                .with_context(|| format!("CLOUDSTREAM_STOP_GRACE_MS is not a number: {v}"))?;
            cfg.stop_grace = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("CLOUDSTREAM_DIAG_LINES_PER_SEC") {
            let n: u32 = v
                .parse()
                .with_context(|| format!("CLOUDSTREAM_DIAG_LINES_PER_SEC is not a number: {v}"))?;
            anyhow::ensure!(n > 0, "CLOUDSTREAM_DIAG_LINES_PER_SEC must be at least 1");
            cfg.diag_lines_per_sec = n;
        }
        if let Some(v) = lookup("CLOUDSTREAM_MAX_UPLOAD_MB") {
            let mb: usize = v
                .parse()
                .with_context(|| format!("CLOUDSTREAM_MAX_UPLOAD_MB is not a number: {v}"))?;
            cfg.max_upload_bytes = mb.saturating_mul(1024 * 1024);
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(cfg.event_capacity, 100);
        assert_eq!(cfg.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("CLOUDSTREAM_BIND", "0.0.0.0:8080"),
            ("CLOUDSTREAM_FFMPEG", "/usr/local/bin/ffmpeg"),
            ("CLOUDSTREAM_EVENT_CAPACITY", "250"),
            ("CLOUDSTREAM_STOP_GRACE_MS", "1500"),
            ("CLOUDSTREAM_MAX_UPLOAD_MB", "10"),
        ]))
        .unwrap();
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.ffmpeg, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(cfg.event_capacity, 250);
        assert_eq!(cfg.stop_grace, Duration::from_millis(1500));
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = EngineConfig::from_lookup(lookup_from(&[("CLOUDSTREAM_EVENT_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("CLOUDSTREAM_EVENT_CAPACITY"));

        let err = EngineConfig::from_lookup(lookup_from(&[("CLOUDSTREAM_EVENT_CAPACITY", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }
}

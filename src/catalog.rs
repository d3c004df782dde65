// --- Media catalog (SQLite) ------------------------------------------------
//
// Uploaded files live under `<upload_dir>/<owner>/`, their metadata in one
// `media` table. rusqlite is synchronous, so every query runs on the blocking
// pool via spawn_blocking.
//
// The session core only ever asks this module two things: what does an owner
// have, and where are the files behind a list of ids.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StreamError;
use crate::media::{MediaDescriptor, MediaId, MediaKind, OwnerId};

#[derive(Clone, Debug)]
pub struct MediaCatalog {
    db_path: PathBuf,
    upload_dir: PathBuf,
}

fn db_init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS media (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id   INTEGER NOT NULL,
            filename  TEXT NOT NULL,
            kind      TEXT NOT NULL,
            size      INTEGER NOT NULL,
            path      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_media_user ON media(user_id);
        "#,
    )?;
    Ok(())
}

fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<MediaDescriptor> {
    let kind: String = row.get(3)?;
    let kind = MediaKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown media kind '{kind}'").into(),
        )
    })?;
    Ok(MediaDescriptor {
        id: row.get(0)?,
        owner: OwnerId(row.get(1)?),
        filename: row.get(2)?,
        kind,
        size: row.get::<_, i64>(4)? as u64,
        path: PathBuf::from(row.get::<_, String>(5)?),
    })
}

fn db_list_media(conn: &Connection, owner: OwnerId) -> anyhow::Result<Vec<MediaDescriptor>> {
    db_init(conn)?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, filename, kind, size, path FROM media WHERE user_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![owner.0], row_to_descriptor)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn db_insert_media(
    conn: &Connection,
    owner: OwnerId,
    kind: MediaKind,
    filename: &str,
    size: u64,
    path: &Path,
) -> anyhow::Result<MediaId> {
    db_init(conn)?;
    conn.execute(
        "INSERT INTO media (user_id, filename, kind, size, path) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            owner.0,
            filename,
            kind.as_str(),
            size as i64,
            path.to_string_lossy().to_string()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn db_lookup_media(
    conn: &Connection,
    owner: OwnerId,
    ids: &[MediaId],
) -> Result<Vec<MediaDescriptor>, StreamError> {
    db_init(conn).context("initialising media table")?;
    let mut stmt = conn
        .prepare("SELECT id, user_id, filename, kind, size, path FROM media WHERE id = ?1")
        .context("preparing media lookup")?;

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let found = stmt
            .query_row(params![id], row_to_descriptor)
            .optional()
            .with_context(|| format!("looking up media {id}"))?;
        // Another tenant's file gets the same answer as a missing one.
        match found {
            Some(m) if m.owner == owner => out.push(m),
            _ => {
                return Err(StreamError::InvalidComposition(format!(
                    "media {id} not found"
                )))
            }
        }
    }
    Ok(out)
}

impl MediaCatalog {
    pub fn new(db_path: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            upload_dir: upload_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Creates the upload directory and the schema.
    pub async fn init(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .with_context(|| format!("creating upload dir {}", self.upload_dir.display()))?;
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating db dir {}", parent.display()))?;
        }
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = Connection::open(path)?;
            db_init(&conn)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn list_media(&self, owner: OwnerId) -> anyhow::Result<Vec<MediaDescriptor>> {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path)?;
            db_list_media(&conn, owner)
        })
        .await?
    }

    /// Descriptors for `ids`, in the order given. Every id has to exist and
    /// belong to `owner`.
    pub async fn lookup(
        &self,
        owner: OwnerId,
        ids: &[MediaId],
    ) -> Result<Vec<MediaDescriptor>, StreamError> {
        let path = self.db_path.clone();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(path).context("opening media catalog")?;
            db_lookup_media(&conn, owner, &ids)
        })
        .await
        .map_err(|e| StreamError::Catalog(anyhow::anyhow!("lookup task failed: {e}")))?
    }

    pub async fn store_media(
        &self,
        owner: OwnerId,
        kind: MediaKind,
        filename: &str,
        bytes: Bytes,
    ) -> Result<MediaDescriptor, StreamError> {
        if bytes.is_empty() {
            return Err(StreamError::InvalidUpload("file is empty".into()));
        }
        let clean = sanitize_filename(filename)
            .ok_or_else(|| StreamError::InvalidUpload(format!("unusable file name '{filename}'")))?;
        if !extension_matches(&clean, kind) {
            return Err(StreamError::InvalidUpload(format!(
                "'{clean}' does not look like a {kind} file"
            )));
        }

        let dir = self.upload_dir.join(owner.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        // Unique per upload, so equal names never share a file.
        let stored = dir.join(format!("{}-{clean}", Uuid::new_v4().simple()));
        let size = bytes.len() as u64;
        tokio::fs::write(&stored, &bytes)
            .await
            .with_context(|| format!("writing {}", stored.display()))?;

        let db_path = self.db_path.clone();
        let stored_for_db = stored.clone();
        let name_for_db = clean.clone();
        let inserted = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(db_path)?;
            db_insert_media(&conn, owner, kind, &name_for_db, size, &stored_for_db)
        })
        .await
        .map_err(|e| anyhow::anyhow!("insert task failed: {e}"))
        .and_then(|r| r);

        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                warn!(%owner, "failed to record upload, removing file: {e}");
                let _ = tokio::fs::remove_file(&stored).await;
                return Err(StreamError::Catalog(e));
            }
        };

        info!(%owner, media = id, %kind, size, "stored upload {clean}");
        Ok(MediaDescriptor {
            id,
            owner,
            kind,
            filename: clean,
            size,
            path: stored,
        })
    }
}

/// Keeps only the final path component and a conservative character set.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    let stem_len = cleaned.rsplit_once('.').map_or(cleaned.len(), |(stem, _)| stem.len());
    if cleaned.is_empty() || stem_len == 0 {
        return None;
    }
    Some(cleaned)
}

fn extension_matches(filename: &str, kind: MediaKind) -> bool {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    let allowed: &[&str] = match kind {
        MediaKind::Video => &["mp4", "mov", "mkv", "flv", "webm", "avi"],
        MediaKind::Audio => &["mp3", "wav", "aac", "m4a", "ogg", "flac"],
        MediaKind::Image => &["jpg", "jpeg", "png", "webp"],
    };
    allowed.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn catalog() -> (TempDir, MediaCatalog) {
        let dir = TempDir::new().unwrap();
        let catalog = MediaCatalog::new(dir.path().join("cloudstream.db"), dir.path().join("uploads"));
        catalog.init().await.unwrap();
        (dir, catalog)
    }

    #[tokio::test]
    async fn store_then_list_and_lookup_in_requested_order() {
        let (_dir, catalog) = catalog().await;
        let owner = OwnerId(1);
        let cover = catalog
            .store_media(owner, MediaKind::Image, "cover.png", Bytes::from_static(b"png"))
            .await
            .unwrap();
        let one = catalog
            .store_media(owner, MediaKind::Audio, "one.mp3", Bytes::from_static(b"id3"))
            .await
            .unwrap();
        let two = catalog
            .store_media(owner, MediaKind::Audio, "two.mp3", Bytes::from_static(b"id3"))
            .await
            .unwrap();

        assert!(cover.path.exists());
        assert!(cover.path.starts_with(catalog.upload_dir().join("1")));
        assert_eq!(cover.size, 3);

        let listed = catalog.list_media(owner).await.unwrap();
        assert_eq!(listed, vec![cover.clone(), one.clone(), two.clone()]);

        let picked = catalog.lookup(owner, &[two.id, cover.id, one.id]).await.unwrap();
        assert_eq!(picked, vec![two, cover, one]);
    }

    #[tokio::test]
    async fn lookup_refuses_other_owners_media() {
        let (_dir, catalog) = catalog().await;
        let theirs = catalog
            .store_media(OwnerId(2), MediaKind::Video, "clip.mp4", Bytes::from_static(b"mp4"))
            .await
            .unwrap();

        let err = catalog.lookup(OwnerId(1), &[theirs.id]).await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidComposition(_)));
        let err = catalog.lookup(OwnerId(1), &[9999]).await.unwrap_err();
        assert!(matches!(err, StreamError::InvalidComposition(_)));
        assert!(catalog.list_media(OwnerId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_are_validated() {
        let (_dir, catalog) = catalog().await;
        let owner = OwnerId(1);

        let empty = catalog
            .store_media(owner, MediaKind::Video, "clip.mp4", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(empty, StreamError::InvalidUpload(_)));

        let wrong_kind = catalog
            .store_media(owner, MediaKind::Image, "song.mp3", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(wrong_kind, StreamError::InvalidUpload(_)));

        let nameless = catalog
            .store_media(owner, MediaKind::Audio, "../.mp3", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(nameless, StreamError::InvalidUpload(_)));
    }

    #[tokio::test]
    async fn traversal_in_names_stays_in_the_owner_dir() {
        let (_dir, catalog) = catalog().await;
        let stored = catalog
            .store_media(OwnerId(3), MediaKind::Audio, "../../etc/my song.mp3", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(stored.filename, "my_song.mp3");
        assert_eq!(stored.path.parent().unwrap(), catalog.upload_dir().join("3"));
    }

    #[tokio::test]
    async fn same_name_uploads_keep_their_own_bytes() {
        let (_dir, catalog) = catalog().await;
        let owner = OwnerId(4);
        let (a, b) = tokio::join!(
            catalog.store_media(owner, MediaKind::Audio, "take.mp3", Bytes::from_static(b"first")),
            catalog.store_media(owner, MediaKind::Audio, "take.mp3", Bytes::from_static(b"second")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.path, b.path);
        assert_eq!(std::fs::read(&a.path).unwrap(), b"first");
        assert_eq!(std::fs::read(&b.path).unwrap(), b"second");
        assert_eq!(a.filename, b.filename);
    }

    #[test]
    fn sanitize_and_extension_rules() {
        assert_eq!(sanitize_filename("Intro Clip (final).MP4").as_deref(), Some("Intro_Clip_final.MP4"));
        assert_eq!(sanitize_filename("C:\\videos\\a.mov").as_deref(), Some("a.mov"));
        assert_eq!(sanitize_filename(".hidden").as_deref(), Some("hidden"));
        assert_eq!(sanitize_filename("///"), None);
        assert!(extension_matches("Intro_Clip_final.MP4", MediaKind::Video));
        assert!(!extension_matches("noext", MediaKind::Video));
    }
}

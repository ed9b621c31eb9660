/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha512_256};
use std::path::{Path, PathBuf};

/// Content-addressed file bodies in their own database file. Bodies are
/// keyed by a local short id; the hash column makes identical uploads
/// collapse to a single row.
#[derive(Clone)]
pub struct BlobStore {
    path: PathBuf,
}

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS filedata (
  xid TEXT,
  media TEXT,
  hash TEXT,
  content BLOB
);
CREATE INDEX IF NOT EXISTS idx_filedata_xid ON filedata(xid);
CREATE INDEX IF NOT EXISTS idx_filedata_hash ON filedata(hash);
"#;

pub fn hash_file_data(data: &[u8]) -> String {
    let mut h = Sha512_256::new();
    h.update(data);
    hex::encode(h.finalize())
}

fn extension_for(media: &str) -> &'static str {
    match media {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "application/pdf" => ".pdf",
        "text/plain" => ".txt",
        _ => "",
    }
}

impl BlobStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open blob db: {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("apply blob schema")?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("open blob db: {}", self.path.display()))
    }

    /// Store a body, returning its xid. Identical bytes return the existing
    /// xid without inserting a second row.
    pub fn save_file_body(&self, media: &str, data: &[u8]) -> Result<String> {
        let hash = hash_file_data(data);
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT xid FROM filedata WHERE hash = ?1",
                params![hash],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(xid) = existing {
            return Ok(xid);
        }
        let xid = format!("{}{}", crate::serialize::random_xid(), extension_for(media));
        conn.execute(
            "INSERT INTO filedata (xid, media, hash, content) VALUES (?1, ?2, ?3, ?4)",
            params![xid, media, hash, data],
        )?;
        Ok(xid)
    }

    pub fn get_file_body(&self, xid: &str) -> Result<Option<(String, Vec<u8>)>> {
        let conn = self.conn()?;
        let r = conn
            .query_row(
                "SELECT media, content FROM filedata WHERE xid = ?1",
                params![xid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bodies_share_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path().join("blob.db")).unwrap();
        let a = blobs.save_file_body("image/png", b"pixels").unwrap();
        let b = blobs.save_file_body("image/png", b"pixels").unwrap();
        assert_eq!(a, b);
        let c = blobs.save_file_body("image/png", b"other pixels").unwrap();
        assert_ne!(a, c);
        let conn = Connection::open(dir.path().join("blob.db")).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM filedata", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn bodies_round_trip_with_media_type() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path().join("blob.db")).unwrap();
        let xid = blobs.save_file_body("text/plain", b"note to self").unwrap();
        assert!(xid.ends_with(".txt"));
        let (media, body) = blobs.get_file_body(&xid).unwrap().unwrap();
        assert_eq!(media, "text/plain");
        assert_eq!(body, b"note to self");
    }
}

/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::warn;

/// The server user owns shared-inbox traffic and anonymous signed fetches.
pub const SERVER_UID: i64 = -2;

pub const FLAG_ACKED: i64 = 1;
pub const FLAG_SHARED: i64 = 2;
pub const FLAG_SAVED: i64 = 4;
pub const FLAG_UNTAGGED: i64 = 8;
pub const FLAG_REACTED: i64 = 16;

#[derive(Debug, Clone, Default)]
pub struct Activity {
    pub id: i64,
    pub userid: i64,
    /// honk|tonk|share|update|event|qonk|chatMessage|move|ack|react|deack|zonk
    pub what: String,
    pub author: String,
    /// Original author for shares, empty otherwise.
    pub oonker: String,
    pub xid: String,
    pub in_reply_to: String,
    pub date: Option<DateTime<Utc>>,
    pub url: String,
    /// Position 0 is the primary `to`.
    pub audience: Vec<String>,
    pub public: bool,
    pub text: String,
    pub precis: String,
    pub format: String,
    pub thread: String,
    /// 0 foreign, 1 foreign-mentions-me, 2 local public, 3 local private.
    pub whofore: i64,
    pub flags: i64,
    pub attachments: Vec<Attachment>,
    pub hashtags: Vec<String>,
    pub place: Option<Place>,
    pub time: Option<EventTime>,
    pub mentions: Vec<Mention>,
    pub reactions: Vec<Reaction>,
    pub guesses: String,
}

impl Activity {
    pub fn is_acked(&self) -> bool {
        self.flags & FLAG_ACKED != 0
    }
    pub fn is_shared(&self) -> bool {
        self.flags & FLAG_SHARED != 0
    }
    pub fn is_saved(&self) -> bool {
        self.flags & FLAG_SAVED != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attachment {
    pub file_id: i64,
    /// Local short id when we hold a copy in the blob store, else empty.
    pub xid: String,
    pub name: String,
    pub desc: String,
    pub url: String,
    pub media: String,
    pub local: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Place {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTime {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Seconds; 0 means unset.
    #[serde(default)]
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    pub who: String,
    pub href: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub who: String,
    pub what: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OldRevision {
    pub precis: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: i64,
    pub userid: i64,
    pub xid: String,
    pub who: String,
    pub target: String,
    pub date: Option<DateTime<Utc>>,
    pub text: String,
    pub format: String,
    pub attachments: Vec<Attachment>,
}

/// A row of the follows table. `flavor` tracks the relationship state:
/// dub/undub for them-following-us, presub/sub/unsub for us-following-them,
/// peep for watch-only entries.
#[derive(Debug, Clone)]
pub struct Follow {
    pub id: i64,
    pub userid: i64,
    pub name: String,
    pub xid: String,
    pub flavor: String,
    pub owner: String,
    pub folxid: String,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub display: String,
    pub about: String,
    /// Filled by the engine from server settings.
    pub url: String,
    pub pubkey_pem: String,
    pub seckey_pem: String,
    pub options: UserOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActorBoxes {
    pub inbox: String,
    pub outbox: String,
    pub shared: String,
}

#[derive(Debug, Clone)]
pub struct Resubmission {
    pub id: i64,
    pub due: Option<DateTime<Utc>>,
}

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS activities (
  activityid INTEGER PRIMARY KEY,
  userid INTEGER,
  what TEXT,
  author TEXT,
  oonker TEXT,
  xid TEXT,
  inReplyToID TEXT,
  dt TEXT,
  url TEXT,
  audience TEXT,
  text TEXT,
  precis TEXT,
  format TEXT,
  thread TEXT,
  whofore INTEGER,
  flags INTEGER
);
CREATE INDEX IF NOT EXISTS idx_activities_xid ON activities(xid);
CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_user_xid ON activities(userid, xid);
CREATE INDEX IF NOT EXISTS idx_activities_thread ON activities(thread);
CREATE INDEX IF NOT EXISTS idx_activities_author ON activities(author);

CREATE TABLE IF NOT EXISTS chatMessages (
  chatid INTEGER PRIMARY KEY,
  userid INTEGER,
  xid TEXT,
  who TEXT,
  target TEXT,
  dt TEXT,
  text TEXT,
  format TEXT
);

CREATE TABLE IF NOT EXISTS attachments (
  activityid INTEGER,
  chatid INTEGER,
  fileid INTEGER
);
CREATE INDEX IF NOT EXISTS idx_attachments_activity ON attachments(activityid);
CREATE INDEX IF NOT EXISTS idx_attachments_chat ON attachments(chatid);

CREATE TABLE IF NOT EXISTS filemeta (
  fileid INTEGER PRIMARY KEY,
  xid TEXT,
  name TEXT,
  description TEXT,
  url TEXT,
  media TEXT,
  local INTEGER
);
CREATE INDEX IF NOT EXISTS idx_filemeta_xid ON filemeta(xid);
CREATE INDEX IF NOT EXISTS idx_filemeta_url ON filemeta(url);

CREATE TABLE IF NOT EXISTS hashtags (
  tag TEXT,
  activityid INTEGER
);
CREATE INDEX IF NOT EXISTS idx_hashtags_tag ON hashtags(tag);
CREATE INDEX IF NOT EXISTS idx_hashtags_activity ON hashtags(activityid);

CREATE TABLE IF NOT EXISTS meta (
  activityid INTEGER,
  genus TEXT,
  json TEXT
);
CREATE INDEX IF NOT EXISTS idx_meta_activity ON meta(activityid);

CREATE TABLE IF NOT EXISTS follows (
  followid INTEGER PRIMARY KEY,
  userid INTEGER,
  name TEXT,
  xid TEXT,
  flavor TEXT,
  owner TEXT,
  folxid TEXT
);
CREATE INDEX IF NOT EXISTS idx_follows_xid ON follows(xid);

CREATE TABLE IF NOT EXISTS actorBoxes (
  ident TEXT PRIMARY KEY,
  insertedAt TEXT,
  inbox TEXT,
  outbox TEXT,
  sharedInbox TEXT
);

CREATE TABLE IF NOT EXISTS actorPubKeys (
  keyid TEXT PRIMARY KEY,
  insertedAt TEXT,
  pubkey TEXT
);

CREATE TABLE IF NOT EXISTS friendlyNames (
  acct TEXT PRIMARY KEY,
  href TEXT
);

CREATE TABLE IF NOT EXISTS preferredUsernames (
  ident TEXT PRIMARY KEY,
  username TEXT
);

CREATE TABLE IF NOT EXISTS actions (
  actionid INTEGER PRIMARY KEY,
  userid INTEGER,
  object TEXT,
  action TEXT
);
CREATE INDEX IF NOT EXISTS idx_actions_object ON actions(object);

CREATE TABLE IF NOT EXISTS resubmissions (
  resubmissionid INTEGER PRIMARY KEY,
  dt TEXT,
  tries INTEGER,
  userid INTEGER,
  rcpt TEXT,
  msg BLOB
);

CREATE TABLE IF NOT EXISTS hfcs (
  hfcsid INTEGER PRIMARY KEY,
  userid INTEGER,
  json TEXT
);
CREATE INDEX IF NOT EXISTS idx_hfcs_user ON hfcs(userid);

CREATE TABLE IF NOT EXISTS tracks (
  xid TEXT,
  fetches TEXT
);
CREATE INDEX IF NOT EXISTS idx_tracks_xid ON tracks(xid);

CREATE TABLE IF NOT EXISTS config (
  key TEXT,
  value TEXT
);

CREATE TABLE IF NOT EXISTS users (
  userid INTEGER PRIMARY KEY,
  username TEXT,
  hash TEXT,
  displayname TEXT,
  about TEXT,
  pubkey TEXT,
  seckey TEXT,
  options TEXT
);
CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

CREATE TABLE IF NOT EXISTS auth (
  authid INTEGER PRIMARY KEY,
  userid INTEGER,
  hash TEXT,
  expiry TEXT
);
CREATE INDEX IF NOT EXISTS idx_auth_userid ON auth(userid);
CREATE INDEX IF NOT EXISTS idx_auth_hash ON auth(hash);
"#;

/// Handle on the primary database. Cheap to clone; every method opens its
/// own connection against the WAL file, transactions span one connection.
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    reaction_lock: Arc<Mutex<()>>,
}

pub fn db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn join_audience(audience: &[String]) -> String {
    audience.join(" ")
}

fn split_audience(s: &str) -> Vec<String> {
    s.split(' ')
        .filter(|a| !a.is_empty())
        .map(|a| a.to_string())
        .collect()
}

pub fn audience_is_public(audience: &[String]) -> bool {
    audience.iter().any(|a| a == crate::PUBLIC_IRI)
}

/// Dedup preserving order; empties dropped.
pub fn dedupe_strings(a: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    seen.insert(String::new());
    let mut out = Vec::with_capacity(a.len());
    for s in a {
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

const SELECT_ACTIVITY: &str = "SELECT activityid, userid, what, author, oonker, xid, inReplyToID, dt, url, audience, text, precis, format, thread, whofore, flags FROM activities ";

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            path,
            reaction_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("open db: {}", self.path.display()))
    }

    // ------------------------------------------------------------------
    // config

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let v = conn
            .query_row("SELECT value FROM config WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(v)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM config WHERE key = ?1", params![key])?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // users

    pub fn create_user(
        &self,
        name: &str,
        display: &str,
        about: &str,
        hash: &str,
        pubkey_pem: &str,
        seckey_pem: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, displayname, about, hash, pubkey, seckey, options) VALUES (?1, ?2, ?3, ?4, ?5, ?6, '{}')",
            params![name, display, about, hash, pubkey_pem, seckey_pem],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_server_user(&self, pubkey_pem: &str, seckey_pem: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (userid, username, displayname, about, hash, pubkey, seckey, options) VALUES (?1, 'server', 'server', 'server', '*', ?2, ?3, '{}')",
            params![SERVER_UID, pubkey_pem, seckey_pem],
        )?;
        Ok(())
    }

    fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        let options_json: String = row.get(5)?;
        let options = serde_json::from_str(&options_json).unwrap_or_default();
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            display: row.get(2)?,
            about: row.get(3)?,
            url: String::new(),
            pubkey_pem: row.get(4)?,
            seckey_pem: row.get(6)?,
            options,
        })
    }

    pub fn user_by_name(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let u = conn
            .query_row(
                "SELECT userid, username, displayname, about, pubkey, options, seckey FROM users WHERE username = ?1",
                params![name],
                Self::user_from_row,
            )
            .optional()?;
        Ok(u)
    }

    pub fn user_by_id(&self, userid: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let u = conn
            .query_row(
                "SELECT userid, username, displayname, about, pubkey, options, seckey FROM users WHERE userid = ?1",
                params![userid],
                Self::user_from_row,
            )
            .optional()?;
        Ok(u)
    }

    // ------------------------------------------------------------------
    // activities

    fn activity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
        let dt: String = row.get(7)?;
        let aud: String = row.get(9)?;
        let audience = split_audience(&aud);
        let public = audience_is_public(&audience);
        Ok(Activity {
            id: row.get(0)?,
            userid: row.get(1)?,
            what: row.get(2)?,
            author: row.get(3)?,
            oonker: row.get(4)?,
            xid: row.get(5)?,
            in_reply_to: row.get(6)?,
            date: parse_db_time(&dt),
            url: row.get(8)?,
            audience,
            public,
            text: row.get(10)?,
            precis: row.get(11)?,
            format: row.get(12)?,
            thread: row.get(13)?,
            whofore: row.get(14)?,
            flags: row.get(15)?,
            ..Default::default()
        })
    }

    pub fn find_activity_id(&self, userid: i64, xid: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT activityid FROM activities WHERE userid = ?1 AND xid = ?2",
                params![userid, xid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn get_activity(&self, userid: i64, xid: &str) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        let act = conn
            .query_row(
                &format!("{SELECT_ACTIVITY} WHERE userid = ?1 AND xid = ?2"),
                params![userid, xid],
                Self::activity_from_row,
            )
            .optional()?;
        Ok(self.hydrate_one(&conn, act))
    }

    /// Any user's copy of an object, oldest row first. Used when rendering
    /// public single-object documents.
    pub fn get_any_activity(&self, xid: &str) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        let act = conn
            .query_row(
                &format!("{SELECT_ACTIVITY} WHERE xid = ?1 ORDER BY activityid ASC LIMIT 1"),
                params![xid],
                Self::activity_from_row,
            )
            .optional()?;
        Ok(self.hydrate_one(&conn, act))
    }

    pub fn get_share(&self, userid: i64, xid: &str) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        let act = conn
            .query_row(
                &format!("{SELECT_ACTIVITY} WHERE userid = ?1 AND xid = ?2 AND what = 'share' AND whofore = 2"),
                params![userid, xid],
                Self::activity_from_row,
            )
            .optional()?;
        Ok(self.hydrate_one(&conn, act))
    }

    fn hydrate_one(&self, conn: &Connection, act: Option<Activity>) -> Option<Activity> {
        let mut act = act?;
        if let Err(e) = Self::load_side_tables(conn, std::slice::from_mut(&mut act)) {
            warn!("error loading side tables: {e:#}");
        }
        Some(act)
    }

    fn query_activities(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Activity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::activity_from_row(row)?);
        }
        drop(rows);
        drop(stmt);
        Self::load_side_tables(&conn, &mut out)?;
        Ok(out)
    }

    /// Authored activities for the outbox: public only, newest first.
    pub fn activities_by_user(&self, userid: i64, since: &str, limit: i64) -> Result<Vec<Activity>> {
        self.query_activities(
            &format!("{SELECT_ACTIVITY} WHERE userid = ?1 AND whofore = 2 AND dt > ?2 ORDER BY activityid DESC LIMIT ?3"),
            &[&userid, &since, &limit],
        )
    }

    pub fn activities_by_thread(&self, userid: i64, thread: &str) -> Result<Vec<Activity>> {
        self.query_activities(
            &format!("{SELECT_ACTIVITY} WHERE (userid = ?1 OR whofore = 2) AND thread = ?2 ORDER BY activityid DESC LIMIT 250"),
            &[&userid, &thread],
        )
    }

    /// Public activities carrying a hashtag, for the tag collection endpoint.
    pub fn activities_by_hashtag(&self, tag: &str) -> Result<Vec<Activity>> {
        self.query_activities(
            &format!("SELECT activities.activityid, userid, what, author, oonker, xid, inReplyToID, dt, url, audience, text, precis, format, thread, whofore, flags FROM activities JOIN hashtags ON activities.activityid = hashtags.activityid WHERE hashtags.tag = ?1 AND whofore = 2 ORDER BY activities.activityid DESC LIMIT 100"),
            &[&tag],
        )
    }

    fn load_side_tables(conn: &Connection, acts: &mut [Activity]) -> Result<()> {
        if acts.is_empty() {
            return Ok(());
        }
        let mut by_id: HashMap<i64, usize> = HashMap::new();
        let idset = acts
            .iter()
            .enumerate()
            .map(|(i, a)| {
                by_id.insert(a.id, i);
                a.id.to_string()
            })
            .collect::<Vec<_>>()
            .join(",");

        let q = format!("SELECT activityid, attachments.fileid, xid, name, description, url, media, local FROM attachments JOIN filemeta ON attachments.fileid = filemeta.fileid WHERE activityid IN ({idset})");
        let mut stmt = conn.prepare(&q)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let hid: i64 = row.get(0)?;
            let att = Attachment {
                file_id: row.get(1)?,
                xid: row.get(2)?,
                name: row.get(3)?,
                desc: row.get(4)?,
                url: row.get(5)?,
                media: row.get(6)?,
                local: row.get::<_, i64>(7)? != 0,
            };
            if let Some(&i) = by_id.get(&hid) {
                acts[i].attachments.push(att);
            }
        }
        drop(rows);
        drop(stmt);

        let q = format!("SELECT activityid, tag FROM hashtags WHERE activityid IN ({idset})");
        let mut stmt = conn.prepare(&q)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let hid: i64 = row.get(0)?;
            let tag: String = row.get(1)?;
            if let Some(&i) = by_id.get(&hid) {
                acts[i].hashtags.push(tag);
            }
        }
        drop(rows);
        drop(stmt);

        let q = format!("SELECT activityid, genus, json FROM meta WHERE activityid IN ({idset})");
        let mut stmt = conn.prepare(&q)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let hid: i64 = row.get(0)?;
            let genus: String = row.get(1)?;
            let j: String = row.get(2)?;
            let Some(&i) = by_id.get(&hid) else { continue };
            let a = &mut acts[i];
            match genus.as_str() {
                "place" => a.place = serde_json::from_str(&j).ok(),
                "time" => a.time = serde_json::from_str(&j).ok(),
                "mentions" => a.mentions = serde_json::from_str(&j).unwrap_or_default(),
                "reactions" => a.reactions = serde_json::from_str(&j).unwrap_or_default(),
                "guesses" => a.guesses = j,
                "oldrev" => {}
                other => warn!("unknown meta genus: {other}"),
            }
        }
        Ok(())
    }

    pub fn save_activity(&self, act: &mut Activity) -> Result<()> {
        let dt = act.date.as_ref().map(db_time).unwrap_or_default();
        let aud = join_audience(&act.audience);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO activities (userid, what, author, oonker, xid, inReplyToID, dt, url, audience, text, precis, format, thread, whofore, flags) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                act.userid, act.what, act.author, act.oonker, act.xid, act.in_reply_to, dt,
                act.url, aud, act.text, act.precis, act.format, act.thread, act.whofore, act.flags
            ],
        )?;
        act.id = tx.last_insert_rowid();
        Self::save_extras(&tx, act)?;
        tx.commit()?;
        Ok(())
    }

    /// Update in place; the previous text/precis moves into an oldrev meta
    /// row and side tables (except oldrev) are rebuilt.
    pub fn update_activity(&self, act: &mut Activity) -> Result<()> {
        let Some(old) = self.get_activity(act.userid, &act.xid)? else {
            anyhow::bail!("no prior version of {}", act.xid);
        };
        act.id = old.id;
        let oldrev = OldRevision {
            precis: old.precis,
            text: old.text,
        };
        let dt = act.date.as_ref().map(db_time).unwrap_or_default();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::delete_extras(&tx, act.id, false)?;
        tx.execute(
            "UPDATE activities SET precis = ?1, text = ?2, format = ?3, whofore = ?4, dt = ?5 WHERE activityid = ?6",
            params![act.precis, act.text, act.format, act.whofore, dt, act.id],
        )?;
        Self::save_extras(&tx, act)?;
        tx.execute(
            "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'oldrev', ?2)",
            params![act.id, serde_json::to_string(&oldrev)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_activity(&self, activityid: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::delete_extras(&tx, activityid, true)?;
        tx.execute(
            "DELETE FROM activities WHERE activityid = ?1",
            params![activityid],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn save_extras(tx: &rusqlite::Transaction<'_>, act: &Activity) -> Result<()> {
        for d in &act.attachments {
            tx.execute(
                "INSERT INTO attachments (activityid, chatid, fileid) VALUES (?1, -1, ?2)",
                params![act.id, d.file_id],
            )?;
        }
        for tag in &act.hashtags {
            tx.execute(
                "INSERT INTO hashtags (tag, activityid) VALUES (?1, ?2)",
                params![tag.to_lowercase(), act.id],
            )?;
        }
        if let Some(p) = &act.place {
            tx.execute(
                "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'place', ?2)",
                params![act.id, serde_json::to_string(p)?],
            )?;
        }
        if let Some(t) = &act.time {
            tx.execute(
                "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'time', ?2)",
                params![act.id, serde_json::to_string(t)?],
            )?;
        }
        if !act.mentions.is_empty() {
            tx.execute(
                "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'mentions', ?2)",
                params![act.id, serde_json::to_string(&act.mentions)?],
            )?;
        }
        if !act.guesses.is_empty() {
            tx.execute(
                "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'guesses', ?2)",
                params![act.id, act.guesses],
            )?;
        }
        Ok(())
    }

    fn delete_extras(tx: &rusqlite::Transaction<'_>, activityid: i64, everything: bool) -> Result<()> {
        tx.execute(
            "DELETE FROM attachments WHERE activityid = ?1",
            params![activityid],
        )?;
        tx.execute(
            "DELETE FROM hashtags WHERE activityid = ?1",
            params![activityid],
        )?;
        if everything {
            tx.execute("DELETE FROM meta WHERE activityid = ?1", params![activityid])?;
        } else {
            tx.execute(
                "DELETE FROM meta WHERE activityid = ?1 AND genus NOT IN ('oldrev')",
                params![activityid],
            )?;
        }
        Ok(())
    }

    pub fn set_flags(&self, activityid: i64, flags: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activities SET flags = flags | ?1 WHERE activityid = ?2",
            params![flags, activityid],
        )?;
        Ok(())
    }

    pub fn clear_flags(&self, activityid: i64, flags: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE activities SET flags = flags & ~ ?1 WHERE activityid = ?2",
            params![flags, activityid],
        )?;
        Ok(())
    }

    /// Read-modify-write of the reactions meta row, serialized process-wide.
    pub fn add_reaction(&self, userid: i64, xid: &str, who: &str, what: &str) -> Result<()> {
        let _guard = self.reaction_lock.lock().unwrap_or_else(|e| e.into_inner());
        let Some(act) = self.get_activity(userid, xid)? else {
            return Ok(());
        };
        let mut reactions = act.reactions;
        reactions.push(Reaction {
            who: who.to_string(),
            what: what.to_string(),
        });
        let j = serde_json::to_string(&reactions)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM meta WHERE activityid = ?1 AND genus = 'reactions'",
            params![act.id],
        )?;
        tx.execute(
            "INSERT INTO meta (activityid, genus, json) VALUES (?1, 'reactions', ?2)",
            params![act.id, j],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // chat messages

    pub fn save_chat_message(&self, ch: &mut ChatMessage) -> Result<()> {
        let dt = ch.date.as_ref().map(db_time).unwrap_or_default();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chatMessages (userid, xid, who, target, dt, text, format) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![ch.userid, ch.xid, ch.who, ch.target, dt, ch.text, ch.format],
        )?;
        ch.id = tx.last_insert_rowid();
        for d in &ch.attachments {
            tx.execute(
                "INSERT INTO attachments (activityid, chatid, fileid) VALUES (-1, ?1, ?2)",
                params![ch.id, d.file_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // attachment metadata

    pub fn save_file_metadata(
        &self,
        xid: &str,
        name: &str,
        desc: &str,
        url: &str,
        media: &str,
        local: bool,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO filemeta (xid, name, description, url, media, local) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![xid, name, desc, url, media, local as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_attachment_by_url(&self, url: &str) -> Result<Option<Attachment>> {
        let conn = self.conn()?;
        let att = conn
            .query_row(
                "SELECT fileid, xid, name, description, url, media, local FROM filemeta WHERE url = ?1 AND local = 1",
                params![url],
                |row| {
                    Ok(Attachment {
                        file_id: row.get(0)?,
                        xid: row.get(1)?,
                        name: row.get(2)?,
                        desc: row.get(3)?,
                        url: row.get(4)?,
                        media: row.get(5)?,
                        local: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(att)
    }

    // ------------------------------------------------------------------
    // actor material

    pub fn get_boxes(&self, ident: &str) -> Result<Option<ActorBoxes>> {
        let conn = self.conn()?;
        let b = conn
            .query_row(
                "SELECT inbox, outbox, sharedInbox FROM actorBoxes WHERE ident = ?1",
                params![ident],
                |row| {
                    Ok(ActorBoxes {
                        inbox: row.get(0)?,
                        outbox: row.get(1)?,
                        shared: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(b)
    }

    pub fn set_boxes(&self, ident: &str, inbox: &str, outbox: &str, shared: &str) -> Result<()> {
        let conn = self.conn()?;
        let when = db_time(&Utc::now());
        conn.execute(
            "INSERT OR REPLACE INTO actorBoxes (ident, insertedAt, inbox, outbox, sharedInbox) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ident, when, inbox, outbox, shared],
        )?;
        Ok(())
    }

    pub fn get_pubkey(&self, keyid: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let k = conn
            .query_row(
                "SELECT pubkey FROM actorPubKeys WHERE keyid = ?1",
                params![keyid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(k)
    }

    pub fn set_pubkey(&self, keyid: &str, pem: &str) -> Result<()> {
        let conn = self.conn()?;
        let when = db_time(&Utc::now());
        conn.execute(
            "INSERT OR REPLACE INTO actorPubKeys (keyid, insertedAt, pubkey) VALUES (?1, ?2, ?3)",
            params![keyid, when, pem],
        )?;
        Ok(())
    }

    /// Drop a key only when it has been around a while; fresh keys survive
    /// so a verification miss cannot evict what was just fetched.
    pub fn delete_old_pubkey(&self, keyid: &str, older_than: &DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM actorPubKeys WHERE keyid = ?1 AND insertedAt < ?2",
            params![keyid, db_time(older_than)],
        )?;
        Ok(())
    }

    pub fn get_friendly_name(&self, acct: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let href = conn
            .query_row(
                "SELECT href FROM friendlyNames WHERE acct = ?1",
                params![acct],
                |r| r.get(0),
            )
            .optional()?;
        Ok(href)
    }

    pub fn set_friendly_name(&self, acct: &str, href: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO friendlyNames (acct, href) VALUES (?1, ?2)",
            params![acct, href],
        )?;
        Ok(())
    }

    pub fn get_preferred_username(&self, ident: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let u = conn
            .query_row(
                "SELECT username FROM preferredUsernames WHERE ident = ?1",
                params![ident],
                |r| r.get(0),
            )
            .optional()?;
        Ok(u)
    }

    pub fn set_preferred_username(&self, ident: &str, username: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO preferredUsernames (ident, username) VALUES (?1, ?2)",
            params![ident, username],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // follows

    fn follow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Follow> {
        Ok(Follow {
            id: row.get(0)?,
            userid: row.get(1)?,
            name: row.get(2)?,
            xid: row.get(3)?,
            flavor: row.get(4)?,
            owner: row.get(5)?,
            folxid: row.get(6)?,
        })
    }

    pub fn save_follow(
        &self,
        userid: i64,
        name: &str,
        xid: &str,
        flavor: &str,
        owner: &str,
        folxid: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO follows (userid, name, xid, flavor, owner, folxid) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![userid, name, xid, flavor, owner, folxid],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_follow_flavor(
        &self,
        new_flavor: &str,
        folxid: &str,
        userid: i64,
        name: &str,
        xid: &str,
        old_flavor: &str,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE follows SET flavor = ?1, folxid = ?2 WHERE userid = ?3 AND name = ?4 AND xid = ?5 AND flavor = ?6",
            params![new_flavor, folxid, userid, name, xid, old_flavor],
        )?;
        Ok(n)
    }

    fn query_follows(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Follow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::follow_from_row(row)?);
        }
        Ok(out)
    }

    /// Followers of the user, i.e. rows with flavor dub.
    pub fn followers(&self, userid: i64) -> Result<Vec<Follow>> {
        self.query_follows(
            "SELECT followid, userid, name, xid, flavor, owner, folxid FROM follows WHERE userid = ?1 AND flavor = 'dub'",
            &[&userid],
        )
    }

    /// Followers registered under a given name (hashtag follows on the
    /// server user use the tag as the name).
    pub fn named_followers(&self, userid: i64, name: &str) -> Result<Vec<Follow>> {
        self.query_follows(
            "SELECT followid, userid, name, xid, flavor, owner, folxid FROM follows WHERE userid = ?1 AND name = ?2 AND flavor = 'dub'",
            &[&userid, &name],
        )
    }

    pub fn find_follow(&self, userid: i64, xid: &str, flavors: &[&str]) -> Result<Option<Follow>> {
        let flav = flavors
            .iter()
            .map(|f| format!("'{f}'"))
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn()?;
        let f = conn
            .query_row(
                &format!("SELECT followid, userid, name, xid, flavor, owner, folxid FROM follows WHERE userid = ?1 AND xid = ?2 AND flavor IN ({flav})"),
                params![userid, xid],
                Self::follow_from_row,
            )
            .optional()?;
        Ok(f)
    }

    pub fn find_follow_by_folxid(&self, userid: i64, folxid: &str) -> Result<Option<Follow>> {
        let conn = self.conn()?;
        let f = conn
            .query_row(
                "SELECT followid, userid, name, xid, flavor, owner, folxid FROM follows WHERE userid = ?1 AND folxid = ?2 AND flavor IN ('dub', 'undub')",
                params![userid, folxid],
                Self::follow_from_row,
            )
            .optional()?;
        Ok(f)
    }

    pub fn purge_host_followers(&self, hostname: &str) -> Result<()> {
        let conn = self.conn()?;
        let pattern = format!("%https://{hostname}/%");
        conn.execute(
            "DELETE FROM follows WHERE xid LIKE ?1 AND flavor = 'dub'",
            params![pattern],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // action log

    pub fn save_action(&self, userid: i64, object: &str, action: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO actions (userid, object, action) VALUES (?1, ?2, ?3)",
            params![userid, object, action],
        )?;
        Ok(())
    }

    pub fn is_zonked(&self, userid: i64, xid: &str) -> Result<bool> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT actionid FROM actions WHERE userid = ?1 AND object = ?2 AND action = 'zonk'",
                params![userid, xid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    pub fn is_thread_muted(&self, userid: i64, thread: &str) -> Result<bool> {
        let conn = self.conn()?;
        let id: Option<i64> = conn
            .query_row(
                "SELECT actionid FROM actions WHERE userid = ?1 AND object = ?2 AND action = 'mute-thread'",
                params![userid, thread],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    // ------------------------------------------------------------------
    // filter rules

    pub fn filters_json(&self, userid: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT json FROM hfcs WHERE userid = ?1")?;
        let mut rows = stmt.query(params![userid])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    pub fn save_filter(&self, userid: i64, json: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hfcs (userid, json) VALUES (?1, ?2)",
            params![userid, json],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // delivery queue

    pub fn add_resubmission(
        &self,
        due: &DateTime<Utc>,
        tries: i64,
        userid: i64,
        rcpt: &str,
        msg: &[u8],
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO resubmissions (dt, tries, userid, rcpt, msg) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![db_time(due), tries, userid, rcpt, msg],
        )?;
        Ok(())
    }

    pub fn resubmission_times(&self) -> Result<Vec<Resubmission>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT resubmissionid, dt FROM resubmissions")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let dt: String = row.get(1)?;
            out.push(Resubmission {
                id: row.get(0)?,
                due: parse_db_time(&dt),
            });
        }
        Ok(out)
    }

    pub fn load_resubmission(&self, id: i64) -> Result<Option<(i64, i64, String, Vec<u8>)>> {
        let conn = self.conn()?;
        let r = conn
            .query_row(
                "SELECT tries, userid, rcpt, msg FROM resubmissions WHERE resubmissionid = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(r)
    }

    pub fn delete_resubmission(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM resubmissions WHERE resubmissionid = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Purge everything queued for a host that is considered dead.
    pub fn purge_host_resubmissions(&self, hostname: &str) -> Result<()> {
        let conn = self.conn()?;
        let pattern = format!("%https://{hostname}/%");
        conn.execute(
            "DELETE FROM resubmissions WHERE rcpt LIKE ?1",
            params![pattern],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // fetch-back tracks

    pub fn get_tracks(&self, xid: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let t = conn
            .query_row(
                "SELECT fetches FROM tracks WHERE xid = ?1",
                params![xid],
                |r| r.get(0),
            )
            .optional()?;
        Ok(t)
    }

    pub fn merge_tracks(&self, tracks: &HashMap<String, Vec<String>>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (xid, who) in tracks {
            let prev: Option<String> = tx
                .query_row(
                    "SELECT fetches FROM tracks WHERE xid = ?1",
                    params![xid],
                    |r| r.get(0),
                )
                .optional()?;
            match prev {
                None => {
                    let f = dedupe_strings(who.clone()).join(" ");
                    tx.execute(
                        "INSERT INTO tracks (xid, fetches) VALUES (?1, ?2)",
                        params![xid, f],
                    )?;
                }
                Some(prev) => {
                    let mut all: Vec<String> =
                        prev.split(' ').map(|s| s.to_string()).collect();
                    all.extend(who.iter().cloned());
                    let f = dedupe_strings(all).join(" ");
                    tx.execute(
                        "UPDATE tracks SET fetches = ?1 WHERE xid = ?2",
                        params![f, xid],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gander.db")).unwrap();
        (dir, store)
    }

    fn sample_activity() -> Activity {
        Activity {
            userid: 1,
            what: "honk".to_string(),
            author: "https://ex.example/u/bob".to_string(),
            xid: "https://ex.example/n/1".to_string(),
            date: Some(Utc::now()),
            audience: vec![
                crate::PUBLIC_IRI.to_string(),
                "https://ex.example/u/bob/followers".to_string(),
            ],
            public: true,
            text: "<p>hello there".to_string(),
            format: "html".to_string(),
            thread: "data:,missing-abc".to_string(),
            whofore: 0,
            hashtags: vec!["#geese".to_string()],
            mentions: vec![Mention {
                who: "@alice".to_string(),
                href: "https://gander.example/u/alice".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let (_dir, store) = test_store();
        let mut act = sample_activity();
        store.save_activity(&mut act).unwrap();
        assert!(act.id > 0);

        let got = store.get_activity(1, &act.xid).unwrap().unwrap();
        assert_eq!(got.text, act.text);
        assert_eq!(got.audience, act.audience);
        assert_eq!(got.audience[0], crate::PUBLIC_IRI);
        assert!(got.public);
        assert_eq!(got.hashtags, vec!["#geese".to_string()]);
        assert_eq!(got.mentions.len(), 1);
        assert_eq!(got.mentions[0].href, "https://gander.example/u/alice");
    }

    #[test]
    fn update_keeps_id_and_records_oldrev() {
        let (_dir, store) = test_store();
        let mut act = sample_activity();
        store.save_activity(&mut act).unwrap();
        let first_id = act.id;

        let mut updated = act.clone();
        updated.text = "<p>revised".to_string();
        updated.hashtags = vec![];
        store.update_activity(&mut updated).unwrap();
        assert_eq!(updated.id, first_id);

        let got = store.get_activity(1, &act.xid).unwrap().unwrap();
        assert_eq!(got.text, "<p>revised");
        assert!(got.hashtags.is_empty());

        let conn = Connection::open(store.path()).unwrap();
        let oldrev: String = conn
            .query_row(
                "SELECT json FROM meta WHERE activityid = ?1 AND genus = 'oldrev'",
                params![first_id],
                |r| r.get(0),
            )
            .unwrap();
        let old: OldRevision = serde_json::from_str(&oldrev).unwrap();
        assert_eq!(old.text, "<p>hello there");
    }

    #[test]
    fn delete_removes_side_tables() {
        let (_dir, store) = test_store();
        let mut act = sample_activity();
        store.save_activity(&mut act).unwrap();
        store.delete_activity(act.id).unwrap();
        assert!(store.get_activity(1, &act.xid).unwrap().is_none());
        let conn = Connection::open(store.path()).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM hashtags WHERE activityid = ?1",
                params![act.id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn zonk_action_suppresses() {
        let (_dir, store) = test_store();
        store.save_action(1, "https://ex.example/n/9", "zonk").unwrap();
        assert!(store.is_zonked(1, "https://ex.example/n/9").unwrap());
        assert!(!store.is_zonked(1, "https://ex.example/n/8").unwrap());
        assert!(!store.is_zonked(2, "https://ex.example/n/9").unwrap());
    }

    #[test]
    fn reactions_accumulate() {
        let (_dir, store) = test_store();
        let mut act = sample_activity();
        store.save_activity(&mut act).unwrap();
        store
            .add_reaction(1, &act.xid, "https://ex.example/u/carol", "🎉")
            .unwrap();
        store
            .add_reaction(1, &act.xid, "https://ex.example/u/dave", "🎉")
            .unwrap();
        let got = store.get_activity(1, &act.xid).unwrap().unwrap();
        assert_eq!(got.reactions.len(), 2);
    }

    #[test]
    fn follow_flavor_flips() {
        let (_dir, store) = test_store();
        store
            .save_follow(1, "bob", "https://ex.example/u/bob", "dub", "", "fol1")
            .unwrap();
        let n = store
            .update_follow_flavor("undub", "fol1", 1, "bob", "https://ex.example/u/bob", "dub")
            .unwrap();
        assert_eq!(n, 1);
        assert!(store.followers(1).unwrap().is_empty());
    }

    #[test]
    fn resubmission_delete_by_id_works() {
        let (_dir, store) = test_store();
        store
            .add_resubmission(&Utc::now(), 1, 1, "https://ex.example/u/bob", b"{}")
            .unwrap();
        let rows = store.resubmission_times().unwrap();
        assert_eq!(rows.len(), 1);
        store.delete_resubmission(rows[0].id).unwrap();
        assert!(store.resubmission_times().unwrap().is_empty());
    }

    #[test]
    fn host_purge_hits_resolved_and_unresolved_tokens() {
        let (_dir, store) = test_store();
        let now = Utc::now();
        store
            .add_resubmission(&now, 1, 1, "https://dead.example/u/bob", b"{}")
            .unwrap();
        store
            .add_resubmission(&now, 1, 1, "%https://dead.example/inbox", b"{}")
            .unwrap();
        store
            .add_resubmission(&now, 1, 1, "https://alive.example/u/eve", b"{}")
            .unwrap();
        store.purge_host_resubmissions("dead.example").unwrap();
        let left = store.resubmission_times().unwrap();
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn tracks_merge_dedupes() {
        let (_dir, store) = test_store();
        let mut m = HashMap::new();
        m.insert(
            "https://gander.example/u/alice/h/x1".to_string(),
            vec!["https://ex.example/u/bob#key".to_string()],
        );
        store.merge_tracks(&m).unwrap();
        store.merge_tracks(&m).unwrap();
        let t = store
            .get_tracks("https://gander.example/u/alice/h/x1")
            .unwrap()
            .unwrap();
        assert_eq!(t, "https://ex.example/u/bob#key");
    }
}

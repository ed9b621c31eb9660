/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::Settings;
use crate::store::{Activity, ChatMessage, User};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha512_256};
use std::path::Path;

// 64-character alphabet; every byte maps to six bits of it.
const XID_LETTERS: &[u8; 64] =
    b"BCDFGHJKLMNPQRSTVWXYZbcdfghjklmnpqrstvwxyz1234567891234567891234";

fn random_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|c| XID_LETTERS[(c & 63) as usize] as char)
        .collect()
}

/// Stable short id for an IRI, used in envelope ids and blob names.
pub fn shortxid(xid: &str) -> String {
    let mut h = Sha512_256::new();
    h.update(xid.as_bytes());
    random_string(&h.finalize()[..20])
}

pub fn random_xid() -> String {
    use rand::RngCore;
    let mut b = [0u8; 18];
    rand::rngs::OsRng.fill_bytes(&mut b);
    random_string(&b)
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn wire_time(dt: &Option<DateTime<Utc>>) -> String {
    dt.unwrap_or(DateTime::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// ISO-8601 duration, hours/minutes/seconds only.
pub fn format_duration(secs: i64) -> String {
    let mut out = String::from("PT");
    let mut left = secs.max(0);
    let h = left / 3600;
    left %= 3600;
    let m = left / 60;
    left %= 60;
    if h > 0 {
        out.push_str(&format!("{h}H"));
    }
    if m > 0 {
        out.push_str(&format!("{m}M"));
    }
    if left > 0 || (h == 0 && m == 0) {
        out.push_str(&format!("{left}S"));
    }
    out
}

/// Accepts PnDTnHnMnS and the common PT subset; 0 on anything else.
pub fn parse_duration(s: &str) -> i64 {
    let Some(rest) = s.strip_prefix('P') else {
        return 0;
    };
    let mut secs = 0i64;
    let mut num = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            'T' | 't' => in_time = true,
            '0'..='9' => num.push(c),
            _ => {
                let n: i64 = num.parse().unwrap_or(0);
                num.clear();
                secs += match (c.to_ascii_uppercase(), in_time) {
                    ('D', false) => n * 86400,
                    ('H', true) => n * 3600,
                    ('M', true) => n * 60,
                    ('S', true) => n,
                    _ => 0,
                };
            }
        }
    }
    secs
}

struct Emoji {
    id: String,
    name: String,
    media: String,
}

/// Custom emojis referenced as :name: in text, resolved against the local
/// emoji directory.
fn herd_of_emojis(settings: &Settings, data_dir: &Path, text: &str) -> Vec<Emoji> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b':' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len()
            && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'-')
        {
            end += 1;
        }
        if end > start && end < bytes.len() && bytes[end] == b':' {
            let name = &text[start..end];
            i = end + 1;
            if !seen.insert(name.to_string()) {
                continue;
            }
            for ext in [".png", ".gif"] {
                if data_dir.join("emus").join(format!("{name}{ext}")).exists() {
                    out.push(Emoji {
                        id: format!("https://{}/emu/{name}{ext}", settings.server_name),
                        name: format!(":{name}:"),
                        media: format!("image/{}", &ext[1..]),
                    });
                    break;
                }
            }
        } else {
            i += 1;
        }
    }
    out
}

fn is_emoji_name(name: &str) -> bool {
    name.len() > 2
        && name.starts_with(':')
        && name.ends_with(':')
        && name[1..name.len() - 1]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn attachment_documents(h: &Activity) -> Vec<Value> {
    h.attachments
        .iter()
        .filter(|d| !is_emoji_name(&d.name))
        .map(|d| {
            json!({
                "type": "Document",
                "mediaType": d.media,
                "name": d.name,
                "summary": html_escape(&d.desc),
                "url": d.url,
            })
        })
        .collect()
}

/// Render a locally-authored activity as its ActivityStreams envelope and,
/// for content-bearing kinds, the inner object. Mirrors the inbound
/// normalization so a serialized honk survives re-ingestion.
pub fn envelope(
    settings: &Settings,
    data_dir: &Path,
    user: &User,
    h: &Activity,
) -> (Value, Value) {
    let dt = wire_time(&h.date);
    let mut j = Map::new();
    j.insert(
        "id".to_string(),
        json!(format!("{}/{}/{}", user.url, h.what, shortxid(&h.xid))),
    );
    j.insert("actor".to_string(), json!(user.url));
    j.insert("published".to_string(), json!(dt));
    if let Some(first) = h.audience.first() {
        j.insert("to".to_string(), json!(first));
    }
    if h.audience.len() > 1 {
        j.insert("cc".to_string(), json!(h.audience[1..]));
    }

    let mut jo = Map::new();
    match h.what.as_str() {
        "update" | "tonk" | "event" | "honk" => {
            j.insert("type".to_string(), json!("Create"));
            jo.insert("id".to_string(), json!(h.xid));
            jo.insert("type".to_string(), json!("Note"));
            jo.insert("published".to_string(), json!(dt));
            jo.insert("url".to_string(), json!(h.xid));
            jo.insert("attributedTo".to_string(), json!(user.url));
            if h.what == "event" {
                jo.insert("type".to_string(), json!("Event"));
            }
            if h.what == "update" {
                j.insert("type".to_string(), json!("Update"));
                jo.insert("updated".to_string(), json!(dt));
            }
            if !h.in_reply_to.is_empty() {
                jo.insert("inReplyTo".to_string(), json!(h.in_reply_to));
            }
            if !h.thread.is_empty() {
                jo.insert("context".to_string(), json!(h.thread));
                jo.insert("conversation".to_string(), json!(h.thread));
            }
            if let Some(first) = h.audience.first() {
                jo.insert("to".to_string(), json!(first));
            }
            if h.audience.len() > 1 {
                jo.insert("cc".to_string(), json!(h.audience[1..]));
            }
            if !h.public {
                jo.insert("directMessage".to_string(), json!(true));
            }
            if !h.precis.is_empty() {
                jo.insert("sensitive".to_string(), json!(true));
            }

            let mut tags: Vec<Value> = Vec::new();
            for m in &h.mentions {
                tags.push(json!({"type": "Mention", "name": m.who, "href": m.href}));
            }
            for tag in &h.hashtags {
                let tag = tag.to_lowercase();
                let name = tag.trim_start_matches('#');
                tags.push(json!({
                    "type": "Hashtag",
                    "name": tag,
                    "href": format!("https://{}/o/{}", settings.server_name, name),
                }));
            }
            for e in herd_of_emojis(settings, data_dir, &h.text) {
                tags.push(json!({
                    "id": e.id,
                    "type": "Emoji",
                    "name": e.name,
                    "icon": {"type": "Image", "mediaType": e.media, "url": e.id},
                }));
            }
            if !tags.is_empty() {
                jo.insert("tag".to_string(), json!(tags));
            }

            if let Some(p) = &h.place {
                let mut t = Map::new();
                t.insert("type".to_string(), json!("Place"));
                if !p.name.is_empty() {
                    t.insert("name".to_string(), json!(p.name));
                }
                if p.latitude != 0.0 {
                    t.insert("latitude".to_string(), json!(p.latitude));
                }
                if p.longitude != 0.0 {
                    t.insert("longitude".to_string(), json!(p.longitude));
                }
                if !p.url.is_empty() {
                    t.insert("url".to_string(), json!(p.url));
                }
                jo.insert("location".to_string(), Value::Object(t));
            }
            if let Some(t) = &h.time {
                jo.insert(
                    "startTime".to_string(),
                    json!(t.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                if t.duration_secs != 0 {
                    jo.insert("duration".to_string(), json!(format_duration(t.duration_secs)));
                }
            }
            let atts = attachment_documents(h);
            if !atts.is_empty() {
                jo.insert("attachment".to_string(), json!(atts));
            }
            jo.insert("summary".to_string(), json!(html_escape(&h.precis)));
            jo.insert("content".to_string(), json!(h.text));
            j.insert("object".to_string(), Value::Object(jo.clone()));
        }
        "share" => {
            j.insert("type".to_string(), json!("Announce"));
            if !h.thread.is_empty() {
                j.insert("context".to_string(), json!(h.thread));
            }
            j.insert("object".to_string(), json!(h.xid));
        }
        "unshare" => {
            let mut b = Map::new();
            b.insert(
                "id".to_string(),
                json!(format!("{}/share/{}", user.url, shortxid(&h.xid))),
            );
            b.insert("type".to_string(), json!("Announce"));
            b.insert("actor".to_string(), json!(user.url));
            b.insert("object".to_string(), json!(h.xid));
            if !h.thread.is_empty() {
                b.insert("context".to_string(), json!(h.thread));
            }
            j.insert("type".to_string(), json!("Undo"));
            j.insert("object".to_string(), Value::Object(b));
        }
        "zonk" => {
            j.insert("type".to_string(), json!("Delete"));
            j.insert("object".to_string(), json!(h.xid));
        }
        "ack" => {
            j.insert("type".to_string(), json!("Read"));
            j.insert("object".to_string(), json!(h.xid));
            if !h.thread.is_empty() {
                j.insert("context".to_string(), json!(h.thread));
            }
        }
        "react" => {
            j.insert("type".to_string(), json!("EmojiReact"));
            j.insert("object".to_string(), json!(h.xid));
            if !h.thread.is_empty() {
                j.insert("context".to_string(), json!(h.thread));
            }
            j.insert("content".to_string(), json!(h.text));
        }
        "deack" => {
            let mut b = Map::new();
            b.insert(
                "id".to_string(),
                json!(format!("{}/ack/{}", user.url, shortxid(&h.xid))),
            );
            b.insert("type".to_string(), json!("Read"));
            b.insert("actor".to_string(), json!(user.url));
            b.insert("object".to_string(), json!(h.xid));
            if !h.thread.is_empty() {
                b.insert("context".to_string(), json!(h.thread));
            }
            j.insert("type".to_string(), json!("Undo"));
            j.insert("object".to_string(), Value::Object(b));
        }
        other => {
            tracing::warn!("not serializing activity kind: {other}");
        }
    }

    (Value::Object(j), Value::Object(jo))
}

/// The actor document. Server user renders as a Service.
pub fn serialize_user(settings: &Settings, user: &User) -> Value {
    let mut j = Map::new();
    j.insert("@context".to_string(), json!(crate::AT_CONTEXT));
    j.insert("id".to_string(), json!(user.url));
    j.insert("inbox".to_string(), json!(format!("{}/inbox", user.url)));
    j.insert("outbox".to_string(), json!(format!("{}/outbox", user.url)));
    j.insert("name".to_string(), json!(user.display));
    j.insert("preferredUsername".to_string(), json!(user.name));
    j.insert("summary".to_string(), json!(user.about));

    if user.id > 0 {
        j.insert("type".to_string(), json!("Person"));
        j.insert("url".to_string(), json!(user.url));
        j.insert(
            "followers".to_string(),
            json!(format!("{}/followers", user.url)),
        );
        j.insert(
            "following".to_string(),
            json!(format!("{}/following", user.url)),
        );
        let icon_url = match &user.options.avatar {
            Some(ava) if !ava.is_empty() => ava.clone(),
            _ => format!(
                "https://{}/a?a={}",
                settings.server_name,
                urlencoding::encode(&user.url)
            ),
        };
        j.insert(
            "icon".to_string(),
            json!({"type": "Image", "mediaType": "image/png", "url": icon_url}),
        );
        if let Some(ban) = &user.options.banner {
            if !ban.is_empty() {
                j.insert(
                    "image".to_string(),
                    json!({"type": "Image", "mediaType": "image/jpg", "url": ban}),
                );
            }
        }
    } else {
        j.insert("type".to_string(), json!("Service"));
    }

    j.insert(
        "publicKey".to_string(),
        json!({
            "id": format!("{}#key", user.url),
            "owner": user.url,
            "publicKeyPem": user.pubkey_pem,
        }),
    );
    Value::Object(j)
}

pub fn outbox_collection(
    settings: &Settings,
    data_dir: &Path,
    user: &User,
    honks: &[Activity],
) -> Value {
    let items: Vec<Value> = honks
        .iter()
        .map(|h| envelope(settings, data_dir, user, h).0)
        .collect();
    json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{}/outbox", user.url),
        "attributedTo": user.url,
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })
}

/// Followers and following are nobody's business: an empty collection.
pub fn empty_collection(settings: &Settings, path: &str) -> Value {
    let colname = if path.ends_with("/following") {
        "/following"
    } else {
        "/followers"
    };
    let user = format!(
        "https://{}{}",
        settings.server_name,
        &path[..path.len() - colname.len()]
    );
    json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{user}{colname}"),
        "attributedTo": user,
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": [],
    })
}

pub fn serialize_chat(user: &User, ch: &ChatMessage) -> Value {
    let dt = wire_time(&ch.date);
    let mut jo = Map::new();
    jo.insert("id".to_string(), json!(ch.xid));
    jo.insert("type".to_string(), json!("ChatMessage"));
    jo.insert("published".to_string(), json!(dt));
    jo.insert("attributedTo".to_string(), json!(user.url));
    jo.insert("to".to_string(), json!([ch.target]));
    jo.insert("content".to_string(), json!(ch.text));
    let atts: Vec<Value> = ch
        .attachments
        .iter()
        .map(|d| {
            json!({
                "type": "Document",
                "mediaType": d.media,
                "name": d.name,
                "summary": html_escape(&d.desc),
                "url": d.url,
            })
        })
        .collect();
    if !atts.is_empty() {
        jo.insert("attachment".to_string(), json!(atts));
    }

    json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{}/honk/{}", user.url, shortxid(&ch.xid)),
        "type": "Create",
        "actor": user.url,
        "published": dt,
        "to": [ch.target],
        "object": Value::Object(jo),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Mention;

    fn settings() -> Settings {
        Settings {
            server_name: "gander.example".to_string(),
            ..Default::default()
        }
    }

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".to_string(),
            display: "Alice".to_string(),
            about: "just some goose".to_string(),
            url: "https://gander.example/u/alice".to_string(),
            pubkey_pem: "PEM".to_string(),
            seckey_pem: String::new(),
            options: Default::default(),
        }
    }

    fn public_honk() -> Activity {
        Activity {
            userid: 1,
            what: "honk".to_string(),
            author: "https://gander.example/u/alice".to_string(),
            xid: "https://gander.example/u/alice/h/abc123".to_string(),
            date: Some(Utc::now()),
            audience: vec![
                crate::PUBLIC_IRI.to_string(),
                "https://ex.example/u/bob".to_string(),
            ],
            public: true,
            text: "<p>hello @bob".to_string(),
            format: "html".to_string(),
            thread: "data:,thread-1".to_string(),
            whofore: 2,
            hashtags: vec!["#Geese".to_string()],
            mentions: vec![Mention {
                who: "@bob@ex.example".to_string(),
                href: "https://ex.example/u/bob".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn shortxid_is_deterministic_and_alphabet_bound() {
        let a = shortxid("https://ex.example/n/1");
        let b = shortxid("https://ex.example/n/1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.bytes().all(|c| XID_LETTERS.contains(&c)));
        assert_ne!(a, shortxid("https://ex.example/n/2"));
    }

    #[test]
    fn create_envelope_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (j, jo) = envelope(&settings(), dir.path(), &alice(), &public_honk());
        assert_eq!(j["type"], "Create");
        assert_eq!(j["actor"], "https://gander.example/u/alice");
        assert_eq!(j["to"], crate::PUBLIC_IRI);
        assert_eq!(j["cc"][0], "https://ex.example/u/bob");
        assert_eq!(jo["type"], "Note");
        assert_eq!(jo["context"], "data:,thread-1");
        let tags = jo["tag"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["type"] == "Mention" && t["href"] == "https://ex.example/u/bob"));
        assert!(tags
            .iter()
            .any(|t| t["type"] == "Hashtag" && t["href"] == "https://gander.example/o/geese"));
    }

    #[test]
    fn share_and_unshare_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = public_honk();
        h.what = "share".to_string();
        h.xid = "https://ex.example/n/1".to_string();
        let (j, _) = envelope(&settings(), dir.path(), &alice(), &h);
        assert_eq!(j["type"], "Announce");
        assert_eq!(j["object"], "https://ex.example/n/1");
        assert_eq!(j["context"], "data:,thread-1");

        h.what = "unshare".to_string();
        let (j, _) = envelope(&settings(), dir.path(), &alice(), &h);
        assert_eq!(j["type"], "Undo");
        assert_eq!(j["object"]["type"], "Announce");
        assert_eq!(j["object"]["object"], "https://ex.example/n/1");
    }

    #[test]
    fn ack_react_deack_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = public_honk();
        h.xid = "https://ex.example/n/1".to_string();
        h.what = "ack".to_string();
        let (j, _) = envelope(&settings(), dir.path(), &alice(), &h);
        assert_eq!(j["type"], "Read");

        h.what = "react".to_string();
        h.text = "🎉".to_string();
        let (j, _) = envelope(&settings(), dir.path(), &alice(), &h);
        assert_eq!(j["type"], "EmojiReact");
        assert_eq!(j["content"], "🎉");

        h.what = "deack".to_string();
        let (j, _) = envelope(&settings(), dir.path(), &alice(), &h);
        assert_eq!(j["type"], "Undo");
        assert_eq!(j["object"]["type"], "Read");
    }

    #[test]
    fn user_document_carries_key_and_boxes() {
        let j = serialize_user(&settings(), &alice());
        assert_eq!(j["type"], "Person");
        assert_eq!(j["publicKey"]["id"], "https://gander.example/u/alice#key");
        assert_eq!(j["publicKey"]["owner"], "https://gander.example/u/alice");
        assert_eq!(j["inbox"], "https://gander.example/u/alice/inbox");
        assert_eq!(j["followers"], "https://gander.example/u/alice/followers");

        let server = User {
            id: crate::store::SERVER_UID,
            url: "https://gander.example/server".to_string(),
            ..alice()
        };
        let j = serialize_user(&settings(), &server);
        assert_eq!(j["type"], "Service");
    }

    #[test]
    fn empty_collection_names_itself() {
        let j = empty_collection(&settings(), "/u/alice/followers");
        assert_eq!(j["id"], "https://gander.example/u/alice/followers");
        assert_eq!(j["totalItems"], 0);
        let j = empty_collection(&settings(), "/u/alice/following");
        assert_eq!(j["id"], "https://gander.example/u/alice/following");
    }

    #[test]
    fn durations_round_trip() {
        assert_eq!(format_duration(5400), "PT1H30M");
        assert_eq!(parse_duration("PT1H30M"), 5400);
        assert_eq!(parse_duration("P1DT2H"), 93600);
        assert_eq!(parse_duration("PT45S"), 45);
        assert_eq!(parse_duration("bogus"), 0);
        assert_eq!(format_duration(0), "PT0S");
    }
}

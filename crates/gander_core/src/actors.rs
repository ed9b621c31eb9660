/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::fetch::Fetcher;
use crate::store::{Store, SERVER_UID};
use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

fn s<'a>(obj: &'a Value, key: &str) -> &'a str {
    obj.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorKind {
    Actor,
    Collection,
}

#[derive(Debug, Clone)]
pub struct ActorSummary {
    pub kind: ActorKind,
    pub xid: String,
    pub owner: String,
    pub name: String,
    pub avatar_url: String,
}

/// Pull everything useful out of a fetched actor document: public key,
/// boxes, preferred username. Each piece is checked against the origin the
/// document came from so one server cannot plant material for another.
pub fn ingest_actor(store: &Store, origin: &str, obj: &Value) {
    if obj.get("publicKey").is_some() {
        ingest_pubkey(store, origin, obj);
    }
    ingest_boxes(store, origin, obj);
    ingest_preferred_username(store, origin, obj);
}

fn ingest_pubkey(store: &Store, origin: &str, obj: &Value) {
    let keyobj = obj.get("publicKey").unwrap_or(obj);
    let keyid = s(keyobj, "id");
    if keyid.is_empty() {
        return;
    }
    match store.get_pubkey(keyid) {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => {
            warn!("error querying pubkey: {e:#}");
            return;
        }
    }
    if crate::originate(keyid) != origin {
        info!("bad key origin {origin} <> {keyid}");
        return;
    }
    debug!("ingesting a needed pubkey: {keyid}");
    let owner = s(keyobj, "owner");
    let pem = s(keyobj, "publicKeyPem");
    if owner.is_empty() || pem.is_empty() {
        info!("error finding {keyid} pubkey material");
        return;
    }
    if crate::originate(owner) != origin {
        info!("bad key owner: {owner} <> {origin}");
        return;
    }
    if crate::keys::decode_public_key(pem).is_err() {
        info!("error decoding {keyid} pubkey");
        return;
    }
    if let Err(e) = store.set_pubkey(keyid, pem) {
        warn!("error saving key: {e:#}");
    }
}

fn ingest_boxes(store: &Store, origin: &str, obj: &Value) {
    let ident = s(obj, "id");
    if ident.is_empty() || crate::originate(ident) != origin {
        return;
    }
    if matches!(store.get_boxes(ident), Ok(Some(_))) {
        return;
    }
    debug!("ingesting boxes: {ident}");
    let inbox = s(obj, "inbox");
    let outbox = s(obj, "outbox");
    let shared = obj
        .get("endpoints")
        .map(|e| s(e, "sharedInbox"))
        .unwrap_or("");
    if !inbox.is_empty() {
        if let Err(e) = store.set_boxes(ident, inbox, outbox, shared) {
            warn!("error saving boxes: {e:#}");
        }
    }
}

fn ingest_preferred_username(store: &Store, origin: &str, obj: &Value) {
    let ident = s(obj, "id");
    if ident.is_empty() || crate::originate(ident) != origin {
        return;
    }
    if matches!(store.get_preferred_username(ident), Ok(Some(_))) {
        return;
    }
    let username = s(obj, "preferredUsername");
    if !username.is_empty() {
        if let Err(e) = store.set_preferred_username(ident, username) {
            warn!("error saving preferred username: {e:#}");
        }
    }
}

/// WebFinger acct -> actor IRI. Consults the persisted names first, then
/// asks the remote host; a successful answer is persisted. Empty string
/// means the lookup failed (callers cache that too, briefly).
pub async fn webfinger_lookup(store: &Store, fetcher: &Fetcher, acct: &str) -> String {
    let parts: Vec<&str> = acct.split('@').collect();
    if parts.len() != 2 {
        debug!("bad acct name: {acct}");
        return String::new();
    }
    match store.get_friendly_name(acct) {
        Ok(Some(href)) => return href,
        Ok(None) => {}
        Err(e) => {
            warn!("error querying friendly name: {e:#}");
        }
    }
    debug!("fingering {acct}");
    let url = format!(
        "https://{}/.well-known/webfinger?resource=acct:{acct}",
        parts[1]
    );
    let j = match fetcher.get_and_parse_fast(SERVER_UID, &url).await {
        Ok(j) => j,
        Err(e) => {
            info!("failed to finger {acct}: {e:#}");
            return String::new();
        }
    };
    let links = j.get("links").and_then(|l| l.as_array());
    for l in links.into_iter().flatten() {
        let rel = s(l, "rel");
        let ty = s(l, "type");
        let href = s(l, "href");
        if rel == "self" && crate::is_activity_streams_media_type(ty) && !href.is_empty() {
            if let Err(e) = store.set_friendly_name(acct, href) {
                warn!("error saving friendly name: {e:#}");
            }
            return href.to_string();
        }
    }
    String::new()
}

/// Dereference a name (acct handle or IRI) into a summary of the actor or
/// collection behind it, ingesting actor material on the way.
pub async fn investigate(store: &Store, fetcher: &Fetcher, name: &str) -> Result<ActorSummary> {
    let mut name = name.to_string();
    if let Some(stripped) = name.strip_prefix('@') {
        name = webfinger_lookup(store, fetcher, stripped).await;
    }
    if name.is_empty() {
        return Err(anyhow!("no name"));
    }
    let obj = fetcher.get_and_parse_fast(SERVER_UID, &name).await?;
    ingest_actor(store, &crate::originate(&name), &obj);
    summarize(&obj)
}

pub fn summarize(obj: &Value) -> Result<ActorSummary> {
    let kind = match s(obj, "type") {
        "Person" | "Organization" | "Application" | "Service" => ActorKind::Actor,
        "OrderedCollection" | "Collection" => ActorKind::Collection,
        other => return Err(anyhow!("unknown object type: {other}")),
    };
    let xid = s(obj, "id").to_string();
    let mut name = s(obj, "preferredUsername").to_string();
    if name.is_empty() {
        name = s(obj, "name").to_string();
    }
    let mut owner = s(obj, "attributedTo").to_string();
    if owner.is_empty() {
        owner = xid.clone();
    }
    let mut avatar_url = String::new();
    if let Some(icon) = obj.get("icon") {
        if s(icon, "mediaType").starts_with("image/") {
            avatar_url = s(icon, "url").to_string();
        }
    }
    Ok(ActorSummary {
        kind,
        xid,
        owner,
        name,
        avatar_url,
    })
}

/// Presentation handle for an actor IRI: preferredUsername@host.
pub fn handle_for(store: &Store, xid: &str) -> String {
    if xid.is_empty() || xid == crate::PUBLIC_IRI || xid.ends_with("/followers") {
        return String::new();
    }
    let name = match store.get_preferred_username(xid) {
        Ok(Some(n)) => n,
        _ => {
            // Last path segment is a tolerable guess when we never met them.
            xid.rsplit('/').next().unwrap_or(xid).to_string()
        }
    };
    format!("{}@{}", name, crate::originate(xid))
}

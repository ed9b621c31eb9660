/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::runtime::Engine;
use crate::store::User;
use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const INBOX_BODY_LIMIT: usize = 1024 * 1024;
const MAX_DATE_SKEW: Duration = Duration::from_secs(30 * 60);

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    (status, msg.to_string()).into_response()
}

fn ldjson(bytes: Vec<u8>) -> Response<Body> {
    (
        StatusCode::OK,
        [("Content-Type", crate::LDJSON_CONTENT_TYPE)],
        bytes,
    )
        .into_response()
}

/// The HTML renderer is someone else's department; these endpoints only
/// owe browsers a placeholder.
fn html_stub(title: &str) -> Response<Body> {
    let page = format!(
        "<!doctype html><html><head><title>{title}</title></head><body><h1>{title}</h1></body></html>"
    );
    (
        StatusCode::OK,
        [("Content-Type", "text/html; charset=utf-8")],
        page,
    )
        .into_response()
}

fn accepts_activity(headers: &http::HeaderMap) -> bool {
    headers
        .get("Accept")
        .and_then(|v| v.to_str().ok())
        .map(crate::is_activity_streams_media_type)
        .unwrap_or(false)
}

pub async fn handle(engine: Arc<Engine>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    let segs: Vec<&str> = segs.iter().map(|s| s.as_str()).collect();
    let us = engine.settings.user_sep.clone();
    let hs = engine.settings.honk_sep.clone();
    let method = req.method().as_str().to_string();

    match (method.as_str(), segs.as_slice()) {
        ("GET", [".well-known", "webfinger"]) => webfinger(&engine, &req),
        ("GET", ["server"]) => server_actor(&engine).await,
        ("POST", ["inbox"]) | ("POST", ["server", "inbox"]) => server_inbox(engine, req).await,
        ("GET", ["d", xid]) => serve_blob(&engine, xid),
        ("GET", ["o", tag]) => {
            let tag = tag.to_string();
            tag_collection(&engine, req.headers(), &tag).await
        }
        ("POST", [u, name, "inbox"]) if *u == us => {
            let name = name.to_string();
            inbox(engine.clone(), req, &name).await
        }
        ("GET", [u, name, "outbox"]) if *u == us => {
            let name = name.to_string();
            outbox(&engine, &name).await
        }
        ("GET", [u, _, "followers" | "following"]) if *u == us => {
            emptiness(&engine, &path).await
        }
        ("GET", [u, name]) if *u == us => {
            let name = name.to_string();
            user_get(&engine, req.headers(), &name).await
        }
        ("GET", [u, name, h, id]) if *u == us && *h == hs => {
            let (name, id) = (name.to_string(), id.to_string());
            one_object(&engine, req.headers(), &name, &id).await
        }
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

// ----------------------------------------------------------------------
// signature verification

/// Verify the inbound signature, evicting and refetching the key once to
/// survive rotation. Success returns the verified keyId.
async fn verify_inbound(
    engine: &Engine,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<String, Response<Body>> {
    let teapot = |msg: &str| simple(StatusCode::IM_A_TEAPOT, msg);

    let Some(sig_header) = parts
        .headers
        .get("Signature")
        .or_else(|| parts.headers.get("signature"))
        .and_then(|v| v.to_str().ok())
    else {
        return Err(teapot("what did you call me?"));
    };
    let sig = match crate::http_sig::parse_signature_header(sig_header) {
        Ok(v) => v,
        Err(e) => {
            info!("bad signature header: {e:#}");
            return Err(teapot("what did you call me?"));
        }
    };
    if let Err(e) = crate::http_sig::verify_digest(&parts.headers, body) {
        info!("digest check failed for {}: {e:#}", sig.key_id);
        return Err(teapot("what did you call me?"));
    }
    if parts.headers.contains_key("Date") {
        if let Err(e) = crate::http_sig::verify_date(&parts.headers, MAX_DATE_SKEW) {
            info!("date check failed for {}: {e:#}", sig.key_id);
            return Err(teapot("what did you call me?"));
        }
    }
    let signing_string = match crate::http_sig::build_signing_string(
        &parts.method,
        &parts.uri,
        &parts.headers,
        &sig.headers,
    ) {
        Ok(s) => s,
        Err(e) => {
            info!("bad signed headers: {e:#}");
            return Err(teapot("what did you call me?"));
        }
    };

    let attempt = |pem: Option<String>| {
        let pem = pem.unwrap_or_default();
        if pem.is_empty() || pem == "failed" {
            return false;
        }
        crate::http_sig::verify_signature(&pem, &signing_string, &sig.signature).is_ok()
    };

    let pem = engine.pubkeys.get(sig.key_id.clone()).await;
    if attempt(pem) {
        return Ok(sig.key_id.clone());
    }
    // The key may have rotated: drop anything stale and try once more.
    let cutoff = chrono::Utc::now() - chrono::Duration::minutes(30);
    if let Err(e) = engine.store.delete_old_pubkey(&sig.key_id, &cutoff) {
        warn!("error evicting pubkey: {e:#}");
    }
    engine.pubkeys.clear(&sig.key_id).await;
    let pem = engine.pubkeys.get(sig.key_id.clone()).await;
    if attempt(pem) {
        return Ok(sig.key_id.clone());
    }
    info!("inbox message failed signature for {}", sig.key_id);
    Err(teapot("what did you call me?"))
}

/// A Delete whose actor is its own object; a whole genre of junk mail.
fn crappola(j: &Value) -> bool {
    let t = j.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let a = j.get("actor").and_then(|v| v.as_str()).unwrap_or("");
    let o = j.get("object").and_then(|v| v.as_str()).unwrap_or("");
    if t == "Delete" && !a.is_empty() && a == o {
        debug!("crappola from {a}");
        return true;
    }
    false
}

// ----------------------------------------------------------------------
// inboxes

async fn inbox(engine: Arc<Engine>, req: Request<Body>, name: &str) -> Response<Body> {
    let Some(user) = engine.user_by_name(name).await else {
        return simple(StatusCode::NOT_FOUND, "not found");
    };
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, INBOX_BODY_LIMIT).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    let j: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            info!("bad payload: {e}");
            return simple(StatusCode::OK, "");
        }
    };
    if crappola(&j) {
        return simple(StatusCode::OK, "");
    }
    let what = j.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let obj = j.get("object").and_then(|v| v.as_str()).unwrap_or("");
    if what == "EmojiReact" && crate::originate(obj) != engine.settings.server_name {
        return simple(StatusCode::OK, "");
    }
    let who = j.get("actor").and_then(|v| v.as_str()).unwrap_or("");
    if crate::filters::reject_origin(&engine.store, user.id, who, false) {
        debug!("rejecting actor: {who}");
        return simple(StatusCode::OK, "");
    }

    let keyname = match verify_inbound(&engine, &parts, &body).await {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let Some(origin) = crate::http_sig::key_match(&keyname, who) else {
        info!("keyname actor mismatch: {keyname} <> {who}");
        return simple(StatusCode::IM_A_TEAPOT, "what did you call me?");
    };

    match what {
        "Ping" => {
            let id = j.get("id").and_then(|v| v.as_str()).unwrap_or("");
            info!("ping from {who}: {id}");
            let engine = engine.clone();
            let user = user.clone();
            let who = who.to_string();
            let id = id.to_string();
            tokio::spawn(async move {
                crate::deliver::send_pong(&engine, &user, &who, &id).await;
            });
        }
        "Pong" => {
            info!("pong from {who}: {obj}");
        }
        "Follow" => {
            if obj != user.url {
                info!("can't follow {obj}");
                return simple(StatusCode::OK, "");
            }
            follow_me(&engine, &user, who, who, &j).await;
        }
        "Accept" => {
            accept_my_follow(&engine, &user, who).await;
        }
        "Reject" => {
            reject_my_follow(&engine, &user, who).await;
        }
        "Update" => match j.get("object").filter(|o| o.is_object()) {
            Some(o) => match o.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                "Service" | "Person" | "Question" => {}
                "Note" => {
                    crate::ingest::ingest(&engine, &user, &j, &origin).await;
                }
                other => {
                    info!("unknown Update activity: {other}");
                }
            },
            None => {
                info!("unknown Update activity");
            }
        },
        "Undo" => match j.get("object") {
            Some(o) if o.is_object() => {
                match o.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "Follow" => unfollow_me(&engine, &user, who, who).await,
                    "Announce" => {
                        debug!(
                            "undo announce: {}",
                            o.get("object").and_then(|v| v.as_str()).unwrap_or("")
                        );
                    }
                    "Like" => {}
                    other => info!("unknown undo: {other}"),
                }
            }
            Some(o) => {
                let folxid = o.as_str().unwrap_or("");
                if crate::originate(folxid) == origin {
                    unfollow_me_by_folxid(&engine, &user, folxid).await;
                }
            }
            None => {}
        },
        "EmojiReact" => {
            if !obj.is_empty() {
                let content = j.get("content").and_then(|v| v.as_str()).unwrap_or("");
                if let Err(e) = engine.store.add_reaction(user.id, obj, who, content) {
                    warn!("error saving reaction: {e:#}");
                }
            }
        }
        "Like" => {
            debug!("{obj} was liked by {who} - well done");
        }
        _ => {
            crate::ingest::ingest(&engine, &user, &j, &origin).await;
        }
    }
    simple(StatusCode::OK, "")
}

async fn server_inbox(engine: Arc<Engine>, req: Request<Body>) -> Response<Body> {
    let Ok(user) = engine.server_user().await else {
        return simple(StatusCode::INTERNAL_SERVER_ERROR, "no server user");
    };
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, INBOX_BODY_LIMIT).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    let j: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            info!("bad payload: {e}");
            return simple(StatusCode::OK, "");
        }
    };
    if crappola(&j) {
        return simple(StatusCode::OK, "");
    }
    let keyname = match verify_inbound(&engine, &parts, &body).await {
        Ok(k) => k,
        Err(resp) => return resp,
    };
    let who = j.get("actor").and_then(|v| v.as_str()).unwrap_or("");
    let Some(_origin) = crate::http_sig::key_match(&keyname, who) else {
        info!("keyname actor mismatch: {keyname} <> {who}");
        return simple(StatusCode::IM_A_TEAPOT, "what did you call me?");
    };
    if crate::filters::reject_origin(&engine.store, user.id, who, false) {
        return simple(StatusCode::OK, "");
    }

    let what = j.get("type").and_then(|v| v.as_str()).unwrap_or("");
    debug!("server got a {what}");
    let tag_prefix = format!("https://{}/o/", engine.settings.server_name);
    match what {
        "Follow" => {
            let obj = j.get("object").and_then(|v| v.as_str()).unwrap_or("");
            if obj == user.url {
                info!("can't follow the server!");
                return simple(StatusCode::OK, "");
            }
            let Some(tag) = obj.strip_prefix(&tag_prefix) else {
                info!("not sure how to handle this");
                return simple(StatusCode::OK, "");
            };
            let hashtag = format!("#{tag}");
            follow_me(&engine, &user, who, &hashtag, &j).await;
        }
        "Undo" => {
            let Some(o) = j.get("object").filter(|o| o.is_object()) else {
                info!("unknown undo no object");
                return simple(StatusCode::OK, "");
            };
            if o.get("type").and_then(|v| v.as_str()) != Some("Follow") {
                info!("unknown undo");
                return simple(StatusCode::OK, "");
            }
            let targ = o.get("object").and_then(|v| v.as_str()).unwrap_or("");
            let Some(tag) = targ.strip_prefix(&tag_prefix) else {
                info!("not sure how to handle this");
                return simple(StatusCode::OK, "");
            };
            let hashtag = format!("#{tag}");
            unfollow_me(&engine, &user, who, &hashtag).await;
        }
        other => {
            info!("unhandled server activity: {other}");
        }
    }
    simple(StatusCode::OK, "")
}

// ----------------------------------------------------------------------
// follow bookkeeping

async fn follow_me(engine: &Arc<Engine>, user: &User, who: &str, name: &str, j: &Value) {
    let folxid = j.get("id").and_then(|v| v.as_str()).unwrap_or("");
    info!("updating follower: {who} {folxid}");
    match engine.store.find_follow(user.id, who, &["dub", "undub"]) {
        Ok(Some(_)) => {
            info!("duplicate follow request: {who}");
            if let Err(e) = engine
                .store
                .update_follow_flavor("dub", folxid, user.id, name, who, "undub")
            {
                warn!("error updating follow: {e:#}");
            }
        }
        Ok(None) => {
            if let Err(e) = engine.store.save_follow(user.id, name, who, "dub", "", folxid) {
                warn!("error saving follow: {e:#}");
            }
        }
        Err(e) => {
            warn!("error querying follows: {e:#}");
            return;
        }
    }
    let engine = engine.clone();
    let user = user.clone();
    let req = j.clone();
    tokio::spawn(async move {
        crate::deliver::accept_follow(engine, user, req).await;
    });
}

async fn unfollow_me(engine: &Arc<Engine>, user: &User, who: &str, name: &str) {
    info!("updating follower undo: {who}");
    let folxid = match engine.store.find_follow(user.id, who, &["dub"]) {
        Ok(Some(f)) => f.folxid,
        _ => String::new(),
    };
    if let Err(e) = engine
        .store
        .update_follow_flavor("undub", &folxid, user.id, name, who, "dub")
    {
        warn!("error updating follow: {e:#}");
    }
}

async fn unfollow_me_by_folxid(engine: &Arc<Engine>, user: &User, folxid: &str) {
    match engine.store.find_follow_by_folxid(user.id, folxid) {
        Ok(Some(f)) => {
            info!("updating follower undo: {} {folxid}", f.xid);
            if let Err(e) = engine
                .store
                .update_follow_flavor("undub", folxid, user.id, &f.name, &f.xid, "dub")
            {
                warn!("error updating follow: {e:#}");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("error scanning follows: {e:#}"),
    }
}

/// They accepted our follow request: presub graduates to sub.
async fn accept_my_follow(engine: &Arc<Engine>, user: &User, who: &str) {
    info!("updating honker accept: {who}");
    let Ok(Some(f)) = engine.store.find_follow(user.id, who, &["presub"]) else {
        warn!("can't find follow to accept: {who}");
        return;
    };
    if let Err(e) = engine
        .store
        .update_follow_flavor("sub", &f.folxid, user.id, &f.name, who, "presub")
    {
        warn!("error updating follow: {e:#}");
    }
}

async fn reject_my_follow(engine: &Arc<Engine>, user: &User, who: &str) {
    info!("updating honker reject: {who}");
    for old in ["presub", "sub"] {
        if let Ok(Some(f)) = engine.store.find_follow(user.id, who, &[old]) {
            if let Err(e) = engine
                .store
                .update_follow_flavor("unsub", &f.folxid, user.id, &f.name, who, old)
            {
                warn!("error updating follow: {e:#}");
            }
        }
    }
}

// ----------------------------------------------------------------------
// documents

fn webfinger(engine: &Engine, req: &Request<Body>) -> Response<Body> {
    let query = req.uri().query().unwrap_or("");
    let resource = query
        .split('&')
        .find_map(|p| p.strip_prefix("resource="))
        .map(|v| urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_default())
        .unwrap_or_default();
    debug!("finger lick: {resource}");

    let orig = resource.strip_prefix("acct:").unwrap_or(&resource);
    let mut name = orig.to_string();
    if let Some((n, host)) = orig.split_once('@') {
        name = n.to_string();
        let s = &engine.settings;
        if !(host == s.server_name || host == s.masq_name) {
            info!("foreign request rejected");
            name = String::new();
        }
    }
    let user = match engine.store.user_by_name(&name) {
        Ok(Some(u)) => u,
        _ => return simple(StatusCode::NOT_FOUND, "not found"),
    };
    let url = engine.settings.user_url(user.id, &user.name);
    let j = json!({
        "subject": format!("acct:{}@{}", user.name, engine.settings.masq_name),
        "aliases": [url],
        "links": [{
            "rel": "self",
            "type": crate::ACTIVITY_JSON_CONTENT_TYPE,
            "href": url,
        }],
    });
    (
        StatusCode::OK,
        [("Content-Type", "application/jrd+json")],
        serde_json::to_vec(&j).unwrap_or_default(),
    )
        .into_response()
}

async fn server_actor(engine: &Engine) -> Response<Body> {
    let Ok(user) = engine.server_user().await else {
        return simple(StatusCode::INTERNAL_SERVER_ERROR, "no server user");
    };
    let j = crate::serialize::serialize_user(&engine.settings, &user);
    ldjson(serde_json::to_vec(&j).unwrap_or_default())
}

async fn user_get(engine: &Engine, headers: &http::HeaderMap, name: &str) -> Response<Body> {
    if accepts_activity(headers) {
        return match engine.user_json.get(name.to_string()).await {
            Some(bytes) => ldjson(bytes),
            None => simple(StatusCode::NOT_FOUND, "not found"),
        };
    }
    match engine.user_by_name(name).await {
        Some(user) => html_stub(&user.name),
        None => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn outbox(engine: &Engine, name: &str) -> Response<Body> {
    match engine.outboxes.get(name.to_string()).await {
        Some(bytes) => ldjson(bytes),
        None => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn emptiness(engine: &Engine, path: &str) -> Response<Body> {
    match engine.empties.get(path.to_string()).await {
        Some(bytes) => ldjson(bytes),
        None => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn one_object(
    engine: &Engine,
    headers: &http::HeaderMap,
    name: &str,
    id: &str,
) -> Response<Body> {
    if engine.user_by_name(name).await.is_none() {
        return simple(StatusCode::NOT_FOUND, "not found");
    }
    let s = &engine.settings;
    let xid = format!(
        "https://{}/{}/{name}/{}/{id}",
        s.server_name, s.user_sep, s.honk_sep
    );
    if accepts_activity(headers) {
        match engine.rendered.get(xid.clone()).await {
            Some(bytes) => {
                let ua = headers
                    .get("User-Agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let sig = headers.get("Signature").and_then(|v| v.to_str().ok());
                let who = crate::tracks::requester_of(ua, sig);
                engine.tracker.track(&xid, &who);
                ldjson(bytes)
            }
            None => simple(StatusCode::NOT_FOUND, "not found"),
        }
    } else {
        html_stub(id)
    }
}

async fn tag_collection(engine: &Engine, headers: &http::HeaderMap, tag: &str) -> Response<Body> {
    if !accepts_activity(headers) {
        return html_stub(&format!("#{tag}"));
    }
    let acts = engine
        .store
        .activities_by_hashtag(&format!("#{}", tag.to_lowercase()))
        .unwrap_or_default();
    let items: Vec<String> = acts.iter().map(|a| a.xid.clone()).collect();
    let j = json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("https://{}/o/{tag}", engine.settings.server_name),
        "name": format!("#{tag}"),
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    });
    ldjson(serde_json::to_vec(&j).unwrap_or_default())
}

fn serve_blob(engine: &Engine, xid: &str) -> Response<Body> {
    match engine.blobs.get_file_body(xid) {
        Ok(Some((media, body))) => {
            (StatusCode::OK, [("Content-Type", media)], body).into_response()
        }
        Ok(None) => simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => {
            warn!("error loading blob: {e:#}");
            simple(StatusCode::INTERNAL_SERVER_ERROR, "oh no")
        }
    }
}

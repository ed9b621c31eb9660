/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::runtime::Engine;
use crate::store::{
    dedupe_strings, Activity, ChatMessage, EventTime, Mention, Place, User,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MAX_DEPTH: u32 = 10;
const MAX_CONTENT_CHARS: usize = 90_001;

fn js<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("")
}

fn js_map<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.get(key).filter(|x| x.is_object())
}

fn js_array<'a>(v: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    v.get(key).and_then(|x| x.as_array())
}

/// A field that may be a string or an array whose first element is one.
fn first_of_many(v: &Value, key: &str) -> String {
    if let Some(s) = v.get(key).and_then(|x| x.as_str()) {
        return s.to_string();
    }
    if let Some(arr) = js_array(v, key) {
        if let Some(s) = arr.first().and_then(|x| x.as_str()) {
            return s.to_string();
        }
    }
    String::new()
}

/// attributedTo arrives as a string, an {id} map, or an array of either.
fn extract_attributed_to(obj: &Value) -> String {
    if let Some(s) = obj.get("attributedTo").and_then(|x| x.as_str()) {
        return s.to_string();
    }
    if let Some(m) = js_map(obj, "attributedTo") {
        let id = js(m, "id");
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(arr) = js_array(obj, "attributedTo") {
        for a in arr {
            if let Some(m) = a.as_object() {
                let t = m.get("type").and_then(|x| x.as_str()).unwrap_or("");
                let id = m.get("id").and_then(|x| x.as_str()).unwrap_or("");
                if t == "Person" || t.is_empty() {
                    return id.to_string();
                }
            }
            if let Some(s) = a.as_str() {
                return s.to_string();
            }
        }
    }
    String::new()
}

/// Union of to/cc/attributedTo across their string and array shapes.
fn collect_audience(obj: &Value) -> Vec<String> {
    let mut a = Vec::new();
    for addr in ["to", "cc", "attributedTo"] {
        if let Some(s) = obj.get(addr).and_then(|x| x.as_str()) {
            a.push(s.to_string());
        }
        if let Some(arr) = js_array(obj, addr) {
            for w in arr {
                if let Some(s) = w.as_str() {
                    a.push(s.to_string());
                }
            }
        }
    }
    a
}

fn parse_wire_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        info!("content too long. truncating");
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

#[derive(Debug, Default)]
struct AttSpec {
    att_type: String,
    media: String,
    url: String,
    name: String,
    desc: String,
}

/// url alone comes in four shapes: string, array of strings, array of
/// {href, mediaType} maps, or one such map.
fn parse_attachment(att: &Value) -> AttSpec {
    let mut spec = AttSpec {
        att_type: js(att, "type").to_string(),
        media: js(att, "mediaType").to_string(),
        name: js(att, "name").to_string(),
        desc: js(att, "summary").to_string(),
        ..Default::default()
    };
    if let Some(u) = att.get("url").and_then(|x| x.as_str()) {
        spec.url = u.to_string();
    } else if let Some(arr) = js_array(att, "url") {
        if let Some(first) = arr.first() {
            if let Some(s) = first.as_str() {
                spec.url = s.to_string();
            } else if first.is_object() {
                spec.url = js(first, "href").to_string();
                if spec.media.is_empty() {
                    spec.media = js(first, "mediaType").to_string();
                }
            }
        }
    } else if let Some(m) = js_map(att, "url") {
        spec.url = js(m, "href").to_string();
        if spec.media.is_empty() {
            spec.media = js(m, "mediaType").to_string();
        }
    }
    if spec.desc.is_empty() {
        spec.desc = spec.name.clone();
    }
    spec
}

fn need_id(engine: &Engine, user: &User, xid: &str, is_announce: bool) -> bool {
    if !xid.starts_with("https://") {
        return false;
    }
    if xid.starts_with(&format!("{}/", user.url)) {
        return false;
    }
    if crate::filters::reject_origin(&engine.store, user.id, xid, is_announce) {
        info!("rejecting origin: {xid}");
        return false;
    }
    if engine.store.is_zonked(user.id, xid).unwrap_or(false) {
        info!("already zonked: {xid}");
        return false;
    }
    match engine.store.find_activity_id(user.id, xid) {
        Ok(Some(_)) => false,
        Ok(None) => true,
        Err(e) => {
            warn!("error querying activity: {e:#}");
            true
        }
    }
}

/// Delete the local copy and remember not to take it back.
pub async fn delete_activity_by_xid(engine: &Engine, userid: i64, xid: &str) {
    if let Ok(Some(act)) = engine.store.get_activity(userid, xid) {
        if let Err(e) = engine.store.delete_activity(act.id) {
            warn!("error eradicating: {e:#}");
        }
    }
    if let Err(e) = engine.store.save_action(userid, xid, "zonk") {
        warn!("error recording zonk: {e:#}");
    }
    engine.rendered.clear(&xid.to_string()).await;
}

/// Recursion harness threaded through the call tree: depth bounds ancestor
/// climbing, current_thread stitches siblings when an upstream object
/// omits its context, going_up suppresses reply fan-out while climbing.
#[derive(Debug, Default)]
struct Ctx {
    depth: u32,
    current_thread: String,
    going_up: u32,
}

/// Entry point: reify one delivered document for a user. `origin` is the
/// host the document arrived from, used against forged cross-site ids.
pub async fn ingest(
    engine: &Arc<Engine>,
    user: &User,
    item: &Value,
    origin: &str,
) -> Option<Activity> {
    let mut ctx = Ctx::default();
    ingest_one(engine, &mut ctx, user, item.clone(), origin.to_string(), false).await
}

fn ingest_one<'a>(
    engine: &'a Arc<Engine>,
    ctx: &'a mut Ctx,
    user: &'a User,
    item: Value,
    origin: String,
    is_update: bool,
) -> BoxFuture<'a, Option<Activity>> {
    Box::pin(async move {
        let mut is_update = is_update;
        let what = first_of_many(&item, "type");
        let mut dt = js(&item, "published").to_string();

        let mut xid;
        let mut obj: Option<Value> = None;
        let mut origin = origin;
        let what = match what.as_str() {
            "Delete" | "Tombstone" => {
                xid = match js_map(&item, "object") {
                    Some(o) => js(o, "id").to_string(),
                    None => js(&item, "object").to_string(),
                };
                if what == "Tombstone" {
                    xid = js(&item, "id").to_string();
                }
                if xid.is_empty() {
                    return None;
                }
                if crate::originate(&xid) != origin {
                    info!("forged delete: {xid}");
                    return None;
                }
                info!("eradicating {xid}");
                delete_activity_by_xid(engine, user.id, &xid).await;
                return None;
            }
            "Remove" => {
                info!("remove activity ignored");
                return None;
            }
            "Announce" => {
                match js_map(&item, "object") {
                    Some(o) => {
                        xid = js(o, "id").to_string();
                        obj = Some(o.clone());
                    }
                    None => {
                        xid = js(&item, "object").to_string();
                    }
                }
                if !need_id(engine, user, &xid, true) {
                    return None;
                }
                if obj.is_none() {
                    debug!("getting share: {xid}");
                    match engine.fetcher.get_and_parse_with_retry(user.id, &xid).await {
                        Ok(o) => obj = Some(o),
                        Err(e) => info!("error getting share: {xid}: {e:#}"),
                    }
                }
                origin = crate::originate(&xid);
                "share".to_string()
            }
            "Update" | "Create" => {
                is_update = what == "Update";
                let embedded = js_map(&item, "object").cloned();
                let fetched = match embedded {
                    Some(o) => Some(o),
                    None => {
                        xid = js(&item, "object").to_string();
                        debug!("getting created object: {xid}");
                        if crate::originate(&xid) != origin {
                            info!("out of bounds {xid} not from {origin}");
                            return None;
                        }
                        match engine.fetcher.get_and_parse_with_retry(user.id, &xid).await {
                            Ok(o) => Some(o),
                            Err(e) => {
                                info!("error getting creation: {e:#}");
                                None
                            }
                        }
                    }
                };
                let Some(inner) = fetched else {
                    info!("no object for creation {}", js(&item, "id"));
                    return None;
                };
                return ingest_one(engine, ctx, user, inner, origin, is_update).await;
            }
            "Read" | "Add" => {
                xid = js(&item, "object").to_string();
                if xid.is_empty() {
                    return None;
                }
                if !need_id(engine, user, &xid, false) {
                    debug!("don't need object: {xid}");
                    return None;
                }
                let inner = match engine.fetcher.get_and_parse_with_retry(user.id, &xid).await {
                    Ok(o) => o,
                    Err(e) => {
                        info!("error getting object: {e:#}");
                        return None;
                    }
                };
                let inner_origin = crate::originate(&xid);
                return ingest_one(engine, ctx, user, inner, inner_origin, false).await;
            }
            "Move" => {
                obj = Some(item.clone());
                "move".to_string()
            }
            "Audio" | "Image" | "Video" | "Question" | "Note" | "Article" | "Page" => {
                obj = Some(item.clone());
                "honk".to_string()
            }
            "Event" => {
                obj = Some(item.clone());
                "event".to_string()
            }
            "ChatMessage" => {
                obj = Some(item.clone());
                "chatMessage".to_string()
            }
            other => {
                info!("unknown activity: {other}");
                debug!("payload: {item}");
                return None;
            }
        };
        let mut what = what;

        xid = match &obj {
            Some(o) => js(o, "id").to_string(),
            None => js(&item, "object").to_string(),
        };
        if xid.is_empty() {
            info!("don't know what the object id is");
            return None;
        }
        if crate::originate(&xid) != origin {
            info!("original sin: {xid} not from {origin}");
            return None;
        }

        let mut author = js(&item, "actor").to_string();
        if author.is_empty() {
            author = js(&item, "attributedTo").to_string();
        }
        let mut oonker = String::new();
        let mut audience = Vec::new();
        if let Some(o) = &obj {
            if author.is_empty() {
                author = extract_attributed_to(o);
            }
            oonker = extract_attributed_to(o);
            if oonker == author {
                oonker.clear();
            }
            audience = collect_audience(o);
        }
        audience.push(author.clone());
        let audience = dedupe_strings(audience);
        let public = crate::store::audience_is_public(&audience);

        let mut xonk = Activity {
            userid: user.id,
            xid: xid.clone(),
            what: what.clone(),
            author: author.clone(),
            oonker,
            audience,
            public,
            format: "html".to_string(),
            ..Default::default()
        };

        let mut url = String::new();
        let mut in_reply_to = String::new();
        let mut thread = String::new();
        let mut replies: Vec<String> = Vec::new();

        if let Some(o) = &obj {
            let ot = js(o, "type").to_string();
            url = js(o, "url").to_string();
            if !js(o, "published").is_empty() {
                dt = js(o, "published").to_string();
            }
            let mut content = js(o, "content").to_string();
            if !content.starts_with("<p>") {
                content = format!("<p>{content}");
            }
            let mut precis = js(o, "summary").to_string();
            if let Some(name) = o.get("name").and_then(|x| x.as_str()) {
                if !precis.is_empty() {
                    content = format!("{precis}<p>{content}");
                }
                precis = crate::serialize::html_escape(name);
            }
            if o.get("sensitive").and_then(|x| x.as_bool()).unwrap_or(false) && precis.is_empty() {
                precis = "unspecified horror".to_string();
            }

            in_reply_to = js(o, "inReplyTo").to_string();
            if in_reply_to.is_empty() {
                if let Some(robj) = js_map(o, "inReplyTo") {
                    in_reply_to = js(robj, "id").to_string();
                }
            }
            thread = js(o, "context").to_string();
            if thread.is_empty() {
                thread = js(o, "conversation").to_string();
            }

            if ot == "Question" {
                if what == "honk" {
                    what = "qonk".to_string();
                }
                content.push_str("<ul>");
                for key in ["oneOf", "anyOf"] {
                    for a in js_array(o, key).into_iter().flatten() {
                        let choice = js(a, "name");
                        if !choice.is_empty() {
                            content.push_str("<li>");
                            content.push_str(choice);
                        }
                    }
                }
                content.push_str("</ul>");
            }
            if ot == "Move" {
                let targ = js(o, "target");
                content.push_str(&format!(
                    r#"<p>Moved to <a href="{targ}">{targ}</a>"#
                ));
            }
            if what == "honk" && !in_reply_to.is_empty() {
                what = "tonk".to_string();
            }
            content = truncate_chars(&content, MAX_CONTENT_CHARS);

            xonk.what = what.clone();
            xonk.text = content;
            xonk.precis = precis;
            if crate::filters::reject_activity(&engine.store, &xonk) {
                debug!("fast reject: {xid}");
                return None;
            }

            let mut att_specs: Vec<AttSpec> = Vec::new();
            for att in js_array(o, "attachment").into_iter().flatten() {
                if att.is_object() {
                    att_specs.push(parse_attachment(att));
                } else {
                    info!("attachment that wasn't a map?");
                }
            }
            if let Some(att) = js_map(o, "attachment") {
                att_specs.push(parse_attachment(att));
            }
            let media_banned = crate::filters::skip_media(&engine.store, &xonk);
            for (numatts, spec) in att_specs.iter().enumerate() {
                let mut localize = false;
                if numatts > 4 {
                    info!("excessive attachment: {}", spec.att_type);
                } else if crate::media::wants_local_copy(&spec.att_type, &spec.media) {
                    debug!("attachment: {} {}", spec.media, spec.url);
                    localize = true;
                } else {
                    info!("unknown attachment: {}", spec.att_type);
                }
                if media_banned {
                    localize = false;
                }
                if let Some(att) = crate::media::save_attachment(
                    &engine.store,
                    &engine.blobs,
                    &engine.fetcher,
                    &engine.settings.server_name,
                    &spec.url,
                    &spec.name,
                    &spec.desc,
                    &spec.media.to_lowercase(),
                    localize,
                )
                .await
                {
                    xonk.attachments.push(att);
                }
            }

            for tag in js_array(o, "tag").into_iter().flatten() {
                let tt = js(tag, "type");
                let name = js(tag, "name").to_string();
                let mut desc = js(tag, "summary").to_string();
                if desc.is_empty() {
                    desc = name.clone();
                }
                match tt {
                    "Emoji" => {
                        if let Some(icon) = js_map(tag, "icon") {
                            let mut media = js(icon, "mediaType").to_string();
                            if media.is_empty() {
                                media = "image/png".to_string();
                            }
                            let u = js(icon, "url");
                            if let Some(att) = crate::media::save_attachment(
                                &engine.store,
                                &engine.blobs,
                                &engine.fetcher,
                                &engine.settings.server_name,
                                u,
                                &name,
                                &desc,
                                &media,
                                true,
                            )
                            .await
                            {
                                xonk.attachments.push(att);
                            }
                        }
                    }
                    "Hashtag" => {
                        if name.is_empty() || name == "#" {
                            // skip it
                        } else if name.starts_with('#') {
                            xonk.hashtags.push(name);
                        } else {
                            xonk.hashtags.push(format!("#{name}"));
                        }
                    }
                    "Place" => {
                        xonk.place = Some(Place {
                            name,
                            latitude: tag.get("latitude").and_then(|x| x.as_f64()).unwrap_or(0.0),
                            longitude: tag.get("longitude").and_then(|x| x.as_f64()).unwrap_or(0.0),
                            url: js(tag, "url").to_string(),
                        });
                    }
                    "Mention" => {
                        xonk.mentions.push(Mention {
                            who: name,
                            href: js(tag, "href").to_string(),
                        });
                    }
                    _ => {}
                }
            }

            if let Some(start) = parse_wire_time(js(o, "startTime")) {
                xonk.time = Some(EventTime {
                    start,
                    end: parse_wire_time(js(o, "endTime")),
                    duration_secs: crate::serialize::parse_duration(js(o, "duration")),
                });
            }
            if let Some(loca) = js_map(o, "location") {
                if js(loca, "type") == "Place" {
                    xonk.place = Some(Place {
                        name: js(loca, "name").to_string(),
                        latitude: loca.get("latitude").and_then(|x| x.as_f64()).unwrap_or(0.0),
                        longitude: loca.get("longitude").and_then(|x| x.as_f64()).unwrap_or(0.0),
                        url: js(loca, "url").to_string(),
                    });
                }
            }

            xonk.hashtags = dedupe_strings(std::mem::take(&mut xonk.hashtags));

            if let Some(replyobj) = js_map(o, "replies") {
                let items = js_array(replyobj, "items").or_else(|| {
                    js_map(replyobj, "first").and_then(|first| js_array(first, "items"))
                });
                for repl in items.into_iter().flatten() {
                    if let Some(s) = repl.as_str() {
                        replies.push(s.to_string());
                    }
                }
            }
        }

        if ctx.current_thread.is_empty() {
            ctx.current_thread = thread.clone();
        }

        xonk.in_reply_to = in_reply_to.clone();
        xonk.date = parse_wire_time(&dt).or_else(|| Some(Utc::now()));
        xonk.url = url;
        xonk.thread = thread.clone();
        xonk.whofore = 0;
        for m in &xonk.mentions {
            if m.href == user.url {
                xonk.whofore = 1;
            }
        }

        if xonk.what == "chatMessage" {
            let mut ch = ChatMessage {
                id: 0,
                userid: xonk.userid,
                xid: xid.clone(),
                who: xonk.author.clone(),
                target: xonk.author.clone(),
                date: xonk.date,
                text: xonk.text.clone(),
                format: xonk.format.clone(),
                attachments: xonk.attachments.clone(),
            };
            if let Err(e) = engine.store.save_chat_message(&mut ch) {
                warn!("error saving chat message: {e:#}");
            }
            return None;
        }

        if is_update {
            debug!("something has changed! {}", xonk.xid);
            match engine.store.get_activity(user.id, &xonk.xid) {
                Ok(Some(_)) => {
                    if let Err(e) = engine.store.update_activity(&mut xonk) {
                        warn!("error updating: {e:#}");
                        return None;
                    }
                    engine.rendered.clear(&xonk.xid).await;
                }
                _ => {
                    info!("didn't find old version for update: {}", xonk.xid);
                    is_update = false;
                }
            }
        }
        if !is_update && need_id(engine, user, &xonk.xid, false)
            && !crate::filters::reject_activity(&engine.store, &xonk)
        {
            let mut thread = thread;
            if !in_reply_to.is_empty() && xonk.public {
                if need_id(engine, user, &in_reply_to, false) {
                    if ctx.depth >= MAX_DEPTH {
                        info!("in too deep");
                    } else {
                        debug!("getting parent: {in_reply_to}");
                        match engine
                            .fetcher
                            .get_and_parse_with_retry(user.id, &in_reply_to)
                            .await
                        {
                            Ok(parent) => {
                                ctx.depth += 1;
                                ctx.going_up += 1;
                                let parent_origin = crate::originate(&in_reply_to);
                                ingest_one(engine, ctx, user, parent, parent_origin, false).await;
                                ctx.going_up -= 1;
                                ctx.depth -= 1;
                            }
                            Err(e) => {
                                info!("error getting parent: {in_reply_to}: {e:#}");
                            }
                        }
                    }
                }
                if thread.is_empty() {
                    if let Ok(Some(parent)) = engine.store.get_activity(user.id, &in_reply_to) {
                        thread = parent.thread;
                    }
                }
            }
            if thread.is_empty() {
                thread = ctx.current_thread.clone();
            }
            if thread.is_empty() {
                thread = format!("data:,missing-{}", crate::serialize::random_xid());
                ctx.current_thread = thread.clone();
            }
            xonk.thread = thread;
            info!("saving xonk: {}", xonk.xid);
            if let Err(e) = engine.store.save_activity(&mut xonk) {
                warn!("error saving: {e:#}");
            }
        }

        if ctx.going_up == 0 {
            for replid in replies {
                if !need_id(engine, user, &replid, false) {
                    continue;
                }
                if ctx.depth >= MAX_DEPTH {
                    info!("in too deep");
                    break;
                }
                debug!("missing a reply: {replid}");
                match engine.fetcher.get_and_parse_with_retry(user.id, &replid).await {
                    Ok(reply) => {
                        ctx.depth += 1;
                        let reply_origin = crate::originate(&replid);
                        ingest_one(engine, ctx, user, reply, reply_origin, false).await;
                        ctx.depth -= 1;
                    }
                    Err(e) => {
                        info!("error getting reply: {replid}: {e:#}");
                    }
                }
            }
        }

        Some(xonk)
    })
}

/// Walk a remote outbox collection and ingest up to twenty items,
/// oldest first.
pub async fn fetch_outbox(engine: &Arc<Engine>, user: &User, outbox: &str) {
    debug!("getting outbox: {outbox}");
    let j = match engine.fetcher.get_and_parse_slow(user.id, outbox).await {
        Ok(j) => j,
        Err(e) => {
            info!("error getting outbox: {e:#}");
            return;
        }
    };
    if js(&j, "type") != "OrderedCollection" {
        return;
    }
    let origin = crate::originate(outbox);
    let mut items: Vec<Value> = js_array(&j, "orderedItems")
        .or_else(|| js_array(&j, "items"))
        .cloned()
        .unwrap_or_default();
    if items.is_empty() {
        if let Some(first) = js_map(&j, "first") {
            items = js_array(first, "orderedItems").cloned().unwrap_or_default();
        } else {
            let page1 = js(&j, "first");
            if !page1.is_empty() {
                match engine.fetcher.get_and_parse_slow(user.id, page1).await {
                    Ok(page) => {
                        items = js_array(&page, "orderedItems").cloned().unwrap_or_default()
                    }
                    Err(e) => {
                        info!("error getting page1: {e:#}");
                        return;
                    }
                }
            }
        }
    }
    items.truncate(20);
    items.reverse();
    for item in items {
        if item.is_object() {
            ingest(engine, user, &item, &origin).await;
        } else if let Some(xid) = item.as_str() {
            if !need_id(engine, user, xid, false) {
                continue;
            }
            match engine.fetcher.get_and_parse_slow(user.id, xid).await {
                Ok(obj) => {
                    ingest(engine, user, &obj, &crate::originate(xid)).await;
                }
                Err(e) => {
                    info!("error getting item: {e:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::test_engine;
    use serde_json::json;

    fn create_note(id: &str, author: &str, content: &str) -> Value {
        json!({
            "type": "Create",
            "actor": author,
            "object": {
                "type": "Note",
                "id": id,
                "content": content,
                "to": [crate::PUBLIC_IRI],
                "attributedTo": author,
            },
        })
    }

    #[tokio::test]
    async fn create_note_persists_once() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = create_note("https://ex.example/n/1", "https://ex.example/u/bob", "hi");

        let got = ingest(&engine, &alice, &item, "ex.example").await.unwrap();
        assert_eq!(got.what, "honk");
        assert_eq!(got.text, "<p>hi");
        assert!(got.public);
        assert_eq!(got.audience[0], crate::PUBLIC_IRI);
        assert!(got.thread.starts_with("data:,missing-"));
        assert_eq!(got.whofore, 0);

        let saved = engine
            .store
            .get_activity(alice.id, "https://ex.example/n/1")
            .unwrap()
            .unwrap();
        assert_eq!(saved.thread, got.thread);

        // Second identical delivery: still exactly one row.
        ingest(&engine, &alice, &item, "ex.example").await;
        let conn = rusqlite::Connection::open(engine.store.path()).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM activities WHERE xid = 'https://ex.example/n/1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn forged_delete_is_refused() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = create_note("https://ex.example/n/1", "https://ex.example/u/bob", "hi");
        ingest(&engine, &alice, &item, "ex.example").await;

        let del = json!({
            "type": "Delete",
            "actor": "https://evil.example/u/x",
            "object": "https://ex.example/n/1",
        });
        ingest(&engine, &alice, &del, "evil.example").await;
        assert!(engine
            .store
            .get_activity(alice.id, "https://ex.example/n/1")
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn same_origin_delete_zonks_and_suppresses_reingest() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = create_note("https://ex.example/n/1", "https://ex.example/u/bob", "hi");
        ingest(&engine, &alice, &item, "ex.example").await;

        let del = json!({
            "type": "Delete",
            "actor": "https://ex.example/u/bob",
            "object": "https://ex.example/n/1",
        });
        ingest(&engine, &alice, &del, "ex.example").await;
        assert!(engine
            .store
            .get_activity(alice.id, "https://ex.example/n/1")
            .unwrap()
            .is_none());
        assert!(engine.store.is_zonked(alice.id, "https://ex.example/n/1").unwrap());

        ingest(&engine, &alice, &item, "ex.example").await;
        assert!(engine
            .store
            .get_activity(alice.id, "https://ex.example/n/1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn announce_with_embedded_object_becomes_share() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = json!({
            "type": "Announce",
            "actor": "https://ex.example/u/bob",
            "object": {
                "type": "Note",
                "id": "https://ex.example/n/2",
                "content": "original post",
                "to": [crate::PUBLIC_IRI],
                "attributedTo": "https://ex.example/u/carol",
            },
        });
        let got = ingest(&engine, &alice, &item, "ex.example").await.unwrap();
        assert_eq!(got.what, "share");
        assert_eq!(got.author, "https://ex.example/u/bob");
        assert_eq!(got.oonker, "https://ex.example/u/carol");
    }

    #[tokio::test]
    async fn update_replaces_content_in_place() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        ingest(
            &engine,
            &alice,
            &create_note("https://ex.example/n/3", "https://ex.example/u/bob", "first"),
            "ex.example",
        )
        .await;
        let before = engine
            .store
            .get_activity(alice.id, "https://ex.example/n/3")
            .unwrap()
            .unwrap();

        let upd = json!({
            "type": "Update",
            "actor": "https://ex.example/u/bob",
            "object": {
                "type": "Note",
                "id": "https://ex.example/n/3",
                "content": "second",
                "to": [crate::PUBLIC_IRI],
                "attributedTo": "https://ex.example/u/bob",
            },
        });
        ingest(&engine, &alice, &upd, "ex.example").await;
        let after = engine
            .store
            .get_activity(alice.id, "https://ex.example/n/3")
            .unwrap()
            .unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.text, "<p>second");
    }

    #[tokio::test]
    async fn reply_adopts_known_parent_thread() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let parent = json!({
            "type": "Note",
            "id": "https://ex.example/n/parent",
            "content": "root",
            "context": "tag:ex.example,thread-x",
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/bob",
        });
        ingest(&engine, &alice, &parent, "ex.example").await;

        let reply = json!({
            "type": "Note",
            "id": "https://ex.example/n/reply",
            "content": "child",
            "inReplyTo": "https://ex.example/n/parent",
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/carol",
        });
        let got = ingest(&engine, &alice, &reply, "ex.example").await.unwrap();
        assert_eq!(got.what, "tonk");
        let saved = engine
            .store
            .get_activity(alice.id, "https://ex.example/n/reply")
            .unwrap()
            .unwrap();
        assert_eq!(saved.thread, "tag:ex.example,thread-x");
    }

    #[tokio::test]
    async fn cross_origin_object_id_is_original_sin() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = create_note("https://other.example/n/1", "https://ex.example/u/bob", "hi");
        assert!(ingest(&engine, &alice, &item, "ex.example").await.is_none());
        assert!(engine
            .store
            .get_activity(alice.id, "https://other.example/n/1")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn question_choices_become_a_list() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let q = json!({
            "type": "Question",
            "id": "https://ex.example/n/q1",
            "content": "geese?",
            "oneOf": [{"name": "yes"}, {"name": "obviously"}],
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/bob",
        });
        let got = ingest(&engine, &alice, &q, "ex.example").await.unwrap();
        assert_eq!(got.what, "qonk");
        assert!(got.text.contains("<ul><li>yes<li>obviously</ul>"));
    }

    #[tokio::test]
    async fn event_times_and_sensitivity() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let ev = json!({
            "type": "Event",
            "id": "https://ex.example/n/e1",
            "content": "goose meetup",
            "sensitive": true,
            "startTime": "2026-09-01T18:00:00Z",
            "duration": "PT2H",
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/bob",
        });
        let got = ingest(&engine, &alice, &ev, "ex.example").await.unwrap();
        assert_eq!(got.what, "event");
        assert_eq!(got.precis, "unspecified horror");
        let t = got.time.unwrap();
        assert_eq!(t.duration_secs, 7200);
    }

    #[tokio::test]
    async fn mention_of_me_sets_whofore() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let note = json!({
            "type": "Note",
            "id": "https://ex.example/n/m1",
            "content": "hey @alice",
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/bob",
            "tag": [
                {"type": "Mention", "name": "@alice@gander.example", "href": alice.url},
                {"type": "Hashtag", "name": "geese"},
                {"type": "Hashtag", "name": "#geese"},
            ],
        });
        let got = ingest(&engine, &alice, &note, "ex.example").await.unwrap();
        assert_eq!(got.whofore, 1);
        assert_eq!(got.hashtags, vec!["#geese".to_string()]);
        assert_eq!(got.mentions.len(), 1);
    }

    #[tokio::test]
    async fn metadata_only_attachment_is_kept_without_body() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let note = json!({
            "type": "Note",
            "id": "https://ex.example/n/a1",
            "content": "movie night",
            "to": [crate::PUBLIC_IRI],
            "attributedTo": "https://ex.example/u/bob",
            "attachment": [{
                "type": "Document",
                "mediaType": "video/mp4",
                "url": "https://ex.example/media/clip.mp4",
                "name": "clip",
            }],
        });
        let got = ingest(&engine, &alice, &note, "ex.example").await.unwrap();
        assert_eq!(got.attachments.len(), 1);
        let att = &got.attachments[0];
        assert!(!att.local);
        assert!(att.xid.is_empty());
        assert_eq!(att.url, "https://ex.example/media/clip.mp4");
    }

    #[tokio::test]
    async fn chat_messages_bypass_the_timeline() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let msg = json!({
            "type": "ChatMessage",
            "id": "https://ex.example/n/c1",
            "content": "psst",
            "to": [alice.url],
            "attributedTo": "https://ex.example/u/bob",
        });
        assert!(ingest(&engine, &alice, &msg, "ex.example").await.is_none());
        assert!(engine
            .store
            .get_activity(alice.id, "https://ex.example/n/c1")
            .unwrap()
            .is_none());
        let conn = rusqlite::Connection::open(engine.store.path()).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM chatMessages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn unknown_types_are_dropped() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let item = json!({"type": "Arrive", "id": "https://ex.example/n/x", "actor": "https://ex.example/u/bob"});
        assert!(ingest(&engine, &alice, &item, "ex.example").await.is_none());
    }

    #[tokio::test]
    async fn serialized_honks_survive_reingestion() {
        // Alice's server renders an envelope; Bob's server ingests it.
        let (_dir_a, engine_a) = test_engine("gander.example", "alice").await;
        let alice = engine_a.user_by_name("alice").await.unwrap();
        let (_dir_b, engine_b) = test_engine("ex.example", "bob").await;
        let bob = engine_b.user_by_name("bob").await.unwrap();

        let mut h = Activity {
            userid: alice.id,
            what: "honk".to_string(),
            author: alice.url.clone(),
            xid: format!("{}/h/abc123xyz", alice.url),
            date: Some(Utc::now()),
            audience: vec![
                crate::PUBLIC_IRI.to_string(),
                bob.url.clone(),
                alice.url.clone(),
            ],
            public: true,
            text: "<p>hello bob".to_string(),
            precis: "greetings".to_string(),
            format: "html".to_string(),
            thread: "tag:gander.example,thread-rt".to_string(),
            whofore: 2,
            hashtags: vec!["#geese".to_string()],
            mentions: vec![Mention {
                who: "@bob@ex.example".to_string(),
                href: bob.url.clone(),
            }],
            ..Default::default()
        };
        engine_a.store.save_activity(&mut h).unwrap();

        let (mut j, _) =
            crate::serialize::envelope(&engine_a.settings, &engine_a.data_dir, &alice, &h);
        j["@context"] = json!(crate::AT_CONTEXT);

        let got = ingest(&engine_b, &bob, &j, "gander.example").await.unwrap();
        assert_eq!(got.author, alice.url);
        assert_eq!(got.text, h.text);
        assert_eq!(got.precis, h.precis);
        assert_eq!(got.thread, h.thread);
        assert_eq!(got.audience, h.audience);
        assert_eq!(got.hashtags, h.hashtags);
        assert_eq!(got.mentions.len(), 1);
        assert_eq!(got.mentions[0].href, bob.url);
        assert_eq!(got.whofore, 1);
        assert_eq!(got.what, "honk");
    }
}

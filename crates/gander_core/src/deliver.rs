/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::runtime::Engine;
use crate::store::{Activity, ChatMessage, User};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Fire-and-forget kinds skip the retry ladder.
pub fn matters(what: &str) -> bool {
    !matches!(what, "ack" | "react" | "deack")
}

/// The ladder: 5m, 1h, 4h, 12h, 24h. Past the fifth try the recipient is
/// considered dead.
pub fn backoff_for(tries: i64) -> Option<Duration> {
    let secs = match tries {
        1 => 5 * 60,
        2 => 60 * 60,
        3 => 4 * 60 * 60,
        4 => 12 * 60 * 60,
        5 => 24 * 60 * 60,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

async fn schedule_retry(engine: &Engine, tries: i64, userid: i64, rcpt: &str, msg: &[u8]) {
    let Some(base) = backoff_for(tries) else {
        info!("he's dead jim: {rcpt}");
        let hostname = crate::originate(rcpt);
        if !hostname.is_empty() {
            info!("clearing outbound for {hostname}");
            if let Err(e) = engine.store.purge_host_resubmissions(&hostname) {
                error!("error clearing outbound: {e:#}");
            }
        }
        return;
    };
    let tenth = (base.as_secs() / 10) as i64;
    let jitter = rand::thread_rng().gen_range(-tenth..=tenth);
    let due = Utc::now()
        + ChronoDuration::seconds(base.as_secs() as i64)
        + ChronoDuration::seconds(jitter);
    if let Err(e) = engine.store.add_resubmission(&due, tries, userid, rcpt, msg) {
        error!("error saving resubmission: {e:#}");
        return;
    }
    engine.force_delivery.notify_one();
}

/// Deliver one message to one recipient token under the global gate.
/// `%`-prefixed tokens carry a resolved inbox; everything else is an actor
/// IRI resolved through the box cache.
pub async fn deliverate(
    engine: Arc<Engine>,
    retries: i64,
    userid: i64,
    rcpt: String,
    msg: Vec<u8>,
    prio: bool,
) {
    let _permit = match engine.garage.acquire().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let Some(ki) = engine.key_info.get(userid).await else {
        error!("lost key for delivery");
        return;
    };
    let inbox = if let Some(resolved) = rcpt.strip_prefix('%') {
        resolved.to_string()
    } else {
        match engine.boxes.get(rcpt.clone()).await {
            Some(b) => b.inbox,
            None => {
                info!("failed getting inbox for {rcpt}");
                schedule_retry(&engine, retries + 1, userid, &rcpt, &msg).await;
                return;
            }
        }
    };
    if let Err(e) = engine.fetcher.post_msg(&ki, &inbox, &msg).await {
        info!("failed to post json to {inbox}: {e:#}");
        if prio {
            schedule_retry(&engine, retries + 1, userid, &rcpt, &msg).await;
        }
    }
}

async fn box_up(engine: &Engine, user: &User, addresses: &[String], useshared: bool) -> HashSet<String> {
    let mut rcpts = HashSet::new();
    for a in addresses {
        if a.is_empty()
            || a == crate::PUBLIC_IRI
            || a == &user.url
            || a.ends_with("/followers")
        {
            continue;
        }
        if a.starts_with('%') {
            rcpts.insert(a.clone());
            continue;
        }
        match engine.boxes.get(a.clone()).await {
            Some(b) if useshared && !b.shared.is_empty() => {
                rcpts.insert(format!("%{}", b.shared));
            }
            _ => {
                rcpts.insert(a.clone());
            }
        }
    }
    rcpts
}

/// Audience plus, for public activities, all followers and anyone observed
/// fetching the object, with shared-inbox coalescing throughout.
pub async fn collect_recipients(engine: &Engine, user: &User, act: &Activity) -> HashSet<String> {
    let mut rcpts = box_up(engine, user, &act.audience, act.public).await;
    if act.public {
        let followers = engine.store.followers(user.id).unwrap_or_else(|e| {
            warn!("error loading followers: {e:#}");
            Vec::new()
        });
        for f in followers {
            if f.xid == user.url {
                continue;
            }
            match engine.boxes.get(f.xid.clone()).await {
                Some(b) if !b.shared.is_empty() => {
                    rcpts.insert(format!("%{}", b.shared));
                }
                _ => {
                    rcpts.insert(f.xid);
                }
            }
        }
        for f in crate::tracks::backtracks(&engine.store, &engine.tracker, &act.xid).await {
            if f.starts_with('%') {
                rcpts.insert(f);
                continue;
            }
            match engine.boxes.get(f.clone()).await {
                Some(b) if !b.shared.is_empty() => {
                    rcpts.insert(format!("%{}", b.shared));
                }
                _ => {
                    rcpts.insert(f);
                }
            }
        }
    }
    rcpts
}

/// Serialize a local activity and fan it out to the world.
pub async fn federate(engine: &Arc<Engine>, user: &User, act: &Activity) {
    let (mut j, _) = crate::serialize::envelope(&engine.settings, &engine.data_dir, user, act);
    j["@context"] = json!(crate::AT_CONTEXT);
    let msg = match serde_json::to_vec(&j) {
        Ok(m) => m,
        Err(e) => {
            error!("error serializing activity: {e:#}");
            return;
        }
    };
    let rcpts = collect_recipients(engine, user, act).await;
    let prio = matters(&act.what);
    for rcpt in rcpts {
        let engine = engine.clone();
        let msg = msg.clone();
        let userid = user.id;
        tokio::spawn(async move {
            deliverate(engine, 0, userid, rcpt, msg, prio).await;
        });
    }
    if act.public && !act.hashtags.is_empty() {
        collective_action(engine, act).await;
    }
}

/// Hashtag follows live on the server actor: notify tag followers with an
/// Add pointing at the tag collection.
pub async fn collective_action(engine: &Arc<Engine>, act: &Activity) {
    let Ok(server) = engine.server_user().await else {
        error!("lost server user");
        return;
    };
    for hashtag in &act.hashtags {
        let hashtag = hashtag.to_lowercase();
        let dubs = engine
            .store
            .named_followers(server.id, &hashtag)
            .unwrap_or_default();
        if dubs.is_empty() {
            continue;
        }
        let j = json!({
            "@context": crate::AT_CONTEXT,
            "type": "Add",
            "id": format!("{}/add/{}", server.url, crate::serialize::shortxid(&format!("{hashtag}{}", act.xid))),
            "actor": server.url,
            "object": act.xid,
            "target": format!("https://{}/o/{}", engine.settings.server_name, hashtag.trim_start_matches('#')),
        });
        let msg = serde_json::to_vec(&j).unwrap_or_default();
        let mut rcpts = HashSet::new();
        for dub in dubs {
            match engine.boxes.get(dub.xid.clone()).await {
                Some(b) if !b.shared.is_empty() => {
                    rcpts.insert(format!("%{}", b.shared));
                }
                _ => {
                    rcpts.insert(dub.xid);
                }
            }
        }
        for rcpt in rcpts {
            let engine = engine.clone();
            let msg = msg.clone();
            let userid = server.id;
            tokio::spawn(async move {
                deliverate(engine, 0, userid, rcpt, msg, false).await;
            });
        }
    }
}

/// Accept an inbound follow request.
pub async fn accept_follow(engine: Arc<Engine>, user: User, req: Value) {
    let actor = req
        .get("actor")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string();
    if actor.is_empty() {
        return;
    }
    let j = json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{}/dub/{}", user.url, crate::serialize::random_xid()),
        "type": "Accept",
        "actor": user.url,
        "to": actor,
        "published": crate::store::db_time(&Utc::now()),
        "object": req,
    });
    let msg = serde_json::to_vec(&j).unwrap_or_default();
    deliverate(engine, 0, user.id, actor, msg, true).await;
}

pub async fn send_follow(engine: Arc<Engine>, user: User, xid: String, owner: String, folxid: String) {
    if xid.is_empty() {
        info!("can't subscribe to empty");
        return;
    }
    let j = json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{}/sub/{folxid}", user.url),
        "type": "Follow",
        "actor": user.url,
        "to": owner,
        "object": xid,
        "published": crate::store::db_time(&Utc::now()),
    });
    let msg = serde_json::to_vec(&j).unwrap_or_default();
    deliverate(engine, 0, user.id, owner, msg, true).await;
}

pub async fn send_undo_follow(
    engine: Arc<Engine>,
    user: User,
    xid: String,
    owner: String,
    folxid: String,
) {
    let j = json!({
        "@context": crate::AT_CONTEXT,
        "id": format!("{}/unsub/{folxid}", user.url),
        "type": "Undo",
        "actor": user.url,
        "to": owner,
        "object": {
            "id": format!("{}/sub/{folxid}", user.url),
            "type": "Follow",
            "actor": user.url,
            "to": owner,
            "object": xid,
        },
        "published": crate::store::db_time(&Utc::now()),
    });
    let msg = serde_json::to_vec(&j).unwrap_or_default();
    deliverate(engine, 0, user.id, owner, msg, true).await;
}

/// Direct reply to a Ping; no retry ladder.
pub async fn send_pong(engine: &Engine, user: &User, who: &str, obj: &str) {
    let Some(b) = engine.boxes.get(who.to_string()).await else {
        info!("no inbox to pong {who}");
        return;
    };
    let Some(ki) = engine.key_info.get(user.id).await else {
        return;
    };
    let j = json!({
        "@context": crate::AT_CONTEXT,
        "type": "Pong",
        "id": format!("{}/pong/{}", user.url, crate::serialize::random_xid()),
        "actor": user.url,
        "to": who,
        "object": obj,
    });
    let msg = serde_json::to_vec(&j).unwrap_or_default();
    if let Err(e) = engine.fetcher.post_msg(&ki, &b.inbox, &msg).await {
        error!("can't send pong: {e:#}");
    }
}

pub async fn send_chat(engine: &Arc<Engine>, user: &User, ch: &ChatMessage) {
    let j = crate::serialize::serialize_chat(user, ch);
    let msg = serde_json::to_vec(&j).unwrap_or_default();
    let engine = engine.clone();
    let userid = user.id;
    let target = ch.target.clone();
    tokio::spawn(async move {
        deliverate(engine, 0, userid, target, msg, true).await;
    });
}

const SETTLE: Duration = Duration::from_secs(1);

/// Single background task draining due resubmissions. Sleeps until the
/// earliest due time; enqueue sites nudge it through the Notify.
pub async fn redelivery_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut sleep_dur = Duration::from_secs(5);
    loop {
        tokio::select! {
            _ = engine.force_delivery.notified() => {
                // let a burst of enqueues coalesce
                tokio::time::sleep(SETTLE).await;
            }
            _ = tokio::time::sleep(sleep_dur) => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }

        let rows = match engine.store.resubmission_times() {
            Ok(rows) => rows,
            Err(e) => {
                error!("error loading resubmissions: {e:#}");
                tokio::time::sleep(Duration::from_secs(60)).await;
                continue;
            }
        };

        let now = Utc::now();
        let mut nexttime: DateTime<Utc> = now + ChronoDuration::hours(24);
        for d in rows {
            let Some(due) = d.due else { continue };
            if due <= now {
                let loaded = match engine.store.load_resubmission(d.id) {
                    Ok(Some(v)) => v,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("error scanning resubmission: {e:#}");
                        continue;
                    }
                };
                if let Err(e) = engine.store.delete_resubmission(d.id) {
                    error!("error deleting resubmission: {e:#}");
                    continue;
                }
                let (tries, userid, rcpt, msg) = loaded;
                info!("redeliverating {rcpt} try {tries}");
                deliverate(engine.clone(), tries, userid, rcpt, msg, true).await;
            } else if due < nexttime {
                nexttime = due;
            }
        }
        let now = Utc::now();
        sleep_dur = Duration::from_secs(5);
        if now < nexttime {
            sleep_dur += (nexttime - now).to_std().unwrap_or_default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::test_engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn public_honk(user: &User, xid: &str) -> Activity {
        Activity {
            userid: user.id,
            what: "honk".to_string(),
            author: user.url.clone(),
            xid: xid.to_string(),
            date: Some(Utc::now()),
            audience: vec![crate::PUBLIC_IRI.to_string()],
            public: true,
            text: "<p>hello world".to_string(),
            format: "html".to_string(),
            thread: "data:,t1".to_string(),
            whofore: 2,
            ..Default::default()
        }
    }

    #[test]
    fn ladder_shape() {
        assert_eq!(backoff_for(1), Some(Duration::from_secs(300)));
        assert_eq!(backoff_for(2), Some(Duration::from_secs(3600)));
        assert_eq!(backoff_for(3), Some(Duration::from_secs(4 * 3600)));
        assert_eq!(backoff_for(4), Some(Duration::from_secs(12 * 3600)));
        assert_eq!(backoff_for(5), Some(Duration::from_secs(24 * 3600)));
        assert_eq!(backoff_for(6), None);
        assert!(!matters("ack"));
        assert!(!matters("react"));
        assert!(matters("honk"));
        assert!(matters("zonk"));
    }

    #[tokio::test]
    async fn retries_enqueue_with_due_times_and_sixth_purges_host() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        schedule_retry(&engine, 1, alice.id, "https://dead.example/u/bob", b"{}").await;
        let rows = engine.store.resubmission_times().unwrap();
        assert_eq!(rows.len(), 1);
        let due = rows[0].due.unwrap();
        let delta = (due - Utc::now()).num_seconds();
        // 5 minutes give or take the 10% jitter
        assert!((240..=390).contains(&delta), "delta was {delta}");

        schedule_retry(&engine, 6, alice.id, "https://dead.example/u/bob", b"{}").await;
        assert!(engine.store.resubmission_times().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recipients_coalesce_on_shared_inboxes() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        for who in ["bob", "carol"] {
            let xid = format!("https://ex.example/u/{who}");
            engine
                .store
                .set_boxes(
                    &xid,
                    &format!("{xid}/inbox"),
                    &format!("{xid}/outbox"),
                    "https://ex.example/inbox",
                )
                .unwrap();
            engine
                .store
                .save_follow(alice.id, who, &xid, "dub", "", &format!("fol-{who}"))
                .unwrap();
        }

        let act = public_honk(&alice, "https://gander.example/u/alice/h/x1");
        let rcpts = collect_recipients(&engine, &alice, &act).await;
        assert_eq!(rcpts.len(), 1);
        assert!(rcpts.contains("%https://ex.example/inbox"));
    }

    #[tokio::test]
    async fn audience_filtering_drops_noise() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        engine
            .store
            .set_boxes(
                "https://ex.example/u/bob",
                "https://ex.example/u/bob/inbox",
                "",
                "",
            )
            .unwrap();
        let mut act = public_honk(&alice, "https://gander.example/u/alice/h/x2");
        act.public = false;
        act.audience = vec![
            String::new(),
            crate::PUBLIC_IRI.to_string(),
            alice.url.clone(),
            "https://ex.example/u/bob/followers".to_string(),
            "https://ex.example/u/bob".to_string(),
        ];
        let rcpts = collect_recipients(&engine, &alice, &act).await;
        assert_eq!(rcpts.len(), 1);
        // private: shared inbox is not used even if known
        assert!(rcpts.contains("https://ex.example/u/bob"));
    }

    async fn counting_server() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = {
            let hits = hits.clone();
            axum::Router::new().route(
                "/inbox",
                axum::routing::post(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        axum::http::StatusCode::ACCEPTED
                    }
                }),
            )
        };
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/inbox"), hits)
    }

    #[tokio::test]
    async fn one_post_per_shared_inbox() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let (inbox_url, hits) = counting_server().await;
        for who in ["bob", "carol", "dave"] {
            let xid = format!("https://ex.example/u/{who}");
            engine
                .store
                .set_boxes(&xid, &format!("{xid}/inbox"), "", &inbox_url)
                .unwrap();
            engine
                .store
                .save_follow(alice.id, who, &xid, "dub", "", &format!("fol-{who}"))
                .unwrap();
        }
        let act = public_honk(&alice, "https://gander.example/u/alice/h/x3");
        federate(&engine, &alice, &act).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivery_drains_due_rows() {
        let (_dir, engine) = test_engine("gander.example", "alice").await;
        let alice = engine.user_by_name("alice").await.unwrap();
        let (inbox_url, hits) = counting_server().await;

        let past = Utc::now() - ChronoDuration::minutes(1);
        engine
            .store
            .add_resubmission(&past, 1, alice.id, &format!("%{inbox_url}"), b"{}")
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let loop_engine = engine.clone();
        let handle = tokio::spawn(async move {
            redelivery_loop(loop_engine, rx).await;
        });
        engine.force_delivery.notify_one();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
        while hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(engine.store.resubmission_times().unwrap().is_empty());

        tx.send(true).unwrap();
        let _ = handle.await;
    }
}

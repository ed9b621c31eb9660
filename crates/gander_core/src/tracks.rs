/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::Store;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(4 * 60);

enum Msg {
    Track { xid: String, who: String },
    Dump(oneshot::Sender<()>),
}

/// Buffers observations of who fetched which local object and writes them
/// out in batches. Readers ask for a flush first so they see everything.
#[derive(Clone)]
pub struct Tracker {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Tracker {
    pub fn start(store: Store, mut shutdown: watch::Receiver<bool>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut pending: HashMap<String, Vec<String>> = HashMap::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(Msg::Track { xid, who }) => {
                            pending.entry(xid).or_default().push(who);
                        }
                        Some(Msg::Dump(done)) => {
                            flush(&store, &mut pending);
                            let _ = done.send(());
                        }
                        None => {
                            flush(&store, &mut pending);
                            return;
                        }
                    },
                    _ = interval.tick() => {
                        flush(&store, &mut pending);
                    }
                    _ = shutdown.changed() => {
                        flush(&store, &mut pending);
                        return;
                    }
                }
            }
        });
        Self { tx }
    }

    /// Record that `who` fetched `xid`. Never blocks.
    pub fn track(&self, xid: &str, who: &str) {
        if who.is_empty() {
            return;
        }
        let _ = self.tx.send(Msg::Track {
            xid: xid.to_string(),
            who: who.to_string(),
        });
    }

    /// Wait for buffered observations to hit the database.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Msg::Dump(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn flush(store: &Store, pending: &mut HashMap<String, Vec<String>>) {
    if pending.is_empty() {
        return;
    }
    let count: usize = pending.values().map(|v| v.len()).sum();
    if let Err(e) = store.merge_tracks(pending) {
        warn!("error saving tracks: {e:#}");
    } else {
        debug!("saved {count} new fetches");
    }
    pending.clear();
}

/// Delivery tokens for everyone observed fetching an object: key owners
/// become actor IRIs, bare hosts turn into already-resolved shared inboxes.
pub async fn backtracks(store: &Store, tracker: &Tracker, xid: &str) -> Vec<String> {
    tracker.flush().await;
    let raw = match store.get_tracks(xid) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!("error scanning tracks: {e:#}");
            return Vec::new();
        }
    };
    raw.split(' ')
        .filter(|f| !f.is_empty())
        .map(|f| {
            let f = match f.rfind('#') {
                Some(idx) => &f[..idx],
                None => f,
            };
            if f.starts_with("https://") {
                f.to_string()
            } else {
                format!("%https://{f}/inbox")
            }
        })
        .collect()
}

/// Who fetched this object: the signature's keyId when the request carried
/// one, else the host advertised in the user agent.
pub fn requester_of(user_agent: &str, signature_header: Option<&str>) -> String {
    if let Some(sig) = signature_header {
        if let Ok(params) = crate::http_sig::parse_signature_header(sig) {
            return params.key_id;
        }
    }
    crate::originate(user_agent)
}

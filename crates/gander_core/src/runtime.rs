/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::blob::BlobStore;
use crate::cache::{Cache, CacheOptions};
use crate::config::Settings;
use crate::fetch::{Fetcher, KeyInfo};
use crate::store::{ActorBoxes, Store, User, SERVER_UID};
use crate::tracks::Tracker;
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{error, info};

pub const DELIVERY_PERMITS: usize = 40;

/// Everything the server holds at runtime. What the original kept as
/// process globals (statement handles, caches, limiter) lives here so tests
/// can build isolated engines against throwaway databases.
pub struct Engine {
    pub store: Store,
    pub blobs: BlobStore,
    pub settings: Settings,
    pub data_dir: PathBuf,
    pub fetcher: Fetcher,
    pub users_by_name: Cache<String, User>,
    pub users_by_id: Cache<i64, User>,
    pub key_info: Cache<i64, KeyInfo>,
    /// Actor IRI -> inbox/outbox/sharedInbox.
    pub boxes: Cache<String, ActorBoxes>,
    /// keyId -> PEM, with "failed" as a cached negative.
    pub pubkeys: Cache<String, String>,
    /// acct handle -> actor IRI ("" when the lookup failed).
    pub handles: Cache<String, String>,
    /// xid -> rendered public activity document.
    pub rendered: Cache<String, Vec<u8>>,
    /// username -> actor document.
    pub user_json: Cache<String, Vec<u8>>,
    /// username -> outbox collection.
    pub outboxes: Cache<String, Vec<u8>>,
    /// request path -> empty followers/following collection.
    pub empties: Cache<String, Vec<u8>>,
    /// Global delivery concurrency gate.
    pub garage: Arc<Semaphore>,
    /// Coalescing wake-up for the redelivery loop.
    pub force_delivery: Arc<Notify>,
    pub tracker: Tracker,
    pub shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let data_dir: PathBuf = data_dir.into();
        let store = Store::open(data_dir.join("gander.db"))?;
        let blobs = BlobStore::open(data_dir.join("blob.db"))?;
        let settings = Settings::load(&store)?;
        Self::assemble(data_dir, store, blobs, settings)
    }

    fn assemble(
        data_dir: PathBuf,
        store: Store,
        blobs: BlobStore,
        settings: Settings,
    ) -> Result<Arc<Self>> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let users_by_name = {
            let store = store.clone();
            let settings = settings.clone();
            Cache::new(CacheOptions::default(), move |name: String| {
                let store = store.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    let mut user = store.user_by_name(&name).ok()??;
                    user.url = settings.user_url(user.id, &user.name);
                    Some(user)
                })
            })
        };

        let users_by_id = {
            let store = store.clone();
            let settings = settings.clone();
            Cache::new(CacheOptions::default(), move |userid: i64| {
                let store = store.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    let mut user = store.user_by_id(userid).ok()??;
                    user.url = settings.user_url(user.id, &user.name);
                    Some(user)
                })
            })
        };

        let key_info = {
            let users = users_by_id.clone();
            Cache::new(CacheOptions::default(), move |userid: i64| {
                let users = users.clone();
                Box::pin(async move {
                    let user = users.get(userid).await?;
                    Some(KeyInfo {
                        key_id: format!("{}#key", user.url),
                        seckey_pem: user.seckey_pem,
                    })
                })
            })
        };

        let fetcher = Fetcher::new(
            settings.user_agent(),
            settings.sign_gets,
            settings.devel,
            Duration::from_secs(settings.fast_timeout_secs),
            Duration::from_secs(settings.slow_timeout_secs),
            key_info.clone(),
        )?;

        // keyId -> PEM. A lookup that cannot produce a decodable key caches
        // the sentinel "failed" so storms of bad requests stay cheap.
        let pubkeys = {
            let store = store.clone();
            let fetcher = fetcher.clone();
            Cache::new(
                CacheOptions {
                    ttl: None,
                    limit: Some(512),
                },
                move |keyid: String| {
                    let store = store.clone();
                    let fetcher = fetcher.clone();
                    Box::pin(async move {
                        if let Ok(Some(pem)) = store.get_pubkey(&keyid) {
                            return Some(pem);
                        }
                        tracing::debug!("hitting the webs for missing pubkey: {keyid}");
                        match fetcher.get_and_parse_slow(SERVER_UID, &keyid).await {
                            Ok(j) => {
                                crate::actors::ingest_actor(&store, &crate::originate(&keyid), &j);
                            }
                            Err(e) => {
                                tracing::info!("error getting {keyid} pubkey: {e:#}");
                                let _ = store.set_pubkey(&keyid, "failed");
                                return Some("failed".to_string());
                            }
                        }
                        match store.get_pubkey(&keyid) {
                            Ok(Some(pem)) => Some(pem),
                            _ => {
                                tracing::info!("key not found after ingesting");
                                let _ = store.set_pubkey(&keyid, "failed");
                                Some("failed".to_string())
                            }
                        }
                    })
                },
            )
        };

        let boxes = {
            let store = store.clone();
            let fetcher = fetcher.clone();
            Cache::new(CacheOptions::default(), move |ident: String| {
                let store = store.clone();
                let fetcher = fetcher.clone();
                Box::pin(async move {
                    if let Ok(Some(b)) = store.get_boxes(&ident) {
                        return Some(b);
                    }
                    tracing::debug!("need to get boxes for {ident}");
                    match fetcher.get_and_parse_slow(SERVER_UID, &ident).await {
                        Ok(j) => {
                            crate::actors::ingest_actor(&store, &crate::originate(&ident), &j)
                        }
                        Err(e) => {
                            tracing::debug!("error getting boxes: {e:#}");
                            return None;
                        }
                    }
                    store.get_boxes(&ident).ok()?
                })
            })
        };

        let handles = {
            let store = store.clone();
            let fetcher = fetcher.clone();
            Cache::new(
                CacheOptions {
                    ttl: Some(Duration::from_secs(60)),
                    limit: None,
                },
                move |acct: String| {
                    let store = store.clone();
                    let fetcher = fetcher.clone();
                    Box::pin(async move {
                        Some(crate::actors::webfinger_lookup(&store, &fetcher, &acct).await)
                    })
                },
            )
        };

        let rendered = {
            let store = store.clone();
            let settings = settings.clone();
            let users = users_by_id.clone();
            let data_dir = data_dir.clone();
            Cache::new(
                CacheOptions {
                    ttl: None,
                    limit: Some(128),
                },
                move |xid: String| {
                    let store = store.clone();
                    let settings = settings.clone();
                    let users = users.clone();
                    let data_dir = data_dir.clone();
                    Box::pin(async move {
                        let act = store.get_any_activity(&xid).ok()??;
                        if !act.public {
                            return None;
                        }
                        let user = users.get(act.userid).await?;
                        let (_, mut jo) =
                            crate::serialize::envelope(&settings, &data_dir, &user, &act);
                        jo["@context"] = serde_json::json!(crate::AT_CONTEXT);
                        serde_json::to_vec(&jo).ok()
                    })
                },
            )
        };

        let user_json = {
            let settings = settings.clone();
            let users = users_by_name.clone();
            Cache::new(
                CacheOptions {
                    ttl: Some(Duration::from_secs(60)),
                    limit: None,
                },
                move |name: String| {
                    let settings = settings.clone();
                    let users = users.clone();
                    Box::pin(async move {
                        let user = users.get(name).await?;
                        let j = crate::serialize::serialize_user(&settings, &user);
                        serde_json::to_vec(&j).ok()
                    })
                },
            )
        };

        let outboxes = {
            let store = store.clone();
            let settings = settings.clone();
            let users = users_by_name.clone();
            let data_dir = data_dir.clone();
            Cache::new(
                CacheOptions {
                    ttl: Some(Duration::from_secs(60)),
                    limit: None,
                },
                move |name: String| {
                    let store = store.clone();
                    let settings = settings.clone();
                    let users = users.clone();
                    let data_dir = data_dir.clone();
                    Box::pin(async move {
                        let user = users.get(name).await?;
                        let since = crate::store::db_time(
                            &(chrono::Utc::now()
                                - chrono::Duration::days(settings.display_days.max(0))),
                        );
                        let mut honks = store.activities_by_user(user.id, &since, 50).ok()?;
                        honks.truncate(20);
                        let j = crate::serialize::outbox_collection(
                            &settings, &data_dir, &user, &honks,
                        );
                        serde_json::to_vec(&j).ok()
                    })
                },
            )
        };

        let empties = {
            let settings = settings.clone();
            Cache::new(CacheOptions::default(), move |path: String| {
                let settings = settings.clone();
                Box::pin(async move {
                    serde_json::to_vec(&crate::serialize::empty_collection(&settings, &path)).ok()
                })
            })
        };

        let tracker = Tracker::start(store.clone(), shutdown_rx);

        Ok(Arc::new(Self {
            store,
            blobs,
            settings,
            data_dir,
            fetcher,
            users_by_name,
            users_by_id,
            key_info,
            boxes,
            pubkeys,
            handles,
            rendered,
            user_json,
            outboxes,
            empties,
            garage: Arc::new(Semaphore::new(DELIVERY_PERMITS)),
            force_delivery: Arc::new(Notify::new()),
            tracker,
            shutdown,
        }))
    }

    pub async fn user_by_name(&self, name: &str) -> Option<User> {
        self.users_by_name.get(name.to_string()).await
    }

    pub async fn user_by_id(&self, userid: i64) -> Option<User> {
        self.users_by_id.get(userid).await
    }

    /// The server user must exist; losing it is a startup invariant
    /// violation.
    pub async fn server_user(&self) -> Result<User> {
        self.user_by_id(SERVER_UID)
            .await
            .context("lost server user")
    }
}

/// Create the databases, the first user and the server user, and record
/// the minimum configuration. Mirrors what the original did interactively.
pub fn initialize(
    data_dir: &std::path::Path,
    username: &str,
    listen_addr: &str,
    server_name: &str,
) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir: {}", data_dir.display()))?;
    let store = Store::open(data_dir.join("gander.db"))?;
    let _ = BlobStore::open(data_dir.join("blob.db"))?;

    if !username.is_empty() {
        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("alphanumeric usernames only please");
        }
        let id = crate::keys::generate_identity()?;
        store.create_user(
            username,
            username,
            "what about me?",
            "*",
            &id.public_key_pem,
            &id.private_key_pem,
        )?;
    }
    let id = crate::keys::generate_identity()?;
    store.create_server_user(&id.public_key_pem, &id.private_key_pem)?;

    store.set_config("listenaddr", listen_addr)?;
    store.set_config("servername", server_name)?;
    let mut raw = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut raw);
    store.set_config("csrfkey", &hex::encode(raw))?;
    store.set_config("servermsg", "<h2>Things happen.</h2>")?;
    store.set_config("aboutmsg", "<h3>What is gander?</h3><p>Gander honks back.")?;
    store.set_config("loginmsg", "<h2>login</h2>")?;
    store.set_config("devel", "0")?;
    Ok(())
}

/// Bind, serve, and run the background loops until a termination signal.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    if engine.settings.listen_addr.is_empty() || engine.settings.server_name.is_empty() {
        anyhow::bail!("gander is not initialized. run gander init");
    }
    engine.server_user().await?;

    let mut tasks = Vec::new();
    {
        let engine = engine.clone();
        let shutdown_rx = engine.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            crate::deliver::redelivery_loop(engine.clone(), shutdown_rx).await;
        }));
    }

    let app = {
        let engine = engine.clone();
        axum::Router::<()>::new()
            .fallback(axum::routing::any(
                move |req: axum::http::Request<axum::body::Body>| {
                    let engine = engine.clone();
                    async move { crate::web::handle(engine, req).await }
                },
            ))
            .layer(tower_http::trace::TraceLayer::new_for_http())
    };

    let shutdown_signal = {
        let engine = engine.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            let _ = engine.shutdown.send(true);
            engine.force_delivery.notify_one();
        }
    };

    let addr = engine.settings.listen_addr.clone();
    info!("listening on {addr}");
    if let Some(path) = addr.strip_prefix('/') {
        let path = format!("/{path}");
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("bind {path}"))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;
    }

    engine.tracker.flush().await;
    for t in tasks {
        if let Err(e) = t.await {
            error!("background task panicked: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Engine against throwaway databases, with one local user.
    pub async fn test_engine(server_name: &str, username: &str) -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().unwrap();
        initialize(dir.path(), username, "127.0.0.1:0", server_name).unwrap();
        // Outbound lookups must never leave the process during tests.
        let store = Store::open(dir.path().join("gander.db")).unwrap();
        store.set_config("signgets", "0").unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        (dir, engine)
    }
}

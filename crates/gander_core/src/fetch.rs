/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::cache::Cache;
use anyhow::{anyhow, Context, Result};
use http::{HeaderMap, Method, Uri};
use rand::Rng;
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info};

pub const JSON_BODY_LIMIT: usize = 1024 * 1024;
pub const BINARY_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Signing material for outbound requests on behalf of a user.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub key_id: String,
    pub seckey_pem: String,
}

/// Per-key request serializer: concurrent callers for the same key share
/// the one in-flight result instead of issuing duplicate requests.
pub struct FlightDeck<T> {
    inner: Arc<Mutex<HashMap<String, Arc<TokioMutex<Option<Result<T, String>>>>>>>,
}

impl<T> Clone for FlightDeck<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> FlightDeck<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn call<F>(&self, key: &str, fut: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, String>>,
    {
        let cell = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(None)))
                .clone()
        };
        let mut guard = cell.lock().await;
        if let Some(res) = guard.clone() {
            return res;
        }
        let res = fut.await;
        *guard = Some(res.clone());
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
        res
    }
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    devel_client: reqwest::Client,
    devel: bool,
    user_agent: String,
    sign_gets: bool,
    fast: Duration,
    slow: Duration,
    keys: Cache<i64, KeyInfo>,
    json_flights: FlightDeck<Value>,
    binary_flights: FlightDeck<Vec<u8>>,
}

impl Fetcher {
    pub fn new(
        user_agent: String,
        sign_gets: bool,
        devel: bool,
        fast: Duration,
        slow: Duration,
        keys: Cache<i64, KeyInfo>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let devel_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            devel_client,
            devel,
            user_agent,
            sign_gets,
            fast,
            slow,
            keys,
            json_flights: FlightDeck::new(),
            binary_flights: FlightDeck::new(),
        })
    }

    fn client(&self) -> &reqwest::Client {
        if self.devel {
            &self.devel_client
        } else {
            &self.client
        }
    }

    pub async fn get_and_parse_fast(&self, userid: i64, url: &str) -> Result<Value> {
        self.get_and_parse(userid, url, self.fast).await
    }

    pub async fn get_and_parse_slow(&self, userid: i64, url: &str) -> Result<Value> {
        self.get_and_parse(userid, url, self.slow).await
    }

    /// Slow-timeout fetch with a single long-delay retry on 502 or timeout,
    /// for reply-chain climbing where the remote may just be waking up.
    pub async fn get_and_parse_with_retry(&self, userid: i64, url: &str) -> Result<Value> {
        match self.get_and_parse(userid, url, self.slow).await {
            Ok(v) => Ok(v),
            Err(e) => {
                let emsg = e.to_string();
                if emsg.contains("http get status: 502") || emsg.contains("timeout") {
                    info!("trying again after error: {emsg}");
                    let delay = 60 + rand::thread_rng().gen_range(0..60);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    self.get_and_parse(userid, url, self.slow).await
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn get_and_parse(&self, userid: i64, url: &str, timeout: Duration) -> Result<Value> {
        debug!("outbound request: {url}");
        let res = self
            .json_flights
            .call(url, async {
                let accept = if url.contains(".well-known/webfinger?resource") {
                    "application/jrd+json"
                } else {
                    crate::ACTIVITY_JSON_CONTENT_TYPE
                };
                self.do_get_json(userid, url, accept, timeout)
                    .await
                    .map_err(|e| format!("{e:#}"))
            })
            .await;
        res.map_err(|e| anyhow!(e))
    }

    async fn do_get_json(
        &self,
        userid: i64,
        url: &str,
        accept: &str,
        timeout: Duration,
    ) -> Result<Value> {
        let mut req = self
            .client()
            .get(url)
            .timeout(timeout)
            .header("Accept", accept)
            .header("User-Agent", &self.user_agent);

        if self.sign_gets {
            if let Some(ki) = self.keys.get(userid).await {
                if let Ok(uri) = url.parse::<Uri>() {
                    let mut headers = HeaderMap::new();
                    if crate::http_sig::sign_request(
                        &ki.seckey_pem,
                        &ki.key_id,
                        &Method::GET,
                        &uri,
                        &mut headers,
                        &[],
                    )
                    .is_ok()
                    {
                        for (k, v) in headers.iter() {
                            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
                        }
                    }
                }
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.as_u16() != 200 {
            let sample = read_body_capped(resp, 100).await.unwrap_or_default();
            return Err(anyhow!(
                "http get status: {} [{}]",
                status.as_u16(),
                String::from_utf8_lossy(&sample)
            ));
        }
        let body = read_body_capped(resp, JSON_BODY_LIMIT).await?;
        let v: Value = serde_json::from_slice(&body)?;
        Ok(v)
    }

    /// Signed activity POST. Success is 200/201/202; anything else is the
    /// caller's problem (usually the retry ladder).
    pub async fn post_msg(&self, key: &KeyInfo, url: &str, msg: &[u8]) -> Result<()> {
        let uri: Uri = url.parse().context("parse inbox url")?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Type",
            crate::LDJSON_CONTENT_TYPE.parse().context("content type")?,
        );
        crate::http_sig::sign_request(
            &key.seckey_pem,
            &key.key_id,
            &Method::POST,
            &uri,
            &mut headers,
            msg,
        )?;
        let mut req = self
            .client()
            .post(url)
            .timeout(self.slow * 2)
            .header("User-Agent", &self.user_agent)
            .body(msg.to_vec());
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        let resp = req.send().await?;
        match resp.status().as_u16() {
            200 | 201 | 202 => {
                info!("successful post: {url} {}", resp.status().as_u16());
                Ok(())
            }
            code => Err(anyhow!("http post status: {code}")),
        }
    }

    /// Attachment bodies; larger cap, longer timeout, no signing.
    pub async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>> {
        debug!("outbound request: {url}");
        let res = self
            .binary_flights
            .call(url, async {
                self.do_get_binary(url).await.map_err(|e| format!("{e:#}"))
            })
            .await;
        res.map_err(|e| anyhow!(e))
    }

    async fn do_get_binary(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client()
            .get(url)
            .timeout(Duration::from_secs(60))
            .header("User-Agent", &self.user_agent)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !matches!(status, 200 | 201 | 202) {
            return Err(anyhow!("http get not 200: {status} {url}"));
        }
        read_body_capped(resp, BINARY_BODY_LIMIT).await
    }
}

async fn read_body_capped(mut resp: reqwest::Response, cap: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = cap.saturating_sub(buf.len());
        if room == 0 {
            break;
        }
        let take = room.min(chunk.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(buf)
}

/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, time::Duration};

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Signature: keyId="...",algorithm="rsa-sha256",headers="(request-target) host date digest",signature="base64"
pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        map.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
    }

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing signature"))?;
    let signature = B64
        .decode(signature_b64.as_bytes())
        .context("decode signature")?;

    Ok(SignatureParams {
        key_id,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

/// The owner IRI of a key id is everything before the fragment.
pub fn key_owner(key_id: &str) -> &str {
    match key_id.split_once('#') {
        Some((owner, _)) => owner,
        None => key_id,
    }
}

/// A verified key must belong to the claimed actor; returns the shared
/// origin when it does.
pub fn key_match(key_id: &str, actor: &str) -> Option<String> {
    if key_owner(key_id) == actor {
        let origin = crate::originate(actor);
        if !origin.is_empty() {
            return Some(origin);
        }
    }
    None
}

pub fn build_signing_string(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    signed_headers: &[String],
) -> Result<String> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(uri.path());
            out.push_str(&query);
            continue;
        }
        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

pub fn digest_header(body: &[u8]) -> String {
    format!("SHA-256={}", B64.encode(Sha256::digest(body)))
}

pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let Some(digest) = headers.get("Digest") else {
        return Ok(());
    };
    let digest = digest.to_str().context("Digest header not utf8")?;
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if !alg.trim().eq_ignore_ascii_case("SHA-256") {
        return Err(anyhow!("unsupported digest alg: {alg}"));
    }
    let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
    if expected.as_slice() != Sha256::digest(body).as_slice() {
        return Err(anyhow!("digest mismatch"));
    }
    Ok(())
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

pub fn verify_signature(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = crate::keys::decode_public_key(public_key_pem)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = Signature::try_from(signature).context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

/// Sign an outbound request in place: fills Date/Host, for bodies also a
/// SHA-256 Digest, and sets the Signature header.
pub fn sign_request(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }
    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let mut signed: Vec<String> = vec![
        "(request-target)".to_string(),
        "host".to_string(),
        "date".to_string(),
    ];
    if *method == Method::POST {
        if !headers.contains_key("Digest") {
            headers.insert("Digest", digest_header(body).parse().context("set Digest")?);
        }
        signed.push("digest".to_string());
    }

    let signing_string = build_signing_string(method, uri, headers, &signed)?;
    let private_key = crate::keys::decode_private_key(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        signed.join(" "),
        B64.encode(signature.to_bytes()),
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}

/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod actors;
pub mod blob;
pub mod cache;
pub mod config;
pub mod deliver;
pub mod fetch;
pub mod filters;
pub mod http_sig;
pub mod ingest;
pub mod keys;
pub mod media;
pub mod runtime;
pub mod serialize;
pub mod store;
pub mod tracks;
pub mod web;

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const LDJSON_CONTENT_TYPE: &str =
    r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;
pub const ACTIVITY_JSON_CONTENT_TYPE: &str = "application/activity+json";
pub const AT_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_IRI: &str = "https://www.w3.org/ns/activitystreams#Public";

const ACTIVITY_STREAMS_MEDIA_TYPES: [&str; 2] =
    ["application/ld+json", "application/activity+json"];

pub fn is_activity_streams_media_type(ct: &str) -> bool {
    let ct = ct.to_ascii_lowercase();
    ACTIVITY_STREAMS_MEDIA_TYPES
        .iter()
        .any(|at| ct.starts_with(at))
}

/// Host component of the first https IRI found, used for cross-origin
/// forgery checks (and user-agent sniffing, which is why it scans).
pub fn originate(u: &str) -> String {
    let Some(idx) = u.find("https://") else {
        return String::new();
    };
    u[idx + 8..]
        .split(|c| c == '/' || c == ' ' || c == '#' || c == ')')
        .next()
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn originate_extracts_host() {
        assert_eq!(originate("https://example.com/u/alice"), "example.com");
        assert_eq!(originate("https://example.com"), "example.com");
        assert_eq!(originate("https://example.com#key"), "example.com");
        assert_eq!(originate("http://example.com/u/alice"), "");
        assert_eq!(originate("garbage"), "");
    }

    #[test]
    fn media_type_detection() {
        assert!(is_activity_streams_media_type("application/activity+json"));
        assert!(is_activity_streams_media_type(LDJSON_CONTENT_TYPE));
        assert!(!is_activity_streams_media_type("text/html"));
    }
}

/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::{Activity, Store};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A per-user filter rule, stored as one JSON row. Matching is by actor
/// prefix and/or content substring; the only consequences in scope are
/// rejecting the activity outright and skipping media localization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub name: String,
    /// Actor IRI, IRI prefix, or bare hostname.
    #[serde(default)]
    pub actor: String,
    /// Also match when the actor appears in the audience.
    #[serde(default)]
    pub include_audience: bool,
    /// Substring matched against text and precis.
    #[serde(default)]
    pub text: String,
    /// Restrict the rule to shares (announces) of the actor.
    #[serde(default)]
    pub is_announce: bool,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub skip_media: bool,
}

impl Filter {
    fn matches_actor(&self, who: &str) -> bool {
        if self.actor.is_empty() || who.is_empty() {
            return false;
        }
        self.actor == who
            || self.actor == crate::originate(who)
            || who.starts_with(&self.actor)
    }

    fn matches(&self, act: &Activity) -> bool {
        let mut actor_ok = self.actor.is_empty();
        if !actor_ok {
            actor_ok = self.matches_actor(&act.author) || self.matches_actor(&act.oonker);
            if !actor_ok && self.include_audience {
                actor_ok = act.audience.iter().any(|a| self.matches_actor(a));
            }
        }
        if !actor_ok {
            return false;
        }
        if self.is_announce && act.oonker.is_empty() {
            return false;
        }
        if !self.text.is_empty() && !act.text.contains(&self.text) && !act.precis.contains(&self.text)
        {
            return false;
        }
        true
    }
}

pub fn load_filters(store: &Store, userid: i64) -> Vec<Filter> {
    let rows = match store.filters_json(userid) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("error loading filters: {e:#}");
            return Vec::new();
        }
    };
    rows.iter()
        .filter_map(|j| match serde_json::from_str(j) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("error parsing filter: {e:#}");
                None
            }
        })
        .collect()
}

pub fn save_filter(store: &Store, userid: i64, filter: &Filter) -> Result<()> {
    store.save_filter(userid, &serde_json::to_string(filter)?)
}

/// Should an object from this origin be refused before fetching anything.
pub fn reject_origin(store: &Store, userid: i64, iri: &str, is_announce: bool) -> bool {
    for f in load_filters(store, userid) {
        if !f.reject {
            continue;
        }
        if f.is_announce && !is_announce {
            continue;
        }
        if f.matches_actor(iri) {
            return true;
        }
    }
    false
}

/// Full check against a reified activity, including content substrings.
pub fn reject_activity(store: &Store, act: &Activity) -> bool {
    load_filters(store, act.userid)
        .iter()
        .any(|f| f.reject && f.matches(act))
}

pub fn skip_media(store: &Store, act: &Activity) -> bool {
    load_filters(store, act.userid)
        .iter()
        .any(|f| f.skip_media && f.matches(act))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gander.db")).unwrap();
        (dir, store)
    }

    fn foreign_activity(author: &str, text: &str) -> Activity {
        Activity {
            userid: 1,
            what: "honk".to_string(),
            author: author.to_string(),
            xid: "https://ex.example/n/1".to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn actor_prefix_rejection() {
        let (_dir, store) = test_store();
        save_filter(
            &store,
            1,
            &Filter {
                actor: "https://spam.example/".to_string(),
                reject: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(reject_origin(&store, 1, "https://spam.example/u/eve", false));
        assert!(!reject_origin(&store, 1, "https://ok.example/u/bob", false));
        assert!(reject_activity(
            &store,
            &foreign_activity("https://spam.example/u/eve", "hi")
        ));
    }

    #[test]
    fn hostname_rule_matches_whole_host() {
        let (_dir, store) = test_store();
        save_filter(
            &store,
            1,
            &Filter {
                actor: "spam.example".to_string(),
                reject: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(reject_origin(&store, 1, "https://spam.example/u/anyone", false));
    }

    #[test]
    fn content_substring_rejection() {
        let (_dir, store) = test_store();
        save_filter(
            &store,
            1,
            &Filter {
                text: "crypto giveaway".to_string(),
                reject: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(reject_activity(
            &store,
            &foreign_activity("https://ok.example/u/bob", "<p>big crypto giveaway now")
        ));
        assert!(!reject_activity(
            &store,
            &foreign_activity("https://ok.example/u/bob", "<p>pictures of geese")
        ));
    }

    #[test]
    fn announce_only_rules_spare_plain_posts() {
        let (_dir, store) = test_store();
        save_filter(
            &store,
            1,
            &Filter {
                actor: "https://loud.example/".to_string(),
                is_announce: true,
                reject: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!reject_origin(&store, 1, "https://loud.example/u/bob", false));
        assert!(reject_origin(&store, 1, "https://loud.example/u/bob", true));

        let mut act = foreign_activity("https://loud.example/u/bob", "hi");
        assert!(!reject_activity(&store, &act));
        act.oonker = "https://elsewhere.example/u/carol".to_string();
        assert!(reject_activity(&store, &act));
    }

    #[test]
    fn skip_media_rule() {
        let (_dir, store) = test_store();
        save_filter(
            &store,
            1,
            &Filter {
                actor: "https://heavy.example/".to_string(),
                skip_media: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(skip_media(
            &store,
            &foreign_activity("https://heavy.example/u/bob", "hi")
        ));
    }
}

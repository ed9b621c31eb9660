/*
 * SPDX-FileCopyrightText: 2026 Gander Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::Store;
use anyhow::Result;

/// Snapshot of the config table taken at startup. Values live in the
/// database so the admin tooling can change them; the running server reads
/// this immutable copy.
#[derive(Debug, Clone)]
pub struct Settings {
    /// TCP address, or an absolute path for a unix socket.
    pub listen_addr: String,
    pub server_name: String,
    /// Vanity hostname presented in webfinger subjects; defaults to
    /// server_name.
    pub masq_name: String,
    pub server_msg: String,
    pub about_msg: String,
    pub login_msg: String,
    pub user_sep: String,
    pub honk_sep: String,
    pub devel: bool,
    pub fast_timeout_secs: u64,
    pub slow_timeout_secs: u64,
    pub sign_gets: bool,
    pub csrf_key: String,
    /// Days of history served publicly.
    pub display_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: String::new(),
            server_name: String::new(),
            masq_name: String::new(),
            server_msg: String::new(),
            about_msg: String::new(),
            login_msg: String::new(),
            user_sep: "u".to_string(),
            honk_sep: "h".to_string(),
            devel: false,
            fast_timeout_secs: 5,
            slow_timeout_secs: 30,
            sign_gets: true,
            csrf_key: String::new(),
            display_days: 7,
        }
    }
}

fn get_or<'a>(v: &'a Option<String>, default: &'a str) -> &'a str {
    match v.as_deref() {
        Some(s) if !s.is_empty() => s,
        _ => default,
    }
}

impl Settings {
    pub fn load(store: &Store) -> Result<Self> {
        let mut s = Settings::default();
        s.listen_addr = store.get_config("listenaddr")?.unwrap_or_default();
        s.server_name = store.get_config("servername")?.unwrap_or_default();
        let masq = store.get_config("masqname")?;
        s.masq_name = get_or(&masq, &s.server_name).to_string();
        s.server_msg = store.get_config("servermsg")?.unwrap_or_default();
        s.about_msg = store.get_config("aboutmsg")?.unwrap_or_default();
        s.login_msg = store.get_config("loginmsg")?.unwrap_or_default();
        let user_sep = store.get_config("usersep")?;
        s.user_sep = get_or(&user_sep, "u").to_string();
        let honk_sep = store.get_config("honksep")?;
        s.honk_sep = get_or(&honk_sep, "h").to_string();
        s.devel = matches!(store.get_config("devel")?.as_deref(), Some("1"));
        if let Some(v) = store.get_config("fasttimeout")? {
            if let Ok(n) = v.parse() {
                s.fast_timeout_secs = n;
            }
        }
        if let Some(v) = store.get_config("slowtimeout")? {
            if let Ok(n) = v.parse() {
                s.slow_timeout_secs = n;
            }
        }
        if let Some(v) = store.get_config("signgets")? {
            s.sign_gets = v != "0";
        }
        s.csrf_key = store.get_config("csrfkey")?.unwrap_or_default();
        if let Some(v) = store.get_config("display.days")? {
            if let Ok(n) = v.parse() {
                s.display_days = n;
            }
        }
        Ok(s)
    }

    pub fn server_prefix(&self) -> String {
        format!("https://{}/", self.server_name)
    }

    pub fn user_url(&self, userid: i64, name: &str) -> String {
        if userid > 0 {
            format!("https://{}/{}/{}", self.server_name, self.user_sep, name)
        } else {
            format!("https://{}/{}", self.server_name, name)
        }
    }

    pub fn user_agent(&self) -> String {
        format!("honksnonk/5.0; {}", self.server_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_config_is_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gander.db")).unwrap();
        store.set_config("listenaddr", "127.0.0.1:31337").unwrap();
        store.set_config("servername", "gander.example").unwrap();

        let s = Settings::load(&store).unwrap();
        assert_eq!(s.listen_addr, "127.0.0.1:31337");
        assert_eq!(s.masq_name, "gander.example");
        assert_eq!(s.user_sep, "u");
        assert_eq!(s.honk_sep, "h");
        assert_eq!(s.fast_timeout_secs, 5);
        assert_eq!(s.slow_timeout_secs, 30);
        assert!(s.sign_gets);
        assert_eq!(s.display_days, 7);
    }

    #[test]
    fn overrides_are_honored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gander.db")).unwrap();
        store.set_config("servername", "gander.example").unwrap();
        store.set_config("masqname", "vanity.example").unwrap();
        store.set_config("usersep", "people").unwrap();
        store.set_config("signgets", "0").unwrap();
        store.set_config("slowtimeout", "60").unwrap();

        let s = Settings::load(&store).unwrap();
        assert_eq!(s.masq_name, "vanity.example");
        assert_eq!(s.user_url(1, "alice"), "https://gander.example/people/alice");
        assert_eq!(s.user_url(-2, "server"), "https://gander.example/server");
        assert!(!s.sign_gets);
        assert_eq!(s.slow_timeout_secs, 60);
        assert_eq!(s.user_agent(), "honksnonk/5.0; gander.example");
    }
}

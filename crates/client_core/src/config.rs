use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use shared::domain::UserId;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
pub const MAX_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub reconnect_delay_secs: u64,
    pub max_attachment_bytes: usize,
    pub message_page_size: u32,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            ws_url: None,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            message_page_size: 50,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn with_server_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Live endpoint for `user_id`. Without an explicit `ws_url` the REST base
    /// is reused with its scheme switched and `/ws` appended.
    pub fn websocket_url(&self, user_id: UserId) -> Result<Url> {
        let (raw, derived) = match &self.ws_url {
            Some(ws_url) => (ws_url.as_str(), false),
            None => (self.server_url.as_str(), true),
        };
        let mut url = Url::parse(raw).with_context(|| format!("invalid server url: {raw}"))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(anyhow!("unsupported url scheme for live connection: {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch {raw} to {scheme}"))?;
        if derived {
            let path = format!("{}/ws", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.query_pairs_mut()
            .append_pair("userId", &user_id.0.to_string());
        Ok(url)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    ws_url: Option<String>,
    reconnect_delay_secs: Option<u64>,
    max_attachment_bytes: Option<usize>,
    message_page_size: Option<u32>,
    event_buffer: Option<usize>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = apply_file_overrides(&mut settings, &raw) {
            tracing::warn!(path = %path.display(), "ignoring unreadable settings file: {err:#}");
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) -> Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw).context("failed to parse settings toml")?;

    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.ws_url {
        settings.ws_url = Some(v);
    }
    if let Some(v) = file_cfg.reconnect_delay_secs {
        settings.reconnect_delay_secs = v;
    }
    if let Some(v) = file_cfg.max_attachment_bytes {
        settings.max_attachment_bytes = v;
    }
    if let Some(v) = file_cfg.message_page_size {
        settings.message_page_size = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v;
    }
    Ok(())
}

fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("CHAT_WS_URL") {
        settings.ws_url = Some(v);
    }

    if let Some(v) = lookup("APP__RECONNECT_DELAY_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_secs = parsed;
        }
    }

    if let Some(v) = lookup("APP__MAX_ATTACHMENT_BYTES") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.max_attachment_bytes = parsed;
        }
    }

    if let Some(v) = lookup("APP__MESSAGE_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.message_page_size = parsed.clamp(1, 200);
        }
    }
}

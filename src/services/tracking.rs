//! Tracking Service
//!
//! Rewrites outgoing HTML so opens and clicks come back to us: every link is
//! routed through the click redirect and a 1x1 pixel is appended. Both steps
//! are idempotent.

use std::sync::OnceLock;

use base64::Engine;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::models::{mint_token, Recipient};

/// Transparent 1x1 GIF
const PIXEL_GIF_BASE64: &str = "R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

const CLICK_PATH: &str = "/track/click?";
const OPEN_PATH: &str = "/track/open?";

fn href_pattern() -> &'static Regex {
    static HREF: OnceLock<Regex> = OnceLock::new();
    HREF.get_or_init(|| {
        Regex::new(r#"(?i)\bhref(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).expect("href pattern is valid")
    })
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Public base URL of the tracking endpoints, without trailing slash
    pub base_url: String,
    /// Append the open pixel
    pub track_opens: bool,
    /// Rewrite links through the click redirect
    pub track_clicks: bool,
    /// Redirect target when a click carries no usable destination
    pub fallback_url: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            track_opens: true,
            track_clicks: true,
            fallback_url: "http://localhost:8080/".to_string(),
        }
    }
}

impl TrackingConfig {
    pub fn new(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            fallback_url: format!("{}/", base_url),
            base_url,
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, url: &str) -> Self {
        self.fallback_url = url.to_string();
        self
    }

    pub fn without_opens(mut self) -> Self {
        self.track_opens = false;
        self
    }

    pub fn without_clicks(mut self) -> Self {
        self.track_clicks = false;
        self
    }
}

/// HTML ready to send, with the token embedded in it
#[derive(Debug, Clone)]
pub struct StampedContent {
    pub html: String,
    pub tracking_token: String,
    /// The token was minted by this call and must be stored on the recipient
    pub newly_issued: bool,
}

/// Tracking service
pub struct TrackingService {
    config: TrackingConfig,
}

impl TrackingService {
    pub fn new(config: TrackingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Mint a fresh tracking token
    pub fn issue_token(&self) -> String {
        mint_token()
    }

    pub fn click_url(&self, token: &str, destination: &str) -> String {
        format!(
            "{}{}token={}&url={}",
            self.config.base_url,
            CLICK_PATH,
            encode(token),
            encode(destination)
        )
    }

    pub fn open_url(&self, token: &str) -> String {
        format!("{}{}token={}", self.config.base_url, OPEN_PATH, encode(token))
    }

    /// Stamp `html` for `recipient`, reusing its tracking token when it has one
    pub fn stamp(&self, html: &str, recipient: &Recipient) -> StampedContent {
        let (tracking_token, newly_issued) = match &recipient.tracking_token {
            Some(token) => (token.clone(), false),
            None => (self.issue_token(), true),
        };

        let html = self.stamp_with(html, &tracking_token);
        StampedContent {
            html,
            tracking_token,
            newly_issued,
        }
    }

    /// Rewrite links and append the pixel for a known token
    pub fn stamp_with(&self, html: &str, token: &str) -> String {
        let mut html = if self.config.track_clicks {
            self.rewrite_links(html, token)
        } else {
            html.to_string()
        };

        if self.config.track_opens {
            self.append_pixel(&mut html, token);
        }
        html
    }

    fn rewrite_links(&self, html: &str, token: &str) -> String {
        href_pattern()
            .replace_all(html, |caps: &Captures| {
                let (quote, raw) = match (caps.get(2), caps.get(3)) {
                    (Some(m), _) => ('"', m.as_str()),
                    (None, Some(m)) => ('\'', m.as_str()),
                    (None, None) => return caps[0].to_string(),
                };

                if !self.should_wrap(raw) {
                    return caps[0].to_string();
                }

                let destination = raw.trim().replace("&amp;", "&");
                format!("href{}{}{}{}", &caps[1], quote, self.click_url(token, &destination), quote)
            })
            .into_owned()
    }

    /// Whether a link still needs the click redirect. Only our own
    /// redirect counts as already wrapped.
    fn should_wrap(&self, raw: &str) -> bool {
        let url = raw.trim();
        !is_untrackable(url) && !url.starts_with(&format!("{}{}", self.config.base_url, CLICK_PATH))
    }

    fn append_pixel(&self, html: &mut String, token: &str) {
        if html.contains(&format!("{}{}", self.config.base_url, OPEN_PATH)) {
            return;
        }

        let pixel = format!(
            r#"<img src="{}" width="1" height="1" alt="" style="display:none;border:0" />"#,
            self.open_url(token)
        );
        match html.to_ascii_lowercase().rfind("</body>") {
            Some(pos) => html.insert_str(pos, &pixel),
            None => html.push_str(&pixel),
        }
    }

    /// Redirect target for a click: the destination when it is an absolute
    /// http(s) URL, otherwise the configured fallback
    pub fn safe_redirect(&self, destination: Option<&str>) -> String {
        destination
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .and_then(|d| url::Url::parse(d).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(String::from)
            .unwrap_or_else(|| self.config.fallback_url.clone())
    }

    /// Bytes of the tracking pixel
    pub fn pixel_bytes() -> &'static [u8] {
        static PIXEL: OnceLock<Vec<u8>> = OnceLock::new();
        PIXEL.get_or_init(|| {
            base64::engine::general_purpose::STANDARD
                .decode(PIXEL_GIF_BASE64)
                .unwrap_or_default()
        })
    }

    pub fn pixel_content_type() -> mime::Mime {
        mime::IMAGE_GIF
    }
}

impl Default for TrackingService {
    fn default() -> Self {
        Self::new(TrackingConfig::default())
    }
}

/// Links that are never tracked
fn is_untrackable(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    url.is_empty() || url.starts_with('#') || lower.starts_with("mailto:") || lower.starts_with("tel:")
}

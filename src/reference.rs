//! Message link parsing
//!
//! Turns `t.me` message links into [`MessageReference`]s. Accepted forms:
//!
//! - `https://t.me/<username>/<message>` (public)
//! - `https://t.me/<username>/<topic>/<message>` (public forum topic)
//! - `https://t.me/c/<channel>/<message>` (private)
//! - `https://t.me/c/<channel>/<topic>/<message>` (private forum topic)
//!
//! The scheme is optional, a trailing slash or query string is ignored, and
//! private channel ids are normalised to the `-100` prefixed form.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;
use crate::types::{ChatRef, MessageReference};

static PRIVATE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^https?://(?:t|telegram)\.me/c/(\d+)(?:/(\d+))?/(\d+)/?(?:\?.*)?$").unwrap()
});

static PUBLIC_LINK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^https?://(?:t|telegram)\.me/([A-Za-z0-9_]+)(?:/(\d+))?/(\d+)/?(?:\?.*)?$")
        .unwrap()
});

/// Username rules: 3-32 characters, alphanumeric or underscore, no leading/trailing underscore
fn is_valid_username(name: &str) -> bool {
    (3..=32).contains(&name.len())
        && !name.starts_with('_')
        && !name.ends_with('_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_id(raw: &str, link: &str) -> Result<i64, Error> {
    raw.parse()
        .map_err(|_| Error::InvalidReference(format!("number out of range in {link}")))
}

impl FromStr for MessageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidReference("empty link".to_string()));
        }

        let link = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else if trimmed.starts_with("t.me/") || trimmed.starts_with("telegram.me/") {
            format!("https://{trimmed}")
        } else {
            return Err(Error::InvalidReference(format!(
                "not a message link: {trimmed}"
            )));
        };

        if let Some(caps) = PRIVATE_LINK.captures(&link) {
            let channel = &caps[1];
            let chat_id = parse_id(&format!("-100{channel}"), &link)?;
            let topic_id = caps
                .get(2)
                .map(|m| parse_id(m.as_str(), &link))
                .transpose()?;
            let message_id = parse_id(&caps[3], &link)?;
            return Ok(MessageReference {
                chat: ChatRef::Id(chat_id),
                topic_id,
                message_id,
            });
        }

        if let Some(caps) = PUBLIC_LINK.captures(&link) {
            let username = &caps[1];
            if username == "c" || !is_valid_username(username) {
                return Err(Error::InvalidReference(format!(
                    "invalid username '{username}' in {link}"
                )));
            }
            let topic_id = caps
                .get(2)
                .map(|m| parse_id(m.as_str(), &link))
                .transpose()?;
            let message_id = parse_id(&caps[3], &link)?;
            return Ok(MessageReference {
                chat: ChatRef::Username(username.to_string()),
                topic_id,
                message_id,
            });
        }

        Err(Error::InvalidReference(format!(
            "unsupported link format: {link}"
        )))
    }
}

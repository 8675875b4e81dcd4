use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::attachment::AttachmentPolicy;
use crate::entity::{Actor, Role};

const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub attachments: AttachmentPolicy,
    /// Bearer token -> actor. Stands in for the external credential issuer.
    pub tokens: HashMap<String, Actor>,
}

impl Config {
    /// Read configuration from the environment (after `.env` has been loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let home_dir = get("HOME").unwrap_or_else(|| ".".into());
        let data_dir = PathBuf::from(home_dir).join(".supportline");

        let bind = get("SUPPORTLINE_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.into())
            .parse()
            .context("SUPPORTLINE_BIND is not a socket address")?;

        let db_path = get("SUPPORTLINE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("supportline.db"));

        let upload_dir = get("SUPPORTLINE_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("uploads"));

        let mut attachments = AttachmentPolicy::default();
        if let Some(max) = get("SUPPORTLINE_MAX_ATTACHMENT_BYTES") {
            attachments.max_bytes = max
                .trim()
                .parse()
                .context("SUPPORTLINE_MAX_ATTACHMENT_BYTES is not a number")?;
        }
        if let Some(max) = get("SUPPORTLINE_MAX_CAPTION_BYTES") {
            attachments.max_caption_bytes = max
                .trim()
                .parse()
                .context("SUPPORTLINE_MAX_CAPTION_BYTES is not a number")?;
        }
        if let Some(types) = get("SUPPORTLINE_IMAGE_TYPES") {
            attachments.image_types = split_list(&types)
                .map(|t| t.to_ascii_lowercase())
                .collect();
        }

        let tokens = parse_tokens(&get("SUPPORTLINE_TOKENS").unwrap_or_default())?;
        if tokens.is_empty() {
            warn!("No SUPPORTLINE_TOKENS configured. Every API call will be rejected.");
        } else {
            info!("Loaded {} API token(s)", tokens.len());
        }

        Ok(Self {
            bind,
            db_path,
            upload_dir,
            attachments,
            tokens,
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Parses `token=actor_id:role[:display name]` entries separated by commas.
fn parse_tokens(raw: &str) -> Result<HashMap<String, Actor>> {
    let mut tokens = HashMap::new();

    for entry in split_list(raw) {
        let Some((token, identity)) = entry.split_once('=') else {
            bail!("token entry '{}' is missing '='", entry);
        };

        let mut parts = identity.splitn(3, ':');
        let id = parts.next().unwrap_or_default().trim();
        let role: Role = parts
            .next()
            .with_context(|| format!("token entry for '{}' has no role", id))?
            .parse()?;
        let name = parts.next().map(str::trim).unwrap_or(id);

        if token.trim().is_empty() || id.is_empty() {
            bail!("token entry '{}' has an empty token or actor id", entry);
        }

        tokens.insert(token.trim().to_string(), Actor::new(id, name, role));
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_live_under_home() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/sam")])).unwrap();
        assert_eq!(config.bind, DEFAULT_BIND.parse::<SocketAddr>().unwrap());
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/sam/.supportline/supportline.db")
        );
        assert_eq!(config.upload_dir, PathBuf::from("/home/sam/.supportline/uploads"));
        assert_eq!(config.attachments.max_bytes, 10 * 1024 * 1024);
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("SUPPORTLINE_BIND", "127.0.0.1:8080"),
            ("SUPPORTLINE_MAX_ATTACHMENT_BYTES", "2048"),
            ("SUPPORTLINE_MAX_CAPTION_BYTES", "256"),
            ("SUPPORTLINE_IMAGE_TYPES", "image/PNG, image/avif"),
            (
                "SUPPORTLINE_TOKENS",
                "t1=cust-1:customer, t2=admin-a:staff:Alice Admin",
            ),
        ]))
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.attachments.max_bytes, 2048);
        assert_eq!(config.attachments.max_caption_bytes, 256);
        assert_eq!(config.attachments.image_types, ["image/png", "image/avif"]);

        let alice = &config.tokens["t2"];
        assert_eq!(alice.id, "admin-a");
        assert_eq!(alice.name, "Alice Admin");
        assert_eq!(alice.role, Role::Staff);
        assert_eq!(config.tokens["t1"].name, "cust-1");
    }

    #[test]
    fn malformed_tokens_fail_loudly() {
        assert!(parse_tokens("no-equals-sign").is_err());
        assert!(parse_tokens("t=cust-1").is_err());
        assert!(parse_tokens("t=cust-1:wizard").is_err());
        assert!(parse_tokens("=cust-1:customer").is_err());
    }
}

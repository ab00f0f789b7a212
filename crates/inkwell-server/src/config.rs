use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

use inkwell_api::service::{DEFAULT_PULL_LIMIT, MAX_PULL_LIMIT};
use inkwell_gateway::bus::DEFAULT_SHARDS;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub dispatch_shards: usize,
    /// Unset means the in-process directory is used.
    pub identity_url: Option<String>,
    pub content_url: Option<String>,
    pub pull_limit: u32,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = var("INKWELL_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("INKWELL_JWT_SECRET is unset or still a placeholder; it must match the auth service's secret");
        }

        let db_path = var("INKWELL_DB_PATH").unwrap_or_else(|| "inkwell.db".into()).into();
        let host = var("INKWELL_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("INKWELL_PORT")
            .unwrap_or_else(|| "3210".into())
            .parse()
            .context("INKWELL_PORT must be a port number")?;
        let addr = format!("{}:{}", host, port).parse().context("INKWELL_HOST must be an IP address")?;

        let dispatch_shards = match var("INKWELL_DISPATCH_SHARDS") {
            Some(v) => v.parse().context("INKWELL_DISPATCH_SHARDS must be a number")?,
            None => DEFAULT_SHARDS,
        };
        if dispatch_shards == 0 {
            bail!("INKWELL_DISPATCH_SHARDS must be at least 1");
        }

        let pull_limit = match var("INKWELL_PULL_LIMIT") {
            Some(v) => v.parse::<u32>().context("INKWELL_PULL_LIMIT must be a number")?.clamp(1, MAX_PULL_LIMIT),
            None => DEFAULT_PULL_LIMIT,
        };

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            dispatch_shards,
            identity_url: var("INKWELL_IDENTITY_URL").filter(|v| !v.is_empty()),
            content_url: var("INKWELL_CONTENT_URL").filter(|v| !v.is_empty()),
            pull_limit,
        })
    }
}

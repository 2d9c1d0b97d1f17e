use crate::auth::jwt::{JwtConfig, MissingJwtSecret};

/// Server configuration loaded from environment variables.
///
/// Everything except the token secret has a default suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Serve the HTML queue summary under `/ui` (default: off).
    pub dashboard_enabled: bool,
    /// Token configuration (secret, lifetime of minted tokens).
    pub jwt: JwtConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `BULLBOARD`            | unset (dashboard disabled) |
    ///
    /// Fails only when `JWT_SECRET` is missing; malformed numbers panic.
    pub fn from_env() -> Result<Self, MissingJwtSecret> {
        let jwt = JwtConfig::from_env()?;

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let dashboard_enabled = std::env::var("BULLBOARD")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            dashboard_enabled,
            jwt,
        })
    }
}

/// Any non-empty value other than `0` or `false` switches a flag on.
fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
}

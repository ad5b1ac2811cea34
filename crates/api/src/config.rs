//! API server configuration

use creatorpay_settlement::{SettlementConfig, SettlementError, SettlementResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Absent means the in-memory ledger (development only)
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub allowed_origins: Vec<String>,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
    pub settlement: SettlementConfig,
}

impl Config {
    pub fn from_env() -> SettlementResult<Self> {
        let settlement = SettlementConfig::from_env()?;

        let database_max_connections = match env("DATABASE_MAX_CONNECTIONS") {
            Some(raw) => raw.parse().map_err(|_| {
                SettlementError::Config(format!("DATABASE_MAX_CONNECTIONS is not a number: {}", raw))
            })?,
            None => 10,
        };

        Ok(Self {
            bind_address: env("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: env("DATABASE_URL"),
            database_max_connections,
            allowed_origins: parse_origins(
                &env("ALLOWED_ORIGINS")
                    .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string()),
            ),
            json_logs: env("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            settlement,
        })
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins() {
        assert_eq!(
            parse_origins(" https://app.creatorpay.io, ,http://localhost:3000 "),
            vec!["https://app.creatorpay.io", "http://localhost:3000"]
        );
        assert!(parse_origins("").is_empty());
    }
}

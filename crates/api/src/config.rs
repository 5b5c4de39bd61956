//! API server configuration

use resumehq_billing::BillingConfig;

pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .map_err(|_| anyhow::anyhow!("PORT must be a valid port number"))?;
        let billing = BillingConfig::from_env()?;

        Ok(Self {
            database_url,
            port,
            billing,
        })
    }
}

use anyhow::Context;
use clap::Args;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

/// Connection settings shared by every command that touches Postgres.
#[derive(Args, Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Upper bound on pooled connections
    #[arg(
        long,
        env = "ROLL_GROUPS_MAX_CONNECTIONS",
        default_value_t = 5,
        global = true
    )]
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        // A filter run pins one connection for its lock while it reads and writes on others.
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(2))
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }
}

/// Logs go to stderr; stdout is reserved for command output.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

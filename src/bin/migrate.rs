use anyhow::{Context, Result};
use tracing::info;
use transfer_watch::config;
use transfer_watch::repository::Database;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    dotenv::dotenv().ok();

    let database_url = config::database_url();
    info!("Creating schema in {}", database_url);

    Database::new(&database_url).context("Failed to open database")?;

    info!("Schema is up to date");
    Ok(())
}

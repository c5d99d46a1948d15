use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use todo_backend::{Config, db};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "todo_backend=debug".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = match db::connect(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("failed to open {}: {}", config.database_url, e);
            return Err(e.into());
        }
    };

    let todos = db::repository::count_todos(&pool).await?;
    info!("schema up to date, {} todos stored", todos);

    pool.close().await;
    Ok(())
}

//! Shared Postgres test infrastructure.
//!
//! One container serves every test in the binary; each test works in its
//! own randomly suffixed table prefix, so tests never see each other's
//! rows and can run concurrently.

use std::sync::Arc;

use anyhow::{Context, Result};
use silo::{Backend, PostgresBackend};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedTestInfra {
    db_url: String,
    // Keeps the container alive for the entire test run.
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init() because any test may get here
        // first.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// A fresh backend session under a brand-new table prefix, with the
/// schema provisioned.
pub async fn fresh_backend(name: &str) -> (String, Arc<PostgresBackend>) {
    let prefix = format!("{}_{:08x}", name, rand::random::<u32>());
    let backend = session(&prefix).await;
    backend.create().await.expect("schema creation failed");
    (prefix, backend)
}

/// Another consumer session (new pool, new owner id) over an existing
/// prefix.
pub async fn session(prefix: &str) -> Arc<PostgresBackend> {
    let infra = SharedTestInfra::get().await;
    let pool = PgPool::connect(&infra.db_url)
        .await
        .expect("Failed to connect to test database");
    Arc::new(PostgresBackend::new(pool, prefix).expect("bad test prefix"))
}

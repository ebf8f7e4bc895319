//! Test harness with testcontainers for integration testing.
//!
//! One shared Postgres container serves the whole test run; each test gets
//! its own freshly-migrated database inside it, so tests can run in
//! parallel without stepping on each other's rows.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Connection string prefix without a database name.
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    /// Start the shared Postgres container. Called once on the first test.
    async fn init() -> Result<Self> {
        // Respect RUST_LOG for test debugging; try_init avoids panicking if
        // another test file got here first.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{}:{}", host, port);

        Ok(Self {
            base_url,
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

/// Per-test context: a dedicated, migrated database in the shared container.
///
/// # Example
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(PgTestContext)]
/// #[tokio::test]
/// async fn my_test(ctx: &mut PgTestContext) {
///     let queue = PostgresJobQueue::new(ctx.pool.clone());
///     // ... test code
/// }
/// ```
pub struct PgTestContext {
    /// Pool connected to this test's private database.
    pub pool: PgPool,
}

impl AsyncTestContext for PgTestContext {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test database")
    }

    async fn teardown(self) {
        self.pool.close().await;
    }
}

impl PgTestContext {
    async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("test_{}", Uuid::new_v4().simple());

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .connect(&format!("{}/postgres", infra.base_url))
            .await
            .context("Failed to connect to admin database")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{}""#, db_name))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&format!("{}/{}", infra.base_url, db_name))
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { pool })
    }
}

//! Opening the document database.
//!
//! Both entry points select the configured namespace and database and
//! bring the schema up to date, so the returned handle is ready for a
//! [`SurrealDocumentStore`](crate::SurrealDocumentStore).

use surrealdb::engine::local::{Db, Mem};
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use surrealdb::{Connection, Surreal};
use tracing::info;

use crate::error::DbError;
use crate::schema::run_migrations;

/// Where the document database lives.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// WebSocket address of the SurrealDB server, e.g. `127.0.0.1:8000`.
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:8000".into(),
            namespace: "cairn".into(),
            database: "documents".into(),
            username: "root".into(),
            password: "root".into(),
        }
    }
}

/// Connect to a SurrealDB server as root.
pub async fn open_remote(config: &DbConfig) -> Result<Surreal<Client>, DbError> {
    info!(url = %config.url, "Connecting to SurrealDB");
    let db = Surreal::new::<Ws>(&config.url).await?;
    db.signin(Root {
        username: config.username.clone(),
        password: config.password.clone(),
    })
    .await?;
    prepare(db, config).await
}

/// An in-process database whose documents are lost on drop. Only the
/// namespace and database names of `config` are used.
pub async fn open_in_memory(config: &DbConfig) -> Result<Surreal<Db>, DbError> {
    let db = Surreal::new::<Mem>(()).await?;
    prepare(db, config).await
}

async fn prepare<C: Connection>(db: Surreal<C>, config: &DbConfig) -> Result<Surreal<C>, DbError> {
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;
    run_migrations(&db).await?;
    info!(
        namespace = %config.namespace,
        database = %config.database,
        "Document database ready"
    );
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reopening_a_migrated_database_is_a_no_op() {
        let config = DbConfig {
            namespace: "test".into(),
            database: "test".into(),
            ..Default::default()
        };
        let db = open_in_memory(&config).await.unwrap();
        let db = prepare(db, &config).await.unwrap();
        run_migrations(&db).await.unwrap();
    }
}

//! Couche de persistance PostgreSQL
//!
//! Le stockage est l'autorité sur l'état durable; le cache n'est qu'un
//! accélérateur. Les opérations d'écriture sont génériques sur l'exécuteur
//! sqlx, si bien que la même fonction s'exécute dans ou hors transaction.
//! La portée transactionnelle est exposée par [`Storage::begin`].
//!
//! Suppression douce: les lectures filtrent `deleted_at IS NULL`; la
//! colonne ne sort jamais de cette couche.

mod chat;
mod users;

use crate::config::DatabaseConfig;
use crate::error::{ImError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

/// Accès au stockage relationnel
#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    /// Ouvre le pool de connexions d'après la configuration
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.connect_timeout)
            .idle_timeout(cfg.idle_timeout)
            .connect(cfg.url.as_str())
            .await
            .map_err(|e| ImError::database_error("connect", e))?;

        Ok(Self { pool })
    }

    /// Construit le stockage sur un pool déjà ouvert
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exécute les migrations embarquées
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ImError::internal_error(format!("migration: {}", e)))?;
        tracing::info!("🗄️ Migrations appliquées");
        Ok(())
    }

    /// Pool sous-jacent, pour les lectures hors transaction
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ouvre une portée transactionnelle (isolation par défaut du serveur;
    /// read-committed suffit, l'unicité de `seq` impose l'ordre)
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| ImError::database_error("begin", e))
    }
}

/// Convertit une erreur sqlx en erreur de domaine, en distinguant les
/// violations d'unicité (course entre insertions concurrentes)
pub(crate) fn map_db_error(operation: &str, err: sqlx::Error) -> ImError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return ImError::Conflict {
                reason: format!("{}: {}", operation, db_err.message()),
            };
        }
    }
    ImError::database_error(operation, err)
}

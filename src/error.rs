//! # Gestion d'erreurs unifiée du serveur IM
//!
//! Ce module fournit un système d'erreurs cohérent avec:
//! - Catégorisation des erreurs par domaine
//! - Codes d'erreur standardisés pour l'enveloppe API
//! - Distinction "absent" / "en panne" pour le cache
//! - Conversions depuis les erreurs externes (sqlx, redis, serde_json)

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Type alias pour Result avec notre erreur personnalisée
pub type Result<T> = std::result::Result<T, ImError>;

/// Erreurs principales du serveur de messagerie
#[derive(Error, Debug)]
pub enum ImError {
    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DE VALIDATION ET CONTENU
    // ═══════════════════════════════════════════════════════════════════════

    /// Paramètre requis manquant
    #[error("Paramètre requis manquant: {param}")]
    MissingParameter { param: String },

    /// Format de données invalide (JSON malformé, champ hors plage…)
    #[error("Format invalide pour {field}: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Type de message inconnu dans l'enveloppe WebSocket
    #[error("Type de message inconnu: {msg_type}")]
    UnknownMsgType { msg_type: i32 },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS D'AUTHENTIFICATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Identité absente ou invalide (fournie par le collaborateur d'auth)
    #[error("Accès refusé: {action}")]
    Unauthorized { action: String },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DE RESSOURCES
    // ═══════════════════════════════════════════════════════════════════════

    /// Ressource absente du stockage et du cache
    #[error("{resource} non trouvé(e): {id}")]
    NotFound { resource: String, id: String },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DE CAPACITÉ (RÉESSAYABLES)
    // ═══════════════════════════════════════════════════════════════════════

    /// Bucket de connexions plein
    #[error("Bucket {index} plein ({capacity} connexions)")]
    BucketFull { index: usize, capacity: usize },

    /// File du pool de push pleine
    #[error("Pool de push plein")]
    PoolFull,

    /// Insertion concurrente en conflit
    #[error("Conflit de données: {reason}")]
    Conflict { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS RÉSEAU ET WEBSOCKET
    // ═══════════════════════════════════════════════════════════════════════

    /// Écriture sur une connexion déjà fermée
    #[error("Connexion {conn_id} fermée")]
    ConnectionClosed { conn_id: i64 },

    /// Erreur de la couche WebSocket axum
    #[error("Erreur WebSocket: {source}")]
    WebSocket {
        #[source]
        source: axum::Error,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DE BASE DE DONNÉES ET CACHE
    // ═══════════════════════════════════════════════════════════════════════

    /// Erreur de base de données
    #[error("Erreur base de données: {operation}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Transaction échouée
    #[error("Transaction échouée: {reason}")]
    TransactionFailed { reason: String },

    /// Erreur du cache Redis (panne, pas un miss)
    #[error("Erreur cache: {operation}")]
    Cache {
        operation: String,
        #[source]
        source: redis::RedisError,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS FATALES ET SYSTÈME
    // ═══════════════════════════════════════════════════════════════════════

    /// Régression avérée du compteur de séquence; la conversation est gelée
    #[error("Corruption du compteur de séquence sur la conversation {conversation_id} (seq {seq})")]
    SequenceCorruption { conversation_id: i64, seq: i64 },

    /// Erreur de sérialisation JSON
    #[error("Erreur JSON: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },

    /// Erreur de configuration
    #[error("Erreur configuration: {message}")]
    Configuration { message: String },

    /// Erreur interne non spécifiée
    #[error("Erreur interne: {message}")]
    Internal { message: String },
}

impl ImError {
    /// Retourne le code d'erreur HTTP approprié
    pub fn http_status(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::MissingParameter { .. }
            | Self::InvalidFormat { .. }
            | Self::UnknownMsgType { .. } => 400,

            // 401 Unauthorized
            Self::Unauthorized { .. } => 401,

            // 404 Not Found
            Self::NotFound { .. } => 404,

            // 409 Conflict (capacité, doublon concurrent)
            Self::BucketFull { .. } | Self::PoolFull | Self::Conflict { .. } => 409,

            // 500 Internal Server Error
            Self::ConnectionClosed { .. }
            | Self::WebSocket { .. }
            | Self::Database { .. }
            | Self::TransactionFailed { .. }
            | Self::Cache { .. }
            | Self::SequenceCorruption { .. }
            | Self::Json { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => 500,
        }
    }

    /// Code pour l'enveloppe de réponse `{code, message, data}`.
    ///
    /// La table réservée ne connaît que {0, 400, 401, 404, 500}; les erreurs
    /// de capacité sont réessayables et remontent en 500.
    pub fn envelope_code(&self) -> i32 {
        match self.http_status() {
            400 => 400,
            401 => 401,
            404 => 404,
            _ => 500,
        }
    }

    /// Vrai si l'appelant peut réessayer l'opération telle quelle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BucketFull { .. } | Self::PoolFull | Self::Conflict { .. }
        )
    }

    /// Retourne un message d'erreur sécurisé pour le client
    pub fn public_message(&self) -> String {
        match self {
            Self::MissingParameter { param } => format!("Paramètre manquant: {}", param),
            Self::InvalidFormat { field, .. } => format!("Format invalide pour {}", field),
            Self::NotFound { resource, .. } => format!("{} non trouvé(e)", resource),
            Self::Unauthorized { .. } => "Non autorisé".to_string(),

            // Messages génériques pour éviter la divulgation d'informations
            Self::Database { .. } | Self::TransactionFailed { .. } => {
                "Erreur temporaire, veuillez réessayer".to_string()
            }
            Self::Cache { .. } | Self::Internal { .. } | Self::SequenceCorruption { .. } => {
                "Erreur interne du serveur".to_string()
            }
            Self::Configuration { .. } => "Service temporairement indisponible".to_string(),

            _ => self.to_string(),
        }
    }

    /// Crée une erreur de base de données avec contexte
    pub fn database_error(operation: &str, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            source,
        }
    }

    /// Crée une erreur de cache avec contexte
    pub fn cache_error(operation: &str, source: redis::RedisError) -> Self {
        Self::Cache {
            operation: operation.to_string(),
            source,
        }
    }

    /// Crée une erreur de ressource non trouvée
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// Crée une erreur d'autorisation avec contexte
    pub fn unauthorized(action: &str) -> Self {
        Self::Unauthorized {
            action: action.to_string(),
        }
    }

    /// Helper pour les paramètres manquants
    pub fn missing_parameter(param: &str) -> Self {
        Self::MissingParameter {
            param: param.to_string(),
        }
    }

    /// Helper pour les erreurs de format
    pub fn invalid_format(field: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidFormat {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Helper pour les erreurs de configuration
    pub fn configuration_error(message: &str) -> Self {
        Self::Configuration {
            message: message.to_string(),
        }
    }

    /// Helper pour les erreurs internes
    pub fn internal_error(message: impl fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }
}

/// Niveaux de sévérité des erreurs pour les logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Info,
    Warning,
    High,
}

impl ImError {
    /// Retourne la sévérité de l'erreur pour les logs
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Database { .. }
            | Self::TransactionFailed { .. }
            | Self::SequenceCorruption { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => ErrorSeverity::High,

            Self::Cache { .. }
            | Self::BucketFull { .. }
            | Self::PoolFull
            | Self::Conflict { .. }
            | Self::WebSocket { .. } => ErrorSeverity::Warning,

            Self::MissingParameter { .. }
            | Self::InvalidFormat { .. }
            | Self::UnknownMsgType { .. }
            | Self::Unauthorized { .. }
            | Self::NotFound { .. }
            | Self::ConnectionClosed { .. }
            | Self::Json { .. } => ErrorSeverity::Info,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Implémentations de conversion depuis des erreurs externes
impl From<sqlx::Error> for ImError {
    fn from(err: sqlx::Error) -> Self {
        Self::database_error("query", err)
    }
}

impl From<redis::RedisError> for ImError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_error("command", err)
    }
}

impl From<serde_json::Error> for ImError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json { source: err }
    }
}

impl From<axum::Error> for ImError {
    fn from(err: axum::Error) -> Self {
        Self::WebSocket { source: err }
    }
}

impl From<config::ConfigError> for ImError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration {
            message: format!("Erreur de configuration: {}", err),
        }
    }
}

impl From<std::env::VarError> for ImError {
    fn from(err: std::env::VarError) -> Self {
        Self::Configuration {
            message: format!("Variable d'environnement manquante: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_http_status() {
        assert_eq!(ImError::missing_parameter("content").http_status(), 400);
        assert_eq!(ImError::unauthorized("send").http_status(), 401);
        assert_eq!(ImError::not_found("conversation", 42).http_status(), 404);
        assert_eq!(
            ImError::BucketFull {
                index: 3,
                capacity: 128
            }
            .http_status(),
            409
        );
        assert_eq!(
            ImError::TransactionFailed {
                reason: "rollback".into()
            }
            .http_status(),
            500
        );
    }

    #[test]
    fn test_envelope_code_table() {
        // La table réservée ne contient que 0/400/401/404/500
        assert_eq!(ImError::PoolFull.envelope_code(), 500);
        assert_eq!(ImError::UnknownMsgType { msg_type: 9 }.envelope_code(), 400);
        assert_eq!(ImError::not_found("msg", 1).envelope_code(), 404);
    }

    #[test]
    fn test_retryable() {
        assert!(ImError::PoolFull.is_retryable());
        assert!(ImError::BucketFull {
            index: 0,
            capacity: 1
        }
        .is_retryable());
        assert!(!ImError::not_found("msg", 1).is_retryable());
    }

    #[test]
    fn test_public_message() {
        let err = ImError::database_error("insert", sqlx::Error::RowNotFound);
        assert_eq!(err.public_message(), "Erreur temporaire, veuillez réessayer");

        let err = ImError::missing_parameter("target_id");
        assert_eq!(err.public_message(), "Paramètre manquant: target_id");
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            ImError::SequenceCorruption {
                conversation_id: 1,
                seq: -2
            }
            .severity(),
            ErrorSeverity::High
        );
        assert_eq!(ImError::PoolFull.severity(), ErrorSeverity::Warning);
        assert_eq!(
            ImError::ConnectionClosed { conn_id: 12 }.severity(),
            ErrorSeverity::Info
        );
    }
}

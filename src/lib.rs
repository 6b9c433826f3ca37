//! # IM Server - Bibliothèque principale
//!
//! Cœur d'un serveur de messagerie instantanée autonome: connexions
//! bidirectionnelles persistantes, séquence monotone par conversation,
//! persistance cache-puis-base et push temps réel vers les destinataires
//! connectés à ce processus.

// ═══════════════════════════════════════════════════════════════════════
// MODULES CORE
// ═══════════════════════════════════════════════════════════════════════

/// Gestion des erreurs du serveur
pub mod error;

/// Configuration du serveur
pub mod config;

/// Allocateur d'identifiants 64 bits
pub mod id;

/// Modèles de données et types de requête
pub mod models;

/// Couche cache Redis
pub mod cache;

/// Persistance PostgreSQL
pub mod storage;

/// Générateur de séquence par conversation
pub mod sequence;

/// Services d'ingestion et de lecture
pub mod services;

/// Registre de connexions et pompes WebSocket
pub mod ws;

/// Dispatcher des trames entrantes
pub mod dispatch;

/// Pool de push asynchrone
pub mod push;

/// Surface HTTP et upgrade WebSocket
pub mod api;

// ═══════════════════════════════════════════════════════════════════════
// RE-EXPORTS PUBLICS
// ═══════════════════════════════════════════════════════════════════════

pub use api::{router, AppState};
pub use cache::ImCache;
pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use error::{ImError, Result};
pub use id::IdAllocator;
pub use push::{AsyncPusher, PushJob};
pub use sequence::SequenceGenerator;
pub use services::{IngestService, ReadService};
pub use storage::Storage;
pub use ws::{ConnManager, WsConn, WsServer};

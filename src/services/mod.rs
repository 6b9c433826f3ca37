//! Services applicatifs
//!
//! `IngestService` compose l'allocateur d'identifiants, le générateur de
//! séquence, le stockage et le cache pour persister un message soumis.
//! `ReadService` sert les lectures en "cache d'abord, stockage sur miss,
//! repeuplement au passage".

pub mod ingest;
pub mod read;

pub use ingest::IngestService;
pub use read::ReadService;

/// Secondes Unix courantes, l'horodatage serveur de toute la chaîne
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

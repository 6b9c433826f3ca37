//! Couche cache Redis
//!
//! Accélérateur typé devant le stockage relationnel. Toutes les opérations
//! distinguent le miss ("absent", `None`/liste partielle) de la panne
//! (`ImError::Cache`). Le préfixe de clés et les TTL sont injectés à la
//! construction depuis [`CacheConfig`]; le client est un collaborateur,
//! pas un singleton.
//!
//! Formes de clés (préfixe par défaut `im:server:`):
//! - `conv:seq:{cid}`    compteur de séquence par conversation
//! - `msg:info:{id}`     corps de message sérialisé
//! - `conv:info:{id}`    conversation sérialisée
//! - `user:conv:{uid}`   sorted set des conversations (score = conversation_id)
//! - `conv:users:{cid}`  ensemble des membres
//! - `conv:msgs:{cid}`   sorted set fenêtre récente (score = seq)
//! - `user:info:{uid}`   profil utilisateur sérialisé

mod im;
mod users;

use crate::config::CacheConfig;
use crate::error::Result;
use rand::Rng;
use redis::aio::ConnectionManager;

/// Client de cache typé du serveur IM
#[derive(Clone)]
pub struct ImCache {
    conn: ConnectionManager,
    prefix: String,
    msg_ttl_secs: u64,
    conv_ttl_secs: u64,
    ttl_jitter_secs: u64,
}

impl ImCache {
    /// Ouvre la connexion Redis et construit le client
    pub async fn connect(cfg: &CacheConfig) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, cfg))
    }

    /// Construit le client sur une connexion déjà ouverte
    pub fn new(conn: ConnectionManager, cfg: &CacheConfig) -> Self {
        Self {
            conn,
            prefix: cfg.key_prefix.clone(),
            msg_ttl_secs: cfg.msg_ttl_secs,
            conv_ttl_secs: cfg.conv_ttl_secs,
            ttl_jitter_secs: cfg.ttl_jitter_secs,
        }
    }

    /// Connexion clonée pour une commande (le gestionnaire est multiplexé)
    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Construit une clé préfixée
    pub(crate) fn key(&self, suffix: impl AsRef<str>) -> String {
        prefixed_key(&self.prefix, suffix.as_ref())
    }

    /// TTL des messages avec jitter appliqué
    pub(crate) fn msg_ttl(&self) -> u64 {
        jittered_ttl(self.msg_ttl_secs, self.ttl_jitter_secs)
    }

    /// TTL des conversations (et des collections associées) avec jitter
    pub(crate) fn conv_ttl(&self) -> u64 {
        jittered_ttl(self.conv_ttl_secs, self.ttl_jitter_secs)
    }
}

fn prefixed_key(prefix: &str, suffix: &str) -> String {
    format!("{}{}", prefix, suffix)
}

/// TTL de base additionné d'un jitter aléatoire dans [0, jitter], tiré à
/// chaque écriture d'une même clé pour désynchroniser les expirations.
fn jittered_ttl(base_secs: u64, jitter_secs: u64) -> u64 {
    if jitter_secs == 0 {
        return base_secs;
    }
    base_secs + rand::thread_rng().gen_range(0..=jitter_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_key() {
        assert_eq!(
            prefixed_key("im:server:", "conv:seq:42"),
            "im:server:conv:seq:42"
        );
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..256 {
            let ttl = jittered_ttl(100, 50);
            assert!((100..=150).contains(&ttl));
        }
    }

    #[test]
    fn test_jitter_disabled() {
        assert_eq!(jittered_ttl(100, 0), 100);
    }

    #[test]
    fn test_default_ttls_from_config() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.msg_ttl_secs, 7 * 24 * 3600);
        assert_eq!(cfg.conv_ttl_secs, 72 * 3600);
    }
}

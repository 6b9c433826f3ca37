//! Registre de connexions en buckets
//!
//! Table shardée des sockets vivantes, indexée par identifiant
//! d'utilisateur. Routage: `conn_id mod num_buckets`. Chaque bucket est un
//! map sous verrou lecteurs/écrivain; aucun appel réseau ne se fait sous le
//! verrou, la fermeture de l'ancien occupant a lieu après relâchement.

use super::connection::WsConn;
use crate::error::{ImError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Un shard du registre
struct Bucket {
    index: usize,
    capacity: usize,
    conns: RwLock<HashMap<i64, Arc<WsConn>>>,
}

impl Bucket {
    fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            capacity,
            conns: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
        }
    }
}

/// Registre shardé des connexions vivantes.
///
/// Le registre est l'autorité sur la vivacité: au plus une entrée par
/// identifiant, la seconde inscription évince la première.
pub struct ConnManager {
    buckets: Vec<Bucket>,
}

impl ConnManager {
    /// Construit `num_buckets` buckets de capacité `per_bucket_capacity`
    pub fn new(num_buckets: usize, per_bucket_capacity: usize) -> Self {
        let num_buckets = num_buckets.max(1);
        let buckets = (0..num_buckets)
            .map(|i| Bucket::new(i, per_bucket_capacity))
            .collect();
        Self { buckets }
    }

    fn bucket(&self, conn_id: i64) -> &Bucket {
        let index = (conn_id.rem_euclid(self.buckets.len() as i64)) as usize;
        &self.buckets[index]
    }

    /// Inscrit une connexion. Une entrée existante de même identifiant est
    /// évincée (fermeture idempotente, hors verrou); un bucket à capacité
    /// échoue avec `bucket_full`.
    pub fn add(&self, conn: Arc<WsConn>) -> Result<()> {
        let bucket = self.bucket(conn.conn_id);
        let evicted = {
            let mut conns = bucket.conns.write();
            if conns.len() >= bucket.capacity && !conns.contains_key(&conn.conn_id) {
                return Err(ImError::BucketFull {
                    index: bucket.index,
                    capacity: bucket.capacity,
                });
            }
            conns.insert(conn.conn_id, conn)
        };

        if let Some(old) = evicted {
            tracing::info!(conn_id = %old.conn_id, "🔁 Connexion dupliquée, éviction de l'ancienne");
            old.close();
        }
        Ok(())
    }

    /// Connexion vivante d'un utilisateur, si présente
    pub fn get(&self, conn_id: i64) -> Option<Arc<WsConn>> {
        self.bucket(conn_id).conns.read().get(&conn_id).cloned()
    }

    /// Retire et ferme la connexion d'un utilisateur
    pub fn remove(&self, conn_id: i64) {
        let removed = self.bucket(conn_id).conns.write().remove(&conn_id);
        if let Some(conn) = removed {
            conn.close();
            tracing::debug!(conn_id = %conn_id, "🗑 Connexion retirée du registre");
        }
    }

    /// Retrait vérifié par identité: un worker qui draine une socket évincée
    /// ne doit pas retirer la remplaçante déjà inscrite sous le même
    /// identifiant
    pub fn remove_if_same(&self, conn: &Arc<WsConn>) {
        let bucket = self.bucket(conn.conn_id);
        let removed = {
            let mut conns = bucket.conns.write();
            match conns.get(&conn.conn_id) {
                Some(current) if Arc::ptr_eq(current, conn) => conns.remove(&conn.conn_id),
                _ => None,
            }
        };
        if let Some(old) = removed {
            old.close();
            tracing::debug!(conn_id = %conn.conn_id, "🗑 Connexion retirée (fin de worker)");
        }
    }

    /// Nombre total de connexions inscrites
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.conns.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::WsConn;

    fn conn(id: i64) -> Arc<WsConn> {
        WsConn::new(id, 4).0
    }

    #[test]
    fn test_add_and_get() {
        let mgr = ConnManager::new(4, 8);
        let c = conn(42);
        mgr.add(c.clone()).unwrap();

        let found = mgr.get(42).unwrap();
        assert!(Arc::ptr_eq(&found, &c));
        assert!(mgr.get(43).is_none());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_duplicate_add_evicts_previous() {
        let mgr = ConnManager::new(4, 8);
        let first = conn(1);
        let second = conn(1);

        mgr.add(first.clone()).unwrap();
        mgr.add(second.clone()).unwrap();

        // L'ancienne est fermée, la nouvelle est la seule entrée
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(mgr.len(), 1);
        assert!(Arc::ptr_eq(&mgr.get(1).unwrap(), &second));
    }

    #[test]
    fn test_bucket_full() {
        // Un seul bucket de capacité 2
        let mgr = ConnManager::new(1, 2);
        mgr.add(conn(1)).unwrap();
        mgr.add(conn(2)).unwrap();

        let err = mgr.add(conn(3)).unwrap_err();
        assert!(matches!(err, ImError::BucketFull { index: 0, capacity: 2 }));
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_remove_closes_connection() {
        let mgr = ConnManager::new(4, 8);
        let c = conn(9);
        mgr.add(c.clone()).unwrap();

        mgr.remove(9);
        assert!(c.is_closed());
        assert!(mgr.get(9).is_none());
    }

    #[test]
    fn test_remove_if_same_spares_replacement() {
        let mgr = ConnManager::new(4, 8);
        let evicted = conn(5);
        let replacement = conn(5);

        mgr.add(evicted.clone()).unwrap();
        mgr.add(replacement.clone()).unwrap();

        // Le worker de la socket évincée termine et tente le retrait
        mgr.remove_if_same(&evicted);
        assert!(Arc::ptr_eq(&mgr.get(5).unwrap(), &replacement));
        assert!(!replacement.is_closed());
    }

    #[test]
    fn test_routing_spreads_over_buckets() {
        let mgr = ConnManager::new(3, 1);
        // 0, 1, 2 tombent dans trois buckets distincts malgré la capacité 1
        mgr.add(conn(0)).unwrap();
        mgr.add(conn(1)).unwrap();
        mgr.add(conn(2)).unwrap();
        assert_eq!(mgr.len(), 3);
    }
}

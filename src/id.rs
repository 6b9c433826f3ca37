//! Allocateur d'identifiants 64 bits
//!
//! Produit des identifiants uniques par processus pour les messages et les
//! conversations, sans distinction sémantique. Forme empruntée aux
//! générateurs snowflake: horodatage milliseconde (41 bits), identifiant de
//! nœud (10 bits), séquence (12 bits). La monotonie est approximative,
//! la densité n'est pas garantie.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Époque de référence: 2024-01-01T00:00:00Z, en millisecondes Unix
const ID_EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;
const NODE_MAX: u64 = (1 << NODE_BITS) - 1;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;
const TS_SHIFT: u64 = NODE_BITS + SEQ_BITS;

/// Allocateur d'identifiants partagé entre toutes les tâches
#[derive(Debug)]
pub struct IdAllocator {
    node_id: u64,
    /// Empaquetage `horodatage << SEQ_BITS | séquence`
    state: AtomicU64,
}

impl IdAllocator {
    /// Construit un allocateur pour le nœud donné (tronqué à 10 bits)
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & NODE_MAX,
            state: AtomicU64::new(0),
        }
    }

    /// Alloue le prochain identifiant.
    ///
    /// Sûr sous concurrence: la paire (horodatage, séquence) est avancée par
    /// CAS; un recul d'horloge réutilise l'horodatage précédent et continue
    /// d'incrémenter la séquence.
    pub fn next_id(&self) -> u64 {
        loop {
            let now = Self::clock_ms();
            let prev = self.state.load(Ordering::Acquire);
            let prev_ts = prev >> SEQ_BITS;
            let prev_seq = prev & SEQ_MASK;

            let (ts, seq) = if now > prev_ts {
                (now, 0)
            } else if prev_seq < SEQ_MASK {
                (prev_ts, prev_seq + 1)
            } else {
                // Séquence épuisée dans cette milliseconde: on emprunte la suivante
                (prev_ts + 1, 0)
            };

            let next = (ts << SEQ_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (ts << TS_SHIFT) | (self.node_id << SEQ_BITS) | seq;
            }
        }
    }

    fn clock_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(ID_EPOCH_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_sequentially() {
        let alloc = IdAllocator::new(1);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(alloc.next_id()));
        }
    }

    #[test]
    fn test_ids_are_unique_under_concurrency() {
        let alloc = Arc::new(IdAllocator::new(3));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                (0..5_000).map(|_| alloc.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "identifiant dupliqué: {}", id);
            }
        }
        assert_eq!(seen.len(), 8 * 5_000);
    }

    #[test]
    fn test_node_id_is_embedded() {
        let alloc = IdAllocator::new(42);
        let id = alloc.next_id();
        assert_eq!((id >> SEQ_BITS) & NODE_MAX, 42);
    }
}

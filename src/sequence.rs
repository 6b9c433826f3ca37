//! Générateur de séquence par conversation
//!
//! Façade mince sur le compteur atomique du cache. `allocate` retourne une
//! valeur strictement supérieure à toute valeur retournée auparavant pour la
//! même conversation dans ce processus; les allocateurs concurrents se
//! sérialisent sur l'INCR. En cas d'échec de la transaction englobante, la
//! réservation est relâchée exactement une fois par un décrément
//! compensatoire; les valeurs relâchées ne sont pas réutilisées.

use crate::cache::ImCache;
use crate::error::Result;

/// Allocateur de séquences adossé au cache
#[derive(Clone)]
pub struct SequenceGenerator {
    cache: ImCache,
}

impl SequenceGenerator {
    pub fn new(cache: ImCache) -> Self {
        Self { cache }
    }

    /// Alloue la prochaine séquence de la conversation. La réservation
    /// retournée doit être soit validée ([`SeqReservation::commit`]) soit
    /// relâchée ([`SequenceGenerator::release`]) — l'action différée du
    /// chemin de compensation.
    pub async fn allocate(&self, conversation_id: i64) -> Result<SeqReservation> {
        let seq = self.cache.incr_conv_seq(conversation_id).await?;
        Ok(SeqReservation {
            conversation_id,
            seq,
            settled: false,
        })
    }

    /// Décrément compensatoire, appelé une seule fois et seulement si la
    /// réservation n'a pas été validée. Un second appel est un no-op.
    pub async fn release(&self, reservation: &mut SeqReservation) -> Result<()> {
        if reservation.settled {
            return Ok(());
        }
        reservation.settled = true;
        self.cache.decr_conv_seq(reservation.conversation_id).await
    }
}

/// Séquence réservée pour un message en cours d'ingestion
#[derive(Debug)]
pub struct SeqReservation {
    conversation_id: i64,
    seq: i64,
    settled: bool,
}

impl SeqReservation {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    /// Valide la réservation après commit de la transaction; désarme la
    /// compensation
    pub fn commit(mut self) -> i64 {
        self.settled = true;
        self.seq
    }
}

impl Drop for SeqReservation {
    fn drop(&mut self) {
        if !self.settled {
            // Ni validée ni relâchée: trou de séquence sans compensation
            tracing::warn!(
                conversation_id = %self.conversation_id,
                seq = %self.seq,
                "⚠️ Réservation de séquence abandonnée sans release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(seq: i64) -> SeqReservation {
        SeqReservation {
            conversation_id: 7,
            seq,
            settled: false,
        }
    }

    #[test]
    fn test_commit_returns_seq() {
        let r = reservation(42);
        assert_eq!(r.seq(), 42);
        assert_eq!(r.commit(), 42);
    }

    #[test]
    fn test_reservation_accessors() {
        let r = reservation(3);
        assert_eq!(r.conversation_id(), 7);
        r.commit();
    }
}

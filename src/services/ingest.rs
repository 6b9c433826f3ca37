//! Ingestion transactionnelle des messages
//!
//! Pour chaque message soumis: matérialisation paresseuse de la
//! conversation, allocation d'une séquence par le compteur partagé,
//! écriture du corps, du lien conversation→message et des états
//! utilisateur↔conversation, le tout dans une transaction. La compensation
//! de séquence est armée dès l'allocation et déclenchée exactement une fois
//! sur rollback. Le peuplement du cache suit le commit et n'échoue jamais
//! l'opération.

use crate::cache::ImCache;
use crate::config::{CacheConfig, ChatConfig};
use crate::error::{ImError, Result};
use crate::id::IdAllocator;
use crate::models::{
    content_type, Conversation, ConversationKind, ConversationMessage, Message, MessageStatus,
    SendMsgReq, UserConversation, UserMessage,
};
use crate::sequence::SequenceGenerator;
use crate::services::unix_now;
use crate::storage::Storage;
use dashmap::DashMap;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;

/// Service d'ingestion des messages
pub struct IngestService {
    storage: Storage,
    cache: ImCache,
    ids: Arc<IdAllocator>,
    sequence: SequenceGenerator,
    cache_window: u64,
    evict_batch: u64,
    group_write_fanout: bool,
    /// Conversations gelées après régression avérée du compteur de
    /// séquence; les écritures y sont refusées jusqu'à revue
    frozen: DashMap<i64, i64>,
}

impl IngestService {
    pub fn new(
        storage: Storage,
        cache: ImCache,
        ids: Arc<IdAllocator>,
        sequence: SequenceGenerator,
        cache_cfg: &CacheConfig,
        chat_cfg: &ChatConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            ids,
            sequence,
            cache_window: cache_cfg.cache_window,
            evict_batch: cache_cfg.evict_batch,
            group_write_fanout: chat_cfg.group_write_fanout,
            frozen: DashMap::new(),
        }
    }

    /// Persiste un message soumis et retourne l'enregistrement complet,
    /// `msg_id` et `seq` compris.
    pub async fn create_msg(&self, req: &SendMsgReq) -> Result<Message> {
        validate_send_req(req)?;

        if req.conversation_id != 0 && self.frozen.contains_key(&req.conversation_id) {
            return Err(ImError::internal_error(format!(
                "conversation {} gelée après régression du compteur de séquence",
                req.conversation_id
            )));
        }

        let now = unix_now();
        let msg_id = self.ids.next_id() as i64;
        let mut msg = Message {
            user_id: req.user_id,
            msg_id,
            conversation_id: req.conversation_id,
            content: req.content.clone(),
            content_type: req.content_type,
            status: MessageStatus::Visible.as_i32(),
            seq: 0,
            send_time: req.send_time,
            created_at: now,
        };

        let mut tx = self.storage.begin().await?;

        // Matérialisation paresseuse: un identifiant nul désigne le premier
        // message d'une conversation c2c; un groupe est créé hors-bande et
        // arrive toujours avec son identifiant
        let (conv_kind, new_conv) = if msg.conversation_id == 0 {
            let conversation_id = self.ids.next_id() as i64;
            let conv = Conversation {
                conversation_id,
                kind: ConversationKind::C2c.as_i32(),
                member: 2,
                avatar: String::new(),
                announcement: String::new(),
                recent_msg_time: now,
                created_at: now,
            };
            self.storage.insert_conversation(&mut *tx, &conv).await?;
            msg.conversation_id = conversation_id;

            // État du destinataire, rien de lu encore
            let target = UserConversation {
                user_id: req.target_id,
                conversation_id,
                last_read_seq: 0,
                notify_type: 0,
                is_top: 0,
                created_at: now,
                updated_at: now,
            };
            self.storage
                .insert_user_conversation_if_absent(&mut *tx, &target)
                .await?;

            (ConversationKind::C2c, Some(conv))
        } else {
            let mut convs = self
                .storage
                .select_conversations(&mut *tx, &[msg.conversation_id])
                .await?;
            let conv = convs
                .pop()
                .ok_or_else(|| ImError::not_found("conversation", msg.conversation_id))?;
            (ConversationKind::from_i32(conv.kind), None)
        };

        // Allocation de séquence; à partir d'ici tout échec doit relâcher
        // la réservation exactement une fois
        let mut reservation = match self.sequence.allocate(msg.conversation_id).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        // Régression avérée du compteur: l'INCR part de 1 et ne redescend
        // que par compensation, une valeur nulle ou négative signifie un
        // compteur réinitialisé ou sur-décrémenté. La conversation est
        // gelée jusqu'à revue. Les collisions bénignes entre allocations
        // concurrentes et valeurs relâchées sont, elles, arbitrées par la
        // contrainte UNIQUE(conversation_id, seq) et remontent en conflit
        // réessayable.
        if reservation.seq() <= 0 {
            let seq = reservation.seq();
            self.frozen.insert(msg.conversation_id, seq);
            let _ = tx.rollback().await;
            // Compenser un compteur déjà corrompu n'aurait pas de sens
            let _ = reservation.commit();
            tracing::error!(
                conversation_id = %msg.conversation_id,
                seq = %seq,
                "❌ Régression du compteur de séquence, conversation gelée"
            );
            return Err(ImError::SequenceCorruption {
                conversation_id: msg.conversation_id,
                seq,
            });
        }

        let persisted = self
            .persist_with_seq(&mut tx, &msg, reservation.seq(), conv_kind, now)
            .await;
        if let Err(e) = persisted {
            let _ = tx.rollback().await;
            self.release_reservation(&mut reservation).await;
            // Une violation d'unicité sur (conversation_id, seq) est une
            // course entre envois concurrents, remontée réessayable
            if e.is_retryable() {
                tracing::warn!(
                    conversation_id = %msg.conversation_id,
                    msg_id = %msg.msg_id,
                    error = %e,
                    "⚠️ Conflit d'ingestion, l'appelant peut réessayer"
                );
            } else {
                tracing::error!(
                    conversation_id = %msg.conversation_id,
                    msg_id = %msg.msg_id,
                    error = %e,
                    "❌ Ingestion échouée, transaction annulée"
                );
            }
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            self.release_reservation(&mut reservation).await;
            return Err(ImError::TransactionFailed {
                reason: format!("commit: {}", e),
            });
        }

        msg.seq = reservation.commit();

        self.populate_caches(&msg, new_conv.as_ref()).await;

        tracing::info!(
            conversation_id = %msg.conversation_id,
            msg_id = %msg.msg_id,
            seq = %msg.seq,
            sender = %msg.user_id,
            "💬 Message persisté"
        );
        Ok(msg)
    }

    /// Écritures transactionnelles une fois la séquence connue
    async fn persist_with_seq(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        msg: &Message,
        seq: i64,
        conv_kind: ConversationKind,
        now: i64,
    ) -> Result<()> {
        let link = ConversationMessage {
            conversation_id: msg.conversation_id,
            msg_id: msg.msg_id,
            seq,
            created_at: now,
        };
        self.storage
            .insert_conversation_message(&mut **tx, &link)
            .await?;

        // L'expéditeur a lu son propre message
        let sender = UserConversation {
            user_id: msg.user_id,
            conversation_id: msg.conversation_id,
            last_read_seq: seq,
            notify_type: 0,
            is_top: 0,
            created_at: now,
            updated_at: now,
        };
        self.storage
            .upsert_user_conversation(&mut **tx, &sender)
            .await?;

        self.storage
            .update_conversation_recent_time(&mut **tx, msg.conversation_id, now)
            .await?;

        self.storage.insert_message(&mut **tx, msg).await?;

        // Écriture en éventail, seulement pour les groupes quand l'option
        // est activée
        if conv_kind == ConversationKind::Group && self.group_write_fanout {
            let member_ids = self
                .storage
                .select_conversation_user_ids(&mut **tx, msg.conversation_id)
                .await?;
            for user_id in member_ids {
                let fanout = UserMessage {
                    user_id,
                    msg_id: msg.msg_id,
                    conversation_id: msg.conversation_id,
                    seq,
                    created_at: now,
                };
                self.storage.insert_user_message(&mut **tx, &fanout).await?;
            }
        }

        Ok(())
    }

    /// Compensation: décrément unique, les échecs sont journalisés
    async fn release_reservation(&self, reservation: &mut crate::sequence::SeqReservation) {
        if let Err(e) = self.sequence.release(reservation).await {
            tracing::error!(
                conversation_id = %reservation.conversation_id(),
                error = %e,
                "❌ Release de séquence échoué"
            );
        }
    }

    /// Peuplement du cache après commit, dans l'ordre: corps du message puis
    /// fenêtre récente. Fenêtre pleine: éviction des plus anciens, sans
    /// insertion ce tour-ci. Les erreurs n'échouent jamais l'ingestion.
    async fn populate_caches(&self, msg: &Message, new_conv: Option<&Conversation>) {
        if let Some(conv) = new_conv {
            if let Err(e) = self.cache.set_conv(conv).await {
                tracing::warn!(conversation_id = %conv.conversation_id, error = %e, "⚠️ Cache conversation non peuplé");
            }
        }

        if let Err(e) = self.cache.set_msg(msg).await {
            tracing::warn!(msg_id = %msg.msg_id, error = %e, "⚠️ Cache message non peuplé");
            return;
        }

        match self.cache.zcard_conv_msgs(msg.conversation_id).await {
            Ok(card) if card >= self.cache_window => {
                if let Err(e) = self
                    .cache
                    .zremrange_oldest_conv_msgs(msg.conversation_id, self.evict_batch)
                    .await
                {
                    tracing::warn!(conversation_id = %msg.conversation_id, error = %e, "⚠️ Éviction de fenêtre échouée");
                } else {
                    tracing::debug!(
                        conversation_id = %msg.conversation_id,
                        evicted = %self.evict_batch,
                        "🧹 Fenêtre pleine, éviction des plus anciens"
                    );
                }
            }
            Ok(_) => {
                if let Err(e) = self
                    .cache
                    .zadd_conv_msgs(msg.conversation_id, &[(msg.seq, msg.msg_id)])
                    .await
                {
                    tracing::warn!(conversation_id = %msg.conversation_id, error = %e, "⚠️ Fenêtre non mise à jour");
                }
            }
            Err(e) => {
                tracing::warn!(conversation_id = %msg.conversation_id, error = %e, "⚠️ Taille de fenêtre illisible");
            }
        }
    }
}

/// Validation des champs d'une requête d'envoi. `target_id == user_id` est
/// permis (conversation avec soi-même).
pub(crate) fn validate_send_req(req: &SendMsgReq) -> Result<()> {
    if req.user_id <= 0 {
        return Err(ImError::missing_parameter("user_id"));
    }
    if req.content.is_empty() {
        return Err(ImError::missing_parameter("content"));
    }
    if !content_type::is_valid(req.content_type) {
        return Err(ImError::invalid_format(
            "content_type",
            format!("{} hors de la plage 1..=6", req.content_type),
        ));
    }
    if req.conversation_id == 0 && req.target_id <= 0 {
        return Err(ImError::missing_parameter("target_id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_req() -> SendMsgReq {
        SendMsgReq {
            conversation_id: 0,
            user_id: 1,
            target_id: 2,
            content: "salut".into(),
            content_type: content_type::TEXT,
            send_time: 1000,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_send_req(&valid_req()).is_ok());
    }

    #[test]
    fn test_missing_content_rejected() {
        let mut req = valid_req();
        req.content.clear();
        assert!(matches!(
            validate_send_req(&req).unwrap_err(),
            ImError::MissingParameter { .. }
        ));
    }

    #[test]
    fn test_new_conversation_requires_target() {
        let mut req = valid_req();
        req.target_id = 0;
        assert!(validate_send_req(&req).is_err());

        // Avec une conversation existante, target peut rester nul
        req.conversation_id = 77;
        assert!(validate_send_req(&req).is_ok());
    }

    #[test]
    fn test_self_chat_is_allowed() {
        let mut req = valid_req();
        req.target_id = req.user_id;
        assert!(validate_send_req(&req).is_ok());
    }

    #[test]
    fn test_invalid_content_type_rejected() {
        let mut req = valid_req();
        req.content_type = 0;
        assert!(matches!(
            validate_send_req(&req).unwrap_err(),
            ImError::InvalidFormat { .. }
        ));
        req.content_type = 7;
        assert!(validate_send_req(&req).is_err());
    }
}

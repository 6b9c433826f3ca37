//! Lectures en cache-through
//!
//! Discipline commune à toutes les lectures: cache d'abord, stockage sur
//! miss, repeuplement du cache avec les lignes qui viennent d'être lues.
//! Une panne de cache dégrade vers le chemin stockage seul (journalisée,
//! jamais remontée); une panne de stockage remonte.

use crate::cache::ImCache;
use crate::config::{CacheConfig, ChatConfig};
use crate::error::{ImError, Result};
use crate::models::{
    Conversation, ConversationKind, ConversationSummary, Message, UserConversation, UserInfo,
};
use crate::services::unix_now;
use crate::storage::Storage;
use std::collections::HashMap;

/// Service des lectures de conversations, d'historique et de membres
pub struct ReadService {
    storage: Storage,
    cache: ImCache,
    cache_window: u64,
    default_page_size: u64,
    max_page_size: u64,
}

impl ReadService {
    pub fn new(
        storage: Storage,
        cache: ImCache,
        cache_cfg: &CacheConfig,
        chat_cfg: &ChatConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            cache_window: cache_cfg.cache_window,
            default_page_size: chat_cfg.default_page_size,
            max_page_size: chat_cfg.max_page_size,
        }
    }

    /// Borne une taille de page demandée; zéro retombe sur la valeur par
    /// défaut
    pub fn clamp_page_size(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.default_page_size
        } else {
            requested.min(self.max_page_size)
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LISTE DE CONVERSATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Page de la liste de conversations d'un utilisateur, enrichie du
    /// message récent et, pour les c2c, de la liste des participants
    pub async fn conversation_list(
        &self,
        user_id: i64,
        page_num: u64,
        page_size: u64,
    ) -> Result<Vec<ConversationSummary>> {
        let page_size = self.clamp_page_size(page_size);
        let offset = page_offset(page_num, page_size);

        // 1. sorted set de l'utilisateur, par rang
        let cached = degrade(
            "zrange_user_conv",
            self.cache.zrange_user_conv(user_id, offset, page_size).await,
        );

        let (entries, mut conv_info): (Vec<UserConversation>, HashMap<i64, (i32, String)>) =
            if !cached.is_empty() {
                let ids: Vec<i64> = cached.iter().map(|e| e.conversation_id).collect();
                (cached, self.conversation_infos(&ids).await?)
            } else {
                // 2. fallback stockage. Le sorted set est paginé par rang:
                // un regarnissage limité à la page demandée fausserait les
                // pages précédentes; on réécrit donc tout le préfixe
                // jusqu'à la fin de la page, puis on en découpe la page.
                let prefix = self
                    .storage
                    .select_user_conversations(self.storage.pool(), user_id, 0, offset + page_size)
                    .await?;
                if prefix.is_empty() {
                    return Ok(Vec::new());
                }

                let prefix_entries: Vec<UserConversation> =
                    prefix.iter().map(|r| r.user_conversation()).collect();
                if let Err(e) = self.cache.zadd_user_conv(user_id, &prefix_entries).await {
                    tracing::warn!(user_id = %user_id, error = %e, "⚠️ Repeuplement user:conv échoué");
                }

                let page_rows = page_slice(&prefix, offset, page_size);
                if page_rows.is_empty() {
                    return Ok(Vec::new());
                }

                let entries: Vec<UserConversation> =
                    page_rows.iter().map(|r| r.user_conversation()).collect();
                let info = page_rows
                    .iter()
                    .map(|r| (r.conversation_id, (r.kind, r.avatar.clone())))
                    .collect();
                (entries, info)
            };

        // 3. attache message récent et participants
        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some((kind, avatar)) = conv_info.remove(&entry.conversation_id) else {
                // Conversation disparue du stockage: entrée de cache orpheline
                tracing::warn!(
                    conversation_id = %entry.conversation_id,
                    "⚠️ Conversation absente du stockage, entrée ignorée"
                );
                continue;
            };

            let recent_msg = match self.last_message(entry.conversation_id).await {
                Ok(msg) => Some(msg),
                Err(ImError::NotFound { .. }) => None,
                Err(e) => {
                    tracing::warn!(conversation_id = %entry.conversation_id, error = %e, "⚠️ Message récent illisible");
                    None
                }
            };

            let user_list = if kind == ConversationKind::C2c.as_i32() {
                self.conversation_users(entry.conversation_id)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(conversation_id = %entry.conversation_id, error = %e, "⚠️ Participants illisibles");
                        Vec::new()
                    })
            } else {
                Vec::new()
            };

            summaries.push(ConversationSummary {
                conversation_id: entry.conversation_id,
                kind,
                avatar,
                last_read_seq: entry.last_read_seq,
                notify_type: entry.notify_type,
                is_top: entry.is_top,
                recent_msg,
                user_list,
            });
        }

        Ok(summaries)
    }

    /// (type, avatar) par conversation, cache d'abord puis stockage, avec
    /// repeuplement des manquantes
    async fn conversation_infos(&self, ids: &[i64]) -> Result<HashMap<i64, (i32, String)>> {
        let mut info: HashMap<i64, (i32, String)> = HashMap::with_capacity(ids.len());

        let cached: Vec<Conversation> = degrade("get_convs", self.cache.get_convs(ids).await);
        for conv in &cached {
            info.insert(conv.conversation_id, (conv.kind, conv.avatar.clone()));
        }

        let missing: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !info.contains_key(id))
            .collect();
        if !missing.is_empty() {
            let rows = self
                .storage
                .select_conversations(self.storage.pool(), &missing)
                .await?;
            if let Err(e) = self.cache.set_convs(&rows).await {
                tracing::warn!(error = %e, "⚠️ Repeuplement conv:info échoué");
            }
            for conv in rows {
                info.insert(conv.conversation_id, (conv.kind, conv.avatar));
            }
        }

        Ok(info)
    }

    /// Type d'une conversation (0 c2c, 1 groupe), cache d'abord
    pub async fn conversation_kind(&self, conversation_id: i64) -> Result<i32> {
        let info = self.conversation_infos(&[conversation_id]).await?;
        info.get(&conversation_id)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| ImError::not_found("conversation", conversation_id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HISTORIQUE
    // ═══════════════════════════════════════════════════════════════════════

    /// Fenêtre d'historique: messages de séquence strictement supérieure au
    /// curseur, du plus récent au plus ancien, paginés à la taille demandée
    pub async fn history(
        &self,
        conversation_id: i64,
        after_seq: i64,
        page_num: u64,
        page_size: u64,
    ) -> Result<Vec<Message>> {
        let page_size = self.clamp_page_size(page_size);
        let offset = page_offset(page_num, page_size);

        // 1. fenêtre récente en cache
        let ids = degrade(
            "zrev_conv_msgs",
            self.cache
                .zrev_conv_msgs(conversation_id, after_seq, offset, page_size)
                .await,
        );
        if !ids.is_empty() {
            let msgs = degrade("get_msgs", self.cache.get_msgs(&ids).await);
            if msgs.len() as u64 >= page_size {
                return Ok(msgs);
            }
        }

        // 2. jointure stockage, puis regarnissage opportuniste de la fenêtre
        let rows = self
            .storage
            .select_conversation_history(
                self.storage.pool(),
                conversation_id,
                after_seq,
                offset,
                page_size,
            )
            .await?;

        if !rows.is_empty() {
            self.refill_window(conversation_id, &rows).await;
        }
        Ok(rows)
    }

    /// Message le plus récent d'une conversation
    pub async fn last_message(&self, conversation_id: i64) -> Result<Message> {
        // 1. rang 0 de la fenêtre
        if let Some(msg_id) = degrade(
            "zrev_conv_newest",
            self.cache.zrev_conv_newest(conversation_id).await,
        ) {
            let msgs = degrade("get_msgs", self.cache.get_msgs(&[msg_id]).await);
            if let Some(msg) = msgs.into_iter().next() {
                return Ok(msg);
            }
        }

        // 2. réchauffage depuis le stockage: la fenêtre complète, pas
        // seulement le plus récent
        let recent = self
            .storage
            .select_recent_messages(self.storage.pool(), conversation_id, self.cache_window)
            .await?;

        let Some(newest) = recent.first().cloned() else {
            return Err(ImError::not_found("message", conversation_id));
        };
        self.refill_window(conversation_id, &recent).await;
        Ok(newest)
    }

    /// Regarnit la fenêtre récente et les corps de messages avec des lignes
    /// fraîchement lues du stockage; erreurs journalisées seulement
    async fn refill_window(&self, conversation_id: i64, msgs: &[Message]) {
        if let Err(e) = self.cache.set_msgs(msgs).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Repeuplement msg:info échoué");
            return;
        }
        let pairs: Vec<(i64, i64)> = msgs.iter().map(|m| (m.seq, m.msg_id)).collect();
        if let Err(e) = self.cache.zadd_conv_msgs(conversation_id, &pairs).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Regarnissage de fenêtre échoué");
            return;
        }
        // Borne la fenêtre après regarnissage
        match self.cache.zcard_conv_msgs(conversation_id).await {
            Ok(card) if card > self.cache_window => {
                let excess = card - self.cache_window;
                if let Err(e) = self
                    .cache
                    .zremrange_oldest_conv_msgs(conversation_id, excess)
                    .await
                {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Taille de fenêtre non bornée");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Taille de fenêtre illisible");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MEMBRES
    // ═══════════════════════════════════════════════════════════════════════

    /// Participants d'une conversation, profils hydratés
    pub async fn conversation_users(&self, conversation_id: i64) -> Result<Vec<UserInfo>> {
        // 1. ensemble des membres + cache de profils
        let member_ids = degrade(
            "smembers_conv_users",
            self.cache.smembers_conv_users(conversation_id).await,
        );
        if !member_ids.is_empty() {
            let mut profiles = degrade(
                "get_user_infos",
                self.cache.get_user_infos(&member_ids).await,
            );
            if profiles.len() == member_ids.len() {
                return Ok(profiles);
            }

            // Complète les profils manquants depuis le stockage
            let found: Vec<i64> = profiles.iter().map(|p| p.user_id).collect();
            let missing: Vec<i64> = member_ids
                .iter()
                .copied()
                .filter(|id| !found.contains(id))
                .collect();
            let fetched = self
                .storage
                .select_user_infos(self.storage.pool(), &missing)
                .await?;
            if let Err(e) = self.cache.set_user_infos(&fetched).await {
                tracing::warn!(error = %e, "⚠️ Repeuplement user:info échoué");
            }
            profiles.extend(fetched);
            return Ok(profiles);
        }

        // 2. miss total: jointure stockage, puis peuplement des deux formes
        let members = self
            .storage
            .select_conversation_members(self.storage.pool(), conversation_id)
            .await?;
        if members.is_empty() {
            return Ok(members);
        }

        if let Err(e) = self.cache.set_user_infos(&members).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Repeuplement user:info échoué");
        }
        let ids: Vec<i64> = members.iter().map(|m| m.user_id).collect();
        if let Err(e) = self.cache.sadd_conv_users(conversation_id, &ids).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "⚠️ Repeuplement conv:users échoué");
        }

        Ok(members)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REPORT DE LECTURE
    // ═══════════════════════════════════════════════════════════════════════

    /// Avance la dernière séquence lue auto-rapportée par l'utilisateur
    /// (jamais en arrière), puis rafraîchit son entrée de cache
    pub async fn report_read(&self, user_id: i64, conversation_id: i64, seq: i64) -> Result<()> {
        let now = unix_now();
        self.storage
            .update_last_read_seq(self.storage.pool(), user_id, conversation_id, seq, now)
            .await?;

        // Seule une entrée déjà en cache est rafraîchie (score exact):
        // insérer une entrée isolée dans un set vide ou expiré fausserait
        // les pages par rang; le prochain fallback de liste reconstruit le
        // préfixe complet
        if let Some(mut cached) = degrade(
            "zscore_user_conv",
            self.cache.zscore_user_conv(user_id, conversation_id).await,
        ) {
            cached.last_read_seq = cached.last_read_seq.max(seq);
            cached.updated_at = now;
            if let Err(e) = self.cache.update_user_conv(user_id, &cached).await {
                tracing::warn!(user_id = %user_id, error = %e, "⚠️ Entrée user:conv non rafraîchie");
            }
        }

        tracing::debug!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            seq = %seq,
            "✓ Lecture reportée"
        );
        Ok(())
    }
}

/// Décalage d'une page 1-indexée
fn page_offset(page_num: u64, page_size: u64) -> u64 {
    page_num.saturating_sub(1) * page_size
}

/// Page découpée dans un préfixe ordonné; vide quand le décalage dépasse
/// la fin du préfixe
fn page_slice<T>(prefix: &[T], offset: u64, page_size: u64) -> &[T] {
    let start = (offset as usize).min(prefix.len());
    let end = (start + page_size as usize).min(prefix.len());
    &prefix[start..end]
}

/// Dégradation sur panne de cache: journalise et rend la valeur par défaut,
/// le chemin stockage prend le relais
fn degrade<T: Default>(operation: &str, result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(operation = %operation, error = %e, "⚠️ Cache indisponible, chemin stockage seul");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(1, 20), 0);
        assert_eq!(page_offset(2, 20), 20);
        assert_eq!(page_offset(3, 50), 100);
        // Page 0 traitée comme la première
        assert_eq!(page_offset(0, 20), 0);
    }

    #[test]
    fn test_page_slice_cuts_requested_page() {
        let prefix: Vec<i64> = (1..=45).collect();
        assert_eq!(page_slice(&prefix, 0, 20), &prefix[0..20]);
        assert_eq!(page_slice(&prefix, 20, 20), &prefix[20..40]);
        // Dernière page incomplète
        assert_eq!(page_slice(&prefix, 40, 20), &prefix[40..45]);
        // Décalage au-delà de la fin
        assert!(page_slice(&prefix, 60, 20).is_empty());
    }

    #[test]
    fn test_degrade_returns_value_or_default() {
        assert_eq!(degrade("op", Ok(vec![1, 2])), vec![1, 2]);
        let err: Result<Vec<i64>> = Err(ImError::internal_error("panne"));
        assert_eq!(degrade("op", err), Vec::<i64>::new());
    }
}

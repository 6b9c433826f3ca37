//! Opérations de cache des conversations et des messages
//!
//! Trois formes cohabitent: valeurs simples (`msg:info`, `conv:info`),
//! sorted sets (`user:conv` trié par identifiant de conversation,
//! `conv:msgs` trié par séquence) et ensemble de membres (`conv:users`).
//! Un miss est rendu par `None` ou par une liste partielle; seule une
//! panne Redis produit une erreur.

use super::ImCache;
use crate::error::{ImError, Result};
use crate::models::{Conversation, Message, UserConversation};
use redis::AsyncCommands;

impl ImCache {
    // ═══════════════════════════════════════════════════════════════════════
    // COMPTEUR DE SÉQUENCE PAR CONVERSATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Incrément atomique du compteur de séquence de la conversation
    pub async fn incr_conv_seq(&self, conversation_id: i64) -> Result<i64> {
        let key = self.key(format!("conv:seq:{}", conversation_id));
        let mut con = self.connection();
        let seq: i64 = con
            .incr(&key, 1i64)
            .await
            .map_err(|e| ImError::cache_error("incr_conv_seq", e))?;
        Ok(seq)
    }

    /// Décrément compensatoire après échec de la transaction d'ingestion.
    /// Les valeurs relâchées ne sont pas réutilisées (les trous sont légaux).
    pub async fn decr_conv_seq(&self, conversation_id: i64) -> Result<()> {
        let key = self.key(format!("conv:seq:{}", conversation_id));
        let mut con = self.connection();
        let _: i64 = con
            .decr(&key, 1i64)
            .await
            .map_err(|e| ImError::cache_error("decr_conv_seq", e))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CORPS DE MESSAGES (VALEURS SIMPLES)
    // ═══════════════════════════════════════════════════════════════════════

    /// Écrit un message en cache avec le TTL message (jitter compris)
    pub async fn set_msg(&self, msg: &Message) -> Result<()> {
        self.set_msgs(std::slice::from_ref(msg)).await
    }

    /// Écrit un lot de messages, un SET EX par clé pour garder le TTL
    pub async fn set_msgs(&self, msgs: &[Message]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for msg in msgs {
            let key = self.key(format!("msg:info:{}", msg.msg_id));
            pipe.cmd("SET")
                .arg(key)
                .arg(serde_json::to_string(msg)?)
                .arg("EX")
                .arg(self.msg_ttl())
                .ignore();
        }
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("set_msgs", e))?;
        Ok(())
    }

    /// Lit des messages par identifiants; les absents sont simplement omis,
    /// dans l'ordre des identifiants demandés
    pub async fn get_msgs(&self, msg_ids: &[i64]) -> Result<Vec<Message>> {
        if msg_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = msg_ids
            .iter()
            .map(|id| self.key(format!("msg:info:{}", id)))
            .collect();
        let mut con = self.connection();
        let raw: Vec<Option<String>> = con
            .mget(&keys)
            .await
            .map_err(|e| ImError::cache_error("get_msgs", e))?;

        let mut found = Vec::with_capacity(raw.len());
        for value in raw.into_iter().flatten() {
            match serde_json::from_str::<Message>(&value) {
                Ok(msg) => found.push(msg),
                Err(e) => {
                    // Entrée illisible: on la traite comme un miss
                    tracing::warn!(error = %e, "⚠️ Message en cache illisible, ignoré");
                }
            }
        }
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONVERSATIONS (VALEURS SIMPLES)
    // ═══════════════════════════════════════════════════════════════════════

    /// Écrit une conversation avec le TTL conversation (jitter compris)
    pub async fn set_conv(&self, conv: &Conversation) -> Result<()> {
        self.set_convs(std::slice::from_ref(conv)).await
    }

    /// Écrit un lot de conversations
    pub async fn set_convs(&self, convs: &[Conversation]) -> Result<()> {
        if convs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for conv in convs {
            let key = self.key(format!("conv:info:{}", conv.conversation_id));
            pipe.cmd("SET")
                .arg(key)
                .arg(serde_json::to_string(conv)?)
                .arg("EX")
                .arg(self.conv_ttl())
                .ignore();
        }
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("set_convs", e))?;
        Ok(())
    }

    /// Lit des conversations par identifiants; les absentes sont omises
    pub async fn get_convs(&self, conversation_ids: &[i64]) -> Result<Vec<Conversation>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = conversation_ids
            .iter()
            .map(|id| self.key(format!("conv:info:{}", id)))
            .collect();
        let mut con = self.connection();
        let raw: Vec<Option<String>> = con
            .mget(&keys)
            .await
            .map_err(|e| ImError::cache_error("get_convs", e))?;

        let mut found = Vec::with_capacity(raw.len());
        for value in raw.into_iter().flatten() {
            if let Ok(conv) = serde_json::from_str::<Conversation>(&value) {
                found.push(conv);
            }
        }
        Ok(found)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONVERSATIONS D'UN UTILISATEUR (SORTED SET, SCORE = CONVERSATION_ID)
    // ═══════════════════════════════════════════════════════════════════════

    /// Ajoute ou remplace des entrées dans le sorted set des conversations
    /// de l'utilisateur; membre = UserConversation sérialisé
    pub async fn zadd_user_conv(&self, user_id: i64, entries: &[UserConversation]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = self.key(format!("user:conv:{}", user_id));
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            items.push((entry.conversation_id, serde_json::to_string(entry)?));
        }
        let mut pipe = redis::pipe();
        pipe.zadd_multiple(&key, &items).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.conv_ttl()).ignore();
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("zadd_user_conv", e))?;
        Ok(())
    }

    /// Page par rang du sorted set des conversations de l'utilisateur
    pub async fn zrange_user_conv(
        &self,
        user_id: i64,
        offset: u64,
        count: u64,
    ) -> Result<Vec<UserConversation>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = self.key(format!("user:conv:{}", user_id));
        let start = offset as isize;
        let stop = (offset + count) as isize - 1;
        let mut con = self.connection();
        let raw: Vec<String> = con
            .zrange(&key, start, stop)
            .await
            .map_err(|e| ImError::cache_error("zrange_user_conv", e))?;

        let mut entries = Vec::with_capacity(raw.len());
        for value in raw {
            if let Ok(entry) = serde_json::from_str::<UserConversation>(&value) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Recherche par score exact: l'entrée de l'utilisateur pour une
    /// conversation donnée (le score est l'identifiant de conversation)
    pub async fn zscore_user_conv(
        &self,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<Option<UserConversation>> {
        let key = self.key(format!("user:conv:{}", user_id));
        let mut con = self.connection();
        let raw: Vec<String> = con
            .zrangebyscore(&key, conversation_id, conversation_id)
            .await
            .map_err(|e| ImError::cache_error("zscore_user_conv", e))?;
        Ok(raw
            .into_iter()
            .next()
            .and_then(|v| serde_json::from_str(&v).ok()))
    }

    /// Remplace l'entrée d'une conversation dans le sorted set de
    /// l'utilisateur (l'ancien membre de même score est retiré d'abord,
    /// sinon le set accumulerait deux sérialisations du même état)
    pub async fn update_user_conv(&self, user_id: i64, entry: &UserConversation) -> Result<()> {
        let key = self.key(format!("user:conv:{}", user_id));
        let member = serde_json::to_string(entry)?;
        let mut pipe = redis::pipe();
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(entry.conversation_id)
            .arg(entry.conversation_id)
            .ignore();
        pipe.zadd(&key, member, entry.conversation_id).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.conv_ttl()).ignore();
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("update_user_conv", e))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MEMBRES D'UNE CONVERSATION (ENSEMBLE)
    // ═══════════════════════════════════════════════════════════════════════

    /// Ajoute des membres à l'ensemble de la conversation
    pub async fn sadd_conv_users(&self, conversation_id: i64, user_ids: &[i64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let key = self.key(format!("conv:users:{}", conversation_id));
        let mut pipe = redis::pipe();
        pipe.sadd(&key, user_ids).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.conv_ttl()).ignore();
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("sadd_conv_users", e))?;
        Ok(())
    }

    /// Membres connus de la conversation (vide = miss)
    pub async fn smembers_conv_users(&self, conversation_id: i64) -> Result<Vec<i64>> {
        let key = self.key(format!("conv:users:{}", conversation_id));
        let mut con = self.connection();
        let members: Vec<i64> = con
            .smembers(&key)
            .await
            .map_err(|e| ImError::cache_error("smembers_conv_users", e))?;
        Ok(members)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FENÊTRE DE MESSAGES RÉCENTS (SORTED SET, SCORE = SEQ)
    // ═══════════════════════════════════════════════════════════════════════

    /// Ajoute des paires (seq, msg_id) à la fenêtre récente
    pub async fn zadd_conv_msgs(&self, conversation_id: i64, entries: &[(i64, i64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = self.key(format!("conv:msgs:{}", conversation_id));
        let mut pipe = redis::pipe();
        pipe.zadd_multiple(&key, entries).ignore();
        pipe.cmd("EXPIRE").arg(&key).arg(self.conv_ttl()).ignore();
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("zadd_conv_msgs", e))?;
        Ok(())
    }

    /// Page du plus récent au plus ancien, bornée par un curseur exclusif:
    /// seuls les messages de séquence strictement supérieure à `min_seq`
    /// sont retournés
    pub async fn zrev_conv_msgs(
        &self,
        conversation_id: i64,
        min_seq: i64,
        offset: u64,
        count: u64,
    ) -> Result<Vec<i64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = self.key(format!("conv:msgs:{}", conversation_id));
        let min = format!("({}", min_seq);
        let mut con = self.connection();
        let ids: Vec<i64> = con
            .zrevrangebyscore_limit(&key, "+inf", min, offset as isize, count as isize)
            .await
            .map_err(|e| ImError::cache_error("zrev_conv_msgs", e))?;
        Ok(ids)
    }

    /// Identifiant du message le plus récent (rang 0 en ordre inverse)
    pub async fn zrev_conv_newest(&self, conversation_id: i64) -> Result<Option<i64>> {
        let key = self.key(format!("conv:msgs:{}", conversation_id));
        let mut con = self.connection();
        let ids: Vec<i64> = con
            .zrevrange(&key, 0, 0)
            .await
            .map_err(|e| ImError::cache_error("zrev_conv_newest", e))?;
        Ok(ids.into_iter().next())
    }

    /// Taille de la fenêtre récente
    pub async fn zcard_conv_msgs(&self, conversation_id: i64) -> Result<u64> {
        let key = self.key(format!("conv:msgs:{}", conversation_id));
        let mut con = self.connection();
        let card: u64 = con
            .zcard(&key)
            .await
            .map_err(|e| ImError::cache_error("zcard_conv_msgs", e))?;
        Ok(card)
    }

    /// Évince les `count` entrées les plus anciennes de la fenêtre
    pub async fn zremrange_oldest_conv_msgs(
        &self,
        conversation_id: i64,
        count: u64,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let key = self.key(format!("conv:msgs:{}", conversation_id));
        let mut con = self.connection();
        let _: i64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(&key)
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut con)
            .await
            .map_err(|e| ImError::cache_error("zremrange_oldest_conv_msgs", e))?;
        Ok(())
    }
}

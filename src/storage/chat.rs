//! Persistance des conversations, messages, liens et états utilisateur
//!
//! Les requêtes composites suivent le modèle en lecture éventail: l'historique
//! joint `conversation_msg_list` à `msg_list`, la liste de conversations joint
//! `user_conversation_list` à `conversation_list`.

use super::{map_db_error, Storage};
use crate::error::{ImError, Result};
use crate::models::{
    Conversation, ConversationMessage, Message, UserConversation, UserConversationJoined,
    UserMessage,
};
use sqlx::PgExecutor;

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // CONVERSATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Insère une conversation nouvellement matérialisée
    pub async fn insert_conversation<'e, E>(&self, exec: E, conv: &Conversation) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO conversation_list
               (conversation_id, "type", member, avatar, announcement, recent_msg_time, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(conv.conversation_id)
        .bind(conv.kind)
        .bind(conv.member)
        .bind(&conv.avatar)
        .bind(&conv.announcement)
        .bind(conv.recent_msg_time)
        .bind(conv.created_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("insert_conversation", e))?;
        Ok(())
    }

    /// Lit des conversations par identifiants
    pub async fn select_conversations<'e, E>(
        &self,
        exec: E,
        conversation_ids: &[i64],
    ) -> Result<Vec<Conversation>>
    where
        E: PgExecutor<'e>,
    {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, Conversation>(
            r#"SELECT conversation_id, "type", member, avatar, announcement,
                      recent_msg_time, created_at
               FROM conversation_list
               WHERE conversation_id = ANY($1) AND deleted_at IS NULL"#,
        )
        .bind(conversation_ids)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_conversations", e))?;
        Ok(rows)
    }

    /// Met à jour l'horodatage du message le plus récent de la conversation
    pub async fn update_conversation_recent_time<'e, E>(
        &self,
        exec: E,
        conversation_id: i64,
        recent_msg_time: i64,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"UPDATE conversation_list SET recent_msg_time = $2
               WHERE conversation_id = $1 AND deleted_at IS NULL"#,
        )
        .bind(conversation_id)
        .bind(recent_msg_time)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("update_conversation_recent_time", e))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MESSAGES
    // ═══════════════════════════════════════════════════════════════════════

    /// Insère le corps d'un message
    pub async fn insert_message<'e, E>(&self, exec: E, msg: &Message) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO msg_list
               (msg_id, user_id, conversation_id, content, content_type, status, send_time, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(msg.msg_id)
        .bind(msg.user_id)
        .bind(msg.conversation_id)
        .bind(&msg.content)
        .bind(msg.content_type)
        .bind(msg.status)
        .bind(msg.send_time)
        .bind(msg.created_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("insert_message", e))?;
        Ok(())
    }

    /// Lit des messages par identifiants (avec leur `seq` de conversation)
    pub async fn select_messages<'e, E>(&self, exec: E, msg_ids: &[i64]) -> Result<Vec<Message>>
    where
        E: PgExecutor<'e>,
    {
        if msg_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, Message>(
            r#"SELECT ml.user_id, ml.msg_id, ml.conversation_id, ml.content,
                      ml.content_type, ml.status, COALESCE(cml.seq, 0) AS seq,
                      ml.send_time, ml.created_at
               FROM msg_list ml
               LEFT JOIN conversation_msg_list cml ON cml.msg_id = ml.msg_id
               WHERE ml.msg_id = ANY($1) AND ml.deleted_at IS NULL"#,
        )
        .bind(msg_ids)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_messages", e))?;
        Ok(rows)
    }

    /// Change le statut d'un message (visible, bloqué, rétracté)
    pub async fn update_message_status<'e, E>(
        &self,
        exec: E,
        msg_id: i64,
        status: i32,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"UPDATE msg_list SET status = $2 WHERE msg_id = $1 AND deleted_at IS NULL"#,
        )
        .bind(msg_id)
        .bind(status)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("update_message_status", e))?;

        if result.rows_affected() == 0 {
            return Err(ImError::not_found("message", msg_id));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIENS CONVERSATION → MESSAGE
    // ═══════════════════════════════════════════════════════════════════════

    /// Insère le lien conversation → message porteur du `seq` alloué
    pub async fn insert_conversation_message<'e, E>(
        &self,
        exec: E,
        link: &ConversationMessage,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO conversation_msg_list (conversation_id, msg_id, seq, created_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(link.conversation_id)
        .bind(link.msg_id)
        .bind(link.seq)
        .bind(link.created_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("insert_conversation_message", e))?;
        Ok(())
    }

    /// Historique d'une conversation: messages de séquence strictement
    /// supérieure au curseur, du plus récent au plus ancien, paginés
    pub async fn select_conversation_history<'e, E>(
        &self,
        exec: E,
        conversation_id: i64,
        after_seq: i64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Message>>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, Message>(
            r#"SELECT ml.user_id, ml.msg_id, ml.conversation_id, ml.content,
                      ml.content_type, ml.status, cml.seq, ml.send_time, ml.created_at
               FROM conversation_msg_list cml
               JOIN msg_list ml ON ml.msg_id = cml.msg_id
               WHERE cml.conversation_id = $1 AND cml.seq > $2 AND ml.deleted_at IS NULL
               ORDER BY cml.seq DESC
               LIMIT $3 OFFSET $4"#,
        )
        .bind(conversation_id)
        .bind(after_seq)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_conversation_history", e))?;
        Ok(rows)
    }

    /// Les `limit` messages les plus récents d'une conversation, pour le
    /// réchauffage de la fenêtre de cache
    pub async fn select_recent_messages<'e, E>(
        &self,
        exec: E,
        conversation_id: i64,
        limit: u64,
    ) -> Result<Vec<Message>>
    where
        E: PgExecutor<'e>,
    {
        self.select_conversation_history(exec, conversation_id, 0, 0, limit)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ÉTATS UTILISATEUR ↔ CONVERSATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert de l'état de l'expéditeur: la clé de conflit est
    /// (user_id, conversation_id), seuls `last_read_seq` et `updated_at`
    /// sont rafraîchis
    pub async fn upsert_user_conversation<'e, E>(
        &self,
        exec: E,
        entry: &UserConversation,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO user_conversation_list
               (user_id, conversation_id, last_read_seq, notify_type, is_top, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (user_id, conversation_id)
               DO UPDATE SET last_read_seq = EXCLUDED.last_read_seq,
                             updated_at = EXCLUDED.updated_at"#,
        )
        .bind(entry.user_id)
        .bind(entry.conversation_id)
        .bind(entry.last_read_seq)
        .bind(entry.notify_type)
        .bind(entry.is_top)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("upsert_user_conversation", e))?;
        Ok(())
    }

    /// Insère l'état du destinataire à la première participation; une course
    /// avec une autre insertion est bénigne
    pub async fn insert_user_conversation_if_absent<'e, E>(
        &self,
        exec: E,
        entry: &UserConversation,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO user_conversation_list
               (user_id, conversation_id, last_read_seq, notify_type, is_top, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (user_id, conversation_id) DO NOTHING"#,
        )
        .bind(entry.user_id)
        .bind(entry.conversation_id)
        .bind(entry.last_read_seq)
        .bind(entry.notify_type)
        .bind(entry.is_top)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("insert_user_conversation_if_absent", e))?;
        Ok(())
    }

    /// Avance `last_read_seq` (jamais en arrière) lors d'un report de lecture
    pub async fn update_last_read_seq<'e, E>(
        &self,
        exec: E,
        user_id: i64,
        conversation_id: i64,
        seq: i64,
        updated_at: i64,
    ) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"UPDATE user_conversation_list
               SET last_read_seq = GREATEST(last_read_seq, $3), updated_at = $4
               WHERE user_id = $1 AND conversation_id = $2"#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(seq)
        .bind(updated_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("update_last_read_seq", e))?;

        if result.rows_affected() == 0 {
            return Err(ImError::not_found("user_conversation", conversation_id));
        }
        Ok(())
    }

    /// État d'un utilisateur dans une conversation
    pub async fn select_user_conversation<'e, E>(
        &self,
        exec: E,
        user_id: i64,
        conversation_id: i64,
    ) -> Result<Option<UserConversation>>
    where
        E: PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, UserConversation>(
            r#"SELECT user_id, conversation_id, last_read_seq, notify_type, is_top,
                      created_at, updated_at
               FROM user_conversation_list
               WHERE user_id = $1 AND conversation_id = $2"#,
        )
        .bind(user_id)
        .bind(conversation_id)
        .fetch_optional(exec)
        .await
        .map_err(|e| map_db_error("select_user_conversation", e))?;
        Ok(row)
    }

    /// Identifiants des membres d'une conversation
    pub async fn select_conversation_user_ids<'e, E>(
        &self,
        exec: E,
        conversation_id: i64,
    ) -> Result<Vec<i64>>
    where
        E: PgExecutor<'e>,
    {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT user_id FROM user_conversation_list WHERE conversation_id = $1"#,
        )
        .bind(conversation_id)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_conversation_user_ids", e))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Page des conversations d'un utilisateur, jointe aux informations de
    /// conversation (type, avatar)
    pub async fn select_user_conversations<'e, E>(
        &self,
        exec: E,
        user_id: i64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<UserConversationJoined>>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, UserConversationJoined>(
            r#"SELECT ucl.user_id, ucl.conversation_id, ucl.last_read_seq,
                      ucl.notify_type, ucl.is_top, ucl.created_at, ucl.updated_at,
                      cl."type", cl.avatar
               FROM user_conversation_list ucl
               JOIN conversation_list cl ON cl.conversation_id = ucl.conversation_id
               WHERE ucl.user_id = $1 AND cl.deleted_at IS NULL
               ORDER BY ucl.conversation_id
               LIMIT $2 OFFSET $3"#,
        )
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_user_conversations", e))?;
        Ok(rows)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIENS UTILISATEUR → MESSAGE (ÉCRITURE ÉVENTAIL, OPTIONNEL)
    // ═══════════════════════════════════════════════════════════════════════

    /// Insère un lien utilisateur → message (groupes, option d'écriture éventail)
    pub async fn insert_user_message<'e, E>(&self, exec: E, link: &UserMessage) -> Result<()>
    where
        E: PgExecutor<'e>,
    {
        sqlx::query(
            r#"INSERT INTO user_msg_list (user_id, msg_id, conversation_id, seq, created_at)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(link.user_id)
        .bind(link.msg_id)
        .bind(link.conversation_id)
        .bind(link.seq)
        .bind(link.created_at)
        .execute(exec)
        .await
        .map_err(|e| map_db_error("insert_user_message", e))?;
        Ok(())
    }
}

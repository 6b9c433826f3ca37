//! Lectures du référentiel utilisateurs
//!
//! `user_info` appartient au domaine profil (collaborateur externe); seule
//! la jointure nécessaire aux listes de membres vit ici.

use super::{map_db_error, Storage};
use crate::error::Result;
use crate::models::UserInfo;
use sqlx::PgExecutor;

impl Storage {
    /// Profils des membres d'une conversation
    pub async fn select_conversation_members<'e, E>(
        &self,
        exec: E,
        conversation_id: i64,
    ) -> Result<Vec<UserInfo>>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query_as::<_, UserInfo>(
            r#"SELECT u.user_id, u.nick_name, u.avatar
               FROM user_info u
               JOIN user_conversation_list uc ON uc.user_id = u.user_id
               WHERE uc.conversation_id = $1"#,
        )
        .bind(conversation_id)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_conversation_members", e))?;
        Ok(rows)
    }

    /// Profils par identifiants
    pub async fn select_user_infos<'e, E>(&self, exec: E, user_ids: &[i64]) -> Result<Vec<UserInfo>>
    where
        E: PgExecutor<'e>,
    {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserInfo>(
            r#"SELECT user_id, nick_name, avatar FROM user_info WHERE user_id = ANY($1)"#,
        )
        .bind(user_ids)
        .fetch_all(exec)
        .await
        .map_err(|e| map_db_error("select_user_infos", e))?;
        Ok(rows)
    }
}

//! Cache des profils utilisateurs
//!
//! Hydratation des listes de membres: les profils sont stockés un par clé
//! (`user:info:{uid}`) et lus en lot par MGET. Les absents sont omis, à
//! charge de l'appelant de compléter depuis le stockage.

use super::ImCache;
use crate::error::{ImError, Result};
use crate::models::UserInfo;
use redis::AsyncCommands;

impl ImCache {
    /// Écrit un lot de profils utilisateurs
    pub async fn set_user_infos(&self, users: &[UserInfo]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for user in users {
            let key = self.key(format!("user:info:{}", user.user_id));
            pipe.cmd("SET")
                .arg(key)
                .arg(serde_json::to_string(user)?)
                .arg("EX")
                .arg(self.conv_ttl())
                .ignore();
        }
        let mut con = self.connection();
        pipe.query_async::<_, ()>(&mut con)
            .await
            .map_err(|e| ImError::cache_error("set_user_infos", e))?;
        Ok(())
    }

    /// Lit des profils par identifiants; les absents sont omis
    pub async fn get_user_infos(&self, user_ids: &[i64]) -> Result<Vec<UserInfo>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = user_ids
            .iter()
            .map(|id| self.key(format!("user:info:{}", id)))
            .collect();
        let mut con = self.connection();
        let raw: Vec<Option<String>> = con
            .mget(&keys)
            .await
            .map_err(|e| ImError::cache_error("get_user_infos", e))?;

        let mut found = Vec::with_capacity(raw.len());
        for value in raw.into_iter().flatten() {
            if let Ok(user) = serde_json::from_str::<UserInfo>(&value) {
                found.push(user);
            }
        }
        Ok(found)
    }
}

//! Modèles de données du serveur IM
//!
//! Les entités persistées reflètent les tables `msg_list`,
//! `conversation_list`, `conversation_msg_list`, `user_conversation_list`
//! et `user_msg_list`. Les horodatages sont des secondes Unix (`i64`);
//! `send_time` vient du client et est stocké tel quel, `created_at` est
//! posé par le serveur.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ═══════════════════════════════════════════════════════════════════════
// ÉNUMÉRATIONS DU DOMAINE
// ═══════════════════════════════════════════════════════════════════════

/// Type de conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// Conversation à deux participants
    C2c,
    /// Conversation de groupe (créée hors-bande)
    Group,
}

impl ConversationKind {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::C2c => 0,
            Self::Group => 1,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        if v == 1 {
            Self::Group
        } else {
            Self::C2c
        }
    }
}

/// Statut d'un message: 0 visible, 1 bloqué, 2 rétracté
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Visible,
    Blocked,
    Retracted,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Visible => 0,
            Self::Blocked => 1,
            Self::Retracted => 2,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Blocked,
            2 => Self::Retracted,
            _ => Self::Visible,
        }
    }
}

/// Types de contenu: 1 texte, 2 image, 3 fichier audio, 4 fichier vidéo,
/// 5 audio temps réel, 6 vidéo temps réel
pub mod content_type {
    pub const TEXT: i32 = 1;
    pub const IMAGE: i32 = 2;
    pub const AUDIO_FILE: i32 = 3;
    pub const VIDEO_FILE: i32 = 4;
    pub const REALTIME_AUDIO: i32 = 5;
    pub const REALTIME_VIDEO: i32 = 6;

    pub fn is_valid(v: i32) -> bool {
        (TEXT..=REALTIME_VIDEO).contains(&v)
    }
}

/// Types d'enveloppe WebSocket entrante
pub mod msg_type {
    pub const NOTIFY: i32 = 1;
    pub const COMMAND: i32 = 2;
    pub const CHAT: i32 = 3;
}

// ═══════════════════════════════════════════════════════════════════════
// ENTITÉS PERSISTÉES
// ═══════════════════════════════════════════════════════════════════════

/// Message persisté (table `msg_list`), enrichi de son `seq` de conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Identifiant de l'expéditeur
    pub user_id: i64,
    /// Identifiant global du message
    pub msg_id: i64,
    /// Identifiant de la conversation
    pub conversation_id: i64,
    /// Texte ou référence du contenu
    pub content: String,
    /// Type de contenu (voir [`content_type`])
    pub content_type: i32,
    /// Statut: 0 visible, 1 bloqué, 2 rétracté
    pub status: i32,
    /// Séquence du message dans sa conversation
    pub seq: i64,
    /// Horodatage client, stocké tel quel
    pub send_time: i64,
    /// Horodatage serveur
    pub created_at: i64,
}

/// Conversation (table `conversation_list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Conversation {
    pub conversation_id: i64,
    /// 0 c2c, 1 groupe; immuable après création
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: i32,
    /// Nombre d'utilisateurs liés à la conversation
    pub member: i32,
    /// Avatar du groupe
    pub avatar: String,
    /// Annonce du groupe
    pub announcement: String,
    /// Horodatage du message le plus récent
    pub recent_msg_time: i64,
    pub created_at: i64,
}

/// Lien conversation → message (table `conversation_msg_list`, lecture en éventail)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ConversationMessage {
    pub conversation_id: i64,
    pub msg_id: i64,
    /// Strictement croissant au sein d'une conversation
    pub seq: i64,
    pub created_at: i64,
}

/// État d'un utilisateur dans une conversation (table `user_conversation_list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserConversation {
    pub user_id: i64,
    pub conversation_id: i64,
    /// Dernière séquence lue par l'utilisateur
    pub last_read_seq: i64,
    /// 0 normal, 1 silencieux, 2 prioritaire
    pub notify_type: i32,
    /// 1 si la conversation est épinglée
    pub is_top: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Lien utilisateur → message (table `user_msg_list`, écriture en éventail,
/// utilisé seulement pour les groupes quand l'option est activée)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserMessage {
    pub user_id: i64,
    pub msg_id: i64,
    pub conversation_id: i64,
    pub seq: i64,
    pub created_at: i64,
}

/// Profil minimal d'un utilisateur (table `user_info`, domaine externe)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserInfo {
    pub user_id: i64,
    pub nick_name: String,
    pub avatar: String,
}

// ═══════════════════════════════════════════════════════════════════════
// TYPES DE REQUÊTE / RÉPONSE
// ═══════════════════════════════════════════════════════════════════════

/// Enveloppe applicative d'une trame WebSocket entrante.
/// `payload` est du JSON dont la forme dépend de `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub msg_type: i32,
    pub payload: serde_json::Value,
}

/// Requête d'envoi de message (trame chat et `POST /v1/chat/send`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMsgReq {
    /// 0 = conversation à matérialiser (premier message c2c)
    #[serde(default)]
    pub conversation_id: i64,
    /// Expéditeur
    pub user_id: i64,
    /// Destinataire (c2c); peut être égal à `user_id` (conversation avec soi)
    #[serde(default)]
    pub target_id: i64,
    pub content: String,
    pub content_type: i32,
    pub send_time: i64,
}

/// Requête d'historique paginé
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMsgListReq {
    pub conversation_id: i64,
    /// Curseur: seuls les messages de séquence strictement supérieure sont retournés
    #[serde(default)]
    pub seq: i64,
    pub page_num: u64,
    pub page_size: u64,
}

/// Requête de report de lecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportReadReq {
    pub conversation_id: i64,
    pub seq: i64,
}

/// Élément de la liste de conversations d'un utilisateur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: i64,
    #[serde(rename = "type")]
    pub kind: i32,
    pub avatar: String,
    pub last_read_seq: i64,
    pub notify_type: i32,
    pub is_top: i32,
    /// Message le plus récent de la conversation, si elle en a un
    pub recent_msg: Option<Message>,
    /// Participants, attaché pour les conversations c2c
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_list: Vec<UserInfo>,
}

/// Ligne du join user_conversation_list ⋈ conversation_list
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct UserConversationJoined {
    pub user_id: i64,
    pub conversation_id: i64,
    pub last_read_seq: i64,
    pub notify_type: i32,
    pub is_top: i32,
    pub created_at: i64,
    pub updated_at: i64,
    #[sqlx(rename = "type")]
    pub kind: i32,
    pub avatar: String,
}

impl UserConversationJoined {
    /// Partie `UserConversation` de la ligne (forme mise en cache)
    pub fn user_conversation(&self) -> UserConversation {
        UserConversation {
            user_id: self.user_id,
            conversation_id: self.conversation_id,
            last_read_seq: self.last_read_seq,
            notify_type: self.notify_type,
            is_top: self.is_top,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_conversation_kind_roundtrip() {
        assert_eq!(ConversationKind::from_i32(0), ConversationKind::C2c);
        assert_eq!(ConversationKind::from_i32(1), ConversationKind::Group);
        assert_eq!(ConversationKind::Group.as_i32(), 1);
    }

    #[test]
    fn test_content_type_bounds() {
        assert!(content_type::is_valid(content_type::TEXT));
        assert!(content_type::is_valid(content_type::REALTIME_VIDEO));
        assert!(!content_type::is_valid(0));
        assert!(!content_type::is_valid(7));
    }

    #[test]
    fn test_send_msg_req_decoding() {
        // conversation_id et target_id sont optionnels côté client
        let req: SendMsgReq = serde_json::from_str(
            r#"{"user_id":1,"content":"salut","content_type":1,"send_time":1000}"#,
        )
        .unwrap();
        assert_eq!(req.conversation_id, 0);
        assert_eq!(req.target_id, 0);
        assert_eq!(req.content, "salut");
    }

    #[test]
    fn test_conversation_serde_rename() {
        let conv = Conversation {
            conversation_id: 7,
            kind: 1,
            member: 12,
            avatar: String::new(),
            announcement: "bienvenue".into(),
            recent_msg_time: 0,
            created_at: 0,
        };
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["type"], 1);
        assert!(json.get("kind").is_none());
    }

    #[test]
    fn test_envelope_decoding() {
        let raw = r#"{"msg_type":3,"payload":{"user_id":1,"target_id":2,"conversation_id":0,"content":"hi","content_type":1,"send_time":1000}}"#;
        let env: WsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.msg_type, msg_type::CHAT);
        let req: SendMsgReq = serde_json::from_value(env.payload).unwrap();
        assert_eq!(req.target_id, 2);
    }
}

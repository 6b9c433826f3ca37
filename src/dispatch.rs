//! Dispatcher des trames entrantes
//!
//! Décode l'enveloppe `{msg_type, payload}`, route vers l'ingestion pour
//! les trames de chat et confie le fan-out au pool de push. Les erreurs de
//! décodage sont journalisées et n'abattent jamais la connexion; aucune
//! trame d'erreur n'est renvoyée au client (le chemin HTTP l'informe).

use crate::error::{ImError, Result};
use crate::models::{msg_type, ConversationKind, Message, SendMsgReq, WsEnvelope};
use crate::push::{AsyncPusher, PushJob};
use crate::services::{IngestService, ReadService};
use std::sync::Arc;

/// Routeur des trames applicatives
pub struct Dispatcher {
    ingest: Arc<IngestService>,
    read: Arc<ReadService>,
    pusher: Arc<AsyncPusher>,
}

impl Dispatcher {
    pub fn new(
        ingest: Arc<IngestService>,
        read: Arc<ReadService>,
        pusher: Arc<AsyncPusher>,
    ) -> Self {
        Self {
            ingest,
            read,
            pusher,
        }
    }

    /// Point d'entrée de la boucle de lecture: toute erreur est absorbée ici
    pub async fn process(&self, sender: i64, payload: Vec<u8>) {
        if let Err(e) = self.route(sender, &payload).await {
            tracing::warn!(
                sender = %sender,
                error = %e,
                payload_len = %payload.len(),
                "⚠️ Trame entrante rejetée"
            );
        }
    }

    async fn route(&self, sender: i64, payload: &[u8]) -> Result<()> {
        let envelope: WsEnvelope = serde_json::from_slice(payload)
            .map_err(|e| ImError::invalid_format("envelope", e))?;

        match envelope.msg_type {
            // Réservés: le décodage suffit, aucun effet dans ce cœur
            msg_type::NOTIFY => {
                tracing::debug!(sender = %sender, "🔔 Trame notify ignorée");
                Ok(())
            }
            msg_type::COMMAND => {
                tracing::debug!(sender = %sender, "🎛 Trame command ignorée");
                Ok(())
            }
            msg_type::CHAT => {
                let mut req: SendMsgReq = serde_json::from_value(envelope.payload)
                    .map_err(|e| ImError::invalid_format("chat payload", e))?;
                // L'identité fait foi, pas le champ du client
                req.user_id = sender;

                let msg = self.ingest.create_msg(&req).await?;
                self.push_message(msg, req.target_id).await
            }
            other => Err(ImError::UnknownMsgType { msg_type: other }),
        }
    }

    /// Fan-out d'un message persisté: expéditeur et destinataire pour une
    /// c2c, tous les membres pour un groupe. La persistance a déjà réussi;
    /// un échec de push ne la remet pas en cause.
    pub async fn push_message(&self, msg: Message, target_id: i64) -> Result<()> {
        let kind = self
            .read
            .conversation_kind(msg.conversation_id)
            .await
            .unwrap_or(ConversationKind::C2c.as_i32());

        let mut targets: Vec<i64> = if kind == ConversationKind::Group.as_i32() {
            self.read
                .conversation_users(msg.conversation_id)
                .await?
                .into_iter()
                .map(|u| u.user_id)
                .collect()
        } else {
            vec![msg.user_id, target_id]
        };
        targets.sort_unstable();
        targets.dedup();
        targets.retain(|&id| id > 0);

        self.pusher.submit(PushJob {
            message: msg,
            targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_rejects_malformed_json() {
        let res: std::result::Result<WsEnvelope, _> = serde_json::from_slice(b"pas du json");
        assert!(res.is_err());
    }

    #[test]
    fn test_envelope_accepts_reserved_types() {
        // notify et command doivent se décoder sans erreur
        for t in [msg_type::NOTIFY, msg_type::COMMAND] {
            let raw = format!(r#"{{"msg_type":{},"payload":{{}}}}"#, t);
            let env: WsEnvelope = serde_json::from_str(&raw).unwrap();
            assert_eq!(env.msg_type, t);
        }
    }

    #[test]
    fn test_chat_payload_shape() {
        let raw = r#"{"msg_type":3,"payload":{"conversation_id":0,"user_id":1,"target_id":2,"content":"hi","content_type":1,"send_time":1000}}"#;
        let env: WsEnvelope = serde_json::from_str(raw).unwrap();
        let req: SendMsgReq = serde_json::from_value(env.payload).unwrap();
        assert_eq!(req.content, "hi");
        assert_eq!(req.target_id, 2);
    }

    #[test]
    fn test_unknown_msg_type_is_an_error_value() {
        let err = ImError::UnknownMsgType { msg_type: 9 };
        assert_eq!(err.http_status(), 400);
    }
}

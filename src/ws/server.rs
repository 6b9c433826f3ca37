//! Façade du serveur WebSocket
//!
//! Valeur construite une fois par la racine de composition et passée par
//! référence; pas d'initialisation paresseuse. Relie l'upgrade HTTP au
//! registre et offre le point d'entrée de push utilisé par le pool
//! asynchrone.

use super::bucket::ConnManager;
use super::connection::{Dispatch, WsConn};
use crate::config::WsConfig;
use crate::error::Result;
use axum::extract::ws::WebSocket;
use bytes::Bytes;
use std::sync::Arc;

/// Serveur de connexions temps réel
pub struct WsServer {
    conn_mgr: ConnManager,
    out_queue_cap: usize,
}

impl WsServer {
    pub fn new(cfg: &WsConfig) -> Self {
        Self {
            conn_mgr: ConnManager::new(cfg.num_buckets, cfg.per_bucket_capacity),
            out_queue_cap: cfg.out_queue_cap,
        }
    }

    /// Registre sous-jacent
    pub fn conn_manager(&self) -> &ConnManager {
        &self.conn_mgr
    }

    /// Prend en charge une socket fraîchement upgradée pour l'utilisateur
    /// donné: inscription au registre puis animation des pompes jusqu'à la
    /// fin de vie de la socket. Le retrait final est vérifié par identité.
    pub async fn serve_connection(&self, user_id: i64, socket: WebSocket, dispatch: Dispatch) {
        let (conn, out_rx) = WsConn::new(user_id, self.out_queue_cap);

        if let Err(e) = self.conn_mgr.add(conn.clone()) {
            tracing::error!(user_id = %user_id, error = %e, "❌ Inscription refusée, fermeture de la socket");
            conn.close();
            return;
        }

        tracing::info!(
            user_id = %user_id,
            total_connections = %self.conn_mgr.len(),
            "👤 Connexion inscrite"
        );

        Arc::clone(&conn).work(socket, out_rx, dispatch).await;
        self.conn_mgr.remove_if_same(&conn);

        tracing::info!(
            user_id = %user_id,
            total_connections = %self.conn_mgr.len(),
            "🚪 Connexion terminée"
        );
    }

    /// Pousse une charge utile déjà sérialisée vers les destinataires
    /// connectés à ce processus. Les absents sont ignorés en silence (le
    /// stockage fait foi); les files pleines appliquent leur politique.
    pub fn push(&self, payload: &Bytes, user_ids: &[i64]) -> Result<()> {
        for &user_id in user_ids {
            if let Some(conn) = self.conn_mgr.get(user_id) {
                if let Err(e) = conn.write(payload.clone()) {
                    tracing::warn!(user_id = %user_id, error = %e, "⚠️ Échec de push");
                }
            }
        }
        Ok(())
    }

    /// Nombre de connexions vivantes
    pub fn connection_count(&self) -> usize {
        self.conn_mgr.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsConfig;
    use crate::ws::connection::WsConn;

    fn server() -> WsServer {
        WsServer::new(&WsConfig {
            num_buckets: 4,
            per_bucket_capacity: 16,
            out_queue_cap: 8,
        })
    }

    #[test]
    fn test_push_reaches_connected_targets_only() {
        let srv = server();
        let (conn, mut rx) = WsConn::new(11, 8);
        srv.conn_manager().add(conn).unwrap();

        let payload = Bytes::from_static(b"{\"seq\":1}");
        // 99 n'est pas connecté: ignoré en silence
        srv.push(&payload, &[11, 99]).unwrap();

        assert_eq!(rx.try_recv().unwrap(), payload);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_push_to_closed_connection_is_logged_not_fatal() {
        let srv = server();
        let (conn, _rx) = WsConn::new(3, 8);
        srv.conn_manager().add(conn.clone()).unwrap();
        conn.close();

        // Ne doit pas remonter d'erreur: la persistance fait foi
        srv.push(&Bytes::from_static(b"x"), &[3]).unwrap();
    }
}

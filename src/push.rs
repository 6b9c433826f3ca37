//! Pool de push asynchrone
//!
//! Détache la sérialisation et l'écriture des notifications du chemin du
//! dispatcher. Pool de taille fixe sur une file bornée: le débordement
//! échoue avec `pool_full`, jamais de tâche illimitée par envoi. Chaque
//! travail sérialise sa charge utile une seule fois puis écrit vers chaque
//! destinataire; les absents sont ignorés (le stockage fait foi).

use crate::config::PushConfig;
use crate::error::{ImError, Result};
use crate::models::Message;
use crate::ws::WsServer;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Travail de push: un message persisté et ses destinataires
#[derive(Debug)]
pub struct PushJob {
    pub message: Message,
    pub targets: Vec<i64>,
}

/// Pool de workers de push
pub struct AsyncPusher {
    /// `None` après arrêt; fermer l'émetteur draine les workers
    tx: Mutex<Option<mpsc::Sender<PushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl AsyncPusher {
    /// Démarre `pool_size` workers sur une file de `queue_capacity` travaux
    pub fn new(cfg: &PushConfig, ws: Arc<WsServer>) -> Self {
        let (tx, rx) = mpsc::channel::<PushJob>(cfg.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..cfg.pool_size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let ws = Arc::clone(&ws);
                tokio::spawn(async move {
                    loop {
                        // Un seul consommateur à la fois; la file reste FIFO
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => deliver(&ws, job),
                            None => break,
                        }
                    }
                    tracing::debug!(worker_id = %worker_id, "🛑 Worker de push terminé");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            drain_timeout: cfg.drain_timeout,
        }
    }

    /// Soumet un travail; échoue avec `pool_full` si la file déborde
    pub fn submit(&self, job: PushJob) -> Result<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ImError::internal_error("pool de push arrêté"));
        };

        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    targets = %job.targets.len(),
                    msg_id = %job.message.msg_id,
                    "⚠️ Pool de push plein, travail refusé"
                );
                Err(ImError::PoolFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ImError::internal_error("pool de push arrêté"))
            }
        }
    }

    /// Drainage borné à l'arrêt: ferme la file, attend les workers jusqu'au
    /// timeout, abandonne les travaux restants
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());

        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, join_all)
            .await
            .is_err()
        {
            tracing::warn!("⚠️ Drainage du pool de push interrompu, travaux restants abandonnés");
        } else {
            tracing::info!("🛑 Pool de push drainé");
        }
    }
}

/// Sérialise une seule fois puis pousse vers chaque destinataire connecté
fn deliver(ws: &WsServer, job: PushJob) {
    let payload = match serde_json::to_vec(&job.message) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!(msg_id = %job.message.msg_id, error = %e, "❌ Sérialisation de push échouée");
            return;
        }
    };

    if let Err(e) = ws.push(&payload, &job.targets) {
        tracing::warn!(msg_id = %job.message.msg_id, error = %e, "⚠️ Push partiel");
    }

    tracing::debug!(
        msg_id = %job.message.msg_id,
        seq = %job.message.seq,
        targets = %job.targets.len(),
        "📡 Message poussé"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsConfig;
    use crate::models::MessageStatus;
    use crate::ws::WsConn;

    fn message(msg_id: i64) -> Message {
        Message {
            user_id: 1,
            msg_id,
            conversation_id: 5,
            content: "salut".into(),
            content_type: 1,
            status: MessageStatus::Visible.as_i32(),
            seq: 3,
            send_time: 1000,
            created_at: 1001,
        }
    }

    fn ws_server() -> Arc<WsServer> {
        Arc::new(WsServer::new(&WsConfig {
            num_buckets: 2,
            per_bucket_capacity: 8,
            out_queue_cap: 8,
        }))
    }

    #[tokio::test]
    async fn test_submit_overflow_fails_pool_full() {
        // Aucun worker: la file ne se vide pas
        let cfg = PushConfig {
            pool_size: 0,
            queue_capacity: 1,
            drain_timeout: Duration::from_millis(10),
        };
        let pusher = AsyncPusher::new(&cfg, ws_server());

        pusher
            .submit(PushJob {
                message: message(1),
                targets: vec![2],
            })
            .unwrap();
        let err = pusher
            .submit(PushJob {
                message: message(2),
                targets: vec![2],
            })
            .unwrap_err();
        assert!(matches!(err, ImError::PoolFull));
    }

    #[tokio::test]
    async fn test_job_reaches_connected_target() {
        let cfg = PushConfig {
            pool_size: 2,
            queue_capacity: 8,
            drain_timeout: Duration::from_millis(100),
        };
        let ws = ws_server();
        let (conn, mut rx) = WsConn::new(9, 8);
        ws.conn_manager().add(conn).unwrap();

        let pusher = AsyncPusher::new(&cfg, Arc::clone(&ws));
        pusher
            .submit(PushJob {
                message: message(77),
                // 1234 n'est pas connecté: ignoré en silence
                targets: vec![9, 1234],
            })
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("délai de push dépassé")
            .expect("file fermée");
        let decoded: Message = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.msg_id, 77);
        assert_eq!(decoded.seq, 3);

        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let cfg = PushConfig {
            pool_size: 1,
            queue_capacity: 4,
            drain_timeout: Duration::from_millis(100),
        };
        let pusher = AsyncPusher::new(&cfg, ws_server());
        pusher.shutdown().await;

        let err = pusher
            .submit(PushJob {
                message: message(1),
                targets: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, ImError::Internal { .. }));
    }
}

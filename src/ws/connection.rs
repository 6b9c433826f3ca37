//! Connexion WebSocket individuelle
//!
//! Chaque socket est animée par deux pompes coopérantes: la boucle de
//! lecture décode les trames et les remet au dispatcher, la boucle
//! d'écriture draine la file d'envoi bornée. La fermeture est idempotente
//! et ne fait que basculer l'état: elle ne bloque jamais sur de l'I/O et ne
//! rentre pas dans le registre.
//!
//! Politique de contre-pression de la file d'envoi: drop-newest. Quand la
//! file est pleine, la charge utile est abandonnée après journalisation,
//! uniformément pour tous les producteurs (voir [`WsConn::new`]).

use crate::error::{ImError, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Fonction de remise des trames entrantes au dispatcher
pub type Dispatch = Arc<dyn Fn(i64, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Réception de la file d'envoi, consommée par la boucle d'écriture
pub type OutboundRx = mpsc::Receiver<Bytes>;

/// Connexion vivante d'un utilisateur.
///
/// `conn_id` est l'identifiant de l'utilisateur; le registre garantit au
/// plus une entrée vivante par identifiant.
pub struct WsConn {
    pub conn_id: i64,
    out_tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl WsConn {
    /// Crée la connexion et sa file d'envoi bornée.
    ///
    /// `queue_cap` borne la file; en cas de dépassement, `write` abandonne
    /// la charge utile la plus récente après un log (drop-newest).
    pub fn new(conn_id: i64, queue_cap: usize) -> (Arc<Self>, OutboundRx) {
        let (out_tx, out_rx) = mpsc::channel(queue_cap.max(1));
        let conn = Arc::new(Self {
            conn_id,
            out_tx,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (conn, out_rx)
    }

    /// Enfile une charge utile à destination de ce client.
    ///
    /// Les écritures d'une même connexion sont livrées dans l'ordre
    /// d'enfilement. Échoue avec `ConnectionClosed` après fermeture.
    pub fn write(&self, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ImError::ConnectionClosed {
                conn_id: self.conn_id,
            });
        }

        match self.out_tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Contre-pression: drop-newest, uniforme
                tracing::warn!(
                    conn_id = %self.conn_id,
                    "⚠️ File d'envoi pleine, message abandonné"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ImError::ConnectionClosed {
                conn_id: self.conn_id,
            }),
        }
    }

    /// Fermeture idempotente: bascule le drapeau (0→1) et réveille les
    /// pompes. Sûre depuis n'importe quelle tâche, y compris les pompes
    /// elles-mêmes; le retrait du registre revient au worker.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            tracing::debug!(conn_id = %self.conn_id, "🔌 Connexion marquée fermée");
        }
    }

    /// Vrai une fois la connexion fermée
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Anime la socket: démarre la pompe d'écriture puis pompe les lectures
    /// jusqu'à erreur, fermeture distante ou éviction. Au retour, les deux
    /// pompes sont terminées et la connexion est fermée.
    pub async fn work(self: Arc<Self>, socket: WebSocket, out_rx: OutboundRx, dispatch: Dispatch) {
        tracing::debug!(conn_id = %self.conn_id, "🔧 Démarrage des pompes de connexion");

        let (sink, stream) = socket.split();

        let writer = {
            let conn = Arc::clone(&self);
            tokio::spawn(async move {
                conn.write_loop(sink, out_rx).await;
            })
        };

        self.read_loop(stream, dispatch).await;
        self.close();

        // La pompe d'écriture sort sur la notification de fermeture
        let _ = writer.await;
        tracing::debug!(conn_id = %self.conn_id, "🔌 Pompes de connexion terminées");
    }

    /// Consomme la file d'envoi et écrit des trames binaires. Une erreur
    /// d'écriture déclenche la fermeture.
    async fn write_loop(
        &self,
        mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
        mut out_rx: OutboundRx,
    ) {
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                _ = self.close_notify.notified() => break,
                maybe = out_rx.recv() => match maybe {
                    Some(payload) => {
                        if let Err(e) = sink.send(WsMessage::Binary(payload.to_vec())).await {
                            tracing::warn!(conn_id = %self.conn_id, error = %e, "⚠️ Échec d'écriture, fermeture");
                            self.close();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Fin de flux propre côté pair; les erreurs ici sont sans intérêt
        let _ = sink.close().await;
    }

    /// Lit les trames entrantes. Ping/pong sont ignorés; le reste part au
    /// dispatcher. Toute erreur de lecture termine la pompe.
    async fn read_loop(
        &self,
        mut stream: futures_util::stream::SplitStream<WebSocket>,
        dispatch: Dispatch,
    ) {
        loop {
            if self.is_closed() {
                break;
            }
            let frame = tokio::select! {
                _ = self.close_notify.notified() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Text(text))) => {
                    dispatch(self.conn_id, text.into_bytes()).await;
                }
                Some(Ok(WsMessage::Binary(payload))) => {
                    dispatch(self.conn_id, payload).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::debug!(conn_id = %self.conn_id, "👋 Fermeture côté client");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(conn_id = %self.conn_id, error = %e, "⚠️ Erreur de lecture");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_preserves_fifo_order() {
        let (conn, mut rx) = WsConn::new(1, 16);
        conn.write(Bytes::from_static(b"a")).unwrap();
        conn.write(Bytes::from_static(b"b")).unwrap();
        conn.write(Bytes::from_static(b"c")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"c"));
    }

    #[test]
    fn test_write_drops_newest_when_full() {
        let (conn, mut rx) = WsConn::new(1, 2);
        conn.write(Bytes::from_static(b"a")).unwrap();
        conn.write(Bytes::from_static(b"b")).unwrap();
        // File pleine: abandonné sans erreur (drop-newest)
        conn.write(Bytes::from_static(b"c")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_fails_after_close() {
        let (conn, _rx) = WsConn::new(7, 4);
        conn.close();
        let err = conn.write(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ImError::ConnectionClosed { conn_id: 7 }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _rx) = WsConn::new(2, 4);
        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }
}

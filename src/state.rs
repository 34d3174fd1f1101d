use tokio::sync::{mpsc, oneshot, watch};

use crate::error::SessionError;
use crate::events::EventSender;
use crate::session::{Reply, SessionCommand, SessionSnapshot};

/// Transport-agnostic handle shared by services and API routes.
/// Everything that mutates a session goes through `session_tx`.
#[derive(Clone)]
pub struct ServiceContext {
    pub peer_id: String,
    pub session_tx: mpsc::Sender<SessionCommand>,
    pub event_tx: EventSender,
    pub state_rx: watch::Receiver<SessionSnapshot>,
}

impl ServiceContext {
    /// Send a command carrying a reply channel and wait for the loop's answer.
    pub async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.session_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::Unavailable)?;
        reply_rx.await.map_err(|_| SessionError::Unavailable)?
    }

    /// Fire-and-forget command.
    pub async fn notify(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.session_tx.send(cmd).await.map_err(|_| SessionError::Unavailable)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }
}

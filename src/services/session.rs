use tracing::info;

use crate::error::Result;
use crate::session::{SessionCommand, SessionSnapshot};
use crate::state::ServiceContext;

/// Start hosting. Returns the session id other devices join with.
pub async fn start_host(ctx: &ServiceContext, callsign: &str) -> Result<String> {
    let callsign = callsign.trim().to_string();
    let session_id = ctx
        .request(|reply| SessionCommand::StartHost { callsign, reply })
        .await?;
    info!("Hosting session {}", session_id);
    Ok(session_id)
}

/// Join a host. Resolves once the sync channel to the host is open.
pub async fn join(ctx: &ServiceContext, callsign: &str, session_id: &str) -> Result<()> {
    let callsign = callsign.trim().to_string();
    let session_id = session_id.trim().to_string();
    ctx.request(|reply| SessionCommand::Join { callsign, session_id, reply })
        .await
}

pub async fn leave(ctx: &ServiceContext) -> Result<()> {
    ctx.request(|reply| SessionCommand::Leave { reply }).await
}

pub fn snapshot(ctx: &ServiceContext) -> SessionSnapshot {
    ctx.snapshot()
}

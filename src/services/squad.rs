use crate::error::Result;
use crate::models::{Marker, MarkerPosition, OperatorStatus, Position};
use crate::session::SessionCommand;
use crate::state::ServiceContext;

pub async fn set_status(ctx: &ServiceContext, status: OperatorStatus) -> Result<()> {
    ctx.request(|reply| SessionCommand::SetStatus { status, reply }).await
}

pub async fn set_position(ctx: &ServiceContext, position: Position) -> Result<()> {
    ctx.request(|reply| SessionCommand::SetPosition { position, reply }).await
}

/// Battery level in percent. Values above 100 are clamped by the engine.
pub async fn set_battery(ctx: &ServiceContext, percent: u8) -> Result<()> {
    ctx.request(|reply| SessionCommand::SetBattery { percent, reply }).await
}

pub async fn create_marker(ctx: &ServiceContext, position: MarkerPosition, label: &str) -> Result<Marker> {
    let label = label.to_string();
    ctx.request(|reply| SessionCommand::CreateMarker { position, label, reply })
        .await
}

pub async fn move_marker(ctx: &ServiceContext, id: &str, position: MarkerPosition) -> Result<()> {
    let id = id.to_string();
    ctx.request(|reply| SessionCommand::MoveMarker { id, position, reply })
        .await
}

pub async fn delete_marker(ctx: &ServiceContext, id: &str) -> Result<()> {
    let id = id.to_string();
    ctx.request(|reply| SessionCommand::DeleteMarker { id, reply }).await
}

/// Host only.
pub async fn set_silence(ctx: &ServiceContext, silenced: bool) -> Result<()> {
    ctx.request(|reply| SessionCommand::SetSilence { silenced, reply }).await
}

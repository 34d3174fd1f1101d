use crate::error::Result;
use crate::media::audio::{self, AudioDevice};
use crate::session::{SessionCommand, TransmitState};
use crate::state::ServiceContext;
use crate::voice::focus::HardwareEvent;

pub async fn hold_talk(ctx: &ServiceContext) -> Result<TransmitState> {
    ctx.request(|reply| SessionCommand::HoldTalk { reply }).await
}

pub async fn release_talk(ctx: &ServiceContext) -> Result<TransmitState> {
    ctx.request(|reply| SessionCommand::ReleaseTalk { reply }).await
}

pub async fn toggle_mode(ctx: &ServiceContext) -> Result<TransmitState> {
    ctx.request(|reply| SessionCommand::ToggleMode { reply }).await
}

/// Forward a platform audio notification (headset plug, focus change).
pub async fn hardware_event(ctx: &ServiceContext, event: HardwareEvent) -> Result<()> {
    ctx.notify(SessionCommand::Hardware(event)).await
}

pub fn list_devices() -> Vec<AudioDevice> {
    audio::list_devices()
}

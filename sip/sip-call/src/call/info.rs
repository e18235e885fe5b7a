use super::{CallAgent, CallId, InviteState};
use crate::account::AccountId;
use crate::error::Result;
use crate::invite::session::Role;
use crate::media::{SecureLevel, SrtpUse};
use sdp_types::Direction;
use std::fmt::Write;
use std::time::{Duration, Instant};

/// Snapshot of a call's state
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub id: CallId,
    pub role: Role,
    pub account_id: AccountId,

    /// Remote identity as a printable URI
    pub remote: Option<String>,

    pub state: InviteState,

    /// Most recent status observed on the call
    pub last_status: Option<u16>,
    pub last_status_text: String,

    pub media_active: bool,
    pub media_dir: Direction,
    pub secure_level: SecureLevel,
    pub local_hold: bool,

    /// Audio mixer slot of the call's stream
    pub conf_slot: Option<usize>,

    /// SSRC of the outgoing RTP stream
    pub ssrc: u32,

    /// SRTP policy the peer advertised
    pub rem_srtp_use: SrtpUse,

    /// Time since the session was confirmed
    pub connect_duration: Option<Duration>,

    /// Time since the call was created
    pub total_duration: Duration,
}

pub(crate) async fn get_info(agent: &CallAgent, call_id: CallId) -> Result<CallInfo> {
    let (_, state) = agent.acquire_call(call_id).await?;

    let now = Instant::now();

    Ok(CallInfo {
        id: call_id,
        role: state.role,
        account_id: state.acc_id,
        remote: state
            .remote
            .as_ref()
            .map(|remote| {
                use sip_types::print::AppendCtx;
                remote.default_print_ctx().to_string()
            }),
        state: state.invite_state,
        last_status: state.last_code.map(|code| code.into_u16()),
        last_status_text: state.last_text.to_string(),
        media_active: state.media_active,
        media_dir: state.media_dir,
        secure_level: state.secure_level,
        local_hold: state.local_hold,
        conf_slot: state.conf_slot,
        ssrc: state.rtp.ssrc,
        rem_srtp_use: state.rem_srtp_use,
        connect_duration: state
            .conn_time
            .map(|conn_time| now.saturating_duration_since(conn_time)),
        total_duration: state
            .start_time
            .map(|start_time| now.saturating_duration_since(start_time))
            .unwrap_or_default(),
    })
}

fn fmt_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Render a human readable description of the call
pub(crate) async fn dump(
    agent: &CallAgent,
    call_id: CallId,
    with_media: bool,
    indent: &str,
) -> Result<String> {
    let info = get_info(agent, call_id).await?;

    let mut out = String::new();

    let _ = writeln!(
        out,
        "{indent}[CALL #{}] {:?} {} to {}",
        info.id,
        info.state,
        match info.role {
            Role::Uac => "outgoing",
            Role::Uas => "incoming",
        },
        info.remote.as_deref().unwrap_or("<unknown>"),
    );

    let _ = writeln!(
        out,
        "{indent}  duration: {} connected: {}",
        fmt_duration(info.total_duration),
        info.connect_duration
            .map(fmt_duration)
            .unwrap_or_else(|| "--".into()),
    );

    if let Some(code) = info.last_status {
        let _ = writeln!(out, "{indent}  last status: {} {}", code, info.last_status_text);
    }

    if with_media {
        let _ = writeln!(
            out,
            "{indent}  media: {} dir: {:?}{}",
            if info.media_active { "active" } else { "inactive" },
            info.media_dir,
            if info.local_hold { " (local hold)" } else { "" },
        );
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_render_as_wall_clock() {
        assert_eq!(fmt_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(fmt_duration(Duration::from_secs(61)), "00:01:01");
        assert_eq!(fmt_duration(Duration::from_secs(3661)), "01:01:01");
    }
}

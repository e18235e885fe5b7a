use super::{Call, CallAgent, CallState, InviteState};
use crate::error::{CallError, Result};
use crate::invite::session::{
    InviteSession, MessageReceived, ReInviteReceived, SessionEvent, UpdateReceived,
};
use crate::media;
use bytesstr::BytesStr;
use sdp_types::SessionDescription;
use sip_core::transport::OutgoingResponse;
use sip_types::header::typed::ContentType;
use sip_types::{StatusCode, CodeKind};
use std::sync::Arc;
use std::time::Instant;

const CONTENT_TYPE_SDP: &str = "application/sdp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferKind {
    /// Plain offer from the media session
    Fresh,
    /// Offer announcing call hold
    Hold,
}

pub(crate) fn parse_sdp_body(body: &[u8]) -> Option<SessionDescription> {
    let body = BytesStr::from_utf8_bytes(bytes::Bytes::copy_from_slice(body)).ok()?;

    SessionDescription::parse(&body).ok()
}

fn sdp_response_body(response: &mut OutgoingResponse, sdp: &SessionDescription) {
    response
        .msg
        .headers
        .insert_named(&ContentType(BytesStr::from_static(CONTENT_TYPE_SDP)));
    response.msg.body = sdp.to_string().into_bytes().into();
}

/// Build a fresh local offer, optionally converted into a hold offer, with
/// the origin version continuing the active local SDP
async fn build_local_offer(state: &mut CallState, kind: OfferKind) -> Result<SessionDescription> {
    let media_session = state.media.as_mut().ok_or(CallError::InvalidOp)?;

    let mut sdp = media_session.create_sdp_offer().await?;

    if kind == OfferKind::Hold {
        media::apply_hold(&mut sdp, state.media_dir);
    }

    media::bump_sdp_version(&mut sdp, state.active_local_sdp.as_ref());

    Ok(sdp)
}

/// Send a re-INVITE with a new offer and apply the peer's answer
pub(crate) async fn send_reinvite(
    agent: &CallAgent,
    call: &Arc<Call>,
    state: &mut CallState,
    kind: OfferKind,
) -> Result<()> {
    let session = state.session.clone().ok_or(CallError::SessionState)?;

    let offer = build_local_offer(state, kind).await?;

    let response = session.reinvite_with_offer(offer.to_string()).await?;

    latch_status(state, &response.line.code, response.line.reason.as_ref());

    if response.line.code.kind() != CodeKind::Success {
        return Err(CallError::PeerStatus(response.line.code));
    }

    match parse_sdp_body(&response.body) {
        Some(answer) => {
            apply_negotiated(agent, call, state, offer, answer).await;
        }
        None => {
            // Negotiation failures on a re-INVITE do not end the session
            log::warn!(
                "call {}: re-INVITE answer carried no usable SDP",
                call.index
            );
        }
    }

    Ok(())
}

/// Send an UPDATE with a new offer and apply the peer's answer
pub(crate) async fn send_update(agent: &CallAgent, call: &Arc<Call>, state: &mut CallState) -> Result<()> {
    let session = state.session.clone().ok_or(CallError::SessionState)?;

    let offer = build_local_offer(state, OfferKind::Fresh).await?;

    let response = session.update_with_offer(offer.to_string()).await?;

    latch_status(state, &response.line.code, response.line.reason.as_ref());

    if response.line.code.kind() != CodeKind::Success {
        return Err(CallError::PeerStatus(response.line.code));
    }

    match parse_sdp_body(&response.body) {
        Some(answer) => apply_negotiated(agent, call, state, offer, answer).await,
        None => log::warn!("call {}: UPDATE answer carried no usable SDP", call.index),
    }

    Ok(())
}

/// Install the outcome of a completed offer/answer cycle: remember the
/// active session descriptions, refresh the remote NAT type and
/// (re)start the media streams.
pub(crate) async fn apply_negotiated(
    agent: &CallAgent,
    call: &Arc<Call>,
    state: &mut CallState,
    local: SessionDescription,
    remote: SessionDescription,
) {
    if agent.inner.config.nat_type_in_sdp {
        state.rem_nat_type = media::remote_nat_type(&remote);
    }

    state.rem_srtp_use = media::remote_srtp_use(&remote);

    let mut rtp = state.rtp;

    let Some(media_session) = state.media.as_mut() else {
        return;
    };

    match media_session.start(&local, &remote, &mut rtp).await {
        Ok(()) => {
            state.rtp = rtp;
            state.conf_slot = media_session.conf_slot();

            state.media_active = true;
            state.media_dir = local
                .media_descriptions
                .first()
                .map(|m| m.direction)
                .unwrap_or_default();

            state.active_local_sdp = Some(local);
            state.active_remote_sdp = Some(remote);

            let agent = agent.clone();
            let call_id = call.index;

            tokio::spawn(async move {
                agent.inner.handler.on_call_media_state(&agent, call_id).await;
            });
        }
        Err(e) => {
            log::warn!("call {}: starting media failed, {e}", call.index);

            // A failed renegotiation on a confirmed session leaves the
            // session alive; failures during setup kill it with 415
            if state.invite_state != InviteState::Confirmed
                && state.invite_state != InviteState::Null
            {
                disconnect_with_status(agent, call, state, StatusCode::UNSUPPORTED_MEDIA_TYPE)
                    .await;
            }
        }
    }
}

/// Terminate the session (BYE) and run the disconnect bookkeeping
pub(crate) async fn disconnect_with_status(
    agent: &CallAgent,
    call: &Arc<Call>,
    state: &mut CallState,
    status: StatusCode,
) {
    if let Some(session) = state.session.clone() {
        if let Err(e) = session.terminate().await {
            log::debug!("terminating call {} failed, {e:?}", call.index);
        }
    }

    on_disconnected(agent, call, state, Some(status), None).await;
}

/// Record a provisional/final status observed on the call
pub(crate) fn latch_status(state: &mut CallState, code: &StatusCode, reason: Option<&BytesStr>) {
    state.last_code = Some(*code);
    state.last_text = reason
        .cloned()
        .or_else(|| code.text().map(BytesStr::from_static))
        .unwrap_or_else(|| BytesStr::from_static(""));
}

/// Transition the call into a new INVITE session state, with the
/// bookkeeping and notifications the transition implies
pub(crate) async fn change_state(
    agent: &CallAgent,
    call: &Arc<Call>,
    state: &mut CallState,
    new_state: InviteState,
    status: Option<(StatusCode, Option<BytesStr>)>,
) {
    if let Some((code, reason)) = &status {
        latch_status(state, code, reason.as_ref());
    }

    match new_state {
        InviteState::Early | InviteState::Connecting => {
            if state.res_time.is_none() {
                state.res_time = Some(Instant::now());
            }
        }
        InviteState::Confirmed => {
            state.conn_time = Some(Instant::now());
        }
        _ => {}
    }

    state.invite_state = new_state;

    // Progress of a call created by an incoming REFER is reported back to
    // the transferor
    if let Some(xfer_sub) = state.xfer_sub.clone() {
        let code = state.last_code.unwrap_or(StatusCode::TRYING);
        let reason = state.last_text.clone();

        let terminated = new_state == InviteState::Disconnected;

        if new_state.is_active() || terminated {
            tokio::spawn(async move {
                xfer_sub
                    .notify_progress(code.into_u16(), &reason, terminated)
                    .await;
            });
        }
    }

    let agent = agent.clone();
    let call_id = call.index;

    tokio::spawn(async move {
        agent
            .inner
            .handler
            .on_call_state(&agent, call_id, new_state)
            .await;
    });
}

/// Disconnect bookkeeping: timestamps, final status, media teardown and
/// slot release. Idempotent.
pub(crate) async fn on_disconnected(
    agent: &CallAgent,
    call: &Arc<Call>,
    state: &mut CallState,
    status: Option<StatusCode>,
    reason: Option<&str>,
) {
    if state.invite_state == InviteState::Disconnected {
        return;
    }

    state.dis_time = Some(Instant::now());

    if state.res_time.is_none() {
        state.res_time = state.dis_time;
    }

    // Keep the most significant status seen on this call, defaulting to
    // 487 Request Terminated
    let previous = state.last_code.map(StatusCode::into_u16).unwrap_or(0);
    let event = status.map(StatusCode::into_u16).unwrap_or(0);

    if event > previous {
        state.last_code = Some(StatusCode::from(event));
        state.last_text = reason
            .map(BytesStr::from)
            .or_else(|| StatusCode::from(event).text().map(BytesStr::from_static))
            .unwrap_or_else(|| BytesStr::from_static(""));
    } else if previous == 0 {
        state.last_code = Some(StatusCode::REQUEST_TERMINATED);
        state.last_text = BytesStr::from_static("Request Terminated");
    }

    if let Some(mut media_session) = state.media.take() {
        media_session.stop().await;
    }

    state.media_active = false;
    state.session = None;
    state.acceptor = None;
    state.cancel_tx = None;
    state.redirect_tx = None;

    change_state(agent, call, state, InviteState::Disconnected, None).await;
    state.xfer_sub = None;

    agent.inner.table.lock().release(call.index);
}

/// Drive an established INVITE session until it terminates
///
/// Returns an explicitly boxed future (rather than being a plain `async
/// fn`) because its call graph loops back on itself through
/// `transfer::on_incoming_refer` -> `outbound::make_call` ->
/// `outbound::start_outgoing`, which also spawns this function; resolving
/// everyone's `impl Future` hidden type in that cycle is unsupported by
/// rustc, so one edge needs a concrete (non-opaque) type to break it.
pub(crate) fn session_task(
    agent: CallAgent,
    call: Arc<Call>,
    mut session: InviteSession,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
    loop {
        match session.run().await {
            Ok(SessionEvent::ReInviteReceived(event)) => {
                if let Err(e) = handle_reinvite(&agent, &call, &mut session, event).await {
                    log::warn!("call {}: handling re-INVITE failed, {e:?}", call.index);
                }
            }
            Ok(SessionEvent::UpdateReceived(event)) => {
                if let Err(e) = handle_update(&agent, &call, &session, event).await {
                    log::warn!("call {}: handling UPDATE failed, {e:?}", call.index);
                }
            }
            Ok(SessionEvent::ReferReceived(event)) => {
                super::transfer::on_incoming_refer(&agent, &call, &session.handle(), event).await;
            }
            Ok(SessionEvent::MessageReceived(event)) => {
                if let Err(e) = handle_message(&agent, &call, &session, event).await {
                    log::warn!("call {}: handling MESSAGE failed, {e:?}", call.index);
                }
            }
            Ok(SessionEvent::Bye(event)) => {
                if let Err(e) = session.handle_bye(event).await {
                    log::warn!("call {}: responding to BYE failed, {e:?}", call.index);
                }

                let mut state = call.state.lock().await;
                on_disconnected(&agent, &call, &mut state, None, None).await;

                return;
            }
            Ok(SessionEvent::Terminated) => {
                let mut state = call.state.lock().await;
                on_disconnected(&agent, &call, &mut state, None, None).await;

                return;
            }
            Err(e) => {
                log::warn!("call {}: session error, {e:?}", call.index);

                let mut state = call.state.lock().await;
                on_disconnected(&agent, &call, &mut state, None, None).await;

                return;
            }
        }
    }
    })
}

/// Incoming re-INVITE: answer a carried offer (or offer ourselves and read
/// the answer from the ACK), honoring local hold
async fn handle_reinvite(
    agent: &CallAgent,
    call: &Arc<Call>,
    session: &mut InviteSession,
    event: ReInviteReceived,
) -> Result<()> {
    let mut state = call.state.lock().await;

    if let Some(offer) = parse_sdp_body(&event.invite.body) {
        let Some(media_session) = state.media.as_mut() else {
            return respond_reinvite_failure(session, event, StatusCode::NOT_ACCEPTABLE_HERE).await;
        };

        let mut answer = match media_session.create_sdp_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("call {}: no answer for re-INVITE offer, {e}", call.index);
                return respond_reinvite_failure(session, event, e.status).await;
            }
        };

        media::mirror_zero_connection(&offer, &mut answer);

        if state.local_hold {
            media::apply_hold_to_answer(&mut answer);
        }

        let mut response = session
            .dialog
            .create_response(&event.invite, StatusCode::OK, None)?;

        sdp_response_body(&mut response, &answer);

        session.respond_reinvite_success(event, response).await?;

        apply_negotiated(agent, call, &mut state, answer, offer).await;

        Ok(())
    } else if event.invite.body.is_empty() {
        // Offerless re-INVITE: we make the offer, the answer arrives in
        // the ACK
        let kind = if state.local_hold {
            OfferKind::Hold
        } else {
            OfferKind::Fresh
        };

        let offer = build_local_offer(&mut state, kind).await?;

        let mut response = session
            .dialog
            .create_response(&event.invite, StatusCode::OK, None)?;

        sdp_response_body(&mut response, &offer);

        let ack = session.respond_reinvite_success(event, response).await?;

        match parse_sdp_body(&ack.body) {
            Some(answer) => apply_negotiated(agent, call, &mut state, offer, answer).await,
            None => log::warn!("call {}: ACK carried no usable SDP answer", call.index),
        }

        Ok(())
    } else {
        // Body present but not parseable as SDP
        respond_reinvite_failure(session, event, StatusCode::BAD_REQUEST).await
    }
}

async fn respond_reinvite_failure(
    session: &InviteSession,
    event: ReInviteReceived,
    status: StatusCode,
) -> Result<()> {
    let response = session.dialog.create_response(&event.invite, status, None)?;

    event.transaction.respond_failure(response).await?;

    Ok(())
}

/// Incoming UPDATE carrying (or not carrying) an offer
async fn handle_update(
    agent: &CallAgent,
    call: &Arc<Call>,
    session: &InviteSession,
    event: UpdateReceived,
) -> Result<()> {
    let mut state = call.state.lock().await;

    if let Some(offer) = parse_sdp_body(&event.update.body) {
        let Some(media_session) = state.media.as_mut() else {
            let response = session.dialog.create_response(
                &event.update,
                StatusCode::NOT_ACCEPTABLE_HERE,
                None,
            )?;
            event.transaction.respond(response).await?;
            return Ok(());
        };

        let mut answer = match media_session.create_sdp_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("call {}: no answer for UPDATE offer, {e}", call.index);
                let response = session
                    .dialog
                    .create_response(&event.update, e.status, None)?;
                event.transaction.respond(response).await?;
                return Ok(());
            }
        };

        media::mirror_zero_connection(&offer, &mut answer);

        if state.local_hold {
            media::apply_hold_to_answer(&mut answer);
        }

        let mut response = session
            .dialog
            .create_response(&event.update, StatusCode::OK, None)?;

        sdp_response_body(&mut response, &answer);

        event.transaction.respond(response).await?;

        apply_negotiated(agent, call, &mut state, answer, offer).await;
    } else {
        let response = session
            .dialog
            .create_response(&event.update, StatusCode::OK, None)?;

        event.transaction.respond(response).await?;
    }

    Ok(())
}

/// Incoming MESSAGE: respond right away, then hand the content to the
/// application
async fn handle_message(
    agent: &CallAgent,
    call: &Arc<Call>,
    session: &InviteSession,
    event: MessageReceived,
) -> Result<()> {
    let response = session
        .dialog
        .create_response(&event.message, StatusCode::OK, None)?;

    event.transaction.respond(response).await?;

    let content_type = event
        .message
        .headers
        .get_named::<ContentType>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|_| "text/plain".into());

    let Ok(body) = std::str::from_utf8(&event.message.body) else {
        log::debug!("call {}: MESSAGE body is not UTF-8", call.index);
        return Ok(());
    };

    agent
        .inner
        .handler
        .on_im_received(agent, call.index, &content_type, body)
        .await;

    Ok(())
}

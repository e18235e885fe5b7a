use super::active::{self, parse_sdp_body};
use super::{Call, CallAgent, CallId, InviteState};
use crate::account::AccountId;
use crate::dialog::{Dialog, DialogKey};
use crate::error::{CallError, Result};
use crate::invite::acceptor::InviteAcceptor;
use crate::invite::session::Role;
use crate::media::{self, SecureLevel};
use bytesstr::BytesStr;
use sdp_types::SessionDescription;
use sip_core::{Endpoint, IncomingRequest};
use sip_types::header::typed::{ContentType, Replaces};
use sip_types::uri::{SipUri, SipUriUserPart};
use sip_types::{CodeKind, Name, StatusCode};
use std::sync::Arc;
use tokio::sync::Notify;

/// Respond to a request we will not take on a call for
async fn refuse(endpoint: &Endpoint, mut invite: IncomingRequest, status: StatusCode, reason: Option<&str>) {
    let mut response = endpoint.create_response(&invite, status, reason.map(BytesStr::from));

    if status == StatusCode::BAD_REQUEST {
        response
            .msg
            .headers
            .insert(Name::WARNING, "399 sip-call \"Offer rejected\"");
    }

    let tsx = endpoint.create_server_inv_tsx(&mut invite);

    tokio::spawn(async move {
        if let Err(e) = tsx.respond_failure(response).await {
            log::warn!("failed to refuse incoming INVITE, {e:?}");
        }
    });
}

fn uri_user(uri: &SipUri) -> Option<&BytesStr> {
    match &uri.user_part {
        SipUriUserPart::Empty => None,
        SipUriUserPart::User(user) => Some(user),
        SipUriUserPart::UserPw(user_pw) => Some(&user_pw.user),
    }
}

/// Pick the account most likely addressed by this INVITE: first the one
/// whose user matches the request URI, then the To header, then the first
/// account
fn find_account(agent: &CallAgent, invite: &IncomingRequest) -> AccountId {
    let request_user = uri_user(&invite.line.uri);
    let to_user = uri_user(&invite.base_headers.to.uri.uri);

    for user in [request_user, to_user].into_iter().flatten() {
        let matched = agent
            .inner
            .accounts
            .iter()
            .position(|acc| uri_user(&acc.id.uri) == Some(user));

        if let Some(acc_id) = matched {
            return acc_id;
        }
    }

    0
}

/// Find the active call owning the dialog a Replaces header points at
async fn find_replaced_call(agent: &CallAgent, replaces: &Replaces) -> Option<(CallId, Arc<Call>)> {
    let key = DialogKey::for_replaces(replaces);

    let candidates = agent.inner.table.lock().active_calls();

    for call in candidates {
        let state = call.state.lock().await;

        if let Some(session) = &state.session {
            if session.dialog.key() == key {
                let index = call.index;
                drop(state);

                return Some((index, call));
            }
        }
    }

    None
}

/// Handle an incoming out-of-dialog INVITE
pub(crate) async fn on_incoming_invite(agent: CallAgent, invite: IncomingRequest) {
    let endpoint = agent.inner.endpoint.clone();

    // Find a free slot first; without one the call is refused outright
    let allocated = {
        let mut table = agent.inner.table.lock();

        table.alloc_id().map(|call_id| {
            let call = Arc::new(Call::new(call_id, Role::Uas, SecureLevel::None));
            table.occupy(call_id, call.clone());

            (call_id, call)
        })
    };

    let (call_id, call) = match allocated {
        Some(allocated) => allocated,
        None => {
            log::info!("unable to accept incoming call (too many calls)");
            refuse(&endpoint, invite, StatusCode::BUSY_HERE, None).await;

            return;
        }
    };

    let released = ReleaseOnError {
        agent: &agent,
        call_id,
    };

    // Verify a Replaces header before doing anything else
    let replaced = match invite.headers.try_get_named::<Replaces>() {
        None => None,
        Some(Err(e)) => {
            log::info!("incoming INVITE with malformed Replaces header, {e}");
            refuse(&endpoint, invite, StatusCode::BAD_REQUEST, Some("Bad Replaces header")).await;

            return;
        }
        Some(Ok(replaces)) => match find_replaced_call(&agent, &replaces).await {
            Some(replaced) => Some(replaced),
            None => {
                refuse(
                    &endpoint,
                    invite,
                    StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                    None,
                )
                .await;

                return;
            }
        },
    };

    // Let the application veto the replacement
    if let Some((replaced_id, _)) = &replaced {
        let code = agent
            .inner
            .handler
            .on_call_replace_request(&agent, *replaced_id)
            .await;

        if code >= 300 {
            refuse(&endpoint, invite, StatusCode::from(code), None).await;

            return;
        }
    }

    let acc_id = find_account(&agent, &invite);
    let account = &agent.inner.accounts[acc_id];

    let secure_level = if invite.line.uri.sips {
        SecureLevel::EndToEnd
    } else if invite.tp_info.transport.secure() {
        SecureLevel::Hop
    } else {
        SecureLevel::None
    };

    // Parse and validate a carried SDP offer
    let offer = if invite.body.is_empty() {
        None
    } else {
        match parse_sdp_body(&invite.body) {
            Some(offer) => {
                if offer.media_descriptions.is_empty() {
                    refuse(
                        &endpoint,
                        invite,
                        StatusCode::BAD_REQUEST,
                        Some("Missing media in SDP"),
                    )
                    .await;

                    return;
                }

                Some(offer)
            }
            None => {
                log::info!("incoming INVITE with unparseable SDP");
                refuse(&endpoint, invite, StatusCode::BAD_REQUEST, Some("Bad SDP")).await;

                return;
            }
        }
    };

    // Bring up the media session and prepare the answer
    let mut media_session = match agent.inner.media.create_session(Role::Uas, secure_level) {
        Ok(media_session) => media_session,
        Err(e) => {
            log::warn!("error initializing media channel, {e}");
            refuse(&endpoint, invite, e.status, None).await;

            return;
        }
    };

    let sdp_answer = match &offer {
        Some(offer) => match media_session.create_sdp_answer(offer).await {
            Ok(answer) => Some(answer),
            Err(e) => {
                log::warn!("error creating SDP answer, {e}");
                refuse(&endpoint, invite, e.status, None).await;

                return;
            }
        },
        None => None,
    };

    let dialog = match Dialog::new_server(endpoint.clone(), &invite, account.contact.clone()) {
        Ok(dialog) => Arc::new(dialog),
        Err(e) => {
            log::warn!("failed to create dialog from INVITE, {e:?}");
            refuse(&endpoint, invite, StatusCode::SERVER_INTERNAL_ERROR, None).await;

            return;
        }
    };

    let mut acceptor = InviteAcceptor::new(dialog, invite);

    let cancelled = acceptor.cancel_notified();

    // Populate the slot
    {
        let mut state = call.state.lock().await;

        state.acc_id = acc_id;
        state.secure_level = secure_level;
        state.remote = acceptor.peer_identity().await;
        state.media = Some(media_session);

        if agent.inner.config.nat_type_in_sdp {
            if let Some(offer) = &offer {
                state.rem_nat_type = media::remote_nat_type(offer);
            }
        }

        state.remote_offer = offer;
        state.sdp_answer = sdp_answer;

        // 100 Trying
        match acceptor.create_response(StatusCode::TRYING, None).await {
            Ok(response) => {
                if let Err(e) = acceptor.respond_provisional(response).await {
                    log::warn!("call {call_id}: unable to send 100 Trying, {e:?}");
                }
            }
            Err(e) => log::warn!("call {call_id}: unable to create 100 Trying, {e:?}"),
        }

        state.acceptor = Some(acceptor);

        active::change_state(&agent, &call, &mut state, InviteState::Incoming, None).await;
    }

    std::mem::forget(released);

    tokio::spawn(watch_cancelled(agent.clone(), call.clone(), cancelled));

    if let Some((replaced_id, _)) = replaced {
        // Take over the replaced session: answer the new call, then end
        // the old one with 410 Gone
        agent
            .inner
            .handler
            .on_call_replaced(&agent, replaced_id, call_id)
            .await;

        log::info!("answering replacement call {call_id} with 200");

        if let Err(e) = answer(&agent, call_id, 200, None).await {
            log::warn!("error answering replacement call {call_id}, {e}");
        }

        log::info!("disconnecting replaced call {replaced_id}");

        if let Err(e) = agent.hangup(replaced_id, 410, None).await {
            log::warn!("error terminating replaced call {replaced_id}, {e}");
        }
    } else {
        let handled = agent.inner.handler.on_incoming_call(&agent, call_id).await;

        if !handled {
            if let Err(e) = agent.hangup(call_id, 480, None).await {
                log::debug!("declining unhandled incoming call failed, {e}");
            }
        }
    }
}

/// Releases the allocated slot when the setup path errors out before the
/// call goes live
struct ReleaseOnError<'a> {
    agent: &'a CallAgent,
    call_id: CallId,
}

impl Drop for ReleaseOnError<'_> {
    fn drop(&mut self) {
        self.agent.inner.table.lock().release(self.call_id);
    }
}

/// Runs the disconnect bookkeeping when the pending INVITE gets cancelled
async fn watch_cancelled(agent: CallAgent, call: Arc<Call>, cancelled: Arc<Notify>) {
    cancelled.notified().await;

    let mut state = call.state.lock().await;

    if state.acceptor.is_some() {
        state.acceptor = None;

        active::on_disconnected(
            &agent,
            &call,
            &mut state,
            Some(StatusCode::REQUEST_TERMINATED),
            None,
        )
        .await;
    }
}

/// Answer an incoming call with a provisional or final response
pub(crate) async fn answer(
    agent: &CallAgent,
    call_id: CallId,
    code: u16,
    reason: Option<BytesStr>,
) -> Result<()> {
    if !(100..700).contains(&code) {
        return Err(CallError::InvalidArgument("invalid status code"));
    }

    let (call, mut state) = agent.acquire_call(call_id).await?;

    if state.acceptor.is_none() {
        return Err(CallError::SessionState);
    }

    if state.res_time.is_none() {
        state.res_time = Some(std::time::Instant::now());
    }

    let status = StatusCode::from(code);

    match status.kind() {
        CodeKind::Provisional => {
            let account_requires_100rel = agent.inner.accounts[state.acc_id].require_100rel;
            let sdp_answer = state.sdp_answer.clone();

            let acceptor = state.acceptor.as_mut().unwrap();

            let mut response = acceptor.create_response(status, reason).await?;

            if status == StatusCode::TRYING {
                acceptor.respond_provisional(response).await?;
                return Ok(());
            }

            let reliable = acceptor.peer_requires_100rel()
                || (account_requires_100rel && acceptor.peer_supports_100rel());

            // Reliable provisionals and 183 carry the prepared answer so
            // the peer can set up early media
            if reliable || status == StatusCode::SESSION_PROGRESS {
                if let Some(answer) = &sdp_answer {
                    sdp_body(&mut response, answer);
                }
            }

            if reliable {
                acceptor.respond_provisional_reliable(response).await?;
            } else {
                acceptor.respond_provisional(response).await?;
            }

            if state.invite_state == InviteState::Incoming {
                active::change_state(
                    agent,
                    &call,
                    &mut state,
                    InviteState::Early,
                    Some((status, None)),
                )
                .await;
            }

            Ok(())
        }
        CodeKind::Success => {
            // Either answer the offer from the INVITE or make our own
            // offer and read the answer from the ACK
            let local_sdp = match state.sdp_answer.clone() {
                Some(answer) => answer,
                None => {
                    let active_local = state.active_local_sdp.clone();
                    let media_session = state.media.as_mut().ok_or(CallError::InvalidOp)?;

                    let mut offer = media_session.create_sdp_offer().await?;
                    media::bump_sdp_version(&mut offer, active_local.as_ref());

                    offer
                }
            };

            let acceptor = state.acceptor.take().unwrap();

            let mut response = match acceptor.create_response(status, reason).await {
                Ok(response) => response,
                Err(e) => {
                    active::on_disconnected(agent, &call, &mut state, None, None).await;
                    return Err(e.into());
                }
            };

            sdp_body(&mut response, &local_sdp);

            let (session, ack) = match acceptor.respond_success(response).await {
                Ok(established) => established,
                Err(e) => {
                    log::info!("call {call_id}: answering failed, {e:?}");

                    active::on_disconnected(agent, &call, &mut state, None, None).await;

                    return Err(CallError::SessionTerminated);
                }
            };

            state.session = Some(session.handle());

            active::change_state(
                agent,
                &call,
                &mut state,
                InviteState::Connecting,
                Some((status, None)),
            )
            .await;

            let remote_sdp = match state.remote_offer.take() {
                Some(offer) => Some(offer),
                None => {
                    let answer = parse_sdp_body(&ack.body);

                    if answer.is_none() {
                        log::warn!("call {call_id}: ACK carried no usable SDP answer");
                    }

                    answer
                }
            };

            if let Some(remote_sdp) = remote_sdp {
                active::apply_negotiated(agent, &call, &mut state, local_sdp, remote_sdp).await;
            }

            active::change_state(agent, &call, &mut state, InviteState::Confirmed, None).await;

            drop(state);

            tokio::spawn(active::session_task(agent.clone(), call, session));

            Ok(())
        }
        _ => {
            let acceptor = state.acceptor.take().unwrap();

            let response = match acceptor.create_response(status, reason.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    active::on_disconnected(agent, &call, &mut state, None, None).await;
                    return Err(e.into());
                }
            };

            acceptor.respond_failure(response).await?;

            active::on_disconnected(
                agent,
                &call,
                &mut state,
                Some(status),
                reason.as_deref(),
            )
            .await;

            Ok(())
        }
    }
}

fn sdp_body(response: &mut sip_core::transport::OutgoingResponse, sdp: &SessionDescription) {
    response
        .msg
        .headers
        .insert_named(&ContentType(BytesStr::from_static("application/sdp")));
    response.msg.body = sdp.to_string().into_bytes().into();
}

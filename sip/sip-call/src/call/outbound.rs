use super::active;
use super::{Call, CallAgent, CallId, InviteState, RedirectAction};
use crate::account::{Account, AccountId};
use crate::error::{CallError, Result};
use crate::invite;
use crate::invite::initiator::{Early, EarlyResponse, InviteInitiator, Response};
use crate::invite::session::{InviteSession, Role};
use crate::util::percent_decode;
use bytesstr::BytesStr;
use sdp_types::SessionDescription;
use sip_auth::{ClientAuthenticator, DigestAuthenticator, RequestParts, ResponseParts};
use sip_core::transaction::TsxResponse;
use sip_core::Request;
use sip_types::header::typed::{Contact, ContentType, Routing};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Name, StatusCode};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Everything needed to (re)build the initial INVITE: the auth retry and
/// redirect-following paths send a fresh transaction from this context.
struct OutgoingContext {
    local_addr: NameAddr,
    contact: Contact,
    route_set: Vec<Routing>,
    require_100rel: bool,
    target: SipUri,
    extra_headers: Vec<(Name, BytesStr)>,
    offer: SessionDescription,
}

impl OutgoingContext {
    fn create_initiator(&self, agent: &CallAgent) -> InviteInitiator {
        let mut initiator = InviteInitiator::new(
            agent.inner.endpoint.clone(),
            self.local_addr.clone(),
            self.contact.clone(),
            self.target.clone(),
        );

        initiator.require_100rel = self.require_100rel;

        initiator
    }

    fn create_invite(&self, initiator: &mut InviteInitiator) -> Request {
        let mut invite = initiator.create_invite();

        if !self.route_set.is_empty() {
            invite.headers.insert_type(Name::ROUTE, &self.route_set);
        }

        for (name, value) in &self.extra_headers {
            invite.headers.insert(name.clone(), value.clone());
        }

        invite
            .headers
            .insert_named(&ContentType(BytesStr::from_static("application/sdp")));
        invite.body = self.offer.to_string().into_bytes().into();

        invite
    }
}

/// Split a destination like `<sip:bob@host?Replaces=..&Require=..>` into
/// the bare URI and the embedded headers (RFC 3261 section 19.1.5)
pub(crate) fn parse_target(dest: &str) -> Result<(SipUri, Vec<(Name, BytesStr)>)> {
    let dest = dest.trim();

    let inner = match dest.strip_prefix('<') {
        Some(rest) => rest
            .strip_suffix('>')
            .ok_or(CallError::InvalidArgument("unterminated name-addr"))?,
        None => dest,
    };

    let (uri_part, headers_part) = match inner.split_once('?') {
        Some((uri_part, headers_part)) => (uri_part, Some(headers_part)),
        None => (inner, None),
    };

    let uri = uri_part
        .parse::<SipUri>()
        .map_err(|_| CallError::InvalidArgument("destination is not a valid SIP URI"))?;

    let mut headers = Vec::new();

    if let Some(headers_part) = headers_part {
        for pair in headers_part.split('&') {
            let Some((name, value)) = pair.split_once('=') else {
                return Err(CallError::InvalidArgument("malformed URI header"));
            };

            headers.push((
                Name::from(percent_decode(name)),
                BytesStr::from(percent_decode(value)),
            ));
        }
    }

    Ok((uri, headers))
}

pub(crate) async fn make_call(
    agent: &CallAgent,
    acc_id: AccountId,
    dest: &str,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    mut extra_headers: Vec<(Name, BytesStr)>,
) -> Result<CallId> {
    let account: &Account = agent
        .inner
        .accounts
        .get(acc_id)
        .ok_or(CallError::InvalidArgument("unknown account"))?;

    // Parse the destination before touching any call state so an invalid
    // URI fails without side effects
    let (target, uri_headers) = parse_target(dest)?;
    extra_headers.extend(uri_headers);

    let secure_level = account.secure_level(&target);

    let (call_id, call) = {
        let mut table = agent.inner.table.lock();

        let Some(call_id) = table.alloc_id() else {
            log::info!("cannot make call, all {} slots in use", table.max_calls());
            return Err(CallError::TooManyCalls);
        };

        let call = Arc::new(Call::new(call_id, Role::Uac, secure_level));
        table.occupy(call_id, call.clone());

        (call_id, call)
    };

    log::info!("call {call_id}: calling {target:?} using account #{acc_id}");

    match start_outgoing(agent, acc_id, account, &call, target, user_data, extra_headers).await {
        Ok(()) => Ok(call_id),
        Err(e) => {
            // Nothing went on the wire, releasing the slot is all the
            // cleanup there is
            agent.inner.table.lock().release(call_id);
            Err(e)
        }
    }
}

async fn start_outgoing(
    agent: &CallAgent,
    acc_id: AccountId,
    account: &Account,
    call: &Arc<Call>,
    target: SipUri,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    extra_headers: Vec<(Name, BytesStr)>,
) -> Result<()> {
    let mut state = call.state.lock().await;

    state.acc_id = acc_id;
    state.user_data = user_data;
    state.remote = Some(NameAddr::uri(target.clone()));

    let mut media_session = agent
        .inner
        .media
        .create_session(Role::Uac, state.secure_level)?;

    let offer = media_session.create_sdp_offer().await?;

    state.media = Some(media_session);

    let ctx = OutgoingContext {
        local_addr: account.id.clone(),
        contact: account.contact.clone(),
        route_set: account.route_set.clone(),
        require_100rel: account.require_100rel,
        target,
        extra_headers,
        offer,
    };

    let mut initiator = ctx.create_initiator(agent);
    let invite = ctx.create_invite(&mut initiator);
    let invite_snapshot = invite.clone();

    initiator.send_invite(invite).await?;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    state.cancel_tx = Some(cancel_tx);

    active::change_state(agent, call, &mut state, InviteState::Calling, None).await;

    drop(state);

    let authenticator = account.credentials.clone().map(DigestAuthenticator::new);

    tokio::spawn(uac_call_task(
        agent.clone(),
        call.clone(),
        ctx,
        initiator,
        invite_snapshot,
        cancel_rx,
        authenticator,
    ));

    Ok(())
}

enum Step {
    Cancelled,
    Initiator(Result<Response, sip_core::Error>),
    Early(Result<EarlyResponse, sip_core::Error>),
}

/// Drives the outgoing INVITE until it fails or produces a session, then
/// hands over to the session task
async fn uac_call_task(
    agent: CallAgent,
    call: Arc<Call>,
    mut ctx: OutgoingContext,
    mut initiator: InviteInitiator,
    mut last_invite: Request,
    mut cancel_rx: oneshot::Receiver<()>,
    mut authenticator: Option<DigestAuthenticator>,
) {
    let mut current_early: Option<Early> = None;
    let mut auth_retried = false;

    loop {
        let step = tokio::select! {
            _ = &mut cancel_rx => Step::Cancelled,
            received = initiator.receive() => Step::Initiator(received),
            received = async {
                match &mut current_early {
                    Some(early) => early.receive().await,
                    None => std::future::pending().await,
                }
            } => Step::Early(received),
        };

        match step {
            Step::Cancelled => {
                if let Err(e) = initiator.cancel().await {
                    log::warn!("call {}: CANCEL failed, {e:?}", call.index);
                }

                let mut state = call.state.lock().await;
                active::on_disconnected(
                    &agent,
                    &call,
                    &mut state,
                    Some(StatusCode::REQUEST_TERMINATED),
                    None,
                )
                .await;

                return;
            }
            Step::Initiator(Ok(Response::Provisional(response))) => {
                let code = response.line.code;

                let mut state = call.state.lock().await;

                if code == StatusCode::TRYING {
                    active::latch_status(&mut state, &code, response.line.reason.as_ref());
                } else {
                    active::change_state(
                        &agent,
                        &call,
                        &mut state,
                        InviteState::Early,
                        Some((code, response.line.reason.clone())),
                    )
                    .await;
                }
            }
            Step::Initiator(Ok(Response::Early(early, response))) => {
                current_early = Some(early);

                let mut state = call.state.lock().await;
                active::change_state(
                    &agent,
                    &call,
                    &mut state,
                    InviteState::Early,
                    Some((response.line.code, response.line.reason.clone())),
                )
                .await;
            }
            Step::Initiator(Ok(Response::EarlyEvent | Response::ForkTerminated)) => {}
            Step::Initiator(Ok(Response::Session(session, response))) => {
                establish(&agent, &call, &mut initiator, &ctx, session, response).await;

                // Keep the INVITE transaction alive to absorb response
                // retransmissions
                drain_initiator(initiator).await;

                return;
            }
            Step::Initiator(Ok(Response::Failure(response))) => {
                let code = response.line.code.into_u16();

                // Answer an authentication challenge once
                if matches!(code, 401 | 407) && !auth_retried {
                    if let Some(auth) = authenticator.as_mut() {
                        match retry_with_auth(&agent, &ctx, auth, &last_invite, &response).await {
                            Ok((new_initiator, new_invite)) => {
                                auth_retried = true;
                                initiator = new_initiator;
                                last_invite = new_invite;
                                current_early = None;
                                continue;
                            }
                            Err(e) => {
                                log::warn!("call {}: authentication failed, {e:?}", call.index)
                            }
                        }
                    }
                }

                if (300..400).contains(&code) {
                    if let Some(new_initiator) =
                        handle_redirect(&agent, &call, &mut ctx, &response).await
                    {
                        initiator = new_initiator;
                        last_invite = ctx.create_invite(&mut initiator);

                        // the snapshot is created by create_invite again
                        match initiator.send_invite(last_invite.clone()).await {
                            Ok(()) => {
                                current_early = None;
                                continue;
                            }
                            Err(e) => {
                                log::warn!("call {}: redirected INVITE failed, {e:?}", call.index)
                            }
                        }
                    }
                }

                let mut state = call.state.lock().await;
                active::on_disconnected(
                    &agent,
                    &call,
                    &mut state,
                    Some(response.line.code),
                    response.line.reason.as_deref(),
                )
                .await;

                return;
            }
            Step::Initiator(Ok(Response::Finished)) => {
                let mut state = call.state.lock().await;
                active::on_disconnected(&agent, &call, &mut state, None, None).await;

                return;
            }
            Step::Early(Ok(EarlyResponse::Provisional(response))) => {
                let mut state = call.state.lock().await;
                active::change_state(
                    &agent,
                    &call,
                    &mut state,
                    InviteState::Early,
                    Some((response.line.code, response.line.reason.clone())),
                )
                .await;
            }
            Step::Early(Ok(EarlyResponse::Success(session, response))) => {
                establish(&agent, &call, &mut initiator, &ctx, session, response).await;

                drain_initiator(initiator).await;

                return;
            }
            Step::Early(Ok(EarlyResponse::Terminated)) => {
                current_early = None;
            }
            Step::Initiator(Err(e)) | Step::Early(Err(e)) => {
                log::warn!("call {}: INVITE transaction failed, {e:?}", call.index);

                let mut state = call.state.lock().await;
                active::on_disconnected(&agent, &call, &mut state, None, None).await;

                return;
            }
        }
    }
}

/// ACK the 2xx, publish the session on the call and start the media
async fn establish(
    agent: &CallAgent,
    call: &Arc<Call>,
    initiator: &mut InviteInitiator,
    ctx: &OutgoingContext,
    session: InviteSession,
    response: TsxResponse,
) {
    let ack = match invite::create_ack(&session.dialog, response.base_headers.cseq.cseq).await {
        Ok(mut ack) => match session.endpoint.send_outgoing_request(&mut ack).await {
            Ok(()) => Some(ack),
            Err(e) => {
                log::warn!("call {}: sending ACK failed, {e:?}", call.index);
                None
            }
        },
        Err(e) => {
            log::warn!("call {}: creating ACK failed, {e:?}", call.index);
            None
        }
    };

    if let Some(ack) = ack {
        initiator.set_acknowledge(&session, ack);
    }

    let mut state = call.state.lock().await;

    state.cancel_tx = None;
    state.session = Some(session.handle());
    state.remote = Some(session.dialog.peer_fromto.uri.clone());

    active::change_state(
        agent,
        call,
        &mut state,
        InviteState::Connecting,
        Some((response.line.code, response.line.reason.clone())),
    )
    .await;

    match active::parse_sdp_body(&response.body) {
        Some(answer) => {
            active::apply_negotiated(agent, call, &mut state, ctx.offer.clone(), answer).await;
        }
        None => log::warn!("call {}: 2xx carried no usable SDP answer", call.index),
    }

    active::change_state(agent, call, &mut state, InviteState::Confirmed, None).await;

    drop(state);

    tokio::spawn(active::session_task(agent.clone(), call.clone(), session));
}

/// Build and send a new INVITE answering a 401/407 challenge
async fn retry_with_auth(
    agent: &CallAgent,
    ctx: &OutgoingContext,
    authenticator: &mut DigestAuthenticator,
    last_invite: &Request,
    challenge: &TsxResponse,
) -> Result<(InviteInitiator, Request), CallError> {
    authenticator
        .handle_rejection(
            RequestParts {
                line: &last_invite.line,
                headers: &last_invite.headers,
                body: &last_invite.body,
            },
            ResponseParts {
                line: &challenge.line,
                headers: &challenge.headers,
                body: &challenge.body,
            },
        )
        .map_err(|e| {
            log::debug!("digest challenge rejected: {e:?}");
            CallError::InvalidOp
        })?;

    let mut initiator = ctx.create_initiator(agent);
    let mut invite = ctx.create_invite(&mut initiator);

    authenticator.authorize_request(&mut invite.headers);

    initiator.send_invite(invite.clone()).await?;

    Ok((initiator, invite))
}

/// Let the application decide what to do with a 3xx; returns a fresh
/// initiator toward the accepted target
async fn handle_redirect(
    agent: &CallAgent,
    call: &Arc<Call>,
    ctx: &mut OutgoingContext,
    response: &TsxResponse,
) -> Option<InviteInitiator> {
    let target = response
        .headers
        .get_named::<Contact>()
        .ok()
        .map(|contact| contact.uri.uri)?;

    let mut action = agent
        .inner
        .handler
        .on_call_redirected(agent, call.index, &target)
        .await;

    if action == RedirectAction::Pending {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = call.state.lock().await;
            state.redirect_tx = Some(tx);
        }

        action = rx.await.unwrap_or(RedirectAction::Stop);
    }

    match action {
        RedirectAction::Accept => {
            log::info!("call {}: following redirect to {target:?}", call.index);

            ctx.target = target;

            Some(ctx.create_initiator(agent))
        }
        RedirectAction::Reject | RedirectAction::Stop | RedirectAction::Pending => None,
    }
}

/// Absorb late responses (2xx retransmissions get their ACK resent) until
/// the INVITE transaction dies
async fn drain_initiator(mut initiator: InviteInitiator) {
    loop {
        match initiator.receive().await {
            Ok(Response::Finished) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_destination() {
        let (uri, headers) = parse_target("sip:bob@example.org").unwrap();

        assert!(!uri.sips);
        assert!(headers.is_empty());
    }

    #[test]
    fn name_addr_with_embedded_headers() {
        let (uri, headers) =
            parse_target("<sip:bob@example.org?Require=replaces&Replaces=abc%3Bto-tag%3Dr%3Bfrom-tag%3Dl>")
                .unwrap();

        assert!(!uri.sips);
        assert_eq!(headers.len(), 2);

        assert_eq!(headers[0].0.as_print_str(), "Require");
        assert_eq!(headers[0].1, "replaces");

        assert_eq!(headers[1].0.as_print_str(), "Replaces");
        assert_eq!(headers[1].1, "abc;to-tag=r;from-tag=l");
    }

    #[test]
    fn invalid_destination_is_rejected() {
        assert!(parse_target("not a uri").is_err());
        assert!(parse_target("<sip:bob@example.org").is_err());
    }
}

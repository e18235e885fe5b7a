use super::{Call, CallAgent, CallId};
use crate::dialog::{Dialog, Usage, UsageGuard};
use crate::error::{CallError, Result};
use crate::invite::session::ReferReceived;
use bytesstr::BytesStr;
use sip_core::{Endpoint, IncomingRequest, MayTake};
use sip_types::header::typed::{ContentType, Event, SubStateValue, SubscriptionState};
use sip_types::msg::StatusLine;
use sip_types::parse::Parse;
use sip_types::print::AppendCtx;
use sip_types::{CodeKind, Method, Name, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc;

const REFER_SUB: Name = Name::custom("Refer-Sub", &["refer-sub"]);
const REFERRED_BY: Name = Name::custom("Referred-By", &["referred-by", "b"]);

/// Attended transfer REFER targets must stay below this many bytes
const MAX_TARGET_URI: usize = 2048;

/// Options of [`CallAgent::xfer_replaces`]
#[derive(Debug, Default, Clone, Copy)]
pub struct XferOptions {
    /// Do not put `Require=replaces` into the REFER target, for peers that
    /// reject unknown option tags
    pub no_require_replaces: bool,
}

fn raw_header(request: &IncomingRequest, name: &Name) -> Option<BytesStr> {
    request
        .headers
        .iter()
        .find(|(header, _)| *header == name)
        .map(|(_, value)| value.clone())
}

/// Build the REFER target of an attended transfer:
/// `<uri?[Require=replaces&]Replaces=<call-id>%3Bto-tag%3D<tag>%3Bfrom-tag%3D<tag>>`
pub(crate) fn build_replaces_target(
    target_uri: &str,
    call_id: &str,
    to_tag: &str,
    from_tag: &str,
    require_replaces: bool,
) -> Result<String> {
    if target_uri.len() + call_id.len() + to_tag.len() + from_tag.len() + 32 >= MAX_TARGET_URI {
        return Err(CallError::UriTooLong);
    }

    let require = if require_replaces {
        "Require=replaces&"
    } else {
        ""
    };

    Ok(format!(
        "<{target_uri}?{require}Replaces={call_id}%3Bto-tag%3D{to_tag}%3Bfrom-tag%3D{from_tag}>"
    ))
}

/// Progress reported by an incoming transfer NOTIFY
struct TransferEvent {
    code: u16,
    reason: String,
    terminated: bool,
}

/// Dialog usage following the implicit subscription created by an outgoing
/// REFER: answers the peer's NOTIFYs and forwards the sipfrag progress
struct TransferMonitor {
    events: mpsc::Sender<TransferEvent>,
}

impl TransferMonitor {
    fn new() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (events, rx) = mpsc::channel(8);

        (Self { events }, rx)
    }
}

#[async_trait::async_trait]
impl Usage for TransferMonitor {
    fn name(&self) -> &'static str {
        "xfer-monitor"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.line.method != Method::NOTIFY {
            return;
        }

        let refer_event = request
            .headers
            .get_named::<Event>()
            .map(|event| event.0 == "refer")
            .unwrap_or(false);

        if !refer_event {
            return;
        }

        let mut notify = request.take();

        let terminated = notify
            .headers
            .get_named::<SubscriptionState>()
            .map(|sub_state| sub_state.state == SubStateValue::Terminated)
            .unwrap_or(false);

        let tsx = endpoint.create_server_tsx(&mut notify);
        let response = endpoint.create_response(&notify, StatusCode::OK, None);

        if let Err(e) = tsx.respond(response).await {
            log::warn!("failed to respond to transfer NOTIFY, {e:?}");
        }

        match parse_sipfrag(&notify) {
            Some(status_line) => {
                let reason = status_line
                    .reason
                    .as_ref()
                    .map(|reason| reason.to_string())
                    .unwrap_or_default();

                let _ = self
                    .events
                    .send(TransferEvent {
                        code: status_line.code.into_u16(),
                        reason,
                        terminated,
                    })
                    .await;
            }
            None => log::warn!("transfer NOTIFY without usable message/sipfrag body"),
        }
    }
}

/// First status line of a `message/sipfrag` NOTIFY body
fn parse_sipfrag(notify: &IncomingRequest) -> Option<StatusLine> {
    let content_type = notify.headers.get_named::<ContentType>().ok()?;

    if !content_type.0.contains("message/sipfrag") {
        return None;
    }

    let body = std::str::from_utf8(&notify.body).ok()?;
    let line = body.lines().next().unwrap_or(body);

    StatusLine::parse_str(line).ok()
}

/// Blind transfer: REFER the peer to `dest` and follow the progress
/// through the implicit subscription
pub(crate) async fn xfer(agent: &CallAgent, call_id: CallId, dest: BytesStr) -> Result<()> {
    let (_, state) = agent.acquire_call(call_id).await?;

    let session = state.session.clone().ok_or(CallError::SessionState)?;

    drop(state);

    let (monitor, events) = TransferMonitor::new();
    let monitor_guard = session.dialog.register_usage(monitor);

    let mut request = session.dialog.create_request(Method::REFER);

    request.headers.insert(Name::REFER_TO, dest);
    request.headers.insert(
        REFERRED_BY,
        session.dialog.local_identity().default_print_ctx().to_string(),
    );

    let response = session.send_request(request).await?;

    if response.line.code.kind() != CodeKind::Success {
        log::info!(
            "call {call_id}: transfer refused with {:?}",
            response.line.code
        );

        return Err(CallError::PeerStatus(response.line.code));
    }

    // The peer may suppress the implicit subscription (RFC 4488)
    let suppressed = response
        .headers
        .iter()
        .find(|(name, _)| **name == REFER_SUB)
        .is_some_and(|(_, value)| *value == "false");

    if suppressed {
        log::info!("call {call_id}: transfer subscription suppressed");

        let agent = agent.clone();

        tokio::spawn(async move {
            agent
                .inner
                .handler
                .on_call_transfer_status(&agent, call_id, 200, "Accepted", true)
                .await;
        });

        drop(monitor_guard);

        return Ok(());
    }

    let agent = agent.clone();

    tokio::spawn(async move {
        agent
            .inner
            .handler
            .on_call_transfer_status(&agent, call_id, 100, "Accepted", false)
            .await;

        monitor_transfer(agent, call_id, events, monitor_guard).await;
    });

    Ok(())
}

async fn monitor_transfer(
    agent: CallAgent,
    call_id: CallId,
    mut events: mpsc::Receiver<TransferEvent>,
    monitor_guard: UsageGuard,
) {
    while let Some(event) = events.recv().await {
        let is_last = event.terminated;

        let cont = agent
            .inner
            .handler
            .on_call_transfer_status(&agent, call_id, event.code, &event.reason, is_last)
            .await;

        if is_last || !cont {
            break;
        }
    }

    drop(monitor_guard);
}

/// Attended transfer: REFER the peer of `call_id` to the remote party of
/// `dest_call_id`, replacing that dialog
pub(crate) async fn xfer_replaces(
    agent: &CallAgent,
    call_id: CallId,
    dest_call_id: CallId,
    options: XferOptions,
) -> Result<()> {
    let target = {
        let (_, dest_state) = agent.acquire_call(dest_call_id).await?;

        let session = dest_state.session.clone().ok_or(CallError::SessionState)?;
        let dialog = &session.dialog;

        let target_uri = dialog.peer_fromto.uri.uri.default_print_ctx().to_string();

        let to_tag = dialog
            .peer_fromto
            .tag
            .as_ref()
            .ok_or(CallError::SessionState)?;

        let from_tag = dialog
            .local_fromto
            .tag
            .as_ref()
            .expect("local From/To of a dialog always has a tag");

        build_replaces_target(
            &target_uri,
            &dialog.call_id.0,
            to_tag,
            from_tag,
            !options.no_require_replaces,
        )?
    };

    xfer(agent, call_id, target.into()).await
}

/// Server side of the transfer subscription: sends progress NOTIFYs to the
/// transferor while the replacement call proceeds
pub(crate) struct TransferNotifier {
    dialog: Arc<Dialog>,
}

impl TransferNotifier {
    fn new(dialog: Arc<Dialog>) -> Self {
        Self { dialog }
    }

    /// NOTIFY the transferor about the replacement call's progress.
    /// `terminated` ends the subscription.
    pub(crate) async fn notify_progress(&self, code: u16, reason: &str, terminated: bool) {
        let mut request = self.dialog.create_request(Method::NOTIFY);

        request
            .headers
            .insert_named(&Event::new(BytesStr::from_static("refer")));

        let sub_state = if terminated {
            SubscriptionState::new(SubStateValue::Terminated)
        } else {
            SubscriptionState::new(SubStateValue::Active).with_expires(600)
        };

        request.headers.insert_named(&sub_state);

        request
            .headers
            .insert_named(&ContentType(BytesStr::from_static("message/sipfrag")));

        let reason = if reason.is_empty() {
            StatusCode::from(code)
                .text()
                .unwrap_or("Progress")
                .to_owned()
        } else {
            reason.to_owned()
        };

        request.body = format!("SIP/2.0 {code} {reason}\r\n").into_bytes().into();

        let mut target_tp_info = self.dialog.target_tp_info.lock().await;

        match self
            .dialog
            .endpoint
            .send_request(request, &mut target_tp_info)
            .await
        {
            Ok(mut transaction) => {
                drop(target_tp_info);

                if let Err(e) = transaction.receive_final().await {
                    log::warn!("transfer NOTIFY got no final response, {e:?}");
                }
            }
            Err(e) => log::warn!("failed to send transfer NOTIFY, {e:?}"),
        }
    }
}

/// Handle a REFER received inside an established call (the peer transfers
/// us to a new target)
pub(crate) async fn on_incoming_refer(
    agent: &CallAgent,
    call: &Arc<Call>,
    session: &crate::invite::session::SessionHandle,
    event: ReferReceived,
) {
    let Some(refer_to) = raw_header(&event.refer, &Name::REFER_TO) else {
        log::info!("received REFER without Refer-To header");

        respond_refer(session, event, StatusCode::BAD_REQUEST, None).await;
        return;
    };

    let refer_sub = raw_header(&event.refer, &REFER_SUB);
    let no_subscription = refer_sub.as_ref().is_some_and(|value| *value == "false");

    // Copied onto the INVITE sent to the transfer target
    let referred_by = raw_header(&event.refer, &REFERRED_BY);

    let mut code = agent
        .inner
        .handler
        .on_call_transfer_request(agent, call.index, &refer_to)
        .await;

    if code < 200 {
        code = 202;
    }

    if code >= 300 {
        respond_refer(session, event, StatusCode::from(code), None).await;
        return;
    }

    log::info!("call {} is being transferred to {refer_to}", call.index);

    let notifier = if no_subscription {
        respond_refer(
            session,
            event,
            StatusCode::from(code),
            Some((REFER_SUB, BytesStr::from_static("false"))),
        )
        .await;

        None
    } else {
        let echo = refer_sub
            .is_some()
            .then(|| (REFER_SUB, BytesStr::from_static("true")));

        respond_refer(session, event, StatusCode::from(code), echo).await;

        let notifier = Arc::new(TransferNotifier::new(session.dialog.clone()));

        notifier.notify_progress(100, "Trying", false).await;

        Some(notifier)
    };

    // Issue the replacement call with the same account and user data
    let (acc_id, user_data) = {
        let state = call.state.lock().await;
        (state.acc_id, state.user_data.clone())
    };

    let extra_headers = referred_by
        .map(|value| vec![(REFERRED_BY, value)])
        .unwrap_or_default();

    match super::outbound::make_call(agent, acc_id, &refer_to, user_data, extra_headers).await {
        Ok(new_call_id) => {
            if let Some(notifier) = notifier {
                match agent.acquire_call(new_call_id).await {
                    Ok((_, mut new_state)) => new_state.xfer_sub = Some(notifier),
                    Err(e) => {
                        log::warn!("replacement call {new_call_id} vanished, {e}");
                        notifier.notify_progress(500, "", true).await;
                    }
                }
            }
        }
        Err(e) => {
            log::warn!("call {}: transfer target call failed, {e}", call.index);

            if let Some(notifier) = notifier {
                notifier.notify_progress(500, "", true).await;
            }
        }
    }
}

async fn respond_refer(
    session: &crate::invite::session::SessionHandle,
    event: ReferReceived,
    status: StatusCode,
    extra: Option<(Name, BytesStr)>,
) {
    let response = session.dialog.create_response(&event.refer, status, None);

    let mut response = match response {
        Ok(response) => response,
        Err(e) => {
            log::warn!("failed to create response to REFER, {e:?}");
            return;
        }
    };

    if let Some((name, value)) = extra {
        response.msg.headers.insert(name, value);
    }

    if let Err(e) = event.transaction.respond(response).await {
        log::warn!("failed to respond to REFER, {e:?}");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replaces_target_format() {
        let target = build_replaces_target("sip:b@x", "abc", "r", "l", true).unwrap();

        assert_eq!(
            target,
            "<sip:b@x?Require=replaces&Replaces=abc%3Bto-tag%3Dr%3Bfrom-tag%3Dl>"
        );
    }

    #[test]
    fn replaces_target_without_require() {
        let target = build_replaces_target("sip:b@x", "abc", "r", "l", false).unwrap();

        assert_eq!(target, "<sip:b@x?Replaces=abc%3Bto-tag%3Dr%3Bfrom-tag%3Dl>");
    }

    #[test]
    fn oversized_target_is_rejected() {
        let long_tag = "t".repeat(2048);

        assert!(matches!(
            build_replaces_target("sip:b@x", "abc", &long_tag, "l", true),
            Err(CallError::UriTooLong)
        ));
    }

    #[test]
    fn budget_keeps_32_bytes_of_overhead() {
        // field lengths sum to 2016, plus the reserved 32 this hits the cap
        let tag = "t".repeat(2016 - "sip:b@x".len() - "abc".len() - 1);

        assert!(matches!(
            build_replaces_target("sip:b@x", "abc", &tag, "l", true),
            Err(CallError::UriTooLong)
        ));

        // one byte less fits
        let tag = "t".repeat(2016 - "sip:b@x".len() - "abc".len() - 2);

        assert!(build_replaces_target("sip:b@x", "abc", &tag, "l", true).is_ok());
    }
}

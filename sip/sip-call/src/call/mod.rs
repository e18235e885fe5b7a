use crate::account::{Account, AccountId};
use crate::dialog::DialogLayer;
use crate::error::{CallError, Result};
use crate::invite::acceptor::InviteAcceptor;
use crate::invite::session::{Role, SessionHandle};
use crate::invite::InviteLayer;
use crate::media::{MediaFactory, MediaSession, RtpContinuity, SecureLevel};
use crate::util::random_ssrc;
use bytesstr::BytesStr;
use parking_lot as pl;
use sdp_types::{Direction, SessionDescription};
use sip_core::{Endpoint, EndpointBuilder, IncomingRequest, Layer, MayTake};
use sip_types::header::typed::ContentType;
use sip_types::uri::NameAddr;
use sip_types::{Method, Name, StatusCode};
use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use transfer::TransferNotifier;

mod active;
mod events;
mod inbound;
mod info;
mod outbound;
mod table;
mod transfer;

pub use events::{CallHandler, DefaultCallHandler, RedirectAction};
pub use info::CallInfo;
pub use transfer::XferOptions;

use table::CallTable;

pub type CallId = usize;

/// Lifecycle of the INVITE session behind a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
    /// Slot allocated, nothing sent or received yet
    Null,
    /// Initial INVITE sent
    Calling,
    /// Initial INVITE received
    Incoming,
    /// Provisional response sent or received
    Early,
    /// Final success response sent or received, ACK outstanding
    Connecting,
    /// Session is up
    Confirmed,
    /// Session ended
    Disconnected,
}

impl InviteState {
    pub fn is_active(self) -> bool {
        !matches!(self, InviteState::Null | InviteState::Disconnected)
    }
}

/// Configuration of the [`CallAgent`]
pub struct CallAgentConfig {
    /// Number of call slots
    pub max_calls: usize,

    /// Derive the remote NAT classification from the `X-nat` SDP attribute
    pub nat_type_in_sdp: bool,
}

impl Default for CallAgentConfig {
    fn default() -> Self {
        Self {
            max_calls: 32,
            nat_type_in_sdp: false,
        }
    }
}

/// One call slot
pub(crate) struct Call {
    pub(crate) index: CallId,
    pub(crate) state: Arc<Mutex<CallState>>,
}

impl Call {
    pub(crate) fn new(index: CallId, role: Role, secure_level: SecureLevel) -> Self {
        Self {
            index,
            state: Arc::new(Mutex::new(CallState::new(role, secure_level))),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(index: CallId) -> Self {
        Self::new(index, Role::Uac, SecureLevel::None)
    }
}

/// Mutable per-call state, guarded by the call lock
pub(crate) struct CallState {
    pub(crate) acc_id: AccountId,
    pub(crate) role: Role,
    pub(crate) invite_state: InviteState,

    /// Pending incoming INVITE waiting for the application's answer
    pub(crate) acceptor: Option<InviteAcceptor>,

    /// Established INVITE session
    pub(crate) session: Option<SessionHandle>,

    /// Cancels the pending outgoing INVITE
    pub(crate) cancel_tx: Option<oneshot::Sender<()>>,

    /// Resolves a redirect the application answered with `Pending`
    pub(crate) redirect_tx: Option<oneshot::Sender<RedirectAction>>,

    pub(crate) media: Option<Box<dyn MediaSession>>,
    pub(crate) media_active: bool,
    pub(crate) media_dir: Direction,

    /// SDP offer of a not yet answered incoming INVITE
    pub(crate) remote_offer: Option<SessionDescription>,

    /// Prepared answer for the incoming INVITE
    pub(crate) sdp_answer: Option<SessionDescription>,

    pub(crate) active_local_sdp: Option<SessionDescription>,
    pub(crate) active_remote_sdp: Option<SessionDescription>,

    pub(crate) secure_level: SecureLevel,

    /// Audio mixer slot occupied by this call, if any
    pub(crate) conf_slot: Option<usize>,

    /// RTP continuity across re-INVITEs
    pub(crate) rtp: RtpContinuity,

    /// Server-side transfer subscription whose progress follows this call
    pub(crate) xfer_sub: Option<Arc<TransferNotifier>>,

    pub(crate) last_code: Option<StatusCode>,
    pub(crate) last_text: BytesStr,

    pub(crate) start_time: Option<Instant>,
    pub(crate) res_time: Option<Instant>,
    pub(crate) conn_time: Option<Instant>,
    pub(crate) dis_time: Option<Instant>,

    pub(crate) rem_nat_type: Option<u8>,
    pub(crate) rem_srtp_use: crate::media::SrtpUse,

    /// We offered call hold
    pub(crate) local_hold: bool,

    pub(crate) user_data: Option<Arc<dyn Any + Send + Sync>>,

    /// Remote identity, for info/dump purposes
    pub(crate) remote: Option<NameAddr>,
}

impl CallState {
    fn new(role: Role, secure_level: SecureLevel) -> Self {
        Self {
            acc_id: 0,
            role,
            invite_state: InviteState::Null,
            acceptor: None,
            session: None,
            cancel_tx: None,
            redirect_tx: None,
            media: None,
            media_active: false,
            media_dir: Direction::Inactive,
            remote_offer: None,
            sdp_answer: None,
            active_local_sdp: None,
            active_remote_sdp: None,
            secure_level,
            conf_slot: None,
            rtp: RtpContinuity::new(random_ssrc()),
            xfer_sub: None,
            last_code: None,
            last_text: BytesStr::from_static(""),
            start_time: Some(Instant::now()),
            res_time: None,
            conn_time: None,
            dis_time: None,
            rem_nat_type: None,
            rem_srtp_use: Default::default(),
            local_hold: false,
            user_data: None,
            remote: None,
        }
    }
}

pub(crate) struct AgentInner {
    pub(crate) endpoint: Endpoint,
    pub(crate) config: CallAgentConfig,
    pub(crate) accounts: Vec<Account>,
    pub(crate) media: Arc<dyn MediaFactory>,
    pub(crate) handler: Arc<dyn CallHandler>,

    /// The agent-global lock: protects the call table. Always acquired
    /// before (never while holding) a call lock.
    pub(crate) table: pl::Mutex<CallTable>,
}

/// The call-control engine.
///
/// Owns the call slot table and drives every call through its INVITE
/// session: outgoing and incoming calls, hold and re-INVITE/UPDATE, blind
/// and attended transfer, forked and redirected dialogs. Application
/// feedback flows through the [`CallHandler`] passed at construction.
#[derive(Clone)]
pub struct CallAgent {
    pub(crate) inner: Arc<AgentInner>,
}

/// Endpoint layer catching out-of-dialog INVITE requests for the agent
#[derive(Default)]
pub(crate) struct CallLayer {
    agent: pl::Mutex<Option<Weak<AgentInner>>>,
}

#[async_trait::async_trait]
impl Layer for CallLayer {
    fn name(&self) -> &'static str {
        "call"
    }

    async fn receive(&self, _endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        if request.line.method != Method::INVITE {
            return;
        }

        // In-dialog INVITEs were already consumed by the dialog layer; one
        // carrying a to-tag that reaches us points at a dialog we no
        // longer know
        if request.base_headers.to.tag.is_some() {
            return;
        }

        let agent = self.agent.lock().as_ref().and_then(Weak::upgrade);

        let Some(agent) = agent else {
            return;
        };

        let agent = CallAgent { inner: agent };

        inbound::on_incoming_invite(agent, request.take()).await;
    }
}

impl CallAgent {
    /// Register the layers the call engine needs with an endpoint under
    /// construction. Must be called before [`CallAgent::new`].
    pub fn init(builder: &mut EndpointBuilder) {
        builder.add_layer(DialogLayer::default());
        builder.add_layer(InviteLayer::default());
        builder.add_layer(CallLayer::default());
    }

    /// Create the agent on a built endpoint
    pub fn new(
        endpoint: Endpoint,
        config: CallAgentConfig,
        accounts: Vec<Account>,
        media: Arc<dyn MediaFactory>,
        handler: Arc<dyn CallHandler>,
    ) -> Self {
        assert!(!accounts.is_empty(), "at least one account is required");

        let max_calls = config.max_calls;

        let agent = Self {
            inner: Arc::new(AgentInner {
                endpoint: endpoint.clone(),
                config,
                accounts,
                media,
                handler,
                table: pl::Mutex::new(CallTable::new(max_calls)),
            }),
        };

        *endpoint.layer::<CallLayer>().agent.lock() = Some(Arc::downgrade(&agent.inner));

        agent
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    // ==== call table accessors

    pub fn max_call_count(&self) -> usize {
        self.inner.table.lock().max_calls()
    }

    pub fn call_count(&self) -> usize {
        self.inner.table.lock().call_cnt()
    }

    pub fn enum_calls(&self) -> Vec<CallId> {
        self.inner.table.lock().active_ids()
    }

    pub async fn is_active(&self, call_id: CallId) -> bool {
        match self.acquire_call(call_id).await {
            Ok((_, state)) => state.invite_state.is_active(),
            Err(_) => false,
        }
    }

    pub async fn has_media(&self, call_id: CallId) -> bool {
        match self.acquire_call(call_id).await {
            Ok((_, state)) => state.media_active,
            Err(_) => false,
        }
    }

    pub async fn set_user_data(
        &self,
        call_id: CallId,
        user_data: Arc<dyn Any + Send + Sync>,
    ) -> Result<()> {
        let (_, mut state) = self.acquire_call(call_id).await?;
        state.user_data = Some(user_data);
        Ok(())
    }

    pub async fn user_data(&self, call_id: CallId) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        let (_, state) = self.acquire_call(call_id).await?;
        Ok(state.user_data.clone())
    }

    pub async fn rem_nat_type(&self, call_id: CallId) -> Result<Option<u8>> {
        let (_, state) = self.acquire_call(call_id).await?;
        Ok(state.rem_nat_type)
    }

    // ==== call control

    /// Start an outgoing call from the given account to `dest`
    pub async fn make_call(
        &self,
        acc_id: AccountId,
        dest: &str,
        user_data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<CallId> {
        outbound::make_call(self, acc_id, dest, user_data, Vec::new()).await
    }

    /// Answer an incoming call with a provisional or final response
    pub async fn answer(&self, call_id: CallId, code: u16, reason: Option<&str>) -> Result<()> {
        inbound::answer(self, call_id, code, reason.map(BytesStr::from)).await
    }

    /// End the call with a method appropriate for its current state.
    ///
    /// `code` 0 picks the default: 200 for confirmed calls, 603 when we
    /// are the not-yet-answered UAS, 487 otherwise.
    pub async fn hangup(&self, call_id: CallId, code: u16, reason: Option<&str>) -> Result<()> {
        let (call, mut state) = self.acquire_call(call_id).await?;

        let code = if code == 0 {
            default_hangup_code(state.invite_state, state.role)
        } else {
            code
        };

        let status = StatusCode::from(code);

        if let Some(cancel_tx) = state.cancel_tx.take() {
            // Outgoing INVITE still in progress: the driving task cancels
            // the transaction and does the disconnect bookkeeping
            let _ = cancel_tx.send(());

            return Ok(());
        }

        if let Some(acceptor) = state.acceptor.take() {
            // Hanging up an unanswered incoming call must send a failure
            // response
            let status = if status.into_u16() < 300 {
                StatusCode::DECLINE
            } else {
                status
            };

            let response = acceptor
                .create_response(status, reason.map(BytesStr::from))
                .await?;

            acceptor.respond_failure(response).await?;

            active::on_disconnected(self, &call, &mut state, Some(status), reason).await;

            return Ok(());
        }

        if let Some(session) = state.session.clone() {
            match session.terminate().await {
                Ok(_) | Err(sip_core::Error::RequestTimedOut) => {}
                Err(e) => log::warn!("BYE for call {call_id} failed, {e:?}"),
            }

            active::on_disconnected(self, &call, &mut state, Some(status), reason).await;

            return Ok(());
        }

        // Nothing has been sent on this call yet; ending it is a pure
        // bookkeeping operation
        active::on_disconnected(self, &call, &mut state, Some(status), reason).await;

        Ok(())
    }

    /// Hang up every active call
    pub async fn hangup_all(&self) {
        let ids = self.enum_calls();

        for call_id in ids {
            if let Err(e) = self.hangup(call_id, 0, None).await {
                log::debug!("hangup_all: call {call_id}: {e}");
            }
        }
    }

    /// Put the call on hold by sending a re-INVITE with a hold offer
    pub async fn set_hold(&self, call_id: CallId) -> Result<()> {
        let (call, mut state) = self.acquire_call(call_id).await?;

        if state.invite_state != InviteState::Confirmed {
            log::info!("cannot hold call {call_id} that is not confirmed");
            return Err(CallError::SessionState);
        }

        active::send_reinvite(self, &call, &mut state, active::OfferKind::Hold).await?;

        state.local_hold = true;

        Ok(())
    }

    /// Send a re-INVITE. With `unhold` the call is taken out of hold,
    /// otherwise the current (possibly held) offer is repeated.
    pub async fn reinvite(&self, call_id: CallId, unhold: bool) -> Result<()> {
        let (call, mut state) = self.acquire_call(call_id).await?;

        if state.invite_state != InviteState::Confirmed {
            log::info!("cannot re-INVITE call {call_id} that is not confirmed");
            return Err(CallError::SessionState);
        }

        let kind = if state.local_hold && !unhold {
            active::OfferKind::Hold
        } else {
            state.local_hold = false;
            active::OfferKind::Fresh
        };

        active::send_reinvite(self, &call, &mut state, kind).await
    }

    /// Renegotiate the session with an UPDATE request
    pub async fn update(&self, call_id: CallId) -> Result<()> {
        let (call, mut state) = self.acquire_call(call_id).await?;

        active::send_update(self, &call, &mut state).await?;

        state.local_hold = false;

        Ok(())
    }

    /// Blind transfer: ask the peer to call `dest` instead
    pub async fn xfer(&self, call_id: CallId, dest: &str) -> Result<()> {
        transfer::xfer(self, call_id, BytesStr::from(dest)).await
    }

    /// Attended transfer: ask the peer of `call_id` to replace the session
    /// of `dest_call_id` with a new call
    pub async fn xfer_replaces(
        &self,
        call_id: CallId,
        dest_call_id: CallId,
        options: XferOptions,
    ) -> Result<()> {
        transfer::xfer_replaces(self, call_id, dest_call_id, options).await
    }

    /// Resolve a redirect previously answered with
    /// [`RedirectAction::Pending`]
    pub async fn process_redirect(&self, call_id: CallId, action: RedirectAction) -> Result<()> {
        let (_, mut state) = self.acquire_call(call_id).await?;

        let Some(redirect_tx) = state.redirect_tx.take() else {
            return Err(CallError::InvalidOp);
        };

        redirect_tx
            .send(action)
            .map_err(|_| CallError::SessionTerminated)
    }

    /// Send DTMF digits through the call's media session
    pub async fn dial_dtmf(&self, call_id: CallId, digits: &str) -> Result<()> {
        let (_, mut state) = self.acquire_call(call_id).await?;

        if !state.media_active {
            log::info!("media of call {call_id} is not established yet");
            return Err(CallError::InvalidOp);
        }

        let Some(media) = state.media.as_mut() else {
            return Err(CallError::InvalidOp);
        };

        media.dial_dtmf(digits).await?;

        Ok(())
    }

    /// Send an instant message inside the call's dialog
    pub async fn send_im(
        &self,
        call_id: CallId,
        content_type: Option<&str>,
        content: &str,
    ) -> Result<()> {
        let (_, state) = self.acquire_call(call_id).await?;

        let Some(session) = state.session.clone() else {
            return Err(CallError::SessionState);
        };

        drop(state);

        let content_type = BytesStr::from(content_type.unwrap_or("text/plain"));

        let mut request = session.dialog.create_request(Method::MESSAGE);
        request
            .headers
            .insert(Name::ACCEPT, "text/plain, application/im-iscomposing+xml");
        request
            .headers
            .insert_named(&ContentType(content_type));
        request.body = content.as_bytes().to_vec().into();

        let agent = self.clone();

        tokio::spawn(async move {
            match session.send_request(request).await {
                Ok(response) => {
                    let reason = response
                        .line
                        .reason
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_default();

                    agent
                        .inner
                        .handler
                        .on_im_status(&agent, call_id, response.line.code.into_u16(), &reason)
                        .await;
                }
                Err(e) => log::warn!("MESSAGE request on call {call_id} failed, {e:?}"),
            }
        });

        Ok(())
    }

    /// Send a typing indication inside the call's dialog
    pub async fn send_typing_ind(&self, call_id: CallId, is_typing: bool) -> Result<()> {
        let (_, state) = self.acquire_call(call_id).await?;

        let Some(session) = state.session.clone() else {
            return Err(CallError::SessionState);
        };

        drop(state);

        let mut request = session.dialog.create_request(Method::MESSAGE);
        request.headers.insert_named(&ContentType(BytesStr::from_static(
            "application/im-iscomposing+xml",
        )));
        request.body = typing_indication_body(is_typing).into_bytes().into();

        tokio::spawn(async move {
            if let Err(e) = session.send_request(request).await {
                log::warn!("typing indication on call {call_id} failed, {e:?}");
            }
        });

        Ok(())
    }

    /// Send an arbitrary request inside the call's dialog
    pub async fn send_request(&self, call_id: CallId, method: &str) -> Result<()> {
        let (_, state) = self.acquire_call(call_id).await?;

        let Some(session) = state.session.clone() else {
            return Err(CallError::SessionState);
        };

        drop(state);

        let request = session.dialog.create_request(Method::from(method));

        tokio::spawn(async move {
            if let Err(e) = session.send_request(request).await {
                log::warn!("in-dialog request on call {call_id} failed, {e:?}");
            }
        });

        Ok(())
    }

    /// Snapshot of the call's current state
    pub async fn get_info(&self, call_id: CallId) -> Result<CallInfo> {
        info::get_info(self, call_id).await
    }

    /// Render a human readable description of the call
    pub async fn dump(&self, call_id: CallId, with_media: bool, indent: &str) -> Result<String> {
        info::dump(self, call_id, with_media, indent).await
    }

    // ==== locking

    /// Acquire the agent lock and the call lock of `call_id`.
    ///
    /// Retries up to 50 times with progressive back-off; both locks are
    /// only try-acquired so a lock hierarchy violation elsewhere shows up
    /// as [`CallError::TimedOut`] instead of a deadlock.
    pub(crate) async fn acquire_call(
        &self,
        call_id: CallId,
    ) -> Result<(Arc<Call>, OwnedMutexGuard<CallState>)> {
        const MAX_RETRY: u32 = 50;

        if !self.inner.table.lock().is_valid_id(call_id) {
            return Err(CallError::InvalidArgument("call id out of range"));
        }

        for retry in 0..MAX_RETRY {
            let call = {
                let Some(table) = self.inner.table.try_lock() else {
                    sleep(Duration::from_millis((retry / 10) as u64)).await;
                    continue;
                };

                match table.get(call_id) {
                    Some(call) => call.clone(),
                    None => {
                        log::info!("call {call_id} is gone");
                        return Err(CallError::SessionTerminated);
                    }
                }
            };

            match call.state.clone().try_lock_owned() {
                Ok(state) => return Ok((call, state)),
                Err(_) => {
                    sleep(Duration::from_millis((retry / 10) as u64)).await;
                    continue;
                }
            }
        }

        log::error!("timed out acquiring lock of call {call_id} (possible deadlock)");

        Err(CallError::TimedOut)
    }
}

pub(crate) fn default_hangup_code(state: InviteState, role: Role) -> u16 {
    if state == InviteState::Confirmed {
        200
    } else if role == Role::Uas {
        603
    } else {
        487
    }
}

fn typing_indication_body(is_typing: bool) -> String {
    let state = if is_typing { "active" } else { "idle" };

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <isComposing xmlns=\"urn:ietf:params:xml:ns:im-iscomposing\">\n\
         <state>{state}</state>\n\
         <contenttype>text/plain</contenttype>\n\
         </isComposing>\n"
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hangup_defaults_by_state_and_role() {
        assert_eq!(default_hangup_code(InviteState::Confirmed, Role::Uac), 200);
        assert_eq!(default_hangup_code(InviteState::Confirmed, Role::Uas), 200);

        // unanswered as UAS: decline
        assert_eq!(default_hangup_code(InviteState::Incoming, Role::Uas), 603);
        assert_eq!(default_hangup_code(InviteState::Early, Role::Uas), 603);

        // never answered as UAC: request terminated
        assert_eq!(default_hangup_code(InviteState::Calling, Role::Uac), 487);
        assert_eq!(default_hangup_code(InviteState::Early, Role::Uac), 487);
    }
}

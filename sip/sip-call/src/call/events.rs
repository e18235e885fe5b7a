use super::{CallAgent, CallId, InviteState};
use sip_types::uri::SipUri;

/// What to do with a call that received a redirection (3xx) response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectAction {
    /// Follow the first Contact of the redirect response
    Accept,

    /// Ignore the redirect, the call fails with the 3xx status
    Reject,

    /// Disconnect the call
    Stop,

    /// The application decides later through
    /// [`CallAgent::process_redirect`]
    Pending,
}

/// Application callbacks of the call engine.
///
/// Every method has a default so applications implement only what they
/// care about. The callbacks are invoked without any call lock held, so it
/// is safe to call back into the [`CallAgent`] from them.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// A new incoming call was allocated. Return `true` when the
    /// application takes responsibility for answering it (now or later);
    /// `false` makes the engine decline it with 480.
    async fn on_incoming_call(&self, agent: &CallAgent, call_id: CallId) -> bool {
        let _ = (agent, call_id);
        false
    }

    /// The INVITE session state of a call changed
    async fn on_call_state(&self, agent: &CallAgent, call_id: CallId, state: InviteState) {
        let _ = (agent, call_id, state);
    }

    /// SDP negotiation completed and the media streams were (re)started
    async fn on_call_media_state(&self, agent: &CallAgent, call_id: CallId) {
        let _ = (agent, call_id);
    }

    /// The peer asks to transfer this call (incoming REFER). The returned
    /// status code accepts (2xx) or rejects (>= 300) the transfer; codes
    /// below 200 are coerced to 202.
    async fn on_call_transfer_request(&self, agent: &CallAgent, call_id: CallId, refer_to: &str) -> u16 {
        let _ = (agent, call_id, refer_to);
        202
    }

    /// Progress of a transfer initiated by us. `is_last` is set on the
    /// final notification; returning `false` stops further notifications.
    async fn on_call_transfer_status(
        &self,
        agent: &CallAgent,
        call_id: CallId,
        status_code: u16,
        reason: &str,
        is_last: bool,
    ) -> bool {
        let _ = (agent, call_id, status_code, reason);
        !is_last
    }

    /// An incoming INVITE asks to replace an existing call. The returned
    /// status code accepts (2xx) or rejects (>= 300) the replacement.
    async fn on_call_replace_request(&self, agent: &CallAgent, replaced_call: CallId) -> u16 {
        let _ = (agent, replaced_call);
        200
    }

    /// `new_call` has taken over the session of `replaced_call`
    async fn on_call_replaced(&self, agent: &CallAgent, replaced_call: CallId, new_call: CallId) {
        let _ = (agent, replaced_call, new_call);
    }

    /// The call was redirected. Without an override the call is
    /// disconnected.
    async fn on_call_redirected(
        &self,
        agent: &CallAgent,
        call_id: CallId,
        target: &SipUri,
    ) -> RedirectAction {
        let _ = (agent, call_id, target);

        log::info!("unhandled redirection for call {call_id}, disconnecting");

        RedirectAction::Stop
    }

    /// Instant message received inside the call's dialog
    async fn on_im_received(&self, agent: &CallAgent, call_id: CallId, content_type: &str, body: &str) {
        let _ = (agent, call_id, content_type, body);
    }

    /// Delivery status of an instant message sent with
    /// [`CallAgent::send_im`]
    async fn on_im_status(&self, agent: &CallAgent, call_id: CallId, status_code: u16, reason: &str) {
        let _ = (agent, call_id, status_code, reason);
    }
}

/// Handler that leaves every event at its default behavior
pub struct DefaultCallHandler;

#[async_trait::async_trait]
impl CallHandler for DefaultCallHandler {}

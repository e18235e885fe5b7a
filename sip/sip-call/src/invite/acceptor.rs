use super::session::{InviteSession, Role};
use super::{AwaitedAck, Inner, InviteLayer, InviteSessionState, InviteUsage};
use crate::dialog::{Dialog, UsageGuard, register_usage};
use crate::rel100;
use bytesstr::BytesStr;
use parking_lot as pl;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest};
use sip_types::header::typed::{Require, Supported};
use sip_types::{Method, StatusCode};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] sip_core::Error),

    #[error("peer cancelled its request")]
    RequestTerminated,

    #[error("response does not belong to the pending INVITE transaction")]
    CSeqMismatch,
}

/// Key under which an unanswered INVITE is registered with the
/// [`InviteLayer`] so an incoming CANCEL finds it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CancellableKey {
    pub(crate) cseq: u32,
    pub(crate) branch: BytesStr,
}

/// Answers an incoming INVITE.
///
/// Provisional responses may be sent reliably (RFC 3262) any number of
/// times before the final response; the final 2xx is automatically held
/// back while SDP-bearing provisionals are unacknowledged.
pub struct InviteAcceptor {
    endpoint: Endpoint,
    inner: Arc<Inner>,
    cancellable_key: CancellableKey,
    cancelled_notify: Arc<Notify>,
    cancelled: bool,
    usage_guard: Option<UsageGuard>,

    invite_cseq: u32,
    peer_supports_100rel: bool,
    peer_requires_100rel: bool,
}

impl Drop for InviteAcceptor {
    fn drop(&mut self) {
        self.endpoint
            .layer::<InviteLayer>()
            .cancellables
            .lock()
            .remove(&self.cancellable_key);
    }
}

impl InviteAcceptor {
    pub fn new(dialog: Arc<Dialog>, mut invite: IncomingRequest) -> Self {
        assert_eq!(
            invite.line.method,
            Method::INVITE,
            "incoming request must be INVITE"
        );

        let endpoint = dialog.endpoint.clone();

        let supported = invite
            .headers
            .get_named::<Vec<Supported>>()
            .unwrap_or_default();

        let required = invite
            .headers
            .try_get_named::<Vec<Require>>()
            .and_then(|r| r.ok())
            .unwrap_or_default();

        let peer_requires_100rel = required.iter().any(|ext| ext.0 == "100rel");
        let peer_supports_100rel =
            peer_requires_100rel || supported.iter().any(|ext| ext.0 == "100rel");

        let dialog_key = dialog.key();
        let invite_cseq = invite.base_headers.cseq.cseq;

        let cancellable_key = CancellableKey {
            cseq: invite_cseq,
            branch: invite.tsx_key.branch().clone(),
        };

        let cancelled_notify = Arc::new(Notify::new());

        let tsx = endpoint.create_server_inv_tsx(&mut invite);

        let inner = Arc::new(Inner {
            endpoint: endpoint.clone(),
            state: Mutex::new(InviteSessionState::UasProvisional {
                dialog,
                tsx,
                invite,
                cancelled_notify: cancelled_notify.clone(),
            }),
            peer_supports_100rel,
            awaited_ack: pl::Mutex::new(None),
            uas_rel: Mutex::new(None),
        });

        // Unwrap is safe as we still hold the dialog
        let usage_guard = register_usage(
            endpoint.clone(),
            dialog_key,
            InviteUsage {
                inner: inner.clone(),
            },
        )
        .unwrap();

        endpoint
            .layer::<InviteLayer>()
            .cancellables
            .lock()
            .insert(cancellable_key.clone(), inner.clone());

        Self {
            endpoint,
            inner,
            cancellable_key,
            cancelled_notify,
            cancelled: false,
            usage_guard: Some(usage_guard),
            invite_cseq,
            peer_supports_100rel,
            peer_requires_100rel,
        }
    }

    /// Returns when the INVITE has been cancelled by a CANCEL or BYE
    /// request (or failed internally)
    pub async fn cancelled(&mut self) {
        if self.cancelled {
            return;
        }

        self.cancelled_notify.notified().await;
        self.cancelled = true;
    }

    /// Notifier fired when the INVITE is cancelled; allows watching for
    /// cancellation without borrowing the acceptor
    pub(crate) fn cancel_notified(&self) -> Arc<Notify> {
        self.cancelled_notify.clone()
    }

    pub fn peer_supports_100rel(&self) -> bool {
        self.peer_supports_100rel
    }

    pub fn peer_requires_100rel(&self) -> bool {
        self.peer_requires_100rel
    }

    /// Identity of the caller, taken from the INVITE's From header
    pub async fn peer_identity(&self) -> Option<sip_types::uri::NameAddr> {
        let state = self.inner.state.lock().await;

        if let InviteSessionState::UasProvisional { invite, .. } = &*state {
            Some(invite.base_headers.from.uri.clone())
        } else {
            None
        }
    }

    pub async fn create_response(
        &self,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Result<OutgoingResponse, Error> {
        let mut state = self.inner.state.lock().await;

        if let InviteSessionState::UasProvisional { dialog, invite, .. } = &mut *state {
            dialog.create_response(invite, code, reason).map_err(Error::Core)
        } else {
            Err(Error::RequestTerminated)
        }
    }

    /// Send a provisional response without reliability
    pub async fn respond_provisional(&mut self, mut response: OutgoingResponse) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;

        if let InviteSessionState::UasProvisional { tsx, .. } = &mut *state {
            tsx.respond_provisional(&mut response)
                .await
                .map_err(Error::Core)
        } else {
            Err(Error::RequestTerminated)
        }
    }

    /// Send a provisional response reliably.
    ///
    /// The response is put on the reliable transmission queue: it goes on
    /// the wire once all previously queued provisionals are acknowledged
    /// and is retransmitted until the peer PRACKs it. Failure to ever
    /// receive the PRACK ends the session with 500.
    pub async fn respond_provisional_reliable(
        &mut self,
        response: OutgoingResponse,
    ) -> Result<(), Error> {
        assert!(
            self.peer_supports_100rel,
            "peer does not support reliable provisional responses"
        );

        assert!(
            matches!(response.msg.line.code.into_u16(), 101..=199),
            "response code must be provisional and not 100"
        );

        let state = self.inner.state.lock().await;

        if !matches!(&*state, InviteSessionState::UasProvisional { .. }) {
            return Err(Error::RequestTerminated);
        }

        drop(state);

        rel100::send_reliable(&self.inner, self.invite_cseq, response).await
    }

    /// Respond with a final success response and wait for the peer's ACK.
    ///
    /// If SDP was sent on a still unacknowledged reliable provisional the
    /// response is held back until the PRACK arrives (RFC 3262 section 3).
    pub async fn respond_success(
        mut self,
        response: OutgoingResponse,
    ) -> Result<(InviteSession, IncomingRequest), Error> {
        match rel100::gate_final(&self.inner).await {
            rel100::FinalGate::Clear => {}
            rel100::FinalGate::Wait(released) => {
                if released.await.is_err() {
                    // Reliable transmission gave up and tore the session down
                    return Err(Error::RequestTerminated);
                }
            }
        }

        debug_assert!(rel100::uas_state_is_idle(&self.inner).await);

        // Lock the state over the duration of the responding process and
        // while waiting for the ACK. This avoids handling of other
        // requests that assume a completed session.
        let mut state = self.inner.state.lock().await;

        let (evt_sink, events) = mpsc::channel(4);
        let res = state.set_established(evt_sink);

        if let Some((dialog, transaction, invite)) = res {
            // Register the INVITE's CSeq so the incoming ACK can be matched
            // to this transaction
            let (ack_sink, ack_recv) = oneshot::channel();
            *self.inner.awaited_ack.lock() = Some(AwaitedAck {
                cseq: invite.base_headers.cseq.cseq,
                ack_sender: ack_sink,
            });

            let accepted = transaction.respond_success(response).await?;

            let ack = super::receive_ack(accepted, ack_recv).await?;

            // Pin the dialog target to wherever the ACK came from
            let mut target_tp_info = dialog.target_tp_info.lock().await;
            target_tp_info.transport = Some((ack.tp_info.transport.clone(), ack.tp_info.source));
            drop(target_tp_info);

            let session = InviteSession::new(
                self.endpoint.clone(),
                self.inner.clone(),
                Role::Uas,
                events,
                self.usage_guard.take().unwrap(),
                dialog,
            );

            Ok((session, ack))
        } else {
            Err(Error::RequestTerminated)
        }
    }

    /// Respond with a failure response (3xx-6xx)
    pub async fn respond_failure(self, response: OutgoingResponse) -> Result<(), Error> {
        // Any pending reliable provisionals are dropped, the final
        // response supersedes them
        rel100::clear_uas_state(&self.inner).await;

        if let Some((_, transaction, _)) = self.inner.state.lock().await.set_cancelled() {
            transaction
                .respond_failure(response)
                .await
                .map_err(Error::Core)
        } else {
            Err(Error::RequestTerminated)
        }
    }
}

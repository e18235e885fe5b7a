use crate::dialog::{Dialog, Usage};
use crate::rel100;
use acceptor::CancellableKey;
use parking_lot as pl;
use sip_core::transaction::consts::{T1, T2};
use sip_core::transaction::{Accepted, TsxKey};
use sip_core::transport::OutgoingRequest;
use sip_core::{Endpoint, EndpointBuilder, Error, IncomingRequest, Layer, MayTake, Result};
use sip_types::header::typed::CSeq;
use sip_types::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::timeout;

pub mod acceptor;
pub mod initiator;
pub mod session;

#[derive(Debug)]
pub(crate) struct AwaitedAck {
    pub(crate) cseq: u32,
    pub(crate) ack_sender: oneshot::Sender<IncomingRequest>,
}

/// State shared between all objects of one INVITE session: the acceptor or
/// initiator that created it, the dialog usage receiving in-dialog requests,
/// the established session and the reliable-response timer tasks.
pub(crate) struct Inner {
    pub(crate) endpoint: Endpoint,

    pub(crate) state: Mutex<InviteSessionState>,

    pub(crate) peer_supports_100rel: bool,

    pub(crate) awaited_ack: pl::Mutex<Option<AwaitedAck>>,

    /// UAS side of the reliable provisional response engine, lazily
    /// created when the first reliable provisional is sent
    pub(crate) uas_rel: Mutex<Option<rel100::UasRelState>>,
}

#[allow(clippy::large_enum_variant)]
pub(crate) enum InviteSessionState {
    /// Before a final response was sent (UAS only)
    UasProvisional {
        dialog: Arc<Dialog>,
        tsx: sip_core::transaction::ServerInvTsx,
        invite: IncomingRequest,
        cancelled_notify: Arc<Notify>,
    },

    /// A CANCEL was received (or the session failed) before a final
    /// response, the INVITE transaction is finished
    Cancelled,

    /// Final success response exchanged, in-dialog requests are forwarded
    /// to the session object through this sender
    Established {
        evt_sink: mpsc::Sender<UsageEvent>,
    },

    /// A BYE was received or sent, no further events are distributed
    Terminated,
}

impl InviteSessionState {
    /// Set the state to Cancelled and return the pending transaction if the
    /// current state is provisional. Wakes anyone waiting for cancellation.
    pub(crate) fn set_cancelled(
        &mut self,
    ) -> Option<(
        Arc<Dialog>,
        sip_core::transaction::ServerInvTsx,
        IncomingRequest,
    )> {
        if !matches!(self, InviteSessionState::UasProvisional { .. }) {
            return None;
        }

        match std::mem::replace(self, InviteSessionState::Cancelled) {
            InviteSessionState::UasProvisional {
                dialog,
                tsx,
                invite,
                cancelled_notify,
            } => {
                cancelled_notify.notify_one();

                Some((dialog, tsx, invite))
            }
            _ => unreachable!(),
        }
    }

    /// Set the state to Established and return the pending transaction,
    /// dialog and initial INVITE if the current state is provisional
    pub(crate) fn set_established(
        &mut self,
        evt_sink: mpsc::Sender<UsageEvent>,
    ) -> Option<(
        Arc<Dialog>,
        sip_core::transaction::ServerInvTsx,
        IncomingRequest,
    )> {
        if !matches!(self, InviteSessionState::UasProvisional { .. }) {
            return None;
        }

        match std::mem::replace(self, InviteSessionState::Established { evt_sink }) {
            InviteSessionState::UasProvisional {
                dialog,
                tsx,
                invite,
                cancelled_notify: _,
            } => Some((dialog, tsx, invite)),
            _ => unreachable!(),
        }
    }

    pub(crate) fn set_terminated(&mut self) -> Self {
        std::mem::replace(self, Self::Terminated)
    }
}

/// Endpoint layer required by every INVITE session.
///
/// Routes CANCEL requests to the acceptor they abort and advertises the
/// capabilities of the call engine.
#[derive(Default)]
pub struct InviteLayer {
    pub(crate) cancellables: pl::Mutex<HashMap<CancellableKey, Arc<Inner>>>,
}

#[async_trait::async_trait]
impl Layer for InviteLayer {
    fn name(&self) -> &'static str {
        "invite"
    }

    fn init(&mut self, endpoint: &mut EndpointBuilder) {
        endpoint.add_allow(Method::INVITE);
        endpoint.add_allow(Method::ACK);
        endpoint.add_allow(Method::CANCEL);
        endpoint.add_allow(Method::BYE);
        endpoint.add_allow(Method::UPDATE);
        endpoint.add_allow(Method::PRACK);
        endpoint.add_allow(Method::REFER);
        endpoint.add_allow(Method::NOTIFY);
        endpoint.add_allow(Method::MESSAGE);

        endpoint.add_supported("100rel");
        endpoint.add_supported("replaces");
        endpoint.add_supported("norefersub");
    }

    async fn receive(&self, endpoint: &Endpoint, mut request: MayTake<'_, IncomingRequest>) {
        if let Method::CANCEL = request.line.method {
            if let Err(e) = self
                .handle_cancel(endpoint, MayTake::new(request.inner()))
                .await
            {
                log::error!("Failed to handle CANCEL request {:?}", e);
            }
        }
    }
}

impl InviteLayer {
    async fn handle_cancel(
        &self,
        endpoint: &Endpoint,
        cancel: MayTake<'_, IncomingRequest>,
    ) -> Result<()> {
        let inner = {
            let mut cancellables = self.cancellables.lock();

            cancellables.remove(&CancellableKey {
                cseq: cancel.base_headers.cseq.cseq,
                branch: cancel.tsx_key.branch().clone(),
            })
        };

        // Transaction found and in progress: respond 200 to the CANCEL and
        //   487 to the INVITE
        // Transaction found but completed: respond 200 to the CANCEL
        // No matching transaction: leave it to the endpoint
        if let Some(inner) = inner {
            let mut cancel = cancel.take();
            let cancel_tsx = endpoint.create_server_tsx(&mut cancel);

            // No reliable response will be acknowledged anymore
            rel100::clear_uas_state(&inner).await;

            if let Some((dialog, invite_tsx, invite)) = inner.state.lock().await.set_cancelled() {
                let invite_response =
                    dialog.create_response(&invite, StatusCode::REQUEST_TERMINATED, None)?;

                let cancel_response = dialog.create_response(&cancel, StatusCode::OK, None)?;

                let (r1, r2) = tokio::join!(
                    invite_tsx.respond_failure(invite_response),
                    cancel_tsx.respond(cancel_response)
                );

                r1?;
                r2
            } else {
                let response = endpoint.create_response(&cancel, StatusCode::OK, None);

                cancel_tsx.respond(response).await
            }
        } else {
            Ok(())
        }
    }
}

/// Dialog usage of an INVITE session, receives all in-dialog requests
pub(crate) struct InviteUsage {
    pub(crate) inner: Arc<Inner>,
}

#[async_trait::async_trait]
impl Usage for InviteUsage {
    fn name(&self) -> &'static str {
        "invite-usage"
    }

    async fn receive(&self, endpoint: &Endpoint, mut request: MayTake<'_, IncomingRequest>) {
        match request.line.method {
            Method::INVITE => {
                self.forward_to_session(request, UsageEvent::ReInvite).await;
            }
            Method::UPDATE => {
                self.forward_to_session(request, UsageEvent::Update).await;
            }
            Method::REFER => {
                self.forward_to_session(request, UsageEvent::Refer).await;
            }
            // NOTIFY is left untouched here, transfer subscriptions
            // register their own usage for it
            Method::MESSAGE => {
                self.forward_to_session(request, UsageEvent::Message).await;
            }
            Method::ACK => {
                let mut awaited_ack_opt = self.inner.awaited_ack.lock();

                if let Some(awaited_ack) = awaited_ack_opt.take() {
                    if awaited_ack.cseq == request.base_headers.cseq.cseq {
                        let ack = request.inner().take().unwrap();

                        if let Err(ack) = awaited_ack.ack_sender.send(ack) {
                            *request.inner() = Some(ack);
                        }
                    } else {
                        // ACK not expected, put the awaited entry back
                        *awaited_ack_opt = Some(awaited_ack);
                    }
                }
            }
            Method::BYE => {
                let mut state = self.inner.state.lock().await;

                match state.set_terminated() {
                    InviteSessionState::UasProvisional {
                        dialog,
                        tsx,
                        invite,
                        cancelled_notify,
                    } => {
                        drop(state);

                        cancelled_notify.notify_one();
                        rel100::clear_uas_state(&self.inner).await;

                        if let Err(e) = self
                            .handle_bye_in_provisional_state(
                                endpoint,
                                dialog,
                                tsx,
                                invite,
                                request.take(),
                            )
                            .await
                        {
                            log::warn!("Failed to handle BYE in provisional state: {:?}", e);
                        }
                    }
                    InviteSessionState::Established { evt_sink } => {
                        drop(state);

                        let bye = request.inner().take().unwrap();

                        if let Err(SendError(UsageEvent::Bye(bye))) =
                            evt_sink.send(UsageEvent::Bye(bye)).await
                        {
                            *request.inner() = Some(bye);
                        }
                    }
                    InviteSessionState::Cancelled | InviteSessionState::Terminated => {}
                }
            }
            Method::PRACK if self.inner.peer_supports_100rel => {
                if let Err(e) =
                    rel100::handle_prack(&self.inner, endpoint, MayTake::new(request.inner())).await
                {
                    log::warn!("Failed to handle PRACK request {:?}", e);
                }
            }
            _ => {}
        }
    }
}

impl InviteUsage {
    async fn forward_to_session(
        &self,
        mut request: MayTake<'_, IncomingRequest>,
        make_event: fn(IncomingRequest) -> UsageEvent,
    ) {
        let state = self.inner.state.lock().await;

        if let InviteSessionState::Established { evt_sink } = &*state {
            let evt_sink = evt_sink.clone();
            drop(state);

            let incoming = request.inner().take().unwrap();

            if let Err(SendError(evt)) = evt_sink.send(make_event(incoming)).await {
                *request.inner() = Some(evt.into_request());
            }
        }
    }

    async fn handle_bye_in_provisional_state(
        &self,
        endpoint: &Endpoint,
        dialog: Arc<Dialog>,
        invite_tsx: sip_core::transaction::ServerInvTsx,
        invite: IncomingRequest,
        mut bye: IncomingRequest,
    ) -> Result<()> {
        let bye_response = dialog.create_response(&bye, StatusCode::OK, None)?;
        let bye_tsx = endpoint.create_server_tsx(&mut bye);

        let invite_response =
            dialog.create_response(&invite, StatusCode::REQUEST_TERMINATED, None)?;

        let (r1, r2) = tokio::join!(
            invite_tsx.respond_failure(invite_response),
            bye_tsx.respond(bye_response)
        );

        r1?;
        r2
    }
}

pub(crate) enum UsageEvent {
    ReInvite(IncomingRequest),
    Update(IncomingRequest),
    Refer(IncomingRequest),
    Message(IncomingRequest),
    Bye(IncomingRequest),
}

impl UsageEvent {
    fn into_request(self) -> IncomingRequest {
        match self {
            UsageEvent::ReInvite(r)
            | UsageEvent::Update(r)
            | UsageEvent::Refer(r)
            | UsageEvent::Message(r)
            | UsageEvent::Bye(r) => r,
        }
    }
}

/// Create an ACK request for the given CSeq inside the dialog
pub(crate) async fn create_ack(dialog: &Dialog, cseq_num: u32) -> Result<OutgoingRequest> {
    let mut ack = dialog.create_request(Method::ACK);

    // The ACK must carry the CSeq number of the INVITE it acknowledges
    let mut cseq: CSeq = ack.headers.get_named()?;
    cseq.cseq = cseq_num;
    ack.headers.remove(&sip_types::Name::CSEQ);
    ack.headers.insert_named(&cseq);

    let mut target_tp_info = dialog.target_tp_info.lock().await;

    let mut ack = dialog
        .endpoint
        .create_outgoing(ack, &mut target_tp_info)
        .await?;

    // Create a transaction key only to build the Via header, the ACK never
    // receives responses so it is not registered
    let tsx_key = TsxKey::client(&Method::ACK);
    let via = dialog.endpoint.create_via(
        &ack.parts.transport,
        &tsx_key,
        target_tp_info.via_host_port.clone(),
    );

    ack.msg.headers.insert_named_front(&via);

    Ok(ack)
}

/// Wait for the ACK matching a success response, retransmitting the
/// response on the usual T1 schedule until it arrives
pub(crate) async fn receive_ack(
    mut accepted: Accepted,
    mut ack_recv: oneshot::Receiver<IncomingRequest>,
) -> Result<IncomingRequest> {
    let mut delta = T1;

    for _ in 1..10 {
        match timeout(delta, &mut ack_recv).await {
            Ok(res) => {
                // Unwrap is safe, there is never more than one invite
                // transaction per session
                return Ok(res.unwrap());
            }
            Err(_) => {
                accepted.retransmit().await?;
                delta = (delta * 2).min(T2);
            }
        }
    }

    Err(Error::RequestTimedOut)
}

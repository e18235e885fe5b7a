use super::{AwaitedAck, Inner, UsageEvent};
use crate::dialog::{Dialog, UsageGuard};
use sip_core::transaction::{ServerInvTsx, ServerTsx, TsxResponse};
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest, Request, Result};
use sip_types::header::typed::ContentType;
use sip_types::{CodeKind, Method, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// An established INVITE session.
///
/// Owned by the task driving the call; yields the in-dialog requests
/// received through the dialog usage. Operations that only need the shared
/// session state are available on the cloneable [`SessionHandle`].
pub struct InviteSession {
    pub endpoint: Endpoint,
    inner: Arc<Inner>,

    pub role: Role,

    usage_events: Receiver<UsageEvent>,

    // drop usage before dialog
    _usage_guard: UsageGuard,
    pub dialog: Arc<Dialog>,
}

impl std::fmt::Debug for InviteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InviteSession")
            .field("role", &self.role)
            .field("dialog", &self.dialog)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::large_enum_variant)]
pub enum SessionEvent {
    ReInviteReceived(ReInviteReceived),
    UpdateReceived(UpdateReceived),
    ReferReceived(ReferReceived),
    MessageReceived(MessageReceived),
    Bye(ByeEvent),
    Terminated,
}

pub struct ReInviteReceived {
    pub invite: IncomingRequest,
    pub transaction: ServerInvTsx,
}

pub struct UpdateReceived {
    pub update: IncomingRequest,
    pub transaction: ServerTsx,
}

pub struct ReferReceived {
    pub refer: IncomingRequest,
    pub transaction: ServerTsx,
}

pub struct MessageReceived {
    pub message: IncomingRequest,
    pub transaction: ServerTsx,
}

pub struct ByeEvent {
    pub bye: IncomingRequest,
    pub transaction: ServerTsx,
}

impl InviteSession {
    pub(super) fn new(
        endpoint: Endpoint,
        inner: Arc<Inner>,
        role: Role,
        usage_events: Receiver<UsageEvent>,
        usage_guard: UsageGuard,
        dialog: Arc<Dialog>,
    ) -> Self {
        Self {
            endpoint,
            inner,
            role,
            usage_events,
            _usage_guard: usage_guard,
            dialog,
        }
    }

    /// Cloneable handle for operations issued from outside the driving task
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            endpoint: self.endpoint.clone(),
            dialog: self.dialog.clone(),
            inner: self.inner.clone(),
            role: self.role,
        }
    }

    /// Wait for the next in-dialog event
    pub async fn run(&mut self) -> Result<SessionEvent> {
        let Some(evt) = self.usage_events.recv().await else {
            // The sender is dropped once the state was set to Terminated
            return Ok(SessionEvent::Terminated);
        };

        match evt {
            UsageEvent::ReInvite(mut invite) => {
                let transaction = self.endpoint.create_server_inv_tsx(&mut invite);

                Ok(SessionEvent::ReInviteReceived(ReInviteReceived {
                    invite,
                    transaction,
                }))
            }
            UsageEvent::Update(mut update) => {
                let transaction = self.endpoint.create_server_tsx(&mut update);

                Ok(SessionEvent::UpdateReceived(UpdateReceived {
                    update,
                    transaction,
                }))
            }
            UsageEvent::Refer(mut refer) => {
                let transaction = self.endpoint.create_server_tsx(&mut refer);

                Ok(SessionEvent::ReferReceived(ReferReceived {
                    refer,
                    transaction,
                }))
            }
            UsageEvent::Message(mut message) => {
                let transaction = self.endpoint.create_server_tsx(&mut message);

                Ok(SessionEvent::MessageReceived(MessageReceived {
                    message,
                    transaction,
                }))
            }
            UsageEvent::Bye(mut bye) => {
                let transaction = self.endpoint.create_server_tsx(&mut bye);

                Ok(SessionEvent::Bye(ByeEvent { bye, transaction }))
            }
        }
    }

    /// Answer an incoming BYE, the session is terminated afterwards
    pub async fn handle_bye(&mut self, event: ByeEvent) -> Result<()> {
        self.inner.state.lock().await.set_terminated();

        let response = self
            .dialog
            .create_response(&event.bye, StatusCode::OK, None)?;

        event.transaction.respond(response).await
    }

    /// Answer an incoming re-INVITE with a success response and wait for
    /// the peer's ACK
    pub async fn respond_reinvite_success(
        &mut self,
        event: ReInviteReceived,
        response: OutgoingResponse,
    ) -> Result<IncomingRequest> {
        let (ack_sender, ack_recv) = oneshot::channel();

        *self.inner.awaited_ack.lock() = Some(AwaitedAck {
            cseq: event.invite.base_headers.cseq.cseq,
            ack_sender,
        });

        let accepted = event.transaction.respond_success(response).await?;

        super::receive_ack(accepted, ack_recv).await
    }

    pub async fn terminate(&mut self) -> Result<TsxResponse, sip_core::Error> {
        self.handle().terminate().await
    }
}

/// Shared part of an [`InviteSession`], usable concurrently to the task
/// driving the session event loop
#[derive(Clone)]
pub struct SessionHandle {
    pub endpoint: Endpoint,
    pub dialog: Arc<Dialog>,
    inner: Arc<Inner>,
    pub role: Role,
}

impl SessionHandle {
    /// Send a re-INVITE carrying an SDP offer, wait for the final response
    /// and acknowledge a success.
    ///
    /// Returns the final response; a failure status does not terminate the
    /// session.
    pub async fn reinvite_with_offer(&self, sdp_offer: String) -> Result<TsxResponse> {
        let mut invite = self.dialog.create_request(Method::INVITE);
        invite
            .headers
            .insert_named(&ContentType(bytesstr::BytesStr::from_static(
                "application/sdp",
            )));
        invite.body = sdp_offer.into_bytes().into();

        let mut target_tp_info = self.dialog.target_tp_info.lock().await;

        let mut transaction = self
            .endpoint
            .send_invite(invite, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        let mut final_response = None;

        while let Some(response) = transaction.receive().await? {
            match response.line.code.kind() {
                CodeKind::Provisional => { /* ignore */ }
                CodeKind::Success => {
                    let mut ack =
                        super::create_ack(&self.dialog, response.base_headers.cseq.cseq).await?;

                    self.endpoint.send_outgoing_request(&mut ack).await?;

                    final_response = Some(response);
                    break;
                }
                _ => {
                    final_response = Some(response);
                    break;
                }
            }
        }

        final_response.ok_or(sip_core::Error::RequestTimedOut)
    }

    /// Send an UPDATE carrying an SDP offer and wait for the final response
    pub async fn update_with_offer(&self, sdp_offer: String) -> Result<TsxResponse> {
        let mut update = self.dialog.create_request(Method::UPDATE);
        update
            .headers
            .insert_named(&ContentType(bytesstr::BytesStr::from_static(
                "application/sdp",
            )));
        update.body = sdp_offer.into_bytes().into();

        self.send_request(update).await
    }

    /// Send an arbitrary request inside the dialog and wait for the final
    /// response
    pub async fn send_request(&self, request: Request) -> Result<TsxResponse> {
        let mut target_tp_info = self.dialog.target_tp_info.lock().await;

        let mut transaction = self
            .endpoint
            .send_request(request, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        transaction.receive_final().await
    }

    /// Terminate the session with a BYE request
    pub async fn terminate(&self) -> Result<TsxResponse, sip_core::Error> {
        self.inner.state.lock().await.set_terminated();

        let request = self.dialog.create_request(Method::BYE);

        self.send_request(request).await
    }
}

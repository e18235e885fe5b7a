use super::session::{InviteSession, Role};
use super::{Inner, InviteSessionState, InviteUsage};
use crate::dialog::{ClientDialogBuilder, Dialog};
use crate::rel100;
use bytesstr::BytesStr;
use parking_lot as pl;
use sip_core::transaction::{ClientInvTsx, TsxResponse};
use sip_core::transport::OutgoingRequest;
use sip_core::{Endpoint, Error, Request};
use sip_types::header::HeaderError;
use sip_types::header::typed::{Contact, Require, Supported};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

#[derive(Debug)]
pub enum Response {
    /// Provisional response outside any early dialog (100, or missing
    /// Contact/to-tag)
    Provisional(TsxResponse),

    /// Final failure response, all early dialogs have been terminated
    Failure(TsxResponse),

    /// Provisional response that created an early dialog. A reliable
    /// provisional has already been acknowledged with a PRACK.
    Early(Early, TsxResponse),

    /// Success response establishing the session
    Session(InviteSession, TsxResponse),

    /// The response was routed to an existing early dialog
    EarlyEvent,

    /// A 2xx from an additional fork arrived and was terminated with a BYE
    ForkTerminated,

    /// Transaction finished
    Finished,
}

/// Sends an INVITE and tracks every dialog the responses create
pub struct InviteInitiator {
    dialog_builder: ClientDialogBuilder,

    transaction: Option<ClientInvTsx>,

    /// Early dialogs by to-tag; responses within one are forwarded through
    /// the channel
    early_list: Vec<(BytesStr, mpsc::Sender<EarlyEvent>)>,

    /// ACK requests of created sessions by to-tag, retransmitted when the
    /// 2xx is received again
    created_sessions: HashMap<BytesStr, OutgoingRequest>,

    /// A success response was already accepted; any 2xx from an unknown
    /// branch after this is a fork and gets terminated
    has_2xx: bool,

    pub support_100rel: bool,
    pub require_100rel: bool,
}

impl InviteInitiator {
    pub fn new(
        endpoint: Endpoint,
        local_addr: NameAddr,
        local_contact: Contact,
        target: SipUri,
    ) -> Self {
        let dialog_builder = ClientDialogBuilder::new(endpoint, local_addr, local_contact, target);

        Self {
            dialog_builder,
            transaction: None,
            early_list: vec![],
            created_sessions: HashMap::new(),
            has_2xx: false,
            support_100rel: true,
            require_100rel: false,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.dialog_builder.endpoint
    }

    pub fn create_invite(&mut self) -> Request {
        let mut request = self.dialog_builder.create_request(Method::INVITE);

        if self.support_100rel {
            request
                .headers
                .insert_named(&Supported(BytesStr::from_static("100rel")));
        }

        if self.require_100rel {
            request
                .headers
                .insert_named(&Require(BytesStr::from_static("100rel")));
        }

        // Advertise that the peer may suppress the REFER subscription
        // (RFC 4488)
        request
            .headers
            .insert_named(&Supported(BytesStr::from_static("norefersub")));

        request
    }

    pub async fn send_invite(&mut self, request: Request) -> Result<(), Error> {
        let transaction = self
            .dialog_builder
            .endpoint
            .send_invite(request, &mut self.dialog_builder.target_tp_info)
            .await?;

        self.transaction = Some(transaction);

        Ok(())
    }

    /// Cancel the pending INVITE and absorb every outcome it may still
    /// produce
    pub async fn cancel(mut self) -> Result<(), Error> {
        let request = self.dialog_builder.create_request(Method::CANCEL);

        self.dialog_builder
            .endpoint
            .send_request(request, &mut self.dialog_builder.target_tp_info)
            .await?
            .receive_final()
            .await?;

        loop {
            match self.receive().await? {
                Response::Provisional(_) | Response::EarlyEvent | Response::ForkTerminated => {}
                Response::Failure(..) | Response::Finished => return Ok(()),
                Response::Early(early, ..) => {
                    early.cancel().await?;
                }
                Response::Session(mut session, ..) => {
                    session.terminate().await?;
                }
            }
        }
    }

    pub fn transaction(&self) -> Option<&ClientInvTsx> {
        self.transaction.as_ref()
    }

    pub async fn receive(&mut self) -> Result<Response, Error> {
        loop {
            let transaction = self
                .transaction
                .as_mut()
                .expect("must send invite before calling receive");

            let response = match transaction.receive().await? {
                Some(response) => response,
                None => return Ok(Response::Finished),
            };

            let code = response.line.code.into_u16();

            if code <= 100 {
                // 100 Trying, cannot create a dialog - just return
                return Ok(Response::Provisional(response));
            }

            if code >= 300 {
                for (_, early) in self.early_list.drain(..) {
                    if early.send(EarlyEvent::Terminate).await.is_err() {
                        log::warn!("failed to forward termination event, receiver dropped");
                    }
                }

                return Ok(Response::Failure(response));
            }

            let Some(to_tag) = response.base_headers.to.tag.as_ref() else {
                log::warn!("Cannot handle response without To-tag, treating as plain provisional");
                return Ok(Response::Provisional(response));
            };

            // Retransmit the ACK if this 2xx belongs to an established session
            if let Some(ack) = self.created_sessions.get_mut(to_tag) {
                self.dialog_builder
                    .endpoint
                    .send_outgoing_request(ack)
                    .await?;
                continue;
            }

            // Forward the response if it belongs to an early dialog
            let early_sender = self
                .early_list
                .iter()
                .find(|(tag, _)| tag == to_tag)
                .map(|(_, sender)| sender.clone());

            if let Some(early) = early_sender {
                // 2xx inside an early dialog while another branch already
                // produced the session: terminate the fork instead of
                // forwarding
                if (200..=299).contains(&code) && self.has_2xx {
                    self.terminate_forked_dialog(&response).await?;

                    return Ok(Response::ForkTerminated);
                }

                if (200..=299).contains(&code) {
                    self.has_2xx = true;
                }

                if early.send(EarlyEvent::Response(response)).await.is_err() {
                    log::warn!("failed to forward response, receiver of early dropped");
                }

                return Ok(Response::EarlyEvent);
            }

            match code {
                101..=199 => {
                    if !response.headers.contains(&Name::CONTACT) {
                        // Cannot create an early dialog without a contact
                        return Ok(Response::Provisional(response));
                    }

                    let mut early = self.create_early_dialog(&response)?;

                    match early.acknowledge(&response).await? {
                        PrackOutcome::Continue => {}
                        PrackOutcome::Fatal => {
                            early.terminate_dialog().await;
                            continue;
                        }
                    }

                    return Ok(Response::Early(early, response));
                }
                200..=299 => {
                    if self.has_2xx {
                        // 2xx from a second branch of a forked proxy
                        self.terminate_forked_dialog(&response).await?;

                        return Ok(Response::ForkTerminated);
                    }

                    let session = self.create_session(&response)?;

                    self.has_2xx = true;

                    return Ok(Response::Session(session, response));
                }
                _ => unreachable!(),
            }
        }
    }

    /// Store the ACK of an accepted session so later 2xx retransmissions
    /// can be answered
    pub fn set_acknowledge(&mut self, session: &InviteSession, ack: OutgoingRequest) {
        self.created_sessions.insert(
            session
                .dialog
                .peer_fromto
                .tag
                .clone()
                .expect("peer From/To of an established dialog has a tag"),
            ack,
        );
    }

    /// A 2xx arrived on a branch while another branch already produced an
    /// accepted session: synthesize the forked dialog, acknowledge the
    /// response and immediately tear the fork down with a BYE.
    async fn terminate_forked_dialog(&mut self, response: &TsxResponse) -> Result<(), Error> {
        let to_tag = response
            .base_headers
            .to
            .tag
            .clone()
            .expect("checked by caller");

        log::info!("terminating forked dialog (to-tag {to_tag})");

        let dialog = Arc::new(self.dialog_builder.create_dialog_from_response(response)?);

        let mut ack = super::create_ack(&dialog, response.base_headers.cseq.cseq).await?;
        self.dialog_builder
            .endpoint
            .send_outgoing_request(&mut ack)
            .await?;

        // Remember the ACK so retransmissions of this 2xx are re-answered
        self.created_sessions.insert(to_tag, ack);

        tokio::spawn(async move {
            let request = dialog.create_request(Method::BYE);

            let mut target_tp_info = dialog.target_tp_info.lock().await;

            match dialog
                .endpoint
                .send_request(request, &mut target_tp_info)
                .await
            {
                Ok(mut transaction) => {
                    drop(target_tp_info);

                    if let Err(e) = transaction.receive_final().await {
                        log::warn!("no final response for BYE on forked dialog, {e:?}");
                    }
                }
                Err(e) => log::warn!("failed to send BYE on forked dialog, {e:?}"),
            }
        });

        Ok(())
    }

    fn create_early_dialog(&mut self, response: &TsxResponse) -> Result<Early, HeaderError> {
        let dialog = self.dialog_builder.create_dialog_from_response(response)?;
        let to_tag = dialog.peer_fromto.tag.clone().unwrap();

        let (tx, response_rx) = mpsc::channel(4);

        self.early_list.push((to_tag, tx));

        Ok(Early {
            endpoint: self.dialog_builder.endpoint.clone(),
            dialog: Some(Arc::new(dialog)),
            response_rx,
            prack_state: None,
        })
    }

    fn create_session(&mut self, response: &TsxResponse) -> Result<InviteSession, HeaderError> {
        let dialog = Arc::new(self.dialog_builder.create_dialog_from_response(response)?);

        create_session_for_dialog(
            self.dialog_builder.endpoint.clone(),
            dialog,
            response,
        )
    }
}

#[derive(Debug)]
enum EarlyEvent {
    Response(TsxResponse),
    Terminate,
}

enum PrackOutcome {
    Continue,
    Fatal,
}

/// An early dialog created by a provisional response with a to-tag.
///
/// Reliable provisionals received inside it are automatically acknowledged
/// with PRACK requests in RSeq order; duplicates and out-of-order responses
/// are dropped.
#[derive(Debug)]
pub struct Early {
    endpoint: Endpoint,
    dialog: Option<Arc<Dialog>>,

    response_rx: mpsc::Receiver<EarlyEvent>,

    prack_state: Option<rel100::UacPrackState>,
}

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum EarlyResponse {
    Provisional(TsxResponse),
    Success(InviteSession, TsxResponse),
    Terminated,
}

impl Early {
    pub async fn receive(&mut self) -> Result<EarlyResponse, Error> {
        loop {
            match self.response_rx.recv().await.expect("dropped initiator") {
                EarlyEvent::Response(response) => match response.line.code.into_u16() {
                    101..=199 => match self.acknowledge(&response).await? {
                        PrackOutcome::Continue => {
                            return Ok(EarlyResponse::Provisional(response));
                        }
                        PrackOutcome::Fatal => {
                            self.terminate_dialog().await;

                            return Ok(EarlyResponse::Terminated);
                        }
                    },
                    200..=299 => {
                        let dialog = self.dialog.take().unwrap();

                        let session = create_session_for_dialog(
                            self.endpoint.clone(),
                            dialog,
                            &response,
                        )?;

                        return Ok(EarlyResponse::Success(session, response));
                    }
                    _ => unreachable!("initiator only forwards 101..=299 responses"),
                },
                EarlyEvent::Terminate => return Ok(EarlyResponse::Terminated),
            }
        }
    }

    /// PRACK a reliable provisional.
    ///
    /// Non-reliable responses and in-order reliable ones continue the call
    /// flow; duplicates and RSeq jumps are absorbed here. A fatal PRACK
    /// outcome (481/408/timeout/transport) kills the dialog.
    async fn acknowledge(&mut self, response: &TsxResponse) -> Result<PrackOutcome, Error> {
        let Some(rseq) = rel100::rseq_of(response) else {
            return Ok(PrackOutcome::Continue);
        };

        let dialog = self.dialog.as_ref().unwrap();
        let cseq = response.base_headers.cseq.cseq;

        match rel100::classify_rseq(&mut self.prack_state, cseq, rseq) {
            rel100::RseqDisposition::Acknowledge(rseq) => {
                let request = rel100::create_prack(dialog, response, rseq);

                let result = rel100::send_prack(dialog, request).await;

                if rel100::prack_result_is_fatal(&result) {
                    log::warn!("fatal PRACK outcome, terminating early dialog");

                    return Ok(PrackOutcome::Fatal);
                }

                Ok(PrackOutcome::Continue)
            }
            rel100::RseqDisposition::Duplicate => Ok(PrackOutcome::Continue),
            rel100::RseqDisposition::OutOfOrder { expected } => {
                log::debug!("ignoring provisional response with RSeq jump (expected {expected}, got {rseq})");

                Ok(PrackOutcome::Continue)
            }
        }
    }

    /// End the early dialog with a BYE.
    ///
    /// The exact recovery for fatal PRACK errors is underspecified in
    /// RFC 3262; ending the dialog is the conservative reading.
    async fn terminate_dialog(&mut self) {
        let Some(dialog) = self.dialog.take() else {
            return;
        };

        let request = dialog.create_request(Method::BYE);

        let mut target_tp_info = dialog.target_tp_info.lock().await;

        match dialog
            .endpoint
            .send_request(request, &mut target_tp_info)
            .await
        {
            Ok(mut transaction) => {
                drop(target_tp_info);

                if let Err(e) = transaction.receive_final().await {
                    log::warn!("no final response for BYE on early dialog, {e:?}");
                }
            }
            Err(e) => log::warn!("failed to send BYE on early dialog, {e:?}"),
        }
    }

    pub async fn cancel(mut self) -> Result<(), Error> {
        let dialog = self.dialog.as_ref().unwrap();

        let request = dialog.create_request(Method::CANCEL);

        let mut target_tp_info = dialog.target_tp_info.lock().await;

        let mut tsx = dialog
            .endpoint
            .send_request(request, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        tsx.receive_final().await?;

        loop {
            match self.response_rx.recv().await {
                Some(EarlyEvent::Response(response)) => {
                    if response.line.code == StatusCode::REQUEST_TERMINATED {
                        return Ok(());
                    }
                }
                Some(EarlyEvent::Terminate) | None => return Ok(()),
            }
        }
    }
}

/// Build the session object for an accepted dialog (either directly from
/// the INVITE transaction or out of an early dialog)
fn create_session_for_dialog(
    endpoint: Endpoint,
    dialog: Arc<Dialog>,
    response: &TsxResponse,
) -> Result<InviteSession, HeaderError> {
    let (evt_sink, usage_events) = mpsc::channel(4);

    let supported = response
        .headers
        .get_named::<Vec<Supported>>()
        .unwrap_or_default();

    let peer_supports_100rel = supported.iter().any(|ext| ext.0 == "100rel");

    let inner = Arc::new(Inner {
        endpoint: endpoint.clone(),
        state: Mutex::new(InviteSessionState::Established { evt_sink }),
        peer_supports_100rel,
        awaited_ack: pl::Mutex::new(None),
        uas_rel: Mutex::new(None),
    });

    let usage_guard = dialog.register_usage(InviteUsage {
        inner: inner.clone(),
    });

    Ok(InviteSession::new(
        endpoint,
        inner,
        Role::Uac,
        usage_events,
        usage_guard,
        dialog,
    ))
}

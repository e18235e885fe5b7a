use crate::dialog::layer::DialogEntry;
use crate::util::{random_sequence_number, random_string};
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_core::transport::{OutgoingResponse, TargetTransportInfo};
use sip_core::{Endpoint, IncomingRequest, Request};
use sip_types::header::typed::{CSeq, CallID, Contact, FromTo, MaxForwards, Routing};
use sip_types::msg::RequestLine;
use sip_types::uri::NameAddr;
use sip_types::{Method, Name, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

mod client_builder;
mod key;
mod layer;

pub use client_builder::ClientDialogBuilder;
pub use key::DialogKey;
pub use layer::{DialogLayer, Usage, UsageGuard, register_usage};

/// An established (possibly early) dialog.
///
/// The dialog is shared between the session object, its usages and timer
/// tasks, so all of its mutable state is interior: the local CSeq counter is
/// atomic and the transport target sits behind an async mutex.
#[derive(Debug)]
pub struct Dialog {
    pub endpoint: Endpoint,

    /// CSeq for the next request constructed inside this dialog
    local_cseq: AtomicU32,

    /// CSeq of the request that created this dialog (server dialogs)
    pub peer_cseq: u32,

    /// Local From/To half, tag is always set
    pub local_fromto: FromTo,

    /// Remote From/To half, tag may be missing on client dialogs until the
    /// peer answered
    pub peer_fromto: FromTo,

    pub local_contact: Contact,

    /// Remote contact, also the target URI for in-dialog requests
    pub peer_contact: Contact,

    pub call_id: CallID,

    /// Route set learned from Record-Route, applied to every request
    pub route_set: Vec<Routing>,

    /// Dialog was established over secure transports (sips)
    pub secure: bool,

    pub target_tp_info: Mutex<TargetTransportInfo>,
}

impl Dialog {
    /// Create a dialog from an incoming request which may establish one
    /// (e.g. INVITE). Generates the local tag.
    pub fn new_server(
        endpoint: Endpoint,
        request: &IncomingRequest,
        local_contact: Contact,
    ) -> Result<Self, sip_core::Error> {
        let peer_contact: Contact = request.headers.get_named()?;

        let mut route_set: Vec<Routing> = request
            .headers
            .get(Name::RECORD_ROUTE)
            .unwrap_or_default();

        // The server side sees the recorded route in reverse order
        route_set.reverse();

        let mut local_fromto = FromTo::new(request.base_headers.to.uri.clone(), None);
        local_fromto.tag = Some(random_string());

        let dialog = Self {
            endpoint,
            local_cseq: AtomicU32::new(random_sequence_number()),
            peer_cseq: request.base_headers.cseq.cseq,
            local_fromto,
            peer_fromto: request.base_headers.from.clone(),
            local_contact,
            peer_contact,
            call_id: request.base_headers.call_id.clone(),
            route_set,
            secure: request.line.uri.sips,
            target_tp_info: Mutex::new(TargetTransportInfo::default()),
        };

        let entry = DialogEntry::new(Some(dialog.peer_cseq));

        dialog
            .endpoint
            .layer::<DialogLayer>()
            .dialogs
            .lock()
            .insert(dialog.key(), entry);

        Ok(dialog)
    }

    /// Key this dialog is registered under in the [`DialogLayer`]
    pub fn key(&self) -> DialogKey {
        DialogKey {
            call_id: self.call_id.0.clone(),
            peer_tag: self.peer_fromto.tag.clone(),
            local_tag: self
                .local_fromto
                .tag
                .clone()
                .expect("local From/To of a dialog always has a tag"),
        }
    }

    /// Printable local identity (e.g. for Referred-By)
    pub fn local_identity(&self) -> NameAddr {
        self.local_fromto.uri.clone()
    }

    /// Create a request inside the dialog, consuming one local CSeq number
    pub fn create_request(&self, method: Method) -> Request {
        let cseq = CSeq::new(self.local_cseq.fetch_add(1, Ordering::Relaxed), method.clone());

        let mut request = Request {
            line: RequestLine {
                method,
                uri: self.peer_contact.uri.uri.clone(),
            },
            headers: Default::default(),
            body: Bytes::new(),
        };

        request.headers.insert_named(&MaxForwards(70));
        request.headers.insert_type(Name::FROM, &self.local_fromto);
        request.headers.insert_type(Name::TO, &self.peer_fromto);
        request.headers.insert_named(&self.call_id);
        request.headers.insert_named(&cseq);
        request.headers.insert_named(&self.local_contact);

        if !self.route_set.is_empty() {
            request.headers.insert_type(Name::ROUTE, &self.route_set);
        }

        request
    }

    /// Create a response to a request received inside this dialog.
    ///
    /// Stamps the dialog's local tag (except on 100) and decorates INVITE
    /// responses with the contact and capability headers required by their
    /// status code.
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Result<OutgoingResponse, sip_core::Error> {
        let mut response = self.endpoint.create_response(request, code, reason);

        // The endpoint copies the request's To header verbatim, which does
        // not carry our tag yet. 100 responses stay tagless.
        let mut to = request.base_headers.to.clone();
        to.tag = if code == StatusCode::TRYING {
            None
        } else {
            self.local_fromto.tag.clone()
        };

        response.msg.headers.remove(&Name::TO);
        response.msg.headers.insert_type(Name::TO, &to);

        if request.line.method == Method::INVITE {
            let code = code.into_u16();

            if let 101..=399 | 485 = code {
                if !response.msg.headers.contains(&Name::CONTACT) {
                    response.msg.headers.insert_named(&self.local_contact);
                }
            }

            if let 180..=189 | 200..=299 | 405 = code {
                response.msg.headers.insert_named(self.endpoint.allowed());
            }

            if let 200..=299 = code {
                response.msg.headers.insert_named(self.endpoint.supported());
            }
        }

        Ok(response)
    }

    /// Register a usage inside this dialog
    pub fn register_usage<U: Usage>(&self, usage: U) -> UsageGuard {
        // Unwrap is safe, the dialog still exists as long as `self` does
        register_usage(self.endpoint.clone(), self.key(), usage).unwrap()
    }
}

impl Drop for Dialog {
    fn drop(&mut self) {
        self.endpoint
            .layer::<DialogLayer>()
            .dialogs
            .lock()
            .remove(&self.key());
    }
}

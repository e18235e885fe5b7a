use super::key::DialogKey;
use parking_lot::Mutex;
use sip_core::{Endpoint, IncomingRequest, Layer, MayTake};
use sip_types::{Method, StatusCode};
use slotmap::{DefaultKey, SlotMap};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{Instrument, info_span};

/// A dialog usage receives the requests arriving inside its dialog.
///
/// Multiple usages may share one dialog (e.g. the INVITE usage and a
/// transfer subscription); each gets to inspect or take the request in
/// registration order.
#[async_trait::async_trait]
pub trait Usage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>);
}

pub(crate) struct DialogEntry {
    backlog: BTreeMap<u32, IncomingRequest>,

    /// CSeq expected from the peer next. `None` until the first in-dialog
    /// request arrives (client dialogs know no peer CSeq upfront).
    next_peer_cseq: Option<u32>,

    usages: SlotMap<DefaultKey, Arc<dyn Usage>>,
}

impl DialogEntry {
    pub(crate) fn new(peer_cseq: Option<u32>) -> Self {
        Self {
            backlog: Default::default(),
            next_peer_cseq: peer_cseq.map(|cseq| cseq + 1),
            usages: Default::default(),
        }
    }
}

/// Endpoint layer tracking all dialogs and distributing in-dialog requests
/// to their registered usages, in peer CSeq order.
#[derive(Default)]
pub struct DialogLayer {
    pub(crate) dialogs: Mutex<HashMap<DialogKey, DialogEntry>>,
}

#[async_trait::async_trait]
impl Layer for DialogLayer {
    fn name(&self) -> &'static str {
        "dialog"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayTake<'_, IncomingRequest>) {
        let Some(key) = DialogKey::from_incoming(&request) else {
            // Not addressed to any dialog
            return;
        };

        let (usages, requests) = {
            let mut dialogs = self.dialogs.lock();

            let Some(entry) = dialogs.get_mut(&key) else {
                return;
            };

            let request_cseq = request.base_headers.cseq.cseq;

            let next_peer_cseq = match entry.next_peer_cseq {
                Some(next_peer_cseq) => next_peer_cseq,
                None => {
                    // First in-dialog request from the peer, take its CSeq
                    // as the baseline
                    request_cseq
                }
            };

            match request_cseq.cmp(&next_peer_cseq) {
                Ordering::Less => {
                    // ACK requests reuse the CSeq number of the INVITE they
                    // acknowledge, everything else is a protocol error by
                    // the peer and logged before being passed on anyway.
                    if request.line.method != Method::ACK {
                        log::warn!("in-dialog request has a lower CSeq than expected");
                    }

                    (entry.usages.clone(), vec![request.take()])
                }
                Ordering::Equal => {
                    // Clone the usage map so the lock is not held while the
                    // usages (async) look at the requests.
                    let usages = entry.usages.clone();

                    let mut requests = vec![request.take()];

                    // Pull any directly following requests out of the backlog
                    for next_cseq in request_cseq + 1.. {
                        if let Some(queued) = entry.backlog.remove(&next_cseq) {
                            requests.push(queued);
                        } else {
                            break;
                        }
                    }

                    entry.next_peer_cseq =
                        Some(requests.last().unwrap().base_headers.cseq.cseq + 1);

                    (usages, requests)
                }
                Ordering::Greater => {
                    log::debug!("received in-dialog request ahead of CSeq order, queueing");
                    entry.backlog.insert(request_cseq, request.take());
                    return;
                }
            }
        };

        for request in requests {
            let mut request = Some(request);

            for usage in usages.values() {
                let span = info_span!("usage", name = %usage.name());

                usage
                    .receive(endpoint, MayTake::new(&mut request))
                    .instrument(span)
                    .await;

                if request.is_none() {
                    break;
                }
            }

            if let Some(request) = request {
                if let Err(e) = handle_unwanted_request(endpoint, request).await {
                    log::warn!("failed to respond to unwanted in-dialog request, {e:?}");
                }
            }
        }
    }
}

async fn handle_unwanted_request(
    endpoint: &Endpoint,
    mut request: IncomingRequest,
) -> sip_core::Result<()> {
    if request.line.method == Method::ACK {
        // Cannot respond to an ACK
        return Ok(());
    }

    let response = endpoint.create_response(
        &request,
        StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
        None,
    );

    if request.line.method == Method::INVITE {
        let tsx = endpoint.create_server_inv_tsx(&mut request);

        tsx.respond_failure(response).await
    } else {
        let tsx = endpoint.create_server_tsx(&mut request);

        tsx.respond(response).await
    }
}

/// Keeps a usage registered inside its dialog. Dropping the guard removes
/// the usage, stopping any further callbacks into it.
#[derive(Debug, Clone)]
pub struct UsageGuard {
    endpoint: Endpoint,
    dialog_key: DialogKey,
    usage_key: DefaultKey,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let mut dialogs = self.endpoint.layer::<DialogLayer>().dialogs.lock();

        if let Some(entry) = dialogs.get_mut(&self.dialog_key) {
            entry.usages.remove(self.usage_key);
        }
    }
}

/// Register `usage` inside the dialog identified by `dialog_key`
///
/// Returns `None` when the dialog no longer exists.
pub fn register_usage<U>(endpoint: Endpoint, dialog_key: DialogKey, usage: U) -> Option<UsageGuard>
where
    U: Usage,
{
    let mut dialogs = endpoint.layer::<DialogLayer>().dialogs.lock();
    let entry = dialogs.get_mut(&dialog_key)?;

    let usage_key = entry.usages.insert(Arc::new(usage));

    drop(dialogs);

    Some(UsageGuard {
        endpoint,
        dialog_key,
        usage_key,
    })
}

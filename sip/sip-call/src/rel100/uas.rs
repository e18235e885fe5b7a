use crate::invite::Inner;
use crate::invite::acceptor;
use crate::util::random_rseq;
use bytesstr::BytesStr;
use sip_core::transaction::consts::T1;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest, MayTake};
use sip_types::header::typed::{RAck, RSeq, Require};
use sip_types::{Name, StatusCode};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::sleep;

/// A reliable provisional is transmitted at most 7 times; the gaps add up
/// to roughly 64*T1 as required by RFC 3262 section 3
const MAX_TRANSMISSIONS: u32 = 7;

/// UAS-side reliable response state of one INVITE session.
///
/// Created when the first reliable provisional is sent, lives until the
/// INVITE transaction completes.
pub(crate) struct UasRelState {
    /// CSeq of the INVITE transaction being answered
    cseq: u32,

    /// Next RSeq number to assign
    rseq: u32,

    /// Sticky: set once any enqueued reliable provisional carried a body
    has_sdp: bool,

    /// Pending responses in transmission order. Only the head is on the
    /// wire; later entries wait for the PRACK acknowledging the head.
    queue: VecDeque<PendingResponse>,

    retransmit_count: u32,

    timer: RetransmitTimer,
}

enum PendingResponse {
    Provisional {
        rseq: u32,
        response: OutgoingResponse,
    },

    /// A 2xx that must not be emitted until every SDP-bearing provisional
    /// before it has been acknowledged. Dropping the sender aborts the
    /// waiting `respond_success`.
    Final {
        released: oneshot::Sender<()>,
    },
}

/// Single-shot retransmission timer.
///
/// The `armed` flag is consulted before cancellation so that cancelling an
/// already fired (or never armed) timer is a no-op.
#[derive(Default)]
struct RetransmitTimer {
    armed: bool,
    task: Option<AbortHandle>,
}

impl RetransmitTimer {
    fn arm(&mut self, inner: &Arc<Inner>, delay: Duration) {
        self.disarm();

        let weak = Arc::downgrade(inner);

        let task = tokio::spawn(async move {
            sleep(delay).await;

            if let Some(inner) = weak.upgrade() {
                on_retransmit_timer(inner).await;
            }
        });

        self.task = Some(task.abort_handle());
        self.armed = true;
    }

    fn disarm(&mut self) {
        if self.armed {
            if let Some(task) = self.task.take() {
                task.abort();
            }

            self.armed = false;
        }
    }

    /// The timer task fired, the handle is spent
    fn expired(&mut self) {
        self.armed = false;
        self.task = None;
    }

    fn armed(&self) -> bool {
        self.armed
    }
}

fn retransmit_delay(count: u32) -> Duration {
    if count < 6 {
        T1 * (1u32 << count)
    } else {
        Duration::from_millis(1500)
    }
}

fn rack_matches(head_rseq: u32, state_cseq: u32, rack: &RAck) -> bool {
    rack.rack == head_rseq && rack.cseq == state_cseq
}

/// Remove any `100rel` Require values and RSeq header a caller may have put
/// on the response; the engine stamps its own
fn strip_rel_headers(response: &mut OutgoingResponse) {
    if let Some(Ok(requires)) = response.msg.headers.try_get_named::<Vec<Require>>() {
        let keep: Vec<Require> = requires.into_iter().filter(|r| r.0 != "100rel").collect();

        response.msg.headers.remove(&Name::REQUIRE);

        if !keep.is_empty() {
            response.msg.headers.insert_named(&keep);
        }
    }

    response.msg.headers.remove(&Name::RSEQ);
}

/// Enqueue a provisional response (101-199) for reliable transmission.
///
/// The first queued entry is transmitted immediately and the retransmission
/// timer armed; later entries wait until their predecessors are PRACKed.
pub(crate) async fn send_reliable(
    inner: &Arc<Inner>,
    invite_cseq: u32,
    mut response: OutgoingResponse,
) -> Result<(), acceptor::Error> {
    debug_assert!(matches!(response.msg.line.code.into_u16(), 101..=199));

    strip_rel_headers(&mut response);

    let mut uas_rel = inner.uas_rel.lock().await;

    let state = uas_rel.get_or_insert_with(|| UasRelState {
        cseq: invite_cseq,
        rseq: random_rseq(),
        has_sdp: false,
        queue: VecDeque::new(),
        retransmit_count: 0,
        timer: RetransmitTimer::default(),
    });

    if state.cseq != invite_cseq {
        return Err(acceptor::Error::CSeqMismatch);
    }

    response
        .msg
        .headers
        .insert_named(&Require(BytesStr::from_static("100rel")));
    response.msg.headers.insert_named(&RSeq(state.rseq));

    let assigned_rseq = state.rseq;
    state.rseq += 1;

    let has_body = !response.msg.body.is_empty();

    state.queue.push_back(PendingResponse::Provisional {
        rseq: assigned_rseq,
        response,
    });

    state.has_sdp |= has_body;

    if state.queue.len() == 1 {
        state.retransmit_count = 0;
        transmit_head(inner, state).await;
    } else {
        log::debug!(
            "reliable provisional enqueued ({} pending)",
            state.queue.len()
        );
    }

    Ok(())
}

/// Transmit the queue head and schedule the next retransmission.
///
/// Shared by the initial send, the timer callback and the cycle restart
/// after a PRACK.
async fn transmit_head(inner: &Arc<Inner>, state: &mut UasRelState) {
    state.retransmit_count += 1;

    let Some(PendingResponse::Provisional { response, .. }) = state.queue.front_mut() else {
        // Final responses are retransmitted by the UA core, nothing to do
        state.queue.clear();
        return;
    };

    if let Err(e) = inner.endpoint.send_outgoing_response(response).await {
        log::warn!("failed to transmit reliable provisional response, {e}");
    }

    state
        .timer
        .arm(inner, retransmit_delay(state.retransmit_count));
}

/// Timer callback: retransmit the head entry or, on the 7th expiry, give
/// up and end the INVITE session with 500
async fn on_retransmit_timer(inner: Arc<Inner>) {
    let exhausted = {
        let mut uas_rel = inner.uas_rel.lock().await;

        let Some(state) = &mut *uas_rel else {
            return;
        };

        state.timer.expired();

        if state.retransmit_count + 1 >= MAX_TRANSMISSIONS {
            // No PRACK for ~64*T1, RFC 3262 says to reject the request
            // with a 5xx
            state.queue.clear();
            true
        } else {
            transmit_head(&inner, state).await;
            false
        }
    };

    if exhausted {
        fail_session(&inner).await;
    }
}

/// End the INVITE session after retransmission exhaustion
async fn fail_session(inner: &Arc<Inner>) {
    let taken = inner.state.lock().await.set_cancelled();

    let Some((dialog, tsx, invite)) = taken else {
        return;
    };

    log::warn!("reliable provisional response was never acknowledged, ending session");

    let reason = Some(BytesStr::from_static("Reliable response timed out"));

    match dialog.create_response(&invite, StatusCode::SERVER_INTERNAL_ERROR, reason) {
        Ok(response) => {
            if let Err(e) = tsx.respond_failure(response).await {
                log::warn!("failed to send 500 after PRACK timeout, {e:?}");
            }
        }
        Err(e) => log::warn!("failed to create 500 after PRACK timeout, {e:?}"),
    }
}

/// Handle an incoming PRACK request.
///
/// The PRACK is always answered with 200. If its RAck triple matches the
/// queue head, the head is acknowledged and the next pending response (or a
/// gated 2xx) goes on the wire.
pub(crate) async fn handle_prack(
    inner: &Arc<Inner>,
    endpoint: &Endpoint,
    request: MayTake<'_, IncomingRequest>,
) -> sip_core::Result<()> {
    let mut prack = request.take();

    let prack_tsx = endpoint.create_server_tsx(&mut prack);
    let response = endpoint.create_response(&prack, StatusCode::OK, None);

    {
        let mut uas_rel = inner.uas_rel.lock().await;

        match &mut *uas_rel {
            Some(state) if !state.queue.is_empty() => match prack.headers.get_named::<RAck>() {
                Ok(rack) => {
                    let head_rseq = match state.queue.front() {
                        Some(PendingResponse::Provisional { rseq, .. }) => Some(*rseq),
                        _ => None,
                    };

                    if head_rseq.is_some_and(|rseq| rack_matches(rseq, state.cseq, &rack)) {
                        state.timer.disarm();
                        state.queue.pop_front();
                        state.retransmit_count = 0;

                        match state.queue.front() {
                            Some(PendingResponse::Provisional { .. }) => {
                                transmit_head(inner, state).await;
                            }
                            Some(PendingResponse::Final { .. }) => {
                                // All provisionals acknowledged, release the
                                // gated 2xx
                                if let Some(PendingResponse::Final { released }) =
                                    state.queue.pop_front()
                                {
                                    let _ = released.send(());
                                }
                            }
                            None => {}
                        }
                    } else {
                        log::debug!("PRACK with no matching reliable response");
                    }
                }
                Err(e) => log::debug!("PRACK without usable RAck header, {e}"),
            },
            _ => log::debug!("PRACK ignored - no pending response"),
        }
    }

    prack_tsx.respond(response).await
}

/// Decide how a final response interacts with the pending reliable
/// provisionals, RFC 3262 section 3.
pub(crate) enum FinalGate {
    /// Nothing outstanding, emit the final response right away
    Clear,

    /// An SDP-bearing provisional is still unacknowledged; wait until the
    /// receiver fires before emitting the 2xx. A dropped sender means the
    /// session was torn down in the meantime.
    Wait(oneshot::Receiver<()>),
}

pub(crate) async fn gate_final(inner: &Arc<Inner>) -> FinalGate {
    let mut uas_rel = inner.uas_rel.lock().await;

    let Some(state) = &mut *uas_rel else {
        return FinalGate::Clear;
    };

    if state.has_sdp && !state.queue.is_empty() {
        let (tx, rx) = oneshot::channel();

        state.queue.push_back(PendingResponse::Final { released: tx });

        log::debug!("2xx response will be sent after PRACK");

        FinalGate::Wait(rx)
    } else {
        // Unacknowledged provisionals without SDP are abandoned, the final
        // response supersedes them
        state.timer.disarm();
        state.queue.clear();

        FinalGate::Clear
    }
}

/// Drop all pending transmissions and stop the timer. Used when the INVITE
/// transaction ends without the queue draining naturally (CANCEL, BYE in
/// early state, failure responses).
pub(crate) async fn clear_uas_state(inner: &Arc<Inner>) {
    if let Some(state) = &mut *inner.uas_rel.lock().await {
        state.timer.disarm();
        state.queue.clear();
    }
}

/// Invariant check: once the INVITE transaction terminated there must be
/// neither pending transmissions nor an armed timer
pub(crate) async fn uas_state_is_idle(inner: &Arc<Inner>) -> bool {
    match &*inner.uas_rel.lock().await {
        Some(state) => state.queue.is_empty() && !state.timer.armed(),
        None => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::Method;

    #[test]
    fn delays_follow_the_t1_backoff() {
        assert_eq!(retransmit_delay(1), 2 * T1);
        assert_eq!(retransmit_delay(2), 4 * T1);
        assert_eq!(retransmit_delay(3), 8 * T1);
        assert_eq!(retransmit_delay(4), 16 * T1);
        assert_eq!(retransmit_delay(5), 32 * T1);
        assert_eq!(retransmit_delay(6), Duration::from_millis(1500));
    }

    #[test]
    fn rack_must_match_rseq_and_cseq() {
        let rack = RAck::new(2, 71, Method::INVITE);

        assert!(rack_matches(2, 71, &rack));
        assert!(!rack_matches(3, 71, &rack));
        assert!(!rack_matches(2, 72, &rack));
    }
}

use crate::dialog::Dialog;
use sip_core::transaction::TsxResponse;
use sip_core::{Request, Result};
use sip_types::header::typed::{RAck, RSeq, Require};
use sip_types::{Method, StatusCode};

/// UAC-side reliable response state of one INVITE transaction
#[derive(Debug)]
pub(crate) struct UacPrackState {
    /// CSeq of the INVITE transaction the provisionals belong to
    cseq: u32,

    /// RSeq of the last acknowledged provisional
    rseq: u32,
}

/// What to do with an incoming reliable provisional
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RseqDisposition {
    /// In sequence, send a PRACK for this RSeq
    Acknowledge(u32),

    /// Retransmission of an already acknowledged response, drop silently
    Duplicate,

    /// RSeq jumped ahead, the response must not be acknowledged
    OutOfOrder { expected: u32 },
}

/// Validate the RSeq of a reliable provisional against the per-transaction
/// state, (re)initializing the state on the first response of an INVITE
/// transaction (including a re-INVITE reusing the dialog).
pub(crate) fn classify_rseq(
    state: &mut Option<UacPrackState>,
    cseq: u32,
    rseq: u32,
) -> RseqDisposition {
    let needs_init = match state {
        Some(state) => state.cseq != cseq,
        None => true,
    };

    if needs_init {
        *state = Some(UacPrackState {
            cseq,
            rseq: rseq.wrapping_sub(1),
        });
    }

    let state = state.as_mut().unwrap();

    if rseq <= state.rseq {
        RseqDisposition::Duplicate
    } else if rseq != state.rseq + 1 {
        RseqDisposition::OutOfOrder {
            expected: state.rseq + 1,
        }
    } else {
        state.rseq = rseq;

        RseqDisposition::Acknowledge(rseq)
    }
}

/// RSeq of a provisional response that asks to be acknowledged, i.e. one
/// carrying `Require: 100rel`
pub(crate) fn rseq_of(response: &TsxResponse) -> Option<u32> {
    let requires = match response.headers.try_get_named::<Vec<Require>>() {
        Some(Ok(requires)) => requires,
        _ => return None,
    };

    if !requires.iter().any(|r| r.0 == "100rel") {
        return None;
    }

    response.headers.get_named::<RSeq>().ok().map(|rseq| rseq.0)
}

/// Build the PRACK acknowledging `rseq` of the given response
pub(crate) fn create_prack(dialog: &Dialog, response: &TsxResponse, rseq: u32) -> Request {
    let mut request = dialog.create_request(Method::PRACK);

    request.headers.insert_named(&RAck {
        rack: rseq,
        cseq: response.base_headers.cseq.cseq,
        method: Method::INVITE,
    });

    request
}

/// Send a PRACK inside the dialog and wait for its final response
pub(crate) async fn send_prack(
    dialog: &Dialog,
    request: Request,
) -> Result<TsxResponse, sip_core::Error> {
    let mut target_tp_info = dialog.target_tp_info.lock().await;

    let mut transaction = dialog
        .endpoint
        .send_request(request, &mut target_tp_info)
        .await?;

    drop(target_tp_info);

    transaction.receive_final().await
}

/// 481, 408, a transaction timeout or a transport error on the PRACK are
/// fatal for the whole dialog (RFC 3262 section 4)
pub(crate) fn prack_result_is_fatal(result: &Result<TsxResponse, sip_core::Error>) -> bool {
    match result {
        Ok(response) => {
            response.line.code == StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST
                || response.line.code == StatusCode::REQUEST_TIMEOUT
        }
        Err(sip_core::Error::RequestTimedOut) => true,
        Err(sip_core::Error::Io(_)) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_reliable_provisional_initializes_state() {
        let mut state = None;

        assert_eq!(
            classify_rseq(&mut state, 10, 7),
            RseqDisposition::Acknowledge(7)
        );
    }

    #[test]
    fn in_sequence_rseq_is_acknowledged() {
        let mut state = None;

        classify_rseq(&mut state, 10, 1);

        assert_eq!(
            classify_rseq(&mut state, 10, 2),
            RseqDisposition::Acknowledge(2)
        );
    }

    #[test]
    fn retransmissions_are_dropped_silently() {
        let mut state = None;

        classify_rseq(&mut state, 10, 3);

        assert_eq!(classify_rseq(&mut state, 10, 3), RseqDisposition::Duplicate);
        assert_eq!(classify_rseq(&mut state, 10, 2), RseqDisposition::Duplicate);
    }

    #[test]
    fn rseq_jump_is_not_acknowledged() {
        let mut state = None;

        classify_rseq(&mut state, 10, 2);

        // expecting 3, got 5
        assert_eq!(
            classify_rseq(&mut state, 10, 5),
            RseqDisposition::OutOfOrder { expected: 3 }
        );

        // state must be unchanged by the out-of-order response
        assert_eq!(
            classify_rseq(&mut state, 10, 3),
            RseqDisposition::Acknowledge(3)
        );
    }

    #[test]
    fn new_invite_transaction_resets_the_state() {
        let mut state = None;

        classify_rseq(&mut state, 10, 5);

        // re-INVITE on the same dialog starts a fresh RSeq space
        assert_eq!(
            classify_rseq(&mut state, 11, 1),
            RseqDisposition::Acknowledge(1)
        );
    }
}

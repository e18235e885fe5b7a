//! Reliable provisional responses (RFC 3262)
//!
//! Dual-role engine attached to every INVITE session:
//!
//! - The UAS half sequences outbound reliable provisionals through a
//!   per-session transmission queue, retransmits the head entry on the T1
//!   backoff schedule until a matching PRACK arrives and gates final 2xx
//!   responses behind unacknowledged SDP-bearing provisionals.
//! - The UAC half validates the RSeq numbering of incoming reliable
//!   provisionals and generates the matching PRACK requests.
//!
//! There is no free-standing event dispatcher; the transaction events this
//! engine cares about are picked up where they surface in this stack:
//! in-dialog PRACK requests inside [`InviteUsage`](crate::invite), reliable
//! 1xx responses in the initiator's receive paths, and the PRACK's final
//! response where the request is sent.

mod uac;
mod uas;

pub(crate) use uac::{
    RseqDisposition, UacPrackState, classify_rseq, create_prack, prack_result_is_fatal, rseq_of,
    send_prack,
};
pub(crate) use uas::{
    FinalGate, UasRelState, clear_uas_state, gate_final, handle_prack, send_reliable,
    uas_state_is_idle,
};

use crate::media::MediaError;
use sip_types::StatusCode;
use sip_types::header::HeaderError;

pub type Result<T, E = CallError> = std::result::Result<T, E>;

/// Error returned by the public call operations of [`CallAgent`](crate::CallAgent).
///
/// A non-success result means the operation had no observable effect on the
/// call, except for send failures after the request was already built, in
/// which case the call is torn down.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("all call slots are in use")]
    TooManyCalls,

    /// Could not acquire the agent and call locks within the retry budget.
    /// Usually diagnoses a deadlock between application threads and the
    /// SIP event tasks.
    #[error("timed out acquiring call lock")]
    TimedOut,

    #[error("call has already been terminated")]
    SessionTerminated,

    #[error("operation is not valid in the current session state")]
    SessionState,

    #[error("operation is not valid for this call")]
    InvalidOp,

    #[error("constructed URI would exceed the maximum URI length")]
    UriTooLong,

    #[error("peer answered with status {0:?}")]
    PeerStatus(StatusCode),

    #[error("SDP could not be parsed or validated")]
    BadSdp,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Core(#[from] sip_core::Error),
}

impl From<HeaderError> for CallError {
    fn from(e: HeaderError) -> Self {
        CallError::Core(e.into())
    }
}

impl From<crate::invite::acceptor::Error> for CallError {
    fn from(e: crate::invite::acceptor::Error) -> Self {
        use crate::invite::acceptor::Error;

        match e {
            Error::Core(e) => CallError::Core(e),
            Error::RequestTerminated => CallError::SessionTerminated,
            Error::CSeqMismatch => CallError::InvalidOp,
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(e: std::io::Error) -> Self {
        CallError::Core(e.into())
    }
}

use bytesstr::BytesStr;
use sip_core::IncomingRequest;
use sip_types::header::typed::Replaces;

/// Identifies a dialog from the point of view of this endpoint
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DialogKey {
    pub call_id: BytesStr,
    pub peer_tag: Option<BytesStr>,
    pub local_tag: BytesStr,
}

impl DialogKey {
    pub(crate) fn from_incoming(request: &IncomingRequest) -> Option<Self> {
        let base_headers = &request.base_headers;

        Some(Self {
            call_id: base_headers.call_id.0.clone(),
            peer_tag: base_headers.from.tag.clone(),
            local_tag: base_headers.to.tag.clone()?,
        })
    }

    /// Key of the dialog a `Replaces` header points at.
    ///
    /// The header names the dialog from the recipient's perspective, so its
    /// to-tag is our local tag and its from-tag the peer's.
    pub fn for_replaces(replaces: &Replaces) -> Self {
        Self {
            call_id: replaces.call_id.clone(),
            peer_tag: Some(replaces.from_tag.clone()),
            local_tag: replaces.to_tag.clone(),
        }
    }
}

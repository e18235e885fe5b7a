use crate::invite::session::Role;
use sdp_types::{Connection, Direction, SessionDescription, TaggedAddress, TransportProtocol};
use sip_types::StatusCode;
use std::net::Ipv4Addr;

/// Signaling security of a call, derived from the target URI and transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecureLevel {
    /// Plain signaling
    None,
    /// TLS on the first hop
    Hop,
    /// End-to-end secure signaling (sips:)
    EndToEnd,
}

/// Error surfaced by the media engine, carries the SIP status the signaling
/// side should answer with when the error aborts an INVITE.
#[derive(Debug, thiserror::Error)]
#[error("media: {message}")]
pub struct MediaError {
    pub status: StatusCode,
    pub message: String,
}

impl MediaError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// RTP send state preserved across renegotiations of a call, so a
/// restarted stream continues the SSRC, sequence number and timestamp
/// space of its predecessor
#[derive(Debug, Clone, Copy)]
pub struct RtpContinuity {
    pub ssrc: u32,
    pub tx_seq: u16,
    pub tx_ts: u32,

    /// `tx_seq`/`tx_ts` hold the state of a previously stopped stream
    pub set: bool,
}

impl RtpContinuity {
    pub(crate) fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            tx_seq: 0,
            tx_ts: 0,
            set: false,
        }
    }
}

/// Interface of the external media engine, one session per call.
///
/// The call control drives this through the SDP offer/answer transitions of
/// the INVITE session and tears it down when the call disconnects.
#[async_trait::async_trait]
pub trait MediaSession: Send {
    /// Create a fresh local SDP (initial offer, re-INVITE offer or the base
    /// of a hold offer)
    async fn create_sdp_offer(&mut self) -> Result<SessionDescription, MediaError>;

    /// Produce a candidate answer for a received offer
    async fn create_sdp_answer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, MediaError>;

    /// (Re)start the streams with the negotiated session descriptions.
    ///
    /// `rtp` carries the send state of the previous stream of this call
    /// and must be updated with the state of the started one.
    async fn start(
        &mut self,
        local: &SessionDescription,
        remote: &SessionDescription,
        rtp: &mut RtpContinuity,
    ) -> Result<(), MediaError>;

    /// Stop all streams, the session is being discarded
    async fn stop(&mut self);

    /// Audio mixer slot the started stream is connected to, if any
    fn conf_slot(&self) -> Option<usize> {
        None
    }

    /// Send DTMF digits on the established stream
    async fn dial_dtmf(&mut self, digits: &str) -> Result<(), MediaError>;
}

/// Creates [`MediaSession`]s, implemented by the application's media engine
pub trait MediaFactory: Send + Sync + 'static {
    fn create_session(
        &self,
        role: Role,
        secure_level: SecureLevel,
    ) -> Result<Box<dyn MediaSession>, MediaError>;
}

/// Set the hold direction on a fresh local SDP.
///
/// Hold is signaled by `sendonly` when media currently flows both ways and
/// by `inactive` otherwise. A stream that is already `sendonly` is left
/// untouched. (RFC 3264 section 8.4, RFC 4317 section 3.1)
pub(crate) fn apply_hold(sdp: &mut SessionDescription, current_dir: Direction) {
    if current_dir == Direction::SendOnly {
        return;
    }

    let dir = if current_dir == Direction::SendRecv {
        Direction::SendOnly
    } else {
        Direction::Inactive
    };

    if let Some(media) = sdp.media_descriptions.first_mut() {
        media.direction = dir;
    }
}

/// Force the answer of a held call back to `sendonly`
pub(crate) fn apply_hold_to_answer(answer: &mut SessionDescription) {
    if let Some(media) = answer.media_descriptions.first_mut() {
        media.direction = Direction::SendOnly;
    }
}

fn is_zero_address(address: &TaggedAddress) -> bool {
    match address {
        TaggedAddress::IP4(addr) => addr.is_unspecified(),
        TaggedAddress::IP4FQDN(host) => *host == "0",
        TaggedAddress::IP6(addr) => addr.is_unspecified(),
        TaggedAddress::IP6FQDN(_) => false,
    }
}

/// An offer with a zeroed connection address (old-style hold) is answered
/// with a zeroed connection address as well
pub(crate) fn mirror_zero_connection(offer: &SessionDescription, answer: &mut SessionDescription) {
    let offer_conn = offer
        .media_descriptions
        .first()
        .and_then(|media| media.connection.as_ref())
        .or(offer.connection.as_ref());

    let Some(offer_conn) = offer_conn else {
        return;
    };

    if is_zero_address(&offer_conn.address) {
        answer.connection = Some(Connection {
            address: TaggedAddress::IP4(Ipv4Addr::UNSPECIFIED),
            ttl: None,
            num: None,
        });
    }
}

/// Bump the offer's origin version to one above the currently active local
/// SDP so the peer treats it as a new session version
pub(crate) fn bump_sdp_version(sdp: &mut SessionDescription, active_local: Option<&SessionDescription>) {
    let Some(active) = active_local else {
        return;
    };

    let version = active
        .origin
        .session_version
        .parse::<u64>()
        .unwrap_or_default();

    sdp.origin.session_version = (version + 1).to_string().into();
}

/// SRTP policy a peer advertises through its SDP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SrtpUse {
    /// No keying material offered
    #[default]
    Disabled,
    /// Keying material on a plain RTP profile
    Optional,
    /// Secure RTP profile, SRTP is mandatory
    Mandatory,
}

/// Derive the peer's SRTP policy from its session description
pub(crate) fn remote_srtp_use(sdp: &SessionDescription) -> SrtpUse {
    let Some(media) = sdp.media_descriptions.first() else {
        return SrtpUse::Disabled;
    };

    let secure_profile = matches!(
        media.media.proto,
        TransportProtocol::RtpSavp
            | TransportProtocol::RtpSavpf
            | TransportProtocol::UdpTlsRtpSavp
            | TransportProtocol::UdpTlsRtpSavpf
    );

    if secure_profile {
        SrtpUse::Mandatory
    } else if !media.crypto.is_empty() {
        SrtpUse::Optional
    } else {
        SrtpUse::Disabled
    }
}

/// Remote NAT classification advertised in the SDP (`a=X-nat:<digit> ...`)
pub(crate) fn remote_nat_type(sdp: &SessionDescription) -> Option<u8> {
    let value = sdp
        .attributes
        .iter()
        .find(|attr| attr.name.eq_ignore_ascii_case("X-nat"))?
        .value
        .as_ref()?;

    let first = *value.as_bytes().first()?;

    first.is_ascii_digit().then(|| first - b'0')
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;

    fn parse_sdp(sdp: &str) -> SessionDescription {
        SessionDescription::parse(&BytesStr::from(sdp)).unwrap()
    }

    fn audio_sdp(direction: &str) -> SessionDescription {
        parse_sdp(&format!(
            "v=0\r\n\
             o=- 1 1 IN IP4 192.0.2.1\r\n\
             s=-\r\n\
             c=IN IP4 192.0.2.1\r\n\
             t=0 0\r\n\
             m=audio 4000 RTP/AVP 0\r\n\
             a={direction}\r\n"
        ))
    }

    #[test]
    fn hold_sendrecv_becomes_sendonly() {
        let mut sdp = audio_sdp("sendrecv");
        apply_hold(&mut sdp, Direction::SendRecv);
        assert_eq!(sdp.media_descriptions[0].direction, Direction::SendOnly);
    }

    #[test]
    fn hold_recvonly_becomes_inactive() {
        let mut sdp = audio_sdp("recvonly");
        apply_hold(&mut sdp, Direction::RecvOnly);
        assert_eq!(sdp.media_descriptions[0].direction, Direction::Inactive);
    }

    #[test]
    fn hold_keeps_sendonly() {
        let mut sdp = audio_sdp("sendonly");
        apply_hold(&mut sdp, Direction::SendOnly);
        assert_eq!(sdp.media_descriptions[0].direction, Direction::SendOnly);
    }

    #[test]
    fn zero_connection_is_mirrored() {
        let offer = parse_sdp(
            "v=0\r\n\
             o=- 1 1 IN IP4 192.0.2.1\r\n\
             s=-\r\n\
             c=IN IP4 0.0.0.0\r\n\
             t=0 0\r\n\
             m=audio 4000 RTP/AVP 0\r\n",
        );

        let mut answer = audio_sdp("sendrecv");
        mirror_zero_connection(&offer, &mut answer);

        assert!(matches!(
            answer.connection.as_ref().unwrap().address,
            TaggedAddress::IP4(addr) if addr.is_unspecified()
        ));
    }

    #[test]
    fn version_bump_follows_active_local() {
        let active = audio_sdp("sendrecv");
        let mut offer = audio_sdp("sendrecv");

        bump_sdp_version(&mut offer, Some(&active));

        assert_eq!(offer.origin.session_version, "2");
    }

    #[test]
    fn srtp_use_from_profile_and_crypto() {
        let plain = audio_sdp("sendrecv");
        assert_eq!(remote_srtp_use(&plain), SrtpUse::Disabled);

        let savp = parse_sdp(
            "v=0\r\n\
             o=- 1 1 IN IP4 192.0.2.1\r\n\
             s=-\r\n\
             c=IN IP4 192.0.2.1\r\n\
             t=0 0\r\n\
             m=audio 4000 RTP/SAVP 0\r\n",
        );
        assert_eq!(remote_srtp_use(&savp), SrtpUse::Mandatory);
    }

    #[test]
    fn nat_type_attribute() {
        let mut sdp = audio_sdp("sendrecv");
        sdp.attributes.push(sdp_types::UnknownAttribute {
            name: "X-nat".into(),
            value: Some("5 (Port restricted)".into()),
        });

        assert_eq!(remote_nat_type(&sdp), Some(5));
    }
}

use crate::media::SecureLevel;
use sip_auth::DigestCredentials;
use sip_core::transport::TargetTransportInfo;
use sip_types::header::typed::{Contact, Routing};
use sip_types::uri::{NameAddr, SipUri};

pub type AccountId = usize;

/// Identity a call is made (or received) with.
///
/// The registration/credential management itself lives outside this crate;
/// the call engine only consumes the resulting identity, route set and
/// credential store.
pub struct Account {
    /// Identity used in the From header of outgoing calls
    pub id: NameAddr,

    /// Contact bound to this account
    pub contact: Contact,

    /// Outbound proxy route set applied to dialogs of this account
    pub route_set: Vec<Routing>,

    /// Digest credentials for answering challenges
    pub credentials: Option<DigestCredentials>,

    /// Demand reliable provisional responses on calls of this account
    pub require_100rel: bool,

    /// Transport the account is locked to, `None` selects per request
    pub transport: Option<TargetTransportInfo>,
}

impl Account {
    pub fn new(id: NameAddr, contact: Contact) -> Self {
        Self {
            id,
            contact,
            route_set: Vec::new(),
            credentials: None,
            require_100rel: false,
            transport: None,
        }
    }

    /// Signaling secure level toward `target`:
    /// end-to-end for sips targets, hop-secure when the first hop (either
    /// the account's first route or the target itself) uses TLS.
    pub(crate) fn secure_level(&self, target: &SipUri) -> SecureLevel {
        if target.sips {
            return SecureLevel::EndToEnd;
        }

        let uses_tls = |uri: &SipUri| {
            uri.uri_params
                .get_val("transport")
                .is_some_and(|transport| transport.eq_ignore_ascii_case("tls"))
        };

        let first_hop_tls = match self.route_set.first() {
            Some(route) => uses_tls(&route.uri.uri),
            None => uses_tls(target),
        };

        if first_hop_tls {
            SecureLevel::Hop
        } else {
            SecureLevel::None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::uri::params::Params;

    fn account() -> Account {
        let uri: SipUri = "sip:alice@example.org".parse().unwrap();

        Account::new(
            NameAddr::uri(uri.clone()),
            Contact::new(NameAddr::uri(uri)),
        )
    }

    #[test]
    fn sips_target_is_end_to_end_secure() {
        let target: SipUri = "sips:bob@example.org".parse().unwrap();

        assert_eq!(account().secure_level(&target), SecureLevel::EndToEnd);
    }

    #[test]
    fn tls_transport_param_is_hop_secure() {
        let target: SipUri = "sip:bob@example.org;transport=tls".parse().unwrap();

        assert_eq!(account().secure_level(&target), SecureLevel::Hop);
    }

    #[test]
    fn plain_target_is_insecure() {
        let target: SipUri = "sip:bob@example.org".parse().unwrap();

        assert_eq!(account().secure_level(&target), SecureLevel::None);
    }

    #[test]
    fn route_set_decides_over_target() {
        let mut account = account();

        let proxy: SipUri = "sip:proxy.example.org;transport=tls".parse().unwrap();
        account.route_set.push(Routing {
            uri: NameAddr::uri(proxy),
            params: Params::new(),
        });

        // target itself is insecure, the first hop is not
        let target: SipUri = "sip:bob@example.org".parse().unwrap();

        assert_eq!(account.secure_level(&target), SecureLevel::Hop);
    }
}

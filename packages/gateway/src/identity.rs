//! Deterministic thread identity derived from inbound routing fields.

use flint_error::GatewayError;
use serde_json::Value;

use crate::inbound::{InboundMessage, RoutingMode};

/// Cross-channel identity links: each canonical id owns a set of tokens
/// matched against `peerId` and `channel:peerId`. Insertion order decides
/// which canonical wins when several match.
#[derive(Debug, Clone, Default)]
pub struct IdentityLinks {
    links: Vec<(String, Vec<String>)>,
}

impl IdentityLinks {
    pub fn new(links: Vec<(String, Vec<String>)>) -> Self {
        Self { links }
    }

    /// Parses the `{canonical: [token, ...]}` JSON map form used by
    /// `FLINT_GATEWAY_IDENTITY_LINKS` and the settings file.
    pub fn from_value(value: &Value) -> Result<Self, GatewayError> {
        let object = value.as_object().ok_or_else(|| GatewayError::Settings {
            message: "identity links must be a JSON object".to_string(),
        })?;
        let mut links = Vec::with_capacity(object.len());
        for (canonical, tokens) in object {
            let tokens = tokens
                .as_array()
                .ok_or_else(|| GatewayError::Settings {
                    message: format!("identity link {canonical} must map to an array of tokens"),
                })?
                .iter()
                .map(|token| {
                    token
                        .as_str()
                        .map(|token| token.trim().to_lowercase())
                        .ok_or_else(|| GatewayError::Settings {
                            message: format!("identity link {canonical} has a non-string token"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            links.push((canonical.trim().to_lowercase(), tokens));
        }
        Ok(Self { links })
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn lookup(&self, channel: &str, peer_id: &str) -> Option<&str> {
        let scoped = format!("{channel}:{peer_id}");
        for (canonical, tokens) in &self.links {
            if tokens
                .iter()
                .any(|token| token == peer_id || token == &scoped)
            {
                return Some(canonical);
            }
        }
        None
    }
}

/// Pure function of the routing fields: equal normalized inputs always
/// produce equal thread ids.
pub fn resolve_thread_id(
    message: &InboundMessage,
    routing_mode: RoutingMode,
    links: &IdentityLinks,
) -> String {
    let channel = message.channel.trim().to_lowercase();
    let account_id = message
        .account_id
        .as_deref()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "default".to_string());
    let peer_id = message
        .peer_id
        .as_deref()
        .or(Some(message.user_id.as_str()))
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let chat_type = message.chat_type();
    if chat_type.is_room() {
        let mut id = format!("agent:main:{channel}:{}:{peer_id}", chat_type.as_str());
        if let Some(thread) = message.channel_thread_id.as_deref() {
            id.push_str(":thread:");
            id.push_str(thread);
        }
        return id;
    }

    let principal = message
        .identity_id
        .as_deref()
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty())
        .or_else(|| links.lookup(&channel, &peer_id).map(str::to_string))
        .unwrap_or(peer_id);

    let mut id = match routing_mode {
        RoutingMode::Main => return "agent:main:main".to_string(),
        RoutingMode::PerPeer => return format!("agent:main:direct:{principal}"),
        RoutingMode::PerChannelPeer => format!("agent:main:{channel}:direct:{principal}"),
        RoutingMode::PerAccountChannelPeer => {
            format!("agent:main:{channel}:{account_id}:direct:{principal}")
        }
    };
    if let Some(thread) = message.channel_thread_id.as_deref() {
        id.push_str(":thread:");
        id.push_str(thread);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::ChatType;

    fn direct(peer_id: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            user_id: "u".into(),
            text: "x".into(),
            chat_type: Some(ChatType::Direct),
            peer_id: Some(peer_id.into()),
            ..Default::default()
        }
    }

    #[test]
    fn per_peer_uses_peer_id() {
        let id = resolve_thread_id(
            &direct("1234"),
            RoutingMode::PerPeer,
            &IdentityLinks::default(),
        );
        assert_eq!(id, "agent:main:direct:1234");
    }

    #[test]
    fn peer_id_falls_back_to_user_id_then_unknown() {
        let mut message = direct("1234");
        message.peer_id = None;
        let id = resolve_thread_id(&message, RoutingMode::PerPeer, &IdentityLinks::default());
        assert_eq!(id, "agent:main:direct:u");

        message.user_id = "  ".into();
        let id = resolve_thread_id(&message, RoutingMode::PerPeer, &IdentityLinks::default());
        assert_eq!(id, "agent:main:direct:unknown");
    }

    #[test]
    fn identity_link_collapses_cross_channel_peers() {
        let links = IdentityLinks::new(vec![(
            "nader".into(),
            vec!["telegram:peer-1".into(), "slack:U99".into()],
        )]);
        let id = resolve_thread_id(&direct("peer-1"), RoutingMode::PerPeer, &links);
        assert_eq!(id, "agent:main:direct:nader");
    }

    #[test]
    fn explicit_identity_id_beats_links() {
        let links = IdentityLinks::new(vec![("nader".into(), vec!["peer-1".into()])]);
        let mut message = direct("peer-1");
        message.identity_id = Some("franz".into());
        let id = resolve_thread_id(&message, RoutingMode::PerPeer, &links);
        assert_eq!(id, "agent:main:direct:franz");
    }

    #[test]
    fn first_matching_canonical_wins() {
        let links = IdentityLinks::new(vec![
            ("first".into(), vec!["peer-1".into()]),
            ("second".into(), vec!["peer-1".into()]),
        ]);
        let id = resolve_thread_id(&direct("peer-1"), RoutingMode::PerPeer, &links);
        assert_eq!(id, "agent:main:direct:first");
    }

    #[test]
    fn room_chats_ignore_routing_mode() {
        let mut message = direct("peer-1");
        message.chat_type = Some(ChatType::Group);
        message.channel_thread_id = Some("t-9".into());
        for mode in [
            RoutingMode::Main,
            RoutingMode::PerPeer,
            RoutingMode::PerChannelPeer,
            RoutingMode::PerAccountChannelPeer,
        ] {
            let id = resolve_thread_id(&message, mode, &IdentityLinks::default());
            assert_eq!(id, "agent:main:telegram:group:peer-1:thread:t-9");
        }
    }

    #[test]
    fn account_scoped_mode_defaults_account() {
        let mut message = direct("peer-1");
        message.channel_thread_id = Some("t-1".into());
        let id = resolve_thread_id(
            &message,
            RoutingMode::PerAccountChannelPeer,
            &IdentityLinks::default(),
        );
        assert_eq!(id, "agent:main:telegram:default:direct:peer-1:thread:t-1");
    }

    #[test]
    fn main_mode_is_a_single_mailbox() {
        let id = resolve_thread_id(
            &direct("anyone"),
            RoutingMode::Main,
            &IdentityLinks::default(),
        );
        assert_eq!(id, "agent:main:main");
    }
}

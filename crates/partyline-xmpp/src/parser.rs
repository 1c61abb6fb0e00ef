//! Stanza codec for the XMPP stream.
//!
//! Clients deliver stanzas in raw socket chunks with no framing beyond
//! the XML itself, and a single chunk may carry several stanzas with no
//! enclosing document. Decoding wraps the chunk in a synthetic container
//! element so minidom can parse it as one document, then maps each child
//! to a typed stanza in order. A chunk that fails to parse yields an
//! empty batch; malformed input is never connection-fatal.

use minidom::Element;
use tracing::debug;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Ping namespace (XEP-0199)
    pub const PING: &str = "urn:xmpp:ping";
}

/// A decoded inbound stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// STARTTLS request
    StartTls,
    /// SASL auth with the base64 payload text
    Auth { payload: String },
    /// IQ stanza
    Iq(IqStanza),
    /// Presence stanza
    Presence(PresenceStanza),
    /// Message stanza
    Message(MessageStanza),
    /// Anything else; recognized but not routed
    Other { name: String },
}

/// Decoded `<iq>` stanza.
#[derive(Debug, Clone, Default)]
pub struct IqStanza {
    /// The 'id' attribute, echoed back in results
    pub id: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'type' attribute (get/set/result/error)
    pub iq_type: Option<String>,
    /// The recognized child payload
    pub kind: IqKind,
}

/// Recognized IQ payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IqKind {
    /// Resource binding request, with the optional requested resource
    Bind { resource: Option<String> },
    /// Session establishment
    Session,
    /// XEP-0199 ping
    Ping,
    /// Unknown payload; still acknowledged with a bare result
    #[default]
    Other,
}

/// Decoded `<presence>` stanza.
#[derive(Debug, Clone, Default)]
pub struct PresenceStanza {
    /// The 'to' attribute
    pub to: Option<String>,
    /// The 'type' attribute ('unavailable' is the one that matters)
    pub presence_type: Option<String>,
    /// `<show>` child text
    pub show: Option<String>,
    /// `<status>` child text (opaque payload, often JSON)
    pub status: Option<String>,
}

impl PresenceStanza {
    /// Whether this is an explicit unavailable presence.
    pub fn is_unavailable(&self) -> bool {
        self.presence_type.as_deref() == Some("unavailable")
    }
}

/// Decoded `<message>` stanza.
#[derive(Debug, Clone, Default)]
pub struct MessageStanza {
    /// The 'to' attribute
    pub to: Option<String>,
    /// The 'type' attribute, preserved on direct delivery
    pub message_type: Option<String>,
    /// `<body>` child text
    pub body: Option<String>,
}

/// Decode a raw chunk into an ordered batch of stanzas.
///
/// Strips any XML prologue and stream-open tags before wrapping; the
/// caller handles stream restarts separately, so those are noise here.
/// Returns an empty batch on any parse failure.
pub fn decode_chunk(chunk: &str) -> Vec<Stanza> {
    let sanitized = sanitize(chunk);
    if sanitized.trim().is_empty() {
        return Vec::new();
    }

    let wrapped = format!(
        "<batch xmlns='{}' xmlns:stream='{}'>{}</batch>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        sanitized
    );

    let root: Element = match wrapped.parse() {
        Ok(el) => el,
        Err(e) => {
            debug!(error = %e, "Discarding unparseable chunk");
            return Vec::new();
        }
    };

    root.children().map(decode_element).collect()
}

/// Remove the XML prologue and any (unclosed) stream-open tag so the
/// remainder is a well-formed sequence of elements.
fn sanitize(chunk: &str) -> String {
    let mut out = String::with_capacity(chunk.len());
    let mut rest = chunk;

    loop {
        let prologue = rest.find("<?xml");
        let stream_open = rest.find("<stream:stream");

        let cut = match (prologue, stream_open) {
            (Some(p), Some(s)) => p.min(s),
            (Some(p), None) => p,
            (None, Some(s)) => s,
            (None, None) => break,
        };

        out.push_str(&rest[..cut]);
        match rest[cut..].find('>') {
            Some(end) => rest = &rest[cut + end + 1..],
            None => return out, // truncated tag, drop the tail
        }
    }

    out.push_str(rest);
    out
}

fn decode_element(el: &Element) -> Stanza {
    match el.name() {
        "starttls" => Stanza::StartTls,
        "auth" => Stanza::Auth {
            payload: el.text().trim().to_string(),
        },
        "iq" => Stanza::Iq(decode_iq(el)),
        "presence" => Stanza::Presence(decode_presence(el)),
        "message" => Stanza::Message(decode_message(el)),
        other => Stanza::Other {
            name: other.to_string(),
        },
    }
}

fn decode_iq(el: &Element) -> IqStanza {
    let kind = if let Some(bind) = el.get_child("bind", ns::BIND) {
        IqKind::Bind {
            resource: bind
                .get_child("resource", ns::BIND)
                .map(|r| r.text().trim().to_string())
                .filter(|r| !r.is_empty()),
        }
    } else if el.get_child("session", ns::SESSION).is_some() {
        IqKind::Session
    } else if el.get_child("ping", ns::PING).is_some() {
        IqKind::Ping
    } else {
        IqKind::Other
    };

    IqStanza {
        id: el.attr("id").map(str::to_string),
        from: el.attr("from").map(str::to_string),
        iq_type: el.attr("type").map(str::to_string),
        kind,
    }
}

fn decode_presence(el: &Element) -> PresenceStanza {
    PresenceStanza {
        to: el.attr("to").map(str::to_string),
        presence_type: el.attr("type").map(str::to_string),
        show: el
            .get_child("show", ns::JABBER_CLIENT)
            .map(|c| c.text().trim().to_string()),
        status: el
            .get_child("status", ns::JABBER_CLIENT)
            .map(|c| c.text().to_string()),
    }
}

fn decode_message(el: &Element) -> MessageStanza {
    MessageStanza {
        to: el.attr("to").map(str::to_string),
        message_type: el.attr("type").map(str::to_string),
        body: el
            .get_child("body", ns::JABBER_CLIENT)
            .map(|c| c.text().to_string()),
    }
}

/// Escape text content for element bodies.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a value for a single-quoted attribute.
pub fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_presence() {
        let batch = decode_chunk("<presence><status>{}</status></presence>");
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Stanza::Presence(p) => assert_eq!(p.status.as_deref(), Some("{}")),
            other => panic!("Expected presence, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_multiple_stanzas_in_order() {
        let batch = decode_chunk(
            "<presence/><message to='bob@example.com'><body>hi</body></message><iq id='1'/>",
        );
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch[0], Stanza::Presence(_)));
        assert!(matches!(batch[1], Stanza::Message(_)));
        assert!(matches!(batch[2], Stanza::Iq(_)));
    }

    #[test]
    fn test_malformed_chunk_yields_empty_batch() {
        assert!(decode_chunk("<presence><status>oops</presence>").is_empty());
        assert!(decode_chunk("not xml at all < >").is_empty());
    }

    #[test]
    fn test_prologue_and_stream_open_are_stripped() {
        let chunk = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                     xmlns:stream='http://etherx.jabber.org/streams' to='example.com' \
                     version='1.0'><presence/>";
        let batch = decode_chunk(chunk);
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], Stanza::Presence(_)));
    }

    #[test]
    fn test_decode_auth_payload() {
        let batch = decode_chunk(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHNlY3JldA==</auth>",
        );
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Stanza::Auth { payload } => assert_eq!(payload, "AGFsaWNlAHNlY3JldA=="),
            other => panic!("Expected auth, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_starttls() {
        let batch = decode_chunk("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], Stanza::StartTls));
    }

    #[test]
    fn test_decode_bind_iq() {
        let batch = decode_chunk(
            "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <resource>desktop</resource></bind></iq>",
        );
        match &batch[0] {
            Stanza::Iq(iq) => {
                assert_eq!(iq.id.as_deref(), Some("bind_1"));
                assert_eq!(
                    iq.kind,
                    IqKind::Bind {
                        resource: Some("desktop".to_string())
                    }
                );
            }
            other => panic!("Expected iq, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_ping_iq() {
        let batch =
            decode_chunk("<iq type='get' id='p1' from='a@b/c'><ping xmlns='urn:xmpp:ping'/></iq>");
        match &batch[0] {
            Stanza::Iq(iq) => assert_eq!(iq.kind, IqKind::Ping),
            other => panic!("Expected iq, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_element_is_other() {
        let batch = decode_chunk("<enable xmlns='urn:xmpp:sm:3'/>");
        match &batch[0] {
            Stanza::Other { name } => assert_eq!(name, "enable"),
            other => panic!("Expected other, got {:?}", other),
        }
    }

    #[test]
    fn test_escape_helpers() {
        assert_eq!(escape_text("a<b>&c"), "a&lt;b&gt;&amp;c");
        assert_eq!(escape_attr(r#"{"k":"v"}'"#), "{&quot;k&quot;:&quot;v&quot;}&apos;");
    }
}

//! End-to-end session tests over real TCP, driven through the degraded
//! (plaintext) STARTTLS path so no certificate material is needed.

use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use partyline_xmpp::{XmppServer, XmppServerConfig};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct TestClient {
    stream: TcpStream,
    buf: String,
    pos: usize,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = timeout(STEP_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self {
            stream,
            buf: String::new(),
            pos: 0,
        }
    }

    async fn send(&mut self, data: &str) {
        self.stream
            .write_all(data.as_bytes())
            .await
            .expect("write failed");
        self.stream.flush().await.expect("flush failed");
    }

    /// Read until `needle` appears past everything already consumed;
    /// returns the text up to and including the match.
    async fn expect(&mut self, needle: &str) -> String {
        timeout(STEP_TIMEOUT, async {
            loop {
                if let Some(found) = self.buf[self.pos..].find(needle) {
                    let end = self.pos + found + needle.len();
                    let consumed = self.buf[self.pos..end].to_string();
                    self.pos = end;
                    return consumed;
                }

                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.expect("read failed");
                assert!(n > 0, "connection closed while waiting for {:?}", needle);
                self.buf.push_str(&String::from_utf8_lossy(&chunk[..n]));
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}; buffered: {}", needle, self.buf))
    }

    /// Full handshake on the plaintext path: STARTTLS (degraded), SASL
    /// PLAIN, stream restart, bind.
    async fn establish(addr: std::net::SocketAddr, username: &str, resource: &str) -> Self {
        let mut client = Self::connect(addr).await;

        client.expect("<stream:stream").await;
        client.expect("<starttls").await;

        client
            .send("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .await;
        client.expect("<proceed").await;

        // Degraded mode: the upgraded greeting arrives in plaintext
        client.expect("<mechanism>PLAIN</mechanism>").await;

        let sasl = BASE64_STANDARD.encode(format!("\0{}\0secret", username));
        client
            .send(&format!(
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
                sasl
            ))
            .await;
        client.expect("<success").await;

        client
            .send(
                "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                 xmlns:stream='http://etherx.jabber.org/streams' to='test.local' version='1.0'>",
            )
            .await;
        client.expect("<bind").await;

        client
            .send(&format!(
                "<iq type='set' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <resource>{}</resource></bind></iq>",
                resource
            ))
            .await;
        client
            .expect(&format!("<jid>{}@test.local/{}</jid>", username, resource))
            .await;

        client
    }
}

async fn start_server() -> (Arc<XmppServer>, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");

    let server = Arc::new(XmppServer::new(XmppServerConfig {
        fallback_domain: "test.local".to_string(),
        ..Default::default()
    }));

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run(listener).await;
    });

    (server, addr)
}

#[tokio::test]
async fn full_session_presence_and_messaging() {
    let (server, addr) = start_server().await;

    let mut alice = TestClient::establish(addr, "alice", "r1").await;
    alice.send("<presence/>").await;

    // Second resource of a second user; its presence broadcast reaches
    // alice, and the late joiner gets alice's cached presence replayed.
    let mut bob = TestClient::establish(addr, "bob", "r2").await;
    bob.send("<presence/>").await;

    bob.expect("<presence from='alice@test.local/r1'/>").await;
    alice.expect("<presence from='bob@test.local/r2'/>").await;

    // Direct message, restamped per recipient resource
    alice
        .send("<message to='bob@test.local' type='chat'><body>hello bob</body></message>")
        .await;
    let msg = bob.expect("</message>").await;
    assert!(msg.contains("from='alice@test.local/r1'"));
    assert!(msg.contains("to='bob@test.local/r2'"));
    assert!(msg.contains("<body>hello bob</body>"));

    // Shutdown kicks authenticated clients with a stream error
    server.shutdown().await;
    alice.expect("<policy-violation").await;
    bob.expect("<policy-violation").await;
}

#[tokio::test]
async fn ping_and_unknown_iq_get_results() {
    let (_server, addr) = start_server().await;

    let mut client = TestClient::establish(addr, "carol", "app").await;

    client
        .send("<iq type='get' id='ping-1' from='carol@test.local/app'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await;
    let pong = client.expect("id='ping-1'").await;
    assert!(pong.contains("type='result'"));

    client.send("<iq type='set' id='mystery-9'><unknown/></iq>").await;
    let result = client.expect("id='mystery-9'").await;
    assert!(result.contains("type='result'"));
}

#[tokio::test]
async fn colon_username_authenticates_and_joins_party() {
    let (_server, addr) = start_server().await;

    // Platform metadata after the colon must survive authentication
    let mut alice = TestClient::establish(addr, "alice:pc:123", "r1").await;

    let status = r#"{"Status":"Lobby","Properties":[{"Name":"party.joininfodata.286331153","Type":"String","Value":"{\"partyId\":\"RAID77\"}"}]}"#;
    alice
        .send(&format!("<presence><status>{}</status></presence>", status))
        .await;

    let mut bob = TestClient::establish(addr, "bob", "r2").await;
    bob.send("<presence to='party-raid77@muc.test.local/bobby'/>")
        .await;

    // Bob's own join echo, and alice sees him arrive under her full
    // colon-bearing occupant identity already in the room
    bob.expect("<presence from='party-raid77@muc.test.local/bobby'/>")
        .await;
    alice
        .expect("<presence from='party-raid77@muc.test.local/bobby'/>")
        .await;

    // Group fan-out includes the sender; the nickname is the base
    // username joined with the resource
    alice
        .send("<message to='party-raid77@muc.test.local' type='groupchat'><body>push mid</body></message>")
        .await;
    for client in [&mut alice, &mut bob] {
        let msg = client.expect("</message>").await;
        assert!(msg.contains("from='party-raid77@muc.test.local/alice:r1'"));
        assert!(msg.contains("type='groupchat'"));
        assert!(msg.contains("<body>push mid</body>"));
    }
}

#[tokio::test]
async fn presence_before_auth_is_dropped() {
    let (_server, addr) = start_server().await;

    let mut spectator = TestClient::establish(addr, "watcher", "w1").await;
    spectator.send("<presence/>").await;

    // An unauthenticated socket sends presence; nothing may reach the
    // online spectator.
    let mut lurker = TestClient::connect(addr).await;
    lurker.expect("<starttls").await;
    lurker.send("<presence/>").await;

    // A real event afterwards is the fence: if the lurker's presence
    // had been routed, it would have arrived first.
    let mut bob = TestClient::establish(addr, "bob", "b1").await;
    bob.send("<presence/>").await;

    let seen = spectator.expect("<presence from='bob@test.local/b1'/>").await;
    assert!(!seen.contains("lurker"));
}

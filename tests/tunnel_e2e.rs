//! End-to-end: a fake relay and a fake API server on loopback TCP, with the
//! real agent in between.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cluster_connector::error::Result;
use cluster_connector::identity::ClusterId;
use cluster_connector::tunnel::agent::{Agent, AgentOptions};
use cluster_connector::tunnel::client::{self, FLAP_WINDOW};
use cluster_connector::tunnel::connector::StubConnector;
use cluster_connector::tunnel::dial::TcpDialer;
use cluster_connector::tunnel::heartbeat::ClusterProbe;
use cluster_connector::tunnel::kube_proxy::{ApiTarget, BearerToken, KubernetesClientManager};
use cluster_connector::tunnel::meta::{AgentMeta, MetaSource};
use cluster_connector::tunnel::{accept_handshake, ChannelKind, Handshake, META_ACK};

const TOKEN: &[u8] = b"service-account-token";

struct Healthy;

#[async_trait]
impl ClusterProbe for Healthy {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

struct StaticMeta;

#[async_trait]
impl MetaSource for StaticMeta {
    async fn collect(&self) -> AgentMeta {
        AgentMeta {
            provider: "idc".into(),
            k8s_version: "1.31.0".into(),
            is_intranet: "false".into(),
            ..AgentMeta::default()
        }
    }
}

struct Channel {
    handshake: Handshake,
    identity: Option<ClusterId>,
    stream: TcpStream,
}

/// Accepts relay connections and reports each one after its handshake.
async fn fake_relay() -> (String, mpsc::UnboundedReceiver<Channel>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let (handshake, identity) = accept_handshake(&mut stream).await.unwrap();
            let channel = Channel {
                handshake,
                identity,
                stream,
            };
            if tx.send(channel).is_err() {
                return;
            }
        }
    });
    (addr, rx)
}

/// Acks every metadata upload until the channel closes.
fn ack_meta(mut stream: TcpStream, uploads: mpsc::UnboundedSender<AgentMeta>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if let Ok(meta) = serde_json::from_slice::<AgentMeta>(&buf[..n]) {
                let _ = uploads.send(meta);
            }
            if stream.write_all(META_ACK).await.is_err() {
                return;
            }
        }
    });
}

async fn read_head<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        head.push_str(&line);
        if line == "\r\n" || line.is_empty() {
            return head;
        }
    }
}

/// API server answering every request with a fixed JSON body and reporting
/// the request head it saw.
async fn fake_api_server() -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let head = read_head(&mut reader).await;
                let _ = tx.send(head);
                let body = r#"{"kind":"NamespaceList"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                    body.len()
                );
                reader.get_mut().write_all(response.as_bytes()).await.unwrap();
            });
        }
    });
    (addr, rx)
}

/// API server that switches every request to SPDY and echoes frames.
async fn fake_spdy_api_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                read_head(&mut reader).await;
                reader
                    .get_mut()
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n",
                    )
                    .await
                    .unwrap();
                let mut buf = vec![0u8; 1024];
                loop {
                    let n = match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if reader.get_mut().write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn agent(relay: &str, api: &str, tunnels: usize) -> Agent {
    let connector = StubConnector::new(
        Arc::new(TcpDialer::new(relay)),
        ClusterId::from_token(TOKEN),
    );
    let upstream = KubernetesClientManager::new(
        ApiTarget::parse(&format!("http://{api}")).unwrap(),
        Arc::new(TcpDialer::new(api)),
        Some(BearerToken::Static("sa-secret".into())),
    );
    let options = AgentOptions {
        tunnels_per_agent: tunnels,
        ..AgentOptions::default()
    };
    Agent::new(
        connector,
        upstream,
        Arc::new(Healthy),
        Arc::new(StaticMeta),
        options,
    )
}

async fn next(channels: &mut mpsc::UnboundedReceiver<Channel>) -> Channel {
    tokio::time::timeout(Duration::from_secs(10), channels.recv())
        .await
        .expect("relay saw no connection")
        .expect("relay stopped")
}

fn spdy_frame(payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap().to_be_bytes();
    let mut frame = vec![0x80, 0x03, 0x00, 0x08, 0x00, len[1], len[2], len[3]];
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test]
async fn test_session_round_trip() {
    let (relay_addr, mut channels) = fake_relay().await;
    let (api_addr, mut api_heads) = fake_api_server().await;
    let agent = agent(&relay_addr, &api_addr, 2);
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client::run(&agent, FLAP_WINDOW, &shutdown).await })
    };

    let expected_id = ClusterId::from_token(TOKEN);
    let mut requests = Vec::new();
    let mut meta_seen = false;
    let (uploads_tx, mut uploads) = mpsc::unbounded_channel();
    while requests.len() < 2 || !meta_seen {
        let channel = next(&mut channels).await;
        assert_eq!(channel.handshake.session_id, 0);
        assert_eq!(channel.identity, Some(expected_id));
        match channel.handshake.kind {
            ChannelKind::Request => requests.push(channel.stream),
            ChannelKind::Meta => {
                meta_seen = true;
                ack_meta(channel.stream, uploads_tx.clone());
            }
            ChannelKind::Session => panic!("unexpected session channel"),
        }
    }

    let meta = tokio::time::timeout(Duration::from_secs(10), uploads.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta.k8s_version, "1.31.0");

    requests[0]
        .write_all(b"GET /api/v1/namespaces?limit=5 HTTP/1.1\r\nHost: relay\r\nX-Tunnel-Session-ID: 7\r\n\r\n")
        .await
        .unwrap();

    let session = next(&mut channels).await;
    assert_eq!(session.handshake.kind, ChannelKind::Session);
    assert_eq!(session.handshake.session_id, 7);
    assert!(session.identity.is_none());

    let mut response = String::new();
    let mut stream = session.stream;
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: application/json\r\n"), "{response}");
    assert!(response.ends_with(r#"{"kind":"NamespaceList"}"#), "{response}");

    let head = api_heads.recv().await.unwrap();
    assert!(head.starts_with("GET /api/v1/namespaces?limit=5 HTTP/1.1\r\n"), "{head}");
    assert!(head.contains(&format!("Host: {api_addr}\r\n")), "{head}");
    assert!(head.contains("Authorization: Bearer sa-secret\r\n"), "{head}");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_upgraded_session_pipes_frames() {
    let (relay_addr, mut channels) = fake_relay().await;
    let api_addr = fake_spdy_api_server().await;
    let agent = agent(&relay_addr, &api_addr, 1);
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client::run(&agent, FLAP_WINDOW, &shutdown).await })
    };

    let (uploads_tx, _uploads) = mpsc::unbounded_channel();
    let mut request = None;
    let mut meta_seen = false;
    while request.is_none() || !meta_seen {
        let channel = next(&mut channels).await;
        match channel.handshake.kind {
            ChannelKind::Request => request = Some(channel.stream),
            ChannelKind::Meta => {
                meta_seen = true;
                ack_meta(channel.stream, uploads_tx.clone());
            }
            ChannelKind::Session => panic!("unexpected session channel"),
        }
    }
    let mut request = request.unwrap();
    request
        .write_all(
            b"POST /api/v1/namespaces/default/pods/web/exec?command=sh HTTP/1.1\r\n\
              Host: relay\r\n\
              Connection: Upgrade\r\n\
              Upgrade: SPDY/3.1\r\n\
              X-Stream-Protocol-Version: v4.channel.k8s.io\r\n\
              X-Tunnel-Session-ID: 42\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

    let session = next(&mut channels).await;
    assert_eq!(session.handshake.kind, ChannelKind::Session);
    assert_eq!(session.handshake.session_id, 42);

    let mut session = BufReader::new(session.stream);
    let head = read_head(&mut session).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Upgrade: SPDY/3.1\r\n"), "{head}");

    let frame = spdy_frame(b"stdin: ls -l");
    session.get_mut().write_all(&frame).await.unwrap();
    let mut echoed = vec![0u8; frame.len()];
    tokio::time::timeout(Duration::from_secs(10), session.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, frame);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_lost_meta_channel_reconnects_whole_set() {
    let (relay_addr, mut channels) = fake_relay().await;
    let (api_addr, _heads) = fake_api_server().await;
    let agent = agent(&relay_addr, &api_addr, 1);
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client::run(&agent, Duration::from_millis(1), &shutdown).await })
    };

    // First cycle: hang up on the meta channel.
    let mut first_request = None;
    loop {
        let channel = next(&mut channels).await;
        match channel.handshake.kind {
            ChannelKind::Request => first_request = Some(channel.stream),
            ChannelKind::Meta => {
                drop(channel.stream);
                break;
            }
            ChannelKind::Session => panic!("unexpected session channel"),
        }
    }

    // The request channel from the first cycle is closed by the agent.
    let mut rest = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(10),
        first_request.unwrap().read_to_end(&mut rest),
    )
    .await
    .unwrap()
    .unwrap();

    // A fresh request channel arrives for the second cycle.
    let channel = next(&mut channels).await;
    assert_eq!(channel.handshake.kind, ChannelKind::Request);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

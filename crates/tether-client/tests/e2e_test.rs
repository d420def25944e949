//! End-to-end client ↔ server tests.
//!
//! A real [`Service`] and a real [`ClientSession`] wired back-to-back over
//! in-process channels: one `Vec<u8>` per container, exactly what the GATT
//! and UDP transports carry. The server runs its receive path on a dedicated
//! thread (its dispatch worker is a second one), so these tests exercise the
//! same cross-thread pacing as a deployment.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tether_client::{
    ClientConfig, ClientError, ClientSession, ClientTransport, TransportError,
};
use tether_proto::ErrorCode;
use tether_server::{
    HandlerRegistry, Notify, NotifyError, ServerConfig, Service,
    handlers::{
        self, CounterStreamRequest, CounterStreamResponse, CounterUploadRequest,
        CounterUploadResponse, DataWriteRequest, DataWriteResponse, EchoRequest, EchoResponse,
        FlashReadRequest, FlashReadResponse, MemFlash,
    },
};

/// Server → client notification channel.
struct ChannelNotify {
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    mtu: u16,
}

impl Notify for ChannelNotify {
    fn notify(&self, frame: &[u8]) -> Result<(), NotifyError> {
        self.tx.send(frame.to_vec()).map_err(|_| NotifyError::NotConnected)
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

/// Client → server write channel.
struct ChannelWrite {
    tx: std::sync::mpsc::Sender<Vec<u8>>,
    mtu: u16,
}

impl ClientTransport for ChannelWrite {
    fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx.send(frame.to_vec()).map_err(|_| TransportError::Closed)
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

/// Wire a service and a client session together; both ends see `mtu`.
fn link(
    server_config: ServerConfig,
    client_config: ClientConfig,
    mtu: u16,
) -> Arc<ClientSession> {
    let (c2s_tx, c2s_rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let (s2c_tx, mut s2c_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();

    let mut registry = HandlerRegistry::new();
    let upload =
        handlers::install_defaults(&mut registry, Arc::new(MemFlash::new(64 * 1024)), 0);

    let transport = Arc::new(ChannelNotify { tx: s2c_tx, mtu });
    let mut service = Service::new(server_config, transport, registry).unwrap();
    let handle = service.handle();
    service.set_stream_end_handler(upload.stream_end_responder(handle));
    service.connection_opened();

    std::thread::spawn(move || {
        while let Ok(frame) = c2s_rx.recv() {
            service.on_frame(&frame);
        }
    });

    let session = Arc::new(ClientSession::new(
        Arc::new(ChannelWrite { tx: c2s_tx, mtu }),
        client_config,
    ));
    let pump = session.clone();
    tokio::spawn(async move {
        while let Some(frame) = s2c_rx.recv().await {
            pump.handle_notification(&frame);
        }
    });

    session
}

fn cbor<T: Serialize>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).unwrap();
    out
}

const IDENTITY_SEED: [u8; 32] = [0xAB; 32];

fn identity_hex() -> String {
    IDENTITY_SEED.iter().map(|b| format!("{b:02x}")).collect()
}

fn pinned_identity() -> [u8; 32] {
    tether_crypto::ServerKeyExchange::new(&IDENTITY_SEED).identity_public_key()
}

#[tokio::test]
async fn echo_roundtrip() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);

    let response = session
        .call("echo", &cbor(&EchoRequest { message: "hi".to_string() }))
        .await
        .unwrap();

    let echo: EchoResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(echo.message, "hi");
}

#[tokio::test]
async fn large_payloads_roundtrip_at_small_mtu() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 27);

    // Request spans dozens of containers client → server.
    let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let response = session
        .call("data_write", &cbor(&DataWriteRequest { data: data.clone() }))
        .await
        .unwrap();
    let written: DataWriteResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(written.length, 1000);

    // Response spans dozens of containers server → client.
    let response = session
        .call("flash_read", &cbor(&FlashReadRequest { address: 512, length: 2000 }))
        .await
        .unwrap();
    let read: FlashReadResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(read.address, 512);
    assert_eq!(read.data.len(), 2000);
    assert_eq!(read.data[0], 0); // 512 & 0xFF
    assert_eq!(read.data[1], 1);
}

#[tokio::test]
async fn sequential_calls_reuse_the_session() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);

    for i in 0..5 {
        let message = format!("call {i}");
        let response =
            session.call("echo", &cbor(&EchoRequest { message: message.clone() })).await.unwrap();
        let echo: EchoResponse = ciborium::from_reader(response.as_slice()).unwrap();
        assert_eq!(echo.message, message);
    }
}

#[tokio::test]
async fn capabilities_and_timeout_are_reported() {
    let config = ServerConfig { timeout_ms: 2500, ..ServerConfig::default() };
    let session = link(config, ClientConfig::default(), 247);

    let caps = session.request_capabilities().await.unwrap();
    assert_eq!(caps.max_request_payload_size, 4096);
    assert_eq!(caps.max_response_payload_size, 4096);
    assert!(!caps.supports_encryption());

    assert_eq!(session.query_timeout().await.unwrap(), 2500);
    assert_eq!(session.server_timeout_ms(), Some(2500));
}

#[tokio::test]
async fn unknown_method_fails_the_call() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);

    let result = session.call("missing", b"").await;
    assert!(matches!(
        result,
        Err(ClientError::Remote { code: ErrorCode::UnknownCommand })
    ));
}

#[tokio::test]
async fn oversized_response_fails_with_response_too_large() {
    let config = ServerConfig { max_response_payload_size: 100, ..ServerConfig::default() };
    let session = link(config, ClientConfig::default(), 247);

    let result = session
        .call("flash_read", &cbor(&FlashReadRequest { address: 0, length: 500 }))
        .await;
    assert!(matches!(
        result,
        Err(ClientError::Remote { code: ErrorCode::ResponseTooLarge })
    ));

    // The session survives a resource error.
    let response = session
        .call("echo", &cbor(&EchoRequest { message: "still here".to_string() }))
        .await
        .unwrap();
    let echo: EchoResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(echo.message, "still here");
}

#[tokio::test]
async fn oversized_request_is_rejected_locally() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);
    session.request_capabilities().await.unwrap();

    let result = session
        .call("data_write", &cbor(&DataWriteRequest { data: vec![0u8; 5000] }))
        .await;
    assert!(matches!(result, Err(ClientError::RequestTooLarge { .. })));
}

#[tokio::test]
async fn encrypted_echo_end_to_end() {
    let server_config = ServerConfig {
        identity_key: Some(identity_hex()),
        ..ServerConfig::default()
    };
    let client_config = ClientConfig {
        server_identity: Some(pinned_identity()),
        ..ClientConfig::default()
    };
    let session = link(server_config, client_config, 247);

    // Before the key exchange the server refuses plaintext requests.
    let result = session.call("echo", &cbor(&EchoRequest { message: "x".to_string() })).await;
    assert!(matches!(
        result,
        Err(ClientError::Remote { code: ErrorCode::NotEncryptedWhenRequired })
    ));

    let caps = session.request_capabilities().await.unwrap();
    assert!(caps.supports_encryption());

    session.perform_key_exchange().await.unwrap();
    assert!(session.encryption_active());

    let response = session
        .call("echo", &cbor(&EchoRequest { message: "secret".to_string() }))
        .await
        .unwrap();
    let echo: EchoResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(echo.message, "secret");
}

#[tokio::test]
async fn key_exchange_requires_pinned_identity() {
    let server_config = ServerConfig {
        identity_key: Some(identity_hex()),
        ..ServerConfig::default()
    };
    let session = link(server_config, ClientConfig::default(), 247);

    let result = session.perform_key_exchange().await;
    assert!(matches!(result, Err(ClientError::IdentityRequired)));
}

#[tokio::test]
async fn server_push_stream_delivers_in_order() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);

    let collected: Arc<Mutex<Vec<CounterStreamResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    session.register_server_stream_handler("counter_stream", move |body| {
        let response: CounterStreamResponse = ciborium::from_reader(body.as_slice()).unwrap();
        sink.lock().unwrap().push(response);
    });

    let ends = Arc::new(AtomicU32::new(0));
    let end_sink = ends.clone();
    session.set_stream_end_handler(move || {
        end_sink.fetch_add(1, Ordering::SeqCst);
    });

    session.send_request("counter_stream", &cbor(&CounterStreamRequest { count: 5 })).unwrap();

    // The stream end frame is ordered after the five responses.
    for _ in 0..200 {
        if ends.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ends.load(Ordering::SeqCst), 1, "stream end must fire exactly once");

    let responses = collected.lock().unwrap().clone();
    assert_eq!(responses.len(), 5);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.seq, i as u32);
        assert_eq!(response.value, (i * 10) as i32);
    }
}

#[tokio::test]
async fn client_push_stream_is_summarized() {
    let session = link(ServerConfig::default(), ClientConfig::default(), 247);

    for seq in 0..5u32 {
        session
            .send_request(
                "counter_upload",
                &cbor(&CounterUploadRequest { seq, value: (seq * 10) as i32 }),
            )
            .unwrap();
        // The radio's connection interval paces uploads in a real deployment;
        // an in-process channel needs the pacing made explicit, or the
        // single-slot work queue drops the overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Claim the summary before ending the stream: the server responds to the
    // stream-end frame, not to any single upload.
    let ticket = session.expect_response("counter_upload").unwrap();
    session.stream_upload_end().unwrap();

    let response = session.wait_response(ticket).await.unwrap();
    let summary: CounterUploadResponse = ciborium::from_reader(response.as_slice()).unwrap();
    assert_eq!(summary.received_count, 5);
}

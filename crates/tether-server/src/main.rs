//! Tether peripheral over the UDP dev transport.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tether_server::{
    HandlerRegistry, ServerConfig, ServerError, Service, UdpTransport,
    config::{DEFAULT_ASSEMBLER_BUF_SIZE, DEFAULT_MAX_RESPONSE_PAYLOAD_SIZE, DEFAULT_TIMEOUT_MS},
    handlers::{self, MemFlash},
};

/// Tether RPC peripheral (UDP dev transport).
#[derive(Parser, Debug)]
#[command(name = "tether-server", version, about)]
struct Args {
    /// Address to bind the UDP transport to.
    #[arg(long, default_value = "127.0.0.1:7450")]
    bind: String,

    /// Emulated MTU; container capacity is mtu − 3 − header.
    #[arg(long, default_value_t = 247)]
    mtu: u16,

    /// Largest request payload the assembler accepts.
    #[arg(long, default_value_t = DEFAULT_ASSEMBLER_BUF_SIZE)]
    assembler_buf_size: usize,

    /// Largest response payload before the server reports an error.
    #[arg(long, default_value_t = DEFAULT_MAX_RESPONSE_PAYLOAD_SIZE)]
    max_response_payload_size: usize,

    /// RPC timeout reported to clients, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u16,

    /// Device name announced by name-bearing transports.
    #[arg(long, default_value = "blerpc")]
    device_name: String,

    /// Hex-encoded Ed25519 identity seed (64 chars); enables encryption.
    #[arg(long)]
    identity_key: Option<String>,

    /// Size of the emulated flash device, in bytes.
    #[arg(long, default_value_t = 256 * 1024)]
    flash_size: usize,

    /// Highest flash address readable by `flash_read` (0 = device size).
    #[arg(long, default_value_t = 0)]
    max_flash_read_address: u32,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        assembler_buf_size: args.assembler_buf_size,
        max_response_payload_size: args.max_response_payload_size,
        timeout_ms: args.timeout_ms,
        work_stack_size: None,
        device_name: args.device_name.clone(),
        identity_key: args.identity_key.clone(),
    };

    let transport = Arc::new(UdpTransport::bind(&args.bind, args.mtu).await?);

    let mut registry = HandlerRegistry::new();
    let upload = handlers::install_defaults(
        &mut registry,
        Arc::new(MemFlash::new(args.flash_size)),
        args.max_flash_read_address,
    );

    let mut service = Service::new(config, transport.clone(), registry)?;
    let handle = service.handle();
    service.set_stream_end_handler(upload.stream_end_responder(handle));

    tracing::info!(
        addr = %transport.local_addr()?,
        device_name = %args.device_name,
        mtu = args.mtu,
        "tether peripheral ready"
    );

    let mut buf = vec![0u8; 65_536];
    loop {
        let (len, new_peer) = transport.recv(&mut buf).await?;
        if new_peer {
            service.connection_opened();
        }
        service.on_frame(&buf[..len]);
    }
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use reliable_messaging::messaging::config::ChannelConfig;
use reliable_messaging::messaging::envelope::DeliveryMode;
use reliable_messaging::messaging::message_module::{MessageModule, MessageModuleId, RequestHandler};
use reliable_messaging::messaging::reliable_channel::ReliableChannel;
use reliable_messaging::messaging::transport::udp::UdpTransport;
use tokio_util::sync::CancellationToken;
use tracing::{info, span, Instrument, Level};

const PING_MODULE_ID: MessageModuleId = MessageModuleId::new(b"PingPong");
const GREETING_MODULE_ID: MessageModuleId = MessageModuleId::new(b"Greeting");

#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:9100")]
    addr_a: String,
    #[clap(long, default_value = "127.0.0.1:9101")]
    addr_b: String,

    #[clap(short, long, default_value_t = 5)]
    num_pings: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct PingHandler {}

#[async_trait]
impl RequestHandler for PingHandler {
    fn id(&self) -> MessageModuleId {
        PING_MODULE_ID
    }

    async fn on_request(&self, sender: SocketAddr, buf: &[u8]) -> anyhow::Result<Vec<u8>> {
        info!("ping {:?} from {:?}", String::from_utf8_lossy(buf), sender);
        Ok(format!("pong {}", String::from_utf8_lossy(buf)).into_bytes())
    }
}

struct GreetingModule {}

#[async_trait]
impl MessageModule for GreetingModule {
    fn id(&self) -> MessageModuleId {
        GREETING_MODULE_ID
    }

    async fn on_message(&self, sender: SocketAddr, buf: &[u8]) {
        info!("greeting from {:?}: {}", sender, String::from_utf8_lossy(buf));
    }
}

async fn new_channel(addr: SocketAddr, name: &'static str) -> anyhow::Result<Arc<ReliableChannel>> {
    let config = ChannelConfig::default();
    let transport = Arc::new(UdpTransport::new(addr, config.max_datagram_size).await?);
    let channel = ReliableChannel::new(config, transport)?;

    let cloned = channel.clone();
    tokio::spawn(async move {
        let span = span!(Level::INFO, "node", name);
        cloned.recv_loop().instrument(span).await
    });
    Ok(channel)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::TRACE } else { Level::INFO })
        .try_init()
        .ok();

    let addr_a: SocketAddr = args.addr_a.parse()?;
    let addr_b: SocketAddr = args.addr_b.parse()?;

    let a = new_channel(addr_a, "a").await?;
    let b = new_channel(addr_b, "b").await?;

    b.register_request_handler(Arc::new(PingHandler {})).await?;
    b.register_module(Arc::new(GreetingModule {})).await?;

    a.send_to_module(addr_b, GREETING_MODULE_ID, &b"hello from a"[..], DeliveryMode::Reliable).await?;

    let cancel_token = CancellationToken::new();
    for i in 0..args.num_pings {
        let response = a.request(addr_b, PING_MODULE_ID, format!("#{}", i).into_bytes(), Duration::from_secs(1), &cancel_token).await?;
        info!("response: {}", String::from_utf8_lossy(&response));
    }

    while a.pending_ack_count().await > 0 || b.pending_ack_count().await > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

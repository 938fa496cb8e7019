use clap::Parser;
use clap_derive::Parser;
use ofp_driver::engine::{Channel, ChannelListener, ChannelOptions, ChannelSettings, Engine, EngineConfig, ListenerFactory};
use ofp_driver::protocol::{Message, MessageType, ProtocolVersions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

/// A minimal controller: it accepts switches, logs what they send and answers barriers
#[derive(Parser)]
struct Args {
    listen_address: String,

    /// also accept auxiliary connections over UDP
    #[clap(long, default_value_t = false)]
    udp: bool,

    /// PEM files for certificate chain, private key and trusted CAs - enables TLS and DTLS
    #[clap(long, num_args = 3, value_names = ["CERT", "KEY", "CA"])]
    tls: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

struct LoggingListener {
    received: usize,
}

impl ChannelListener for LoggingListener {
    fn on_channel_up(&mut self, channel: &mut Channel<'_>) {
        info!(conn = %channel.main_connection_id(), "switch {} connected from {:?} to {:?}, version {}", channel.datapath_id(), channel.remote_endpoint(), channel.local_endpoint(), channel.version());
        if let Some(features) = channel.features() {
            info!("switch {} has {} ports", channel.datapath_id(), features.port_count());
        }
    }

    fn on_channel_down(&mut self, channel: &mut Channel<'_>) {
        info!("switch {} disconnected after {} messages", channel.datapath_id(), self.received);
    }

    fn on_message(&mut self, channel: &mut Channel<'_>, message: &Message) {
        self.received += 1;
        info!("{:?} from {} (auxiliary id {})", message.message_type(), channel.datapath_id(), channel.auxiliary_id());

        if message.message_type() == MessageType::BarrierRequest {
            let reply = Message::build(message.version(), MessageType::BarrierReply, message.xid(), &[]);
            channel.send(&reply);
        }
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let listen_address: SocketAddr = args.listen_address.parse()?;

    let (engine, handle) = Engine::new(EngineConfig::new(), None)?;
    let engine_task = tokio::spawn(engine.run());

    let mut options = ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY;
    if args.udp {
        options |= ChannelOptions::LISTEN_UDP;
    }
    let factory: ListenerFactory = Arc::new(|| Box::new(LoggingListener { received: 0 }));
    let mut settings = ChannelSettings::new(options, ProtocolVersions::ALL, Some(factory));

    if let [cert, key, ca] = args.tls.as_slice() {
        let security_id = handle.add_identity(&std::fs::read(cert)?, &std::fs::read(key)?, &std::fs::read(ca)?).await?;
        settings = settings.with_security(security_id);
    }

    let server = handle.listen(listen_address, settings).await?;
    info!("listening on {:?} (UDP: {:?})", server.tcp_addr, server.udp_addr);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.close_all().await?;
    handle.stop(Duration::from_millis(200)).await?;

    engine_task.await?;
    Ok(())
}

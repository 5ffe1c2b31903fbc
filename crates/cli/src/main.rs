mod rtp;

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use interleave::config::{DEFAULT_MAX_READS_PER_WAKEUP, DEFAULT_READ_CHUNK_SIZE};
use interleave::{
    CLOSE_SENTINEL, ERROR_SENTINEL, InterleaveConfig, MediaEndpoint, PollingScheduler,
    ReceivedPacket, SocketRegistry, StreamTransport,
};
use parking_lot::Mutex;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Parser)]
#[command(
    name = "interleave",
    about = "RTP/RTCP interleaved over an RTSP TCP connection"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Bytes requested per socket read
    #[arg(long, global = true, default_value_t = DEFAULT_READ_CHUNK_SIZE)]
    read_chunk_size: usize,

    /// Socket reads per wakeup before yielding to other connections
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_READS_PER_WAKEUP)]
    max_reads: usize,

    /// Timeout for finishing a partially sent frame, in milliseconds
    #[arg(long, global = true, default_value_t = 500)]
    blocking_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Accept clients and log the interleaved packets they send
    Listen {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8554")]
        bind: String,

        /// Channels to listen on, starting at 0
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..=256))]
        channels: u16,
    },
    /// Connect and send RTP packets interleaved on one channel
    Send {
        /// Server address (host:port)
        #[arg(long, short)]
        connect: String,

        #[arg(long, default_value_t = 0)]
        channel: u8,

        /// Number of packets
        #[arg(long, default_value_t = 10)]
        count: u32,

        /// RTP payload bytes per packet
        #[arg(long, default_value_t = 1200)]
        size: usize,

        /// Pause between packets, in milliseconds
        #[arg(long, default_value_t = 33)]
        interval_ms: u64,

        /// RTSP request line sent ahead of the media
        #[arg(long)]
        rtsp: Option<String>,
    },
}

impl Args {
    fn config(&self) -> InterleaveConfig {
        InterleaveConfig {
            read_chunk_size: self.read_chunk_size,
            max_reads_per_wakeup: self.max_reads,
            blocking_send_timeout: Duration::from_millis(self.blocking_timeout_ms),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();

    let result = match args.command {
        Command::Listen { bind, channels } => listen(&bind, channels, config),
        Command::Send {
            connect,
            channel,
            count,
            size,
            interval_ms,
            rtsp,
        } => send(
            &connect,
            channel,
            count,
            size,
            Duration::from_millis(interval_ms),
            rtsp.as_deref(),
            config,
        ),
    };

    if let Err(e) = result {
        eprintln!("interleave: {}", e);
        std::process::exit(1);
    }
}

fn listen(bind: &str, channels: u16, config: InterleaveConfig) -> interleave::Result<()> {
    let listener = TcpListener::bind(bind)?;
    tracing::info!(addr = %bind, channels, "listening for interleaved streams");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let c = config.clone();
                thread::spawn(move || {
                    if let Err(e) = serve(stream, channels, c) {
                        tracing::warn!(error = %e, "connection failed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "TCP accept error"),
        }
    }
    Ok(())
}

/// Own one client connection until it goes away.
fn serve(stream: TcpStream, channels: u16, config: InterleaveConfig) -> interleave::Result<()> {
    let peer_addr = stream.peer_addr()?;
    stream.set_nonblocking(true)?;
    tracing::info!(%peer_addr, "client connected");

    let scheduler = Arc::new(PollingScheduler::new());
    let registry = SocketRegistry::with_config(scheduler.clone(), config);
    let transport = StreamTransport::from(stream);

    let endpoints: Vec<Arc<MediaEndpoint>> = (0..channels)
        .filter_map(|c| u8::try_from(c).ok())
        .map(|channel| {
            let endpoint = MediaEndpoint::new(&registry, &format!("{peer_addr}#{channel}"));
            endpoint.bind_to_socket(transport.clone(), channel);
            endpoint.start_network_reading(Arc::new(move |packet| log_packet(peer_addr, &packet)));
            endpoint
        })
        .collect();

    let closed = Arc::new(AtomicBool::new(false));
    registry.set_passthrough_handler(transport.key(), rtsp_printer(peer_addr, closed.clone()))?;

    while !closed.load(Ordering::SeqCst) {
        scheduler.poll(&registry);
        thread::sleep(POLL_INTERVAL);
    }

    drop(endpoints);
    tracing::info!(%peer_addr, "client disconnected");
    Ok(())
}

fn log_packet(peer_addr: SocketAddr, packet: &ReceivedPacket) {
    let channel = packet.binding.channel;
    let size = packet.payload.len();
    match rtp::parse_header(&packet.payload) {
        Some(header) => tracing::info!(
            %peer_addr,
            channel,
            size,
            pt = header.payload_type,
            seq = header.sequence,
            ssrc = format_args!("{:#010X}", header.ssrc),
            "packet"
        ),
        None => tracing::info!(%peer_addr, channel, size, "packet"),
    }
}

/// Collect passthrough bytes into lines and print them. The hand-back
/// sentinel ends the connection.
fn rtsp_printer(peer_addr: SocketAddr, closed: Arc<AtomicBool>) -> interleave::PassthroughHandler {
    let line = Mutex::new(Vec::new());
    Arc::new(move |byte| match byte {
        ERROR_SENTINEL | CLOSE_SENTINEL => closed.store(true, Ordering::SeqCst),
        b'\n' => {
            let mut line = line.lock();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                println!("{peer_addr} rtsp: {text}");
            }
            line.clear();
        }
        _ => line.lock().push(byte),
    })
}

fn send(
    addr: &str,
    channel: u8,
    count: u32,
    size: usize,
    interval: Duration,
    rtsp: Option<&str>,
    config: InterleaveConfig,
) -> interleave::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    if let Some(line) = rtsp {
        stream.write_all(format!("{line}\r\n\r\n").as_bytes())?;
    }
    stream.set_nonblocking(true)?;

    let scheduler = Arc::new(PollingScheduler::new());
    let registry = SocketRegistry::with_config(scheduler, config);
    let endpoint = MediaEndpoint::new(&registry, "sender");
    endpoint.bind_to_socket(StreamTransport::from(stream), channel);

    let mut source = rtp::RtpSource::with_random_ssrc(rtp::DEFAULT_PAYLOAD_TYPE, size);
    tracing::info!(
        %addr,
        channel,
        ssrc = format_args!("{:#010X}", source.ssrc()),
        "sending"
    );

    let mut sent = 0;
    for _ in 0..count {
        if endpoint.send_packet(&source.next_packet()) {
            sent += 1;
        } else if endpoint.bindings().is_empty() {
            tracing::error!(%addr, "connection lost");
            break;
        }
        thread::sleep(interval);
    }

    tracing::info!(sent, count, "done");
    Ok(())
}

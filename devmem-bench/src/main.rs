use devmem_bench::config::{ClientConfig, EngineConfig, ServerConfig};
use devmem_bench::memory::{HostMemory, MemoryProvider, UdmabufMemory, pattern};
use devmem_bench::netdev::Binding;
use devmem_bench::stats::Statistics;
use devmem_bench::transport::{self, RxMode, TxMode};
use devmem_bench::{Error, MI_B, Result, socket};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Zero-copy device memory TCP throughput benchmark.")]
struct Args {
    /// Run as server (if not set, run as client).
    #[arg(short, long)]
    server: bool,

    /// IP address to bind.
    #[arg(short = 'a', long)]
    bind_address: IpAddr,

    /// Port number to bind.
    #[arg(short = 'p', long)]
    bind_port: u16,

    /// IP address to connect to (client).
    #[arg(short = 'A', long)]
    address: Option<IpAddr>,

    /// Port number to connect to (client).
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Size of the transfer buffer in bytes.
    #[arg(short, long, default_value_t = 64 * MI_B)]
    buffer_size: usize,

    /// Send/receive the buffer N times.
    #[arg(short = 'N', long, default_value_t = 1)]
    ntimes: usize,

    /// Fill the client buffer with a test pattern and check it on the server.
    #[arg(short, long)]
    validate: bool,

    /// Use device memory TCP instead of the plain socket path.
    #[arg(short, long)]
    devmem_tcp: bool,

    /// Interface whose queues the dma-buf is bound to.
    #[arg(short, long)]
    interface: Option<String>,

    /// First receive queue to bind.
    #[arg(short, long, default_value_t = 0)]
    queue_idx: u32,

    /// Number of receive queues to bind.
    #[arg(short, long, default_value_t = 1)]
    num_queue: u32,

    /// Server destination ring size; defaults to the buffer size, plus 4 KiB
    /// with `--devmem-tcp`.
    #[arg(long)]
    ring_size: Option<usize>,

    /// Bytes per zero-copy send; defaults to the whole buffer.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// JSON file with engine tunables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the run statistics as JSON to this file.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Maximum log level; `RUST_LOG` refines it further.
    #[arg(long, default_value_t = tracing::Level::INFO)]
    log: tracing::Level,
}

impl Args {
    fn engine(&self) -> Result<EngineConfig> {
        let engine = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        }
        .with_env();
        engine.validate()?;
        Ok(engine)
    }

    fn bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    fn interface(&self) -> Result<&str> {
        self.interface
            .as_deref()
            .ok_or_else(|| Error::Config("--interface is required with --devmem-tcp".into()))
    }

    fn server_config(&self, engine: EngineConfig) -> ServerConfig {
        ServerConfig {
            bind: self.bind(),
            iterations: self.ntimes,
            validate: self.validate,
            engine,
        }
    }

    fn client_config(&self, engine: EngineConfig) -> Result<ClientConfig> {
        let (Some(address), Some(port)) = (self.address, self.port) else {
            return Err(Error::Config("client mode needs --address and --port".into()));
        };
        Ok(ClientConfig {
            bind: Some(self.bind()),
            peer: SocketAddr::new(address, port),
            iterations: self.ntimes,
            chunk_size: self.chunk_size,
            interface: self.interface.clone(),
            engine,
        })
    }
}

fn init_tracing(level: tracing::Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let args: Args = clap::Parser::parse();
    init_tracing(args.log);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    if args.ntimes == 0 || args.buffer_size == 0 {
        return Err(Error::Config("--ntimes and --buffer-size must be non-zero".into()));
    }
    let engine = args.engine()?;
    info!(?args, "Starting");

    let stats = match (args.server, args.devmem_tcp) {
        (true, false) => serve_tcp(args, engine)?,
        (true, true) => serve_devmem(args, engine)?,
        (false, false) => send_tcp(args, engine)?,
        (false, true) => send_devmem(args, engine)?,
    };

    stats.log();
    if let Some(path) = &args.report {
        stats.write_json(path)?;
        info!(path = %path.display(), "Wrote report");
    }
    Ok(())
}

fn serve_tcp(args: &Args, engine: EngineConfig) -> Result<Statistics> {
    let memory = HostMemory::new();
    let mut dest = memory.allocate(args.ring_size.unwrap_or(args.buffer_size))?;
    transport::run_server(&memory, &mut dest, RxMode::Tcp, &args.server_config(engine))
}

fn serve_devmem(args: &Args, engine: EngineConfig) -> Result<Statistics> {
    let ifindex = socket::if_nametoindex(args.interface()?)?;
    info!(ifindex, "Interface index");

    let memory = UdmabufMemory::open()?;
    let source = memory.allocate(args.buffer_size)?;
    let ring_size = args
        .ring_size
        .unwrap_or(transport::devmem_ring_size(args.buffer_size));
    let mut dest = memory.allocate(ring_size)?;

    let queues = args.queue_idx..args.queue_idx + args.num_queue;
    let binding = Binding::bind_rx(ifindex, queues, memory.export(&source)?)?;
    let mode = RxMode::Devmem {
        source: &source,
        dmabuf_id: binding.id(),
    };
    transport::run_server(&memory, &mut dest, mode, &args.server_config(engine))
}

fn send_tcp(args: &Args, engine: EngineConfig) -> Result<Statistics> {
    let memory = HostMemory::new();
    let mut source = memory.allocate(args.buffer_size)?;
    if args.validate {
        pattern::fill_region(&memory, &mut source)?;
    }
    transport::run_client(&memory, &source, TxMode::Tcp, &args.client_config(engine)?)
}

fn send_devmem(args: &Args, engine: EngineConfig) -> Result<Statistics> {
    let config = args.client_config(engine)?;
    let ifindex = socket::if_nametoindex(args.interface()?)?;

    let memory = UdmabufMemory::open()?;
    let mut source = memory.allocate(args.buffer_size)?;
    if args.validate {
        pattern::fill_region(&memory, &mut source)?;
    }

    let binding = Binding::bind_tx(ifindex, memory.export(&source)?)?;
    let mode = TxMode::Devmem {
        dmabuf_id: binding.id(),
    };
    transport::run_client(&memory, &source, mode, &config)
}

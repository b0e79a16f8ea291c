//! fakeip-relay: fake-IP DNS server and TCP relay
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! sudo ./fakeip-relay
//!
//! # Run with a custom configuration and debug logging
//! ./fakeip-relay -c ./config.json -v
//!
//! # Environment overrides
//! FAKEIP_RELAY_LOG_LEVEL=debug ./fakeip-relay
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use fakeip_relay::config::{create_default_config, load_config_with_env, Config};
use fakeip_relay::event::{spawn_event_logger, EventBus};
use fakeip_relay::fakedns::{DnsServer, DnsUdpFront, FakeDnsConfig, ListenerRegistry, UdpResolver};
use fakeip_relay::proxy::ProxyServer;
use fakeip_relay::rules::StaticRuleMatcher;
use fakeip_relay::session::{FakeIpLookup, ResolveContext};
use fakeip_relay::tunnel::{DialerAdapterFactory, TcpDialer, TunnelContext};

/// Packets buffered between the DNS server and the UDP front
const DNS_OUTPUT_CAPACITY: usize = 1024;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
    /// Force debug logging
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/fakeip-relay/config.json");
        let mut generate_config = false;
        let mut check_config = false;
        let mut verbose = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => generate_config = true,
                "--check" => check_config = true,
                "-v" | "--verbose" => verbose = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-V" | "--version" => {
                    println!("fakeip-relay v{}", fakeip_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
            verbose,
        }
    }
}

fn print_help() {
    println!(
        r"fakeip-relay v{}

Fake-IP DNS server and TCP relay.

USAGE:
    fakeip-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/fakeip-relay/config.json]
    -g, --generate-config   Write a default configuration to the config path and exit
    --check                 Check configuration and exit
    -v, --verbose           Log at debug level
    -h, --help              Print help information
    -V, --version           Print version information

ENVIRONMENT:
    RUST_LOG                    Log filter, takes precedence over everything else
    FAKEIP_RELAY_LOG_LEVEL      Override log level (trace, debug, info, warn, error)
    FAKEIP_RELAY_DNS_LISTEN     Override the DNS listen address
    FAKEIP_RELAY_PROXY_LISTEN   Override the proxy listen address
",
        fakeip_relay::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` wins over `--verbose`, which wins over `log.level`.
fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        Level::DEBUG
    } else {
        match config.log.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Build the DNS server from the `dns` section
fn build_dns_server(
    config: &Config,
    registry: &ListenerRegistry,
    output: mpsc::Sender<bytes::Bytes>,
) -> Result<Arc<DnsServer>> {
    let matcher = StaticRuleMatcher::from_config(&config.dns).context("Invalid DNS rules")?;
    info!("Loaded {} DNS rules", matcher.rule_count());

    let mut builder = DnsServer::builder(FakeDnsConfig::from(&config.dns))
        .matcher(Arc::new(matcher))
        .registry(registry);
    for upstream in &config.dns.upstreams {
        builder = builder.resolver(Arc::new(UdpResolver::new(
            *upstream,
            config.dns.upstream_timeout(),
        )));
    }
    if config.dns.upstreams.is_empty() {
        warn!("No DNS upstreams configured; only fake answers will be served");
    }

    let server = builder
        .build(output)
        .context("Failed to create DNS server")?;
    Ok(Arc::new(server))
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).with_context(|| {
        format!(
            "Failed to load configuration from {}",
            args.config_path.display()
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config, args.verbose);
    info!("fakeip-relay v{}", fakeip_relay::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let events = EventBus::new(config.events.capacity);
    let event_logger = spawn_event_logger(&events);

    // DNS side
    let registry = ListenerRegistry::new();
    let (dns_output, dns_output_rx) = mpsc::channel(DNS_OUTPUT_CAPACITY);
    let dns = build_dns_server(&config, &registry, dns_output)?;
    let dns_task = dns.start();
    let front = DnsUdpFront::bind(Arc::clone(&dns))
        .await
        .with_context(|| format!("Failed to bind DNS listener {}", config.dns.listen))?;

    let shutdown = CancellationToken::new();
    let front_task = tokio::spawn(front.run(dns_output_rx, shutdown.child_token()));

    // Proxy side
    let mut resolve = ResolveContext::default().with_fake_ip_enabled(config.proxy.fake_ip_enabled);
    if config.dns.fake_ip_pool.is_some() {
        let lookup: Arc<dyn FakeIpLookup> = dns.clone();
        resolve = resolve.with_fake_ip(lookup);
    }
    let context = TunnelContext {
        resolve,
        adapters: Arc::new(DialerAdapterFactory::new(
            TcpDialer::new(config.proxy.connect_timeout()),
            config.proxy.buffer_size,
        )),
        events: events.clone(),
    };
    let proxy = ProxyServer::bind(&config.proxy, context).context("Failed to create proxy listener")?;
    let proxy_task = tokio::spawn(proxy.run(shutdown.child_token()));

    info!(
        "fakeip-relay ready: DNS on {}, proxy on {}",
        config.dns.listen, config.proxy.listen
    );
    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }

    shutdown.cancel();
    dns.stop();

    match proxy_task.await {
        Ok(Err(e)) => error!("Proxy server error: {}", e),
        Err(e) => error!("Proxy server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = front_task.await {
        error!("DNS front task failed: {}", e);
    }
    if let Some(task) = dns_task {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    let snapshot = dns.snapshot().await;
    info!(
        "Final DNS state: {} fake sessions, {} pending, {} addresses allocated",
        snapshot.fake_sessions, snapshot.pending_sessions, snapshot.allocated_addresses
    );

    drop(events);
    event_logger.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

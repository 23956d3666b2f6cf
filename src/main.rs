use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use peerdisco::{
    DEFAULT_CAPACITY, DEFAULT_TTL, DEFAULT_WALKERS, FILE_NOT_FOUND, FileStore, GatewayConfig, Node, NodeConfig,
    Retries, SearchConfig, Strategy,
};

#[derive(Parser, Debug)]
#[command(name = "peerdisco")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peer name announced to the overlay.
    #[arg(short, long)]
    name: String,

    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Maximum number of overlay neighbours.
    #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// Host announced to peers instead of the bound IP.
    #[arg(long)]
    advertise: Option<String>,

    /// File to share; its file name is the search key. Repeatable.
    #[arg(short, long = "share", value_name = "FILE")]
    share: Vec<PathBuf>,

    /// Address of a node to greet at startup. Repeatable.
    #[arg(short = 'H', long = "hello", value_name = "ADDR")]
    hello: Vec<String>,

    /// Default hop budget for searches.
    #[arg(long, default_value_t = DEFAULT_TTL, value_parser = clap::value_parser!(u32).range(1..))]
    ttl: u32,

    /// Retries per remote call after the first attempt.
    #[arg(long, default_value_t = 2)]
    retries: u32,

    /// Timeout per remote call attempt, in milliseconds.
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Delay between search status polls, in milliseconds.
    #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let files = load_files(&args.share).await?;
    if files.is_empty() {
        info!("no files shared");
    } else {
        info!(count = files.len(), "files loaded");
    }
    let config = NodeConfig {
        name: args.name.clone(),
        bind: args.bind.clone(),
        capacity: args.capacity,
        advertise_host: args.advertise.clone(),
        gateway: GatewayConfig {
            timeout: Duration::from_millis(args.timeout_ms),
            retries: Retries::Limited(args.retries),
        },
        search: SearchConfig {
            poll_interval: Duration::from_millis(args.poll_ms),
            default_ttl: args.ttl,
            default_walkers: DEFAULT_WALKERS,
        },
        ..NodeConfig::default()
    };

    let node = Node::bind(config, files).await?;
    info!("Node {}", node.identity());

    for addr in &args.hello {
        match node.hello(addr).await {
            Ok(true) => info!(peer = %addr, "greeting queued"),
            Ok(false) => warn!(peer = %addr, "greeting refused"),
            Err(e) => warn!(peer = %addr, error = %e, "greeting failed"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print_help();

    // Graceful shutdown on Ctrl+C, EOF or `quit`
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match run_command(&node, line.trim()).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => println!("error: {:#}", e),
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn load_files(paths: &[PathBuf]) -> Result<FileStore> {
    let mut files = FileStore::new();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid file name {}", path.display()))?;
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        info!(file = %name, bytes = content.len(), "sharing file");
        files.insert(name, content);
    }
    Ok(files)
}

enum Flow {
    Continue,
    Quit,
}

fn print_help() {
    println!("commands:");
    println!("  hello ADDR              greet the node at ADDR");
    println!("  plist                   known peers");
    println!("  nlist                   overlay neighbours");
    println!("  who [ADDR]              own identity, or the identity of ADDR");
    println!("  find FILE [TTL]         flood search");
    println!("  walk FILE [TTL] [K]     random-walk search with K walkers");
    println!("  get ADDR FILE           download FILE from ADDR");
    println!("  status                  peer, neighbour and queue counts");
    println!("  help                    this text");
    println!("  quit                    stop the node");
}

async fn run_command(node: &Node, line: &str) -> Result<Flow> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(Flow::Continue);
    };
    let args: Vec<&str> = parts.collect();
    let defaults = node.search_config();

    match (command, args.as_slice()) {
        ("hello", [addr]) => {
            let queued = node.hello(addr).await?;
            println!("{}", if queued { "greeting queued" } else { "refused" });
        }
        ("plist", []) => print_peers(&node.peers().await?),
        ("nlist", []) => print_peers(&node.neighbours().await?),
        ("who", []) => println!("{}", node.identity()),
        ("who", [addr]) => println!("{}", node.who(addr).await?),
        ("find", [file, rest @ ..]) if rest.len() <= 1 => {
            let ttl = parse_or(rest.first(), defaults.default_ttl, "TTL")?;
            report(node, file, ttl, Strategy::Flood).await?;
        }
        ("walk", [file, rest @ ..]) if rest.len() <= 2 => {
            let ttl = parse_or(rest.first(), defaults.default_ttl, "TTL")?;
            let walkers = parse_or(rest.get(1), defaults.default_walkers, "K")?;
            report(node, file, ttl, Strategy::RandomWalk { walkers }).await?;
        }
        ("get", [addr, file]) => {
            let content = node.fetch(addr, file).await?;
            if content == FILE_NOT_FOUND {
                println!("{} does not have {}", addr, file);
            } else {
                println!("{}", content);
            }
        }
        ("status", []) => {
            println!(
                "{}: {} peers, {} neighbours, {} pending actions",
                node.identity(),
                node.peers().await?.len(),
                node.neighbours().await?.len(),
                node.pending_actions().await?
            );
        }
        ("help", []) => print_help(),
        ("quit", []) => return Ok(Flow::Quit),
        _ => println!("unknown command {:?}; type help", line),
    }
    Ok(Flow::Continue)
}

fn parse_or(arg: Option<&&str>, default: u32, what: &str) -> Result<u32> {
    match arg {
        Some(s) => s.parse().with_context(|| format!("invalid {} {:?}", what, s)),
        None => Ok(default),
    }
}

fn print_peers(peers: &[peerdisco::PeerIdentity]) {
    if peers.is_empty() {
        println!("(none)");
    }
    for peer in peers {
        println!("{}", peer);
    }
}

async fn report(node: &Node, file: &str, ttl: u32, strategy: Strategy) -> Result<()> {
    let outcome = node.search(file, ttl, strategy).await?;
    match &outcome.holder {
        Some(holder) => println!("{} found at {}", file, holder),
        None => println!("{} not found within ttl {}", file, ttl),
    }
    println!("messages: {}", outcome.messages);
    Ok(())
}

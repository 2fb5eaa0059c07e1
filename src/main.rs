//! Command line interface: one-off relay queries, team discovery, and the
//! HTTP query gateway.

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use relayq::{
    config::Settings,
    coordinator::{CoordinatorConfig, HybridQueryCoordinator},
    filter::Filter,
    query::{QueryOptions, QueryResult},
    server,
    strategy::Strategy,
    team::{TeamDiscovery, TeamDiscoveryConfig},
};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "relayq",
    author,
    version,
    about = "Multi-strategy Nostr relay query client and gateway"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query relays with a filter and print matching events as NDJSON.
    Query(QueryArgs),
    /// Discover teams across the configured relays.
    Teams {
        /// Team event kind; defaults to `TEAM_KIND`.
        #[arg(long)]
        kind: Option<u32>,
    },
    /// Run the HTTP query gateway on `BIND_HTTP`.
    Serve,
}

#[derive(Args)]
struct QueryArgs {
    /// Relay URL, repeatable. Defaults to the configured `RELAYS`.
    #[arg(long = "relay", value_name = "URL")]
    relays: Vec<String>,
    #[arg(long = "kind", value_name = "KIND")]
    kinds: Vec<u32>,
    #[arg(long = "author", value_name = "PUBKEY")]
    authors: Vec<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    since: Option<u64>,
    #[arg(long)]
    until: Option<u64>,
    /// `#t` tag value, repeatable.
    #[arg(long = "tag-t", value_name = "TOPIC")]
    topics: Vec<String>,
    /// Strategy to try first: http, websocket or emergency.
    #[arg(long)]
    method: Option<Strategy>,
    /// Per-strategy timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,
    /// Overall time per relay across all strategies, in milliseconds.
    #[arg(long, value_name = "MS")]
    budget_ms: Option<u64>,
    /// Print per-relay performance metrics to stderr afterwards.
    #[arg(long)]
    stats: bool,
}

impl QueryArgs {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().cloned());
        }
        if !self.topics.is_empty() {
            filter = filter.tag('t', self.topics.iter().cloned());
        }
        filter
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            limit: self.limit,
            since: self.since,
            until: self.until,
            timeout: self.timeout_ms.map(Duration::from_millis),
            force_method: self.method,
            skip_cache: false,
            budget: self.budget_ms.map(Duration::from_millis),
        }
    }
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let coordinator = HybridQueryCoordinator::new(cfg.coordinator_config())?;
    let outcome = match cli.command {
        Commands::Query(args) => query(&coordinator, &cfg, args).await,
        Commands::Teams { kind } => {
            let mut team_cfg = cfg.team_config();
            if let Some(kind) = kind {
                team_cfg.kind = kind;
            }
            teams(&coordinator, team_cfg).await
        }
        Commands::Serve => {
            let addr: SocketAddr = cfg
                .bind_http
                .as_str()
                .parse()
                .with_context(|| format!("invalid BIND_HTTP {}", cfg.bind_http))?;
            server::serve_http(addr, coordinator.clone(), cfg.relays.clone(), std::future::pending()).await
        }
    };
    coordinator.cleanup().await;
    outcome
}

async fn query(coordinator: &HybridQueryCoordinator, cfg: &Settings, args: QueryArgs) -> anyhow::Result<()> {
    let filter = args.filter();
    let options = args.options();
    let relays = if args.relays.is_empty() {
        cfg.relays.clone()
    } else {
        args.relays.clone()
    };

    let (events, results) = if let [relay] = relays.as_slice() {
        let result = coordinator.query_relay(relay, &filter, &options).await;
        (result.events.clone(), vec![result])
    } else {
        let multi = coordinator
            .query_multiple_relays(&relays, &filter, &options)
            .await;
        (multi.events, multi.relay_results)
    };

    for ev in &events {
        println!("{}", serde_json::to_string(ev)?);
    }
    for r in &results {
        eprintln!("{}", summary(r));
    }
    if args.stats {
        for relay in &relays {
            if let Some(m) = coordinator.relay_metrics(relay) {
                eprintln!("{}", serde_json::to_string(&m)?);
            }
        }
    }
    if !results.iter().any(|r| r.success) {
        bail!("no relay answered the query");
    }
    Ok(())
}

fn summary(r: &QueryResult) -> String {
    let mut line = format!(
        "{} method={} events={} time={}ms",
        r.relay,
        r.method.name(),
        r.events_found,
        r.response_time.as_millis()
    );
    if !r.fallbacks_used.is_empty() {
        line.push_str(&format!(" fallbacks={}", r.fallbacks_used.join(",")));
    }
    if let Some(err) = &r.error {
        line.push_str(&format!(" error={err}"));
    }
    line
}

async fn teams(coordinator: &HybridQueryCoordinator, team_cfg: TeamDiscoveryConfig) -> anyhow::Result<()> {
    let report = TeamDiscovery::new(coordinator.clone(), team_cfg)
        .discover_teams()
        .await;
    for team in &report.teams {
        println!("{}", serde_json::to_string(team)?);
    }
    eprintln!(
        "teams={} events={} rejected={}",
        report.teams.len(),
        report.events_seen,
        report.rejected
    );
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let coordinator = CoordinatorConfig::default();
    let team = TeamDiscoveryConfig::default();
    let settings = Settings::default();
    let mut content = String::new();
    content.push_str(&format!("RELAYS={}\n", team.relays.join(",")));
    content.push_str(&format!("BIND_HTTP={}\n", settings.bind_http));
    content.push_str(&format!("HTTP_QUERY_PATH={}\n", coordinator.http_query_path));
    content.push_str(&format!("HTTP_TIMEOUT_MS={}\n", coordinator.http_timeout.as_millis()));
    content.push_str(&format!("WS_TIMEOUT_MS={}\n", coordinator.ws_timeout.as_millis()));
    content.push_str(&format!(
        "EMERGENCY_TIMEOUT_MS={}\n",
        coordinator.emergency_timeout.as_millis()
    ));
    content.push_str(&format!("CACHE_TTL_SECS={}\n", coordinator.cache_ttl.as_secs()));
    content.push_str(&format!("BATCH_SIZE={}\n", coordinator.batch_size));
    content.push_str(&format!("BATCH_DELAY_MS={}\n", coordinator.batch_delay.as_millis()));
    content.push_str(&format!("TEAM_KIND={}\n", team.kind));
    content.push_str(&format!("TEAM_QUERY_DELAY_MS={}\n", team.query_delay.as_millis()));
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::stream::{self, StreamExt};
use proxy_verifier::{
    load_country_data, lookup_country, normalize_proxy, AnonymityOptions, ProtocolOptions,
    Protocol, ProxyInput, ProxyParser, ProxyVerifier, RequestOptions, RetryPolicy, TestAllOptions,
    TunnelOptions, DEFAULT_CHECK_URL, DEFAULT_CONCURRENCY, DEFAULT_TUNNEL_URL,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Verify proxy protocols, anonymity and tunnel support
#[derive(Parser)]
#[command(name = "proxy-verifier")]
#[command(about = "Verify proxy protocols, anonymity and tunnel support")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// MaxMind country database used to report proxy countries
    #[arg(long, global = true, env = "PROXY_VERIFIER_GEOIP")]
    geoip: Option<PathBuf>,
}

#[derive(Args)]
struct ProxyArgs {
    /// Proxy to verify (IP:PORT, USER:PASS@IP:PORT, scheme://IP:PORT or a JSON object)
    #[arg(short, long)]
    proxy: Option<String>,

    /// File containing proxies, one per line or a JSON array
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Protocols for proxies given without a scheme
    #[arg(short = 't', long, value_delimiter = ',', default_value = "http")]
    protocols: Vec<Protocol>,

    /// Number of proxies tested at once
    #[arg(short = 'n', long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

impl ProxyArgs {
    fn load(&self) -> Result<Vec<ProxyInput>> {
        let proxies = match (&self.proxy, &self.input) {
            (Some(line), _) => vec![ProxyParser::parse_line(line, &self.protocols)
                .ok_or_else(|| anyhow!("Invalid proxy: {}", line))?],
            (None, Some(path)) => ProxyParser::parse_file(path, &self.protocols)?,
            (None, None) => bail!("Pass a proxy with --proxy or a proxy list with --input"),
        };

        if proxies.is_empty() {
            bail!("No proxies found");
        }
        info!("Loaded {} proxies", proxies.len());
        Ok(proxies)
    }
}

#[derive(Args)]
struct NetworkArgs {
    /// Timeout in seconds for each request
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Local address to send requests from
    #[arg(long)]
    local_address: Option<IpAddr>,

    /// Check service URL (must answer with the caller's address and headers)
    #[arg(long, env = "PROXY_VERIFIER_TEST_URL", default_value = DEFAULT_CHECK_URL)]
    test_url: String,

    /// URL fetched through the proxy to test CONNECT tunnels
    #[arg(long, env = "PROXY_VERIFIER_TUNNEL_URL", default_value = DEFAULT_TUNNEL_URL)]
    tunnel_url: String,

    /// Public address of this machine; skips the direct check request
    #[arg(long)]
    my_ip: Option<String>,

    /// Attempts per probe (defaults depend on the test)
    #[arg(long)]
    attempts: Option<u32>,

    /// Seconds to wait between failed attempts
    #[arg(long, default_value = "0")]
    wait: u64,
}

impl NetworkArgs {
    fn request(&self) -> RequestOptions {
        let request = RequestOptions::new()
            .with_timeout(Duration::from_secs(self.timeout))
            .with_accept_invalid_certs(self.insecure);
        match self.local_address {
            Some(address) => request.with_local_address(address),
            None => request,
        }
    }

    fn retry(&self, default: RetryPolicy) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts.unwrap_or(default.max_attempts),
            Duration::from_secs(self.wait),
        )
    }

    fn protocol(&self) -> ProtocolOptions {
        let options = ProtocolOptions::new()
            .with_test_url(&self.test_url)
            .with_request(self.request());
        let retry = self.retry(options.retry);
        options.with_retry(retry)
    }

    fn anonymity(&self) -> AnonymityOptions {
        let options = AnonymityOptions::new()
            .with_test_url(&self.test_url)
            .with_ip_address_check_url(&self.test_url)
            .with_request(self.request());
        let retry = self.retry(options.retry);
        let options = options.with_retry(retry);
        match &self.my_ip {
            Some(ip) => options.with_my_ip_address(ip),
            None => options,
        }
    }

    fn tunnel(&self) -> TunnelOptions {
        let options = TunnelOptions::new()
            .with_test_url(&self.tunnel_url)
            .with_request(self.request());
        let retry = self.retry(options.retry);
        options.with_retry(retry)
    }

    fn all(&self) -> TestAllOptions {
        TestAllOptions::new()
            .with_protocol(self.protocol())
            .with_anonymity(self.anonymity())
            .with_tunnel(self.tunnel())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run protocol, anonymity and tunnel tests
    All {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Test every declared protocol
    Protocols {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Test a single protocol
    Protocol {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
        /// Protocol to test (defaults to the first declared one)
        #[arg(long = "use")]
        protocol: Option<Protocol>,
        /// Include the raw response in the result
        #[arg(long)]
        include_all: bool,
    },
    /// Classify anonymity level
    Anonymity {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Test CONNECT tunnel support
    Tunnel {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
    },
    /// Look up the country of IP addresses
    Country {
        /// Addresses to look up
        #[arg(required = true)]
        ips: Vec<String>,
    },
    /// Check many proxies and separate working from failed ones
    Check {
        #[command(flatten)]
        proxies: ProxyArgs,
        #[command(flatten)]
        network: NetworkArgs,
        /// Output file for working proxy reports
        #[arg(short, long)]
        good: Option<PathBuf>,
        /// Output file for failed proxy reports
        #[arg(short, long)]
        bad: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "proxy_verifier=debug"
    } else {
        "proxy_verifier=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Some(path) = &cli.geoip {
        load_country_data(path)?;
    }

    let verifier = ProxyVerifier::new();
    let verifier = &verifier;

    match cli.command {
        Commands::All { proxies, network } => {
            let options = network.all();
            let options = &options;
            let output = run_each(&proxies, move |proxy| async move {
                verifier.test_all(&proxy, options).await
            })
            .await?;
            print_json(&output)?;
        }
        Commands::Protocols { proxies, network } => {
            let options = network.protocol();
            let options = &options;
            let output = run_each(&proxies, move |proxy| async move {
                verifier.test_protocols(&proxy, options).await
            })
            .await?;
            print_json(&output)?;
        }
        Commands::Protocol {
            proxies,
            network,
            protocol,
            include_all,
        } => {
            let options = network.protocol().with_include_all(include_all);
            let options = &options;
            let output = run_each(&proxies, move |proxy| async move {
                verifier.test_protocol(&proxy, protocol, options).await
            })
            .await?;
            print_json(&output)?;
        }
        Commands::Anonymity { proxies, network } => {
            let options = network.anonymity();
            let options = &options;
            let output = run_each(&proxies, move |proxy| async move {
                verifier.test_anonymity_level(&proxy, options).await
            })
            .await?;
            print_json(&output)?;
        }
        Commands::Tunnel { proxies, network } => {
            let options = network.tunnel();
            let options = &options;
            let output = run_each(&proxies, move |proxy| async move {
                verifier.test_tunnel(&proxy, options).await
            })
            .await?;
            print_json(&output)?;
        }
        Commands::Country { ips } => {
            if cli.geoip.is_none() {
                bail!("Country lookup needs a database: pass --geoip or set PROXY_VERIFIER_GEOIP");
            }
            let output: Vec<Value> = ips
                .iter()
                .map(|ip| json!({ "ip": ip, "country": lookup_country(ip) }))
                .collect();
            print_json(&output)?;
        }
        Commands::Check {
            proxies,
            network,
            good,
            bad,
        } => {
            let concurrency = proxies.concurrency;
            let proxies = proxies.load()?;
            info!(
                "Checking {} proxies, {} at a time",
                proxies.len(),
                concurrency
            );

            let (good_reports, bad_reports) = verifier
                .check_and_separate(proxies, &network.all(), concurrency)
                .await?;

            info!(
                "Results: {} working, {} failed",
                good_reports.len(),
                bad_reports.len()
            );

            if let Some(path) = good {
                write_json(&path, &good_reports)?;
                info!("Saved {} working proxies to {}", good_reports.len(), path.display());
            }
            if let Some(path) = bad {
                write_json(&path, &bad_reports)?;
                info!("Saved {} failed proxies to {}", bad_reports.len(), path.display());
            }

            print_json(&json!({ "working": good_reports, "failed": bad_reports }))?;
        }
    }

    Ok(())
}

/// Run one test per loaded proxy, at most `--concurrency` at a time, and pair
/// each outcome with the proxy it belongs to
async fn run_each<F, Fut, T>(args: &ProxyArgs, test: F) -> Result<Value>
where
    F: Fn(ProxyInput) -> Fut,
    Fut: Future<Output = proxy_verifier::Result<T>>,
    T: Serialize,
{
    let runs = stream::iter(args.load()?).map(|proxy| {
        let descriptor = normalize_proxy(&proxy);
        let run = test(proxy);
        async move {
            match run.await {
                Ok(result) => json!({ "proxy": descriptor, "result": result }),
                Err(e) => json!({ "proxy": descriptor, "error": e.to_string() }),
            }
        }
    });

    let mut entries: Vec<Value> = runs.buffered(args.concurrency.max(1)).collect().await;
    if entries.len() == 1 {
        Ok(entries.remove(0))
    } else {
        Ok(Value::Array(entries))
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

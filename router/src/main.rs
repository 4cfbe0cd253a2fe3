use anyhow::{Context, Result};
use clap::Parser;
use forest_router::{ConfigFiles, FAdr, Limits, Router};
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// A forest overlay-network router.
///
/// Forwards datagram traffic between trusted routers and untrusted clients
/// along per-comtree spanning trees, with per-link rate shaping.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Forest address of this router, e.g. `1.1`.
    #[arg(long, env = "FOREST_ADR")]
    my_adr: FAdr,

    /// Interface table file.
    #[arg(long, env = "FOREST_IFACES")]
    ifaces: PathBuf,

    /// Link table file.
    #[arg(long, env = "FOREST_LINKS")]
    links: PathBuf,

    /// Comtree table file.
    #[arg(long, env = "FOREST_COMTREES")]
    comtrees: PathBuf,

    /// Route table file.
    #[arg(long, env = "FOREST_ROUTES")]
    routes: PathBuf,

    /// Seconds to run before a clean exit; 0 runs forever.
    #[arg(long, default_value_t = 0)]
    run_for: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let read = |path: &PathBuf| {
        std::fs::read_to_string(path).with_context(|| format!("can't read {}", path.display()))
    };
    let interfaces = read(&args.ifaces)?;
    let links = read(&args.links)?;
    let comtrees = read(&args.comtrees)?;
    let routes = read(&args.routes)?;

    let mut router = Router::new(args.my_adr, Limits::default());
    router
        .load(ConfigFiles {
            interfaces: &interfaces,
            links: &links,
            comtrees: &comtrees,
            routes: &routes,
        })
        .context("router initialization failed")?;
    router.setup_sockets()?;

    tracing::debug!("startup tables:\n{}", router.dump());
    tracing::info!(my_adr = %router.my_adr(), "router up, listening on the forest port");

    let finish_time = (args.run_for > 0).then(|| Duration::from_secs(args.run_for));
    router.run(finish_time)?;

    tracing::debug!("final tables:\n{}", router.dump());

    Ok(())
}

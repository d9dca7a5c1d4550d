use balancer_core::Config;
use clap::Parser;
use tracing::info;

/// Shared-nothing TCP/UDP load balancer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Port clients connect to (TCP and UDP).
    #[arg(default_value_t = Config::default().client_port)]
    client_port: u16,

    /// Port backends connect to (TCP).
    #[arg(default_value_t = Config::default().backend_port)]
    backend_port: u16,

    /// Number of reactor worker threads.
    #[arg(long, default_value_t = Config::default().workers)]
    workers: usize,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if args.workers == 0 {
        tracing::error!("--workers must be at least 1");
        return std::process::ExitCode::FAILURE;
    }

    let config = Config { client_port: args.client_port, backend_port: args.backend_port, workers: args.workers, ..Config::default() };

    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        std::process::exit(0);
    })
    .expect("failed to install signal handler");

    info!(
        client_port = config.client_port,
        backend_port = config.backend_port,
        workers = config.workers,
        "starting balancer"
    );
    balancer_core::run(config);

    std::process::ExitCode::SUCCESS
}

use std::path::Path;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use rsqlited::{MetaDb, Server, ServerConfig, SERVER_VERSION};

#[derive(Parser, Debug)]
#[command(name = "rsqlited")]
#[command(about = "A network server for file-backed SQLite databases", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap the meta database and the super-admin account
    Initdb {
        /// Data directory
        #[arg(short = 'D', long)]
        data_dir: String,
        /// Super-admin password
        #[arg(short = 'p', long)]
        password: String,
        /// Super-admin user name
        #[arg(short = 'u', long, default_value = "root")]
        user: String,
    },
    /// Run the server
    Server {
        /// Data directory
        #[arg(short = 'D', long)]
        data_dir: Option<String>,
        /// Number of worker threads
        #[arg(long)]
        worker_count: Option<usize>,
        /// Maximum connections per worker
        #[arg(long)]
        max_conns: Option<usize>,
        /// Listen host
        #[arg(short = 'H', long)]
        host: Option<String>,
        /// Listen port
        #[arg(short = 'P', long)]
        port: Option<u16>,
        /// Trace-level logging
        #[arg(long)]
        trace: bool,
        /// Log error backtraces
        #[arg(long)]
        trace_error: bool,
    },
}

fn init_logging(trace: bool) {
    let default = if trace { "rsqlited=trace" } else { "rsqlited=info" };
    let filter = EnvFilter::try_from_env("RSQLITED_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    match args.command {
        Command::Initdb {
            data_dir,
            password,
            user,
        } => {
            init_logging(false);
            match MetaDb::init(Path::new(&data_dir), &user, &password) {
                Ok(_) => {
                    println!("Initialized rsqlited data directory in {data_dir}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "initdb failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Server {
            data_dir,
            worker_count,
            max_conns,
            host,
            port,
            trace,
            trace_error,
        } => {
            let mut config = ServerConfig::load().unwrap_or_else(|e| {
                eprintln!("Warning: failed to load config: {e}. Using defaults.");
                ServerConfig::default()
            });
            // CLI arguments override file and environment.
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(worker_count) = worker_count {
                config.worker_count = worker_count;
            }
            if let Some(max_conns) = max_conns {
                config.max_conns = max_conns;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.trace |= trace;
            config.trace_error |= trace_error;

            init_logging(config.trace);
            println!("{SERVER_VERSION} starting on {}:{}", config.host, config.port);
            match run_server(config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "server failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run_server(config: ServerConfig) -> Result<(), rsqlited::ServerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let server = Server::new(config)?;
        let listener = server.bind().await?;
        tokio::select! {
            result = server.serve(listener) => result,
            _ = tokio::signal::ctrl_c() => {
                server.stop();
                Ok(())
            }
        }
    })
}

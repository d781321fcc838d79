//! ingot server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use reactor::EventLoop;
use server::config::{Config, SAMPLE_CONFIG};
use server::file_manager::FileManager;
use server::file_server::FileServer;
use server::{logging, signal};

#[derive(Parser)]
#[command(name = "ingot-server")]
#[command(about = "Content-addressed file transfer server")]
struct Args {
    /// Path to the configuration file
    #[arg(default_value = "etc/ingot.conf")]
    config: PathBuf,

    /// Run as a daemon (Unix only)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{SAMPLE_CONFIG}");
        return;
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    // Detach before anything spawns a thread.
    #[cfg(unix)]
    if args.daemon {
        if let Err(e) = server::daemon::daemonize() {
            eprintln!("failed to daemonize: {e}");
            std::process::exit(1);
        }
    }

    let _log_guard = match logging::init(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!(
                "failed to set up logging in {}: {e}",
                config.log_file_dir.display()
            );
            std::process::exit(1);
        }
    };
    signal::ignore_sigpipe();

    let files = match FileManager::open(&config.file_cache_dir) {
        Ok(files) => Arc::new(files),
        Err(e) => {
            tracing::error!(
                dir = %config.file_cache_dir.display(),
                "cannot open file store: {e}"
            );
            eprintln!("cannot open file store: {e}");
            std::process::exit(1);
        }
    };

    let base = match EventLoop::new() {
        Ok(lp) => lp,
        Err(e) => {
            tracing::error!("cannot create base event loop: {e}");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = config.listen_addr();
    let file_server = match FileServer::bind(base.handle(), addr, config.reuse_port, files) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!(%addr, "cannot bind: {e}");
            eprintln!("cannot bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    file_server.start(config.workers);
    tracing::info!(
        addr = %file_server.local_addr(),
        workers = config.workers,
        store = %config.file_cache_dir.display(),
        "ingot serving"
    );

    {
        let file_server = file_server.clone();
        let base_handle = base.handle();
        signal::install(move || {
            file_server.stop();
            base_handle.quit();
        });
    }

    base.run();
    tracing::info!("ingot exited");
}

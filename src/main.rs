use std::process::ExitCode;
use std::sync::Arc;

use pollftpd::cli;
use pollftpd::server::Server;

fn main() -> ExitCode {
    env_logger::init();
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(code) => return ExitCode::from(code as u8),
    };

    let listener = match cli::bind(&args) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let thread_count = cli::thread_count(&args);
    let server = match Server::new(listener, args.root.clone(), thread_count) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("failed to prepare listening socket: {e}");
            return ExitCode::from(2);
        }
    };

    server.start();
    wait_for_shutdown_signal();
    server.stop();
    ExitCode::SUCCESS
}

/// Blocks until `SIGINT` or `SIGTERM` arrives, using the same raw
/// `sigaction`-via-libc approach the rest of the core takes to system
/// calls rather than pulling in a signal-handling crate for one flag.
fn wait_for_shutdown_signal() {
    use std::sync::atomic::{AtomicBool, Ordering};
    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        SHUTDOWN.store(true, Ordering::Release);
    }

    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    while !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    log::info!("shutdown signal received");
}

//! Command-line surface and the startup failures that map to the
//! process's exit codes. Parsed with `clap`'s derive API, in the idiom
//! this lineage uses for its own example binaries.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pollftpd", about = "A minimal anonymous FTP server")]
pub struct Args {
    /// Port to listen on.
    #[arg(long)]
    pub port: u16,

    /// Number of worker threads. Defaults to the host's available
    /// parallelism.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Directory served to clients. `RETR`/`STOR` targets are confined to
    /// direct children of this path.
    #[arg(long, default_value = "./FTP")]
    pub root: PathBuf,
}

/// Parses the process's command-line arguments. Printing and exit-code
/// mapping on failure are handled by [`handle_parse_error`]; this just reads
/// the real `argv`, kept separate so the mapping itself is unit-testable
/// without going through the process's actual arguments.
pub fn parse_args() -> Result<Args, i32> {
    Args::try_parse().map_err(handle_parse_error)
}

/// Prints a clap parse error appropriately and maps it to an exit code.
/// `--help`/`--version` map to `1` per the documented exit-code contract
/// (clap's own default is `0`); any other parse failure (e.g. a missing
/// required flag) maps to `2`, matching "missing required option" in the
/// same contract.
fn handle_parse_error(e: clap::Error) -> i32 {
    use clap::error::ErrorKind;
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{e}");
            1
        }
        _ => {
            eprint!("{e}");
            2
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to create listening socket: {0}")]
    SocketCreation(#[source] std::io::Error),
    #[error("failed to bind to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("root path {0} does not exist or is not a directory")]
    InvalidRoot(PathBuf),
}

impl StartupError {
    /// Exit code per the external-interfaces contract: `1` for socket
    /// creation failures, `2` for bind failures or bad configuration.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::SocketCreation(_) => 1,
            StartupError::Bind { .. } | StartupError::InvalidRoot(_) => 2,
        }
    }
}

/// Binds the listening socket for `args`, validating the root directory
/// along the way. Socket creation and `bind(2)` are kept as distinct
/// fallible steps (rather than going through `TcpListener::bind`, which
/// folds both into one call) so the two failure modes can be told apart
/// for the exit-code contract below.
pub fn bind(args: &Args) -> Result<TcpListener, StartupError> {
    if !args.root.is_dir() {
        return Err(StartupError::InvalidRoot(args.root.clone()));
    }
    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), args.port);
    let socket = new_socket().map_err(StartupError::SocketCreation)?;
    bind_and_listen(&socket, addr).map_err(|source| StartupError::Bind {
        port: args.port,
        source,
    })?;
    Ok(socket)
}

fn new_socket() -> std::io::Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let reuse: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(unsafe { std::os::unix::io::FromRawFd::from_raw_fd(fd) })
}

fn bind_and_listen(socket: &TcpListener, addr: SocketAddr) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let (raw_addr, len) = socket_addr_to_raw(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &raw_addr as *const libc::sockaddr_in as *const libc::sockaddr,
            len,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    const BACKLOG: i32 = 128;
    if unsafe { libc::listen(fd, BACKLOG) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => unreachable!("this server only binds IPv4 addresses"),
    };
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
        sin_len: 0,
    };
    (
        sockaddr,
        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    )
}

pub fn thread_count(args: &Args) -> usize {
    args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    })
}

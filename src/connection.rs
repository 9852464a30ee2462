//! The per-connection FTP protocol state machine.
//!
//! Each `Connection` is driven entirely by its own completion chain: a
//! handler never runs concurrently with another handler for the same
//! connection, because the next step is only submitted once the current
//! one finishes. That lets most of the connection's mutable state --
//! the command tail buffer, the open data stream, the open file -- be
//! threaded through closures by value instead of living behind a lock.
//! The few fields genuinely touched from more than one call path
//! (`authenticated`, the lazily-created PASV listener, the liveness flag)
//! use atomics or a small `Mutex` instead.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::{self, Command};
use crate::eol;
use crate::path;
use crate::reactor::{self, Reactor};
use crate::server::ConnId;

pub struct Connection {
    id: ConnId,
    reactor: Arc<Reactor>,
    root: PathBuf,
    alive: Arc<AtomicBool>,
    control: TcpStream,
    authenticated: AtomicBool,
    pasv_listener: Mutex<Option<TcpListener>>,
    /// The data-channel descriptor currently in flight for `RETR`/`STOR`/
    /// `LIST`, if any. Tracked solely so [`Connection::close`] can cancel
    /// the reactor wait holding it: a transfer's socket (and, for `STOR`,
    /// its file handle) is owned by the completion closure chained through
    /// `send_outbound`/`recv_inbound`, not by this struct, so there is
    /// nothing else that could close it if the connection is torn down
    /// mid-transfer.
    transfer_fd: Mutex<Option<RawFd>>,
    on_close: Box<dyn Fn(ConnId) + Send + Sync>,
}

impl Connection {
    /// Wraps an accepted control-channel stream in a new `Connection`,
    /// writes the initial greeting, and arms the first command read.
    /// `on_close` is invoked exactly once, when the connection tears
    /// itself down, so the caller can unlink it from its registry.
    pub fn spawn(
        id: ConnId,
        reactor: Arc<Reactor>,
        root: PathBuf,
        control: TcpStream,
        on_close: impl Fn(ConnId) + Send + Sync + 'static,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            id,
            reactor,
            root,
            alive: Arc::new(AtomicBool::new(true)),
            control,
            authenticated: AtomicBool::new(false),
            pasv_listener: Mutex::new(None),
            transfer_fd: Mutex::new(None),
            on_close: Box::new(on_close),
        });
        conn.send_reply("220 Hello!".to_string(), |this| {
            this.read_next_command(Vec::new())
        });
        conn
    }

    /// Tears the connection down. Safe to call more than once or from
    /// more than one completion; only the first call has any effect.
    ///
    /// Cancels every reactor wait this connection could have outstanding --
    /// the control-channel read, the PASV listener's pending `accept`, and
    /// an in-flight transfer's data channel -- so their descriptors (and,
    /// for an in-flight `STOR`, its open file) are actually closed now
    /// rather than staying pinned inside the reactor until an event that,
    /// post-shutdown, may never come.
    pub fn close(self: &Arc<Self>) {
        if self.alive.swap(false, Ordering::AcqRel) {
            log::debug!("connection {:?} closed", self.id);
            self.reactor.cancel(self.control.as_raw_fd());
            if let Some(listener) = self.pasv_listener.lock().unwrap().as_ref() {
                self.reactor.cancel(listener.as_raw_fd());
            }
            if let Some(fd) = self.transfer_fd.lock().unwrap().take() {
                self.reactor.cancel(fd);
            }
            (self.on_close)(self.id);
        }
    }

    fn send_reply(
        self: &Arc<Self>,
        text: String,
        then: impl FnOnce(Arc<Connection>) + Send + 'static,
    ) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let fd = self.control.as_raw_fd();
        let this = Arc::clone(self);
        let bytes = format!("{text}\r\n").into_bytes();
        self.reactor.write(
            fd,
            bytes,
            Box::new(move |res, _buf| {
                if !this.alive.load(Ordering::Acquire) {
                    return;
                }
                match res {
                    Ok(_) => then(this),
                    Err(e) => {
                        log::error!("connection {:?}: control write failed: {e}", this.id);
                        this.close();
                    }
                }
            }),
        );
    }

    /// Arms a `read_until(\r\n)` on the control channel, starting from
    /// whatever bytes were already read past the previous command's
    /// delimiter (pipelined input is not otherwise supported, but nothing
    /// already in the buffer is thrown away).
    fn read_next_command(self: &Arc<Self>, carry_over: Vec<u8>) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let fd = self.control.as_raw_fd();
        let this = Arc::clone(self);
        self.reactor.read_until(
            fd,
            carry_over,
            reactor::delimiter(b"\r\n"),
            Box::new(move |res, buf| this.on_command_line(res, buf)),
        );
    }

    fn on_command_line(self: &Arc<Self>, res: io::Result<usize>, buf: Vec<u8>) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        match res {
            Ok(0) => {
                log::debug!("connection {:?}: control channel closed by peer", self.id);
                self.close();
            }
            Ok(m) => {
                let tail = buf[m..].to_vec();
                let line = String::from_utf8_lossy(&buf[..m]);
                let line = line.trim_end_matches("\r\n");
                let cmd = command::parse(line);
                self.dispatch(cmd, tail);
            }
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                log::error!("connection {:?}: command line too long", self.id);
                self.close();
            }
            Err(e) => {
                log::error!("connection {:?}: control read failed: {e}", self.id);
                self.close();
            }
        }
    }

    fn dispatch(self: &Arc<Self>, cmd: Command, tail: Vec<u8>) {
        match cmd {
            Command::User(name) => self.cmd_user(name, tail),
            Command::Quit => self.send_reply("221 Bye!".to_string(), |this| this.close()),
            Command::Noop => {
                self.send_reply("200 Ok".to_string(), move |this| this.read_next_command(tail))
            }
            _ if !self.authenticated.load(Ordering::Acquire) => self.send_reply(
                "530 Not logged in".to_string(),
                move |this| this.read_next_command(tail),
            ),
            Command::Type {
                representation,
                format,
            } => self.cmd_type(representation, format, tail),
            Command::Mode(x) => self.cmd_mode(x, tail),
            Command::Stru(x) => self.cmd_stru(x, tail),
            Command::Pasv => self.cmd_pasv(tail),
            Command::Pwd => {
                self.send_reply("257 /".to_string(), move |this| this.read_next_command(tail))
            }
            Command::Retr(arg) => self.cmd_retr(arg, tail),
            Command::Stor(arg) => self.cmd_stor(arg, tail),
            Command::List(arg) => self.cmd_list(arg, tail),
            Command::Unknown => self.send_reply(
                "500 Unknown command".to_string(),
                move |this| this.read_next_command(tail),
            ),
            Command::Invalid(reason) => self.send_reply(
                format!("501 {reason}"),
                move |this| this.read_next_command(tail),
            ),
        }
    }

    fn cmd_user(self: &Arc<Self>, name: String, tail: Vec<u8>) {
        if name.is_empty() {
            self.send_reply("501 Please, specify a username".to_string(), move |this| {
                this.read_next_command(tail)
            });
        } else if name.eq_ignore_ascii_case("anonymous") {
            self.authenticated.store(true, Ordering::Release);
            self.send_reply("230 Log in successful".to_string(), move |this| {
                this.read_next_command(tail)
            });
        } else {
            self.authenticated.store(false, Ordering::Release);
            self.send_reply("501 Incorrect user name".to_string(), move |this| {
                this.read_next_command(tail)
            });
        }
    }

    fn cmd_type(self: &Arc<Self>, representation: char, format: char, tail: Vec<u8>) {
        let text = if representation == 'A' && format == 'N' {
            "200 Type changed"
        } else {
            "504 Command not implemented for specified value"
        };
        self.send_reply(text.to_string(), move |this| this.read_next_command(tail));
    }

    fn cmd_mode(self: &Arc<Self>, mode: char, tail: Vec<u8>) {
        let text = if mode == 'S' {
            "200 Type changed"
        } else {
            "504 Command not implemented for specified value"
        };
        self.send_reply(text.to_string(), move |this| this.read_next_command(tail));
    }

    fn cmd_stru(self: &Arc<Self>, stru: char, tail: Vec<u8>) {
        let text = if stru == 'F' {
            "200 Type changed"
        } else {
            "504 Command not implemented for specified value"
        };
        self.send_reply(text.to_string(), move |this| this.read_next_command(tail));
    }

    fn cmd_pasv(self: &Arc<Self>, tail: Vec<u8>) {
        let bound_addr = {
            let mut guard = self.pasv_listener.lock().unwrap();
            if guard.is_none() {
                match self.open_pasv_listener() {
                    Ok(listener) => *guard = Some(listener),
                    Err(e) => {
                        log::warn!("connection {:?}: pasv bind failed: {e}", self.id);
                        self.send_reply(
                            "425 Cannot open data connection".to_string(),
                            move |this| this.read_next_command(tail),
                        );
                        return;
                    }
                }
            }
            guard.as_ref().unwrap().local_addr()
        };
        match bound_addr {
            Ok(addr) => {
                let text = format_pasv_reply(addr);
                self.send_reply(text, move |this| this.read_next_command(tail));
            }
            Err(e) => {
                log::warn!("connection {:?}: pasv local_addr failed: {e}", self.id);
                self.send_reply("425 Cannot open data connection".to_string(), move |this| {
                    this.read_next_command(tail)
                });
            }
        }
    }

    fn open_pasv_listener(&self) -> io::Result<TcpListener> {
        let local = self.control.local_addr()?;
        let listener = TcpListener::bind(SocketAddr::new(local.ip(), 0))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn cmd_retr(self: &Arc<Self>, arg: String, tail: Vec<u8>) {
        let target = match path::resolve(&self.root, &arg) {
            Ok(p) => p,
            Err(()) => {
                self.send_reply("501 Invalid path".to_string(), move |this| {
                    this.read_next_command(tail)
                });
                return;
            }
        };
        let file = match std::fs::File::open(&target).and_then(|f| {
            let is_dir = f.metadata()?.is_dir();
            Ok((f, is_dir))
        }) {
            Ok((f, false)) => f,
            _ => {
                self.send_reply("534 Request denied".to_string(), move |this| {
                    this.read_next_command(tail)
                });
                return;
            }
        };
        self.start_transfer_reply(tail, move |this, data, tail| {
            this.send_outbound(data, Box::new(file), tail)
        });
    }

    fn cmd_stor(self: &Arc<Self>, arg: String, tail: Vec<u8>) {
        let target = match path::resolve(&self.root, &arg) {
            Ok(p) => p,
            Err(()) => {
                self.send_reply("501 Invalid path".to_string(), move |this| {
                    this.read_next_command(tail)
                });
                return;
            }
        };
        let file = match std::fs::File::create(&target) {
            Ok(f) => f,
            Err(e) => {
                log::warn!(
                    "connection {:?}: could not open {} for writing: {e}",
                    self.id,
                    target.display()
                );
                self.send_reply("534 Request denied".to_string(), move |this| {
                    this.read_next_command(tail)
                });
                return;
            }
        };
        self.start_transfer_reply(tail, move |this, data, tail| {
            this.recv_inbound(data, file, tail)
        });
    }

    /// Only bare `LIST` is served, against the root itself. An explicit
    /// argument is accepted grammatically but always denied: the original
    /// only ever lists `root.parent_path()` (regardless of the argument
    /// given, since it compares the resolved path against that fixed
    /// value), so every argument that resolves to anything other than that
    /// one fixed path -- which, for a confined child of `root`, is always
    /// -- fails with `534`. See Open Question 1 in DESIGN.md: this crate
    /// redirects the bare case to `root` instead of leaking its parent, but
    /// does not grant `LIST` a capability the original never had.
    fn cmd_list(self: &Arc<Self>, arg: Option<String>, tail: Vec<u8>) {
        if arg.is_some() {
            self.send_reply("534 Request denied".to_string(), move |this| {
                this.read_next_command(tail)
            });
            return;
        }
        let target = self.root.clone();
        let listing = match format_listing(&target) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!(
                    "connection {:?}: cannot list {}: {e}",
                    self.id,
                    target.display()
                );
                self.send_reply("534 Request denied".to_string(), move |this| {
                    this.read_next_command(tail)
                });
                return;
            }
        };
        self.start_transfer_reply(tail, move |this, data, tail| {
            this.send_outbound(data, Box::new(io::Cursor::new(listing)), tail)
        });
    }

    /// Shared skeleton for `RETR`/`STOR`/`LIST`: writes `150`, accepts one
    /// connection on the passive listener, then hands the new data stream
    /// to `on_ready`. The control-channel read chain stays disarmed the
    /// whole time; `tail` is threaded through so the next command read
    /// (once `on_ready`'s transfer eventually finishes) resumes from the
    /// right place.
    fn start_transfer_reply(
        self: &Arc<Self>,
        tail: Vec<u8>,
        on_ready: impl FnOnce(Arc<Connection>, TcpStream, Vec<u8>) + Send + 'static,
    ) {
        let listener_fd = {
            let guard = self.pasv_listener.lock().unwrap();
            guard.as_ref().map(|l| l.as_raw_fd())
        };
        let Some(listener_fd) = listener_fd else {
            self.send_reply("425 Cannot open data connection".to_string(), move |this| {
                this.read_next_command(tail)
            });
            return;
        };
        self.send_reply("150 Opening data connection".to_string(), move |this| {
            let reactor = Arc::clone(&this.reactor);
            let this2 = Arc::clone(&this);
            reactor.accept(
                listener_fd,
                Box::new(move |res| {
                    if !this2.alive.load(Ordering::Acquire) {
                        return;
                    }
                    match res {
                        Ok(fd) => {
                            *this2.transfer_fd.lock().unwrap() = Some(fd);
                            let data = unsafe { TcpStream::from_raw_fd(fd) };
                            on_ready(this2, data, tail);
                        }
                        Err(e) => {
                            log::warn!("connection {:?}: data accept failed: {e}", this2.id);
                            this2.send_reply(
                                "425 Cannot open data connection".to_string(),
                                move |this3| this3.read_next_command(tail),
                            );
                        }
                    }
                }),
            );
        });
    }

    /// Clears the tracked transfer descriptor once a transfer reaches a
    /// terminal reply, so a later `close()` has nothing stale left to
    /// cancel. Must be called on every path out of `send_outbound`/
    /// `recv_inbound`, success or failure alike.
    fn end_transfer(self: &Arc<Self>) {
        self.transfer_fd.lock().unwrap().take();
    }

    /// Drives `RETR`/`LIST`: read up to 500 bytes from `reader`,
    /// translate line endings, write to the data channel, repeat until
    /// EOF.
    fn send_outbound(self: &Arc<Self>, data: TcpStream, mut reader: Box<dyn Read + Send>, tail: Vec<u8>) {
        let mut block = vec![0u8; 500];
        match reader.read(&mut block) {
            Ok(0) => {
                drop(data);
                self.end_transfer();
                self.send_reply("250 Transfer complete".to_string(), move |this| {
                    this.read_next_command(tail)
                });
            }
            Ok(n) => {
                let translated = eol::to_network(&block[..n]);
                let data_fd = data.as_raw_fd();
                let this = Arc::clone(self);
                self.reactor.write(
                    data_fd,
                    translated,
                    Box::new(move |res, _buf| {
                        if !this.alive.load(Ordering::Acquire) {
                            return;
                        }
                        match res {
                            Ok(_) => this.send_outbound(data, reader, tail),
                            Err(e) => {
                                log::warn!("connection {:?}: data write failed: {e}", this.id);
                                this.end_transfer();
                                this.send_reply(
                                    "426 Transfer aborted due to connection close".to_string(),
                                    move |this2| this2.read_next_command(tail),
                                );
                            }
                        }
                    }),
                );
            }
            Err(e) => {
                log::warn!("connection {:?}: file read failed: {e}", self.id);
                self.end_transfer();
                self.send_reply("450 File action not taken".to_string(), move |this| {
                    this.read_next_command(tail)
                });
            }
        }
    }

    /// Drives `STOR`: read up to 500 bytes from the data channel,
    /// translate line endings, write to `file`, repeat until peer EOF.
    fn recv_inbound(self: &Arc<Self>, data: TcpStream, mut file: std::fs::File, tail: Vec<u8>) {
        let data_fd = data.as_raw_fd();
        let this = Arc::clone(self);
        self.reactor.read_some(
            data_fd,
            vec![0u8; 500],
            Box::new(move |res, buf| {
                if !this.alive.load(Ordering::Acquire) {
                    return;
                }
                match res {
                    Ok(0) => {
                        drop(data);
                        this.end_transfer();
                        this.send_reply("250 Transfer complete".to_string(), move |this2| {
                            this2.read_next_command(tail)
                        });
                    }
                    Ok(n) => {
                        let translated = eol::from_network(&buf[..n]);
                        match file.write_all(&translated) {
                            Ok(()) => this.recv_inbound(data, file, tail),
                            Err(e) => {
                                log::warn!("connection {:?}: file write failed: {e}", this.id);
                                this.end_transfer();
                                this.send_reply(
                                    "450 File action not taken".to_string(),
                                    move |this2| this2.read_next_command(tail),
                                );
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("connection {:?}: data read failed: {e}", this.id);
                        this.end_transfer();
                        this.send_reply(
                            "426 Transfer aborted due to connection close".to_string(),
                            move |this2| this2.read_next_command(tail),
                        );
                    }
                }
            }),
        );
    }
}

fn format_pasv_reply(addr: SocketAddr) -> String {
    let octets = match addr.ip() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0], // unreachable in this IPv4-only server
    };
    let port = addr.port();
    format!(
        "227 Entering passive mode ({},{},{},{},{},{})",
        octets[0],
        octets[1],
        octets[2],
        octets[3],
        port >> 8,
        port & 0xff
    )
}

fn format_listing(dir: &Path) -> io::Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(io::Error::new(io::ErrorKind::Other, "not a directory"));
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());
    let mut out = Vec::new();
    for entry in entries {
        let meta = entry.metadata()?;
        out.extend_from_slice(
            format_entry(&entry.file_name().to_string_lossy(), &meta).as_bytes(),
        );
    }
    Ok(out)
}

fn format_entry(name: &str, meta: &std::fs::Metadata) -> String {
    let mode = meta.permissions().mode();
    let kind = if meta.is_dir() { 'd' } else { '-' };
    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    format!(
        "{kind}{}{}{}{}{}{}{}{}{} 1 ftp ftp {:>10} {name}\n",
        bit(0o400, 'r'),
        bit(0o200, 'w'),
        bit(0o100, 'x'),
        bit(0o040, 'r'),
        bit(0o020, 'w'),
        bit(0o010, 'x'),
        bit(0o004, 'r'),
        bit(0o002, 'w'),
        bit(0o001, 'x'),
        meta.len(),
    )
}

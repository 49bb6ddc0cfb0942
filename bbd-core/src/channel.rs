//! Buffered channel: one descriptor over a plain file, a direct-access file, a TCP socket
//! or a process standard stream, with a single read/write buffer, explicit flush and
//! absolute offset bookkeeping.
//!
//! A channel is first allocated from a [`ChannelSpec`] (which binds a listening socket if
//! one is needed) and then opened (which accepts, connects or opens the file). One socket
//! can be read and written through two independently buffered channels with
//! [`BufferedChannel::duplicate`].

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use tracing::debug;

/// Buffer size used when `ChannelSpec::buffer_size` is zero.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

const BACKSPACE: u8 = 0x08;

/// Which way bytes flow through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    ReadWrite,
}

impl Direction {
    pub fn readable(self) -> bool {
        matches!(self, Direction::Read | Direction::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Direction::Write | Direction::ReadWrite)
    }

    /// Direction of a duplicate: read and write swap, read-write stays.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
            Direction::ReadWrite => Direction::ReadWrite,
        }
    }
}

/// Record format. Text channels accept `\r\n` as well as `\n` as a line terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Binary,
    Text,
}

/// How the underlying endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMethod {
    /// Plain sequential file. Write-only opens truncate unless appending.
    Sequential,
    /// Random-access file of fixed-size records. Never truncated on open.
    Direct,
    /// Listening socket; `name` is `port`, `:port` or `host:port`. Binds at allocation.
    Listen,
    /// Initiating socket; `name` is `host:port`, empty host meaning loopback.
    Connect,
    /// Process stdin (read) or stdout (write).
    Stdio,
}

/// Configuration recorded at allocation.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub direction: Direction,
    pub format: Format,
    pub access: AccessMethod,
    pub append: bool,
    /// Refill the whole buffer on each platform read. When off, a refill asks only for the
    /// bytes the caller still needs, so nothing past the current record is consumed.
    pub lookahead: bool,
    /// Interactive line input: backspace erases the previous character of the line.
    pub online: bool,
    pub rewind_on_close: bool,
    pub retain_buffer_on_close: bool,
    /// Zero means [`DEFAULT_BUFFER_SIZE`].
    pub buffer_size: usize,
    /// Record size for direct access files.
    pub record_size: usize,
    /// Expected record count; a new direct-access file is pre-sized to hold this many.
    pub count_hint: usize,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, direction: Direction, access: AccessMethod) -> Self {
        Self {
            name: name.into(),
            direction,
            format: Format::Binary,
            access,
            append: false,
            lookahead: true,
            online: false,
            rewind_on_close: false,
            retain_buffer_on_close: false,
            buffer_size: 0,
            record_size: 0,
            count_hint: 0,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn appending(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn without_lookahead(mut self) -> Self {
        self.lookahead = false;
        self
    }

    pub fn online(mut self) -> Self {
        self.online = true;
        self
    }

    pub fn rewind_on_close(mut self) -> Self {
        self.rewind_on_close = true;
        self
    }

    pub fn retain_buffer_on_close(mut self) -> Self {
        self.retain_buffer_on_close = true;
        self
    }

    pub fn with_records(mut self, record_size: usize, count_hint: usize) -> Self {
        self.record_size = record_size;
        self.count_hint = count_hint;
        self
    }

    fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }
}

/// Overrides applied when a channel is opened.
#[derive(Debug, Clone, Default)]
pub struct OpenOverrides {
    pub name: Option<String>,
    pub direction: Option<Direction>,
    pub buffer_size: Option<usize>,
}

/// Origin of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    /// Not supported; always fails with [`ChannelError::NotImplemented`].
    End,
}

/// Outcome of a buffered read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The destination was filled completely.
    Complete,
    /// The source was already exhausted; nothing was read.
    Eof,
}

/// One line returned by [`BufferedChannel::read_line`], terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub bytes: Vec<u8>,
    /// Length of the terminator that ended the line (0 if the line hit the length limit or EOF).
    pub terminator_len: usize,
}

/// Sub-code of an open failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    BadArguments,
    Resolve,
    Connect,
    Accept,
    Platform,
}

impl std::fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpenFailure::BadArguments => "bad arguments",
            OpenFailure::Resolve => "cannot resolve host",
            OpenFailure::Connect => "cannot connect",
            OpenFailure::Accept => "accept failed",
            OpenFailure::Platform => "platform open failed",
        };
        f.write_str(s)
    }
}

/// Transport-level failure. Codes fall in 300..400.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{name}: port {port} already in use")]
    AddrInUse { name: String, port: u16 },
    #[error("{name}: cannot allocate: {source}")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: {failure}: {source}")]
    Open {
        name: String,
        failure: OpenFailure,
        #[source]
        source: io::Error,
    },
    #[error("{name}: channel is not open")]
    NotOpen { name: String },
    #[error("{name}: channel is already open")]
    AlreadyOpen { name: String },
    #[error("{name}: {op} not allowed on this channel direction")]
    WrongDirection { name: String, op: &'static str },
    #[error("{name}: unread socket input would be lost by switching to write")]
    BufferConflict { name: String },
    #[error("{name}: only socket channels can be duplicated")]
    NotDuplicable { name: String },
    #[error("{name}: read failed: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: short read, wanted {wanted} bytes, got {got}")]
    ShortRead {
        name: String,
        wanted: usize,
        got: usize,
    },
    #[error("{name}: unexpected end of file")]
    UnexpectedEof { name: String },
    #[error("{name}: line limit {max} too small")]
    BadLineLength { name: String, max: usize },
    #[error("{name}: write failed: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: seek failed: {source}")]
    Seek {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{name}: channel is not seekable")]
    NotSeekable { name: String },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("{name}: close failed: {source}")]
    Close {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl ChannelError {
    /// Stable numeric code for diagnostics and exit status.
    pub fn code(&self) -> i32 {
        match self {
            ChannelError::AddrInUse { .. } => 301,
            ChannelError::Allocation { .. } => 302,
            ChannelError::Open { failure, .. } => match failure {
                OpenFailure::BadArguments => 310,
                OpenFailure::Resolve => 311,
                OpenFailure::Connect => 312,
                OpenFailure::Accept => 313,
                OpenFailure::Platform => 314,
            },
            ChannelError::NotOpen { .. } => 320,
            ChannelError::AlreadyOpen { .. } => 321,
            ChannelError::WrongDirection { .. } => 322,
            ChannelError::BufferConflict { .. } => 323,
            ChannelError::NotDuplicable { .. } => 324,
            ChannelError::Read { .. } => 330,
            ChannelError::ShortRead { .. } => 331,
            ChannelError::UnexpectedEof { .. } => 332,
            ChannelError::BadLineLength { .. } => 333,
            ChannelError::Write { .. } => 340,
            ChannelError::Seek { .. } => 350,
            ChannelError::NotSeekable { .. } => 351,
            ChannelError::NotImplemented(_) => 352,
            ChannelError::Close { .. } => 360,
        }
    }
}

enum Endpoint {
    File(File),
    Socket(Arc<TcpStream>),
    Stdin(io::Stdin),
    Stdout(io::Stdout),
}

impl Endpoint {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            let r = match self {
                Endpoint::File(f) => f.read(dst),
                Endpoint::Socket(s) => {
                    let mut s: &TcpStream = s;
                    s.read(dst)
                }
                Endpoint::Stdin(s) => s.lock().read(dst),
                Endpoint::Stdout(_) => return Err(ErrorKind::Unsupported.into()),
            };
            match r {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn write_all(&mut self, src: &[u8]) -> io::Result<()> {
        match self {
            Endpoint::File(f) => f.write_all(src),
            Endpoint::Socket(s) => {
                let mut s: &TcpStream = s;
                s.write_all(src)
            }
            Endpoint::Stdout(s) => s.lock().write_all(src),
            Endpoint::Stdin(_) => Err(ErrorKind::Unsupported.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Endpoint::File(f) => f.flush(),
            Endpoint::Stdout(s) => s.lock().flush(),
            Endpoint::Socket(_) | Endpoint::Stdin(_) => Ok(()),
        }
    }

    #[cfg(unix)]
    fn identity(&self) -> Option<(u64, u64)> {
        use std::os::fd::AsFd;
        use std::os::unix::fs::MetadataExt;

        let fd = match self {
            Endpoint::File(f) => f.as_fd().try_clone_to_owned(),
            Endpoint::Socket(s) => s.as_fd().try_clone_to_owned(),
            Endpoint::Stdin(s) => s.as_fd().try_clone_to_owned(),
            Endpoint::Stdout(s) => s.as_fd().try_clone_to_owned(),
        }
        .ok()?;
        let meta = File::from(fd).metadata().ok()?;
        Some((meta.dev(), meta.ino()))
    }

    #[cfg(not(unix))]
    fn identity(&self) -> Option<(u64, u64)> {
        None
    }
}

/// Buffer occupancy. Read-ahead and staged output never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    Reading { pos: usize, len: usize },
    Writing { len: usize },
}

/// One open I/O endpoint with single buffering.
pub struct BufferedChannel {
    spec: ChannelSpec,
    endpoint: Option<Endpoint>,
    listener: Option<TcpListener>,
    buf: Vec<u8>,
    pending: Pending,
    offset: u64,
    eof: bool,
    /// Shares its socket with the channel it was duplicated from.
    shared: bool,
}

impl std::fmt::Debug for BufferedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedChannel")
            .field("name", &self.spec.name)
            .field("direction", &self.spec.direction)
            .field("access", &self.spec.access)
            .field("open", &self.endpoint.is_some())
            .field("offset", &self.offset)
            .field("shared", &self.shared)
            .finish()
    }
}

impl BufferedChannel {
    /// Record the configuration. Listening sockets are bound here; nothing else touches
    /// the platform until [`open`](Self::open).
    pub fn allocate(spec: ChannelSpec) -> Result<Self, ChannelError> {
        let listener = match spec.access {
            AccessMethod::Listen => Some(bind_listener(&spec.name)?),
            AccessMethod::Connect => {
                parse_host_port(&spec.name).map_err(|source| ChannelError::Allocation {
                    name: spec.name.clone(),
                    source,
                })?;
                None
            }
            _ => None,
        };
        Ok(Self {
            spec,
            endpoint: None,
            listener,
            buf: Vec::new(),
            pending: Pending::Idle,
            offset: 0,
            eof: false,
            shared: false,
        })
    }

    /// Allocate and open in one step.
    pub fn open_new(spec: ChannelSpec) -> Result<Self, ChannelError> {
        let mut ch = Self::allocate(spec)?;
        ch.open()?;
        Ok(ch)
    }

    pub fn open(&mut self) -> Result<(), ChannelError> {
        self.open_with(OpenOverrides::default())
    }

    /// Acquire the platform resource: connect, accept or open the file; then size the
    /// buffer and reset cursor and offset.
    pub fn open_with(&mut self, overrides: OpenOverrides) -> Result<(), ChannelError> {
        if self.endpoint.is_some() {
            return Err(ChannelError::AlreadyOpen {
                name: self.spec.name.clone(),
            });
        }
        if let Some(name) = overrides.name {
            self.spec.name = name;
        }
        if let Some(direction) = overrides.direction {
            self.spec.direction = direction;
        }
        if let Some(size) = overrides.buffer_size {
            self.spec.buffer_size = size;
        }

        let endpoint = match self.spec.access {
            AccessMethod::Connect => self.connect()?,
            AccessMethod::Listen => self.accept()?,
            AccessMethod::Sequential | AccessMethod::Direct => self.open_file()?,
            AccessMethod::Stdio => match self.spec.direction {
                Direction::Read => Endpoint::Stdin(io::stdin()),
                Direction::Write => Endpoint::Stdout(io::stdout()),
                Direction::ReadWrite => {
                    return Err(self.open_error(
                        OpenFailure::BadArguments,
                        io::Error::new(ErrorKind::InvalidInput, "standard streams are one-way"),
                    ))
                }
            },
        };

        let size = self.spec.effective_buffer_size();
        if self.buf.len() != size {
            self.buf = vec![0u8; size];
        }
        self.endpoint = Some(endpoint);
        self.pending = Pending::Idle;
        self.offset = 0;
        self.eof = false;
        debug!(name = %self.spec.name, access = ?self.spec.access, direction = ?self.spec.direction, "channel open");
        Ok(())
    }

    fn open_error(&self, failure: OpenFailure, source: io::Error) -> ChannelError {
        ChannelError::Open {
            name: self.spec.name.clone(),
            failure,
            source,
        }
    }

    fn connect(&self) -> Result<Endpoint, ChannelError> {
        let (host, port) = parse_host_port(&self.spec.name)
            .map_err(|e| self.open_error(OpenFailure::BadArguments, e))?;
        let addrs: Vec<SocketAddr> = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| self.open_error(OpenFailure::Resolve, e))?
            .collect();
        if addrs.is_empty() {
            return Err(self.open_error(
                OpenFailure::Resolve,
                io::Error::new(ErrorKind::NotFound, "no addresses for host"),
            ));
        }
        let mut last = io::Error::new(ErrorKind::NotConnected, "no address attempted");
        for addr in addrs {
            loop {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok(Endpoint::Socket(Arc::new(stream)));
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        last = e;
                        break;
                    }
                }
            }
        }
        Err(self.open_error(OpenFailure::Connect, last))
    }

    fn accept(&self) -> Result<Endpoint, ChannelError> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            self.open_error(
                OpenFailure::BadArguments,
                io::Error::new(ErrorKind::NotConnected, "listening socket already closed"),
            )
        })?;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(name = %self.spec.name, %peer, "accepted connection");
                    let _ = stream.set_nodelay(true);
                    return Ok(Endpoint::Socket(Arc::new(stream)));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.open_error(OpenFailure::Accept, e)),
            }
        }
    }

    fn open_file(&self) -> Result<Endpoint, ChannelError> {
        let spec = &self.spec;
        if spec.name.is_empty() {
            return Err(self.open_error(
                OpenFailure::BadArguments,
                io::Error::new(ErrorKind::InvalidInput, "empty file name"),
            ));
        }
        let mut opts = OpenOptions::new();
        match spec.direction {
            Direction::Read => {
                opts.read(true);
            }
            Direction::Write => {
                opts.write(true).create(true);
            }
            Direction::ReadWrite => {
                opts.read(true).write(true).create(true);
            }
        }
        if spec.direction.writable() {
            if spec.append {
                opts.append(true);
            } else if spec.access == AccessMethod::Sequential && spec.direction == Direction::Write {
                opts.truncate(true);
            }
        }
        let file = opts
            .open(&spec.name)
            .map_err(|e| self.open_error(OpenFailure::Platform, e))?;

        if spec.access == AccessMethod::Direct && spec.direction.writable() && spec.count_hint > 0 {
            let wanted = (spec.record_size as u64).saturating_mul(spec.count_hint as u64);
            let current = file
                .metadata()
                .map_err(|e| self.open_error(OpenFailure::Platform, e))?
                .len();
            if current == 0 && wanted > 0 {
                file.set_len(wanted)
                    .map_err(|e| self.open_error(OpenFailure::Platform, e))?;
            }
        }
        Ok(Endpoint::File(file))
    }

    /// A second channel on the same socket, with its own buffer and the opposite direction.
    /// Closing it never closes the socket out from under the original.
    pub fn duplicate(&self, buffer_size: Option<usize>) -> Result<BufferedChannel, ChannelError> {
        let stream = match &self.endpoint {
            Some(Endpoint::Socket(s)) => Arc::clone(s),
            Some(_) => {
                return Err(ChannelError::NotDuplicable {
                    name: self.spec.name.clone(),
                })
            }
            None => {
                return Err(ChannelError::NotOpen {
                    name: self.spec.name.clone(),
                })
            }
        };
        let mut spec = self.spec.clone();
        spec.direction = spec.direction.reversed();
        if let Some(size) = buffer_size {
            spec.buffer_size = size;
        }
        let size = spec.effective_buffer_size();
        Ok(BufferedChannel {
            spec,
            endpoint: Some(Endpoint::Socket(stream)),
            listener: None,
            buf: vec![0u8; size],
            pending: Pending::Idle,
            offset: 0,
            eof: false,
            shared: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    pub fn direction(&self) -> Direction {
        self.spec.direction
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn is_duplicate(&self) -> bool {
        self.shared
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Port of the listening socket, or of the local end of a connected socket.
    pub fn local_port(&self) -> Option<u16> {
        if let Some(l) = &self.listener {
            return l.local_addr().ok().map(|a| a.port());
        }
        match &self.endpoint {
            Some(Endpoint::Socket(s)) => s.local_addr().ok().map(|a| a.port()),
            _ => None,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Some(Endpoint::Socket(s)) => s.peer_addr().ok(),
            _ => None,
        }
    }

    /// Current logical offset.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    fn not_open(&self) -> ChannelError {
        ChannelError::NotOpen {
            name: self.spec.name.clone(),
        }
    }

    fn require_readable(&self, op: &'static str) -> Result<(), ChannelError> {
        if self.endpoint.is_none() {
            return Err(self.not_open());
        }
        if !self.spec.direction.readable() {
            return Err(ChannelError::WrongDirection {
                name: self.spec.name.clone(),
                op,
            });
        }
        Ok(())
    }

    fn require_writable(&self, op: &'static str) -> Result<(), ChannelError> {
        if self.endpoint.is_none() {
            return Err(self.not_open());
        }
        if !self.spec.direction.writable() {
            return Err(ChannelError::WrongDirection {
                name: self.spec.name.clone(),
                op,
            });
        }
        Ok(())
    }

    /// Refill the buffer from the platform. Returns the number of bytes now buffered.
    fn refill(&mut self, wanted: usize) -> Result<usize, ChannelError> {
        let cap = if self.spec.lookahead {
            self.buf.len()
        } else {
            wanted.clamp(1, self.buf.len())
        };
        let endpoint = match self.endpoint.as_mut() {
            Some(e) => e,
            None => return Err(self.not_open()),
        };
        let n = endpoint
            .read(&mut self.buf[..cap])
            .map_err(|source| ChannelError::Read {
                name: self.spec.name.clone(),
                source,
            })?;
        self.pending = if n == 0 {
            self.eof = true;
            Pending::Idle
        } else {
            Pending::Reading { pos: 0, len: n }
        };
        Ok(n)
    }

    /// Push staged output to the platform.
    fn drain(&mut self) -> Result<usize, ChannelError> {
        let Pending::Writing { len } = self.pending else {
            return Ok(0);
        };
        let endpoint = match self.endpoint.as_mut() {
            Some(e) => e,
            None => return Err(self.not_open()),
        };
        endpoint
            .write_all(&self.buf[..len])
            .map_err(|source| ChannelError::Write {
                name: self.spec.name.clone(),
                source,
            })?;
        self.pending = Pending::Idle;
        Ok(len)
    }

    /// Give back unread input before the buffer is reused for output. Files are rewound
    /// to the logical offset; sockets cannot un-read, so that is refused.
    fn release_read_ahead(&mut self) -> Result<(), ChannelError> {
        let Pending::Reading { pos, len } = self.pending else {
            return Ok(());
        };
        let unread = (len - pos) as i64;
        if unread > 0 {
            match self.endpoint.as_mut() {
                Some(Endpoint::File(f)) => {
                    f.seek(SeekFrom::Current(-unread))
                        .map_err(|source| ChannelError::Seek {
                            name: self.spec.name.clone(),
                            source,
                        })?;
                }
                _ => {
                    return Err(ChannelError::BufferConflict {
                        name: self.spec.name.clone(),
                    })
                }
            }
        }
        self.pending = Pending::Idle;
        Ok(())
    }

    /// Fill `dst` exactly, refilling the buffer as often as needed.
    ///
    /// Returns [`ReadStatus::Eof`] if the source was exhausted before any byte was read,
    /// and [`ChannelError::ShortRead`] if it ran dry part way. Once end of file has been
    /// seen, later reads report it without touching the source again.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<ReadStatus, ChannelError> {
        self.require_readable("read")?;
        if dst.is_empty() {
            return Ok(ReadStatus::Complete);
        }
        if self.eof {
            return Ok(ReadStatus::Eof);
        }
        self.drain()?;

        let mut filled = 0;
        while filled < dst.len() {
            let (pos, len) = match self.pending {
                Pending::Reading { pos, len } if pos < len => (pos, len),
                _ => {
                    let n = self.refill(dst.len() - filled)?;
                    if n == 0 {
                        break;
                    }
                    (0, n)
                }
            };
            let take = (len - pos).min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&self.buf[pos..pos + take]);
            filled += take;
            self.offset += take as u64;
            self.pending = Pending::Reading {
                pos: pos + take,
                len,
            };
        }

        if filled == dst.len() {
            Ok(ReadStatus::Complete)
        } else if filled == 0 {
            Ok(ReadStatus::Eof)
        } else {
            Err(ChannelError::ShortRead {
                name: self.spec.name.clone(),
                wanted: dst.len(),
                got: filled,
            })
        }
    }

    /// Like [`read`](Self::read) but end of file is an error.
    pub fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), ChannelError> {
        match self.read(dst)? {
            ReadStatus::Complete => Ok(()),
            ReadStatus::Eof => Err(ChannelError::UnexpectedEof {
                name: self.spec.name.clone(),
            }),
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ChannelError> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            ReadStatus::Complete => Ok(Some(b[0])),
            ReadStatus::Eof => Ok(None),
        }
    }

    /// Read one line of at most `max_len - 1` bytes, terminator stripped.
    ///
    /// Returns `None` at end of file. On an online channel a backspace removes the previous
    /// byte of the current line.
    pub fn read_line(&mut self, max_len: usize) -> Result<Option<Line>, ChannelError> {
        if max_len < 2 {
            return Err(ChannelError::BadLineLength {
                name: self.spec.name.clone(),
                max: max_len,
            });
        }
        let mut bytes = Vec::new();
        let mut saw_any = false;
        while bytes.len() < max_len - 1 {
            let Some(b) = self.next_byte()? else {
                if !saw_any {
                    return Ok(None);
                }
                return Ok(Some(Line {
                    bytes,
                    terminator_len: 0,
                }));
            };
            saw_any = true;
            match b {
                b'\n' => {
                    let mut terminator_len = 1;
                    if self.spec.format == Format::Text && bytes.last() == Some(&b'\r') {
                        bytes.pop();
                        terminator_len = 2;
                    }
                    return Ok(Some(Line {
                        bytes,
                        terminator_len,
                    }));
                }
                BACKSPACE if self.spec.online => {
                    bytes.pop();
                }
                _ => bytes.push(b),
            }
        }
        Ok(Some(Line {
            bytes,
            terminator_len: 0,
        }))
    }

    /// Stage `src`, pushing the buffer to the platform whenever it fills.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, ChannelError> {
        self.require_writable("write")?;
        self.release_read_ahead()?;
        let mut done = 0;
        while done < src.len() {
            let staged = match self.pending {
                Pending::Writing { len } => len,
                _ => 0,
            };
            if staged == self.buf.len() {
                self.drain()?;
                continue;
            }
            let take = (self.buf.len() - staged).min(src.len() - done);
            self.buf[staged..staged + take].copy_from_slice(&src[done..done + take]);
            done += take;
            self.offset += take as u64;
            self.pending = Pending::Writing {
                len: staged + take,
            };
        }
        Ok(src.len())
    }

    /// Force staged output to the platform. A pure-read channel flushes nothing.
    pub fn flush(&mut self) -> Result<usize, ChannelError> {
        if self.endpoint.is_none() {
            return Err(self.not_open());
        }
        if !self.spec.direction.writable() {
            return Ok(0);
        }
        let n = self.drain()?;
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.flush().map_err(|source| ChannelError::Write {
                name: self.spec.name.clone(),
                source,
            })?;
        }
        Ok(n)
    }

    /// Move the logical offset. Targets inside the current read buffer only move the
    /// cursor; anything else goes to the platform and drops the buffer.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, ChannelError> {
        let seekable = match &self.endpoint {
            None => return Err(self.not_open()),
            Some(e) => matches!(e, Endpoint::File(_)),
        };
        let target = match whence {
            Whence::Start => Some(offset),
            Whence::Current => (self.offset as i64).checked_add(offset),
            Whence::End => return Err(ChannelError::NotImplemented("seek from end")),
        };
        let target = target.ok_or_else(|| self.seek_out_of_range())?;
        if !seekable {
            return Err(ChannelError::NotSeekable {
                name: self.spec.name.clone(),
            });
        }

        if let Pending::Reading { pos, len } = self.pending {
            let start = self.offset as i64 - pos as i64;
            let end = start.saturating_add(len as i64);
            if target >= start && target <= end {
                self.pending = Pending::Reading {
                    pos: (target - start) as usize,
                    len,
                };
                self.offset = target as u64;
                return Ok(self.offset);
            }
        }

        self.drain()?;
        let platform_pos = match self.pending {
            Pending::Reading { len, pos } => (self.offset as i64).saturating_add((len - pos) as i64),
            _ => self.offset as i64,
        };
        let request = if target >= 0 {
            SeekFrom::Start(target as u64)
        } else {
            SeekFrom::Current(
                target
                    .checked_sub(platform_pos)
                    .ok_or_else(|| self.seek_out_of_range())?,
            )
        };
        let name = self.spec.name.clone();
        let new_pos = match self.endpoint.as_mut() {
            Some(Endpoint::File(f)) => f
                .seek(request)
                .map_err(|source| ChannelError::Seek { name, source })?,
            _ => return Err(ChannelError::NotSeekable { name }),
        };
        self.pending = Pending::Idle;
        self.eof = false;
        self.offset = new_pos;
        Ok(new_pos)
    }

    fn seek_out_of_range(&self) -> ChannelError {
        ChannelError::Seek {
            name: self.spec.name.clone(),
            source: io::Error::new(ErrorKind::InvalidInput, "seek offset out of range"),
        }
    }

    /// Seek to record `index` of a direct-access file.
    pub fn seek_record(&mut self, index: u64) -> Result<u64, ChannelError> {
        let offset = index.saturating_mul(self.spec.record_size as u64);
        self.seek(offset as i64, Whence::Start)
    }

    /// Report whether a read could make progress without blocking. With `blocking` set the
    /// call waits for input. Files and stdin are always considered readable.
    pub fn poll_readable(&mut self, blocking: bool) -> Result<bool, ChannelError> {
        self.require_readable("poll")?;
        if self.eof {
            return Ok(true);
        }
        if let Pending::Reading { pos, len } = self.pending {
            if pos < len {
                return Ok(true);
            }
        }
        let stream = match &self.endpoint {
            Some(Endpoint::Socket(s)) => Arc::clone(s),
            _ => return Ok(true),
        };
        self.drain()?;
        if blocking {
            self.refill(self.buf.len())?;
            return Ok(true);
        }
        let name = self.spec.name.clone();
        stream
            .set_nonblocking(true)
            .map_err(|source| ChannelError::Read {
                name: name.clone(),
                source,
            })?;
        let attempt = self.refill(self.buf.len());
        stream
            .set_nonblocking(false)
            .map_err(|source| ChannelError::Read {
                name: name.clone(),
                source,
            })?;
        match attempt {
            Ok(_) => Ok(true),
            Err(ChannelError::Read { source, .. }) if source.kind() == ErrorKind::WouldBlock => {
                self.pending = Pending::Idle;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.close_with(None, None)
    }

    /// Flush, optionally rewind, release the platform resource and the buffer. Closing a
    /// closed channel does nothing.
    pub fn close_with(
        &mut self,
        rewind: Option<bool>,
        retain_buffer: Option<bool>,
    ) -> Result<(), ChannelError> {
        if self.endpoint.is_none() {
            if !self.shared {
                self.listener = None;
            }
            return Ok(());
        }
        let rewind = rewind.unwrap_or(self.spec.rewind_on_close);
        let retain = retain_buffer.unwrap_or(self.spec.retain_buffer_on_close);

        let mut first_err = None;
        if self.spec.direction.writable() {
            if let Err(e) = self.flush() {
                first_err = Some(e);
            }
        }
        if rewind && matches!(self.endpoint, Some(Endpoint::File(_))) {
            if let Err(e) = self.seek(0, Whence::Start) {
                first_err.get_or_insert(e);
            }
        }

        // Dropping the last handle to a shared socket is what closes it.
        self.endpoint = None;
        if !self.shared {
            self.listener = None;
        }
        if !retain {
            self.buf = Vec::new();
        }
        self.pending = Pending::Idle;
        self.eof = false;
        debug!(name = %self.spec.name, duplicate = self.shared, "channel closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn buffered(&self, n: usize) -> Option<&[u8]> {
        if self.endpoint.is_none() || !self.spec.direction.readable() {
            return None;
        }
        match self.pending {
            Pending::Reading { pos, len } if len - pos >= n => Some(&self.buf[pos..pos + n]),
            _ => None,
        }
    }

    pub(crate) fn consume(&mut self, n: usize) {
        if let Pending::Reading { pos, len } = self.pending {
            self.pending = Pending::Reading { pos: pos + n, len };
            self.offset += n as u64;
        }
    }

    pub(crate) fn room(&mut self, n: usize) -> Option<&mut [u8]> {
        if self.endpoint.is_none() || !self.spec.direction.writable() {
            return None;
        }
        let staged = match self.pending {
            Pending::Writing { len } => len,
            Pending::Idle => 0,
            Pending::Reading { .. } => return None,
        };
        if self.buf.len() - staged >= n {
            Some(&mut self.buf[staged..staged + n])
        } else {
            None
        }
    }

    pub(crate) fn commit(&mut self, n: usize) {
        let staged = match self.pending {
            Pending::Writing { len } => len,
            _ => 0,
        };
        self.pending = Pending::Writing { len: staged + n };
        self.offset += n as u64;
    }
}

impl Drop for BufferedChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Best-effort check that two channels reach the same file or device. Returns false
/// whenever identity cannot be determined.
pub fn channels_share_identity(a: &BufferedChannel, b: &BufferedChannel) -> bool {
    match (&a.endpoint, &b.endpoint) {
        (Some(x), Some(y)) => match (x.identity(), y.identity()) {
            (Some(ix), Some(iy)) => ix == iy,
            _ => false,
        },
        _ => false,
    }
}

/// Split `host:port`. A missing host means loopback.
fn parse_host_port(name: &str) -> io::Result<(String, u16)> {
    let (host, port) = match name.rsplit_once(':') {
        Some((h, p)) => (h, p),
        None => ("", name),
    };
    let port: u16 = port.trim().parse().map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("bad port in socket name {name:?}"),
        )
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}

fn bind_listener(name: &str) -> Result<TcpListener, ChannelError> {
    let (host, port) = match name.rsplit_once(':') {
        Some((h, _)) if !h.is_empty() => parse_host_port(name),
        _ => parse_host_port(name).map(|(_, p)| ("0.0.0.0".to_string(), p)),
    }
    .map_err(|source| ChannelError::Allocation {
        name: name.to_string(),
        source,
    })?;
    loop {
        match TcpListener::bind((host.as_str(), port)) {
            Ok(l) => return Ok(l),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                return Err(ChannelError::AddrInUse {
                    name: name.to_string(),
                    port,
                })
            }
            Err(source) => {
                return Err(ChannelError::Allocation {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }
}

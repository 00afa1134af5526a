//! X11 side of the core
//!
//! [`Display`] owns the server connection, the interned atom table and the
//! capability flags discovered at connect time. Everything protocol-shaped
//! lives below this module: window lifecycle, event translation, grabs,
//! selections, drag-and-drop and the input-method bridge.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use x11rb::connection::{Connection as _, RequestConnection as _};
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::xproto::{Atom, AtomEnum, ConnectionExt as _, Screen};
use x11rb::rust_connection::RustConnection;

pub mod dnd;
pub mod grab;
pub mod im;
pub mod selection;
pub mod translate;
pub mod window;

x11rb::atom_manager! {
    /// Atoms interned once at connect time
    pub(crate) Atoms: AtomsCookie {
        // ICCCM / EWMH
        WM_PROTOCOLS,
        WM_DELETE_WINDOW,
        WM_CHANGE_STATE,
        UTF8_STRING,
        _NET_SUPPORTED,
        _NET_WM_NAME,
        _NET_WM_PID,
        _NET_WM_STATE,
        _NET_WM_STATE_MAXIMIZED_HORZ,
        _NET_WM_STATE_MAXIMIZED_VERT,
        _NET_WM_STATE_HIDDEN,
        _NET_WM_STATE_ABOVE,
        _NET_WM_STATE_MODAL,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_WINDOW_TYPE,
        _NET_WM_WINDOW_TYPE_NORMAL,
        _NET_WM_WINDOW_TYPE_DIALOG,
        _NET_WM_WINDOW_TYPE_POPUP_MENU,
        _NET_WM_USER_TIME,
        _MOTIF_WM_HINTS,

        // selections
        CLIPBOARD,
        CLIPBOARD_MANAGER,
        SAVE_TARGETS,
        TARGETS,
        TIMESTAMP,
        INCR,
        _EASEL_SELECTION,

        // drag and drop
        XdndAware,
        XdndSelection,
        XdndEnter,
        XdndPosition,
        XdndStatus,
        XdndLeave,
        XdndDrop,
        XdndFinished,
        XdndTypeList,
        XdndActionCopy,
        XdndActionMove,
        TEXT_URI_LIST: b"text/uri-list",
        TEXT_PLAIN_UTF8: b"text/plain;charset=utf-8",

        // input method transport
        XIM_SERVERS,
        LOCALES,
        TRANSPORT,
        _XIM_XCONNECT,
        _XIM_PROTOCOL,
        _XIM_MOREDATA,
    }
}

/// Errors produced by the X11 side of the core
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// Connecting to the X server failed
    #[error("Failed to connect to the X server: {0}")]
    Connect(#[from] x11rb::errors::ConnectError),
    /// The connection to the X server was lost
    #[error("Connection to the X server failed: {0}")]
    Connection(#[from] ConnectionError),
    /// A request was answered with a protocol error
    #[error("X11 request failed: {0}")]
    Reply(#[from] ReplyError),
    /// A request or resource-id allocation failed
    #[error("X11 request failed: {0}")]
    ReplyOrId(#[from] ReplyOrIdError),
    /// Polling the connection failed
    #[error("Polling the X11 connection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Optional server features discovered once at connect time
///
/// These gate fast paths and fallbacks but never change any contract:
/// missing capabilities degrade features instead of failing calls.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// MIT-SHM with shared pixmaps, for zero-copy surface uploads
    pub shm: bool,
    /// XInput 2, for device grabs that keep motion flowing
    pub xinput: bool,
    /// XFIXES 5, for selection-owner change notifications
    pub xfixes: bool,
    /// The window manager advertises `_NET_WM_USER_TIME`
    pub user_time: bool,
}

impl Capabilities {
    fn probe(conn: &RustConnection, screen: &Screen, atoms: &Atoms) -> Result<Self, X11Error> {
        use x11rb::protocol::{shm, xfixes, xinput};

        let shm = if conn.extension_information(shm::X11_EXTENSION_NAME)?.is_some() {
            match shm::ConnectionExt::shm_query_version(conn)?.reply() {
                Ok(version) => {
                    info!(
                        "MIT-SHM {}.{}, shared pixmaps: {}",
                        version.major_version, version.minor_version, version.shared_pixmaps
                    );
                    version.shared_pixmaps
                }
                Err(err) => {
                    warn!(?err, "MIT-SHM version query failed");
                    false
                }
            }
        } else {
            false
        };

        let xinput = if conn
            .extension_information(xinput::X11_EXTENSION_NAME)?
            .is_some()
        {
            match xinput::ConnectionExt::xinput_xi_query_version(conn, 2, 0)?.reply() {
                Ok(version) => {
                    info!(
                        "XInput {}.{}",
                        version.major_version, version.minor_version
                    );
                    version.major_version >= 2
                }
                Err(err) => {
                    warn!(?err, "XInput version query failed");
                    false
                }
            }
        } else {
            false
        };

        let xfixes = if conn
            .extension_information(xfixes::X11_EXTENSION_NAME)?
            .is_some()
        {
            match xfixes::ConnectionExt::xfixes_query_version(conn, 5, 0)?.reply() {
                Ok(version) => {
                    info!(
                        "XFIXES {}.{}",
                        version.major_version, version.minor_version
                    );
                    version.major_version >= 5
                }
                Err(err) => {
                    warn!(?err, "XFIXES version query failed");
                    false
                }
            }
        } else {
            false
        };

        let user_time = conn
            .get_property(
                false,
                screen.root,
                atoms._NET_SUPPORTED,
                AtomEnum::ATOM,
                0,
                4096,
            )?
            .reply()
            .ok()
            .and_then(|reply| {
                reply
                    .value32()
                    .map(|mut supported| supported.any(|atom| atom == atoms._NET_WM_USER_TIME))
            })
            .unwrap_or(false);

        Ok(Capabilities {
            shm,
            xinput,
            xfixes,
            user_time,
        })
    }
}

/// What a [`Display::wait`] call woke up for
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    /// The server socket has data to read
    pub socket: bool,
    /// Another thread signalled the wakeup handle
    pub wakeup: bool,
}

/// Cross-thread wakeup handle for the UI thread's wait primitive
///
/// Cloneable and sendable; [`wake`](Wakeup::wake) makes a concurrent or
/// future [`Display::wait`] return immediately.
#[derive(Debug, Clone)]
pub struct Wakeup(Arc<OwnedFd>);

impl Wakeup {
    /// Interrupt the UI thread's wait
    pub fn wake(&self) {
        // writing an eventfd never blocks for a counter this small
        let _ = rustix::io::write(&*self.0, &1u64.to_ne_bytes());
    }
}

/// The display connection and everything discovered at connect time
#[derive(Debug)]
pub struct Display {
    pub(crate) conn: Arc<RustConnection>,
    pub(crate) screen: Screen,
    pub(crate) atoms: Atoms,
    pub(crate) caps: Capabilities,
    wakeup: Arc<OwnedFd>,
    /// timestamp of the most recent timestamped event
    pub(crate) last_event_time: u32,
    /// timestamp of the most recent key or button press
    pub(crate) last_user_time: u32,
}

impl Display {
    /// Connect to the X server named by `DISPLAY`
    pub fn connect() -> Result<Display, X11Error> {
        let (conn, screen_num) = RustConnection::connect(None)?;
        let screen = conn.setup().roots[screen_num].clone();
        let atoms = Atoms::new(&conn)?.reply()?;
        let caps = Capabilities::probe(&conn, &screen, &atoms)?;

        let wakeup = rustix::event::eventfd(
            0,
            rustix::event::EventfdFlags::CLOEXEC | rustix::event::EventfdFlags::NONBLOCK,
        )
        .map_err(std::io::Error::from)?;

        debug!(screen = screen_num, ?caps, "Display connected");

        Ok(Display {
            conn: Arc::new(conn),
            screen,
            atoms,
            caps,
            wakeup: Arc::new(wakeup),
            last_event_time: x11rb::CURRENT_TIME,
            last_user_time: x11rb::CURRENT_TIME,
        })
    }

    /// A cloneable handle other threads can use to interrupt [`wait`](Self::wait)
    pub fn wakeup_handle(&self) -> Wakeup {
        Wakeup(self.wakeup.clone())
    }

    /// Block until the socket is readable, the wakeup fd is signalled or
    /// the timeout elapses
    ///
    /// `None` blocks indefinitely. The wakeup fd is drained before
    /// returning so a single `wake` produces a single wakeup.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Readiness, X11Error> {
        use rustix::event::{poll, PollFd, PollFlags};

        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let stream = self.conn.stream();
        let mut fds = [
            PollFd::new(&stream, PollFlags::IN),
            PollFd::new(&*self.wakeup, PollFlags::IN),
        ];
        match poll(&mut fds, timeout_ms) {
            Ok(_) => {}
            Err(rustix::io::Errno::INTR) => return Ok(Readiness::default()),
            Err(err) => return Err(X11Error::Io(err.into())),
        }

        let readiness = Readiness {
            socket: !fds[0].revents().is_empty(),
            wakeup: !fds[1].revents().is_empty(),
        };
        if readiness.wakeup {
            let mut buf = [0u8; 8];
            let _ = rustix::io::read(&*self.wakeup, &mut buf);
        }
        Ok(readiness)
    }

    /// Block until only the socket is readable, used by the scoped
    /// selection sub-pump
    pub(crate) fn wait_readable(&self, timeout: Duration) -> Result<bool, X11Error> {
        use rustix::event::{poll, PollFd, PollFlags};

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let stream = self.conn.stream();
        let mut fds = [PollFd::new(&stream, PollFlags::IN)];
        match poll(&mut fds, timeout_ms) {
            Ok(n) => Ok(n > 0),
            Err(rustix::io::Errno::INTR) => Ok(false),
            Err(err) => Err(X11Error::Io(err.into())),
        }
    }

    /// Flush buffered requests to the server
    pub fn flush(&self) -> Result<(), X11Error> {
        self.conn.flush()?;
        Ok(())
    }

    /// Record the timestamp of a server event
    pub(crate) fn note_event_time(&mut self, time: u32) {
        if time != x11rb::CURRENT_TIME {
            self.last_event_time = time;
        }
    }

    /// Record the timestamp of a direct user interaction
    pub(crate) fn note_user_time(&mut self, time: u32) {
        if time != x11rb::CURRENT_TIME {
            self.last_event_time = time;
            self.last_user_time = time;
        }
    }

    /// Intern an arbitrary atom by name
    pub(crate) fn intern(&self, name: &str) -> Result<Atom, X11Error> {
        Ok(self.conn.intern_atom(false, name.as_bytes())?.reply()?.atom)
    }

    /// Look up the name of an atom, for type negotiation and logging
    pub(crate) fn atom_name(&self, atom: Atom) -> Result<String, X11Error> {
        let reply = self.conn.get_atom_name(atom)?.reply()?;
        Ok(String::from_utf8_lossy(&reply.name).into_owned())
    }
}

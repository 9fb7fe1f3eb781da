use std::sync::Arc;

use anyhow::{Result, anyhow};
use sysinfo::Pid;
use tracing::instrument;
use xcb::{
    Connection,
    screensaver::{QueryInfo, QueryInfoReply},
    x::{self, ATOM_ANY, Atom, Drawable, GetProperty, InternAtom, QueryPointer, Window},
};

use super::{ActiveWindowData, AdapterSlot, PointerPosition, Reading, SignalAdapter, SignalKind};

fn intern_atom(conn: &Connection, name: &[u8]) -> Result<Atom> {
    let reply = conn.wait_for_reply(conn.send_request(&InternAtom {
        only_if_exists: false,
        name,
    }))?;
    Ok(reply.atom())
}

fn get_pid(conn: &Connection, window: Window, pid_atom: Atom) -> Result<Option<u32>> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window,
        property: pid_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    Ok(result.value::<u32>().first().copied())
}

fn get_process_name(id: u32) -> Option<String> {
    let system = sysinfo::System::new_all();
    let process = system.process(Pid::from_u32(id))?;
    process
        .exe()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string())
}

fn get_active_window(conn: &Connection, root: Window, active_window_atom: Atom) -> Result<Window> {
    let result = conn.wait_for_reply(conn.send_request(&GetProperty {
        delete: false,
        window: root,
        property: active_window_atom,
        r#type: ATOM_ANY,
        long_offset: 0,
        long_length: 1,
    }))?;
    result
        .value::<Window>()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("No active window reported by the window manager"))
}

fn get_name(conn: &Connection, window: Window, wm_name_atom: Atom) -> Result<String> {
    let wm_name = conn.wait_for_reply(conn.send_request(&x::GetProperty {
        delete: false,
        window,
        property: wm_name_atom,
        r#type: x::ATOM_ANY,
        long_offset: 0,
        long_length: 1024,
    }))?;
    Ok(String::from_utf8_lossy(wm_name.value()).into_owned())
}

/// One X connection shared by the three adapters.
struct X11Session {
    connection: Connection,
    preferred_screen: usize,
    active_window_atom: Atom,
    window_name_atom: Atom,
    pid_atom: Atom,
}

impl X11Session {
    fn connect() -> Result<Self> {
        let (connection, preferred_screen) = xcb::Connection::connect(None)?;
        let active_window_atom = intern_atom(&connection, b"_NET_ACTIVE_WINDOW")?;
        let window_name_atom = intern_atom(&connection, b"_NET_WM_NAME")?;
        let pid_atom = intern_atom(&connection, b"_NET_WM_PID")?;
        Ok(Self {
            connection,
            preferred_screen: preferred_screen.max(0) as usize,
            active_window_atom,
            window_name_atom,
            pid_atom,
        })
    }

    // Currently the application only supports 1 x11 screen.
    fn root(&self) -> Result<Window> {
        self.connection
            .get_setup()
            .roots()
            .nth(self.preferred_screen)
            .map(|screen| screen.root())
            .ok_or_else(|| anyhow!("Screen {} is not available", self.preferred_screen))
    }
}

/// Creates idle, window and pointer adapters over a single X connection. Fails when there is no
/// X server to talk to.
pub fn adapters() -> Result<Vec<AdapterSlot>> {
    let session = Arc::new(X11Session::connect()?);
    Ok(vec![
        AdapterSlot::Available(Box::new(X11IdleAdapter {
            session: session.clone(),
        })),
        AdapterSlot::Available(Box::new(X11WindowAdapter {
            session: session.clone(),
        })),
        AdapterSlot::Available(Box::new(X11PointerAdapter { session })),
    ])
}

/// Reads the XScreenSaver idle counter.
pub struct X11IdleAdapter {
    session: Arc<X11Session>,
}

impl SignalAdapter for X11IdleAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Idle
    }

    #[instrument(skip(self))]
    fn read(&mut self) -> Result<Reading> {
        let root = self.session.root()?;
        let idle = self.session.connection.send_request(&QueryInfo {
            drawable: Drawable::Window(root),
        });
        let reply: QueryInfoReply = self.session.connection.wait_for_reply(idle)?;
        Ok(Reading::IdleMs(reply.ms_since_user_input()))
    }
}

/// Reads the EWMH active window and resolves its process.
pub struct X11WindowAdapter {
    session: Arc<X11Session>,
}

impl SignalAdapter for X11WindowAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Window
    }

    #[instrument(skip(self))]
    fn read(&mut self) -> Result<Reading> {
        let session = &self.session;
        let root = session.root()?;
        let active_window =
            get_active_window(&session.connection, root, session.active_window_atom)?;
        let window_name = get_name(&session.connection, active_window, session.window_name_atom)?;
        let process_name = get_pid(&session.connection, active_window, session.pid_atom)?
            .and_then(get_process_name)
            .unwrap_or_default();
        Ok(Reading::Window(ActiveWindowData {
            window_title: window_name.into(),
            process_name: process_name.into(),
        }))
    }
}

/// Reads the pointer position relative to the root window.
pub struct X11PointerAdapter {
    session: Arc<X11Session>,
}

impl SignalAdapter for X11PointerAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Pointer
    }

    #[instrument(skip(self))]
    fn read(&mut self) -> Result<Reading> {
        let root = self.session.root()?;
        let reply = self
            .session
            .connection
            .wait_for_reply(self.session.connection.send_request(&QueryPointer { window: root }))?;
        Ok(Reading::Pointer(PointerPosition {
            x: i32::from(reply.root_x()),
            y: i32::from(reply.root_y()),
        }))
    }
}

//! Contains logic for reading user activity signals from different environments.
//! Every OS capability (idle counter, foreground window, pointer position) is exposed as its own
//! [SignalAdapter] so each one can be granted, denied or missing independently.
//! [platform_adapters] resolves what the current build and platform can offer.

#[cfg(feature = "win")]
pub mod win;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "win")]
extern crate windows;

#[cfg(feature = "x11")]
extern crate xcb;

use std::{fmt::Display, path::Path, sync::Arc};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const UNKNOWN_APP: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindowData {
    /// Name of the window. For example 'bash in hello' or 'Document 1' or 'Vibing in YouTube -
    /// Chrome'
    pub window_title: Arc<str>,
    /// Full path to an executable. For example /home/etc/nvim
    pub process_name: Arc<str>,
}

impl ActiveWindowData {
    /// Short application name used for usage counters. `/usr/bin/nvim` becomes `nvim`. Windows of
    /// processes that refuse inspection have no executable and count as `unknown`.
    pub fn app_name(&self) -> Arc<str> {
        if self.process_name.is_empty() {
            return Arc::from(UNKNOWN_APP);
        }
        Path::new(self.process_name.as_ref())
            .file_stem()
            .and_then(|v| v.to_str())
            .map(Arc::from)
            .unwrap_or_else(|| self.process_name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerPosition {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Idle,
    Window,
    Pointer,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Idle, SignalKind::Window, SignalKind::Pointer];

    /// Name of the OS capability behind the signal.
    pub fn capability_name(self) -> &'static str {
        match self {
            SignalKind::Idle => "idle-time",
            SignalKind::Window => "foreground-window",
            SignalKind::Pointer => "pointer-position",
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Idle => write!(f, "idle"),
            SignalKind::Window => write!(f, "window"),
            SignalKind::Pointer => write!(f, "pointer"),
        }
    }
}

/// Raw value returned by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// Milliseconds since the last user input.
    IdleMs(u32),
    Window(ActiveWindowData),
    Pointer(PointerPosition),
}

/// Failures adapters can report with a known meaning. Anything else is treated as transient.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Contract every platform capability must implement.
#[cfg_attr(test, mockall::automock)]
pub trait SignalAdapter: Send + 'static {
    fn kind(&self) -> SignalKind;

    /// Performs the cheapest query the capability offers.
    fn read(&mut self) -> Result<Reading>;
}

/// Result of trying to load an adapter for one signal kind.
pub enum AdapterSlot {
    Available(Box<dyn SignalAdapter>),
    Unavailable { kind: SignalKind, reason: String },
}

impl AdapterSlot {
    pub fn kind(&self) -> SignalKind {
        match self {
            AdapterSlot::Available(adapter) => adapter.kind(),
            AdapterSlot::Unavailable { kind, .. } => *kind,
        }
    }

    fn unavailable_all(reason: &str) -> Vec<AdapterSlot> {
        SignalKind::ALL
            .into_iter()
            .map(|kind| AdapterSlot::Unavailable {
                kind,
                reason: reason.to_string(),
            })
            .collect()
    }
}

/// Loads the adapters supported by this build. Missing backends never fail, they only produce
/// [AdapterSlot::Unavailable] entries.
pub fn platform_adapters() -> Vec<AdapterSlot> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "win")] {
            win::adapters()
        }
        else if #[cfg(feature = "x11")] {
            match x11::adapters() {
                Ok(adapters) => adapters,
                Err(e) => {
                    tracing::warn!("Failed to connect to X server {e:?}");
                    AdapterSlot::unavailable_all(&format!("x11 connection failed: {e}"))
                }
            }
        }
        else {
            AdapterSlot::unavailable_all("no signal backend was compiled in")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveWindowData, AdapterSlot, SignalKind};

    #[test]
    fn app_name_strips_directories_and_extension() {
        let window = ActiveWindowData {
            window_title: "main.rs - nvim".into(),
            process_name: "/usr/bin/nvim".into(),
        };
        assert_eq!(window.app_name().as_ref(), "nvim");

        let window = ActiveWindowData {
            window_title: "Inbox".into(),
            process_name: "C:\\Program Files\\Mail\\mail.exe".into(),
        };
        assert!(window.app_name().ends_with("mail"));

        let window = ActiveWindowData {
            window_title: "Task Manager".into(),
            process_name: "".into(),
        };
        assert_eq!(window.app_name().as_ref(), "unknown");
    }

    #[test]
    fn unavailable_slots_cover_every_kind() {
        let slots = AdapterSlot::unavailable_all("nothing here");
        let kinds = slots.iter().map(AdapterSlot::kind).collect::<Vec<_>>();
        assert_eq!(kinds, SignalKind::ALL.to_vec());
    }
}

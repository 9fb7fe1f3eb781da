use anyhow::{Result, anyhow};
use tracing::{debug, error};
use windows::{
    Win32::{
        Foundation::{BOOL, CloseHandle, E_ACCESSDENIED, GetLastError, HANDLE, HWND, POINT},
        System::{
            Diagnostics::Debug::{
                FORMAT_MESSAGE_FROM_SYSTEM, FORMAT_MESSAGE_IGNORE_INSERTS, FormatMessageW,
            },
            SystemInformation::GetTickCount,
            SystemServices::{LANG_ENGLISH, SUBLANG_ENGLISH_US},
            Threading::{
                OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
                QueryFullProcessImageNameW,
            },
        },
        UI::{
            Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO},
            WindowsAndMessaging::{
                GetCursorPos, GetForegroundWindow, GetWindowTextW, GetWindowThreadProcessId,
            },
        },
    },
    core::PWSTR,
};

use super::{ActiveWindowData, AdapterSlot, PointerPosition, Reading, SignalAdapter, SignalKind};

fn last_error_message() -> String {
    let err = unsafe { GetLastError() };
    let mut message_buffer = [0u16; 2048];
    let size = unsafe {
        FormatMessageW(
            FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
            None,
            err.0,
            LANG_ENGLISH | (SUBLANG_ENGLISH_US << 10),
            PWSTR::from_raw(message_buffer.as_mut_ptr()),
            2048,
            None,
        )
    };
    String::from_utf16_lossy(&message_buffer[0..size as usize])
}

#[tracing::instrument]
pub fn get_active() -> Result<ActiveWindowData> {
    let window = unsafe { GetForegroundWindow() };

    if window.is_invalid() {
        return Err(anyhow!("Failed to get foreground window"));
    }

    let mut id = 0u32;
    unsafe { GetWindowThreadProcessId(window, Some(&mut id)) };
    if id == 0 {
        return Err(anyhow!("Failed to get active window {}", last_error_message()));
    }
    let mut text: [u16; 4096] = [0; 4096];
    let process_handle = match unsafe {
        OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, BOOL::from(false), id)
    } {
        Ok(handle) => handle,
        Err(e) if is_protected_process(&e) => {
            debug!("Process {id} refuses inspection, reporting its window without an executable");
            let title = unsafe { get_window_title(window, &mut text) };
            return Ok(ActiveWindowData {
                process_name: "".into(),
                window_title: title.into(),
            });
        }
        Err(e) => {
            error!("Failed to open process {e:?}");
            return Err(e.into());
        }
    };

    let process_name = unsafe { get_window_process_path(process_handle, &mut text) }
        .inspect_err(|e| error!("Failed to get window process path {e:?}"));
    let title = unsafe { get_window_title(window, &mut text) };

    unsafe { CloseHandle(process_handle) }
        .inspect_err(|e| error!("Failed to close handle {e:?}"))?;

    Ok(ActiveWindowData {
        process_name: process_name?.into(),
        window_title: title.into(),
    })
}

/// Elevated or protected processes refuse inspection by a regular user. That says nothing about
/// the ability to read the foreground window in general.
fn is_protected_process(e: &windows::core::Error) -> bool {
    e.code() == E_ACCESSDENIED
}

unsafe fn get_window_process_path(window_handle: HANDLE, text: &mut [u16]) -> Result<String> {
    unsafe {
        let mut length = text.len() as u32;
        QueryFullProcessImageNameW(
            window_handle,
            PROCESS_NAME_WIN32,
            windows::core::PWSTR(text.as_mut_ptr()),
            &mut length,
        )?;
        Ok(String::from_utf16_lossy(&text[..length as usize]))
    }
}

unsafe fn get_window_title(window_handle: HWND, text: &mut [u16]) -> String {
    let len = unsafe { GetWindowTextW(window_handle, text) };
    String::from_utf16_lossy(&text[..len as usize])
}

pub fn get_idle_time() -> Result<u32> {
    let mut last: LASTINPUTINFO = LASTINPUTINFO {
        cbSize: size_of::<LASTINPUTINFO>() as u32,
        dwTime: 0,
    };
    let is_success = unsafe { GetLastInputInfo(&mut last) };
    if !is_success.as_bool() {
        return Err(anyhow!("Failed to retrieve user idle time"));
    }

    let tick_count = unsafe { GetTickCount() };
    Ok(idle_since(tick_count, last.dwTime))
}

/// Both tick counts wrap around every 49.7 days.
fn idle_since(tick_count: u32, last_input: u32) -> u32 {
    tick_count.wrapping_sub(last_input)
}

pub fn get_pointer_position() -> Result<PointerPosition> {
    let mut point = POINT::default();
    unsafe { GetCursorPos(&mut point) }?;
    Ok(PointerPosition {
        x: point.x,
        y: point.y,
    })
}

pub fn adapters() -> Vec<AdapterSlot> {
    vec![
        AdapterSlot::Available(Box::new(WindowsIdleAdapter)),
        AdapterSlot::Available(Box::new(WindowsWindowAdapter)),
        AdapterSlot::Available(Box::new(WindowsPointerAdapter)),
    ]
}

pub struct WindowsIdleAdapter;

impl SignalAdapter for WindowsIdleAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Idle
    }

    fn read(&mut self) -> Result<Reading> {
        get_idle_time()
            .map(Reading::IdleMs)
            .inspect_err(|e| error!("Failed to get idle time {e:?}"))
    }
}

pub struct WindowsWindowAdapter;

impl SignalAdapter for WindowsWindowAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Window
    }

    fn read(&mut self) -> Result<Reading> {
        get_active()
            .map(Reading::Window)
            .inspect_err(|e| error!("Failed to get active window {e:?}"))
    }
}

pub struct WindowsPointerAdapter;

impl SignalAdapter for WindowsPointerAdapter {
    fn kind(&self) -> SignalKind {
        SignalKind::Pointer
    }

    fn read(&mut self) -> Result<Reading> {
        get_pointer_position()
            .map(Reading::Pointer)
            .inspect_err(|e| error!("Failed to get pointer position {e:?}"))
    }
}

use std::ffi::c_void;
use std::mem;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use windows::Win32::Foundation::{BOOL, HWND, LPARAM, POINT, RECT, WPARAM};
use windows::Win32::Graphics::Gdi::{
    CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDIBits, GetWindowDC,
    ReleaseDC, ScreenToClient, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
    HBITMAP, HDC, HGDIOBJ,
};
use windows::Win32::Storage::Xps::{PrintWindow, PRINT_WINDOW_FLAGS};
use windows::Win32::UI::Input::KeyboardAndMouse::{GetAsyncKeyState, VkKeyScanW};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClientRect, GetWindowPlacement, GetWindowRect, GetWindowTextLengthW,
    GetWindowTextW, IsWindow, IsWindowVisible, PostMessageW, SendMessageW, WINDOWPLACEMENT,
    WM_KEYDOWN, WM_KEYUP, WM_LBUTTONDBLCLK, WM_LBUTTONDOWN, WM_LBUTTONUP, WM_MOUSEMOVE,
};

use crate::capture::plan_capture;
use crate::logger;
use crate::types::*;
use super::{Platform, WindowHandle};

// Not exposed by the metadata; Windows 8.1+ renders DirectComposition content with it.
const PW_CLIENTONLY: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(1);
const PW_RENDERFULLCONTENT: PRINT_WINDOW_FLAGS = PRINT_WINDOW_FLAGS(2);
const MK_LBUTTON: usize = 0x0001;

fn hwnd_of(id: WindowId) -> HWND {
    HWND(id as usize as *mut c_void)
}

fn window_title(hwnd: HWND) -> String {
    unsafe {
        let len = GetWindowTextLengthW(hwnd);
        if len <= 0 {
            return String::new();
        }
        let mut buf = vec![0u16; len as usize + 1];
        let n = GetWindowTextW(hwnd, &mut buf);
        String::from_utf16_lossy(&buf[..n.max(0) as usize])
    }
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let out = &mut *(lparam.0 as *mut Vec<(WindowId, String)>);
    if IsWindowVisible(hwnd).as_bool() {
        let title = window_title(hwnd);
        let title = title.trim();
        if !title.is_empty() {
            out.push((hwnd.0 as usize as WindowId, title.to_string()));
        }
    }
    BOOL(1)
}

pub struct Win32Platform;

impl Platform for Win32Platform {
    fn get_instances(&self, pattern: &str) -> Vec<(WindowId, String)> {
        let re = match Regex::new(&format!("(?i){}", pattern)) {
            Ok(r) => r,
            Err(e) => {
                logger::error(&format!("invalid pattern '{}': {}", pattern, e));
                return Vec::new();
            }
        };

        let mut all: Vec<(WindowId, String)> = Vec::new();
        unsafe {
            if let Err(e) = EnumWindows(Some(collect_window), LPARAM(&mut all as *mut _ as isize)) {
                logger::warn_p("win32", &format!("EnumWindows failed: {}", e));
            }
        }

        all.into_iter()
            .filter(|(_, title)| re.is_match(title))
            .inspect(|(wid, title)| {
                logger::info_p("win32", &format!("found window: \"{}\" (hwnd: {:#x})", title, wid));
            })
            .collect()
    }

    fn create_window(&self, window_id: WindowId) -> Box<dyn WindowHandle> {
        Box::new(Win32Window { window_id })
    }

    fn is_key_down(&self, vk: u16) -> bool {
        unsafe { GetAsyncKeyState(vk as i32) < 0 }
    }

    fn char_key_code(&self, ch: char) -> Option<u16> {
        let mut units = [0u16; 2];
        if ch.encode_utf16(&mut units).len() != 1 {
            return None;
        }
        let scan = unsafe { VkKeyScanW(units[0]) };
        if scan == -1 {
            return None;
        }
        Some((scan as u16) & 0xFF)
    }
}

struct Win32Window {
    window_id: WindowId,
}

/// GDI objects acquired for one capture. Released on drop, whatever the outcome.
struct GdiCapture {
    hwnd: HWND,
    window_dc: HDC,
    mem_dc: HDC,
    bitmap: HBITMAP,
    previous: HGDIOBJ,
}

impl Drop for GdiCapture {
    fn drop(&mut self) {
        unsafe {
            if !self.previous.is_invalid() {
                SelectObject(self.mem_dc, self.previous);
            }
            if !self.bitmap.is_invalid() {
                let _ = DeleteObject(HGDIOBJ(self.bitmap.0));
            }
            if !self.mem_dc.is_invalid() {
                let _ = DeleteDC(self.mem_dc);
            }
            if !self.window_dc.is_invalid() {
                ReleaseDC(self.hwnd, self.window_dc);
            }
        }
    }
}

impl Win32Window {
    fn hwnd(&self) -> HWND {
        hwnd_of(self.window_id)
    }

    fn post(&self, msg: u32, wparam: usize, lparam: isize) -> Result<()> {
        unsafe { PostMessageW(self.hwnd(), msg, WPARAM(wparam), LPARAM(lparam)) }
            .with_context(|| format!("PostMessageW({:#x}) to {:#x}", msg, self.window_id))
    }

    fn client_rect_size(&self) -> Option<(i32, i32)> {
        let mut rc = RECT::default();
        unsafe { GetClientRect(self.hwnd(), &mut rc) }.ok()?;
        Some((rc.right - rc.left, rc.bottom - rc.top))
    }

    fn restore_size(&self) -> Option<(i32, i32)> {
        let mut placement = WINDOWPLACEMENT {
            length: mem::size_of::<WINDOWPLACEMENT>() as u32,
            ..Default::default()
        };
        unsafe { GetWindowPlacement(self.hwnd(), &mut placement) }.ok()?;
        let r = placement.rcNormalPosition;
        Some((r.right - r.left, r.bottom - r.top))
    }

    fn window_rect_size(&self) -> Option<(i32, i32)> {
        let mut rc = RECT::default();
        unsafe { GetWindowRect(self.hwnd(), &mut rc) }.ok()?;
        Some((rc.right - rc.left, rc.bottom - rc.top))
    }

    fn render(&self, width: i32, height: i32, client_only: bool) -> Result<Capture> {
        let hwnd = self.hwnd();
        unsafe {
            let mut gdi = GdiCapture {
                hwnd,
                window_dc: GetWindowDC(hwnd),
                mem_dc: HDC::default(),
                bitmap: HBITMAP::default(),
                previous: HGDIOBJ::default(),
            };
            if gdi.window_dc.is_invalid() {
                bail!("GetWindowDC failed");
            }
            gdi.mem_dc = CreateCompatibleDC(gdi.window_dc);
            if gdi.mem_dc.is_invalid() {
                bail!("CreateCompatibleDC failed");
            }
            gdi.bitmap = CreateCompatibleBitmap(gdi.window_dc, width, height);
            if gdi.bitmap.is_invalid() {
                bail!("CreateCompatibleBitmap({}x{}) failed", width, height);
            }
            gdi.previous = SelectObject(gdi.mem_dc, HGDIOBJ(gdi.bitmap.0));

            let flags = if client_only {
                PRINT_WINDOW_FLAGS(PW_CLIENTONLY.0 | PW_RENDERFULLCONTENT.0)
            } else {
                PW_RENDERFULLCONTENT
            };
            if !PrintWindow(hwnd, gdi.mem_dc, flags).as_bool() {
                bail!("PrintWindow failed");
            }

            let mut info = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: width,
                    biHeight: -height, // top-down rows
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                ..Default::default()
            };
            let bytes_per_row = width as u32 * 4;
            let mut data = vec![0u8; (bytes_per_row * height as u32) as usize];
            // The bitmap must not be selected into a DC while GetDIBits reads it.
            SelectObject(gdi.mem_dc, gdi.previous);
            gdi.previous = HGDIOBJ::default();
            let lines = GetDIBits(
                gdi.mem_dc,
                gdi.bitmap,
                0,
                height as u32,
                Some(data.as_mut_ptr() as *mut c_void),
                &mut info,
                DIB_RGB_COLORS,
            );
            if lines != height {
                bail!("GetDIBits copied {} of {} rows", lines, height);
            }

            Ok(Capture { data, width: width as u32, height: height as u32, bytes_per_row })
        }
    }
}

impl WindowHandle for Win32Window {
    fn id(&self) -> WindowId {
        self.window_id
    }

    fn is_alive(&self) -> bool {
        unsafe { IsWindow(self.hwnd()).as_bool() }
    }

    fn client_size(&self) -> Option<(i32, i32)> {
        self.client_rect_size()
    }

    fn screen_to_client(&self, x: i32, y: i32) -> Option<(i32, i32)> {
        let mut pt = POINT { x, y };
        unsafe { ScreenToClient(self.hwnd(), &mut pt) }
            .as_bool()
            .then_some((pt.x, pt.y))
    }

    fn click(&mut self, x: i32, y: i32, double: bool) -> Result<()> {
        let lparam = ((y as u32 & 0xFFFF) << 16 | (x as u32 & 0xFFFF)) as i32 as isize;
        self.post(WM_MOUSEMOVE, 0, lparam)?;
        self.post(WM_LBUTTONDOWN, MK_LBUTTON, lparam)?;
        self.post(WM_LBUTTONUP, 0, lparam)?;
        if double {
            self.post(WM_LBUTTONDBLCLK, MK_LBUTTON, lparam)?;
            self.post(WM_LBUTTONUP, 0, lparam)?;
        }
        Ok(())
    }

    fn key(&mut self, vk: u16, down: bool, sync: bool) -> Result<()> {
        let msg = if down { WM_KEYDOWN } else { WM_KEYUP };
        if sync {
            unsafe { SendMessageW(self.hwnd(), msg, WPARAM(vk as usize), LPARAM(0)) };
            Ok(())
        } else {
            self.post(msg, vk as usize, 0)
        }
    }

    fn capture(&mut self, crop: Option<CaptureRect>) -> Result<Capture> {
        if !self.is_alive() {
            bail!("window {:#x} is gone", self.window_id);
        }
        let plan = plan_capture(self.client_rect_size(), self.restore_size(), self.window_rect_size())
            .ok_or_else(|| anyhow!("cannot determine size of window {:#x}", self.window_id))?;
        let (width, height) = (plan.width, plan.height);

        let full = self.render(width, height, plan.client_only)?;
        match crop {
            Some(rect) => full
                .crop(rect)
                .ok_or_else(|| anyhow!("crop {:?} lies outside the {}x{} capture", rect, width, height)),
            None => Ok(full),
        }
    }
}

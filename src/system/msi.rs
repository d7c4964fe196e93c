//! Windows Installer exit code descriptions from the `msimsg.dll` string table.

use std::sync::OnceLock;

use regex::Regex;

/// Human-readable text for an installer exit code, e.g. 1618
/// ("Another installation is already in progress...").
///
/// `None` when the code has no message, or off Windows.
pub fn lookup_message(exit_code: u32) -> Option<String> {
    let raw = load_string(exit_code)?;
    let text = collapse_whitespace(raw.trim_matches(char::from(0)));
    (!text.is_empty()).then_some(text)
}

/// Trim, and fold every run of two or more whitespace characters into one
/// space.
pub fn collapse_whitespace(text: &str) -> String {
    static RUNS: OnceLock<Regex> = OnceLock::new();
    let runs = RUNS.get_or_init(|| Regex::new(r"\s{2,}").expect("whitespace run pattern compiles"));
    runs.replace_all(text.trim(), " ").into_owned()
}

#[cfg(windows)]
fn load_string(id: u32) -> Option<String> {
    use std::ffi::c_void;

    const LOAD_LIBRARY_AS_DATAFILE: u32 = 0x0000_0002;

    #[link(name = "kernel32")]
    extern "system" {
        fn LoadLibraryExW(lpLibFileName: *const u16, hFile: *mut c_void, dwFlags: u32) -> *mut c_void;
        fn FreeLibrary(hLibModule: *mut c_void) -> i32;
    }

    #[link(name = "user32")]
    extern "system" {
        fn LoadStringW(hInstance: *mut c_void, uID: u32, lpBuffer: *mut u16, cchBufferMax: i32) -> i32;
    }

    let name: Vec<u16> = "msimsg.dll".encode_utf16().chain(std::iter::once(0)).collect();
    unsafe {
        let module = LoadLibraryExW(name.as_ptr(), std::ptr::null_mut(), LOAD_LIBRARY_AS_DATAFILE);
        if module.is_null() {
            log::debug!("msimsg.dll could not be loaded");
            return None;
        }
        let mut buf = vec![0u16; 4096];
        let len = LoadStringW(module, id, buf.as_mut_ptr(), buf.len() as i32);
        FreeLibrary(module);
        if len <= 0 {
            return None;
        }
        Some(String::from_utf16_lossy(&buf[..len as usize]))
    }
}

#[cfg(not(windows))]
fn load_string(_id: u32) -> Option<String> {
    None
}

pub mod buffer;
pub mod correlate;
pub mod devices;
pub mod filter;
pub mod msi;
pub mod resolver;
pub mod scan;
pub mod table;
pub mod window;
#[cfg(windows)]
pub mod winapi;

//! The intercepting proxy: CONNECT dispatch, TLS MITM for recognized
//! registries, and opaque tunneling for everything else (C7, C8, C9).

pub mod http_io;
pub mod mitm;
pub mod server;
pub mod tunnel;

pub use server::run_server;

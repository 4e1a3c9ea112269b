//! Remoting line protocol
//!
//! Split in the usual way: [`wire`] holds the pure frame/quote/parse logic
//! (unit-testable without sockets), [`client`] owns the TCP transport and
//! request/response correlation.

pub mod client;
pub mod wire;

pub use client::{CloseCallback, RemoteClient};
pub use wire::{
    banner_matches, decode_string, encode_string, parse_response_line, ResponseLine,
    ResponseStatus, HELLO_BANNER, REQUEST_TIMEOUT,
};

//! RETS protocol layer: authenticated client, response parsing, and the
//! multipart framing used by GetObject.

pub mod client;
pub mod multipart;
pub mod parser;
pub mod session;

pub use client::RetsClient;
pub use session::Session;

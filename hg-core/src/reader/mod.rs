//! Card reader: bit accumulation and credential validation

mod credential;
mod decoder;

pub use credential::{extract, parity_ok, CardKey, Credential};
pub use decoder::{RawFrame, WiegandDecoder};

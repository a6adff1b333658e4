//! Core types and utilities for the AES70/OCA protocol
//!
//! This crate provides the object-model identifiers, status codes, error
//! handling and the big-endian parameter encoding used throughout the OCA
//! implementation.

pub mod error;
pub mod params;
pub mod registry;
pub mod status;
pub mod types;
pub mod well_known;
pub mod wire;

pub use error::{OcaError, OcaResult};
pub use registry::ClassRegistry;
pub use status::OcaStatus;
pub use types::*;
pub use wire::{Ocp1Decoder, Ocp1Encoder, WireDecode, WireEncode, decode_value, encode_value};

//! Wire framing and AEAD cipher for the custom-remote tunnel protocol.

pub mod cipher;
pub mod framing;
pub mod secure;

pub use cipher::Cipher;
pub use framing::{Flag, Packet};

// Cryptography module — per-peer beacon sealing over X25519 ECDH

pub mod encrypt;

pub use encrypt::{
    open_beacon, seal_beacon, BeaconPlaintext, CryptoError, FLAG_DATA_AVAILABLE, SEALED_BEACON_LEN,
};

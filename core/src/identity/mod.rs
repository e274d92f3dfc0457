// Identity - local key pair and peer key types

mod keys;

pub use keys::{KeyError, LocalKeyPair, PeerId, PeerPublicKey, PUBLIC_KEY_LEN};

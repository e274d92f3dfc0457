/// Beacon construction and parsing
///
/// A `NotificationSet` is the full list of sealed beacons issued by one
/// `start` call. Beacons are built together, share one expiration, and are
/// shuffled so list position says nothing about the target.
/// The parser is the receiving side: it tries every blob in a fetched list
/// with the local key and keeps the ones that open.

use crate::crypto::{open_beacon, seal_beacon, BeaconPlaintext, CryptoError, FLAG_DATA_AVAILABLE};
use crate::identity::{LocalKeyPair, PeerPublicKey};
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::BeaconError;

/// Path the beacon list is served on unless configured otherwise
pub const DEFAULT_BEACON_PATH: &str = "/NotificationBeacons";

/// One sealed beacon addressed to one peer
#[derive(Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Target peer. Kept locally, never serialized.
    pub target: PeerPublicKey,
    /// Sealed blob served to fetchers
    pub payload: Vec<u8>,
    /// Unix milliseconds
    pub issued_at: u64,
    /// Unix milliseconds; the beacon is not served at or after this instant
    pub expires_at: u64,
}

impl Beacon {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

impl fmt::Debug for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Beacon")
            .field("target", &self.target)
            .field("len", &self.payload.len())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The active target → beacon mapping, replaced wholesale on every start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationSet {
    beacons: Vec<Beacon>,
}

impl NotificationSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }

    pub fn beacons(&self) -> &[Beacon] {
        &self.beacons
    }

    pub fn targets(&self) -> BTreeSet<PeerPublicKey> {
        self.beacons.iter().map(|b| b.target).collect()
    }

    pub fn get(&self, target: &PeerPublicKey) -> Option<&Beacon> {
        self.beacons.iter().find(|b| &b.target == target)
    }

    /// Beacons still valid at `now_ms`
    pub fn live(&self, now_ms: u64) -> impl Iterator<Item = &Beacon> {
        self.beacons.iter().filter(move |b| !b.is_expired(now_ms))
    }

    /// Wire form of the live beacons: a list of hex blobs
    pub fn encode_live(&self, now_ms: u64) -> Vec<String> {
        self.live(now_ms).map(|b| hex::encode(&b.payload)).collect()
    }
}

/// Builds a fresh notification set for a list of target peers
#[derive(Debug, Clone)]
pub struct BeaconBuilder {
    local_key: LocalKeyPair,
    expiration_ms: u64,
}

impl BeaconBuilder {
    /// Create a new beacon builder
    pub fn new(local_key: LocalKeyPair, expiration_ms: u64) -> Result<Self, BeaconError> {
        if expiration_ms == 0 {
            return Err(BeaconError::Configuration(
                "milliseconds until expiration must be positive".to_string(),
            ));
        }
        Ok(Self {
            local_key,
            expiration_ms,
        })
    }

    pub fn expiration_ms(&self) -> u64 {
        self.expiration_ms
    }

    pub fn local_key(&self) -> &LocalKeyPair {
        &self.local_key
    }

    /// Seal one beacon per distinct target, all issued at `now_ms`
    pub fn build(
        &self,
        targets: &[PeerPublicKey],
        now_ms: u64,
    ) -> Result<NotificationSet, BeaconError> {
        let expires_at = now_ms.saturating_add(self.expiration_ms);
        let distinct: BTreeSet<PeerPublicKey> = targets.iter().copied().collect();

        let mut beacons = Vec::with_capacity(distinct.len());
        for target in distinct {
            let payload = seal_beacon(&self.local_key, &target, FLAG_DATA_AVAILABLE, expires_at)?;
            beacons.push(Beacon {
                target,
                payload,
                issued_at: now_ms,
                expires_at,
            });
        }

        beacons.shuffle(&mut rand::thread_rng());
        Ok(NotificationSet { beacons })
    }
}

/// Decode a served beacon list into raw blobs
pub fn decode_list(body: &str) -> Result<Vec<Vec<u8>>, BeaconError> {
    let encoded: Vec<String> =
        serde_json::from_str(body).map_err(|e| BeaconError::Protocol(e.to_string()))?;
    encoded
        .iter()
        .map(|blob| hex::decode(blob).map_err(|e| BeaconError::Protocol(e.to_string())))
        .collect()
}

/// Receiving side: finds the beacons addressed to the local key
#[derive(Debug, Clone)]
pub struct BeaconParser {
    local_key: LocalKeyPair,
}

impl BeaconParser {
    /// Create a new beacon parser
    pub fn new(local_key: LocalKeyPair) -> Self {
        Self { local_key }
    }

    /// Open one blob. Malformed or foreign blobs are "not for me", not errors.
    pub fn open(&self, blob: &[u8], now_ms: u64) -> Option<BeaconPlaintext> {
        match open_beacon(&self.local_key, blob) {
            Ok(plaintext) if plaintext.expires_at <= now_ms => {
                debug!("Ignoring expired beacon from {:?}", plaintext.sender);
                None
            }
            Ok(plaintext) => Some(plaintext),
            Err(CryptoError::DecryptionFailed) => None,
            Err(e) => {
                debug!("Ignoring malformed beacon: {}", e);
                None
            }
        }
    }

    /// Parse a fetched list body and return every beacon addressed to us
    pub fn parse_list(&self, body: &str, now_ms: u64) -> Vec<BeaconPlaintext> {
        let blobs = match decode_list(body) {
            Ok(blobs) => blobs,
            Err(e) => {
                debug!("Ignoring undecodable beacon list: {}", e);
                return Vec::new();
            }
        };
        blobs
            .iter()
            .filter_map(|blob| self.open(blob, now_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<LocalKeyPair> {
        (0..n).map(|_| LocalKeyPair::generate()).collect()
    }

    #[test]
    fn test_builder_rejects_zero_expiration() {
        assert!(matches!(
            BeaconBuilder::new(LocalKeyPair::generate(), 0),
            Err(BeaconError::Configuration(_))
        ));
    }

    #[test]
    fn test_build_one_beacon_per_distinct_peer() {
        let local = LocalKeyPair::generate();
        let peers = keys(3);
        let mut targets: Vec<_> = peers.iter().map(|k| k.public_key()).collect();
        targets.push(targets[0]);

        let builder = BeaconBuilder::new(local, 1_000).unwrap();
        let set = builder.build(&targets, 5_000).unwrap();

        assert_eq!(set.len(), 3);
        for beacon in set.beacons() {
            assert_eq!(beacon.issued_at, 5_000);
            assert_eq!(beacon.expires_at, 6_000);
        }
    }

    #[test]
    fn test_live_filter_respects_expiry() {
        let local = LocalKeyPair::generate();
        let peer = LocalKeyPair::generate();
        let set = BeaconBuilder::new(local, 100)
            .unwrap()
            .build(&[peer.public_key()], 1_000)
            .unwrap();

        assert_eq!(set.encode_live(1_099).len(), 1);
        assert!(set.encode_live(1_100).is_empty());
        assert!(set.encode_live(5_000).is_empty());
    }

    #[test]
    fn test_parser_finds_only_own_beacon() {
        let local = LocalKeyPair::generate();
        let peers = keys(4);
        let targets: Vec<_> = peers.iter().map(|k| k.public_key()).collect();
        let set = BeaconBuilder::new(local.clone(), 60_000)
            .unwrap()
            .build(&targets, 0)
            .unwrap();
        let body = serde_json::to_string(&set.encode_live(10)).unwrap();

        for peer in &peers {
            let found = BeaconParser::new(peer.clone()).parse_list(&body, 10);
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].sender, local.public_key());
        }

        let stranger = LocalKeyPair::generate();
        assert!(BeaconParser::new(stranger).parse_list(&body, 10).is_empty());
    }

    #[test]
    fn test_parser_ignores_garbage() {
        let parser = BeaconParser::new(LocalKeyPair::generate());
        assert!(parser.parse_list("not json", 0).is_empty());
        assert!(parser.parse_list("[\"zz\"]", 0).is_empty());
        assert!(parser.parse_list("[\"00ff\"]", 0).is_empty());
    }

    #[test]
    fn test_parser_drops_expired_beacons() {
        let local = LocalKeyPair::generate();
        let peer = LocalKeyPair::generate();
        let set = BeaconBuilder::new(local, 100)
            .unwrap()
            .build(&[peer.public_key()], 0)
            .unwrap();
        let blob = &set.beacons()[0].payload;

        let parser = BeaconParser::new(peer);
        assert!(parser.open(blob, 50).is_some());
        assert!(parser.open(blob, 150).is_none());
    }
}

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// Identity of a replica participating in a shared document.
///
/// Actor ids are drawn at random when a document is created and are only
/// required to be unique within a session. They break ties between
/// concurrent writes carrying the same Lamport counter.
#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize,
    Serialize,
)]
#[archive(as = "ActorId")]
#[repr(transparent)]
pub struct ActorId(u64);

impl ActorId {
    /// Creates an actor id from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draws a fresh random actor id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("no entropy source");
        Self(u64::from_le_bytes(bytes))
    }

    /// Returns the raw value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<ActorId> for u64 {
    fn from(id: ActorId) -> Self {
        id.0
    }
}

impl std::fmt::Debug for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", &hex::encode(self.0.to_be_bytes())[..4])
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

impl std::str::FromStr for ActorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(anyhow::anyhow!("invalid actor id length {}", s.len()));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

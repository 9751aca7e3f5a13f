use crate::clock::Lamport;
use crate::util::Ref;
use crate::value::Value;
use anyhow::Result;
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// One replicated write.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub enum Op {
    /// Creates (or revives) the record for an element id.
    PutRecord {
        /// The element id.
        id: String,
        /// Timestamp of the create.
        stamp: Lamport,
    },
    /// Writes one field register of a record.
    PutField {
        /// The element id.
        id: String,
        /// The flattened field name (`x`, `style.strokeColor`, ...).
        field: String,
        /// The new scalar.
        value: Value,
        /// Timestamp of the write.
        stamp: Lamport,
    },
    /// Deletes the record for an element id.
    RemoveRecord {
        /// The element id.
        id: String,
        /// Timestamp of the delete.
        stamp: Lamport,
    },
}

impl Op {
    /// The timestamp the op carries.
    pub fn stamp(&self) -> Lamport {
        match self {
            Op::PutRecord { stamp, .. } => *stamp,
            Op::PutField { stamp, .. } => *stamp,
            Op::RemoveRecord { stamp, .. } => *stamp,
        }
    }

    /// The element id the op touches.
    pub fn id(&self) -> &str {
        match self {
            Op::PutRecord { id, .. } => id,
            Op::PutField { id, .. } => id,
            Op::RemoveRecord { id, .. } => id,
        }
    }
}

/// An ordered batch of ops: the unit of replication.
///
/// A delta is what one transaction produces and what travels to peers.
/// Application is idempotent and commutes with other deltas (every op
/// resolves through its register's Lamport order), so the transport may
/// deliver deltas more than once or out of order without harm.
#[derive(Clone, Debug, Default, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub struct Delta {
    ops: Vec<Op>,
}

impl Delta {
    /// Returns an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an op.
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Appends all ops of another delta.
    pub fn extend(&mut self, other: Delta) {
        self.ops.extend(other.ops);
    }

    /// The ops in application order.
    pub fn ops(&self) -> impl Iterator<Item = &Op> + '_ {
        self.ops.iter()
    }

    /// True if the delta carries no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Serializes the delta for the wire.
    pub fn encode(&self) -> Vec<u8> {
        Ref::archive(self).into_bytes()
    }

    /// Validates and deserializes a delta received from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ref::<Delta>::checked(bytes)?.to_owned()
    }
}

impl FromIterator<Op> for Delta {
    fn from_iter<I: IntoIterator<Item = Op>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ActorId;

    #[test]
    fn wire_round_trip() {
        let stamp = Lamport::new(7, ActorId::new(3));
        let delta: Delta = [
            Op::PutRecord {
                id: "e1".into(),
                stamp,
            },
            Op::PutField {
                id: "e1".into(),
                field: "style.strokeColor".into(),
                value: Value::from("#f00"),
                stamp,
            },
            Op::RemoveRecord {
                id: "e2".into(),
                stamp,
            },
        ]
        .into_iter()
        .collect();

        let bytes = delta.encode();
        assert_eq!(Delta::decode(&bytes).unwrap(), delta);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Delta::decode(&[0xff, 0x01, 0x02]).is_err());
    }
}

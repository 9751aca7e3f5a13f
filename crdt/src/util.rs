use anyhow::{anyhow, Result};
use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, Archived, Deserialize};
use std::marker::PhantomData;

/// An owned, trusted archive of a `T`.
///
/// Wire payloads stay in archived form until a caller actually needs an
/// owned value; [`Ref::get`] reads the archive in place without
/// copying. There are exactly two ways in: [`Ref::archive`] for values
/// this replica produced, and [`Ref::checked`] for untrusted bytes,
/// which runs the bytecheck validator before anything is read.
pub struct Ref<T> {
    bytes: Box<[u8]>,
    _type: PhantomData<fn() -> T>,
}

impl<T: Archive> Ref<T> {
    /// Archives a value into a fresh buffer.
    pub fn archive(value: &T) -> Self
    where
        T: rkyv::Serialize<AllocSerializer<256>>,
    {
        let mut serializer = AllocSerializer::<256>::default();
        serializer
            .serialize_value(value)
            .expect("alloc serializer is infallible");
        let buffer = serializer.into_serializer().into_inner();
        Self {
            bytes: Box::from(&buffer[..]),
            _type: PhantomData,
        }
    }

    /// Validates untrusted bytes and takes an owned copy on success.
    pub fn checked(bytes: &[u8]) -> Result<Self>
    where
        Archived<T>: for<'a> CheckBytes<DefaultValidator<'a>>,
    {
        if let Err(err) = rkyv::check_archived_root::<T>(bytes) {
            return Err(anyhow!("rejecting invalid archive: {}", err));
        }
        Ok(Self {
            bytes: Box::from(bytes),
            _type: PhantomData,
        })
    }

    /// The archived view, read in place.
    pub fn get(&self) -> &Archived<T> {
        // every constructor either produced or validated these bytes
        unsafe { rkyv::archived_root::<T>(&self.bytes) }
    }

    /// Deserializes the archive into an owned value.
    pub fn to_owned(&self) -> Result<T>
    where
        Archived<T>: Deserialize<T, rkyv::Infallible>,
    {
        let value = self.get().deserialize(&mut rkyv::Infallible)?;
        Ok(value)
    }

    /// The raw archive bytes, for putting on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the wrapper, returning the archive bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_vec()
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Lamport;
    use crate::id::ActorId;

    #[test]
    fn archive_and_read_back() {
        let stamps = vec![
            Lamport::new(1, ActorId::new(7)),
            Lamport::new(9, ActorId::new(3)),
        ];
        let archived = Ref::archive(&stamps);
        assert_eq!(archived.get().len(), 2);
        assert_eq!(archived.to_owned().unwrap(), stamps);
    }

    #[test]
    fn checked_rejects_garbage() {
        assert!(Ref::<Vec<Lamport>>::checked(&[1, 2, 3]).is_err());
    }

    #[test]
    fn checked_accepts_own_output() {
        let stamps = vec![Lamport::new(4, ActorId::new(1))];
        let bytes = Ref::archive(&stamps).into_bytes();
        let parsed = Ref::<Vec<Lamport>>::checked(&bytes).unwrap();
        assert_eq!(parsed.to_owned().unwrap(), stamps);
    }
}

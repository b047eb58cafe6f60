//! Object (de)serialization.
//!
//! A pickle is laid out as
//!
//! ```txt
//! class_len:2 class_id refs:4 oid:8* state
//! ```
//!
//! with big-endian integers and the object's state encoded by
//! bincode. References to other persistent objects are lifted
//! into the header so that pack can walk the object graph
//! without knowing about any class.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Counter, Error, Oid, PersistentMapping, Result};

/// A type whose values can be stored as persistent objects.
pub trait Persistable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stored in every pickle. Must be unique across the classes
    /// registered with a `Serializer` and must never change once
    /// data has been written.
    const CLASS_ID: &'static str;

    /// Oids of the persistent objects this value refers to.
    fn references(&self) -> Vec<Oid> {
        vec![]
    }

    /// Merges a change made from `old` to `new` with a change
    /// made concurrently from `old` to `committed`. Returning
    /// `None` reports a conflict.
    fn resolve(_old: &Self, _committed: &Self, _new: &Self) -> Option<Self> {
        None
    }
}

/// The type-erased state of a live persistent object.
pub trait ObjectState: Any + Send + Sync {
    fn class_id(&self) -> &'static str;
    fn references(&self) -> Vec<Oid>;
    fn encode_state(&self) -> Result<Vec<u8>>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Persistable> ObjectState for T {
    fn class_id(&self) -> &'static str {
        T::CLASS_ID
    }

    fn references(&self) -> Vec<Oid> {
        Persistable::references(self)
    }

    fn encode_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A decoded pickle, borrowing from the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pickle<'a> {
    pub class_id: &'a str,
    pub references: Vec<Oid>,
    pub state: &'a [u8],
}

impl<'a> Pickle<'a> {
    pub fn encode(class_id: &str, references: &[Oid], state: &[u8]) -> Result<Vec<u8>> {
        let class_len = u16::try_from(class_id.len())
            .map_err(|_| Error::Pickle(format!("class id {class_id:?} is too long")))?;
        let nrefs = u32::try_from(references.len())
            .map_err(|_| Error::Pickle(format!("{} references is too many", references.len())))?;

        let mut buf = Vec::with_capacity(2 + class_id.len() + 4 + references.len() * 8 + state.len());
        buf.extend_from_slice(&class_len.to_be_bytes());
        buf.extend_from_slice(class_id.as_bytes());
        buf.extend_from_slice(&nrefs.to_be_bytes());
        for oid in references {
            buf.extend_from_slice(&oid.to_bytes());
        }
        buf.extend_from_slice(state);
        Ok(buf)
    }

    pub fn decode(buf: &'a [u8]) -> Result<Pickle<'a>> {
        let truncated = || Error::Pickle(format!("pickle of {} bytes is truncated", buf.len()));

        if buf.len() < 2 {
            return Err(truncated());
        }
        let class_len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        let class_end = 2 + class_len;
        let refs_start = class_end + 4;
        if buf.len() < refs_start {
            return Err(truncated());
        }

        let class_id = std::str::from_utf8(&buf[2..class_end])
            .map_err(|e| Error::Pickle(format!("class id is not utf-8: {e}")))?;

        let mut nrefs_bytes = [0_u8; 4];
        nrefs_bytes.copy_from_slice(&buf[class_end..refs_start]);
        let nrefs = u32::from_be_bytes(nrefs_bytes) as usize;

        let state_start = nrefs
            .checked_mul(8)
            .and_then(|len| len.checked_add(refs_start))
            .filter(|end| *end <= buf.len())
            .ok_or_else(truncated)?;

        let references = buf[refs_start..state_start]
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0_u8; 8];
                bytes.copy_from_slice(chunk);
                Oid::from_bytes(bytes)
            })
            .collect();

        Ok(Pickle {
            class_id,
            references,
            state: &buf[state_start..],
        })
    }
}

/// What the storage needs to know about pickles: how to find
/// references for pack, and how to merge conflicting writes.
pub trait PickleFormat: Send + Sync {
    fn references(&self, data: &[u8]) -> Result<Vec<Oid>>;

    /// Returns the merged pickle, or `None` if the conflict cannot
    /// be resolved.
    fn resolve(&self, oid: Oid, old: &[u8], committed: &[u8], new: &[u8]) -> Option<Vec<u8>>;
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn ObjectState>>;
type ResolveFn = fn(&[u8], &[u8], &[u8]) -> Result<Option<Vec<u8>>>;

struct ClassEntry {
    decode: DecodeFn,
    resolve: ResolveFn,
}

fn decode_state<T: Persistable>(state: &[u8]) -> Result<Box<dyn ObjectState>> {
    let value: T = bincode::deserialize(state)?;
    Ok(Box::new(value))
}

fn resolve_state<T: Persistable>(old: &[u8], committed: &[u8], new: &[u8]) -> Result<Option<Vec<u8>>> {
    let old: T = bincode::deserialize(old)?;
    let committed: T = bincode::deserialize(committed)?;
    let new: T = bincode::deserialize(new)?;

    match T::resolve(&old, &committed, &new) {
        Some(merged) => {
            let state = bincode::serialize(&merged)?;
            Ok(Some(Pickle::encode(
                T::CLASS_ID,
                &Persistable::references(&merged),
                &state,
            )?))
        }
        None => Ok(None),
    }
}

/// Registry of the classes a database can load.
///
/// `Serializer::new` knows the built-in `PersistentMapping` and
/// `Counter`; applications register their own types before
/// opening the database.
pub struct Serializer {
    classes: HashMap<&'static str, ClassEntry>,
}

impl Default for Serializer {
    fn default() -> Serializer {
        Serializer::new()
    }
}

impl fmt::Debug for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&&str> = self.classes.keys().collect();
        classes.sort();
        f.debug_struct("Serializer").field("classes", &classes).finish()
    }
}

impl Serializer {
    pub fn new() -> Serializer {
        let mut serializer = Serializer {
            classes: HashMap::new(),
        };
        serializer.register::<PersistentMapping>();
        serializer.register::<Counter>();
        serializer
    }

    /// Makes `T` loadable. Registering a class id twice replaces
    /// the earlier registration.
    pub fn register<T: Persistable>(&mut self) -> &mut Serializer {
        let entry = ClassEntry {
            decode: decode_state::<T>,
            resolve: resolve_state::<T>,
        };
        if self.classes.insert(T::CLASS_ID, entry).is_some() {
            log::warn!("class id {:?} was registered twice", T::CLASS_ID);
        }
        self
    }

    pub fn is_registered(&self, class_id: &str) -> bool {
        self.classes.contains_key(class_id)
    }

    pub fn serialize(&self, state: &dyn ObjectState) -> Result<Vec<u8>> {
        let class_id = state.class_id();
        if !self.is_registered(class_id) {
            return Err(Error::UnknownClass(class_id.to_owned()));
        }
        Pickle::encode(class_id, &state.references(), &state.encode_state()?)
    }

    pub fn deserialize(&self, data: &[u8]) -> Result<Box<dyn ObjectState>> {
        let pickle = Pickle::decode(data)?;
        let entry = self
            .classes
            .get(pickle.class_id)
            .ok_or_else(|| Error::UnknownClass(pickle.class_id.to_owned()))?;
        (entry.decode)(pickle.state)
    }
}

impl PickleFormat for Serializer {
    fn references(&self, data: &[u8]) -> Result<Vec<Oid>> {
        Ok(Pickle::decode(data)?.references)
    }

    fn resolve(&self, oid: Oid, old: &[u8], committed: &[u8], new: &[u8]) -> Option<Vec<u8>> {
        let decoded = (Pickle::decode(old), Pickle::decode(committed), Pickle::decode(new));
        let (old, committed, new) = match decoded {
            (Ok(old), Ok(committed), Ok(new)) => (old, committed, new),
            _ => {
                log::warn!("cannot resolve conflict on {oid}: malformed pickle");
                return None;
            }
        };

        if old.class_id != committed.class_id || old.class_id != new.class_id {
            log::debug!("cannot resolve conflict on {oid}: its class changed");
            return None;
        }

        let entry = self.classes.get(new.class_id)?;

        match (entry.resolve)(old.state, committed.state, new.state) {
            Ok(merged) => merged,
            Err(e) => {
                log::warn!("conflict resolution of {oid} failed: {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_visible_without_the_class() {
        let mut mapping = PersistentMapping::new();
        mapping.insert("a", Oid::from_u64(3));
        mapping.insert("b", Oid::from_u64(9));

        let data = Serializer::new().serialize(&mapping).unwrap();

        let bare = Serializer {
            classes: HashMap::new(),
        };
        let mut refs = bare.references(&data).unwrap();
        refs.sort();
        assert_eq!(refs, vec![Oid::from_u64(3), Oid::from_u64(9)]);
        assert!(matches!(bare.deserialize(&data), Err(Error::UnknownClass(_))));
    }

    #[test]
    fn truncated_pickles_are_rejected() {
        let data = Serializer::new().serialize(&Counter::new(5)).unwrap();
        for len in 0..7 {
            assert!(Pickle::decode(&data[..len]).is_err(), "length {len}");
        }
    }

    #[test]
    fn counters_resolve_by_adding_both_deltas() {
        let serializer = Serializer::new();
        let old = serializer.serialize(&Counter::new(10)).unwrap();
        let committed = serializer.serialize(&Counter::new(13)).unwrap();
        let new = serializer.serialize(&Counter::new(11)).unwrap();

        let merged = serializer
            .resolve(Oid::from_u64(1), &old, &committed, &new)
            .unwrap();
        let state = serializer.deserialize(&merged).unwrap();
        let counter = state.as_any().downcast_ref::<Counter>().unwrap();
        assert_eq!(counter.value(), 14);
    }
}

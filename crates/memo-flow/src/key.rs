//! Memo input keys.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Trait for memo inputs.
///
/// Inputs must be hashable, comparable, cloneable and printable; name plus
/// input identify a call.
pub trait Key: Hash + Eq + Clone + Debug + 'static {}

// Blanket implementation for all types that satisfy the bounds
impl<T> Key for T where T: Hash + Eq + Clone + Debug + 'static {}

/// A heterogeneous memo key.
///
/// A function whose input ranges over several underlying types keys its cells
/// on the concrete type plus the payload, so equal-looking values of
/// different types never collide:
///
/// ```
/// use memo_flow::DynKey;
///
/// let a = DynKey::new(1u32);
/// let b = DynKey::new(1i64);
/// assert_ne!(a, b);
/// assert_eq!(a.get::<u32>(), Some(&1));
/// assert_eq!(a.get::<i64>(), None);
/// ```
#[derive(Clone)]
pub struct DynKey {
    type_id: TypeId,
    hash: u64,
    repr: Rc<str>,
    value: Rc<dyn Any>,
}

impl DynKey {
    /// Wrap a concrete input value.
    pub fn new<K: Key>(value: K) -> Self {
        let mut hasher = ahash::AHasher::default();
        value.hash(&mut hasher);
        let hash = hasher.finish();
        DynKey {
            type_id: TypeId::of::<K>(),
            hash,
            repr: Rc::from(format!("{value:?}")),
            value: Rc::new(value),
        }
    }

    /// The wrapped value, if it is a `K`.
    pub fn get<K: 'static>(&self) -> Option<&K> {
        self.value.downcast_ref::<K>()
    }

    /// Debug rendering of the wrapped value.
    pub fn repr(&self) -> &str {
        &self.repr
    }
}

impl Debug for DynKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr)
    }
}

impl Hash for DynKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.hash.hash(state);
    }
}

impl PartialEq for DynKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.hash == other.hash
    }
}

impl Eq for DynKey {}

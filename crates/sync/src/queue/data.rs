//! Type-erased queue items

use std::any::{Any, TypeId};
use std::fmt;

/// One queued item of any type
///
/// Carries the type name so mismatches can be reported.
pub struct Data {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl Data {
    /// Wrap a value
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check the wrapped value's type
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value as `T`, or get the item back
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self { value, type_name }),
        }
    }

    fn value_type_id(&self) -> TypeId {
        (*self.value).type_id()
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Runtime description of the item type a queue accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exemplar {
    type_id: TypeId,
    type_name: &'static str,
}

impl Exemplar {
    /// Describe type `T`
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the accepted items
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check whether `data` holds the accepted type
    pub fn matches(&self, data: &Data) -> bool {
        data.value_type_id() == self.type_id
    }
}

impl fmt::Display for Exemplar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

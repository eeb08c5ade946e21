use serde::{Deserialize, Deserializer};

/// A field of a typed overlay.
///
/// Plain values cannot express "remove this key from the document", so
/// every optional wire key is modelled with three states. Fields read from
/// a document are [`Field::Set`] when the key holds a value and
/// [`Field::Unset`] when it is absent or `null`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Field<T> {
    /// Leaves the wire value untouched.
    Unset,

    /// Removes the key from the document.
    Delete,

    /// Writes the value, merging it into an existing object value.
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> From<T> for Field<T> {
    fn from(value: T) -> Self {
        Self::Set(value)
    }
}

impl<T> Field<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Unset | Self::Delete => None,
        }
    }

    /// Returns the value, replacing [`Field::Unset`] and [`Field::Delete`] with `T::default()`.
    pub fn get_or_insert_default(&mut self) -> &mut T
    where
        T: Default,
    {
        match self {
            Self::Set(value) => value,
            Self::Unset | Self::Delete => {
                *self = Self::Set(T::default());
                self.get_or_insert_default()
            }
        }
    }
}

impl<T: AsRef<str>> Field<T> {
    pub fn as_str(&self) -> Option<&str> {
        self.as_set().map(AsRef::as_ref)
    }
}

impl<'de, T> Deserialize<'de> for Field<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<T>::deserialize(deserializer)?.map_or(Self::Unset, Self::Set))
    }
}

//! Writing typed overlays into the untyped sections of a document.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use super::{Field, Result, SerializeFieldSnafu};
use crate::document::{self, Object};

/// A typed view over one section of the document (`auth`, `tls`, `ldap`).
pub trait Overlay {
    /// Writes the fields of the overlay into `section`. Keys the overlay
    /// does not know about are kept.
    fn apply_to(&self, section: &mut Object) -> Result<()>;
}

/// Applies a single [`Field`]: unset fields are skipped, deleted ones removed
/// and set ones merged into the existing value.
pub(crate) fn apply_field<T: Serialize>(section: &mut Object, key: &str, field: &Field<T>) -> Result<()> {
    match field {
        Field::Unset => {}
        Field::Delete => {
            section.remove(key);
        }
        Field::Set(value) => {
            let value = serde_json::to_value(value).context(SerializeFieldSnafu { key })?;
            match section.get_mut(key) {
                Some(existing) => document::merge_value(existing, value),
                None => {
                    section.insert(key.to_owned(), value);
                }
            }
        }
    }
    Ok(())
}

/// Writes `value` under `key`, replacing whatever was there.
pub(crate) fn write_value<T: Serialize + ?Sized>(section: &mut Object, key: &str, value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context(SerializeFieldSnafu { key })?;
    section.insert(key.to_owned(), value);
    Ok(())
}

/// Writes `value` under `key`, `None` removes the key.
pub(crate) fn write_optional<T: Serialize>(section: &mut Object, key: &str, value: Option<&T>) -> Result<()> {
    match value {
        Some(value) => write_value(section, key, value),
        None => {
            section.remove(key);
            Ok(())
        }
    }
}

/// Merges a typed list into the list stored in the document.
///
/// The typed list is authoritative: the result holds exactly one element per
/// `Some` entry, in typed order. Each entry is written over the wire element
/// with the same natural key, so fields unknown to the overlay survive. An
/// entry without a keyed counterpart starts from an empty object.
pub(crate) fn merge_keyed_list<T, K: PartialEq>(
    existing: Option<&Value>,
    desired: &[Option<T>],
    desired_key: impl Fn(&T) -> K,
    existing_key: impl Fn(&Object) -> Option<K>,
    write: impl Fn(&T, &mut Object) -> Result<()>,
) -> Result<Vec<Value>> {
    let existing = existing
        .and_then(Value::as_array)
        .map(|items| items.iter().map(Value::as_object).collect::<Vec<_>>())
        .unwrap_or_default();
    let existing_keys = existing
        .iter()
        .map(|item| item.and_then(&existing_key))
        .collect::<Vec<_>>();

    let mut claimed = vec![false; existing.len()];
    let mut matches = vec![None; desired.len()];

    for (index, item) in desired.iter().enumerate() {
        let Some(item) = item else { continue };
        let key = desired_key(item);
        let found = existing_keys
            .iter()
            .enumerate()
            .position(|(position, existing)| !claimed[position] && existing.as_ref() == Some(&key));
        if let Some(position) = found {
            claimed[position] = true;
            matches[index] = Some(position);
        }
    }

    let mut merged = Vec::with_capacity(desired.len());
    for (item, position) in desired.iter().zip(matches) {
        let Some(item) = item else { continue };
        let mut element = position
            .and_then(|position| existing[position].cloned())
            .unwrap_or_default();
        write(item, &mut element)?;
        merged.push(Value::Object(element));
    }
    Ok(merged)
}

/// Deserializes `null` as `T::default()`.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Implements the [`Field`] based part of an overlay: applying the fields,
/// taking over set fields from another overlay and deleting fields by wire key.
macro_rules! overlay_fields {
    ($overlay:ty { $($field:ident => $key:literal),+ $(,)? }) => {
        impl $overlay {
            fn apply_fields(&self, section: &mut $crate::document::Object) -> $crate::automation_config::Result<()> {
                $($crate::automation_config::overlay::apply_field(section, $key, &self.$field)?;)+
                Ok(())
            }

            /// Takes over every field of `other` that is not [`Field::Unset`](crate::automation_config::Field::Unset).
            pub fn update_fields_from(&mut self, other: &Self) {
                $(
                    if !other.$field.is_unset() {
                        self.$field = other.$field.clone();
                    }
                )+
            }

            /// Marks the field stored under the wire key `key` for deletion.
            /// Returns `false` if no such field exists.
            pub fn delete_field(&mut self, key: &str) -> bool {
                match key {
                    $($key => {
                        self.$field = $crate::automation_config::Field::Delete;
                        true
                    })+
                    _ => false,
                }
            }
        }
    };
}

pub(crate) use overlay_fields;

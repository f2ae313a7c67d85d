use std::fmt;
use std::hash::{Hash, Hasher};

/// A header name compared and hashed without regard to ASCII case.
///
/// The spelling of the name is kept exactly as it was received so the header
/// can be written back byte for byte.
#[derive(Clone, Debug, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldName(String);

impl FieldName {
  /// Wrap a header name.
  pub fn new<S: Into<String>>(name: S) -> Self {
    FieldName(name.into())
  }
  /// The name as it was written.
  pub fn as_str(&self) -> &str {
    &self.0
  }
  /// Case-insensitive comparison against a plain name.
  pub fn matches(&self, name: &str) -> bool {
    self.0.eq_ignore_ascii_case(name)
  }
}

impl PartialEq for FieldName {
  fn eq(&self, other: &Self) -> bool {
    self.matches(&other.0)
  }
}

impl Hash for FieldName {
  fn hash<H: Hasher>(&self, state: &mut H) {
    for b in self.0.bytes() {
      state.write_u8(b.to_ascii_uppercase());
    }
  }
}

impl fmt::Display for FieldName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// One `name: value` line of a header block.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeaderField {
  /// header name
  pub name: FieldName,
  /// trimmed header value
  pub value: String,
}

/// Ordered multimap of header fields.
///
/// Insertion order is the order the lines appeared in. Lookups never reorder
/// anything: [`FieldMap::first`] answers "the header value" and
/// [`FieldMap::all`] answers "every value, in order".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldMap {
  entries: Vec<HeaderField>,
}

impl FieldMap {
  /// Append a field after every existing one.
  pub fn append<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
    self.entries.push(HeaderField {
      name: FieldName::new(name),
      value: value.into(),
    });
  }
  /// The first value stored under `name`.
  pub fn first(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|f| f.name.matches(name))
      .map(|f| f.value.as_str())
  }
  /// All values stored under `name`, in original order.
  pub fn all(&self, name: &str) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|f| f.name.matches(name))
      .map(|f| f.value.as_str())
      .collect()
  }
  /// Whether any field is named `name`.
  pub fn contains(&self, name: &str) -> bool {
    self.entries.iter().any(|f| f.name.matches(name))
  }
  /// Iterate over every field in order.
  pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
    self.entries.iter()
  }
  /// Number of fields, duplicates included.
  pub fn len(&self) -> usize {
    self.entries.len()
  }
  /// No fields at all.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl<'a> IntoIterator for &'a FieldMap {
  type Item = &'a HeaderField;
  type IntoIter = std::slice::Iter<'a, HeaderField>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.iter()
  }
}

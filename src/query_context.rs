use crate::{
  error::{Error, Result},
  query::QueryFlags,
};

/// Number of bound-value slots. Enough for every known client; could be
/// lifted to a growable store if anybody ever needs more.
pub const BOUND_VALUE_MAX: usize = 4;

/// A scalar supplied at execution time for a `?` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
  Text(String),
  Integer(u32),
}

/// The values bound to `?` placeholders for one execution.
///
/// Bindings are per-execution and must not be shared between concurrent
/// executions; they are cheap to build on the stack each time.
#[derive(Debug, Clone, Default)]
pub struct ValueBindings {
  values: [Option<BoundValue>; BOUND_VALUE_MAX],
}

impl ValueBindings {
  pub fn new() -> Self {
    Self::default()
  }

  fn check_idx(idx: usize) -> Result<()> {
    if idx >= BOUND_VALUE_MAX {
      return Err(Error::InvalidArgument(format!(
        "bound value index {} is past the maximum of {}",
        idx, BOUND_VALUE_MAX
      )));
    }
    Ok(())
  }

  /// Binds a string to the given 0-based slot, overwriting any previous
  /// binding.
  pub fn bind_str(&mut self, idx: usize, str: &str) -> Result<()> {
    Self::check_idx(idx)?;
    self.values[idx] = Some(BoundValue::Text(str.to_string()));
    Ok(())
  }

  /// Binds an integer to the given 0-based slot, overwriting any previous
  /// binding.
  pub fn bind_val(&mut self, idx: usize, val: u32) -> Result<()> {
    Self::check_idx(idx)?;
    self.values[idx] = Some(BoundValue::Integer(val));
    Ok(())
  }

  pub fn is_bound(&self, idx: usize) -> bool {
    idx < BOUND_VALUE_MAX && self.values[idx].is_some()
  }

  pub(crate) fn lookup(&self, idx: usize) -> Option<&BoundValue> {
    self.values.get(idx).and_then(|v| v.as_ref())
  }

  /// Copies the binding at `idx` to `dest_idx` on `dest`; returns false if
  /// nothing was bound at `idx`.
  pub fn copy_binding(&self, idx: usize, dest: &mut ValueBindings, dest_idx: usize) -> bool {
    if dest_idx >= BOUND_VALUE_MAX {
      return false;
    }
    match self.lookup(idx) {
      Some(value) => {
        dest.values[dest_idx] = Some(value.clone());
        true
      }
      None => false,
    }
  }
}

/// An immutable bundle of limit, flags and value bindings passed to each
/// query execution.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
  limit: usize,
  flags: QueryFlags,
  bindings: ValueBindings,
}

impl QueryContext {
  pub fn new() -> Self {
    Self::default()
  }

  /// Limit on the number of results, where 0 is "all".
  pub fn limit(&self) -> usize {
    self.limit
  }

  pub fn set_limit(&mut self, limit: usize) {
    self.limit = limit;
  }

  pub fn flags(&self) -> QueryFlags {
    self.flags
  }

  pub fn set_flags(&mut self, flags: QueryFlags) {
    self.flags = flags;
  }

  pub fn bindings(&self) -> &ValueBindings {
    &self.bindings
  }

  pub fn bindings_mut(&mut self) -> &mut ValueBindings {
    &mut self.bindings
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bindings() {
    let mut bindings = ValueBindings::new();
    assert!(!bindings.is_bound(0));
    bindings.bind_str(0, "gimp.desktop").unwrap();
    bindings.bind_val(1, 2).unwrap();
    assert!(bindings.is_bound(0));
    assert!(bindings.is_bound(1));
    assert!(!bindings.is_bound(2));
    assert_eq!(
      bindings.lookup(0),
      Some(&BoundValue::Text("gimp.desktop".to_string()))
    );
    assert!(bindings.bind_val(BOUND_VALUE_MAX, 0).is_err());
  }

  #[test]
  fn test_copy_binding() {
    let mut src = ValueBindings::new();
    src.bind_val(0, 7).unwrap();
    let mut dst = ValueBindings::new();
    assert!(src.copy_binding(0, &mut dst, 1));
    assert!(!src.copy_binding(1, &mut dst, 0));
    assert_eq!(dst.lookup(1), Some(&BoundValue::Integer(7)));
  }
}

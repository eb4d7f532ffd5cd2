use std::borrow::Cow;
use std::fmt;

use crate::{
  error::{Error, Result},
  strtab::UNSET,
};

/// A text operand on the evaluation stack. Strings usually borrow straight
/// from the silo string table or from the compiled opcodes; transforms such
/// as `lower-case()` produce owned values. `str == None` models a missing
/// attribute or text, which only `eq`/`ne` treat as comparable.
#[derive(Debug, Clone)]
pub struct TextValue<'a> {
  pub(crate) str: Option<Cow<'a, str>>,
  pub(crate) index: u32,
  pub(crate) tokenized: bool,
  pub(crate) tokens: Vec<Cow<'a, str>>,
}

impl<'a> TextValue<'a> {
  pub fn new(str: impl Into<Cow<'a, str>>) -> Self {
    Self {
      str: Some(str.into()),
      index: UNSET,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn null() -> Self {
    Self {
      str: None,
      index: UNSET,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn with_index(mut self, index: u32) -> Self {
    self.index = index;
    self
  }

  pub fn as_str(&self) -> Option<&str> {
    self.str.as_deref()
  }
}

/// A tagged value on the evaluation stack.
#[derive(Debug, Clone)]
pub enum Value<'a> {
  Integer(u32),
  Boolean(bool),
  Text(TextValue<'a>),
}

impl<'a> Value<'a> {
  pub fn text(str: impl Into<Cow<'a, str>>) -> Self {
    Value::Text(TextValue::new(str))
  }

  /// Booleans take part in integer comparisons as 0 or 1.
  pub(crate) fn as_int(&self) -> Option<u32> {
    match self {
      Value::Integer(v) => Some(*v),
      Value::Boolean(b) => Some(*b as u32),
      Value::Text(_) => None,
    }
  }

  pub(crate) fn kind_str(&self) -> &'static str {
    match self {
      Value::Integer(_) => "INTE",
      Value::Boolean(_) => "BOOL",
      Value::Text(_) => "TEXT",
    }
  }
}

impl fmt::Display for Value<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Integer(v) => write!(f, "{}", v),
      Value::Boolean(b) => write!(f, "{}", b),
      Value::Text(t) => match t.as_str() {
        Some(s) => write!(f, "'{}'", s),
        None => write!(f, "(null)"),
      },
    }
  }
}

/// Fixed-capacity stack for one predicate evaluation.
pub struct Stack<'a> {
  values: Vec<Value<'a>>,
  max_size: usize,
}

impl<'a> Stack<'a> {
  pub fn new(max_size: usize) -> Self {
    Self {
      values: Vec::with_capacity(max_size),
      max_size,
    }
  }

  pub fn push(&mut self, value: Value<'a>) -> Result<()> {
    if self.values.len() >= self.max_size {
      return Err(Error::InvalidData(format!(
        "stack is already at maximum size of {}",
        self.max_size
      )));
    }
    self.values.push(value);
    Ok(())
  }

  pub fn pop(&mut self) -> Result<Value<'a>> {
    self
      .values
      .pop()
      .ok_or_else(|| Error::InvalidData("stack is empty".to_string()))
  }

  /// Pops the top two values, returning `(top, below)`.
  pub fn pop_two(&mut self) -> Result<(Value<'a>, Value<'a>)> {
    if self.values.len() < 2 {
      return Err(Error::InvalidData("stack is not full enough".to_string()));
    }
    match (self.values.pop(), self.values.pop()) {
      (Some(op1), Some(op2)) => Ok((op1, op2)),
      _ => Err(Error::InvalidData("stack is not full enough".to_string())),
    }
  }

  pub fn peek(&self, idx: usize) -> Option<&Value<'a>> {
    self.values.get(idx)
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub(crate) fn describe(&self) -> String {
    self
      .values
      .iter()
      .map(|v| v.to_string())
      .collect::<Vec<_>>()
      .join(",")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_push_pop() {
    let mut stack = Stack::new(3);
    stack.push(Value::Integer(1)).unwrap();
    stack.push(Value::text("two")).unwrap();
    let (op1, op2) = stack.pop_two().unwrap();
    assert!(matches!(op1, Value::Text(_)));
    assert!(matches!(op2, Value::Integer(1)));
    assert!(stack.pop().is_err());
  }

  #[test]
  fn test_capacity() {
    let mut stack = Stack::new(2);
    stack.push(Value::Integer(1)).unwrap();
    stack.push(Value::Integer(2)).unwrap();
    assert!(stack.push(Value::Integer(3)).is_err());
    assert_eq!(stack.describe(), "1,2");
  }

  #[test]
  fn test_pop_two_underflow() {
    let mut stack = Stack::new(4);
    stack.push(Value::Boolean(true)).unwrap();
    assert!(stack.pop_two().is_err());
    // the failed pop must not have consumed the remaining value
    assert_eq!(stack.len(), 1);
  }
}

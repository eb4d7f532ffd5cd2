use std::fmt;

use crate::{strings, strtab::UNSET};

/// Maximum number of search tokens carried by one opcode or node. A
/// compromise between record size and search quality.
pub const OPCODE_TOKEN_MAX: usize = 32;

/// The kind of one compiled predicate operand or operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeKind {
  /// Call of a registered machine function, `val` is the function index.
  Function,
  /// Literal integer, `val` holds it.
  Integer,
  /// Literal text.
  Text,
  /// Literal text that additionally carries a string-table offset in `val`
  /// (`UNSET` until repaired by the query compiler).
  IndexedText,
  /// A `?` placeholder filled from the value bindings, `val` is the slot.
  Bound,
  /// Literal boolean, produced by the optimizer.
  Boolean,
}

impl OpcodeKind {
  pub(crate) fn sig(&self) -> &'static str {
    match self {
      OpcodeKind::Function => "FUNC",
      OpcodeKind::Integer => "INTE",
      OpcodeKind::Text => "TEXT",
      OpcodeKind::IndexedText => "TEXI",
      OpcodeKind::Bound => "BIND",
      OpcodeKind::Boolean => "BOOL",
    }
  }
}

/// One operand or operation of the predicate VM, as stored in a compiled
/// [`Query`](crate::Query).
#[derive(Debug, Clone)]
pub struct Opcode {
  kind: OpcodeKind,
  val: u32,
  text: Option<String>,
  tokenized: bool,
  tokens: Vec<String>,
}

impl Opcode {
  pub fn func(idx: u32) -> Self {
    Self {
      kind: OpcodeKind::Function,
      val: idx,
      text: None,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn integer(val: u32) -> Self {
    Self {
      kind: OpcodeKind::Integer,
      val,
      text: None,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn text<S: Into<String>>(text: S) -> Self {
    Self {
      kind: OpcodeKind::Text,
      val: UNSET,
      text: Some(text.into()),
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn indexed_text<S: Into<String>>(text: S, val: u32) -> Self {
    Self {
      kind: OpcodeKind::IndexedText,
      val,
      text: Some(text.into()),
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  /// A text opcode with no payload, evaluating to the missing-text value.
  pub fn null_text() -> Self {
    Self {
      kind: OpcodeKind::Text,
      val: UNSET,
      text: None,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn bound() -> Self {
    Self {
      kind: OpcodeKind::Bound,
      val: UNSET,
      text: None,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn boolean(val: bool) -> Self {
    Self {
      kind: OpcodeKind::Boolean,
      val: val as u32,
      text: None,
      tokenized: false,
      tokens: Vec::new(),
    }
  }

  pub fn kind(&self) -> OpcodeKind {
    self.kind
  }

  pub fn val(&self) -> u32 {
    self.val
  }

  pub fn text_str(&self) -> Option<&str> {
    self.text.as_deref()
  }

  pub fn is_tokenized(&self) -> bool {
    self.tokenized
  }

  pub fn tokens(&self) -> &[String] {
    &self.tokens
  }

  pub(crate) fn set_val(&mut self, val: u32) {
    self.val = val;
  }

  /// Converts an indexed-text opcode back to a plain text one.
  pub(crate) fn demote(&mut self) {
    if self.kind == OpcodeKind::IndexedText {
      self.kind = OpcodeKind::Text;
      self.val = UNSET;
    }
  }

  /// Converts a text opcode into an indexed-text one with the given
  /// string-table offset.
  pub(crate) fn promote(&mut self, val: u32) {
    if self.kind == OpcodeKind::Text {
      self.kind = OpcodeKind::IndexedText;
      self.val = val;
    }
  }

  /// Splits the text payload into lowercased search tokens for the fast
  /// prefix-match path.
  pub(crate) fn tokenize(&mut self) {
    if let Some(text) = &self.text {
      self.tokens = strings::tokenize(text);
      self.tokens.truncate(OPCODE_TOKEN_MAX);
      self.tokenized = true;
    }
  }
}

impl fmt::Display for Opcode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.kind {
      OpcodeKind::Function => write!(f, "func:{}()", self.val),
      OpcodeKind::Integer => write!(f, "{}", self.val),
      OpcodeKind::Text | OpcodeKind::IndexedText => {
        write!(f, "'{}'", self.text.as_deref().unwrap_or(""))
      }
      OpcodeKind::Bound => write!(f, "?{}", self.val),
      OpcodeKind::Boolean => write!(f, "{}", self.val != 0),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_promote_demote() {
    let mut op = Opcode::text("desktop");
    assert_eq!(op.kind(), OpcodeKind::Text);
    op.promote(42);
    assert_eq!(op.kind(), OpcodeKind::IndexedText);
    assert_eq!(op.val(), 42);
    assert_eq!(op.text_str(), Some("desktop"));
    op.demote();
    assert_eq!(op.kind(), OpcodeKind::Text);
    assert_eq!(op.val(), UNSET);
  }

  #[test]
  fn test_tokenize() {
    let mut op = Opcode::text("Image Editor");
    op.tokenize();
    assert!(op.is_tokenized());
    assert_eq!(op.tokens(), &["image".to_string(), "editor".to_string()]);
  }
}

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::{
  strings::{self, xml_escape},
  strtab::UNSET,
};

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct BuilderNodeFlags: u32 {
    /// Drop this node and its subtree at emit time.
    const IGNORE = 1 << 0;
    /// Keep text runs byte for byte, no whitespace repair.
    const LITERAL_TEXT = 1 << 1;
    const HAS_TEXT = 1 << 2;
    const HAS_TAIL = 1 << 3;
    /// Attach search tokens split from the text at emit time.
    const TOKENIZE_TEXT = 1 << 4;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseOrder {
  Pre,
  Post,
}

pub(crate) struct BuilderNodeAttr {
  pub name: String,
  pub value: String,
  pub name_idx: u32,
  pub value_idx: u32,
}

pub(crate) struct BuilderNodeInner {
  pub element: Option<String>,
  pub text: Option<String>,
  pub tail: Option<String>,
  pub flags: BuilderNodeFlags,
  pub priority: i32,
  pub attrs: Vec<BuilderNodeAttr>,
  pub children: Vec<BuilderNode>,
  pub parent: Option<Weak<RefCell<BuilderNodeInner>>>,
  pub tokens: Vec<String>,
  // filled in by the writer passes
  pub element_idx: u32,
  pub text_idx: u32,
  pub tail_idx: u32,
  pub token_idxs: Vec<u32>,
  pub offset: u32,
}

/// A mutable node of the in-memory tree the compiler builds from XML.
///
/// This is a cheap reference-counted handle; cloning shares the node. The
/// tree is built during ingest, mutated by fixups, consumed by the writer
/// and then discarded, all on one thread.
#[derive(Clone)]
pub struct BuilderNode(Rc<RefCell<BuilderNodeInner>>);

impl BuilderNode {
  pub fn new(element: &str) -> Self {
    Self::create(Some(element.to_string()))
  }

  /// The anonymous node the source roots get attached to.
  pub(crate) fn new_root() -> Self {
    Self::create(None)
  }

  fn create(element: Option<String>) -> Self {
    Self(Rc::new(RefCell::new(BuilderNodeInner {
      element,
      text: None,
      tail: None,
      flags: BuilderNodeFlags::empty(),
      priority: 0,
      attrs: Vec::new(),
      children: Vec::new(),
      parent: None,
      tokens: Vec::new(),
      element_idx: UNSET,
      text_idx: UNSET,
      tail_idx: UNSET,
      token_idxs: Vec::new(),
      offset: 0,
    })))
  }

  /// Creates a new node and adds it to the parent.
  pub fn insert(parent: &BuilderNode, element: &str) -> BuilderNode {
    let node = BuilderNode::new(element);
    parent.add_child(&node);
    node
  }

  /// Creates a new node with text and adds it to the parent.
  pub fn insert_text(parent: &BuilderNode, element: &str, text: &str) -> BuilderNode {
    let node = BuilderNode::new(element);
    node.set_text(text);
    parent.add_child(&node);
    node
  }

  pub(crate) fn inner(&self) -> &Rc<RefCell<BuilderNodeInner>> {
    &self.0
  }

  pub fn ptr_eq(&self, other: &BuilderNode) -> bool {
    Rc::ptr_eq(&self.0, &other.0)
  }

  pub(crate) fn addr(&self) -> usize {
    Rc::as_ptr(&self.0) as usize
  }

  pub fn has_flag(&self, flag: BuilderNodeFlags) -> bool {
    self.0.borrow().flags.contains(flag)
  }

  /// Adds a flag, propagating it to the whole subtree.
  pub fn add_flag(&self, flag: BuilderNodeFlags) {
    let children = {
      let mut inner = self.0.borrow_mut();
      if inner.flags.contains(flag) {
        return;
      }
      inner.flags |= flag;
      inner.children.clone()
    };
    for child in children {
      child.add_flag(flag);
    }
  }

  pub fn element(&self) -> Option<String> {
    self.0.borrow().element.clone()
  }

  pub fn set_element(&self, element: &str) {
    self.0.borrow_mut().element = Some(element.to_string());
  }

  pub fn attr(&self, name: &str) -> Option<String> {
    self
      .0
      .borrow()
      .attrs
      .iter()
      .find(|a| a.name == name)
      .map(|a| a.value.clone())
  }

  /// Parses an attribute as an integer, accepting a `0x` prefix; 0 if unset.
  pub fn attr_as_uint(&self, name: &str) -> u64 {
    self.attr(name).map(|v| parse_uint(&v)).unwrap_or(0)
  }

  /// Sets an attribute, replacing the value if the name exists. Order and
  /// case are preserved.
  pub fn set_attr(&self, name: &str, value: &str) {
    let mut inner = self.0.borrow_mut();
    for attr in inner.attrs.iter_mut() {
      if attr.name == name {
        attr.value = value.to_string();
        return;
      }
    }
    inner.attrs.push(BuilderNodeAttr {
      name: name.to_string(),
      value: value.to_string(),
      name_idx: UNSET,
      value_idx: UNSET,
    });
  }

  pub fn remove_attr(&self, name: &str) {
    let mut inner = self.0.borrow_mut();
    inner.attrs.retain(|a| a.name != name);
  }

  pub fn attr_count(&self) -> usize {
    self.0.borrow().attrs.len()
  }

  pub fn text(&self) -> Option<String> {
    self.0.borrow().text.clone()
  }

  pub fn tail(&self) -> Option<String> {
    self.0.borrow().tail.clone()
  }

  /// Parses the node text as an integer, accepting a `0x` prefix; 0 if
  /// unset.
  pub fn text_as_uint(&self) -> u64 {
    self.text().map(|v| parse_uint(&v)).unwrap_or(0)
  }

  /// Sets the text, repairing whitespace unless `LITERAL_TEXT` is set: lines
  /// are trimmed, single newlines become a space, blank lines become a
  /// paragraph break, and pure whitespace becomes no text at all.
  pub fn set_text(&self, text: &str) {
    let repaired = self.repair_text(text);
    let mut inner = self.0.borrow_mut();
    inner.text = repaired;
    inner.flags |= BuilderNodeFlags::HAS_TEXT;
  }

  /// Sets the tail, following the same repair rules as [`set_text`].
  ///
  /// [`set_text`]: BuilderNode::set_text
  pub fn set_tail(&self, tail: &str) {
    let repaired = self.repair_text(tail);
    let mut inner = self.0.borrow_mut();
    inner.tail = repaired;
    inner.flags |= BuilderNodeFlags::HAS_TAIL;
  }

  fn repair_text(&self, text: &str) -> Option<String> {
    // we know this is wanted verbatim
    if self.has_flag(BuilderNodeFlags::LITERAL_TEXT) {
      return Some(text.to_string());
    }

    // all whitespace?
    if strings::is_whitespace(text) {
      return None;
    }

    // all on one line, nothing to do
    if !text.contains('\n') {
      return Some(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut newline_count = 0u32;
    for line in text.split('\n') {
      let line = line.trim();

      // a blank line ends the paragraph and swallows the newline; two
      // newlines in sequence become a paragraph break
      if line.is_empty() {
        newline_count += 1;
        continue;
      }
      if newline_count == 1 && !out.is_empty() {
        out.push(' ');
      }
      if newline_count > 1 {
        out.push_str("\n\n");
      }
      out.push_str(line);
      newline_count = 1;
    }
    Some(out)
  }

  /// Attaches a search token used by fast prefix-match queries.
  pub fn add_token(&self, token: &str) {
    self.0.borrow_mut().tokens.push(token.to_string());
  }

  pub fn tokens(&self) -> Vec<String> {
    self.0.borrow().tokens.clone()
  }

  /// Splits the text into search tokens and marks the node tokenized.
  pub fn tokenize_text(&self) {
    let tokens = match self.text() {
      Some(text) => strings::tokenize(&text),
      None => return,
    };
    let mut inner = self.0.borrow_mut();
    inner.tokens.extend(tokens);
    inner.flags |= BuilderNodeFlags::TOKENIZE_TEXT;
  }

  pub fn add_child(&self, child: &BuilderNode) {
    debug_assert!(child.0.borrow().parent.is_none());
    child.0.borrow_mut().parent = Some(Rc::downgrade(&self.0));
    self.0.borrow_mut().children.push(child.clone());
  }

  pub fn remove_child(&self, child: &BuilderNode) {
    child.0.borrow_mut().parent = None;
    self
      .0
      .borrow_mut()
      .children
      .retain(|c| !Rc::ptr_eq(&c.0, &child.0));
  }

  /// Unlinks this node from its tree, leaving two separate trees. Do not
  /// call this from a traversal callback, set `IGNORE` instead.
  pub fn unlink(&self) {
    if let Some(parent) = self.parent() {
      parent.remove_child(self);
    }
  }

  pub fn parent(&self) -> Option<BuilderNode> {
    let weak = self.0.borrow().parent.clone()?;
    weak.upgrade().map(BuilderNode)
  }

  pub fn children(&self) -> Vec<BuilderNode> {
    self.0.borrow().children.clone()
  }

  pub fn first_child(&self) -> Option<BuilderNode> {
    self.0.borrow().children.first().cloned()
  }

  pub fn last_child(&self) -> Option<BuilderNode> {
    self.0.borrow().children.last().cloned()
  }

  /// Finds a child by element name and optionally by text.
  pub fn get_child(&self, element: &str, text: Option<&str>) -> Option<BuilderNode> {
    for child in self.children() {
      if child.element().as_deref() != Some(element) {
        continue;
      }
      if let Some(text) = text {
        if child.text().as_deref() != Some(text) {
          continue;
        }
      }
      return Some(child);
    }
    None
  }

  pub fn depth(&self) -> usize {
    match self.parent() {
      Some(parent) => parent.depth() + 1,
      None => 0,
    }
  }

  /// Visits the subtree, calling `func` for every node. Returning true from
  /// `func` halts the walk. A `max_depth` of 0 visits only this node, -1
  /// removes the limit.
  pub fn traverse<F>(&self, order: TraverseOrder, max_depth: i32, func: &mut F) -> bool
  where
    F: FnMut(&BuilderNode) -> bool,
  {
    self.traverse_depth(order, max_depth, 0, func)
  }

  fn traverse_depth<F>(
    &self,
    order: TraverseOrder,
    max_depth: i32,
    depth: i32,
    func: &mut F,
  ) -> bool
  where
    F: FnMut(&BuilderNode) -> bool,
  {
    if order == TraverseOrder::Pre && func(self) {
      return true;
    }
    if max_depth < 0 || depth < max_depth {
      for child in self.children() {
        if child.traverse_depth(order, max_depth, depth + 1, func) {
          return true;
        }
      }
    }
    if order == TraverseOrder::Post && func(self) {
      return true;
    }
    false
  }

  /// Sorts the direct children with a custom comparator.
  pub fn sort_children<F>(&self, mut func: F)
  where
    F: FnMut(&BuilderNode, &BuilderNode) -> std::cmp::Ordering,
  {
    self.0.borrow_mut().children.sort_by(|a, b| func(a, b));
  }

  pub(crate) fn priority(&self) -> i32 {
    self.0.borrow().priority
  }

  pub(crate) fn set_priority(&self, priority: i32) {
    self.0.borrow_mut().priority = priority;
  }

  /// Exports this subtree to XML, mostly useful in tests and fixups.
  pub fn export(&self) -> String {
    let mut xml = String::new();
    self.export_helper(&mut xml);
    xml
  }

  fn export_helper(&self, xml: &mut String) {
    let inner = self.0.borrow();
    let element = match &inner.element {
      Some(element) => element.clone(),
      None => {
        // anonymous root, export the children only
        drop(inner);
        for child in self.children() {
          child.export_helper(xml);
        }
        return;
      }
    };
    xml.push('<');
    xml.push_str(&element);
    for attr in &inner.attrs {
      xml.push_str(&format!(
        " {}=\"{}\"",
        xml_escape(&attr.name),
        xml_escape(&attr.value)
      ));
    }
    xml.push('>');
    if let Some(text) = &inner.text {
      xml.push_str(&xml_escape(text));
    }
    let tail = inner.tail.clone();
    drop(inner);
    for child in self.children() {
      child.export_helper(xml);
    }
    xml.push_str(&format!("</{}>", element));
    if let Some(tail) = tail {
      xml.push_str(&xml_escape(&tail));
    }
  }
}

fn parse_uint(value: &str) -> u64 {
  if let Some(hex) = value.strip_prefix("0x") {
    u64::from_str_radix(hex, 16).unwrap_or(0)
  } else {
    value.parse().unwrap_or(0)
  }
}

impl fmt::Debug for BuilderNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "BuilderNode(<{}>)",
      self.element().as_deref().unwrap_or("(root)")
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tree_building() {
    let root = BuilderNode::new("components");
    let child = BuilderNode::insert(&root, "component");
    BuilderNode::insert_text(&child, "id", "gimp.desktop");
    child.set_attr("type", "desktop");
    assert_eq!(child.attr("type").as_deref(), Some("desktop"));
    assert_eq!(child.parent().unwrap().element().as_deref(), Some("components"));
    assert_eq!(root.children().len(), 1);
    assert_eq!(child.depth(), 1);
    assert_eq!(
      root.export(),
      "<components><component type=\"desktop\"><id>gimp.desktop</id></component></components>"
    );
  }

  #[test]
  fn test_attr_replace_keeps_order() {
    let bn = BuilderNode::new("a");
    bn.set_attr("one", "1");
    bn.set_attr("two", "2");
    bn.set_attr("one", "1b");
    assert_eq!(bn.attr_count(), 2);
    assert_eq!(bn.attr("one").as_deref(), Some("1b"));
    bn.remove_attr("one");
    assert_eq!(bn.attr_count(), 1);
  }

  #[test]
  fn test_text_repair() {
    let bn = BuilderNode::new("p");
    bn.set_text("  one\n  two\n");
    assert_eq!(bn.text().as_deref(), Some("one two"));

    bn.set_text("para one\n\npara two");
    assert_eq!(bn.text().as_deref(), Some("para one\n\npara two"));

    bn.set_text("   \n \t ");
    assert_eq!(bn.text(), None);
    assert!(bn.has_flag(BuilderNodeFlags::HAS_TEXT));

    bn.set_text("single line");
    assert_eq!(bn.text().as_deref(), Some("single line"));
  }

  #[test]
  fn test_literal_text() {
    let bn = BuilderNode::new("pre");
    bn.add_flag(BuilderNodeFlags::LITERAL_TEXT);
    bn.set_text("  keep\n  this  ");
    assert_eq!(bn.text().as_deref(), Some("  keep\n  this  "));
  }

  #[test]
  fn test_flag_propagates() {
    let root = BuilderNode::new("a");
    let child = BuilderNode::insert(&root, "b");
    let grandchild = BuilderNode::insert(&child, "c");
    root.add_flag(BuilderNodeFlags::IGNORE);
    assert!(grandchild.has_flag(BuilderNodeFlags::IGNORE));
  }

  #[test]
  fn test_traverse_max_depth() {
    let root = BuilderNode::new("a");
    let child = BuilderNode::insert(&root, "b");
    BuilderNode::insert(&child, "c");
    let mut visited = Vec::new();
    root.traverse(TraverseOrder::Pre, 1, &mut |bn| {
      visited.push(bn.element().unwrap());
      false
    });
    assert_eq!(visited, vec!["a", "b"]);

    let mut visited = Vec::new();
    root.traverse(TraverseOrder::Pre, -1, &mut |bn| {
      visited.push(bn.element().unwrap());
      false
    });
    assert_eq!(visited, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_unlink() {
    let root = BuilderNode::new("a");
    let child = BuilderNode::insert(&root, "b");
    child.unlink();
    assert!(root.children().is_empty());
    assert!(child.parent().is_none());
  }

  #[test]
  fn test_tokenize_text() {
    let bn = BuilderNode::new("name");
    bn.set_text("Image Editor");
    bn.tokenize_text();
    assert!(bn.has_flag(BuilderNodeFlags::TOKENIZE_TEXT));
    assert_eq!(bn.tokens(), vec!["image", "editor"]);
  }

  #[test]
  fn test_get_child() {
    let root = BuilderNode::new("r");
    BuilderNode::insert_text(&root, "id", "one");
    BuilderNode::insert_text(&root, "id", "two");
    assert!(root.get_child("id", None).is_some());
    assert_eq!(
      root.get_child("id", Some("two")).unwrap().text().as_deref(),
      Some("two")
    );
    assert!(root.get_child("id", Some("three")).is_none());
  }
}

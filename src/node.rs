use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
  error::{Error, Result},
  query_context::QueryContext,
  silo::Silo,
  silo_export::ExportFlags,
  silo_query,
};

/// Shared per-offset slot for user data. When the silo's node cache is
/// enabled, every facade of the same node shares one of these, which is what
/// makes [`Node::set_data`] retrievable from a later query result.
#[derive(Default)]
pub(crate) struct NodeData {
  user: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// A thin view pairing a silo with a node offset.
///
/// Facades are cheap to clone and outlive the query that produced them; they
/// keep the silo alive through a reference count.
#[derive(Clone)]
pub struct Node {
  silo: Arc<Silo>,
  offset: u32,
  data: Arc<NodeData>,
}

impl Node {
  pub(crate) fn new(silo: Arc<Silo>, offset: u32, data: Arc<NodeData>) -> Self {
    Self { silo, offset, data }
  }

  pub fn silo(&self) -> &Arc<Silo> {
    &self.silo
  }

  /// The element name, e.g. `component`.
  pub fn element(&self) -> Result<&str> {
    self.silo.node_element(self.offset)
  }

  /// The text data, e.g. `gimp.desktop`.
  pub fn text(&self) -> Option<&str> {
    self.silo.node_text(self.offset).ok().flatten()
  }

  /// The tail data following this node, if any.
  pub fn tail(&self) -> Option<&str> {
    self.silo.node_tail(self.offset).ok().flatten()
  }

  pub fn attr(&self, name: &str) -> Option<&str> {
    self.silo.node_attr(self.offset, name).ok().flatten()
  }

  /// Parses an attribute as an integer, accepting a `0x` prefix for hex.
  pub fn attr_as_uint(&self, name: &str) -> Result<u64> {
    let value = self
      .attr(name)
      .ok_or_else(|| Error::NotFound(format!("no attribute {}", name)))?;
    parse_uint(value)
  }

  /// Parses the node text as an integer, accepting a `0x` prefix for hex.
  pub fn text_as_uint(&self) -> Result<u64> {
    let value = self
      .text()
      .ok_or_else(|| Error::NotFound("no text".to_string()))?;
    parse_uint(value)
  }

  pub fn parent(&self) -> Option<Node> {
    let parent = self.silo.parent_offset(self.offset).ok().flatten()?;
    Some(self.silo.create_node(parent, false))
  }

  pub fn next(&self) -> Option<Node> {
    let next = self.silo.next_offset(self.offset).ok().flatten()?;
    Some(self.silo.create_node(next, false))
  }

  pub fn child(&self) -> Option<Node> {
    let child = self.silo.child_offset(self.offset).ok().flatten()?;
    Some(self.silo.create_node(child, false))
  }

  pub fn children(&self) -> Vec<Node> {
    let mut children = Vec::new();
    let mut child = self.child();
    while let Some(node) = child {
      child = node.next();
      children.push(node);
    }
    children
  }

  /// How many parents the node has, where the root is 0.
  pub fn depth(&self) -> usize {
    let mut depth = 0;
    let mut offset = self.offset;
    while let Ok(Some(parent)) = self.silo.parent_offset(offset) {
      depth += 1;
      offset = parent;
    }
    depth
  }

  /// Searches below this node with a relative XPath, returning up to
  /// `limit` results, where 0 means "all".
  pub fn query(&self, xpath: &str, limit: usize) -> Result<Vec<Node>> {
    if xpath.starts_with('/') {
      return Err(Error::NotSupported(
        "XPath node query not supported".to_string(),
      ));
    }
    let query = self.silo.lookup_query(xpath)?;
    let mut context = QueryContext::new();
    context.set_limit(limit);
    silo_query::query_with_anchor(&self.silo, self.offset, &query, &context)
  }

  /// Searches below this node, returning the first result only.
  pub fn query_first(&self, xpath: &str) -> Result<Node> {
    let mut results = self.query(xpath, 1)?;
    Ok(results.remove(0))
  }

  /// Searches below this node and returns the text of the first result,
  /// not-found if the matched node carries none.
  pub fn query_text(&self, xpath: &str) -> Result<String> {
    let node = self.query_first(xpath)?;
    match node.text() {
      Some(text) => Ok(text.to_string()),
      None => Err(Error::NotFound(format!("no text for '{}'", xpath))),
    }
  }

  /// Like [`query_text`](Node::query_text), parsed as an integer.
  pub fn query_text_as_uint(&self, xpath: &str) -> Result<u64> {
    let text = self.query_text(xpath)?;
    parse_uint(&text)
  }

  /// Exports this subtree back to XML.
  pub fn export(&self, flags: ExportFlags) -> Result<String> {
    crate::silo_export::export_with_root(&self.silo, Some(self.offset), flags)
  }

  /// Attaches user data to the node. Without the node cache the data is
  /// only visible through clones of this facade.
  pub fn set_data(&self, data: Arc<dyn Any + Send + Sync>) {
    *self.data.user.lock() = Some(data);
  }

  pub fn get_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
    self.data.user.lock().clone()
  }
}

fn parse_uint(value: &str) -> Result<u64> {
  let parsed = if let Some(hex) = value.strip_prefix("0x") {
    u64::from_str_radix(hex, 16)
  } else {
    value.parse()
  };
  parsed.map_err(|_| Error::InvalidData(format!("cannot parse `{}` as an integer", value)))
}

impl PartialEq for Node {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.silo, &other.silo) && self.offset == other.offset
  }
}

impl Eq for Node {}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Node(@{} <{}>)",
      self.offset,
      self.element().unwrap_or("?")
    )
  }
}

use crate::{
  builder_node::{BuilderNode, TraverseOrder},
  error::Result,
};

/// The callback type run on builder nodes before emit. Returning an error
/// aborts the whole compile.
pub type FixupFunc = Box<dyn Fn(&BuilderNode) -> Result<()>>;

/// A function run on every [`BuilderNode`] the compile creates, identified
/// by an ID that feeds the silo GUID so that changing fixups changes the
/// cache key.
pub struct BuilderFixup {
  id: String,
  func: FixupFunc,
  max_depth: i32,
}

impl BuilderFixup {
  pub fn new(id: &str, func: FixupFunc) -> Self {
    Self {
      id: id.to_string(),
      func,
      max_depth: -1,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Limits visitation to nodes at this depth or less, where 0 visits the
  /// root only and -1 removes the limit. A bounded depth can speed up fixups
  /// on large deeply nested files considerably.
  pub fn set_max_depth(&mut self, max_depth: i32) {
    self.max_depth = max_depth;
  }

  pub fn max_depth(&self) -> i32 {
    self.max_depth
  }

  /// The GUID fragment identifying this fixup in the silo cache key.
  pub(crate) fn guid(&self) -> String {
    if self.max_depth != -1 {
      format!("func-id={}@{}", self.id, self.max_depth)
    } else {
      format!("func-id={}", self.id)
    }
  }

  /// Visits each node below `bn`, stopping at the first error.
  pub(crate) fn run(&self, bn: &BuilderNode) -> Result<()> {
    let mut first_error = None;
    bn.traverse(TraverseOrder::Pre, self.max_depth, &mut |node| {
      match (self.func)(node) {
        Ok(()) => false,
        Err(e) => {
          first_error = Some(e);
          true
        }
      }
    });
    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder_node::BuilderNodeFlags;
  use crate::error::Error;

  #[test]
  fn test_fixup_runs_on_subtree() {
    let root = BuilderNode::new("a");
    let child = BuilderNode::insert(&root, "b");
    BuilderNode::insert(&child, "c");
    let fixup = BuilderFixup::new(
      "upper",
      Box::new(|bn| {
        if let Some(element) = bn.element() {
          bn.set_element(&element.to_ascii_uppercase());
        }
        Ok(())
      }),
    );
    fixup.run(&root).unwrap();
    assert_eq!(root.element().as_deref(), Some("A"));
    assert_eq!(child.element().as_deref(), Some("B"));
  }

  #[test]
  fn test_fixup_error_aborts() {
    let root = BuilderNode::new("a");
    BuilderNode::insert(&root, "bad");
    let fixup = BuilderFixup::new(
      "reject",
      Box::new(|bn| {
        if bn.element().as_deref() == Some("bad") {
          return Err(Error::InvalidData("no bad elements".to_string()));
        }
        Ok(())
      }),
    );
    assert!(fixup.run(&root).is_err());
  }

  #[test]
  fn test_fixup_ignore_subtree() {
    let root = BuilderNode::new("a");
    let child = BuilderNode::insert(&root, "b");
    let fixup = BuilderFixup::new(
      "drop-b",
      Box::new(|bn| {
        if bn.element().as_deref() == Some("b") {
          bn.add_flag(BuilderNodeFlags::IGNORE);
        }
        Ok(())
      }),
    );
    fixup.run(&root).unwrap();
    assert!(child.has_flag(BuilderNodeFlags::IGNORE));
  }

  #[test]
  fn test_guid() {
    let mut fixup = BuilderFixup::new("tokenize", Box::new(|_| Ok(())));
    assert_eq!(fixup.guid(), "func-id=tokenize");
    fixup.set_max_depth(2);
    assert_eq!(fixup.guid(), "func-id=tokenize@2");
  }
}

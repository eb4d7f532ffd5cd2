use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use crate::error::{Error, Result};

/// Cooperative cancellation token, checked at I/O boundaries during a compile.
///
/// Cloning is cheap, all clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct Cancellable(Arc<AtomicBool>);

impl Cancellable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Requests cancellation; in-flight operations fail at their next check.
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  pub(crate) fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Cancellable;

  #[test]
  fn test_cancel() {
    let c = Cancellable::new();
    assert!(!c.is_cancelled());
    assert!(c.check().is_ok());
    c.cancel();
    assert!(c.is_cancelled());
    assert!(c.check().is_err());
    let c2 = c.clone();
    assert!(c2.is_cancelled());
  }
}

use std::cell::{Cell, RefCell};

/// Default chunk size, 1 MiB.
pub const ARENA_CHUNK_SIZE: usize = 1024 * 1024;

const WORD: usize = std::mem::size_of::<usize>();

/// Bump allocator over a list of fixed-size chunks.
///
/// Allocation is O(1) and there is no per-allocation metadata or individual
/// free: everything is released at once when the arena is dropped. Requests
/// larger than the chunk size get a dedicated chunk appended to the chunk
/// list without disturbing the current bump cursor.
///
/// Returned slices stay valid for the whole arena lifetime: chunks are boxed
/// slices whose heap storage never moves once allocated.
pub struct Arena {
  chunks: RefCell<Vec<Box<[u8]>>>,
  tail: Cell<*mut u8>,
  remaining: Cell<usize>,
  chunk_size: usize,
}

impl Default for Arena {
  fn default() -> Self {
    Self::new()
  }
}

impl Arena {
  pub fn new() -> Self {
    Self::with_chunk_size(ARENA_CHUNK_SIZE)
  }

  pub fn with_chunk_size(chunk_size: usize) -> Self {
    Self {
      chunks: RefCell::new(Vec::with_capacity(8)),
      tail: Cell::new(std::ptr::null_mut()),
      remaining: Cell::new(0),
      chunk_size: chunk_size.max(WORD),
    }
  }

  /// How many chunks have been allocated so far.
  pub fn chunk_count(&self) -> usize {
    self.chunks.borrow().len()
  }

  fn alloc_raw(&self, len: usize) -> *mut u8 {
    debug_assert!(len > 0);

    // a dedicated chunk, the current one keeps accepting small allocations
    if len > self.chunk_size {
      let mut chunk = vec![0u8; len].into_boxed_slice();
      let ptr = chunk.as_mut_ptr();
      self.chunks.borrow_mut().push(chunk);
      return ptr;
    }

    // round up to the nearest machine word so no allocation straddles more
    // cache lines than it has to
    let len_aligned = (len + WORD - 1) & !(WORD - 1);
    if len_aligned > self.remaining.get() {
      let mut chunk = vec![0u8; self.chunk_size].into_boxed_slice();
      let ptr = chunk.as_mut_ptr();
      self.chunks.borrow_mut().push(chunk);
      self.tail.set(ptr);
      self.remaining.set(self.chunk_size);
    }

    let ptr = self.tail.get();
    // SAFETY: the cursor stays inside the current chunk, `remaining` was
    // checked above
    self.tail.set(unsafe { ptr.add(len_aligned) });
    self.remaining.set(self.remaining.get() - len_aligned);
    ptr
  }

  /// Returns a zeroed word-aligned slice valid for the arena's lifetime.
  /// `alloc(0)` returns an empty slice.
  pub fn alloc(&self, len: usize) -> &mut [u8] {
    if len == 0 {
      return &mut [];
    }
    let ptr = self.alloc_raw(len);
    // SAFETY: the region is freshly bump-allocated and never handed out
    // twice, and the backing chunk outlives the returned borrow
    unsafe { std::slice::from_raw_parts_mut(ptr, len) }
  }

  /// Copies `src` into the arena.
  pub fn strdup<'a>(&'a self, src: &str) -> &'a str {
    self.strndup(src, src.len())
  }

  /// Copies at most `strsz` bytes of `src` into the arena, backing off to the
  /// nearest character boundary. The copy is terminated at exactly the
  /// computed length.
  pub fn strndup<'a>(&'a self, src: &str, strsz: usize) -> &'a str {
    let mut n = strsz.min(src.len());
    while !src.is_char_boundary(n) {
      n -= 1;
    }
    if n == 0 {
      return "";
    }
    let dst = self.alloc(n);
    dst.copy_from_slice(&src.as_bytes()[..n]);
    // SAFETY: an exact copy of a str prefix cut on a char boundary
    unsafe { std::str::from_utf8_unchecked(dst) }
  }
}

#[cfg(test)]
mod tests {
  use super::{Arena, WORD};

  #[test]
  fn test_alloc_zero() {
    let arena = Arena::new();
    assert!(arena.alloc(0).is_empty());
    assert_eq!(arena.chunk_count(), 0);
  }

  #[test]
  fn test_alloc_alignment() {
    let arena = Arena::new();
    let a = arena.alloc(3);
    let b = arena.alloc(3);
    assert_eq!(a.as_ptr() as usize % WORD, 0);
    assert_eq!(b.as_ptr() as usize % WORD, 0);
    assert_ne!(a.as_ptr(), b.as_ptr());
    a.copy_from_slice(b"abc");
    b.copy_from_slice(b"def");
    assert_eq!(a, b"abc");
  }

  #[test]
  fn test_oversize_keeps_cursor() {
    let arena = Arena::with_chunk_size(64);
    let a = arena.strdup("first");
    // bigger than the chunk, goes to its own chunk
    let big = arena.alloc(1000);
    assert_eq!(big.len(), 1000);
    let b = arena.strdup("second");
    assert_eq!(a, "first");
    assert_eq!(b, "second");
    // first chunk, oversize chunk, still no third
    assert_eq!(arena.chunk_count(), 2);
  }

  #[test]
  fn test_chunk_rollover() {
    let arena = Arena::with_chunk_size(64);
    let mut strs = Vec::new();
    for i in 0..64 {
      strs.push((arena.strdup(&format!("value-{}", i)), format!("value-{}", i)));
    }
    assert!(arena.chunk_count() > 1);
    for (got, want) in strs {
      assert_eq!(got, want);
    }
  }

  #[test]
  fn test_strndup() {
    let arena = Arena::new();
    assert_eq!(arena.strndup("hello world", 5), "hello");
    assert_eq!(arena.strndup("hi", 100), "hi");
    assert_eq!(arena.strndup("hi", 0), "");
    // backs off to the char boundary
    assert_eq!(arena.strndup("héllo", 2), "h");
  }
}

use crate::{
  error::{Error, Result},
  machine::MachineParseFlags,
  opcode::{Opcode, OpcodeKind},
  silo::Silo,
  strtab::UNSET,
};

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct QueryFlags: u32 {
    /// Fold constant predicate sub-expressions at compile time.
    const OPTIMIZE = 1 << 0;
    /// Resolve text literals to string-table indexes for integer compares.
    const USE_INDEXES = 1 << 1;
    /// Reverse the order of the results.
    const REVERSE = 1 << 2;
    /// Cache the facades of returned nodes even if the silo default is off.
    const FORCE_NODE_CACHE = 1 << 3;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
  Element,
  Wildcard,
  Parent,
}

/// One XPath step: an element name with compiled predicates, a wildcard, or
/// the parent axis.
pub(crate) struct QuerySection {
  pub kind: SectionKind,
  pub element: Option<String>,
  /// String-table offset of the element name, `UNSET` when the silo has
  /// never seen the name; such a section matches nothing.
  pub element_idx: u32,
  pub predicates: Vec<Vec<Opcode>>,
}

/// A compiled XPath query: one or more `|`-unioned paths of sections.
///
/// Queries are immutable after construction, hold no reference to the silo
/// they were compiled against, and may be executed concurrently from
/// multiple threads.
pub struct Query {
  xpath: String,
  flags: QueryFlags,
  paths: Vec<Vec<QuerySection>>,
  bound_count: usize,
}

impl Query {
  /// Compiles an XPath with the default flags.
  pub fn new(silo: &Silo, xpath: &str) -> Result<Self> {
    Self::with_flags(silo, xpath, QueryFlags::OPTIMIZE | QueryFlags::USE_INDEXES)
  }

  pub fn with_flags(silo: &Silo, xpath: &str, flags: QueryFlags) -> Result<Self> {
    let mut query = Self {
      xpath: xpath.to_string(),
      flags,
      paths: Vec::new(),
      bound_count: 0,
    };
    for part in xpath.split('|') {
      let path = query.parse_path(silo, part)?;
      if path.is_empty() {
        return Err(Error::NotSupported(format!(
          "no query sections for '{}'",
          xpath
        )));
      }
      query.paths.push(path);
    }
    query.number_bound_slots();
    Ok(query)
  }

  pub fn xpath(&self) -> &str {
    &self.xpath
  }

  pub fn flags(&self) -> QueryFlags {
    self.flags
  }

  /// How many `?` placeholders the XPath contained.
  pub fn bound_count(&self) -> usize {
    self.bound_count
  }

  pub(crate) fn paths(&self) -> &[Vec<QuerySection>] {
    &self.paths
  }

  /// Splits one path on `/`, honouring the `\/`, `\t` and `\n` escapes.
  fn parse_path(&mut self, silo: &Silo, xpath: &str) -> Result<Vec<QuerySection>> {
    let mut sections = Vec::new();
    let mut acc = String::new();
    let bytes = xpath.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
      if bytes[i] == b'\\' && i + 1 < bytes.len() {
        if matches!(bytes[i + 1], b'/' | b't' | b'n') {
          acc.push(bytes[i + 1] as char);
          i += 2;
          continue;
        }
      }
      if bytes[i] == b'/' {
        if acc.is_empty() {
          return Err(Error::NotFound("xpath section empty".to_string()));
        }
        sections.push(self.parse_section(silo, &acc)?);
        acc.clear();
        i += 1;
        continue;
      }
      // bulk-copy to the next special byte
      let next = bytes[i..]
        .iter()
        .position(|&b| matches!(b, b'\\' | b'/'))
        .map(|p| i + p)
        .unwrap_or(bytes.len());
      if next == i {
        // a trailing backslash with nothing to escape
        acc.push(bytes[i] as char);
        i += 1;
        continue;
      }
      acc.push_str(&xpath[i..next]);
      i = next;
    }
    if acc.is_empty() {
      return Err(Error::NotFound("xpath section empty".to_string()));
    }
    sections.push(self.parse_section(silo, &acc)?);
    Ok(sections)
  }

  /// Parses one `element[predicate]…` step.
  fn parse_section(&mut self, silo: &Silo, xpath: &str) -> Result<QuerySection> {
    // common XPath sections; only the exact section strings are special, so
    // something like `*[pred]` falls through to the element parser below
    if xpath == "parent::*" || xpath == ".." {
      return Ok(QuerySection {
        kind: SectionKind::Parent,
        element: None,
        element_idx: UNSET,
        predicates: Vec::new(),
      });
    }
    if xpath == "child::*" || xpath == "*" {
      return Ok(QuerySection {
        kind: SectionKind::Wildcard,
        element: None,
        element_idx: UNSET,
        predicates: Vec::new(),
      });
    }

    let mut element: Option<String> = None;
    let mut predicates = Vec::new();
    let bytes = xpath.as_bytes();
    let mut start = 0usize;
    for i in 0..bytes.len() {
      if start == 0 && bytes[i] == b'[' {
        if element.is_none() {
          element = Some(xpath[..i].to_string());
        }
        start = i;
        continue;
      }
      if start > 0 && bytes[i] == b']' {
        predicates.push(self.parse_predicate(silo, &xpath[start + 1..i])?);
        start = 0;
        continue;
      }
    }

    // incomplete predicate
    if start != 0 {
      return Err(Error::InvalidArgument(format!(
        "predicate {} was unfinished, missing ']'",
        &xpath[start..]
      )));
    }

    let element = element.unwrap_or_else(|| xpath.to_string());

    // an element name unknown to the silo matches nothing when run; this is
    // also what a predicated wildcard such as `*[pred]` degrades to, since
    // `*` is never a real element name
    let element_idx = silo.strtab_tag_idx(&element);
    Ok(QuerySection {
      kind: SectionKind::Element,
      element: Some(element),
      element_idx,
      predicates,
    })
  }

  fn parse_predicate(&mut self, silo: &Silo, text: &str) -> Result<Vec<Opcode>> {
    let mut machine_flags = MachineParseFlags::empty();
    if self.flags.contains(QueryFlags::OPTIMIZE) {
      machine_flags |= MachineParseFlags::OPTIMIZE;
    }
    let mut opcodes = silo.machine().parse_full(text, machine_flags)?;

    if self.flags.contains(QueryFlags::USE_INDEXES) {
      for op in opcodes.iter_mut() {
        match op.kind() {
          // repair indexed strings produced by fixups
          OpcodeKind::IndexedText if op.val() == UNSET => {
            let text = op.text_str().unwrap_or("");
            let val = silo.strtab_find_by_name(text);
            if val == UNSET {
              return Err(Error::InvalidArgument(format!(
                "indexed string '{}' was unfound",
                text
              )));
            }
            op.set_val(val);
          }
          // promote literals that the silo has interned, so comparisons
          // against attributes and text can short-circuit on the index
          OpcodeKind::Text => {
            if let Some(text) = op.text_str() {
              let val = silo.strtab_find_by_name(text);
              if val != UNSET {
                op.promote(val);
              }
            }
          }
          _ => {}
        }
      }
    } else {
      for op in opcodes.iter_mut() {
        op.demote();
      }
    }
    Ok(opcodes)
  }

  /// Assigns slot numbers to `?` placeholders, in section order across the
  /// whole XPath.
  fn number_bound_slots(&mut self) {
    let mut counter = 0u32;
    for path in self.paths.iter_mut() {
      for section in path.iter_mut() {
        for predicate in section.predicates.iter_mut() {
          for op in predicate.iter_mut() {
            if op.kind() == OpcodeKind::Bound {
              op.set_val(counter);
              counter += 1;
            }
          }
        }
      }
    }
    self.bound_count = counter as usize;
  }
}

impl std::fmt::Display for Query {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    for (pi, path) in self.paths.iter().enumerate() {
      if pi > 0 {
        write!(f, "|")?;
      }
      for (si, section) in path.iter().enumerate() {
        if si > 0 {
          write!(f, "/")?;
        }
        match section.kind {
          SectionKind::Parent => write!(f, "..")?,
          SectionKind::Wildcard => write!(f, "*")?,
          SectionKind::Element => {
            write!(f, "{}", section.element.as_deref().unwrap_or(""))?
          }
        }
        for predicate in &section.predicates {
          let rendered = predicate
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join(",");
          write!(f, "[{}]", rendered)?;
        }
      }
    }
    Ok(())
  }
}

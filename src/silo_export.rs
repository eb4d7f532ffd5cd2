use crate::{
  error::{Error, Result},
  silo::Silo,
  strings::xml_escape,
  strtab::UNSET,
};

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct ExportFlags: u32 {
    /// Prepend the `<?xml?>` declaration.
    const ADD_HEADER = 1 << 0;
    /// Add a newline after every tag.
    const FORMAT_MULTILINE = 1 << 1;
    /// Indent tags by their nesting level.
    const FORMAT_INDENT = 1 << 2;
    /// Write `<a />` for elements without text or children.
    const COLLAPSE_EMPTY = 1 << 3;
    /// Export the children of the root, not the root itself.
    const ONLY_CHILDREN = 1 << 4;
    /// Also export the following siblings of the root.
    const INCLUDE_SIBLINGS = 1 << 5;
  }
}

struct ExportHelper<'a> {
  silo: &'a Silo,
  xml: String,
  flags: ExportFlags,
  off: u32,
  level: usize,
}

impl ExportHelper<'_> {
  fn indent(&mut self) {
    if self.flags.contains(ExportFlags::FORMAT_INDENT) {
      for _ in 0..self.level {
        self.xml.push_str("  ");
      }
    }
  }

  fn newline(&mut self) {
    if self.flags.contains(ExportFlags::FORMAT_MULTILINE) {
      self.xml.push('\n');
    }
  }

  /// Writes one element and its subtree, advancing the cursor over the
  /// records consumed, sentinel included.
  fn export_node(&mut self, offset: u32) -> Result<()> {
    let record = self.silo.record(offset)?;
    self.off = offset;

    self.indent();
    let element_name = self.silo.strtab_str(record.element_name())?;
    self.xml.push('<');
    self.xml.push_str(element_name);

    for i in 0..record.attr_count() {
      let (name, value) = record.attr(i);
      let name = xml_escape(self.silo.strtab_str(name)?);
      let value = xml_escape(self.silo.strtab_str(value)?);
      self.xml.push_str(&format!(" {}=\"{}\"", name, value));
    }

    // collapse open and close together if there is no text or children
    let no_children = self.silo.child_offset(offset)?.is_none();
    if self.flags.contains(ExportFlags::COLLAPSE_EMPTY)
      && record.text() == UNSET
      && no_children
    {
      self.xml.push_str(" />");
      // skip over the element record and its single byte sentinel
      self.off += record.size();
      let sentinel = self.silo.record(self.off)?;
      self.off += sentinel.size();
    } else {
      if let Some(text) = self.silo.strtab_str_opt(record.text())? {
        self.xml.push('>');
        self.xml.push_str(&xml_escape(text));
      } else {
        self.xml.push('>');
        self.newline();
      }
      self.off += record.size();

      // recurse deeper
      loop {
        let child = self.silo.record(self.off)?;
        if !child.is_element() {
          break;
        }
        self.level += 1;
        self.export_node(self.off)?;
        self.level -= 1;
      }

      // the single byte sentinel closing the children group
      let sentinel = self.silo.record(self.off)?;
      if sentinel.is_element() {
        return Err(Error::InvalidData(format!(
          "no sentinel at {}",
          self.off
        )));
      }
      self.off += sentinel.size();

      if record.text() == UNSET {
        self.indent();
      }
      self.xml.push_str(&format!("</{}>", element_name));
    }

    if let Some(tail) = self.silo.strtab_str_opt(record.tail())? {
      self.xml.push_str(&xml_escape(tail));
    }
    self.newline();
    Ok(())
  }
}

/// Exports a silo, or the subtree rooted at `root`, back as XML.
pub(crate) fn export_with_root(
  silo: &Silo,
  root: Option<u32>,
  mut flags: ExportFlags,
) -> Result<String> {
  // this implies the other
  if flags.contains(ExportFlags::ONLY_CHILDREN) {
    flags |= ExportFlags::INCLUDE_SIBLINGS;
  }

  let start = match root {
    Some(off) => {
      if flags.contains(ExportFlags::ONLY_CHILDREN) {
        silo.child_offset(off)?
      } else {
        Some(off)
      }
    }
    None => silo.root_offset(),
  };
  let mut offset = match start {
    Some(off) => off,
    None => return Err(Error::NotFound("no data to export".to_string())),
  };

  let mut helper = ExportHelper {
    silo,
    xml: String::new(),
    flags,
    off: offset,
    level: 0,
  };
  if flags.contains(ExportFlags::ADD_HEADER) {
    helper
      .xml
      .push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
  }
  loop {
    helper.export_node(offset)?;
    if !flags.contains(ExportFlags::INCLUDE_SIBLINGS) {
      break;
    }
    match silo.next_offset(offset)? {
      Some(next) => offset = next,
      None => break,
    }
  }
  Ok(helper.xml)
}

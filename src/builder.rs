use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use quick_xml::{
  events::{BytesStart, Event},
  Reader,
};

use crate::{
  arena::Arena,
  builder_fixup::BuilderFixup,
  builder_node::{BuilderNode, BuilderNodeFlags},
  builder_source::BuilderSource,
  cancellable::Cancellable,
  error::{Error, Result},
  guid::Guid,
  machine::prefix_error,
  opcode::OPCODE_TOKEN_MAX,
  silo::{LoadFlags, Silo, SILO_MAGIC, SILO_VERSION},
  silo_node::{SiloNodeFlags, ATTR_COUNT_MAX, ATTR_SIZE, NODE_SIZE, SENTINEL_SIZE, TOKEN_SIZE},
  strings,
  strtab::{StrtabBuilder, UNSET},
};

use crate::builder_node::TraverseOrder::Pre;

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct CompileFlags: u32 {
    /// Keep only elements whose `xml:lang` is in the configured locales.
    const NATIVE_LANGS = 1 << 0;
    /// Among same-name siblings, keep only the best translation. Implies
    /// `NATIVE_LANGS`.
    const SINGLE_LANG = 1 << 1;
    /// Skip sources whose XML fails to parse instead of failing the compile.
    const IGNORE_INVALID = 1 << 2;
    /// The caller should monitor the output blob and invalidate on change.
    const WATCH_BLOB = 1 << 3;
    /// Accept a persisted silo even if its GUID does not match.
    const IGNORE_GUID = 1 << 4;
    /// Reject compiles producing more than one root element.
    const SINGLE_ROOT = 1 << 5;
  }
}

/// Compiles XML sources into an immutable [`Silo`].
///
/// Sources, locales and fixups all feed the GUID, so any change to the
/// inputs produces a different cache key for [`ensure`](Builder::ensure).
#[derive(Default)]
pub struct Builder {
  sources: Vec<BuilderSource>,
  nodes: Vec<BuilderNode>,
  fixups: Vec<BuilderFixup>,
  locales: Vec<String>,
  guid_input: String,
  cached: Option<Arc<Silo>>,
}

impl Builder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds an XML source to the compile.
  pub fn import_source(&mut self, source: BuilderSource) {
    self.append_guid(&source.guid());
    self.sources.push(source);
  }

  /// Adds a manually built node tree to the compile.
  pub fn import_node(&mut self, bn: BuilderNode) {
    self.append_guid(&format!("bn@{:#x}", bn.addr()));
    self.nodes.push(bn);
  }

  /// Adds a locale; locales added first are prioritised over locales added
  /// later. Encoded forms such as `fr_FR.UTF-8` are not useful here and get
  /// skipped.
  pub fn add_locale(&mut self, locale: &str) {
    if locale.ends_with(".UTF-8") {
      return;
    }
    if self.locales.iter().any(|l| l == locale) {
      return;
    }
    self.locales.push(locale.to_string());
    // if the user changes LANG, the blob is no longer valid
    self.append_guid(locale);
  }

  /// Adds a fixup run on the whole tree after all the per-source ones.
  pub fn add_fixup(&mut self, fixup: BuilderFixup) {
    self.append_guid(&fixup.guid());
    self.fixups.push(fixup);
  }

  /// Adds free text to the GUID input, typically a version or config hash.
  pub fn append_guid(&mut self, guid: &str) {
    if !self.guid_input.is_empty() {
      self.guid_input.push('&');
    }
    self.guid_input.push_str(guid);
  }

  fn generate_guid(&self) -> Guid {
    Guid::compute_for_data(self.guid_input.as_bytes())
  }

  /// Compiles all the imported sources and nodes into a silo held in
  /// memory.
  pub fn compile(
    &mut self,
    flags: CompileFlags,
    cancellable: Option<&Cancellable>,
  ) -> Result<Arc<Silo>> {
    let mut flags = flags;
    // this is inferred
    if flags.contains(CompileFlags::SINGLE_LANG) {
      flags |= CompileFlags::NATIVE_LANGS;
    }
    if flags.contains(CompileFlags::NATIVE_LANGS) && self.locales.is_empty() {
      return Err(Error::InvalidData(
        "no locales set when using NATIVE_LANGS".to_string(),
      ));
    }

    // build the node tree
    let root = BuilderNode::new_root();
    for source in &self.sources {
      let source_guid = source.guid();
      // find, or create the prefix
      let source_root = match source.prefix() {
        Some(prefix) => root
          .get_child(prefix, None)
          .unwrap_or_else(|| BuilderNode::insert(&root, prefix)),
        None => root.clone(),
      };
      debug!("compiling {}", source_guid);
      match compile_source(source, &source_root, flags, &self.locales, cancellable) {
        Ok(()) => {}
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) if flags.contains(CompileFlags::IGNORE_INVALID) => {
          debug!("ignoring invalid file {}: {}", source_guid, e);
          continue;
        }
        Err(e) => {
          return Err(prefix_error(
            e,
            &format!("failed to compile {}: ", source_guid),
          ))
        }
      }
    }

    // run the global fixups after the per-source ones
    for fixup in &self.fixups {
      fixup.run(&root)?;
    }

    // only include the highest priority translation
    if flags.contains(CompileFlags::SINGLE_LANG) {
      single_lang_filter(&root);
    }

    // add any manually built nodes
    for bn in &self.nodes {
      if bn.parent().is_none() {
        root.add_child(bn);
      }
    }

    if flags.contains(CompileFlags::SINGLE_ROOT) {
      let roots = root
        .children()
        .iter()
        .filter(|c| !c.has_flag(BuilderNodeFlags::IGNORE))
        .count();
      if roots > 1 {
        return Err(Error::InvalidData(format!(
          "the silo would have {} root elements",
          roots
        )));
      }
    }

    let blob = write_silo(&root, self.generate_guid())?;
    let silo = Silo::load_from_bytes(blob, LoadFlags::empty())?;
    self.cached = Some(silo.clone());
    Ok(silo)
  }

  /// Ensures `path` holds an up-to-date silo, compiling only when the
  /// persisted GUID no longer matches the current inputs. The returned silo
  /// is memory-mapped from the file.
  pub fn ensure<P: AsRef<Path>>(
    &mut self,
    path: P,
    flags: CompileFlags,
    cancellable: Option<&Cancellable>,
  ) -> Result<Arc<Silo>> {
    let path = path.as_ref();
    let load_flags = if flags.contains(CompileFlags::WATCH_BLOB) {
      LoadFlags::WATCH_BLOB
    } else {
      LoadFlags::empty()
    };

    // load the file and peek at the GUID
    debug!("attempting to load {}", path.display());
    match Silo::load_from_file(path, LoadFlags::empty()) {
      Ok(silo_tmp) => {
        // matches the thing that is already loaded
        if let Some(cached) = &self.cached {
          if silo_tmp.guid() == cached.guid() {
            debug!("returning unchanged silo");
            cached.uninvalidate();
            return Ok(cached.clone());
          }
        }
        let guid = self.generate_guid();
        if silo_tmp.guid() == &guid || flags.contains(CompileFlags::IGNORE_GUID) {
          debug!("adopting the silo persisted at {}", path.display());
          self.cached = Some(silo_tmp.clone());
          return Ok(silo_tmp);
        }
        debug!(
          "file GUID {} does not match current inputs {}",
          silo_tmp.guid(),
          guid
        );
      }
      Err(e) => debug!("failed to load silo: {}", e),
    }

    // fall back to just creating a new file
    let silo_new = self.compile(flags, cancellable)?;
    silo_new.save_to_file(path)?;

    // load from the file to re-mmap it
    let silo = Silo::load_from_file(path, load_flags)?;
    self.cached = Some(silo.clone());
    Ok(silo)
  }
}

fn push_u16(buf: &mut Vec<u8>, val: u16) {
  let mut word = [0u8; 2];
  LittleEndian::write_u16(&mut word, val);
  buf.extend_from_slice(&word);
}

fn push_u32(buf: &mut Vec<u8>, val: u32) {
  let mut word = [0u8; 4];
  LittleEndian::write_u32(&mut word, val);
  buf.extend_from_slice(&word);
}

fn push_u64(buf: &mut Vec<u8>, val: u64) {
  let mut word = [0u8; 8];
  LittleEndian::write_u64(&mut word, val);
  buf.extend_from_slice(&word);
}

fn locale_priority(locales: &[String], locale: &str) -> i32 {
  locales
    .iter()
    .position(|l| l == locale)
    .map(|i| (locales.len() - i) as i32)
    .unwrap_or(-1)
}

/// Streams one source through the SAX parser, building under `root`.
fn compile_source(
  source: &BuilderSource,
  root: &BuilderNode,
  flags: CompileFlags,
  locales: &[String],
  cancellable: Option<&Cancellable>,
) -> Result<()> {
  // add the source to a fake root in case it fails during processing
  let root_tmp = BuilderNode::new_root();
  ingest(source, &root_tmp, flags, locales, cancellable)?;

  // run the source's own fixups
  source.run_fixups(&root_tmp)?;

  // something we can query with later
  if let Some(info) = source.info() {
    for bn in root_tmp.children() {
      bn.add_child(&copy_subtree(info));
    }
  }

  // add the children to the main document
  for bn in root_tmp.children() {
    bn.unlink();
    root.add_child(&bn);
  }
  Ok(())
}

fn ingest(
  source: &BuilderSource,
  root_tmp: &BuilderNode,
  flags: CompileFlags,
  locales: &[String],
  cancellable: Option<&Cancellable>,
) -> Result<()> {
  let stream = source.open_stream()?;
  let mut reader = Reader::from_reader(BufReader::with_capacity(32 * 1024, stream));
  let literal_text = source
    .flags()
    .contains(crate::builder_source::SourceFlags::LITERAL_TEXT);

  let mut current = root_tmp.clone();
  let mut buf = Vec::new();
  loop {
    if let Some(cancellable) = cancellable {
      cancellable.check()?;
    }
    match reader.read_event(&mut buf) {
      Ok(Event::Start(ref e)) => {
        let bn = start_node(&reader, e, &current, flags, locales, literal_text)?;
        current = bn;
      }
      Ok(Event::Empty(ref e)) => {
        start_node(&reader, e, &current, flags, locales, literal_text)?;
      }
      Ok(Event::End(_)) => {
        current = current
          .parent()
          .ok_or_else(|| Error::InvalidData("mismatched XML; no parent".to_string()))?;
      }
      Ok(Event::Text(e)) => {
        let text = e.unescape_and_decode(&reader).map_err(Error::Read)?;
        ingest_text(&current, &text);
      }
      Ok(Event::CData(e)) => {
        let text = String::from_utf8(e.into_inner().to_vec()).map_err(Error::FromUtf8)?;
        ingest_text(&current, &text);
      }
      Ok(Event::Comment(_)) | Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
      Ok(Event::Eof) => break,
      Err(e) => return Err(Error::Read(e)),
    }
    buf.clear();
  }

  // more opening than closing
  if !current.ptr_eq(root_tmp) {
    return Err(Error::InvalidData("mismatched XML".to_string()));
  }
  Ok(())
}

fn start_node<B: std::io::BufRead>(
  reader: &Reader<B>,
  e: &BytesStart<'_>,
  current: &BuilderNode,
  flags: CompileFlags,
  locales: &[String],
  literal_text: bool,
) -> Result<BuilderNode> {
  let name = std::str::from_utf8(e.name()).map_err(Error::Utf8)?;
  let mut attrs = Vec::new();
  for attr in e.attributes() {
    let attr = attr.map_err(Error::Attr)?;
    let key = std::str::from_utf8(attr.key).map_err(Error::Utf8)?.to_string();
    let value = attr.unescape_and_decode_value(reader).map_err(Error::Read)?;
    attrs.push((key, value));
  }

  let bn = BuilderNode::new(name);

  // parent node is being ignored
  if current.has_flag(BuilderNodeFlags::IGNORE) {
    bn.add_flag(BuilderNodeFlags::IGNORE);
  }

  // check if we should ignore the locale
  if !bn.has_flag(BuilderNodeFlags::IGNORE) && flags.contains(CompileFlags::NATIVE_LANGS) {
    match attrs.iter().find(|(k, _)| k == "xml:lang") {
      // absent means inherited from the parent
      None => bn.set_priority(current.priority()),
      Some((_, lang)) => {
        let priority = locale_priority(locales, lang);
        if priority < 0 {
          bn.add_flag(BuilderNodeFlags::IGNORE);
        }
        bn.set_priority(priority);
      }
    }
  }

  if !bn.has_flag(BuilderNodeFlags::IGNORE) {
    for (key, value) in &attrs {
      bn.set_attr(key, value);
    }
  }
  if literal_text {
    bn.add_flag(BuilderNodeFlags::LITERAL_TEXT);
  }

  current.add_child(&bn);
  Ok(bn)
}

fn ingest_text(current: &BuilderNode, text: &str) {
  // unimportant
  if current.has_flag(BuilderNodeFlags::IGNORE) {
    return;
  }
  // between two child elements the text belongs to the preceding child
  if let Some(child) = current.last_child() {
    child.set_tail(text);
    return;
  }
  if !current.has_flag(BuilderNodeFlags::HAS_TEXT) {
    current.set_text(text);
    return;
  }
  current.set_tail(text);
}

fn copy_subtree(bn: &BuilderNode) -> BuilderNode {
  let copy = match bn.element() {
    Some(element) => BuilderNode::new(&element),
    None => BuilderNode::new_root(),
  };
  {
    let src = bn.inner().borrow();
    let mut dst = copy.inner().borrow_mut();
    dst.text = src.text.clone();
    dst.tail = src.tail.clone();
    dst.flags = src.flags;
    dst.priority = src.priority;
    dst.tokens = src.tokens.clone();
    for attr in &src.attrs {
      dst.attrs.push(crate::builder_node::BuilderNodeAttr {
        name: attr.name.clone(),
        value: attr.value.clone(),
        name_idx: UNSET,
        value_idx: UNSET,
      });
    }
  }
  for child in bn.children() {
    copy.add_child(&copy_subtree(&child));
  }
  copy
}

/// Keeps only the best-priority translation among same-name siblings.
fn single_lang_filter(root: &BuilderNode) {
  let mut to_destroy: Vec<BuilderNode> = Vec::new();
  root.traverse(Pre, -1, &mut |bn| {
    if bn.element().is_none() {
      return false;
    }
    // already handled as part of an earlier sibling group
    if bn.priority() == -2 {
      return false;
    }
    let parent = match bn.parent() {
      Some(parent) => parent,
      None => return false,
    };
    let element = bn.element();
    let group: Vec<BuilderNode> = parent
      .children()
      .into_iter()
      .filter(|c| c.element() == element)
      .collect();
    // only one thing, so bail early
    if group.len() == 1 {
      return false;
    }
    let mut best = 0;
    for node in &group {
      best = best.max(node.priority());
    }
    for node in &group {
      if node.priority() < best {
        to_destroy.push(node.clone());
      }
      // never visit this node again
      node.set_priority(-2);
    }
    false
  });
  for bn in to_destroy {
    bn.unlink();
  }
}

fn skip(bn: &BuilderNode) -> bool {
  bn.element().is_none() || bn.has_flag(BuilderNodeFlags::IGNORE)
}

/// The two-pass emitter: intern all strings, then write fixed-layout node
/// records and back-patch the parent/next offsets, then append the string
/// table after the node area.
fn write_silo(root: &BuilderNode, guid: Guid) -> Result<Vec<u8>> {
  let arena = Arena::new();
  let mut strtab = StrtabBuilder::new(&arena);

  // element names get stable indices at the head of the table
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let mut inner = bn.inner().borrow_mut();
    let element = match inner.element.clone() {
      Some(element) => element,
      None => return false,
    };
    inner.element_idx = strtab.intern(&element);
    false
  });
  strtab.mark_tags();

  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let mut inner = bn.inner().borrow_mut();
    for attr in inner.attrs.iter_mut() {
      attr.name_idx = strtab.intern(&attr.name);
    }
    false
  });
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let mut inner = bn.inner().borrow_mut();
    for attr in inner.attrs.iter_mut() {
      attr.value_idx = strtab.intern(&attr.value);
    }
    false
  });
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let mut inner = bn.inner().borrow_mut();
    if let Some(text) = inner.text.clone() {
      inner.text_idx = strtab.intern(&text);
    }
    if let Some(tail) = inner.tail.clone() {
      inner.tail_idx = strtab.intern(&tail);
    }
    false
  });
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let mut inner = bn.inner().borrow_mut();
    let tokens = inner.tokens.clone();
    for token in &tokens {
      let idx = strtab.intern(token);
      inner.token_idxs.push(idx);
    }
    false
  });

  // get the size of the node area to pre-size the buffer
  let mut nodetabsz: u32 = crate::silo::HEADER_SIZE;
  let mut size_err: Option<Error> = None;
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let inner = bn.inner().borrow();
    if inner.attrs.len() > ATTR_COUNT_MAX {
      size_err = Some(Error::InvalidData(format!(
        "{} attributes on <{}>, maximum is {}",
        inner.attrs.len(),
        inner.element.as_deref().unwrap_or(""),
        ATTR_COUNT_MAX
      )));
      return true;
    }
    let token_count = inner.token_idxs.len().min(OPCODE_TOKEN_MAX) as u32;
    nodetabsz += NODE_SIZE
      + inner.attrs.len() as u32 * ATTR_SIZE
      + token_count * TOKEN_SIZE
      + SENTINEL_SIZE;
    false
  });
  if let Some(e) = size_err {
    return Err(e);
  }

  // header
  let strtab_len = strtab.len() as u64;
  let mut buf: Vec<u8> = Vec::with_capacity(nodetabsz as usize + strtab_len as usize);
  push_u32(&mut buf, SILO_MAGIC);
  push_u32(&mut buf, SILO_VERSION);
  buf.extend_from_slice(guid.as_bytes());
  push_u16(&mut buf, strtab.n_tags());
  push_u16(&mut buf, 0);
  push_u32(&mut buf, nodetabsz);
  push_u64(&mut buf, nodetabsz as u64 + strtab_len);

  // write the node records
  write_node(&mut buf, root);

  // set all the ->next and ->parent offsets
  patch_offsets(&mut buf, root);

  // append the string table
  buf.extend_from_slice(strtab.as_bytes());
  Ok(buf)
}

fn write_node(buf: &mut Vec<u8>, bn: &BuilderNode) {
  if bn.has_flag(BuilderNodeFlags::IGNORE) {
    return;
  }
  let is_element = bn.element().is_some();
  if is_element {
    let mut inner = bn.inner().borrow_mut();

    // save this so we can set up the next pointers afterwards
    inner.offset = buf.len() as u32;

    // there is no point adding more tokens than search can match
    let token_count = inner.token_idxs.len().min(OPCODE_TOKEN_MAX);
    if inner.token_idxs.len() > OPCODE_TOKEN_MAX {
      debug!(
        "clamping {} tokens on <{}> to {}",
        inner.token_idxs.len(),
        inner.element.as_deref().unwrap_or(""),
        OPCODE_TOKEN_MAX
      );
    }

    let mut flags = SiloNodeFlags::IS_ELEMENT;
    if inner.flags.contains(BuilderNodeFlags::TOKENIZE_TEXT) {
      flags |= SiloNodeFlags::IS_TOKENIZED;
    }

    // whitespace-only literal text has no value in the silo
    let mut text_idx = inner.text_idx;
    let mut tail_idx = inner.tail_idx;
    if inner.flags.contains(BuilderNodeFlags::LITERAL_TEXT) {
      if let Some(text) = &inner.text {
        if strings::is_whitespace(text) {
          text_idx = UNSET;
        }
      }
      if let Some(tail) = &inner.tail {
        if strings::is_whitespace(tail) {
          tail_idx = UNSET;
        }
      }
    }

    buf.push(flags.bits() | (inner.attrs.len() as u8) << 2);
    buf.push(token_count as u8);
    push_u32(buf, inner.element_idx);
    push_u32(buf, 0); // parent
    push_u32(buf, 0); // next
    push_u32(buf, text_idx);
    push_u32(buf, tail_idx);
    for attr in &inner.attrs {
      push_u32(buf, attr.name_idx);
      push_u32(buf, attr.value_idx);
    }
    for idx in inner.token_idxs.iter().take(token_count) {
      push_u32(buf, *idx);
    }
  }

  for child in bn.children() {
    write_node(buf, &child);
  }

  // terminate the children group
  if is_element {
    buf.push(0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::silo_export::ExportFlags;
  use crate::silo_node::SENTINEL_SIZE;

  const COMPONENTS_XML: &str = "<components origin=\"lvfs\">\
     <component type=\"desktop\"><id>gimp.desktop</id></component>\
     </components>";

  fn compile_xml(xml: &str) -> Arc<Silo> {
    let mut builder = Builder::new();
    builder
      .import_source(BuilderSource::from_xml(xml, crate::builder_source::SourceFlags::empty()).unwrap());
    builder.compile(CompileFlags::empty(), None).unwrap()
  }

  #[test]
  fn test_compile_basic() {
    let silo = compile_xml(COMPONENTS_XML);
    assert!(!silo.is_empty());
    assert_eq!(silo.node_count().unwrap(), 3);
    assert_ne!(silo.strtab_tag_idx("components"), UNSET);
    assert_ne!(silo.strtab_tag_idx("component"), UNSET);
    assert_ne!(silo.strtab_tag_idx("id"), UNSET);
    assert_eq!(silo.strtab_tag_idx("dave"), UNSET);
  }

  #[test]
  fn test_compile_empty_xml() {
    let silo = compile_xml("");
    assert!(silo.is_empty());
    assert_eq!(silo.node_count().unwrap(), 0);
    assert!(matches!(silo.query("components", 0), Err(Error::NotFound(_))));
  }

  #[test]
  fn test_export_roundtrip() {
    let silo = compile_xml(COMPONENTS_XML);
    // canonical input, so the export is byte identical
    let exported = silo.export(ExportFlags::empty()).unwrap();
    assert_eq!(exported, COMPONENTS_XML);
  }

  #[test]
  fn test_roundtrip_idempotent() {
    let xml = COMPONENTS_XML;
    let silo1 = compile_xml(xml);
    let exported = silo1.export(ExportFlags::empty()).unwrap();
    assert_eq!(exported, xml);
    let silo2 = compile_xml(&exported);
    // same GUID, same file size, same node offsets
    assert_eq!(silo1.guid(), silo2.guid());
    assert_eq!(silo1.bytes(), silo2.bytes());
  }

  #[test]
  fn test_guid_stable_across_compiles() {
    let silo1 = compile_xml(COMPONENTS_XML);
    let silo2 = compile_xml(COMPONENTS_XML);
    assert_eq!(silo1.guid(), silo2.guid());

    let silo3 = compile_xml("<components><other/></components>");
    assert_ne!(silo1.guid(), silo3.guid());
  }

  #[test]
  fn test_guid_changes_with_fixups_and_locales() {
    let source = || BuilderSource::from_xml("<a/>", crate::builder_source::SourceFlags::empty()).unwrap();
    let mut b1 = Builder::new();
    b1.import_source(source());
    let mut b2 = Builder::new();
    b2.import_source(source());
    b2.add_fixup(BuilderFixup::new("noop", Box::new(|_| Ok(()))));
    let mut b3 = Builder::new();
    b3.import_source(source());
    b3.add_locale("fr");
    let g1 = *b1.compile(CompileFlags::empty(), None).unwrap().guid();
    let g2 = *b2.compile(CompileFlags::empty(), None).unwrap().guid();
    let g3 = *b3.compile(CompileFlags::empty(), None).unwrap().guid();
    assert_ne!(g1, g2);
    assert_ne!(g1, g3);
    assert_ne!(g2, g3);
  }

  #[test]
  fn test_text_and_tail() {
    let silo = compile_xml("<r><a>text</a>tail<b/></r>");
    let a = silo.query_first("r/a").unwrap();
    assert_eq!(a.text(), Some("text"));
    assert_eq!(a.tail(), Some("tail"));
    let b = silo.query_first("r/b").unwrap();
    assert_eq!(b.text(), None);
  }

  #[test]
  fn test_whitespace_formatting_is_repaired() {
    let silo = compile_xml("<r>\n  <p>\n    one\n    two\n  </p>\n</r>");
    let p = silo.query_first("r/p").unwrap();
    assert_eq!(p.text(), Some("one two"));
    let r = silo.query_first("r").unwrap();
    assert_eq!(r.text(), None);
  }

  #[test]
  fn test_literal_text_whitespace_scrubbed_at_emit() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml(
        "<r><pre>  kept  </pre><blank>   </blank></r>",
        crate::builder_source::SourceFlags::LITERAL_TEXT,
      )
      .unwrap(),
    );
    let silo = builder.compile(CompileFlags::empty(), None).unwrap();
    let pre = silo.query_first("r/pre").unwrap();
    assert_eq!(pre.text(), Some("  kept  "));
    // pure whitespace is dropped even in literal mode
    let blank = silo.query_first("r/blank").unwrap();
    assert_eq!(blank.text(), None);
  }

  #[test]
  fn test_mismatched_xml() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a><b></a>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    assert!(builder.compile(CompileFlags::empty(), None).is_err());
  }

  #[test]
  fn test_ignore_invalid_skips_bad_sources() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a><b></a>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    builder.import_source(
      BuilderSource::from_xml("<ok><id>x</id></ok>", crate::builder_source::SourceFlags::empty())
        .unwrap(),
    );
    let silo = builder
      .compile(CompileFlags::IGNORE_INVALID, None)
      .unwrap();
    assert!(silo.query_first("ok/id").is_ok());
  }

  #[test]
  fn test_single_root() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a/>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    builder.import_source(
      BuilderSource::from_xml("<b/>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    assert!(builder.compile(CompileFlags::SINGLE_ROOT, None).is_err());
  }

  #[test]
  fn test_single_lang_keeps_best_translation() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml(
        "<c><p xml:lang=\"de\">D</p><p>E</p><p xml:lang=\"fr\">F</p></c>",
        crate::builder_source::SourceFlags::empty(),
      )
      .unwrap(),
    );
    builder.add_locale("fr");
    builder.add_locale("C");
    let silo = builder.compile(CompileFlags::SINGLE_LANG, None).unwrap();
    let exported = silo.export(ExportFlags::empty()).unwrap();
    assert!(!exported.contains('D'));
    assert!(!exported.contains('E'));
    assert!(exported.contains('F'));
    let results = silo.query("c/p", 0).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text(), Some("F"));
  }

  #[test]
  fn test_native_langs_requires_locales() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a/>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    assert!(builder.compile(CompileFlags::NATIVE_LANGS, None).is_err());
  }

  #[test]
  fn test_prefix_and_info() {
    let mut builder = Builder::new();
    let mut source =
      BuilderSource::from_xml("<app><id>one</id></app>", crate::builder_source::SourceFlags::empty())
        .unwrap();
    source.set_prefix("installed");
    let info = BuilderNode::new("info");
    BuilderNode::insert_text(&info, "filename", "/tmp/one.xml");
    source.set_info(info);
    builder.import_source(source);
    let silo = builder.compile(CompileFlags::empty(), None).unwrap();
    let node = silo.query_first("installed/app/info/filename").unwrap();
    assert_eq!(node.text(), Some("/tmp/one.xml"));
  }

  #[test]
  fn test_fixup_error_aborts_compile() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a><bad/></a>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    builder.add_fixup(BuilderFixup::new(
      "reject-bad",
      Box::new(|bn| {
        if bn.element().as_deref() == Some("bad") {
          return Err(Error::InvalidData("bad element".to_string()));
        }
        Ok(())
      }),
    ));
    assert!(builder.compile(CompileFlags::empty(), None).is_err());
  }

  #[test]
  fn test_fixup_ignore_drops_subtree() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml(
        "<r><keep>a</keep><drop><sub/></drop></r>",
        crate::builder_source::SourceFlags::empty(),
      )
      .unwrap(),
    );
    builder.add_fixup(BuilderFixup::new(
      "drop",
      Box::new(|bn| {
        if bn.element().as_deref() == Some("drop") {
          bn.add_flag(BuilderNodeFlags::IGNORE);
        }
        Ok(())
      }),
    ));
    let silo = builder.compile(CompileFlags::empty(), None).unwrap();
    let exported = silo.export(ExportFlags::empty()).unwrap();
    assert_eq!(exported, "<r><keep>a</keep></r>");
  }

  #[test]
  fn test_import_node() {
    let mut builder = Builder::new();
    let bn = BuilderNode::new("manual");
    BuilderNode::insert_text(&bn, "id", "by-hand");
    builder.import_node(bn);
    let silo = builder.compile(CompileFlags::empty(), None).unwrap();
    assert_eq!(
      silo.query_first("manual/id").unwrap().text(),
      Some("by-hand")
    );
  }

  #[test]
  fn test_attr_count_capped() {
    let mut xml = String::from("<r><a");
    for i in 0..64 {
      xml.push_str(&format!(" k{}=\"v\"", i));
    }
    xml.push_str("/></r>");
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml(&xml, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    let err = builder.compile(CompileFlags::empty(), None).unwrap_err();
    assert!(matches!(err, Error::InvalidData(_)));
  }

  #[test]
  fn test_token_count_clamped() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<r><name>x</name></r>", crate::builder_source::SourceFlags::empty())
        .unwrap(),
    );
    builder.add_fixup(BuilderFixup::new(
      "many-tokens",
      Box::new(|bn| {
        if bn.element().as_deref() == Some("name") {
          bn.add_flag(BuilderNodeFlags::TOKENIZE_TEXT);
          for i in 0..40 {
            bn.add_token(&format!("token{:02}", i));
          }
        }
        Ok(())
      }),
    ));
    let silo = builder.compile(CompileFlags::empty(), None).unwrap();
    let dump = silo.dump().unwrap();
    let token_lines = dump.lines().filter(|l| l.starts_with("token:")).count();
    assert_eq!(token_lines, OPCODE_TOKEN_MAX);
  }

  #[test]
  fn test_fixed_node_record_size() {
    // an element with no attributes and no children is the fixed record
    // plus its sentinel
    let silo1 = compile_xml("<a/>");
    let silo2 = compile_xml("<a><b/></a>");
    let diff = silo2.bytes().len() as u32 - silo1.bytes().len() as u32;
    // one extra element record, sentinel, and the "b\0" string
    assert_eq!(diff, 22 + SENTINEL_SIZE + 2);
  }

  #[test]
  fn test_sentinel_structure() {
    let silo = compile_xml("<a><b/><c/></a>");
    let dump = silo.dump().unwrap();
    let mut kinds = Vec::new();
    for line in dump.lines() {
      if line.starts_with("NODE @") {
        kinds.push('N');
      } else if line.starts_with("SENT @") {
        kinds.push('S');
      }
    }
    // a, b, sentinel(b), c, sentinel(c), sentinel(a)
    assert_eq!(kinds, vec!['N', 'N', 'S', 'N', 'S', 'S']);
  }

  #[test]
  fn test_cancellation() {
    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_xml("<a><b/></a>", crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    let cancellable = Cancellable::new();
    cancellable.cancel();
    let err = builder
      .compile(CompileFlags::empty(), Some(&cancellable))
      .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
  }

  #[test]
  fn test_ensure_cache_hit() {
    let dir = tempfile::tempdir().unwrap();
    let xml_path = dir.path().join("input.xml");
    std::fs::write(&xml_path, COMPONENTS_XML).unwrap();
    let blob_path = dir.path().join("cache.xmlb");

    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_file(&xml_path, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    let silo1 = builder.ensure(&blob_path, CompileFlags::empty(), None).unwrap();
    let guid1 = *silo1.guid();
    let blob_bytes = std::fs::read(&blob_path).unwrap();

    // same inputs: the file is not rewritten and the very same mapping is
    // handed back
    let silo2 = builder.ensure(&blob_path, CompileFlags::empty(), None).unwrap();
    assert_eq!(silo2.guid(), &guid1);
    assert!(Arc::ptr_eq(&silo1, &silo2));
    assert_eq!(silo1.bytes().as_ptr(), silo2.bytes().as_ptr());
    assert_eq!(std::fs::read(&blob_path).unwrap(), blob_bytes);

    // a fresh builder with the same inputs adopts the persisted silo
    let mut builder2 = Builder::new();
    builder2.import_source(
      BuilderSource::from_file(&xml_path, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    let silo3 = builder2.ensure(&blob_path, CompileFlags::empty(), None).unwrap();
    assert_eq!(silo3.guid(), &guid1);
    assert_eq!(std::fs::read(&blob_path).unwrap(), blob_bytes);
  }

  #[test]
  fn test_ensure_recompiles_on_change() {
    let dir = tempfile::tempdir().unwrap();
    let xml_path = dir.path().join("input.xml");
    std::fs::write(&xml_path, "<a><id>one</id></a>").unwrap();
    let blob_path = dir.path().join("cache.xmlb");

    let mut builder = Builder::new();
    builder.import_source(
      BuilderSource::from_file(&xml_path, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    let silo1 = builder.ensure(&blob_path, CompileFlags::empty(), None).unwrap();

    // a changed fixup set means a changed GUID, so a fresh builder compiles
    let mut builder2 = Builder::new();
    builder2.import_source(
      BuilderSource::from_file(&xml_path, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    builder2.add_fixup(BuilderFixup::new("extra", Box::new(|_| Ok(()))));
    let silo2 = builder2.ensure(&blob_path, CompileFlags::empty(), None).unwrap();
    assert_ne!(silo1.guid(), silo2.guid());

    // IGNORE_GUID accepts whatever is on disk
    let mut builder3 = Builder::new();
    builder3.import_source(
      BuilderSource::from_file(&xml_path, crate::builder_source::SourceFlags::empty()).unwrap(),
    );
    builder3.add_fixup(BuilderFixup::new("other", Box::new(|_| Ok(()))));
    let silo3 = builder3
      .ensure(&blob_path, CompileFlags::IGNORE_GUID, None)
      .unwrap();
    assert_eq!(silo3.guid(), silo2.guid());
  }

  #[test]
  fn test_invalidation_observer() {
    let silo = compile_xml("<a/>");
    assert!(silo.is_valid());
    let flipped = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flipped_cb = flipped.clone();
    silo.add_validity_observer(Box::new(move |valid| {
      if !valid {
        flipped_cb.store(true, std::sync::atomic::Ordering::SeqCst);
      }
    }));
    silo.invalidate();
    assert!(!silo.is_valid());
    assert!(flipped.load(std::sync::atomic::Ordering::SeqCst));
  }

  #[test]
  fn test_load_rejects_bad_magic() {
    let silo = compile_xml("<a/>");
    let mut bytes = silo.bytes().to_vec();
    bytes[0] = 0xff;
    assert!(Silo::load_from_bytes(bytes.clone(), LoadFlags::empty()).is_err());
    // NO_MAGIC bypasses the check for fuzzing and testing
    assert!(Silo::load_from_bytes(bytes, LoadFlags::NO_MAGIC).is_ok());
  }

  #[test]
  fn test_load_rejects_truncated() {
    let silo = compile_xml("<a/>");
    let bytes = silo.bytes()[..30].to_vec();
    assert!(Silo::load_from_bytes(bytes, LoadFlags::empty()).is_err());
  }

  #[test]
  fn test_save_and_mmap_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sub").join("saved.xmlb");
    let silo = compile_xml(COMPONENTS_XML);
    silo.save_to_file(&path).unwrap();
    let loaded = Silo::load_from_file(&path, LoadFlags::empty()).unwrap();
    assert_eq!(loaded.bytes(), silo.bytes());
    assert_eq!(loaded.guid(), silo.guid());
    assert_eq!(
      loaded.query_first("components/component/id").unwrap().text(),
      Some("gimp.desktop")
    );
  }
}

fn patch_offsets(buf: &mut Vec<u8>, root: &BuilderNode) {
  root.traverse(Pre, -1, &mut |bn| {
    if skip(bn) {
      return false;
    }
    let offset = bn.inner().borrow().offset as usize;
    let parent = match bn.parent() {
      Some(parent) => parent,
      None => return false,
    };

    // the anonymous root stays at offset zero
    if parent.element().is_some() {
      let parent_off = parent.inner().borrow().offset;
      LittleEndian::write_u32(&mut buf[offset + 6..offset + 10], parent_off);
    }

    // point at the nearest subsequent sibling that still exists
    let siblings = parent.children();
    let mut found = false;
    for sibling in &siblings {
      if sibling.ptr_eq(bn) {
        found = true;
        continue;
      }
      if !found {
        continue;
      }
      if !sibling.has_flag(BuilderNodeFlags::IGNORE) {
        let next_off = sibling.inner().borrow().offset;
        LittleEndian::write_u32(&mut buf[offset + 10..offset + 14], next_off);
        break;
      }
    }
    false
  });
}

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::{
  error::{Error, Result},
  guid::Guid,
  machine::{EvalContext, Machine, QueryData},
  node::{Node, NodeData},
  opcode::Opcode,
  query::Query,
  query_context::QueryContext,
  silo_export::ExportFlags,
  silo_node::SiloNodeRecord,
  silo_query,
  stack::{Stack, TextValue, Value},
  strings,
  strtab::UNSET,
};

/// `XMLb` in little-endian byte order.
pub const SILO_MAGIC: u32 = 0x624c_4d58;
pub const SILO_VERSION: u32 = 0x0000_0009;

/// magic, version, guid, strtab_ntags, padding, strtab, filesz
pub(crate) const HEADER_SIZE: u32 = 40;

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct LoadFlags: u32 {
    /// Do not check the magic or version, used for fuzzing and testing.
    const NO_MAGIC = 1 << 0;
    /// The caller monitors the backing blob and invalidates on change.
    const WATCH_BLOB = 1 << 1;
  }
}

enum SiloData {
  Owned(Vec<u8>),
  Mapped(Mmap),
}

impl SiloData {
  fn bytes(&self) -> &[u8] {
    match self {
      SiloData::Owned(buf) => buf,
      SiloData::Mapped(map) => map,
    }
  }
}

/// A read-only store of compiled XML data.
///
/// After loading, a silo only exposes read operations and is safe to share
/// between threads behind an [`Arc`]. The mutable caches inside (query
/// cache, node cache, stemmer, observers) are individually locked.
pub struct Silo {
  data: SiloData,
  guid: Guid,
  strtab: u32,
  strtab_tags: HashMap<String, u32>,
  valid: AtomicBool,
  machine: Machine,
  enable_node_cache: AtomicBool,
  nodes: Mutex<HashMap<u32, Arc<NodeData>>>,
  query_cache: RwLock<HashMap<String, Arc<Query>>>,
  stemmer: Mutex<Option<Box<dyn Fn(&str) -> String + Send>>>,
  observers: Mutex<Vec<Box<dyn Fn(bool) + Send>>>,
  profile: AtomicBool,
  profile_str: Mutex<String>,
}

impl Silo {
  /// Loads a silo from an owned byte buffer, e.g. fresh compiler output.
  pub fn load_from_bytes(blob: Vec<u8>, flags: LoadFlags) -> Result<Arc<Self>> {
    Self::load(SiloData::Owned(blob), flags)
  }

  /// Memory-maps a silo from a file. The mapping stays alive for the whole
  /// silo lifetime and is never written through.
  pub fn load_from_file<P: AsRef<Path>>(path: P, flags: LoadFlags) -> Result<Arc<Self>> {
    let file = fs::File::open(path.as_ref()).map_err(Error::Io)?;
    // SAFETY: the mapping is read-only and silo files are replaced by
    // rename, never modified in place
    let map = unsafe { Mmap::map(&file) }.map_err(Error::Io)?;
    Self::load(SiloData::Mapped(map), flags)
  }

  fn load(data: SiloData, flags: LoadFlags) -> Result<Arc<Self>> {
    let start = Instant::now();
    let bytes = data.bytes();
    if bytes.len() < HEADER_SIZE as usize {
      return Err(Error::InvalidData("blob too small".to_string()));
    }

    if !flags.contains(LoadFlags::NO_MAGIC) {
      let magic = LittleEndian::read_u32(&bytes[0..4]);
      if magic != SILO_MAGIC {
        return Err(Error::InvalidData("magic incorrect".to_string()));
      }
      let version = LittleEndian::read_u32(&bytes[4..8]);
      if version != SILO_VERSION {
        return Err(Error::InvalidData(format!(
          "version incorrect, got {}, expected {}",
          version, SILO_VERSION
        )));
      }
      let filesz = LittleEndian::read_u64(&bytes[32..40]);
      if filesz != bytes.len() as u64 {
        return Err(Error::InvalidData(format!(
          "file size incorrect, got {}, expected {}",
          bytes.len(),
          filesz
        )));
      }
    }

    let mut guid_bytes = [0u8; Guid::SIZE];
    guid_bytes.copy_from_slice(&bytes[8..24]);
    let guid = Guid::from_bytes(guid_bytes);

    let strtab_ntags = LittleEndian::read_u16(&bytes[24..26]);
    let strtab = LittleEndian::read_u32(&bytes[28..32]);
    if strtab < HEADER_SIZE || strtab as usize > bytes.len() {
      return Err(Error::InvalidData("strtab incorrect".to_string()));
    }

    // the first strtab_ntags strings are the element-name index
    let mut strtab_tags = HashMap::new();
    let region = &bytes[strtab as usize..];
    let mut off = 0usize;
    for _ in 0..strtab_ntags {
      let nul = memchr::memchr(0, &region[off..])
        .ok_or_else(|| Error::InvalidData("strtab_ntags incorrect".to_string()))?;
      let name = std::str::from_utf8(&region[off..off + nul]).map_err(Error::Utf8)?;
      strtab_tags.insert(name.to_string(), off as u32);
      off += nul + 1;
    }

    let silo = Arc::new(Self {
      data,
      guid,
      strtab,
      strtab_tags,
      valid: AtomicBool::new(true),
      machine: Self::build_machine(),
      enable_node_cache: AtomicBool::new(false),
      nodes: Mutex::new(HashMap::new()),
      query_cache: RwLock::new(HashMap::new()),
      stemmer: Mutex::new(None),
      observers: Mutex::new(Vec::new()),
      profile: AtomicBool::new(false),
      profile_str: Mutex::new(String::new()),
    });
    silo.add_profile(start, "parse blob");
    Ok(silo)
  }

  /// Convenience: compiles an XML string straight into an in-memory silo.
  pub fn from_xml(xml: &str) -> Result<Arc<Self>> {
    use crate::builder::{Builder, CompileFlags};
    use crate::builder_source::{BuilderSource, SourceFlags};
    let mut builder = Builder::new();
    builder.import_source(BuilderSource::from_xml(xml, SourceFlags::empty())?);
    builder.compile(CompileFlags::empty(), None)
  }

  /// Saves the silo bytes, atomically on POSIX via a sibling temporary file.
  pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
      }
    }
    #[cfg(not(windows))]
    {
      let mut tmp = path.as_os_str().to_os_string();
      tmp.push(".tmp");
      let tmp = std::path::PathBuf::from(tmp);
      fs::write(&tmp, self.bytes()).map_err(Error::Io)?;
      fs::rename(&tmp, path).map_err(Error::Io)?;
    }
    #[cfg(windows)]
    {
      fs::write(path, self.bytes()).map_err(Error::Io)?;
    }
    Ok(())
  }

  pub fn bytes(&self) -> &[u8] {
    self.data.bytes()
  }

  pub fn guid(&self) -> &Guid {
    &self.guid
  }

  /// A silo with no nodes at all still has a valid header.
  pub fn is_empty(&self) -> bool {
    self.strtab == HEADER_SIZE
  }

  pub fn is_valid(&self) -> bool {
    self.valid.load(Ordering::SeqCst)
  }

  /// Flips the silo invalid and notifies the observers. Reads stay safe, but
  /// callers are expected to rebuild. Called by whatever monitors the
  /// backing file, the library itself does no file watching.
  pub fn invalidate(&self) {
    if self.valid.swap(false, Ordering::SeqCst) {
      self.notify_validity(false);
    }
  }

  pub(crate) fn uninvalidate(&self) {
    if !self.valid.swap(true, Ordering::SeqCst) {
      self.notify_validity(true);
    }
  }

  fn notify_validity(&self, valid: bool) {
    let observers = self.observers.lock();
    for observer in observers.iter() {
      observer(valid);
    }
  }

  /// Registers a callback run whenever the validity flag changes. The
  /// callback runs on the thread that triggered the change.
  pub fn add_validity_observer(&self, observer: Box<dyn Fn(bool) + Send>) {
    self.observers.lock().push(observer);
  }

  /// Whether repeated queries return facades sharing one user-data slot per
  /// node. Off by default; set it before sharing the silo between threads.
  pub fn set_enable_node_cache(&self, enable: bool) {
    self.enable_node_cache.store(enable, Ordering::SeqCst);
    if !enable {
      self.nodes.lock().clear();
    }
  }

  pub fn enable_node_cache(&self) -> bool {
    self.enable_node_cache.load(Ordering::SeqCst)
  }

  /// Installs the stemmer hook used by the `stem()` query function. Without
  /// one, stemming degrades to ASCII lowercasing.
  pub fn set_stemmer(&self, stemmer: Box<dyn Fn(&str) -> String + Send>) {
    *self.stemmer.lock() = Some(stemmer);
  }

  pub(crate) fn stem(&self, value: &str) -> String {
    let stemmer = self.stemmer.lock();
    match stemmer.as_ref() {
      Some(stem) => stem(value),
      None => value.to_ascii_lowercase(),
    }
  }

  pub fn set_profile(&self, enabled: bool) {
    self.profile.store(enabled, Ordering::SeqCst);
  }

  pub fn profile_string(&self) -> String {
    self.profile_str.lock().clone()
  }

  pub(crate) fn add_profile(&self, start: Instant, what: &str) {
    if !self.profile.load(Ordering::SeqCst) {
      return;
    }
    let line = format!("{:.2}ms    {}", start.elapsed().as_secs_f64() * 1000.0, what);
    debug!("{}", line);
    let mut profile_str = self.profile_str.lock();
    profile_str.push_str(&line);
    profile_str.push('\n');
  }

  pub(crate) fn machine(&self) -> &Machine {
    &self.machine
  }

  /// Resolves a string-table offset to the NUL-terminated string there.
  pub fn strtab_str(&self, offset: u32) -> Result<&str> {
    let bytes = self.bytes();
    let region = &bytes[self.strtab as usize..];
    if offset as usize >= region.len() {
      return Err(Error::InvalidData(format!(
        "strtab offset {} is outside the data range",
        offset
      )));
    }
    let nul = memchr::memchr(0, &region[offset as usize..]).ok_or_else(|| {
      Error::InvalidData(format!("string at {} is not NUL terminated", offset))
    })?;
    std::str::from_utf8(&region[offset as usize..offset as usize + nul]).map_err(Error::Utf8)
  }

  pub(crate) fn strtab_str_opt(&self, offset: u32) -> Result<Option<&str>> {
    if offset == UNSET {
      return Ok(None);
    }
    self.strtab_str(offset).map(Some)
  }

  /// Offset of an element name in the prebuilt index, `UNSET` if unknown.
  pub fn strtab_tag_idx(&self, element: &str) -> u32 {
    self.strtab_tags.get(element).copied().unwrap_or(UNSET)
  }

  /// Scans the whole string table for an exact string, `UNSET` if absent.
  pub fn strtab_find_by_name(&self, name: &str) -> u32 {
    let region = &self.bytes()[self.strtab as usize..];
    let mut off = 0usize;
    while off < region.len() {
      let nul = match memchr::memchr(0, &region[off..]) {
        Some(nul) => nul,
        None => break,
      };
      if &region[off..off + nul] == name.as_bytes() {
        return off as u32;
      }
      off += nul + 1;
    }
    UNSET
  }

  /// Byte offset of the root element record, or `None` for an empty silo.
  pub(crate) fn root_offset(&self) -> Option<u32> {
    if self.is_empty() {
      return None;
    }
    Some(HEADER_SIZE)
  }

  pub(crate) fn record(&self, offset: u32) -> Result<SiloNodeRecord<'_>> {
    if offset < HEADER_SIZE || offset >= self.strtab {
      return Err(Error::InvalidData(format!(
        "node offset @{} is outside the node area",
        offset
      )));
    }
    SiloNodeRecord::parse(self.bytes(), offset)
  }

  pub(crate) fn parent_offset(&self, offset: u32) -> Result<Option<u32>> {
    let record = self.record(offset)?;
    match record.parent() {
      0 => Ok(None),
      parent => Ok(Some(parent)),
    }
  }

  pub(crate) fn next_offset(&self, offset: u32) -> Result<Option<u32>> {
    let record = self.record(offset)?;
    match record.next() {
      0 => Ok(None),
      next => Ok(Some(next)),
    }
  }

  /// First child of an element: the record straight after it, unless that is
  /// the sentinel closing the children group.
  pub(crate) fn child_offset(&self, offset: u32) -> Result<Option<u32>> {
    let record = self.record(offset)?;
    let child = offset + record.size();
    if child >= self.strtab {
      return Err(Error::InvalidData(format!(
        "no sentinel after node @{}",
        offset
      )));
    }
    let child_record = self.record(child)?;
    if child_record.is_element() {
      Ok(Some(child))
    } else {
      Ok(None)
    }
  }

  pub(crate) fn node_element(&self, offset: u32) -> Result<&str> {
    let record = self.record(offset)?;
    self.strtab_str(record.element_name())
  }

  pub(crate) fn node_text(&self, offset: u32) -> Result<Option<&str>> {
    let record = self.record(offset)?;
    self.strtab_str_opt(record.text())
  }

  pub(crate) fn node_tail(&self, offset: u32) -> Result<Option<&str>> {
    let record = self.record(offset)?;
    self.strtab_str_opt(record.tail())
  }

  pub(crate) fn node_attr(&self, offset: u32, name: &str) -> Result<Option<&str>> {
    let record = self.record(offset)?;
    for i in 0..record.attr_count() {
      let (name_off, value_off) = record.attr(i);
      if self.strtab_str(name_off)? == name {
        return self.strtab_str_opt(value_off);
      }
    }
    Ok(None)
  }

  /// Counts element nodes by walking the node area.
  pub fn node_count(&self) -> Result<usize> {
    let mut count = 0usize;
    let mut off = HEADER_SIZE;
    while off < self.strtab {
      let record = SiloNodeRecord::parse(self.bytes(), off)?;
      if record.is_element() {
        count += 1;
      }
      off += record.size();
    }
    Ok(count)
  }

  /// The root node facade, or `None` for an empty silo.
  pub fn root(self: &Arc<Self>) -> Option<Node> {
    self
      .root_offset()
      .map(|off| self.create_node(off, false))
  }

  pub(crate) fn create_node(self: &Arc<Self>, offset: u32, force_cache: bool) -> Node {
    if !self.enable_node_cache() && !force_cache {
      return Node::new(self.clone(), offset, Arc::new(NodeData::default()));
    }
    let mut nodes = self.nodes.lock();
    let data = nodes
      .entry(offset)
      .or_insert_with(|| Arc::new(NodeData::default()))
      .clone();
    Node::new(self.clone(), offset, data)
  }

  /// Creates a query, or returns it from the per-silo cache. Thread-safe:
  /// readers share the lock, the first writer compiles and inserts.
  pub fn lookup_query(&self, xpath: &str) -> Result<Arc<Query>> {
    {
      let cache = self.query_cache.read();
      if let Some(query) = cache.get(xpath) {
        return Ok(query.clone());
      }
    }
    let mut cache = self.query_cache.write();
    // check again with the exclusive lock held
    if let Some(query) = cache.get(xpath) {
      return Ok(query.clone());
    }
    let query = Arc::new(Query::new(self, xpath)?);
    debug!(
      "caching query '{}'; query cache now has {} entries",
      xpath,
      cache.len() + 1
    );
    cache.insert(xpath.to_string(), query.clone());
    Ok(query)
  }

  /// Searches the silo with an XPath query, returning up to `limit` results
  /// in document order, where 0 means "all". An empty result set is
  /// reported as not-found.
  pub fn query(self: &Arc<Self>, xpath: &str, limit: usize) -> Result<Vec<Node>> {
    let start = Instant::now();
    let xpath = xpath.strip_prefix('/').unwrap_or(xpath);
    let query = self.lookup_query(xpath)?;
    let mut context = QueryContext::new();
    context.set_limit(limit);
    let results = silo_query::query_full(self, &query, &context);
    self.add_profile(start, xpath);
    results
  }

  /// Searches the silo, returning the first result only.
  pub fn query_first(self: &Arc<Self>, xpath: &str) -> Result<Node> {
    let mut results = self.query(xpath, 1)?;
    Ok(results.remove(0))
  }

  /// Runs a prepared query with explicit limit, flags and value bindings.
  pub fn query_full(
    self: &Arc<Self>,
    query: &Query,
    context: &QueryContext,
  ) -> Result<Vec<Node>> {
    silo_query::query_full(self, query, context)
  }

  /// Exports the whole silo back to XML.
  pub fn export(&self, flags: ExportFlags) -> Result<String> {
    crate::silo_export::export_with_root(self, None, flags)
  }

  /// Converts the silo to an internal string representation; only really
  /// useful for debugging the format itself.
  pub fn dump(&self) -> Result<String> {
    let mut out = String::new();
    let bytes = self.bytes();
    out.push_str(&format!(
      "magic:        {:08x}\n",
      LittleEndian::read_u32(&bytes[0..4])
    ));
    out.push_str(&format!("guid:         {}\n", self.guid));
    out.push_str(&format!("strtab:       @{}\n", self.strtab));
    out.push_str(&format!("strtab_ntags: {}\n", self.strtab_tags.len()));
    let mut off = HEADER_SIZE;
    while off < self.strtab {
      let n = SiloNodeRecord::parse(bytes, off)?;
      if n.is_element() {
        out.push_str(&format!("NODE @{}\n", off));
        out.push_str(&format!("size:         {}\n", n.size()));
        out.push_str(&format!("flags:        {:x}\n", n.flags().bits()));
        out.push_str(&format!(
          "element_name: {} [{:03}]\n",
          self.strtab_str(n.element_name())?,
          n.element_name()
        ));
        out.push_str(&format!("next:         {}\n", n.next()));
        out.push_str(&format!("parent:       {}\n", n.parent()));
        if let Some(text) = self.strtab_str_opt(n.text())? {
          out.push_str(&format!("text:         {} [{:03}]\n", text, n.text()));
        }
        if let Some(tail) = self.strtab_str_opt(n.tail())? {
          out.push_str(&format!("tail:         {} [{:03}]\n", tail, n.tail()));
        }
        for i in 0..n.attr_count() {
          let (name, value) = n.attr(i);
          out.push_str(&format!(
            "attr_name:    {} [{:03}]\n",
            self.strtab_str(name)?,
            name
          ));
          out.push_str(&format!(
            "attr_value:   {} [{:03}]\n",
            self.strtab_str(value)?,
            value
          ));
        }
        for i in 0..n.token_count() {
          let token = n.token(i);
          if token != UNSET {
            out.push_str(&format!(
              "token:        {} [{:03}]\n",
              self.strtab_str(token)?,
              token
            ));
          }
        }
      } else {
        out.push_str(&format!("SENT @{}\n", off));
      }
      off += n.size();
    }
    out.push_str(&format!("STRTAB @{}\n", self.strtab));
    let mut soff = 0u32;
    let region_len = (bytes.len() - self.strtab as usize) as u32;
    while soff < region_len {
      let s = self.strtab_str(soff)?;
      out.push_str(&format!("[{:03}]: {}\n", soff, s));
      soff += s.len() as u32 + 1;
    }
    Ok(out)
  }

  /// The machine a silo owns: the plain built-ins plus the silo-aware
  /// functions, fixups and text handlers.
  fn build_machine() -> Machine {
    let mut machine = Machine::new();
    machine.add_method("attr", 1, func_attr);
    machine.add_method("stem", 1, func_stem);
    machine.add_method("text", 0, func_text);
    machine.add_method("tail", 0, func_tail);
    machine.add_method("first", 0, func_first);
    machine.add_method("last", 0, func_last);
    machine.add_method("position", 0, func_position);
    machine.add_method("search", 2, func_search);
    machine.add_operator("~=", "search");
    machine.add_opcode_fixup("INTE", fixup_position);
    machine.add_opcode_fixup("BIND", fixup_position);
    machine.add_opcode_fixup("TEXT,FUNC:attr", fixup_attr_exists);
    machine.add_opcode_fixup("FUNC:text,TEXT,FUNC:search", fixup_search_tokenize);
    machine.add_text_handler(text_handler_attr);
    machine
  }
}

impl std::fmt::Debug for Silo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Silo")
      .field("guid", &self.guid)
      .field("size", &self.bytes().len())
      .field("valid", &self.is_valid())
      .finish()
  }
}

fn pop_text<'a>(stack: &mut Stack<'a>) -> Result<TextValue<'a>> {
  match stack.pop()? {
    Value::Text(text) => Ok(text),
    value => Err(Error::NotSupported(format!(
      "{} type not supported",
      value.kind_str()
    ))),
  }
}

/// `attr('name')`: pushes the attribute value of the current node, or the
/// missing-text value so that the exists fixup can test it.
fn func_attr<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let silo = ctx.silo()?;
  let query_data = ctx.query_data()?;
  let name = pop_text(stack)?;
  let record = silo.record(query_data.offset)?;
  for i in 0..record.attr_count() {
    let (name_off, value_off) = record.attr(i);
    let matched = if name.index != UNSET {
      name_off == name.index
    } else {
      silo.strtab_str(name_off)? == name.as_str().unwrap_or("")
    };
    if matched {
      let value = TextValue::new(silo.strtab_str(value_off)?).with_index(value_off);
      return stack.push(Value::Text(value));
    }
  }
  stack.push(Value::Text(TextValue::null()))
}

/// `text()`: pushes the current node's text, carrying the node's search
/// tokens for the fast prefix-match path.
fn func_text<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let silo = ctx.silo()?;
  let query_data = ctx.query_data()?;
  let record = silo.record(query_data.offset)?;
  let mut value = match silo.strtab_str_opt(record.text())? {
    Some(s) => TextValue::new(s).with_index(record.text()),
    None => TextValue::null(),
  };
  // use the fast token path even if there are no valid tokens
  if record.is_tokenized() {
    value.tokenized = true;
    for i in 0..record.token_count() {
      let token = record.token(i);
      if token != UNSET {
        value.tokens.push(Cow::Borrowed(silo.strtab_str(token)?));
      }
    }
  }
  stack.push(Value::Text(value))
}

fn func_tail<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let silo = ctx.silo()?;
  let query_data = ctx.query_data()?;
  let record = silo.record(query_data.offset)?;
  let value = match silo.strtab_str_opt(record.tail())? {
    Some(s) => TextValue::new(s).with_index(record.tail()),
    None => TextValue::null(),
  };
  stack.push(Value::Text(value))
}

fn func_first<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let query_data = ctx.query_data()?;
  stack.push(Value::Boolean(query_data.position == 1))
}

fn func_last<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let silo = ctx.silo()?;
  let query_data = ctx.query_data()?;
  let record = silo.record(query_data.offset)?;
  stack.push(Value::Boolean(record.next() == 0))
}

fn func_position<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let query_data = ctx.query_data()?;
  stack.push(Value::Integer(query_data.position))
}

/// `search(haystack,needle)`: tokenized prefix match when both sides carry
/// tokens, else a start-of-word scan, else case-insensitive contains for
/// non-ASCII input.
fn func_search<'a>(_: &Machine, stack: &mut Stack<'a>, _: &EvalContext<'a>) -> Result<()> {
  let (op1, op2) = stack.pop_two()?;
  let (needle, haystack) = match (op1, op2) {
    (Value::Text(t1), Value::Text(t2)) => (t1, t2),
    (op1, op2) => {
      return Err(Error::NotSupported(format!(
        "{}:{} types not supported",
        op1.kind_str(),
        op2.kind_str()
      )))
    }
  };
  if needle.tokenized && haystack.tokenized {
    return stack.push(Value::Boolean(strings::searchv(
      &haystack.tokens,
      &needle.tokens,
    )));
  }
  let result = match (haystack.as_str(), needle.as_str()) {
    (Some(text), Some(search)) if !text.is_empty() && !search.is_empty() => {
      if !text.is_ascii() || !search.is_ascii() {
        strings::contains_casefold(text, search)
      } else {
        strings::search(text, search)
      }
    }
    _ => false,
  };
  stack.push(Value::Boolean(result))
}

/// `stem('text')`: the installed stemmer hook, or ASCII lowercasing.
fn func_stem<'a>(_: &Machine, stack: &mut Stack<'a>, ctx: &EvalContext<'a>) -> Result<()> {
  let silo = ctx.silo()?;
  let text = pop_text(stack)?;
  let s = text
    .as_str()
    .ok_or_else(|| Error::NotSupported("cannot stem missing text".to_string()))?;
  stack.push(Value::text(silo.stem(s)))
}

/// Converts `[2]` into `2,position(),eq()`.
fn fixup_position(machine: &Machine, opcodes: &mut Vec<Opcode>) -> Result<()> {
  opcodes.push(machine.opcode_func("position")?);
  opcodes.push(machine.opcode_func("eq")?);
  Ok(())
}

/// Converts `'type',attr()` into `'type',attr(),(null),ne()`.
fn fixup_attr_exists(machine: &Machine, opcodes: &mut Vec<Opcode>) -> Result<()> {
  opcodes.push(Opcode::null_text());
  opcodes.push(machine.opcode_func("ne")?);
  Ok(())
}

/// Tokenizes the needle of `text()~='…'` so both sides can take the token
/// fast path.
fn fixup_search_tokenize(_: &Machine, opcodes: &mut Vec<Opcode>) -> Result<()> {
  if let Some(op) = opcodes.get_mut(1) {
    op.tokenize();
  }
  Ok(())
}

/// `@foo` -> `'foo',attr()`
fn text_handler_attr(machine: &Machine, opcodes: &mut Vec<Opcode>, text: &str) -> Result<bool> {
  if let Some(name) = text.strip_prefix('@') {
    opcodes.push(Opcode::text(name));
    opcodes.push(machine.opcode_func("attr")?);
    return Ok(true);
  }
  // not us
  Ok(false)
}

/// Runs one predicate stack against a node, used by the query executor.
pub(crate) fn run_predicate(
  silo: &Silo,
  opcodes: &[Opcode],
  query_data: QueryData,
  context: &QueryContext,
) -> Result<bool> {
  let ctx = EvalContext {
    silo: Some(silo),
    query_data: Some(query_data),
    bindings: Some(context.bindings()),
  };
  silo.machine().run(opcodes, &ctx)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::silo_node::SiloNodeFlags;

  fn silo(xml: &str) -> Arc<Silo> {
    Silo::from_xml(xml).unwrap()
  }

  /// Walks every record checking the format invariants: parent/next point
  /// at element records, parent chains terminate at the root, and every
  /// string offset resolves to a NUL-terminated string inside the table.
  #[test]
  fn test_format_invariants() {
    let s = silo(
      "<components origin=\"lvfs\"><component type=\"desktop\"><id>gimp.desktop</id>\
       </component><component type=\"console\"><id>vim</id></component></components>",
    );
    let mut off = HEADER_SIZE;
    let mut elements = 0;
    while off < s.strtab {
      let n = SiloNodeRecord::parse(s.bytes(), off).unwrap();
      if n.is_element() {
        elements += 1;
        assert!(s.strtab_str(n.element_name()).is_ok());
        if n.parent() != 0 {
          assert!(n.parent() >= HEADER_SIZE);
          assert!(s.record(n.parent()).unwrap().is_element());
        }
        if n.next() != 0 {
          assert!(s.record(n.next()).unwrap().is_element());
        }
        if n.text() != UNSET {
          assert!(s.strtab_str(n.text()).is_ok());
        }
        if n.tail() != UNSET {
          assert!(s.strtab_str(n.tail()).is_ok());
        }
        for i in 0..n.attr_count() {
          let (name, value) = n.attr(i);
          assert!(s.strtab_str(name).is_ok());
          assert!(s.strtab_str(value).is_ok());
        }
        // following parent repeatedly reaches the root in finite steps
        let mut cursor = off;
        let mut hops = 0;
        while let Some(parent) = s.parent_offset(cursor).unwrap() {
          cursor = parent;
          hops += 1;
          assert!(hops < 64, "parent chain does not terminate");
        }
        assert_eq!(cursor, HEADER_SIZE);
      }
      off += n.size();
    }
    assert_eq!(elements, 5);
    assert_eq!(s.node_count().unwrap(), 5);
  }

  #[test]
  fn test_strtab_lookup() {
    let s = silo("<a key=\"value\"><b>text</b></a>");
    let off = s.strtab_find_by_name("value");
    assert_ne!(off, UNSET);
    assert_eq!(s.strtab_str(off).unwrap(), "value");
    assert_eq!(s.strtab_find_by_name("missing"), UNSET);
    // element names live at the head of the table
    assert_eq!(s.strtab_tag_idx("a"), s.strtab_find_by_name("a"));
    assert!(s.strtab_str(0xdead_beef).is_err());
  }

  #[test]
  fn test_sentinel_flag_reserved() {
    let s = silo("<a><b/></a>");
    // no element record may have IS_ELEMENT clear, only sentinels do
    let mut off = HEADER_SIZE;
    let mut sentinels = 0;
    while off < s.strtab {
      let n = SiloNodeRecord::parse(s.bytes(), off).unwrap();
      if !n.is_element() {
        assert!(!n.flags().contains(SiloNodeFlags::IS_ELEMENT));
        sentinels += 1;
      }
      off += n.size();
    }
    assert_eq!(sentinels, 2);
  }

  #[test]
  fn test_dump_structure() {
    let s = silo("<a key=\"v\"><b>t</b></a>");
    let dump = s.dump().unwrap();
    assert!(dump.contains("magic:"));
    assert!(dump.contains("strtab_ntags: 2"));
    assert!(dump.contains("element_name: a"));
    assert!(dump.contains("attr_name:    key"));
    assert!(dump.contains("text:         t"));
  }
}

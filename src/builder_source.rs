use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use flate2::read::GzDecoder;
use log::debug;
use sha1::{Digest, Sha1};

use crate::{
  builder_fixup::BuilderFixup,
  builder_node::BuilderNode,
  error::{Error, Result},
};

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct SourceFlags: u32 {
    /// Do not repair whitespace in text runs from this source.
    const LITERAL_TEXT = 1 << 0;
    /// The caller should monitor the input file for changes.
    const WATCH_FILE = 1 << 1;
    /// The caller should monitor the input file's directory for changes.
    const WATCH_DIRECTORY = 1 << 2;
  }
}

/// Transforms an input stream into plain XML before parsing, e.g. a
/// desktop-entry converter. Registered per content type.
pub type SourceAdapterFunc = Box<dyn Fn(Box<dyn Read>) -> Result<Box<dyn Read>>>;

struct SourceAdapter {
  content_type: String,
  func: SourceAdapterFunc,
}

enum SourceKind {
  Memory(Vec<u8>),
  File(PathBuf),
}

/// One XML input for the builder: a stream with an attached GUID, optional
/// prefix element and info subtree, and per-source fixups.
pub struct BuilderSource {
  kind: SourceKind,
  guid: String,
  prefix: Option<String>,
  info: Option<BuilderNode>,
  fixups: Vec<BuilderFixup>,
  adapters: Vec<SourceAdapter>,
  flags: SourceFlags,
}

impl BuilderSource {
  /// A source from an XML string; the GUID is the SHA-1 of the bytes.
  pub fn from_xml(xml: &str, flags: SourceFlags) -> Result<Self> {
    let mut hasher = Sha1::new();
    hasher.update(xml.as_bytes());
    let guid = hasher
      .finalize()
      .iter()
      .map(|b| format!("{:02x}", b))
      .collect::<String>();
    Ok(Self {
      kind: SourceKind::Memory(xml.as_bytes().to_vec()),
      guid,
      prefix: None,
      info: None,
      fixups: Vec::new(),
      adapters: Vec::new(),
      flags,
    })
  }

  /// A source from an optionally compressed file; the GUID is path:mtime so
  /// that touching the file invalidates any cached silo.
  pub fn from_file<P: AsRef<Path>>(path: P, flags: SourceFlags) -> Result<Self> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path).map_err(Error::Io)?;
    let mtime = metadata
      .modified()
      .map_err(Error::Io)?
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(0);
    let guid = format!("{}:{}", path.display(), mtime);
    Ok(Self {
      kind: SourceKind::File(path.to_path_buf()),
      guid,
      prefix: None,
      info: None,
      fixups: Vec::new(),
      adapters: Vec::new(),
      flags,
    })
  }

  /// Makes the nodes from this source reside under a common parent element,
  /// e.g. `installed`.
  pub fn set_prefix(&mut self, prefix: &str) {
    self.prefix = Some(prefix.to_string());
  }

  pub fn prefix(&self) -> Option<&str> {
    self.prefix.as_deref()
  }

  /// Sets a metadata node appended under each root-level node this source
  /// imports, so that results can be traced back to their origin.
  pub fn set_info(&mut self, info: BuilderNode) {
    self.info = Some(info);
  }

  pub(crate) fn info(&self) -> Option<&BuilderNode> {
    self.info.as_ref()
  }

  /// Adds a fixup run on this source's subtree before the global ones.
  pub fn add_fixup(&mut self, fixup: BuilderFixup) {
    self.fixups.push(fixup);
  }

  /// Registers a stream adapter for a content type the builder cannot parse
  /// natively, e.g. `application/x-desktop`.
  pub fn add_adapter(&mut self, content_type: &str, func: SourceAdapterFunc) {
    self.adapters.push(SourceAdapter {
      content_type: content_type.to_string(),
      func,
    });
  }

  pub fn flags(&self) -> SourceFlags {
    self.flags
  }

  /// The file behind this source, if any; what the caller would monitor for
  /// `WATCH_FILE`.
  pub fn path(&self) -> Option<&Path> {
    match &self.kind {
      SourceKind::File(path) => Some(path),
      SourceKind::Memory(_) => None,
    }
  }

  /// The cache-key contribution of this source: base GUID, prefix and fixup
  /// IDs.
  pub(crate) fn guid(&self) -> String {
    let mut guid = self.guid.clone();
    if let Some(prefix) = &self.prefix {
      guid.push_str(&format!(":prefix={}", prefix));
    }
    for fixup in &self.fixups {
      guid.push('&');
      guid.push_str(&fixup.guid());
    }
    guid
  }

  pub(crate) fn run_fixups(&self, root: &BuilderNode) -> Result<()> {
    for fixup in &self.fixups {
      fixup.run(root)?;
    }
    Ok(())
  }

  /// Opens the raw input, sniffs the content type and returns a stream of
  /// plain XML, decompressing or adapting as needed.
  pub(crate) fn open_stream(&self) -> Result<Box<dyn Read>> {
    let (head, rest): (Vec<u8>, Box<dyn Read>) = match &self.kind {
      SourceKind::Memory(buf) => {
        let head = buf[..buf.len().min(16)].to_vec();
        let rest = Cursor::new(buf.clone());
        (head, Box::new(rest))
      }
      SourceKind::File(path) => {
        let mut file = File::open(path).map_err(Error::Io)?;
        let mut head = [0u8; 16];
        let n = read_fully(&mut file, &mut head).map_err(Error::Io)?;
        let head = head[..n].to_vec();
        (head.clone(), Box::new(Cursor::new(head).chain(file)))
      }
    };

    let filename = self.path().and_then(|p| p.file_name()).map(|f| f.to_string_lossy().into_owned());
    let content_type = content_type_guess(filename.as_deref(), &head);
    debug!("detected content type {} for {}", content_type, self.guid);
    match content_type.as_str() {
      "application/xml" => Ok(rest),
      "application/gzip" => Ok(Box::new(GzDecoder::new(rest))),
      other => {
        for adapter in &self.adapters {
          if adapter.content_type == other {
            return (adapter.func)(rest);
          }
        }
        Err(Error::NotSupported(format!(
          "cannot process content of type {}",
          other
        )))
      }
    }
  }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
  let mut total = 0;
  while total < buf.len() {
    match reader.read(&mut buf[total..])? {
      0 => break,
      n => total += n,
    }
  }
  Ok(total)
}

/// Guesses the content type from magic bytes first, then from the filename
/// extension. Unknown data reports as `application/octet-stream`.
pub(crate) fn content_type_guess(filename: Option<&str>, buf: &[u8]) -> String {
  // magic bytes
  if buf.starts_with(b"\x1f\x8b") {
    return "application/gzip".to_string();
  }
  if buf.starts_with(b"\xfd\x37\x7a\x58\x5a\x00") {
    return "application/x-xz".to_string();
  }
  if buf.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
    return "application/zstd".to_string();
  }
  if buf.starts_with(b"<?xml") {
    return "application/xml".to_string();
  }
  if buf.starts_with(b"[Desktop Entry]") {
    return "application/x-desktop".to_string();
  }
  // an XML fragment without a declaration; empty input parses as empty XML
  match buf.iter().find(|b| !b.is_ascii_whitespace()) {
    None => return "application/xml".to_string(),
    Some(b'<') => return "application/xml".to_string(),
    Some(_) => {}
  }

  // file extensions
  if let Some(filename) = filename {
    if let Some(ext) = filename.rsplit('.').next() {
      match ext {
        "gz" => return "application/gzip".to_string(),
        "xz" => return "application/x-xz".to_string(),
        "zst" => return "application/zstd".to_string(),
        "txt" | "xml" => return "application/xml".to_string(),
        "desktop" => return "application/x-desktop".to_string(),
        _ => {}
      }
    }
  }
  "application/octet-stream".to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_content_type_magic_wins() {
    // gzip magic beats a misleading extension
    assert_eq!(
      content_type_guess(Some("data.xml"), b"\x1f\x8b\x08"),
      "application/gzip"
    );
    assert_eq!(
      content_type_guess(None, b"<?xml version=\"1.0\"?>"),
      "application/xml"
    );
    assert_eq!(
      content_type_guess(None, b"  <components>"),
      "application/xml"
    );
    assert_eq!(
      content_type_guess(Some("app.desktop"), b"[Desktop Entry]"),
      "application/x-desktop"
    );
    assert_eq!(
      content_type_guess(Some("notes"), b"\x00\x01binary"),
      "application/octet-stream"
    );
  }

  #[test]
  fn test_from_xml_guid_stable() {
    let s1 = BuilderSource::from_xml("<a/>", SourceFlags::empty()).unwrap();
    let s2 = BuilderSource::from_xml("<a/>", SourceFlags::empty()).unwrap();
    let s3 = BuilderSource::from_xml("<b/>", SourceFlags::empty()).unwrap();
    assert_eq!(s1.guid(), s2.guid());
    assert_ne!(s1.guid(), s3.guid());
  }

  #[test]
  fn test_guid_includes_prefix_and_fixups() {
    let mut source = BuilderSource::from_xml("<a/>", SourceFlags::empty()).unwrap();
    let plain = source.guid();
    source.set_prefix("installed");
    let with_prefix = source.guid();
    assert_ne!(plain, with_prefix);
    source.add_fixup(BuilderFixup::new("noop", Box::new(|_| Ok(()))));
    assert_ne!(with_prefix, source.guid());
  }

  #[test]
  fn test_open_stream_gzip() {
    let mut encoder =
      flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(b"<a><b>text</b></a>").unwrap();
    let gz = encoder.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.xml.gz");
    std::fs::write(&path, &gz).unwrap();

    let source = BuilderSource::from_file(&path, SourceFlags::empty()).unwrap();
    let mut stream = source.open_stream().unwrap();
    let mut out = String::new();
    stream.read_to_string(&mut out).unwrap();
    assert_eq!(out, "<a><b>text</b></a>");
  }

  #[test]
  fn test_open_stream_unknown_type() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, b"\x00\x01\x02").unwrap();
    let source = BuilderSource::from_file(&path, SourceFlags::empty()).unwrap();
    assert!(matches!(
      source.open_stream(),
      Err(Error::NotSupported(_))
    ));
  }

  #[test]
  fn test_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.desktop");
    std::fs::write(&path, b"[Desktop Entry]\nName=Test\n").unwrap();
    let mut source = BuilderSource::from_file(&path, SourceFlags::empty()).unwrap();
    source.add_adapter(
      "application/x-desktop",
      Box::new(|_stream| {
        Ok(Box::new(Cursor::new(b"<application/>".to_vec())) as Box<dyn Read>)
      }),
    );
    let mut out = String::new();
    source.open_stream().unwrap().read_to_string(&mut out).unwrap();
    assert_eq!(out, "<application/>");
  }
}

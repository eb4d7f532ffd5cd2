//! Small string helpers shared by the query machine and the exporters.

/// Returns true if the string is empty or contains only ASCII whitespace.
pub(crate) fn is_whitespace(s: &str) -> bool {
  s.bytes().all(|b| b.is_ascii_whitespace())
}

/// Substring match, byte exact.
pub(crate) fn contains(text: &str, search: &str) -> bool {
  text.contains(search)
}

/// Fuzzy search match: the needle has to start at the beginning of a word in
/// the haystack, compared ASCII-case-insensitively. Both strings are expected
/// to be ASCII, see [`contains_casefold`] for the non-ASCII fallback.
pub fn search(text: &str, search: &str) -> bool {
  let text = text.as_bytes();
  let search = search.as_bytes();
  if text.is_empty() || search.is_empty() {
    return false;
  }
  if search.len() > text.len() {
    return false;
  }
  let mut is_sow = true;
  for i in 0..=(text.len() - search.len()) {
    if !text[i].is_ascii_alphanumeric() {
      is_sow = true;
      continue;
    }
    if !is_sow {
      continue;
    }
    if text[i..i + search.len()].eq_ignore_ascii_case(search) {
      return true;
    }
    // no longer the start of the word
    is_sow = false;
  }
  false
}

/// Tokenized search: true iff any haystack token starts with any needle token.
pub fn searchv(text: &[impl AsRef<str>], search: &[impl AsRef<str>]) -> bool {
  if text.is_empty() || search.is_empty() {
    return false;
  }
  if text[0].as_ref().is_empty() || search[0].as_ref().is_empty() {
    return false;
  }
  for t in text {
    for s in search {
      if t.as_ref().starts_with(s.as_ref()) {
        return true;
      }
    }
  }
  false
}

/// Case-insensitive substring match used when either side is not ASCII.
pub(crate) fn contains_casefold(text: &str, search: &str) -> bool {
  text.to_lowercase().contains(&search.to_lowercase())
}

/// Tokens shorter than 3 bytes just produce noise in search results.
pub fn token_valid(text: &str) -> bool {
  text.len() >= 3
}

/// Splits text into lowercased search tokens, dropping anything too short to
/// be useful.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
  text
    .split(|c: char| !c.is_ascii_alphanumeric())
    .filter(|t| token_valid(t))
    .map(|t| t.to_ascii_lowercase())
    .collect()
}

/// Escapes XPath control sequences such as newlines, tabs, and forward
/// slashes, e.g. `app/org.gnome.ghex/x86_64/stable`.
///
/// Returns a new string that is safe to use for queries.
pub fn xpath_escape(s: &str) -> String {
  s.replace('/', "\\/").replace('\t', "\\t").replace('\n', "\\n")
}

/// Appends an XPath fragment, adding the union operator (`|`) if required.
pub fn xpath_append_union(xpath: &mut String, fragment: &str) {
  if !xpath.is_empty() {
    xpath.push('|');
  }
  xpath.push_str(fragment);
}

pub(crate) fn xml_escape(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' => out.push_str("&quot;"),
      _ => out.push(c),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_search_start_of_word() {
    assert!(search("hello world", "wor"));
    assert!(search("hello world", "Hello"));
    assert!(!search("hello world", "orld"));
    assert!(!search("", "x"));
    assert!(!search("x", ""));
    assert!(!search("abc", "abcd"));
    assert!(search("gimp.desktop", "desk"));
  }

  #[test]
  fn test_searchv_prefix() {
    let text = ["image", "editor"];
    assert!(searchv(&text, &["edi"]));
    assert!(!searchv(&text, &["tor"]));
    let empty: [&str; 0] = [];
    assert!(!searchv(&text, &empty));
    assert!(!searchv(&empty, &["edi"]));
  }

  #[test]
  fn test_tokenize() {
    assert_eq!(tokenize("Image Editor!"), vec!["image", "editor"]);
    // too-short fragments are dropped
    assert_eq!(tokenize("a bb ccc"), vec!["ccc"]);
  }

  #[test]
  fn test_xpath_escape() {
    assert_eq!(xpath_escape("n/a"), "n\\/a");
    let mut xpath = String::new();
    xpath_append_union(&mut xpath, "a");
    xpath_append_union(&mut xpath, "b");
    assert_eq!(xpath, "a|b");
  }

  #[test]
  fn test_xml_escape() {
    assert_eq!(xml_escape("a<b> & \"c\""), "a&lt;b&gt; &amp; &quot;c&quot;");
  }

  #[test]
  fn test_is_whitespace() {
    assert!(is_whitespace(""));
    assert!(is_whitespace(" \n\t "));
    assert!(!is_whitespace(" x "));
  }
}

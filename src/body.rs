use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;
use std::sync::OnceLock;

/// Name of the single-byte storage charset used when nothing better is known.
pub const STORAGE_CHARSET: &str = "ISO-8859-1";
/// Upper bound for buffers preallocated from an untrusted length.
pub const MAX_PREALLOCATION: usize = 256 * 1024;

#[derive(Clone, Debug)]
struct Decoded {
  text: String,
  charset: String,
}

/// A message body.
///
/// The octets are stored exactly as received. Text is produced on demand and
/// cached until the next mutation. The charset is picked from an explicit
/// override, then an HTML `<meta charset>` declaration, then a strict UTF-8
/// probe, and finally the storage charset which maps every byte to one char.
#[derive(Clone, Default)]
pub struct Body {
  data: Vec<u8>,
  charset: Option<String>,
  content_encoding: Option<String>,
  decoded: OnceLock<Decoded>,
}

impl Body {
  /// An empty body with room for `capacity` bytes, capped at
  /// [`MAX_PREALLOCATION`].
  pub fn with_capacity(capacity: usize) -> Body {
    Body {
      data: Vec::with_capacity(capacity.min(MAX_PREALLOCATION)),
      ..Default::default()
    }
  }
  /// Raw octets.
  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }
  /// Take the raw octets.
  pub fn into_bytes(self) -> Vec<u8> {
    self.data
  }
  /// Replace the octets.
  pub fn set_bytes<B: Into<Vec<u8>>>(&mut self, data: B) {
    self.data = data.into();
    self.invalidate();
  }
  /// Replace the content with `text` encoded in the current charset.
  pub fn set_text(&mut self, text: &str) {
    self.data = self.encode(text);
    self.invalidate();
  }
  /// Append octets.
  pub fn append_bytes(&mut self, data: &[u8]) {
    self.data.extend_from_slice(data);
    self.invalidate();
  }
  /// Append `text` encoded in the current charset.
  pub fn append_text(&mut self, text: &str) {
    let encoded = self.encode(text);
    self.data.extend_from_slice(&encoded);
    self.invalidate();
  }
  /// Truncate, or pad with zero bytes, to exactly `length` octets.
  pub fn set_length(&mut self, length: usize) {
    self.data.resize(length, 0);
    self.invalidate();
  }
  /// Drop all content.
  pub fn clear(&mut self) {
    self.data.clear();
    self.invalidate();
  }
  /// Force a charset, or go back to detection with `None`.
  pub fn set_charset(&mut self, charset: Option<String>) {
    if self.charset != charset {
      self.charset = charset;
      self.invalidate();
    }
  }
  /// The forced charset, if any.
  pub fn charset_override(&self) -> Option<&str> {
    self.charset.as_deref()
  }
  /// Decode text through `gzip` or `deflate` first. The stored octets are
  /// not touched.
  pub fn set_content_encoding(&mut self, encoding: Option<&str>) {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    if self.content_encoding != encoding {
      self.content_encoding = encoding;
      self.invalidate();
    }
  }
  /// Decoded text.
  pub fn text(&self) -> &str {
    &self.decoded().text
  }
  /// Charset used by [`Body::text`].
  pub fn charset(&self) -> &str {
    &self.decoded().charset
  }
  /// The octets after undoing the content encoding.
  pub fn decompressed(&self) -> Cow<'_, [u8]> {
    match self.content_encoding.as_deref() {
      #[cfg(feature = "gzip")]
      Some(encoding) => inflate(encoding, &self.data)
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed(&self.data)),
      _ => Cow::Borrowed(&self.data),
    }
  }

  fn decoded(&self) -> &Decoded {
    self.decoded.get_or_init(|| self.decode())
  }

  fn invalidate(&mut self) {
    self.decoded = OnceLock::new();
  }

  fn decode(&self) -> Decoded {
    let bytes = self.decompressed();
    if let Some(charset) = &self.charset {
      return Decoded {
        text: decode_with(charset, &bytes),
        charset: charset.clone(),
      };
    }
    if let Some(charset) = meta_charset(&bytes) {
      return Decoded {
        text: decode_with(&charset, &bytes),
        charset,
      };
    }
    if let Some(text) = utf8_probe(&bytes) {
      return Decoded {
        text,
        charset: UTF_8.name().to_string(),
      };
    }
    Decoded {
      text: storage_decode(&bytes),
      charset: STORAGE_CHARSET.to_string(),
    }
  }

  fn encode(&self, text: &str) -> Vec<u8> {
    match self
      .charset
      .as_deref()
      .and_then(|c| Encoding::for_label(c.as_bytes()))
    {
      Some(encoding) => encoding.encode(text).0.into_owned(),
      None => text.as_bytes().to_vec(),
    }
  }
}

fn decode_with(charset: &str, bytes: &[u8]) -> String {
  match Encoding::for_label(charset.trim().as_bytes()) {
    Some(encoding) => encoding.decode_without_bom_handling(bytes).0.into_owned(),
    None => storage_decode(bytes),
  }
}

fn storage_decode(bytes: &[u8]) -> String {
  bytes.iter().map(|b| *b as char).collect()
}

/// Accept UTF-8 only when decoding is strict and the text encodes back to
/// the same number of octets.
fn utf8_probe(bytes: &[u8]) -> Option<String> {
  let text = UTF_8.decode_without_bom_handling_and_without_replacement(bytes)?;
  (text.len() == bytes.len()).then(|| text.into_owned())
}

/// Find `charset=` inside an HTML `<meta` tag.
pub(crate) fn meta_charset(bytes: &[u8]) -> Option<String> {
  let lower = bytes.to_ascii_lowercase();
  let mut from = 0;
  while let Some(start) = find(&lower, b"<meta", from) {
    let end = find(&lower, b">", start).unwrap_or(lower.len());
    if let Some(pos) = find(&lower[..end], b"charset=", start) {
      let value = &bytes[pos + b"charset=".len()..end];
      let value: Vec<u8> = value
        .iter()
        .skip_while(|b| matches!(b, b'"' | b'\'' | b' '))
        .take_while(|b| !matches!(b, b'"' | b'\'' | b' ' | b';' | b'>' | b'/'))
        .copied()
        .collect();
      if !value.is_empty() {
        return Some(String::from_utf8_lossy(&value).into_owned());
      }
    }
    from = start + 1;
  }
  None
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
  if from >= haystack.len() {
    return None;
  }
  haystack[from..]
    .windows(needle.len())
    .position(|w| w == needle)
    .map(|p| p + from)
}

#[cfg(feature = "gzip")]
fn inflate(encoding: &str, data: &[u8]) -> Option<Vec<u8>> {
  use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
  use std::io::Read;
  let mut out = Vec::new();
  match encoding {
    "gzip" | "x-gzip" => MultiGzDecoder::new(data).read_to_end(&mut out).ok()?,
    "deflate" => match ZlibDecoder::new(data).read_to_end(&mut out) {
      Ok(n) => n,
      Err(_) => {
        // some servers send raw deflate without the zlib wrapper
        out.clear();
        DeflateDecoder::new(data).read_to_end(&mut out).ok()?
      }
    },
    _ => return None,
  };
  Some(out)
}

impl PartialEq for Body {
  fn eq(&self, other: &Self) -> bool {
    self.data == other.data
  }
}

impl Eq for Body {}

impl Deref for Body {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    &self.data
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body {
      data: v,
      ..Default::default()
    }
  }
}

impl From<&[u8]> for Body {
  #[inline]
  fn from(v: &[u8]) -> Body {
    v.to_vec().into()
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    b.to_vec().into()
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&str> for Body {
  #[inline]
  fn from(s: &str) -> Body {
    s.as_bytes().into()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Body")
      .field("len", &self.data.len())
      .field("charset", &self.charset)
      .field("data", &format_args!("{}", self.data.escape_ascii()))
      .finish()
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(self.text())
  }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Body {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_bytes(&self.data)
  }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Body {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let s = Vec::deserialize(deserializer)?;
    Ok(Body::from(s))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn meta_charset_wins_over_utf8() {
    let body = Body::from("<html><head><meta charset=\"x-mock\"></head></html>");
    assert_eq!(body.charset(), "x-mock");
    assert_eq!(body.text(), "<html><head><meta charset=\"x-mock\"></head></html>");
  }

  #[test]
  fn meta_http_equiv_content_type() {
    let body = Body::from(
      "<META http-equiv=\"Content-Type\" content=\"text/html; charset=Shift_JIS\">".as_bytes(),
    );
    assert_eq!(body.charset(), "Shift_JIS");
  }

  #[test]
  fn valid_utf8_decodes_as_utf8() {
    let body = Body::from("héllo wörld");
    assert_eq!(body.charset(), "UTF-8");
    assert_eq!(body.text(), "héllo wörld");
  }

  #[test]
  fn binary_falls_back_to_storage_charset() {
    let bytes = vec![0xff, 0x00, 0xc3, 0x41];
    let body = Body::from(bytes.clone());
    assert_eq!(body.charset(), STORAGE_CHARSET);
    assert_eq!(body.text().chars().count(), 4);
    assert_eq!(body.as_bytes(), &bytes[..]);
  }

  #[test]
  fn mutation_invalidates_cache() {
    let mut body = Body::from("abc");
    assert_eq!(body.text(), "abc");
    body.append_bytes(b"def");
    assert_eq!(body.text(), "abcdef");
    body.set_length(2);
    assert_eq!(body.text(), "ab");
    body.set_length(4);
    assert_eq!(body.as_bytes(), b"ab\0\0");
    body.set_charset(Some("windows-1252".into()));
    assert_eq!(body.charset(), "windows-1252");
    body.clear();
    assert!(body.is_empty());
    assert_eq!(body.text(), "");
  }

  #[test]
  fn text_is_written_in_current_charset() {
    let mut body = Body::default();
    body.set_text("é");
    assert_eq!(body.as_bytes(), "é".as_bytes());
    body.set_charset(Some("ISO-8859-1".into()));
    body.set_text("é");
    assert_eq!(body.as_bytes(), &[0xe9]);
    assert_eq!(body.text(), "é");
  }

  #[test]
  fn preallocation_is_capped() {
    let body = Body::with_capacity(usize::MAX);
    assert!(body.data.capacity() <= MAX_PREALLOCATION);
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn gzip_view_leaves_octets_untouched() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed text").unwrap();
    let gz = encoder.finish().unwrap();
    let mut body = Body::from(gz.clone());
    body.set_content_encoding(Some("gzip"));
    assert_eq!(body.text(), "compressed text");
    assert_eq!(body.as_bytes(), &gz[..]);
  }
}

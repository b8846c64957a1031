//! Environment path stripping for build outputs.
//!
//! Compilers embed absolute paths (panic locations, debug info) that name
//! the sandbox, the vendor directory and the toolchain. Each occurrence is
//! overwritten in place with a neutral path of identical length, so offsets
//! inside the binary stay valid.

/// A neutral replacement for a path of `len` bytes: `/eeee...`.
pub fn neutral_path(len: usize) -> Vec<u8> {
  let mut out = vec![b'e'; len];
  if let Some(first) = out.first_mut() {
    *first = b'/';
  }
  out
}

/// Overwrite every occurrence of each prefix in `bytes`. Returns the number of
/// replacements made.
///
/// Longer prefixes are replaced first so a prefix nested in another does not
/// leave a partial path behind.
pub fn strip_references(bytes: &mut [u8], prefixes: &[&[u8]]) -> usize {
  let mut ordered: Vec<&[u8]> = prefixes.iter().copied().filter(|p| !p.is_empty()).collect();
  ordered.sort_by_key(|p| std::cmp::Reverse(p.len()));
  ordered.dedup();

  let mut count = 0;
  for prefix in ordered {
    let replacement = neutral_path(prefix.len());
    let mut i = 0;
    while i + prefix.len() <= bytes.len() {
      if bytes[i] == prefix[0] && bytes[i..].starts_with(prefix) {
        bytes[i..i + prefix.len()].copy_from_slice(&replacement);
        count += 1;
        i += prefix.len();
      } else {
        i += 1;
      }
    }
  }
  count
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn replacement_keeps_length() {
    let mut bytes = b"panic at /tmp/sandbox-abc/src/main.rs:3".to_vec();
    let before = bytes.len();

    let count = strip_references(&mut bytes, &[b"/tmp/sandbox-abc".as_slice()]);

    assert_eq!(count, 1);
    assert_eq!(bytes.len(), before);
    assert_eq!(bytes, b"panic at /eeeeeeeeeeeeeee/src/main.rs:3".to_vec());
  }

  #[test]
  fn nested_prefixes_are_fully_replaced() {
    let mut bytes = b"/a/b/c and /a/b".to_vec();
    strip_references(&mut bytes, &[b"/a/b".as_slice(), b"/a/b/c".as_slice()]);
    assert_eq!(bytes, b"/eeeee and /eee".to_vec());
  }

  #[test]
  fn untouched_without_matches() {
    let mut bytes = b"nothing to see".to_vec();
    assert_eq!(strip_references(&mut bytes, &[b"/nix".as_slice(), b"".as_slice()]), 0);
    assert_eq!(bytes, b"nothing to see".to_vec());
  }
}

use std::fmt;

use smallvec::SmallVec;
use unicode_normalization::UnicodeNormalization;

/// A resolved item path: `a.b.c`. Segments are stored as written; equality
/// and hashing go through the folded [`PathKey`] so that two spellings the
/// resolver considers identical compare equal here too.
#[derive(Clone, Debug, Default)]
pub struct Path {
    pub segments: SmallVec<[String; 4]>,
}

impl Path {
    pub fn from_segments<I, S>(segments: I) -> Path
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path { segments: segments.into_iter().map(Into::into).collect() }
    }

    pub fn single(segment: impl Into<String>) -> Path {
        Path::from_segments(Some(segment.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The path without its final segment, e.g. the module of an item path.
    pub fn parent(&self) -> Path {
        let mut segments = self.segments.clone();
        segments.pop();
        Path { segments }
    }

    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    pub fn key(&self) -> PathKey {
        PathKey::new(self.segments.iter().map(|s| fold_ident(s)))
    }

    /// Whether `self` is a (non-strict) prefix of `other`, under folding.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| fold_ident(a) == fold_ident(b))
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Path {}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i != 0 {
                f.write_str(".")?;
            }
            f.write_str(seg)?;
        }
        Ok(())
    }
}

/// The folded form of a path, used as a map key throughout the middle-end.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct PathKey(String);

impl PathKey {
    pub fn new<I, S>(segments: I) -> PathKey
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = String::new();
        for (i, seg) in segments.into_iter().enumerate() {
            if i != 0 {
                out.push('.');
            }
            out.push_str(seg.as_ref());
        }
        PathKey(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Folds an identifier to its canonical comparison form: NFC-normalized,
/// then simple-case-folded. This is the resolver's identifier equality rule;
/// every consumer of names in the middle-end must go through it.
pub fn fold_ident(ident: &str) -> String {
    ident.nfc().flat_map(char::to_lowercase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_is_case_insensitive() {
        assert_eq!(fold_ident("Foo"), fold_ident("fOO"));
        assert_ne!(fold_ident("foo"), fold_ident("bar"));
    }

    #[test]
    fn fold_normalizes_composition() {
        // U+00E9 vs 'e' + U+0301 combining acute
        assert_eq!(fold_ident("caf\u{e9}"), fold_ident("cafe\u{301}"));
    }

    #[test]
    fn path_prefix() {
        let a = Path::from_segments(vec!["net", "tcp"]);
        let b = Path::from_segments(vec!["net", "tcp", "socket"]);
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(a.is_prefix_of(&a));
    }

    #[test]
    fn path_eq_folds() {
        let a = Path::from_segments(vec!["Net", "Tcp"]);
        let b = Path::from_segments(vec!["net", "tcp"]);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
    }
}

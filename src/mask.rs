//! Per-entry compression flags.

use std::fs;
use std::path::Path;

use failure::ResultExt;

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "unexpected character {:?} at position {}", found, position)]
    InvalidCharacter { found: char, position: usize },
    #[fail(display = "mask covers {} entries but the table has {}", len, required)]
    MaskTooShort { len: usize, required: usize },
}

/// One flag per table entry; set means "compress".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mask(Vec<bool>);

impl Mask {
    /// Parses a string of `0`/`1` digits, one per entry. Whitespace is ignored.
    pub fn parse(text: &str) -> Result<Self, Error> {
        text.chars()
            .enumerate()
            .filter(|&(_, c)| !c.is_whitespace())
            .map(|(position, c)| match c {
                '1' => Ok(true),
                '0' => Ok(false),
                found => Err(Error::InvalidCharacter { found, position }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Mask)
    }

    pub fn load(path: &Path) -> Result<Self, failure::Error> {
        let text = fs::read_to_string(path)
            .with_context(|_| format!("failed to read {}", path.display()))?;
        Ok(Self::parse(&text).with_context(|_| format!("failed to parse {}", path.display()))?)
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn compress(&self, index: usize) -> bool {
        self.0.get(index).cloned().unwrap_or(false)
    }

    /// Ensures there is a flag for each of `count` entries.
    pub fn check(&self, count: usize) -> Result<(), Error> {
        if self.len() < count {
            return Err(Error::MaskTooShort { len: self.len(), required: count });
        }
        Ok(())
    }
}

impl ::std::iter::FromIterator<bool> for Mask {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self { Mask(iter.into_iter().collect()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn parse() {
        let mask = Mask::parse("0001\n10 1\r\n").unwrap();
        assert_eq!(mask.len(), 7);
        let flags = (0..7).map(|i| mask.compress(i)).collect::<Vec<_>>();
        assert_eq!(flags, [false, false, false, true, true, false, true]);
        assert!(!mask.compress(7));
    }

    #[test]
    fn invalid() {
        assert_eq!(Mask::parse("01x"), Err(Error::InvalidCharacter { found: 'x', position: 2 }));
    }

    #[test]
    fn coverage() {
        let mask: Mask = vec![true; 4].into_iter().collect();
        assert!(mask.check(4).is_ok());
        assert_eq!(mask.check(5), Err(Error::MaskTooShort { len: 4, required: 5 }));
    }
}

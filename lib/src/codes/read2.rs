use anyhow::{bail, ensure, Result};
use std::{fmt, str};

/// With Read v2, the codes themselves expose the hierarchical structure.
///
/// For example `C10..` (diabetes mellitus) is a parent of `C10F.` (type 2 diabetes mellitus) and
/// of `C10F7`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReadCode([u8; 5]);

impl ReadCode {
    /// Codes above this one, nearest first. `C10F7` gives `C10F.`, `C10..`, `C1...`, `C....`.
    pub fn ancestors(self) -> impl Iterator<Item = ReadCode> {
        let depth = self.0.iter().take_while(|ch| **ch != b'.').count();
        (1..depth).rev().map(move |keep| {
            let mut bytes = self.0;
            for byte in bytes[keep..].iter_mut() {
                *byte = b'.';
            }
            ReadCode(bytes)
        })
    }

    pub fn from_bytes(v: &[u8]) -> Result<Self> {
        // validate
        if v.len() == 5 {
            ensure!(
                v.iter().copied().all(is_read_ch),
                "Read codes contain characters [a-zA-Z0-9.]"
            );
        } else if v.len() == 7 {
            let mut iter = v.iter().copied();
            for _ in 0..5 {
                ensure!(
                    matches!(iter.next(), Some(ch) if is_read_ch(ch)),
                    "Read codes contain characters [a-zA-Z0-9.]"
                );
            }
            for _ in 0..2 {
                ensure!(
                    matches!(iter.next(), Some(ch) if ch.is_ascii_digit()),
                    "Read code term ids contain only numbers"
                );
            }
        } else {
            bail!(
                "expected a 5 or 7 characters long ascii string, found {}",
                v.len()
            );
        }
        ensure!(v[0] != b'.', "Read codes cannot start with '.'");

        // convert
        Ok(ReadCode([v[0], v[1], v[2], v[3], v[4]]))
    }

    pub fn from_str(v: &str) -> Result<Self> {
        Self::from_bytes(v.as_bytes())
    }

    /// Like `from_str`, but accepts truncated codes (`C10` for `C10..`), as found in some
    /// hand-written code lists.
    pub fn parse_lenient(v: &str) -> Result<Self> {
        let bytes = v.as_bytes();
        if (1..5).contains(&bytes.len()) {
            let mut padded = [b'.'; 5];
            padded[..bytes.len()].copy_from_slice(bytes);
            return Self::from_bytes(&padded);
        }
        Self::from_bytes(bytes)
    }

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.0).expect("Read code should be valid utf8")
    }
}

impl fmt::Debug for ReadCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

impl fmt::Display for ReadCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn is_read_ch(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.'
}

//! USB language ids.

use serde::Deserialize;
use std::fmt;

/// USB language id (LANGID) as used in string tables.
///
/// Service files refer to languages by their numeric code; the daemon itself
/// only ever names English (United States), the language it materializes for
/// gadgets created without strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct LangId(pub u16);

impl LangId {
    /// English (United States).
    pub const ENGLISH_US: Self = Self(0x0409);

    /// Name of this language's directory in configfs.
    pub fn configfs_dir(&self) -> String {
        format!("0x{:04x}", self.0)
    }
}

impl fmt::Display for LangId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for LangId {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl From<LangId> for u16 {
    fn from(lang: LangId) -> Self {
        lang.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn configfs_dir() {
        assert_eq!(LangId::ENGLISH_US.configfs_dir(), "0x0409");
        assert_eq!(LangId(0x40c).to_string(), "0x040c");
    }
}

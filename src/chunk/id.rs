//! Chunk identifiers.

use crate::error::{Result, SortError};

/// Identifier of one chunk file: a (level, id) pair.
///
/// Level 0 chunks come out of the sort stage; a level-L chunk (L > 0) is the
/// output of a merge over lower-level chunks. The canonical on-disk name is
/// `HEX(level)<sep>HEX(id)`, lowercase, no zero padding. Within one run a
/// given pair names exactly one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId {
    pub level: u32,
    pub id: u32,
}

impl ChunkId {
    pub fn new(level: u32, id: u32) -> Self {
        ChunkId { level, id }
    }

    /// Canonical file name for this chunk.
    pub fn filename(&self, sep: char) -> String {
        format!("{:x}{}{:x}", self.level, sep, self.id)
    }

    /// Parses a file name produced by [`ChunkId::filename`].
    pub fn parse(name: &str, sep: char) -> Result<Self> {
        let bad = |detail: String| SortError::format(name, detail);

        let (level, id) = name
            .split_once(sep)
            .ok_or_else(|| bad(format!("no '{}' separator in chunk name", sep)))?;

        let level = u32::from_str_radix(level, 16)
            .map_err(|e| bad(format!("bad chunk level '{}': {}", level, e)))?;
        let id = u32::from_str_radix(id, 16)
            .map_err(|e| bad(format!("bad chunk id '{}': {}", id, e)))?;

        Ok(ChunkId { level, id })
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::ChunkId;

    #[rstest]
    #[case(ChunkId::new(0, 0), "0_0")]
    #[case(ChunkId::new(1, 10), "1_a")]
    #[case(ChunkId::new(10, 255), "a_ff")]
    #[case(ChunkId::new(u32::MAX, 1), "ffffffff_1")]
    fn test_filename(#[case] id: ChunkId, #[case] expected: &str) {
        assert_eq!(id.filename('_'), expected);
    }

    #[rstest]
    #[case("0_0", ChunkId::new(0, 0))]
    #[case("a_ff", ChunkId::new(10, 255))]
    #[case("2_1c", ChunkId::new(2, 28))]
    fn test_parse_round_trip(#[case] name: &str, #[case] expected: ChunkId) {
        let parsed = ChunkId::parse(name, '_').unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.filename('_'), name);
    }

    #[rstest]
    #[case("00")]
    #[case("1_zz")]
    #[case("_1")]
    #[case("1_")]
    fn test_parse_rejects_garbage(#[case] name: &str) {
        assert!(ChunkId::parse(name, '_').is_err());
    }

    #[test]
    fn test_order_is_level_then_id() {
        let mut ids = vec![
            ChunkId::new(1, 0),
            ChunkId::new(0, 7),
            ChunkId::new(0, 2),
            ChunkId::new(2, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ChunkId::new(0, 2),
                ChunkId::new(0, 7),
                ChunkId::new(1, 0),
                ChunkId::new(2, 0),
            ]
        );
    }
}

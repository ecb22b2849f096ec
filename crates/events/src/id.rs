use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Identifier assigned by the stream transport to every appended entry.
///
/// Ordering is lexicographic over `(millis, seq)`, matching the order in which
/// the transport appended the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamEntryId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamEntryId {
    /// The position before any entry; reading a backlog "after" it returns everything.
    pub const ZERO: StreamEntryId = StreamEntryId { millis: 0, seq: 0 };

    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than this one.
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntryId(pub String);

impl Display for InvalidEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid stream entry id: {}", self.0)
    }
}

impl std::error::Error for InvalidEntryId {}

impl FromStr for StreamEntryId {
    type Err = InvalidEntryId;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = value
            .split_once('-')
            .ok_or_else(|| InvalidEntryId(value.to_string()))?;
        let millis = millis
            .parse::<u64>()
            .map_err(|_| InvalidEntryId(value.to_string()))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| InvalidEntryId(value.to_string()))?;
        Ok(Self { millis, seq })
    }
}

impl Display for StreamEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl Serialize for StreamEntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamEntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let id: StreamEntryId = "1700-3".parse().unwrap();
        assert_eq!(id, StreamEntryId::new(1700, 3));
        assert_eq!(id.to_string(), "1700-3");
    }

    #[test]
    fn rejects_malformed() {
        assert!("1700".parse::<StreamEntryId>().is_err());
        assert!("a-1".parse::<StreamEntryId>().is_err());
        assert!("1700-".parse::<StreamEntryId>().is_err());
        assert!("-1".parse::<StreamEntryId>().is_err());
    }

    #[test]
    fn orders_by_millis_then_sequence() {
        let a = StreamEntryId::new(1700, 9);
        let b = StreamEntryId::new(1700, 10);
        let c = StreamEntryId::new(1701, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.successor(), b);
    }
}

//! Topic segmentation.
//!
//! A raw topic is a byte string of levels joined by a separator byte. A level that consists of
//! the wildcard byte alone is a [`Level::Wildcard`]; the wildcard byte is not allowed anywhere
//! else. Levels are never empty, so leading, trailing and doubled separators are rejected.

use std::fmt::{self, Write};
use std::ops;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use mqcore_conf::Topic as TopicConf;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
    #[error("TooManyLevels({0})")]
    TooManyLevels(usize),
}

/// Separator and wildcard bytes used to segment topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub separator: u8,
    pub wildcard: u8,
}

impl Default for Delimiters {
    #[inline]
    fn default() -> Self {
        Self { separator: b'/', wildcard: b'*' }
    }
}

impl Delimiters {
    pub fn new(separator: u8, wildcard: u8) -> Result<Self, TopicError> {
        if !separator.is_ascii() || !wildcard.is_ascii() {
            return Err(TopicError::InvalidTopic(format!(
                "delimiters must be ASCII, separator: {separator:#x}, wildcard: {wildcard:#x}"
            )));
        }
        if separator == wildcard {
            return Err(TopicError::InvalidTopic(format!(
                "separator and wildcard must differ, both are `{}`",
                separator as char
            )));
        }
        Ok(Self { separator, wildcard })
    }

    pub fn from_conf(cfg: &TopicConf) -> Result<Self, TopicError> {
        let single = |name: &str, v: &str| match v.as_bytes() {
            [b] => Ok(*b),
            _ => Err(TopicError::InvalidTopic(format!("{name} must be a single byte, got `{v}`"))),
        };
        Self::new(single("separator", &cfg.separator)?, single("wildcard", &cfg.wildcard)?)
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Wildcard,
}

impl Level {
    pub fn parse(level: &[u8], delims: Delimiters) -> Result<Level, TopicError> {
        let (first, rest) = level.split_first().ok_or_else(|| {
            TopicError::InvalidLevel("empty level, separator at the start of a level".into())
        })?;

        if rest.contains(&delims.wildcard) {
            return Err(TopicError::InvalidLevel(format!(
                "invalid level `{}`, wildcard is only allowed as the first byte",
                String::from_utf8_lossy(level)
            )));
        }

        if *first == delims.wildcard {
            return if rest.is_empty() {
                Ok(Level::Wildcard)
            } else {
                Err(TopicError::InvalidLevel(format!(
                    "invalid level `{}`, wildcard must occupy the whole level",
                    String::from_utf8_lossy(level)
                )))
            };
        }

        std::str::from_utf8(level)
            .map(|s| Level::Normal(String::from(s)))
            .map_err(|e| TopicError::InvalidLevel(format!("level is not utf8, {e}")))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match *self {
            Level::Normal(ref s) => Some(s),
            Level::Wildcard => None,
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::Wildcard)
    }

    #[inline]
    fn write_with(&self, f: &mut impl Write, delims: Delimiters) -> fmt::Result {
        match *self {
            Level::Normal(ref s) => f.write_str(s),
            Level::Wildcard => f.write_char(delims.wildcard as char),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    pub fn parse<T: AsRef<[u8]> + ?Sized>(topic: &T, delims: Delimiters) -> Result<Topic, TopicError> {
        let raw = topic.as_ref();
        if raw.is_empty() {
            return Err(TopicError::InvalidTopic("empty topic".into()));
        }
        raw.split(|b| *b == delims.separator)
            .map(|level| Level::parse(level, delims))
            .collect::<Result<Vec<_>, TopicError>>()
            .map(Topic)
            .map_err(|e| match e {
                TopicError::InvalidLevel(s) => {
                    TopicError::InvalidLevel(format!("{s}, topic `{}`", String::from_utf8_lossy(raw)))
                }
                e => e,
            })
    }

    #[inline]
    pub fn levels(&self) -> &Vec<Level> {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    /// A wildcard, if present, must be the last level.
    #[inline]
    pub fn is_filter(&self) -> bool {
        self.0.iter().rev().skip(1).all(|l| !l.is_wildcard())
    }

    #[inline]
    pub fn check_levels(&self, max_levels: usize) -> Result<(), TopicError> {
        if max_levels > 0 && self.0.len() > max_levels {
            Err(TopicError::TooManyLevels(self.0.len()))
        } else {
            Ok(())
        }
    }

    pub fn to_string_with(&self, delims: Delimiters) -> String {
        let mut out = String::new();
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(delims.separator as char);
            }
            let _ = level.write_with(&mut out, delims);
        }
        out
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl From<Topic> for Vec<Level> {
    fn from(t: Topic) -> Self {
        t.0
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        Topic::parse(s, Delimiters::default())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_with(f, Delimiters::default())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with(Delimiters::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(s: &str) -> Level {
        Level::Normal(s.into())
    }

    #[test]
    fn test_parse_topic() {
        let t: Topic = "sport/tennis/player1".parse().unwrap();
        assert_eq!(t.levels(), &vec![normal("sport"), normal("tennis"), normal("player1")]);
        assert!(!t.has_wildcard());
        assert!(t.is_filter());

        let t: Topic = "sport/*".parse().unwrap();
        assert_eq!(t.levels(), &vec![normal("sport"), Level::Wildcard]);
        assert!(t.has_wildcard());
        assert!(t.is_filter());

        assert_eq!(Topic::from_str("*").unwrap().levels(), &vec![Level::Wildcard]);
    }

    #[test]
    fn test_malformed_topic() {
        assert!(matches!(Topic::from_str(""), Err(TopicError::InvalidTopic(_))));
        assert!(matches!(Topic::from_str("/finance"), Err(TopicError::InvalidLevel(_))));
        assert!(matches!(Topic::from_str("sport//tennis"), Err(TopicError::InvalidLevel(_))));
        assert!(matches!(Topic::from_str("sport/"), Err(TopicError::InvalidLevel(_))));
        assert!(matches!(Topic::from_str("sport/ten*nis"), Err(TopicError::InvalidLevel(_))));
        assert!(matches!(Topic::from_str("sport/*tennis"), Err(TopicError::InvalidLevel(_))));
        assert!(Topic::parse(&[b'a', 0xff][..], Delimiters::default()).is_err());
    }

    #[test]
    fn test_interior_wildcard_is_not_a_filter() {
        let t: Topic = "sport/*/player1".parse().unwrap();
        assert!(t.has_wildcard());
        assert!(!t.is_filter());
    }

    #[test]
    fn test_custom_delimiters() {
        let d = Delimiters::new(b'.', b'#').unwrap();
        let t = Topic::parse("a.b.#", d).unwrap();
        assert_eq!(t.levels(), &vec![normal("a"), normal("b"), Level::Wildcard]);
        assert_eq!(t.to_string_with(d), "a.b.#");
        assert!(Topic::parse("a/b", d).is_ok());
        assert!(Topic::parse("a..b", d).is_err());

        assert!(Delimiters::new(b'/', b'/').is_err());
        assert!(Delimiters::new(0xc3, b'*').is_err());

        let mut cfg = TopicConf::default();
        assert_eq!(Delimiters::from_conf(&cfg).unwrap(), Delimiters::default());
        cfg.wildcard = "**".into();
        assert!(Delimiters::from_conf(&cfg).is_err());
    }

    #[test]
    fn test_check_levels() {
        let t: Topic = "a/b/c".parse().unwrap();
        assert!(t.check_levels(0).is_ok());
        assert!(t.check_levels(3).is_ok());
        assert_eq!(t.check_levels(2), Err(TopicError::TooManyLevels(3)));
    }

    #[test]
    fn test_display() {
        let t: Topic = "sport/tennis/*".parse().unwrap();
        assert_eq!(t.to_string(), "sport/tennis/*");
        assert_eq!(format!("{}", Level::Wildcard), "*");
    }
}

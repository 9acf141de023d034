use std::fmt::{self, Write};
use std::ops;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest topic or topic filter accepted on the wire, in bytes.
pub const MAX_TOPIC_LEN: usize = 65535;

#[inline]
fn is_dollar<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("invalid topic level `{0}`")]
    InvalidLevel(String),
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("topic exceeds {0} levels")]
    TooManyLevels(usize),
}

/// One segment of a slash-separated topic.
///
/// `Metadata` is a `$`-prefixed first level such as `$SYS`; wildcards
/// never match it.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Metadata(String),
    Blank,
    SingleWildcard,
    MultiWildcard,
}

impl Level {
    #[inline]
    pub fn value(&self) -> Option<&str> {
        match self {
            Level::Normal(s) | Level::Metadata(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(self, Level::Metadata(_))
    }

    #[inline]
    fn is_valid(&self) -> bool {
        match self {
            Level::Normal(s) => !s.starts_with('$') && !s.contains(['+', '#']),
            Level::Metadata(s) => s.starts_with('$') && !s.contains(['+', '#']),
            _ => true,
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ if s.contains(['+', '#']) => Err(TopicError::InvalidLevel(s.into())),
            _ if is_dollar(s) => Ok(Level::Metadata(s.into())),
            _ => Ok(Level::Normal(s.into())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// How one concrete level relates to a filter level.
trait MatchLevel {
    fn match_level(&self, level: &Level) -> bool;
}

impl MatchLevel for Level {
    fn match_level(&self, level: &Level) -> bool {
        match level {
            Level::Normal(lhs) => matches!(self, Level::Normal(rhs) if lhs == rhs),
            Level::Metadata(lhs) => matches!(self, Level::Metadata(rhs) if lhs == rhs),
            Level::Blank => true,
            Level::SingleWildcard | Level::MultiWildcard => !self.is_metadata(),
        }
    }
}

impl MatchLevel for &Level {
    fn match_level(&self, level: &Level) -> bool {
        Level::match_level(*self, level)
    }
}

impl<T: AsRef<str>> MatchLevel for T {
    fn match_level(&self, level: &Level) -> bool {
        match level {
            Level::Normal(lhs) => !is_dollar(self) && lhs == self.as_ref(),
            Level::Metadata(lhs) => is_dollar(self) && lhs == self.as_ref(),
            Level::Blank => self.as_ref().is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => !is_dollar(self),
        }
    }
}

/// A parsed topic filter (or concrete topic when it holds no wildcards).
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        let last = self.0.len().saturating_sub(1);
        self.0.iter().enumerate().all(|(pos, level)| {
            level.is_valid()
                && match level {
                    Level::MultiWildcard => pos == last,
                    Level::Metadata(_) => pos == 0,
                    _ => true,
                }
        })
    }

    #[inline]
    pub fn matches(&self, topic: &Topic) -> bool {
        self.match_iter(topic.0.iter())
    }

    #[inline]
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        self.match_iter(topic.as_ref().split('/'))
    }

    fn match_iter<L, I>(&self, levels: I) -> bool
    where
        L: MatchLevel,
        I: IntoIterator<Item = L>,
    {
        let mut filter = self.0.iter();
        for concrete in levels {
            match filter.next() {
                Some(Level::MultiWildcard) => {
                    return concrete.match_level(&Level::MultiWildcard);
                }
                Some(Level::SingleWildcard) => {
                    if !concrete.match_level(&Level::SingleWildcard) {
                        return false;
                    }
                }
                Some(level) if concrete.match_level(level) => {}
                _ => return false,
            }
        }
        // filter exhausted, or only a trailing `#` remains
        match filter.next() {
            None => true,
            Some(Level::MultiWildcard) => true,
            Some(_) => false,
        }
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        let topic = s
            .split('/')
            .map(Level::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Topic)?;
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(TopicError::InvalidTopic(s.into()))
        }
    }
}

impl From<Vec<Level>> for Topic {
    fn from(v: Vec<Level>) -> Self {
        Topic(v)
    }
}

impl ops::Deref for Topic {
    type Target = Vec<Level>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if !first {
                f.write_char('/')?;
            }
            first = false;
            level.fmt(f)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! topic {
    ($s:expr) => {
        $s.parse::<$crate::topic::Topic>()
    };
}

/// Syntax check for a topic used in PUBLISH. Wildcards are forbidden.
/// `max_levels == 0` disables the hierarchy limit.
pub fn pub_topic_check(topic: &str, max_levels: usize) -> Result<(), TopicError> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::InvalidTopic(topic.into()));
    }
    let levels = topic.split('/').count();
    if max_levels > 0 && levels > max_levels {
        return Err(TopicError::TooManyLevels(max_levels));
    }
    Ok(())
}

/// Syntax check for a topic filter used in SUBSCRIBE/UNSUBSCRIBE.
/// `max_levels == 0` disables the hierarchy limit.
pub fn sub_topic_check(filter: &str, max_levels: usize) -> Result<(), TopicError> {
    if filter.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    let levels = filter.split('/').count();
    if max_levels > 0 && levels > max_levels {
        return Err(TopicError::TooManyLevels(max_levels));
    }
    filter.parse::<Topic>().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("+".parse::<Level>().unwrap(), Level::SingleWildcard);
        assert_eq!("#".parse::<Level>().unwrap(), Level::MultiWildcard);
        assert_eq!("".parse::<Level>().unwrap(), Level::Blank);
        assert_eq!("$SYS".parse::<Level>().unwrap(), Level::Metadata("$SYS".into()));

        assert!(topic!("sport/tennis/player1").is_ok());
        assert!(topic!("/finance").is_ok());
        assert!(topic!("sport/tennis/#").is_ok());
        assert!(topic!("+/tennis/+").is_ok());

        assert!(topic!("sport/tennis#").is_err());
        assert!(topic!("sport/tennis/#/ranking").is_err());
        assert!(topic!("sport+").is_err());
        assert!(topic!("sport/$SYS").is_err());
    }

    #[test]
    fn test_multi_wildcard() {
        let t: Topic = "sport/tennis/player1/#".parse().unwrap();
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player1/ranking"));
        assert!(t.matches_str("sport/tennis/player1/score/wimbledon"));

        assert!(topic!("sport/#").unwrap().matches_str("sport"));
        assert!(topic!("#").unwrap().matches_str("a/b/c"));
    }

    #[test]
    fn test_single_wildcard() {
        let t: Topic = "sport/tennis/+".parse().unwrap();
        assert!(t.matches_str("sport/tennis/player1"));
        assert!(t.matches_str("sport/tennis/player2"));
        assert!(!t.matches_str("sport/tennis/player1/ranking"));

        let t: Topic = "sport/+".parse().unwrap();
        assert!(!t.matches_str("sport"));
        assert!(t.matches_str("sport/"));

        assert!(topic!("+/+").unwrap().matches_str("/finance"));
        assert!(topic!("/+").unwrap().matches_str("/finance"));
        assert!(!topic!("+").unwrap().matches_str("/finance"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!topic!("#").unwrap().matches_str("$SYS"));
        assert!(!topic!("+/monitor/Clients").unwrap().matches_str("$SYS/monitor/Clients"));
        assert!(topic!("$SYS/#").unwrap().matches_str("$SYS/"));
        assert!(topic!("$SYS/monitor/+").unwrap().matches_str("$SYS/monitor/Clients"));
    }

    #[test]
    fn test_display() {
        let t: Topic = "+/tennis/#".parse().unwrap();
        assert_eq!(t.to_string(), "+/tennis/#");
        let t: Topic = "/finance".parse().unwrap();
        assert_eq!(t.to_string(), "/finance");
    }

    #[test]
    fn test_pub_topic_check() {
        assert!(pub_topic_check("sport/tennis", 0).is_ok());
        assert!(pub_topic_check("sport/+", 0).is_err());
        assert!(pub_topic_check("sport/#", 0).is_err());
        assert!(pub_topic_check("a/b/c/d", 3).is_err());
        assert!(pub_topic_check("a/b/c", 3).is_ok());
        let long = "x".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(pub_topic_check(&long, 0), Err(TopicError::TooLong));
    }

    #[test]
    fn test_sub_topic_check() {
        assert!(sub_topic_check("sport/+/player1", 0).is_ok());
        assert!(sub_topic_check("sport/#", 0).is_ok());
        assert!(sub_topic_check("sport/tennis#", 0).is_err());
        assert!(sub_topic_check("a/b/c/d", 3).is_err());
    }
}

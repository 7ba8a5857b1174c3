//! MQTT topic names and filters.
//!
//! Filters follow the MQTT 3.1.1 matching rules:
//! - `+` matches exactly one level (`sensors/+/data` matches `sensors/42/data`)
//! - `#` matches the parent level and every level below it, and must be last
//! - filters starting with a wildcard never match topics starting with `$`

use crate::error::TopicError;
use std::fmt;

pub const MAX_TOPIC_BYTES: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Exact(String),
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        check_common(filter)?;

        let parts: Vec<&str> = filter.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let level = match *part {
                "+" => Level::Single,
                "#" if index == parts.len() - 1 => Level::Multi,
                p if p.contains('+') || p.contains('#') => {
                    return Err(TopicError::InvalidWildcard(filter.to_string()))
                }
                p => Level::Exact(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: filter.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && !matches!(self.levels.first(), Some(Level::Exact(_))) {
            return false;
        }

        let mut segments = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if segments.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match segments.next() {
                    Some(segment) if segment == expected => {}
                    _ => return false,
                },
            }
        }
        segments.next().is_none()
    }

    /// Index of the first single-level wildcard, i.e. the topic level a `+`
    /// captures when the filter matches.
    pub fn first_single_wildcard(&self) -> Option<usize> {
        self.levels.iter().position(|l| *l == Level::Single)
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validates a concrete topic name used for publishing.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Returns the topic level at `index`, if present and non-empty.
pub fn level_at(topic: &str, index: usize) -> Option<&str> {
    topic.split('/').nth(index).filter(|s| !s.is_empty())
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(TopicError::TooLong {
            max: MAX_TOPIC_BYTES,
        });
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

//! Text encoding of vector clocks.
//!
//! Format: `VectorTimestamp/<id>:<counter>(.<id>:<counter>)*/`

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use xdn_types::NodeId;

use crate::{clock::VectorClock, error::ClockParseError};

/// Prefix of every encoded clock.
pub const ENCODED_PREFIX: &str = "VectorTimestamp/";

const SUFFIX: char = '/';
const PAIR_SEPARATOR: char = '.';
const COUNTER_SEPARATOR: char = ':';

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ENCODED_PREFIX)?;
        for (i, (node, counter)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, "{PAIR_SEPARATOR}")?;
            }
            write!(f, "{node}{COUNTER_SEPARATOR}{counter}")?;
        }
        write!(f, "{SUFFIX}")
    }
}

impl FromStr for VectorClock {
    type Err = ClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(ENCODED_PREFIX)
            .ok_or(ClockParseError::MissingPrefix)?;
        let body = body
            .strip_suffix(SUFFIX)
            .ok_or(ClockParseError::MissingSuffix)?;
        if body.is_empty() {
            return Err(ClockParseError::Empty);
        }

        let mut counters = HashMap::new();
        for pair in body.split(PAIR_SEPARATOR) {
            let (node, value) = pair
                .split_once(COUNTER_SEPARATOR)
                .ok_or_else(|| ClockParseError::InvalidPair(pair.to_string()))?;
            if node.is_empty() || node.contains(SUFFIX) || value.contains(COUNTER_SEPARATOR) {
                return Err(ClockParseError::InvalidPair(pair.to_string()));
            }
            let counter: u64 = value.parse().map_err(|_| ClockParseError::InvalidCounter {
                node: node.to_string(),
                value: value.to_string(),
            })?;
            if counters.insert(NodeId::from(node), counter).is_some() {
                return Err(ClockParseError::DuplicateNode(node.to_string()));
            }
        }

        Ok(VectorClock::from_counters(counters))
    }
}

impl Serialize for VectorClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VectorClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(de::Error::custom)
    }
}

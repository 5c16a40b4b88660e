use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Health status, ordered by severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    #[default]
    Unknown = 0,
    Ok = 1,
    Info = 2,
    Warning = 3,
    Critical = 4,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Ok => "ok",
            Status::Info => "info",
            Status::Warning => "warning",
            Status::Critical => "critical",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            Status::Ok => "#23d160",
            Status::Warning => "#ffdd57",
            Status::Critical => "#f44034",
            _ => "#d3d3d3",
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Status::Ok,
            2 => Status::Info,
            3 => Status::Warning,
            4 => Status::Critical,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ok" => Status::Ok,
            "info" => Status::Info,
            "warning" => Status::Warning,
            "critical" => Status::Critical,
            _ => Status::Unknown,
        })
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        assert!(Status::Unknown < Status::Ok);
        assert!(Status::Ok < Status::Info);
        assert!(Status::Warning < Status::Critical);
        assert_eq!("WARNING".parse::<Status>().unwrap(), Status::Warning);
        assert_eq!(Status::from_i64(Status::Critical as i64), Status::Critical);
    }
}

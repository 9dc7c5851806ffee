//! (De)serializes a [Duration] as a number of seconds, possibly fractional.
//!
//! Use with `#[serde(with = "dtq_utils::serde_secs")]`.

use std::time::Duration;

use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Interval {
        #[serde(with = "super")]
        every: Duration,
    }

    #[test]
    fn fractional_seconds() {
        let interval: Interval = serde_json::from_str(r#"{"every": 0.25}"#).unwrap();
        assert_eq!(interval.every, Duration::from_millis(250));
    }

    #[test]
    fn whole_seconds() {
        let interval: Interval = serde_json::from_str(r#"{"every": 30}"#).unwrap();
        assert_eq!(interval.every, Duration::from_secs(30));
    }

    #[test]
    fn negative_seconds_rejected() {
        let result: Result<Interval, _> = serde_json::from_str(r#"{"every": -1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serializes_as_seconds() {
        let shown = serde_json::to_string(&Interval {
            every: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(shown, r#"{"every":1.5}"#);
    }
}

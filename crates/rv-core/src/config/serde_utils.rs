//! Duration fields for the TOML config
//!
//! Durations are written as plain integers so the file stays readable:
//! whole seconds for timeouts, milliseconds for the short completion windows.
//! Use with `#[serde(with = "duration_secs")]` or `duration_millis`.

macro_rules! duration_as_integer {
    ($name:ident, $unit:literal, $to:expr, $from:path) => {
        #[doc = concat!("`Duration` stored as a whole number of ", $unit)]
        pub mod $name {
            use serde::{Deserialize, Deserializer, Serializer};
            use std::time::Duration;

            pub fn serialize<S: Serializer>(
                duration: &Duration,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                let to: fn(&Duration) -> u64 = $to;
                serializer.serialize_u64(to(duration))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Duration, D::Error> {
                u64::deserialize(deserializer).map($from)
            }
        }
    };
}

duration_as_integer!(duration_secs, "seconds", |d| d.as_secs(), Duration::from_secs);
duration_as_integer!(
    duration_millis,
    "milliseconds",
    |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
    Duration::from_millis
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timing {
        #[serde(with = "duration_secs")]
        timeout: Duration,
        #[serde(with = "duration_millis")]
        window: Duration,
    }

    #[test]
    fn test_written_as_integers() {
        let timing = Timing {
            timeout: Duration::from_secs(30),
            window: Duration::from_millis(250),
        };
        let text = toml::to_string(&timing).unwrap();
        assert_eq!(text, "timeout = 30\nwindow = 250\n");
    }

    #[test]
    fn test_read_from_integers() {
        let timing: Timing = toml::from_str("timeout = 60\nwindow = 5\n").unwrap();
        assert_eq!(timing.timeout, Duration::from_secs(60));
        assert_eq!(timing.window, Duration::from_millis(5));
    }

    #[test]
    fn test_negative_rejected() {
        let result: Result<Timing, _> = toml::from_str("timeout = -1\nwindow = 5\n");
        assert!(result.is_err());
    }
}

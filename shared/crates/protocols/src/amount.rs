//! Serde codec for `u128` token amounts.
//!
//! Amounts serialize as decimal strings so values past the u64 range
//! survive JSON; deserialization accepts both strings and plain
//! numbers for client convenience.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};

pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a non-negative integer amount, as a number or decimal string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u128, E> {
            Ok(value as u128)
        }

        fn visit_u128<E: de::Error>(self, value: u128) -> Result<u128, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u128, E> {
            u128::try_from(value).map_err(|_| E::custom("amount must be non-negative"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u128, E> {
            value.parse::<u128>().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(AmountVisitor)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super")]
        amount: u128,
    }

    #[test]
    fn test_round_trip_past_u64_range() {
        let holder = Holder { amount: u128::MAX };
        let raw = serde_json::to_string(&holder).unwrap();
        let back: Holder = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.amount, u128::MAX);
    }

    #[test]
    fn test_accepts_numbers_and_strings() {
        let from_number: Holder = serde_json::from_str(r#"{"amount": 42}"#).unwrap();
        assert_eq!(from_number.amount, 42);
        let from_string: Holder = serde_json::from_str(r#"{"amount": "42"}"#).unwrap();
        assert_eq!(from_string.amount, 42);
        assert!(serde_json::from_str::<Holder>(r#"{"amount": -1}"#).is_err());
    }
}

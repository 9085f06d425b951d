//! Closed value-domain enumeration and the conflict-resolution lattice.
//!
//! Every column in the corpus is classified into exactly one [`ValueDomain`].
//! When the same column name carries different domains across survey years,
//! [`ValueDomain::resolve`] picks the join: the least domain able to
//! represent every historical value. The join is commutative, associative,
//! and never less permissive than either input, which makes consolidation
//! order-independent.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueDomain {
    Integer,
    Decimal,
    Text,
    LongText,
    Boolean,
    Date,
    DateTime,
}

impl ValueDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueDomain::Integer => "integer",
            ValueDomain::Decimal => "decimal",
            ValueDomain::Text => "text",
            ValueDomain::LongText => "long-text",
            ValueDomain::Boolean => "boolean",
            ValueDomain::Date => "date",
            ValueDomain::DateTime => "datetime",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "integer",
            "decimal",
            "text",
            "long-text",
            "boolean",
            "date",
            "datetime",
        ]
    }

    pub fn is_textual(self) -> bool {
        matches!(self, ValueDomain::Text | ValueDomain::LongText)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueDomain::Integer | ValueDomain::Decimal)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, ValueDomain::Date | ValueDomain::DateTime)
    }

    /// Rank in the permissiveness order used when reporting conflicts:
    /// long-text > decimal > integer > datetime > date > boolean > text.
    pub fn permissiveness(self) -> u8 {
        match self {
            ValueDomain::LongText => 6,
            ValueDomain::Decimal => 5,
            ValueDomain::Integer => 4,
            ValueDomain::DateTime => 3,
            ValueDomain::Date => 2,
            ValueDomain::Boolean => 1,
            ValueDomain::Text => 0,
        }
    }

    /// Join of two domains: the least domain representing every value valid
    /// under either input.
    ///
    /// Within a kind the wider member wins (integer ∪ decimal → decimal,
    /// date ∪ datetime → datetime, text ∪ long-text → long-text). Across
    /// kinds nothing short of unbounded text is guaranteed to round-trip, so
    /// the join is long-text.
    pub fn resolve(self, other: ValueDomain) -> ValueDomain {
        use ValueDomain::*;
        if self == other {
            return self;
        }
        match (self, other) {
            (Integer, Decimal) | (Decimal, Integer) => Decimal,
            (Date, DateTime) | (DateTime, Date) => DateTime,
            (Text, LongText) | (LongText, Text) => LongText,
            _ => LongText,
        }
    }

    /// Folds the join over a non-empty domain list.
    pub fn resolve_all<I>(domains: I) -> Option<ValueDomain>
    where
        I: IntoIterator<Item = ValueDomain>,
    {
        domains.into_iter().reduce(ValueDomain::resolve)
    }
}

impl fmt::Display for ValueDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ValueDomain {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "integer" | "int" => Ok(ValueDomain::Integer),
            "decimal" | "float" | "double" => Ok(ValueDomain::Decimal),
            "text" | "string" => Ok(ValueDomain::Text),
            "long-text" | "longtext" | "long_text" => Ok(ValueDomain::LongText),
            "boolean" | "bool" => Ok(ValueDomain::Boolean),
            "date" => Ok(ValueDomain::Date),
            "datetime" | "date-time" | "timestamp" => Ok(ValueDomain::DateTime),
            _ => Err(PipelineError::UnknownDomain(value.trim().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ValueDomain::*;
    use super::*;

    #[test]
    fn resolve_is_idempotent() {
        for domain in [Integer, Decimal, Text, LongText, Boolean, Date, DateTime] {
            assert_eq!(domain.resolve(domain), domain);
        }
    }

    #[test]
    fn resolve_widens_within_a_kind() {
        assert_eq!(Integer.resolve(Decimal), Decimal);
        assert_eq!(Date.resolve(DateTime), DateTime);
        assert_eq!(Text.resolve(LongText), LongText);
    }

    #[test]
    fn resolve_joins_mixed_kinds_at_long_text() {
        assert_eq!(Text.resolve(Integer), LongText);
        assert_eq!(Decimal.resolve(Date), LongText);
        assert_eq!(Boolean.resolve(Integer), LongText);
    }

    #[test]
    fn resolve_all_folds_in_any_order() {
        let forward = ValueDomain::resolve_all([Integer, Decimal, Text]).unwrap();
        let backward = ValueDomain::resolve_all([Text, Decimal, Integer]).unwrap();
        assert_eq!(forward, LongText);
        assert_eq!(forward, backward);
        assert_eq!(ValueDomain::resolve_all(std::iter::empty()), None);
    }

    #[test]
    fn string_round_trip() {
        for token in ValueDomain::variants() {
            let domain: ValueDomain = token.parse().unwrap();
            assert_eq!(domain.as_str(), *token);
        }
        assert!("guid".parse::<ValueDomain>().is_err());
    }
}

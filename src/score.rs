// score.rs - Score types
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt::Debug;
use std::ops::{Add, Neg, Sub};

/// Core trait for all score types.
///
/// A score is an additive group: impacts are added and undone by subtraction,
/// so the running total after any sequence of impacts and undos is exact.
pub trait Score:
    Clone + Add<Output = Self> + Sub<Output = Self> + Neg<Output = Self> + PartialEq + PartialOrd + Debug + 'static
{
    /// Returns a "null" or zero score (the additive identity)
    fn null_score() -> Self;

    /// Returns the names of score fields for this score type
    fn get_fields() -> &'static [&'static str];

    /// Converts the score to a list of level values, most important first
    fn as_list(&self) -> Vec<Decimal>;

    /// Multiplies every level by an integer match weight
    fn mul(&self, factor: i64) -> Self;

    /// Multiplies every level by an arbitrary-precision match weight
    fn mul_decimal(&self, factor: Decimal) -> Self;

    /// A score is feasible when no hard level is negative
    fn is_feasible(&self) -> bool;

    fn is_zero(&self) -> bool {
        *self == Self::null_score()
    }
}

/// Rounds `value * factor` to an integer level, saturating on overflow.
fn scale_level(value: i64, factor: Decimal) -> i64 {
    let scaled = (Decimal::from(value) * factor).round();
    scaled.to_i64().unwrap_or(if scaled.is_sign_negative() { i64::MIN } else { i64::MAX })
}

/// Implements the arithmetic operators level by level.
macro_rules! impl_score_ops {
    ($T:ident { $($field:ident),+ }) => {
        impl Add for $T {
            type Output = Self;

            fn add(self, other: Self) -> Self {
                $T { $($field: self.$field + other.$field),+ }
            }
        }

        impl Sub for $T {
            type Output = Self;

            fn sub(self, other: Self) -> Self {
                $T { $($field: self.$field - other.$field),+ }
            }
        }

        impl Neg for $T {
            type Output = Self;

            fn neg(self) -> Self {
                $T { $($field: -self.$field),+ }
            }
        }
    };
}

/// Single-level integer score
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimpleScore {
    pub simple_value: i64,
}

impl SimpleScore {
    pub const ONE: SimpleScore = SimpleScore { simple_value: 1 };

    pub fn new(simple_value: i64) -> Self {
        Self { simple_value }
    }
}

impl_score_ops!(SimpleScore { simple_value });

impl Score for SimpleScore {
    fn null_score() -> Self {
        SimpleScore { simple_value: 0 }
    }

    fn get_fields() -> &'static [&'static str] {
        &["simple_value"]
    }

    fn as_list(&self) -> Vec<Decimal> {
        vec![Decimal::from(self.simple_value)]
    }

    fn mul(&self, factor: i64) -> Self {
        SimpleScore {
            simple_value: self.simple_value * factor,
        }
    }

    fn mul_decimal(&self, factor: Decimal) -> Self {
        SimpleScore {
            simple_value: scale_level(self.simple_value, factor),
        }
    }

    fn is_feasible(&self) -> bool {
        true
    }
}

/// Two-level integer score: hard constraints dominate soft ones
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HardSoftScore {
    pub hard_score: i64,
    pub soft_score: i64,
}

impl HardSoftScore {
    pub const ONE_HARD: HardSoftScore = HardSoftScore { hard_score: 1, soft_score: 0 };
    pub const ONE_SOFT: HardSoftScore = HardSoftScore { hard_score: 0, soft_score: 1 };

    pub fn new(hard_score: i64, soft_score: i64) -> Self {
        Self { hard_score, soft_score }
    }

    pub fn hard(hard_score: i64) -> Self {
        Self { hard_score, soft_score: 0 }
    }

    pub fn soft(soft_score: i64) -> Self {
        Self { hard_score: 0, soft_score }
    }
}

impl_score_ops!(HardSoftScore { hard_score, soft_score });

impl Score for HardSoftScore {
    fn null_score() -> Self {
        HardSoftScore { hard_score: 0, soft_score: 0 }
    }

    fn get_fields() -> &'static [&'static str] {
        &["hard_score", "soft_score"]
    }

    fn as_list(&self) -> Vec<Decimal> {
        vec![Decimal::from(self.hard_score), Decimal::from(self.soft_score)]
    }

    fn mul(&self, factor: i64) -> Self {
        HardSoftScore {
            hard_score: self.hard_score * factor,
            soft_score: self.soft_score * factor,
        }
    }

    fn mul_decimal(&self, factor: Decimal) -> Self {
        HardSoftScore {
            hard_score: scale_level(self.hard_score, factor),
            soft_score: scale_level(self.soft_score, factor),
        }
    }

    fn is_feasible(&self) -> bool {
        self.hard_score >= 0
    }
}

/// Three-level integer score
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HardMediumSoftScore {
    pub hard_score: i64,
    pub medium_score: i64,
    pub soft_score: i64,
}

impl HardMediumSoftScore {
    pub fn new(hard_score: i64, medium_score: i64, soft_score: i64) -> Self {
        Self {
            hard_score,
            medium_score,
            soft_score,
        }
    }

    pub fn hard(hard_score: i64) -> Self {
        Self::new(hard_score, 0, 0)
    }

    pub fn medium(medium_score: i64) -> Self {
        Self::new(0, medium_score, 0)
    }

    pub fn soft(soft_score: i64) -> Self {
        Self::new(0, 0, soft_score)
    }
}

impl_score_ops!(HardMediumSoftScore { hard_score, medium_score, soft_score });

impl Score for HardMediumSoftScore {
    fn null_score() -> Self {
        HardMediumSoftScore::new(0, 0, 0)
    }

    fn get_fields() -> &'static [&'static str] {
        &["hard_score", "medium_score", "soft_score"]
    }

    fn as_list(&self) -> Vec<Decimal> {
        vec![
            Decimal::from(self.hard_score),
            Decimal::from(self.medium_score),
            Decimal::from(self.soft_score),
        ]
    }

    fn mul(&self, factor: i64) -> Self {
        HardMediumSoftScore::new(
            self.hard_score * factor,
            self.medium_score * factor,
            self.soft_score * factor,
        )
    }

    fn mul_decimal(&self, factor: Decimal) -> Self {
        HardMediumSoftScore::new(
            scale_level(self.hard_score, factor),
            scale_level(self.medium_score, factor),
            scale_level(self.soft_score, factor),
        )
    }

    fn is_feasible(&self) -> bool {
        self.hard_score >= 0
    }
}

/// Single-level arbitrary-precision score
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimpleDecimalScore {
    pub simple_value: Decimal,
}

impl SimpleDecimalScore {
    pub fn new(simple_value: Decimal) -> Self {
        Self { simple_value }
    }
}

impl_score_ops!(SimpleDecimalScore { simple_value });

impl Score for SimpleDecimalScore {
    fn null_score() -> Self {
        SimpleDecimalScore {
            simple_value: Decimal::ZERO,
        }
    }

    fn get_fields() -> &'static [&'static str] {
        &["simple_value"]
    }

    fn as_list(&self) -> Vec<Decimal> {
        vec![self.simple_value]
    }

    fn mul(&self, factor: i64) -> Self {
        SimpleDecimalScore {
            simple_value: self.simple_value * Decimal::from(factor),
        }
    }

    fn mul_decimal(&self, factor: Decimal) -> Self {
        SimpleDecimalScore {
            simple_value: self.simple_value * factor,
        }
    }

    fn is_feasible(&self) -> bool {
        true
    }
}

/// Two-level arbitrary-precision score
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HardSoftDecimalScore {
    pub hard_score: Decimal,
    pub soft_score: Decimal,
}

impl HardSoftDecimalScore {
    pub fn new(hard_score: Decimal, soft_score: Decimal) -> Self {
        Self { hard_score, soft_score }
    }

    pub fn hard(hard_score: Decimal) -> Self {
        Self::new(hard_score, Decimal::ZERO)
    }

    pub fn soft(soft_score: Decimal) -> Self {
        Self::new(Decimal::ZERO, soft_score)
    }
}

impl_score_ops!(HardSoftDecimalScore { hard_score, soft_score });

impl Score for HardSoftDecimalScore {
    fn null_score() -> Self {
        HardSoftDecimalScore::new(Decimal::ZERO, Decimal::ZERO)
    }

    fn get_fields() -> &'static [&'static str] {
        &["hard_score", "soft_score"]
    }

    fn as_list(&self) -> Vec<Decimal> {
        vec![self.hard_score, self.soft_score]
    }

    fn mul(&self, factor: i64) -> Self {
        let factor = Decimal::from(factor);
        HardSoftDecimalScore::new(self.hard_score * factor, self.soft_score * factor)
    }

    fn mul_decimal(&self, factor: Decimal) -> Self {
        HardSoftDecimalScore::new(self.hard_score * factor, self.soft_score * factor)
    }

    fn is_feasible(&self) -> bool {
        self.hard_score >= Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_hard_soft_ordering_is_lexicographic() {
        assert!(HardSoftScore::new(0, -100) > HardSoftScore::new(-1, 0));
        assert!(HardSoftScore::new(-1, 5) > HardSoftScore::new(-1, 4));
        assert!(!HardSoftScore::hard(-1).is_feasible());
        assert!(HardSoftScore::soft(-1).is_feasible());
    }

    #[test]
    fn test_add_sub_round_trip_is_exact() {
        let base = HardMediumSoftScore::new(-2, 3, -7);
        let impact = HardMediumSoftScore::new(-1, 0, 4).mul(3);
        assert_eq!((base + impact) - impact, base);
        assert_eq!(-impact + impact, HardMediumSoftScore::null_score());
        assert!((impact - impact).is_zero());
    }

    #[test]
    fn test_decimal_multiplication() {
        let weight = Decimal::from_str("0.5").unwrap();
        assert_eq!(SimpleScore::new(3).mul_decimal(weight), SimpleScore::new(2));
        assert_eq!(
            SimpleDecimalScore::new(Decimal::from(3)).mul_decimal(weight),
            SimpleDecimalScore::new(Decimal::from_str("1.5").unwrap())
        );
        assert_eq!(
            HardSoftDecimalScore::soft(Decimal::ONE).mul(4).as_list(),
            vec![Decimal::ZERO, Decimal::from(4)]
        );
    }

    #[test]
    fn test_fields_match_levels() {
        assert_eq!(HardSoftScore::get_fields().len(), HardSoftScore::null_score().as_list().len());
        assert_eq!(
            HardMediumSoftScore::get_fields().len(),
            HardMediumSoftScore::null_score().as_list().len()
        );
    }
}

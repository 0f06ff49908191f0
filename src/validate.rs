//! Field validation for records sent to the device.
//!
//! The codec never owns a validator. Callers pass one into each encode call, so
//! alternative rule sets (stricter firmware, test doubles) can be swapped in per call.

use std::{fmt, ops::RangeInclusive};
use thiserror::Error;

use crate::protocol::UserInfo;

/// One field that broke a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Field name
    pub field: &'static str,
    /// Offending value
    pub value: i64,
    /// Rule the value broke
    pub rule: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.field, self.value, self.rule)
    }
}

/// A record broke one or more rules; every failing field is listed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Validation failed: {}", describe(.violations))]
pub struct ValidationError {
    /// All violations, in field order
    pub violations: Vec<FieldViolation>,
}

fn describe(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    /// Names of all failing fields
    #[must_use]
    pub fn fields(&self) -> Vec<&'static str> {
        self.violations.iter().map(|v| v.field).collect()
    }

    /// Whether `field` is among the violations
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

/// Validation capability consumed by the codec
pub trait Validate<R: ?Sized> {
    /// Check `record`, reporting every violation at once
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] listing every field that broke a rule.
    fn validate(&self, record: &R) -> Result<(), ValidationError>;
}

/// Accumulates violations across a record
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    /// Record a violation if `value` is outside `range`
    pub fn check_range(&mut self, field: &'static str, value: u8, range: RangeInclusive<u8>) {
        if !range.contains(&value) {
            self.0.push(FieldViolation {
                field,
                value: i64::from(value),
                rule: format!("must be in {}..={}", range.start(), range.end()),
            });
        }
    }

    /// Record a violation if `value` is not 0 or 1
    pub fn check_flag(&mut self, field: &'static str, value: u8) {
        self.check_range(field, value, 0..=1);
    }

    /// Record a violation if `value` is not strictly less than `other`
    pub fn check_less_than(
        &mut self,
        field: &'static str,
        value: u8,
        other_field: &'static str,
        other: u8,
    ) {
        if value >= other {
            self.0.push(FieldViolation {
                field,
                value: i64::from(value),
                rule: format!("must be less than {other_field} ({other})"),
            });
        }
    }

    /// Finish checking
    ///
    /// # Errors
    ///
    /// Returns every collected violation as one [`ValidationError`].
    pub fn finish(self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { violations: self.0 })
        }
    }
}

/// Default rules the firmware enforces for [`UserInfo`]
#[derive(Debug, Clone, Copy, Default)]
pub struct UserInfoRules;

impl Validate<UserInfo> for UserInfoRules {
    fn validate(&self, info: &UserInfo) -> Result<(), ValidationError> {
        let mut v = Violations::default();
        v.check_flag("gender", info.gender);
        v.check_flag("unit_type", info.unit_type);
        v.check_flag("hr_display_type", info.hr_display_type);
        v.check_flag("display_orientation", info.display_orientation);
        v.check_flag("workout_display_mode", info.workout_display_mode);
        v.check_flag("adl_goal_mode", info.adl_goal_mode);
        v.check_flag("workout_recording", info.workout_recording);
        v.check_flag("hr_auto_adjust", info.hr_auto_adjust);
        v.check_range("body_weight", info.body_weight, 20..=200);
        v.check_range("body_height", info.body_height, 69..=231);
        v.check_range("resting_hr", info.resting_hr, 30..=140);
        v.check_less_than("resting_hr", info.resting_hr, "max_hr", info.max_hr);
        v.check_range("max_hr", info.max_hr, 80..=220);
        v.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn valid() -> UserInfo {
        UserInfo {
            birthday: NaiveDate::from_ymd_opt(1985, 6, 15).unwrap(),
            body_weight: 75,
            body_height: 180,
            resting_hr: 60,
            max_hr: 190,
            ..UserInfo::default()
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(UserInfoRules.validate(&valid()).is_ok());
    }

    #[test]
    fn test_range_boundaries() {
        let mut info = valid();
        info.body_weight = 20;
        info.body_height = 231;
        info.resting_hr = 30;
        info.max_hr = 80;
        assert!(UserInfoRules.validate(&info).is_ok());

        info.body_weight = 19;
        info.body_height = 232;
        let err = UserInfoRules.validate(&info).unwrap_err();
        assert_eq!(err.fields(), vec!["body_weight", "body_height"]);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let info = UserInfo {
            gender: 2,
            hr_auto_adjust: 7,
            body_weight: 5,
            body_height: 250,
            resting_hr: 150,
            max_hr: 60,
            ..valid()
        };
        let err = UserInfoRules.validate(&info).unwrap_err();
        assert_eq!(
            err.fields(),
            vec![
                "gender",
                "hr_auto_adjust",
                "body_weight",
                "body_height",
                "resting_hr",
                "resting_hr",
                "max_hr"
            ]
        );
        let message = err.to_string();
        assert!(message.contains("gender=2"));
        assert!(message.contains("must be less than max_hr (60)"));
    }

    #[test]
    fn test_resting_must_be_below_max() {
        let info = UserInfo {
            resting_hr: 120,
            max_hr: 120,
            ..valid()
        };
        let err = UserInfoRules.validate(&info).unwrap_err();
        assert_eq!(err.fields(), vec!["resting_hr"]);
    }
}

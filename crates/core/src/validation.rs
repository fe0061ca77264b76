//! Job parameter validation, run once before any step of a job executes.

use std::collections::BTreeSet;

use crate::error::{ValidationError, ValidationResult};
use crate::parameters::JobParameters;

/// Rejects a job run whose parameters break a rule.
pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, parameters: &JobParameters) -> ValidationResult;
}

impl<F> JobParametersValidator for F
where
    F: Fn(&JobParameters) -> ValidationResult + Send + Sync,
{
    fn validate(&self, parameters: &JobParameters) -> ValidationResult {
        self(parameters)
    }
}

/// Presence check against required and optional key lists.
///
/// Missing required keys are rejected. Keys outside both lists are ignored
/// (they are neither required nor rejected).
#[derive(Debug, Clone, Default)]
pub struct DefaultJobParametersValidator {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl DefaultJobParametersValidator {
    pub fn new<R, O>(required: R, optional: O) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            optional: optional.into_iter().map(Into::into).collect(),
        }
    }

    pub fn required_keys(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn optional_keys(&self) -> impl Iterator<Item = &str> {
        self.optional.iter().map(String::as_str)
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> ValidationResult {
        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|key| !parameters.contains_key(key))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingKeys(missing))
        }
    }
}

/// Runs validators in order; the first failure wins.
#[derive(Default)]
pub struct CompositeJobParametersValidator {
    validators: Vec<Box<dyn JobParametersValidator>>,
}

impl CompositeJobParametersValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl JobParametersValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

impl JobParametersValidator for CompositeJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> ValidationResult {
        for validator in &self.validators {
            validator.validate(parameters)?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for CompositeJobParametersValidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompositeJobParametersValidator")
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl JobParametersValidator for NoopValidator {
    fn validate(&self, _parameters: &JobParameters) -> ValidationResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digit_validator(parameters: &JobParameters) -> ValidationResult {
        let a = parameters
            .get_long("a")
            .ok_or_else(|| ValidationError::invalid("a", "must be a long"))?;
        if !(0..=9).contains(&a) {
            return Err(ValidationError::invalid("a", format!("{a} is outside [0, 9]")));
        }
        Ok(())
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let validator = DefaultJobParametersValidator::new(["a"], ["b"]);
        let params = JobParameters::builder().add_long("b", 1).build();
        assert_eq!(
            validator.validate(&params),
            Err(ValidationError::MissingKeys(vec!["a".to_string()]))
        );
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let validator = DefaultJobParametersValidator::new(["a"], ["b"]);
        let params = JobParameters::builder()
            .add_long("a", 1)
            .add_string("unlisted", "x")
            .build();
        assert!(validator.validate(&params).is_ok());
    }

    #[test]
    fn closures_act_as_custom_validators() {
        let ok = JobParameters::builder().add_long("a", 9).build();
        let too_big = JobParameters::builder().add_long("a", 10).build();
        assert!(digit_validator.validate(&ok).is_ok());
        assert!(matches!(
            digit_validator.validate(&too_big),
            Err(ValidationError::InvalidValue { name, .. }) if name == "a"
        ));
    }

    #[test]
    fn composite_stops_at_first_failure() {
        let composite = CompositeJobParametersValidator::new()
            .with(DefaultJobParametersValidator::new(["a"], Vec::<String>::new()))
            .with(digit_validator);

        let missing = JobParameters::new();
        assert!(matches!(composite.validate(&missing), Err(ValidationError::MissingKeys(_))));

        let out_of_range = JobParameters::builder().add_long("a", 42).build();
        assert!(matches!(
            composite.validate(&out_of_range),
            Err(ValidationError::InvalidValue { .. })
        ));

        let fine = JobParameters::builder().add_long("a", 3).build();
        assert!(composite.validate(&fine).is_ok());
    }
}

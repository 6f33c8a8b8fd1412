//! Validation System - Rule/Policy Separation
//!
//! Rules produce structured violations. Errors block a job before any file
//! or process work happens; warnings are carried along with the result.

use serde::{Deserialize, Serialize};

use crate::model::{check_printability, ModelBounds};
use crate::profile::{PrinterProfile, QuoteParameters};
use crate::staging::is_single_component;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity: ViolationSeverity::Error,
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn expected(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    fn remedy(mut self, remediation: &str) -> Self {
        self.remediation.push(remediation.to_string());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Warning)
    }

    /// `rule: message` for each error, joined with `; `.
    pub fn error_summary(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Everything the rules look at for one job.
#[derive(Debug, Clone, Copy)]
pub struct JobInput<'a> {
    pub identity: &'a str,
    pub model_filename: &'a str,
    pub model_size: usize,
    pub profile: &'a PrinterProfile,
    pub params: &'a QuoteParameters,
    pub bounds: Option<&'a ModelBounds>,
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct IdentityRule;

impl ValidationRule for IdentityRule {
    fn name(&self) -> &'static str { "identity" }

    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation> {
        if is_single_component(input.identity) {
            return vec![];
        }
        vec![ValidationViolation::error(self.name(), "Identity cannot be used as a directory name")
            .expected("single path component", format!("{:?}", input.identity))]
    }
}

pub struct ModelFileRule;

impl ValidationRule for ModelFileRule {
    fn name(&self) -> &'static str { "model_file" }

    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let name = input.model_filename;

        if !is_single_component(name) || !name.to_ascii_lowercase().ends_with(".stl") {
            violations.push(
                ValidationViolation::error(self.name(), "File must be an STL")
                    .expected("*.stl", name)
                    .remedy("Export the model as STL"),
            );
        }
        if input.model_size == 0 {
            violations.push(ValidationViolation::error(self.name(), "Model file is empty"));
        }
        violations
    }
}

pub struct ProfileRangeRule;

impl ValidationRule for ProfileRangeRule {
    fn name(&self) -> &'static str { "profile_ranges" }

    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation> {
        let p = input.profile;
        let mut violations = vec![];

        let positive = [
            ("bed_size_x", p.bed_size_x),
            ("bed_size_y", p.bed_size_y),
            ("bed_size_z", p.bed_size_z),
            ("print_speed", p.print_speed),
            ("first_layer_speed", p.first_layer_speed),
            ("nozzle_diameter", p.nozzle_diameter),
            ("layer_height", p.layer_height),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{field} must be positive"))
                        .expected("> 0", value.to_string()),
                );
            }
        }

        if p.layer_height > p.nozzle_diameter {
            violations.push(
                ValidationViolation::error(self.name(), "Layer height exceeds nozzle diameter")
                    .expected(format!("<= {}", p.nozzle_diameter), p.layer_height.to_string())
                    .remedy("Lower layer_height or use a larger nozzle"),
            );
        }

        if p.fill_density > 100 {
            violations.push(
                ValidationViolation::error(self.name(), "Infill density out of range")
                    .expected("0-100", p.fill_density.to_string()),
            );
        }
        violations
    }
}

pub struct QuoteParametersRule;

impl ValidationRule for QuoteParametersRule {
    fn name(&self) -> &'static str { "quote_parameters" }

    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation> {
        let q = input.params;
        let mut violations = vec![];

        for (field, value) in [
            ("base_price", q.base_price),
            ("cost_per_hour", q.cost_per_hour),
            ("cost_per_gram", q.cost_per_gram),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                violations.push(
                    ValidationViolation::error(self.name(), format!("{field} must not be negative"))
                        .expected(">= 0", value.to_string()),
                );
            }
        }

        if q.currency.is_empty() || !q.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            violations.push(
                ValidationViolation::error(self.name(), "Currency must be an alphabetic code")
                    .expected("e.g. USD", q.currency.clone()),
            );
        }
        violations
    }
}

/// Model extents against the printer volume. Blocking only when enforced.
pub struct BuildVolumeRule {
    pub enforce: bool,
}

impl ValidationRule for BuildVolumeRule {
    fn name(&self) -> &'static str { "build_volume" }

    fn validate(&self, input: &JobInput<'_>) -> Vec<ValidationViolation> {
        let Some(bounds) = input.bounds else {
            return vec![];
        };
        let result = check_printability(bounds, input.profile);
        if result.printable {
            return vec![];
        }

        let axes: Vec<String> = result.exceeded_dimensions.iter().map(|a| a.to_string()).collect();
        let [mx, my, mz] = result.model_dimensions;
        let [px, py, pz] = result.printer_dimensions;
        let mut violation = ValidationViolation::error(
            self.name(),
            format!("Model exceeds build volume along {}", axes.join(", ")),
        )
        .expected(format!("{px}x{py}x{pz}"), format!("{mx:.2}x{my:.2}x{mz:.2}"))
        .remedy("Scale the model down or split it into parts");
        if !self.enforce {
            violation.severity = ViolationSeverity::Warning;
        }
        vec![violation]
    }
}

/// Validator orchestrates rules
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new(enforce_build_volume: bool) -> Self {
        Self {
            rules: vec![
                Box::new(IdentityRule),
                Box::new(ModelFileRule),
                Box::new(ProfileRangeRule),
                Box::new(QuoteParametersRule),
                Box::new(BuildVolumeRule {
                    enforce: enforce_build_volume,
                }),
            ],
        }
    }

    pub fn with_rules(rules: Vec<Box<dyn ValidationRule>>) -> Self {
        Self { rules }
    }

    /// Rules for storing a model before it is sliced.
    pub fn upload() -> Self {
        Self::with_rules(vec![Box::new(IdentityRule), Box::new(ModelFileRule)])
    }

    /// Rules for pricing an existing engine output; no model is involved.
    pub fn pricing(check_identity: bool) -> Self {
        let mut rules: Vec<Box<dyn ValidationRule>> = vec![Box::new(QuoteParametersRule)];
        if check_identity {
            rules.insert(0, Box::new(IdentityRule));
        }
        Self::with_rules(rules)
    }

    pub fn validate(&self, input: &JobInput<'_>) -> ValidationResult {
        let mut violations = vec![];
        for rule in &self.rules {
            violations.extend(rule.validate(input));
        }
        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);
        ValidationResult { valid, violations }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(true)
    }
}

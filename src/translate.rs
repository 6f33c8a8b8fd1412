//! Profile Translator
//!
//! Expands a [`PrinterProfile`] into the full engine configuration. Layers are
//! applied in a fixed order and the last writer for a key wins:
//!
//! 1. baseline template
//! 2. bed geometry
//! 3. speed family derived from `print_speed`
//! 4. material profile
//! 5. profile fields named verbatim in the baseline
//! 6. support flag and infill percentage
//! 7. first layer temperatures derived from the profile temperatures

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hashing::sha256_hex;
use crate::profile::{MaterialProfile, PrinterProfile};

/// Multipliers applied to `print_speed` for each engine speed key.
pub const SPEED_RATIOS: &[(&str, f64)] = &[
    ("perimeter_speed", 0.8),
    ("small_perimeter_speed", 0.5),
    ("external_perimeter_speed", 0.6),
    ("infill_speed", 1.2),
    ("solid_infill_speed", 0.8),
    ("support_material_speed", 0.8),
    ("bridge_speed", 0.5),
    ("travel_speed", 2.0),
    ("first_layer_speed", 0.5),
];

pub const FIRST_LAYER_TEMPERATURE_FACTOR: f64 = 1.05;
pub const FIRST_LAYER_BED_TEMPERATURE_FACTOR: f64 = 1.25;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Baseline template not found at {0}")]
    TemplateMissing(PathBuf),

    #[error("Failed to read baseline template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Baseline template is not a JSON object of settings: {0}")]
    TemplateInvalid(String),

    #[error("Failed to write engine config to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which layer last wrote a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingSource {
    /// Baseline template value.
    Baseline,
    /// Material profile default.
    Material,
    /// Copied from the printer profile.
    Profile,
    /// Computed from profile fields.
    Derived,
}

/// Typed engine setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Int(i64),
    Float(f64),
    /// Written as `1` / `0`.
    Flag(bool),
    Text(String),
}

impl SettingValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            SettingValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Int(v) => Some(*v as f64),
            SettingValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn from_json(key: &str, value: &Value) -> Result<Self, TranslateError> {
        match value {
            Value::Bool(b) => Ok(SettingValue::Flag(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(SettingValue::Int)
                .or_else(|| n.as_f64().map(SettingValue::Float))
                .ok_or_else(|| TranslateError::TemplateInvalid(format!("{key}: {n}"))),
            Value::String(s) => Ok(SettingValue::Text(s.clone())),
            other => Err(TranslateError::TemplateInvalid(format!(
                "{key}: unsupported value {other}"
            ))),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Int(v) => write!(f, "{v}"),
            SettingValue::Float(v) => write!(f, "{v}"),
            SettingValue::Flag(true) => f.write_str("1"),
            SettingValue::Flag(false) => f.write_str("0"),
            SettingValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: SettingValue,
    pub source: SettingSource,
}

/// Ordered engine configuration.
///
/// Keys keep the position of their first insertion; overrides replace the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    settings: Vec<Setting>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: SettingValue, source: SettingSource) {
        match self.settings.iter_mut().find(|s| s.key == key) {
            Some(existing) => {
                existing.value = value;
                existing.source = source;
            }
            None => self.settings.push(Setting {
                key: key.to_string(),
                value,
                source,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.setting(key).map(|s| &s.value)
    }

    pub fn setting(&self, key: &str) -> Option<&Setting> {
        self.settings.iter().find(|s| s.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.setting(key).is_some()
    }

    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Engine key-value text, one `key = value` per line.
    pub fn to_ini(&self) -> String {
        let mut out = String::new();
        for setting in &self.settings {
            out.push_str(&setting.key);
            out.push_str(" = ");
            out.push_str(&setting.value.to_string());
            out.push('\n');
        }
        out
    }

    /// SHA-256 of the serialized text.
    pub fn content_hash(&self) -> String {
        sha256_hex(self.to_ini().as_bytes())
    }

    /// Write the config to `path`, replacing any previous file.
    pub fn persist(&self, path: &Path) -> Result<(), TranslateError> {
        fs::write(path, self.to_ini()).map_err(|source| TranslateError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), settings = self.len(), "Wrote engine config");
        Ok(())
    }
}

/// Baseline settings every translation starts from.
#[derive(Debug, Clone)]
pub struct BaselineTemplate {
    config: EngineConfig,
}

impl BaselineTemplate {
    /// Load the template from a JSON object file.
    ///
    /// A missing template is a deployment defect; callers treat the error as
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self, TranslateError> {
        if !path.exists() {
            return Err(TranslateError::TemplateMissing(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| TranslateError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, TranslateError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| TranslateError::TemplateInvalid(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(TranslateError::TemplateInvalid(
                "top level must be an object".to_string(),
            ));
        };

        let mut config = EngineConfig::new();
        for (key, value) in &map {
            config.set(key, SettingValue::from_json(key, value)?, SettingSource::Baseline);
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Maps printer profiles onto the baseline template.
#[derive(Debug, Clone)]
pub struct ProfileTranslator {
    baseline: BaselineTemplate,
}

impl ProfileTranslator {
    pub fn new(baseline: BaselineTemplate) -> Self {
        Self { baseline }
    }

    pub fn baseline(&self) -> &BaselineTemplate {
        &self.baseline
    }

    pub fn translate(&self, profile: &PrinterProfile) -> EngineConfig {
        let mut config = self.baseline.config().clone();

        config.set(
            "bed_shape",
            SettingValue::Text(bed_shape(profile.bed_size_x, profile.bed_size_y)),
            SettingSource::Derived,
        );
        config.set(
            "max_print_height",
            number(profile.bed_size_z),
            SettingSource::Profile,
        );

        for (key, ratio) in SPEED_RATIOS {
            let speed = (profile.print_speed * ratio).round() as i64;
            config.set(key, SettingValue::Int(speed), SettingSource::Derived);
        }

        if !profile.filament_type.is_known() {
            warn!(
                filament = %profile.filament_type,
                "Unknown filament type, using PLA material profile"
            );
        }
        apply_material(&mut config, profile.filament_type.material());

        for (key, value) in direct_fields(profile) {
            if self.baseline.config().contains(key) {
                config.set(key, value, SettingSource::Profile);
            }
        }

        config.set(
            "support_material",
            SettingValue::Flag(profile.support_material),
            SettingSource::Profile,
        );
        config.set(
            "fill_density",
            SettingValue::Text(format!("{}%", profile.fill_density)),
            SettingSource::Profile,
        );

        config.set(
            "first_layer_temperature",
            SettingValue::Int(scaled(profile.temperature, FIRST_LAYER_TEMPERATURE_FACTOR)),
            SettingSource::Derived,
        );
        config.set(
            "first_layer_bed_temperature",
            SettingValue::Int(scaled(
                profile.bed_temperature,
                FIRST_LAYER_BED_TEMPERATURE_FACTOR,
            )),
            SettingSource::Derived,
        );

        debug!(
            filament = %profile.filament_type,
            settings = config.len(),
            "Translated printer profile"
        );
        config
    }
}

/// Rectangle corners `(0,0),(x,0),(x,y),(0,y)` in engine notation.
pub fn bed_shape(x: f64, y: f64) -> String {
    format!("0x0,{x}x0,{x}x{y},0x{y}")
}

fn scaled(value: u32, factor: f64) -> i64 {
    (f64::from(value) * factor).round() as i64
}

fn number(value: f64) -> SettingValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        SettingValue::Int(value as i64)
    } else {
        SettingValue::Float(value)
    }
}

fn apply_material(config: &mut EngineConfig, material: &MaterialProfile) {
    let layer = [
        ("filament_type", SettingValue::Text(material.filament_type.to_string())),
        ("temperature", SettingValue::Int(i64::from(material.temperature))),
        (
            "first_layer_temperature",
            SettingValue::Int(i64::from(material.first_layer_temperature)),
        ),
        ("bed_temperature", SettingValue::Int(i64::from(material.bed_temperature))),
        (
            "first_layer_bed_temperature",
            SettingValue::Int(i64::from(material.first_layer_bed_temperature)),
        ),
        ("fan_always_on", SettingValue::Flag(material.fan_always_on)),
        (
            "fan_below_layer_time",
            SettingValue::Int(i64::from(material.fan_below_layer_time)),
        ),
        ("filament_density", SettingValue::Float(material.filament_density)),
        ("filament_cost", number(material.filament_cost)),
        ("filament_diameter", SettingValue::Float(material.filament_diameter)),
    ];
    for (key, value) in layer {
        config.set(key, value, SettingSource::Material);
    }
}

/// Profile fields that map one-to-one onto engine keys of the same name.
fn direct_fields(profile: &PrinterProfile) -> [(&'static str, SettingValue); 8] {
    [
        ("nozzle_diameter", SettingValue::Float(profile.nozzle_diameter)),
        ("layer_height", SettingValue::Float(profile.layer_height)),
        ("perimeters", SettingValue::Int(i64::from(profile.perimeters))),
        ("top_solid_layers", SettingValue::Int(i64::from(profile.top_solid_layers))),
        (
            "bottom_solid_layers",
            SettingValue::Int(i64::from(profile.bottom_solid_layers)),
        ),
        ("temperature", SettingValue::Int(i64::from(profile.temperature))),
        ("bed_temperature", SettingValue::Int(i64::from(profile.bed_temperature))),
        ("first_layer_speed", number(profile.first_layer_speed)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::FilamentType;

    const BASELINE: &str = r#"{
        "bed_shape": "0x0,200x0,200x200,0x200",
        "max_print_height": 200,
        "layer_height": 0.3,
        "perimeters": 3,
        "temperature": 200,
        "first_layer_speed": 15,
        "fill_density": "15%",
        "gcode_flavor": "marlin2"
    }"#;

    fn translator() -> ProfileTranslator {
        ProfileTranslator::new(BaselineTemplate::from_json(BASELINE).unwrap())
    }

    #[test]
    fn test_bed_geometry() {
        let profile = PrinterProfile {
            bed_size_x: 180.0,
            bed_size_y: 180.0,
            bed_size_z: 180.5,
            ..Default::default()
        };
        let config = translator().translate(&profile);
        assert_eq!(
            config.get("bed_shape"),
            Some(&SettingValue::Text("0x0,180x0,180x180,0x180".to_string()))
        );
        assert_eq!(config.get("max_print_height"), Some(&SettingValue::Float(180.5)));
    }

    #[test]
    fn test_speed_family() {
        let profile = PrinterProfile {
            print_speed: 55.0,
            ..Default::default()
        };
        let config = translator().translate(&profile);
        assert_eq!(config.get("perimeter_speed").and_then(SettingValue::as_i64), Some(44));
        assert_eq!(config.get("infill_speed").and_then(SettingValue::as_i64), Some(66));
        assert_eq!(config.get("travel_speed").and_then(SettingValue::as_i64), Some(110));
        // 27.5 rounds away from zero
        assert_eq!(config.get("bridge_speed").and_then(SettingValue::as_i64), Some(28));
    }

    #[test]
    fn test_explicit_first_layer_speed_wins_when_in_baseline() {
        let profile = PrinterProfile {
            print_speed: 100.0,
            first_layer_speed: 22.0,
            ..Default::default()
        };
        let config = translator().translate(&profile);
        let setting = config.setting("first_layer_speed").unwrap();
        assert_eq!(setting.value.as_i64(), Some(22));
        assert_eq!(setting.source, SettingSource::Profile);
    }

    #[test]
    fn test_fields_absent_from_baseline_are_not_added() {
        let config = translator().translate(&PrinterProfile::default());
        assert!(!config.contains("top_solid_layers"));
        assert!(!config.contains("nozzle_diameter"));
        assert_eq!(config.get("perimeters").and_then(SettingValue::as_i64), Some(2));
    }

    #[test]
    fn test_flags_and_percentages() {
        let profile = PrinterProfile {
            support_material: true,
            fill_density: 35,
            ..Default::default()
        };
        let ini = translator().translate(&profile).to_ini();
        assert!(ini.contains("support_material = 1\n"));
        assert!(ini.contains("fill_density = 35%\n"));
    }

    #[test]
    fn test_derived_first_layer_temperatures_beat_material() {
        let profile = PrinterProfile {
            filament_type: FilamentType::Abs,
            temperature: 250,
            bed_temperature: 90,
            ..Default::default()
        };
        let config = translator().translate(&profile);
        assert_eq!(config.get("first_layer_temperature").and_then(SettingValue::as_i64), Some(263));
        assert_eq!(
            config.get("first_layer_bed_temperature").and_then(SettingValue::as_i64),
            Some(113)
        );
        assert_eq!(
            config.setting("first_layer_temperature").unwrap().source,
            SettingSource::Derived
        );
        assert_eq!(config.get("filament_type"), Some(&SettingValue::Text("ABS".to_string())));
        // material default is replaced by the profile value
        assert_eq!(config.get("temperature").and_then(SettingValue::as_i64), Some(250));
    }

    #[test]
    fn test_baseline_order_preserved() {
        let ini = translator().translate(&PrinterProfile::default()).to_ini();
        let first = ini.lines().next().unwrap();
        assert!(first.starts_with("bed_shape = "));
        assert!(ini.contains("gcode_flavor = marlin2\n"));
    }

    #[test]
    fn test_missing_template_is_reported() {
        let err =
            BaselineTemplate::load(Path::new("/nonexistent/default_config.json")).unwrap_err();
        assert!(matches!(err, TranslateError::TemplateMissing(_)));
    }

    #[test]
    fn test_template_must_be_object() {
        let err = BaselineTemplate::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, TranslateError::TemplateInvalid(_)));
    }

    #[test]
    fn test_translation_deterministic() {
        let t = translator();
        let profile = PrinterProfile::default();
        assert_eq!(t.translate(&profile).content_hash(), t.translate(&profile).content_hash());
    }
}

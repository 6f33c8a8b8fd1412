//! Printer, material and quote inputs.
//!
//! Everything a caller submits for a job lives here. All fields carry
//! defaults so a partial JSON payload deserializes into a complete profile.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User-facing printer profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterProfile {
    /// Bed width in mm.
    pub bed_size_x: f64,
    /// Bed depth in mm.
    pub bed_size_y: f64,
    /// Maximum print height in mm.
    pub bed_size_z: f64,
    /// Base print speed in mm/s. Per-feature speeds are derived from it.
    pub print_speed: f64,
    /// First layer speed in mm/s.
    pub first_layer_speed: f64,
    pub nozzle_diameter: f64,
    pub layer_height: f64,
    pub perimeters: u32,
    pub top_solid_layers: u32,
    pub bottom_solid_layers: u32,
    /// Infill density in percent (0-100).
    pub fill_density: u8,
    pub support_material: bool,
    pub filament_type: FilamentType,
    /// Nozzle temperature in °C.
    pub temperature: u32,
    /// Bed temperature in °C.
    pub bed_temperature: u32,
}

impl Default for PrinterProfile {
    fn default() -> Self {
        Self {
            bed_size_x: 250.0,
            bed_size_y: 210.0,
            bed_size_z: 210.0,
            print_speed: 60.0,
            first_layer_speed: 30.0,
            nozzle_diameter: 0.4,
            layer_height: 0.2,
            perimeters: 2,
            top_solid_layers: 3,
            bottom_solid_layers: 3,
            fill_density: 20,
            support_material: false,
            filament_type: FilamentType::Pla,
            temperature: 210,
            bed_temperature: 60,
        }
    }
}

impl PrinterProfile {
    /// Build volume as `[x, y, z]`.
    pub fn build_volume(&self) -> [f64; 3] {
        [self.bed_size_x, self.bed_size_y, self.bed_size_z]
    }
}

/// Filament material.
///
/// Unknown labels are kept verbatim so they can be reported, and resolve to
/// the PLA material profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilamentType {
    Pla,
    Petg,
    Abs,
    Other(String),
}

impl FilamentType {
    pub fn as_str(&self) -> &str {
        match self {
            FilamentType::Pla => "PLA",
            FilamentType::Petg => "PETG",
            FilamentType::Abs => "ABS",
            FilamentType::Other(label) => label,
        }
    }

    /// Material profile for this filament, falling back to PLA.
    pub fn material(&self) -> &'static MaterialProfile {
        match self {
            FilamentType::Petg => &PETG,
            FilamentType::Abs => &ABS,
            FilamentType::Pla | FilamentType::Other(_) => &PLA,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, FilamentType::Other(_))
    }
}

impl From<String> for FilamentType {
    fn from(label: String) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "PLA" => FilamentType::Pla,
            "PETG" => FilamentType::Petg,
            "ABS" => FilamentType::Abs,
            _ => FilamentType::Other(label),
        }
    }
}

impl From<&str> for FilamentType {
    fn from(label: &str) -> Self {
        FilamentType::from(label.to_string())
    }
}

impl From<FilamentType> for String {
    fn from(filament: FilamentType) -> Self {
        filament.as_str().to_string()
    }
}

impl fmt::Display for FilamentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed per-material engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialProfile {
    pub filament_type: &'static str,
    pub temperature: u32,
    pub first_layer_temperature: u32,
    pub bed_temperature: u32,
    pub first_layer_bed_temperature: u32,
    pub fan_always_on: bool,
    /// Seconds.
    pub fan_below_layer_time: u32,
    /// g/cm³.
    pub filament_density: f64,
    /// Cost per kg.
    pub filament_cost: f64,
    /// mm.
    pub filament_diameter: f64,
}

pub static PLA: MaterialProfile = MaterialProfile {
    filament_type: "PLA",
    temperature: 210,
    first_layer_temperature: 215,
    bed_temperature: 60,
    first_layer_bed_temperature: 75,
    fan_always_on: true,
    fan_below_layer_time: 60,
    filament_density: 1.24,
    filament_cost: 25.0,
    filament_diameter: 1.75,
};

pub static PETG: MaterialProfile = MaterialProfile {
    filament_type: "PETG",
    temperature: 230,
    first_layer_temperature: 230,
    bed_temperature: 70,
    first_layer_bed_temperature: 80,
    fan_always_on: true,
    fan_below_layer_time: 60,
    filament_density: 1.27,
    filament_cost: 30.0,
    filament_diameter: 1.75,
};

pub static ABS: MaterialProfile = MaterialProfile {
    filament_type: "ABS",
    temperature: 240,
    first_layer_temperature: 240,
    bed_temperature: 100,
    first_layer_bed_temperature: 100,
    fan_always_on: false,
    fan_below_layer_time: 60,
    filament_density: 1.04,
    filament_cost: 25.0,
    filament_diameter: 1.75,
};

/// Pricing inputs for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteParameters {
    pub currency: String,
    pub cost_per_hour: f64,
    pub cost_per_gram: f64,
    pub base_price: f64,
}

impl Default for QuoteParameters {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            cost_per_hour: 1.0,
            cost_per_gram: 0.1,
            base_price: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_profile_uses_defaults() {
        let profile: PrinterProfile =
            serde_json::from_str(r#"{"bed_size_x": 300, "filament_type": "petg"}"#).unwrap();
        assert_eq!(profile.bed_size_x, 300.0);
        assert_eq!(profile.bed_size_y, 210.0);
        assert_eq!(profile.filament_type, FilamentType::Petg);
        assert_eq!(profile.temperature, 210);
    }

    #[test]
    fn test_unknown_filament_falls_back_to_pla() {
        let filament = FilamentType::from("NYLON");
        assert!(!filament.is_known());
        assert_eq!(filament.as_str(), "NYLON");
        assert_eq!(filament.material().filament_type, "PLA");
    }

    #[test]
    fn test_filament_serializes_as_label() {
        let json = serde_json::to_string(&FilamentType::Abs).unwrap();
        assert_eq!(json, r#""ABS""#);
    }
}

//! Contract Invariant Tests
//!
//! These tests verify the guarantees the web tier relies on.

use slicequote_core::{
    duration_to_seconds, parse_metrics, price,
    translate::bed_shape,
    BaselineTemplate, FilamentType, PrintMetrics, PrinterProfile, ProfileTranslator,
    QuoteParameters, SettingSource, SettingValue, Workspace,
};

const BASELINE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/default_config.json");

fn translator() -> ProfileTranslator {
    ProfileTranslator::new(BaselineTemplate::load(BASELINE.as_ref()).unwrap())
}

#[test]
fn invariant_bed_geometry_follows_profile() {
    let profile = PrinterProfile {
        bed_size_x: 300.0,
        bed_size_y: 220.5,
        bed_size_z: 180.0,
        ..Default::default()
    };
    let config = translator().translate(&profile);

    assert_eq!(config.get("max_print_height").and_then(|v| v.as_f64()), Some(180.0));
    assert_eq!(
        config.get("bed_shape"),
        Some(&SettingValue::Text("0x0,300x0,300x220.5,0x220.5".to_string()))
    );
    assert_eq!(bed_shape(300.0, 220.5), "0x0,300x0,300x220.5,0x220.5");
}

#[test]
fn invariant_first_layer_temperatures_are_derived_for_every_material() {
    let translator = translator();
    for (filament, temperature, bed) in [
        (FilamentType::Pla, 205, 55),
        (FilamentType::Abs, 245, 105),
        (FilamentType::Petg, 235, 75),
    ] {
        let profile = PrinterProfile {
            filament_type: filament.clone(),
            temperature,
            bed_temperature: bed,
            ..Default::default()
        };
        let config = translator.translate(&profile);

        let expected_first = (f64::from(temperature) * 1.05).round() as i64;
        let expected_bed = (f64::from(bed) * 1.25).round() as i64;
        assert_eq!(
            config.get("first_layer_temperature").and_then(|v| v.as_i64()),
            Some(expected_first),
            "{filament}"
        );
        assert_eq!(
            config.get("first_layer_bed_temperature").and_then(|v| v.as_i64()),
            Some(expected_bed),
            "{filament}"
        );
        assert_eq!(
            config.setting("first_layer_temperature").map(|s| s.source),
            Some(SettingSource::Derived)
        );
    }
}

#[test]
fn invariant_serialized_config_is_one_setting_per_line() {
    let config = translator().translate(&PrinterProfile::default());
    let ini = config.to_ini();
    assert_eq!(ini.lines().count(), config.len());
    assert!(ini.lines().all(|line| line.contains(" = ")));
    assert!(ini.contains("fill_density = 20%\n"));
    assert!(ini.contains("support_material = 0\n"));
}

#[test]
fn invariant_duration_conversion() {
    assert_eq!(duration_to_seconds("36m 28s"), 2188);
    assert_eq!(duration_to_seconds("1h 5m"), 3900);
    assert_eq!(duration_to_seconds("2d"), 172_800);
    assert_eq!(duration_to_seconds(""), 0);
}

#[test]
fn invariant_reference_price() {
    let metrics = PrintMetrics {
        estimated_time_seconds: Some(3600),
        filament_weight_g: Some(100.0),
        ..Default::default()
    };
    let params = QuoteParameters {
        base_price: 5.0,
        cost_per_hour: 2.5,
        cost_per_gram: 0.02,
        currency: "USD".to_string(),
    };
    let quote = price(&metrics, &params);
    assert_eq!(quote.total_price, 9.5);
    assert_eq!(quote.currency, "USD");
    assert_eq!(quote.status.as_str(), "quoted");
}

#[test]
fn invariant_parsing_stops_at_estimated_time() {
    let output = "\
; filament used [g] = 4.54
; estimated printing time (normal mode) = 36m 28s
; filament used [g] = 999
; total filament cost = 12.00
";
    let report = parse_metrics(output);
    assert_eq!(report.metrics.filament_weight_g, Some(4.54));
    assert_eq!(report.metrics.filament_cost, None);
    assert_eq!(report.metrics.estimated_time_seconds, Some(2188));
}

#[test]
fn invariant_staging_is_idempotent_and_cleanup_is_safe() {
    let tmp = tempfile::tempdir().unwrap();
    let ws = Workspace::new(tmp.path());

    let first = ws.stage("user-7").unwrap();
    first.write_file("part.stl", b"solid part").unwrap();
    let second = ws.stage("user-7").unwrap();
    assert_eq!(first.path(), second.path());
    assert_eq!(second.read_file("part.stl").unwrap(), b"solid part");

    ws.cleanup("user-7").unwrap();
    ws.cleanup("user-7").unwrap();
    assert!(!first.path().exists());
}

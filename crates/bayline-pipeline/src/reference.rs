//! Mechanic reference synthesis.
//!
//! Combines platform-independent tables (engine layout → bank count,
//! displacement → typical fluids) with whatever torque and tooling the
//! research pass brought in. Everything here is best-effort orientation for
//! the tech, not gospel.

use std::collections::BTreeMap;

use bayline_types::{Dtc, MechanicReference, RepairPlan, Vehicle};

/// Two exhaust banks for V-layout or ≥6-cylinder engines, one otherwise.
pub fn bank_count(vehicle: &Vehicle) -> u8 {
    let engine = vehicle
        .engine
        .as_deref()
        .unwrap_or("")
        .to_lowercase()
        .replace('-', "");
    if engine.contains("v6") || engine.contains("v8") || engine.contains("v10") {
        return 2;
    }
    for token in engine.split_whitespace() {
        let digits = token.strip_suffix("cylinder").or_else(|| token.strip_suffix("cyl"));
        if let Some(count) = digits.and_then(|n| n.parse::<u8>().ok()) {
            return if count >= 6 { 2 } else { 1 };
        }
    }
    1
}

fn displacement_liters(vehicle: &Vehicle) -> Option<f64> {
    let engine = vehicle.engine.as_deref()?;
    for token in engine.split_whitespace() {
        if let Some(raw) = token.strip_suffix('L').or_else(|| token.strip_suffix('l')) {
            if let Ok(value) = raw.parse::<f64>() {
                return Some(value);
            }
        }
    }
    None
}

fn typical_fluids(vehicle: &Vehicle) -> BTreeMap<String, String> {
    let mut fluids = BTreeMap::new();
    let displacement = displacement_liters(vehicle);
    let oil_quarts = match displacement {
        Some(d) if d <= 1.8 => "4.0 qt",
        Some(d) if d <= 2.5 => "4.5 qt",
        Some(d) if d <= 3.6 => "5.5 qt",
        Some(_) => "6.5 qt",
        None => "4.5 qt (verify capacity)",
    };
    fluids.insert("engine oil".to_string(), format!("{oil_quarts}, grade per door jamb"));

    let coolant = match vehicle.make.as_deref().map(str::to_lowercase).as_deref() {
        Some("honda") | Some("acura") => "Type 2 blue pre-mix",
        Some("toyota") | Some("lexus") => "SLLC pink pre-mix",
        Some("ford") | Some("lincoln") => "Motorcraft yellow",
        Some("gm") | Some("chevrolet") | Some("gmc") => "Dex-Cool orange",
        _ => "manufacturer-spec coolant",
    };
    fluids.insert("coolant".to_string(), coolant.to_string());
    fluids
}

/// Sensor-location callouts for any oxygen-sensor or catalyst codes in play.
fn sensor_locations(vehicle: &Vehicle, dtcs: &[Dtc]) -> Vec<String> {
    let banks = bank_count(vehicle);
    let mut out = Vec::new();
    for code in dtcs {
        match code.as_str() {
            "P0420" | "P0136" | "P0137" | "P0138" | "P0141" => out.push(
                "Bank 1 Sensor 2: downstream of the catalytic converter, cylinder #1 side"
                    .to_string(),
            ),
            "P0430" | "P0156" | "P0157" | "P0158" | "P0161" => out.push(
                "Bank 2 Sensor 2: downstream of the catalytic converter, opposite cylinder #1"
                    .to_string(),
            ),
            "P0130" | "P0131" | "P0132" | "P0133" | "P0135" => out.push(
                "Bank 1 Sensor 1: upstream, in the exhaust manifold or downpipe".to_string(),
            ),
            _ => {}
        }
    }
    if out.is_empty() && banks == 2 {
        out.push("V-layout engine: Bank 1 is the cylinder #1 side".to_string());
    }
    out.dedup();
    out
}

pub fn build_reference(vehicle: &Vehicle, plan: &RepairPlan, dtcs: &[Dtc]) -> MechanicReference {
    let mut reference = MechanicReference {
        sensor_locations: sensor_locations(vehicle, dtcs),
        fluids: typical_fluids(vehicle),
        torque: BTreeMap::new(),
        tools: Vec::new(),
    };

    for (component, entry) in &plan.torque_specs {
        let annotated = match &entry.platform {
            Some(platform) => format!("{} ({platform})", entry.value),
            None => entry.value.clone(),
        };
        reference.torque.insert(component.clone(), annotated);
    }

    reference.tools = plan.tools.keys().cloned().collect();
    if reference.tools.is_empty() {
        reference.tools.push("basic hand tools".to_string());
    }
    if plan.labor.as_ref().map(|l| l.lift_required).unwrap_or(false) {
        reference.tools.push("vehicle lift".to_string());
    }

    reference
}

#[cfg(test)]
mod tests {
    use super::*;
    use bayline_types::{DiagnosticPath, Tagged};

    fn civic() -> Vehicle {
        Vehicle {
            year: Some(2019),
            make: Some("Honda".to_string()),
            model: Some("Civic".to_string()),
            engine: Some("2.0L 4-cyl".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn inline_four_has_one_bank() {
        assert_eq!(bank_count(&civic()), 1);
        let f150 = Vehicle {
            engine: Some("5.0L V8".to_string()),
            ..Default::default()
        };
        assert_eq!(bank_count(&f150), 2);
        let six = Vehicle {
            engine: Some("3.5L 6-cyl".to_string()),
            ..Default::default()
        };
        assert_eq!(bank_count(&six), 2);
    }

    #[test]
    fn p0420_calls_out_downstream_sensor() {
        let dtcs = vec![Dtc::parse("P0420").unwrap()];
        let plan = RepairPlan::new("cat efficiency", 0.7, DiagnosticPath::KbDirect);
        let reference = build_reference(&civic(), &plan, &dtcs);
        assert!(reference.sensor_locations[0].contains("Bank 1 Sensor 2"));
        assert!(reference.fluids["coolant"].contains("Type 2"));
    }

    #[test]
    fn platform_torque_flows_through_annotated() {
        let mut plan = RepairPlan::new("cat efficiency", 0.7, DiagnosticPath::KbDirect);
        plan.torque_specs.insert(
            "O2 sensor".to_string(),
            Tagged::new("30 ft-lb", Some("alldata")),
        );
        plan.labor = Some(bayline_types::LaborSpec {
            hours: 1.0,
            source: bayline_types::LaborSource::Motor,
            category: None,
            lift_required: true,
            notes: None,
        });
        let reference = build_reference(&civic(), &plan, &[]);
        assert_eq!(reference.torque["O2 sensor"], "30 ft-lb (alldata)");
        assert!(reference.tools.contains(&"vehicle lift".to_string()));
    }
}

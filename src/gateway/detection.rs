// =============================================================================
// Detection payload parsing — tolerant of two inbound JSON shapes
// =============================================================================

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDetection {
    pub epc: String,
    pub rssi: Option<f64>,
    pub antenna: Option<i64>,
}

/// Resolve the reporting gate id from `id` or `clientId` at the top level.
pub fn extract_gate_id(payload: &Value) -> Option<String> {
    payload
        .get("id")
        .or_else(|| payload.get("clientId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn first_str(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str().map(|s| s.to_string()))
}

fn first_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(|v| v.as_f64())
}

fn first_i64(obj: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(|v| v.as_i64())
}

fn parse_one(obj: &Value) -> Option<ParsedDetection> {
    let epc = first_str(obj, &["epc", "idHex", "tag_id"])?;
    Some(ParsedDetection {
        epc,
        rssi: first_f64(obj, &["rssi", "peakRssi"]),
        antenna: first_i64(obj, &["ant", "antenna"]),
    })
}

/// Parse either the array form (`tags: [...]`) or the flat/legacy form
/// (`data: {...}` or fields at top level). Entries with no EPC are skipped;
/// a flat message with no EPC anywhere yields an empty result.
pub fn parse(payload: &Value) -> Vec<ParsedDetection> {
    if let Some(tags) = payload.get("tags").and_then(|v| v.as_array()) {
        return tags.iter().filter_map(parse_one).collect();
    }

    let data = payload.get("data").unwrap_or(payload);
    parse_one(data).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_array_form_with_multiple_tags() {
        let payload = json!({
            "tags": [
                { "epc": "A0B0C01234FFFFFFFFFF", "rssi": -42.5, "ant": 1 },
                { "idHex": "B3E0A3B3123", "peakRssi": -50.0, "antenna": 2 },
            ],
            "id": "GATE-1",
        });
        let detections = parse(&payload);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].epc, "A0B0C01234FFFFFFFFFF");
        assert_eq!(detections[0].rssi, Some(-42.5));
        assert_eq!(detections[0].antenna, Some(1));
        assert_eq!(detections[1].antenna, Some(2));
        assert_eq!(extract_gate_id(&payload).as_deref(), Some("GATE-1"));
    }

    #[test]
    fn array_form_skips_entries_missing_epc() {
        let payload = json!({ "tags": [ { "rssi": -40.0 }, { "epc": "ABCDEF" } ] });
        let detections = parse(&payload);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].epc, "ABCDEF");
    }

    #[test]
    fn parses_flat_nested_data_form() {
        let payload = json!({
            "data": { "idHex": "A0B0C01234FFFFFFFFFF", "peakRssi": -45.0, "antenna": 3 },
            "clientId": "GATE-2",
        });
        let detections = parse(&payload);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].epc, "A0B0C01234FFFFFFFFFF");
        assert_eq!(extract_gate_id(&payload).as_deref(), Some("GATE-2"));
    }

    #[test]
    fn parses_flat_top_level_form() {
        let payload = json!({ "epc": "ABCDEF", "rssi": -30.0, "ant": 1, "clientId": "GATE-3" });
        let detections = parse(&payload);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].epc, "ABCDEF");
    }

    #[test]
    fn flat_form_with_no_epc_yields_empty() {
        let payload = json!({ "data": { "rssi": -30.0 } });
        assert!(parse(&payload).is_empty());
    }
}

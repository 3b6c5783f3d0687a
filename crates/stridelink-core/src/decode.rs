//! Frame decoder: extracts one JSON object from a notification payload.
//!
//! Peripherals write directly from a fixed-size buffer, so a notification
//! may carry trailing garbage after the closing brace, or no complete
//! object at all. Each notification is treated as self-contained; there is
//! no reassembly across notifications. The decoder cuts the payload at the
//! brace closing the first object and parses that prefix strictly.

use serde_json::Value;

use crate::error::DecodeError;
use crate::types::{SensorFrame, FSR_PAD_COUNT};

/// Decode one notification payload.
///
/// Returns `Ok(None)` when the payload contains no `}` at all — that means
/// no complete object arrived in this notification and the frame is
/// silently dropped, not a fault. Unknown top-level keys are ignored;
/// recognized keys with the wrong type are treated as absent.
///
/// # Errors
///
/// Returns [`DecodeError`] when the prefix up to the first `}` is not a
/// valid JSON object. Callers log and count these; they never affect
/// connection state.
pub fn decode(payload: &[u8]) -> Result<Option<SensorFrame>, DecodeError> {
    let Some(end) = object_end(payload) else {
        return Ok(None);
    };

    let object = &payload[..=end];
    let value: Value = serde_json::from_slice(object).map_err(|e| DecodeError {
        reason: e.to_string(),
    })?;
    let Value::Object(map) = value else {
        return Err(DecodeError {
            reason: "payload is not a JSON object".into(),
        });
    };

    let mut frame = SensorFrame {
        roll: map.get("roll").and_then(Value::as_f64),
        yaw_angle: map.get("yaw_angle").and_then(Value::as_f64),
        yaw_rate: map.get("yaw_rate").and_then(Value::as_f64),
        squat_posture: map
            .get("squat_posture")
            .and_then(Value::as_str)
            .map(str::to_owned),
        fsr_left: map.get("fsr_left").and_then(fsr_pads),
        fsr_right: map.get("fsr_right").and_then(fsr_pads),
        fsr: map.get("fsr").and_then(fsr_any),
        imu_roll: None,
    };
    if let Some(imu) = map.get("imu").and_then(Value::as_object) {
        frame.imu_roll = imu.get("roll").and_then(Value::as_f64);
    }

    Ok(Some(frame))
}

/// Index of the `}` closing the object opened by the first `{`, by brace
/// depth. Field values never contain literal braces, so no string-aware
/// scanning is needed. A `}` before any `{` is returned as-is and left for
/// the JSON parser to reject.
fn object_end(payload: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    for (index, &byte) in payload.iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                if depth <= 1 {
                    return Some(index);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// A fixed-size pad array: the first five non-negative integers, in order.
/// Fewer than five elements, or any non-integer element among the first
/// five, makes the field absent.
fn fsr_pads(value: &Value) -> Option<[u32; FSR_PAD_COUNT]> {
    let items = value.as_array()?;
    if items.len() < FSR_PAD_COUNT {
        return None;
    }
    let mut pads = [0u32; FSR_PAD_COUNT];
    for (slot, item) in pads.iter_mut().zip(items.iter()) {
        *slot = u32::try_from(item.as_u64()?).ok()?;
    }
    Some(pads)
}

/// A variable-length pressure array from single-peripheral firmware.
fn fsr_any(value: &Value) -> Option<Vec<u32>> {
    value
        .as_array()?
        .iter()
        .map(|item| u32::try_from(item.as_u64()?).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_without_closing_brace_is_absent() {
        assert!(decode(b"").unwrap().is_none());
        assert!(decode(b"{\"roll\": 12.5").unwrap().is_none());
        assert!(decode(b"noise").unwrap().is_none());
    }

    #[test]
    fn trailing_garbage_after_brace_is_ignored() {
        let frame = decode(b"{\"roll\": 12.5}garbage\x00\xff")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.roll, Some(12.5));
        assert_eq!(frame.yaw_angle, None);
    }

    #[test]
    fn fsr_array_preserves_order() {
        let frame = decode(b"{\"fsr_left\":[1,2,3,4,5]}").unwrap().expect("frame");
        assert_eq!(frame.fsr_left, Some([1, 2, 3, 4, 5]));
        assert_eq!(frame.fsr_right, None);
    }

    #[test]
    fn invalid_json_up_to_first_brace_is_an_error() {
        let result = decode(b"{\"roll\": }");
        assert!(result.is_err());
        // A bare value followed by a brace is also a decode error, not a panic.
        assert!(decode(b"12}").is_err());
    }

    #[test]
    fn wrong_typed_fields_are_absent() {
        let frame = decode(b"{\"roll\":\"sideways\",\"yaw_angle\":3.5}")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.roll, None);
        assert_eq!(frame.yaw_angle, Some(3.5));
    }

    #[test]
    fn short_or_negative_pad_arrays_are_absent() {
        let frame = decode(b"{\"fsr_left\":[1,2,3]}").unwrap().expect("frame");
        assert_eq!(frame.fsr_left, None);

        let frame = decode(b"{\"fsr_right\":[1,-2,3,4,5]}").unwrap().expect("frame");
        assert_eq!(frame.fsr_right, None);
    }

    #[test]
    fn extra_pads_take_the_first_five() {
        let frame = decode(b"{\"fsr_right\":[9,8,7,6,5,4,3]}")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.fsr_right, Some([9, 8, 7, 6, 5]));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let frame = decode(b"{\"battery\": 88, \"yaw_rate\": -0.25}")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.yaw_rate, Some(-0.25));
        assert!(frame.fsr.is_none());
    }

    #[test]
    fn trailing_extra_braces_are_garbage() {
        let frame = decode(b"{\"roll\": 1.5}}}}").unwrap().expect("frame");
        assert_eq!(frame.roll, Some(1.5));
    }

    #[test]
    fn nested_imu_roll() {
        let frame = decode(b"{\"imu\": {\"roll\": 4.25, \"pitch\": 1.0}}")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.imu_roll, Some(4.25));
        assert_eq!(frame.roll, None);
    }

    #[test]
    fn single_peripheral_fsr_array() {
        let frame = decode(b"{\"fsr\": [10, 20]}").unwrap().expect("frame");
        assert_eq!(frame.fsr, Some(vec![10, 20]));
    }

    #[test]
    fn zero_values_are_present_not_absent() {
        let frame = decode(b"{\"roll\": 0.0, \"fsr_left\":[0,0,0,0,0]}")
            .unwrap()
            .expect("frame");
        assert_eq!(frame.roll, Some(0.0));
        assert_eq!(frame.fsr_left, Some([0, 0, 0, 0, 0]));
    }

    #[test]
    fn empty_object_is_an_empty_frame() {
        let frame = decode(b"{}").unwrap().expect("frame");
        assert!(frame.is_empty());
    }
}

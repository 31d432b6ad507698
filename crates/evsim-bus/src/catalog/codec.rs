//! Conversion between CAN payloads and signal snapshots

use crate::signal::{SignalSnapshot, SignalValue, SNA_LABEL};

use super::definition::{ByteOrder, MessageDefinition, SignalDefinition};
use super::error::{CatalogError, CatalogResult};

/// Decode a payload into the physical values of every signal
///
/// Frames shorter than the message's `dlc` are rejected.
pub fn decode_frame(def: &MessageDefinition, data: &[u8]) -> CatalogResult<SignalSnapshot> {
    let dlc = frame_len(def);
    if data.len() < dlc {
        return Err(CatalogError::FrameTooShort {
            message: def.name.clone(),
            expected: dlc,
            actual: data.len(),
        });
    }

    let payload = to_payload(data);
    let mut snapshot = SignalSnapshot::new();

    for (name, sig) in &def.signals {
        let raw = extract_raw(def, name, sig, payload)?;
        snapshot.insert(name.clone(), decode_signal(sig, raw));
    }

    Ok(snapshot)
}

/// Encode a snapshot into a payload of `dlc` bytes
///
/// Signals missing from the snapshot are left as raw zero.
pub fn encode_frame(def: &MessageDefinition, snapshot: &SignalSnapshot) -> CatalogResult<Vec<u8>> {
    let mut payload = [0u8; 8];

    for (name, value) in snapshot.iter() {
        let sig = def.signals.get(name).ok_or_else(|| CatalogError::InvalidLayout {
            message: def.name.clone(),
            signal: name.clone(),
            detail: "signal not defined".to_string(),
        })?;
        let raw = encode_signal(name, sig, value)?;
        insert_raw(def, name, sig, &mut payload, raw)?;
    }

    Ok(payload[..frame_len(def)].to_vec())
}

/// Payload length in bytes, at most a classic CAN frame
fn frame_len(def: &MessageDefinition) -> usize {
    usize::from(def.dlc.min(8))
}

/// Convert a raw value to its physical representation
pub fn decode_signal(sig: &SignalDefinition, raw: u64) -> SignalValue {
    if sig.sna == Some(raw) {
        return SignalValue::NotAvailable;
    }

    if let Some(label) = sig.enum_map.as_ref().and_then(|m| m.get(&raw)) {
        return SignalValue::label(label.clone());
    }

    let raw = if sig.signed {
        sign_extend(raw, sig.length) as f64
    } else {
        raw as f64
    };
    SignalValue::Number(round_for_scale(raw * sig.scale + sig.offset, sig.scale))
}

/// Convert a physical value to the raw bits of a signal
pub fn encode_signal(name: &str, sig: &SignalDefinition, value: &SignalValue) -> CatalogResult<u64> {
    match value {
        SignalValue::NotAvailable => Ok(sig
            .sna
            .or_else(|| sig.raw_for_label(SNA_LABEL))
            .unwrap_or_else(|| sig.mask())),
        SignalValue::Label(label) => {
            sig.raw_for_label(label)
                .ok_or_else(|| CatalogError::UnknownLabel {
                    signal: name.to_string(),
                    label: label.clone(),
                })
        }
        SignalValue::Number(physical) => encode_number(name, sig, *physical),
    }
}

fn encode_number(name: &str, sig: &SignalDefinition, physical: f64) -> CatalogResult<u64> {
    if let (Some(min), Some(max)) = (sig.min, sig.max) {
        if physical < min || physical > max {
            return Err(CatalogError::ValueOutOfRange {
                signal: name.to_string(),
                value: physical,
                min,
                max,
            });
        }
    }

    // Reverse the scale/offset: raw = (physical - offset) / scale
    let raw = ((physical - sig.offset) / sig.scale).round();

    let (raw_min, raw_max) = raw_bounds(sig);
    if raw < raw_min || raw > raw_max {
        return Err(CatalogError::ValueOutOfRange {
            signal: name.to_string(),
            value: physical,
            min: raw_min * sig.scale + sig.offset,
            max: raw_max * sig.scale + sig.offset,
        });
    }

    Ok((raw as i64 as u64) & sig.mask())
}

/// Representable raw range of a signal
fn raw_bounds(sig: &SignalDefinition) -> (f64, f64) {
    if sig.signed {
        let half = 2f64.powi(i32::from(sig.length) - 1);
        (-half, half - 1.0)
    } else {
        (0.0, sig.mask() as f64)
    }
}

fn sign_extend(raw: u64, length: u16) -> i64 {
    if length == 0 || length >= 64 {
        return raw as i64;
    }
    let shift = 64 - u32::from(length);
    ((raw << shift) as i64) >> shift
}

fn to_payload(data: &[u8]) -> [u8; 8] {
    let mut payload = [0u8; 8];
    let len = data.len().min(8);
    payload[..len].copy_from_slice(&data[..len]);
    payload
}

/// Shift of the signal's least significant bit, counted in the integer view
/// of the payload that matches its byte order
fn lsb_shift(def: &MessageDefinition, name: &str, sig: &SignalDefinition) -> CatalogResult<u32> {
    let invalid = |detail: String| CatalogError::InvalidLayout {
        message: def.name.clone(),
        signal: name.to_string(),
        detail,
    };

    if sig.length == 0 || sig.length > 64 {
        return Err(invalid(format!("length {} not in 1..=64", sig.length)));
    }

    let length = u32::from(sig.length);
    let start = u32::from(sig.start_bit);
    let payload_bits = (frame_len(def) * 8) as u32;

    match sig.byte_order {
        ByteOrder::LittleEndian => {
            if start + length > payload_bits {
                return Err(invalid(format!(
                    "bits {}..{} exceed the {}-bit payload",
                    start,
                    start + length,
                    payload_bits
                )));
            }
            Ok(start)
        }
        ByteOrder::BigEndian => {
            // Linear index 0 is the MSB of byte 0
            let msb = (start / 8) * 8 + (7 - start % 8);
            let lsb = msb + length - 1;
            if lsb >= payload_bits {
                return Err(invalid(format!(
                    "big-endian signal from bit {} with length {} exceeds the {}-bit payload",
                    start, length, payload_bits
                )));
            }
            Ok(63 - lsb)
        }
    }
}

fn payload_word(order: ByteOrder, payload: [u8; 8]) -> u64 {
    match order {
        ByteOrder::LittleEndian => u64::from_le_bytes(payload),
        ByteOrder::BigEndian => u64::from_be_bytes(payload),
    }
}

fn extract_raw(
    def: &MessageDefinition,
    name: &str,
    sig: &SignalDefinition,
    payload: [u8; 8],
) -> CatalogResult<u64> {
    let shift = lsb_shift(def, name, sig)?;
    Ok((payload_word(sig.byte_order, payload) >> shift) & sig.mask())
}

fn insert_raw(
    def: &MessageDefinition,
    name: &str,
    sig: &SignalDefinition,
    payload: &mut [u8; 8],
    raw: u64,
) -> CatalogResult<()> {
    let shift = lsb_shift(def, name, sig)?;
    let mask = sig.mask() << shift;
    let word = (payload_word(sig.byte_order, *payload) & !mask) | ((raw << shift) & mask);

    *payload = match sig.byte_order {
        ByteOrder::LittleEndian => word.to_le_bytes(),
        ByteOrder::BigEndian => word.to_be_bytes(),
    };
    Ok(())
}

/// Decimal places needed to represent values produced with `scale`
fn precision_from_scale(scale: f64) -> i32 {
    let abs_scale = scale.abs();
    if abs_scale == 0.0 {
        return 4;
    }
    if abs_scale >= 1.0 {
        return 0;
    }

    let mut temp = abs_scale;
    let mut precision = 0;
    while precision < 6 {
        if (temp - temp.round()).abs() < 1e-9 {
            break;
        }
        temp *= 10.0;
        precision += 1;
    }
    precision
}

/// Round away float noise like 400.00000000000006
fn round_for_scale(value: f64, scale: f64) -> f64 {
    let precision = precision_from_scale(scale);
    if precision == 0 {
        value.round()
    } else {
        let factor = 10_f64.powi(precision);
        (value * factor).round() / factor
    }
}

//! Typed payload decoding for board notifications
//!
//! The board tags every data frame with a type identifier; this module maps
//! a raw byte buffer plus that tag into one of the known value shapes. The
//! decoder is a pure function suite with no shared state, safe to call
//! concurrently from any number of notification deliveries.
//!
//! Fixed-size shapes are decoded by strict byte-length match: the tag
//! uniquely determines the wire shape, so a mismatch is a protocol fault for
//! that payload, not a recoverable condition. All multi-byte fields are
//! little-endian (board native order).

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::types::{MacAddress, Timestamp};

// ----------------------------------------------------------------------------
// Type Tags
// ----------------------------------------------------------------------------

/// Wire type identifier carried alongside every data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    /// Unsigned 32-bit scalar
    Uint32 = 0x00,
    /// Signed 32-bit scalar
    Int32 = 0x01,
    /// 32-bit float scalar
    Float = 0x02,
    /// 3-axis float vector
    CartesianFloat = 0x03,
    /// Battery charge and voltage pair
    BatteryState = 0x04,
    /// Variable-length raw bytes
    ByteArray = 0x05,
    /// Color sensor ADC quad
    ColorAdc = 0x06,
    /// Euler angles from sensor fusion
    EulerAngles = 0x07,
    /// Unit quaternion from sensor fusion
    Quaternion = 0x08,
    /// Corrected 3-axis vector with accuracy grade
    CorrectedCartesianFloat = 0x09,
    /// Log storage overflow state
    OverflowState = 0x0A,
    /// Portrait/landscape orientation
    SensorOrientation = 0x0B,
    /// NUL-terminated string
    String = 0x0C,
    /// Logger reference clock state
    LoggingTime = 0x0D,
    /// Wireless address struct
    BtleAddress = 0x0E,
    /// Any-motion interrupt detail
    AnyMotion = 0x0F,
    /// Aggregate of nested typed records
    DataArray = 0x10,
    /// Gesture interrupt detail
    Gesture = 0x11,
    /// IMU calibration state triple
    CalibrationState = 0x12,
    /// Tap interrupt detail
    Tap = 0x13,
}

impl TypeTag {
    /// Convert from the raw wire value, returning `None` for unknown tags.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Uint32),
            0x01 => Some(Self::Int32),
            0x02 => Some(Self::Float),
            0x03 => Some(Self::CartesianFloat),
            0x04 => Some(Self::BatteryState),
            0x05 => Some(Self::ByteArray),
            0x06 => Some(Self::ColorAdc),
            0x07 => Some(Self::EulerAngles),
            0x08 => Some(Self::Quaternion),
            0x09 => Some(Self::CorrectedCartesianFloat),
            0x0A => Some(Self::OverflowState),
            0x0B => Some(Self::SensorOrientation),
            0x0C => Some(Self::String),
            0x0D => Some(Self::LoggingTime),
            0x0E => Some(Self::BtleAddress),
            0x0F => Some(Self::AnyMotion),
            0x10 => Some(Self::DataArray),
            0x11 => Some(Self::Gesture),
            0x12 => Some(Self::CalibrationState),
            0x13 => Some(Self::Tap),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Value Shapes
// ----------------------------------------------------------------------------

/// 3-axis float vector (acceleration in g, rotation in deg/s, field in uT).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CartesianFloat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Unit quaternion produced by on-board sensor fusion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Euler angle set produced by on-board sensor fusion, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
}

/// Battery voltage (millivolts) and state of charge (percent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    pub voltage_mv: u16,
    pub charge_pct: u8,
}

/// Raw ADC counts from the color sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorAdc {
    pub clear: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

/// 3-axis vector with the fusion algorithm's per-sample accuracy grade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectedCartesianFloat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub accuracy: u8,
}

/// Log storage overflow counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowState {
    pub length: u16,
    pub assert_en: u8,
}

/// Device orientation reported by the orientation detection module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorOrientation {
    FaceUpPortraitUpright,
    FaceUpPortraitUpsideDown,
    FaceUpLandscapeLeft,
    FaceUpLandscapeRight,
    FaceDownPortraitUpright,
    FaceDownPortraitUpsideDown,
    FaceDownLandscapeLeft,
    FaceDownLandscapeRight,
}

impl SensorOrientation {
    fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::FaceUpPortraitUpright),
            1 => Some(Self::FaceUpPortraitUpsideDown),
            2 => Some(Self::FaceUpLandscapeLeft),
            3 => Some(Self::FaceUpLandscapeRight),
            4 => Some(Self::FaceDownPortraitUpright),
            5 => Some(Self::FaceDownPortraitUpsideDown),
            6 => Some(Self::FaceDownLandscapeLeft),
            7 => Some(Self::FaceDownLandscapeRight),
            _ => None,
        }
    }
}

/// Logger reference clock: board epoch plus the reset identifier the
/// download procedure uses to reconcile timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingTime {
    pub epoch_ms: i64,
    pub reset_uid: u8,
}

/// Wireless address struct as reported by the settings module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtleAddress {
    pub addr_type: u8,
    pub address: MacAddress,
}

/// Any-motion interrupt detail: which axes crossed the slope threshold and
/// the sign of the crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyMotion {
    pub sign: u8,
    pub x_axis_active: bool,
    pub y_axis_active: bool,
    pub z_axis_active: bool,
}

/// Gesture interrupt detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gesture {
    pub kind: u8,
    pub code: u8,
}

/// Per-sensor IMU calibration accuracy grades (0 unreliable .. 3 high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub accelerometer: u8,
    pub gyroscope: u8,
    pub magnetometer: u8,
}

/// Tap interrupt detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tap {
    pub kind: u8,
    pub sign: u8,
}

// ----------------------------------------------------------------------------
// Decoded Value
// ----------------------------------------------------------------------------

/// Sum of every payload shape the board emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodedValue {
    Uint32(u32),
    Int32(i32),
    Float(f32),
    CartesianFloat(CartesianFloat),
    BatteryState(BatteryState),
    ByteArray(Vec<u8>),
    ColorAdc(ColorAdc),
    EulerAngles(EulerAngles),
    Quaternion(Quaternion),
    CorrectedCartesianFloat(CorrectedCartesianFloat),
    OverflowState(OverflowState),
    SensorOrientation(SensorOrientation),
    String(String),
    LoggingTime(LoggingTime),
    BtleAddress(BtleAddress),
    AnyMotion(AnyMotion),
    DataArray(Vec<DecodedValue>),
    Gesture(Gesture),
    CalibrationState(CalibrationState),
    Tap(Tap),
}

/// One decoded notification: reconstructed timestamp, typed value, and the
/// tag it arrived under. Produced transiently per delivery; never stored by
/// the session layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub timestamp: Timestamp,
    pub value: DecodedValue,
    pub tag: TypeTag,
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode a raw data frame into a timestamped sample.
///
/// `raw_tag` is the wire type identifier and `epoch_millis` the board's
/// epoch-millisecond clock value for the frame.
pub fn decode_sample(
    bytes: &[u8],
    raw_tag: u8,
    epoch_millis: u64,
) -> Result<DecodedSample, DecodeError> {
    let tag = TypeTag::from_u8(raw_tag).ok_or(DecodeError::UnsupportedTag(raw_tag))?;
    Ok(DecodedSample {
        timestamp: Timestamp::from_epoch_millis(epoch_millis),
        value: decode(bytes, tag)?,
        tag,
    })
}

/// Decode a raw byte buffer against a known type tag.
pub fn decode(bytes: &[u8], tag: TypeTag) -> Result<DecodedValue, DecodeError> {
    match tag {
        TypeTag::Uint32 => {
            let raw = fixed::<4>(bytes, tag)?;
            Ok(DecodedValue::Uint32(u32::from_le_bytes(raw)))
        }
        TypeTag::Int32 => {
            let raw = fixed::<4>(bytes, tag)?;
            Ok(DecodedValue::Int32(i32::from_le_bytes(raw)))
        }
        TypeTag::Float => {
            let raw = fixed::<4>(bytes, tag)?;
            Ok(DecodedValue::Float(f32::from_le_bytes(raw)))
        }
        TypeTag::CartesianFloat => {
            let raw = fixed::<12>(bytes, tag)?;
            Ok(DecodedValue::CartesianFloat(CartesianFloat {
                x: f32_at(&raw, 0),
                y: f32_at(&raw, 4),
                z: f32_at(&raw, 8),
            }))
        }
        TypeTag::BatteryState => {
            let raw = fixed::<3>(bytes, tag)?;
            Ok(DecodedValue::BatteryState(BatteryState {
                voltage_mv: u16::from_le_bytes([raw[0], raw[1]]),
                charge_pct: raw[2],
            }))
        }
        TypeTag::ByteArray => Ok(DecodedValue::ByteArray(bytes.to_vec())),
        TypeTag::ColorAdc => {
            let raw = fixed::<8>(bytes, tag)?;
            Ok(DecodedValue::ColorAdc(ColorAdc {
                clear: u16_at(&raw, 0),
                red: u16_at(&raw, 2),
                green: u16_at(&raw, 4),
                blue: u16_at(&raw, 6),
            }))
        }
        TypeTag::EulerAngles => {
            let raw = fixed::<16>(bytes, tag)?;
            Ok(DecodedValue::EulerAngles(EulerAngles {
                heading: f32_at(&raw, 0),
                pitch: f32_at(&raw, 4),
                roll: f32_at(&raw, 8),
                yaw: f32_at(&raw, 12),
            }))
        }
        TypeTag::Quaternion => {
            let raw = fixed::<16>(bytes, tag)?;
            Ok(DecodedValue::Quaternion(Quaternion {
                w: f32_at(&raw, 0),
                x: f32_at(&raw, 4),
                y: f32_at(&raw, 8),
                z: f32_at(&raw, 12),
            }))
        }
        TypeTag::CorrectedCartesianFloat => {
            let raw = fixed::<13>(bytes, tag)?;
            Ok(DecodedValue::CorrectedCartesianFloat(
                CorrectedCartesianFloat {
                    x: f32_at(&raw, 0),
                    y: f32_at(&raw, 4),
                    z: f32_at(&raw, 8),
                    accuracy: raw[12],
                },
            ))
        }
        TypeTag::OverflowState => {
            let raw = fixed::<3>(bytes, tag)?;
            Ok(DecodedValue::OverflowState(OverflowState {
                length: u16::from_le_bytes([raw[0], raw[1]]),
                assert_en: raw[2],
            }))
        }
        TypeTag::SensorOrientation => {
            let raw = fixed::<4>(bytes, tag)?;
            let code = i32::from_le_bytes(raw);
            SensorOrientation::from_i32(code)
                .map(DecodedValue::SensorOrientation)
                .ok_or(DecodeError::Malformed {
                    tag,
                    detail: "orientation code out of range",
                })
        }
        TypeTag::String => {
            let end = bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(bytes.len());
            let text = core::str::from_utf8(&bytes[..end]).map_err(|_| DecodeError::Malformed {
                tag,
                detail: "string payload is not UTF-8",
            })?;
            Ok(DecodedValue::String(text.to_owned()))
        }
        TypeTag::LoggingTime => {
            let raw = fixed::<9>(bytes, tag)?;
            Ok(DecodedValue::LoggingTime(LoggingTime {
                epoch_ms: i64::from_le_bytes(raw[0..8].try_into().expect("fixed slice")),
                reset_uid: raw[8],
            }))
        }
        TypeTag::BtleAddress => {
            let raw = fixed::<7>(bytes, tag)?;
            Ok(DecodedValue::BtleAddress(BtleAddress {
                addr_type: raw[0],
                address: MacAddress::new(raw[1..7].try_into().expect("fixed slice")),
            }))
        }
        TypeTag::AnyMotion => {
            let raw = fixed::<4>(bytes, tag)?;
            Ok(DecodedValue::AnyMotion(AnyMotion {
                sign: raw[0],
                x_axis_active: raw[1] != 0,
                y_axis_active: raw[2] != 0,
                z_axis_active: raw[3] != 0,
            }))
        }
        TypeTag::DataArray => decode_data_array(bytes).map(DecodedValue::DataArray),
        TypeTag::Gesture => {
            let raw = fixed::<2>(bytes, tag)?;
            Ok(DecodedValue::Gesture(Gesture {
                kind: raw[0],
                code: raw[1],
            }))
        }
        TypeTag::CalibrationState => {
            let raw = fixed::<3>(bytes, tag)?;
            Ok(DecodedValue::CalibrationState(CalibrationState {
                accelerometer: raw[0],
                gyroscope: raw[1],
                magnetometer: raw[2],
            }))
        }
        TypeTag::Tap => {
            let raw = fixed::<2>(bytes, tag)?;
            Ok(DecodedValue::Tap(Tap {
                kind: raw[0],
                sign: raw[1],
            }))
        }
    }
}

/// Nested records inside an aggregate frame are framed as
/// `[tag: u8][len: u8][payload: len bytes]`, repeated. All records share the
/// parent frame's timestamp.
fn decode_data_array(bytes: &[u8]) -> Result<Vec<DecodedValue>, DecodeError> {
    let mut values = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        if bytes.len() - offset < 2 {
            return Err(DecodeError::Malformed {
                tag: TypeTag::DataArray,
                detail: "truncated record header",
            });
        }
        let raw_tag = bytes[offset];
        let len = bytes[offset + 1] as usize;
        offset += 2;
        if bytes.len() - offset < len {
            return Err(DecodeError::Malformed {
                tag: TypeTag::DataArray,
                detail: "record payload exceeds frame",
            });
        }
        let tag = TypeTag::from_u8(raw_tag).ok_or(DecodeError::UnsupportedTag(raw_tag))?;
        values.push(decode(&bytes[offset..offset + len], tag)?);
        offset += len;
    }
    Ok(values)
}

fn fixed<const N: usize>(bytes: &[u8], tag: TypeTag) -> Result<[u8; N], DecodeError> {
    bytes
        .try_into()
        .map_err(|_| DecodeError::ShapeMismatch {
            tag,
            expected: N,
            actual: bytes.len(),
        })
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes(
        bytes[offset..offset + 4]
            .try_into()
            .expect("fixed slice"),
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Operator parameters and their decoder-accepted ranges
//!
//! Validated values are only ever passed as discrete argv entries.

use serde::Deserialize;
use thiserror::Error;

use super::ModeKind;

const FREQ_MIN_MHZ: f64 = 24.0;
const FREQ_MAX_MHZ: f64 = 1766.0;
const GAIN_MAX_DB: f64 = 50.0;
const DEVICE_INDEX_MAX: i64 = 99;
const SQUELCH_MAX: i64 = 1000;
const BANDWIDTH_MIN_KHZ: f64 = 1.0;
const BANDWIDTH_MAX_KHZ: f64 = 3200.0;
const PPM_LIMIT: i64 = 1000;
const STEP_MIN_KHZ: f64 = 1.0;
const STEP_MAX_KHZ: f64 = 10_000.0;

/// Parameter rejection, naming the field and the accepted range
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("{field} is not supported by mode {mode}")]
    Unsupported { field: &'static str, mode: ModeKind },
}

/// A numeric field as sent by clients: a JSON number or a numeric string.
/// Text that is not a number is rejected by `validate` with the field name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberInput {
    Number(f64),
    Text(String),
}

impl From<f64> for NumberInput {
    fn from(n: f64) -> Self {
        NumberInput::Number(n)
    }
}

/// Gain additionally accepts "auto"
pub type GainInput = NumberInput;

/// Raw start request parameters; every field is optional and defaulted per mode
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModeParams {
    pub frequency_mhz: Option<NumberInput>,
    /// Upper edge of the listening-post scan range
    pub frequency_end_mhz: Option<NumberInput>,
    pub step_khz: Option<NumberInput>,
    pub gain: Option<GainInput>,
    pub bandwidth_khz: Option<NumberInput>,
    pub device_index: Option<NumberInput>,
    pub squelch: Option<NumberInput>,
    pub ppm: Option<NumberInput>,
    pub rtl_tcp_host: Option<String>,
    pub rtl_tcp_port: Option<NumberInput>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gain {
    Auto,
    Db(f64),
}

/// Network-attached SDR served by rtl_tcp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSdr {
    pub host: String,
    pub port: u16,
}

/// Parameters after range checks and per-mode defaults
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParams {
    pub frequency_mhz: f64,
    pub frequency_end_mhz: Option<f64>,
    pub step_khz: f64,
    pub gain: Gain,
    pub bandwidth_khz: f64,
    /// None means "use the arbiter-assigned device"
    pub device_index: Option<u32>,
    pub squelch: u32,
    pub ppm: i32,
    pub remote: Option<RemoteSdr>,
}

impl ModeParams {
    pub fn validate(&self, mode: ModeKind) -> Result<ValidatedParams, ParamError> {
        let default_freq = match mode {
            ModeKind::Pager => 153.350,
            ModeKind::Sensor => 433.920,
            ModeKind::Adsb => 1090.0,
            ModeKind::ListeningPost => 88.0,
            ModeKind::WifiScan | ModeKind::BluetoothScan => 0.0,
        };
        let uses_sdr = default_freq > 0.0;

        let frequency_mhz = match &self.frequency_mhz {
            Some(f) => validate_frequency("frequency_mhz", number("frequency_mhz", f)?)?,
            None => default_freq,
        };

        let frequency_end_mhz = if mode == ModeKind::ListeningPost {
            let end = match &self.frequency_end_mhz {
                Some(f) => validate_frequency("frequency_end_mhz", number("frequency_end_mhz", f)?)?,
                None => (frequency_mhz + 20.0).min(FREQ_MAX_MHZ),
            };
            if end <= frequency_mhz {
                return Err(ParamError::Invalid {
                    field: "frequency_end_mhz",
                    reason: format!("must be above the start frequency {}", frequency_mhz),
                });
            }
            Some(end)
        } else {
            None
        };

        let step_khz = match &self.step_khz {
            Some(s) => in_range("step_khz", number("step_khz", s)?, STEP_MIN_KHZ, STEP_MAX_KHZ)?,
            None => 100.0,
        };

        let gain = match &self.gain {
            None => Gain::Auto,
            Some(g) => validate_gain(g)?,
        };

        let bandwidth_khz = match &self.bandwidth_khz {
            Some(bw) => in_range(
                "bandwidth_khz",
                number("bandwidth_khz", bw)?,
                BANDWIDTH_MIN_KHZ,
                BANDWIDTH_MAX_KHZ,
            )?,
            None => 22.05,
        };

        let device_index = match &self.device_index {
            Some(idx) => {
                let idx = integer("device_index", idx)?;
                Some(int_in_range("device_index", idx, 0, DEVICE_INDEX_MAX)? as u32)
            }
            None => None,
        };

        let squelch = match &self.squelch {
            Some(sq) => int_in_range("squelch", integer("squelch", sq)?, 0, SQUELCH_MAX)? as u32,
            None => 0,
        };

        let ppm = match &self.ppm {
            Some(p) => int_in_range("ppm", integer("ppm", p)?, -PPM_LIMIT, PPM_LIMIT)? as i32,
            None => 0,
        };

        let remote = match (&self.rtl_tcp_host, &self.rtl_tcp_port) {
            (None, None) => None,
            (Some(host), port) => {
                if mode != ModeKind::Sensor {
                    return Err(ParamError::Unsupported {
                        field: "rtl_tcp_host",
                        mode,
                    });
                }
                let port = match port {
                    Some(p) => integer("rtl_tcp_port", p)?,
                    None => 1234,
                };
                Some(RemoteSdr {
                    host: validate_host(host)?,
                    port: validate_port(port)?,
                })
            }
            (None, Some(_)) => {
                return Err(ParamError::Invalid {
                    field: "rtl_tcp_port",
                    reason: "rtl_tcp_host is required with a port".to_string(),
                })
            }
        };

        if !uses_sdr && (self.frequency_mhz.is_some() || self.gain.is_some()) {
            let field = if self.frequency_mhz.is_some() { "frequency_mhz" } else { "gain" };
            return Err(ParamError::Unsupported { field, mode });
        }

        Ok(ValidatedParams {
            frequency_mhz,
            frequency_end_mhz,
            step_khz,
            gain,
            bandwidth_khz,
            device_index,
            squelch,
            ppm,
            remote,
        })
    }
}

fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, ParamError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(value)
    } else {
        Err(ParamError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}

fn number(field: &'static str, input: &NumberInput) -> Result<f64, ParamError> {
    match input {
        NumberInput::Number(n) => Ok(*n),
        NumberInput::Text(t) => t.trim().parse::<f64>().map_err(|_| ParamError::Invalid {
            field,
            reason: format!("expected a number, got {:?}", t),
        }),
    }
}

fn integer(field: &'static str, input: &NumberInput) -> Result<i64, ParamError> {
    let n = number(field, input)?;
    if !n.is_finite() || n.fract() != 0.0 {
        return Err(ParamError::Invalid {
            field,
            reason: format!("expected a whole number, got {}", n),
        });
    }
    // out-of-range magnitudes saturate and fail the range check
    Ok(n as i64)
}

fn int_in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ParamError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ParamError::OutOfRange {
            field,
            min: min as f64,
            max: max as f64,
            value: value as f64,
        })
    }
}

fn validate_frequency(field: &'static str, mhz: f64) -> Result<f64, ParamError> {
    in_range(field, mhz, FREQ_MIN_MHZ, FREQ_MAX_MHZ)
}

fn validate_gain(input: &GainInput) -> Result<Gain, ParamError> {
    let db = match input {
        NumberInput::Number(n) => *n,
        NumberInput::Text(t) if t.trim().eq_ignore_ascii_case("auto") => return Ok(Gain::Auto),
        NumberInput::Text(t) => t.trim().parse::<f64>().map_err(|_| ParamError::Invalid {
            field: "gain",
            reason: format!("expected dB or \"auto\", got {:?}", t),
        })?,
    };
    in_range("gain", db, 0.0, GAIN_MAX_DB).map(Gain::Db)
}

fn validate_host(host: &str) -> Result<String, ParamError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ParamError::Invalid {
            field: "rtl_tcp_host",
            reason: "must not be empty".to_string(),
        });
    }
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(ParamError::Invalid {
            field: "rtl_tcp_host",
            reason: format!("{:?} contains characters outside [A-Za-z0-9.-]", host),
        });
    }
    Ok(host.to_string())
}

fn validate_port(port: i64) -> Result<u16, ParamError> {
    int_in_range("rtl_tcp_port", port, 1, 65535).map(|p| p as u16)
}

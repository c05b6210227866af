//! dump1090 verbose (`--interactive` off) output
//!
//! Each decoded frame is printed as a block of `Key : value` lines, opened by
//! the raw `*hex;` frame (or directly by the ICAO line) and closed by a blank
//! line. A block becomes one [`AircraftPosition`] once it is closed; fields
//! are normalised to feet and knots.
//!
//! ```text
//! *8d4ca2b158c901a0c0a8b0c2e1a5;
//! CRC: 000000 (ok)
//! DF 17: ADS-B message.
//!   ICAO Address   : 4ca2b1
//!   Altitude       : 35000 ft
//!
//! ```

use super::{round_to, ParseAnomaly, RecordDecoder};
use crate::event::{AircraftPosition, EventPayload};

const FEET_PER_METRE: f64 = 3.28084;

#[derive(Debug, Default)]
struct Block {
    icao: Option<String>,
    callsign: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude_ft: Option<i32>,
    speed_kts: Option<f64>,
    heading_deg: Option<f64>,
    squawk: Option<String>,
}

impl Block {
    fn has_state(&self) -> bool {
        self.callsign.is_some()
            || self.latitude.is_some()
            || self.longitude.is_some()
            || self.altitude_ft.is_some()
            || self.speed_kts.is_some()
            || self.heading_deg.is_some()
            || self.squawk.is_some()
    }
}

#[derive(Debug, Default)]
pub struct AircraftDecoder {
    current: Option<Block>,
}

impl AircraftDecoder {
    fn flush(&mut self, out: &mut Vec<EventPayload>) {
        let Some(block) = self.current.take() else {
            return;
        };
        // frames without an address or with nothing but the address carry no state
        let Some(icao) = block.icao.clone() else {
            return;
        };
        if !block.has_state() {
            return;
        }
        out.push(EventPayload::Aircraft(AircraftPosition {
            icao,
            callsign: block.callsign,
            latitude: block.latitude,
            longitude: block.longitude,
            altitude_ft: block.altitude_ft,
            speed_kts: block.speed_kts,
            heading_deg: block.heading_deg,
            squawk: block.squawk,
        }));
    }
}

impl RecordDecoder for AircraftDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            self.flush(out);
            return Ok(());
        }

        if trimmed.starts_with('*') && trimmed.ends_with(';') {
            self.flush(out);
            self.current = Some(Block::default());
            return Ok(());
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            return Ok(());
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "icao address" || key == "icao" {
            let icao = parse_icao(value)?;
            let reopen = self.current.as_ref().map_or(true, |b| b.icao.is_some());
            if reopen {
                self.flush(out);
                self.current = Some(Block::default());
            }
            if let Some(block) = self.current.as_mut() {
                block.icao = Some(icao);
            }
            return Ok(());
        }

        // field lines outside a block are stray output
        let Some(block) = self.current.as_mut() else {
            return Ok(());
        };

        match key.as_str() {
            "identification" | "callsign" | "ident" => {
                let callsign = value.trim_matches('_').trim().to_ascii_uppercase();
                if !callsign.is_empty() {
                    block.callsign = Some(callsign);
                }
            }
            "altitude" | "baro altitude" => block.altitude_ft = Some(parse_altitude(value)?),
            "speed" | "ground speed" | "groundspeed" => block.speed_kts = Some(parse_speed(value)?),
            "heading" | "track" => {
                let (n, _) = parse_measure(value, "heading")?;
                block.heading_deg = Some(round_to(n, 1));
            }
            "latitude" => {
                let (n, _) = parse_measure(value, "latitude")?;
                if !(-90.0..=90.0).contains(&n) {
                    return Err(ParseAnomaly::new(format!("latitude {} out of range", n)));
                }
                block.latitude = Some(n);
            }
            "longitude" => {
                let (n, _) = parse_measure(value, "longitude")?;
                if !(-180.0..=180.0).contains(&n) {
                    return Err(ParseAnomaly::new(format!("longitude {} out of range", n)));
                }
                block.longitude = Some(n);
            }
            "squawk" => {
                let code = value.split_whitespace().next().unwrap_or("");
                if code.len() != 4 || !code.chars().all(|c| ('0'..='7').contains(&c)) {
                    return Err(ParseAnomaly::new(format!("bad squawk {:?}", value)));
                }
                block.squawk = Some(code.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<EventPayload>) {
        self.flush(out);
    }
}

fn parse_icao(value: &str) -> Result<String, ParseAnomaly> {
    let token = value.split_whitespace().next().unwrap_or("");
    if token.len() == 6 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(token.to_ascii_uppercase())
    } else {
        Err(ParseAnomaly::new(format!("bad ICAO address {:?}", value)))
    }
}

/// Leading number and an optional lowercase unit
fn parse_measure(value: &str, field: &str) -> Result<(f64, Option<String>), ParseAnomaly> {
    let mut tokens = value.split_whitespace();
    let number = tokens
        .next()
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .ok_or_else(|| ParseAnomaly::new(format!("bad {} {:?}", field, value)))?;
    Ok((number, tokens.next().map(|u| u.to_ascii_lowercase())))
}

fn parse_altitude(value: &str) -> Result<i32, ParseAnomaly> {
    let (n, unit) = parse_measure(value, "altitude")?;
    let feet = match unit.as_deref() {
        None | Some("ft") | Some("feet") => n,
        Some("m") | Some("meters") | Some("metres") => n * FEET_PER_METRE,
        Some(other) => return Err(ParseAnomaly::new(format!("unknown altitude unit {:?}", other))),
    };
    Ok(feet.round() as i32)
}

fn parse_speed(value: &str) -> Result<f64, ParseAnomaly> {
    let (n, unit) = parse_measure(value, "speed")?;
    let knots = match unit.as_deref() {
        None | Some("kt") | Some("kts") | Some("knots") => n,
        Some("km/h") | Some("kmh") | Some("kph") => n / 1.852,
        Some("mph") => n * 0.868976,
        Some("m/s") => n * 1.943844,
        Some(other) => return Err(ParseAnomaly::new(format!("unknown speed unit {:?}", other))),
    };
    Ok(round_to(knots, 1))
}

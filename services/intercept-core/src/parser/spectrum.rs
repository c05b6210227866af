//! rtl_power CSV rows, reduced to the strongest bin
//!
//! `date, time, hz_low, hz_high, hz_step, samples, dB, dB, ...`

use super::{round_to, ParseAnomaly, RecordDecoder};
use crate::event::{EventPayload, SpectrumSegment};

const HEADER_FIELDS: usize = 6;

pub struct SpectrumDecoder;

impl RecordDecoder for SpectrumDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        if !line.contains(',') {
            return Ok(());
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() <= HEADER_FIELDS {
            return Err(ParseAnomaly::new(format!(
                "rtl_power row has {} fields, expected more than {}",
                fields.len(),
                HEADER_FIELDS
            )));
        }

        let number = |idx: usize, name: &str| -> Result<f64, ParseAnomaly> {
            fields[idx]
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .ok_or_else(|| ParseAnomaly::new(format!("bad {} {:?}", name, fields[idx])))
        };
        let low = number(2, "hz_low")?;
        let high = number(3, "hz_high")?;
        let step = number(4, "hz_step")?;
        if high < low {
            return Err(ParseAnomaly::new(format!("hz_high {} below hz_low {}", high, low)));
        }

        let mut peak: Option<(usize, f64)> = None;
        let mut sum = 0.0;
        let mut count = 0usize;
        for (i, raw) in fields[HEADER_FIELDS..].iter().enumerate() {
            // rtl_power writes "nan" / "-inf" for empty bins
            let Some(db) = raw.parse::<f64>().ok().filter(|v| v.is_finite()) else {
                continue;
            };
            sum += db;
            count += 1;
            if peak.map_or(true, |(_, best)| db > best) {
                peak = Some((i, db));
            }
        }
        let (peak_bin, peak_db) =
            peak.ok_or_else(|| ParseAnomaly::new("rtl_power row without finite power bins"))?;

        out.push(EventPayload::Spectrum(SpectrumSegment {
            freq_low_hz: low.round() as u64,
            freq_high_hz: high.round() as u64,
            step_hz: step,
            peak_freq_hz: (low + step * peak_bin as f64).round() as u64,
            peak_db,
            mean_db: round_to(sum / count as f64, 2),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(line: &str) -> Result<Vec<SpectrumSegment>, ParseAnomaly> {
        let mut out = Vec::new();
        SpectrumDecoder.feed_line(line, &mut out)?;
        Ok(out
            .into_iter()
            .map(|p| match p {
                EventPayload::Spectrum(s) => s,
                other => panic!("unexpected payload {:?}", other),
            })
            .collect())
    }

    #[test]
    fn test_row_reduced_to_peak() {
        let rows = feed("2024-01-15, 10:30:00, 88000000, 88400000, 100000.00, 10, -45.2, -30.5, nan, -40.3").unwrap();
        assert_eq!(
            rows,
            vec![SpectrumSegment {
                freq_low_hz: 88_000_000,
                freq_high_hz: 88_400_000,
                step_hz: 100_000.0,
                peak_freq_hz: 88_100_000,
                peak_db: -30.5,
                mean_db: -38.67,
            }]
        );
    }

    #[test]
    fn test_non_csv_chatter_ignored() {
        assert!(feed("Found 1 device(s):").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_rows_are_anomalies() {
        assert!(feed("2024-01-15, 10:30:00, 88000000").is_err());
        assert!(feed("2024-01-15, 10:30:00, abc, 88400000, 100000, 10, -45").is_err());
        assert!(feed("2024-01-15, 10:30:00, 88000000, 88400000, 100000, 10, nan, -inf").is_err());
    }
}

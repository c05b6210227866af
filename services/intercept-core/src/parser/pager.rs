//! multimon-ng POCSAG / FLEX output
//!
//! ```text
//! POCSAG1200: Address: 1234567  Function: 0  Alpha:   Hello world<NUL>
//! POCSAG512: Address:  200000  Function: 1
//! FLEX: 2024-01-01 12:00:00 1600/2/K/A 03.103 [001234567] ALN Message text
//! FLEX|2024-01-01 12:00:00|1600/2/K/A|10.120|001234567|ALN|Message text
//! ```

use super::{ParseAnomaly, RecordDecoder};
use crate::event::{EventPayload, PagerContent, PagerMessage};

/// multimon-ng control markers trailing alpha content
const CONTROL_MARKERS: [&str; 5] = ["<NUL>", "<EOT>", "<ETX>", "<ETB>", "<EOM>"];

pub struct PagerDecoder;

impl RecordDecoder for PagerDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        let line = line.trim_end();
        let message = if line.starts_with("POCSAG") {
            parse_pocsag(line)?
        } else if let Some(rest) = line.strip_prefix("FLEX|") {
            parse_flex_pipe(rest)?
        } else if let Some(rest) = line.strip_prefix("FLEX:") {
            parse_flex_colon(rest)?
        } else {
            // banner, "Enabled demodulators:", etc.
            return Ok(());
        };
        out.push(EventPayload::PagerMessage(message));
        Ok(())
    }
}

fn parse_pocsag(line: &str) -> Result<PagerMessage, ParseAnomaly> {
    let (protocol, rest) = line
        .split_once(':')
        .ok_or_else(|| ParseAnomaly::new("POCSAG line without protocol separator"))?;
    if !protocol["POCSAG".len()..].chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseAnomaly::new(format!("unknown protocol {}", protocol)));
    }

    let rest = rest
        .trim_start()
        .strip_prefix("Address:")
        .ok_or_else(|| ParseAnomaly::new("POCSAG line without address"))?;
    let (address, rest) = split_token(rest);
    let capcode = address
        .parse::<u32>()
        .map_err(|_| ParseAnomaly::new(format!("bad POCSAG address {:?}", address)))?;

    let rest = rest
        .trim_start()
        .strip_prefix("Function:")
        .ok_or_else(|| ParseAnomaly::new("POCSAG line without function"))?;
    let (function, rest) = split_token(rest);
    let function = function
        .parse::<u8>()
        .ok()
        .filter(|f| *f <= 3)
        .ok_or_else(|| ParseAnomaly::new(format!("bad POCSAG function {:?}", function)))?;

    let rest = rest.trim_start();
    let (content, text) = if rest.is_empty() {
        (PagerContent::Tone, "")
    } else if let Some(text) = rest.strip_prefix("Alpha:") {
        (PagerContent::Alpha, text)
    } else if let Some(text) = rest.strip_prefix("Numeric:") {
        (PagerContent::Numeric, text)
    } else {
        return Err(ParseAnomaly::new(format!("unknown POCSAG content {:?}", rest)));
    };

    Ok(PagerMessage {
        protocol: protocol.to_string(),
        capcode,
        function: Some(function),
        content,
        text: clean_text(text),
    })
}

fn parse_flex_colon(rest: &str) -> Result<PagerMessage, ParseAnomaly> {
    let open = rest
        .find('[')
        .ok_or_else(|| ParseAnomaly::new("FLEX line without capcode"))?;
    let close = rest[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| ParseAnomaly::new("FLEX capcode not closed"))?;
    let capcode = parse_flex_capcode(&rest[open + 1..close])?;
    let (kind, text) = split_token(&rest[close + 1..]);

    Ok(PagerMessage {
        protocol: "FLEX".to_string(),
        capcode,
        function: None,
        content: flex_content(kind),
        text: clean_text(text),
    })
}

fn parse_flex_pipe(rest: &str) -> Result<PagerMessage, ParseAnomaly> {
    // time|baud/phase|cycle.frame|capcode|type|text
    let fields: Vec<&str> = rest.splitn(6, '|').collect();
    if fields.len() < 6 {
        return Err(ParseAnomaly::new(format!(
            "FLEX record has {} fields, expected 7",
            fields.len() + 1
        )));
    }
    let capcode = parse_flex_capcode(fields[3])?;

    Ok(PagerMessage {
        protocol: "FLEX".to_string(),
        capcode,
        function: None,
        content: flex_content(fields[4].trim()),
        text: clean_text(fields[5]),
    })
}

fn parse_flex_capcode(raw: &str) -> Result<u32, ParseAnomaly> {
    let digits = raw.trim().trim_start_matches('C');
    digits
        .parse::<u32>()
        .map_err(|_| ParseAnomaly::new(format!("bad FLEX capcode {:?}", raw)))
}

fn flex_content(kind: &str) -> PagerContent {
    match kind {
        "NUM" | "NUMERIC" => PagerContent::Numeric,
        "TON" | "TONE" => PagerContent::Tone,
        _ => PagerContent::Alpha,
    }
}

/// First whitespace-delimited token and the remainder
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

fn clean_text(text: &str) -> String {
    let mut text = text.trim();
    loop {
        let before = text;
        for marker in CONTROL_MARKERS {
            text = text.trim_end_matches(marker).trim_end();
        }
        if text == before {
            break;
        }
    }
    text.to_string()
}

//! Decoder output parsing
//!
//! Each mode's decoder prints its own line grammar. A [`RecordDecoder`]
//! implements one grammar as a line-driven state machine; [`EventDecoder`]
//! adds byte framing and anomaly counting on top; [`parse`] turns a decoder's
//! stdout into a lazy stream of payloads that ends when the stdout closes.
//!
//! ```text
//! ProcessOutput --bytes--> LineFramer --lines--> RecordDecoder --> EventPayload
//! ```

mod aircraft;
mod bluetooth;
mod framing;
mod pager;
mod sensor;
mod spectrum;
mod wifi;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::event::EventPayload;

pub use aircraft::AircraftDecoder;
pub use bluetooth::BluetoothDecoder;
pub use framing::{FramedLine, LineFramer, MAX_LINE_BYTES};
pub use pager::PagerDecoder;
pub use sensor::SensorDecoder;
pub use spectrum::SpectrumDecoder;
pub use wifi::WifiDecoder;

const READ_CHUNK: usize = 8192;

/// Which grammar a mode's output follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Pager,
    Sensor,
    Aircraft,
    Spectrum,
    Wifi,
    Bluetooth,
}

impl ParserKind {
    pub fn decoder(self) -> Box<dyn RecordDecoder> {
        match self {
            ParserKind::Pager => Box::new(PagerDecoder),
            ParserKind::Sensor => Box::new(SensorDecoder),
            ParserKind::Aircraft => Box::new(AircraftDecoder::default()),
            ParserKind::Spectrum => Box::new(SpectrumDecoder),
            ParserKind::Wifi => Box::new(WifiDecoder::default()),
            ParserKind::Bluetooth => Box::new(BluetoothDecoder::default()),
        }
    }
}

/// A line looked like a record of the grammar but could not be interpreted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record: {0}")]
pub struct ParseAnomaly(pub String);

impl ParseAnomaly {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        ParseAnomaly(msg.into())
    }
}

/// One decoder output grammar
pub trait RecordDecoder: Send {
    /// Consume one complete line (terminator removed). Recognised chatter
    /// that carries no record is `Ok` with nothing pushed.
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly>;

    /// The stream closed; emit anything still buffered that is complete enough
    fn finish(&mut self, _out: &mut Vec<EventPayload>) {}
}

/// Per-mode parser counters
#[derive(Debug, Default)]
pub struct ParseStats {
    lines: AtomicU64,
    events: AtomicU64,
    anomalies: AtomicU64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events(&self, n: usize) {
        self.events.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    pub fn get_events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn get_anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }
}

/// Byte-level front end for one [`RecordDecoder`]
pub struct EventDecoder {
    label: String,
    framer: LineFramer,
    decoder: Box<dyn RecordDecoder>,
    stats: Arc<ParseStats>,
}

impl EventDecoder {
    pub fn new(label: impl Into<String>, kind: ParserKind, stats: Arc<ParseStats>) -> Self {
        Self {
            label: label.into(),
            framer: LineFramer::new(MAX_LINE_BYTES),
            decoder: kind.decoder(),
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ParseStats> {
        &self.stats
    }

    /// Feed a chunk of raw output; a trailing partial line stays buffered
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<EventPayload> {
        let mut out = Vec::new();
        for framed in self.framer.push(bytes) {
            match framed {
                FramedLine::Line(line) => {
                    self.stats.record_line();
                    if let Err(anomaly) = self.decoder.feed_line(&line, &mut out) {
                        self.stats.record_anomaly();
                        debug!("[{}] {}", self.label, anomaly);
                    }
                }
                FramedLine::Overlong(len) => {
                    self.stats.record_anomaly();
                    debug!("[{}] Dropped over-long line ({} bytes buffered)", self.label, len);
                }
            }
        }
        self.stats.record_events(out.len());
        out
    }

    /// The output closed: discard a truncated final line and flush the decoder
    pub fn finish(&mut self) -> Vec<EventPayload> {
        if let Some(len) = self.framer.finish() {
            self.stats.record_anomaly();
            debug!("[{}] Discarded {} bytes of unterminated output", self.label, len);
        }
        let mut out = Vec::new();
        self.decoder.finish(&mut out);
        self.stats.record_events(out.len());
        out
    }
}

struct ParseState<R> {
    reader: R,
    decoder: EventDecoder,
    pending: VecDeque<EventPayload>,
    buf: Vec<u8>,
    done: bool,
}

/// Lazily parse `reader` into payloads. Not restartable; ends when `reader` hits EOF.
pub fn parse<R>(reader: R, decoder: EventDecoder) -> impl Stream<Item = EventPayload> + Send
where
    R: AsyncRead + Unpin + Send,
{
    let state = ParseState {
        reader,
        decoder,
        pending: VecDeque::new(),
        buf: vec![0u8; READ_CHUNK],
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((event, st));
            }
            if st.done {
                return None;
            }
            match st.reader.read(&mut st.buf).await {
                Ok(0) => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.pending.extend(tail);
                }
                Ok(n) => {
                    let events = st.decoder.feed(&st.buf[..n]);
                    st.pending.extend(events);
                }
                Err(e) => {
                    warn!("[{}] Error reading decoder output: {}", st.decoder.label, e);
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.pending.extend(tail);
                }
            }
        }
    })
}

/// Round to `places` decimals; unit conversions otherwise leak float noise
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// `AA:BB:CC:DD:EE:FF` (either case, `-` accepted) normalised to uppercase with colons
pub(crate) fn normalize_mac(s: &str) -> Option<String> {
    let s = s.trim();
    let parts: Vec<&str> = s.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    const AIRCRAFT_BLOCK: &str = "*8d4ca2b1200464b3ce0c20a1b2c3;\n\
        ICAO Address   : 4CA2B1\n\
        Identification : BAW123\n\
        Altitude       : 35000 ft\n\
        Speed          : 450 kt\n\
        \n";

    fn decoder(kind: ParserKind) -> EventDecoder {
        EventDecoder::new("test", kind, Arc::new(ParseStats::new()))
    }

    #[test]
    fn test_truncated_line_completes_exactly_once() {
        let mut dec = decoder(ParserKind::Wifi);
        let record = "aa:bb:cc:dd:ee:ff\tcafe\t6\t-52\n";
        let (head, tail) = record.split_at(10);

        assert!(dec.feed(head.as_bytes()).is_empty());
        assert_eq!(dec.stats().get_anomalies(), 0);

        let events = dec.feed(tail.as_bytes());
        assert_eq!(events.len(), 1);
        assert!(dec.feed(b"").is_empty());
        assert!(dec.finish().is_empty());
        assert_eq!(dec.stats().get_events(), 1);
    }

    #[test]
    fn test_unterminated_final_line_is_counted_not_emitted() {
        let mut dec = decoder(ParserKind::Wifi);
        assert!(dec.feed(b"aa:bb:cc:dd:ee:ff\tcafe\t6").is_empty());
        assert!(dec.finish().is_empty());
        assert_eq!(dec.stats().get_anomalies(), 1);
        assert_eq!(dec.stats().get_events(), 0);
    }

    #[test]
    fn test_aircraft_block_split_across_reads() {
        let mut dec = decoder(ParserKind::Aircraft);
        let bytes = AIRCRAFT_BLOCK.as_bytes();
        let mut events = Vec::new();
        for chunk in bytes.chunks(7) {
            events.extend(dec.feed(chunk));
        }
        assert_eq!(events.len(), 1);
        match &events[0] {
            EventPayload::Aircraft(a) => {
                assert_eq!(a.icao, "4CA2B1");
                assert_eq!(a.callsign.as_deref(), Some("BAW123"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parse_stream_ends_with_reader() {
        let input = format!("{}{}", AIRCRAFT_BLOCK, AIRCRAFT_BLOCK);
        let stream = parse(input.as_bytes(), decoder(ParserKind::Aircraft));
        let events: Vec<EventPayload> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], events[1]);
    }

    #[tokio::test]
    async fn test_parse_stream_flushes_open_block_at_eof() {
        let input = "ICAO Address : 4CA2B1\nAltitude : 1000 m\n";
        let stream = parse(input.as_bytes(), decoder(ParserKind::Aircraft));
        let events: Vec<EventPayload> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee:0f").as_deref(), Some("AA:BB:CC:DD:EE:0F"));
        assert_eq!(normalize_mac("AA-BB-CC-DD-EE-FF").as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert!(normalize_mac("AA:BB:CC:DD:EE").is_none());
        assert!(normalize_mac("GG:BB:CC:DD:EE:FF").is_none());
    }
}

//! NMEA 0183 GPS receiver, fed one byte at a time.
//!
//! The scheduler drains the UART buffer a byte per call in the time left
//! over in each slice, so nothing here may block. Complete sentences with a
//! good checksum go on the bus as [`GpsSentence`]; an active RMC fix also
//! becomes a [`GroundVelocitySample`] for the wind estimator.

use core::f32::consts::TAU;
use core::str::FromStr;

use micromath::F32Ext;

use crate::bus::MessageBus;
use crate::state::{GpsSentence, GroundVelocitySample};
use crate::time::{Clock, Duration, Instant};

pub const MPS_PER_KNOT: f32 = 0.514_444;

/// No nav solution for this long means the receiver is gone.
pub const GPS_TIMEOUT: Duration = Duration::millis(2500);

const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;

/// Source of raw receiver bytes, typically a UART ring buffer.
pub trait GpsStream {
    /// Next buffered byte, `None` when the buffer is empty.
    fn read_byte(&mut self) -> Option<u8>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpsState {
    #[default]
    Unknown,
    Detecting,
    ReceivingData,
    LostCommunication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NmeaFrame {
    #[default]
    None,
    Gga,
    Rmc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GpsData {
    // ── Position ──
    pub lat: f32,          // Decimal degrees
    pub lon: f32,          // Decimal degrees
    pub alt: f32,          // Metres (MSL)

    // ── Velocity (RMC) ──
    pub speed_knots: f32,
    pub course: f32,       // Degrees true
    pub active: bool,      // RMC status A

    // ── Fix (GGA) ──
    pub sats: u8,
    pub fix_quality: u8,   // 0=no fix 1=GPS 2=DGPS …
    pub fix: bool,
    pub hdop: f32,

    // ── UTC from RMC ──
    pub utc_time: u32,     // hhmmss
    pub utc_date: u32,     // ddmmyy

    // ── Counters ──
    pub sentences_rx: u16,
    pub checksum_errors: u16,
    pub frame_errors: u16,
    pub gga_count: u16,
    pub rmc_count: u16,
    pub unknown_count: u16,
    pub last_frame: NmeaFrame,
}

/// Sentence assembler and field decoder.
pub struct NmeaParser {
    buffer: heapless::String<128>,
    pub data: GpsData,
    // Speed field of the latest RMC parsed
    rmc_speed_fresh: bool,
}

impl Default for NmeaParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NmeaParser {
    pub fn new() -> Self {
        Self {
            buffer: heapless::String::new(),
            data: GpsData::default(),
            rmc_speed_fresh: false,
        }
    }

    /// Feeds one byte. Returns the frame type once a sentence with a valid
    /// checksum is complete; the sentence text stays in [`Self::sentence`]
    /// until the next byte.
    pub fn push_byte(&mut self, b: u8) -> Option<NmeaFrame> {
        if b == b'$' {
            self.buffer.clear();
        }
        if self.buffer.ends_with('\n') {
            self.buffer.clear();
        }

        if !b.is_ascii() || self.buffer.push(b as char).is_err() {
            self.data.frame_errors = self.data.frame_errors.wrapping_add(1);
            self.buffer.clear();
            return None;
        }

        if b == b'\n' {
            self.parse_sentence()
        } else {
            None
        }
    }

    /// The last complete sentence without line ending.
    pub fn sentence(&self) -> &str {
        self.buffer.as_str().trim()
    }

    fn parse_sentence(&mut self) -> Option<NmeaFrame> {
        // Copy out so the field parsers can take &mut self
        let mut local: heapless::String<128> = heapless::String::new();
        let _ = local.push_str(self.buffer.as_str().trim());
        let s = local.as_str();

        if s.len() < 6 || !s.starts_with('$') {
            return None;
        }

        if !verify_checksum(s) {
            self.data.checksum_errors = self.data.checksum_errors.wrapping_add(1);
            return None;
        }

        let frame = match &s[3..6] {
            "GGA" => NmeaFrame::Gga,
            "RMC" => NmeaFrame::Rmc,
            _ => NmeaFrame::None,
        };

        self.data.sentences_rx = self.data.sentences_rx.wrapping_add(1);
        self.data.last_frame = frame;

        match frame {
            NmeaFrame::Gga => self.parse_gga(s),
            NmeaFrame::Rmc => self.parse_rmc(s),
            NmeaFrame::None => {
                self.data.unknown_count = self.data.unknown_count.wrapping_add(1);
            }
        }
        Some(frame)
    }

    // ────── GGA ──────
    fn parse_gga(&mut self, s: &str) {
        self.data.gga_count = self.data.gga_count.wrapping_add(1);
        // $xxGGA,time,lat,NS,lon,EW,qual,sats,hdop,alt,M,geoid,M,…*CS
        let mut parts = s.split(',');
        parts.next(); // ID
        parts.next(); // Time

        let lat_raw = parts.next().unwrap_or("");
        let ns = parts.next().unwrap_or("");
        let lon_raw = parts.next().unwrap_or("");
        let ew = parts.next().unwrap_or("");
        let qual_str = parts.next().unwrap_or("");
        let sats_str = parts.next().unwrap_or("");
        let hdop_str = parts.next().unwrap_or("");
        let alt_str = parts.next().unwrap_or("");

        match u8::from_str(qual_str) {
            Ok(q) => {
                self.data.fix_quality = q;
                self.data.fix = q > 0;
            }
            Err(_) => {
                self.data.fix_quality = 0;
                self.data.fix = false;
            }
        }

        if let Ok(n) = u8::from_str(sats_str) {
            self.data.sats = n;
        }
        if let Ok(h) = f32::from_str(hdop_str) {
            self.data.hdop = h;
        }
        if let Ok(a) = f32::from_str(alt_str) {
            self.data.alt = a;
        }
        if let Some(lat) = coord_to_degrees(lat_raw, ns == "S") {
            self.data.lat = lat;
        }
        if let Some(lon) = coord_to_degrees(lon_raw, ew == "W") {
            self.data.lon = lon;
        }
    }

    // ────── RMC ──────
    fn parse_rmc(&mut self, s: &str) {
        self.data.rmc_count = self.data.rmc_count.wrapping_add(1);
        self.rmc_speed_fresh = false;
        // $xxRMC,time,status,lat,NS,lon,EW,speed,course,date,…*CS
        let mut parts = s.split(',');
        parts.next(); // ID

        let time_str = parts.next().unwrap_or("");
        if time_str.len() >= 6 {
            if let Ok(t) = u32::from_str(&time_str[..6]) {
                self.data.utc_time = t;
            }
        }

        self.data.active = parts.next() == Some("A");

        // Position comes from GGA
        for _ in 0..4 {
            parts.next();
        }

        let speed_raw = parts.next().unwrap_or("");
        let course_raw = parts.next().unwrap_or("");
        let date_str = parts.next().unwrap_or("");

        if let Ok(d) = u32::from_str(date_str) {
            self.data.utc_date = d;
        }
        if let Ok(spd) = f32::from_str(speed_raw) {
            self.data.speed_knots = spd;
            self.rmc_speed_fresh = true;
        }
        match f32::from_str(course_raw) {
            Ok(crs) => self.data.course = crs,
            // Receivers leave course empty when stationary
            Err(_) if !speed_raw.is_empty() => self.data.course = 0.0,
            Err(_) => {}
        }
    }

    /// Ground velocity from the latest RMC, if it carried an active fix and
    /// a speed. Course may be empty while stationary.
    pub fn ground_velocity(&self) -> Option<GroundVelocitySample> {
        if !self.data.active || !self.rmc_speed_fresh {
            return None;
        }
        let mut track = self.data.course * DEG_TO_RAD;
        if track < 0.0 {
            track += TAU;
        }
        if track >= TAU {
            track -= TAU;
        }
        Some(GroundVelocitySample {
            track_angle: track,
            speed: self.data.speed_knots * MPS_PER_KNOT,
        })
    }
}

// ddmm.mmmm → decimal degrees
fn coord_to_degrees(raw: &str, negative: bool) -> Option<f32> {
    let value = f32::from_str(raw).ok()?;
    let deg = (value / 100.0).floor();
    let min = value - deg * 100.0;
    let degrees = deg + min / 60.0;
    Some(if negative { -degrees } else { degrees })
}

fn verify_checksum(s: &str) -> bool {
    if let Some((content, check_str)) = s.split_once('*') {
        let content = content.strip_prefix('$').unwrap_or(content);
        let mut calc = 0u8;
        for b in content.bytes() {
            calc ^= b;
        }
        // Only take first 2 hex chars (ignore trailing garbage)
        let hex = check_str.get(..2).unwrap_or(check_str);
        if let Ok(val) = u8::from_str_radix(hex.trim(), 16) {
            return calc == val;
        }
    }
    false
}

/// Receiver bound to its byte stream.
pub struct Gps<S> {
    stream: S,
    parser: NmeaParser,
    state: GpsState,
    last_byte: Option<Instant>,
    last_nav: Option<Instant>,
    timeouts: u16,
}

impl<S: GpsStream> Gps<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            parser: NmeaParser::new(),
            state: GpsState::Unknown,
            last_byte: None,
            last_nav: None,
            timeouts: 0,
        }
    }

    pub fn data(&self) -> GpsData {
        self.parser.data
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn state(&self) -> GpsState {
        self.state
    }

    pub fn timeouts(&self) -> u16 {
        self.timeouts
    }

    /// Parses one buffered byte, publishing whatever it completes. Returns
    /// false once the buffer is empty.
    pub fn drain_byte<C: Clock>(&mut self, bus: &MessageBus<'_, C>) -> bool {
        let Some(b) = self.stream.read_byte() else {
            return false;
        };
        let now = bus.clock().now();
        self.last_byte = Some(now);

        let Some(frame) = self.parser.push_byte(b) else {
            return true;
        };

        let mut nmea = heapless::String::new();
        if nmea.push_str(self.parser.sentence()).is_ok() {
            bus.publish(&GpsSentence { time: now, nmea });
        }

        match frame {
            NmeaFrame::Gga => self.last_nav = Some(now),
            NmeaFrame::Rmc => {
                if let Some(v) = self.parser.ground_velocity() {
                    bus.publish(&v);
                }
            }
            NmeaFrame::None => {}
        }
        true
    }

    /// Link supervision, run from the once-per-second GPS slot.
    pub fn update(&mut self, now: Instant) -> GpsState {
        let stale = |t: Option<Instant>| match t {
            Some(t) => now.checked_duration_since(t).is_some_and(|d| d > GPS_TIMEOUT),
            None => true,
        };

        let next = match self.state {
            GpsState::Unknown | GpsState::LostCommunication if !stale(self.last_byte) => {
                GpsState::Detecting
            }
            GpsState::Detecting if !stale(self.last_nav) => GpsState::ReceivingData,
            GpsState::ReceivingData if stale(self.last_nav) => {
                self.timeouts = self.timeouts.wrapping_add(1);
                self.parser.data.fix = false;
                self.parser.data.sats = 0;
                self.parser.data.active = false;
                defmt_or_log::warn!("gps lost communication");
                GpsState::LostCommunication
            }
            state => state,
        };
        if next != self.state {
            defmt_or_log::info!("gps {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        next
    }
}

//! Text recorder for everything that crosses the message bus.
//!
//! One line per message, timestamped in ms since the log started:
//!
//! ```text
//! V0.1.0
//! P1203,100009
//! M1210,A,0.01,-0.02,1.003,Q,0.001,0.002,0
//! G1250,$GPRMC,...
//! #1300,imu acceleration rejected ...
//! ```
//!
//! Writing the lines somewhere durable is the [`LogSink`]'s business.

use core::cell::{Cell, RefCell};
use core::fmt::Write;

use crate::bus::{MessageBus, Subscriber};
use crate::error::BusError;
use crate::state::{Comment, GpsSentence, MotionSample, PressureSample};
use crate::time::{millis_since, Clock, Instant};

pub const LINE_MAX_LEN: usize = 128;

pub type LogLine = heapless::String<LINE_MAX_LEN>;

/// Destination for rendered log lines (without trailing newline).
pub trait LogSink {
    fn write_line(&mut self, line: &str);
}

pub struct BusLogger<W> {
    sink: RefCell<W>,
    start: Cell<Option<Instant>>,
}

impl<W: LogSink> BusLogger<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: RefCell::new(sink),
            start: Cell::new(None),
        }
    }

    pub fn is_logging(&self) -> bool {
        self.start.get().is_some()
    }

    /// Writes the version header and subscribes to every message type.
    pub fn start<'a, C: Clock>(&'a self, bus: &MessageBus<'a, C>) -> Result<(), BusError> {
        // Never subscribed twice
        self.unsubscribe_all(bus);
        if let Err(e) = self.subscribe_all(bus) {
            self.unsubscribe_all(bus);
            defmt_or_log::warn!("bus log not started: {:?}", e);
            return Err(e);
        }

        self.start.set(Some(bus.clock().now()));
        let mut line = LogLine::new();
        let _ = write!(line, "V{}", env!("CARGO_PKG_VERSION"));
        self.emit(&line);
        Ok(())
    }

    pub fn stop<C: Clock>(&self, bus: &MessageBus<'_, C>) {
        self.unsubscribe_all(bus);
        self.start.set(None);
    }

    pub fn with_sink<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.sink.borrow_mut())
    }

    fn subscribe_all<'a, C: Clock>(&'a self, bus: &MessageBus<'a, C>) -> Result<(), BusError> {
        bus.subscribe::<PressureSample>(self)?;
        bus.subscribe::<MotionSample>(self)?;
        bus.subscribe::<GpsSentence>(self)?;
        bus.subscribe::<Comment>(self)?;
        Ok(())
    }

    fn unsubscribe_all<C: Clock>(&self, bus: &MessageBus<'_, C>) {
        bus.unsubscribe::<PressureSample>(self);
        bus.unsubscribe::<MotionSample>(self);
        bus.unsubscribe::<GpsSentence>(self);
        bus.unsubscribe::<Comment>(self);
    }

    // None when not logging
    fn elapsed_ms(&self, time: Instant) -> Option<u32> {
        self.start.get().map(|start| millis_since(start, time))
    }

    fn emit(&self, line: &str) {
        self.sink.borrow_mut().write_line(line);
    }
}

impl<W: LogSink> Subscriber<PressureSample> for BusLogger<W> {
    fn on_receive(&self, msg: &PressureSample) {
        let Some(ms) = self.elapsed_ms(msg.time) else { return };
        let mut line = LogLine::new();
        let _ = write!(line, "P{},{}", ms, msg.pressure);
        self.emit(&line);
    }
}

impl<W: LogSink> Subscriber<MotionSample> for BusLogger<W> {
    fn on_receive(&self, msg: &MotionSample) {
        let Some(ms) = self.elapsed_ms(msg.time) else { return };
        let mut line = LogLine::new();
        let _ = write!(
            line,
            "M{},{},{},{},{},{},{},{},{}",
            ms,
            if msg.has_accel { 'A' } else { 'a' },
            msg.ax,
            msg.ay,
            msg.az,
            if msg.has_orientation { 'Q' } else { 'q' },
            msg.qx,
            msg.qy,
            msg.qz
        );
        self.emit(&line);
    }
}

impl<W: LogSink> Subscriber<GpsSentence> for BusLogger<W> {
    fn on_receive(&self, msg: &GpsSentence) {
        let Some(ms) = self.elapsed_ms(msg.time) else { return };
        let mut line = LogLine::new();
        let _ = write!(line, "G{},{}", ms, msg.nmea);
        self.emit(&line);
    }
}

impl<W: LogSink> Subscriber<Comment> for BusLogger<W> {
    fn on_receive(&self, msg: &Comment) {
        let Some(ms) = self.elapsed_ms(msg.time) else { return };
        let mut line = LogLine::new();
        let _ = write!(line, "#{},{}", ms, msg.text);
        self.emit(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at_ms, ManualClock};

    #[derive(Default)]
    struct Lines(Vec<String>);

    impl LogSink for Lines {
        fn write_line(&mut self, line: &str) {
            self.0.push(line.to_string());
        }
    }

    #[test]
    fn records_each_message_type() {
        let clock = ManualClock::new();
        clock.advance_ms(1000);
        let logger = BusLogger::new(Lines::default());
        let bus = MessageBus::new(&clock);
        logger.start(&bus).unwrap();

        bus.publish(&PressureSample { time: at_ms(1203), pressure: 100_009 });
        let mut motion = MotionSample::empty(at_ms(1210));
        motion.has_accel = true;
        motion.az = 1.5;
        bus.publish(&motion);
        let mut nmea = heapless::String::new();
        nmea.push_str("$GPGGA,1*00").unwrap();
        bus.publish(&GpsSentence { time: at_ms(1250), nmea });
        bus.publish(&Comment::new(at_ms(1300), format_args!("hello {}", 7)));

        logger.with_sink(|lines| {
            assert_eq!(
                lines.0,
                vec![
                    format!("V{}", env!("CARGO_PKG_VERSION")),
                    "P203,100009".to_string(),
                    "M210,A,0,0,1.5,q,0,0,0".to_string(),
                    "G250,$GPGGA,1*00".to_string(),
                    "#300,hello 7".to_string(),
                ]
            )
        });
    }

    #[test]
    fn stop_unsubscribes() {
        let clock = ManualClock::new();
        let logger = BusLogger::new(Lines::default());
        let bus = MessageBus::new(&clock);
        logger.start(&bus).unwrap();
        logger.start(&bus).unwrap();
        assert_eq!(bus.subscriber_count::<PressureSample>(), 1);

        logger.stop(&bus);
        assert!(!logger.is_logging());
        assert_eq!(bus.subscriber_count::<Comment>(), 0);
        bus.publish(&PressureSample { time: at_ms(5), pressure: 1 });
        logger.with_sink(|lines| assert_eq!(lines.0.len(), 2));
    }
}

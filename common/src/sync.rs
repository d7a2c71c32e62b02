use crate::{
    address_space::{AddressSpace, DataServer, PointHandle},
    sensing::{AnalogInput, MotionSensor, SensorError, SensorSuite},
    types::SensorReading,
};

#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub reading: Option<SensorReading>,
    pub sensor_error: Option<SensorError>,
    pub points_written: usize,
    /// Counted, never retried.
    pub server_errors: usize,
    pub portal_requests: usize,
}

/// Pushes one fresh reading into the address space and the server per tick.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    order: Vec<PointHandle>,
    ticks: u64,
}

impl SyncEngine {
    pub fn new(space: &AddressSpace) -> Self {
        Self {
            order: space.handles().collect(),
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Acquire, write in table order, then one step of server processing.
    ///
    /// A failed acquisition skips the writes for this tick rather than
    /// publishing stale or invented values.
    pub fn tick<A, M, S>(
        &mut self,
        sensors: &mut SensorSuite<A, M>,
        space: &mut AddressSpace,
        server: &mut S,
    ) -> TickReport
    where
        A: AnalogInput,
        M: MotionSensor,
        S: DataServer,
    {
        self.ticks = self.ticks.saturating_add(1);
        let mut report = TickReport {
            tick: self.ticks,
            reading: None,
            sensor_error: None,
            points_written: 0,
            server_errors: 0,
            portal_requests: 0,
        };

        match sensors.read() {
            Ok(reading) => {
                for (handle, value) in self.order.iter().zip(reading.values()) {
                    space.write(*handle, value);
                    report.points_written += 1;
                    if server
                        .write_value(&space.point(*handle).node_id, value)
                        .is_err()
                    {
                        report.server_errors += 1;
                    }
                }
                report.reading = Some(reading);
            }
            Err(err) => report.sensor_error = Some(err),
        }

        server.run_iterate();
        report
    }
}

/// Fixed-period pacing without catch-up: an overrun tick is followed
/// immediately by the next one, and the lost time is never recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    period_ms: u64,
}

impl Cadence {
    pub fn new(period_ms: u64) -> Self {
        Self { period_ms }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Time left to sleep for a tick that started at `started_ms`.
    pub fn remaining(&self, started_ms: u64, now_ms: u64) -> u64 {
        let elapsed = now_ms.saturating_sub(started_ms);
        self.period_ms.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AdcConfig,
        testing::{FakeAnalog, FakeMotion, RecordingServer},
        types::Acceleration,
    };
    use pretty_assertions::assert_eq;

    fn suite() -> SensorSuite<FakeAnalog, FakeMotion> {
        SensorSuite::new(
            AdcConfig::default(),
            FakeAnalog::sequence(vec![620, 931, 1_241]),
            FakeMotion::fixed(Acceleration {
                x: 0.1,
                y: 0.2,
                z: 9.8,
            }),
        )
    }

    #[test]
    fn every_point_written_once_per_tick_in_order() {
        let mut space = AddressSpace::populate(1);
        let mut engine = SyncEngine::new(&space);
        let mut sensors = suite();
        let mut server = RecordingServer::default();

        const TICKS: usize = 25;
        for _ in 0..TICKS {
            let report = engine.tick(&mut sensors, &mut space, &mut server);
            assert_eq!(report.points_written, 4);
            assert_eq!(report.server_errors, 0);
        }

        assert_eq!(engine.ticks(), TICKS as u64);
        assert_eq!(server.writes.len(), TICKS * 4);
        assert_eq!(server.iterations, TICKS);

        for chunk in server.writes.chunks(4) {
            let order: Vec<_> = chunk.iter().map(|(id, _)| id.identifier.as_str()).collect();
            assert_eq!(
                order,
                vec!["Temperature", "AccelerationX", "AccelerationY", "AccelerationZ"]
            );
        }
    }

    #[test]
    fn address_space_holds_latest_reading() {
        let mut space = AddressSpace::populate(1);
        let mut engine = SyncEngine::new(&space);
        let mut sensors = suite();
        let mut server = RecordingServer::default();

        engine.tick(&mut sensors, &mut space, &mut server);
        let report = engine.tick(&mut sensors, &mut space, &mut server);
        let reading = report.reading.unwrap();

        let values: Vec<_> = space.points().iter().map(|point| point.value).collect();
        assert_eq!(values, reading.values().to_vec());
        assert!((reading.temperature_c - 25.0).abs() < 0.1);
    }

    #[test]
    fn server_failures_are_counted_not_retried() {
        let mut space = AddressSpace::populate(1);
        let mut engine = SyncEngine::new(&space);
        let mut sensors = suite();
        let mut server = RecordingServer::rejecting_writes();

        let report = engine.tick(&mut sensors, &mut space, &mut server);

        assert_eq!(report.points_written, 4);
        assert_eq!(report.server_errors, 4);
        assert_eq!(server.write_attempts, 4);
        assert_eq!(server.iterations, 1);
        assert!(space.points().iter().all(|point| point.value != 0.0));
    }

    #[test]
    fn sensor_failure_skips_writes_but_still_iterates() {
        let mut space = AddressSpace::populate(1);
        let mut engine = SyncEngine::new(&space);
        let mut sensors =
            SensorSuite::new(AdcConfig::default(), FakeAnalog::fixed(900), FakeMotion::failing());
        let mut server = RecordingServer::default();

        let report = engine.tick(&mut sensors, &mut space, &mut server);

        assert!(report.sensor_error.is_some());
        assert_eq!(report.points_written, 0);
        assert!(server.writes.is_empty());
        assert_eq!(server.iterations, 1);
    }

    #[test]
    fn remaining_saturates_on_overrun() {
        let cadence = Cadence::new(1_000);
        assert_eq!(cadence.remaining(5_000, 5_000), 1_000);
        assert_eq!(cadence.remaining(5_000, 5_250), 750);
        assert_eq!(cadence.remaining(5_000, 6_000), 0);
        assert_eq!(cadence.remaining(5_000, 7_500), 0);
    }

    fn simulate(duration_ms: u64, period_ms: u64, work_ms: impl Fn(u64) -> u64) -> u64 {
        let cadence = Cadence::new(period_ms);
        let mut now = 0_u64;
        let mut ticks = 0_u64;
        while now < duration_ms {
            let started = now;
            ticks += 1;
            now += work_ms(ticks);
            now += cadence.remaining(started, now);
        }
        ticks
    }

    #[test]
    fn tick_count_tracks_duration_over_period() {
        let ticks = simulate(60_000, 1_000, |_| 3);
        assert!(ticks.abs_diff(60) <= 1, "ran {ticks} ticks");

        let ticks = simulate(10_000, 250, |_| 0);
        assert!(ticks.abs_diff(40) <= 1, "ran {ticks} ticks");
    }

    #[test]
    fn overrun_starts_next_tick_immediately_without_catch_up() {
        // Tick 3 overruns by 1.5 periods; nothing is skipped or doubled, the
        // schedule simply drifts.
        let cadence = Cadence::new(1_000);
        let mut starts = Vec::new();
        let mut now = 0_u64;
        for tick in 1..=6_u64 {
            starts.push(now);
            now += if tick == 3 { 2_500 } else { 10 };
            now += cadence.remaining(*starts.last().unwrap(), now);
        }

        assert_eq!(starts, vec![0, 1_000, 2_000, 4_500, 5_500, 6_500]);
    }
}

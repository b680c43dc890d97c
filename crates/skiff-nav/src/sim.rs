use anyhow::Result;
use rand::Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::compass::CompassReading;
use crate::gnss::GpsReading;
use crate::sensor::{SensorCell, SensorWorker, StopFlag};

/// A boat drifting around San Francisco Bay, for bench runs without hardware.
#[derive(Debug, Clone)]
pub struct SimBoat {
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    pub speed_knots: f64,
}

impl SimBoat {
    pub fn new(rng: &mut impl Rng) -> Self {
        Self {
            latitude: 37.7749 + (rng.gen::<f64>() - 0.5) * 0.05,
            longitude: -122.4194 + (rng.gen::<f64>() - 0.5) * 0.05,
            heading: rng.gen::<f64>() * 360.0,
            speed_knots: rng.gen::<f64>() * 5.0,
        }
    }

    /// Dead-reckon one tick and let heading and speed wander a little.
    pub fn step(&mut self, rng: &mut impl Rng) {
        let h = self.heading.to_radians();
        self.latitude += self.speed_knots * 0.0001 * h.cos();
        self.longitude += self.speed_knots * 0.0001 * h.sin();

        if rng.gen_bool(0.1) {
            self.heading = (self.heading + (rng.gen::<f64>() - 0.5) * 10.0).rem_euclid(360.0);
        }
        if rng.gen_bool(0.05) {
            self.speed_knots = (self.speed_knots + rng.gen::<f64>() - 0.5).clamp(0.0, 10.0);
        }
    }

    pub fn gps(&self) -> GpsReading {
        GpsReading {
            latitude: Some(self.latitude),
            longitude: Some(self.longitude),
            speed_knots: Some(self.speed_knots),
            course: Some(self.heading),
            satellites: Some(9),
            fix_quality: Some(1),
            running: true,
        }
    }

    pub fn compass(&self, noise_deg: f64) -> CompassReading {
        CompassReading {
            heading: (self.heading + noise_deg).rem_euclid(360.0),
            connected: true,
            ..CompassReading::default()
        }
    }
}

pub type SharedBoat = Arc<Mutex<SimBoat>>;

pub fn shared_boat() -> SharedBoat {
    Arc::new(Mutex::new(SimBoat::new(&mut rand::thread_rng())))
}

/// Simulated GPS. When `drives` is set this worker also advances the boat.
pub fn spawn_gps(boat: SharedBoat, period: Duration, drives: bool) -> Result<(SensorCell<GpsReading>, SensorWorker)> {
    let cell = SensorCell::new(GpsReading { running: true, ..GpsReading::default() });
    let writer = cell.clone();
    let worker = SensorWorker::spawn("gnss-sim", Duration::from_secs(1), move |stop: &StopFlag| {
        let reading = {
            let mut b = boat.lock().unwrap_or_else(PoisonError::into_inner);
            if drives {
                b.step(&mut rand::thread_rng());
            }
            b.gps()
        };
        writer.publish(reading);
        stop.nap(period);
        Ok(())
    })?;
    Ok((cell, worker))
}

/// Simulated compass with a couple of degrees of jitter.
pub fn spawn_compass(boat: SharedBoat, period: Duration, drives: bool) -> Result<(SensorCell<CompassReading>, SensorWorker)> {
    let cell = SensorCell::new(CompassReading::default());
    let writer = cell.clone();
    let worker = SensorWorker::spawn("compass-sim", Duration::from_secs(1), move |stop: &StopFlag| {
        let mut rng = rand::thread_rng();
        let reading = {
            let mut b = boat.lock().unwrap_or_else(PoisonError::into_inner);
            if drives {
                b.step(&mut rng);
            }
            b.compass(rng.gen_range(-2.0..=2.0))
        };
        writer.publish(reading);
        stop.nap(period);
        Ok(())
    })?;
    Ok((cell, worker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn boat_moves_along_its_heading() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut boat = SimBoat::new(&mut rng);
        boat.heading = 0.0;
        boat.speed_knots = 4.0;
        let lat0 = boat.latitude;
        boat.step(&mut rng);
        assert!(boat.latitude > lat0);
        assert!((0.0..360.0).contains(&boat.heading));
        assert!((0.0..=10.0).contains(&boat.speed_knots));
    }

    #[test]
    fn sim_gps_always_has_a_fix() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(SimBoat::new(&mut rng).gps().has_fix());
    }
}

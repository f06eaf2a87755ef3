//! Synthetic telemetry for demos and load tests.

use crate::model::SensorReading;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct Simulation {
    pub machines: usize,
    pub metrics: Vec<String>,
    /// Readings per stream.
    pub readings: usize,
    pub interval: Duration,
    pub start: DateTime<Utc>,
    /// Every n-th reading of a stream is a spike. 0 disables spikes.
    pub spike_every: usize,
    pub seed: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            machines: 3,
            metrics: vec!["temperature".into(), "vibration".into()],
            readings: 60,
            interval: Duration::seconds(10),
            start: crate::model::now(),
            spike_every: 0,
            seed: 7,
        }
    }
}

fn unit(metric: &str) -> &'static str {
    match metric {
        "temperature" => "C",
        "vibration" => "mm/s",
        "pressure" => "bar",
        "current" => "A",
        _ => "",
    }
}

/// Readings ordered by time, streams interleaved. The same seed always
/// yields the same readings.
pub fn generate(sim: &Simulation) -> Vec<SensorReading> {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let mut out = Vec::with_capacity(sim.machines * sim.metrics.len() * sim.readings);

    // Each stream gets its own baseline and noise level.
    let streams: Vec<(String, &str, f64, f64)> = (0..sim.machines)
        .flat_map(|m| sim.metrics.iter().map(move |metric| (m, metric)))
        .map(|(m, metric)| {
            let base = rng.gen_range(20.0..80.0);
            let noise = rng.gen_range(0.5..2.0);
            (format!("M{:03}", m + 1), metric.as_str(), base, noise)
        })
        .collect();

    for i in 0..sim.readings {
        let ts = sim.start + sim.interval * i as i32;
        for (machine, metric, base, noise) in &streams {
            let mut value = base + rng.gen_range(-*noise..*noise);
            if sim.spike_every > 0 && i > 0 && i % sim.spike_every == 0 {
                value += noise * rng.gen_range(8.0..12.0);
            }
            out.push(SensorReading::new(machine.clone(), *metric, value, unit(metric), ts));
        }
    }
    out
}

//! Per-zone soil sampling and the watering decision made from it.

use anyhow::{bail, Result};

use crate::backend::ActuationBackend;
use crate::config::ClassifierConfig;
use crate::state::SoilReading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Water,
    Skip,
}

pub trait WateringClassifier {
    fn predict(&self, moisture: f32, temperature: f32, humidity: f32) -> Decision;
}

/// Standard scaler followed by a logistic model over
/// `[moisture, temperature, humidity]`.
#[derive(Debug, Clone)]
pub struct LogisticClassifier {
    means: [f32; 3],
    scales: [f32; 3],
    weights: [f32; 3],
    bias: f32,
    threshold: f32,
}

impl LogisticClassifier {
    pub fn from_config(cfg: &ClassifierConfig) -> Self {
        Self {
            means: cfg.means,
            scales: cfg.scales,
            weights: cfg.weights,
            bias: cfg.bias,
            threshold: cfg.threshold,
        }
    }

    pub fn probability(&self, moisture: f32, temperature: f32, humidity: f32) -> f32 {
        let features = [moisture, temperature, humidity];
        let z = features
            .iter()
            .zip(self.means.iter().zip(&self.scales))
            .zip(&self.weights)
            .map(|((x, (mean, scale)), w)| w * (x - mean) / scale)
            .sum::<f32>()
            + self.bias;
        1.0 / (1.0 + (-z).exp())
    }
}

impl WateringClassifier for LogisticClassifier {
    fn predict(&self, moisture: f32, temperature: f32, humidity: f32) -> Decision {
        if self.probability(moisture, temperature, humidity) >= self.threshold {
            Decision::Water
        } else {
            Decision::Skip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoilSample {
    pub reading: SoilReading,
    pub decision: Decision,
}

pub struct SoilReader {
    classifier: Box<dyn WateringClassifier + Send>,
}

impl SoilReader {
    pub fn new(classifier: Box<dyn WateringClassifier + Send>) -> Self {
        Self { classifier }
    }

    /// Sample `zone` once. A failed or non-finite reading is an error; the
    /// caller keeps whatever it had before.
    pub fn read(&self, backend: &mut dyn ActuationBackend, zone: &str) -> Result<SoilSample> {
        let reading = backend.read_soil(zone)?;
        let SoilReading {
            temperature,
            humidity,
            moisture,
        } = reading;
        if ![temperature, humidity, moisture].iter().all(|v| v.is_finite()) {
            bail!("zone '{zone}' returned a non-finite reading: {reading:?}");
        }
        Ok(SoilSample {
            reading,
            decision: self.classifier.predict(moisture, temperature, humidity),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBoard(Option<SoilReading>);

    impl ActuationBackend for FixedBoard {
        fn set_relay(&mut self, _channel: u8, _on: bool) -> Result<()> {
            Ok(())
        }

        fn read_soil(&mut self, zone: &str) -> Result<SoilReading> {
            match self.0 {
                Some(r) => Ok(r),
                None => bail!("sensor on '{zone}' not responding"),
            }
        }
    }

    fn reading(moisture: f32) -> SoilReading {
        SoilReading {
            temperature: 25.0,
            humidity: 60.0,
            moisture,
        }
    }

    fn default_model() -> LogisticClassifier {
        LogisticClassifier::from_config(&ClassifierConfig::default())
    }

    // -- LogisticClassifier -------------------------------------------------

    #[test]
    fn dry_soil_means_water() {
        assert_eq!(default_model().predict(15.0, 28.0, 50.0), Decision::Water);
    }

    #[test]
    fn wet_soil_means_skip() {
        assert_eq!(default_model().predict(85.0, 22.0, 80.0), Decision::Skip);
    }

    #[test]
    fn probability_at_means_is_sigmoid_of_bias() {
        let cfg = ClassifierConfig::default();
        let p = default_model().probability(cfg.means[0], cfg.means[1], cfg.means[2]);
        let expected = 1.0 / (1.0 + (-cfg.bias).exp());
        assert!((p - expected).abs() < 1e-6);
    }

    #[test]
    fn threshold_is_inclusive() {
        let cfg = ClassifierConfig {
            bias: 0.0,
            threshold: 0.5,
            ..ClassifierConfig::default()
        };
        let model = LogisticClassifier::from_config(&cfg);
        assert_eq!(
            model.predict(cfg.means[0], cfg.means[1], cfg.means[2]),
            Decision::Water
        );
    }

    // -- SoilReader ---------------------------------------------------------

    #[test]
    fn read_returns_reading_and_decision() {
        let reader = SoilReader::new(Box::new(default_model()));
        let sample = reader.read(&mut FixedBoard(Some(reading(10.0))), "area1").unwrap();
        assert_eq!(sample.reading.moisture, 10.0);
        assert_eq!(sample.decision, Decision::Water);
    }

    #[test]
    fn read_propagates_sensor_failure() {
        let reader = SoilReader::new(Box::new(default_model()));
        let err = reader.read(&mut FixedBoard(None), "area2").unwrap_err();
        assert!(err.to_string().contains("area2"));
    }

    #[test]
    fn read_rejects_nan() {
        let reader = SoilReader::new(Box::new(default_model()));
        assert!(reader
            .read(&mut FixedBoard(Some(reading(f32::NAN))), "area1")
            .is_err());
    }
}

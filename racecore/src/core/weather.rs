use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherKind {
    Clear,
    Rain,
    Wind,
    Fog,
}

impl WeatherKind {
    pub const ALL: [WeatherKind; 4] = [
        WeatherKind::Clear,
        WeatherKind::Rain,
        WeatherKind::Wind,
        WeatherKind::Fog,
    ];
}

/// * `kind` - Current weather type
/// * `intensity` - Strength of the weather effect in [0.0, 1.0] (0.0 for clear weather)
/// * `wind_direction` - (rad) Direction the wind blows towards, only set for windy weather
/// * `temperature` - (°C) Ambient temperature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub kind: WeatherKind,
    #[serde(default)]
    pub intensity: f64,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl Default for Weather {
    fn default() -> Self {
        Weather {
            kind: WeatherKind::Clear,
            intensity: 0.0,
            wind_direction: None,
            temperature: Some(20.0),
        }
    }
}

impl Weather {
    /// rain_intensity returns the rain intensity, 0.0 if it is not raining.
    pub fn rain_intensity(&self) -> f64 {
        if self.kind == WeatherKind::Rain {
            self.intensity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// wind_intensity returns the wind intensity, 0.0 if it is not windy.
    pub fn wind_intensity(&self) -> f64 {
        if self.kind == WeatherKind::Wind {
            self.intensity.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn is_wet(&self) -> bool {
        self.rain_intensity() > 0.0
    }

    /// evolve draws the next weather state. With a probability of 60% the weather type changes,
    /// otherwise only the intensity of the current type drifts.
    pub fn evolve<R: Rng + ?Sized>(&self, rng: &mut R) -> Weather {
        let mut next = self.clone();

        if rng.gen_bool(0.6) {
            let candidates: Vec<WeatherKind> = WeatherKind::ALL
                .iter()
                .copied()
                .filter(|&k| k != self.kind)
                .collect();
            next.kind = candidates[rng.gen_range(0..candidates.len())];
            next.intensity = if next.kind == WeatherKind::Clear {
                0.0
            } else {
                rng.gen_range(0.2..1.0)
            };
        } else if self.kind != WeatherKind::Clear {
            next.intensity = (self.intensity + sample_normal(rng, 0.15)).clamp(0.1, 1.0);
        }

        next.wind_direction = if next.kind == WeatherKind::Wind {
            Some(self.wind_direction.unwrap_or_else(|| rng.gen_range(0.0..TAU)))
        } else {
            None
        };

        // rain cools the track down a little
        let t_prev = self.temperature.unwrap_or(20.0);
        let cooling = if next.kind == WeatherKind::Rain { 2.0 } else { 0.0 };
        next.temperature = Some(t_prev + sample_normal(rng, 1.5) - cooling);

        next
    }
}

/// sample_normal draws from a zero-mean normal distribution, 0.0 if `std_dev` is invalid.
pub(crate) fn sample_normal<R: Rng + ?Sized>(rng: &mut R, std_dev: f64) -> f64 {
    match Normal::new(0.0, std_dev) {
        Ok(normal) => normal.sample(rng),
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn rain_and_wind_intensities_depend_on_kind() {
        let rain = Weather {
            kind: WeatherKind::Rain,
            intensity: 0.7,
            ..Weather::default()
        };
        assert_eq!(rain.rain_intensity(), 0.7);
        assert_eq!(rain.wind_intensity(), 0.0);
        assert!(rain.is_wet());
        assert!(!Weather::default().is_wet());
    }

    #[test]
    fn evolve_keeps_intensity_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut weather = Weather::default();

        for _ in 0..200 {
            weather = weather.evolve(&mut rng);
            assert!((0.0..=1.0).contains(&weather.intensity));
            assert_eq!(weather.wind_direction.is_some(), weather.kind == WeatherKind::Wind);
            if weather.kind == WeatherKind::Clear {
                assert_eq!(weather.intensity, 0.0);
            }
        }
    }

    #[test]
    fn evolve_is_deterministic_for_equal_seeds() {
        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);
        let start = Weather::default();

        assert_eq!(start.evolve(&mut rng_a), start.evolve(&mut rng_b));
    }
}

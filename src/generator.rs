//! Timer-driven random car production.
//!
//! Makes and models are pre-normalized (lowercase, trimmed) the way the
//! downstream queue consumers expect them.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::car::Car;

const MAKES: &[(&str, &[&str])] = &[
    ("toyota", &["corolla", "camry", "rav4", "highlander", "tacoma"]),
    ("honda", &["civic", "accord", "cr-v", "pilot", "odyssey"]),
    ("ford", &["f-150", "escape", "explorer", "mustang", "focus"]),
    ("chevrolet", &["silverado", "equinox", "malibu", "tahoe", "traverse"]),
    ("nissan", &["altima", "rogue", "sentra", "pathfinder", "frontier"]),
    ("bmw", &["3 series", "5 series", "x3", "x5", "i4"]),
    ("mercedes-benz", &["c-class", "e-class", "glc", "gle", "a-class"]),
    ("volkswagen", &["jetta", "passat", "tiguan", "atlas", "golf"]),
    ("hyundai", &["elantra", "sonata", "tucson", "santa fe", "kona"]),
    ("subaru", &["outback", "forester", "impreza", "crosstrek", "ascent"]),
];

const LOCATIONS: &[&str] = &[
    "Austin, TX",
    "Denver, CO",
    "Portland, OR",
    "Nashville, TN",
    "Columbus, OH",
    "Phoenix, AZ",
    "Raleigh, NC",
    "Boise, ID",
    "Madison, WI",
    "Tulsa, OK",
];

const MIN_YEAR: i32 = 1998;
const MAX_YEAR: i32 = 2026;

/// Stateless random car factory.
pub struct CarGenerator;

impl CarGenerator {
    /// Produce one random car.
    #[must_use]
    pub fn generate() -> Car {
        let mut rng = rand::thread_rng();
        let (make, models) = MAKES.choose(&mut rng).copied().unwrap_or(MAKES[0]);
        let model = models.choose(&mut rng).copied().unwrap_or(models[0]);
        let year = rng.gen_range(MIN_YEAR..=MAX_YEAR);
        // Two-decimal prices between 1,500 and 85,000.
        let price = (rng.gen_range(1_500_00..=8_500_000) as f64) / 100.0;
        let location = LOCATIONS.choose(&mut rng).copied().unwrap_or(LOCATIONS[0]);

        Car {
            normalized_make: make.to_string(),
            normalized_model: model.to_string(),
            year,
            price,
            location: location.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_fields_are_populated() {
        for _ in 0..100 {
            let car = CarGenerator::generate();
            assert!(!car.normalized_make.is_empty());
            assert!(!car.normalized_model.is_empty());
            assert!(!car.location.is_empty());
            assert!((MIN_YEAR..=MAX_YEAR).contains(&car.year));
            assert!(car.price >= 1500.0 && car.price <= 85000.0);
        }
    }

    #[test]
    fn test_makes_are_normalized() {
        for _ in 0..100 {
            let car = CarGenerator::generate();
            assert_eq!(car.normalized_make, car.normalized_make.to_lowercase());
            assert_eq!(car.normalized_make.trim(), car.normalized_make);
            assert_eq!(car.normalized_model, car.normalized_model.to_lowercase());
        }
    }

    #[test]
    fn test_model_belongs_to_make() {
        for _ in 0..100 {
            let car = CarGenerator::generate();
            let models = MAKES
                .iter()
                .find(|(make, _)| *make == car.normalized_make)
                .map(|(_, models)| *models)
                .unwrap();
            assert!(models.contains(&car.normalized_model.as_str()));
        }
    }

    #[test]
    fn test_prices_have_at_most_two_decimals() {
        for _ in 0..100 {
            let car = CarGenerator::generate();
            let cents = car.price * 100.0;
            assert!((cents - cents.round()).abs() < 1e-6);
        }
    }
}

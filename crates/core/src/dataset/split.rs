use super::{class_counts, to_xy, DatasetError, LabeledVector};
use crate::config::Seed;
use crate::emotion::{Emotion, NUM_CLASSES};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const LOG_TARGET: &str = "dataset::split";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitRatios {
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            validation: 0.15,
            test: 0.15,
        }
    }
}

impl SplitRatios {
    /// Per-class (train, validation, test) sizes for `n` samples.
    pub fn sizes(&self, n: usize) -> (usize, usize, usize) {
        let val = (n as f64 * self.validation).round() as usize;
        let test = (n as f64 * self.test).round() as usize;
        let train = n.saturating_sub(val + test);
        (train, val, test)
    }
}

/// One immutable side of a split.
#[derive(Clone, Debug, PartialEq)]
pub struct Partition {
    rows: Vec<LabeledVector>,
}

impl Partition {
    pub fn rows(&self) -> &[LabeledVector] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        class_counts(&self.rows)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.source_id.as_str())
    }

    pub fn xy(&self) -> (Vec<Vec<f64>>, Vec<Emotion>) {
        to_xy(&self.rows)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SplitDataset {
    pub train: Partition,
    pub validation: Partition,
    pub test: Partition,
    pub seed: Seed,
}

/// Stratified train/validation/test split.
///
/// Classes are visited in [`Emotion::ALL`] order; each class is shuffled
/// with one generator seeded from `seed` and cut into per-class sizes from
/// [`SplitRatios::sizes`]. Each partition is then shuffled with the same
/// generator, so the same rows and seed always give the same partitions in
/// the same order. Every class present must fill all three partitions.
pub fn split_stratified(
    rows: &[LabeledVector],
    ratios: SplitRatios,
    seed: Seed,
) -> Result<SplitDataset, DatasetError> {
    if rows.is_empty() {
        return Err(DatasetError::Empty);
    }

    let mut rng = StdRng::seed_from_u64(seed.value());
    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();

    for emotion in Emotion::ALL {
        let mut members: Vec<&LabeledVector> = rows.iter().filter(|r| r.label == emotion).collect();
        if members.is_empty() {
            continue;
        }
        let (n_train, n_val, n_test) = ratios.sizes(members.len());
        if n_train == 0 || n_val == 0 || n_test == 0 {
            return Err(DatasetError::InsufficientData {
                emotion,
                count: members.len(),
            });
        }

        members.shuffle(&mut rng);
        let (val_rows, rest) = members.split_at(n_val);
        let (test_rows, train_rows) = rest.split_at(n_test);
        validation.extend(val_rows.iter().map(|r| (*r).clone()));
        test.extend(test_rows.iter().map(|r| (*r).clone()));
        train.extend(train_rows.iter().map(|r| (*r).clone()));
    }

    train.shuffle(&mut rng);
    validation.shuffle(&mut rng);
    test.shuffle(&mut rng);

    tracing::info!(
        target: LOG_TARGET,
        train = train.len(),
        validation = validation.len(),
        test = test.len(),
        seed = seed.value(),
        "dataset split"
    );

    Ok(SplitDataset {
        train: Partition { rows: train },
        validation: Partition { rows: validation },
        test: Partition { rows: test },
        seed,
    })
}

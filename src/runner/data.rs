use crate::{NasError, NasFloat};
use ndarray::{ArrayD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Clone, Debug)]
pub struct Batch {
    pub inputs: ArrayD<NasFloat>,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Endless stream of batches of one split.
pub trait DataSource {
    /// # Errors
    fn next_batch(&mut self) -> Result<Batch, NasError>;

    fn batch_size(&self) -> usize;
}

/// Samples held in memory, cycled in batches. With shuffling the order is redrawn at
/// the start of every pass.
#[derive(Clone, Debug)]
pub struct InMemoryDataSource {
    inputs: ArrayD<NasFloat>,
    targets: Vec<usize>,
    batch_size: usize,
    order: Vec<usize>,
    position: usize,
    rng: Option<StdRng>,
}

impl InMemoryDataSource {
    /// `inputs` holds one sample per entry of the first axis.
    ///
    /// # Errors
    /// Mismatched lengths, or a batch size that is zero or larger than the data.
    pub fn new(
        inputs: ArrayD<NasFloat>,
        targets: Vec<usize>,
        batch_size: usize,
    ) -> Result<Self, NasError> {
        let n = inputs.shape().first().copied().unwrap_or(0);
        if n != targets.len() {
            return Err(NasError::configuration(format!(
                "{} samples with {} targets",
                n,
                targets.len()
            )));
        }
        if batch_size == 0 || batch_size > n {
            return Err(NasError::configuration(format!(
                "batch size {} for {} samples",
                batch_size, n
            )));
        }
        Ok(Self {
            inputs,
            targets,
            batch_size,
            order: (0..n).collect(),
            position: 0,
            rng: None,
        })
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.rng = Some(rng);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl DataSource for InMemoryDataSource {
    fn next_batch(&mut self) -> Result<Batch, NasError> {
        let mut indices = Vec::with_capacity(self.batch_size);
        while indices.len() < self.batch_size {
            if self.position == self.order.len() {
                self.position = 0;
                if let Some(rng) = self.rng.as_mut() {
                    self.order.shuffle(rng);
                }
            }
            indices.push(self.order[self.position]);
            self.position += 1;
        }
        Ok(Batch {
            inputs: self.inputs.select(Axis(0), &indices),
            targets: indices.iter().map(|&i| self.targets[i]).collect(),
        })
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn source() -> InMemoryDataSource {
        let inputs = Array::from_shape_fn(IxDyn(&[5, 2]), |i| i[0] as f64);
        InMemoryDataSource::new(inputs, vec![0, 1, 2, 3, 4], 2).unwrap()
    }

    #[test]
    fn test_batches_wrap_around() {
        let mut data = source();
        let targets: Vec<Vec<usize>> = (0..3).map(|_| data.next_batch().unwrap().targets).collect();
        assert_eq!(targets, vec![vec![0, 1], vec![2, 3], vec![4, 0]]);
        let batch = data.next_batch().unwrap();
        assert_eq!(batch.inputs.shape(), &[2, 2]);
        assert_eq!(batch.inputs[[0, 0]], 1.);
    }

    #[test]
    fn test_shuffled_pass_has_no_repeats() {
        let mut data = source().with_shuffle(9);
        let mut first_pass: Vec<usize> = (0..2)
            .flat_map(|_| data.next_batch().unwrap().targets)
            .collect();
        first_pass.sort_unstable();
        first_pass.dedup();
        assert_eq!(first_pass.len(), 4);
    }

    #[test]
    fn test_invalid_sources() {
        let inputs = ArrayD::zeros(IxDyn(&[3, 2]));
        assert!(InMemoryDataSource::new(inputs.clone(), vec![0, 1], 1).is_err());
        assert!(InMemoryDataSource::new(inputs.clone(), vec![0, 1, 2], 0).is_err());
        assert!(InMemoryDataSource::new(inputs, vec![0, 1, 2], 4).is_err());
    }
}

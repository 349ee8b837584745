use crate::NasError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

/// Static shape of a tensor. `None` marks an unknown extent, in practice the batch axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<Option<usize>>,
}

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims }
    }

    /// `(None, C, H, W)`
    pub fn nchw(channels: usize, height: usize, width: usize) -> Self {
        Self::new(vec![None, Some(channels), Some(height), Some(width)])
    }

    /// `(None, F)`
    pub fn features(features: usize) -> Self {
        Self::new(vec![None, Some(features)])
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.dims
    }

    pub fn is_fully_defined(&self) -> bool {
        self.dims.iter().all(Option::is_some)
    }

    pub fn is_compatible_with(&self, other: &Self) -> bool {
        if self.dims.len() != other.dims.len() {
            return false;
        }
        self.dims
            .iter()
            .zip(other.dims.iter())
            .all(|(x, y)| match (x, y) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
    }

    /// Extent of axis `idx`, failing when it is unknown or out of range.
    ///
    /// # Errors
    pub fn extent(&self, idx: usize) -> Result<usize, NasError> {
        self.dims.get(idx).copied().flatten().ok_or_else(|| {
            NasError::shape_mismatch(format!("axis {} of {} is not defined", idx, self))
        })
    }

    /// # Errors
    pub fn channels(&self) -> Result<usize, NasError> {
        self.extent(1)
    }

    /// Spatial extent `(H, W)` of an NCHW shape.
    ///
    /// # Errors
    pub fn spatial(&self) -> Result<(usize, usize), NasError> {
        if self.rank() != 4 {
            return Err(NasError::shape_mismatch(format!(
                "expected a rank 4 shape, got {}",
                self
            )));
        }
        Ok((self.extent(2)?, self.extent(3)?))
    }

    /// Replaces the leading (batch) extent.
    pub fn with_batch(&self, batch: usize) -> Self {
        let mut dims = self.dims.clone();
        if let Some(first) = dims.first_mut() {
            *first = Some(batch);
        }
        Self { dims }
    }

    /// Concrete extents, treating an unknown axis as `default`.
    pub fn to_vec_or(&self, default: usize) -> Vec<usize> {
        self.dims.iter().map(|d| d.unwrap_or(default)).collect()
    }

    pub fn num_elements_or(&self, default: usize) -> usize {
        self.to_vec_or(default).iter().product()
    }
}

impl Index<usize> for TensorShape {
    type Output = Option<usize>;

    fn index(&self, idx: usize) -> &Option<usize> {
        &self.dims[idx]
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(v: Vec<usize>) -> Self {
        Self {
            dims: v.into_iter().map(Some).collect(),
        }
    }
}

impl From<&[usize]> for TensorShape {
    fn from(v: &[usize]) -> Self {
        Self {
            dims: v.iter().copied().map(Some).collect(),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |v| v.to_string()))
            .collect();
        write!(f, "({})", dims.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_ignores_unknown_batch() {
        let a = TensorShape::nchw(3, 8, 8);
        let b = TensorShape::from(vec![4, 3, 8, 8]);
        assert!(a.is_compatible_with(&b));
        assert!(!a.is_compatible_with(&TensorShape::nchw(3, 4, 8)));
        assert!(!a.is_fully_defined());
        assert!(b.is_fully_defined());
    }

    #[test]
    fn test_spatial_requires_rank_four() {
        assert_eq!(TensorShape::nchw(3, 8, 6).spatial().unwrap(), (8, 6));
        assert!(TensorShape::features(10).spatial().is_err());
        assert_eq!(format!("{}", TensorShape::nchw(3, 8, 6)), "(?, 3, 8, 6)");
    }
}

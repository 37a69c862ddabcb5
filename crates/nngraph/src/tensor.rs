//! Host-backed payload tensor owned by graph Variables.
//!
//! Payloads store logical `f32` values regardless of the Variable's element
//! kind; backend-specific byte layouts are produced during lowering, which
//! lives outside this crate.

use rand::Rng;

/// Dense host tensor used as the persistent payload of a Variable.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Returns a zero-initialized tensor of the requested dimensions.
    pub fn zeros(dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        let len = dims.iter().product();
        Tensor {
            dims,
            data: vec![0.0; len],
        }
    }

    /// Returns a tensor with every element set to `value`.
    pub fn splat(dims: impl Into<Vec<usize>>, value: f32) -> Self {
        let dims = dims.into();
        let len = dims.iter().product();
        Tensor {
            dims,
            data: vec![value; len],
        }
    }

    /// Samples a fan-in-scaled uniform distribution: `U(-b, b)` with
    /// `b = sqrt(3 / fan_in)`, which keeps activation variance stable for
    /// layers with `fan_in` incoming connections.
    pub fn xavier(dims: impl Into<Vec<usize>>, fan_in: f32, rng: &mut impl Rng) -> Self {
        assert!(fan_in > 0.0, "fan-in must be positive");
        let dims = dims.into();
        let len = dims.iter().product();
        let bound = (3.0 / fan_in).sqrt();
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(rng.gen_range(-bound..=bound));
        }
        Tensor { dims, data }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: f32) {
        for slot in &mut self.data {
            *slot = value;
        }
    }

    /// Resets every element to zero.
    pub fn zero(&mut self) {
        self.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn xavier_stays_within_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Tensor::xavier(vec![4, 12], 12.0, &mut rng);
        let bound = (3.0f32 / 12.0).sqrt();
        assert_eq!(t.len(), 48);
        assert!(t.data().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn splat_fills_every_element() {
        let t = Tensor::splat(vec![2, 3], 0.1);
        assert!(t.data().iter().all(|v| (v - 0.1).abs() < f32::EPSILON));
    }
}

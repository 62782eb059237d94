use crate::volume::Volume3D;

/// Number of leading jobs per slice during which the shared target is
/// refined. After this window closes the target is frozen and the remaining
/// timepoints become mutually independent.
pub const TARGET_REFINE_WINDOW: usize = 10;

/// Iterative target refiner: blends each successfully registered volume
/// back into the slice's target with a weighted running mean, so the target
/// converges toward the dataset's central tendency instead of drifting with
/// the first timepoint's motion.
#[derive(Debug, Default)]
pub struct TargetRefiner {
    count: usize,
}

impl TargetRefiner {
    pub fn new() -> Self {
        TargetRefiner { count: 0 }
    }

    /// `target = (target * (n + 1) + moco) / (n + 2)`, then `n += 1`.
    /// The initial target carries an implicit weight of one, and each new
    /// sample gets progressively less influence as `n` grows.
    pub fn absorb(&mut self, target: &mut Volume3D, moco: &Volume3D) {
        let n = self.count as f64;
        target.data = (&target.data * (n + 1.0) + &moco.data) / (n + 2.0);
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

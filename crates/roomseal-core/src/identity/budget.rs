//! One-time prekey replenishment.

/// How many one-time prekeys to generate before an upload.
///
/// The server is kept stocked at half the configured pool size, so that
/// claims can proceed while uploads are pending without ever exceeding the
/// pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneTimePrekeyBudget {
    /// Keys the server should hold: `floor(max_pool_size / 2)`
    pub target: usize,
    /// Keys the server reports holding
    pub remaining: usize,
    /// Local keys generated but not yet uploaded
    pub available: usize,
}

impl OneTimePrekeyBudget {
    /// Budget for a pool of `max_pool_size` keys.
    pub fn new(max_pool_size: usize, remaining: usize, available: usize) -> Self {
        Self { target: max_pool_size / 2, remaining, available }
    }

    /// Keys to upload: `max(0, target - remaining)`.
    pub fn needed(&self) -> usize {
        self.target.saturating_sub(self.remaining)
    }

    /// Fresh keys to generate: `needed - available` when positive.
    pub fn to_generate(&self) -> usize {
        self.needed().saturating_sub(self.available)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn half_pool_refill() {
        let budget = OneTimePrekeyBudget::new(100, 10, 5);
        assert_eq!(budget.target, 50);
        assert_eq!(budget.needed(), 40);
        assert_eq!(budget.to_generate(), 35);
    }

    #[test]
    fn full_server_needs_nothing() {
        let budget = OneTimePrekeyBudget::new(100, 80, 0);
        assert_eq!(budget.needed(), 0);
        assert_eq!(budget.to_generate(), 0);
    }

    #[test]
    fn local_surplus_generates_nothing() {
        let budget = OneTimePrekeyBudget::new(100, 45, 20);
        assert_eq!(budget.needed(), 5);
        assert_eq!(budget.to_generate(), 0);
    }

    #[test]
    fn odd_pool_size_rounds_down() {
        assert_eq!(OneTimePrekeyBudget::new(7, 0, 0).target, 3);
    }

    proptest! {
        #[test]
        fn prop_generated_plus_available_covers_need(
            max in 0usize..1000,
            remaining in 0usize..1000,
            available in 0usize..1000,
        ) {
            let budget = OneTimePrekeyBudget::new(max, remaining, available);

            prop_assert!(budget.needed() <= budget.target);
            prop_assert!(budget.to_generate() <= budget.needed());
            prop_assert!(budget.to_generate() + budget.available >= budget.needed());
        }

        #[test]
        fn prop_never_generates_when_stocked(
            max in 0usize..1000,
            extra in 0usize..1000,
            available in 0usize..1000,
        ) {
            let budget = OneTimePrekeyBudget::new(max, max / 2 + extra, available);
            prop_assert_eq!(budget.to_generate(), 0);
        }
    }
}

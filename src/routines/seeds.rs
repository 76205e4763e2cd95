use std::collections::VecDeque;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeds are drawn from `[0, SEED_LIMIT)`
const SEED_LIMIT: u64 = 1_000_000_000_000_000_000;

/// Buffer of pre-drawn seeds for stochastic evaluations
///
/// Every seed is handed out once. The buffer holds two seeds per core and is refilled once no
/// more than one seed per core is left.
#[derive(Debug)]
pub struct SeedPool {
    cores: usize,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    rng: StdRng,
    seeds: VecDeque<u64>,
}

impl PoolState {
    fn refill(&mut self, target: usize) {
        while self.seeds.len() < target {
            let seed = self.rng.random_range(0..SEED_LIMIT);
            self.seeds.push_back(seed);
        }
    }
}

impl SeedPool {
    pub fn new(seed: u64, cores: usize) -> Self {
        let cores = cores.max(1);
        let mut state = PoolState {
            rng: StdRng::seed_from_u64(seed),
            seeds: VecDeque::with_capacity(2 * cores),
        };
        state.refill(2 * cores);
        SeedPool {
            cores,
            state: Mutex::new(state),
        }
    }

    /// Pop the next seed
    pub fn draw(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.seeds.len() <= self.cores {
            state.refill(2 * self.cores);
        }
        match state.seeds.pop_front() {
            Some(seed) => seed,
            None => state.rng.random_range(0..SEED_LIMIT),
        }
    }

    /// Number of seeds currently buffered
    pub fn remaining(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seeds
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_pool_is_reproducible() {
        let a = SeedPool::new(7, 2);
        let b = SeedPool::new(7, 2);
        let first: Vec<u64> = (0..10).map(|_| a.draw()).collect();
        let second: Vec<u64> = (0..10).map(|_| b.draw()).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|s| *s < SEED_LIMIT));
    }

    #[test]
    fn test_refill_keeps_buffer() {
        let pool = SeedPool::new(1, 3);
        assert_eq!(pool.remaining(), 6);
        for _ in 0..20 {
            pool.draw();
            assert!(pool.remaining() >= 3);
        }
    }

    #[test]
    fn test_seeds_are_handed_out_once() {
        let pool = Arc::new(SeedPool::new(3, 4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || (0..50).map(|_| pool.draw()).collect::<Vec<u64>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for seed in handle.join().unwrap() {
                assert!(seen.insert(seed));
            }
        }
        assert_eq!(seen.len(), 200);
    }
}

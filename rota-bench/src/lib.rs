//! Rota benchmarks.
//!
//! Every bench binary links this crate so that they all run on mimalloc,
//! which matches the allocator profile of a busy node (many small
//! transactions and hashes).

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub use mimalloc;

#[cfg(test)]
mod tests {
    #[test]
    fn test_allocations_go_through_global() {
        let items: Vec<Vec<u8>> = (0..10_000).map(|i| vec![i as u8; 32]).collect();
        assert_eq!(items.len(), 10_000);
        assert!(items.iter().enumerate().all(|(i, v)| v[31] == i as u8));
    }
}

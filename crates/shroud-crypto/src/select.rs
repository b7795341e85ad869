use std::time::Instant;

use crate::{Algorithm, ChunkCipher, Dek, NONCE_SIZE};

const SMALL_SIZE: usize = 4 * 1024;
const LARGE_SIZE: usize = 1024 * 1024;
const SMALL_TOTAL_BYTES: usize = 4 * 1024 * 1024;
const LARGE_TOTAL_BYTES: usize = 32 * 1024 * 1024;
const SMALL_WEIGHT: f64 = 0.7;
const LARGE_WEIGHT: f64 = 0.3;
const TIE_BIAS_THRESHOLD: f64 = 0.05;

/// Benchmark both AEADs and pick the faster one for this host.
///
/// Machines with AES instructions should land on AES-256-GCM, everything
/// else on ChaCha20-Poly1305. Ties within 5% go to AES-256-GCM. Runs once
/// at engine construction when the configured algorithm is `auto`.
pub fn select_fastest_aead() -> Algorithm {
    let gcm = benchmark_candidate(Algorithm::Aes256Gcm);
    let chacha = benchmark_candidate(Algorithm::ChaCha20Poly1305);
    choose_from_scores(gcm, chacha)
}

fn benchmark_candidate(candidate: Algorithm) -> f64 {
    let dek = Dek::from_bytes(&[0x3A; 32]).expect("fixed-length benchmark key");
    let cipher = candidate.cipher(&dek);

    let small = benchmark_input(SMALL_SIZE);
    let large = benchmark_input(LARGE_SIZE);

    // Warm up both message sizes before timing.
    let _ = run_once(cipher.as_ref(), &small);
    let _ = run_once(cipher.as_ref(), &large);

    let small_iterations = SMALL_TOTAL_BYTES / SMALL_SIZE;
    let large_iterations = LARGE_TOTAL_BYTES / LARGE_SIZE;

    let small_mibps = measure_mib_per_sec(cipher.as_ref(), &small, small_iterations);
    let large_mibps = measure_mib_per_sec(cipher.as_ref(), &large, large_iterations);
    weighted_score(small_mibps, large_mibps)
}

fn measure_mib_per_sec(cipher: &dyn ChunkCipher, payload: &[u8], iterations: usize) -> f64 {
    let nonce = [0x7Fu8; NONCE_SIZE];
    let mut sealed = Vec::with_capacity(payload.len() + 16);
    let mut opened = Vec::with_capacity(payload.len());

    let start = Instant::now();
    for _ in 0..iterations {
        if cipher.seal(&nonce, payload, &mut sealed).is_err() {
            return 0.0;
        }
        if cipher.open(&nonce, &sealed, &mut opened).is_err() {
            return 0.0;
        }
        if opened != payload {
            return 0.0;
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }

    let total_mib = (payload.len() * iterations) as f64 / (1024.0 * 1024.0);
    total_mib / elapsed
}

fn run_once(cipher: &dyn ChunkCipher, payload: &[u8]) -> bool {
    let nonce = [0x7Fu8; NONCE_SIZE];
    let mut sealed = Vec::new();
    let mut opened = Vec::new();
    if cipher.seal(&nonce, payload, &mut sealed).is_err() {
        return false;
    }
    if cipher.open(&nonce, &sealed, &mut opened).is_err() {
        return false;
    }
    opened == payload
}

fn benchmark_input(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn weighted_score(small_mibps: f64, large_mibps: f64) -> f64 {
    (small_mibps * SMALL_WEIGHT) + (large_mibps * LARGE_WEIGHT)
}

fn choose_from_scores(gcm: f64, chacha: f64) -> Algorithm {
    if chacha > gcm * (1.0 + TIE_BIAS_THRESHOLD) {
        Algorithm::ChaCha20Poly1305
    } else {
        Algorithm::Aes256Gcm
    }
}

#[cfg(test)]
mod tests {
    use super::{choose_from_scores, weighted_score, Algorithm};

    #[test]
    fn chooser_prefers_chacha_on_clear_win() {
        let picked = choose_from_scores(1000.0, 1200.0);
        assert_eq!(picked, Algorithm::ChaCha20Poly1305);
    }

    #[test]
    fn chooser_prefers_gcm_on_near_tie() {
        let picked = choose_from_scores(1000.0, 1030.0);
        assert_eq!(picked, Algorithm::Aes256Gcm);
    }

    #[test]
    fn weighted_score_favors_small_payloads() {
        let score = weighted_score(500.0, 100.0);
        assert_eq!(score, 380.0);
    }
}

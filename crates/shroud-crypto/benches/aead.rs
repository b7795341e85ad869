use shroud_crypto::{Algorithm, Dek, NONCE_SIZE};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn cipher_for(name: &str) -> Box<dyn shroud_crypto::ChunkCipher> {
    let dek = Dek::from_bytes(&[0x42; 32]).unwrap();
    Algorithm::from_wire_name(name).unwrap().cipher(&dek)
}

#[divan::bench(args = [16384, 65536, 1048576])]
fn seal_aes_256_gcm(bencher: divan::Bencher, size: usize) {
    let cipher = cipher_for("AES-256-GCM");
    let nonce = [0x7Fu8; NONCE_SIZE];
    let data = make_data(size);
    let mut out = Vec::with_capacity(size + 16);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            cipher
                .seal(&nonce, divan::black_box(&data), &mut out)
                .unwrap()
        });
}

#[divan::bench(args = [16384, 65536, 1048576])]
fn seal_chacha20_poly1305(bencher: divan::Bencher, size: usize) {
    let cipher = cipher_for("ChaCha20-Poly1305");
    let nonce = [0x7Fu8; NONCE_SIZE];
    let data = make_data(size);
    let mut out = Vec::with_capacity(size + 16);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            cipher
                .seal(&nonce, divan::black_box(&data), &mut out)
                .unwrap()
        });
}

#[divan::bench(args = [16384, 65536, 1048576])]
fn open_aes_256_gcm(bencher: divan::Bencher, size: usize) {
    let cipher = cipher_for("AES-256-GCM");
    let nonce = [0x7Fu8; NONCE_SIZE];
    let mut sealed = Vec::new();
    cipher.seal(&nonce, &make_data(size), &mut sealed).unwrap();
    let mut out = Vec::with_capacity(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            cipher
                .open(&nonce, divan::black_box(&sealed), &mut out)
                .unwrap()
        });
}

fn main() {
    divan::main();
}

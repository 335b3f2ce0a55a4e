//! Noise textures sampled by combiners using the noise input.

use color::Rgba8;
use nanorand::{Rng, WyRand};
use tracing::debug;

use crate::{System, modules::render::Action};

/// Number of noise textures, cycled through once per frame.
pub const NOISE_TEXTURES: usize = 8;
/// Width and height of each noise texture.
pub const NOISE_SIZE: u32 = 128;

/// Fills a single noise texture.
fn noise_texture(seed: u64, width: u32, height: u32) -> Vec<Rgba8> {
    let mut rng = WyRand::new_seed(seed);
    (0..width * height)
        .map(|_| {
            let value = rng.generate::<u8>();
            Rgba8::new(value, value, value, value)
        })
        .collect()
}

/// Generates `count` noise textures, each on its own thread.
pub fn generate(count: usize, width: u32, height: u32) -> Vec<Vec<Rgba8>> {
    std::thread::scope(|s| {
        let workers: Vec<_> = (0..count)
            .map(|i| {
                let seed = 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(i as u64 + 1);
                s.spawn(move || noise_texture(seed, width, height))
            })
            .collect();

        workers
            .into_iter()
            .filter_map(|worker| worker.join().ok())
            .collect()
    })
}

/// Creates the noise textures and uploads them.
pub fn init(sys: &mut System) {
    if !sys.config.emulation.noise {
        return;
    }

    for data in generate(NOISE_TEXTURES, NOISE_SIZE, NOISE_SIZE) {
        let id = sys.textures.allocate_id();
        sys.render.exec(Action::UploadTexture {
            id,
            width: NOISE_SIZE,
            height: NOISE_SIZE,
            data,
        });
        sys.drawer.noise.push(id);
    }

    debug!(count = sys.drawer.noise.len(), "uploaded noise textures");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn textures_differ() {
        let textures = generate(3, 16, 16);
        assert_eq!(textures.len(), 3);
        assert!(textures.iter().all(|t| t.len() == 256));
        assert_ne!(textures[0], textures[1]);
        assert_ne!(textures[1], textures[2]);
    }

    #[test]
    fn generation_is_deterministic() {
        assert_eq!(generate(2, 8, 8), generate(2, 8, 8));
    }
}

//! Instruction-map construction: P-boxes, inverse P-boxes and S-boxes.
//!
//! Each output pixel of the map carries one 4-byte instruction. For the
//! permutation family the bytes are `(|dx|, |dy|, direction, 255)`, where
//! `direction % 4` encodes the sign quadrant of `(dx, dy)` and
//! `direction / 4` recovers `cluster_size - 1`, so a single byte tells the
//! kernel both where to read from and at which granularity. For
//! substitution the bytes are four clamped values from the secret's
//! substitution sequence.

use crate::config::{CipherMode, RenderConfig};
use crate::errors::RenderError;
use crate::math::{invert_sequence, normalize_integer};
use crate::secret::CipherSecret;
use crate::tessellation::{self, Rect};

/// Cache key for a finished instruction map. Two specs compare equal iff
/// every field is equal, and equal specs build byte-identical maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupTableSpec {
    pub width: u32,
    pub height: u32,
    pub origin_x: u32,
    pub origin_y: u32,
    pub secret: CipherSecret,
    pub cipher_mode: CipherMode,
    pub cluster_size: u32,
    pub cluster_size_table: Vec<u32>,
    pub block_size: u32,
}

impl LookupTableSpec {
    pub fn new(width: u32, height: u32, config: &RenderConfig) -> Self {
        Self {
            width,
            height,
            origin_x: 0,
            origin_y: 0,
            secret: config.secret.clone(),
            cipher_mode: config.cipher_mode,
            cluster_size: config.cluster_size,
            cluster_size_table: config.cluster_size_table.clone(),
            block_size: config.block_size,
        }
    }
}

/// Build the full-size RGBA8 instruction map for `spec`.
///
/// Plans the tessellation, builds one instruction tile per region and
/// paints each tile box-periodically across its region's placement rect.
/// Regions are disjoint by construction, so paint order is irrelevant.
pub fn build_instruction_map(spec: &LookupTableSpec) -> Result<Vec<u8>, RenderError> {
    let rect = Rect::new(spec.origin_x, spec.origin_y, spec.width, spec.height);
    let start = tessellation::start_index(&spec.cluster_size_table, spec.cluster_size);
    let regions = tessellation::plan(rect, spec.block_size, &spec.cluster_size_table, start)?;

    let mut map = vec![0_u8; spec.width as usize * spec.height as usize * 4];
    for region in &regions {
        let tile = build_instruction_tile(
            &spec.secret,
            spec.cipher_mode,
            region.data_width(),
            region.data_height(),
            region.cluster_size,
        )?;
        let tile_width = region.box_width as usize;
        let tile_height = region.box_height as usize;
        for y in 0..region.rect.height as usize {
            let tile_row = (y % tile_height) * tile_width * 4;
            let map_row = ((region.rect.y - spec.origin_y) as usize + y) * spec.width as usize * 4;
            for x in 0..region.rect.width as usize {
                let t = tile_row + (x % tile_width) * 4;
                let m = map_row + ((region.rect.x - spec.origin_x) as usize + x) * 4;
                map[m..m + 4].copy_from_slice(&tile[t..t + 4]);
            }
        }
    }
    Ok(map)
}

/// Build one instruction tile of `width x height` data cells, scaled up by
/// `cluster_size` along both axes.
pub fn build_instruction_tile(
    secret: &CipherSecret,
    cipher_mode: CipherMode,
    width: u32,
    height: u32,
    cluster_size: u32,
) -> Result<Vec<u8>, RenderError> {
    let width = width as usize;
    let height = height as usize;
    let data_size = width * height;
    if data_size > secret.sequence_length() {
        return Err(RenderError::SequenceTooShort {
            needed: data_size,
            available: secret.sequence_length(),
        });
    }
    debug_assert!(4 * (cluster_size - 1) <= 255);

    let trimmed: Vec<u32> = match cipher_mode {
        CipherMode::Substitution => secret.substitution_sequence()[..data_size]
            .iter()
            .map(|&value| u32::from(value))
            .collect(),
        CipherMode::Permutation => filter_to_local_range(secret, data_size),
        CipherMode::Unpermutation => invert_sequence(&filter_to_local_range(secret, data_size)),
    };

    let mut tile = vec![0_u8; data_size * 4];
    let mut n = 0_usize;
    for i in 0..height {
        for j in 0..width {
            let slot = (i * width + j) * 4;
            match cipher_mode {
                CipherMode::Substitution => {
                    for k in 0..4 {
                        tile[slot + k] =
                            normalize_integer(i64::from(trimmed[n]), (0, 255), (0, 255)) as u8;
                        n += 1;
                        if n == trimmed.len() {
                            n = 0;
                        }
                    }
                }
                CipherMode::Permutation | CipherMode::Unpermutation => {
                    let target = trimmed[n] as usize;
                    let dx = (target % width) as i64 - (n % width) as i64;
                    let dy = (target / width) as i64 - (n / width) as i64;
                    let direction = match (dx < 0, dy < 0) {
                        (false, false) => 0,
                        (true, false) => 1,
                        (false, true) => 2,
                        (true, true) => 3,
                    };
                    tile[slot] = dx.unsigned_abs() as u8;
                    tile[slot + 1] = dy.unsigned_abs() as u8;
                    tile[slot + 2] = direction;
                    tile[slot + 3] = 255;
                    n += 1;
                }
            }
        }
    }

    if cluster_size == 1 {
        return Ok(tile);
    }

    // Replicate each instruction across a cluster x cluster block; the
    // permutation family also folds cluster_size - 1 into the direction
    // byte so the kernel can recover the decode granularity.
    let cluster = cluster_size as usize;
    let scaled_width = width * cluster;
    let scaled_height = height * cluster;
    let direction_offset = (4 * (cluster_size - 1)) as u8;
    let mut scaled = vec![0_u8; scaled_width * scaled_height * 4];
    for i in 0..scaled_height {
        for j in 0..scaled_width {
            let src = ((i / cluster) * width + j / cluster) * 4;
            let dst = (i * scaled_width + j) * 4;
            scaled[dst..dst + 4].copy_from_slice(&tile[src..src + 4]);
            if cipher_mode != CipherMode::Substitution {
                scaled[dst + 2] = tile[src + 2] + direction_offset;
            }
        }
    }
    Ok(scaled)
}

/// Restrict the global permutation sequence to this region's local index
/// space, preserving order.
fn filter_to_local_range(secret: &CipherSecret, data_size: usize) -> Vec<u32> {
    secret
        .permutation_sequence()
        .iter()
        .copied()
        .filter(|&value| (value as usize) < data_size)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::cluster_size_table;

    fn config(password: &str, block_size: u32, cluster_size: u32, length: usize) -> RenderConfig {
        RenderConfig::new(
            CipherSecret::from_password(password, length),
            cluster_size,
            block_size,
        )
    }

    fn spec_for(config: &RenderConfig, width: u32, height: u32, mode: CipherMode) -> LookupTableSpec {
        let mut config = config.clone();
        config.cipher_mode = mode;
        LookupTableSpec::new(width, height, &config)
    }

    /// Gather-interpret one instruction at map pixel (x, y): where the
    /// kernel would read the source pixel from.
    fn decode_source(map: &[u8], width: u32, x: u32, y: u32) -> (u32, u32) {
        let slot = ((y * width + x) * 4) as usize;
        let cluster = i64::from(map[slot + 2] / 4) + 1;
        let quadrant = map[slot + 2] % 4;
        let mut dx = i64::from(map[slot]) * cluster;
        let mut dy = i64::from(map[slot + 1]) * cluster;
        if quadrant == 1 || quadrant == 3 {
            dx = -dx;
        }
        if quadrant == 2 || quadrant == 3 {
            dy = -dy;
        }
        ((i64::from(x) + dx) as u32, (i64::from(y) + dy) as u32)
    }

    fn apply_map(map: &[u8], width: u32, height: u32, pixels: &[u32]) -> Vec<u32> {
        let mut out = vec![0_u32; pixels.len()];
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = decode_source(map, width, x, y);
                assert!(sx < width && sy < height, "displacement escapes the image");
                out[(y * width + x) as usize] = pixels[(sy * width + sx) as usize];
            }
        }
        out
    }

    #[test]
    fn permutation_map_is_a_permutation_of_the_pixel_set() {
        let config = config("p-box", 16, 1, 256);
        let map = build_instruction_map(&spec_for(&config, 48, 32, CipherMode::Permutation)).unwrap();
        let pixels: Vec<u32> = (0..48 * 32).collect();
        let mut scrambled = apply_map(&map, 48, 32, &pixels);
        assert_ne!(scrambled, pixels);
        scrambled.sort_unstable();
        assert_eq!(scrambled, pixels);
    }

    #[test]
    fn unpermutation_map_inverts_permutation_map() {
        for (width, height, block, cluster, length) in
            [(48, 32, 16, 1, 256), (64, 64, 32, 2, 256), (100, 60, 16, 4, 64)]
        {
            let config = config("roundtrip", block, cluster, length);
            let forward =
                build_instruction_map(&spec_for(&config, width, height, CipherMode::Permutation))
                    .unwrap();
            let inverse =
                build_instruction_map(&spec_for(&config, width, height, CipherMode::Unpermutation))
                    .unwrap();
            let pixels: Vec<u32> = (0..width * height).map(|v| v.wrapping_mul(2654435761)).collect();
            let scrambled = apply_map(&forward, width, height, &pixels);
            let restored = apply_map(&inverse, width, height, &scrambled);
            assert_eq!(restored, pixels, "{width}x{height} block {block} cluster {cluster}");
        }
    }

    #[test]
    fn clustered_instructions_move_whole_clusters_together() {
        let config = config("clusters", 32, 4, 64);
        let map = build_instruction_map(&spec_for(&config, 32, 32, CipherMode::Permutation)).unwrap();
        for y in 0..32 {
            for x in 0..32 {
                let slot = ((y * 32 + x) * 4) as usize;
                let anchor = (((y / 4 * 4) * 32 + (x / 4 * 4)) * 4) as usize;
                assert_eq!(&map[slot..slot + 4], &map[anchor..anchor + 4]);
                assert_eq!(map[slot + 2] / 4, 3, "direction byte must carry cluster 4");
            }
        }
    }

    #[test]
    fn substitution_tile_wraps_the_sequence_and_stays_in_byte_range() {
        let secret = CipherSecret::from_password("s-box", 64);
        let tile = build_instruction_tile(&secret, CipherMode::Substitution, 8, 8, 1).unwrap();
        assert_eq!(tile.len(), 8 * 8 * 4);
        // 4 bytes per pixel over a 64-value sequence: pixel 16 restarts it.
        assert_eq!(&tile[..4], &tile[64 * 4..64 * 4 + 4]);
    }

    #[test]
    fn builds_are_deterministic() {
        let config = config("determinism", 16, 2, 256);
        let spec = spec_for(&config, 80, 48, CipherMode::Substitution);
        assert_eq!(build_instruction_map(&spec).unwrap(), build_instruction_map(&spec).unwrap());
    }

    #[test]
    fn sequence_too_short_is_reported() {
        let secret = CipherSecret::from_password("short", 16);
        let err = build_instruction_tile(&secret, CipherMode::Permutation, 8, 8, 1).unwrap_err();
        assert_eq!(
            err,
            RenderError::SequenceTooShort {
                needed: 64,
                available: 16
            }
        );
    }

    #[test]
    fn specs_differing_in_one_field_do_not_share_cache_entries() {
        let config = config("cache", 16, 1, 256);
        let base = spec_for(&config, 64, 64, CipherMode::Permutation);

        let mut other_mode = base.clone();
        other_mode.cipher_mode = CipherMode::Unpermutation;
        let mut other_block = base.clone();
        other_block.block_size = 32;
        other_block.cluster_size_table = cluster_size_table(32);
        let mut other_secret = base.clone();
        other_secret.secret = CipherSecret::from_password("cache2", 256);

        let mut cache: HashMap<LookupTableSpec, usize> = HashMap::new();
        for (i, spec) in [&base, &other_mode, &other_block, &other_secret]
            .into_iter()
            .enumerate()
        {
            cache.insert(spec.clone(), i);
        }
        assert_eq!(cache.len(), 4);
        // Identical spec is a hit.
        assert_eq!(cache.get(&spec_for(&config, 64, 64, CipherMode::Permutation)), Some(&0));
    }
}

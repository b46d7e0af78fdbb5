//! Rectangle tessellation for the instruction map.
//!
//! The secret's sequences are spread across 2-D regions rather than written
//! linearly, so a scramble destroys shapes as well as colors. The planner
//! splits the image rectangle into regions that each carry one box size (at
//! most the block size) and one cluster size; within a region the box tiles
//! edge to edge, and the leftover strips are planned again with the same
//! cluster candidate before smaller candidates are tried.
//!
//! The original formulation is recursive; this one runs the identical
//! arithmetic over an explicit work stack so adversarial block sizes cannot
//! exhaust the call stack. Region order differs from the recursive
//! reference, the partition does not.

use crate::errors::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// One planned region: a placement rectangle tiled edge to edge by a
/// `box_width x box_height` instruction tile sharing one cluster size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TessellationRegion {
    pub box_width: u32,
    pub box_height: u32,
    pub cluster_size: u32,
    pub rect: Rect,
}

impl TessellationRegion {
    /// Instructions per tile row before cluster scaling.
    pub fn data_width(&self) -> u32 {
        self.box_width / self.cluster_size
    }

    pub fn data_height(&self) -> u32 {
        self.box_height / self.cluster_size
    }
}

/// Partition `rect` into regions that tile it exactly.
///
/// `start_index` points at the largest cluster-table candidate the caller
/// wants considered (`None` when the table offers nothing, e.g. a prime
/// block size above 256). Candidates are consumed largest first; leftover
/// strips re-enter with the current candidate. If the candidates run out
/// before the rectangle is covered the plan is unusable and the original
/// defect is surfaced as a deterministic [`RenderError::DegenerateTessellation`].
pub fn plan(
    rect: Rect,
    block_size: u32,
    cluster_size_table: &[u32],
    start_index: Option<usize>,
) -> Result<Vec<TessellationRegion>, RenderError> {
    let mut regions = Vec::new();
    let start = match start_index {
        Some(index) => index as i64,
        None => -1,
    };
    let mut stack: Vec<(Rect, i64)> = vec![(rect, start)];

    while let Some((current, index)) = stack.pop() {
        if index < 0 || current.width == 0 || current.height == 0 {
            continue;
        }
        let cluster = cluster_size_table[index as usize];
        if cluster > current.width || cluster > current.height {
            stack.push((current, index - 1));
            continue;
        }

        let tall = current.height > current.width;
        let (p, q) = if tall {
            (current.height, current.width)
        } else {
            (current.width, current.height)
        };

        // Pick the box edge: cover the whole area when one box worth of
        // instructions can hold it, otherwise fill the short edge and derive
        // the long edge from the instruction capacity, otherwise fall back to
        // a full block-size square.
        let max_tile_data_size = (block_size * block_size) / (cluster * cluster);
        let max_data_size = (current.width / cluster) * (current.height / cluster);
        let (mut w, mut h);
        if max_tile_data_size > max_data_size {
            w = p - p % cluster;
            h = q - q % cluster;
        } else if block_size > q {
            h = q - q % cluster;
            w = block_size * block_size / h / cluster * cluster;
        } else {
            w = block_size;
            h = block_size;
        }
        w = w.min(block_size);
        h = h.min(block_size);

        let mut a = p / w;
        let mut b = q / h;
        let mut dw = p - w * a;
        let mut dh = q - h * b;
        if tall {
            std::mem::swap(&mut w, &mut h);
            std::mem::swap(&mut a, &mut b);
            std::mem::swap(&mut dw, &mut dh);
        }

        regions.push(TessellationRegion {
            box_width: w,
            box_height: h,
            cluster_size: cluster,
            rect: Rect::new(current.x, current.y, w * a, h * b),
        });

        // Remainder strips keep the current candidate; the bottom strip
        // spans the full width, the right strip stops above it.
        stack.push((
            Rect::new(current.x, current.y + current.height - dh, current.width, dh),
            index,
        ));
        stack.push((
            Rect::new(current.x + current.width - dw, current.y, dw, current.height - dh),
            index,
        ));
    }

    let covered: u64 = regions.iter().map(|region| region.rect.area()).sum();
    if covered != rect.area() {
        return Err(RenderError::DegenerateTessellation { block_size });
    }
    Ok(regions)
}

/// Index of the largest table candidate not exceeding `cluster_size`.
pub fn start_index(cluster_size_table: &[u32], cluster_size: u32) -> Option<usize> {
    cluster_size_table
        .iter()
        .rposition(|&candidate| candidate <= cluster_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cluster_size_table;

    fn assert_exact_partition(rect: Rect, regions: &[TessellationRegion]) {
        let mut hits = vec![0_u32; (rect.width * rect.height) as usize];
        for region in regions {
            for y in 0..region.rect.height {
                for x in 0..region.rect.width {
                    let gx = region.rect.x + x - rect.x;
                    let gy = region.rect.y + y - rect.y;
                    hits[(gy * rect.width + gx) as usize] += 1;
                }
            }
        }
        let multiply_covered = hits.iter().filter(|&&count| count > 1).count();
        let uncovered = hits.iter().filter(|&&count| count == 0).count();
        assert_eq!(multiply_covered, 0, "{multiply_covered} pixels covered twice");
        assert_eq!(uncovered, 0, "{uncovered} pixels uncovered");
    }

    fn plan_for(width: u32, height: u32, block_size: u32, cluster_size: u32) -> Vec<TessellationRegion> {
        let table = cluster_size_table(block_size);
        let start = start_index(&table, cluster_size);
        plan(Rect::new(0, 0, width, height), block_size, &table, start).unwrap()
    }

    #[test]
    fn plans_partition_exactly_across_shapes_and_clusters() {
        for (width, height, block_size, cluster_size) in [
            (100, 60, 16, 1),
            (100, 60, 16, 2),
            (60, 100, 16, 8),
            (1024, 1024, 256, 1),
            (333, 517, 64, 4),
            (97, 41, 32, 1),
            (256, 256, 256, 64),
            (640, 480, 128, 16),
        ] {
            let regions = plan_for(width, height, block_size, cluster_size);
            assert!(!regions.is_empty());
            assert_exact_partition(Rect::new(0, 0, width, height), &regions);
        }
    }

    #[test]
    fn region_parameters_respect_block_and_cluster_constraints() {
        let regions = plan_for(333, 517, 64, 4);
        for region in &regions {
            assert!(region.box_width <= 64 && region.box_height <= 64);
            assert_eq!(region.box_width % region.cluster_size, 0);
            assert_eq!(region.box_height % region.cluster_size, 0);
            assert_eq!(region.rect.width % region.box_width, 0);
            assert_eq!(region.rect.height % region.box_height, 0);
        }
    }

    #[test]
    fn region_areas_sum_to_rect_area() {
        let rect = Rect::new(0, 0, 640, 480);
        let table = cluster_size_table(128);
        let start = start_index(&table, 16);
        let regions = plan(rect, 128, &table, start).unwrap();
        let total: u64 = regions.iter().map(|region| region.rect.area()).sum();
        assert_eq!(total, rect.area());
    }

    #[test]
    fn nonzero_origin_offsets_every_region() {
        let rect = Rect::new(40, 8, 100, 60);
        let table = cluster_size_table(16);
        let regions = plan(rect, 16, &table, start_index(&table, 1)).unwrap();
        assert_exact_partition(rect, &regions);
        assert!(regions.iter().all(|region| region.rect.x >= 40 && region.rect.y >= 8));
    }

    #[test]
    fn prime_block_size_above_256_fails_deterministically() {
        let table = cluster_size_table(257);
        assert!(table.is_empty());
        let err = plan(
            Rect::new(0, 0, 300, 300),
            257,
            &table,
            start_index(&table, 1),
        )
        .unwrap_err();
        assert_eq!(err, RenderError::DegenerateTessellation { block_size: 257 });
    }

    #[test]
    fn odd_edge_with_no_unit_cluster_fails_instead_of_dropping_pixels() {
        // Block 512 only admits even clusters; a 1-pixel strip cannot tile.
        let table = cluster_size_table(512);
        let err = plan(
            Rect::new(0, 0, 513, 512),
            512,
            &table,
            start_index(&table, 2),
        )
        .unwrap_err();
        assert_eq!(err, RenderError::DegenerateTessellation { block_size: 512 });
    }

    #[test]
    fn empty_rect_plans_to_nothing() {
        let table = cluster_size_table(16);
        let regions = plan(Rect::new(0, 0, 0, 0), 16, &table, start_index(&table, 1)).unwrap();
        assert!(regions.is_empty());
    }
}

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex};
use std::thread;

use image::{Luma, Pixel, Primitive};
use imageproc::definitions::Image;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use rayon::prelude::*;

use crate::error::NnfError;
use crate::inpaint_kit::field::{allowed_centers, OffsetField, Point16};
use crate::inpaint_kit::unsync::UnsyncSlice;
use crate::utils::{
    mirror, validate_matching_dimensions, Rect, MASK_ALLOWED_THRESHOLD, PATCH_HALF, PATCH_SIDE,
};

/// Side length of the square tile each worker claims at once.
const SUPER_PATCH_SIDE: i32 = 64;

/// How far the masked-center repair looks before falling back to a uniform
/// draw from the allowed set.
const NUDGE_RADIUS: i32 = 8;

/// Randomized approximate nearest-neighbor field solver.
///
/// For every patch center of `target` the solver maintains a chosen patch
/// center in `source` together with its exact patch SSD, and improves the
/// field by alternating propagation and random-search scans in the
/// PatchMatch fashion. When a source mask is given, centers below the mask
/// threshold are never selected.
pub struct NearestNeighborField<'a, P: Pixel> {
    source: &'a Image<P>,
    source_mask: Option<&'a Image<Luma<u8>>>,
    target: &'a Image<P>,
    field: &'a mut OffsetField,
    cache: Vec<i64>,
    source_rect: Rect,
    target_rect: Rect,
    source_rect_1px: Rect,
    target_rect_1px: Rect,
    seed: u64,
}

impl<'a, P> NearestNeighborField<'a, P>
where
    P: Pixel,
    P::Subpixel: Primitive + Send + Sync,
    i64: From<P::Subpixel>,
{
    /// Wires the solver to its images and field.
    ///
    /// Entries are clamped into the source patch-center rect. Entries that
    /// point at masked centers (typical after lifting a field from a coarser
    /// level, where the mask was blurrier) are repaired here: first by a
    /// bounded search for the nearest allowed center, then by a uniform draw
    /// from the allowed set.
    ///
    /// # Errors
    ///
    /// * `NnfError::PatchDoesNotFit` - either image is smaller than a patch
    /// * `NnfError::MaskDimensionMismatch` - mask does not cover the source
    /// * `NnfError::FieldDimensionMismatch` - field does not cover the target
    /// * `NnfError::NoValidSource` - the mask forbids every source center
    pub fn new(
        source: &'a Image<P>,
        source_mask: Option<&'a Image<Luma<u8>>>,
        target: &'a Image<P>,
        field: &'a mut OffsetField,
        seed: u64,
    ) -> Result<Self, NnfError> {
        let (source_w, source_h) = source.dimensions();
        let (target_w, target_h) = target.dimensions();
        let source_rect = Rect::patch_centers(source_w, source_h);
        let target_rect = Rect::patch_centers(target_w, target_h);
        if source_rect.is_empty() {
            return Err(NnfError::PatchDoesNotFit {
                width: source_w,
                height: source_h,
                patch_side: PATCH_SIDE as u32,
            });
        }
        if target_rect.is_empty() {
            return Err(NnfError::PatchDoesNotFit {
                width: target_w,
                height: target_h,
                patch_side: PATCH_SIDE as u32,
            });
        }
        if let Some(mask) = source_mask {
            validate_matching_dimensions(
                source_w,
                source_h,
                mask.width(),
                mask.height(),
                "Nearest-neighbor field",
            )
            .map_err(|_| NnfError::MaskDimensionMismatch {
                expected: (source_w, source_h),
                actual: mask.dimensions(),
            })?;
        }
        validate_matching_dimensions(
            target_w,
            target_h,
            field.width(),
            field.height(),
            "Nearest-neighbor field",
        )
        .map_err(|_| NnfError::FieldDimensionMismatch {
            expected: (target_w, target_h),
            actual: (field.width(), field.height()),
        })?;

        field.clamp_to(source_rect);
        let mut nnf = Self {
            source,
            source_mask,
            target,
            field,
            cache: Vec::new(),
            source_rect,
            target_rect,
            source_rect_1px: source_rect.shrink(1),
            target_rect_1px: target_rect.shrink(1),
            seed,
        };
        nnf.sanitize_field()?;
        Ok(nnf)
    }

    /// Runs `iterations` alternating scans and returns the summed patch
    /// distance over the target rect (the direction's share of the
    /// bidirectional energy).
    ///
    /// Scan direction alternates with the iteration index: even iterations
    /// scan top-to-bottom / left-to-right and propagate from the left and
    /// upper neighbors, odd iterations do the reverse. `parallel` switches
    /// between the wavefront worker pool and a single-threaded pass over the
    /// same tiles; both orders produce identical fields for a fixed seed
    /// because every tile derives its own random stream.
    pub fn run(&mut self, iterations: u32, parallel: bool) -> f64 {
        self.prepare_cache(parallel);
        let grid = TileGrid::new(self.target_rect);
        let ctx = self.context();
        for iteration in 0..iterations {
            let pass = IterationPass {
                ctx,
                field: UnsyncSlice::new(self.field.data_mut()),
                cache: UnsyncSlice::new(&mut self.cache),
                grid: &grid,
                state: Mutex::new(QueueState::new(grid.len())),
                ready: Condvar::new(),
                iteration,
            };
            if parallel {
                pass.run_parallel();
            } else {
                pass.run_sequential();
            }
        }
        self.total_distance()
    }

    fn context(&self) -> PassContext<'a, P::Subpixel> {
        let (source_w, source_h) = self.source.dimensions();
        let (target_w, target_h) = self.target.dimensions();
        PassContext {
            source_px: self.source.as_raw(),
            target_px: self.target.as_raw(),
            source_mask: self.source_mask,
            channels: P::CHANNEL_COUNT as usize,
            source_w: source_w as usize,
            target_w: target_w as usize,
            source_max: (source_w as i32 - 1, source_h as i32 - 1),
            target_max: (target_w as i32 - 1, target_h as i32 - 1),
            source_rect: self.source_rect,
            target_rect: self.target_rect,
            source_rect_1px: self.source_rect_1px,
            target_rect_1px: self.target_rect_1px,
            search_radius: source_w.max(source_h) as f32,
            seed: self.seed,
        }
    }

    /// Recomputes the exact distance for every field entry.
    fn prepare_cache(&mut self, parallel: bool) {
        let ctx = self.context();
        let field: &OffsetField = self.field;
        let rect = self.target_rect;
        let width = ctx.target_w;
        let height = self.target.height() as usize;
        self.cache.clear();
        self.cache.resize(width * height, i64::MAX);

        let fill_row = |y: usize, row: &mut [i64]| {
            let row_y = y as i32;
            if row_y < rect.top || row_y >= rect.bottom {
                return;
            }
            for x in rect.left..rect.right {
                let p = field.get(x as u32, row_y as u32);
                row[x as usize] = ctx.patch_distance(
                    (x, row_y),
                    (i32::from(p.x), i32::from(p.y)),
                    i64::MAX,
                );
            }
        };

        if parallel {
            self.cache
                .par_chunks_mut(width)
                .enumerate()
                .for_each(|(y, row)| fill_row(y, row));
        } else {
            for (y, row) in self.cache.chunks_mut(width).enumerate() {
                fill_row(y, row);
            }
        }
    }

    /// Moves field entries off masked centers.
    fn sanitize_field(&mut self) -> Result<(), NnfError> {
        let Some(mask) = self.source_mask else {
            return Ok(());
        };
        let mut fallback: Option<(Vec<Point16>, Pcg32)> = None;
        for y in self.target_rect.top..self.target_rect.bottom {
            for x in self.target_rect.left..self.target_rect.right {
                let p = self.field.get(x as u32, y as u32);
                if mask.get_pixel(p.x as u32, p.y as u32).0[0] >= MASK_ALLOWED_THRESHOLD {
                    continue;
                }
                let repaired = match nudge_to_allowed(mask, self.source_rect, p) {
                    Some(center) => center,
                    None => {
                        let (centers, rng) = fallback.get_or_insert_with(|| {
                            (
                                allowed_centers(mask, self.source_rect),
                                Pcg32::seed_from_u64(self.seed ^ 0x5EED_FA11_BAC4),
                            )
                        });
                        if centers.is_empty() {
                            return Err(NnfError::NoValidSource);
                        }
                        centers[rng.gen_range(0..centers.len())]
                    }
                };
                self.field.set(x as u32, y as u32, repaired);
            }
        }
        Ok(())
    }

    fn total_distance(&self) -> f64 {
        let width = self.target.width() as usize;
        let mut sum = 0.0;
        for y in self.target_rect.top..self.target_rect.bottom {
            let row = &self.cache[y as usize * width..(y as usize + 1) * width];
            for x in self.target_rect.left..self.target_rect.right {
                sum += row[x as usize] as f64;
            }
        }
        sum
    }
}

/// Searches outward rings for the closest allowed center.
fn nudge_to_allowed(mask: &Image<Luma<u8>>, rect: Rect, from: Point16) -> Option<Point16> {
    let (fx, fy) = (i32::from(from.x), i32::from(from.y));
    for radius in 1..=NUDGE_RADIUS {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx.abs().max(dy.abs()) != radius {
                    continue;
                }
                let (x, y) = (fx + dx, fy + dy);
                if rect.contains(x, y)
                    && mask.get_pixel(x as u32, y as u32).0[0] >= MASK_ALLOWED_THRESHOLD
                {
                    return Some(Point16::new(x as i16, y as i16));
                }
            }
        }
    }
    None
}

/// Read-only data shared by every worker of a pass.
#[derive(Clone, Copy)]
struct PassContext<'a, S> {
    source_px: &'a [S],
    target_px: &'a [S],
    source_mask: Option<&'a Image<Luma<u8>>>,
    channels: usize,
    source_w: usize,
    target_w: usize,
    source_max: (i32, i32),
    target_max: (i32, i32),
    source_rect: Rect,
    target_rect: Rect,
    source_rect_1px: Rect,
    target_rect_1px: Rect,
    search_radius: f32,
    seed: u64,
}

impl<'a, S> PassContext<'a, S>
where
    S: Primitive,
    i64: From<S>,
{
    #[inline]
    fn is_allowed(&self, x: i32, y: i32) -> bool {
        self.source_mask
            .map_or(true, |mask| {
                mask.get_pixel(x as u32, y as u32).0[0] >= MASK_ALLOWED_THRESHOLD
            })
    }

    /// Squared distance between one target and one source pixel.
    ///
    /// The mirror-enabled instantiations reflect coordinates that stepped
    /// one pixel outside the image; the both-false instantiation is the hot
    /// path and performs no bounds handling at all.
    #[inline]
    fn pixel_distance<const SOURCE_MIRROR: bool, const TARGET_MIRROR: bool>(
        &self,
        tx: i32,
        ty: i32,
        sx: i32,
        sy: i32,
    ) -> i64 {
        let (tx, ty) = if TARGET_MIRROR {
            (mirror(tx, self.target_max.0), mirror(ty, self.target_max.1))
        } else {
            (tx, ty)
        };
        let (sx, sy) = if SOURCE_MIRROR {
            (mirror(sx, self.source_max.0), mirror(sy, self.source_max.1))
        } else {
            (sx, sy)
        };
        let t_base = (ty as usize * self.target_w + tx as usize) * self.channels;
        let s_base = (sy as usize * self.source_w + sx as usize) * self.channels;
        // SAFETY: the coordinates are either mirrored into range above or
        // guaranteed in range by the caller's rect preconditions.
        let (t, s) = unsafe {
            (
                self.target_px.get_unchecked(t_base..t_base + self.channels),
                self.source_px.get_unchecked(s_base..s_base + self.channels),
            )
        };
        let mut sum = 0i64;
        for (&a, &b) in t.iter().zip(s) {
            let d = i64::from(a) - i64::from(b);
            sum += d * d;
        }
        sum
    }

    /// Full patch SSD with early termination against `known`.
    ///
    /// Both centers must lie in their patch-center rects, so no mirroring is
    /// needed. The partial sum is checked once per patch row.
    fn patch_distance(&self, target: (i32, i32), source: (i32, i32), known: i64) -> i64 {
        let mut sum = 0i64;
        for dy in -PATCH_HALF..=PATCH_HALF {
            for dx in -PATCH_HALF..=PATCH_HALF {
                sum += self.pixel_distance::<false, false>(
                    target.0 + dx,
                    target.1 + dy,
                    source.0 + dx,
                    source.1 + dy,
                );
            }
            if sum >= known {
                return sum;
            }
        }
        sum
    }

    /// Distance of the neighbor's patch pair after sliding both windows one
    /// column in `step` direction: subtract the column that leaves, add the
    /// one that enters.
    fn move_distance_dx(
        &self,
        target: (i32, i32),
        source: (i32, i32),
        distance: i64,
        step: i32,
    ) -> i64 {
        let source_mirror = !self.source_rect_1px.contains(source.0, source.1);
        let target_mirror = !self.target_rect_1px.contains(target.0, target.1);
        match (source_mirror, target_mirror) {
            (false, false) => self.move_distance_dx_impl::<false, false>(target, source, distance, step),
            (false, true) => self.move_distance_dx_impl::<false, true>(target, source, distance, step),
            (true, false) => self.move_distance_dx_impl::<true, false>(target, source, distance, step),
            (true, true) => self.move_distance_dx_impl::<true, true>(target, source, distance, step),
        }
    }

    fn move_distance_dx_impl<const SOURCE_MIRROR: bool, const TARGET_MIRROR: bool>(
        &self,
        (tx, ty): (i32, i32),
        (sx, sy): (i32, i32),
        mut distance: i64,
        step: i32,
    ) -> i64 {
        let leave_tx = tx - step * PATCH_HALF;
        let leave_sx = sx - step * PATCH_HALF;
        let enter_tx = tx + step * (PATCH_HALF + 1);
        let enter_sx = sx + step * (PATCH_HALF + 1);
        for dy in -PATCH_HALF..=PATCH_HALF {
            distance -= self.pixel_distance::<SOURCE_MIRROR, TARGET_MIRROR>(
                leave_tx,
                ty + dy,
                leave_sx,
                sy + dy,
            );
            distance += self.pixel_distance::<SOURCE_MIRROR, TARGET_MIRROR>(
                enter_tx,
                ty + dy,
                enter_sx,
                sy + dy,
            );
        }
        distance
    }

    /// Row counterpart of [`Self::move_distance_dx`].
    fn move_distance_dy(
        &self,
        target: (i32, i32),
        source: (i32, i32),
        distance: i64,
        step: i32,
    ) -> i64 {
        let source_mirror = !self.source_rect_1px.contains(source.0, source.1);
        let target_mirror = !self.target_rect_1px.contains(target.0, target.1);
        match (source_mirror, target_mirror) {
            (false, false) => self.move_distance_dy_impl::<false, false>(target, source, distance, step),
            (false, true) => self.move_distance_dy_impl::<false, true>(target, source, distance, step),
            (true, false) => self.move_distance_dy_impl::<true, false>(target, source, distance, step),
            (true, true) => self.move_distance_dy_impl::<true, true>(target, source, distance, step),
        }
    }

    fn move_distance_dy_impl<const SOURCE_MIRROR: bool, const TARGET_MIRROR: bool>(
        &self,
        (tx, ty): (i32, i32),
        (sx, sy): (i32, i32),
        mut distance: i64,
        step: i32,
    ) -> i64 {
        let leave_ty = ty - step * PATCH_HALF;
        let leave_sy = sy - step * PATCH_HALF;
        let enter_ty = ty + step * (PATCH_HALF + 1);
        let enter_sy = sy + step * (PATCH_HALF + 1);
        for dx in -PATCH_HALF..=PATCH_HALF {
            distance -= self.pixel_distance::<SOURCE_MIRROR, TARGET_MIRROR>(
                tx + dx,
                leave_ty,
                sx + dx,
                leave_sy,
            );
            distance += self.pixel_distance::<SOURCE_MIRROR, TARGET_MIRROR>(
                tx + dx,
                enter_ty,
                sx + dx,
                enter_sy,
            );
        }
        distance
    }
}

/// Tile of the target patch-center rect; the unit of parallel work.
#[derive(Debug, Clone, Copy)]
struct Tile {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

struct TileGrid {
    tiles: Vec<Tile>,
    tiles_x: usize,
}

impl TileGrid {
    fn new(rect: Rect) -> Self {
        let tiles_x = ((rect.width() + SUPER_PATCH_SIDE - 1) / SUPER_PATCH_SIDE).max(1) as usize;
        let tiles_y = ((rect.height() + SUPER_PATCH_SIDE - 1) / SUPER_PATCH_SIDE).max(1) as usize;
        let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let left = rect.left + tx as i32 * SUPER_PATCH_SIDE;
                let top = rect.top + ty as i32 * SUPER_PATCH_SIDE;
                tiles.push(Tile {
                    left,
                    top,
                    right: (left + SUPER_PATCH_SIDE).min(rect.right),
                    bottom: (top + SUPER_PATCH_SIDE).min(rect.bottom),
                });
            }
        }
        Self { tiles, tiles_x }
    }

    fn len(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    fn tile(&self, index: usize) -> Tile {
        self.tiles[index]
    }

    fn left_of(&self, index: usize) -> Option<usize> {
        (index % self.tiles_x > 0).then(|| index - 1)
    }

    fn right_of(&self, index: usize) -> Option<usize> {
        (index % self.tiles_x + 1 < self.tiles_x).then(|| index + 1)
    }

    fn above(&self, index: usize) -> Option<usize> {
        (index >= self.tiles_x).then(|| index - self.tiles_x)
    }

    fn below(&self, index: usize) -> Option<usize> {
        (index + self.tiles_x < self.tiles.len()).then(|| index + self.tiles_x)
    }
}

struct QueueState {
    queue: VecDeque<usize>,
    added: Vec<bool>,
    processed: Vec<bool>,
    remaining: usize,
}

impl QueueState {
    fn new(tiles: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            added: vec![false; tiles],
            processed: vec![false; tiles],
            remaining: tiles,
        }
    }
}

/// One scan over the target rect, tiled into a diagonal wavefront.
///
/// A tile becomes eligible once its in-direction neighbors are processed, so
/// every propagation read of a neighboring tile sees finalized values. The
/// queue mutex also publishes those writes to the popping worker.
struct IterationPass<'a, S> {
    ctx: PassContext<'a, S>,
    field: UnsyncSlice<'a, Point16>,
    cache: UnsyncSlice<'a, i64>,
    grid: &'a TileGrid,
    state: Mutex<QueueState>,
    ready: Condvar,
    iteration: u32,
}

impl<'a, S> IterationPass<'a, S>
where
    S: Primitive + Send + Sync,
    i64: From<S>,
{
    #[inline]
    fn direction(&self) -> i32 {
        if self.iteration % 2 == 0 {
            1
        } else {
            -1
        }
    }

    fn run_parallel(&self) {
        let workers = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .min(self.grid.len());
        if workers <= 1 {
            self.run_sequential();
            return;
        }

        {
            let seed_tile = if self.direction() > 0 {
                0
            } else {
                self.grid.len() - 1
            };
            let mut state = self.state.lock().unwrap();
            state.added[seed_tile] = true;
            state.queue.push_back(seed_tile);
        }

        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| self.work());
            }
        })
        .unwrap();
    }

    /// Same per-tile code as the workers, in a fixed wavefront-compatible
    /// order on the calling thread.
    fn run_sequential(&self) {
        if self.direction() > 0 {
            for index in 0..self.grid.len() {
                self.process_tile(index);
            }
        } else {
            for index in (0..self.grid.len()).rev() {
                self.process_tile(index);
            }
        }
    }

    fn work(&self) {
        while let Some(index) = self.pop() {
            self.process_tile(index);
            self.complete(index);
        }
    }

    fn pop(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(index) = state.queue.pop_front() {
                return Some(index);
            }
            if state.remaining == 0 {
                return None;
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    fn complete(&self, index: usize) {
        let direction = self.direction();
        let mut state = self.state.lock().unwrap();
        state.processed[index] = true;
        state.remaining -= 1;
        if state.remaining == 0 {
            self.ready.notify_all();
            return;
        }

        let downstream = if direction > 0 {
            [self.grid.right_of(index), self.grid.below(index)]
        } else {
            [self.grid.left_of(index), self.grid.above(index)]
        };
        for next in downstream.into_iter().flatten() {
            if state.added[next] {
                continue;
            }
            let upstream = if direction > 0 {
                [self.grid.left_of(next), self.grid.above(next)]
            } else {
                [self.grid.right_of(next), self.grid.below(next)]
            };
            if upstream
                .into_iter()
                .flatten()
                .all(|dep| state.processed[dep])
            {
                state.added[next] = true;
                state.queue.push_back(next);
                self.ready.notify_one();
            }
        }
    }

    fn process_tile(&self, index: usize) {
        let tile = self.grid.tile(index);
        let mut rng = Pcg32::seed_from_u64(self.tile_seed(index));
        if self.direction() > 0 {
            for y in tile.top..tile.bottom {
                for x in tile.left..tile.right {
                    self.propagate(x, y, 1);
                    self.random_search(x, y, &mut rng);
                }
            }
        } else {
            for y in (tile.top..tile.bottom).rev() {
                for x in (tile.left..tile.right).rev() {
                    self.propagate(x, y, -1);
                    self.random_search(x, y, &mut rng);
                }
            }
        }
    }

    /// Tile-local random stream, independent of worker scheduling.
    fn tile_seed(&self, index: usize) -> u64 {
        self.ctx
            .seed
            .wrapping_add(u64::from(self.iteration).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add((index as u64).wrapping_mul(0xD1B5_4A32_D192_ED03))
    }

    #[inline]
    fn cell(&self, x: i32, y: i32) -> usize {
        y as usize * self.ctx.target_w + x as usize
    }

    #[inline]
    fn offset_at(&self, x: i32, y: i32) -> Point16 {
        // SAFETY: (x, y) is a valid target pixel; cells of other tiles are
        // only read after their tile completed (wavefront order).
        unsafe { self.field.get(self.cell(x, y)) }
    }

    #[inline]
    fn distance_at(&self, x: i32, y: i32) -> i64 {
        // SAFETY: as in `offset_at`.
        unsafe { self.cache.get(self.cell(x, y)) }
    }

    #[inline]
    fn commit(&self, x: i32, y: i32, offset: Point16, distance: i64) {
        let cell = self.cell(x, y);
        // SAFETY: (x, y) belongs to the tile being processed, which owns
        // these cells exclusively until it is marked processed.
        unsafe {
            self.field.set(cell, offset);
            self.cache.set(cell, distance);
        }
    }

    /// Tries the in-direction neighbors' matches shifted by one pixel.
    fn propagate(&self, x: i32, y: i32, direction: i32) {
        let ctx = &self.ctx;

        let nx = x - direction;
        if ctx.target_rect.contains(nx, y) {
            let neighbor = self.offset_at(nx, y);
            let (snx, sny) = (i32::from(neighbor.x), i32::from(neighbor.y));
            let moved =
                ctx.move_distance_dx((nx, y), (snx, sny), self.distance_at(nx, y), direction);
            let (cx, cy) = (snx + direction, sny);
            if moved < self.distance_at(x, y)
                && ctx.source_rect.contains(cx, cy)
                && ctx.is_allowed(cx, cy)
            {
                self.commit(x, y, Point16::new(cx as i16, cy as i16), moved);
            }
        }

        let ny = y - direction;
        if ctx.target_rect.contains(x, ny) {
            let neighbor = self.offset_at(x, ny);
            let (snx, sny) = (i32::from(neighbor.x), i32::from(neighbor.y));
            let moved =
                ctx.move_distance_dy((x, ny), (snx, sny), self.distance_at(x, ny), direction);
            let (cx, cy) = (snx, sny + direction);
            if moved < self.distance_at(x, y)
                && ctx.source_rect.contains(cx, cy)
                && ctx.is_allowed(cx, cy)
            {
                self.commit(x, y, Point16::new(cx as i16, cy as i16), moved);
            }
        }
    }

    /// Samples candidates around the current best at geometrically
    /// decreasing radii, keeping strictly better matches.
    fn random_search(&self, x: i32, y: i32, rng: &mut Pcg32) {
        let ctx = &self.ctx;
        let mut best = self.offset_at(x, y);
        let mut best_distance = self.distance_at(x, y);
        let mut improved = false;

        let mut radius = ctx.search_radius;
        while radius >= 1.0 {
            let dx = (radius * rng.gen_range(-1.0f32..=1.0)).round() as i32;
            let dy = (radius * rng.gen_range(-1.0f32..=1.0)).round() as i32;
            radius *= 0.5;
            if dx == 0 && dy == 0 {
                continue;
            }
            let sx = i32::from(best.x) + dx;
            let sy = i32::from(best.y) + dy;
            if !ctx.source_rect.contains(sx, sy) || !ctx.is_allowed(sx, sy) {
                continue;
            }
            let distance = ctx.patch_distance((x, y), (sx, sy), best_distance);
            if distance < best_distance {
                best = Point16::new(sx as i16, sy as i16);
                best_distance = distance;
                improved = true;
            }
        }

        if improved {
            self.commit(x, y, best, best_distance);
        }
    }
}

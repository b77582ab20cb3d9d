use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, UnixMillis};
use crate::coords::Coords;
use crate::error::BlockError;
use crate::pixel::{Color, Pixel};

/// Blocks are 64x64 pixel grids.
pub const BLOCK_DIM: usize = 64;
pub const BLOCK_PIXELS: usize = BLOCK_DIM * BLOCK_DIM;

/// Deepest addressable coordinate. 64 levels of 2-bit descent span a
/// 2^64 x 2^64 pixel plane at full zoom, well past any useful client depth.
pub const MAX_BIT_LENGTH: usize = 64;

/// Full inherited alpha: the pixel is completely covered by its children.
const FULL_ALPHA: u16 = 15;

/// Seconds until painted pixels dry, indexed by coordinate bit length and
/// clamped at the last row. Deeper pixels get longer to dry.
#[derive(Debug, Clone)]
pub struct DryTimeTable(Vec<u32>);

impl DryTimeTable {
    /// The rows must be non-decreasing; shallow tiles never outlast deep ones.
    pub fn new(seconds: Vec<u32>) -> Result<Self, BlockError> {
        if seconds.is_empty() {
            return Err(BlockError::bad("dry time table must not be empty"));
        }
        if seconds.windows(2).any(|w| w[0] > w[1]) {
            return Err(BlockError::bad("dry time table must be non-decreasing"));
        }
        Ok(DryTimeTable(seconds))
    }

    pub fn interval_ms(&self, bit_length: usize) -> i64 {
        let row = bit_length.min(self.0.len() - 1);
        i64::from(self.0[row]) * 1000
    }
}

impl Default for DryTimeTable {
    fn default() -> Self {
        DryTimeTable(vec![0, 15, 30, 60, 150, 300, 600])
    }
}

/// A 64x64 tile of pixels plus its drying deadline.
struct Block {
    pixels: Vec<Pixel>,
    /// When the block's wet pixels become immutable. Zero means nothing is
    /// pending.
    dry_time: UnixMillis,
    last_updated: UnixMillis,
}

impl Block {
    fn new() -> Self {
        Block {
            pixels: vec![Pixel::default(); BLOCK_PIXELS],
            dry_time: 0,
            last_updated: 0,
        }
    }

    /// Lazy drying: once the deadline passes, every painted pixel becomes
    /// immutable and the deadline is cleared.
    fn dry(&mut self, now: UnixMillis) {
        if self.dry_time > 0 && now >= self.dry_time {
            self.dry_time = 0;
            for p in &mut self.pixels {
                if p.0 & Pixel::PAINTED != 0 {
                    p.0 |= Pixel::DRY;
                }
            }
            self.last_updated = now;
        }
    }
}

/// A read snapshot of one block.
#[derive(Debug)]
pub struct BlockSnapshot {
    pub pixels: Vec<Pixel>,
    pub last_updated: UnixMillis,
}

/// Storage-agnostic interface to the block tree.
pub trait BlockRepo: Send + Sync {
    /// Fetch a block, drying expired pixels first. `NotFound` if the block
    /// has never been materialized.
    fn get_block(&self, coords: &Coords) -> Result<BlockSnapshot, BlockError>;

    /// Paint one pixel and propagate its color into every ancestor.
    fn set_pixel(&self, coords: &Coords, color: Color) -> Result<(), BlockError>;

    /// Optional periodic pass drying every expired block. Lazy drying on
    /// access already keeps results correct without it.
    fn sweep_dry(&self) {}
}

struct RepoState {
    blocks: HashMap<Vec<u8>, Block>,
}

impl RepoState {
    // Exclusive access to the state is witnessed by &mut self here; these
    // helpers can only run while the repository mutex is held.
    fn get_or_create(&mut self, coords: &Coords) -> &mut Block {
        self.blocks.entry(coords.to_bytes()).or_insert_with(Block::new)
    }
}

/// The in-memory block repository. Contents are not persisted.
///
/// A single mutex guards the whole tree for the full duration of each
/// operation, including the bubble-up walk, so every read inside one call
/// observes a consistent snapshot.
pub struct MemBlockRepo {
    clock: Arc<dyn Clock>,
    dry_times: DryTimeTable,
    state: Mutex<RepoState>,
}

impl MemBlockRepo {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_dry_times(clock, DryTimeTable::default())
    }

    pub fn with_dry_times(clock: Arc<dyn Clock>, dry_times: DryTimeTable) -> Self {
        tracing::info!("using in-memory block store; contents are not persisted");
        MemBlockRepo {
            clock,
            dry_times,
            state: Mutex::new(RepoState {
                blocks: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().expect("block store mutex poisoned")
    }

    /// Propagate the pixel at `coords` into its ancestors.
    ///
    /// At each level the 2x2 sibling group is blended: painted pixels weigh
    /// in at full opacity with their own inherited value layered on top,
    /// inherited-only pixels weigh in at their alpha, and untouched pixels
    /// drag the average toward transparent. The walk stops when the blended
    /// alpha reaches zero or an ancestor already holds the computed value.
    fn bubble_color(state: &mut RepoState, coords: &Coords, now: UnixMillis) {
        let mut coords = coords.clone();

        while coords.bit_length() > 6 {
            let block = state.get_or_create(&coords.parent_of_pixel());
            let base = coords.pixel_index() & 0o7676;

            let mut sum_r = 0i32;
            let mut sum_g = 0i32;
            let mut sum_b = 0i32;
            let mut sum_a = 0i32;

            for dy in 0..2 {
                for dx in 0..2 {
                    let pixel = block.pixels[base + dy * BLOCK_DIM + dx];
                    if pixel.is_painted() {
                        let painted = i32::from(pixel.painted().0);
                        let inherited = i32::from(pixel.inherited());
                        let alpha2 = inherited >> 12;
                        let alpha1 = 15 - alpha2;

                        sum_a += 15;
                        sum_r += (painted & 0xF) * alpha1 + (inherited & 0xF) * alpha2;
                        sum_g += ((painted >> 4) & 0xF) * alpha1 + ((inherited >> 4) & 0xF) * alpha2;
                        sum_b += ((painted >> 8) & 0xF) * alpha1 + ((inherited >> 8) & 0xF) * alpha2;
                    } else {
                        let inherited = i32::from(pixel.inherited());
                        let alpha = inherited >> 12;
                        if alpha == 0 {
                            // Nothing inherited. A transparent spot that
                            // lowers the blended alpha.
                            continue;
                        }
                        sum_a += alpha;
                        sum_r += (inherited & 0xF) * alpha;
                        sum_g += ((inherited >> 4) & 0xF) * alpha;
                        sum_b += ((inherited >> 8) & 0xF) * alpha;
                    }
                }
            }

            if sum_a == 0 {
                return;
            }

            let r = (sum_r + sum_a / 2) / sum_a;
            let g = (sum_g + sum_a / 2) / sum_a;
            let b = (sum_b + sum_a / 2) / sum_a;
            let a = sum_a / 4;
            if a == 0 {
                return; // Fully transparent, nothing more to bubble.
            }

            let computed = (r | (g << 4) | (b << 8) | (a << 12)) as u32;

            coords = coords.up(1);
            let index = coords.pixel_index();
            let parent = state.get_or_create(&coords.parent_of_pixel());

            let current = parent.pixels[index].0;
            if current & 0xFFFF == computed {
                return; // No change, the bubble has settled.
            }
            parent.pixels[index] = Pixel((current & 0xFFFF_0000) | computed);
            parent.last_updated = now;
        }
    }
}

impl BlockRepo for MemBlockRepo {
    fn get_block(&self, coords: &Coords) -> Result<BlockSnapshot, BlockError> {
        let mut state = self.lock();
        let now = self.clock.now();

        let block = state
            .blocks
            .get_mut(&coords.to_bytes())
            .ok_or(BlockError::NotFound)?;
        block.dry(now);

        Ok(BlockSnapshot {
            pixels: block.pixels.clone(),
            last_updated: block.last_updated,
        })
    }

    fn set_pixel(&self, coords: &Coords, color: Color) -> Result<(), BlockError> {
        if coords.bit_length() < 6 {
            return Err(BlockError::bad(
                "coordinates are too shallow to address a pixel",
            ));
        }
        if coords.bit_length() > MAX_BIT_LENGTH {
            return Err(BlockError::MaxDepthExceeded);
        }

        let mut state = self.lock();
        let now = self.clock.now();

        let dry_deadline = now + self.dry_times.interval_ms(coords.bit_length());
        let block = state.get_or_create(&coords.parent_of_pixel());
        block.dry(now);

        let index = coords.pixel_index();
        let pixel = block.pixels[index];
        // A pixel fully covered by its children is as immutable as a timed-out
        // one: repainting it could never show through.
        if pixel.is_dry() || pixel.inherited_alpha() == FULL_ALPHA {
            return Err(BlockError::PixelDry);
        }

        // Replace the painted color, leaving the inherited half intact.
        let word = pixel.0 & !(0x0FFF_0000 | Pixel::PAINTED);
        block.pixels[index] = Pixel(word | (u32::from(color.0) << 16) | Pixel::PAINTED);
        block.dry_time = dry_deadline;
        block.last_updated = now;

        Self::bubble_color(&mut state, coords, now);
        Ok(())
    }

    fn sweep_dry(&self) {
        let mut state = self.lock();
        let now = self.clock.now();

        tracing::debug!("drying expired blocks");
        for block in state.blocks.values_mut() {
            block.dry(now);
        }
    }
}

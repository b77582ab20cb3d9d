pub mod clock;
pub mod coords;
pub mod error;
pub mod pixel;
pub mod repo;

pub use clock::{Clock, SystemClock, TestClock, UnixMillis};
pub use coords::Coords;
pub use error::BlockError;
pub use pixel::{encode_pixels, Color, Pixel};
pub use repo::{
    BlockRepo, BlockSnapshot, DryTimeTable, MemBlockRepo, BLOCK_DIM, BLOCK_PIXELS, MAX_BIT_LENGTH,
};

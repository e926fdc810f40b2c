pub mod normalize;
pub mod source;

pub use normalize::{NormalizePolicy, NormalizedImage, normalize};
pub use source::{SourceImage, load_first};
